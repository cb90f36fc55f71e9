//! Error types for shmbus

use std::io;
use thiserror::Error;

/// Result type for shmbus operations
pub type Result<T> = std::result::Result<T, IpcError>;

/// Errors that can occur in shmbus operations
///
/// `MultiplePublishers` is the contention error of the single-writer
/// invariant; every other variant belongs to the transport family.
/// Absence of a message (timeout, empty channel) is never an error.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A second publisher tried to attach to an occupied endpoint
    #[error("endpoint '{endpoint}' already has a live publisher (pid {holder})")]
    MultiplePublishers { endpoint: String, holder: u32 },

    /// Failed to open shared memory
    #[error("failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to size shared memory
    #[error("failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to allocate a private (heap-backed) segment
    #[error("failed to allocate {size} byte private segment")]
    Alloc { size: usize },

    /// Attached to a segment that is not a shmbus channel
    #[error("invalid channel magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Attached to a channel written by an incompatible version
    #[error("channel layout version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },

    /// Message does not fit in the channel's ring
    #[error("message of {got} bytes does not fit in a {capacity} byte channel")]
    MessageTooLarge { capacity: usize, got: usize },

    /// All reader slots of the channel are taken
    #[error("channel already has the maximum of {max} subscribers")]
    TooManySubscribers { max: usize },

    /// Endpoint name exceeds the shared-memory name limit
    #[error("endpoint name too long: max {max} chars, got {got}")]
    EndpointTooLong { max: usize, got: usize },

    /// Endpoint names a transport family other than local shared memory
    #[error("unsupported endpoint scheme in '{endpoint}': only ipc:// is supported")]
    UnsupportedScheme { endpoint: String },

    /// Endpoint string carries no name
    #[error("empty endpoint name")]
    EmptyEndpoint,

    /// Subscriber address other than the local placeholder
    #[error("unsupported address '{address}': only 127.0.0.1 is supported")]
    UnsupportedAddress { address: String },

    /// Readiness primitive failure (wakeup socket / poll)
    #[error("event operation failed: {0}")]
    Event(#[source] io::Error),
}
