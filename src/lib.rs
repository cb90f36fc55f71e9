//! shmbus - Shared-memory publish/subscribe IPC
//!
//! A brokerless transport for local, high-rate telemetry streams. Each
//! endpoint is one shared-memory ring buffer with a single publisher and
//! up to [`MAX_SUBSCRIBERS`] subscribers; the publisher never blocks on
//! readers, and a subscriber that falls behind loses the oldest messages
//! rather than stalling the stream.
//!
//! # Architecture
//!
//! - **Channel**: `repr(C)` header plus byte ring in POSIX shared memory,
//!   holding a bounded history of framed messages
//! - **Sockets**: [`PubSocket`] holds the endpoint's single writer lock;
//!   [`SubSocket`] reads through a private cursor in strict or conflate
//!   mode
//! - **Readiness**: per-subscriber wakeup sockets addressed by name,
//!   multiplexed by [`Poller`] via `poll(2)`
//! - **Fake events**: a deterministic in-process harness
//!   ([`toggle_fake_events`]) that replaces shared memory and wakeup
//!   sockets with heap rings and addressable flags for tests
//!
//! # Example
//!
//! ```no_run
//! use shmbus::{pub_sock, sub_sock};
//!
//! # fn main() -> shmbus::Result<()> {
//! let publisher = pub_sock("ipc:///tmp/telemetry")?;
//! let mut subscriber = sub_sock("ipc:///tmp/telemetry", None, "127.0.0.1", false, None)?;
//!
//! publisher.send(b"reading 42")?;
//! let msg = subscriber.receive(false)?;
//! assert_eq!(msg.as_deref(), Some(&b"reading 42"[..]));
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod poller;
pub mod shm;
pub mod socket;

pub use channel::{Channel, Cursor, DEFAULT_SEGMENT_SIZE, MAX_SUBSCRIBERS};
pub use context::{context, Context};
pub use error::{IpcError, Result};
pub use event::{
    delete_fake_prefix, fake_event_handle, get_fake_prefix, set_fake_prefix, toggle_fake_events,
    SocketEventHandle,
};
pub use poller::{wait_for_one_event, Poller};
pub use socket::{drain_sock_raw, pub_sock, sub_sock, PubSocket, ReadMode, SocketId, SubSocket};
