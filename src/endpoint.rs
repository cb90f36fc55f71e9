//! Endpoint naming
//!
//! Endpoints are URI-like strings such as `ipc:///tmp/shmbus_example` or
//! plain topic names. The scheme selects the transport family; only the
//! local shared-memory `ipc://` family is in scope, so anything else is
//! rejected. The remainder is normalized into a name that is safe to use
//! as a POSIX shared-memory object name.

use crate::error::{IpcError, Result};

/// Scheme prefix for local shared-memory endpoints
pub const IPC_SCHEME: &str = "ipc://";

/// Address accepted by subscriber connects; other addresses are reserved
/// for non-local transports and rejected here.
pub const LOCAL_ADDRESS: &str = "127.0.0.1";

/// Normalize an endpoint string into a shared-segment name.
///
/// `ipc:///tmp/shmbus_example` and the plain form `shmbus_example` are both
/// accepted. Distinct paths map to distinct names: every byte outside
/// `[A-Za-z0-9._-]` is replaced with `_` rather than stripped.
pub fn segment_name(endpoint: &str) -> Result<String> {
    let path = if let Some(rest) = endpoint.strip_prefix(IPC_SCHEME) {
        rest
    } else if endpoint.contains("://") {
        return Err(IpcError::UnsupportedScheme {
            endpoint: endpoint.to_string(),
        });
    } else {
        endpoint
    };

    if path.is_empty() {
        return Err(IpcError::EmptyEndpoint);
    }

    Ok(path
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect())
}

/// Validate a subscriber's `address` argument.
pub fn check_address(address: &str) -> Result<()> {
    if address != LOCAL_ADDRESS {
        return Err(IpcError::UnsupportedAddress {
            address: address.to_string(),
        });
    }
    Ok(())
}
