//! Process-wide channel registry
//!
//! All sockets in a process attach to channels through one [`Context`],
//! so a publisher and subscribers on the same endpoint share a single
//! mapping. The registry holds weak references only: a channel's memory
//! is released (and, for the creating process, unlinked) once the last
//! socket using it drops.
//!
//! Fake-mode channels are registered under their fake prefix, which is
//! also what lets a heap-backed channel be reached from both ends of an
//! in-process test.

use crate::channel::Channel;
use crate::error::Result;
use crate::event::get_fake_prefix;
use crate::shm::Backing;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::trace;

/// Registry of live channels in this process
pub struct Context {
    channels: Mutex<HashMap<String, Weak<Channel>>>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Attach to (or create) the channel for `name`, reusing a live
    /// in-process mapping when one exists.
    pub(crate) fn attach(
        &self,
        endpoint: &str,
        name: &str,
        capacity: usize,
        backing: Backing,
    ) -> Result<Arc<Channel>> {
        let key = match backing {
            Backing::Shared => format!("shm:{name}"),
            Backing::Private => format!("fake:{}:{name}", get_fake_prefix()),
        };

        let mut channels = self.channels.lock().unwrap();
        channels.retain(|_, weak| weak.strong_count() > 0);

        if let Some(channel) = channels.get(&key).and_then(Weak::upgrade) {
            trace!(endpoint, %key, "reusing in-process channel mapping");
            return Ok(channel);
        }

        let channel = Arc::new(Channel::open(endpoint, name, capacity, backing)?);
        channels.insert(key, Arc::downgrade(&channel));
        Ok(channel)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide default context
pub fn context() -> &'static Context {
    static CONTEXT: OnceLock<Context> = OnceLock::new();
    CONTEXT.get_or_init(Context::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_shares_mapping() {
        let ctx = Context::new();
        let a = ctx
            .attach("ctx_test_share", "ctx_test_share", 1024, Backing::Private)
            .unwrap();
        let b = ctx
            .attach("ctx_test_share", "ctx_test_share", 1024, Backing::Private)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_registry_drops_dead_channels() {
        let ctx = Context::new();
        let a = ctx
            .attach("ctx_test_drop", "ctx_test_drop", 1024, Backing::Private)
            .unwrap();
        let ptr = Arc::as_ptr(&a);
        drop(a);

        // A fresh attach after the last user dropped gets a new channel
        let b = ctx
            .attach("ctx_test_drop", "ctx_test_drop", 1024, Backing::Private)
            .unwrap();
        assert!(!std::ptr::eq(ptr, Arc::as_ptr(&b)));
    }
}
