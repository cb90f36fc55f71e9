//! Multiplexed readiness waits
//!
//! A [`Poller`] watches the readiness primitives of many subscribers and
//! reports which became ready. Real subscribers are multiplexed in a
//! single `poll(2)` call over their wakeup sockets. As soon as one fake
//! subscriber is registered the poller switches to scanning: fake flags
//! are process-local state with no descriptor to poll, so the wait loops
//! on the fake-signal generation counter, re-checking real descriptors
//! on a short slice when the set is mixed.

use crate::error::{IpcError, Result};
use crate::event::{generation, poll_timeout_ms, wait_generation, SubEvent};
use crate::socket::{SocketId, SubSocket};
use rustix::event::{poll, PollFd, PollFlags};
use std::time::{Duration, Instant};

/// Re-check interval for real descriptors while fake flags are watched
const MIXED_SCAN_SLICE: Duration = Duration::from_millis(10);

/// Readiness multiplexer over subscriber sockets
#[derive(Default)]
pub struct Poller {
    entries: Vec<(SocketId, SubEvent)>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `sock`. Registering the same socket twice is a no-op.
    pub fn register(&mut self, sock: &SubSocket) {
        let id = sock.socket_id();
        if self.entries.iter().any(|(eid, _)| *eid == id) {
            return;
        }
        self.entries.push((id, sock.event().clone()));
    }

    /// Stop watching the socket with `id`.
    pub fn unregister(&mut self, id: SocketId) {
        self.entries.retain(|(eid, _)| *eid != id);
    }

    /// Block until at least one watched socket is ready or `timeout`
    /// elapses; returns the ready socket ids (empty on timeout).
    ///
    /// Readiness is not consumed: the sockets' primitives stay set until
    /// their owners receive.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<SocketId>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }

        let any_fake = self
            .entries
            .iter()
            .any(|(_, ev)| matches!(ev, SubEvent::Fake(_)));
        if !any_fake {
            return self.wait_fds(timeout);
        }
        self.wait_scanning(timeout)
    }

    // All-real set: one poll over every wakeup socket.
    fn wait_fds(&self, timeout: Option<Duration>) -> Result<Vec<SocketId>> {
        let mut fds: Vec<PollFd<'_>> = self
            .entries
            .iter()
            .filter_map(|(_, ev)| ev.fd_event())
            .map(|e| PollFd::new(e.owned(), PollFlags::IN))
            .collect();

        poll(&mut fds, poll_timeout_ms(timeout)).map_err(|e| IpcError::Event(e.into()))?;

        let mut ready = Vec::new();
        for ((id, _), fd) in self.entries.iter().zip(&fds) {
            if fd.revents().contains(PollFlags::IN) {
                ready.push(*id);
            }
        }
        Ok(ready)
    }

    // Mixed or all-fake set: scan all primitives, sleeping on the
    // fake-signal generation between rounds.
    fn wait_scanning(&self, timeout: Option<Duration>) -> Result<Vec<SocketId>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let has_fds = self
            .entries
            .iter()
            .any(|(_, ev)| matches!(ev, SubEvent::Real(_)));

        loop {
            let gen = generation();

            let mut ready = Vec::new();
            for (id, ev) in &self.entries {
                if ev.is_set()? {
                    ready.push(*id);
                }
            }
            if !ready.is_empty() {
                return Ok(ready);
            }

            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    Some(deadline - now)
                }
            };

            // Generation wakeups only cover fake flags; with real fds in
            // the set, cap the sleep so they are re-polled promptly.
            let slice = if has_fds {
                Some(remaining.map_or(MIXED_SCAN_SLICE, |r| r.min(MIXED_SCAN_SLICE)))
            } else {
                remaining
            };
            wait_generation(gen, slice);
        }
    }
}

/// Block until `sock` is ready or `timeout` elapses; returns whether it
/// became ready. Readiness is not consumed.
pub fn wait_for_one_event(sock: &SubSocket, timeout: Option<Duration>) -> Result<bool> {
    sock.event().wait(timeout)
}
