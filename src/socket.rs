//! Publisher and subscriber sockets
//!
//! Sockets are the user-facing surface over [`Channel`]: a `PubSocket`
//! holds the endpoint's single writer lock and wakes subscribers after
//! every send; a `SubSocket` owns a private cursor, a readiness
//! primitive, and a read mode fixed at connect time. Whether a socket is
//! real or fake is decided once, when it connects, from the calling
//! thread's fake-event toggle.

use crate::channel::{Channel, Cursor, DEFAULT_SEGMENT_SIZE};
use crate::context::{context, Context};
use crate::endpoint::{check_address, segment_name};
use crate::error::Result;
use crate::event::{
    fake_events_enabled, flag_for, get_fake_prefix, signal_name, EventSocket, FakeFlag, Notifier,
    SubEvent,
};
use crate::poller::Poller;
use crate::shm::Backing;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Process-unique socket identifier, used by the poller
pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// How a subscriber consumes the message stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Every retained message, in order
    Strict,
    /// Only the newest message, discarding the backlog
    Conflate,
}

enum PubSignal {
    /// Wake registered reader slots through their name-addressed
    /// wakeup sockets
    Slots(Notifier),
    /// Set the endpoint's fake flag
    Fake(Arc<FakeFlag>),
}

/// Sending end of an endpoint
///
/// Holds the endpoint's writer lock for its lifetime; a second
/// `PubSocket` on the same endpoint fails with
/// [`MultiplePublishers`](crate::error::IpcError::MultiplePublishers).
pub struct PubSocket {
    channel: Arc<Channel>,
    signal: PubSignal,
}

impl PubSocket {
    pub fn connect(ctx: &Context, endpoint: &str) -> Result<Self> {
        let name = segment_name(endpoint)?;
        let fake = fake_events_enabled();
        let backing = if fake {
            Backing::Private
        } else {
            Backing::Shared
        };

        let channel = ctx.attach(endpoint, &name, DEFAULT_SEGMENT_SIZE, backing)?;
        channel.acquire_writer()?;

        let signal = if fake {
            PubSignal::Fake(flag_for(&get_fake_prefix(), &name))
        } else {
            PubSignal::Slots(Notifier::new()?)
        };

        debug!(endpoint, fake, "publisher connected");
        Ok(Self { channel, signal })
    }

    /// Append a message and wake every subscriber. Returns the message's
    /// sequence number. Never blocks on readers.
    pub fn send(&self, data: &[u8]) -> Result<u64> {
        let seq = self.channel.write(data)?;
        match &self.signal {
            PubSignal::Slots(notifier) => {
                for (slot, generation) in self.channel.active_reader_slots() {
                    notifier.notify(&signal_name(self.channel.name(), slot, generation));
                }
            }
            PubSignal::Fake(flag) => flag.set(),
        }
        Ok(seq)
    }

    /// Number of subscribers currently registered on the endpoint
    pub fn num_readers(&self) -> usize {
        self.channel.active_readers()
    }

    pub fn endpoint(&self) -> &str {
        self.channel.endpoint()
    }

    /// Release the endpoint explicitly (dropping does the same).
    pub fn disconnect(self) {}
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.channel.release_writer();
        debug!(endpoint = %self.channel.endpoint(), "publisher disconnected");
    }
}

/// Receiving end of an endpoint
///
/// Delivery starts at the moment of connection: messages published
/// before the subscriber attached are never seen.
pub struct SubSocket {
    id: SocketId,
    channel: Arc<Channel>,
    cursor: Cursor,
    mode: ReadMode,
    event: SubEvent,
    slot: Option<usize>,
    timeout: Option<Duration>,
}

impl SubSocket {
    pub fn connect(ctx: &Context, endpoint: &str, address: &str, conflate: bool) -> Result<Self> {
        check_address(address)?;
        let name = segment_name(endpoint)?;
        let fake = fake_events_enabled();
        let backing = if fake {
            Backing::Private
        } else {
            Backing::Shared
        };

        let channel = ctx.attach(endpoint, &name, DEFAULT_SEGMENT_SIZE, backing)?;

        let (event, slot) = if fake {
            (SubEvent::Fake(flag_for(&get_fake_prefix(), &name)), None)
        } else {
            let (slot, generation) = channel.claim_reader_slot()?;
            let sock = match EventSocket::bind(&signal_name(&name, slot, generation)) {
                Ok(sock) => sock,
                Err(e) => {
                    channel.release_reader_slot(slot);
                    return Err(e);
                }
            };
            (SubEvent::Real(sock), Some(slot))
        };

        let cursor = channel.cursor();
        debug!(endpoint, fake, conflate, "subscriber connected");
        Ok(Self {
            id: next_socket_id(),
            channel,
            cursor,
            mode: if conflate {
                ReadMode::Conflate
            } else {
                ReadMode::Strict
            },
            event,
            slot,
            timeout: None,
        })
    }

    /// Default deadline for blocking receives; `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn try_read(&mut self) -> Option<Vec<u8>> {
        match self.mode {
            ReadMode::Strict => self.channel.read_next(&mut self.cursor),
            ReadMode::Conflate => self.channel.read_latest(&mut self.cursor),
        }
    }

    // Clear the readiness primitive, then re-arm it if messages arrived
    // (or survived) in the meantime, so no wakeup is lost.
    fn settle_event(&self) -> Result<()> {
        self.event.clear()?;
        if self.channel.has_unread(&self.cursor) {
            self.event.set()?;
        }
        Ok(())
    }

    /// Receive one message.
    ///
    /// With `non_blocking`, returns immediately; otherwise blocks until a
    /// message arrives or the socket's timeout elapses. Absence of a
    /// message is `Ok(None)`, never an error.
    pub fn receive(&mut self, non_blocking: bool) -> Result<Option<Vec<u8>>> {
        if let Some(msg) = self.try_read() {
            self.settle_event()?;
            return Ok(Some(msg));
        }
        if non_blocking {
            self.settle_event()?;
            return Ok(None);
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    Some(deadline - now)
                }
            };

            self.event.wait(remaining)?;
            self.event.clear()?;

            if let Some(msg) = self.try_read() {
                self.settle_event()?;
                return Ok(Some(msg));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
        }
    }

    /// Messages lost to ring eviction since this socket connected
    pub fn overrun_count(&self) -> u64 {
        self.cursor.overruns()
    }

    pub fn socket_id(&self) -> SocketId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        self.channel.endpoint()
    }

    pub(crate) fn event(&self) -> &SubEvent {
        &self.event
    }

    /// Release the reader slot explicitly (dropping does the same).
    pub fn disconnect(self) {}
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        if let Some(idx) = self.slot {
            self.channel.release_reader_slot(idx);
        }
        debug!(endpoint = %self.channel.endpoint(), "subscriber disconnected");
    }
}

/// Connect a publisher to `endpoint` through the process-wide context.
pub fn pub_sock(endpoint: &str) -> Result<PubSocket> {
    PubSocket::connect(context(), endpoint)
}

/// Connect a subscriber to `endpoint` through the process-wide context,
/// optionally registering it with `poller`.
pub fn sub_sock(
    endpoint: &str,
    poller: Option<&mut Poller>,
    address: &str,
    conflate: bool,
    timeout: Option<Duration>,
) -> Result<SubSocket> {
    let mut sock = SubSocket::connect(context(), endpoint, address, conflate)?;
    sock.set_timeout(timeout);
    if let Some(poller) = poller {
        poller.register(&sock);
    }
    Ok(sock)
}

/// Drain every currently available message from `sock`.
///
/// With `wait_for_one`, the first receive blocks (subject to the
/// socket's timeout) so the result is non-empty whenever a message
/// arrives in time; the drain itself never blocks further.
pub fn drain_sock_raw(sock: &mut SubSocket, wait_for_one: bool) -> Result<Vec<Vec<u8>>> {
    let mut msgs = Vec::new();
    loop {
        let block_first = wait_for_one && msgs.is_empty();
        match sock.receive(!block_first)? {
            Some(msg) => msgs.push(msg),
            None => break,
        }
    }
    Ok(msgs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IpcError;
    use crate::event::{delete_fake_prefix, set_fake_prefix, toggle_fake_events};
    use std::thread;

    fn fake(prefix: &str) {
        toggle_fake_events(true);
        set_fake_prefix(prefix);
    }

    #[test]
    fn test_roundtrip_in_order() {
        fake("sock_test_order");
        let p = pub_sock("ipc:///tmp/sock_test_order").unwrap();
        let mut s = sub_sock("ipc:///tmp/sock_test_order", None, "127.0.0.1", false, None).unwrap();

        for i in 0..10u8 {
            p.send(&[i; 32]).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(s.receive(true).unwrap().unwrap(), vec![i; 32]);
        }
        assert!(s.receive(true).unwrap().is_none());
        assert_eq!(s.overrun_count(), 0);
        delete_fake_prefix("sock_test_order");
    }

    #[test]
    fn test_payload_bit_identical() {
        fake("sock_test_bytes");
        let p = pub_sock("ipc:///tmp/sock_test_bytes").unwrap();
        let mut s = sub_sock("ipc:///tmp/sock_test_bytes", None, "127.0.0.1", false, None).unwrap();

        let payload: Vec<u8> = (0..=255).collect();
        p.send(&payload).unwrap();
        assert_eq!(s.receive(true).unwrap().unwrap(), payload);
        delete_fake_prefix("sock_test_bytes");
    }

    #[test]
    fn test_conflate_delivers_latest() {
        fake("sock_test_conflate");
        let p = pub_sock("ipc:///tmp/sock_test_conflate").unwrap();
        let mut s =
            sub_sock("ipc:///tmp/sock_test_conflate", None, "127.0.0.1", true, None).unwrap();

        for i in 0..5u8 {
            p.send(&[i; 8]).unwrap();
        }
        assert_eq!(s.receive(true).unwrap().unwrap(), vec![4u8; 8]);
        assert!(s.receive(true).unwrap().is_none());
        delete_fake_prefix("sock_test_conflate");
    }

    #[test]
    fn test_second_publisher_rejected() {
        fake("sock_test_single_pub");
        let p1 = pub_sock("ipc:///tmp/sock_test_single_pub").unwrap();
        assert!(matches!(
            pub_sock("ipc:///tmp/sock_test_single_pub"),
            Err(IpcError::MultiplePublishers { .. })
        ));

        // Keep the channel mapped while the first publisher releases
        let _s =
            sub_sock("ipc:///tmp/sock_test_single_pub", None, "127.0.0.1", false, None).unwrap();
        drop(p1);
        pub_sock("ipc:///tmp/sock_test_single_pub").unwrap();
        delete_fake_prefix("sock_test_single_pub");
    }

    #[test]
    fn test_bad_address_rejected() {
        fake("sock_test_addr");
        assert!(matches!(
            sub_sock("ipc:///tmp/sock_test_addr", None, "10.0.0.1", false, None),
            Err(IpcError::UnsupportedAddress { .. })
        ));
        delete_fake_prefix("sock_test_addr");
    }

    #[test]
    fn test_receive_timeout_returns_none() {
        fake("sock_test_timeout");
        let _p = pub_sock("ipc:///tmp/sock_test_timeout").unwrap();
        let mut s = sub_sock(
            "ipc:///tmp/sock_test_timeout",
            None,
            "127.0.0.1",
            false,
            Some(Duration::from_millis(20)),
        )
        .unwrap();

        let start = Instant::now();
        assert!(s.receive(false).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
        delete_fake_prefix("sock_test_timeout");
    }

    #[test]
    fn test_drain_empty_nonblocking() {
        fake("sock_test_drain_empty");
        let _p = pub_sock("ipc:///tmp/sock_test_drain_empty").unwrap();
        let mut s =
            sub_sock("ipc:///tmp/sock_test_drain_empty", None, "127.0.0.1", false, None).unwrap();
        assert!(drain_sock_raw(&mut s, false).unwrap().is_empty());
        delete_fake_prefix("sock_test_drain_empty");
    }

    #[test]
    fn test_drain_collects_backlog() {
        fake("sock_test_drain");
        let p = pub_sock("ipc:///tmp/sock_test_drain").unwrap();
        let mut s = sub_sock("ipc:///tmp/sock_test_drain", None, "127.0.0.1", false, None).unwrap();

        for i in 0..4u8 {
            p.send(&[i]).unwrap();
        }
        let msgs = drain_sock_raw(&mut s, false).unwrap();
        assert_eq!(msgs, vec![vec![0], vec![1], vec![2], vec![3]]);
        delete_fake_prefix("sock_test_drain");
    }

    #[test]
    fn test_drain_wait_for_one_blocks_for_sender() {
        fake("sock_test_drain_wait");
        let mut s = sub_sock(
            "ipc:///tmp/sock_test_drain_wait",
            None,
            "127.0.0.1",
            false,
            Some(Duration::from_secs(5)),
        )
        .unwrap();

        let sender = thread::spawn(|| {
            toggle_fake_events(true);
            set_fake_prefix("sock_test_drain_wait");
            let p = pub_sock("ipc:///tmp/sock_test_drain_wait").unwrap();
            thread::sleep(Duration::from_millis(30));
            p.send(b"late").unwrap();
        });

        let msgs = drain_sock_raw(&mut s, true).unwrap();
        assert_eq!(msgs, vec![b"late".to_vec()]);
        sender.join().unwrap();
        delete_fake_prefix("sock_test_drain_wait");
    }

    #[test]
    fn test_history_not_delivered() {
        fake("sock_test_history");
        let p = pub_sock("ipc:///tmp/sock_test_history").unwrap();
        p.send(b"before").unwrap();

        let mut s =
            sub_sock("ipc:///tmp/sock_test_history", None, "127.0.0.1", false, None).unwrap();
        assert!(s.receive(true).unwrap().is_none());

        p.send(b"after").unwrap();
        assert_eq!(s.receive(true).unwrap().unwrap(), b"after");
        delete_fake_prefix("sock_test_history");
    }

    #[test]
    fn test_wakeup_across_independent_mappings() {
        // Separate contexts map the segment independently, as two
        // unrelated processes would; the only shared state is the shm
        // header, so the wakeup must travel by socket name, not by any
        // in-process handle
        toggle_fake_events(false);
        let sub_ctx = Context::new();
        let mut s =
            SubSocket::connect(&sub_ctx, "ipc:///tmp/sock_test_indep", "127.0.0.1", false)
                .unwrap();
        s.set_timeout(Some(Duration::from_secs(3)));

        let receiver = thread::spawn(move || {
            let start = Instant::now();
            let msg = s.receive(false).unwrap();
            (msg, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        let pub_ctx = Context::new();
        let p = PubSocket::connect(&pub_ctx, "ipc:///tmp/sock_test_indep").unwrap();
        p.send(b"wake").unwrap();

        let (msg, elapsed) = receiver.join().unwrap();
        assert_eq!(msg.unwrap(), b"wake");
        // Woken by the send, not by timeout expiry
        assert!(elapsed < Duration::from_secs(1), "wakeup took {elapsed:?}");
    }

    #[test]
    fn test_real_shm_roundtrip() {
        toggle_fake_events(false);
        let p = pub_sock("ipc:///tmp/sock_test_real_shm").unwrap();
        let mut s =
            sub_sock("ipc:///tmp/sock_test_real_shm", None, "127.0.0.1", false, None).unwrap();

        assert_eq!(p.num_readers(), 1);
        p.send(b"over shared memory").unwrap();
        assert_eq!(
            s.receive(false).unwrap().unwrap(),
            b"over shared memory"
        );
    }
}
