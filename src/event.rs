//! Readiness primitives
//!
//! Every subscriber owns one readiness primitive per channel attachment:
//! ready means "unread data may exist". The primitive has two variants
//! chosen once at connect time, never branched per call:
//!
//! - **Real**: a non-blocking unix datagram socket bound in the
//!   abstract namespace under a name derived from the segment name,
//!   slot index, and slot generation ([`signal_name`]). The publisher
//!   addresses it by that name alone, so wakeups work between unrelated
//!   processes with no descriptor sharing; waits go through `poll(2)`,
//!   which is also what lets the [`Poller`](crate::poller) multiplex
//!   many subscribers in one syscall.
//! - **Fake**: a plain addressable boolean under a test-controlled
//!   prefix namespace, keyed by `(prefix, endpoint)`. Fully
//!   deterministic, no shared memory, no sockets.
//!
//! The fake toggle and prefix are thread-local with environment
//! fallback (`SHMBUS_FAKE`, `SHMBUS_FAKE_PREFIX`), so concurrent test
//! threads select their mode and namespace independently.

use crate::error::{IpcError, Result};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::fd::{AsRawFd, OwnedFd};
use rustix::io::Errno;
use rustix::net::{
    bind_unix, sendto_unix, socket_with, AddressFamily, RecvFlags, SendFlags, SocketAddrUnix,
    SocketFlags, SocketType,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

const FAKE_ENV: &str = "SHMBUS_FAKE";
const FAKE_PREFIX_ENV: &str = "SHMBUS_FAKE_PREFIX";

thread_local! {
    static FAKE_EVENTS: Cell<Option<bool>> = const { Cell::new(None) };
    static FAKE_PREFIX: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Convert an optional duration into a `poll(2)` timeout.
pub(crate) fn poll_timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
    }
}

// ============================================================================
// Real variant: abstract-namespace datagram sockets
// ============================================================================

// FNV-1a. The abstract namespace caps names at 107 bytes while segment
// names can be much longer, so the segment name goes in hashed. Kept
// hand-rolled: both sides of a channel may be different binaries, so the
// hash must not depend on any library's internal seeding.
fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Abstract-namespace name of the wakeup socket for one claimed reader
/// slot. Derived only from shared header state, so any process attached
/// to the channel can address it.
pub(crate) fn signal_name(segment: &str, slot: usize, generation: u32) -> String {
    format!("shmbus.{:016x}.{slot}.{generation}", fnv1a(segment))
}

fn abstract_addr(name: &str) -> Result<SocketAddrUnix> {
    SocketAddrUnix::new_abstract_name(name.as_bytes()).map_err(|e| IpcError::Event(e.into()))
}

fn dgram_socket() -> Result<OwnedFd> {
    socket_with(
        AddressFamily::UNIX,
        SocketType::DGRAM,
        SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
        None,
    )
    .map_err(|e| IpcError::Event(e.into()))
}

/// Readiness primitive backed by a bound datagram socket
///
/// Ready means at least one datagram is queued; any process that knows
/// the socket's name can make it ready.
#[derive(Clone)]
pub struct EventSocket {
    fd: Arc<OwnedFd>,
    addr: SocketAddrUnix,
}

impl EventSocket {
    /// Bind the wakeup socket under `name` in the abstract namespace.
    pub fn bind(name: &str) -> Result<Self> {
        let fd = dgram_socket()?;
        let addr = abstract_addr(name)?;
        bind_unix(&fd, &addr).map_err(|e| IpcError::Event(e.into()))?;
        Ok(Self {
            fd: Arc::new(fd),
            addr,
        })
    }

    /// Set ready.
    pub fn set(&self) -> Result<()> {
        match sendto_unix(
            &*self.fd,
            &[1],
            SendFlags::DONTWAIT | SendFlags::NOSIGNAL,
            &self.addr,
        ) {
            Ok(_) => Ok(()),
            // Queue full: still readable, still ready
            Err(Errno::AGAIN) => Ok(()),
            Err(e) => Err(IpcError::Event(e.into())),
        }
    }

    /// Reset to not-ready.
    pub fn clear(&self) -> Result<()> {
        let mut buf = [0u8; 8];
        loop {
            match rustix::net::recv(&*self.fd, &mut buf, RecvFlags::empty()) {
                Ok(_) => continue,
                Err(Errno::AGAIN) => return Ok(()),
                Err(e) => return Err(IpcError::Event(e.into())),
            }
        }
    }

    /// Check readiness without blocking.
    pub fn is_set(&self) -> Result<bool> {
        let mut fds = [PollFd::new(&*self.fd, PollFlags::IN)];
        let n = poll(&mut fds, 0).map_err(|e| IpcError::Event(e.into()))?;
        Ok(n > 0)
    }

    /// Block until ready or `timeout` elapses; `None` waits indefinitely.
    /// Returns whether the primitive became ready.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut fds = [PollFd::new(&*self.fd, PollFlags::IN)];
        let n = poll(&mut fds, poll_timeout_ms(timeout)).map_err(|e| IpcError::Event(e.into()))?;
        Ok(n > 0)
    }

    #[inline(always)]
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    /// The owned descriptor, for building poll sets
    #[inline(always)]
    pub(crate) fn owned(&self) -> &OwnedFd {
        &self.fd
    }
}

/// Publisher-side sender for subscriber wakeup sockets
///
/// One unbound datagram socket; targets are addressed per send by name,
/// so nothing is shared with the subscribers beyond the channel header.
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            fd: dgram_socket()?,
        })
    }

    /// Wake the socket bound under `name`. Best effort: a missing
    /// receiver means the subscriber is gone, a full queue means it is
    /// already signaled.
    pub fn notify(&self, name: &str) {
        if let Ok(addr) = abstract_addr(name) {
            let _ = sendto_unix(
                &self.fd,
                &[1],
                SendFlags::DONTWAIT | SendFlags::NOSIGNAL,
                &addr,
            );
        }
    }
}

// ============================================================================
// Fake variant: addressable boolean flag
// ============================================================================

/// Deterministic test-mode readiness flag
pub struct FakeFlag {
    set: Mutex<bool>,
    cv: Condvar,
}

impl FakeFlag {
    fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.set.lock().unwrap() = true;
        self.cv.notify_all();
        bump_generation();
    }

    pub fn clear(&self) {
        *self.set.lock().unwrap() = false;
    }

    pub fn get(&self) -> bool {
        *self.set.lock().unwrap()
    }

    /// Block until set or `timeout` elapses; returns whether set.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut set = self.set.lock().unwrap();
        loop {
            if *set {
                return true;
            }
            match deadline {
                None => {
                    set = self.cv.wait(set).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) = self.cv.wait_timeout(set, deadline - now).unwrap();
                    set = guard;
                    if result.timed_out() && !*set {
                        return false;
                    }
                }
            }
        }
    }
}

// Registry of fake flags, keyed by (prefix, segment name). A global
// generation counter lets the poller sleep across flags it does not own.

fn flags() -> &'static Mutex<HashMap<(String, String), Arc<FakeFlag>>> {
    static FLAGS: OnceLock<Mutex<HashMap<(String, String), Arc<FakeFlag>>>> = OnceLock::new();
    FLAGS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn wake() -> &'static (Mutex<u64>, Condvar) {
    static WAKE: OnceLock<(Mutex<u64>, Condvar)> = OnceLock::new();
    WAKE.get_or_init(|| (Mutex::new(0), Condvar::new()))
}

fn bump_generation() {
    let (lock, cv) = wake();
    *lock.lock().unwrap() += 1;
    cv.notify_all();
}

/// Current fake-signal generation, for [`wait_generation`].
pub(crate) fn generation() -> u64 {
    *wake().0.lock().unwrap()
}

/// Block until any fake flag is signaled after `seen`, or until
/// `timeout`. Returns whether the generation advanced.
pub(crate) fn wait_generation(seen: u64, timeout: Option<Duration>) -> bool {
    let (lock, cv) = wake();
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut gen = lock.lock().unwrap();
    loop {
        if *gen != seen {
            return true;
        }
        match deadline {
            None => {
                gen = cv.wait(gen).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, result) = cv.wait_timeout(gen, deadline - now).unwrap();
                gen = guard;
                if result.timed_out() && *gen == seen {
                    return false;
                }
            }
        }
    }
}

/// Fetch or create the flag for `(prefix, name)`.
pub(crate) fn flag_for(prefix: &str, name: &str) -> Arc<FakeFlag> {
    let mut map = flags().lock().unwrap();
    map.entry((prefix.to_string(), name.to_string()))
        .or_insert_with(|| Arc::new(FakeFlag::new()))
        .clone()
}

// ============================================================================
// Process/thread-wide fake-mode selection
// ============================================================================

/// Switch the calling thread (and its future socket constructions) into
/// or out of fake-event mode.
pub fn toggle_fake_events(enabled: bool) {
    FAKE_EVENTS.with(|cell| cell.set(Some(enabled)));
}

/// Whether sockets constructed by this thread use the fake harness
pub fn fake_events_enabled() -> bool {
    FAKE_EVENTS.with(|cell| match cell.get() {
        Some(v) => v,
        None => {
            let v = std::env::var_os(FAKE_ENV).is_some();
            cell.set(Some(v));
            v
        }
    })
}

/// Set the active fake-event namespace for this thread.
pub fn set_fake_prefix(prefix: &str) {
    FAKE_PREFIX.with(|cell| *cell.borrow_mut() = Some(prefix.to_string()));
}

/// The active fake-event namespace; empty when none was set.
pub fn get_fake_prefix() -> String {
    FAKE_PREFIX.with(|cell| {
        if let Some(p) = cell.borrow().as_ref() {
            return p.clone();
        }
        let p = std::env::var(FAKE_PREFIX_ENV).unwrap_or_default();
        *cell.borrow_mut() = Some(p.clone());
        p
    })
}

/// Drop every fake flag registered under `prefix`.
pub fn delete_fake_prefix(prefix: &str) {
    let mut map = flags().lock().unwrap();
    map.retain(|(p, _), _| p != prefix);
    FAKE_PREFIX.with(|cell| {
        let mut current = cell.borrow_mut();
        if current.as_deref() == Some(prefix) {
            *current = Some(String::new());
        }
    });
}

// ============================================================================
// Fake-event handle surface
// ============================================================================

/// Test-side handle to the fake readiness flag of one endpoint
///
/// `enabled` doubles as the ready state: enabling the handle makes a
/// poller waiting on the corresponding subscriber return immediately.
pub struct SocketEventHandle {
    endpoint: String,
    identifier: String,
    flag: Arc<FakeFlag>,
}

impl SocketEventHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.flag.set();
        } else {
            self.flag.clear();
        }
    }
}

/// Construct a handle to the fake readiness flag of `endpoint`.
///
/// `identifier` defaults to the active prefix. With `override_state`
/// the handle's initial `enable` state is applied; otherwise the flag
/// keeps whatever state it already had.
pub fn fake_event_handle(
    endpoint: &str,
    identifier: Option<&str>,
    override_state: bool,
    enable: bool,
) -> Result<SocketEventHandle> {
    let identifier = match identifier {
        Some(id) => id.to_string(),
        None => get_fake_prefix(),
    };
    let name = crate::endpoint::segment_name(endpoint)?;
    let flag = flag_for(&identifier, &name);
    let handle = SocketEventHandle {
        endpoint: endpoint.to_string(),
        identifier,
        flag,
    };
    if override_state {
        handle.set_enabled(enable);
    }
    Ok(handle)
}

// ============================================================================
// Variant-erased subscriber event
// ============================================================================

/// A subscriber's readiness primitive, real or fake
#[derive(Clone)]
pub enum SubEvent {
    Real(EventSocket),
    Fake(Arc<FakeFlag>),
}

impl SubEvent {
    pub fn set(&self) -> Result<()> {
        match self {
            SubEvent::Real(e) => e.set(),
            SubEvent::Fake(f) => {
                f.set();
                Ok(())
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match self {
            SubEvent::Real(e) => e.clear(),
            SubEvent::Fake(f) => {
                f.clear();
                Ok(())
            }
        }
    }

    pub fn is_set(&self) -> Result<bool> {
        match self {
            SubEvent::Real(e) => e.is_set(),
            SubEvent::Fake(f) => Ok(f.get()),
        }
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match self {
            SubEvent::Real(e) => e.wait(timeout),
            SubEvent::Fake(f) => Ok(f.wait(timeout)),
        }
    }

    pub(crate) fn fd_event(&self) -> Option<&EventSocket> {
        match self {
            SubEvent::Real(e) => Some(e),
            SubEvent::Fake(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique(tag: &str) -> String {
        format!("event_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_event_socket_set_clear() {
        let ev = EventSocket::bind(&unique("set_clear")).unwrap();
        assert!(!ev.is_set().unwrap());
        ev.set().unwrap();
        assert!(ev.is_set().unwrap());
        ev.clear().unwrap();
        assert!(!ev.is_set().unwrap());
    }

    #[test]
    fn test_event_socket_wait_timeout() {
        let ev = EventSocket::bind(&unique("wait")).unwrap();
        assert!(!ev.wait(Some(Duration::from_millis(10))).unwrap());
        ev.set().unwrap();
        assert!(ev.wait(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_notify_reaches_socket_by_name_alone() {
        // The notifier holds no reference to the event socket; the name
        // is the only thing connecting them, as between two processes
        let name = signal_name(&unique("notify"), 3, 7);
        let ev = EventSocket::bind(&name).unwrap();

        let notifier = Notifier::new().unwrap();
        notifier.notify(&name);
        assert!(ev.wait(Some(Duration::from_secs(1))).unwrap());

        // A stale generation addresses nobody and must not error
        let stale = signal_name(&unique("notify"), 3, 6);
        notifier.notify(&stale);
        ev.clear().unwrap();
        assert!(!ev.is_set().unwrap());
    }

    #[test]
    fn test_repeated_notify_stays_ready() {
        let name = signal_name(&unique("burst"), 0, 1);
        let ev = EventSocket::bind(&name).unwrap();
        let notifier = Notifier::new().unwrap();

        for _ in 0..300 {
            notifier.notify(&name);
        }
        assert!(ev.is_set().unwrap());
        ev.clear().unwrap();
        assert!(!ev.is_set().unwrap());
    }

    #[test]
    fn test_fake_flag_wait_timeout() {
        let flag = FakeFlag::new();
        assert!(!flag.wait(Some(Duration::from_millis(10))));
        flag.set();
        assert!(flag.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_fake_flag_cross_thread_wakeup() {
        let flag = Arc::new(FakeFlag::new());
        let signaler = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.set();
        });
        assert!(flag.wait(Some(Duration::from_secs(5))));
        handle.join().unwrap();
    }

    #[test]
    fn test_prefix_thread_local() {
        set_fake_prefix("event_test_prefix");
        assert_eq!(get_fake_prefix(), "event_test_prefix");

        let other = thread::spawn(|| get_fake_prefix());
        // A fresh thread falls back to the (unset) environment
        assert_eq!(other.join().unwrap(), "");

        delete_fake_prefix("event_test_prefix");
        assert_eq!(get_fake_prefix(), "");
    }

    #[test]
    fn test_handle_addresses_shared_flag() {
        let h1 =
            fake_event_handle("ipc:///tmp/event_test_ep", Some("event_test_h"), true, false)
                .unwrap();
        let h2 =
            fake_event_handle("ipc:///tmp/event_test_ep", Some("event_test_h"), false, false)
                .unwrap();

        assert!(!h1.is_enabled());
        h1.set_enabled(true);
        assert!(h2.is_enabled());

        delete_fake_prefix("event_test_h");
    }

    #[test]
    fn test_handle_override_applies_initial_state() {
        let h = fake_event_handle("ipc:///tmp/event_test_ov", Some("event_test_ov"), true, true)
            .unwrap();
        assert!(h.is_enabled());

        // Without override the existing state is kept
        let h2 =
            fake_event_handle("ipc:///tmp/event_test_ov", Some("event_test_ov"), false, false)
                .unwrap();
        assert!(h2.is_enabled());

        delete_fake_prefix("event_test_ov");
    }
}
