//! Ring-buffer broadcast channel
//!
//! One channel per endpoint: a `repr(C)` header followed by a byte ring
//! holding a bounded history of framed messages. A single publisher
//! appends records and advances a monotonic sequence counter; any number
//! of subscribers read through private cursors and never mutate shared
//! state beyond their reader slot. When the ring fills, the oldest
//! records are evicted; a cursor that falls behind the retention window
//! resynchronizes to the oldest available message (or the newest, in
//! conflate mode) instead of failing.
//!
//! # Record framing
//!
//! Each record is `seq: u64 LE | len: u32 LE | pad: u32` followed by the
//! payload, with the total size rounded up to 8 bytes. Offsets are
//! logical (monotonically increasing); the physical position is the
//! offset modulo capacity, and copies wrap byte-wise.
//!
//! # Torn-read protection
//!
//! The ring bytes are guarded by a seqlock counter in the header. The
//! writer increments it to odd before mutating the ring and back to even
//! after, with a release fence in between. A reader loads the counter
//! (spinning while odd), copies the record, then re-checks it behind an
//! acquire fence: any change means the copy may be torn and the read is
//! retried from a fresh snapshot.

use crate::error::{IpcError, Result};
use crate::shm::{Backing, HeapSegment, Segment, ShmSegment};
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default ring capacity in bytes (10MB)
pub const DEFAULT_SEGMENT_SIZE: usize = 10 * 1024 * 1024;

/// Maximum concurrent subscribers per channel
pub const MAX_SUBSCRIBERS: usize = 15;

const CHANNEL_MAGIC: u32 = 0x53484D42; // "SHMB"
const CHANNEL_VERSION: u32 = 1;

const RECORD_HEADER_SIZE: u64 = 16;
const CACHE_LINE_SIZE: usize = 64;

const SLOT_FREE: u32 = 0;
const SLOT_ACTIVE: u32 = 1;

/// How long an attacher waits for the creator to finish writing the
/// header before treating a zero magic as corruption
const INIT_WAIT: Duration = Duration::from_millis(250);

const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

const fn align_cache(n: usize) -> usize {
    (n + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Per-subscriber readiness registration
#[repr(C)]
struct ReaderSlot {
    state: AtomicU32,
    /// Bumped on every claim; together with the segment name and slot
    /// index it names the subscriber's wakeup socket, so the publisher
    /// can address it from any process
    generation: AtomicU32,
}

/// Channel header at the start of the segment
#[repr(C)]
struct ChannelHeader {
    /// Stored last during initialization; zero means a creator is still
    /// writing the header
    magic: AtomicU32,
    version: AtomicU32,
    capacity: AtomicU64,
    /// Seqlock over the ring bytes: odd while the writer is mutating
    data_version: AtomicU32,
    _pad0: u32,
    /// Number of messages ever written; next message gets this sequence
    write_seq: AtomicU64,
    /// Logical offset one past the last record
    write_off: AtomicU64,
    /// Logical offset of the most recent record
    latest_off: AtomicU64,
    /// Sequence of the oldest retained record
    oldest_seq: AtomicU64,
    /// Logical offset of the oldest retained record
    oldest_off: AtomicU64,
    /// Single-writer lock: pid of the live publisher, 0 when free
    writer_pid: AtomicU32,
    _pad1: u32,
    readers: [ReaderSlot; MAX_SUBSCRIBERS],
}

const DATA_OFFSET: usize = align_cache(std::mem::size_of::<ChannelHeader>());

impl ChannelHeader {
    /// # Safety
    /// The pointer must address at least `DATA_OFFSET` zeroed bytes.
    unsafe fn init(ptr: *mut Self, capacity: u64) {
        (*ptr).version.store(CHANNEL_VERSION, Ordering::Relaxed);
        (*ptr).capacity.store(capacity, Ordering::Relaxed);
        (*ptr).data_version.store(0, Ordering::Relaxed);
        (*ptr).write_seq.store(0, Ordering::Relaxed);
        (*ptr).write_off.store(0, Ordering::Relaxed);
        (*ptr).latest_off.store(0, Ordering::Relaxed);
        (*ptr).oldest_seq.store(0, Ordering::Relaxed);
        (*ptr).oldest_off.store(0, Ordering::Relaxed);
        (*ptr).writer_pid.store(0, Ordering::Relaxed);
        for slot in &(*ptr).readers {
            slot.state.store(SLOT_FREE, Ordering::Relaxed);
            slot.generation.store(0, Ordering::Relaxed);
        }
        // Magic last: attachers spin on it until the header is complete
        (*ptr).magic.store(CHANNEL_MAGIC, Ordering::Release);
    }
}

/// Private read position of one subscriber
///
/// Cursors live in subscriber memory, never in the shared segment, so
/// readers cannot interfere with each other.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub(crate) next_seq: u64,
    pub(crate) off: u64,
    pub(crate) overruns: u64,
}

impl Cursor {
    /// Messages lost to ring eviction since this cursor was created
    #[inline(always)]
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Sequence number of the next unseen message
    #[inline(always)]
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

/// A shared-memory broadcast channel for one endpoint
pub struct Channel {
    segment: Segment,
    endpoint: String,
    name: String,
    capacity: u64,
}

// SAFETY: all shared-segment mutation goes through atomics or the
// single-writer protocol documented on the header fields.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    /// Create or attach to the channel backing `endpoint`.
    ///
    /// `name` is the normalized segment name; `capacity` is only used
    /// when this call creates the segment, otherwise the stored capacity
    /// wins.
    pub fn open(endpoint: &str, name: &str, capacity: usize, backing: Backing) -> Result<Self> {
        let want = align8(capacity as u64).max(align8(RECORD_HEADER_SIZE + 1));
        let total = DATA_OFFSET + want as usize;

        let (segment, created) = match backing {
            Backing::Shared => {
                let (seg, created) = ShmSegment::create(name, total)?;
                (Segment::Shm(seg), created)
            }
            Backing::Private => (Segment::Heap(HeapSegment::new(total)?), true),
        };

        let mut channel = Self {
            segment,
            endpoint: endpoint.to_string(),
            name: name.to_string(),
            capacity: want,
        };

        if created {
            unsafe {
                ChannelHeader::init(channel.segment.as_ptr() as *mut ChannelHeader, want);
            }
            debug!(endpoint, capacity = want, ?backing, "created channel");
        } else {
            let header = channel.header();

            // The creator made the name visible before writing the
            // header; a zero magic means it is still initializing
            let mut magic = header.magic.load(Ordering::Acquire);
            if magic == 0 {
                let deadline = Instant::now() + INIT_WAIT;
                while magic == 0 && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(1));
                    magic = header.magic.load(Ordering::Acquire);
                }
            }
            if magic != CHANNEL_MAGIC {
                return Err(IpcError::InvalidMagic {
                    expected: CHANNEL_MAGIC,
                    got: magic,
                });
            }

            let version = header.version.load(Ordering::Acquire);
            if version != CHANNEL_VERSION {
                return Err(IpcError::VersionMismatch {
                    expected: CHANNEL_VERSION,
                    got: version,
                });
            }
            channel.capacity = header.capacity.load(Ordering::Acquire);
            trace!(endpoint, capacity = channel.capacity, "attached to existing channel");
        }

        Ok(channel)
    }

    #[inline(always)]
    fn header(&self) -> &ChannelHeader {
        unsafe { &*(self.segment.as_ptr() as *const ChannelHeader) }
    }

    #[inline(always)]
    fn data(&self) -> *mut u8 {
        unsafe { self.segment.as_ptr().add(DATA_OFFSET) }
    }

    /// Endpoint string this channel was opened with
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Normalized segment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ring capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of messages ever written
    pub fn write_seq(&self) -> u64 {
        self.header().write_seq.load(Ordering::Acquire)
    }

    /// Whether `cursor` has unseen messages
    pub fn has_unread(&self, cursor: &Cursor) -> bool {
        self.write_seq() > cursor.next_seq
    }

    /// A cursor positioned at the current tail (sees only future writes)
    pub fn cursor(&self) -> Cursor {
        let header = self.header();
        loop {
            let seq = header.write_seq.load(Ordering::Acquire);
            let off = header.write_off.load(Ordering::Acquire);
            // Re-check so seq and off describe the same tail
            if header.write_seq.load(Ordering::Acquire) == seq {
                return Cursor {
                    next_seq: seq,
                    off,
                    overruns: 0,
                };
            }
        }
    }

    // Wrap-aware copies. Offsets are logical; physical position is
    // offset % capacity.

    unsafe fn copy_in(&self, off: u64, src: &[u8]) {
        let cap = self.capacity as usize;
        let pos = (off % self.capacity) as usize;
        let first = src.len().min(cap - pos);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(pos), first);
        if first < src.len() {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data(), src.len() - first);
        }
    }

    unsafe fn copy_out(&self, off: u64, dst: &mut [u8]) {
        let cap = self.capacity as usize;
        let pos = (off % self.capacity) as usize;
        let first = dst.len().min(cap - pos);
        std::ptr::copy_nonoverlapping(self.data().add(pos), dst.as_mut_ptr(), first);
        if first < dst.len() {
            std::ptr::copy_nonoverlapping(self.data(), dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    fn record_header(&self, off: u64) -> (u64, u32) {
        let mut hdr = [0u8; RECORD_HEADER_SIZE as usize];
        unsafe { self.copy_out(off, &mut hdr) };
        let seq = u64::from_le_bytes(hdr[..8].try_into().unwrap());
        let len = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        (seq, len)
    }

    /// Append a message and return its sequence number.
    ///
    /// Evicts the oldest records as needed; never blocks on readers.
    /// Only the publisher holding the writer lock may call this.
    pub fn write(&self, data: &[u8]) -> Result<u64> {
        let header = self.header();
        let needed = align8(RECORD_HEADER_SIZE + data.len() as u64);
        if needed > self.capacity {
            return Err(IpcError::MessageTooLarge {
                capacity: self.capacity as usize,
                got: data.len(),
            });
        }

        let write_off = header.write_off.load(Ordering::Relaxed);
        let mut oldest_off = header.oldest_off.load(Ordering::Relaxed);
        let mut oldest_seq = header.oldest_seq.load(Ordering::Relaxed);

        // Walk the eviction frontier until the record fits. Reading the
        // evicted headers races with nothing: the writer is the sole
        // mutator and they are still committed records here.
        let mut evicted = false;
        while self.capacity - (write_off - oldest_off) < needed {
            let (seq, len) = self.record_header(oldest_off);
            debug_assert_eq!(seq, oldest_seq);
            oldest_off += align8(RECORD_HEADER_SIZE + len as u64);
            oldest_seq += 1;
            evicted = true;
        }

        let seq = header.write_seq.load(Ordering::Relaxed);
        let mut rec = [0u8; RECORD_HEADER_SIZE as usize];
        rec[..8].copy_from_slice(&seq.to_le_bytes());
        rec[8..12].copy_from_slice(&(data.len() as u32).to_le_bytes());

        // Increment to odd - ring mutation in progress
        header.data_version.fetch_add(1, Ordering::Release);

        if evicted {
            header.oldest_off.store(oldest_off, Ordering::Release);
            header.oldest_seq.store(oldest_seq, Ordering::Release);
        }

        unsafe {
            self.copy_in(write_off, &rec);
            self.copy_in(write_off + RECORD_HEADER_SIZE, data);
        }

        fence(Ordering::Release);

        // Increment to even - ring mutation complete
        header.data_version.fetch_add(1, Ordering::Release);

        header.latest_off.store(write_off, Ordering::Release);
        header.write_off.store(write_off + needed, Ordering::Release);
        header.write_seq.store(seq + 1, Ordering::Release);

        Ok(seq)
    }

    /// Read the next unseen message in strict order.
    ///
    /// Returns `None` when the cursor is at the tail. A cursor behind
    /// the retention window jumps to the oldest available message and
    /// counts the skipped messages as overruns.
    pub fn read_next(&self, cursor: &mut Cursor) -> Option<Vec<u8>> {
        let header = self.header();
        loop {
            let write_seq = header.write_seq.load(Ordering::Acquire);
            if cursor.next_seq >= write_seq {
                return None;
            }

            let oldest_seq = header.oldest_seq.load(Ordering::Acquire);
            if cursor.next_seq < oldest_seq {
                let skipped = oldest_seq - cursor.next_seq;
                cursor.overruns += skipped;
                cursor.next_seq = oldest_seq;
                cursor.off = header.oldest_off.load(Ordering::Acquire);
                trace!(
                    endpoint = %self.endpoint,
                    skipped,
                    "cursor behind retention window, resyncing to oldest"
                );
                continue;
            }

            // Seqlock read: version must be even and unchanged across
            // the copy for the bytes to be consistent
            let v1 = header.data_version.load(Ordering::Acquire);
            if v1 & 1 == 1 {
                core::hint::spin_loop();
                continue;
            }

            let (rec_seq, len) = self.record_header(cursor.off);
            if rec_seq != cursor.next_seq || len as u64 > self.capacity {
                // Raced with eviction; take a fresh snapshot
                continue;
            }

            let mut buf = vec![0u8; len as usize];
            unsafe { self.copy_out(cursor.off + RECORD_HEADER_SIZE, &mut buf) };

            fence(Ordering::Acquire);
            if header.data_version.load(Ordering::Acquire) != v1 {
                // Ring mutated mid-copy; the bytes may be torn
                core::hint::spin_loop();
                continue;
            }

            cursor.off += align8(RECORD_HEADER_SIZE + len as u64);
            cursor.next_seq += 1;
            return Some(buf);
        }
    }

    /// Read the newest message, discarding everything in between.
    ///
    /// Conflate-mode read: the cursor is advanced past the tail so a
    /// repeat call with no intervening write returns `None`.
    pub fn read_latest(&self, cursor: &mut Cursor) -> Option<Vec<u8>> {
        if cursor.next_seq >= self.write_seq() {
            return None;
        }
        let (buf, _seq, next_off, write_seq) = self.snapshot_latest()?;
        cursor.next_seq = write_seq;
        cursor.off = next_off;
        Some(buf)
    }

    /// The newest message and its sequence number, or `None` when the
    /// channel has never been written.
    pub fn latest(&self) -> Option<(Vec<u8>, u64)> {
        let (buf, seq, _, _) = self.snapshot_latest()?;
        Some((buf, seq))
    }

    fn snapshot_latest(&self) -> Option<(Vec<u8>, u64, u64, u64)> {
        let header = self.header();
        loop {
            let write_seq = header.write_seq.load(Ordering::Acquire);
            if write_seq == 0 {
                return None;
            }
            let target = write_seq - 1;
            let latest_off = header.latest_off.load(Ordering::Acquire);

            let v1 = header.data_version.load(Ordering::Acquire);
            if v1 & 1 == 1 {
                core::hint::spin_loop();
                continue;
            }

            let (rec_seq, len) = self.record_header(latest_off);
            if rec_seq != target || len as u64 > self.capacity {
                // Writer moved on; retry against the new tail
                continue;
            }

            let mut buf = vec![0u8; len as usize];
            unsafe { self.copy_out(latest_off + RECORD_HEADER_SIZE, &mut buf) };

            fence(Ordering::Acquire);
            if header.data_version.load(Ordering::Acquire) != v1 {
                core::hint::spin_loop();
                continue;
            }

            let next_off = latest_off + align8(RECORD_HEADER_SIZE + len as u64);
            return Some((buf, target, next_off, write_seq));
        }
    }

    // Single-writer lock

    /// Claim the channel's write slot.
    pub fn acquire_writer(&self) -> Result<()> {
        let pid = std::process::id();
        match self.header().writer_pid.compare_exchange(
            0,
            pid,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(holder) => {
                debug!(endpoint = %self.endpoint, holder, "publisher slot already taken");
                Err(IpcError::MultiplePublishers {
                    endpoint: self.endpoint.clone(),
                    holder,
                })
            }
        }
    }

    /// Release the write slot, allowing a future publisher to attach.
    pub fn release_writer(&self) {
        self.header().writer_pid.store(0, Ordering::Release);
    }

    // Reader slots

    /// Register a subscriber and return its slot index and generation.
    ///
    /// The pair, combined with the segment name, is what the publisher
    /// uses to address the subscriber's wakeup socket from any process.
    pub fn claim_reader_slot(&self) -> Result<(usize, u32)> {
        let header = self.header();
        for (idx, slot) in header.readers.iter().enumerate() {
            if slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_ACTIVE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(endpoint = %self.endpoint, idx, generation, "claimed reader slot");
                return Ok((idx, generation));
            }
        }
        Err(IpcError::TooManySubscribers {
            max: MAX_SUBSCRIBERS,
        })
    }

    /// Release a slot claimed with [`Self::claim_reader_slot`].
    pub fn release_reader_slot(&self, idx: usize) {
        self.header().readers[idx].state.store(SLOT_FREE, Ordering::Release);
    }

    /// Number of currently registered reader slots
    pub fn active_readers(&self) -> usize {
        self.header()
            .readers
            .iter()
            .filter(|s| s.state.load(Ordering::Acquire) == SLOT_ACTIVE)
            .count()
    }

    /// Slot index and generation of every registered subscriber, for
    /// addressing their wakeup sockets
    pub fn active_reader_slots(&self) -> Vec<(usize, u32)> {
        self.header()
            .readers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state.load(Ordering::Acquire) == SLOT_ACTIVE)
            .map(|(idx, s)| (idx, s.generation.load(Ordering::Acquire)))
            .collect()
    }
}
