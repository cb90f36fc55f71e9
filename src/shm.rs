//! Low-level segment backing for channels
//!
//! Real channels live in POSIX shared memory. The fake-event harness runs
//! channels on private heap allocations with the same layout, so tests
//! exercise the ring logic without any shared-memory traffic.

use crate::error::{IpcError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::alloc::Layout;
use std::ffi::CString;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

const SHM_PREFIX: &str = "/shmbus_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// How long an attacher waits for the creator to size a fresh segment
const SIZE_WAIT: Duration = Duration::from_millis(250);

/// Where a channel's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// POSIX shared memory, visible to other processes
    Shared,
    /// Process-private heap allocation (fake-event harness)
    Private,
}

/// Handle to a POSIX shared memory region
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the region is only ever mutated through atomic operations or
// under the channel's single-writer protocol.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create or attach to a shared memory region.
    ///
    /// Creation is attempted exclusively first; if the name already
    /// exists the existing region is opened and its on-disk size is
    /// used. Returns the segment and whether this call created it.
    pub fn create(name: &str, size: usize) -> Result<(Self, bool)> {
        if name.len() > MAX_NAME_LEN {
            return Err(IpcError::EndpointTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }

        let full_name = format!("{}{}", SHM_PREFIX, name);
        let c_name = CString::new(full_name).unwrap();

        let (fd, created) = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH,
        ) {
            Ok(fd) => (fd, true),
            Err(_) => {
                // Already exists, attach to it
                let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(
                    |e| IpcError::ShmOpen {
                        name: name.to_string(),
                        source: e.into(),
                    },
                )?;
                (fd, false)
            }
        };

        let size = if created {
            ftruncate(&fd, size as u64).map_err(|e| IpcError::Truncate(e.into()))?;
            size
        } else {
            // The creator sizes the region right after shm_open made the
            // name visible; a concurrent attacher can catch it at zero
            let deadline = Instant::now() + SIZE_WAIT;
            loop {
                let stat = rustix::fs::fstat(&fd).map_err(|e| IpcError::ShmOpen {
                    name: name.to_string(),
                    source: e.into(),
                })?;
                if stat.st_size > 0 {
                    break stat.st_size as usize;
                }
                if Instant::now() >= deadline {
                    return Err(IpcError::ShmOpen {
                        name: name.to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "segment was never sized by its creator",
                        ),
                    });
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        };

        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| IpcError::Mmap(e.into()))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).expect("mmap returned null");

        if created {
            // Fresh ftruncated pages are zero already; make it explicit
            unsafe {
                std::ptr::write_bytes(addr.as_ptr(), 0, size);
            }
        }

        Ok((
            Self {
                fd,
                addr,
                size,
                name: name.to_string(),
                is_owner: created,
            },
            created,
        ))
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created (and will unlink) the region
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        // The creator unlinks; attached processes keep their mappings
        // until they unmap, per POSIX shared-memory semantics.
        if self.is_owner {
            let full_name = format!("{}{}", SHM_PREFIX, self.name);
            if let Ok(c_name) = CString::new(full_name) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}

/// Process-private segment with the same layout guarantees as shm
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: same synchronization rules as ShmSegment.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

impl HeapSegment {
    pub fn new(size: usize) -> Result<Self> {
        let layout =
            Layout::from_size_align(size, 64).map_err(|_| IpcError::Alloc { size })?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(IpcError::Alloc { size })?;
        Ok(Self { ptr, layout })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        unsafe {
            std::alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

/// A channel's backing memory, shared or private
pub enum Segment {
    Shm(ShmSegment),
    Heap(HeapSegment),
}

impl Segment {
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        match self {
            Segment::Shm(s) => s.as_ptr(),
            Segment::Heap(h) => h.as_ptr(),
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        match self {
            Segment::Shm(s) => s.size(),
            Segment::Heap(h) => h.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_attach() {
        let name = "shmbus_test_shm_create";
        let size = 4096;

        let (shm1, created) = ShmSegment::create(name, size).unwrap();
        assert!(created);
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        // Attach from another handle, as a second process would
        let (shm2, created) = ShmSegment::create(name, size).unwrap();
        assert!(!created);
        assert!(!shm2.is_owner());

        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(shm2);
        drop(shm1);
    }

    #[test]
    fn test_name_length_limit() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            ShmSegment::create(&name, 4096),
            Err(IpcError::EndpointTooLong { .. })
        ));
    }

    #[test]
    fn test_heap_segment_zeroed() {
        let seg = HeapSegment::new(4096).unwrap();
        assert_eq!(seg.size(), 4096);
        let first = unsafe { std::ptr::read(seg.as_ptr()) };
        assert_eq!(first, 0);
    }
}
