use core::ffi::c_void;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::{null_mut, NonNull};

use libc::{c_int, off_t, size_t, sysconf, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE};
use log::{debug, error};

use crate::error::HeapError;
use crate::util::{checked_round_up_to_multiple_of, max};

use super::{bump_brk, Arena};

const NOT_PRESENT: usize = 0;

static OS_PAGE_SIZE: AtomicUsize = AtomicUsize::new(NOT_PRESENT);

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // the reservation is only backed by physical pages once it gets touched.
        const MAP_FLAGS: c_int = MAP_ANON | MAP_PRIVATE | libc::MAP_NORESERVE;
    } else {
        const MAP_FLAGS: c_int = MAP_ANON | MAP_PRIVATE;
    }
}

#[inline]
pub(crate) fn get_page_size() -> usize {
    let cached = OS_PAGE_SIZE.load(Ordering::Relaxed);
    if cached != NOT_PRESENT {
        return cached;
    }
    setup_page_size()
}

#[cold]
#[inline(never)]
fn setup_page_size() -> usize {
    let resolved = unsafe { sysconf(_SC_PAGESIZE) };
    // sysconf reports -1 if the value is unknown, fall back to the most common size.
    let resolved = if resolved > 0 { resolved as usize } else { 4096 };
    OS_PAGE_SIZE.store(resolved, Ordering::Relaxed);
    resolved
}

/// An arena backed by one anonymous private mapping reserved up front.
///
/// The whole capacity is mapped at construction, so the base never moves
/// and extending is pure bookkeeping.
pub struct MmapArena {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl MmapArena {

    pub fn new(capacity: usize) -> Result<Self, HeapError> {
        let page_size = get_page_size();
        let mapped = checked_round_up_to_multiple_of(max(capacity, 1), page_size)
            .ok_or(HeapError::TooLarge(capacity))?;
        let base = map_memory(mapped)?;
        debug!("reserved {} bytes of arena at {:p}", mapped, base);
        Ok(Self {
            base,
            capacity: mapped,
            brk: 0,
        })
    }

}

unsafe impl Arena for MmapArena {

    #[inline]
    fn extend(&mut self, incr: usize) -> Result<usize, HeapError> {
        bump_brk(&mut self.brk, self.capacity, incr)
    }

    #[inline]
    fn brk(&self) -> usize {
        self.brk
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn base(&self) -> NonNull<u8> {
        self.base
    }

}

impl Drop for MmapArena {
    fn drop(&mut self) {
        unmap_memory(self.base, self.capacity);
    }
}

fn map_memory(size: usize) -> Result<NonNull<u8>, HeapError> {
    let ptr = unsafe {
        libc::mmap(null_mut(), size as size_t, PROT_READ | PROT_WRITE, MAP_FLAGS, -1 as c_int, 0 as off_t)
    };
    if ptr == MAP_FAILED {
        return Err(HeapError::Map {
            size,
            errno: errno::errno(),
        });
    }
    NonNull::new(ptr.cast::<u8>()).ok_or(HeapError::Map {
        size,
        errno: errno::errno(),
    })
}

fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    let result = unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), size as size_t) };
    if result != 0 {
        // nothing sensible left to do with the mapping, leak it.
        error!("failed to unmap arena at {:p}: {}", ptr, errno::errno());
    }
}
