use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::HeapError;
use crate::tag::ALIGNMENT;
use crate::util::checked_round_up_to_multiple_of;

use super::{bump_brk, Arena};

/// An arena carved out of one up-front allocation from the global allocator,
/// mirroring a simulated `sbrk` over a fixed maximum heap.
pub struct FixedArena {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
}

impl FixedArena {

    pub fn new(capacity: usize) -> Result<Self, HeapError> {
        let capacity = checked_round_up_to_multiple_of(capacity, ALIGNMENT).ok_or(HeapError::TooLarge(capacity))?;
        if capacity == 0 {
            return Ok(Self {
                base: NonNull::<u64>::dangling().cast::<u8>(),
                capacity,
                brk: 0,
            });
        }
        let layout = Self::layout(capacity).ok_or(HeapError::TooLarge(capacity))?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(HeapError::OutOfMemory {
            requested: capacity,
            brk: 0,
            capacity: 0,
        })?;
        Ok(Self {
            base,
            capacity,
            brk: 0,
        })
    }

    #[inline]
    fn layout(capacity: usize) -> Option<Layout> {
        Layout::from_size_align(capacity, ALIGNMENT).ok()
    }

}

unsafe impl Arena for FixedArena {

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

impl Drop for FixedArena {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.capacity).filter(|_| self.capacity != 0) {
            unsafe { dealloc(self.base.as_ptr(), layout) };
        }
    }
}
