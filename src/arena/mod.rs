use std::ptr::NonNull;
use std::slice;

use crate::error::HeapError;

mod fixed;

pub use fixed::FixedArena;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod mmap;

        pub use mmap::MmapArena;

        /// The arena used by the raw allocation functions of this crate.
        pub type SystemArena = MmapArena;
    } else {
        /// The arena used by the raw allocation functions of this crate.
        pub type SystemArena = FixedArena;
    }
}

/// Provider of the contiguous address space a heap lives in.
///
/// An arena hands out memory like `sbrk`: a fixed base address and a break
/// that only ever moves up. Construction corresponds to initializing the
/// arena, `extend` to moving its break.
///
/// # Safety
///
/// Implementors must guarantee that `base` stays valid and never moves for
/// the lifetime of the arena, that it is aligned to at least 8 bytes, that
/// the first `capacity` bytes behind it are initialized and writable, and
/// that `brk <= capacity` holds at all times.
pub unsafe trait Arena {

    /// Moves the break up by `incr` bytes and returns the previous break.
    /// Fails without side effects if the arena would exceed its capacity.
    fn extend(&mut self, incr: usize) -> Result<usize, HeapError>;

    /// Number of bytes handed out so far.
    fn brk(&self) -> usize;

    /// Hard limit of the arena in bytes.
    fn capacity(&self) -> usize;

    fn base(&self) -> NonNull<u8>;

    /// The bytes between the base and the current break.
    #[inline]
    fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base().as_ptr(), self.brk()) }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base().as_ptr(), self.brk()) }
    }

}

/// Shared break bookkeeping of the arenas in this module.
#[inline]
pub(crate) fn bump_brk(brk: &mut usize, capacity: usize, incr: usize) -> Result<usize, HeapError> {
    let old_brk = *brk;
    match old_brk.checked_add(incr) {
        Some(new_brk) if new_brk <= capacity => {
            *brk = new_brk;
            Ok(old_brk)
        }
        _ => Err(HeapError::OutOfMemory {
            requested: incr,
            brk: old_brk,
            capacity,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_brk_respects_capacity() {
        let mut brk = 0;
        assert_eq!(bump_brk(&mut brk, 32, 16), Ok(0));
        assert_eq!(bump_brk(&mut brk, 32, 16), Ok(16));
        assert_eq!(
            bump_brk(&mut brk, 32, 8),
            Err(HeapError::OutOfMemory { requested: 8, brk: 32, capacity: 32 })
        );
        assert_eq!(brk, 32);
    }

    #[test]
    fn bump_brk_rejects_overflowing_requests() {
        let mut brk = 8;
        assert!(bump_brk(&mut brk, usize::MAX, usize::MAX).is_err());
        assert_eq!(brk, 8);
    }
}
