//! A boundary-tag heap allocator.
//!
//! Blocks carry a size/allocated tag at both ends, are kept in one implicit
//! list threaded through their sizes, are handed out first fit and are
//! merged with free neighbours as soon as they are freed. The heap lives in
//! an [`Arena`] that only ever grows.
//!
//! [`Heap`] is the allocator itself and works on offsets into its arena.
//! The free functions of this crate (`alloc`, `free`, `realloc`) offer the
//! classic raw pointer interface on top of a heap owned by the calling thread.

use std::cell::RefCell;
use std::ptr::null_mut;

use log::warn;

mod util;
mod tag;
mod heap;
mod check;
pub mod arena;
pub mod config;
pub mod error;
pub mod trace;

pub use arena::{Arena, FixedArena, SystemArena};
pub use check::{BlockInfo, Blocks, HeapStats};
pub use config::HeapConfig;
pub use error::{HeapError, Violation};
pub use heap::{Heap, HeapPtr};
pub use tag::{Tag, ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

thread_local! {
    static HEAP: RefCell<Option<Heap<SystemArena>>> = const { RefCell::new(None) };
}

fn with_heap<R>(f: impl FnOnce(&mut Heap<SystemArena>) -> Result<R, HeapError>) -> Result<R, HeapError> {
    HEAP.with(|heap| {
        let mut heap = heap.borrow_mut();
        let heap = match &mut *heap {
            Some(heap) => heap,
            empty => empty.insert(Heap::system(HeapConfig::from_env())?),
        };
        heap.init()?;
        f(heap)
    })
}

/// Sets up the heap of the calling thread. Calling this is optional,
/// the first allocation does it as well.
pub fn init() -> Result<(), HeapError> {
    with_heap(|_| Ok(()))
}

/// Allocates `size` bytes aligned to 8 bytes.
/// Returns null for `size == 0` or if the heap cannot grow any further.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return null_mut();
    }
    with_heap(|heap| heap.allocate(size).map(|ptr| heap.as_mut_ptr(ptr))).unwrap_or(null_mut())
}

/// Frees `ptr`, doing nothing if it is null.
///
/// # Safety
///
/// `ptr` has to be null or returned by `alloc` or `realloc` on this thread
/// and not freed since.
pub unsafe fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let _ = with_heap(|heap| {
        match heap.ptr_from_raw(ptr) {
            Some(ptr) => heap.deallocate(ptr),
            None => warn!("ignoring free of foreign pointer {:p}", ptr),
        }
        Ok(())
    });
}

/// Moves the allocation at `ptr` into a block of `size` bytes, preserving
/// its contents up to the smaller of both sizes. A null `ptr` allocates,
/// a zero `size` frees and returns null. On failure null is returned and
/// `ptr` stays valid.
///
/// # Safety
///
/// Same requirements on `ptr` as for [`free`].
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return alloc(size);
    }
    with_heap(|heap| {
        let Some(old) = heap.ptr_from_raw(ptr) else {
            warn!("ignoring realloc of foreign pointer {:p}", ptr);
            return Ok(null_mut());
        };
        Ok(match heap.reallocate(Some(old), size)? {
            Some(new) => heap.as_mut_ptr(new),
            None => null_mut(),
        })
    })
    .unwrap_or(null_mut())
}
