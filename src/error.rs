use thiserror::Error;

use crate::tag::Tag;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    #[error("zero-sized allocation request")]
    ZeroSize,
    #[error("request of {0} bytes exceeds the largest representable block")]
    TooLarge(usize),
    #[error("arena exhausted: cannot extend by {requested} bytes ({brk} of {capacity} bytes in use)")]
    OutOfMemory {
        requested: usize,
        brk: usize,
        capacity: usize,
    },
    #[error("failed to reserve {size} bytes of address space: {errno}")]
    Map {
        size: usize,
        errno: errno::Errno,
    },
}

/// A broken heap invariant found by `Heap::check`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("heap has not been initialized")]
    Uninitialized,
    #[error("bad prologue: header {header:?}, footer {footer:?}")]
    BadPrologue { header: Tag, footer: Tag },
    #[error("bad epilogue at offset {offset}: {tag:?}")]
    BadEpilogue { offset: usize, tag: Tag },
    #[error("block at offset {offset} is not aligned")]
    Misaligned { offset: usize },
    #[error("block at offset {offset} has invalid size {size}")]
    BadSize { offset: usize, size: usize },
    #[error("block at offset {offset} runs past the end of the heap ({brk})")]
    Overrun { offset: usize, brk: usize },
    #[error("block at offset {offset} has header {header:?} but footer {footer:?}")]
    TagMismatch { offset: usize, header: Tag, footer: Tag },
    #[error("free blocks at offsets {first} and {second} were not coalesced")]
    AdjacentFree { first: usize, second: usize },
}
