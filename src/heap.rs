use std::fmt;

use log::{debug, trace, warn};

use crate::arena::{Arena, SystemArena};
use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::tag::{write_word, BlockRef, Tag, ALIGNMENT, BLOCK_OVERHEAD, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PROLOGUE_SIZE, WORD_SIZE};
use crate::util::{checked_round_up_to_multiple_of, max, min};

/// Offset of a payload inside the arena of a heap.
///
/// Payload offsets are always multiples of 8 and never 0.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HeapPtr(usize);

impl HeapPtr {

    #[inline]
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    #[inline]
    pub const fn offset(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn block(self) -> BlockRef {
        BlockRef::new(self.0)
    }

}

impl fmt::Display for HeapPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap+{:#x}", self.0)
    }
}

/// A boundary-tag heap with an implicit block list, first-fit placement and
/// immediate coalescing, growing inside the arena it owns.
///
/// Layout after bootstrap:
///
/// ```text
///  | pad | prologue hdr | prologue ftr | hdr  ...free...  ftr | epilogue hdr |
///  0     4              8              12   16                               brk
/// ```
pub struct Heap<A: Arena = SystemArena> {
    arena: A,
    config: HeapConfig,
    /// Payload offset of the prologue, present once the heap is bootstrapped.
    prologue: Option<BlockRef>,
    /// Prologue written by a bootstrap whose initial growth failed.
    sentinels: Option<BlockRef>,
    growths: usize,
}

impl Heap<SystemArena> {

    /// Creates a heap on a freshly reserved system arena of `config.max_heap` bytes.
    pub fn system(config: HeapConfig) -> Result<Self, HeapError> {
        Ok(Self::with_config(SystemArena::new(config.max_heap)?, config))
    }

}

impl<A: Arena> Heap<A> {

    pub fn new(arena: A) -> Self {
        Self::with_config(arena, HeapConfig::default())
    }

    pub fn with_config(arena: A, config: HeapConfig) -> Self {
        Self {
            arena,
            config: config.normalized(),
            prologue: None,
            sentinels: None,
            growths: 0,
        }
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[inline]
    pub fn arena(&self) -> &A {
        &self.arena
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.prologue.is_some()
    }

    /// Number of bytes currently claimed from the arena.
    #[inline]
    pub fn heap_size(&self) -> usize {
        self.arena.brk()
    }

    /// Number of successful heap growths, including the one done by bootstrap.
    #[inline]
    pub fn growths(&self) -> usize {
        self.growths
    }

    #[inline]
    pub(crate) fn prologue(&self) -> Option<BlockRef> {
        self.prologue
    }

    #[inline]
    pub(crate) fn mem(&self) -> &[u8] {
        self.arena.bytes()
    }

    #[inline]
    pub(crate) fn mem_mut(&mut self) -> &mut [u8] {
        self.arena.bytes_mut()
    }

    /// Lays down the prologue and epilogue sentinels and seeds the heap with
    /// one chunk of free space. Does nothing on an initialized heap.
    pub fn init(&mut self) -> Result<(), HeapError> {
        if self.prologue.is_some() {
            return Ok(());
        }
        // a failed growth leaves the sentinels and the epilogue intact, so a
        // retry picks them up instead of claiming fresh words.
        let prologue = match self.sentinels {
            Some(prologue) => prologue,
            None => {
                let low = self.arena.extend(4 * WORD_SIZE)?;
                let mem = self.mem_mut();
                write_word(mem, low, Tag::from_raw(0));
                write_word(mem, low + WORD_SIZE, Tag::pack(PROLOGUE_SIZE, true));
                write_word(mem, low + 2 * WORD_SIZE, Tag::pack(PROLOGUE_SIZE, true));
                write_word(mem, low + 3 * WORD_SIZE, Tag::EPILOGUE);
                let prologue = BlockRef::new(low + 2 * WORD_SIZE);
                self.sentinels = Some(prologue);
                prologue
            }
        };

        self.extend_heap(self.config.chunk_size)?;
        self.prologue = Some(prologue);
        debug!("bootstrapped heap with {} bytes", self.heap_size());
        Ok(())
    }

    /// Grows the arena by `size` bytes (rounded up to the alignment) and
    /// turns the new space into a free block, merged with a free tail block
    /// if there is one.
    fn extend_heap(&mut self, size: usize) -> Result<BlockRef, HeapError> {
        // tags are 32 bits wide, so the whole heap has to stay addressable by one.
        let brk = self.heap_size();
        let size = checked_round_up_to_multiple_of(size, ALIGNMENT)
            .filter(|size| brk.checked_add(*size).is_some_and(|end| end <= MAX_BLOCK_SIZE))
            .ok_or(HeapError::TooLarge(size))?;
        let old_brk = match self.arena.extend(size) {
            Ok(old_brk) => old_brk,
            Err(err) => {
                warn!("heap growth by {} bytes failed: {}", size, err);
                return Err(err);
            }
        };
        // the old epilogue header becomes the header of the new block.
        let block = BlockRef::new(old_brk);
        let mem = self.mem_mut();
        block.setup(mem, size, false);
        block.next(mem).write_header(mem, Tag::EPILOGUE);
        self.growths += 1;
        debug!("grew heap by {} bytes to {} bytes", size, self.heap_size());
        Ok(self.coalesce(block))
    }

    /// Merges the free `block` with its free neighbours and returns the
    /// resulting block.
    fn coalesce(&mut self, block: BlockRef) -> BlockRef {
        let mem = self.mem_mut();
        let prev_allocated = block.read_prev_footer(mem).is_allocated();
        let next = block.next(mem);
        let next_allocated = next.is_allocated(mem);
        let size = block.read_size(mem);

        match (prev_allocated, next_allocated) {
            (true, true) => block,
            (true, false) => {
                let merged = size + next.read_size(mem);
                block.setup(mem, merged, false);
                block
            }
            (false, true) => {
                let prev = block.prev(mem);
                let merged = prev.read_size(mem) + size;
                prev.setup(mem, merged, false);
                prev
            }
            (false, false) => {
                let prev = block.prev(mem);
                let merged = prev.read_size(mem) + size + next.read_size(mem);
                prev.setup(mem, merged, false);
                prev
            }
        }
    }

    /// Block size needed to serve a request of `size` payload bytes.
    fn adjusted_size(size: usize) -> Result<usize, HeapError> {
        size.checked_add(BLOCK_OVERHEAD)
            .and_then(|size| checked_round_up_to_multiple_of(size, ALIGNMENT))
            .filter(|size| *size <= MAX_BLOCK_SIZE)
            .map(|size| max(size, MIN_BLOCK_SIZE))
            .ok_or(HeapError::TooLarge(size))
    }

    /// First fit: the lowest addressed free block of at least `size` bytes.
    fn find_fit(&self, size: usize) -> Option<BlockRef> {
        let mem = self.mem();
        let mut block = self.prologue?.next(mem);
        loop {
            let header = block.read_header(mem);
            if header.size() == 0 {
                return None;
            }
            if header.is_free() && header.size() >= size {
                return Some(block);
            }
            block = block.next(mem);
        }
    }

    /// Marks `size` bytes of the free `block` as allocated and splits off
    /// the rest as a new free block if it can stand on its own.
    fn place(&mut self, block: BlockRef, size: usize) {
        let mem = self.mem_mut();
        let free_size = block.read_size(mem);
        debug_assert!(free_size >= size);
        if free_size - size >= MIN_BLOCK_SIZE {
            block.setup(mem, size, true);
            block.next(mem).setup(mem, free_size - size, false);
        } else {
            block.setup(mem, free_size, true);
        }
    }

    /// Allocates a block with room for at least `size` bytes.
    ///
    /// Bootstraps the heap on first use. Zero-sized requests are rejected
    /// before anything else happens.
    pub fn allocate(&mut self, size: usize) -> Result<HeapPtr, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        self.init()?;
        let needed = Self::adjusted_size(size)?;
        let block = match self.find_fit(needed) {
            Some(block) => block,
            None => self.extend_heap(max(needed, self.config.chunk_size))?,
        };
        self.place(block, needed);
        let ptr = HeapPtr::new(block.into_raw());
        trace!("allocate({}) -> {}", size, ptr);
        Ok(ptr)
    }

    /// Returns the block of `ptr` to the heap.
    ///
    /// `ptr` has to come from this heap and must not have been freed since.
    /// This is not checked: violating it corrupts the heap metadata.
    pub fn deallocate(&mut self, ptr: HeapPtr) {
        if self.prologue.is_none() {
            warn!("ignoring deallocate({}) on an uninitialized heap", ptr);
            return;
        }
        let block = ptr.block();
        let mem = self.mem_mut();
        let size = block.read_size(mem);
        block.setup(mem, size, false);
        self.coalesce(block);
        trace!("deallocate({})", ptr);
    }

    /// Resizes an allocation by moving it into a new block.
    ///
    /// `reallocate(None, size)` is `allocate(size)`; `reallocate(ptr, 0)` frees
    /// `ptr` and returns `None`. Otherwise the first `min(size, old capacity)`
    /// bytes are copied over and the old block is freed. On failure the old
    /// block is left untouched.
    pub fn reallocate(&mut self, ptr: Option<HeapPtr>, size: usize) -> Result<Option<HeapPtr>, HeapError> {
        if size == 0 {
            if let Some(ptr) = ptr {
                self.deallocate(ptr);
            }
            return Ok(None);
        }
        let Some(old) = ptr else {
            return self.allocate(size).map(Some);
        };
        let new = self.allocate(size)?;
        let mem = self.mem_mut();
        let len = min(size, old.block().payload_capacity(mem));
        mem.copy_within(old.offset()..old.offset() + len, new.offset());
        self.deallocate(old);
        trace!("reallocate({}, {}) -> {}", old, size, new);
        Ok(Some(new))
    }

    /// Number of payload bytes usable through `ptr`, at least the requested size.
    #[inline]
    pub fn usable_size(&self, ptr: HeapPtr) -> usize {
        ptr.block().payload_capacity(self.mem())
    }

    /// The caller-owned bytes of the allocated block at `ptr`.
    #[inline]
    pub fn payload(&self, ptr: HeapPtr) -> &[u8] {
        let len = self.usable_size(ptr);
        &self.mem()[ptr.offset()..ptr.offset() + len]
    }

    #[inline]
    pub fn payload_mut(&mut self, ptr: HeapPtr) -> &mut [u8] {
        let len = self.usable_size(ptr);
        &mut self.mem_mut()[ptr.offset()..ptr.offset() + len]
    }

    /// The address of `ptr`'s payload. It stays valid for as long as the heap lives.
    #[inline]
    pub fn as_mut_ptr(&self, ptr: HeapPtr) -> *mut u8 {
        self.arena.base().as_ptr().wrapping_add(ptr.offset())
    }

    /// Maps an address handed out by `as_mut_ptr` back to its offset.
    /// Returns `None` for addresses outside of the heap.
    pub fn ptr_from_raw(&self, raw: *const u8) -> Option<HeapPtr> {
        let offset = (raw as usize).checked_sub(self.arena.base().as_ptr() as usize)?;
        if offset < self.heap_size() {
            Some(HeapPtr::new(offset))
        } else {
            None
        }
    }

}
