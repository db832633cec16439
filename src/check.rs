use crate::arena::Arena;
use crate::error::Violation;
use crate::heap::{Heap, HeapPtr};
use crate::tag::{read_word, BlockRef, Tag, ALIGNMENT, MIN_BLOCK_SIZE, PROLOGUE_SIZE};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockInfo {
    pub ptr: HeapPtr,
    /// Block size including header and footer.
    pub size: usize,
    pub allocated: bool,
}

/// Walks the blocks between prologue and epilogue in address order.
pub struct Blocks<'a> {
    mem: &'a [u8],
    next: Option<BlockRef>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        let header = block.read_header(self.mem);
        if header.size() == 0 {
            self.next = None;
            return None;
        }
        self.next = Some(block.next(self.mem));
        Some(BlockInfo {
            ptr: HeapPtr::new(block.into_raw()),
            size: header.size(),
            allocated: header.is_allocated(),
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct HeapStats {
    pub heap_size: usize,
    pub growths: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

impl<A: Arena> Heap<A> {

    /// Iterates all blocks of the heap, empty if it was never initialized.
    pub fn blocks(&self) -> Blocks<'_> {
        let mem = self.mem();
        Blocks {
            mem,
            next: self.prologue().map(|prologue| prologue.next(mem)),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.heap_size(),
            growths: self.growths(),
            ..HeapStats::default()
        };
        for block in self.blocks() {
            if block.allocated {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += block.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            }
        }
        stats
    }

    /// Verifies the structural invariants of the whole heap and reports the
    /// first one found broken.
    ///
    /// Unlike the allocation paths this never trusts a tag before checking
    /// that it points inside the heap, so it is safe to run on a corrupted heap.
    pub fn check(&self) -> Result<(), Violation> {
        let prologue = self.prologue().ok_or(Violation::Uninitialized)?;
        let mem = self.mem();
        let brk = mem.len();

        let header = prologue.read_header(mem);
        let footer = read_word(mem, prologue.footer_offset(PROLOGUE_SIZE));
        if header != Tag::pack(PROLOGUE_SIZE, true) || header != footer {
            return Err(Violation::BadPrologue { header, footer });
        }

        let mut prev_free: Option<usize> = None;
        let mut block = prologue.next(mem);
        loop {
            let offset = block.into_raw();
            if offset > brk {
                return Err(Violation::Overrun { offset, brk });
            }
            let header = block.read_header(mem);
            if header.size() == 0 {
                if offset != brk || !header.is_allocated() {
                    return Err(Violation::BadEpilogue { offset: block.header_offset(), tag: header });
                }
                return Ok(());
            }
            if offset % ALIGNMENT != 0 {
                return Err(Violation::Misaligned { offset });
            }
            if header.size() < MIN_BLOCK_SIZE {
                return Err(Violation::BadSize { offset, size: header.size() });
            }
            // the next header has to fit in front of the break as well.
            if offset + header.size() > brk {
                return Err(Violation::Overrun { offset, brk });
            }
            let footer = block.read_footer(mem);
            if header != footer {
                return Err(Violation::TagMismatch { offset, header, footer });
            }
            if header.is_free() {
                if let Some(first) = prev_free {
                    return Err(Violation::AdjacentFree { first, second: offset });
                }
                prev_free = Some(offset);
            } else {
                prev_free = None;
            }
            block = block.next(mem);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FixedArena;
    use crate::tag::{write_word, WORD_SIZE};

    fn heap() -> Heap<FixedArena> {
        Heap::new(FixedArena::new(1 << 16).unwrap())
    }

    #[test]
    fn uninitialized_heap_has_no_blocks() {
        let heap = heap();
        assert_eq!(heap.blocks().count(), 0);
        assert_eq!(heap.check(), Err(Violation::Uninitialized));
        assert_eq!(heap.stats(), HeapStats::default());
    }

    #[test]
    fn walks_blocks_in_address_order() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(200).unwrap();
        let blocks: Vec<_> = heap.blocks().collect();
        assert_eq!(blocks, vec![
            BlockInfo { ptr: a, size: 112, allocated: true },
            BlockInfo { ptr: b, size: 208, allocated: true },
            BlockInfo { ptr: HeapPtr::new(336), size: 4096 - 320, allocated: false },
        ]);
        assert_eq!(heap.check(), Ok(()));
    }

    #[test]
    fn stats_sum_up_blocks() {
        let mut heap = heap();
        let a = heap.allocate(100).unwrap();
        heap.allocate(200).unwrap();
        heap.deallocate(a);
        let stats = heap.stats();
        assert_eq!(stats.heap_size, 16 + 4096);
        assert_eq!(stats.growths, 1);
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, 208);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, 4096 - 208);
        assert_eq!(stats.largest_free, 4096 - 320);
        assert_eq!(stats.allocated_bytes + stats.free_bytes + 16, stats.heap_size);
    }

    #[test]
    fn detects_clobbered_footer() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        heap.allocate(16).unwrap();
        // overflowing the payload by one word hits the footer.
        let footer = a.block().footer_offset(24);
        write_word(heap.mem_mut(), footer, Tag::from_raw(0xdead_beef));
        assert!(matches!(heap.check(), Err(Violation::TagMismatch { offset, .. }) if offset == a.offset()));
    }

    #[test]
    fn detects_uncoalesced_neighbours() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        let b = heap.allocate(16).unwrap();
        heap.allocate(16).unwrap();
        // flip the tags by hand, bypassing the coalescer.
        a.block().setup(heap.mem_mut(), 24, false);
        b.block().setup(heap.mem_mut(), 24, false);
        assert_eq!(heap.check(), Err(Violation::AdjacentFree { first: a.offset(), second: b.offset() }));
    }

    #[test]
    fn detects_broken_epilogue() {
        let mut heap = heap();
        heap.init().unwrap();
        let brk = heap.heap_size();
        write_word(heap.mem_mut(), brk - WORD_SIZE, Tag::pack(0, false));
        assert!(matches!(heap.check(), Err(Violation::BadEpilogue { .. })));
    }

    #[test]
    fn detects_runaway_sizes() {
        let mut heap = heap();
        let a = heap.allocate(16).unwrap();
        a.block().write_header(heap.mem_mut(), Tag::pack(1 << 20, true));
        assert!(matches!(heap.check(), Err(Violation::Overrun { .. })));
    }
}
