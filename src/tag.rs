use std::mem::size_of;

use static_assertions::const_assert;

// Every block carries one tag word in front of its payload (the header) and
// one at its very end (the footer). Both encode `size | ALLOCATED_FLAG`.
// Sizes are multiples of 8, so the low three bits are free for flags.

pub(crate) const WORD_SIZE: usize = size_of::<u32>();
pub(crate) const DOUBLE_WORD_SIZE: usize = WORD_SIZE * 2;
pub const ALIGNMENT: usize = 8;

/// Smallest block that can hold header, footer and an 8 byte payload.
pub const MIN_BLOCK_SIZE: usize = DOUBLE_WORD_SIZE * 2;

/// The prologue consists of a header and a footer only.
pub(crate) const PROLOGUE_SIZE: usize = DOUBLE_WORD_SIZE;

/// Per-block bookkeeping added to every request.
pub(crate) const BLOCK_OVERHEAD: usize = DOUBLE_WORD_SIZE;

const ALLOCATED_FLAG: u32 = 1 << 0;
const METADATA_MASK: u32 = (ALIGNMENT as u32) - 1;
const SIZE_MASK: u32 = !METADATA_MASK;

/// Largest block size a tag word can encode.
pub const MAX_BLOCK_SIZE: usize = SIZE_MASK as usize;

const_assert!(ALIGNMENT.is_power_of_two());
const_assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);
const_assert!(PROLOGUE_SIZE % ALIGNMENT == 0);
const_assert!(ALLOCATED_FLAG & SIZE_MASK == 0);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Tag(u32);

impl Tag {

    pub(crate) const EPILOGUE: Tag = Tag::pack(0, true);

    /// `size` has to be a multiple of `ALIGNMENT` no larger than `MAX_BLOCK_SIZE`.
    #[inline]
    pub(crate) const fn pack(size: usize, allocated: bool) -> Self {
        debug_assert!(size % ALIGNMENT == 0 && size <= MAX_BLOCK_SIZE);
        let raw = size as u32;
        if allocated {
            Self(raw | ALLOCATED_FLAG)
        } else {
            Self(raw)
        }
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_FLAG != 0
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        !self.is_allocated()
    }

}

#[inline]
pub(crate) fn read_word(mem: &[u8], offset: usize) -> Tag {
    let mut raw = [0u8; WORD_SIZE];
    raw.copy_from_slice(&mem[offset..offset + WORD_SIZE]);
    Tag::from_raw(u32::from_ne_bytes(raw))
}

#[inline]
pub(crate) fn write_word(mem: &mut [u8], offset: usize, tag: Tag) {
    mem[offset..offset + WORD_SIZE].copy_from_slice(&tag.into_raw().to_ne_bytes());
}

/// A reference to a block, identified by the arena offset of its payload.
///
/// All navigation is done through the tags stored in the arena bytes,
/// so every accessor takes the arena slice it operates on. Indexing is
/// bounds checked: a corrupted tag leads to a panic instead of a wild access.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct BlockRef(usize);

impl BlockRef {

    #[inline]
    pub(crate) const fn new(payload: usize) -> Self {
        Self(payload)
    }

    #[inline]
    pub(crate) const fn into_raw(self) -> usize {
        self.0
    }

    #[inline]
    pub(crate) const fn header_offset(self) -> usize {
        self.0 - WORD_SIZE
    }

    /// The footer lives in the last word of the block.
    #[inline]
    pub(crate) const fn footer_offset(self, size: usize) -> usize {
        self.0 + size - DOUBLE_WORD_SIZE
    }

    #[inline]
    pub(crate) fn read_header(self, mem: &[u8]) -> Tag {
        read_word(mem, self.header_offset())
    }

    #[inline]
    pub(crate) fn read_footer(self, mem: &[u8]) -> Tag {
        read_word(mem, self.footer_offset(self.read_size(mem)))
    }

    #[inline]
    pub(crate) fn read_size(self, mem: &[u8]) -> usize {
        self.read_header(mem).size()
    }

    #[inline]
    pub(crate) fn is_allocated(self, mem: &[u8]) -> bool {
        self.read_header(mem).is_allocated()
    }

    #[inline]
    pub(crate) fn write_header(self, mem: &mut [u8], tag: Tag) {
        write_word(mem, self.header_offset(), tag);
    }

    /// Writes identical header and footer tags for a block of `size` bytes.
    #[inline]
    pub(crate) fn setup(self, mem: &mut [u8], size: usize, allocated: bool) {
        let tag = Tag::pack(size, allocated);
        write_word(mem, self.header_offset(), tag);
        write_word(mem, self.footer_offset(size), tag);
    }

    #[inline]
    pub(crate) fn next(self, mem: &[u8]) -> BlockRef {
        BlockRef(self.0 + self.read_size(mem))
    }

    /// Reads the predecessor's footer, which sits right in front of our header.
    #[inline]
    pub(crate) fn read_prev_footer(self, mem: &[u8]) -> Tag {
        read_word(mem, self.0 - DOUBLE_WORD_SIZE)
    }

    #[inline]
    pub(crate) fn prev(self, mem: &[u8]) -> BlockRef {
        BlockRef(self.0 - self.read_prev_footer(mem).size())
    }

    /// Number of bytes a caller may use inside an allocated block.
    #[inline]
    pub(crate) fn payload_capacity(self, mem: &[u8]) -> usize {
        self.read_size(mem) - BLOCK_OVERHEAD
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_packs_size_and_flag() {
        let tag = Tag::pack(4096, true);
        assert_eq!(tag.size(), 4096);
        assert!(tag.is_allocated());
        assert_eq!(tag.into_raw(), 4097);

        let free = Tag::pack(24, false);
        assert!(free.is_free());
        assert_eq!(free.size(), 24);
    }

    #[test]
    fn epilogue_is_an_allocated_zero_sized_tag() {
        assert_eq!(Tag::EPILOGUE.size(), 0);
        assert!(Tag::EPILOGUE.is_allocated());
    }

    #[test]
    fn setup_writes_matching_header_and_footer() {
        let mut mem = vec![0u8; 64];
        let block = BlockRef::new(8);
        block.setup(&mut mem, 32, false);
        assert_eq!(block.read_header(&mem), Tag::pack(32, false));
        assert_eq!(block.read_footer(&mem), Tag::pack(32, false));
        assert_eq!(read_word(&mem, 4 + 32 - WORD_SIZE), Tag::pack(32, false));
        assert_eq!(block.payload_capacity(&mem), 24);
    }

    #[test]
    fn navigates_between_neighbours() {
        let mut mem = vec![0u8; 64];
        let first = BlockRef::new(8);
        first.setup(&mut mem, 16, true);
        let second = first.next(&mem);
        assert_eq!(second.into_raw(), 24);
        second.setup(&mut mem, 24, false);
        assert_eq!(second.prev(&mem), first);
        assert_eq!(second.read_prev_footer(&mem), Tag::pack(16, true));
    }
}
