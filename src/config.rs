use std::env;

use log::warn;

use crate::tag::{ALIGNMENT, MIN_BLOCK_SIZE};
use crate::util::{max, round_up_to_multiple_of};

/// Amount the heap grows by when bootstrapping or when no free block fits.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

/// Default capacity of the arena backing a heap.
pub const DEFAULT_MAX_HEAP: usize = 20 * (1 << 20);

pub const CHUNK_SIZE_VAR: &str = "TAGHEAP_CHUNK_SIZE";
pub const MAX_HEAP_VAR: &str = "TAGHEAP_MAX_HEAP";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Minimum number of bytes requested from the arena per growth.
    pub chunk_size: usize,
    /// Hard limit of the arena in bytes.
    pub max_heap: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_heap: DEFAULT_MAX_HEAP,
        }
    }
}

impl HeapConfig {

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self.normalized()
    }

    pub fn with_max_heap(mut self, max_heap: usize) -> Self {
        self.max_heap = max_heap;
        self
    }

    /// The defaults, overridden by `TAGHEAP_CHUNK_SIZE` and `TAGHEAP_MAX_HEAP`
    /// when they hold a valid byte count.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`HeapConfig::from_env`], with the variables resolved by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(chunk_size) = read_var(&lookup, CHUNK_SIZE_VAR) {
            config.chunk_size = chunk_size;
        }
        if let Some(max_heap) = read_var(&lookup, MAX_HEAP_VAR) {
            config.max_heap = max_heap;
        }
        config.normalized()
    }

    /// Growth chunks have to form valid free blocks on their own.
    pub fn normalized(mut self) -> Self {
        self.chunk_size = max(round_up_to_multiple_of(self.chunk_size, ALIGNMENT), MIN_BLOCK_SIZE);
        self
    }

}

fn read_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<usize> {
    let raw = lookup(name)?;
    match raw.trim().parse::<usize>() {
        Ok(val) => Some(val),
        Err(err) => {
            warn!("ignoring {}={:?}: {}", name, raw, err);
            None
        }
    }
}
