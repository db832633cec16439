//! Replaying of allocation traces.
//!
//! A trace is a text file with one request per line:
//!
//! ```text
//! # comment
//! a <id> <size>    allocate <size> bytes and name the block <id>
//! r <id> <size>    reallocate block <id> to <size> bytes
//! f <id>           free block <id>
//! ```
//!
//! Replaying fills every payload with a pattern derived from its id and
//! verifies the pattern is still intact whenever the block is touched again,
//! so blocks handed out twice or clobbered tags show up as corruption.

use std::collections::HashMap;

use log::{debug, info};
use thiserror::Error;

use crate::arena::Arena;
use crate::error::{HeapError, Violation};
use crate::heap::{Heap, HeapPtr};
use crate::tag::ALIGNMENT;
use crate::util::{max, min};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TraceOp {
    Alloc { id: usize, size: usize },
    Realloc { id: usize, size: usize },
    Free { id: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },
    #[error("op {op}: block {id} is already live")]
    DuplicateId { op: usize, id: usize },
    #[error("op {op}: block {id} is not live")]
    UnknownId { op: usize, id: usize },
    #[error("op {op}: payload of block {id} was overwritten")]
    Corrupted { op: usize, id: usize },
    #[error("op {op}: block {id} overlaps a live block")]
    Overlap { op: usize, id: usize },
    #[error("op {op}: {source}")]
    Heap { op: usize, source: HeapError },
    #[error("op {op}: heap check failed: {source}")]
    Check { op: usize, source: Violation },
}

#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct ReplayReport {
    pub ops: usize,
    /// Largest sum of requested payload sizes live at the same time.
    pub peak_live_bytes: usize,
    pub heap_size: usize,
    pub growths: usize,
}

impl ReplayReport {

    /// Peak live payload relative to the final heap size.
    pub fn utilization(&self) -> f64 {
        if self.heap_size == 0 {
            return 0.0;
        }
        self.peak_live_bytes as f64 / self.heap_size as f64
    }

}

pub fn parse(src: &str) -> Result<Vec<TraceOp>, TraceError> {
    let mut ops = Vec::new();
    for (idx, line) in src.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let kind = parts.next().unwrap_or("");
        let mut num = |what: &str| -> Result<usize, TraceError> {
            let raw = parts.next().ok_or_else(|| TraceError::Parse {
                line: line_no,
                msg: format!("missing {}", what),
            })?;
            raw.parse().map_err(|err| TraceError::Parse {
                line: line_no,
                msg: format!("invalid {} {:?}: {}", what, raw, err),
            })
        };
        let op = match kind {
            "a" => TraceOp::Alloc { id: num("id")?, size: num("size")? },
            "r" => TraceOp::Realloc { id: num("id")?, size: num("size")? },
            "f" => TraceOp::Free { id: num("id")? },
            other => {
                return Err(TraceError::Parse {
                    line: line_no,
                    msg: format!("unknown request {:?}", other),
                })
            }
        };
        if let Some(extra) = parts.next() {
            return Err(TraceError::Parse {
                line: line_no,
                msg: format!("unexpected {:?}", extra),
            });
        }
        ops.push(op);
    }
    Ok(ops)
}

#[inline]
fn pattern(id: usize, idx: usize) -> u8 {
    (id.wrapping_mul(31) ^ idx) as u8
}

#[derive(Copy, Clone)]
struct Live {
    ptr: HeapPtr,
    size: usize,
}

struct Replayer<'h, A: Arena> {
    heap: &'h mut Heap<A>,
    live: HashMap<usize, Live>,
    live_bytes: usize,
    check: bool,
}

impl<'h, A: Arena> Replayer<'h, A> {

    fn fill(&mut self, id: usize, block: Live, from: usize) {
        let payload = self.heap.payload_mut(block.ptr);
        for (idx, byte) in payload[..block.size].iter_mut().enumerate().skip(from) {
            *byte = pattern(id, idx);
        }
    }

    fn verify(&self, op: usize, id: usize, block: Live, len: usize) -> Result<(), TraceError> {
        let payload = self.heap.payload(block.ptr);
        if payload[..len].iter().enumerate().all(|(idx, byte)| *byte == pattern(id, idx)) {
            Ok(())
        } else {
            Err(TraceError::Corrupted { op, id })
        }
    }

    /// New blocks must neither overlap live ones nor leave the heap.
    fn verify_placement(&self, op: usize, id: usize, block: Live) -> Result<(), TraceError> {
        let start = block.ptr.offset();
        let end = start + block.size;
        if start % ALIGNMENT != 0 || end > self.heap.heap_size() {
            return Err(TraceError::Overlap { op, id });
        }
        let overlaps = self.live.iter().any(|(other_id, other)| {
            *other_id != id && start < other.ptr.offset() + other.size && other.ptr.offset() < end
        });
        if overlaps {
            return Err(TraceError::Overlap { op, id });
        }
        Ok(())
    }

    fn step(&mut self, op_idx: usize, op: TraceOp) -> Result<(), TraceError> {
        let heap_err = |source| TraceError::Heap { op: op_idx, source };
        match op {
            TraceOp::Alloc { id, size } => {
                if self.live.contains_key(&id) {
                    return Err(TraceError::DuplicateId { op: op_idx, id });
                }
                let ptr = self.heap.allocate(size).map_err(heap_err)?;
                let block = Live { ptr, size };
                self.verify_placement(op_idx, id, block)?;
                self.fill(id, block, 0);
                self.live.insert(id, block);
                self.live_bytes += size;
            }
            TraceOp::Realloc { id, size } => {
                let old = *self.live.get(&id).ok_or(TraceError::UnknownId { op: op_idx, id })?;
                self.verify(op_idx, id, old, old.size)?;
                match self.heap.reallocate(Some(old.ptr), size).map_err(heap_err)? {
                    Some(ptr) => {
                        let block = Live { ptr, size };
                        self.verify_placement(op_idx, id, block)?;
                        self.verify(op_idx, id, block, min(old.size, size))?;
                        self.fill(id, block, min(old.size, size));
                        self.live.insert(id, block);
                        self.live_bytes = self.live_bytes - old.size + size;
                    }
                    None => {
                        self.live.remove(&id);
                        self.live_bytes -= old.size;
                    }
                }
            }
            TraceOp::Free { id } => {
                let old = self.live.remove(&id).ok_or(TraceError::UnknownId { op: op_idx, id })?;
                self.verify(op_idx, id, old, old.size)?;
                self.heap.deallocate(old.ptr);
                self.live_bytes -= old.size;
            }
        }
        if self.check {
            self.heap.check().map_err(|source| TraceError::Check { op: op_idx, source })?;
        }
        Ok(())
    }

}

/// Runs `ops` against `heap`. With `check` set the heap is verified after every request.
pub fn replay<A: Arena>(heap: &mut Heap<A>, ops: &[TraceOp], check: bool) -> Result<ReplayReport, TraceError> {
    let mut replayer = Replayer {
        heap,
        live: HashMap::new(),
        live_bytes: 0,
        check,
    };
    let mut peak_live_bytes = 0;
    for (op_idx, op) in ops.iter().enumerate() {
        replayer.step(op_idx, *op)?;
        peak_live_bytes = max(peak_live_bytes, replayer.live_bytes);
    }
    debug!("replay left {} blocks live", replayer.live.len());
    let report = ReplayReport {
        ops: ops.len(),
        peak_live_bytes,
        heap_size: replayer.heap.heap_size(),
        growths: replayer.heap.growths(),
    };
    info!(
        "replayed {} ops: peak {} live bytes in a {} byte heap",
        report.ops, report.peak_live_bytes, report.heap_size
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::FixedArena;

    fn heap() -> Heap<FixedArena> {
        Heap::new(FixedArena::new(1 << 20).unwrap())
    }

    #[test]
    fn parses_requests_and_skips_comments() {
        let ops = parse("# warmup\na 0 100\n\nr 0 20 # shrink\nf 0\n").unwrap();
        assert_eq!(ops, vec![
            TraceOp::Alloc { id: 0, size: 100 },
            TraceOp::Realloc { id: 0, size: 20 },
            TraceOp::Free { id: 0 },
        ]);
    }

    #[test]
    fn reports_the_offending_line() {
        assert!(matches!(parse("a 0 1\nx 1\n"), Err(TraceError::Parse { line: 2, .. })));
        assert!(matches!(parse("a 0\n"), Err(TraceError::Parse { line: 1, .. })));
        assert!(matches!(parse("f zero\n"), Err(TraceError::Parse { line: 1, .. })));
        assert!(matches!(parse("f 0 1\n"), Err(TraceError::Parse { line: 1, .. })));
    }

    #[test]
    fn replays_a_small_trace() {
        let ops = parse("a 0 100\na 1 200\nf 0\na 2 50\nr 1 400\nf 2\nf 1\n").unwrap();
        let mut heap = heap();
        let report = replay(&mut heap, &ops, true).unwrap();
        assert_eq!(report.ops, 7);
        // live bytes run 100, 300, 200, 250, 450, 400, 0.
        assert_eq!(report.peak_live_bytes, 450);
        assert_eq!(report.heap_size, 16 + 4096);
        assert_eq!(heap.stats().allocated_blocks, 0);
        assert!((report.utilization() - 450.0 / 4112.0).abs() < 1e-9);
    }

    #[test]
    fn peak_outlives_later_frees() {
        let ops = parse("a 0 500\nf 0\na 1 10\nr 1 20\n").unwrap();
        let mut heap = heap();
        let report = replay(&mut heap, &ops, true).unwrap();
        assert_eq!(report.ops, 4);
        assert_eq!(report.peak_live_bytes, 500);
        assert_eq!(heap.stats().allocated_blocks, 1);
    }

    #[test]
    fn rejects_misuse_of_ids() {
        let mut heap = heap();
        let ops = parse("a 0 8\na 0 8\n").unwrap();
        assert_eq!(replay(&mut heap, &ops, false), Err(TraceError::DuplicateId { op: 1, id: 0 }));
        let ops = parse("f 7\n").unwrap();
        assert_eq!(replay(&mut heap, &ops, false), Err(TraceError::UnknownId { op: 0, id: 7 }));
    }

    #[test]
    fn surfaces_heap_errors() {
        let mut heap = heap();
        let ops = parse("a 0 0\n").unwrap();
        assert_eq!(
            replay(&mut heap, &ops, false),
            Err(TraceError::Heap { op: 0, source: HeapError::ZeroSize })
        );
    }

    #[test]
    fn realloc_to_zero_frees() {
        let mut heap = heap();
        let ops = parse("a 0 64\nr 0 0\na 0 64\n").unwrap();
        let report = replay(&mut heap, &ops, true).unwrap();
        assert_eq!(report.peak_live_bytes, 64);
        assert_eq!(heap.stats().allocated_blocks, 1);
    }
}
