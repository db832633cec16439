use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use tagheap::{FixedArena, Heap, HeapConfig, HeapPtr, ALIGNMENT};

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Realloc(usize, usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..2048).prop_map(Op::Alloc),
        1 => (1usize..64).prop_map(Op::Alloc),
        3 => any::<usize>().prop_map(Op::Free),
        2 => (any::<usize>(), 0usize..3000).prop_map(|(idx, size)| Op::Realloc(idx, size)),
    ]
}

struct Live {
    ptr: HeapPtr,
    size: usize,
    fill: u8,
}

fn assert_disjoint(live: &[Live]) {
    let mut ranges: Vec<_> = live.iter().map(|l| (l.ptr.offset(), l.ptr.offset() + l.size)).collect();
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping payloads {:?} and {:?}", pair[0], pair[1]);
    }
}

fn assert_structure(heap: &Heap<FixedArena>) {
    heap.check().unwrap();
    let blocks: Vec<_> = heap.blocks().collect();
    for pair in blocks.windows(2) {
        assert!(pair[0].allocated || pair[1].allocated, "adjacent free blocks {:?}", pair);
    }
}

fn run_workload(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let config = HeapConfig::default().with_chunk_size(1024);
    let mut heap = Heap::with_config(FixedArena::new(4 << 20).unwrap(), config);
    // the structure checks below need the sentinels even before the first allocation.
    heap.init().unwrap();
    let mut live: Vec<Live> = Vec::new();
    let mut next_fill = 1u8;

    for op in ops {
        match op {
            Op::Alloc(size) => {
                let ptr = heap.allocate(size).unwrap();
                prop_assert_eq!(ptr.offset() % ALIGNMENT, 0);
                prop_assert!(heap.usable_size(ptr) >= size);
                heap.payload_mut(ptr)[..size].fill(next_fill);
                live.push(Live { ptr, size, fill: next_fill });
                next_fill = next_fill.wrapping_add(1);
            }
            Op::Free(idx) if !live.is_empty() => {
                let victim = live.swap_remove(idx % live.len());
                heap.deallocate(victim.ptr);
            }
            Op::Realloc(idx, size) if !live.is_empty() => {
                let idx = idx % live.len();
                let old_size = live[idx].size;
                let fill = live[idx].fill;
                match heap.reallocate(Some(live[idx].ptr), size).unwrap() {
                    Some(ptr) => {
                        prop_assert_eq!(ptr.offset() % ALIGNMENT, 0);
                        let kept = old_size.min(size);
                        prop_assert!(heap.payload(ptr)[..kept].iter().all(|b| *b == fill));
                        heap.payload_mut(ptr)[..size].fill(fill);
                        live[idx] = Live { ptr, size, fill };
                    }
                    None => {
                        prop_assert_eq!(size, 0);
                        live.swap_remove(idx);
                    }
                }
            }
            _ => {}
        }

        assert_structure(&heap);
        assert_disjoint(&live);
        for block in &live {
            prop_assert!(heap.payload(block.ptr)[..block.size].iter().all(|b| *b == block.fill));
        }
    }

    for block in live.drain(..) {
        heap.deallocate(block.ptr);
    }
    assert_structure(&heap);
    prop_assert_eq!(heap.stats().free_blocks, 1);
    Ok(())
}

#[test]
fn workloads_may_start_without_live_blocks() {
    run_workload(vec![Op::Free(0), Op::Realloc(3, 10), Op::Alloc(8), Op::Free(0)]).unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn random_workloads_keep_the_heap_consistent(ops in prop::collection::vec(arb_op(), 1..200)) {
        run_workload(ops)?;
    }

    #[test]
    fn fitting_requests_never_grow_the_heap(sizes in prop::collection::vec(1usize..512, 1..32)) {
        let mut heap = Heap::new(FixedArena::new(1 << 20).unwrap());
        let total: usize = sizes.iter().map(|size| size + 16).sum();
        // one big block that is freed again leaves room for everything below.
        let reserve = heap.allocate(total).unwrap();
        heap.allocate(1).unwrap();
        heap.deallocate(reserve);
        let growths = heap.growths();
        for size in sizes {
            heap.allocate(size).unwrap();
            prop_assert_eq!(heap.growths(), growths);
        }
    }
}
