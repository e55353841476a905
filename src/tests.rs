#![cfg(test)]
extern crate std;

use core::{cmp, ptr::NonNull};

use alloc::{boxed::Box, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{
    index, AllocError, AllocInitError, BuddyAllocator, BuddyConfig, FreeError, Global, HEADER_SIZE,
};

// Params ======================================================================

#[derive(Clone, Debug)]
struct BuddyParams {
    levels: u32,
    min_block_size: usize,
}

impl Arbitrary for BuddyParams {
    fn arbitrary(g: &mut Gen) -> Self {
        BuddyParams {
            levels: u32::arbitrary(g) % 9,
            // Deliberately includes sizes that are not powers of two.
            min_block_size: HEADER_SIZE + usize::arbitrary(g) % 61,
        }
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        let min_block_size = self.min_block_size;
        Box::new((0..self.levels).rev().map(move |levels| BuddyParams {
            levels,
            min_block_size,
        }))
    }
}

impl BuddyParams {
    fn config(&self) -> BuddyConfig {
        BuddyConfig::new(self.levels, self.min_block_size)
    }
}

// Ops =========================================================================

enum AllocatorOpTag {
    Allocate,
    Acquire,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate `size` bytes.
    Allocate { size: usize },
    /// Acquire a node on `level`, which may exceed the allocator's depth.
    Acquire { level: u32 },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 15;

fn limited_size(g: &mut Gen) -> usize {
    // Try to distribute allocations evenly between powers of two.
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[
                AllocatorOpTag::Allocate,
                AllocatorOpTag::Acquire,
                AllocatorOpTag::Free,
            ])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                size: limited_size(g),
            },
            AllocatorOpTag::Acquire => AllocatorOp::Acquire {
                level: u32::arbitrary(g) % 10,
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

// Checker =====================================================================

type OpId = u32;

enum AllocationKind {
    /// Returned by `allocate`; the first `len` bytes are painted with the id.
    Bytes { ptr: NonNull<u8>, len: usize },
    /// Returned by `acquire`.
    Node,
}

struct Allocation {
    id: OpId,
    node: usize,
    kind: AllocationKind,
}

fn paint(ptr: NonNull<u8>, len: usize, id: OpId) {
    let slice = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    for (byte, value) in slice.iter_mut().zip(id.to_le_bytes().into_iter().cycle()) {
        *byte = value;
    }
}

fn verify(ptr: NonNull<u8>, len: usize, id: OpId) -> bool {
    let slice = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) };
    slice
        .iter()
        .zip(id.to_le_bytes().into_iter().cycle())
        .all(|(&byte, value)| byte == value)
}

/// Returns `true` if `inner` is `outer` or one of its descendants.
fn contains(outer: usize, mut inner: usize) -> bool {
    while index::level(inner) > index::level(outer) {
        inner = index::parent(inner);
    }

    inner == outer
}

struct AllocatorChecker {
    allocator: BuddyAllocator<'static, Global>,
    allocations: Vec<Allocation>,
    num_ops: OpId,
}

impl AllocatorChecker {
    fn new(params: &BuddyParams) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: BuddyAllocator::try_new(params.config())?,
            allocations: Vec::new(),
            num_ops: 0,
        })
    }

    /// Whether `node` should be unavailable given the live allocations.
    fn model(&self, node: usize) -> bool {
        self.allocations
            .iter()
            .any(|a| contains(a.node, node) || contains(node, a.node))
    }

    fn map_matches_model(&self) -> bool {
        let map = self.allocator.occupancy();
        (0..map.num_nodes()).all(|n| map.get(n) == self.model(n))
    }

    fn snapshot(&self) -> Vec<bool> {
        let map = self.allocator.occupancy();
        (0..map.num_nodes()).map(|n| map.get(n)).collect()
    }

    /// The node the allocator must pick on `level`: the leftmost free one.
    fn expected_node(&self, level: u32) -> Option<usize> {
        let first = index::first_index_of_level(level);
        let end = index::first_index_of_level(level + 1);
        (first..end).find(|&n| !self.model(n))
    }

    fn block_range(&self, node: usize) -> (usize, usize) {
        let size = self.allocator.block_size(index::level(node));
        let start = index::offset_in_level(node) * size;
        (start, start + size)
    }

    fn overlaps_live(&self, node: usize) -> bool {
        let (start, end) = self.block_range(node);
        self.allocations.iter().any(|a| {
            let (a_start, a_end) = self.block_range(a.node);
            start < a_end && a_start < end
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        let ok = match op {
            AllocatorOp::Allocate { size } => self.allocate(op_id, size),
            AllocatorOp::Acquire { level } => self.acquire(op_id, level),
            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);
                self.free(a)
            }
        };

        ok && self.map_matches_model()
    }

    fn allocate(&mut self, op_id: OpId, size: usize) -> bool {
        let before = self.snapshot();
        let level = self.allocator.level_for(size);

        match self.allocator.allocate(size) {
            Ok(block) => {
                let level = match level {
                    Some(l) => l,
                    None => return false,
                };

                let ptr = block.cast::<u8>();
                let node = unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<u32>().read_unaligned() }
                    as usize;

                if Some(node) != self.expected_node(level)
                    || self.overlaps_live(node)
                    || block.len() != self.allocator.block_size(level) - HEADER_SIZE
                    || block.len() < size
                {
                    return false;
                }

                paint(ptr, size, op_id);
                self.allocations.push(Allocation {
                    id: op_id,
                    node,
                    kind: AllocationKind::Bytes { ptr, len: size },
                });

                true
            }

            Err(AllocError::TooLarge { .. }) => level.is_none() && self.snapshot() == before,

            Err(AllocError::Exhausted { level: l }) => {
                level == Some(l) && self.expected_node(l).is_none() && self.snapshot() == before
            }
        }
    }

    fn acquire(&mut self, op_id: OpId, level: u32) -> bool {
        let before = self.snapshot();
        let clamped = cmp::min(level, self.allocator.levels());
        let expected = self.expected_node(clamped);

        match self.allocator.acquire(level) {
            Some(node) => {
                if Some(node) != expected || self.overlaps_live(node) {
                    return false;
                }

                self.allocations.push(Allocation {
                    id: op_id,
                    node,
                    kind: AllocationKind::Node,
                });

                true
            }

            None => expected.is_none() && self.snapshot() == before,
        }
    }

    fn free(&mut self, a: Allocation) -> bool {
        let result = match a.kind {
            AllocationKind::Bytes { ptr, len } => {
                if !verify(ptr, len, a.id) {
                    return false;
                }

                unsafe { self.allocator.deallocate(ptr.as_ptr()) }
            }
            // SAFETY: `a.node` was returned by `acquire` and is still live.
            AllocationKind::Node => unsafe { self.allocator.release(a.node) },
        };

        if result.is_err() {
            return false;
        }

        // Freeing again must be caught and must not touch the map.
        let after = self.snapshot();
        let again = match a.kind {
            AllocationKind::Bytes { ptr, .. } => unsafe { self.allocator.deallocate(ptr.as_ptr()) },
            // Already free, so this is reported rather than trusted.
            AllocationKind::Node => unsafe { self.allocator.release(a.node) },
        };

        again == Err(FreeError::DoubleFree(a.node)) && self.snapshot() == after
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        while let Some(a) = self.allocations.pop() {
            if !self.free(a) || !self.map_matches_model() {
                return false;
            }
        }

        self.allocator.is_empty()
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 200;

#[cfg(miri)]
const MAX_TESTS: u64 = 10;

fn check(params: BuddyParams, ops: Vec<AllocatorOp>) -> bool {
    let mut checker = AllocatorChecker::new(&params).unwrap();
    checker.run(ops)
}

#[test]
fn occupancy_tracks_live_allocations() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check as fn(_, _) -> bool);
}

/// Allocates every size in turn, then frees the successful ones in an order
/// chosen by `order`.
fn round_trip(params: BuddyParams, sizes: Vec<u16>, order: Vec<usize>) -> bool {
    let mut checker = AllocatorChecker::new(&params).unwrap();

    for size in sizes {
        if !checker.do_op(AllocatorOp::Allocate { size: size.into() }) {
            return false;
        }
    }

    for (i, index) in order.into_iter().chain(0..).enumerate() {
        if checker.allocations.is_empty() {
            break;
        }

        if i > 10_000 || !checker.do_op(AllocatorOp::Free { index }) {
            return false;
        }
    }

    checker.allocator.is_empty() && checker.allocator.occupancy().is_clear()
}

#[test]
fn freeing_everything_clears_the_map() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(round_trip as fn(_, _, _) -> bool);
}

#[test]
fn scenario_frees_in_every_order() {
    let config = BuddyConfig::new(3, 16);
    let sizes = [50, 28, 11, 5];

    // All 24 permutations of the four frees.
    let mut perm = [0, 1, 2, 3];
    let mut seen = 0;
    loop {
        let mut buddy = BuddyAllocator::new(config);
        let ptrs: Vec<_> = sizes
            .iter()
            .map(|&s| buddy.allocate(s).unwrap().cast::<u8>())
            .collect();
        assert!(buddy.allocate(0).is_err());

        for &i in &perm {
            unsafe { buddy.deallocate(ptrs[i].as_ptr()).unwrap() };
        }
        assert!(buddy.is_empty(), "order {perm:?}");
        seen += 1;

        // Next lexicographic permutation.
        let i = match (0..3).rev().find(|&i| perm[i] < perm[i + 1]) {
            Some(i) => i,
            None => break,
        };
        let j = (i + 1..4).rev().find(|&j| perm[j] > perm[i]).unwrap();
        perm.swap(i, j);
        perm[i + 1..].reverse();
    }

    assert_eq!(seen, 24);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
