#![no_main]

use arbitrary::Arbitrary;
use bitbuddy::{BuddyAllocator, BuddyConfig, FreeError};
use libfuzzer_sys::fuzz_target;

const LEVELS: u32 = 6;
const MIN_BLOCK_SIZE: usize = 8;

#[derive(Clone, Debug, Arbitrary)]
enum NodeOp {
    Acquire(u8),
    Release(usize),
    ReleaseRaw(usize),
}

fuzz_target!(|ops: Vec<NodeOp>| {
    let mut alloc = BuddyAllocator::new(BuddyConfig::new(LEVELS, MIN_BLOCK_SIZE));
    let num_nodes = alloc.occupancy().num_nodes();

    let mut outstanding = Vec::new();

    for op in ops {
        match op {
            NodeOp::Acquire(level) => {
                if let Some(node) = alloc.acquire(level.into()) {
                    outstanding.push(node);
                }
            }

            NodeOp::Release(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let node = outstanding.swap_remove(raw_idx % outstanding.len());
                unsafe {
                    alloc.release(node).unwrap();
                    assert_eq!(
                        unsafe { alloc.release(node) },
                        Err(FreeError::DoubleFree(node))
                    );
                }
            }

            // Only nodes that are certainly free or outside the tree, so that
            // no live block is disturbed.
            NodeOp::ReleaseRaw(node) => {
                if node >= num_nodes {
                    assert_eq!(
                        unsafe { alloc.release(node) },
                        Err(FreeError::InvalidNode(node))
                    );
                } else if !alloc.occupancy().get(node) {
                    assert_eq!(
                        unsafe { alloc.release(node) },
                        Err(FreeError::DoubleFree(node))
                    );
                }
            }
        }
    }

    for node in outstanding {
        unsafe { alloc.release(node).unwrap() };
    }

    assert!(alloc.is_empty());
});
