#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use bitbuddy::{BuddyConfig, MAX_LEVELS};
use bitbuddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const MAX_MIN_BLOCK_SIZE: usize = 256;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    levels: u32,
    min_block_size: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let config = BuddyConfig::new(
        args.levels % MAX_LEVELS,
        args.min_block_size % MAX_MIN_BLOCK_SIZE,
    );

    // Undersized blocks are rejected at construction.
    let subject = match BuddySubject::new(config) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("{config:?}: {failed:?}");
    }
});
