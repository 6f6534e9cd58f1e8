#![no_main]

use alloc_hater::{AllocatorOp, Evaluator};
use arbitrary::Arbitrary;
use kbuddy_hater::BuddySubject;
use libfuzzer_sys::fuzz_target;

const LEAF_SIZE: usize = 64;

const MAX_LEN: usize = 1 << 22;

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    len: usize,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let subject = match BuddySubject::<LEAF_SIZE>::new(args.len % MAX_LEN) {
        Ok(s) => s,
        Err(_) => return,
    };
    let initial = subject.stats();

    let mut eval = Evaluator::new(subject);
    if let Err(failed) = eval.evaluate(args.ops) {
        panic!("evaluation failed: {:?}", failed);
    }

    // Releasing every block restores the heap.
    assert_eq!(eval.into_subject().stats(), initial);
});
