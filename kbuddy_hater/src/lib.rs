#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use kbuddy::{AllocInitError, BuddyHeap, Global, HeapStats};

pub struct BuddySubject<const LEAF_SIZE: usize>(BuddyHeap<LEAF_SIZE, Global>);

impl<const LEAF_SIZE: usize> BuddySubject<LEAF_SIZE> {
    pub fn new(len: usize) -> Result<Self, AllocInitError> {
        let b = BuddyHeap::try_new(len)?;
        Ok(BuddySubject(b))
    }

    pub fn stats(&self) -> HeapStats {
        self.0.stats()
    }
}

impl<const LEAF_SIZE: usize> Subject for BuddySubject<LEAF_SIZE> {
    type AllocError = kbuddy::AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.release(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};
    use arbitrary::{Arbitrary, Unstructured};

    use super::*;

    #[test]
    fn evaluate_scripted_ops() {
        let subject = BuddySubject::<16>::new(1 << 16).unwrap();
        let initial = subject.stats();

        let ops = vec![
            AllocatorOp::Alloc(16),
            AllocatorOp::Alloc(100),
            AllocatorOp::Alloc(4000),
            AllocatorOp::Dealloc(1),
            AllocatorOp::Alloc(0),
            AllocatorOp::Alloc(1 << 20),
            AllocatorOp::Dealloc(0),
            AllocatorOp::Alloc(17),
        ];

        let mut eval = Evaluator::new(subject);
        eval.evaluate(ops).unwrap();

        assert_eq!(eval.into_subject().stats(), initial);
    }

    #[test]
    fn evaluate_arbitrary_ops() {
        // A fixed byte pattern stands in for fuzzer input.
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut u = Unstructured::new(&data);
        let ops = Vec::<AllocatorOp>::arbitrary(&mut u).unwrap();

        let subject = BuddySubject::<64>::new(1 << 18).unwrap();
        let initial = subject.stats();

        let mut eval = Evaluator::new(subject);
        eval.evaluate(ops).unwrap();

        assert_eq!(eval.into_subject().stats(), initial);
    }
}
