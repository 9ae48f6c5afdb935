//! Kani proof harnesses for the split-count queue.
//!
//! These harnesses use bounded model checking to verify sequential
//! properties of the queue for all inputs up to a bound.
//!
//! # Running the proofs
//!
//! ```bash
//! # Run all proofs
//! cargo kani -p splitq
//!
//! # Run a specific proof
//! cargo kani -p splitq --harness proof_fifo_order
//! ```
//!
//! # Note on concurrency
//!
//! Kani doesn't execute threads. Interleavings are covered by the loom
//! tests in `queue.rs`; these proofs pin down the sequential contract and
//! the reference counts it leaves behind.

#[cfg(kani)]
mod proofs {
    use crate::SplitQueue;

    /// A pushed value comes straight back out.
    #[kani::proof]
    #[kani::unwind(4)]
    fn proof_pop_returns_pushed_value() {
        let queue = SplitQueue::new();
        let value: u64 = kani::any();

        queue.push(value).unwrap();
        let popped = queue.pop();

        kani::assert(popped == Some(value), "pop must return the pushed value");
    }

    /// Values leave in the order they arrived.
    #[kani::proof]
    #[kani::unwind(4)]
    fn proof_fifo_order() {
        let queue = SplitQueue::new();
        let v1: u64 = kani::any();
        let v2: u64 = kani::any();
        kani::assume(v1 != v2);

        queue.push(v1).unwrap();
        queue.push(v2).unwrap();

        kani::assert(queue.pop() == Some(v1), "first pushed must be first popped");
        kani::assert(queue.pop() == Some(v2), "second pushed must be second popped");
        kani::assert(queue.pop().is_none(), "queue must be empty afterwards");
    }

    /// An empty queue stays empty.
    #[kani::proof]
    #[kani::unwind(3)]
    fn proof_empty_pop_returns_none() {
        let queue: SplitQueue<u64> = SplitQueue::new();
        kani::assert(queue.pop().is_none(), "pop on empty queue must return None");
        kani::assert(queue.pop().is_none(), "repeated pop must return None");
        kani::assert(queue.is_empty(), "queue must report empty");
    }

    /// A drained queue holds only its sentinel.
    #[kani::proof]
    #[kani::unwind(4)]
    fn proof_drain_reclaims_nodes() {
        let queue = SplitQueue::new();
        let pushes: u8 = kani::any();
        kani::assume(pushes <= 2);

        for i in 0..pushes {
            queue.push(i).unwrap();
        }
        while queue.pop().is_some() {}

        kani::assert(queue.stats().live_nodes() == 1, "only the sentinel may remain");
    }
}
