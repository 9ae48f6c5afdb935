//! Synchronization primitives, routed through `loom` under `--cfg loom`.
//!
//! Every atomic the queue touches comes from here so that loom can explore
//! all interleavings of the reclamation protocol:
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p splitq --lib --release
//! ```

#[cfg(loom)]
pub(crate) use ::loom::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

#[cfg(not(loom))]
pub(crate) use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

pub(crate) use crossbeam_utils::Backoff;

/// Called after a failed CAS before the next attempt.
#[inline]
pub(crate) fn retry(backoff: &Backoff) {
    #[cfg(loom)]
    {
        let _ = backoff;
        ::loom::thread::yield_now();
    }

    #[cfg(not(loom))]
    backoff.spin();
}
