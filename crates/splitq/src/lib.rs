//! # splitq
//!
//! An unbounded lock-free multi-producer multi-consumer FIFO queue that
//! reclaims nodes with split reference counting.
//!
//! Each node carries an internal/external reference counter, and every
//! shared pointer to a node (`head`, `tail`, a node's `next`) carries a use
//! count in the same atomic word. Threads "check out" a pointer by bumping
//! its use count before dereferencing it, so a node is never freed while
//! any thread may still touch it, and no thread ever waits for another.
//!
//! ## Modules
//!
//! - `counted`: tagged node pointers and the reference counting protocol
//! - `arena`: segmented node storage addressed by 32-bit index
//! - `queue`: [`SplitQueue`], push/pop with helping
//! - `kani_proofs`: bounded model checking harnesses (under `#[cfg(kani)]`)
//!
//! ## Verification
//!
//! Unit and threaded tests run with `cargo test -p splitq`. Exhaustive
//! interleaving checks run under loom:
//!
//! ```bash
//! RUSTFLAGS="--cfg loom" cargo test -p splitq --lib --release
//! ```

mod arena;
mod counted;
mod error;
pub mod kani_proofs;
mod loom;
mod queue;

pub use arena::ReclaimStats;
pub use error::AllocError;
pub use queue::SplitQueue;

/// Abort on a broken reclamation invariant.
///
/// Continuing would mean touching memory the protocol can no longer vouch
/// for, so there is no recovery path.
#[cold]
#[inline(never)]
pub(crate) fn invariant_violated(what: &str) -> ! {
    tracing::error!(invariant = what, "queue invariant violated, aborting");
    eprintln!("splitq: invariant violated: {}", what);
    std::process::abort()
}
