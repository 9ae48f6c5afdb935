//! Invariant traits for verified concurrent structures.
//!
//! - `queue`: MPMC FIFO queue invariants (NoLostElements, NoDuplicates,
//!   NoPhantomElements, PerProducerOrder, FIFO_Order, Linearizability,
//!   Reclamation)

pub mod queue;
