//! # splitq-core
//!
//! Property checking for concurrent FIFO queues.
//!
//! This crate provides:
//! - `PropertyResult` and `PropertyChecker` for verifying invariants
//! - `Counterexample` for rendering failure paths
//! - `QueueProperties` / `QueuePropertyChecker`: the queue invariants
//! - `HistoryRecorder`: real-time operation histories from threaded runs
//! - `check_fifo_linearizable`: a Wing–Gong search over timed histories
//!
//! Nothing here depends on a particular queue implementation; a queue (or
//! a test harness wrapping one) exposes its observable state through
//! `QueueProperties` and the checker does the rest.

pub mod counterexample;
pub mod invariants;
pub mod linearizability;
pub mod property;
pub mod recorder;

pub use counterexample::{Counterexample, MemoryIssue, StateSnapshot, ThreadAction};
pub use invariants::queue::{
    QueueHistory, QueueObservation, QueueOpType, QueueOperation, QueueProperties,
    QueuePropertyChecker,
};
pub use linearizability::{check_fifo_linearizable, Linearizability};
pub use property::{PropertyChecker, PropertyResult};
pub use recorder::{HistoryRecorder, ThreadRecorder};
