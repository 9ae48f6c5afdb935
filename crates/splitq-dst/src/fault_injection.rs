//! Running a real queue with faults around each operation.
//!
//! A [`DstRunner`] owns the queue under test and calls it unchanged. Faults
//! land only at operation boundaries: before a push or pop starts (the
//! allocation fails or the caller dies) and after it takes effect (the
//! caller dies before seeing the result). Races inside an operation are
//! loom's job. What the runner adds is a [`QueueHistory`] of every
//! operation that took effect, so the queue properties can be checked
//! against it at any point.

use std::fmt;

use splitq_core::{
    PropertyChecker, PropertyResult, QueueHistory, QueueObservation, QueuePropertyChecker,
};

use crate::clock::SimClock;
use crate::fault::{FaultConfig, FaultInjector};
use crate::random::DeterministicRng;

/// Where a fault may strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    BeforeOperation,
    /// The operation took effect; its caller has not seen the result yet
    AfterOperation,
}

/// What a fault does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Memory allocation fails; the operation never starts
    AllocationFailure,
    /// The caller is gone; any effect already applied stays applied
    ThreadCrash,
    /// The simulated clock stalls
    Delay,
}

/// Trait for queues testable with DST.
///
/// Values are `u64` tags; every pushed tag must be unique within a run.
pub trait DstTestableQueue: Send + Sync {
    /// Error returned by a push that could not allocate.
    type Error: fmt::Debug;

    fn new() -> Self;
    fn push(&self, value: u64) -> Result<(), Self::Error>;
    fn pop(&self) -> Option<u64>;
    fn is_empty(&self) -> bool;
    /// Queued values, oldest first. Only called while no operation runs.
    fn contents(&mut self) -> Vec<u64>;

    /// Nodes currently allocated, for implementations that track them.
    fn live_nodes(&self) -> Option<u64> {
        None
    }
}

/// DST test runner for lock-free queues.
///
/// Wraps a queue, injects faults around each operation, and records every
/// operation that took effect into a [`QueueHistory`].
pub struct DstRunner<Q> {
    queue: Q,
    rng: DeterministicRng,
    fault_injector: FaultInjector,
    clock: SimClock,
    seed: u64,
    thread_id: u64,
    history: QueueHistory,
    // Statistics
    operations_count: u64,
    faults_injected: u64,
    abandoned_operations: u64,
    rejected_pushes: u64,
}

impl<Q: DstTestableQueue> DstRunner<Q> {
    /// Create a runner with the default fault rates.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_fault_config(seed, FaultConfig::default())
    }

    #[must_use]
    pub fn with_fault_config(seed: u64, config: FaultConfig) -> Self {
        debug_assert!(seed != 0, "Seed should not be zero");
        Self {
            queue: Q::new(),
            rng: DeterministicRng::new(seed.wrapping_add(3)),
            fault_injector: FaultInjector::new(DeterministicRng::new(seed.wrapping_add(4)), config),
            clock: SimClock::new(),
            seed,
            thread_id: 0,
            history: QueueHistory::new(),
            operations_count: 0,
            faults_injected: 0,
            abandoned_operations: 0,
            rejected_pushes: 0,
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Attribute subsequent operations to a simulated thread.
    pub fn set_thread(&mut self, thread_id: u64) {
        self.thread_id = thread_id;
    }

    #[must_use]
    pub fn queue(&self) -> &Q {
        &self.queue
    }

    #[must_use]
    pub fn history(&self) -> &QueueHistory {
        &self.history
    }

    /// Simulated time spent in injected delays.
    #[must_use]
    pub fn elapsed_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    fn next_step(&self) -> u64 {
        self.history.len() as u64 + 1
    }

    /// `Err` means the caller never saw success. The value may still be in
    /// the queue if the crash happened after the push took effect.
    pub fn push(&mut self, value: u64) -> Result<(), FaultType> {
        match self.maybe_inject_fault(FaultPoint::BeforeOperation) {
            Some(fault @ (FaultType::AllocationFailure | FaultType::ThreadCrash)) => {
                if fault == FaultType::ThreadCrash {
                    self.abandoned_operations += 1;
                }
                return Err(fault);
            }
            Some(FaultType::Delay) | None => {}
        }

        if let Err(error) = self.queue.push(value) {
            tracing::debug!(value, ?error, "push rejected by queue");
            self.rejected_pushes += 1;
            return Err(FaultType::AllocationFailure);
        }
        self.operations_count += 1;
        let step = self.next_step();
        self.history.record_push(self.thread_id, value, step);

        if let Some(FaultType::ThreadCrash) = self.maybe_inject_fault(FaultPoint::AfterOperation) {
            // The value IS in the queue; only the caller is gone.
            self.abandoned_operations += 1;
            return Err(FaultType::ThreadCrash);
        }

        Ok(())
    }

    /// `Err` means the caller never saw the result. A crash after the pop
    /// took effect still consumed the value.
    pub fn pop(&mut self) -> Result<Option<u64>, FaultType> {
        // A pop allocates nothing, so it can only crash.
        if let Some(FaultType::ThreadCrash) = self.maybe_inject_fault(FaultPoint::BeforeOperation)
        {
            self.abandoned_operations += 1;
            return Err(FaultType::ThreadCrash);
        }

        let result = self.queue.pop();
        self.operations_count += 1;
        let step = self.next_step();
        self.history.record_pop(self.thread_id, result, step);

        if let Some(FaultType::ThreadCrash) = self.maybe_inject_fault(FaultPoint::AfterOperation) {
            // Value was dequeued, but the caller crashes before using it.
            self.abandoned_operations += 1;
            return Err(FaultType::ThreadCrash);
        }

        Ok(result)
    }

    fn maybe_inject_fault(&mut self, point: FaultPoint) -> Option<FaultType> {
        if !self.fault_injector.should_fail() {
            return None;
        }
        self.faults_injected += 1;

        let fault = match (point, self.rng.gen_range(0..3)) {
            (FaultPoint::BeforeOperation, 0) => FaultType::AllocationFailure,
            (_, 1) => FaultType::ThreadCrash,
            _ => FaultType::Delay,
        };
        if fault == FaultType::Delay {
            let stall = self.rng.gen_range(1..=1_000u64);
            self.clock.advance_ns(stall);
        }
        tracing::trace!(?point, ?fault, thread = self.thread_id, "fault injected");
        Some(fault)
    }

    /// Capture the run so far for property checking.
    pub fn observe(&mut self) -> QueueObservation {
        let observed = QueueObservation::from_history(self.history.clone(), self.queue.contents());
        match self.queue.live_nodes() {
            Some(live) => observed.with_live_nodes(live),
            None => observed,
        }
    }

    /// Check every queue property against the run so far.
    pub fn check(&mut self) -> Vec<PropertyResult> {
        let observed = self.observe();
        QueuePropertyChecker::new(&observed)
            .with_seed(self.seed)
            .check_all()
    }

    /// Get statistics.
    #[must_use]
    pub fn stats(&self) -> DstStats {
        DstStats {
            seed: self.seed,
            operations_count: self.operations_count,
            faults_injected: self.faults_injected,
            abandoned_operations: self.abandoned_operations,
            rejected_pushes: self.rejected_pushes,
        }
    }
}

/// Counters from one runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstStats {
    pub seed: u64,
    pub operations_count: u64,
    pub faults_injected: u64,
    pub abandoned_operations: u64,
    pub rejected_pushes: u64,
}

impl DstStats {
    #[must_use]
    pub fn format(&self) -> String {
        format!(
            "DST_SEED={} ops={} faults={} abandoned={} rejected={}",
            self.seed,
            self.operations_count,
            self.faults_injected,
            self.abandoned_operations,
            self.rejected_pushes
        )
    }
}

/// DST operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstOp {
    Push(u64),
    Pop,
}

/// Run a DST scenario.
///
/// Replay `operations` on a fresh queue under default faults, then check
/// every property once.
pub fn run_dst_scenario<Q: DstTestableQueue>(seed: u64, operations: Vec<DstOp>) -> DstResult {
    let mut runner: DstRunner<Q> = DstRunner::new(seed);
    let mut fault_errors = Vec::new();

    for op in operations {
        let result = match op {
            DstOp::Push(v) => runner.push(v),
            DstOp::Pop => runner.pop().map(|_| ()),
        };

        // Faults are expected; they're part of the test
        if let Err(fault) = result {
            fault_errors.push(format!("{:?}", fault));
        }
    }

    let results = runner.check();
    let result = DstResult {
        passed: results.iter().all(|r| r.holds),
        results,
        stats: runner.stats(),
        fault_errors,
    };
    tracing::info!(
        passed = result.passed,
        seed,
        ops = result.stats.operations_count,
        faults = result.stats.faults_injected,
        "dst scenario finished"
    );
    result
}

/// DST result.
#[derive(Debug)]
pub struct DstResult {
    pub passed: bool,
    pub results: Vec<PropertyResult>,
    pub stats: DstStats,
    pub fault_errors: Vec<String>,
}

impl DstResult {
    #[must_use]
    pub fn format(&self) -> String {
        let status = if self.passed { "PASS" } else { "FAIL" };
        let mut result = format!("[{}] {}", status, self.stats.format());

        for violation in self.results.iter().filter(|r| !r.holds) {
            result.push_str(&format!("\n  VIOLATION: {}", violation));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Simple mock queue for testing the DST framework itself
    struct MockQueue {
        values: Mutex<VecDeque<u64>>,
    }

    impl DstTestableQueue for MockQueue {
        type Error = ();

        fn new() -> Self {
            Self {
                values: Mutex::new(VecDeque::new()),
            }
        }

        fn push(&self, value: u64) -> Result<(), ()> {
            self.values.lock().unwrap().push_back(value);
            Ok(())
        }

        fn pop(&self) -> Option<u64> {
            self.values.lock().unwrap().pop_front()
        }

        fn is_empty(&self) -> bool {
            self.values.lock().unwrap().is_empty()
        }

        fn contents(&mut self) -> Vec<u64> {
            self.values.lock().unwrap().iter().copied().collect()
        }
    }

    // Pops from the back: a stack posing as a queue.
    struct LifoQueue {
        values: Mutex<Vec<u64>>,
    }

    impl DstTestableQueue for LifoQueue {
        type Error = ();

        fn new() -> Self {
            Self {
                values: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, value: u64) -> Result<(), ()> {
            self.values.lock().unwrap().push(value);
            Ok(())
        }

        fn pop(&self) -> Option<u64> {
            self.values.lock().unwrap().pop()
        }

        fn is_empty(&self) -> bool {
            self.values.lock().unwrap().is_empty()
        }

        fn contents(&mut self) -> Vec<u64> {
            self.values.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_dst_runner_basic() {
        let mut runner: DstRunner<MockQueue> = DstRunner::new(12345);

        // Faulted operations are fine; only the properties matter.
        let _ = runner.push(1);
        let _ = runner.push(2);
        let _ = runner.pop();

        let results = runner.check();
        assert!(results.iter().all(|r| r.holds), "{:?}", results);
    }

    #[test]
    fn test_dst_scenario() {
        let ops = vec![
            DstOp::Push(100),
            DstOp::Push(200),
            DstOp::Pop,
            DstOp::Push(300),
        ];

        let result = run_dst_scenario::<MockQueue>(12345, ops);

        assert!(result.passed, "DST failed: {}", result.format());
    }

    #[test]
    fn test_determinism() {
        let ops = vec![DstOp::Push(1), DstOp::Push(2), DstOp::Pop];

        let result1 = run_dst_scenario::<MockQueue>(42, ops.clone());
        let result2 = run_dst_scenario::<MockQueue>(42, ops);

        // Faults come from the seed alone.
        assert_eq!(result1.stats, result2.stats);
        assert_eq!(result1.fault_errors, result2.fault_errors);
    }

    #[test]
    fn test_lifo_detected() {
        let mut runner: DstRunner<LifoQueue> = DstRunner::with_fault_config(7, FaultConfig::none());
        runner.push(1).unwrap();
        runner.push(2).unwrap();
        assert_eq!(runner.pop(), Ok(Some(2)));

        let failed: Vec<&str> = runner
            .check()
            .iter()
            .filter(|r| !r.holds)
            .map(|r| r.name)
            .collect();
        assert!(failed.contains(&"FIFO_Order"));
        assert!(failed.contains(&"Linearizability"));
    }

    #[test]
    fn test_crash_after_push_keeps_value() {
        let config = FaultConfig {
            failure_probability: 1.0,
            ..FaultConfig::none()
        };
        let mut runner: DstRunner<MockQueue> = DstRunner::with_fault_config(3, config);
        for v in 0..50 {
            let _ = runner.push(v);
        }

        // Whatever took effect is in the history and in the queue.
        let recorded = runner.history().len();
        assert_eq!(runner.queue().values.lock().unwrap().len(), recorded);
        assert!(runner.stats().faults_injected > 0);
        assert!(runner.check().iter().all(|r| r.holds));
    }
}
