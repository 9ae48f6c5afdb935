//! DST runs against the real split-count queue.
//!
//! ```bash
//! DST_SEED=12345 DST_ITERATIONS=5000 cargo test -p splitq-dst --test queue_dst
//! ```

use splitq::{AllocError, SplitQueue};
use splitq_core::PropertyChecker;
use splitq_dst::{
    dst_iterations, get_or_generate_seed, DstEnv, DstHarness, DstRunner, DstTestableQueue,
    FaultConfig, HarnessConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct SplitDst(SplitQueue<u64>);

impl DstTestableQueue for SplitDst {
    type Error = AllocError;

    fn new() -> Self {
        SplitDst(SplitQueue::new())
    }

    fn push(&self, value: u64) -> Result<(), AllocError> {
        self.0.push(value)
    }

    fn pop(&self) -> Option<u64> {
        self.0.pop()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn contents(&mut self) -> Vec<u64> {
        self.0.to_vec()
    }

    fn live_nodes(&self) -> Option<u64> {
        Some(self.0.stats().live_nodes())
    }
}

/// Same queue, capped at a handful of nodes so pushes get rejected.
struct TinySplitDst(SplitQueue<u64>);

const TINY_NODE_LIMIT: u32 = 8;

impl DstTestableQueue for TinySplitDst {
    type Error = AllocError;

    fn new() -> Self {
        TinySplitDst(SplitQueue::with_node_limit(TINY_NODE_LIMIT).unwrap())
    }

    fn push(&self, value: u64) -> Result<(), AllocError> {
        self.0.push(value)
    }

    fn pop(&self) -> Option<u64> {
        self.0.pop()
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn contents(&mut self) -> Vec<u64> {
        self.0.to_vec()
    }

    fn live_nodes(&self) -> Option<u64> {
        Some(self.0.stats().live_nodes())
    }
}

fn assert_all_hold<Q: DstTestableQueue>(runner: &mut DstRunner<Q>) {
    let violations: Vec<String> = runner
        .check()
        .iter()
        .filter(|r| !r.holds)
        .map(ToString::to_string)
        .collect();
    assert!(
        violations.is_empty(),
        "{}\n{}",
        runner.stats().format(),
        violations.join("\n")
    );
}

#[test]
fn test_dst_single_threaded() {
    let seed = get_or_generate_seed();
    let mut env = DstEnv::with_fault_config(seed, FaultConfig::none());
    let mut runner: DstRunner<SplitDst> = DstRunner::with_fault_config(seed, FaultConfig::none());

    let iterations = dst_iterations(1000);
    let mut next_value = 1u64;

    for _ in 0..iterations {
        if env.rng().gen_bool(0.5) {
            runner.push(next_value).unwrap();
            next_value += 1;
        } else {
            runner.pop().unwrap();
        }
    }

    assert_all_hold(&mut runner);
}

#[test]
fn test_dst_with_faults() {
    let seed = get_or_generate_seed();
    let mut env = DstEnv::new(seed);
    let mut runner: DstRunner<SplitDst> = DstRunner::new(seed);

    let iterations = dst_iterations(1000);
    let mut values_to_push: Vec<u64> = (1..=iterations).collect();
    env.rng().shuffle(&mut values_to_push);
    let mut values = values_to_push.into_iter();

    for _ in 0..iterations {
        env.maybe_delay();

        match env.rng().gen_range(0..4_u8) {
            0 | 1 => {
                if let Some(v) = values.next() {
                    let _ = runner.push(v);
                }
            }
            _ => {
                let _ = runner.pop();
            }
        }
    }

    assert_all_hold(&mut runner);
}

#[test]
fn test_dst_drain_reclaims() {
    let seed = get_or_generate_seed();
    let mut runner: DstRunner<SplitDst> = DstRunner::with_fault_config(seed, FaultConfig::none());

    for v in 1..=200 {
        runner.push(v).unwrap();
    }
    while let Ok(Some(_)) = runner.pop() {}

    assert_eq!(runner.queue().live_nodes(), Some(1));
    assert!(runner.queue().is_empty());
    assert_all_hold(&mut runner);
}

#[test]
fn test_dst_node_limit_rejections() {
    let seed = get_or_generate_seed();
    let mut env = DstEnv::with_fault_config(seed, FaultConfig::none());
    let mut runner: DstRunner<TinySplitDst> =
        DstRunner::with_fault_config(seed, FaultConfig::none());

    let mut next_value = 1u64;
    for _ in 0..dst_iterations(500) {
        if env.rng().gen_bool(0.7) {
            // Rejected pushes change nothing and are not recorded.
            let _ = runner.push(next_value);
            next_value += 1;
        } else {
            runner.pop().unwrap();
        }
    }

    assert!(runner.stats().rejected_pushes > 0, "{}", runner.stats().format());
    assert!(runner.queue().live_nodes().unwrap() <= u64::from(TINY_NODE_LIMIT));
    assert_all_hold(&mut runner);
}

#[test]
fn test_harness_interleaved_threads() {
    init_tracing();
    let seed = get_or_generate_seed();
    let mut harness = DstHarness::new(seed, HarnessConfig::default());
    let result = harness.run_queue::<SplitDst>();
    assert!(result.all_invariants_held, "{}", result.format());
}

#[test]
fn test_harness_stress() {
    init_tracing();
    let seed = get_or_generate_seed();
    let mut harness = DstHarness::new(seed, HarnessConfig::stress());
    let result = harness.run_queue::<SplitDst>();
    assert!(result.all_invariants_held, "{}", result.format());
}

#[test]
fn test_seed_sweep() {
    init_tracing();
    let base = get_or_generate_seed();
    for i in 0..dst_iterations(20) {
        let seed = base.wrapping_add(i).max(1);
        let mut harness = DstHarness::new(seed, HarnessConfig::quick());
        let result = harness.run_queue::<SplitDst>();
        assert!(result.all_invariants_held, "{}", result.format());
    }
}

#[test]
fn test_checker_on_quiescent_queue() {
    let seed = get_or_generate_seed();
    let mut runner: DstRunner<SplitDst> = DstRunner::with_fault_config(seed, FaultConfig::none());
    for v in 1..=10 {
        runner.push(v).unwrap();
    }
    for _ in 0..4 {
        runner.pop().unwrap();
    }

    let observed = runner.observe();
    assert_eq!(observed.contents, vec![5, 6, 7, 8, 9, 10]);
    assert_eq!(observed.live_nodes, Some(7));

    let checker = splitq_core::QueuePropertyChecker::new(&observed).with_seed(seed);
    assert!(checker.all_hold(), "{}", checker.report());
}
