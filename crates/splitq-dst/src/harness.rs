//! Simulated multi-threaded runs over a single queue.
//!
//! [`DstHarness`] plays several logical threads against one [`DstRunner`].
//! After every step the scheduler may hand control to another thread, so a
//! seed fixes the whole interleaving, every injected fault, and every
//! generated value. The recorded history is checked against all queue
//! properties every `invariant_check_interval` steps and once at the end.

use crate::fault_injection::{DstRunner, DstTestableQueue};
use crate::{DstEnv, FaultConfig};

/// Shape of a harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Simulated threads
    pub threads_count: usize,
    /// Steps each thread takes before it is done
    pub operations_per_thread: u64,
    /// Chance of a context switch after each step
    pub yield_probability: f64,
    /// Chance that a step pushes rather than pops
    pub push_probability: f64,
    pub fault_config: FaultConfig,
    /// Run the property checks every N steps; 0 checks only at the end
    pub invariant_check_interval: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            threads_count: 4,
            operations_per_thread: 100,
            yield_probability: 0.2,
            push_probability: 0.5,
            fault_config: FaultConfig::default(),
            invariant_check_interval: 10,
        }
    }
}

impl HarnessConfig {
    /// Many threads, long runs, aggressive faults, sparse checks.
    #[must_use]
    pub fn stress() -> Self {
        Self {
            threads_count: 8,
            operations_per_thread: 1000,
            yield_probability: 0.3,
            push_probability: 0.55,
            fault_config: FaultConfig::aggressive(),
            invariant_check_interval: 500,
        }
    }

    /// Two threads, no faults. Cheap enough for seed sweeps.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            threads_count: 2,
            operations_per_thread: 50,
            yield_probability: 0.1,
            push_probability: 0.5,
            fault_config: FaultConfig::none(),
            invariant_check_interval: 10,
        }
    }
}

/// Outcome of [`DstHarness::run_queue`].
#[derive(Debug, Clone)]
pub struct HarnessResult {
    pub seed: u64,
    /// Steps executed across all threads
    pub operations_count: u64,
    pub context_switches_count: u64,
    /// Faults injected by the runner and the environment
    pub faults_injected_count: u64,
    pub invariant_checks_count: u64,
    pub all_invariants_held: bool,
    /// Failed properties from the first check that found any
    pub first_violation: Option<String>,
}

impl HarnessResult {
    /// One status line, plus the violation when there is one.
    #[must_use]
    pub fn format(&self) -> String {
        let status = if self.all_invariants_held { "PASS" } else { "FAIL" };
        let mut out = format!(
            "[{status}] DST_SEED={} steps={} switches={} faults={} checks={}",
            self.seed,
            self.operations_count,
            self.context_switches_count,
            self.faults_injected_count,
            self.invariant_checks_count
        );
        if let Some(violation) = &self.first_violation {
            out.push_str("\n  Violation: ");
            out.push_str(violation);
        }
        out
    }
}

/// Drives simulated threads over one queue under a seeded scheduler.
pub struct DstHarness {
    env: DstEnv,
    config: HarnessConfig,
}

impl DstHarness {
    #[must_use]
    pub fn new(seed: u64, config: HarnessConfig) -> Self {
        debug_assert!(seed != 0, "Seed should not be zero");
        debug_assert!(
            (1..=16).contains(&config.threads_count),
            "threads_count must be in 1..=16, got {}",
            config.threads_count
        );

        let env = DstEnv::with_fault_config(seed, config.fault_config.clone())
            .with_scheduler(config.threads_count, config.yield_probability);
        Self { env, config }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.env.seed()
    }

    /// The environment, for tests that want to draw from the same seed.
    pub fn env(&mut self) -> &mut DstEnv {
        &mut self.env
    }

    fn current_thread(&mut self) -> usize {
        self.env.scheduler().map_or(0, |s| s.current_thread())
    }

    /// Run every simulated thread to completion against a fresh `Q`.
    ///
    /// Thread `t` pushes the tags `(t << 32) | step`, so every value is
    /// unique and its producer is recoverable. Faults raised by the runner
    /// are part of the simulation and do not fail the run; only a failed
    /// property does, and it ends the run at the check that found it.
    pub fn run_queue<Q: DstTestableQueue>(&mut self) -> HarnessResult {
        let threads = self.config.threads_count;
        let per_thread = self.config.operations_per_thread;
        let interval = self.config.invariant_check_interval;
        let push_probability = self.config.push_probability;

        let mut runner: DstRunner<Q> =
            DstRunner::with_fault_config(self.seed(), self.config.fault_config.clone());
        let mut steps = vec![0u64; threads];
        let mut operations = 0u64;
        let mut checks = 0u64;
        let mut violation = None;

        loop {
            let thread = self.current_thread();
            if steps[thread] >= per_thread {
                if steps.iter().all(|&s| s >= per_thread) {
                    break;
                }
                if let Some(scheduler) = self.env.scheduler() {
                    scheduler.force_switch();
                }
                continue;
            }

            let step = steps[thread];
            runner.set_thread(thread as u64);
            let _ = if self.env.rng().gen_bool(push_probability) {
                runner.push(((thread as u64) << 32) | step)
            } else {
                runner.pop().map(|_| ())
            };
            steps[thread] += 1;
            operations += 1;

            if interval != 0 && operations % interval == 0 {
                checks += 1;
                violation = failed_properties(&mut runner);
                if violation.is_some() {
                    break;
                }
            }

            self.env.maybe_delay();
            if let Some(scheduler) = self.env.scheduler() {
                scheduler.decide();
            }
        }

        if violation.is_none() {
            checks += 1;
            violation = failed_properties(&mut runner);
        }

        let env_stats = self.env.stats();
        let result = HarnessResult {
            seed: self.seed(),
            operations_count: operations,
            context_switches_count: env_stats.switches_count,
            faults_injected_count: env_stats.faults_count + runner.stats().faults_injected,
            invariant_checks_count: checks,
            all_invariants_held: violation.is_none(),
            first_violation: violation,
        };

        if let Some(message) = &result.first_violation {
            tracing::warn!(seed = result.seed, %message, "queue property violated");
        }
        tracing::info!(
            seed = result.seed,
            ops = result.operations_count,
            switches = result.context_switches_count,
            faults = result.faults_injected_count,
            passed = result.all_invariants_held,
            "dst queue run finished"
        );
        result
    }
}

fn failed_properties<Q: DstTestableQueue>(runner: &mut DstRunner<Q>) -> Option<String> {
    let failed: Vec<String> = runner
        .check()
        .iter()
        .filter(|r| !r.holds)
        .map(ToString::to_string)
        .collect();
    (!failed.is_empty()).then(|| failed.join("\n"))
}
