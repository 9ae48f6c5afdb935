//! The simulation environment: seed, randomness, time, faults, scheduling.

use crate::clock::SimClock;
use crate::fault::{FaultConfig, FaultInjector};
use crate::random::DeterministicRng;
use crate::scheduler::Scheduler;

/// Everything nondeterministic in a simulated run, derived from one seed.
#[derive(Debug, Clone)]
pub struct DstEnv {
    seed: u64,
    rng: DeterministicRng,
    clock: SimClock,
    fault: FaultInjector,
    scheduler: Option<Scheduler>,
}

/// Snapshot of environment counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DstEnvStats {
    pub seed: u64,
    pub now_ns: u64,
    pub faults_count: u64,
    pub delays_count: u64,
    pub switches_count: u64,
}

impl DstEnv {
    /// Environment with default faults and no scheduler.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_fault_config(seed, FaultConfig::default())
    }

    #[must_use]
    pub fn with_fault_config(seed: u64, config: FaultConfig) -> Self {
        debug_assert!(seed != 0, "Seed should not be zero");
        Self {
            seed,
            rng: DeterministicRng::new(seed),
            clock: SimClock::new(),
            fault: FaultInjector::new(DeterministicRng::new(seed.wrapping_add(1)), config),
            scheduler: None,
        }
    }

    /// Add a scheduler for `threads_count` simulated threads.
    #[must_use]
    pub fn with_scheduler(mut self, threads_count: usize, yield_probability: f64) -> Self {
        self.scheduler = Some(Scheduler::new(
            DeterministicRng::new(self.seed.wrapping_add(2)),
            threads_count,
            yield_probability,
        ));
        self
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    pub fn clock(&mut self) -> &mut SimClock {
        &mut self.clock
    }

    pub fn fault(&mut self) -> &mut FaultInjector {
        &mut self.fault
    }

    pub fn scheduler(&mut self) -> Option<&mut Scheduler> {
        self.scheduler.as_mut()
    }

    /// Advance the clock by a random stall, if the injector asks for one.
    pub fn maybe_delay(&mut self) -> Option<u64> {
        let delay = self.fault.should_delay()?;
        self.clock.advance_ns(delay);
        Some(delay)
    }

    /// `DST_SEED=<seed>`, for reproduction messages.
    #[must_use]
    pub fn format_seed(&self) -> String {
        format!("DST_SEED={}", self.seed)
    }

    #[must_use]
    pub fn stats(&self) -> DstEnvStats {
        let faults = self.fault.stats();
        DstEnvStats {
            seed: self.seed,
            now_ns: self.clock.now_ns(),
            faults_count: faults.faults_count,
            delays_count: faults.delays_count,
            switches_count: self.scheduler.as_ref().map_or(0, Scheduler::switches_count),
        }
    }
}
