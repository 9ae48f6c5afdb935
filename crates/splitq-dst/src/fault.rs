//! Probabilistic fault injection.

use crate::random::DeterministicRng;

/// How often faults and delays happen.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Probability that a fault point fires
    pub failure_probability: f64,
    /// Probability that a delay point stalls
    pub delay_probability: f64,
    /// Upper bound for one simulated stall
    pub delay_ns_max: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            failure_probability: 0.05,
            delay_probability: 0.1,
            delay_ns_max: 1_000_000,
        }
    }
}

impl FaultConfig {
    /// Never inject anything.
    #[must_use]
    pub fn none() -> Self {
        Self {
            failure_probability: 0.0,
            delay_probability: 0.0,
            delay_ns_max: 0,
        }
    }

    /// Inject often.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_probability: 0.2,
            delay_probability: 0.3,
            delay_ns_max: 10_000_000,
        }
    }
}

/// Counts of what was injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub faults_count: u64,
    pub delays_count: u64,
}

/// Decides, deterministically, when faults fire.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    rng: DeterministicRng,
    config: FaultConfig,
    stats: FaultStats,
}

impl FaultInjector {
    #[must_use]
    pub fn new(rng: DeterministicRng, config: FaultConfig) -> Self {
        debug_assert!(
            (0.0..=1.0).contains(&config.failure_probability),
            "Invalid failure probability"
        );
        debug_assert!(
            (0.0..=1.0).contains(&config.delay_probability),
            "Invalid delay probability"
        );
        Self {
            rng,
            config,
            stats: FaultStats::default(),
        }
    }

    /// Whether the current fault point fires.
    pub fn should_fail(&mut self) -> bool {
        if self.config.failure_probability == 0.0 {
            return false;
        }
        let fail = self.rng.gen_bool(self.config.failure_probability);
        if fail {
            self.stats.faults_count += 1;
        }
        fail
    }

    /// Length of a stall to simulate here, if any.
    pub fn should_delay(&mut self) -> Option<u64> {
        if self.config.delay_probability == 0.0 || self.config.delay_ns_max == 0 {
            return None;
        }
        if !self.rng.gen_bool(self.config.delay_probability) {
            return None;
        }
        self.stats.delays_count += 1;
        Some(self.rng.gen_range(1..=self.config.delay_ns_max))
    }

    #[must_use]
    pub fn config(&self) -> &FaultConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> FaultStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_fires() {
        let mut injector = FaultInjector::new(DeterministicRng::new(1), FaultConfig::none());
        for _ in 0..1000 {
            assert!(!injector.should_fail());
            assert!(injector.should_delay().is_none());
        }
        assert_eq!(injector.stats(), FaultStats::default());
    }

    #[test]
    fn test_aggressive_fires_and_counts() {
        let mut injector =
            FaultInjector::new(DeterministicRng::new(1), FaultConfig::aggressive());
        let fired = (0..1000).filter(|_| injector.should_fail()).count() as u64;
        assert!(fired > 0);
        assert_eq!(injector.stats().faults_count, fired);
    }

    #[test]
    fn test_delay_within_bound() {
        let config = FaultConfig {
            delay_probability: 1.0,
            delay_ns_max: 50,
            ..FaultConfig::none()
        };
        let mut injector = FaultInjector::new(DeterministicRng::new(3), config);
        for _ in 0..100 {
            let delay = injector.should_delay().unwrap();
            assert!((1..=50).contains(&delay));
        }
        assert_eq!(injector.stats().delays_count, 100);
    }

    #[test]
    fn test_same_seed_same_faults() {
        let run = |seed| {
            let mut injector =
                FaultInjector::new(DeterministicRng::new(seed), FaultConfig::default());
            (0..200).map(|_| injector.should_fail()).collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
    }
}
