//! Deterministic thread scheduling for simulated concurrency.
//!
//! Simulated threads run one operation at a time; after each operation the
//! scheduler decides who runs next. The same seed always yields the same
//! interleaving.

use crate::random::DeterministicRng;

/// What to do at a yield point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Keep running the current thread
    Continue,
    /// Switch to the given thread
    SwitchTo(usize),
}

/// Picks which simulated thread runs next.
#[derive(Debug, Clone)]
pub struct Scheduler {
    rng: DeterministicRng,
    threads_count: usize,
    current: usize,
    yield_probability: f64,
    switches_count: u64,
}

impl Scheduler {
    #[must_use]
    pub fn new(rng: DeterministicRng, threads_count: usize, yield_probability: f64) -> Self {
        debug_assert!(threads_count > 0, "Must have at least one thread");
        debug_assert!(
            (0.0..=1.0).contains(&yield_probability),
            "Invalid yield probability"
        );
        Self {
            rng,
            threads_count,
            current: 0,
            yield_probability,
            switches_count: 0,
        }
    }

    /// Maybe switch threads.
    pub fn decide(&mut self) -> ScheduleDecision {
        if self.threads_count < 2 || !self.rng.gen_bool(self.yield_probability) {
            return ScheduleDecision::Continue;
        }
        let next = self.rng.gen_range(0..self.threads_count);
        if next == self.current {
            return ScheduleDecision::Continue;
        }
        self.switch_to(next);
        ScheduleDecision::SwitchTo(next)
    }

    /// Switch to some other thread unconditionally.
    pub fn force_switch(&mut self) -> ScheduleDecision {
        if self.threads_count < 2 {
            return ScheduleDecision::Continue;
        }
        let offset = self.rng.gen_range(1..self.threads_count);
        let next = (self.current + offset) % self.threads_count;
        self.switch_to(next);
        ScheduleDecision::SwitchTo(next)
    }

    fn switch_to(&mut self, next: usize) {
        debug_assert!(next < self.threads_count);
        self.current = next;
        self.switches_count += 1;
    }

    #[must_use]
    pub fn current_thread(&self) -> usize {
        self.current
    }

    #[must_use]
    pub fn threads_count(&self) -> usize {
        self.threads_count
    }

    #[must_use]
    pub fn switches_count(&self) -> u64 {
        self.switches_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_thread_never_switches() {
        let mut scheduler = Scheduler::new(DeterministicRng::new(1), 1, 1.0);
        for _ in 0..100 {
            assert_eq!(scheduler.decide(), ScheduleDecision::Continue);
        }
        assert_eq!(scheduler.force_switch(), ScheduleDecision::Continue);
        assert_eq!(scheduler.current_thread(), 0);
    }

    #[test]
    fn test_force_switch_changes_thread() {
        let mut scheduler = Scheduler::new(DeterministicRng::new(5), 3, 0.0);
        for _ in 0..50 {
            let before = scheduler.current_thread();
            let decision = scheduler.force_switch();
            assert_ne!(scheduler.current_thread(), before);
            assert_eq!(decision, ScheduleDecision::SwitchTo(scheduler.current_thread()));
        }
        assert_eq!(scheduler.switches_count(), 50);
    }

    #[test]
    fn test_interleaving_is_reproducible() {
        let trace = |seed| {
            let mut scheduler = Scheduler::new(DeterministicRng::new(seed), 4, 0.5);
            (0..100)
                .map(|_| {
                    scheduler.decide();
                    scheduler.current_thread()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(trace(99), trace(99));
    }
}
