//! # splitq-dst
//!
//! Deterministic simulation testing for concurrent queues.
//!
//! Time, randomness, thread scheduling and faults all derive from one `u64`
//! seed, so a failing run replays exactly.
//!
//! - [`DstRunner`] wraps a queue, injects faults at operation boundaries,
//!   and records the history the queue properties are checked against
//! - [`DstHarness`] interleaves simulated threads over one runner
//!
//! ```rust
//! use splitq_dst::{DstEnv, FaultConfig};
//!
//! let mut env = DstEnv::with_fault_config(12345, FaultConfig::none());
//! env.clock().advance_ms(2);
//! assert_eq!(env.clock().now_ns(), 2_000_000);
//!
//! let first: u64 = env.rng().gen();
//! let mut replay = DstEnv::with_fault_config(12345, FaultConfig::none());
//! assert_eq!(replay.rng().gen::<u64>(), first);
//! assert!(!env.fault().should_fail());
//! ```
//!
//! Replay a failure with its seed:
//! ```bash
//! DST_SEED=12345 cargo test -p splitq-dst
//! ```

use std::num::ParseIntError;

use thiserror::Error;

pub mod clock;
pub mod env;
pub mod fault;
pub mod fault_injection;
pub mod harness;
pub mod random;
pub mod scheduler;

pub use clock::SimClock;
pub use env::{DstEnv, DstEnvStats};
pub use fault::{FaultConfig, FaultInjector, FaultStats};
pub use fault_injection::{
    run_dst_scenario, DstOp, DstResult, DstRunner, DstStats, DstTestableQueue, FaultPoint,
    FaultType,
};
pub use harness::{DstHarness, HarnessConfig, HarnessResult};
pub use random::DeterministicRng;
pub use scheduler::{ScheduleDecision, Scheduler};

/// Environment variable holding the seed to replay.
pub const DST_SEED_VAR: &str = "DST_SEED";

/// Environment variable holding the iteration count for seed sweeps.
pub const DST_ITERATIONS_VAR: &str = "DST_ITERATIONS";

/// A seed could not be taken from the environment.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("DST_SEED must be a valid u64, got {value:?}")]
    Invalid {
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("DST_SEED must not be zero")]
    Zero,
}

/// Parse a seed as given in `DST_SEED`.
pub fn parse_seed(value: &str) -> Result<u64, SeedError> {
    let seed: u64 = value.trim().parse().map_err(|source| SeedError::Invalid {
        value: value.to_string(),
        source,
    })?;
    if seed == 0 {
        return Err(SeedError::Zero);
    }
    Ok(seed)
}

/// Seed from `DST_SEED`, or a fresh random one.
///
/// Prints the seed either way so the run can be replayed.
pub fn try_get_or_generate_seed() -> Result<u64, SeedError> {
    match std::env::var(DST_SEED_VAR) {
        Ok(s) => {
            let seed = parse_seed(&s)?;
            println!("{}={} (from environment)", DST_SEED_VAR, seed);
            Ok(seed)
        }
        Err(_) => {
            let seed = rand::random::<u64>().max(1);
            println!("{}={} (randomly generated)", DST_SEED_VAR, seed);
            Ok(seed)
        }
    }
}

/// Like [`try_get_or_generate_seed`], for tests.
///
/// # Panics
///
/// Panics if `DST_SEED` is set but is not a non-zero `u64`.
#[must_use]
pub fn get_or_generate_seed() -> u64 {
    match try_get_or_generate_seed() {
        Ok(seed) => seed,
        Err(e) => panic!("{}", e),
    }
}

/// Iteration count from `DST_ITERATIONS`, or `default` when unset or
/// unparsable.
#[must_use]
pub fn dst_iterations(default: u64) -> u64 {
    std::env::var(DST_ITERATIONS_VAR)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}
