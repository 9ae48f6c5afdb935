//! Multi-threaded stress runner for the split-count queue.
//!
//! # Usage
//!
//! ```bash
//! # Default: 4 producers, 4 consumers, 100k values each
//! cargo run --release -p splitq-stress
//!
//! # Heavier contention
//! cargo run --release -p splitq-stress -- --producers 8 --consumers 2 --per-producer 1000000
//!
//! # Also record short histories and check them for linearizability
//! cargo run --release -p splitq-stress -- --check-linearizability
//!
//! # Also sweep simulated schedules, reproducibly
//! cargo run --release -p splitq-stress -- --seed 12345 --dst-seeds 50
//! ```
//!
//! Exits non-zero if any check fails.

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splitq::{AllocError, SplitQueue};
use splitq_core::{
    HistoryRecorder, PropertyChecker, QueueHistory, QueueObservation, QueuePropertyChecker,
};
use splitq_dst::{DstHarness, DstTestableQueue, HarnessConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "splitq-stress")]
#[command(about = "Hammer the split-count queue from many threads and check what comes out")]
struct Args {
    /// Producer threads
    #[arg(long, default_value_t = 4)]
    producers: u32,

    /// Consumer threads
    #[arg(long, default_value_t = 4)]
    consumers: u32,

    /// Values pushed by each producer
    #[arg(long, default_value_t = 100_000)]
    per_producer: u32,

    /// Seed for jitter and simulated schedules (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Record short concurrent histories and check them for linearizability
    #[arg(long)]
    check_linearizability: bool,

    /// Histories to record when checking linearizability
    #[arg(long, default_value_t = 50)]
    rounds: u32,

    /// Operations per thread in each recorded history
    #[arg(long, default_value_t = 60)]
    history_ops: u32,

    /// Simulated-schedule runs to sweep after the threaded runs
    #[arg(long, default_value_t = 0)]
    dst_seeds: u64,
}

/// Pack a producer id and sequence number into one value.
fn tag(producer: u32, seq: u32) -> u64 {
    (u64::from(producer) << 32) | u64::from(seq)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if args.producers == 0 || args.consumers == 0 {
        eprintln!("Error: --producers and --consumers must be at least 1");
        return ExitCode::FAILURE;
    }

    let seed = args.seed.unwrap_or_else(|| rand::random::<u64>().max(1));
    tracing::info!(seed, "starting (pass --seed {} to reproduce)", seed);

    let mut failures: Vec<String> = Vec::new();

    if let Err(e) = run_throughput(&args, seed) {
        failures.push(e);
    }
    if args.check_linearizability {
        failures.extend(run_linearizability(&args));
    }
    if args.dst_seeds > 0 {
        failures.extend(run_dst_sweep(seed, args.dst_seeds));
    }

    if failures.is_empty() {
        println!("[PASS] seed={}", seed);
        ExitCode::SUCCESS
    } else {
        for failure in &failures {
            println!("[FAIL] {}", failure);
        }
        println!("seed={}", seed);
        ExitCode::FAILURE
    }
}

/// Producers push tagged values while consumers drain them; afterwards
/// every value must have come out exactly once, each consumer must have
/// seen each producer in order, and only the sentinel may remain.
fn run_throughput(args: &Args, seed: u64) -> Result<(), String> {
    let total = args.producers as usize * args.per_producer as usize;
    let queue = Arc::new(SplitQueue::new());
    let producers_done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new((args.producers + args.consumers) as usize));
    let started = Instant::now();

    let producers: Vec<_> = (0..args.producers)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let per_producer = args.per_producer;
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(p)));
            thread::spawn(move || -> Result<(), AllocError> {
                barrier.wait();
                for seq in 0..per_producer {
                    queue.push(tag(p, seq))?;
                    if rng.gen_ratio(1, 256) {
                        thread::yield_now();
                    }
                }
                Ok(())
            })
        })
        .collect();

    let consumers: Vec<_> = (0..args.consumers)
        .map(|c| {
            let queue = Arc::clone(&queue);
            let producers_done = Arc::clone(&producers_done);
            let barrier = Arc::clone(&barrier);
            let consumer_seed = seed.wrapping_add(1 << 32).wrapping_add(u64::from(c));
            let mut rng = StdRng::seed_from_u64(consumer_seed);
            thread::spawn(move || {
                barrier.wait();
                drain(&queue, &producers_done, &mut rng)
            })
        })
        .collect();

    // Join everyone before reporting, so no consumer outlives the run.
    let mut producer_error = None;
    for handle in producers {
        let failure = match handle.join() {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("producer could not push: {}", e),
            Err(_) => "producer thread panicked".to_string(),
        };
        producer_error.get_or_insert(failure);
    }
    producers_done.store(true, Ordering::Release);

    let mut per_consumer = Vec::with_capacity(args.consumers as usize);
    for handle in consumers {
        per_consumer.push(handle.join().map_err(|_| "consumer thread panicked".to_string())?);
    }
    let elapsed = started.elapsed();
    if let Some(failure) = producer_error {
        return Err(failure);
    }

    for (c, seen) in per_consumer.iter().enumerate() {
        let mut last: Vec<Option<u64>> = vec![None; args.producers as usize];
        for &v in seen {
            let (p, seq) = ((v >> 32) as usize, v & 0xFFFF_FFFF);
            if p >= last.len() {
                return Err(format!("consumer {} got value {:#x} nobody pushed", c, v));
            }
            if last[p].is_some_and(|prev| seq <= prev) {
                return Err(format!(
                    "consumer {} saw producer {} out of order: {} after {:?}",
                    c, p, seq, last[p]
                ));
            }
            last[p] = Some(seq);
        }
    }

    let delivered: usize = per_consumer.iter().map(Vec::len).sum();
    let unique: HashSet<u64> = per_consumer.into_iter().flatten().collect();
    if delivered != total || unique.len() != total {
        return Err(format!(
            "expected {} distinct values, got {} deliveries of {} distinct values",
            total,
            delivered,
            unique.len()
        ));
    }

    if queue.pop().is_some() {
        return Err("queue not empty after every value was delivered".to_string());
    }
    let stats = queue.stats();
    if stats.live_nodes() != 1 {
        return Err(format!(
            "{} nodes alive after drain, expected only the sentinel",
            stats.live_nodes()
        ));
    }

    let ops = (total * 2) as f64;
    tracing::info!(
        values = total,
        elapsed_ms = elapsed.as_millis() as u64,
        mops_per_sec = ops / elapsed.as_secs_f64() / 1e6,
        slots_reserved = stats.slots_reserved,
        "throughput run passed"
    );
    Ok(())
}

/// Pop until the producers are done and the queue comes up empty.
///
/// Stops on a shortfall instead of waiting for a count that a lost value
/// would never reach; the caller's loss check reports it.
fn drain(queue: &SplitQueue<u64>, producers_done: &AtomicBool, rng: &mut StdRng) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        // Read before popping: `None` after every push returned means
        // nothing is left to take.
        let done = producers_done.load(Ordering::Acquire);
        match queue.pop() {
            Some(v) => {
                seen.push(v);
                if rng.gen_ratio(1, 256) {
                    thread::yield_now();
                }
            }
            None if done => return seen,
            None => thread::yield_now(),
        }
    }
}

/// Record short, heavily overlapping histories and check every queue
/// property on each.
fn run_linearizability(args: &Args) -> Vec<String> {
    const THREADS: u32 = 3;
    let mut failures = Vec::new();

    for round in 0..args.rounds {
        let queue = Arc::new(SplitQueue::new());
        let recorder = HistoryRecorder::new();
        let barrier = Arc::new(Barrier::new(THREADS as usize));
        let ops = args.history_ops;

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                let mut rec = recorder.thread(u64::from(t));
                thread::spawn(move || -> Result<QueueHistory, AllocError> {
                    barrier.wait();
                    for i in 0..ops {
                        if (i + t) % 3 == 2 {
                            rec.record_pop(|| queue.pop());
                        } else {
                            let value = tag(t, i);
                            rec.record_push(value, || queue.push(value))?;
                        }
                    }
                    Ok(rec.finish())
                })
            })
            .collect();

        let mut histories = Vec::with_capacity(THREADS as usize);
        for handle in handles {
            match handle.join() {
                Ok(Ok(history)) => histories.push(history),
                Ok(Err(e)) => failures.push(format!("round {}: push failed: {}", round, e)),
                Err(_) => failures.push(format!("round {}: thread panicked", round)),
            }
        }
        if histories.len() != THREADS as usize {
            continue;
        }

        let Some(mut queue) = Arc::into_inner(queue) else {
            failures.push(format!("round {}: queue still shared", round));
            continue;
        };
        let live_nodes = queue.stats().live_nodes();
        let history = QueueHistory::merge(histories);
        let observed =
            QueueObservation::from_history(history, queue.to_vec()).with_live_nodes(live_nodes);

        for v in QueuePropertyChecker::new(&observed).violations() {
            failures.push(format!("round {}: {}", round, v));
        }
    }

    if failures.is_empty() {
        tracing::info!(rounds = args.rounds, "linearizability rounds passed");
    }
    failures
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

/// Simulated interleavings with injected faults, one seed per run.
fn run_dst_sweep(seed: u64, runs: u64) -> Vec<String> {
    let mut failures = Vec::new();
    for i in 0..runs {
        let run_seed = seed.wrapping_add(i).max(1);
        let result = DstHarness::new(run_seed, HarnessConfig::stress()).run_queue::<SplitDst>();
        if !result.all_invariants_held {
            failures.push(result.format());
        }
    }
    if failures.is_empty() {
        tracing::info!(runs, "dst sweep passed");
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_stops_once_producers_are_done() {
        let queue = SplitQueue::new();
        for v in 1..=3 {
            queue.push(v).unwrap();
        }
        let done = AtomicBool::new(true);
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(drain(&queue, &done, &mut rng), vec![1, 2, 3]);
        // Nothing more is coming, so an empty queue ends the drain.
        assert!(drain(&queue, &done, &mut rng).is_empty());
    }

    #[test]
    fn test_drain_waits_for_late_pushes() {
        let queue = Arc::new(SplitQueue::new());
        let done = Arc::new(AtomicBool::new(false));

        let consumer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);
            thread::spawn(move || drain(&queue, &done, &mut StdRng::seed_from_u64(1)))
        };
        for v in 0..1000 {
            queue.push(v).unwrap();
        }
        done.store(true, Ordering::Release);

        assert_eq!(consumer.join().unwrap(), (0..1000).collect::<Vec<u64>>());
    }
}
