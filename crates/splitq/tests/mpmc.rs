//! Multi-threaded tests against real OS threads.
//!
//! Values are tagged `(producer << 32) | sequence` so every value is unique
//! and carries its producer.

#![cfg(not(loom))]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use splitq::SplitQueue;
use splitq_core::{
    HistoryRecorder, PropertyChecker, QueueHistory, QueueObservation, QueuePropertyChecker,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tag(producer: u64, seq: u64) -> u64 {
    (producer << 32) | seq
}

fn producer_of(value: u64) -> u64 {
    value >> 32
}

fn seq_of(value: u64) -> u64 {
    value & 0xFFFF_FFFF
}

#[test]
fn producers_and_consumers_lose_nothing() {
    init_tracing();

    const PRODUCERS: u64 = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: u64 = 10_000;
    let total = (PRODUCERS * PER_PRODUCER) as usize;

    let queue = Arc::new(SplitQueue::new());
    let producers_done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(PRODUCERS as usize + CONSUMERS));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for seq in 0..PER_PRODUCER {
                    queue.push(tag(p, seq)).unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let producers_done = Arc::clone(&producers_done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut seen = Vec::new();
                loop {
                    // Checked before the pop, so a lost value shows up as a
                    // shortfall below instead of a hang.
                    let done = producers_done.load(Ordering::Acquire);
                    match queue.pop() {
                        Some(v) => seen.push(v),
                        None if done => break,
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    for handle in producers {
        handle.join().unwrap();
    }
    producers_done.store(true, Ordering::Release);
    let per_consumer: Vec<Vec<u64>> =
        consumers.into_iter().map(|h| h.join().unwrap()).collect();

    // One consumer's pops are sequential, so it sees each producer in order.
    for seen in &per_consumer {
        let mut last = vec![None; PRODUCERS as usize];
        for &v in seen {
            let p = producer_of(v) as usize;
            if let Some(prev) = last[p] {
                assert!(
                    seq_of(v) > prev,
                    "producer {} out of order: {} after {}",
                    p,
                    seq_of(v),
                    prev
                );
            }
            last[p] = Some(seq_of(v));
        }
    }

    let all: Vec<u64> = per_consumer.into_iter().flatten().collect();
    let unique: HashSet<u64> = all.iter().copied().collect();
    assert_eq!(all.len(), total, "duplicates or losses");
    assert_eq!(unique.len(), total, "duplicate delivery");
    for p in 0..PRODUCERS {
        for seq in 0..PER_PRODUCER {
            assert!(unique.contains(&tag(p, seq)));
        }
    }

    assert_eq!(queue.pop(), None);
    assert!(queue.is_empty());
    assert_eq!(queue.stats().live_nodes(), 1);
}

#[test]
fn concurrent_history_is_linearizable() {
    init_tracing();

    const THREADS: u64 = 3;
    const OPS_PER_THREAD: u64 = 40;

    for round in 0..20 {
        let queue = Arc::new(SplitQueue::new());
        let recorder = HistoryRecorder::new();
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                let mut rec = recorder.thread(t);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..OPS_PER_THREAD {
                        if (i + t) % 3 == 2 {
                            rec.record_pop(|| queue.pop());
                        } else {
                            let value = tag(t, i);
                            rec.record_push(value, || queue.push(value)).unwrap();
                        }
                    }
                    rec.finish()
                })
            })
            .collect();

        let histories: Vec<QueueHistory> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let history = QueueHistory::merge(histories);

        let mut queue = Arc::into_inner(queue).unwrap();
        let live_nodes = queue.stats().live_nodes();
        let observed =
            QueueObservation::from_history(history, queue.to_vec()).with_live_nodes(live_nodes);

        let checker = QueuePropertyChecker::new(&observed);
        assert!(checker.all_hold(), "round {}:\n{}", round, checker.report());
    }
}

#[test]
fn empty_pops_race_a_single_push() {
    init_tracing();

    for _ in 0..200 {
        let queue = Arc::new(SplitQueue::new());
        let done = Arc::new(AtomicBool::new(false));

        let poppers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut got = None;
                    while !done.load(Ordering::Acquire) && got.is_none() {
                        got = queue.pop();
                    }
                    got
                })
            })
            .collect();

        queue.push(7u64).unwrap();
        // Let a popper take it, or take it here.
        let mut taken: Vec<u64> = Vec::new();
        while queue.stats().live_nodes() > 1 {
            thread::yield_now();
            if poppers.iter().all(|h| h.is_finished()) {
                break;
            }
        }
        done.store(true, Ordering::Release);
        for handle in poppers {
            taken.extend(handle.join().unwrap());
        }
        taken.extend(queue.pop());

        assert_eq!(taken, vec![7]);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().live_nodes(), 1);
    }
}

#[test]
fn drop_releases_queued_values() {
    let token = Arc::new(());
    {
        let queue = SplitQueue::new();
        for _ in 0..100 {
            queue.push(Arc::clone(&token)).unwrap();
        }
        for _ in 0..40 {
            drop(queue.pop());
        }
        assert_eq!(Arc::strong_count(&token), 61);
    }
    assert_eq!(Arc::strong_count(&token), 1);
}

#[test]
fn steady_state_reuses_nodes() {
    init_tracing();

    const THREADS: u64 = 4;
    const ROUNDS: u64 = 20_000;

    let queue = Arc::new(SplitQueue::new());
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for seq in 0..ROUNDS {
                    queue.push(tag(t, seq)).unwrap();
                    while queue.pop().is_none() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = queue.stats();
    assert_eq!(stats.live_nodes(), 1);
    // Nodes are recycled, so the arena stays tiny compared to the traffic.
    assert!(
        stats.slots_reserved < 4096,
        "arena grew to {} slots for {} operations",
        stats.slots_reserved,
        THREADS * ROUNDS * 2
    );
}
