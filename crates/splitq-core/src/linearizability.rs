//! Linearizability checking for FIFO queue histories.
//!
//! A history is linearizable if its operations can be put in a sequential
//! order that
//!
//! 1. respects real time: if `a` returned before `b` was invoked, `a` comes
//!    first, and
//! 2. replays legally against a sequential FIFO queue.
//!
//! The search follows Wing and Gong: repeatedly pick a *minimal* pending
//! operation (one invoked no later than the earliest return among the
//! pending ones), apply it to a model queue, and backtrack on failure.
//! Visited `(linearized set, model contents)` pairs are memoized, which
//! keeps the search tractable on the histories the tests produce.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::invariants::queue::{QueueOpType, QueueOperation};

/// Outcome of a linearizability search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linearizability {
    /// A legal order exists; `order` holds indices into the input slice.
    Linearizable { order: Vec<usize> },
    /// Every candidate order was ruled out.
    NotLinearizable { explored: usize },
    /// The search budget ran out before a verdict.
    Inconclusive { explored: usize },
}

impl Linearizability {
    #[must_use]
    pub fn is_linearizable(&self) -> bool {
        matches!(self, Linearizability::Linearizable { .. })
    }
}

/// How to take back one step of the model.
#[derive(Debug, Clone, Copy)]
enum Undo {
    PopBack,
    PushFront(u64),
    Nothing,
}

struct Frame {
    candidates: Vec<usize>,
    cursor: usize,
    /// Operation applied to reach this frame, with its undo.
    applied: Option<(usize, Undo)>,
}

/// Search for a FIFO linearization of `ops`.
///
/// `budget` bounds the number of operations tried; once it is spent the
/// result is [`Linearizability::Inconclusive`].
#[must_use]
pub fn check_fifo_linearizable(ops: &[QueueOperation], budget: usize) -> Linearizability {
    let mut pending = Pending::new(ops);
    let mut model: VecDeque<u64> = VecDeque::new();
    let mut seen: HashSet<(Vec<u64>, VecDeque<u64>)> = HashSet::new();
    let mut explored = 0usize;

    let mut frames = vec![Frame {
        candidates: pending.minimal(),
        cursor: 0,
        applied: None,
    }];

    loop {
        if pending.is_empty() {
            let order = frames
                .iter()
                .filter_map(|f| f.applied.map(|(index, _)| index))
                .collect();
            return Linearizability::Linearizable { order };
        }

        let Some(frame) = frames.last_mut() else {
            return Linearizability::NotLinearizable { explored };
        };

        if frame.cursor == frame.candidates.len() {
            // Exhausted: step back.
            if let Some(frame) = frames.pop() {
                match frame.applied {
                    Some((index, undo)) => {
                        pending.restore(ops, index);
                        revert(&mut model, undo);
                    }
                    None => return Linearizability::NotLinearizable { explored },
                }
            }
            continue;
        }

        let index = frame.candidates[frame.cursor];
        frame.cursor += 1;

        explored += 1;
        if explored > budget {
            return Linearizability::Inconclusive { explored };
        }

        let Some(undo) = apply(&mut model, &ops[index]) else {
            continue;
        };
        pending.take(ops, index);

        if !seen.insert((pending.done.clone(), model.clone())) {
            pending.restore(ops, index);
            revert(&mut model, undo);
            continue;
        }

        frames.push(Frame {
            candidates: pending.minimal(),
            cursor: 0,
            applied: Some((index, undo)),
        });
    }
}

/// Operations not yet linearized, indexed for the minimal-operation query.
struct Pending {
    /// `(invoked_at, index)` of every pending operation
    by_invocation: BTreeSet<(u64, usize)>,
    /// Multiset of pending return times
    returns: BTreeMap<u64, usize>,
    /// Bitset of linearized operations
    done: Vec<u64>,
}

impl Pending {
    fn new(ops: &[QueueOperation]) -> Self {
        let mut returns = BTreeMap::new();
        for op in ops {
            *returns.entry(op.returned_at).or_insert(0) += 1;
        }
        Self {
            by_invocation: ops
                .iter()
                .enumerate()
                .map(|(i, op)| (op.invoked_at, i))
                .collect(),
            returns,
            done: vec![0; ops.len().div_ceil(64)],
        }
    }

    fn is_empty(&self) -> bool {
        self.by_invocation.is_empty()
    }

    /// Pending operations invoked no later than the earliest pending
    /// return: exactly the ones that may be linearized next.
    fn minimal(&self) -> Vec<usize> {
        let Some((&min_return, _)) = self.returns.first_key_value() else {
            return Vec::new();
        };
        self.by_invocation
            .iter()
            .take_while(|&&(invoked_at, _)| invoked_at <= min_return)
            .map(|&(_, i)| i)
            .collect()
    }

    fn take(&mut self, ops: &[QueueOperation], index: usize) {
        let op = &ops[index];
        self.by_invocation.remove(&(op.invoked_at, index));
        if let Some(count) = self.returns.get_mut(&op.returned_at) {
            *count -= 1;
            if *count == 0 {
                self.returns.remove(&op.returned_at);
            }
        }
        self.done[index / 64] |= 1 << (index % 64);
    }

    fn restore(&mut self, ops: &[QueueOperation], index: usize) {
        let op = &ops[index];
        self.by_invocation.insert((op.invoked_at, index));
        *self.returns.entry(op.returned_at).or_insert(0) += 1;
        self.done[index / 64] &= !(1 << (index % 64));
    }
}

/// Apply `op` to the model, or `None` if a FIFO queue could not produce it.
fn apply(model: &mut VecDeque<u64>, op: &QueueOperation) -> Option<Undo> {
    match (op.op_type, op.element) {
        (QueueOpType::Push, Some(e)) => {
            model.push_back(e);
            Some(Undo::PopBack)
        }
        (QueueOpType::Pop, Some(e)) => {
            if model.front() == Some(&e) {
                model.pop_front();
                Some(Undo::PushFront(e))
            } else {
                None
            }
        }
        (QueueOpType::PopEmpty, _) => model.is_empty().then_some(Undo::Nothing),
        _ => None,
    }
}

fn revert(model: &mut VecDeque<u64>, undo: Undo) {
    match undo {
        Undo::PopBack => {
            model.pop_back();
        }
        Undo::PushFront(e) => model.push_front(e),
        Undo::Nothing => {}
    }
}
