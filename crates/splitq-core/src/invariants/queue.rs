//! FIFO queue invariants.
//!
//! | Property | Description |
//! |----------|-------------|
//! | NoLostElements | Every pushed element is in the queue or was popped |
//! | NoDuplicates | No element is delivered or queued more than once |
//! | NoPhantomElements | Nothing comes out that was never pushed |
//! | PerProducerOrder | One producer's elements leave in its push order |
//! | FIFO_Order | A sequential history replays against a model queue |
//! | Linearizability | A timed history admits a legal FIFO linearization |
//! | Reclamation | A quiescent queue keeps exactly its reachable nodes alive |

use std::collections::{HashMap, HashSet, VecDeque};

use crate::counterexample::{Counterexample, MemoryIssue, StateSnapshot};
use crate::linearizability::{check_fifo_linearizable, Linearizability};
use crate::property::{PropertyChecker, PropertyResult};

/// Default number of search steps the linearizability check may spend.
pub const LINEARIZABILITY_BUDGET_DEFAULT: usize = 2_000_000;

/// Properties that any queue implementation must satisfy.
///
/// Implementations expose their observable state; the checker verifies
/// invariants against it. State must be read while the queue is quiescent.
pub trait QueueProperties {
    /// Set of all elements that have been pushed.
    fn pushed_elements(&self) -> HashSet<u64>;

    /// Every element returned by a pop, in any order, duplicates kept.
    fn popped_elements(&self) -> Vec<u64>;

    /// Current contents of the queue (oldest first).
    fn current_contents(&self) -> Vec<u64>;

    /// Operation history for order and linearizability checks.
    /// Returns owned data to avoid lifetime issues with internal mutexes.
    fn history(&self) -> QueueHistory;

    /// Nodes the implementation currently holds allocated, if it tracks
    /// them. A quiescent queue should hold one node per queued element plus
    /// its sentinel.
    fn live_nodes(&self) -> Option<u64> {
        None
    }
}

/// History of queue operations.
#[derive(Debug, Clone, Default)]
pub struct QueueHistory {
    /// Operations, ordered by invocation time.
    pub operations: Vec<QueueOperation>,
}

/// A single queue operation with its real-time interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOperation {
    /// Thread that performed the operation
    pub thread_id: u64,
    /// Type of operation
    pub op_type: QueueOpType,
    /// Element pushed, or element a pop returned
    pub element: Option<u64>,
    /// Logical time the call started
    pub invoked_at: u64,
    /// Logical time the call returned
    pub returned_at: u64,
}

/// Type of queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOpType {
    Push,
    Pop,
    PopEmpty,
}

impl QueueOperation {
    /// Short label for diagrams, e.g. `push(3)` or `pop()=3`.
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.op_type, self.element) {
            (QueueOpType::Push, Some(e)) => format!("push({})", e),
            (QueueOpType::Pop, Some(e)) => format!("pop()={}", e),
            _ => "pop()".to_string(),
        }
    }

    /// Whether this operation finished before `other` started.
    #[must_use]
    pub fn precedes(&self, other: &QueueOperation) -> bool {
        self.returned_at < other.invoked_at
    }
}

impl QueueHistory {
    /// Create a new empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a push that happened atomically at `step`.
    pub fn record_push(&mut self, thread_id: u64, element: u64, step: u64) {
        debug_assert!(step > 0, "Step must be positive");
        self.record(QueueOperation {
            thread_id,
            op_type: QueueOpType::Push,
            element: Some(element),
            invoked_at: step,
            returned_at: step,
        });
    }

    /// Record a pop that happened atomically at `step`.
    pub fn record_pop(&mut self, thread_id: u64, element: Option<u64>, step: u64) {
        debug_assert!(step > 0, "Step must be positive");
        self.record(QueueOperation {
            thread_id,
            op_type: if element.is_some() {
                QueueOpType::Pop
            } else {
                QueueOpType::PopEmpty
            },
            element,
            invoked_at: step,
            returned_at: step,
        });
    }

    /// Record an operation with an explicit interval.
    pub fn record(&mut self, op: QueueOperation) {
        debug_assert!(
            op.invoked_at <= op.returned_at,
            "Operation returned before it was invoked"
        );
        debug_assert!(
            (op.op_type == QueueOpType::PopEmpty) == op.element.is_none(),
            "Only empty pops carry no element"
        );
        self.operations.push(op);
    }

    /// Merge per-thread histories into one ordered by invocation time.
    #[must_use]
    pub fn merge(histories: impl IntoIterator<Item = QueueHistory>) -> Self {
        let mut operations: Vec<QueueOperation> = histories
            .into_iter()
            .flat_map(|h| h.operations)
            .collect();
        operations.sort_by_key(|op| (op.invoked_at, op.returned_at));
        Self { operations }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether no two operations overlap in time.
    #[must_use]
    pub fn is_sequential(&self) -> bool {
        let mut sorted: Vec<&QueueOperation> = self.operations.iter().collect();
        sorted.sort_by_key(|op| op.invoked_at);
        sorted.windows(2).all(|pair| pair[0].returned_at <= pair[1].invoked_at)
    }
}

/// Everything observed about one queue run, captured once the queue is
/// quiescent.
///
/// Harnesses that can only read a queue's contents through `&mut` fill this
/// in and check it instead of the queue itself.
#[derive(Debug, Clone, Default)]
pub struct QueueObservation {
    pub pushed: HashSet<u64>,
    pub popped: Vec<u64>,
    pub contents: Vec<u64>,
    pub history: QueueHistory,
    pub live_nodes: Option<u64>,
}

impl QueueObservation {
    /// Build an observation from a history and the queue's final contents.
    #[must_use]
    pub fn from_history(history: QueueHistory, contents: Vec<u64>) -> Self {
        let mut pushed = HashSet::new();
        let mut popped = Vec::new();
        for op in &history.operations {
            match (op.op_type, op.element) {
                (QueueOpType::Push, Some(e)) => {
                    pushed.insert(e);
                }
                (QueueOpType::Pop, Some(e)) => popped.push(e),
                _ => {}
            }
        }
        Self {
            pushed,
            popped,
            contents,
            history,
            live_nodes: None,
        }
    }

    #[must_use]
    pub fn with_live_nodes(mut self, live_nodes: u64) -> Self {
        self.live_nodes = Some(live_nodes);
        self
    }
}

impl QueueProperties for QueueObservation {
    fn pushed_elements(&self) -> HashSet<u64> {
        self.pushed.clone()
    }

    fn popped_elements(&self) -> Vec<u64> {
        self.popped.clone()
    }

    fn current_contents(&self) -> Vec<u64> {
        self.contents.clone()
    }

    fn history(&self) -> QueueHistory {
        self.history.clone()
    }

    fn live_nodes(&self) -> Option<u64> {
        self.live_nodes
    }
}

/// Property checker for queue implementations.
pub struct QueuePropertyChecker<'a, T: QueueProperties> {
    queue: &'a T,
    dst_seed: Option<u64>,
    linearizability_budget: usize,
}

impl<'a, T: QueueProperties> QueuePropertyChecker<'a, T> {
    /// Create a new checker for the given queue.
    #[must_use]
    pub fn new(queue: &'a T) -> Self {
        Self {
            queue,
            dst_seed: None,
            linearizability_budget: LINEARIZABILITY_BUDGET_DEFAULT,
        }
    }

    /// Set DST seed for counterexample reproduction.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        debug_assert!(seed != 0, "DST seed should not be zero");
        self.dst_seed = Some(seed);
        self
    }

    /// Cap the linearizability search. An exhausted budget is reported as
    /// a pass with a warning, never as a violation.
    #[must_use]
    pub fn with_linearizability_budget(mut self, budget: usize) -> Self {
        debug_assert!(budget > 0, "Budget must be positive");
        self.linearizability_budget = budget;
        self
    }

    fn counterexample(&self) -> Counterexample {
        Counterexample::maybe_seeded(self.dst_seed)
    }

    /// NoLostElements
    ///
    /// Every element that was pushed must either still be queued or have
    /// been popped.
    fn check_no_lost_elements(&self) -> PropertyResult {
        let pushed = self.queue.pushed_elements();
        let popped: HashSet<u64> = self.queue.popped_elements().into_iter().collect();
        let contents: HashSet<u64> = self.queue.current_contents().into_iter().collect();

        let mut lost: Vec<u64> = pushed
            .iter()
            .filter(|e| !contents.contains(e) && !popped.contains(e))
            .copied()
            .collect();
        if lost.is_empty() {
            return PropertyResult::pass("NoLostElements");
        }
        lost.sort_unstable();

        let mut ce = self.counterexample();
        ce.add_state(StateSnapshot {
            step: 1,
            description: format!("Elements {:?} lost", lost),
            variables: vec![
                ("pushed".to_string(), pushed.len().to_string()),
                ("popped".to_string(), popped.len().to_string()),
                ("contents".to_string(), contents.len().to_string()),
            ],
        });

        PropertyResult::fail(
            "NoLostElements",
            format!(
                "Element {} was pushed but is neither queued nor popped ({} lost)",
                lost[0],
                lost.len()
            ),
            Some(ce),
        )
    }

    /// NoDuplicates
    ///
    /// Across everything popped and everything still queued, each element
    /// appears at most once.
    fn check_no_duplicates(&self) -> PropertyResult {
        let mut seen: HashMap<u64, usize> = HashMap::new();
        for element in self
            .queue
            .popped_elements()
            .into_iter()
            .chain(self.queue.current_contents())
        {
            *seen.entry(element).or_insert(0) += 1;
        }

        let mut duplicated: Vec<(u64, usize)> =
            seen.into_iter().filter(|&(_, count)| count > 1).collect();
        if duplicated.is_empty() {
            return PropertyResult::pass("NoDuplicates");
        }
        duplicated.sort_unstable();

        let mut ce = self.counterexample();
        for &(element, deliveries) in &duplicated {
            ce.add_memory_issue(MemoryIssue::DoubleDelivery {
                element,
                deliveries,
            });
        }

        let (element, count) = duplicated[0];
        PropertyResult::fail(
            "NoDuplicates",
            format!("Element {} appears {} times", element, count),
            Some(ce),
        )
    }

    /// NoPhantomElements
    ///
    /// Every element popped or queued was pushed by someone.
    fn check_no_phantom_elements(&self) -> PropertyResult {
        let pushed = self.queue.pushed_elements();
        let phantom = self
            .queue
            .popped_elements()
            .into_iter()
            .chain(self.queue.current_contents())
            .find(|e| !pushed.contains(e));

        match phantom {
            None => PropertyResult::pass("NoPhantomElements"),
            Some(element) => PropertyResult::fail(
                "NoPhantomElements",
                format!("Element {} was delivered but never pushed", element),
                None,
            ),
        }
    }

    /// PerProducerOrder
    ///
    /// If one thread pushed `a` before `b`, no pop of `b` may complete
    /// before a pop of `a` starts, and `b` may not be delivered while `a`
    /// is still queued.
    fn check_per_producer_order(&self) -> PropertyResult {
        let history = self.queue.history();
        let queued: HashSet<u64> = self.queue.current_contents().into_iter().collect();

        let mut pops: HashMap<u64, &QueueOperation> = HashMap::new();
        let mut pushes_by_thread: HashMap<u64, Vec<&QueueOperation>> = HashMap::new();
        for op in &history.operations {
            match (op.op_type, op.element) {
                (QueueOpType::Push, Some(_)) => {
                    pushes_by_thread.entry(op.thread_id).or_default().push(op)
                }
                (QueueOpType::Pop, Some(e)) => {
                    pops.insert(e, op);
                }
                _ => {}
            }
        }

        for (thread, mut pushes) in pushes_by_thread {
            pushes.sort_by_key(|op| op.invoked_at);

            // Latest pop invocation among earlier pushes, and the earliest
            // still-queued earlier push.
            let mut latest_earlier_pop: Option<(u64, u64)> = None;
            let mut earlier_still_queued: Option<u64> = None;

            for push in pushes {
                let Some(element) = push.element else { continue };

                match pops.get(&element) {
                    Some(pop) => {
                        if let Some(stuck) = earlier_still_queued {
                            return PropertyResult::fail(
                                "PerProducerOrder",
                                format!(
                                    "Thread {}: element {} popped while earlier element {} is still queued",
                                    thread, element, stuck
                                ),
                                None,
                            );
                        }
                        if let Some((earlier, invoked)) = latest_earlier_pop {
                            if pop.returned_at < invoked {
                                return PropertyResult::fail(
                                    "PerProducerOrder",
                                    format!(
                                        "Thread {}: element {} was popped before element {} (pushed earlier)",
                                        thread, element, earlier
                                    ),
                                    None,
                                );
                            }
                        }
                        if latest_earlier_pop.map_or(true, |(_, t)| pop.invoked_at > t) {
                            latest_earlier_pop = Some((element, pop.invoked_at));
                        }
                    }
                    None => {
                        if queued.contains(&element) && earlier_still_queued.is_none() {
                            earlier_still_queued = Some(element);
                        }
                    }
                }
            }
        }

        PropertyResult::pass("PerProducerOrder")
    }

    /// FIFO_Order
    ///
    /// Replays a sequential history against a model queue. Concurrent
    /// histories are left to the linearizability check.
    fn check_fifo_order(&self) -> PropertyResult {
        let history = self.queue.history();
        if history.is_empty() || !history.is_sequential() {
            return PropertyResult::pass("FIFO_Order");
        }

        match replay_fifo(&history) {
            None => PropertyResult::pass("FIFO_Order"),
            Some(violation) => PropertyResult::fail("FIFO_Order", violation, None),
        }
    }

    /// Linearizability
    ///
    /// Searches for a sequential order of the timed history that respects
    /// real-time precedence and is legal for a FIFO queue. A sequential
    /// history has only one such order, so it is replayed directly.
    fn check_linearizability(&self) -> PropertyResult {
        let history = self.queue.history();
        if history.is_empty() {
            return PropertyResult::pass("Linearizability");
        }

        if history.is_sequential() {
            return match replay_fifo(&history) {
                None => PropertyResult::pass("Linearizability"),
                Some(violation) => {
                    let mut ce = self.counterexample().with_description(violation);
                    ce.add_operations(&history.operations);
                    PropertyResult::fail(
                        "Linearizability",
                        format!("Sequential history of {} operations is not FIFO", history.len()),
                        Some(ce),
                    )
                }
            };
        }

        match check_fifo_linearizable(&history.operations, self.linearizability_budget) {
            Linearizability::Linearizable { .. } => PropertyResult::pass("Linearizability"),
            Linearizability::Inconclusive { explored } => {
                tracing::warn!(
                    explored,
                    operations = history.len(),
                    "linearizability search budget exhausted"
                );
                PropertyResult::pass("Linearizability")
            }
            Linearizability::NotLinearizable { explored } => {
                let mut ce = self
                    .counterexample()
                    .with_description("no legal FIFO order respects the recorded intervals");
                ce.add_operations(&history.operations);
                PropertyResult::fail(
                    "Linearizability",
                    format!(
                        "History of {} operations is not linearizable ({} states explored)",
                        history.len(),
                        explored
                    ),
                    Some(ce),
                )
            }
        }
    }

    /// Reclamation
    ///
    /// A quiescent queue holds one node per queued element plus the
    /// sentinel; anything else is a leak or a premature free.
    fn check_reclamation(&self) -> PropertyResult {
        let Some(live_nodes) = self.queue.live_nodes() else {
            return PropertyResult::pass("Reclamation");
        };
        let reachable_nodes = self.queue.current_contents().len() as u64 + 1;

        if live_nodes == reachable_nodes {
            return PropertyResult::pass("Reclamation");
        }

        let mut ce = self.counterexample();
        let issue = if live_nodes > reachable_nodes {
            MemoryIssue::Leak {
                live_nodes,
                reachable_nodes,
            }
        } else {
            MemoryIssue::PrematureFree {
                live_nodes,
                reachable_nodes,
            }
        };
        let violation = issue.to_string();
        ce.add_memory_issue(issue);
        PropertyResult::fail("Reclamation", violation, Some(ce))
    }
}

/// Replay a sequential history against a model queue, returning the first
/// mismatch.
fn replay_fifo(history: &QueueHistory) -> Option<String> {
    let mut ops: Vec<&QueueOperation> = history.operations.iter().collect();
    ops.sort_by_key(|op| op.invoked_at);

    let mut model: VecDeque<u64> = VecDeque::new();
    for op in ops {
        match (op.op_type, op.element) {
            (QueueOpType::Push, Some(e)) => model.push_back(e),
            (QueueOpType::Pop, Some(expected)) => match model.pop_front() {
                Some(actual) if actual == expected => {}
                Some(actual) => {
                    return Some(format!(
                        "FIFO violated: pop returned {} but model expected {} (step {})",
                        expected, actual, op.invoked_at
                    ));
                }
                None => {
                    return Some(format!(
                        "FIFO violated: pop returned {} but model queue was empty (step {})",
                        expected, op.invoked_at
                    ));
                }
            },
            (QueueOpType::PopEmpty, _) if !model.is_empty() => {
                return Some(format!(
                    "FIFO violated: pop returned None but model has {} elements (step {})",
                    model.len(),
                    op.invoked_at
                ));
            }
            _ => {}
        }
    }
    None
}

impl<T: QueueProperties> PropertyChecker for QueuePropertyChecker<'_, T> {
    fn check_all(&self) -> Vec<PropertyResult> {
        vec![
            self.check_no_lost_elements(),
            self.check_no_duplicates(),
            self.check_no_phantom_elements(),
            self.check_per_producer_order(),
            self.check_fifo_order(),
            self.check_linearizability(),
            self.check_reclamation(),
        ]
    }
}
