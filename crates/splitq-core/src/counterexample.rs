//! Failure paths for violated queue properties.
//!
//! A [`Counterexample`] collects what went wrong: per-thread actions laid
//! out by step, notes about queue state, reclamation problems, and the seed
//! that replays the run. [`Counterexample::render_diagram`] draws it as a
//! table with one column per thread.

use std::fmt::{self, Write as _};

use crate::invariants::queue::{QueueOpType, QueueOperation};

/// Histories longer than this are summarized instead of drawn.
const DIAGRAM_OPERATIONS_MAX: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct Counterexample {
    /// Notes on queue state, in step order
    pub states: Vec<StateSnapshot>,
    /// What each thread did, and when
    pub actions: Vec<ThreadAction>,
    pub memory_issues: Vec<MemoryIssue>,
    /// Seed that replays the run, when it came from a simulation
    pub dst_seed: Option<u64>,
    pub description: Option<String>,
}

/// A note about queue state at one step.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub step: u64,
    pub description: String,
    /// Named counters shown next to the description
    pub variables: Vec<(String, String)>,
}

/// One operation by one thread, placed at a diagram row.
#[derive(Debug, Clone)]
pub struct ThreadAction {
    pub thread_id: u64,
    pub step: u64,
    pub action: String,
    /// False for a pop that found the queue empty
    pub success: bool,
}

/// Reclamation problem detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryIssue {
    /// More nodes alive than the queue can reach.
    Leak {
        live_nodes: u64,
        reachable_nodes: u64,
    },
    /// Fewer nodes alive than the queue can reach: something was freed
    /// while still linked.
    PrematureFree {
        live_nodes: u64,
        reachable_nodes: u64,
    },
    /// A value came out of the queue more often than it went in.
    DoubleDelivery { element: u64, deliveries: usize },
}

impl fmt::Display for MemoryIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryIssue::Leak {
                live_nodes,
                reachable_nodes,
            } => write!(
                f,
                "Leak: {live_nodes} nodes alive but only {reachable_nodes} reachable from head"
            ),
            MemoryIssue::PrematureFree {
                live_nodes,
                reachable_nodes,
            } => write!(
                f,
                "Premature free: {reachable_nodes} nodes reachable from head but only {live_nodes} alive"
            ),
            MemoryIssue::DoubleDelivery {
                element,
                deliveries,
            } => write!(f, "Element {element} delivered {deliveries} times"),
        }
    }
}

impl StateSnapshot {
    fn render(&self) -> String {
        if self.variables.is_empty() {
            return self.description.clone();
        }
        let vars: Vec<String> = self
            .variables
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        format!("{} ({})", self.description, vars.join(", "))
    }
}

impl ThreadAction {
    fn cell(&self) -> String {
        if self.success {
            self.action.clone()
        } else {
            format!("{} [EMPTY]", self.action)
        }
    }
}

impl Counterexample {
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        debug_assert!(seed != 0, "DST seed should not be zero");
        Self {
            dst_seed: Some(seed),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn maybe_seeded(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::default, Self::with_seed)
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn add_state(&mut self, state: StateSnapshot) {
        debug_assert!(
            self.states.last().map_or(true, |last| state.step > last.step),
            "states must be added in step order"
        );
        self.states.push(state);
    }

    pub fn add_action(&mut self, action: ThreadAction) {
        self.actions.push(action);
    }

    pub fn add_memory_issue(&mut self, issue: MemoryIssue) {
        self.memory_issues.push(issue);
    }

    /// Add one action per recorded operation, at its invocation step.
    ///
    /// Timestamps are ranked so the diagram has no empty rows. Long
    /// histories only get a summary state.
    pub fn add_operations(&mut self, operations: &[QueueOperation]) {
        if operations.len() > DIAGRAM_OPERATIONS_MAX {
            self.add_state(StateSnapshot {
                step: 1,
                description: format!("{} operations (too many to draw)", operations.len()),
                variables: vec![],
            });
            return;
        }

        let mut stamps: Vec<u64> = operations.iter().map(|op| op.invoked_at).collect();
        stamps.sort_unstable();
        stamps.dedup();

        self.actions.extend(operations.iter().map(|op| ThreadAction {
            thread_id: op.thread_id,
            step: stamps.partition_point(|&s| s < op.invoked_at) as u64 + 1,
            action: op.describe(),
            success: op.op_type != QueueOpType::PopEmpty,
        }));
    }

    /// Draw the failure as a step-by-thread table.
    ///
    /// ```text
    /// DST_SEED=12345
    ///
    /// Step | Thread 0 | Thread 1      | State
    /// -----|----------|---------------|------
    ///    1 | push(42) |               | Elements [42] lost
    ///    2 |          | pop() [EMPTY] |
    /// ```
    #[must_use]
    pub fn render_diagram(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_diagram(&mut out);
        out
    }

    fn write_diagram(&self, out: &mut String) -> fmt::Result {
        if let Some(seed) = self.dst_seed {
            writeln!(out, "DST_SEED={seed}\n")?;
        }
        if let Some(description) = &self.description {
            writeln!(out, "Failure: {description}\n")?;
        }

        let mut threads: Vec<u64> = self.actions.iter().map(|a| a.thread_id).collect();
        threads.sort_unstable();
        threads.dedup();

        if threads.is_empty() {
            for state in &self.states {
                writeln!(out, "{:4} | {}", state.step, state.render())?;
            }
        } else {
            let widths: Vec<usize> = threads
                .iter()
                .map(|&tid| {
                    self.actions
                        .iter()
                        .filter(|a| a.thread_id == tid)
                        .map(|a| a.cell().len())
                        .chain([format!("Thread {tid}").len()])
                        .max()
                        .unwrap_or(0)
                })
                .collect();

            write!(out, "Step |")?;
            for (tid, width) in threads.iter().zip(&widths) {
                write!(out, " {:<width$} |", format!("Thread {tid}"))?;
            }
            writeln!(out, " State")?;
            write!(out, "-----|")?;
            for width in &widths {
                write!(out, "{}|", "-".repeat(width + 2))?;
            }
            writeln!(out, "------")?;

            let last_step = self
                .actions
                .iter()
                .map(|a| a.step)
                .chain(self.states.iter().map(|s| s.step))
                .max()
                .unwrap_or(0);
            for step in 1..=last_step {
                write!(out, "{step:4} |")?;
                for (&tid, width) in threads.iter().zip(&widths) {
                    let cell = self
                        .actions
                        .iter()
                        .find(|a| a.step == step && a.thread_id == tid)
                        .map(ThreadAction::cell)
                        .unwrap_or_default();
                    write!(out, " {cell:<width$} |")?;
                }
                match self.states.iter().find(|s| s.step == step) {
                    Some(state) => writeln!(out, " {}", state.render())?,
                    None => writeln!(out)?,
                }
            }
        }

        if !self.memory_issues.is_empty() {
            writeln!(out, "\nMemory Issues:")?;
            for issue in &self.memory_issues {
                writeln!(out, "  - {issue}")?;
            }
        }
        Ok(())
    }
}
