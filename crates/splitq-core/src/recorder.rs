//! Timed history recording for real threads.
//!
//! Every thread gets a [`ThreadRecorder`] sharing one logical clock. An
//! operation takes a tick before it runs and another after it returns, so
//! its interval contains its linearization point and two operations whose
//! intervals do not overlap really did happen in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::invariants::queue::{QueueHistory, QueueOpType, QueueOperation};

/// Source of per-thread recorders.
#[derive(Debug, Clone)]
pub struct HistoryRecorder {
    clock: Arc<AtomicU64>,
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Recorder for one thread. Each thread should use its own id.
    #[must_use]
    pub fn thread(&self, thread_id: u64) -> ThreadRecorder {
        ThreadRecorder {
            thread_id,
            clock: Arc::clone(&self.clock),
            history: QueueHistory::new(),
        }
    }
}

/// Records one thread's operations.
#[derive(Debug)]
pub struct ThreadRecorder {
    thread_id: u64,
    clock: Arc<AtomicU64>,
    history: QueueHistory,
}

impl ThreadRecorder {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Run a push and record it if it succeeded.
    ///
    /// A failed push changes nothing, so it is left out of the history.
    pub fn record_push<E>(
        &mut self,
        element: u64,
        push: impl FnOnce() -> Result<(), E>,
    ) -> Result<(), E> {
        let invoked_at = self.tick();
        push()?;
        let returned_at = self.tick();
        self.history.record(QueueOperation {
            thread_id: self.thread_id,
            op_type: QueueOpType::Push,
            element: Some(element),
            invoked_at,
            returned_at,
        });
        Ok(())
    }

    /// Run a pop and record what it returned.
    pub fn record_pop(&mut self, pop: impl FnOnce() -> Option<u64>) -> Option<u64> {
        let invoked_at = self.tick();
        let element = pop();
        let returned_at = self.tick();
        self.history.record(QueueOperation {
            thread_id: self.thread_id,
            op_type: if element.is_some() {
                QueueOpType::Pop
            } else {
                QueueOpType::PopEmpty
            },
            element,
            invoked_at,
            returned_at,
        });
        element
    }

    #[must_use]
    pub fn finish(self) -> QueueHistory {
        self.history
    }
}
