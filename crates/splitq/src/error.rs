//! Errors surfaced by the queue.

use std::alloc::Layout;

use thiserror::Error;

/// Storage for a node or a payload could not be obtained.
///
/// Returned by [`SplitQueue::push`](crate::SplitQueue::push) before any
/// shared state is touched, so the queue is observably unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The global allocator refused a payload box.
    #[error("failed to allocate {} bytes for a queue payload", layout.size())]
    Payload { layout: Layout },

    /// The global allocator refused a new arena segment.
    #[error("failed to allocate a {slots}-slot node segment ({} bytes)", layout.size())]
    Segment { slots: usize, layout: Layout },

    /// The arena handed out every node slot it is allowed to.
    #[error("node storage exhausted ({limit} slots)")]
    Exhausted { limit: u32 },
}

impl AllocError {
    /// Layout of the refused request, if the allocator was involved.
    #[must_use]
    pub fn layout(&self) -> Option<Layout> {
        match *self {
            AllocError::Payload { layout } | AllocError::Segment { layout, .. } => Some(layout),
            AllocError::Exhausted { .. } => None,
        }
    }
}
