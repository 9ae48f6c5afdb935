//! Lock-free MPMC FIFO queue with split reference counting.
//!
//! # Structure
//!
//! The queue is a singly-linked list that always holds at least one
//! sentinel node. `tail` names a node whose payload slot is still empty;
//! a push claims that slot, links a fresh successor, and swings `tail` to
//! it. A pop swings `head` past a node strictly behind `tail` and takes the
//! payload that node carries, leaving a "taken" marker behind. The marker
//! is what stops a push that checked out `tail` long ago from claiming a
//! node that has already been filled and emptied.
//!
//! # Progress
//!
//! Both operations are lock-free. A push that finds the tail's payload
//! already claimed helps the claiming push by linking the successor and
//! advancing `tail` before retrying, so a stalled thread never blocks the
//! others.
//!
//! # Reclamation
//!
//! Every dereference of a node reached through `head` or `tail` is
//! preceded by a check-out of that slot (see [`crate::counted`]). Nodes are
//! returned to the arena by whichever thread drops the last reference,
//! which may be long after the pop that emptied them.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crossbeam_utils::CachePadded;

use crate::arena::{Node, NodeArena, ReclaimStats, SLOTS_MAX};
use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::error::AllocError;
use crate::loom::{retry, Backoff, Ordering};

/// An unbounded lock-free multi-producer multi-consumer FIFO queue.
///
/// # Examples
///
/// ```
/// use splitq::SplitQueue;
///
/// let queue = SplitQueue::new();
/// queue.push("a").unwrap();
/// queue.push("b").unwrap();
///
/// assert_eq!(queue.pop(), Some("a"));
/// assert_eq!(queue.pop(), Some("b"));
/// assert_eq!(queue.pop(), None);
/// ```
pub struct SplitQueue<T> {
    head: CachePadded<AtomicCountedPtr>,
    tail: CachePadded<AtomicCountedPtr>,
    arena: NodeArena<T>,
    _marker: PhantomData<*mut T>,
}

impl<T> SplitQueue<T> {
    /// Create an empty queue.
    ///
    /// Aborts through [`alloc::handle_alloc_error`] if the sentinel node
    /// cannot be allocated; use [`SplitQueue::try_new`] to observe that
    /// instead.
    #[must_use]
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(queue) => queue,
            Err(err) => {
                tracing::error!(%err, "cannot allocate queue sentinel");
                alloc::handle_alloc_error(err.layout().unwrap_or_else(Layout::new::<T>))
            }
        }
    }

    /// Create an empty queue, reporting allocation failure.
    pub fn try_new() -> Result<Self, AllocError> {
        Self::with_node_limit(SLOTS_MAX)
    }

    /// Create an empty queue whose arena hands out at most `limit` node
    /// slots over its lifetime (recycled slots do not count twice).
    ///
    /// Once the limit is reached and no slot has been reclaimed, `push`
    /// returns [`AllocError::Exhausted`]. The sentinel takes one slot.
    pub fn with_node_limit(limit: u32) -> Result<Self, AllocError> {
        let arena = NodeArena::new(limit.max(1));
        let sentinel = CountedPtr::installed(arena.allocate()?);
        Ok(Self {
            head: CachePadded::new(AtomicCountedPtr::new(sentinel)),
            tail: CachePadded::new(AtomicCountedPtr::new(sentinel)),
            arena,
            _marker: PhantomData,
        })
    }

    /// Append `value` at the tail.
    ///
    /// Fails only if storage for the value or its successor node cannot be
    /// obtained; the queue is then unchanged and `value` is dropped.
    pub fn push(&self, value: T) -> Result<(), AllocError> {
        let payload = Payload::new(value)?;
        let mut spare: Option<u32> = None;
        let mut old_tail = self.tail.load(Ordering::Acquire);

        loop {
            // Allocate before checking anything out so that a failure
            // leaves nothing to undo.
            let new_node = match spare {
                Some(index) => index,
                None => {
                    let index = self.arena.allocate()?;
                    spare = Some(index);
                    index
                }
            };
            let new_next = CountedPtr::installed(new_node);

            self.tail.increase_external_count(&mut old_tail);
            let node = self.arena.node(old_tail.index);

            match node.payload.compare_exchange(
                ptr::null_mut(),
                payload.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let next = match node.next.compare_exchange(
                        CountedPtr::NULL,
                        new_next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => new_next,
                        Err(linked) => {
                            // A helper linked its own node first.
                            self.arena.free(new_node);
                            linked
                        }
                    };
                    self.set_new_tail(old_tail, next);
                    payload.into_raw();
                    return Ok(());
                }
                Err(_) => {
                    // Another push owns this node; finish its link for it.
                    let next = match node.next.compare_exchange(
                        CountedPtr::NULL,
                        new_next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            spare = None;
                            new_next
                        }
                        Err(linked) => linked,
                    };
                    self.set_new_tail(old_tail, next);
                    old_tail = self.tail.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Remove and return the oldest value, or `None` if the queue holds no
    /// value at the moment of the check.
    ///
    /// A push that has not yet installed its value is not observed; this is
    /// consistent with that push linearizing after the pop.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut old_head = self.head.load(Ordering::Acquire);

        loop {
            self.head.increase_external_count(&mut old_head);
            let index = old_head.index;

            if index == self.tail.load(Ordering::Acquire).index {
                self.arena.release_ref(index);
                return None;
            }

            let node = self.arena.node(index);
            let next = node.next.load(Ordering::Acquire);
            if next.is_null() {
                crate::invariant_violated("node behind tail has no successor");
            }

            match self
                .head
                .compare_exchange(old_head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // Marked rather than nulled: a push still holding a
                    // check-out on this node must not see a free slot.
                    let data = node.payload.swap(Node::taken(), Ordering::AcqRel);
                    self.arena.free_external_counter(old_head);
                    let Some(data) = NonNull::new(data).filter(|p| Node::owns(p.as_ptr())) else {
                        crate::invariant_violated("detached node carried no payload");
                    };
                    // SAFETY: the payload was installed by exactly one push
                    // and the successful head CAS makes this the only pop
                    // that swaps it out.
                    return Some(unsafe { Payload::from_raw(data) }.into_inner());
                }
                Err(actual) => {
                    self.arena.release_ref(index);
                    old_head = actual;
                    retry(&backoff);
                }
            }
        }
    }

    /// Whether the queue held no value at the moment of the check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).index == self.tail.load(Ordering::Acquire).index
    }

    /// Node allocation and reclamation counters.
    ///
    /// Once every operation has returned and the queue is drained,
    /// [`ReclaimStats::live_nodes`] is exactly 1: the sentinel.
    #[must_use]
    pub fn stats(&self) -> ReclaimStats {
        self.arena.stats()
    }

    /// Number of values between `head` and `tail`. Exclusive access makes
    /// the walk consistent.
    #[must_use]
    pub fn len(&mut self) -> usize {
        self.walk().count()
    }

    /// Clone out the queued values, oldest first.
    #[must_use]
    pub fn to_vec(&mut self) -> Vec<T>
    where
        T: Clone,
    {
        self.walk()
            // SAFETY: `&mut self` rules out a concurrent pop taking the
            // payload while we read it.
            .map(|payload| unsafe { (*payload).clone() })
            .collect()
    }

    /// Payload pointers from `head` up to (excluding) `tail`.
    fn walk(&mut self) -> impl Iterator<Item = *mut T> + '_ {
        let tail = self.tail.load(Ordering::Acquire).index;
        let mut current = self.head.load(Ordering::Acquire).index;
        std::iter::from_fn(move || {
            if current == tail {
                return None;
            }
            let node = self.arena.node(current);
            current = node.next.load(Ordering::Acquire).index;
            Some(node.payload.load(Ordering::Acquire))
        })
        .filter(|&payload| Node::owns(payload))
    }

    /// CAS `tail` from `old_tail` to `new_tail` unless another thread has
    /// already moved it off `old_tail`'s node, then check `old_tail` in.
    fn set_new_tail(&self, mut old_tail: CountedPtr, new_tail: CountedPtr) {
        let current = old_tail.index;
        loop {
            match self.tail.compare_exchange_weak(
                old_tail,
                new_tail,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    old_tail = actual;
                    if actual.index != current {
                        break;
                    }
                }
            }
        }

        if old_tail.index == current {
            self.arena.free_external_counter(old_tail);
        } else {
            self.arena.release_ref(current);
        }
    }
}

impl<T> Default for SplitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SplitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> Drop for SplitQueue<T> {
    fn drop(&mut self) {
        // The arena drops whatever payloads are still queued.
        let remaining = self.walk().count();
        if remaining > 0 {
            tracing::trace!(remaining, "dropping non-empty queue");
        }
    }
}

// SAFETY: values move between threads through the queue but are never
// shared; every access to a payload is exclusive to one push or one pop.
unsafe impl<T: Send> Send for SplitQueue<T> {}
unsafe impl<T: Send> Sync for SplitQueue<T> {}

/// An owned, heap-allocated queue item in transit.
///
/// Allocated through the global allocator with `Layout::new::<T>()`, so it
/// can be reclaimed with `Box::from_raw`.
struct Payload<T>(NonNull<T>);

impl<T> Payload<T> {
    fn new(value: T) -> Result<Self, AllocError> {
        let layout = Layout::new::<T>();
        if layout.size() == 0 {
            return Ok(Self(NonNull::from(Box::leak(Box::new(value)))));
        }

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc(layout) }.cast::<T>();
        let Some(ptr) = NonNull::new(raw) else {
            tracing::warn!(size = layout.size(), "payload allocation failed");
            return Err(AllocError::Payload { layout });
        };
        // SAFETY: fresh allocation sized and aligned for `T`.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self(ptr))
    }

    /// Take back ownership of a payload pointer published by `into_raw`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Payload::into_raw`] and not have been
    /// reclaimed already.
    unsafe fn from_raw(ptr: NonNull<T>) -> Self {
        Self(ptr)
    }

    fn as_ptr(&self) -> *mut T {
        self.0.as_ptr()
    }

    fn into_raw(self) -> *mut T {
        let ptr = self.0.as_ptr();
        mem::forget(self);
        ptr
    }

    fn into_inner(self) -> T {
        let ptr = self.into_raw();
        // SAFETY: `ptr` is an owned box in the global allocator.
        *unsafe { Box::from_raw(ptr) }
    }
}

impl<T> Drop for Payload<T> {
    fn drop(&mut self) {
        // SAFETY: see `into_inner`.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}


#[cfg(loom)]
mod loom_tests {
    use super::*;
    use ::loom::sync::Arc;
    use ::loom::thread;

    #[test]
    fn test_push_push() {
        ::loom::model(|| {
            let queue = Arc::new(SplitQueue::new());

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.push(1).unwrap());
            let h2 = thread::spawn(move || q2.push(2).unwrap());
            h1.join().unwrap();
            h2.join().unwrap();

            let mut values = vec![];
            while let Some(v) = queue.pop() {
                values.push(v);
            }
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);
            assert_eq!(queue.stats().live_nodes(), 1);
        });
    }

    #[test]
    fn test_push_pop() {
        ::loom::model(|| {
            let queue = Arc::new(SplitQueue::new());
            queue.push(1).unwrap();

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.push(2).unwrap());
            let h2 = thread::spawn(move || q2.pop());
            h1.join().unwrap();

            // The item pushed before the threads started is always first.
            assert_eq!(h2.join().unwrap(), Some(1));
            assert_eq!(queue.pop(), Some(2));
            assert_eq!(queue.pop(), None);
            assert_eq!(queue.stats().live_nodes(), 1);
        });
    }

    #[test]
    fn test_concurrent_pop() {
        ::loom::model(|| {
            let queue = Arc::new(SplitQueue::new());
            queue.push(1).unwrap();

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.pop());
            let h2 = thread::spawn(move || q2.pop());

            match (h1.join().unwrap(), h2.join().unwrap()) {
                (Some(1), None) | (None, Some(1)) => {}
                other => panic!("Unexpected result: {:?}", other),
            }
            assert_eq!(queue.stats().live_nodes(), 1);
        });
    }

    /// Three-thread models need a preemption bound to stay tractable.
    fn bounded() -> ::loom::model::Builder {
        let mut builder = ::loom::model::Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(2);
        }
        builder
    }

    #[test]
    fn test_push_push_pop() {
        bounded().check(|| {
            let queue = Arc::new(SplitQueue::new());

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let q3 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.push(1).unwrap());
            let h2 = thread::spawn(move || q2.push(2).unwrap());
            let h3 = thread::spawn(move || q3.pop());
            h1.join().unwrap();
            h2.join().unwrap();

            let mut values: Vec<i32> = h3.join().unwrap().into_iter().collect();
            while let Some(v) = queue.pop() {
                values.push(v);
            }
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);
            assert_eq!(queue.stats().live_nodes(), 1);
        });
    }

    #[test]
    fn test_pop_pop_push() {
        bounded().check(|| {
            let queue = Arc::new(SplitQueue::new());
            queue.push(1).unwrap();

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let q3 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.pop());
            let h2 = thread::spawn(move || q2.pop());
            let h3 = thread::spawn(move || q3.push(2).unwrap());
            let first = h1.join().unwrap();
            let second = h2.join().unwrap();
            h3.join().unwrap();

            // 1 was queued before anyone started, so no pop can see 2
            // without 1 having been taken already.
            let mut values: Vec<i32> = first.into_iter().chain(second).collect();
            assert!(values.contains(&1), "{:?}", values);
            while let Some(v) = queue.pop() {
                values.push(v);
            }
            values.sort_unstable();
            assert_eq!(values, vec![1, 2]);
            assert_eq!(queue.stats().live_nodes(), 1);
        });
    }

    #[test]
    fn test_pop_on_empty_races_push() {
        ::loom::model(|| {
            let queue = Arc::new(SplitQueue::new());

            let q1 = Arc::clone(&queue);
            let q2 = Arc::clone(&queue);
            let h1 = thread::spawn(move || q1.push(7).unwrap());
            let h2 = thread::spawn(move || q2.pop());
            h1.join().unwrap();

            match h2.join().unwrap() {
                Some(7) => assert_eq!(queue.pop(), None),
                None => assert_eq!(queue.pop(), Some(7)),
                other => panic!("Unexpected result: {:?}", other),
            }
            assert_eq!(queue.stats().live_nodes(), 1);
        });
    }
}
