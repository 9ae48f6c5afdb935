//! Segmented node storage addressed by 32-bit index.
//!
//! Tagged node pointers need to fit a node reference and a use count into
//! one 64-bit atomic, so nodes are addressed by index into this arena
//! instead of by raw pointer.
//!
//! Segments double in size and are installed lazily with a CAS; once
//! installed they stay put until the arena is dropped, so any index ever
//! handed out names addressable memory for the arena's whole lifetime.
//! Reclaimed slots go on a Treiber free list whose head carries a
//! generation tag, which keeps the free list itself immune to ABA.

use std::alloc::Layout;
use std::ptr;

use crate::counted::{AtomicCountedPtr, AtomicRefCount, CountedPtr, RefCount, NULL_INDEX};
use crate::error::AllocError;
use crate::loom::{retry, AtomicPtr, AtomicU32, AtomicU64, Backoff, Ordering};

/// log2 of the first segment's slot count.
#[cfg(not(loom))]
const FIRST_SEGMENT_BITS: u32 = 5;
#[cfg(loom)]
const FIRST_SEGMENT_BITS: u32 = 1;

/// Enough doubling segments to cover every index below [`NULL_INDEX`].
const SEGMENTS_COUNT: usize = (33 - FIRST_SEGMENT_BITS) as usize;

/// Largest number of slots an arena can hand out.
pub(crate) const SLOTS_MAX: u32 = NULL_INDEX;

/// Its address marks a payload slot whose value has been popped.
static TAKEN: u8 = 0;

/// A queue cell.
pub(crate) struct Node<T> {
    /// Boxed item. Null until a push claims the slot, [`Node::taken`] once
    /// a pop has emptied it. A taken slot never goes back to null while the
    /// node is live, so a push holding a stale check-out cannot refill it.
    pub(crate) payload: AtomicPtr<T>,
    pub(crate) next: AtomicCountedPtr,
    pub(crate) refs: AtomicRefCount,
    /// Free list link, only meaningful while the slot is free.
    free_next: AtomicU32,
}

impl<T> Node<T> {
    fn vacant() -> Self {
        Self {
            payload: AtomicPtr::new(ptr::null_mut()),
            next: AtomicCountedPtr::new(CountedPtr::NULL),
            refs: AtomicRefCount::new(RefCount::FRESH),
            free_next: AtomicU32::new(NULL_INDEX),
        }
    }

    /// Payload marker for an emptied slot. Never dereferenced.
    pub(crate) fn taken() -> *mut T {
        ptr::addr_of!(TAKEN).cast_mut().cast()
    }

    /// Whether `payload` points at a value the node still owns.
    pub(crate) fn owns(payload: *mut T) -> bool {
        !payload.is_null() && payload != Self::taken()
    }

    /// Prepare a recycled slot for reuse. The caller owns the slot.
    fn reset(&self) {
        let stale = self.payload.swap(ptr::null_mut(), Ordering::Relaxed);
        if Self::owns(stale) {
            crate::invariant_violated("recycled node still owns a payload");
        }
        self.next.store(CountedPtr::NULL, Ordering::Relaxed);
        self.refs.store(RefCount::FRESH, Ordering::Relaxed);
    }
}

/// Node allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Nodes handed out, fresh or recycled.
    pub nodes_allocated: u64,
    /// Nodes returned to the free list.
    pub nodes_freed: u64,
    /// Slots ever carved out of segments.
    pub slots_reserved: u64,
}

impl ReclaimStats {
    /// Nodes allocated and not yet freed.
    #[must_use]
    pub fn live_nodes(&self) -> u64 {
        self.nodes_allocated.saturating_sub(self.nodes_freed)
    }
}

pub(crate) struct NodeArena<T> {
    segments: [AtomicPtr<Node<T>>; SEGMENTS_COUNT],
    /// Next never-used index.
    next_fresh: AtomicU64,
    /// Packed `{generation, index}` of the free list top.
    free_head: AtomicU64,
    limit: u32,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl<T> NodeArena<T> {
    pub(crate) fn new(limit: u32) -> Self {
        debug_assert!(limit > 0, "arena must allow at least one node");
        Self {
            segments: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            next_fresh: AtomicU64::new(0),
            free_head: AtomicU64::new(pack_free(0, NULL_INDEX)),
            limit: limit.min(SLOTS_MAX),
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    /// Hand out a node with an empty payload, a null `next`, and a fresh
    /// reference counter.
    pub(crate) fn allocate(&self) -> Result<u32, AllocError> {
        let index = match self.pop_free() {
            Some(index) => {
                self.node(index).reset();
                index
            }
            None => self.reserve_fresh()?,
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Return a node to the free list. The caller holds the last reference.
    pub(crate) fn free(&self, index: u32) {
        debug_assert!(
            !Node::owns(self.node(index).payload.load(Ordering::Relaxed)),
            "freeing node {} that still owns a payload",
            index
        );
        self.freed.fetch_add(1, Ordering::Relaxed);
        self.push_free(index);
    }

    /// Internal check-in on `index`, freeing the node if it was the last.
    pub(crate) fn release_ref(&self, index: u32) {
        if self.node(index).refs.release_internal() {
            self.free(index);
        }
    }

    /// External check-in of a value that left its shared slot, freeing the
    /// node if it was the last reference.
    pub(crate) fn free_external_counter(&self, old: CountedPtr) {
        if self.node(old.index).refs.release_external(old.count) {
            self.free(old.index);
        }
    }

    pub(crate) fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            nodes_allocated: self.allocated.load(Ordering::Relaxed),
            nodes_freed: self.freed.load(Ordering::Relaxed),
            slots_reserved: self
                .next_fresh
                .load(Ordering::Relaxed)
                .min(u64::from(self.limit)),
        }
    }

    /// Resolve an index handed out by this arena.
    pub(crate) fn node(&self, index: u32) -> &Node<T> {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            crate::invariant_violated("node index outside installed segments");
        }
        // SAFETY: `base` points at an installed segment of
        // `segment_len(segment)` initialized nodes, `offset` is below that
        // length, and segments are only deallocated in `Drop`.
        unsafe { &*base.add(offset) }
    }

    fn reserve_fresh(&self) -> Result<u32, AllocError> {
        let fresh = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        if fresh >= u64::from(self.limit) {
            return Err(AllocError::Exhausted { limit: self.limit });
        }
        let index = fresh as u32;
        let (segment, _) = locate(index);
        self.install_segment(segment)?;
        Ok(index)
    }

    fn install_segment(&self, segment: usize) -> Result<(), AllocError> {
        if !self.segments[segment].load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        let slots = segment_len(segment);
        let mut nodes: Vec<Node<T>> = Vec::new();
        if nodes.try_reserve_exact(slots).is_err() {
            let layout =
                Layout::array::<Node<T>>(slots).unwrap_or_else(|_| Layout::new::<Node<T>>());
            tracing::warn!(segment, slots, "node segment allocation failed");
            return Err(AllocError::Segment { slots, layout });
        }
        nodes.extend((0..slots).map(|_| Node::vacant()));
        let fresh = Box::into_raw(nodes.into_boxed_slice()).cast::<Node<T>>();

        match self.segments[segment].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::debug!(segment, slots, "installed node segment");
            }
            Err(_) => {
                // SAFETY: `fresh` came from `Box::into_raw` above and lost
                // the race, so nobody else has seen it.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, slots)) });
            }
        }
        Ok(())
    }

    fn pop_free(&self) -> Option<u32> {
        let backoff = Backoff::new();
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let (generation, index) = unpack_free(head);
            if index == NULL_INDEX {
                return None;
            }
            // May be stale if another thread pops `index` first; the
            // generation bump makes our CAS fail in that case.
            let next = self.node(index).free_next.load(Ordering::Relaxed);
            let new_head = pack_free(generation.wrapping_add(1), next);
            match self.free_head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => {
                    head = actual;
                    retry(&backoff);
                }
            }
        }
    }

    fn push_free(&self, index: u32) {
        let backoff = Backoff::new();
        let node = self.node(index);
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let (generation, top) = unpack_free(head);
            node.free_next.store(top, Ordering::Relaxed);
            let new_head = pack_free(generation.wrapping_add(1), index);
            match self.free_head.compare_exchange_weak(
                head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    retry(&backoff);
                }
            }
        }
    }
}

impl<T> Drop for NodeArena<T> {
    fn drop(&mut self) {
        for (segment, slot) in self.segments.iter().enumerate() {
            let base = slot.load(Ordering::Relaxed);
            if base.is_null() {
                continue;
            }
            let nodes = segment_len(segment);
            // SAFETY: installed segments come from `Box<[Node<T>]>` of
            // exactly this length; `&mut self` rules out other users.
            let boxed = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, nodes)) };
            for node in boxed.iter() {
                let payload = node.payload.load(Ordering::Relaxed);
                if Node::owns(payload) {
                    // SAFETY: an owned payload is a box that no pop has
                    // taken.
                    drop(unsafe { Box::from_raw(payload) });
                }
            }
            drop(boxed);
        }
    }
}

/// Slot count of `segment`.
fn segment_len(segment: usize) -> usize {
    1usize << (segment as u32 + FIRST_SEGMENT_BITS)
}

/// Map an index to `(segment, offset)`.
fn locate(index: u32) -> (usize, usize) {
    let shifted = u64::from(index) + (1u64 << FIRST_SEGMENT_BITS);
    let msb = 63 - shifted.leading_zeros();
    let segment = (msb - FIRST_SEGMENT_BITS) as usize;
    let offset = (shifted - (1u64 << msb)) as usize;
    (segment, offset)
}

fn pack_free(generation: u32, index: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(index)
}

fn unpack_free(bits: u64) -> (u32, u32) {
    ((bits >> 32) as u32, bits as u32)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_locate_covers_index_space() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));

        let (last_segment, last_offset) = locate(NULL_INDEX - 1);
        assert!(last_segment < SEGMENTS_COUNT);
        assert!(last_offset < segment_len(last_segment));
    }

    #[test]
    fn test_freed_slots_are_recycled() {
        let arena: NodeArena<u64> = NodeArena::new(SLOTS_MAX);

        let a = arena.allocate().unwrap();
        let b = arena.allocate().unwrap();
        assert_ne!(a, b);

        arena.free(a);
        let c = arena.allocate().unwrap();
        assert_eq!(c, a, "free list should hand back the freed slot");

        let stats = arena.stats();
        assert_eq!(stats.nodes_allocated, 3);
        assert_eq!(stats.nodes_freed, 1);
        assert_eq!(stats.live_nodes(), 2);
        assert_eq!(stats.slots_reserved, 2);
    }

    #[test]
    fn test_recycled_node_is_reset() {
        let arena: NodeArena<u64> = NodeArena::new(SLOTS_MAX);
        let index = arena.allocate().unwrap();
        let node = arena.node(index);

        node.payload.store(Node::taken(), Ordering::Relaxed);
        node.next.store(CountedPtr::installed(9), Ordering::Relaxed);
        node.refs.store(
            RefCount {
                internal: 0,
                external: 0,
            },
            Ordering::Relaxed,
        );
        arena.free(index);

        let again = arena.allocate().unwrap();
        assert_eq!(again, index);
        let node = arena.node(again);
        assert!(node.payload.load(Ordering::Relaxed).is_null());
        assert!(node.next.load(Ordering::Relaxed).is_null());
        assert_eq!(node.refs.load(Ordering::Relaxed), RefCount::FRESH);
    }

    #[test]
    fn test_taken_marker_is_not_a_value() {
        assert!(!Node::<u64>::owns(ptr::null_mut()));
        assert!(!Node::<u64>::owns(Node::<u64>::taken()));
        // Zero-sized payloads live at a dangling address, not the marker.
        assert!(Node::<()>::owns(ptr::NonNull::<()>::dangling().as_ptr()));

        // Dropping the arena must skip taken slots.
        let arena: NodeArena<String> = NodeArena::new(SLOTS_MAX);
        let taken = arena.allocate().unwrap();
        let held = arena.allocate().unwrap();
        arena.node(taken).payload.store(Node::taken(), Ordering::Relaxed);
        let value = Box::into_raw(Box::new(String::from("queued")));
        arena.node(held).payload.store(value, Ordering::Relaxed);
        drop(arena);
    }

    #[test]
    fn test_limit_reports_exhaustion() {
        let arena: NodeArena<u64> = NodeArena::new(2);
        arena.allocate().unwrap();
        let last = arena.allocate().unwrap();

        assert_eq!(
            arena.allocate(),
            Err(AllocError::Exhausted { limit: 2 })
        );

        // Recycled slots are still available past the limit.
        arena.free(last);
        assert_eq!(arena.allocate(), Ok(last));
    }

    #[test]
    fn test_grows_across_segments() {
        let arena: NodeArena<u64> = NodeArena::new(SLOTS_MAX);
        let indices: Vec<u32> = (0..200).map(|_| arena.allocate().unwrap()).collect();
        for (expected, index) in indices.iter().enumerate() {
            assert_eq!(*index as usize, expected);
            assert!(arena.node(*index).payload.load(Ordering::Relaxed).is_null());
        }
    }
}
