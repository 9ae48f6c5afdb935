//! Tagged node pointers and split reference counts.
//!
//! A node is kept alive by two kinds of references:
//!
//! - **external** uses travel with a pointer *value*: every thread that
//!   checks out `head` or `tail` bumps the use count stored next to the
//!   node index in the same atomic word.
//! - **internal** references live in the node itself and collect the
//!   check-outs of a pointer value once that value has been replaced in
//!   its shared slot.
//!
//! The node's counter also records how many shared slots (`head`, `tail`)
//! still hold a value naming it. A node may be reclaimed only when both
//! halves reach zero.
//!
//! # Counter width
//!
//! Use counts and internal counts are 32 bits wide and use wrapping
//! arithmetic. Intermediate values may wrap (an internal count goes
//! "negative" while a check-in races ahead of the fold of external uses),
//! but the zero test stays exact as long as fewer than 2^32 references to
//! one node are outstanding at the same moment, which bounds the number of
//! simultaneously active threads rather than the total number of
//! operations.

use crate::loom::{retry, AtomicU64, Backoff, Ordering};

/// Index reserved for "no node".
pub(crate) const NULL_INDEX: u32 = u32::MAX;

/// Number of shared slots that can name a freshly linked node.
pub(crate) const SHARED_SLOTS: u8 = 2;

/// Mask over the bits that hold the external slot count.
const EXTERNAL_MASK: u64 = 0b11;

/// Shift of the external slot count inside the packed counter.
const EXTERNAL_SHIFT: u32 = 32;

/// A node index paired with the use count of this particular value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CountedPtr {
    pub(crate) index: u32,
    pub(crate) count: u32,
}

impl CountedPtr {
    pub(crate) const NULL: Self = Self {
        index: NULL_INDEX,
        count: 0,
    };

    /// A value about to be installed into a shared slot. The slot itself
    /// owns one use.
    #[must_use]
    pub(crate) fn installed(index: u32) -> Self {
        debug_assert!(index != NULL_INDEX, "installing a null node");
        Self { index, count: 1 }
    }

    #[must_use]
    pub(crate) fn is_null(self) -> bool {
        self.index == NULL_INDEX
    }

    #[must_use]
    fn to_bits(self) -> u64 {
        (u64::from(self.count) << 32) | u64::from(self.index)
    }

    #[must_use]
    fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            count: (bits >> 32) as u32,
        }
    }
}

/// A [`CountedPtr`] read and written as a single 64-bit atomic.
pub(crate) struct AtomicCountedPtr(AtomicU64);

impl AtomicCountedPtr {
    pub(crate) fn new(ptr: CountedPtr) -> Self {
        Self(AtomicU64::new(ptr.to_bits()))
    }

    pub(crate) fn load(&self, order: Ordering) -> CountedPtr {
        CountedPtr::from_bits(self.0.load(order))
    }

    pub(crate) fn store(&self, ptr: CountedPtr, order: Ordering) {
        self.0.store(ptr.to_bits(), order);
    }

    pub(crate) fn compare_exchange(
        &self,
        current: CountedPtr,
        new: CountedPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr, CountedPtr> {
        self.0
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(CountedPtr::from_bits)
            .map_err(CountedPtr::from_bits)
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: CountedPtr,
        new: CountedPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr, CountedPtr> {
        self.0
            .compare_exchange_weak(current.to_bits(), new.to_bits(), success, failure)
            .map(CountedPtr::from_bits)
            .map_err(CountedPtr::from_bits)
    }

    /// Check out the slot's current value.
    ///
    /// On return `snapshot` holds the value now stored in the slot, whose
    /// use count includes this caller. The node it names stays allocated
    /// until the caller checks the use back in through
    /// [`AtomicRefCount::release_internal`] or
    /// [`AtomicRefCount::release_external`].
    pub(crate) fn increase_external_count(&self, snapshot: &mut CountedPtr) {
        let backoff = Backoff::new();
        loop {
            let bumped = CountedPtr {
                index: snapshot.index,
                count: snapshot.count.wrapping_add(1),
            };
            match self.compare_exchange_weak(*snapshot, bumped, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    *snapshot = bumped;
                    return;
                }
                Err(actual) => {
                    *snapshot = actual;
                    retry(&backoff);
                }
            }
        }
    }
}

/// Unpacked view of a node's reference counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RefCount {
    /// Check-outs folded in from replaced pointer values, minus check-ins.
    pub(crate) internal: u32,
    /// Shared slots still holding a value that names the node (0..=2).
    pub(crate) external: u8,
}

impl RefCount {
    /// Counter of a node that has just been allocated: `head` and `tail`
    /// will each come to reference it once.
    pub(crate) const FRESH: Self = Self {
        internal: 0,
        external: SHARED_SLOTS,
    };

    #[must_use]
    pub(crate) fn is_released(self) -> bool {
        self.internal == 0 && self.external == 0
    }

    #[must_use]
    fn to_bits(self) -> u64 {
        debug_assert!(u64::from(self.external) <= EXTERNAL_MASK);
        u64::from(self.internal) | (u64::from(self.external) << EXTERNAL_SHIFT)
    }

    #[must_use]
    fn from_bits(bits: u64) -> Self {
        Self {
            internal: bits as u32,
            external: ((bits >> EXTERNAL_SHIFT) & EXTERNAL_MASK) as u8,
        }
    }
}

/// A [`RefCount`] packed into one atomic word.
pub(crate) struct AtomicRefCount(AtomicU64);

impl AtomicRefCount {
    pub(crate) fn new(count: RefCount) -> Self {
        Self(AtomicU64::new(count.to_bits()))
    }

    pub(crate) fn load(&self, order: Ordering) -> RefCount {
        RefCount::from_bits(self.0.load(order))
    }

    pub(crate) fn store(&self, count: RefCount, order: Ordering) {
        self.0.store(count.to_bits(), order);
    }

    /// Check in a private snapshot that was never the value of a slot this
    /// thread replaced. Returns `true` if the node is now unreferenced.
    pub(crate) fn release_internal(&self) -> bool {
        self.update(|count| RefCount {
            internal: count.internal.wrapping_sub(1),
            external: count.external,
        })
        .is_released()
    }

    /// Check in the value a shared slot held before it was replaced.
    ///
    /// The value's use count minus two (the slot's own share and the
    /// caller's check-out) becomes internal references owed by the other
    /// threads that checked it out. Returns `true` if the node is now
    /// unreferenced.
    pub(crate) fn release_external(&self, use_count: u32) -> bool {
        let extra = use_count.wrapping_sub(2);
        self.update(|count| {
            if count.external == 0 {
                crate::invariant_violated("external slot count underflow");
            }
            RefCount {
                internal: count.internal.wrapping_add(extra),
                external: count.external - 1,
            }
        })
        .is_released()
    }

    /// Apply `f` atomically and return the counter it produced.
    fn update(&self, f: impl Fn(RefCount) -> RefCount) -> RefCount {
        let backoff = Backoff::new();
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(RefCount::from_bits(current));
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => {
                    current = actual;
                    retry(&backoff);
                }
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counted_ptr_packing() {
        let ptr = CountedPtr {
            index: 7,
            count: 0xdead_beef,
        };
        assert_eq!(CountedPtr::from_bits(ptr.to_bits()), ptr);
        assert!(CountedPtr::NULL.is_null());
        assert!(!CountedPtr::installed(0).is_null());
    }

    #[test]
    fn test_check_out_bumps_use_count() {
        let slot = AtomicCountedPtr::new(CountedPtr::installed(3));
        let mut snapshot = slot.load(Ordering::Acquire);

        slot.increase_external_count(&mut snapshot);
        assert_eq!(snapshot, CountedPtr { index: 3, count: 2 });

        // A stale snapshot is refreshed by the failed CAS.
        let mut stale = CountedPtr::installed(3);
        slot.increase_external_count(&mut stale);
        assert_eq!(stale, CountedPtr { index: 3, count: 3 });
        assert_eq!(slot.load(Ordering::Acquire), stale);
    }

    #[test]
    fn test_external_count_fits_two_bits() {
        let count = RefCount::FRESH;
        assert_eq!(RefCount::from_bits(count.to_bits()), count);
        assert_eq!(count.to_bits() >> EXTERNAL_SHIFT, 2);
    }

    #[test]
    fn test_single_owner_lifecycle() {
        // One slot installed, one check-out: head and tail each release
        // with the external path.
        let refs = AtomicRefCount::new(RefCount::FRESH);
        assert!(!refs.release_external(2));
        assert!(refs.release_external(2));
    }

    #[test]
    fn test_internal_release_may_precede_fold() {
        let refs = AtomicRefCount::new(RefCount::FRESH);

        // A losing pop checks its snapshot back in before the winner folds
        // the value's three uses (slot, winner, loser).
        assert!(!refs.release_internal());
        assert_eq!(refs.load(Ordering::Acquire).internal, u32::MAX);

        assert!(!refs.release_external(3));
        assert_eq!(
            refs.load(Ordering::Acquire),
            RefCount {
                internal: 0,
                external: 1
            }
        );
        assert!(refs.release_external(2));
    }

    #[test]
    fn test_wrapped_use_count_still_balances() {
        // A head value checked out 2^32 + 1 times by pops that all found
        // the queue empty and checked back in.
        let refs = AtomicRefCount::new(RefCount::FRESH);
        let checkouts: u64 = (1 << 32) + 1;
        refs.store(
            RefCount {
                internal: 0u32.wrapping_sub(checkouts as u32),
                external: 2,
            },
            Ordering::Release,
        );

        // Slot share + checkouts, plus the final popper's own check-out.
        let use_count = (1 + checkouts + 1) as u32;
        assert!(!refs.release_external(use_count));
        assert!(refs.release_external(2));
    }
}
