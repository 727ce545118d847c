//! Bounded identifier allocator.
//!
//! Hands out ids from the closed range `[lower, upper]`:
//! - `get_next()` scans forward from the cursor, wrapping to `lower`, and
//!   prefers previously freed ids when recycling is enabled
//! - `peek_next()` runs the same search without claiming anything
//! - `free()` releases an id; without recycling the id is retired forever
//!
//! Invariant: an id is in at most one of the used, free and retired sets.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// Unsigned integer usable as a pool id.
pub trait PoolId: Copy + Eq + Ord + Hash + Debug {
    /// The following id, or `None` at the type's maximum.
    fn successor(self) -> Option<Self>;
}

macro_rules! impl_pool_id {
    ($($t:ty),*) => {
        $(
            impl PoolId for $t {
                fn successor(self) -> Option<Self> {
                    self.checked_add(1)
                }
            }
        )*
    };
}

impl_pool_id!(u8, u16, u32, u64);

/// Identifier pool over a closed range.
#[derive(Debug, Clone)]
pub struct IdPool<T: PoolId> {
    lower: T,
    upper: T,
    /// Where the cursor restarts after `clear()`.
    start: T,
    /// Next candidate for the forward scan.
    cursor: T,
    used: HashSet<T>,
    /// Ordered so the lowest freed id is reused first.
    free: BTreeSet<T>,
    /// Ids freed by a non-recycling pool. Never issued again.
    retired: BTreeSet<T>,
    recycle: bool,
}

impl<T: PoolId> IdPool<T> {
    /// Create a pool over `[lower, upper]` with the cursor at `lower`.
    ///
    /// # Panics
    /// If `lower > upper`.
    pub fn new(lower: T, upper: T, recycle: bool) -> Self {
        Self::with_start(lower, upper, lower, recycle)
    }

    /// Create a pool whose scan begins at `start`.
    ///
    /// # Panics
    /// If `lower > upper` or `start` lies outside the range.
    pub fn with_start(lower: T, upper: T, start: T, recycle: bool) -> Self {
        assert!(lower <= upper, "id pool bounds inverted: {lower:?} > {upper:?}");
        assert!(
            lower <= start && start <= upper,
            "id pool start {start:?} outside [{lower:?}, {upper:?}]"
        );

        Self {
            lower,
            upper,
            start,
            cursor: start,
            used: HashSet::new(),
            free: BTreeSet::new(),
            retired: BTreeSet::new(),
            recycle,
        }
    }

    /// Claim and return the next available id, or `None` when the pool is
    /// exhausted.
    pub fn get_next(&mut self) -> Option<T> {
        if self.recycle {
            if let Some(id) = self.free.pop_first() {
                self.used.insert(id);
                return Some(id);
            }
        }

        let id = self.scan()?;
        self.used.insert(id);
        self.free.remove(&id);
        self.cursor = self.step(id);
        Some(id)
    }

    /// The id `get_next()` would return, without claiming it.
    pub fn peek_next(&self) -> Option<T> {
        if self.recycle {
            if let Some(&id) = self.free.first() {
                return Some(id);
            }
        }

        self.scan()
    }

    /// Release `id`. Returns false if it was not in use.
    pub fn free(&mut self, id: T) -> bool {
        if !self.used.remove(&id) {
            return false;
        }

        if self.recycle {
            self.free.insert(id);
        } else {
            self.retired.insert(id);
        }
        true
    }

    /// Claim a specific id. Returns false if it is out of bounds, already
    /// in use or retired.
    pub fn add(&mut self, id: T) -> bool {
        if !self.is_in_bounds(id) || self.used.contains(&id) || self.retired.contains(&id) {
            return false;
        }

        self.free.remove(&id);
        self.used.insert(id);
        true
    }

    pub fn contains(&self, id: T) -> bool {
        self.used.contains(&id)
    }

    pub fn is_in_bounds(&self, id: T) -> bool {
        self.lower <= id && id <= self.upper
    }

    /// Number of ids currently in use.
    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn bounds(&self) -> (T, T) {
        (self.lower, self.upper)
    }

    pub fn recycles(&self) -> bool {
        self.recycle
    }

    /// Whether `id` was freed by a non-recycling pool.
    pub fn is_retired(&self, id: T) -> bool {
        self.retired.contains(&id)
    }

    /// Forget every used, freed and retired id and move the cursor back to
    /// the start.
    pub fn clear(&mut self) {
        self.used.clear();
        self.free.clear();
        self.retired.clear();
        self.cursor = self.start;
    }

    // ========================================================================
    // Internal Methods
    // ========================================================================

    /// Forward scan from the cursor.
    ///
    /// At most `used.len() + retired.len()` consecutive candidates can be
    /// taken, so one more probe either finds a gap or proves the range full.
    fn scan(&self) -> Option<T> {
        let mut candidate = self.cursor;
        for _ in 0..=self.used.len() + self.retired.len() {
            if !self.used.contains(&candidate) && !self.retired.contains(&candidate) {
                return Some(candidate);
            }
            candidate = self.step(candidate);
        }
        None
    }

    /// Candidate after `id`, wrapping from `upper` to `lower`.
    fn step(&self, id: T) -> T {
        if id >= self.upper {
            return self.lower;
        }
        id.successor().unwrap_or(self.lower)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_get_next_scans_forward_from_lower() {
        let mut pool = IdPool::new(10u16, 20, true);
        assert_eq!(pool.get_next(), Some(10));
        assert_eq!(pool.get_next(), Some(11));
        assert_eq!(pool.get_next(), Some(12));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_recycling_prefers_freed_ids() {
        let mut pool = IdPool::new(0u8, 9, true);
        for _ in 0..5 {
            pool.get_next();
        }

        assert!(pool.free(3));
        assert!(pool.free(1));
        assert_eq!(pool.peek_next(), Some(1));
        assert_eq!(pool.get_next(), Some(1));
        assert_eq!(pool.get_next(), Some(3));
        assert_eq!(pool.get_next(), Some(5));
    }

    #[test]
    fn test_recycling_pool_wraps_to_lower() {
        let mut pool = IdPool::with_start(1u8, 3, 2, true);
        assert_eq!(pool.get_next(), Some(2));
        assert_eq!(pool.get_next(), Some(3));
        assert_eq!(pool.get_next(), Some(1));
        assert_eq!(pool.get_next(), None);
    }

    #[test]
    fn test_non_recycling_pool_wraps_to_lower() {
        let mut pool = IdPool::with_start(1u8, 3, 2, false);
        assert_eq!(pool.get_next(), Some(2));
        assert_eq!(pool.get_next(), Some(3));
        assert_eq!(pool.get_next(), Some(1));
        assert_eq!(pool.get_next(), None);
    }

    #[test]
    fn test_non_recycling_wrap_skips_retired_ids() {
        let mut pool = IdPool::with_start(0u16, 3, 2, false);
        assert_eq!(pool.get_next(), Some(2));
        assert!(pool.free(2));
        assert!(pool.is_retired(2));

        assert_eq!(pool.get_next(), Some(3));
        assert_eq!(pool.get_next(), Some(0));
        assert_eq!(pool.get_next(), Some(1));
        assert_eq!(pool.get_next(), None);
    }

    #[test]
    fn test_non_recycling_pool_retires_added_ids() {
        let mut pool = IdPool::new(1u32, 5, false);
        assert!(pool.add(4));
        assert!(pool.free(4));
        assert!(!pool.add(4), "retired id cannot be claimed again");

        let issued: Vec<_> = std::iter::from_fn(|| pool.get_next()).collect();
        assert_eq!(issued, vec![1, 2, 3, 5]);
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let mut pool = IdPool::new(0u8, 2, true);
        assert!(pool.get_next().is_some());
        assert!(pool.get_next().is_some());
        assert!(pool.get_next().is_some());
        assert_eq!(pool.get_next(), None);
        assert_eq!(pool.peek_next(), None);
    }

    #[test]
    fn test_non_recycling_pool_retires_freed_ids() {
        let mut pool = IdPool::new(0u32, 3, false);
        assert_eq!(pool.get_next(), Some(0));
        assert!(pool.free(0));
        assert!(!pool.contains(0));

        assert_eq!(pool.get_next(), Some(1));
        assert_eq!(pool.get_next(), Some(2));
        assert_eq!(pool.get_next(), Some(3));
        // 0 was freed but is retired; the pool is now exhausted.
        assert_eq!(pool.get_next(), None);
    }

    #[test]
    fn test_peek_next_has_no_side_effects() {
        let mut pool = IdPool::new(5000u16, 5010, false);
        assert_eq!(pool.peek_next(), Some(5000));
        assert_eq!(pool.peek_next(), Some(5000));
        assert!(pool.is_empty());

        assert_eq!(pool.get_next(), Some(5000));
        assert_eq!(pool.peek_next(), Some(5001));
    }

    #[test]
    fn test_add_claims_specific_ids() {
        let mut pool = IdPool::new(0u16, 4, true);
        assert!(pool.add(0));
        assert!(pool.add(1));
        assert!(!pool.add(1), "duplicate add must fail");
        assert!(!pool.add(5), "out of bounds add must fail");

        // Scan skips ids claimed through add().
        assert_eq!(pool.get_next(), Some(2));
    }

    #[test]
    fn test_free_unknown_id_returns_false() {
        let mut pool = IdPool::new(0u64, 10, true);
        assert!(!pool.free(7));
        assert_eq!(pool.peek_next(), Some(0));
    }

    #[test]
    fn test_clear_resets_cursor_to_start() {
        let mut pool = IdPool::with_start(0u16, 100, 50, false);
        assert_eq!(pool.get_next(), Some(50));
        assert_eq!(pool.get_next(), Some(51));
        pool.free(50);

        pool.clear();
        assert!(pool.is_empty());
        assert!(!pool.is_retired(50));
        assert_eq!(pool.get_next(), Some(50));
    }

    #[test]
    fn test_full_u8_range_does_not_overflow() {
        let mut pool = IdPool::new(u8::MIN, u8::MAX, false);
        for expected in 0..=u8::MAX {
            assert_eq!(pool.get_next(), Some(expected));
        }
        assert_eq!(pool.get_next(), None);
    }

    #[test]
    #[should_panic(expected = "id pool bounds inverted")]
    fn test_inverted_bounds_panics() {
        let _ = IdPool::new(10u8, 1, true);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Next,
        Add(u8),
        Free(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Next),
            1 => (0u8..=40).prop_map(Op::Add),
            2 => (0u8..=40).prop_map(Op::Free),
        ]
    }

    proptest! {
        /// get_next never leaves the range and never hands out an id that is
        /// still in use.
        #[test]
        fn test_prop_ids_in_bounds_and_unique(
            recycle in any::<bool>(),
            ops in prop::collection::vec(op_strategy(), 0..200),
        ) {
            let mut pool = IdPool::new(5u8, 30, recycle);
            let mut live = HashSet::new();

            for op in ops {
                match op {
                    Op::Next => {
                        if let Some(id) = pool.get_next() {
                            prop_assert!(pool.is_in_bounds(id));
                            prop_assert!(live.insert(id), "id {} issued twice", id);
                        }
                    }
                    Op::Add(id) => {
                        if pool.add(id) {
                            prop_assert!(live.insert(id), "id {} claimed twice", id);
                        }
                    }
                    Op::Free(id) => {
                        prop_assert_eq!(pool.free(id), live.remove(&id));
                    }
                }
            }
        }

        /// A non-recycling pool never issues an id a second time, whether
        /// it was scanned or claimed through add, and fails only once every
        /// id in range has been handed out.
        #[test]
        fn test_prop_non_recycling_never_reissues(
            start in 0u8..=40,
            ops in prop::collection::vec(op_strategy(), 0..200),
        ) {
            let mut pool = IdPool::with_start(0u8, 40, start, false);
            let mut ever_issued = HashSet::new();

            for op in ops {
                match op {
                    Op::Next => match pool.get_next() {
                        Some(id) => {
                            prop_assert!(ever_issued.insert(id), "retired id {} reissued", id);
                        }
                        None => prop_assert_eq!(ever_issued.len(), 41),
                    },
                    Op::Add(id) => {
                        if pool.add(id) {
                            prop_assert!(ever_issued.insert(id), "retired id {} claimed", id);
                        }
                    }
                    Op::Free(id) => {
                        pool.free(id);
                    }
                }
            }
        }
    }
}
