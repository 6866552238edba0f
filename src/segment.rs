//! Segment is a mini hash table owned by the directory.
//!
//! - 8 groups of 8 slots, probed along a quadratic chain (steps 1, 2, 3, ...)
//! - Allocation capacity capped at 48 keys; a full segment must split
//! - Segment order tracks which fraction of the hash space the segment covers
//! - Segments that can no longer split ahead of the map's average order are
//!   converted to the inflated representation with unbounded capacity

use std::borrow::Borrow;

use crate::group::{Group, GROUP_SLOTS};
use crate::stats::SegmentStats;

/// Number of slot groups in a segment's hash table.
pub const HASH_TABLE_GROUPS: usize = 8;

/// Total hash table slots per segment.
pub const HASH_TABLE_SLOTS: usize = HASH_TABLE_GROUPS * GROUP_SLOTS;

/// Maximum number of keys an ordinary segment holds before it must split
/// (or inflate). Smaller than [`HASH_TABLE_SLOTS`] so that probe chains
/// stay short.
pub const SEGMENT_MAX_ALLOC_CAPACITY: usize = 48;

pub(crate) const HASH_TABLE_GROUPS_MASK: u64 = (HASH_TABLE_GROUPS - 1) as u64;

/// Tag (8-bit hash prefix) stored next to each slot.
#[inline]
pub(crate) fn tag(hash: u64) -> u8 {
    hash as u8
}

/// Group where the probe chain for this hash starts. Taken from hash bits
/// disjoint from both the tag and the directory index bits.
#[inline]
pub(crate) fn base_group_index(hash: u64) -> usize {
    ((hash >> 8) & HASH_TABLE_GROUPS_MASK) as usize
}

/// Groups in quadratic-probe order starting at `base`: steps of 1, 2, 3, ...
/// visit every group exactly once before wrapping.
#[inline]
pub(crate) fn probe_groups(base: usize) -> impl Iterator<Item = usize> {
    let mut group = base;
    let mut step = 0;
    (0..HASH_TABLE_GROUPS).map(move |_| {
        let current = group;
        step += 1;
        group = (group + step) % HASH_TABLE_GROUPS;
        current
    })
}

/// A directory-owned segment: either an ordinary fixed-capacity hash table
/// or the inflated overflow representation.
pub enum Segment<K, V> {
    Ordinary(OrdinarySegment<K, V>),
    Inflated(InflatedSegment<K, V>),
}

impl<K, V> Segment<K, V> {
    /// Segment order: the segment covers `1 / 2^order` of the hash space.
    #[inline]
    pub fn order(&self) -> u8 {
        match self {
            Segment::Ordinary(seg) => seg.order(),
            Segment::Inflated(seg) => seg.order(),
        }
    }

    /// Number of entries
    #[inline]
    pub fn count(&self) -> usize {
        match self {
            Segment::Ordinary(seg) => seg.count(),
            Segment::Inflated(seg) => seg.len(),
        }
    }

    #[inline]
    pub fn is_inflated(&self) -> bool {
        matches!(self, Segment::Inflated(_))
    }

    /// Iterate over all key-value pairs
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let (ordinary, inflated) = match self {
            Segment::Ordinary(seg) => (Some(seg), None),
            Segment::Inflated(seg) => (None, Some(seg)),
        };
        ordinary
            .into_iter()
            .flat_map(|seg| seg.iter().map(|(_, _, k, v)| (k, v)))
            .chain(inflated.into_iter().flat_map(|seg| seg.iter()))
    }
}

/// Ordinary segment: 64 slots in 8 quadratically-probed groups.
pub struct OrdinarySegment<K, V> {
    groups: Box<[Group<K, V>; HASH_TABLE_GROUPS]>,
    order: u8,
    count: u8,
}

impl<K, V> OrdinarySegment<K, V> {
    pub(crate) fn new(order: u8) -> Self {
        Self {
            groups: Box::new(std::array::from_fn(|_| Group::new())),
            order,
            count: 0,
        }
    }

    #[inline]
    pub fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() >= SEGMENT_MAX_ALLOC_CAPACITY
    }

    /// Insert entry into the first free slot along the probe chain.
    ///
    /// Returns `Err((key, value))` if the segment is at its allocation
    /// capacity and must split. Does NOT check for duplicates; callers
    /// wanting upsert semantics check first.
    pub fn insert(&mut self, tag: u8, hash: u64, key: K, value: V) -> Result<(), (K, V)> {
        if self.is_full() {
            return Err((key, value));
        }
        let base = base_group_index(hash);
        for group_idx in probe_groups(base) {
            if let Some(slot) = self.groups[group_idx].find_empty() {
                self.groups[group_idx].insert_at(slot, tag, key, value);
                self.count += 1;
                return Ok(());
            }
        }
        // count < SEGMENT_MAX_ALLOC_CAPACITY < HASH_TABLE_SLOTS and the
        // probe chain visits every group, so a free slot always exists.
        unreachable!("segment below allocation capacity had no free slot")
    }

    /// Split this segment, creating a sibling one order deeper.
    ///
    /// This segment keeps entries whose next-order hash bit is 0; the
    /// sibling receives entries where it is 1. Returns the sibling together
    /// with `(num_keys_kept, total_num_keys_before_split)` for split-skew
    /// accounting.
    pub fn split<F>(&mut self, mut hash_fn: F) -> (OrdinarySegment<K, V>, u32, u32)
    where
        F: FnMut(&K) -> u64,
    {
        let total_before = self.count() as u32;
        let new_order = self.order + 1;
        let mut sibling = OrdinarySegment::new(new_order);
        let bit_shift = 64 - new_order as u32;

        let mut to_move: Vec<(u64, K, V)> = Vec::new();
        for group in self.groups.iter_mut() {
            for slot in 0..GROUP_SLOTS {
                if !group.is_busy(slot) {
                    continue;
                }
                // Safety: slot is occupied
                let hash = hash_fn(unsafe { group.get_key(slot) });
                if (hash >> bit_shift) & 1 == 1 {
                    let (key, value) = group.remove_at(slot);
                    to_move.push((hash, key, value));
                }
            }
        }
        self.count -= to_move.len() as u8;

        for (hash, key, value) in to_move {
            let inserted = sibling.insert(tag(hash), hash, key, value);
            debug_assert!(inserted.is_ok(), "sibling segment full during split");
        }
        self.order = new_order;

        (sibling, self.count() as u32, total_before)
    }

    /// Drain all entries, rehashing keys with `hash_fn`, for conversion to
    /// an inflated segment.
    pub(crate) fn drain_entries<F>(&mut self, mut hash_fn: F) -> Vec<(u64, K, V)>
    where
        F: FnMut(&K) -> u64,
    {
        let mut entries = Vec::with_capacity(self.count());
        for group in self.groups.iter_mut() {
            for slot in 0..GROUP_SLOTS {
                if group.is_busy(slot) {
                    // Safety: slot is occupied
                    let hash = hash_fn(unsafe { group.get_key(slot) });
                    let (key, value) = group.remove_at(slot);
                    entries.push((hash, key, value));
                }
            }
        }
        self.count = 0;
        entries
    }

    /// Iterate over all entries as `(group_idx, slot_idx, &K, &V)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &K, &V)> {
        self.groups.iter().enumerate().flat_map(|(group_idx, group)| {
            group.iter_occupied().map(move |slot| {
                // Safety: iter_occupied only yields occupied slots
                let key = unsafe { group.get_key(slot) };
                let value = unsafe { group.get_value(slot) };
                (group_idx, slot, key, value)
            })
        })
    }

    /// Aggregate per-slot probing statistics into `stats`. Keys are rehashed
    /// with `hash_fn` to recover each slot's probe chain.
    pub fn aggregate_stats<F>(&self, hash_fn: F, stats: &mut SegmentStats)
    where
        F: Fn(&K) -> u64,
    {
        stats.increment_aggregated_segments(SEGMENT_MAX_ALLOC_CAPACITY);
        for (group_idx, group) in self.groups.iter().enumerate() {
            for slot in group.iter_occupied() {
                // Safety: iter_occupied only yields occupied slots
                let key = unsafe { group.get_key(slot) };
                let hash = hash_fn(key);
                let base = base_group_index(hash);
                let comparisons = self.count_collision_comparisons(hash, group_idx, slot);
                let alloc_index = (group_idx * GROUP_SLOTS + slot) as u32;
                let boundary = (base * GROUP_SLOTS) as u32;
                stats.aggregate_full_slot(
                    base as u64,
                    group_idx as u64,
                    comparisons,
                    alloc_index,
                    boundary,
                );
            }
        }
    }

    /// Number of same-tag slots a lookup examines (and rejects) before
    /// reaching its slot at `(target_group, target_slot)`.
    fn count_collision_comparisons(
        &self,
        hash: u64,
        target_group: usize,
        target_slot: usize,
    ) -> u32 {
        let tag = tag(hash);
        let mut comparisons = 0;
        for group_idx in probe_groups(base_group_index(hash)) {
            for slot in self.groups[group_idx].match_tag(tag) {
                if group_idx == target_group && slot == target_slot {
                    return comparisons;
                }
                comparisons += 1;
            }
        }
        debug_assert!(false, "slot not reachable along its own probe chain");
        comparisons
    }
}

impl<K, V> OrdinarySegment<K, V>
where
    K: Eq,
{
    /// Find entry by tag, hash and key.
    ///
    /// Returns `(group_idx, slot_idx)` if found. Removals leave no
    /// tombstones, so the lookup walks the full probe chain.
    pub fn find<Q>(&self, tag: u8, hash: u64, key: &Q) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let base = base_group_index(hash);
        for group_idx in probe_groups(base) {
            if let Some(slot) = self.groups[group_idx].find_key(tag, key) {
                return Some((group_idx, slot));
            }
        }
        None
    }

    pub fn get<Q>(&self, tag: u8, hash: u64, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let (group_idx, slot) = self.find(tag, hash, key)?;
        // Safety: find() only returns occupied slots
        Some(unsafe { self.groups[group_idx].get_value(slot) })
    }

    pub fn get_mut<Q>(&mut self, tag: u8, hash: u64, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let (group_idx, slot) = self.find(tag, hash, key)?;
        // Safety: find() only returns occupied slots
        Some(unsafe { self.groups[group_idx].get_value_mut(slot) })
    }

    /// Remove entry, returning it if present.
    pub fn remove<Q>(&mut self, tag: u8, hash: u64, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let (group_idx, slot) = self.find(tag, hash, key)?;
        self.count -= 1;
        Some(self.groups[group_idx].remove_at(slot))
    }
}

/// A segment whose capacity has been grown beyond the standard cap because
/// it could not split further ahead of the map's average segment order.
pub struct InflatedSegment<K, V> {
    order: u8,
    entries: Vec<(u64, K, V)>,
}

impl<K, V> InflatedSegment<K, V> {
    pub(crate) fn new(order: u8) -> Self {
        Self {
            order,
            entries: Vec::new(),
        }
    }

    pub(crate) fn from_entries(order: u8, entries: Vec<(u64, K, V)>) -> Self {
        Self { order, entries }
    }

    #[inline]
    pub fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(_, k, v)| (k, v))
    }

    /// Partition entries by the next-order hash bit for a split into two
    /// segments of `order + 1`. Returns `(new_order, low_half, high_half)`.
    pub(crate) fn split_entries(self) -> (u8, Vec<(u64, K, V)>, Vec<(u64, K, V)>) {
        let new_order = self.order + 1;
        let bit_shift = 64 - new_order as u32;
        let (high, low): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .partition(|(hash, _, _)| (hash >> bit_shift) & 1 == 1);
        (new_order, low, high)
    }
}

impl<K, V> InflatedSegment<K, V>
where
    K: Eq,
{
    pub(crate) fn get<Q>(&self, hash: u64, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.entries
            .iter()
            .find(|(h, k, _)| *h == hash && k.borrow() == key)
            .map(|(_, _, v)| v)
    }

    pub(crate) fn get_mut<Q>(&mut self, hash: u64, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.entries
            .iter_mut()
            .find(|(h, k, _)| *h == hash && k.borrow() == key)
            .map(|(_, _, v)| v)
    }

    pub(crate) fn contains<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.get(hash, key).is_some()
    }

    /// Insert entry; returns the previous value if the key was present.
    pub(crate) fn insert(&mut self, hash: u64, key: K, value: V) -> Option<V> {
        if let Some(v) = self.get_mut(hash, &key) {
            return Some(std::mem::replace(v, value));
        }
        self.entries.push((hash, key, value));
        None
    }

    pub(crate) fn remove<Q>(&mut self, hash: u64, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let idx = self
            .entries
            .iter()
            .position(|(h, k, _)| *h == hash && k.borrow() == key)?;
        Some(self.entries.swap_remove(idx).2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_chain_covers_all_groups() {
        for base in 0..HASH_TABLE_GROUPS {
            let mut visited: Vec<usize> = probe_groups(base).collect();
            assert_eq!(visited[0], base);
            visited.sort_unstable();
            assert_eq!(visited, (0..HASH_TABLE_GROUPS).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_insert_and_find() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(1);

        assert!(seg.insert(0xAB, 0x1234, 100, 1000).is_ok());
        assert_eq!(seg.count(), 1);
        assert_eq!(seg.get(0xAB, 0x1234, &100), Some(&1000));
        assert_eq!(seg.get(0xAB, 0x1234, &101), None);
    }

    #[test]
    fn test_insert_at_alloc_capacity_fails() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(0);

        for i in 0..SEGMENT_MAX_ALLOC_CAPACITY as u64 {
            let hash = i << 8; // spread over base groups
            assert!(seg.insert(tag(hash), hash, i, i).is_ok(), "insert {i}");
        }
        assert!(seg.is_full());
        let overflow = seg.insert(0xFF, 0xFF00, 999, 999);
        assert_eq!(overflow, Err((999, 999)));
    }

    #[test]
    fn test_probe_overflow_into_next_chain_group() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(0);

        // All keys share base group 0; the first 8 fill group 0 and the
        // ninth lands in the chain's second group.
        for i in 0..9u64 {
            assert!(seg.insert(i as u8, 0, i, i * 10).is_ok());
        }
        for i in 0..9u64 {
            assert_eq!(seg.get(i as u8, 0, &i), Some(&(i * 10)), "key {i}");
        }
    }

    #[test]
    fn test_remove_keeps_later_chain_entries_findable() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(0);

        for i in 0..10u64 {
            let _ = seg.insert(i as u8, 0, i, i);
        }
        // Remove an early-chain entry; later entries in overflow groups
        // must stay reachable (no early-exit probing).
        assert_eq!(seg.remove(0, 0, &0), Some((0, 0)));
        for i in 1..10u64 {
            assert_eq!(seg.get(i as u8, 0, &i), Some(&i), "key {i}");
        }
    }

    #[test]
    fn test_get_mut() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(1);
        let _ = seg.insert(0xAB, 0x1234, 100, 1000);

        if let Some(value) = seg.get_mut(0xAB, 0x1234, &100) {
            *value = 2000;
        }
        assert_eq!(seg.get(0xAB, 0x1234, &100), Some(&2000));
    }

    #[test]
    fn test_split_partitions_by_next_order_bit() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(1);
        // Hash = key directly; order 1 -> split on bit 62.
        let hash_fn = |key: &u64| *key;

        for i in 0..20u64 {
            let hash = if i % 2 == 0 { i << 9 } else { (i << 9) | (1 << 62) };
            let _ = seg.insert(tag(hash), hash, hash, i);
        }
        let before = seg.count() as u32;

        let (sibling, kept, total) = seg.split(hash_fn);
        assert_eq!(total, before);
        assert_eq!(kept, seg.count() as u32);
        assert_eq!(seg.order(), 2);
        assert_eq!(sibling.order(), 2);
        assert_eq!(seg.count(), 10);
        assert_eq!(sibling.count(), 10);

        for (_, _, key, _) in seg.iter() {
            assert_eq!((key >> 62) & 1, 0);
        }
        for (_, _, key, _) in sibling.iter() {
            assert_eq!((key >> 62) & 1, 1);
        }
    }

    #[test]
    fn test_aggregate_stats_counts_full_slots() {
        let mut seg: OrdinarySegment<u64, u64> = OrdinarySegment::new(0);
        let hash_fn = |key: &u64| *key;

        // Three keys in distinct base groups: no collisions, chain length 0.
        for base in 0..3u64 {
            let hash = base << 8;
            let _ = seg.insert(tag(hash), hash, hash, base);
        }
        let mut stats = SegmentStats::new();
        seg.aggregate_stats(hash_fn, &mut stats);
        assert_eq!(stats.num_aggregated_segments(), 1);
        assert_eq!(stats.num_aggregated_full_slots(), 3);
    }

    #[test]
    fn test_inflated_insert_get_remove() {
        let mut seg: InflatedSegment<u64, u64> = InflatedSegment::new(3);

        assert_eq!(seg.insert(77, 1, 10), None);
        assert_eq!(seg.insert(77, 1, 11), Some(10));
        assert_eq!(seg.insert(78, 2, 20), None);
        assert_eq!(seg.len(), 2);

        assert_eq!(seg.get(77, &1), Some(&11));
        assert!(seg.contains(78, &2));
        assert_eq!(seg.remove(77, &1), Some(11));
        assert_eq!(seg.len(), 1);
    }

    #[test]
    fn test_inflated_split_partitions_entries() {
        let mut seg: InflatedSegment<u64, u64> = InflatedSegment::new(1);
        for i in 0..8u64 {
            let hash = i << 61; // alternates bit 62, the order-2 split bit
            seg.insert(hash, i, i);
        }
        let (new_order, low, high) = seg.split_entries();
        assert_eq!(new_order, 2);
        assert_eq!(low.len() + high.len(), 8);
        for (hash, _, _) in &low {
            assert_eq!((hash >> 62) & 1, 0);
        }
        for (hash, _, _) in &high {
            assert_eq!((hash >> 62) & 1, 1);
        }
    }
}
