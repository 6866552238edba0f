//! A segmented, dynamically-resizing hash map.
//!
//! `SmoothieMap` keeps many small fixed-capacity segments under a directory
//! indexed by the high bits of each key's hash, so growth happens in small
//! segment-sized steps instead of full-table rehashes. A map built with
//! [`Builder::report_poor_hash_code_distribution`] additionally monitors
//! how well the hash function spreads keys and reports statistically
//! implausible shapes to the given callback.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};

use ahash::RandomState;

use crate::directory::{Directory, TryInsert, MAX_SEGMENTS_ARRAY_ORDER};
use crate::distribution::HashCodeDistribution;
use crate::error::DistributionError;
use crate::report::{PoorHashCodeDistributionOccasion, ReportingAction};
use crate::segment::{tag, Segment};
use crate::stats::MapStats;

/// Ordinary segments are split so that they hover around this load; the
/// average segment order grows by one every time the map size doubles.
const SEGMENT_INTERMEDIATE_ALLOC_CAPACITY: u64 = 32;

/// Segments may run at most this far ahead of the average segment order
/// before they inflate instead of splitting.
const MAX_SEGMENT_ORDER_DIFFERENCE_FROM_AVERAGE: u8 = 1;

/// Largest order a segment may have and still be split: the result
/// segments land `MAX_SEGMENT_ORDER_DIFFERENCE_FROM_AVERAGE` ahead of the
/// average at most.
pub(crate) fn max_splittable_segment_order(average_segment_order: u8) -> u8 {
    average_segment_order + MAX_SEGMENT_ORDER_DIFFERENCE_FROM_AVERAGE - 1
}

/// Average segment order for a map of the given size: grows by one per
/// doubling, capped at the directory limit.
pub(crate) fn compute_average_segment_order(map_size: u64) -> u8 {
    let scaled = map_size / SEGMENT_INTERMEDIATE_ALLOC_CAPACITY;
    let order = (u64::BITS - scaled.leading_zeros()) as u8;
    order.min(MAX_SEGMENTS_ARRAY_ORDER)
}

#[cold]
#[inline(never)]
fn monitor_failure(err: DistributionError) -> ! {
    panic!("{err}")
}

/// Builder for [`SmoothieMap`].
pub struct Builder<K, V, S = RandomState> {
    hash_builder: S,
    reporting: Option<(f64, ReportingAction<K, V>)>,
}

impl<K, V> Builder<K, V, RandomState> {
    pub fn new() -> Self {
        Self {
            hash_builder: RandomState::new(),
            reporting: None,
        }
    }
}

impl<K, V> Default for Builder<K, V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> Builder<K, V, S> {
    /// Use the given hasher instead of the default one.
    pub fn with_hasher<S2>(self, hash_builder: S2) -> Builder<K, V, S2> {
        Builder {
            hash_builder,
            reporting: self.reporting,
        }
    }

    /// Report events whose probability under a well-distributed hash
    /// function is below `min_reporting_prob` (must be in `(0, 1]`) to
    /// `action`. See [`PoorHashCodeDistributionOccasion`] for the callback
    /// contract.
    pub fn report_poor_hash_code_distribution<F>(
        mut self,
        min_reporting_prob: f64,
        action: F,
    ) -> Self
    where
        F: FnMut(&PoorHashCodeDistributionOccasion<'_, K, V>) + 'static,
    {
        assert!(
            min_reporting_prob > 0.0 && min_reporting_prob <= 1.0,
            "min_reporting_prob must be in (0, 1], got {min_reporting_prob}"
        );
        self.reporting = Some((min_reporting_prob, Box::new(action)));
        self
    }

    pub fn build(self) -> SmoothieMap<K, V, S> {
        SmoothieMap {
            directory: Directory::new(),
            size: 0,
            average_segment_order_last_computed: 0,
            monitor: self
                .reporting
                .map(|(prob, action)| Box::new(HashCodeDistribution::new(prob, action))),
            hash_builder: self.hash_builder,
        }
    }
}

/// A segmented hash map with optional hash-code distribution monitoring.
pub struct SmoothieMap<K, V, S = RandomState> {
    directory: Directory<K, V>,
    size: u64,
    /// Cached result of [`compute_average_segment_order`]; refreshed on the
    /// split and inflation paths, not on every mutation.
    average_segment_order_last_computed: u8,
    monitor: Option<Box<HashCodeDistribution<K, V>>>,
    hash_builder: S,
}

impl<K, V> SmoothieMap<K, V, RandomState> {
    /// Create an empty `SmoothieMap`.
    #[inline]
    pub fn new() -> Self {
        Builder::new().build()
    }
}

impl<K, V> Default for SmoothieMap<K, V, RandomState> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SmoothieMap<K, V, RandomState> {
    /// Start building a map with a reporting callback or a custom hasher.
    pub fn builder() -> Builder<K, V, RandomState> {
        Builder::new()
    }
}

impl<K, V, S> SmoothieMap<K, V, S> {
    /// Create an empty `SmoothieMap` with the provided hasher.
    #[inline]
    pub fn with_hasher(hash_builder: S) -> Self {
        SmoothieMap {
            directory: Directory::new(),
            size: 0,
            average_segment_order_last_computed: 0,
            monitor: None,
            hash_builder,
        }
    }

    /// Returns the number of elements in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the number of segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.directory.segment_count()
    }

    /// Returns the order of the segment directory.
    #[inline]
    pub fn directory_order(&self) -> u8 {
        self.directory.order()
    }

    /// Returns a reference to the hasher.
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Whether too-large-inflated-segment occasions are still being
    /// reported. `false` if no reporting callback was configured or after
    /// a callback declined to remove the offending element.
    pub fn is_reporting_too_large_inflated_segment(&self) -> bool {
        self.monitor
            .as_deref()
            .is_some_and(HashCodeDistribution::is_reporting_too_large_inflated_segment)
    }

    /// Iterate over all key-value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.directory.segments().flat_map(Segment::iter)
    }

    /// Iterate over all keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(k, _)| k)
    }

    /// Iterate over all values.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }
}

impl<K, V, S> SmoothieMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    #[inline]
    fn hash_of<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hash_builder.hash_one(key)
    }

    /// Returns a reference to the value associated with the given key.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        self.directory.get(tag(hash), hash, key)
    }

    /// Returns a mutable reference to the value associated with the key.
    #[inline]
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        self.directory.get_mut(tag(hash), hash, key)
    }

    /// Returns `true` if the map contains a value for the given key.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        self.directory.contains_key(tag(hash), hash, key)
    }

    /// Removes a key from the map, returning the value if it was present.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(key);
        let removed = self.directory.remove(tag(hash), hash, key);
        if removed.is_some() {
            self.size -= 1;
        }
        removed
    }

    /// Inserts a key-value pair into the map.
    ///
    /// If the map did not have this key present, `None` is returned. If it
    /// did, the value is updated and the old value is returned.
    ///
    /// # Panics
    ///
    /// Panics with a [`DistributionError`] message if the distribution
    /// monitor detects concurrent modification or an internal inconsistency.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let hash = self.hash_of(&key);
        if self.directory.segment(hash).is_inflated() && !self.directory.contains_key(tag(hash), hash, &key)
        {
            self.check_inflated_segment_on_write(hash, &key);
        }
        let mut key = key;
        let mut value = value;
        loop {
            match self.directory.try_insert(tag(hash), hash, key, value) {
                TryInsert::Inserted => {
                    self.size += 1;
                    return None;
                }
                TryInsert::Updated(old) => return Some(old),
                TryInsert::SegmentFull(k, v) => {
                    key = k;
                    value = v;
                    self.make_space(hash);
                }
            }
        }
    }

    /// Recompute the average segment order for `map_size`, updating the
    /// cache and rotating the monitor's split stats on change.
    fn update_average_segment_order(&mut self, map_size: u64) -> u8 {
        let new_average = compute_average_segment_order(map_size);
        let prev_average = self.average_segment_order_last_computed;
        if new_average != prev_average {
            self.average_segment_order_last_computed = new_average;
            if let Some(monitor) = self.monitor.as_deref_mut() {
                if let Err(err) = monitor.average_segment_order_updated(prev_average, new_average) {
                    monitor_failure(err);
                }
            }
        }
        new_average
    }

    /// The segment covering `hash` is at its allocation capacity: split it,
    /// or inflate it when it may not run further ahead of the average
    /// segment order.
    fn make_space(&mut self, hash: u64) {
        let prior_order = self.directory.segment(hash).order();
        let average_order = self.update_average_segment_order(self.size + 1);
        if prior_order > max_splittable_segment_order(average_order)
            || prior_order >= MAX_SEGMENTS_ARRAY_ORDER
        {
            let hash_builder = &self.hash_builder;
            self.directory
                .inflate_segment(hash, |key| hash_builder.hash_one(key));
            if let Some(monitor) = self.monitor.as_deref_mut() {
                monitor.note_inflated_segments_changed(1);
            }
            return;
        }

        let hash_builder = &self.hash_builder;
        let (prior_order, num_keys_half_one, total_num_keys) = self
            .directory
            .split_segment(hash, |key| hash_builder.hash_one(key));
        if let Some(monitor) = self.monitor.as_deref_mut() {
            if let Err(err) = monitor.account_segment_split(
                self.size,
                self.average_segment_order_last_computed,
                prior_order,
                num_keys_half_one,
                total_num_keys,
            ) {
                monitor_failure(err);
            }
        }
    }

    /// An insertion is about to land in an inflated segment: decide whether
    /// its size is statistically implausible. Amortized cheap; the slow
    /// statistical path runs only when the cached threshold is exceeded or
    /// stale, and only after giving the host a chance to split the segment
    /// instead.
    fn check_inflated_segment_on_write(&mut self, hash: u64, excluded_key: &K) {
        let (segment_size, segment_order) = match self.directory.segment(hash) {
            Segment::Inflated(seg) => (seg.len() as u64 + 1, seg.order()),
            Segment::Ordinary(_) => return,
        };
        let map_size = self.size + 1;
        // A segment whose order fell behind the average should be split
        // back into ordinary segments regardless of monitoring.
        if segment_order < self.average_segment_order_last_computed {
            let average_order = self.update_average_segment_order(map_size);
            if segment_order < average_order {
                self.split_inflated(hash);
                return;
            }
        }
        {
            let Some(monitor) = self.monitor.as_deref() else {
                return;
            };
            if !monitor.is_reporting_too_large_inflated_segment() {
                return;
            }
            if !monitor.inflated_segment_might_be_poor(segment_size, segment_order, map_size) {
                return;
            }
        }
        // Recomputing the average order first rules out insertion sequences
        // that keep the cached average stale while the segment's order
        // falls behind it; a successful split means nothing to report.
        let average_order = self.update_average_segment_order(map_size);
        if segment_order < average_order {
            self.split_inflated(hash);
            return;
        }
        let Some(monitor) = self.monitor.as_deref_mut() else {
            return;
        };
        let Segment::Inflated(segment) = self.directory.segment(hash) else {
            return;
        };
        if let Err(err) = monitor.check_and_report_too_large_inflated_segment(
            map_size,
            average_order,
            segment,
            segment_size,
            segment_order,
            excluded_key,
        ) {
            monitor_failure(err);
        }
    }

    fn split_inflated(&mut self, hash: u64) {
        let still_inflated = self.directory.split_inflated_segment(hash);
        if let Some(monitor) = self.monitor.as_deref_mut() {
            monitor.note_inflated_segments_changed(still_inflated as i32 - 1);
        }
    }

    /// Aggregate this map's segments into `stats` for a diagnostics dump.
    pub fn aggregate_stats(&self, stats: &mut MapStats) {
        stats.increment_aggregated_maps();
        for segment in self.directory.segments() {
            stats.aggregate_segment(segment, |key| self.hash_builder.hash_one(key));
        }
    }
}
