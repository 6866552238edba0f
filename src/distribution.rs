//! Hash-code distribution monitoring.
//!
//! [`HashCodeDistribution`] holds the parts of a map's state that are only
//! ever touched when poor hash-code distribution events are tracked, so
//! maps without a reporting callback pay nothing for it. Three independent
//! manifestations of a poor distribution are covered:
//!
//! - a too large inflated segment: an inflated segment whose size is
//!   statistically implausible for the current map size under a
//!   well-distributed hash function;
//! - too many skewed segment splits: splits that repeatedly put most keys
//!   into one half of a segment's hash table, more often than plausible;
//! - too many inflated segments: reserved, not reported yet.
//!
//! The monitor is advisory: it never rejects operations, it only forwards
//! occasions to the user callback, and it latches itself quiet when
//! further reports about the same unchanged map would be noise.

use std::cmp::Ordering;

use crate::binomial_bounds::{
    approximated_max_non_reported, precomputed_max_non_reported, MAX_SPLITS_WITH_PRECOMPUTED,
    SKEWED_SPLIT_PROBS,
};
use crate::error::DistributionError;
use crate::map::max_splittable_segment_order;
use crate::report::{OccasionKind, PoorHashCodeDistributionOccasion, ReportingAction};
use crate::segment::{InflatedSegment, HASH_TABLE_SLOTS};
use crate::stat_kernel::{poisson_mean_by_cdf, Binomial, Poisson};

/// Highest tracked skewness level. A split's skewness level `s` means at
/// least `29 + s` of the 48 pre-split keys hashed to one half of the
/// segment's hash table; see [`SKEWED_SPLIT_PROBS`] for the priors.
const MAX_ACCOUNTED_SKEWNESS_LEVEL: usize = 3;

const NUM_SKEWNESS_LEVELS: usize = MAX_ACCOUNTED_SKEWNESS_LEVEL + 1;

/// Least skewed `max_keys_for_half` accounted per level. Below this the
/// split still increments the generation's split counter but no per-level
/// stats: the probability of such splits is too high to be interesting,
/// and group-wise probing is insensitive to that little shift anyway.
const MIN_ACCOUNTED_MAX_KEYS_FOR_HALF: u32 =
    (HASH_TABLE_SLOTS / 2) as u32 - MAX_ACCOUNTED_SKEWNESS_LEVEL as u32;

/// One skewness level's stats within a generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SkewedSplitStat {
    /// Splits observed with at least this level's skewness since the last
    /// rotation. Never exceeds the generation's `num_splits`.
    num_skewed: u32,
    /// Largest `num_skewed` known to be non-reportable, computed or
    /// lower-bounded for some earlier `num_splits`. Only ever tightens
    /// between rotations.
    max_non_reported_last_computed: u32,
}

/// Split statistics for one target order.
///
/// Two generations coexist: splits into segments of the current average
/// order (from order `average - 1`) and splits into the next average order
/// (from order `average`). When the average order moves, generations are
/// rotated; stats arrays are allocated on the first accounted skewed split
/// and then only re-zeroed, never freed.
#[derive(Default)]
struct SplitStatsGeneration {
    num_splits: u32,
    skew_stats: Option<Box<[SkewedSplitStat; NUM_SKEWNESS_LEVELS]>>,
}

impl SplitStatsGeneration {
    fn zero(&mut self) {
        self.num_splits = 0;
        if let Some(stats) = &mut self.skew_stats {
            **stats = [SkewedSplitStat::default(); NUM_SKEWNESS_LEVELS];
        }
    }

    fn into_zeroed(mut self) -> Self {
        self.zero();
        self
    }

    fn stats_snapshot(&self) -> [SkewedSplitStat; NUM_SKEWNESS_LEVELS] {
        self.skew_stats.as_deref().copied().unwrap_or_default()
    }
}

/// Compares sizes of segments of different orders as if they were of the
/// same order: the result matches the sign of
/// `size1 / 2^order1 - size2 / 2^order2`. Widened integer arithmetic, no
/// precision loss.
pub(crate) fn compare_normalized_segment_sizes(
    size1: u64,
    order1: u8,
    size2: u64,
    order2: u8,
) -> Ordering {
    let normalized1 = (size1 as u128) << order2.saturating_sub(order1);
    let normalized2 = (size2 as u128) << order1.saturating_sub(order2);
    normalized1.cmp(&normalized2)
}

/// Per-map monitor of hash-code distribution quality.
pub struct HashCodeDistribution<K, V> {
    /// Report an occasion when its probability under a well-distributed
    /// hash function falls below this.
    min_reporting_prob: f64,
    reporting_action: ReportingAction<K, V>,

    // Too-many-inflated-segments reporting is a future feature: the latch
    // starts engaged and only the counter is maintained.
    has_reported_too_many_inflated_segments: bool,
    num_inflated_segments: u32,

    report_too_large_inflated_segment: bool,
    /// Largest non-reportable segment size, cached from the last slow-path
    /// computation, together with the segment order it was computed for.
    segment_size_max_non_reported: u64,
    segment_order_for_max_non_reported: u8,
    /// The cached threshold stays valid while the map size is at least
    /// this; smaller maps need a recomputation.
    min_map_size_for_max_non_reported_valid: u64,

    has_reported_too_many_skewed_splits: bool,
    splits_to_current_average_order: SplitStatsGeneration,
    splits_to_next_average_order: SplitStatsGeneration,
}

impl<K, V> HashCodeDistribution<K, V> {
    pub fn new(min_reporting_prob: f64, reporting_action: ReportingAction<K, V>) -> Self {
        assert!(
            min_reporting_prob > 0.0 && min_reporting_prob <= 1.0,
            "min_reporting_prob must be in (0, 1], got {min_reporting_prob}"
        );
        Self {
            min_reporting_prob,
            reporting_action,
            has_reported_too_many_inflated_segments: true,
            num_inflated_segments: 0,
            report_too_large_inflated_segment: true,
            segment_size_max_non_reported: 0,
            segment_order_for_max_non_reported: 0,
            min_map_size_for_max_non_reported_valid: 0,
            has_reported_too_many_skewed_splits: false,
            splits_to_current_average_order: SplitStatsGeneration::default(),
            splits_to_next_average_order: SplitStatsGeneration::default(),
        }
    }

    fn max_benign_occasion_probability(&self) -> f64 {
        1.0 - self.min_reporting_prob
    }

    // region too large inflated segment reporting

    pub fn is_reporting_too_large_inflated_segment(&self) -> bool {
        self.report_too_large_inflated_segment
    }

    pub(crate) fn note_inflated_segments_changed(&mut self, delta: i32) {
        self.num_inflated_segments = self.num_inflated_segments.wrapping_add_signed(delta);
    }

    /// Reserved: too-many-inflated-segments reporting is not implemented,
    /// so this is `false` for the monitor's whole lifetime.
    pub fn is_reporting_too_many_inflated_segments(&self) -> bool {
        !self.has_reported_too_many_inflated_segments && self.num_inflated_segments > 0
    }

    /// Hot-path check: can this inflated segment's size be worth the slow
    /// statistical path? `false` guarantees the size is within the cached
    /// threshold and the cache is still valid for `map_size`.
    ///
    /// Sizes are compared via [`compare_normalized_segment_sizes`] because
    /// the segment's order and the cached order may relate either way if
    /// the inflated segment saw no operations for a while as the map's
    /// average order moved.
    pub(crate) fn inflated_segment_might_be_poor(
        &self,
        segment_size: u64,
        segment_order: u8,
        map_size: u64,
    ) -> bool {
        map_size < self.min_map_size_for_max_non_reported_valid
            || compare_normalized_segment_sizes(
                segment_size,
                segment_order,
                self.segment_size_max_non_reported,
                self.segment_order_for_max_non_reported,
            ) == Ordering::Greater
    }

    /// Slow path: model the map as `2^average_segment_order` independent
    /// virtual segments with Poisson-distributed sizes, recompute and cache
    /// the max non-reportable size and its validity range, and report if
    /// the segment exceeds it.
    ///
    /// The caller must have let the host recompute `average_segment_order`
    /// for `map_size` and attempt a split of the inflated segment first;
    /// a failed split guarantees `segment_order >= average_segment_order`.
    pub(crate) fn check_and_report_too_large_inflated_segment(
        &mut self,
        map_size: u64,
        average_segment_order: u8,
        segment: &InflatedSegment<K, V>,
        segment_size: u64,
        segment_order: u8,
        excluded_key: &K,
    ) -> Result<(), DistributionError> {
        // The virtual segment may not exist in reality (there may be one
        // coarser segment, or two finer ones, covering its hash range); it
        // is only a basket for the statistical model. Using the average
        // order rather than segment_order improves the precision of the
        // final comparison.
        let num_virtual_segments = 1u64 << average_segment_order;
        let average_virtual_segment_size = map_size as f64 / num_virtual_segments as f64;
        let segment_size_distribution = Poisson::new(average_virtual_segment_size);
        // Prob[occasion anywhere] = per-virtual-segment prob ^ V under the
        // independence assumption, so each virtual segment gets the V-th
        // root of the configured threshold.
        let per_virtual_min_reporting_prob =
            self.min_reporting_prob.powf(1.0 / num_virtual_segments as f64);
        // The inverse CDF result is the max non-reported size itself (not
        // +-1): the threshold probability falls on that histogram bar.
        let max_non_reported =
            segment_size_distribution.inverse_cdf(per_virtual_min_reporting_prob);
        self.segment_size_max_non_reported = max_non_reported;
        self.segment_order_for_max_non_reported = segment_order;

        let max_mean_invalid =
            poisson_mean_by_cdf(max_non_reported as i64 - 1, per_virtual_min_reporting_prob);
        let mut min_map_size_valid =
            (max_mean_invalid * num_virtual_segments as f64).ceil() as u64;
        if min_map_size_valid > map_size {
            return Err(DistributionError::Sanity {
                min_reporting_prob: self.min_reporting_prob,
                map_size,
                segment_size,
                segment_order,
            });
        }
        let map_size_difference = map_size - min_map_size_valid;
        if map_size_difference > 0 {
            // poisson_mean_by_cdf() leans on the chi-squared inverse whose
            // last digits are not trusted; shift the validity bound a
            // little towards map_size. The bulk of the size range between
            // the two values still skips the slow path.
            min_map_size_valid += (map_size_difference / 100).max(1);
        }
        self.min_map_size_for_max_non_reported_valid = min_map_size_valid;

        let Some(order_difference) = segment_order.checked_sub(average_segment_order) else {
            return Err(DistributionError::Sanity {
                min_reporting_prob: self.min_reporting_prob,
                map_size,
                segment_size,
                segment_order,
            });
        };
        let size_normalized_to_virtual = segment_size << order_difference;
        if size_normalized_to_virtual <= max_non_reported {
            return Ok(());
        }

        tracing::debug!(
            map_size,
            average_segment_order,
            segment_order,
            segment_size,
            max_non_reported,
            "reporting a too large inflated segment"
        );
        let message = format!(
            "In a map of {map_size} entries (average segment order = \
             {average_segment_order}) the probability for a segment of order {segment_order} \
             to have {segment_size} entries, assuming the hash function distributes keys \
             perfectly well, is below the configured threshold {}",
            self.max_benign_occasion_probability()
        );
        let cached_order = self.segment_order_for_max_non_reported;
        let debug_info = move || {
            let occasion_probability =
                1.0 - segment_size_distribution.cdf(size_normalized_to_virtual as i64 - 1);
            vec![
                ("segment_order_for_max_non_reported", cached_order.to_string()),
                ("segment_size_max_non_reported", max_non_reported.to_string()),
                (
                    "min_map_size_for_max_non_reported_valid",
                    min_map_size_valid.to_string(),
                ),
                ("average_segment_order", average_segment_order.to_string()),
                ("num_virtual_segments", num_virtual_segments.to_string()),
                (
                    "average_virtual_segment_size",
                    average_virtual_segment_size.to_string(),
                ),
                (
                    "per_virtual_segment_min_reporting_prob",
                    per_virtual_min_reporting_prob.to_string(),
                ),
                (
                    "occasion_probability_repr",
                    format!(
                        "CCDF[{segment_size_distribution}, {}]",
                        size_normalized_to_virtual - 1
                    ),
                ),
                ("occasion_probability", occasion_probability.to_string()),
            ]
        };
        let occasion = PoorHashCodeDistributionOccasion::new(
            OccasionKind::TooLargeInflatedSegment,
            map_size,
            average_segment_order,
            message,
            &debug_info,
            Some(segment),
            Some(excluded_key),
        );
        (self.reporting_action)(&occasion);
        // If the callback doesn't actively remove elements, further reports
        // about the same map would repeat themselves; stop reporting then.
        self.report_too_large_inflated_segment = occasion.removed_some_element();
        Ok(())
    }

    // endregion

    // region too many skewed segment splits reporting

    /// Called once per change of the map's cached average segment order;
    /// rotates the split-stats generations to follow it.
    pub fn average_segment_order_updated(
        &mut self,
        prev_average_order: u8,
        new_average_order: u8,
    ) -> Result<(), DistributionError> {
        if self.has_reported_too_many_skewed_splits {
            return Ok(());
        }
        match new_average_order as i32 - prev_average_order as i32 {
            1 => {
                self.rotate_stats_one_order_forward();
                Ok(())
            }
            -1 => {
                self.rotate_stats_one_order_backward();
                Ok(())
            }
            d if d <= -2 => {
                // The map just started growing again after significant
                // shrinking; neither generation matches an adjacent order.
                self.rotate_stats_several_orders_backward();
                Ok(())
            }
            _ => Err(DistributionError::IllegalAverageOrderChange {
                prev: prev_average_order,
                new: new_average_order,
            }),
        }
    }

    /// Make "Next" the new "Current", zero out "Next" (the map is growing).
    fn rotate_stats_one_order_forward(&mut self) {
        let prev_current = std::mem::replace(
            &mut self.splits_to_current_average_order,
            std::mem::take(&mut self.splits_to_next_average_order),
        );
        self.splits_to_next_average_order = prev_current.into_zeroed();
    }

    /// Make "Current" the new "Next", zero out "Current" (the map is
    /// shrinking).
    fn rotate_stats_one_order_backward(&mut self) {
        let prev_next = std::mem::replace(
            &mut self.splits_to_next_average_order,
            std::mem::take(&mut self.splits_to_current_average_order),
        );
        self.splits_to_current_average_order = prev_next.into_zeroed();
    }

    fn rotate_stats_several_orders_backward(&mut self) {
        self.splits_to_current_average_order.zero();
        self.splits_to_next_average_order.zero();
    }

    /// Account a completed segment split from `prior_segment_order` that
    /// left `num_keys_half_one` of `total_num_keys_before_split` keys in
    /// one result segment, and report if the number of skewed splits at
    /// some skewness level has become statistically implausible.
    pub fn account_segment_split(
        &mut self,
        map_size: u64,
        average_segment_order: u8,
        prior_segment_order: u8,
        num_keys_half_one: u32,
        total_num_keys_before_split: u32,
    ) -> Result<(), DistributionError> {
        if self.has_reported_too_many_skewed_splits {
            return Ok(());
        }
        self.account_segment_split0(
            map_size,
            average_segment_order,
            prior_segment_order,
            num_keys_half_one,
            total_num_keys_before_split,
        )
    }

    fn account_segment_split0(
        &mut self,
        map_size: u64,
        average_segment_order: u8,
        prior_segment_order: u8,
        num_keys_half_one: u32,
        total_num_keys_before_split: u32,
    ) -> Result<(), DistributionError> {
        debug_assert!(num_keys_half_one <= total_num_keys_before_split);
        let num_keys_half_two = total_num_keys_before_split - num_keys_half_one;
        let max_keys_for_half = num_keys_half_one.max(num_keys_half_two);

        let order_difference = average_segment_order as i32 - prior_segment_order as i32;
        let generation = match order_difference {
            // Splitting into segments of the current average order.
            1 => &mut self.splits_to_current_average_order,
            // Splitting into segments of the next average order.
            0 => &mut self.splits_to_next_average_order,
            _ => {
                if prior_segment_order > max_splittable_segment_order(average_segment_order) {
                    return Err(DistributionError::ConcurrentModification {
                        prior_order: prior_segment_order,
                        average_order: average_segment_order,
                    });
                }
                // Splits lagging more than one order behind the average are
                // legal but rare; they are not accounted.
                return Ok(());
            }
        };
        generation.num_splits += 1;
        let num_splits = generation.num_splits;
        if max_keys_for_half < MIN_ACCOUNTED_MAX_KEYS_FOR_HALF {
            return Ok(());
        }

        let slots_minus_max_keys = (HASH_TABLE_SLOTS / 2) as u32 - max_keys_for_half.min(
            (HASH_TABLE_SLOTS / 2) as u32,
        );
        let top_level = MAX_ACCOUNTED_SKEWNESS_LEVEL - slots_minus_max_keys as usize;

        let min_reporting_prob = self.min_reporting_prob;
        let stats = generation.skew_stats.get_or_insert_with(Default::default);
        let mut to_report = None;
        // Every lower skewness level also observed this split.
        for level in (0..=top_level).rev() {
            let stat = &mut stats[level];
            stat.num_skewed += 1;
            let num_skewed = stat.num_skewed;
            // Three checks of increasing cost decide whether this level's
            // count has become reportable.
            // 1) The bound cached from an earlier computation.
            if num_skewed <= stat.max_non_reported_last_computed {
                continue;
            }
            // 2) The conservative bound: the expected number of skewed
            // splits is always non-reportable.
            let lower_bound = (SKEWED_SPLIT_PROBS[level] * num_splits as f64) as u32;
            if num_skewed <= lower_bound {
                stat.max_non_reported_last_computed = lower_bound;
                continue;
            }
            // 3) The precise bound via the Binomial inverse CDF. The cached
            // bound may be the tighter of the two inputs (it may stem from
            // an earlier precise computation), so both are passed down.
            let prev_bound = stat.max_non_reported_last_computed.max(lower_bound);
            let precise_bound = if num_splits <= MAX_SPLITS_WITH_PRECOMPUTED {
                precomputed_max_non_reported(level, num_splits, min_reporting_prob, prev_bound)
            } else {
                approximated_max_non_reported(level, num_splits, min_reporting_prob)
                    .max(prev_bound)
            };
            if num_skewed <= precise_bound {
                stat.max_non_reported_last_computed = precise_bound;
                continue;
            }
            to_report = Some((level, num_skewed));
            break;
        }
        if let Some((level, num_skewed)) = to_report {
            self.report_too_many_skewed_segment_splits(
                map_size,
                average_segment_order,
                prior_segment_order,
                num_splits,
                level,
                num_skewed,
            );
        }
        Ok(())
    }

    fn report_too_many_skewed_segment_splits(
        &mut self,
        map_size: u64,
        average_segment_order: u8,
        prior_segment_order: u8,
        total_num_splits_from_order: u32,
        skewness_level: usize,
        num_skewed: u32,
    ) {
        self.has_reported_too_many_skewed_splits = true;
        tracing::debug!(
            prior_segment_order,
            total_num_splits_from_order,
            skewness_level,
            num_skewed,
            "reporting too many skewed segment splits"
        );
        let message = format!(
            "There have been {num_skewed} skewed splits of segments of order \
             {prior_segment_order} in this map.\nThe probability of this, assuming the hash \
             function distributes keys perfectly well, is below the configured threshold {}.\n\
             This points at a correlation between the hash bits that pick a slot within a \
             segment and the high bits that pick the segment.",
            self.max_benign_occasion_probability()
        );
        let num_splits_to_current = self.splits_to_current_average_order.num_splits;
        let current_stats = self.splits_to_current_average_order.stats_snapshot();
        let num_splits_to_next = self.splits_to_next_average_order.num_splits;
        let next_stats = self.splits_to_next_average_order.stats_snapshot();
        let debug_info = move || {
            let skewness_prob = SKEWED_SPLIT_PROBS[skewness_level];
            let skewness_distribution = Binomial::new(total_num_splits_from_order, skewness_prob);
            let occasion_probability = skewness_distribution.ccdf(num_skewed as i64 - 1);
            vec![
                ("skewness_level", skewness_level.to_string()),
                ("prior_segment_order", prior_segment_order.to_string()),
                (
                    "total_num_splits_from_order",
                    total_num_splits_from_order.to_string(),
                ),
                (
                    "occasion_probability_repr",
                    format!("CCDF[{skewness_distribution}, {}]", num_skewed as i64 - 1),
                ),
                ("occasion_probability", occasion_probability.to_string()),
                ("map_size", map_size.to_string()),
                (
                    "average_segment_order_last_computed",
                    average_segment_order.to_string(),
                ),
                (
                    "num_splits_to_current_average_order",
                    num_splits_to_current.to_string(),
                ),
                (
                    "split_stats_to_current_average_order",
                    format!("{current_stats:?}"),
                ),
                (
                    "num_splits_to_next_average_order",
                    num_splits_to_next.to_string(),
                ),
                ("split_stats_to_next_average_order", format!("{next_stats:?}")),
            ]
        };
        let occasion = PoorHashCodeDistributionOccasion::new(
            OccasionKind::TooManySkewedSegmentSplits,
            map_size,
            average_segment_order,
            message,
            &debug_info,
            None,
            None,
        );
        (self.reporting_action)(&occasion);
    }

    // endregion
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Monitor = HashCodeDistribution<u64, u64>;

    fn monitor_with_log(
        min_reporting_prob: f64,
        removed_some_element: bool,
    ) -> (Monitor, Rc<RefCell<Vec<OccasionKind>>>) {
        let log: Rc<RefCell<Vec<OccasionKind>>> = Rc::default();
        let sink = Rc::clone(&log);
        let monitor = HashCodeDistribution::new(
            min_reporting_prob,
            Box::new(move |occasion| {
                sink.borrow_mut().push(occasion.kind());
                occasion.set_removed_some_element(removed_some_element);
            }),
        );
        (monitor, log)
    }

    #[test]
    fn compare_normalized_segment_sizes_basics() {
        use Ordering::*;
        // Same order: plain size comparison.
        assert_eq!(compare_normalized_segment_sizes(5, 3, 4, 3), Greater);
        assert_eq!(compare_normalized_segment_sizes(4, 3, 5, 3), Less);
        assert_eq!(compare_normalized_segment_sizes(5, 3, 5, 3), Equal);
        // The sign matches size1 / 2^order1 - size2 / 2^order2: 20 keys at
        // order 3 weigh the same as 10 keys at order 2.
        assert_eq!(compare_normalized_segment_sizes(20, 3, 10, 2), Equal);
        assert_eq!(compare_normalized_segment_sizes(21, 3, 10, 2), Greater);
        assert_eq!(compare_normalized_segment_sizes(20, 3, 11, 2), Less);
        // No precision loss at large sizes and order differences.
        assert_eq!(
            compare_normalized_segment_sizes(u64::MAX, 30, u64::MAX, 0),
            Less
        );
        assert_eq!(
            compare_normalized_segment_sizes(u64::MAX, 0, u64::MAX, 30),
            Greater
        );
    }

    proptest! {
        #[test]
        fn compare_normalized_is_antisymmetric_and_scale_invariant(
            size1 in 0u64..1_000_000,
            order1 in 0u8..=30,
            size2 in 0u64..1_000_000,
            order2 in 0u8..=30,
        ) {
            let forward = compare_normalized_segment_sizes(size1, order1, size2, order2);
            let backward = compare_normalized_segment_sizes(size2, order2, size1, order1);
            prop_assert_eq!(forward, backward.reverse());
            // Doubling a size while deepening its order by one is neutral.
            let scaled = compare_normalized_segment_sizes(size1 * 2, order1 + 1, size2, order2);
            prop_assert_eq!(forward, scaled);
        }
    }

    #[test]
    fn balanced_splits_are_never_reported() {
        // Scenario: 1000 splits from order average - 1 with near-even key
        // halves. No stats allocation, no occasion.
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        for i in 0..1000u32 {
            let half_one = 23 + (i % 3); // 23, 24, 25
            monitor
                .account_segment_split(50_000, 6, 5, half_one, 48)
                .unwrap();
        }
        assert!(log.borrow().is_empty());
        assert_eq!(monitor.splits_to_current_average_order.num_splits, 1000);
        assert!(monitor.splits_to_current_average_order.skew_stats.is_none());
        assert!(!monitor.has_reported_too_many_skewed_splits);
    }

    #[test]
    fn mildly_skewed_splits_stay_under_conservative_bound() {
        // max_keys_for_half = 29 is accounted at level 0 only; its prior is
        // ~0.19, so a fifth of the splits being skewed is unremarkable.
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        for i in 0..1000u32 {
            let half_one = if i % 10 == 0 { 29 } else { 24 };
            monitor
                .account_segment_split(50_000, 6, 5, half_one, 48)
                .unwrap();
        }
        assert!(log.borrow().is_empty());
        let stats = monitor
            .splits_to_current_average_order
            .skew_stats
            .as_deref()
            .unwrap();
        assert_eq!(stats[0].num_skewed, 100);
        assert_eq!(stats[1].num_skewed, 0);
        assert!(stats[0].num_skewed <= stats[0].max_non_reported_last_computed.max(193));
    }

    #[test]
    fn pathological_skew_reports_exactly_once() {
        // Scenario: 200 maximally skewed splits from the average order.
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        for _ in 0..200 {
            monitor.account_segment_split(10_000, 6, 6, 48, 48).unwrap();
        }
        assert_eq!(
            log.borrow().as_slice(),
            &[OccasionKind::TooManySkewedSegmentSplits]
        );
        assert!(monitor.has_reported_too_many_skewed_splits);
        // The monitor latched: later splits do no further work.
        let frozen_num_splits = monitor.splits_to_next_average_order.num_splits;
        assert!(frozen_num_splits < 200);
        monitor.account_segment_split(10_000, 6, 6, 48, 48).unwrap();
        assert_eq!(
            monitor.splits_to_next_average_order.num_splits,
            frozen_num_splits
        );
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn skew_counts_are_monotone_across_levels() {
        // Sprinkle skewed splits among balanced ones at rates well below
        // each level's prior, so nothing is reported; a split of skewness
        // level s increments every level up to s.
        let (mut monitor, log) = monitor_with_log(1e-3, false);
        for i in 0..1000u32 {
            let half_one = if i % 250 == 249 {
                48
            } else if i % 50 == 49 {
                31
            } else if i % 10 == 9 {
                29
            } else {
                24
            };
            monitor.account_segment_split(10_000, 6, 5, half_one, 48).unwrap();
        }
        assert!(log.borrow().is_empty());
        let stats = monitor
            .splits_to_current_average_order
            .skew_stats
            .as_deref()
            .unwrap();
        let num_splits = monitor.splits_to_current_average_order.num_splits;
        assert_eq!(num_splits, 1000);
        for level in 0..NUM_SKEWNESS_LEVELS {
            assert!(stats[level].num_skewed <= num_splits);
            if level > 0 {
                assert!(stats[level].num_skewed <= stats[level - 1].num_skewed);
            }
        }
        assert_eq!(stats[0].num_skewed, 100);
        assert_eq!(stats[1].num_skewed, 20);
        assert_eq!(stats[2].num_skewed, 20);
        assert_eq!(stats[3].num_skewed, 4);
    }

    #[test]
    fn average_order_oscillation_rotates_generations() {
        // Scenario: grow by one order, account splits into the (new)
        // current average order, shrink back. Those splits now produce
        // segments of the next average order, so "Current" moves to
        // "Next" and "Current" is zeroed.
        let (mut monitor, _log) = monitor_with_log(1e-9, false);
        monitor.average_segment_order_updated(5, 6).unwrap();
        for _ in 0..10 {
            monitor.account_segment_split(10_000, 6, 5, 29, 48).unwrap();
        }
        assert_eq!(monitor.splits_to_current_average_order.num_splits, 10);
        let stats_before = monitor.splits_to_current_average_order.stats_snapshot();
        assert_eq!(stats_before[0].num_skewed, 10);

        monitor.average_segment_order_updated(6, 5).unwrap();
        assert_eq!(monitor.splits_to_next_average_order.num_splits, 10);
        assert_eq!(
            monitor.splits_to_next_average_order.stats_snapshot()[0].num_skewed,
            10
        );
        assert_eq!(monitor.splits_to_current_average_order.num_splits, 0);
        assert_eq!(
            monitor.splits_to_current_average_order.stats_snapshot(),
            [SkewedSplitStat::default(); NUM_SKEWNESS_LEVELS]
        );
    }

    #[test]
    fn forward_rotation_promotes_next_generation() {
        let (mut monitor, _log) = monitor_with_log(1e-9, false);
        for _ in 0..7 {
            monitor.account_segment_split(10_000, 6, 6, 30, 48).unwrap();
        }
        assert_eq!(monitor.splits_to_next_average_order.num_splits, 7);

        monitor.average_segment_order_updated(6, 7).unwrap();
        assert_eq!(monitor.splits_to_current_average_order.num_splits, 7);
        assert_eq!(monitor.splits_to_next_average_order.num_splits, 0);
        assert_eq!(
            monitor.splits_to_next_average_order.stats_snapshot(),
            [SkewedSplitStat::default(); NUM_SKEWNESS_LEVELS]
        );
    }

    #[test]
    fn large_shrink_zeroes_both_generations() {
        let (mut monitor, _log) = monitor_with_log(1e-9, false);
        for _ in 0..5 {
            monitor.account_segment_split(10_000, 6, 5, 48, 48).unwrap();
            monitor.account_segment_split(10_000, 6, 6, 48, 48).unwrap();
        }
        monitor.average_segment_order_updated(6, 3).unwrap();
        assert_eq!(monitor.splits_to_current_average_order.num_splits, 0);
        assert_eq!(monitor.splits_to_next_average_order.num_splits, 0);
        assert_eq!(
            monitor.splits_to_current_average_order.stats_snapshot(),
            [SkewedSplitStat::default(); NUM_SKEWNESS_LEVELS]
        );
        assert_eq!(
            monitor.splits_to_next_average_order.stats_snapshot(),
            [SkewedSplitStat::default(); NUM_SKEWNESS_LEVELS]
        );
    }

    #[test]
    fn impossible_average_order_change_is_an_error() {
        let (mut monitor, _log) = monitor_with_log(1e-9, false);
        let err = monitor.average_segment_order_updated(5, 5).unwrap_err();
        assert!(matches!(
            err,
            DistributionError::IllegalAverageOrderChange { prev: 5, new: 5 }
        ));
        let err = monitor.average_segment_order_updated(5, 8).unwrap_err();
        assert!(matches!(
            err,
            DistributionError::IllegalAverageOrderChange { prev: 5, new: 8 }
        ));
    }

    #[test]
    fn split_ahead_of_average_is_concurrent_modification() {
        // Scenario: a split from order average + 2 cannot happen without
        // concurrent modification of the map.
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        let err = monitor
            .account_segment_split(10_000, 6, 8, 30, 48)
            .unwrap_err();
        assert!(matches!(
            err,
            DistributionError::ConcurrentModification {
                prior_order: 8,
                average_order: 6
            }
        ));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn split_one_order_ahead_of_average_is_concurrent_modification() {
        // prior_order = average + 1 is already past the splittable bound:
        // splitting it would land segments two orders ahead of the average.
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        let err = monitor
            .account_segment_split(10_000, 6, 7, 30, 48)
            .unwrap_err();
        assert!(matches!(
            err,
            DistributionError::ConcurrentModification {
                prior_order: 7,
                average_order: 6
            }
        ));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn split_behind_average_is_silently_unaccounted() {
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        monitor.account_segment_split(10_000, 6, 3, 48, 48).unwrap();
        assert!(log.borrow().is_empty());
        assert_eq!(monitor.splits_to_current_average_order.num_splits, 0);
        assert_eq!(monitor.splits_to_next_average_order.num_splits, 0);
    }

    #[test]
    fn inflated_threshold_matches_poisson_model() {
        // Scenario: map of one million entries, average order 10 (1024
        // virtual segments), reporting probability 1e-9. The per-virtual
        // threshold is ~Poisson(976.6).inverse_cdf(0.98) ~ 1040.
        let (mut monitor, log) = monitor_with_log(1e-9, true);
        let segment: InflatedSegment<u64, u64> = InflatedSegment::new(10);

        monitor
            .check_and_report_too_large_inflated_segment(1_000_000, 10, &segment, 180, 10, &7)
            .unwrap();
        assert!(log.borrow().is_empty(), "size 180 is unremarkable");
        let threshold = monitor.segment_size_max_non_reported;
        assert!((1038..=1043).contains(&threshold), "threshold = {threshold}");
        assert_eq!(monitor.segment_order_for_max_non_reported, 10);
        let min_valid = monitor.min_map_size_for_max_non_reported_valid;
        assert!(min_valid > 0 && min_valid <= 1_000_000, "min_valid = {min_valid}");

        // The fast path now rules out anything at or below the threshold.
        assert!(!monitor.inflated_segment_might_be_poor(threshold, 10, 1_000_000));
        assert!(monitor.inflated_segment_might_be_poor(threshold + 1, 10, 1_000_000));
        // A smaller map invalidates the cache.
        assert!(monitor.inflated_segment_might_be_poor(threshold, 10, min_valid - 1));
        // Normalization across orders: a shallower segment weighs double.
        assert!(monitor.inflated_segment_might_be_poor(threshold / 2 + 1, 9, 1_000_000));
        assert!(!monitor.inflated_segment_might_be_poor(threshold * 2, 11, 1_000_000));

        // Growing past the threshold produces the occasion.
        monitor
            .check_and_report_too_large_inflated_segment(
                1_000_000,
                10,
                &segment,
                threshold + 1,
                10,
                &7,
            )
            .unwrap();
        assert_eq!(
            log.borrow().as_slice(),
            &[OccasionKind::TooLargeInflatedSegment]
        );
        // The callback declared a removal, so reporting stays armed.
        assert!(monitor.is_reporting_too_large_inflated_segment());
    }

    #[test]
    fn callback_refusing_removal_silences_inflated_reports() {
        let (mut monitor, log) = monitor_with_log(1e-9, false);
        let segment: InflatedSegment<u64, u64> = InflatedSegment::new(10);
        monitor
            .check_and_report_too_large_inflated_segment(1_000_000, 10, &segment, 1500, 10, &7)
            .unwrap();
        assert_eq!(log.borrow().len(), 1);
        // The host consults this before any further slow-path work.
        assert!(!monitor.is_reporting_too_large_inflated_segment());
    }

    #[test]
    fn inflated_occasion_carries_segment_and_key() {
        let seen: Rc<RefCell<Vec<(u64, usize, u8)>>> = Rc::default();
        let sink = Rc::clone(&seen);
        let mut monitor: Monitor = HashCodeDistribution::new(
            1e-9,
            Box::new(move |occasion| {
                assert_eq!(occasion.kind(), OccasionKind::TooLargeInflatedSegment);
                let segment = occasion.segment().unwrap();
                let debug_info = occasion.debug_info();
                assert!(debug_info.iter().any(|(k, _)| *k == "occasion_probability"));
                sink.borrow_mut().push((
                    *occasion.excluded_key().unwrap(),
                    segment.len(),
                    segment.order(),
                ));
            }),
        );
        let mut segment: InflatedSegment<u64, u64> = InflatedSegment::new(10);
        for i in 0..60 {
            segment.insert(i, i, i);
        }
        monitor
            .check_and_report_too_large_inflated_segment(1_000_000, 10, &segment, 1500, 10, &42)
            .unwrap();
        assert_eq!(seen.borrow().as_slice(), &[(42, 60, 10)]);
    }

    #[test]
    fn inflated_segment_below_average_order_is_a_sanity_error() {
        // The host must have split such a segment instead of reporting.
        let (mut monitor, _log) = monitor_with_log(1e-9, false);
        let segment: InflatedSegment<u64, u64> = InflatedSegment::new(4);
        let err = monitor
            .check_and_report_too_large_inflated_segment(1_000_000, 5, &segment, 1500, 4, &7)
            .unwrap_err();
        assert!(matches!(err, DistributionError::Sanity { .. }));
    }

    #[test]
    fn fresh_monitor_sends_first_inflated_touch_to_slow_path() {
        let (monitor, _log) = monitor_with_log(1e-9, false);
        assert!(monitor.inflated_segment_might_be_poor(49, 3, 1_000));
    }
}
