//! Probing and load statistics for diagnostics dumps.
//!
//! [`SegmentStats`] aggregates per-slot probing metrics over any number of
//! ordinary segments; [`MapStats`] buckets those aggregates by
//! `(segment_order, num_non_empty_slots)` across one or more maps. Both
//! render human-readable reports with per-value and cumulative percentile
//! columns.

use std::fmt;
use std::fmt::Write as _;

use crate::directory::MAX_SEGMENTS_ARRAY_ORDER;
use crate::segment::{
    Segment, HASH_TABLE_GROUPS, HASH_TABLE_GROUPS_MASK, HASH_TABLE_SLOTS,
    SEGMENT_MAX_ALLOC_CAPACITY,
};

/// Chain length for each group index reachable from a base group along the
/// quadratic probe chain (steps 1, 2, 3, ...), relative to base group 0.
/// Built by walking the chain once; every group index is assigned exactly
/// one length.
const CHAIN_GROUP_INDEX_TO_CHAIN_LENGTH: [u8; HASH_TABLE_GROUPS] = build_chain_length_table();

const fn build_chain_length_table() -> [u8; HASH_TABLE_GROUPS] {
    let mut table = [0u8; HASH_TABLE_GROUPS];
    let mut group = 0;
    let mut step = 0;
    let mut chain_length = 0;
    while chain_length < HASH_TABLE_GROUPS {
        table[group] = chain_length as u8;
        step += 1;
        group = (group + step) % HASH_TABLE_GROUPS;
        chain_length += 1;
    }
    table
}

fn percent_of(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 * 100.0 / total as f64
    }
}

fn decimal_width(value: u64) -> usize {
    value.to_string().len()
}

/// Append one line per non-zero count: `<prefix> <index>: <count> <name>,
/// <pct>% <cum_pct>%`, with the index column padded to the width of the
/// largest index and the count column to the width of the largest count.
/// `per_row` runs after each emitted row (used for nested tables).
fn append_counts_with_percentiles(
    out: &mut String,
    prefix: &str,
    name: &str,
    max_exclusive: usize,
    count_of: &dyn Fn(usize) -> u64,
    mut per_row: impl FnMut(&mut String, usize),
) {
    let index_width = decimal_width(max_exclusive as u64 - 1);
    let total: u64 = (0..max_exclusive).map(count_of).sum();
    let max_count = (0..max_exclusive).map(count_of).max().unwrap_or(0);
    let count_width = decimal_width(max_count);
    let mut cumulative = 0u64;
    for index in 0..max_exclusive {
        let count = count_of(index);
        if count == 0 {
            continue; // skip all-zero rows
        }
        cumulative += count;
        let _ = writeln!(
            out,
            "{prefix} {index:>index_width$}: {count:>count_width$} {name}, {:6.2}% {:6.2}%",
            percent_of(count, total),
            percent_of(cumulative, total),
        );
        per_row(out, index);
    }
}

/// Probing statistics aggregated over ordinary segments' full slots.
pub struct SegmentStats {
    num_aggregated_segments: u32,
    num_aggregated_full_slots: u64,
    num_segments_per_alloc_capacity: [u64; SEGMENT_MAX_ALLOC_CAPACITY + 1],
    num_slots_per_chain_group_length: [u64; HASH_TABLE_GROUPS],
    num_slots_per_collision_key_comparisons: [u64; SEGMENT_MAX_ALLOC_CAPACITY],
    num_slots_per_distance_to_alloc_boundary: [u64; HASH_TABLE_SLOTS],
}

impl SegmentStats {
    pub fn new() -> Self {
        Self {
            num_aggregated_segments: 0,
            num_aggregated_full_slots: 0,
            num_segments_per_alloc_capacity: [0; SEGMENT_MAX_ALLOC_CAPACITY + 1],
            num_slots_per_chain_group_length: [0; HASH_TABLE_GROUPS],
            num_slots_per_collision_key_comparisons: [0; SEGMENT_MAX_ALLOC_CAPACITY],
            num_slots_per_distance_to_alloc_boundary: [0; HASH_TABLE_SLOTS],
        }
    }

    pub fn num_aggregated_segments(&self) -> u32 {
        self.num_aggregated_segments
    }

    pub fn num_aggregated_full_slots(&self) -> u64 {
        self.num_aggregated_full_slots
    }

    pub(crate) fn increment_aggregated_segments(&mut self, alloc_capacity: usize) {
        self.num_aggregated_segments += 1;
        self.num_segments_per_alloc_capacity[alloc_capacity] += 1;
    }

    /// Record one full slot: its probe chain position (derived from the
    /// group distance along the quadratic chain), the number of collision
    /// key comparisons a lookup performs, and the slot's distance from the
    /// allocation-index boundary of its base group.
    pub(crate) fn aggregate_full_slot(
        &mut self,
        base_group_index: u64,
        group_index: u64,
        num_collision_key_comparisons: u32,
        alloc_index: u32,
        alloc_index_boundary: u32,
    ) {
        let chain_group_index =
            (group_index.wrapping_sub(base_group_index) & HASH_TABLE_GROUPS_MASK) as usize;
        let chain_length = CHAIN_GROUP_INDEX_TO_CHAIN_LENGTH[chain_group_index] as usize;
        self.num_slots_per_chain_group_length[chain_length] += 1;
        self.num_slots_per_collision_key_comparisons[num_collision_key_comparisons as usize] += 1;
        // The boundary itself counts as distance 0 on the upper side; the
        // lower side starts at 0 one slot below the boundary.
        let distance = if alloc_index >= alloc_index_boundary {
            alloc_index - alloc_index_boundary
        } else {
            alloc_index_boundary - alloc_index - 1
        };
        self.num_slots_per_distance_to_alloc_boundary[distance as usize] += 1;
        self.num_aggregated_full_slots += 1;
    }

    /// Combine with another aggregate.
    pub fn add(&mut self, other: &SegmentStats) {
        self.num_aggregated_segments += other.num_aggregated_segments;
        self.num_aggregated_full_slots += other.num_aggregated_full_slots;
        add_metric_arrays(
            &mut self.num_segments_per_alloc_capacity,
            &other.num_segments_per_alloc_capacity,
        );
        add_metric_arrays(
            &mut self.num_slots_per_chain_group_length,
            &other.num_slots_per_chain_group_length,
        );
        add_metric_arrays(
            &mut self.num_slots_per_collision_key_comparisons,
            &other.num_slots_per_collision_key_comparisons,
        );
        add_metric_arrays(
            &mut self.num_slots_per_distance_to_alloc_boundary,
            &other.num_slots_per_distance_to_alloc_boundary,
        );
    }

    fn append_slot_metric(&self, out: &mut String, metric: &[u64], metric_name: &str) {
        let total_metric_sum: u64 = metric
            .iter()
            .enumerate()
            .map(|(value, &count)| count * value as u64)
            .sum();
        let average = total_metric_sum as f64 / self.num_aggregated_full_slots.max(1) as f64;
        let _ = writeln!(out, "Average {metric_name}: {average:.2}");
        append_counts_with_percentiles(
            out,
            &format!("{metric_name} ="),
            "slots",
            metric.len(),
            &|value| metric[value],
            |_, _| {},
        );
    }
}

impl Default for SegmentStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let _ = writeln!(out, "Number of segments: {}", self.num_aggregated_segments);
        append_counts_with_percentiles(
            &mut out,
            "segments with alloc capacity =",
            "segments",
            self.num_segments_per_alloc_capacity.len(),
            &|capacity| self.num_segments_per_alloc_capacity[capacity],
            |_, _| {},
        );
        let average_full_slots =
            self.num_aggregated_full_slots as f64 / self.num_aggregated_segments.max(1) as f64;
        let _ = writeln!(out, "Average full slots: {average_full_slots:.2}");
        self.append_slot_metric(
            &mut out,
            &self.num_slots_per_chain_group_length,
            "collision chain group length",
        );
        self.append_slot_metric(
            &mut out,
            &self.num_slots_per_collision_key_comparisons,
            "num collision key comparisons",
        );
        self.append_slot_metric(
            &mut out,
            &self.num_slots_per_distance_to_alloc_boundary,
            "distance to alloc index boundary",
        );
        f.write_str(&out)
    }
}

fn add_metric_arrays(target: &mut [u64], source: &[u64]) {
    for (t, s) in target.iter_mut().zip(source) {
        *t += s;
    }
}

type StatsPerNonEmptySlots = Vec<Option<Box<SegmentStats>>>;

/// Map-level statistics: [`SegmentStats`] bucketed by
/// `(segment_order, num_non_empty_slots)`. Inflated segments are counted
/// but not aggregated.
pub struct MapStats {
    num_aggregated_maps: u32,
    num_aggregated_segments: u32,
    num_inflated_segments: u32,
    stats_per_order: Vec<Option<StatsPerNonEmptySlots>>,
}

impl MapStats {
    pub fn new() -> Self {
        Self {
            num_aggregated_maps: 0,
            num_aggregated_segments: 0,
            num_inflated_segments: 0,
            stats_per_order: (0..=MAX_SEGMENTS_ARRAY_ORDER as usize).map(|_| None).collect(),
        }
    }

    pub fn num_aggregated_maps(&self) -> u32 {
        self.num_aggregated_maps
    }

    pub fn num_aggregated_segments(&self) -> u32 {
        self.num_aggregated_segments
    }

    pub fn num_inflated_segments(&self) -> u32 {
        self.num_inflated_segments
    }

    pub(crate) fn increment_aggregated_maps(&mut self) {
        self.num_aggregated_maps += 1;
    }

    fn acquire_segment_stats(
        &mut self,
        segment_order: u8,
        num_non_empty_slots: usize,
    ) -> &mut SegmentStats {
        let per_slots = self.stats_per_order[segment_order as usize]
            .get_or_insert_with(|| (0..=SEGMENT_MAX_ALLOC_CAPACITY).map(|_| None).collect());
        per_slots[num_non_empty_slots].get_or_insert_with(Default::default)
    }

    /// Aggregate one segment. Keys of ordinary segments are rehashed with
    /// `hash_fn` to recover probe chains.
    pub(crate) fn aggregate_segment<K, V, F>(&mut self, segment: &Segment<K, V>, hash_fn: F)
    where
        F: Fn(&K) -> u64,
    {
        self.num_aggregated_segments += 1;
        match segment {
            Segment::Inflated(_) => self.num_inflated_segments += 1,
            Segment::Ordinary(seg) => {
                let stats = self.acquire_segment_stats(seg.order(), seg.count());
                seg.aggregate_stats(hash_fn, stats);
            }
        }
    }

    /// Number of aggregated ordinary segments with the given order.
    pub fn num_segments_for_order(&self, segment_order: u8) -> u64 {
        let Some(per_slots) = &self.stats_per_order[segment_order as usize] else {
            return 0;
        };
        per_slots
            .iter()
            .flatten()
            .map(|stats| stats.num_aggregated_segments() as u64)
            .sum()
    }

    /// Aggregate over every `(order, num_non_empty_slots)` bucket.
    pub fn total_segment_stats(&self) -> SegmentStats {
        let mut total = SegmentStats::new();
        for per_slots in self.stats_per_order.iter().flatten() {
            for stats in per_slots.iter().flatten() {
                total.add(stats);
            }
        }
        total
    }

    /// Aggregate over every order for one `num_non_empty_slots` value.
    pub fn segment_stats_for_num_non_empty_slots(&self, num_non_empty_slots: usize) -> SegmentStats {
        let mut total = SegmentStats::new();
        for per_slots in self.stats_per_order.iter().flatten() {
            if let Some(stats) = &per_slots[num_non_empty_slots] {
                total.add(stats);
            }
        }
        total
    }

    /// Formatted dump of segment counts per order, with per-order load
    /// (non-empty slot) breakdowns nested under each order row.
    pub fn segment_order_and_load_distribution(&self) -> String {
        let mut out = String::new();
        append_counts_with_percentiles(
            &mut out,
            "order",
            "segments",
            self.stats_per_order.len(),
            &|order| self.num_segments_for_order(order as u8),
            |out, order| {
                let Some(per_slots) = &self.stats_per_order[order] else {
                    return;
                };
                append_counts_with_percentiles(
                    out,
                    "# non-empty slots =",
                    "segments",
                    per_slots.len(),
                    &|slots| {
                        per_slots[slots]
                            .as_ref()
                            .map_or(0, |stats| stats.num_aggregated_segments() as u64)
                    },
                    |_, _| {},
                );
            },
        );
        out
    }
}

impl Default for MapStats {
    fn default() -> Self {
        Self::new()
    }
}
