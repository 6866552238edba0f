//! Bounds on the number of skewed segment splits that are still plausible
//! under a well-distributed hash function.
//!
//! The skewed-split monitor needs the smallest count `k` whose exceedance
//! probability under `Binomial(num_splits, SKEWED_SPLIT_PROBS[level])` drops
//! below the configured reporting probability. Two paths provide it:
//!
//! - up to [`MAX_SPLITS_WITH_PRECOMPUTED`] splits: a packed byte table built
//!   once per process, indexed by `(skewness_level, num_splits, prob
//!   bucket)`;
//! - beyond that: a Cornish-Fisher expansion around the normal
//!   approximation, cheap enough for the split hot path's rare slow branch.
//!
//! Both paths accept the previously computed bound and never return less
//! than it, so the cached bound in the split stats only ever tightens.

use std::sync::LazyLock;

use crate::stat_kernel::{normal_quantile, Binomial};

/// Probability that a segment split observes at least `29 + level` keys
/// hashed to one half of the segment's hash table, out of the 48 keys a
/// full segment holds: `2 * (1 - CDF[Binomial(48, 0.5), 28 + level])`.
pub(crate) const SKEWED_SPLIT_PROBS: [f64; 4] = [
    0.193_412_652_861_937_317_538_8,
    0.111_402_891_061_018_749_496_7,
    0.059_463_375_253_770_323_070_06,
    0.029_304_946_720_529_301_273_92,
];

/// Largest `num_splits` served by the precomputed table.
pub(crate) const MAX_SPLITS_WITH_PRECOMPUTED: u32 = 96;

/// Reporting probabilities are quantized to a quarter-decade grid:
/// bucket `b` stands for `10^-((b + 1) / 4)`, from ~0.56 down to 1e-10.
const PROB_BUCKETS: usize = 40;

const TABLE_LEN: usize = SKEWED_SPLIT_PROBS.len() * MAX_SPLITS_WITH_PRECOMPUTED as usize * PROB_BUCKETS;

fn bucket_prob(bucket: usize) -> f64 {
    10f64.powf(-((bucket + 1) as f64) / 4.0)
}

/// Conservative bucket for `min_reporting_prob`: the largest grid
/// probability that does not exceed it. Quantizing downwards can only raise
/// the returned bound, never lower it below the exact value.
fn bucket_index(min_reporting_prob: f64) -> Option<usize> {
    if min_reporting_prob < bucket_prob(PROB_BUCKETS - 1) {
        return None; // below the grid; caller falls back to the exact kernel
    }
    let exact = -4.0 * min_reporting_prob.log10() - 1.0;
    let mut bucket = exact.ceil().max(0.0) as usize;
    // Guard against rounding on the bucket boundary.
    if bucket_prob(bucket) > min_reporting_prob {
        bucket += 1;
    }
    if bucket < PROB_BUCKETS {
        Some(bucket)
    } else {
        None
    }
}

static MAX_NON_REPORTED_TABLE: LazyLock<Box<[u8]>> = LazyLock::new(|| {
    let mut table = vec![0u8; TABLE_LEN];
    for (level, &p) in SKEWED_SPLIT_PROBS.iter().enumerate() {
        for num_splits in 1..=MAX_SPLITS_WITH_PRECOMPUTED {
            let dist = Binomial::new(num_splits, p);
            // As the bucket probability decreases the threshold only grows,
            // so each bucket's scan resumes from the previous one's value.
            let mut k = 0u32;
            for bucket in 0..PROB_BUCKETS {
                let q = 1.0 - bucket_prob(bucket);
                while dist.cdf(k as i64) < q {
                    k += 1;
                }
                table[table_index(level, num_splits, bucket)] = k as u8;
            }
        }
    }
    table.into_boxed_slice()
});

fn table_index(level: usize, num_splits: u32, bucket: usize) -> usize {
    (level * MAX_SPLITS_WITH_PRECOMPUTED as usize + (num_splits as usize - 1)) * PROB_BUCKETS
        + bucket
}

/// Max non-reported skewed-split count for `num_splits <=
/// MAX_SPLITS_WITH_PRECOMPUTED`, at least `prev_bound`.
pub(crate) fn precomputed_max_non_reported(
    skewness_level: usize,
    num_splits: u32,
    min_reporting_prob: f64,
    prev_bound: u32,
) -> u32 {
    debug_assert!(num_splits >= 1 && num_splits <= MAX_SPLITS_WITH_PRECOMPUTED);
    let from_table = match bucket_index(min_reporting_prob) {
        Some(bucket) => {
            MAX_NON_REPORTED_TABLE[table_index(skewness_level, num_splits, bucket)] as u32
        }
        None => Binomial::new(num_splits, SKEWED_SPLIT_PROBS[skewness_level])
            .inverse_cdf(1.0 - min_reporting_prob),
    };
    from_table.max(prev_bound)
}

/// Max non-reported skewed-split count for `num_splits >
/// MAX_SPLITS_WITH_PRECOMPUTED`, via a second-order Cornish-Fisher
/// expansion. Accurate to within a couple of counts, erring high so that
/// the monitor never reports early.
pub(crate) fn approximated_max_non_reported(
    skewness_level: usize,
    num_splits: u32,
    min_reporting_prob: f64,
) -> u32 {
    let p = SKEWED_SPLIT_PROBS[skewness_level];
    let n = num_splits as f64;
    let mean = n * p;
    let sd = (n * p * (1.0 - p)).sqrt();
    let z = normal_quantile(1.0 - min_reporting_prob);
    let skew = (1.0 - 2.0 * p) / sd;
    let w = z + skew * (z * z - 1.0) / 6.0;
    // +1 absorbs the residual error of the expansion on the high side.
    let k = (mean + sd * w).ceil() + 1.0;
    (k.max(0.0) as u32).min(num_splits)
}
