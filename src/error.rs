//! Errors surfaced by the hash-code distribution monitor.
//!
//! All of these indicate unrecoverable bugs (either inside the crate or in
//! the way the host drives the monitor); the map aborts the enclosing
//! operation when one is returned.

use thiserror::Error;

/// Failure modes of [`crate::distribution::HashCodeDistribution`].
#[derive(Debug, Error)]
pub enum DistributionError {
    /// The cached average segment order changed by a delta that cannot be
    /// produced by any legal sequence of map mutations.
    #[error(
        "unexpected change of average segment order: previously computed = {prev}, \
         newly computed = {new}"
    )]
    IllegalAverageOrderChange { prev: u8, new: u8 },

    /// An internal sanity check failed while recomputing the inflated-segment
    /// size threshold.
    #[error(
        "inflated segment threshold sanity check failed: min_reporting_prob = \
         {min_reporting_prob}; map_size = {map_size}; segment_size = {segment_size}; \
         segment_order = {segment_order}"
    )]
    Sanity {
        min_reporting_prob: f64,
        map_size: u64,
        segment_size: u64,
        segment_order: u8,
    },

    /// A segment split was observed from an order that cannot exist unless
    /// the map is being modified concurrently.
    #[error(
        "prior segment order: {prior_order}, last computed average segment order: \
         {average_order}. This cannot be an ordinary segment split without concurrent \
         modification of the map going on"
    )]
    ConcurrentModification { prior_order: u8, average_order: u8 },
}
