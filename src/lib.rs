//! A segmented, dynamically-resizing hash map with hash-code distribution
//! monitoring.
//!
//! [`SmoothieMap`] spreads its entries over many small fixed-capacity
//! segments under a directory indexed by the high bits of each key's hash,
//! growing one segment split at a time. On top of that it can watch how
//! well the hash function distributes keys: a map built with
//! [`Builder::report_poor_hash_code_distribution`](map::Builder::report_poor_hash_code_distribution)
//! runs on-line statistical tests against the shapes a well-distributed
//! hash function could plausibly produce, and delivers
//! [`PoorHashCodeDistributionOccasion`]s to a callback when reality falls
//! outside them:
//!
//! - an inflated segment growing beyond the Poisson-modelled size bound
//!   for the current map size;
//! - segment splits repeatedly leaving most keys in one half of a
//!   segment's hash table, beyond the Binomial-modelled split-skew bound.
//!
//! The monitoring is advisory and amortized: hot paths check cached
//! thresholds, and the statistical kernels only run on rare slow paths.
//!
//! ```
//! use smoothiemap::SmoothieMap;
//!
//! let mut map = SmoothieMap::builder()
//!     .report_poor_hash_code_distribution(1e-9, |occasion| {
//!         eprintln!("{}", occasion.message());
//!     })
//!     .build();
//! map.insert("key", 42);
//! assert_eq!(map.get("key"), Some(&42));
//! ```

mod binomial_bounds;
mod directory;
mod group;
mod stat_kernel;

pub mod distribution;
pub mod error;
pub mod map;
pub mod report;
pub mod segment;
pub mod stats;

pub use directory::MAX_SEGMENTS_ARRAY_ORDER;
pub use error::DistributionError;
pub use map::{Builder, SmoothieMap};
pub use report::{OccasionKind, PoorHashCodeDistributionOccasion};
pub use stats::{MapStats, SegmentStats};
