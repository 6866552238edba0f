//! Poor hash-code distribution occasions delivered to the user callback.

use std::cell::Cell;

use crate::segment::InflatedSegment;

/// What kind of statistically implausible event was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccasionKind {
    /// An inflated segment grew larger than any segment plausibly would
    /// under a well-distributed hash function.
    TooLargeInflatedSegment,
    /// More skewed segment splits were observed than plausible.
    TooManySkewedSegmentSplits,
    /// Reserved; never emitted.
    TooManyInflatedSegments,
}

/// Ordered key-value debug details, assembled lazily.
pub type DebugInfo = Vec<(&'static str, String)>;

/// The reporting callback: the single dynamic-dispatch boundary of the
/// monitor.
pub type ReportingAction<K, V> = Box<dyn FnMut(&PoorHashCodeDistributionOccasion<'_, K, V>)>;

/// A single reported occasion.
///
/// The occasion borrows the map's state for the duration of the callback:
/// the inflated segment reference (if any) stays valid until the callback
/// returns. The callback must not re-enter the map; for inflated-segment
/// occasions it may decide to remove the excluded key after the enclosing
/// operation completes, and should declare that decision with
/// [`set_removed_some_element`](Self::set_removed_some_element) so the
/// monitor keeps reporting (otherwise further reports about the same,
/// unchanged map would be noise and are suppressed).
pub struct PoorHashCodeDistributionOccasion<'a, K, V> {
    kind: OccasionKind,
    map_size: u64,
    average_segment_order: u8,
    message: String,
    debug_info: &'a dyn Fn() -> DebugInfo,
    segment: Option<&'a InflatedSegment<K, V>>,
    excluded_key: Option<&'a K>,
    removed_some_element: Cell<bool>,
}

impl<'a, K, V> PoorHashCodeDistributionOccasion<'a, K, V> {
    pub(crate) fn new(
        kind: OccasionKind,
        map_size: u64,
        average_segment_order: u8,
        message: String,
        debug_info: &'a dyn Fn() -> DebugInfo,
        segment: Option<&'a InflatedSegment<K, V>>,
        excluded_key: Option<&'a K>,
    ) -> Self {
        Self {
            kind,
            map_size,
            average_segment_order,
            message,
            debug_info,
            segment,
            excluded_key,
            removed_some_element: Cell::new(false),
        }
    }

    pub fn kind(&self) -> OccasionKind {
        self.kind
    }

    /// Size of the map at the moment of the occasion.
    pub fn map_size(&self) -> u64 {
        self.map_size
    }

    /// The map's average segment order at the moment of the occasion.
    pub fn average_segment_order(&self) -> u8 {
        self.average_segment_order
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Assemble the debug details. Deliberately not cached: call at most
    /// once, and only off the insertion path if the values are kept.
    pub fn debug_info(&self) -> DebugInfo {
        (self.debug_info)()
    }

    /// The offending inflated segment, for
    /// [`TooLargeInflatedSegment`](OccasionKind::TooLargeInflatedSegment)
    /// occasions.
    pub fn segment(&self) -> Option<&InflatedSegment<K, V>> {
        self.segment
    }

    /// The key whose insertion triggered the occasion, for
    /// [`TooLargeInflatedSegment`](OccasionKind::TooLargeInflatedSegment)
    /// occasions.
    pub fn excluded_key(&self) -> Option<&K> {
        self.excluded_key
    }

    /// Declare that the callback removed (or will remove) some offending
    /// element, re-arming future reports of this kind.
    pub fn set_removed_some_element(&self, removed: bool) {
        self.removed_some_element.set(removed);
    }

    pub fn removed_some_element(&self) -> bool {
        self.removed_some_element.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_info_is_lazy() {
        let evaluated = Cell::new(0);
        let supplier = || {
            evaluated.set(evaluated.get() + 1);
            vec![("key", "value".to_string())]
        };
        let occasion: PoorHashCodeDistributionOccasion<'_, u64, u64> =
            PoorHashCodeDistributionOccasion::new(
                OccasionKind::TooManySkewedSegmentSplits,
                100,
                3,
                "message".to_string(),
                &supplier,
                None,
                None,
            );
        assert_eq!(evaluated.get(), 0);
        let info = occasion.debug_info();
        assert_eq!(evaluated.get(), 1);
        assert_eq!(info[0].0, "key");
    }

    #[test]
    fn removed_some_element_defaults_to_false() {
        let supplier = || DebugInfo::new();
        let occasion: PoorHashCodeDistributionOccasion<'_, u64, u64> =
            PoorHashCodeDistributionOccasion::new(
                OccasionKind::TooLargeInflatedSegment,
                100,
                3,
                "message".to_string(),
                &supplier,
                None,
                None,
            );
        assert!(!occasion.removed_some_element());
        occasion.set_removed_some_element(true);
        assert!(occasion.removed_some_element());
    }
}
