//! Software receive filtering
//!
//! A frame passes a filter when `(filter.can_id ^ frame.arbitration_id) & filter.can_mask == 0`
//! and, if the filter pins it, the identifier format matches. A frame passes a
//! [`FilterSet`] when any filter accepts it; an empty or absent set accepts everything.

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Single acceptance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFilter {
    pub can_id: u32,
    pub can_mask: u32,
    /// Restrict to standard (`false`) or extended (`true`) identifiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<bool>,
}

impl CanFilter {
    pub fn new(can_id: u32, can_mask: u32) -> Self {
        Self {
            can_id,
            can_mask,
            extended: None,
        }
    }

    /// Filter that also requires the given identifier format
    pub fn with_format(can_id: u32, can_mask: u32, extended: bool) -> Self {
        Self {
            can_id,
            can_mask,
            extended: Some(extended),
        }
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        if let Some(extended) = self.extended {
            if extended != frame.is_extended() {
                return false;
            }
        }
        (self.can_id ^ frame.arbitration_id()) & self.can_mask == 0
    }
}

/// Ordered collection of acceptance filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(Vec<CanFilter>);

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: CanFilter) {
        self.0.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CanFilter> {
        self.0.iter()
    }

    /// True if any filter accepts the frame, or the set is empty
    pub fn matches(&self, frame: &Frame) -> bool {
        self.is_empty() || self.0.iter().any(|filter| filter.matches(frame))
    }
}

impl From<Vec<CanFilter>> for FilterSet {
    fn from(filters: Vec<CanFilter>) -> Self {
        Self(filters)
    }
}

impl FromIterator<CanFilter> for FilterSet {
    fn from_iter<I: IntoIterator<Item = CanFilter>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a FilterSet {
    type Item = &'a CanFilter;
    type IntoIter = std::slice::Iter<'a, CanFilter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Keep-alive frame some adapters inject: id 1, four zero bytes
pub fn is_keep_alive(frame: &Frame) -> bool {
    frame.arbitration_id() == 0x1 && frame.dlc() == 4 && frame.data() == [0, 0, 0, 0]
}

/// Software filter applied by [`Bus::recv`](crate::Bus::recv)
///
/// Without filters every frame passes. With filters configured, adapter
/// keep-alive frames are dropped before the set is consulted.
pub fn matches_filters(frame: &Frame, filters: Option<&FilterSet>) -> bool {
    match filters {
        None => true,
        Some(set) if set.is_empty() => true,
        Some(_) if is_keep_alive(frame) => false,
        Some(set) => set.matches(frame),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn frame(id: u32) -> Frame {
        Frame::new(id, &[0x11]).unwrap()
    }

    #[test]
    fn test_mask_match() {
        let filter = CanFilter::new(0x120, 0x7F0);
        assert!(filter.matches(&frame(0x120)));
        assert!(filter.matches(&frame(0x12F)));
        assert!(!filter.matches(&frame(0x130)));
    }

    #[test]
    fn test_zero_mask_accepts_all() {
        let filter = CanFilter::new(0x555, 0);
        for id in (0..=0x7FF).step_by(7) {
            assert!(filter.matches(&frame(id)));
        }
    }

    #[test]
    fn test_exact_mask_matches_single_id() {
        let filter = CanFilter::new(0x321, 0x1FFF_FFFF);
        for id in 0..=0x7FF {
            assert_eq!(filter.matches(&frame(id)), id == 0x321);
        }
    }

    #[test]
    fn test_format_pinned() {
        let filter = CanFilter::with_format(0x100, 0x7FF, true);
        assert!(!filter.matches(&frame(0x100)));
        assert!(filter.matches(&Frame::extended(0x100, &[]).unwrap()));
    }

    #[test]
    fn test_set_is_union() {
        let set: FilterSet = vec![CanFilter::new(0x100, 0x7FF), CanFilter::new(0x200, 0x7FF)]
            .into_iter()
            .collect();
        assert!(matches_filters(&frame(0x100), Some(&set)));
        assert!(matches_filters(&frame(0x200), Some(&set)));
        assert!(!matches_filters(&frame(0x300), Some(&set)));
    }

    #[test]
    fn test_no_filters_pass_everything() {
        let keep_alive = Frame::new(0x1, &[0, 0, 0, 0]).unwrap();
        assert!(matches_filters(&keep_alive, None));
        assert!(matches_filters(&keep_alive, Some(&FilterSet::new())));
        assert!(matches_filters(&frame(0x7FF), None));
    }

    #[test]
    fn test_keep_alive_dropped_when_filtered() {
        let keep_alive = Frame::new(0x1, &[0, 0, 0, 0]).unwrap();
        let accept_all = FilterSet::from(vec![CanFilter::new(0, 0)]);
        assert!(!matches_filters(&keep_alive, Some(&accept_all)));

        let not_keep_alive = Frame::new(0x1, &[0, 0, 0, 1]).unwrap();
        assert!(matches_filters(&not_keep_alive, Some(&accept_all)));
    }

    #[test]
    fn test_deserialize_from_yaml_shape() {
        let set: FilterSet = serde_json::from_str(
            r#"[{"can_id": 256, "can_mask": 2047}, {"can_id": 512, "can_mask": 2047, "extended": true}]"#,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().nth(1).unwrap().extended, Some(true));
    }
}
