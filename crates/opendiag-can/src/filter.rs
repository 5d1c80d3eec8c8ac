//! CAN receive filters
//!
//! Filters are evaluated in insertion order; the first filter whose
//! pattern/mask matches a frame decides its fate. An empty set accepts
//! everything, as does a frame no filter matches (listen-all default).

use serde::{Deserialize, Serialize};

use crate::frame::{CanFrame, CanId};

/// What to do with a frame matched by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Accept,
    Drop,
}

/// Handle returned by [`crate::CanProtocol::install_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(pub(crate) u64);

/// A (pattern, mask, kind, action) receive filter.
///
/// A frame `f` matches when it is the same identifier kind and
/// `f.id & mask == pattern & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFilter {
    pub pattern: CanId,
    pub mask: u32,
    pub action: FilterAction,
}

impl CanFilter {
    /// Accept frames matching `pattern` under `mask`.
    pub fn accept(pattern: CanId, mask: u32) -> Self {
        Self {
            pattern,
            mask,
            action: FilterAction::Accept,
        }
    }

    /// Drop frames matching `pattern` under `mask`.
    pub fn drop(pattern: CanId, mask: u32) -> Self {
        Self {
            pattern,
            mask,
            action: FilterAction::Drop,
        }
    }

    /// Whether this filter applies to the frame at all.
    pub fn matches(&self, frame: &CanFrame) -> bool {
        self.pattern.same_kind(&frame.id) && (frame.id.raw() & self.mask) == (self.pattern.raw() & self.mask)
    }
}

/// An ordered filter set with first-match-wins semantics.
#[derive(Debug, Default)]
pub struct FilterSet {
    entries: Vec<(FilterId, CanFilter)>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: FilterId, filter: CanFilter) {
        self.entries.push((id, filter));
    }

    pub fn remove(&mut self, id: FilterId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(fid, _)| *fid != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate the set against a frame. Returns `true` when the frame
    /// should be delivered.
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        for (_, filter) in &self.entries {
            if filter.matches(frame) {
                return filter.action == FilterAction::Accept;
            }
        }
        // No-match default: accept (listen-all).
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CanFrame;

    fn frame(id: u16) -> CanFrame {
        CanFrame::new(CanId::standard(id).unwrap(), vec![0x00]).unwrap()
    }

    #[test]
    fn empty_set_accepts_everything() {
        let set = FilterSet::new();
        assert!(set.accepts(&frame(0x7E8)));
    }

    #[test]
    fn accept_filter_masks_id() {
        // Single accept filter: pattern 0x7E8, mask 0x7F8 covers 0x7E8..=0x7EF
        let mut set = FilterSet::new();
        set.insert(
            FilterId(1),
            CanFilter::accept(CanId::standard(0x7E8).unwrap(), 0x7F8),
        );
        assert!(set.accepts(&frame(0x7E8)));
        assert!(set.accepts(&frame(0x7EF)));
        // 0x7E0 differs in a masked bit, no filter matches, default accept
        assert!(set.accepts(&frame(0x7E0)));
    }

    #[test]
    fn drop_filter_wins_when_first() {
        let mut set = FilterSet::new();
        set.insert(
            FilterId(1),
            CanFilter::drop(CanId::standard(0x7E8).unwrap(), 0x7FF),
        );
        set.insert(
            FilterId(2),
            CanFilter::accept(CanId::standard(0x7E8).unwrap(), 0x7F8),
        );
        assert!(!set.accepts(&frame(0x7E8)));
        assert!(set.accepts(&frame(0x7E9)));
    }

    #[test]
    fn kind_mismatch_never_matches() {
        let mut set = FilterSet::new();
        set.insert(
            FilterId(1),
            CanFilter::drop(CanId::extended(0x7E8).unwrap(), 0x1FFF_FFFF),
        );
        // Standard frame with the same raw value passes the extended drop
        assert!(set.accepts(&frame(0x7E8)));
    }

    #[test]
    fn remove_restores_default() {
        let mut set = FilterSet::new();
        set.insert(
            FilterId(7),
            CanFilter::drop(CanId::standard(0x100).unwrap(), 0x7FF),
        );
        assert!(!set.accepts(&frame(0x100)));
        assert!(set.remove(FilterId(7)));
        assert!(!set.remove(FilterId(7)));
        assert!(set.accepts(&frame(0x100)));
    }
}
