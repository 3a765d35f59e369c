//! Access strategy selection.
//!
//! Every memory operation goes through exactly one of three strategies. The
//! choice depends only on the configuration, the host's fault-handling
//! capability and whether the site has been opted out of fastmem after an
//! earlier fault.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use crate::guest::LocationDescriptor;

/// Identity of one static memory access site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AccessMarker {
    pub location: LocationDescriptor,
    pub inst_offset: usize,
}

impl AccessMarker {
    pub const fn new(location: LocationDescriptor, inst_offset: usize) -> Self {
        Self {
            location,
            inst_offset,
        }
    }
}

impl fmt::Display for AccessMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.location, self.inst_offset)
    }
}

/// Sites that faulted under fastmem with the recompile policy.
///
/// Markers are only ever added; a site stays opted out for the rest of the
/// session.
#[derive(Debug, Clone, Default)]
pub struct OptOutSet {
    markers: HashSet<AccessMarker>,
}

impl OptOutSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the marker was not already present.
    pub fn insert(&mut self, marker: AccessMarker) -> bool {
        self.markers.insert(marker)
    }

    pub fn contains(&self, marker: &AccessMarker) -> bool {
        self.markers.contains(marker)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessMarker> {
        self.markers.iter()
    }
}

/// Strategy chosen for one access site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategy {
    Fastmem(AccessMarker),
    PageTable,
    Callback,
}

/// Inputs of the fastmem eligibility decision.
#[derive(Debug, Clone, Copy)]
pub struct SelectorInputs<'a> {
    pub fastmem_enabled: bool,
    pub page_table_enabled: bool,
    pub supports_fastmem: bool,
    pub opt_out: &'a OptOutSet,
}

/// `Some(marker)` if `marker` may use fastmem.
pub fn should_fastmem(inputs: &SelectorInputs<'_>, marker: AccessMarker) -> Option<AccessMarker> {
    if inputs.fastmem_enabled && inputs.supports_fastmem && !inputs.opt_out.contains(&marker) {
        Some(marker)
    } else {
        None
    }
}

/// Pick the strategy for `marker`.
pub fn select(inputs: &SelectorInputs<'_>, marker: AccessMarker) -> AccessStrategy {
    match should_fastmem(inputs, marker) {
        Some(marker) => AccessStrategy::Fastmem(marker),
        None if inputs.page_table_enabled => AccessStrategy::PageTable,
        None => AccessStrategy::Callback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const M: AccessMarker = AccessMarker::new(LocationDescriptor(0x1000), 2);

    #[rstest]
    #[case(true, true, false, true)]
    #[case(false, true, false, false)]
    #[case(true, false, false, false)]
    #[case(true, true, true, false)]
    fn test_fastmem_eligibility(
        #[case] fastmem_enabled: bool,
        #[case] supports_fastmem: bool,
        #[case] opted_out: bool,
        #[case] eligible: bool,
    ) {
        let mut opt_out = OptOutSet::new();
        if opted_out {
            opt_out.insert(M);
        }
        let inputs = SelectorInputs {
            fastmem_enabled,
            page_table_enabled: false,
            supports_fastmem,
            opt_out: &opt_out,
        };
        assert_eq!(should_fastmem(&inputs, M).is_some(), eligible);
    }

    #[test]
    fn test_opt_out_falls_back_to_page_table_then_callback() {
        let mut opt_out = OptOutSet::new();
        assert!(opt_out.insert(M));
        assert!(!opt_out.insert(M));

        let mut inputs = SelectorInputs {
            fastmem_enabled: true,
            page_table_enabled: true,
            supports_fastmem: true,
            opt_out: &opt_out,
        };
        assert_eq!(select(&inputs, M), AccessStrategy::PageTable);
        let other = AccessMarker::new(M.location, 3);
        assert_eq!(select(&inputs, other), AccessStrategy::Fastmem(other));

        inputs.page_table_enabled = false;
        assert_eq!(select(&inputs, M), AccessStrategy::Callback);
    }

    #[test]
    fn test_marker_display() {
        assert_eq!(M.to_string(), "{0000000000001000}+2");
    }
}
