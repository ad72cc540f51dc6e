//! Reading-progress tracking for the view phase.
//!
//! A pure accumulator scoped to one request: scroll coverage and
//! elapsed viewing time only move forward, and the read gate is met
//! when either a near-full scroll or a minimum dwell time is observed.

use serde::{Deserialize, Serialize};

use crate::config::ReadGateConfig;

/// Accumulated reading progress for one request's view phase.
///
/// Both fields are monotonically non-decreasing: `observe` merges each
/// report with `max`, so out-of-order or smaller reports are silently
/// ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingSession {
    /// Deepest scroll position reported, as a percentage (0-100).
    pub max_scroll_percentage: u8,
    /// Longest elapsed viewing time reported, in seconds.
    pub elapsed_seconds: u32,
}

impl ReadingSession {
    /// Creates an empty session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one progress report into the session.
    ///
    /// Values only move forward; a report below the current maximum
    /// leaves the session unchanged. Scroll percentages above 100 are
    /// clamped.
    pub fn observe(&mut self, scroll_percentage: u8, elapsed_seconds: u32) {
        let scroll = scroll_percentage.min(100);
        self.max_scroll_percentage = self.max_scroll_percentage.max(scroll);
        self.elapsed_seconds = self.elapsed_seconds.max(elapsed_seconds);
    }

    /// Returns `true` if the subject has plausibly read the document.
    ///
    /// Met when scroll coverage reaches the configured threshold OR the
    /// elapsed time reaches the minimum dwell: either a full read or a
    /// forced dwell satisfies "had the opportunity to read".
    #[must_use]
    pub fn has_met_threshold(&self, gate: &ReadGateConfig) -> bool {
        self.max_scroll_percentage >= gate.scroll_threshold_percent
            || self.elapsed_seconds >= gate.min_dwell_seconds
    }

    /// Snapshot of the session for callers and evidence.
    #[must_use]
    pub fn state(&self, gate: &ReadGateConfig) -> ReadingState {
        ReadingState {
            max_scroll_percentage: self.max_scroll_percentage,
            elapsed_seconds: self.elapsed_seconds,
            threshold_met: self.has_met_threshold(gate),
        }
    }
}

/// Point-in-time view of reading progress, returned to callers and
/// summarized into evidence when the view phase is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingState {
    /// Deepest scroll position reported (0-100).
    pub max_scroll_percentage: u8,
    /// Longest elapsed viewing time reported, in seconds.
    pub elapsed_seconds: u32,
    /// Whether the read gate is satisfied.
    pub threshold_met: bool,
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// For all report sequences, the accumulated scroll maximum is
        /// non-decreasing and equals the largest single value reported.
        #[test]
        fn scroll_is_max_of_reports(reports in prop::collection::vec((0u8..=100, 0u32..10_000), 1..50)) {
            let mut session = ReadingSession::new();
            let mut prev_scroll = 0u8;
            for &(scroll, elapsed) in &reports {
                session.observe(scroll, elapsed);
                prop_assert!(session.max_scroll_percentage >= prev_scroll);
                prev_scroll = session.max_scroll_percentage;
            }
            let max_scroll = reports.iter().map(|&(s, _)| s).max().unwrap();
            let max_elapsed = reports.iter().map(|&(_, e)| e).max().unwrap();
            prop_assert_eq!(session.max_scroll_percentage, max_scroll);
            prop_assert_eq!(session.elapsed_seconds, max_elapsed);
        }
    }
}
