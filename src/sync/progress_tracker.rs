//! Progress tracking for the snapshot sync.
//!
//! This module provides the `SyncProgressTracker`, which accumulates the `SyncResult` of a run,
//! remembers which profiles have been visited so a profile listed twice is only processed once,
//! and logs a summary line at regular intervals.

use crate::sync::types::{ProfileOutcome, ProgressUpdate, SyncResult};

use std::collections::HashSet;
use tracing::info;

/// Service for tracking synchronization progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    result: SyncResult,
    /// Profile ids already taken up in this run
    visited: HashSet<String>,
    /// Update count at which we last logged progress
    last_logged_updates: usize,
}

impl SyncProgressTracker {
    /// Updates between two progress log lines.
    pub const LOG_EVERY_UPDATES: usize = 25;

    pub fn new(dry_run: bool) -> Self {
        Self {
            result: SyncResult::new(dry_run),
            visited: HashSet::new(),
            last_logged_updates: 0,
        }
    }

    /// Mark a profile as visited; false if it was seen before in this run.
    pub fn first_visit(&mut self, profile_id: &str) -> bool {
        self.visited.insert(profile_id.to_string())
    }

    /// Record a fully processed profile
    pub fn record(&mut self, outcome: ProfileOutcome) {
        self.result.record(outcome);
    }

    pub fn mark_cancelled(&mut self) {
        self.result.cancelled = true;
    }

    pub fn profiles_scanned(&self) -> usize {
        self.result.profiles_scanned
    }

    pub fn progress(&self, message: impl Into<String>) -> ProgressUpdate {
        self.result.progress(message)
    }

    /// Log progress every `LOG_EVERY_UPDATES` updates or when forced
    pub fn log_progress(&mut self, force: bool) {
        let written = self.written();
        let should_log = force || written >= self.last_logged_updates + Self::LOG_EVERY_UPDATES;

        if should_log {
            info!("Sync progress: {}", self.result.summary());
            self.last_logged_updates = written;
        }
    }

    pub fn result(&self) -> &SyncResult {
        &self.result
    }

    pub fn into_result(self) -> SyncResult {
        self.result
    }

    /// Updates applied, or previewed in a dry run.
    fn written(&self) -> usize {
        if self.result.dry_run {
            self.result.would_update
        } else {
            self.result.updated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::OutcomeKind;

    fn outcome(id: &str, kind: OutcomeKind) -> ProfileOutcome {
        ProfileOutcome {
            profile_id: id.to_string(),
            email: "no-email".to_string(),
            kind,
        }
    }

    #[test]
    fn duplicate_profiles_are_detected() {
        let mut tracker = SyncProgressTracker::new(false);

        assert!(tracker.first_visit("P1"));
        assert!(tracker.first_visit("P2"));
        assert!(!tracker.first_visit("P1"));
    }

    #[test]
    fn logs_every_twenty_five_updates() {
        let mut tracker = SyncProgressTracker::new(false);

        for i in 0..24 {
            tracker.record(outcome(&format!("P{}", i), OutcomeKind::Updated));
            tracker.log_progress(false);
        }
        assert_eq!(tracker.last_logged_updates, 0);

        tracker.record(outcome("P24", OutcomeKind::Updated));
        tracker.log_progress(false);
        assert_eq!(tracker.last_logged_updates, 25);

        tracker.record(outcome("P25", OutcomeKind::NoEvent));
        tracker.log_progress(true);
        assert_eq!(tracker.last_logged_updates, 25);
    }

    #[test]
    fn dry_run_previews_count_as_written() {
        let mut tracker = SyncProgressTracker::new(true);
        tracker.record(outcome(
            "P1",
            OutcomeKind::WouldUpdate {
                summary: String::new(),
            },
        ));
        tracker.record(outcome("P2", OutcomeKind::Unchanged));

        assert_eq!(tracker.written(), 1);
        assert_eq!(tracker.result().updated, 0);
    }

    #[test]
    fn cancellation_is_flagged_on_the_result() {
        let mut tracker = SyncProgressTracker::new(false);
        tracker.record(outcome("P1", OutcomeKind::Updated));
        tracker.mark_cancelled();

        let result = tracker.into_result();
        assert!(result.cancelled);
        assert_eq!(result.profiles_scanned, 1);
    }
}
