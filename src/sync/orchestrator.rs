//! Sync orchestrator and integration point for all sync services.
//!
//! This module defines the `SyncOrchestrator`, which walks the profiles of a segment one at a
//! time and, for each, finds the latest checkout event, extracts the snapshot, decides whether
//! the stored snapshot needs replacing, and applies the change through the selected
//! `SnapshotWriter` (the API, or a preview in dry-run mode).
//!
//! The orchestrator is responsible for:
//! - Wiring the extractor, change detection and writer from the run's configuration
//! - Turning per-profile API failures into outcomes so the run carries on
//! - Aborting with the partial result on authentication failures and segment paging errors
//! - Checking for cancellation between profiles
//! - Dispatching a progress event after every profile

use crate::klaviyo::{EventNameFilter, KlaviyoError, Profile, ProfileApi};
use crate::settings::{ConfigError, SyncConfig};
use crate::sync::{
    events::{EventDispatcher, SyncEvent, SyncEventHandler},
    progress_tracker::SyncProgressTracker,
    selection::select_latest,
    snapshot::SnapshotExtractor,
    strategies::{ApiSnapshotWriter, DryRunSnapshotWriter, SnapshotWriter},
    types::{OutcomeKind, ProfileOutcome, SyncFailure, SyncResult},
};

use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Main sync orchestrator that coordinates all sync components.
pub struct SyncOrchestrator {
    api: Arc<dyn ProfileApi>,
    config: SyncConfig,
    extractor: SnapshotExtractor,
    writer: Box<dyn SnapshotWriter>,
    dispatcher: EventDispatcher,
}

impl SyncOrchestrator {
    /// Profiles processed between two courtesy pauses.
    pub const COURTESY_PAUSE_EVERY: usize = 50;

    /// Create a new orchestrator for a validated configuration.
    ///
    /// Dry-run configurations get a writer that never calls the API.
    pub fn new(api: Arc<dyn ProfileApi>, config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let extractor = SnapshotExtractor::new(
            config.placeholder_image_url.clone(),
            config.default_currency.clone(),
        );
        let writer: Box<dyn SnapshotWriter> = if config.dry_run {
            Box::new(DryRunSnapshotWriter)
        } else {
            Box::new(ApiSnapshotWriter::new(api.clone(), config.property_key.clone()))
        };

        Ok(Self {
            api,
            config,
            extractor,
            writer,
            dispatcher: EventDispatcher::new(),
        })
    }

    /// Register an event handler.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.dispatcher.register_handler(handler);
    }

    /// Run the sync over the configured segment.
    ///
    /// `cancel` is checked before each profile; a raised flag ends the run with the profiles
    /// completed so far, flagged `cancelled`.
    pub async fn run(&mut self, cancel: &watch::Receiver<bool>) -> Result<SyncResult, SyncFailure> {
        let api = Arc::clone(&self.api);
        let segment_id = self.config.segment_id.clone();
        let filter = self.config.event_filter();
        let mut tracker = SyncProgressTracker::new(self.config.dry_run);

        info!(
            "Starting snapshot sync for segment {} using {} (events: {:?})",
            segment_id,
            self.writer.name(),
            filter.names()
        );
        self.dispatcher
            .dispatch(&SyncEvent::RunStarted {
                segment_id: segment_id.clone(),
                dry_run: self.config.dry_run,
            })
            .await;

        let mut profiles = api.list_segment_profiles(&segment_id);

        loop {
            if *cancel.borrow() {
                info!(
                    "Sync cancelled after {} profiles",
                    tracker.profiles_scanned()
                );
                tracker.mark_cancelled();
                break;
            }

            if let Some(limit) = self.config.profile_limit {
                if tracker.profiles_scanned() >= limit {
                    info!("Reached profile limit of {}", limit);
                    break;
                }
            }

            let profile = match profiles.next().await {
                None => break,
                Some(Ok(profile)) => profile,
                Some(Err(e)) => {
                    error!("Failed to list profiles of segment {}: {}", segment_id, e);
                    return Err(self.fail(e, tracker).await);
                }
            };

            if !tracker.first_visit(&profile.id) {
                debug!("Skipping duplicate profile {}", profile.id);
                continue;
            }

            let kind = match self.process_profile(&profile, &filter).await {
                Ok(kind) => kind,
                Err(e) if e.is_fatal() => {
                    error!("Aborting sync at profile {}: {}", profile.id, e);
                    return Err(self.fail(e, tracker).await);
                }
                Err(e) => {
                    error!(
                        "Profile {} failed during {}: {}",
                        profile.id,
                        e.operation(),
                        e
                    );
                    OutcomeKind::Failed { error: e }
                }
            };

            let outcome = ProfileOutcome {
                profile_id: profile.id.clone(),
                email: profile.display_email().to_string(),
                kind,
            };
            let message = outcome.to_string();
            tracker.record(outcome.clone());

            self.dispatcher
                .dispatch(&SyncEvent::ProfileProcessed {
                    outcome,
                    progress: tracker.progress(message),
                })
                .await;
            tracker.log_progress(false);

            let scanned = tracker.profiles_scanned();
            if scanned % Self::COURTESY_PAUSE_EVERY == 0 && self.config.courtesy_delay_ms > 0 {
                debug!("Processed {} profiles, pausing", scanned);
                tokio::time::sleep(self.config.courtesy_delay()).await;
            }
        }

        tracker.log_progress(true);
        let result = tracker.into_result();
        info!("Snapshot sync finished: {}", result.summary());

        self.dispatcher
            .dispatch(&SyncEvent::RunCompleted {
                result: result.clone(),
            })
            .await;

        Ok(result)
    }

    /// Process a single profile.
    ///
    /// Only API errors are returned; a missing event or unusable payload is an outcome.
    async fn process_profile(
        &self,
        profile: &Profile,
        filter: &EventNameFilter,
    ) -> Result<OutcomeKind, KlaviyoError> {
        // Unfiltered, so an older event of any metric ends the scan.
        let events = self.api.list_profile_events(&profile.id, None);
        let Some(event) = select_latest(events, filter).await? else {
            debug!("No matching event for profile {}", profile.id);
            return Ok(OutcomeKind::NoEvent);
        };

        let snapshot = match self.extractor.extract(&event) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Event {} of profile {} has no usable snapshot: {}",
                    event.id, profile.id, e
                );
                return Ok(OutcomeKind::NoSnapshot {
                    reason: e.to_string(),
                });
            }
        };

        let existing = profile.properties.get(&self.config.property_key);
        if !self
            .config
            .change_detection
            .requires_update(existing, &snapshot)
        {
            debug!("Snapshot of profile {} is unchanged", profile.id);
            return Ok(OutcomeKind::Unchanged);
        }

        self.writer.write(profile, &snapshot).await
    }

    async fn fail(&mut self, error: KlaviyoError, mut tracker: SyncProgressTracker) -> SyncFailure {
        tracker.log_progress(true);
        self.dispatcher
            .dispatch(&SyncEvent::RunFailed {
                error: error.to_string(),
            })
            .await;

        SyncFailure {
            error,
            partial: tracker.into_result(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::strategies::ChangeDetection;
    use crate::sync::testing::{FakeProfileApi, auth_error, checkout_event, other_event, profile};
    use serde_json::json;

    fn config() -> SyncConfig {
        SyncConfig {
            segment_id: "SEG".to_string(),
            courtesy_delay_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn idle() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    async fn run(api: Arc<FakeProfileApi>, config: SyncConfig) -> Result<SyncResult, SyncFailure> {
        let mut orchestrator = SyncOrchestrator::new(api, config).expect("valid config");
        orchestrator.run(&idle()).await
    }

    fn stored_snapshot(api: &FakeProfileApi, profile_id: &str) -> serde_json::Value {
        api.updates()
            .into_iter()
            .find(|(id, _)| id == profile_id)
            .and_then(|(_, props)| props.get("last_checkout_snapshot").cloned())
            .expect("profile updated")
    }

    #[tokio::test]
    async fn profiles_without_events_are_skipped_without_updates() {
        let api = Arc::new(FakeProfileApi::new(vec![profile("P1"), profile("P2")]));

        let result = run(api.clone(), config()).await.expect("run completes");

        assert_eq!(result.profiles_scanned, 2);
        assert_eq!(result.skipped, 2);
        assert!(api.updates().is_empty());
        assert!(
            result
                .outcomes
                .iter()
                .all(|o| o.kind == OutcomeKind::NoEvent)
        );
    }

    #[tokio::test]
    async fn latest_event_is_written() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1")]).with_events(
                "P1",
                vec![
                    checkout_event("E2", 200, "Newer"),
                    checkout_event("E1", 100, "Older"),
                ],
            ),
        );

        let result = run(api.clone(), config()).await.expect("run completes");

        assert_eq!(result.updated, 1);
        assert_eq!(result.matched, 1);
        assert_eq!(stored_snapshot(&api, "P1")["items"][0]["title"], json!("Newer"));
    }

    #[tokio::test]
    async fn events_of_other_metrics_are_ignored() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P2")])
                .with_events(
                    "P1",
                    vec![other_event("V2", 300), checkout_event("E1", 200, "Mug")],
                )
                .with_events("P2", vec![other_event("V1", 100)]),
        );

        let result = run(api.clone(), config()).await.expect("run completes");

        assert_eq!(result.updated, 1);
        assert_eq!(result.outcomes[1].kind, OutcomeKind::NoEvent);
        assert_eq!(stored_snapshot(&api, "P1")["items"][0]["title"], json!("Mug"));
    }

    #[tokio::test]
    async fn dry_run_never_updates() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P2")])
                .with_events("P1", vec![checkout_event("E1", 100, "Mug")])
                .with_events("P2", vec![checkout_event("E2", 100, "Tea")]),
        );
        let config = SyncConfig {
            dry_run: true,
            ..config()
        };

        let result = run(api.clone(), config).await.expect("run completes");

        assert!(api.updates().is_empty());
        assert!(result.dry_run);
        assert_eq!(result.updated, 0);
        assert_eq!(result.would_update, 2);
        match &result.outcomes[0].kind {
            OutcomeKind::WouldUpdate { summary } => assert!(summary.contains("1. Mug | Qty: 1")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn unchanged_snapshot_is_not_rewritten() {
        let first = Arc::new(
            FakeProfileApi::new(vec![profile("P1")])
                .with_events("P1", vec![checkout_event("E1", 100, "Mug")]),
        );
        run(first.clone(), config()).await.expect("first run");
        let stored = stored_snapshot(&first, "P1");

        let mut synced = profile("P1");
        synced
            .properties
            .insert("last_checkout_snapshot".to_string(), stored);
        let second = Arc::new(
            FakeProfileApi::new(vec![synced])
                .with_events("P1", vec![checkout_event("E1", 100, "Mug")]),
        );

        let result = run(second.clone(), config()).await.expect("second run");
        assert_eq!(result.outcomes[0].kind, OutcomeKind::Unchanged);
        assert_eq!(result.skipped, 1);
        assert!(second.updates().is_empty());

        let always = SyncConfig {
            change_detection: ChangeDetection::Always,
            ..config()
        };
        let result = run(second.clone(), always).await.expect("third run");
        assert_eq!(result.updated, 1);
        assert_eq!(second.updates().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_no_snapshot_and_run_continues() {
        let mut broken = checkout_event("E1", 100, "Mug");
        broken.payload = json!("not an object");
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P2")])
                .with_events("P1", vec![broken])
                .with_events("P2", vec![checkout_event("E2", 100, "Tea")]),
        );

        let result = run(api.clone(), config()).await.expect("run completes");

        assert!(matches!(
            result.outcomes[0].kind,
            OutcomeKind::NoSnapshot { .. }
        ));
        assert_eq!(result.updated, 1);
        assert_eq!(result.errored, 0);
    }

    #[tokio::test]
    async fn per_profile_errors_are_counted_and_run_continues() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P2"), profile("P3")])
                .with_event_error(
                    "P1",
                    KlaviyoError::Transient {
                        operation: "list_profile_events",
                        attempts: 6,
                        detail: "HTTP 503".to_string(),
                    },
                )
                .with_events("P2", vec![checkout_event("E2", 100, "Tea")])
                .with_update_error(
                    "P2",
                    KlaviyoError::Validation {
                        operation: "update_profile",
                        status: 400,
                        detail: "bad property".to_string(),
                    },
                )
                .with_events("P3", vec![checkout_event("E3", 100, "Mug")]),
        );

        let result = run(api.clone(), config()).await.expect("run completes");

        assert_eq!(result.profiles_scanned, 3);
        assert_eq!(result.errored, 2);
        assert_eq!(result.updated, 1);
        assert_eq!(api.updates()[0].0, "P3");
    }

    #[tokio::test]
    async fn auth_failure_aborts_with_partial_result() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P2"), profile("P3")])
                .with_events("P1", vec![checkout_event("E1", 100, "Mug")])
                .with_events("P2", vec![checkout_event("E2", 100, "Tea")])
                .with_update_error("P2", auth_error("update_profile")),
        );

        let failure = run(api.clone(), config()).await.expect_err("run aborts");

        assert!(matches!(failure.error, KlaviyoError::Auth { .. }));
        assert_eq!(failure.partial.profiles_scanned, 1);
        assert_eq!(failure.partial.updated, 1);
        assert_eq!(api.event_requests(), vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn segment_paging_error_fails_the_run() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1")]).with_segment_error(KlaviyoError::Transient {
                operation: "list_segment_profiles",
                attempts: 6,
                detail: "HTTP 502".to_string(),
            }),
        );

        let failure = run(api, config()).await.expect_err("run fails");

        assert_eq!(failure.error.operation(), "list_segment_profiles");
        assert_eq!(failure.partial.profiles_scanned, 1);
    }

    #[tokio::test]
    async fn duplicate_profiles_are_processed_once() {
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P1"), profile("P2")])
                .with_events("P1", vec![checkout_event("E1", 100, "Mug")]),
        );

        let result = run(api.clone(), config()).await.expect("run completes");

        assert_eq!(result.profiles_scanned, 2);
        assert_eq!(api.updates().len(), 1);
        assert_eq!(api.event_requests(), vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn profile_limit_caps_the_run() {
        let api = Arc::new(FakeProfileApi::new(vec![
            profile("P1"),
            profile("P2"),
            profile("P3"),
        ]));
        let config = SyncConfig {
            profile_limit: Some(2),
            ..config()
        };

        let result = run(api.clone(), config).await.expect("run completes");

        assert_eq!(result.profiles_scanned, 2);
        assert!(!result.cancelled);
        assert_eq!(api.event_requests(), vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn cancellation_stops_at_the_next_profile_boundary() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let api = Arc::new(
            FakeProfileApi::new(vec![profile("P1"), profile("P2"), profile("P3")])
                .with_events("P2", vec![checkout_event("E2", 100, "Tea")])
                .cancel_when_processing("P2", cancel_tx),
        );
        let mut orchestrator = SyncOrchestrator::new(api.clone(), config()).expect("valid config");

        let result = orchestrator.run(&cancel_rx).await.expect("run completes");

        assert!(result.cancelled);
        assert_eq!(result.profiles_scanned, 2);
        assert_eq!(result.updated, 1);
        assert_eq!(api.event_requests(), vec!["P1", "P2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn courtesy_pause_every_fifty_profiles() {
        let profiles = (0..50).map(|i| profile(&format!("P{}", i))).collect();
        let api = Arc::new(FakeProfileApi::new(profiles));
        let config = SyncConfig {
            courtesy_delay_ms: 200,
            ..config()
        };

        let started = tokio::time::Instant::now();
        let result = run(api, config).await.expect("run completes");

        assert_eq!(result.profiles_scanned, 50);
        assert!(started.elapsed() >= std::time::Duration::from_millis(200));
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let api = Arc::new(FakeProfileApi::new(Vec::new()));

        assert!(matches!(
            SyncOrchestrator::new(api, SyncConfig::default()),
            Err(ConfigError::MissingSegmentId)
        ));
    }
}
