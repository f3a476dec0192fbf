//! Checkout Snapshot Synchronization Module
//!
//! This module provides the workflow that copies the latest checkout of every profile in a
//! segment onto the profile itself. It is composed of several submodules:
//!
//! - `orchestrator`: Walks the segment and processes one profile at a time.
//! - `runner`: Runs the orchestrator on a background task with cancellation and a message channel.
//! - `events`: Event types and handler traits used to report progress.
//! - `progress_tracker`: Accumulates counters and outcomes and logs progress.
//! - `selection`: Picks the latest matching event of a profile.
//! - `snapshot`: Extracts checkout snapshots from event payloads.
//! - `strategies`: Change detection and the writers that apply or preview a snapshot.

/// Event system for decoupled progress reporting
pub mod events;
/// Main coordinator for the sync workflow
pub mod orchestrator;
/// Tracks counters and outcomes of a run
pub mod progress_tracker;
/// Background execution with cancellation
pub mod runner;
/// Latest-event selection
pub mod selection;
/// Checkout snapshot extraction
pub mod snapshot;
/// Change detection and snapshot writers
pub mod strategies;
/// Results, outcomes and errors
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::SyncOrchestrator;
pub use runner::{RunOutcome, RunnerMessage, RunnerState, SyncRunner};
pub use snapshot::{CheckoutSnapshot, ExtractError, LineItem, SnapshotExtractor};
pub use strategies::ChangeDetection;
pub use types::*;
