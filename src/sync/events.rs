//! Event system for the snapshot sync.
//!
//! This module defines the events the orchestrator emits while it works through a segment, the
//! handler trait that consumes them, and the dispatcher that fans each event out to every
//! registered handler. The background runner registers a handler that forwards events to the
//! front end; tests register handlers that record what they see.

use crate::sync::types::{ProfileOutcome, ProgressUpdate, SyncError, SyncResult};

/// Events that occur during a sync run
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The run started
    RunStarted { segment_id: String, dry_run: bool },
    /// A profile was fully processed
    ProfileProcessed {
        outcome: ProfileOutcome,
        progress: ProgressUpdate,
    },
    /// The run ended, normally or through cancellation
    RunCompleted { result: SyncResult },
    /// The run was aborted by an unrecoverable error
    RunFailed { error: String },
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &SyncEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}
