//! Background runner for the snapshot sync.
//!
//! `SyncRunner` runs a `SyncOrchestrator` on its own tokio task so the front end stays
//! responsive. The worker reports back over an unbounded channel of `RunnerMessage`s and listens
//! for cancellation on a watch channel; nothing else is shared between the two sides.
//!
//! The runner's state advances as the front end drains messages: a run stays `Running` until
//! its `Finished` message has been received.

use crate::klaviyo::ProfileApi;
use crate::settings::SyncConfig;
use crate::sync::{
    events::{SyncEvent, SyncEventHandler},
    orchestrator::SyncOrchestrator,
    types::{OutcomeKind, ProgressUpdate, SyncError, SyncResult},
};

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle of the runner
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed(SyncError),
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerState::Completed | RunnerState::Cancelled | RunnerState::Failed(_)
        )
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(SyncResult),
    Cancelled(SyncResult),
    /// `partial` is absent when the worker died without reporting.
    Failed {
        error: SyncError,
        partial: Option<SyncResult>,
    },
}

/// Messages from the worker to the front end
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerMessage {
    Progress(ProgressUpdate),
    Log(String),
    Finished(RunOutcome),
}

/// Executes sync runs on a background task.
pub struct SyncRunner {
    state: RunnerState,
    cancel: Option<watch::Sender<bool>>,
    messages: Option<mpsc::UnboundedReceiver<RunnerMessage>>,
    task: Option<JoinHandle<()>>,
}

impl SyncRunner {
    pub fn new() -> Self {
        Self {
            state: RunnerState::Idle,
            cancel: None,
            messages: None,
            task: None,
        }
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    /// Start a run on a new worker task.
    ///
    /// Fails with `AlreadyRunning` while a run is in progress. A finished run is reset
    /// implicitly.
    pub fn start(&mut self, api: Arc<dyn ProfileApi>, config: SyncConfig) -> Result<(), SyncError> {
        if self.state == RunnerState::Running {
            return Err(SyncError::AlreadyRunning);
        }

        let mut orchestrator = SyncOrchestrator::new(api, config)?;
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        orchestrator.register_handler(Box::new(ChannelEventHandler {
            sender: message_tx.clone(),
        }));

        let task = tokio::spawn(async move {
            let outcome = match orchestrator.run(&cancel_rx).await {
                Ok(result) if result.cancelled => RunOutcome::Cancelled(result),
                Ok(result) => RunOutcome::Completed(result),
                Err(failure) => RunOutcome::Failed {
                    error: SyncError::Api(failure.error),
                    partial: Some(failure.partial),
                },
            };

            if message_tx.send(RunnerMessage::Finished(outcome)).is_err() {
                warn!("Sync finished but nobody is listening");
            }
        });

        if let Some(previous) = self.task.replace(task) {
            previous.abort();
        }
        self.cancel = Some(cancel_tx);
        self.messages = Some(message_rx);
        self.state = RunnerState::Running;

        info!("Sync run started");
        Ok(())
    }

    /// Ask the running worker to stop at the next profile boundary.
    pub fn cancel(&self) -> Result<(), SyncError> {
        match (&self.state, &self.cancel) {
            (RunnerState::Running, Some(cancel)) => {
                cancel.send_replace(true);
                info!("Cancellation requested");
                Ok(())
            }
            _ => Err(SyncError::NotRunning),
        }
    }

    /// Return to `Idle` after a finished run.
    pub fn reset(&mut self) -> Result<(), SyncError> {
        if self.state == RunnerState::Running {
            return Err(SyncError::AlreadyRunning);
        }
        self.state = RunnerState::Idle;
        Ok(())
    }

    /// Wait for the next message of the current run.
    ///
    /// Returns `None` when no run is active.
    pub async fn next_message(&mut self) -> Option<RunnerMessage> {
        let received = self.messages.as_mut()?.recv().await;
        Some(self.observe(received))
    }

    /// Take the next message if one is ready, without waiting.
    pub fn try_next_message(&mut self) -> Option<RunnerMessage> {
        let received = match self.messages.as_mut()?.try_recv() {
            Ok(message) => Some(message),
            Err(mpsc::error::TryRecvError::Empty) => return None,
            Err(mpsc::error::TryRecvError::Disconnected) => None,
        };
        Some(self.observe(received))
    }

    /// Drain messages until the current run finishes.
    pub async fn wait(&mut self) -> Result<RunOutcome, SyncError> {
        while let Some(message) = self.next_message().await {
            if let RunnerMessage::Finished(outcome) = message {
                return Ok(outcome);
            }
        }
        Err(SyncError::NotRunning)
    }

    /// Apply a received message (or a closed channel) to the state machine.
    fn observe(&mut self, received: Option<RunnerMessage>) -> RunnerMessage {
        let message = received.unwrap_or_else(|| {
            warn!("Sync worker stopped without reporting an outcome");
            RunnerMessage::Finished(RunOutcome::Failed {
                error: SyncError::WorkerTerminated,
                partial: None,
            })
        });

        if let RunnerMessage::Finished(outcome) = &message {
            self.state = match outcome {
                RunOutcome::Completed(_) => RunnerState::Completed,
                RunOutcome::Cancelled(_) => RunnerState::Cancelled,
                RunOutcome::Failed { error, .. } => RunnerState::Failed(error.clone()),
            };
            self.messages = None;
            self.cancel = None;
            self.task = None;
        }

        message
    }
}

impl Default for SyncRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncRunner {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Forwards sync events to the runner's message channel.
struct ChannelEventHandler {
    sender: mpsc::UnboundedSender<RunnerMessage>,
}

impl ChannelEventHandler {
    fn send(&self, message: RunnerMessage) -> Result<(), SyncError> {
        self.sender
            .send(message)
            .map_err(|_| SyncError::Dispatch("runner message channel closed".to_string()))
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for ChannelEventHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::RunStarted {
                segment_id,
                dry_run,
            } => self.send(RunnerMessage::Log(format!(
                "Syncing segment {}{}",
                segment_id,
                if *dry_run { " (dry run)" } else { "" }
            ))),
            SyncEvent::ProfileProcessed { outcome, progress } => {
                match &outcome.kind {
                    OutcomeKind::WouldUpdate { summary } => {
                        self.send(RunnerMessage::Log(summary.clone()))?
                    }
                    OutcomeKind::Failed { .. } => {
                        self.send(RunnerMessage::Log(outcome.to_string()))?
                    }
                    _ => {}
                }
                self.send(RunnerMessage::Progress(progress.clone()))
            }
            SyncEvent::RunCompleted { result } => {
                self.send(RunnerMessage::Log(format!("Finished: {}", result.summary())))
            }
            SyncEvent::RunFailed { error } => {
                self.send(RunnerMessage::Log(format!("Sync failed: {}", error)))
            }
        }
    }

    fn name(&self) -> &'static str {
        "ChannelEventHandler"
    }
}
