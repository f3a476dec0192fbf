use crate::klaviyo::KlaviyoError;
use crate::settings::ConfigError;

use std::fmt;

/// What happened to a single profile during a run
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
	/// The snapshot was written to the profile.
	Updated,
	/// Dry run: the snapshot would have been written.
	WouldUpdate { summary: String },
	/// The stored snapshot already matches the extracted one.
	Unchanged,
	/// No event with the configured name was found.
	NoEvent,
	/// A matching event was found but carried no usable checkout data.
	NoSnapshot { reason: String },
	Failed { error: KlaviyoError },
}

/// Outcome record for one profile
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileOutcome {
	pub profile_id: String,
	pub email: String,
	pub kind: OutcomeKind,
}

impl fmt::Display for ProfileOutcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let who = format!("{} ({})", self.profile_id, self.email);
		match &self.kind {
			OutcomeKind::Updated => write!(f, "Updated {}", who),
			OutcomeKind::WouldUpdate { .. } => write!(f, "Would update {}", who),
			OutcomeKind::Unchanged => write!(f, "Snapshot unchanged for {}", who),
			OutcomeKind::NoEvent => write!(f, "No matching event for {}", who),
			OutcomeKind::NoSnapshot { reason } => write!(f, "No snapshot for {}: {}", who, reason),
			OutcomeKind::Failed { error } => write!(f, "Failed {}: {}", who, error),
		}
	}
}

/// Counters and outcomes of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
	/// Profiles fully processed.
	pub profiles_scanned: usize,
	/// Profiles whose snapshot was written, previewed or found unchanged.
	pub matched: usize,
	pub updated: usize,
	/// Dry run: profiles that would have been updated.
	pub would_update: usize,
	/// Profiles left alone: unchanged, no event or no snapshot.
	pub skipped: usize,
	pub errored: usize,
	pub outcomes: Vec<ProfileOutcome>,
	pub dry_run: bool,
	pub cancelled: bool,
}

impl SyncResult {
	pub fn new(dry_run: bool) -> Self {
		Self {
			dry_run,
			..Self::default()
		}
	}

	/// Count an outcome and keep its record.
	pub fn record(&mut self, outcome: ProfileOutcome) {
		self.profiles_scanned += 1;
		match &outcome.kind {
			OutcomeKind::Updated => {
				self.matched += 1;
				self.updated += 1;
			}
			OutcomeKind::WouldUpdate { .. } => {
				self.matched += 1;
				self.would_update += 1;
			}
			OutcomeKind::Unchanged => {
				self.matched += 1;
				self.skipped += 1;
			}
			OutcomeKind::NoEvent | OutcomeKind::NoSnapshot { .. } => self.skipped += 1,
			OutcomeKind::Failed { .. } => self.errored += 1,
		}
		self.outcomes.push(outcome);
	}

	/// Snapshot of the counters for a progress message.
	pub fn progress(&self, message: impl Into<String>) -> ProgressUpdate {
		ProgressUpdate {
			profiles_scanned: self.profiles_scanned,
			matched: self.matched,
			updated: self.updated,
			skipped: self.skipped,
			errored: self.errored,
			message: message.into(),
		}
	}

	/// Get a human-readable summary of the counters
	pub fn summary(&self) -> String {
		let would_update = if self.dry_run {
			format!(", {} would update", self.would_update)
		} else {
			String::new()
		};

		format!(
			"{} profiles scanned: {} matched, {} updated{}, {} skipped, {} errors{}{}",
			self.profiles_scanned,
			self.matched,
			self.updated,
			would_update,
			self.skipped,
			self.errored,
			if self.dry_run { " (dry run)" } else { "" },
			if self.cancelled { " (cancelled)" } else { "" },
		)
	}
}

/// Running counters handed to the progress sink after every profile
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
	pub profiles_scanned: usize,
	pub matched: usize,
	pub updated: usize,
	pub skipped: usize,
	pub errored: usize,
	pub message: String,
}

/// Errors from the workflow and the background runner
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
	#[error("Klaviyo API error: {0}")]
	Api(#[from] KlaviyoError),

	#[error("Invalid configuration: {0}")]
	Config(#[from] ConfigError),

	#[error("A sync run is already in progress")]
	AlreadyRunning,

	#[error("No sync run is in progress")]
	NotRunning,

	#[error("Event handler error: {0}")]
	Dispatch(String),

	#[error("Sync worker terminated unexpectedly")]
	WorkerTerminated,
}

/// A run that ended early on an unrecoverable error, with what was done before it
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct SyncFailure {
	pub error: KlaviyoError,
	pub partial: SyncResult,
}
