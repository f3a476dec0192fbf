use crate::klaviyo::{KlaviyoError, Profile, ProfileApi};
use crate::sync::snapshot::CheckoutSnapshot;
use crate::sync::types::OutcomeKind;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// When an extracted snapshot is written over the one already stored on a profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeDetection {
	/// Write every extracted snapshot.
	Always,
	/// Write unless the stored value equals the new snapshot.
	#[default]
	FullSnapshot,
	/// Write unless `items`, `subtotal` and `currency` are all unchanged.
	ItemsAndTotals,
}

impl ChangeDetection {
	/// Whether `candidate` should replace the value stored on the profile.
	///
	/// The stored value is read back as a snapshot so numbers compare by value; a value that
	/// is missing or no longer parses always needs replacing.
	pub fn requires_update(&self, existing: Option<&Value>, candidate: &CheckoutSnapshot) -> bool {
		if *self == ChangeDetection::Always {
			return true;
		}

		let Some(existing) = existing.and_then(|value| CheckoutSnapshot::deserialize(value).ok())
		else {
			return true;
		};

		match self {
			ChangeDetection::Always => true,
			ChangeDetection::FullSnapshot => existing != *candidate,
			ChangeDetection::ItemsAndTotals => {
				existing.items != candidate.items
					|| existing.subtotal != candidate.subtotal
					|| existing.currency != candidate.currency
			}
		}
	}
}

/// Trait for the ways a snapshot can be applied to a profile
#[async_trait::async_trait]
pub trait SnapshotWriter: Send + Sync {
	/// Apply the snapshot and report what happened
	async fn write(
		&self,
		profile: &Profile,
		snapshot: &CheckoutSnapshot,
	) -> Result<OutcomeKind, KlaviyoError>;

	/// Get the name of this writer
	fn name(&self) -> &'static str;
}

/// Writes snapshots to the profile through the API
pub struct ApiSnapshotWriter {
	api: Arc<dyn ProfileApi>,
	property_key: String,
}

impl ApiSnapshotWriter {
	pub fn new(api: Arc<dyn ProfileApi>, property_key: impl Into<String>) -> Self {
		Self {
			api,
			property_key: property_key.into(),
		}
	}
}

#[async_trait::async_trait]
impl SnapshotWriter for ApiSnapshotWriter {
	async fn write(
		&self,
		profile: &Profile,
		snapshot: &CheckoutSnapshot,
	) -> Result<OutcomeKind, KlaviyoError> {
		let value = match snapshot.to_value() {
			Ok(value) => value,
			Err(e) => {
				warn!("Snapshot for profile {} cannot be encoded: {}", profile.id, e);
				return Ok(OutcomeKind::NoSnapshot {
					reason: e.to_string(),
				});
			}
		};
		let mut properties = Map::new();
		properties.insert(self.property_key.clone(), value);

		self.api.update_profile(&profile.id, properties).await?;

		debug!(
			"Wrote {} with {} items to profile {}",
			self.property_key,
			snapshot.items.len(),
			profile.id
		);
		Ok(OutcomeKind::Updated)
	}

	fn name(&self) -> &'static str {
		"ApiSnapshotWriter"
	}
}

/// Previews snapshots without touching the profile
pub struct DryRunSnapshotWriter;

#[async_trait::async_trait]
impl SnapshotWriter for DryRunSnapshotWriter {
	async fn write(
		&self,
		profile: &Profile,
		snapshot: &CheckoutSnapshot,
	) -> Result<OutcomeKind, KlaviyoError> {
		let summary = snapshot.summary(profile);
		info!("[dry run] Would update profile:\n{}", summary);
		Ok(OutcomeKind::WouldUpdate { summary })
	}

	fn name(&self) -> &'static str {
		"DryRunSnapshotWriter"
	}
}
