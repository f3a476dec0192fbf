use crate::klaviyo::EventNameFilter;
use crate::sync::strategies::ChangeDetection;
use crate::utils::mask_secret;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Immutable configuration snapshot for one sync run.
///
/// Serialized with camelCase keys; every field has a default so partial files load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
	/// Segment whose profiles are scanned.
	pub segment_id: String,
	/// Exact name of the event (metric) to look for.
	pub event_name: String,
	/// Additional names accepted as the same event.
	pub event_name_aliases: Vec<String>,
	/// Compute and report updates without applying them.
	pub dry_run: bool,
	/// API revision pinned in the `revision` header.
	pub api_revision: String,
	pub base_url: String,
	/// Per-request deadline.
	pub timeout_seconds: u64,
	/// Retry ceiling for rate limits and transient failures.
	pub max_retries: u32,
	/// Page size for segment pagination.
	pub batch_size: u32,
	/// Profile property the snapshot is written under.
	pub property_key: String,
	pub change_detection: ChangeDetection,
	/// Image used for line items that carry none.
	pub placeholder_image_url: Option<String>,
	pub default_currency: String,
	/// Stop after this many profiles.
	pub profile_limit: Option<usize>,
	/// Pause taken after every 50 processed profiles.
	pub courtesy_delay_ms: u64,
	/// Pause taken before each follow-up page of a listing.
	pub page_delay_ms: u64,
}

impl SyncConfig {
	pub const DEFAULT_REVISION: &'static str = "2025-07-15";
	pub const DEFAULT_BASE_URL: &'static str = "https://a.klaviyo.com";
	pub const DEFAULT_PROPERTY_KEY: &'static str = "last_checkout_snapshot";

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_seconds)
	}

	pub fn courtesy_delay(&self) -> Duration {
		Duration::from_millis(self.courtesy_delay_ms)
	}

	pub fn page_delay(&self) -> Duration {
		Duration::from_millis(self.page_delay_ms)
	}

	/// Filter accepting the configured event name and its aliases.
	pub fn event_filter(&self) -> EventNameFilter {
		EventNameFilter::new(&self.event_name, &self.event_name_aliases)
	}

	/// Check the snapshot before a run starts.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.segment_id.trim().is_empty() {
			return Err(ConfigError::MissingSegmentId);
		}
		if self.event_filter().names().is_empty() {
			return Err(ConfigError::MissingEventName);
		}
		if self.api_revision.trim().is_empty() {
			return Err(ConfigError::MissingRevision);
		}
		if self.property_key.trim().is_empty() {
			return Err(ConfigError::MissingPropertyKey);
		}
		if self.timeout_seconds == 0 {
			return Err(ConfigError::ZeroTimeout);
		}
		if !(1..=100).contains(&self.batch_size) {
			return Err(ConfigError::BatchSize(self.batch_size));
		}

		let url = Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
			url: self.base_url.clone(),
			reason: e.to_string(),
		})?;
		if url.scheme() != "https" {
			return Err(ConfigError::InsecureBaseUrl(self.base_url.clone()));
		}

		Ok(())
	}
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			segment_id: String::new(),
			event_name: "Checkout Started".to_string(),
			event_name_aliases: vec!["Started Checkout".to_string()],
			dry_run: false,
			api_revision: Self::DEFAULT_REVISION.to_string(),
			base_url: Self::DEFAULT_BASE_URL.to_string(),
			timeout_seconds: 60,
			max_retries: 5,
			batch_size: 25,
			property_key: Self::DEFAULT_PROPERTY_KEY.to_string(),
			change_detection: ChangeDetection::default(),
			placeholder_image_url: None,
			default_currency: "USD".to_string(),
			profile_limit: None,
			courtesy_delay_ms: 200,
			page_delay_ms: 100,
		}
	}
}

/// Klaviyo private API key.
///
/// The value is only reachable through `expose`; formatting shows a masked form.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
	/// Accepts keys longer than ten characters after trimming.
	pub fn new(raw: &str) -> Result<Self, ConfigError> {
		let trimmed = raw.trim();
		if trimmed.chars().count() <= 10 {
			return Err(ConfigError::InvalidApiKey);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ApiKey({})", mask_secret(&self.0))
	}
}

impl fmt::Display for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&mask_secret(&self.0))
	}
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
	#[error("Segment ID is required")]
	MissingSegmentId,

	#[error("Event name is required")]
	MissingEventName,

	#[error("API revision is required")]
	MissingRevision,

	#[error("Profile property key is required")]
	MissingPropertyKey,

	#[error("Timeout must be at least one second")]
	ZeroTimeout,

	#[error("Batch size must be between 1 and 100, got {0}")]
	BatchSize(u32),

	#[error("Invalid base URL {url}: {reason}")]
	InvalidBaseUrl { url: String, reason: String },

	#[error("Base URL must use https: {0}")]
	InsecureBaseUrl(String),

	#[error("API key looks invalid (too short)")]
	InvalidApiKey,
}
