//! Types for the Klaviyo REST API (JSON:API documents) and the domain values built from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A JSON:API top-level document as returned by the list endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    /// The primary resources of this page.
    #[serde(default)]
    pub data: Vec<ResourceObject>,
    /// Side-loaded resources requested with `include=`.
    #[serde(default)]
    pub included: Vec<ResourceObject>,
    /// Pagination links.
    #[serde(default)]
    pub links: Links,
}

/// Pagination links of a JSON:API document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    /// Absolute URL of the next page, absent on the last page.
    pub next: Option<String>,
}

/// A single JSON:API resource object.
///
/// Attributes and relationships are kept as raw JSON so that unexpected shapes never fail
/// deserialization of the whole page.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceObject {
    /// The resource type (`profile`, `event`, `metric`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// The resource identifier.
    pub id: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub relationships: Value,
}

/// Opaque pagination cursor: the `next` link of the previous page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor(String);

impl PageCursor {
    pub fn new(next_link: impl Into<String>) -> Self {
        Self(next_link.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageCursor>,
}

/// A Klaviyo customer profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Klaviyo profile identifier.
    pub id: String,
    /// Top-level email attribute, or the `$email` custom property.
    pub email: Option<String>,
    /// Custom properties stored on the profile.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Profile {
    /// Build a profile from a JSON:API resource, ignoring resources of any other type.
    pub fn from_resource(resource: ResourceObject) -> Option<Self> {
        if resource.kind != "profile" {
            return None;
        }

        let properties = resource
            .attributes
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let email = resource
            .attributes
            .get("email")
            .and_then(Value::as_str)
            .or_else(|| properties.get("$email").and_then(Value::as_str))
            .filter(|email| !email.is_empty())
            .map(str::to_string);

        Some(Self {
            id: resource.id,
            email,
            properties,
        })
    }

    /// Email used in logs and previews.
    pub fn display_email(&self) -> &str {
        self.email.as_deref().unwrap_or("no-email")
    }
}

/// A timestamped profile activity record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Klaviyo event identifier.
    pub id: String,
    /// Name of the metric this event belongs to.
    pub name: String,
    /// When the event happened; `DateTime::<Utc>::MIN_UTC` if the API sent no usable time.
    pub timestamp: DateTime<Utc>,
    /// The `datetime` attribute as sent by the API.
    pub datetime: Option<String>,
    /// Event properties.
    pub payload: Value,
}

impl Event {
    /// Build an event from a JSON:API resource, resolving its metric name through `metric_names`.
    pub fn from_resource(
        resource: ResourceObject,
        metric_names: &HashMap<String, String>,
    ) -> Option<Self> {
        if resource.kind != "event" {
            return None;
        }

        let name = resource
            .relationships
            .pointer("/metric/data/id")
            .and_then(Value::as_str)
            .and_then(|metric_id| metric_names.get(metric_id))
            .cloned()
            .unwrap_or_default();

        let attributes = &resource.attributes;
        let timestamp = parse_timestamp(attributes).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let datetime = attributes
            .get("datetime")
            .and_then(Value::as_str)
            .map(str::to_string);
        let payload = attributes
            .get("event_properties")
            .or_else(|| attributes.get("properties"))
            .cloned()
            .unwrap_or(Value::Null);

        Some(Self {
            id: resource.id,
            name,
            timestamp,
            datetime,
            payload,
        })
    }

    /// Whether this event should win over `other` when picking the latest one.
    ///
    /// Later timestamp wins; equal timestamps fall back to the larger identifier.
    pub fn is_newer_than(&self, other: &Event) -> bool {
        (self.timestamp, self.id.as_str()) > (other.timestamp, other.id.as_str())
    }
}

fn parse_timestamp(attributes: &Value) -> Option<DateTime<Utc>> {
    match attributes.get("timestamp") {
        Some(Value::Number(secs)) => {
            if let Some(secs) = secs.as_i64() {
                return DateTime::from_timestamp(secs, 0);
            }
        }
        Some(Value::String(raw)) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
        _ => {}
    }

    attributes
        .get("datetime")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Map metric id -> metric name from the `included` section of an events page.
pub fn metric_names(included: &[ResourceObject]) -> HashMap<String, String> {
    included
        .iter()
        .filter(|resource| resource.kind == "metric")
        .filter_map(|resource| {
            resource
                .attributes
                .get("name")
                .and_then(Value::as_str)
                .map(|name| (resource.id.clone(), name.to_string()))
        })
        .collect()
}

/// Exact-match filter on event (metric) names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNameFilter {
    names: Vec<String>,
}

impl EventNameFilter {
    /// Filter accepting `primary` and any of `aliases`.
    pub fn new(primary: &str, aliases: &[String]) -> Self {
        let names = std::iter::once(primary)
            .chain(aliases.iter().map(String::as_str))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Self { names }
    }

    pub fn exact(name: &str) -> Self {
        Self::new(name, &[])
    }

    pub fn matches(&self, event_name: &str) -> bool {
        let event_name = event_name.trim();
        self.names.iter().any(|name| name == event_name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Error taxonomy for Klaviyo API calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KlaviyoError {
    #[error("Authentication rejected during {operation} (HTTP {status}): {detail}")]
    Auth {
        operation: &'static str,
        status: u16,
        detail: String,
    },

    #[error("Not found during {operation}: {detail}")]
    NotFound {
        operation: &'static str,
        detail: String,
    },

    #[error("Rate limited during {operation}, gave up after {attempts} attempts")]
    RateLimited {
        operation: &'static str,
        attempts: u32,
    },

    #[error("Transient failure during {operation} after {attempts} attempts: {detail}")]
    Transient {
        operation: &'static str,
        attempts: u32,
        detail: String,
    },

    #[error("Request rejected during {operation} (HTTP {status}): {detail}")]
    Validation {
        operation: &'static str,
        status: u16,
        detail: String,
    },

    #[error("Invalid response during {operation}: {detail}")]
    InvalidResponse {
        operation: &'static str,
        detail: String,
    },
}

impl KlaviyoError {
    /// Errors that make every further request pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KlaviyoError::Auth { .. })
    }

    /// The API operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            KlaviyoError::Auth { operation, .. }
            | KlaviyoError::NotFound { operation, .. }
            | KlaviyoError::RateLimited { operation, .. }
            | KlaviyoError::Transient { operation, .. }
            | KlaviyoError::Validation { operation, .. }
            | KlaviyoError::InvalidResponse { operation, .. } => operation,
        }
    }
}
