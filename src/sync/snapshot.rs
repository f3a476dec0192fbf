//! Checkout snapshot extraction.
//!
//! This module turns the payload of a checkout event into a `CheckoutSnapshot`: line items,
//! subtotal, currency, checkout URL and capture time. Payloads come from several storefront
//! integrations, so every field is looked up in a list of known locations and the first one
//! present wins. A payload without the expected shape yields an `ExtractError` that the
//! workflow records as "no snapshot" for the profile.

use crate::klaviyo::{Event, Profile};
use crate::utils::format_price;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One product line of a checkout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: Option<String>,
    pub variant_id: Option<String>,
    pub title: String,
    pub image_url: Option<String>,
    pub quantity: u64,
    pub line_price: f64,
}

/// Normalized cart state written to a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSnapshot {
    pub checkout_url: Option<String>,
    pub currency: String,
    pub subtotal: f64,
    /// When the checkout event happened, as sent by the API.
    #[serde(rename = "updated_at")]
    pub captured_at: Option<String>,
    pub items: Vec<LineItem>,
}

impl CheckoutSnapshot {
    /// The JSON value stored under the profile property.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Multi-line preview shown for dry-run updates.
    pub fn summary(&self, profile: &Profile) -> String {
        let mut lines = vec![
            format!(
                "Profile: {}  Email: {}",
                profile.id,
                profile.display_email()
            ),
            format!(
                "  Checkout URL: {}",
                self.checkout_url.as_deref().unwrap_or("-")
            ),
            format!(
                "  Currency: {}   Updated At: {}",
                self.currency,
                self.captured_at.as_deref().unwrap_or("-")
            ),
            format!("  Items ({}):", self.items.len()),
        ];

        for (i, item) in self.items.iter().enumerate() {
            lines.push(format!(
                "    {}. {} | Qty: {} | Price: {}",
                i + 1,
                item.title,
                item.quantity,
                format_price(item.line_price)
            ));
            lines.push(format!(
                "       image: {}",
                item.image_url.as_deref().unwrap_or("-")
            ));
        }

        lines.join("\n")
    }
}

/// Why an event produced no snapshot
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractError {
    #[error("malformed event payload: {0}")]
    Malformed(String),

    #[error("event has neither a checkout URL nor line items")]
    Empty,
}

/// Maps checkout event payloads to snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotExtractor {
    /// Image for line items that carry none.
    placeholder_image_url: Option<String>,
    /// Currency used when the payload names none.
    default_currency: String,
}

impl SnapshotExtractor {
    pub fn new(placeholder_image_url: Option<String>, default_currency: impl Into<String>) -> Self {
        Self {
            placeholder_image_url,
            default_currency: default_currency.into(),
        }
    }

    /// Extract the checkout snapshot carried by `event`.
    pub fn extract(&self, event: &Event) -> Result<CheckoutSnapshot, ExtractError> {
        let props = event
            .payload
            .as_object()
            .ok_or_else(|| ExtractError::Malformed("payload is not an object".to_string()))?;

        let extra = object_at(props, "extra");
        let dollar_extra = object_at(props, "$extra");

        let raw_items = [
            extra.and_then(|e| e.get("line_items")),
            dollar_extra.and_then(|e| e.get("line_items")),
            props.get("Items"),
            props.get("items"),
        ]
        .into_iter()
        .flatten()
        .find(|value| !value.is_null());

        let items = match raw_items {
            None => Vec::new(),
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(Value::as_object)
                .map(|item| self.line_item(item))
                .collect(),
            Some(_) => {
                return Err(ExtractError::Malformed(
                    "line items are not a list".to_string(),
                ));
            }
        };

        let checkout_url = first_string(&[
            extra.and_then(|e| e.get("checkout_url")),
            extra.and_then(|e| e.get("responsive_checkout_url")),
            props.get("checkout_url"),
            props.get("Checkout URL"),
        ]);

        if checkout_url.is_none() && items.is_empty() {
            return Err(ExtractError::Empty);
        }

        let currency = first_string(&[
            extra.and_then(|e| e.get("presentment_currency")),
            props.get("presentment_currency"),
            props.get("$currency_code"),
        ])
        .unwrap_or_else(|| self.default_currency.clone());

        let subtotal = [
            extra.and_then(|e| e.get("subtotal_price")),
            props.get("$value"),
        ]
        .into_iter()
        .flatten()
        .find_map(coerce_number)
        .unwrap_or_else(|| items.iter().map(|item| item.line_price).sum());

        let captured_at = event.datetime.clone().or_else(|| {
            (event.timestamp != DateTime::<Utc>::MIN_UTC).then(|| event.timestamp.to_rfc3339())
        });

        Ok(CheckoutSnapshot {
            checkout_url,
            currency,
            subtotal,
            captured_at,
            items,
        })
    }

    fn line_item(&self, item: &Map<String, Value>) -> LineItem {
        let product = object_at(item, "product");
        let variant = product.and_then(|p| object_at(p, "variant"));

        let title = first_string(&[
            product.and_then(|p| p.get("title")),
            item.get("presentment_title"),
            item.get("title"),
        ])
        .unwrap_or_default();

        let image_url = [
            variant.and_then(|v| v.get("images")),
            product.and_then(|p| p.get("images")),
        ]
        .into_iter()
        .flatten()
        .find_map(first_src)
        .or_else(|| self.placeholder_image_url.clone());

        LineItem {
            product_id: product.and_then(|p| p.get("id")).and_then(identifier),
            variant_id: item
                .get("variant_id")
                .and_then(identifier)
                .or_else(|| variant.and_then(|v| v.get("id")).and_then(identifier)),
            title,
            image_url,
            quantity: item.get("quantity").and_then(coerce_quantity).unwrap_or(0),
            line_price: item.get("line_price").and_then(coerce_number).unwrap_or(0.0),
        }
    }
}

impl Default for SnapshotExtractor {
    fn default() -> Self {
        Self::new(None, "USD")
    }
}

fn object_at<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    map.get(key).and_then(Value::as_object)
}

/// First non-empty string among the candidates.
fn first_string(candidates: &[Option<&Value>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .filter_map(|value| value.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Ids arrive as strings or numbers depending on the storefront.
fn identifier(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_src(images: &Value) -> Option<String> {
    images
        .as_array()?
        .first()?
        .get("src")?
        .as_str()
        .filter(|src| !src.is_empty())
        .map(str::to_string)
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn coerce_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}
