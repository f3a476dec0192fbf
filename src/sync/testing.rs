//! In-memory `ProfileApi` shared by the workflow and runner tests.

use crate::klaviyo::{Event, EventNameFilter, KlaviyoError, Profile, ProfileApi};

use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Default)]
pub struct FakeProfileApi {
    profiles: Vec<Profile>,
    /// Error yielded by the segment listing after all profiles.
    segment_error: Option<KlaviyoError>,
    events: HashMap<String, Vec<Event>>,
    event_errors: HashMap<String, KlaviyoError>,
    update_errors: HashMap<String, KlaviyoError>,
    /// Cancel signal raised when the events of this profile are listed.
    cancel_on: Option<(String, watch::Sender<bool>)>,
    event_requests: Mutex<Vec<String>>,
    updates: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl FakeProfileApi {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles,
            ..Self::default()
        }
    }

    /// Events of any metric for a profile, newest first.
    pub fn with_events(mut self, profile_id: &str, events: Vec<Event>) -> Self {
        self.events.insert(profile_id.to_string(), events);
        self
    }

    pub fn with_segment_error(mut self, error: KlaviyoError) -> Self {
        self.segment_error = Some(error);
        self
    }

    pub fn with_event_error(mut self, profile_id: &str, error: KlaviyoError) -> Self {
        self.event_errors.insert(profile_id.to_string(), error);
        self
    }

    pub fn with_update_error(mut self, profile_id: &str, error: KlaviyoError) -> Self {
        self.update_errors.insert(profile_id.to_string(), error);
        self
    }

    pub fn cancel_when_processing(mut self, profile_id: &str, cancel: watch::Sender<bool>) -> Self {
        self.cancel_on = Some((profile_id.to_string(), cancel));
        self
    }

    pub fn event_requests(&self) -> Vec<String> {
        self.event_requests.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(String, Map<String, Value>)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProfileApi for FakeProfileApi {
    fn list_segment_profiles<'a>(
        &'a self,
        _segment_id: &'a str,
    ) -> BoxStream<'a, Result<Profile, KlaviyoError>> {
        let items = self
            .profiles
            .iter()
            .cloned()
            .map(Ok::<Profile, KlaviyoError>)
            .chain(self.segment_error.clone().map(Err));
        stream::iter(items).boxed()
    }

    fn list_profile_events<'a>(
        &'a self,
        profile_id: &'a str,
        filter: Option<&'a EventNameFilter>,
    ) -> BoxStream<'a, Result<Event, KlaviyoError>> {
        self.event_requests
            .lock()
            .unwrap()
            .push(profile_id.to_string());

        if let Some((id, cancel)) = &self.cancel_on {
            if id == profile_id {
                cancel.send_replace(true);
            }
        }

        if let Some(error) = self.event_errors.get(profile_id) {
            return stream::iter(vec![Err(error.clone())]).boxed();
        }

        let events: Vec<Result<Event, KlaviyoError>> = self
            .events
            .get(profile_id)
            .into_iter()
            .flatten()
            .filter(|event| filter.is_none_or(|filter| filter.matches(&event.name)))
            .cloned()
            .map(Ok)
            .collect();
        stream::iter(events).boxed()
    }

    async fn update_profile(
        &self,
        profile_id: &str,
        properties: Map<String, Value>,
    ) -> Result<(), KlaviyoError> {
        if let Some(error) = self.update_errors.get(profile_id) {
            return Err(error.clone());
        }
        self.updates
            .lock()
            .unwrap()
            .push((profile_id.to_string(), properties));
        Ok(())
    }
}

pub fn profile(id: &str) -> Profile {
    Profile {
        id: id.to_string(),
        email: Some(format!("{}@example.com", id.to_lowercase())),
        properties: Map::new(),
    }
}

/// A "Checkout Started" event carrying one line item.
pub fn checkout_event(id: &str, secs: i64, title: &str) -> Event {
    Event {
        id: id.to_string(),
        name: "Checkout Started".to_string(),
        timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        datetime: None,
        payload: json!({
            "extra": {
                "checkout_url": format!("https://shop.example.com/checkouts/{}", id),
                "line_items": [{ "title": title, "quantity": 1, "line_price": "10.00" }]
            }
        }),
    }
}

/// An event of some other metric.
pub fn other_event(id: &str, secs: i64) -> Event {
    Event {
        id: id.to_string(),
        name: "Viewed Product".to_string(),
        timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        datetime: None,
        payload: json!({ "product_id": "SKU-1" }),
    }
}

pub fn auth_error(operation: &'static str) -> KlaviyoError {
    KlaviyoError::Auth {
        operation,
        status: 401,
        detail: "Incorrect authentication credentials.".to_string(),
    }
}
