//!
//! Klaviyo REST API client.
//!
//! This module provides typed operations over the transport layer: paging through the
//! profiles of a segment, paging through a profile's events newest first (optionally filtered
//! by metric name), and
//! patching a profile's custom properties. Listings are exposed as lazy streams that fetch
//! the next page only when the consumer asks for more items.

use super::transport::{
    ApiRequest, HttpTransport, ReqwestTransport, RetryPolicy, TransportError, send_with_retry,
};
use super::types::{
    Document, Event, EventNameFilter, KlaviyoError, Page, PageCursor, Profile, metric_names,
};
use crate::settings::{ApiKey, SyncConfig};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::Url;
use serde_json::{Map, Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// The operations the sync workflow needs from Klaviyo.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    /// Lazily list the profiles of a segment, one page at a time.
    ///
    /// The stream is not restartable; call again to start over from the first page.
    fn list_segment_profiles<'a>(
        &'a self,
        segment_id: &'a str,
    ) -> BoxStream<'a, Result<Profile, KlaviyoError>>;

    /// Lazily list a profile's events, newest first, with metric names resolved.
    ///
    /// With a filter only events whose name passes it are yielded; without one every event is,
    /// which lets a consumer stop on timestamps alone.
    fn list_profile_events<'a>(
        &'a self,
        profile_id: &'a str,
        filter: Option<&'a EventNameFilter>,
    ) -> BoxStream<'a, Result<Event, KlaviyoError>>;

    /// Overwrite the given custom properties on a profile.
    async fn update_profile(
        &self,
        profile_id: &str,
        properties: Map<String, Value>,
    ) -> Result<(), KlaviyoError>;
}

/// Klaviyo REST API client
#[derive(Clone)]
pub struct KlaviyoClient {
    /// Sends the requests; shared so the client can be cloned cheaply.
    transport: Arc<dyn HttpTransport>,
    /// Retry ceiling and delays for every request.
    retry_policy: RetryPolicy,
    /// Scheme and host of the API, e.g. `https://a.klaviyo.com`.
    base_url: Url,
    /// `page[size]` for segment profile listings.
    page_size: u32,
    /// Pause before every page fetched from a cursor.
    page_delay: Duration,
}

impl KlaviyoClient {
    /// Largest page size the segment profiles endpoint accepts.
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Create a client over an arbitrary transport.
    pub fn new(transport: Arc<dyn HttpTransport>, base_url: Url) -> Self {
        Self {
            transport,
            retry_policy: RetryPolicy::default(),
            base_url,
            page_size: 20,
            page_delay: Duration::ZERO,
        }
    }

    /// Create a `reqwest`-backed client from a configuration snapshot.
    pub fn from_config(config: &SyncConfig, api_key: &ApiKey) -> Result<Self, TransportError> {
        let transport = ReqwestTransport::new(api_key, &config.api_revision, config.timeout())?;
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| TransportError::InvalidBaseUrl(e.to_string()))?;

        Ok(Self::new(Arc::new(transport), base_url)
            .with_retry_policy(RetryPolicy::with_max_retries(config.max_retries))
            .with_page_size(config.batch_size)
            .with_page_delay(config.page_delay()))
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the page size, clamped to what the API accepts.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, Self::MAX_PAGE_SIZE);
        self
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Check that the key is accepted by fetching the account.
    pub async fn test_connection(&self) -> Result<(), KlaviyoError> {
        let url = self.endpoint(&["accounts"]);
        self.get_document("test_connection", url.as_str()).await?;
        info!("Connected to Klaviyo at {}", self.base_url);
        Ok(())
    }

    /// Fetch one page of a segment's profiles.
    ///
    /// Without a cursor the first page is requested; otherwise the cursor's link is followed
    /// as-is.
    pub async fn fetch_segment_page(
        &self,
        segment_id: &str,
        cursor: Option<&PageCursor>,
    ) -> Result<Page<Profile>, KlaviyoError> {
        let url = match cursor {
            Some(cursor) => cursor.as_str().to_string(),
            None => {
                let mut url = self.endpoint(&["segments", segment_id, "profiles"]);
                url.query_pairs_mut()
                    .append_pair("page[size]", &self.page_size.to_string());
                url.to_string()
            }
        };

        let document = self.get_document("list_segment_profiles", &url).await?;
        let items: Vec<Profile> = document
            .data
            .into_iter()
            .filter_map(Profile::from_resource)
            .collect();

        debug!(
            "Fetched {} profiles from segment {} (more: {})",
            items.len(),
            segment_id,
            document.links.next.is_some()
        );

        Ok(Page {
            items,
            next: document.links.next.map(PageCursor::new),
        })
    }

    /// Fetch one page of a profile's events, newest first, keeping those that pass `filter`.
    pub async fn fetch_events_page(
        &self,
        profile_id: &str,
        filter: Option<&EventNameFilter>,
        cursor: Option<&PageCursor>,
    ) -> Result<Page<Event>, KlaviyoError> {
        let url = match cursor {
            Some(cursor) => cursor.as_str().to_string(),
            None => {
                let mut url = self.endpoint(&["events"]);
                url.query_pairs_mut()
                    .append_pair("filter", &format!("equals(profile_id,\"{}\")", profile_id))
                    .append_pair("sort", "-timestamp")
                    .append_pair("include", "metric")
                    .append_pair("fields[metric]", "name");
                url.to_string()
            }
        };

        let document = self.get_document("list_profile_events", &url).await?;
        let names = metric_names(&document.included);
        let items: Vec<Event> = document
            .data
            .into_iter()
            .filter_map(|resource| Event::from_resource(resource, &names))
            .filter(|event| filter.is_none_or(|filter| filter.matches(&event.name)))
            .collect();

        debug!(
            "Fetched {} events of profile {} (more: {})",
            items.len(),
            profile_id,
            document.links.next.is_some()
        );

        Ok(Page {
            items,
            next: document.links.next.map(PageCursor::new),
        })
    }

    /// Build `<base>/api/<segments...>` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        url.set_query(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    async fn get_document(
        &self,
        operation: &'static str,
        url: &str,
    ) -> Result<Document, KlaviyoError> {
        let request = ApiRequest::get(operation, url);
        let response = send_with_retry(self.transport.as_ref(), &self.retry_policy, &request).await?;

        serde_json::from_str(&response.body).map_err(|e| KlaviyoError::InvalidResponse {
            operation,
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl ProfileApi for KlaviyoClient {
    fn list_segment_profiles<'a>(
        &'a self,
        segment_id: &'a str,
    ) -> BoxStream<'a, Result<Profile, KlaviyoError>> {
        paginate(self.page_delay, move |cursor| async move {
            self.fetch_segment_page(segment_id, cursor.as_ref()).await
        })
    }

    fn list_profile_events<'a>(
        &'a self,
        profile_id: &'a str,
        filter: Option<&'a EventNameFilter>,
    ) -> BoxStream<'a, Result<Event, KlaviyoError>> {
        paginate(self.page_delay, move |cursor| async move {
            self.fetch_events_page(profile_id, filter, cursor.as_ref()).await
        })
    }

    async fn update_profile(
        &self,
        profile_id: &str,
        properties: Map<String, Value>,
    ) -> Result<(), KlaviyoError> {
        let url = self.endpoint(&["profiles", profile_id]);
        let body = json!({
            "data": {
                "type": "profile",
                "id": profile_id,
                "attributes": {
                    "properties": properties
                }
            }
        });

        let request = ApiRequest::patch("update_profile", url.as_str(), body);
        send_with_retry(self.transport.as_ref(), &self.retry_policy, &request).await?;

        debug!("Updated profile {}", profile_id);
        Ok(())
    }
}

/// Turn a page fetcher into a flat stream of items.
///
/// `fetch` receives `None` for the first page and the previous page's cursor afterwards; the
/// stream ends after a page without a cursor, or at the first error. Every page after the first
/// waits `delay` before it is fetched.
fn paginate<'a, T, F, Fut>(delay: Duration, fetch: F) -> BoxStream<'a, Result<T, KlaviyoError>>
where
    T: Send + 'a,
    F: FnMut(Option<PageCursor>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>, KlaviyoError>> + Send + 'a,
{
    stream::try_unfold(
        (fetch, Some(None::<PageCursor>)),
        move |(mut fetch, state)| async move {
            let Some(cursor) = state else {
                return Ok::<_, KlaviyoError>(None);
            };
            if cursor.is_some() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let page = fetch(cursor).await?;
            let next_state = page.next.map(Some);
            let items = stream::iter(page.items.into_iter().map(Ok::<T, KlaviyoError>));

            Ok(Some((items, (fetch, next_state))))
        },
    )
    .try_flatten()
    .boxed()
}
