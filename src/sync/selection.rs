use crate::klaviyo::{Event, EventNameFilter, KlaviyoError};

use futures::stream::{BoxStream, TryStreamExt};
use tracing::debug;

/// Pick the most recent event passing `filter` from a newest-first stream of all events.
///
/// Later timestamps win and equal timestamps fall back to the larger event id. Once any event,
/// matching or not, is strictly older than the current pick nothing further can win, so no
/// more pages are pulled.
pub async fn select_latest(
	mut events: BoxStream<'_, Result<Event, KlaviyoError>>,
	filter: &EventNameFilter,
) -> Result<Option<Event>, KlaviyoError> {
	let mut latest: Option<Event> = None;

	while let Some(event) = events.try_next().await? {
		if let Some(current) = &latest {
			if event.timestamp < current.timestamp {
				debug!(
					"Event {} is older than {}, stopping event scan",
					event.id, current.id
				);
				break;
			}
		}

		if !filter.matches(&event.name) {
			continue;
		}

		match &latest {
			Some(current) if !event.is_newer_than(current) => {}
			_ => latest = Some(event),
		}
	}

	Ok(latest)
}
