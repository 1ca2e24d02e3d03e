//! Server-Sent Events stream of broker session events.

use std::{convert::Infallible, time::Duration};

use {
    axum::{
        extract::{Query, State},
        response::sse::{Event, KeepAlive, Sse},
    },
    futures::{Stream, StreamExt},
    serde::Deserialize,
    tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
    tracing::{debug, warn},
};

use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only stream events for this tenant.
    #[serde(default)]
    pub tenant_id: Option<String>,
}

pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(tenant_id = ?query.tenant_id, "event stream subscriber connected");
    let filter = query.tenant_id;
    let stream = BroadcastStream::new(state.broker.subscribe()).filter_map(move |item| {
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream subscriber lagged");
                return futures::future::ready(None);
            },
        };
        if filter.as_deref().is_some_and(|t| t != event.tenant_id()) {
            return futures::future::ready(None);
        }
        let sse = match Event::default().event(event.kind()).json_data(&event) {
            Ok(sse) => sse,
            Err(e) => {
                warn!(error = %e, "failed to encode session event");
                return futures::future::ready(None);
            },
        };
        futures::future::ready(Some(Ok(sse)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
