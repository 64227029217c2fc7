//! Server-sent event streaming for live dashboards

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::model::Envelope;
use crate::{AppState, Error};

/// Heartbeat envelope after this much subscriber silence
const HEARTBEAT_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub call_id: String,
}

/// `GET /api/realtime/stream?call_id=...` - long-lived envelope stream.
/// Emits one `data:` line of compact JSON per envelope and an SSE comment
/// keep-alive to defeat proxy buffering. Dropping the connection releases
/// the subscription.
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Error> {
    let call_id = params.call_id.trim().to_string();
    if call_id.is_empty() {
        return Err(Error::InvalidRequest("Missing call_id".to_string()));
    }

    let receiver = state.bus.subscribe(&call_id);
    info!(call_id = %call_id, "realtime stream connected");

    let connected = Envelope::Connected {
        call_id: Some(call_id.clone()),
        timestamp: Utc::now(),
    }
    .to_json();

    let live = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match tokio::time::timeout(HEARTBEAT_AFTER, receiver.recv()).await {
                Ok(Ok(payload)) => {
                    return Some((Ok(Event::default().data(payload)), receiver));
                }
                // Oldest pending messages were dropped for this subscriber;
                // keep delivering the retained tail in order.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                Err(_silence) => {
                    let heartbeat = Envelope::Heartbeat {
                        timestamp: Utc::now(),
                    }
                    .to_json();
                    return Some((Ok(Event::default().data(heartbeat)), receiver));
                }
            }
        }
    });

    let events = stream::once(async move { Ok(Event::default().data(connected)) }).chain(live);

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}
