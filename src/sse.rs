//! Project-scoped server-sent events.
//!
//! One stream per project: engine events are filtered through the
//! issue → project cache on a dedicated forwarder task, so slow lookups
//! never run on the publisher. A failed write ends the forwarder, which
//! is also how client disconnects are detected.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::api::{ApiError, SharedState};
use crate::events::EngineEvent;

/// Cadence of the named heartbeat event.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Outbound buffer per connection; a client that stops reading for this
/// many events gets disconnected.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsParams {
    /// Project id or human alias.
    pub project_id: String,
}

pub async fn events_handler(
    State(state): State<SharedState>,
    Query(params): Query<EventsParams>,
) -> Result<Response, ApiError> {
    let id_or_alias = params.project_id.clone();
    let project = state
        .db
        .call(move |db| db.resolve_project(&id_or_alias))
        .await?
        .ok_or_else(|| ApiError::not_found("project not found"))?;

    let rx = state.bus.subscribe();
    let (tx, out) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(OUTBOUND_BUFFER);
    tokio::spawn(forward_events(state.clone(), project.id.clone(), rx, tx));

    let mut response = Sse::new(ReceiverStream::new(out)).into_response();
    // Proxies must not buffer the stream.
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    Ok(response)
}

/// Filter and forward engine events for one subscriber, interleaving the
/// heartbeat. Ends when the client goes away or the bus closes.
async fn forward_events(
    state: SharedState,
    project_id: String,
    mut rx: broadcast::Receiver<EngineEvent>,
    tx: tokio::sync::mpsc::Sender<Result<Event, Infallible>>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick fires immediately; consume it so the first heartbeat
    // arrives one interval in.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let event = Event::default().event("heartbeat").data("{}");
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            received = rx.recv() => match received {
                Ok(engine_event) => {
                    let matches = state
                        .project_cache
                        .event_matches_project(&engine_event, &project_id, &state.db)
                        .await;
                    if !matches {
                        continue;
                    }
                    let data = match serde_json::to_string(&engine_event) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!(error = %e, "failed to serialize event for sse");
                            continue;
                        }
                    };
                    let event = Event::default()
                        .event(engine_event.sse_event_name())
                        .data(data);
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "sse subscriber lagged; events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(project_id = %project_id, "sse forwarder stopped");
}
