//! The `/events` server-sent-event stream: one JSON event per recorded
//! trace. Client disconnect drops the stream, which unsubscribes from the
//! collector on its own.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::{Stream, StreamExt};
use serde_json::json;

use super::format::{format_duration, format_time, status_class};
use super::DashboardState;

pub(crate) async fn events(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state.collector.subscribe_live().map(|trace| {
        let payload = json!({
            "id": trace.id,
            "method": trace.method,
            "path": trace.path,
            "status": trace.response_status,
            "latency": trace.latency.as_millis() as u64,
            "latencyFmt": format_duration(trace.latency),
            "dbQueries": trace.db_queries.len(),
            "timestamp": format_time(trace.started_at),
            "statusClass": status_class(trace.response_status),
        });
        Ok::<Event, Infallible>(Event::default().data(payload.to_string()))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
