//! Streaming gateway: `GET /stream/{*path}?workflowId=`.
//!
//! Maps one client connection onto one event bus subscription and writes
//! each [`StateEvent`] as a server-sent event:
//!
//! ```text
//! id: <sequenceNumber>
//! event: state | output
//! data: <StateEvent JSON>
//! ```
//!
//! The response ends once the terminal event has been written. A client
//! that drops the connection drops the subscription with it. Reconnecting
//! clients resume from `Last-Event-ID + 1` (or `fromSequence`), so nothing
//! is redelivered and nothing produced during the gap is skipped.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tumbler_core::error::CoreError;
use tumbler_core::state::StateEvent;
use tumbler_core::types::SequenceNumber;

use crate::error::{AppError, AppResult};
use crate::query::{parse_job_path, parse_workflow_id, StreamParams};
use crate::state::AppState;

/// Header an `EventSource` sends on reconnect.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// Comment text of keep-alive frames.
const KEEP_ALIVE_TEXT: &str = "ping";

/// GET /stream/{*path}?workflowId=&fromSequence=
pub async fn stream_job(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let job_path = parse_job_path(&raw)?;
    let workflow_id = params
        .workflow_id
        .as_deref()
        .ok_or_else(|| AppError::BadRequest("workflowId is required".into()))
        .and_then(parse_workflow_id)?;
    let from = resume_cursor(&headers, params.from_sequence)?;

    // Path is validated against the execution, not trusted from the client.
    let handle = state.tracker.store().handle(&workflow_id).await?;
    if handle.job_path() != &job_path {
        return Err(CoreError::not_found("Execution", workflow_id).into());
    }

    let subscription = state.tracker.bus().subscribe(workflow_id, from)?;
    tracing::debug!(%workflow_id, path = %job_path, from, "Stream opened");

    let events = subscription.map(|event| to_sse(&event));
    let keep_alive = KeepAlive::new()
        .interval(Duration::from_secs(state.config.stream_keep_alive_secs))
        .text(KEEP_ALIVE_TEXT);

    Ok(Sse::new(events).keep_alive(keep_alive))
}

/// Wire form of one event.
pub fn to_sse(event: &StateEvent) -> Result<Event, axum::Error> {
    Event::default()
        .id(event.sequence_number.to_string())
        .event(event.kind())
        .json_data(event)
}

/// First sequence number to send. `Last-Event-ID` wins over the query
/// parameter since browsers replay the original URL on reconnect.
fn resume_cursor(
    headers: &HeaderMap,
    from_sequence: Option<SequenceNumber>,
) -> AppResult<SequenceNumber> {
    match headers.get(&LAST_EVENT_ID) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<SequenceNumber>().ok())
            .map(|last_seen| last_seen.saturating_add(1))
            .ok_or_else(|| AppError::BadRequest("Invalid Last-Event-ID header".into())),
        None => Ok(from_sequence.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn cursor_defaults_to_start() {
        assert_eq!(resume_cursor(&HeaderMap::new(), None).unwrap(), 0);
        assert_eq!(resume_cursor(&HeaderMap::new(), Some(4)).unwrap(), 4);
    }

    #[test]
    fn last_event_id_resumes_after_last_seen() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("3"));
        assert_eq!(resume_cursor(&headers, Some(0)).unwrap(), 4);
    }

    #[test]
    fn malformed_last_event_id_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("three"));
        assert_matches!(
            resume_cursor(&headers, None),
            Err(AppError::BadRequest(_))
        );
    }
}
