//! Live job output over Server-Sent Events.
//!
//! Each decoded delta travels as one `data:` line with newlines and
//! backslashes escaped, so multi-line agent output survives the SSE framing
//! byte-for-byte. The stream ends with a `[DONE]` sentinel; idle periods are
//! covered by heartbeat comments.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;

use crate::broker::{Polled, StreamUpdate, Subscription};
use crate::server::api::{ApiError, SharedState};

const DONE_SENTINEL: &str = "[DONE]";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Escape a delta for single-line SSE transport. Backslashes first, so the
/// escaping round-trips exactly.
pub fn escape_payload(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Inverse of `escape_payload`.
pub fn decode_payload(payload: &str) -> String {
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn event_stream(
    subscription: Subscription,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(Some(subscription), move |state| async move {
        let mut subscription = state?;
        match subscription.recv_or_idle(heartbeat).await {
            Polled::Update(StreamUpdate::Delta(text)) => {
                let event = Event::default().data(escape_payload(&text));
                Some((Ok(event), Some(subscription)))
            }
            // Broker closed (or torn down): emit the sentinel and stop.
            Polled::Update(StreamUpdate::Done) => {
                Some((Ok(Event::default().data(DONE_SENTINEL)), None))
            }
            Polled::Idle => Some((Ok(Event::default().comment("heartbeat")), Some(subscription))),
        }
    })
}

pub async fn stream_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job_id = uuid::Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", id)))?;
    let broker = state
        .streams
        .get(job_id)
        .ok_or_else(|| ApiError::NotFound(format!("no such job: {}", job_id)))?;

    let stream = event_stream(broker.subscribe(), HEARTBEAT_INTERVAL);
    Ok(Sse::new(stream))
}
