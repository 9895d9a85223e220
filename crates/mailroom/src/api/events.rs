//! Live events, health and queue statistics.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use mailroom_core::pipeline::{RECEIVE_TOPIC, SEND_TOPIC};
use mailroom_core::{MailEvent, MailEventKind, UserId};
use mailroom_queue::{TopicStats, dead_letter_topic, retry_topic};
use serde_json::{Value, json};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::AppState;
use super::error::ApiResult;
use super::extract::Authenticated;

/// Liveness plus a cheap round trip to the topic log.
pub(super) async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.broker.topics().await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

/// End offsets and group lag of both topics and their retry and
/// dead-letter twins.
pub(super) async fn queue_stats(
    State(state): State<AppState>,
    Authenticated(_): Authenticated,
) -> ApiResult<Json<Vec<TopicStats>>> {
    let mut stats = Vec::with_capacity(6);
    for topic in [SEND_TOPIC, RECEIVE_TOPIC] {
        stats.push(state.broker.topic_stats(topic).await?);
        stats.push(state.broker.topic_stats(&retry_topic(topic)).await?);
        stats.push(state.broker.topic_stats(&dead_letter_topic(topic)).await?);
    }
    Ok(Json(stats))
}

/// The caller's mailbox events as server-sent events.
pub(super) async fn stream(
    State(state): State<AppState>,
    Authenticated(p): Authenticated,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let user = p.user.id;
    debug!(user_id = %user, "event stream opened");
    let events = futures::stream::unfold(state.notifier.subscribe(), move |mut rx| async move {
        next_event(&mut rx, user).await.map(|event| (event, rx))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn next_event(
    rx: &mut Receiver<MailEvent>,
    user: UserId,
) -> Option<Result<Event, axum::Error>> {
    loop {
        match rx.recv().await {
            Ok(event) if event.user_id == user => {
                return Some(Event::default().event(event_name(event.kind)).json_data(&event));
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                // The client should refetch; say how much it missed.
                warn!(user_id = %user, skipped, "event stream lagged");
                return Some(Ok(Event::default()
                    .event("lagged")
                    .data(skipped.to_string())));
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

const fn event_name(kind: MailEventKind) -> &'static str {
    match kind {
        MailEventKind::NewMail => "new_mail",
        MailEventKind::StatusChanged => "status_changed",
    }
}
