use crate::broadcaster::{Broadcaster, Feed, Subscriber};
use crate::ingest::{Route, WebhookIngestor};
use crate::parse::parse_payload;
use crate::types::{Delivery, WebhookEvent};
use crate::verification;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,

    #[error("signature mismatch")]
    InvalidSignature,

    #[error("malformed JSON body: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("verification token mismatch")]
    HandshakeRejected,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            WebhookError::MissingSignature
            | WebhookError::InvalidSignature
            | WebhookError::HandshakeRejected => StatusCode::FORBIDDEN,
            WebhookError::MalformedJson(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    app_secret: Vec<u8>,
    verify_token: String,
    keepalive: Duration,
    ingestor: Arc<WebhookIngestor>,
    broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(
        app_secret: impl Into<Vec<u8>>,
        verify_token: impl Into<String>,
        keepalive: Duration,
        ingestor: Arc<WebhookIngestor>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                app_secret: app_secret.into(),
                verify_token: verify_token.into(),
                keepalive,
                ingestor,
                broadcaster,
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/webhook_events", get(list_events))
        .route("/events", get(stream_events))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct Handshake {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn verify_webhook(
    State(state): State<AppState>,
    Query(query): Query<Handshake>,
) -> Result<String, WebhookError> {
    match verification::verify_subscription(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        &state.inner.verify_token,
    ) {
        Some(challenge) => {
            info!("webhook subscription verified");
            Ok(challenge.to_string())
        }
        None => {
            warn!(mode = ?query.mode, "webhook subscription rejected");
            Err(WebhookError::HandshakeRejected)
        }
    }
}

#[derive(Serialize)]
struct Receipt {
    success: bool,
    parsed_events: Vec<WebhookEvent>,
    routes: Vec<Route>,
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Receipt>, WebhookError> {
    let signature = headers
        .get(verification::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!("webhook delivery without signature");
            WebhookError::MissingSignature
        })?;
    if !verification::verify_signature(&state.inner.app_secret, &body, signature) {
        warn!("webhook signature verification failed");
        return Err(WebhookError::InvalidSignature);
    }

    debug!(body = %String::from_utf8_lossy(&body), "webhook delivery");
    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "webhook body is not valid JSON");
        WebhookError::MalformedJson(e)
    })?;

    let received_at = Utc::now();
    let parsed_events = parse_payload(&payload, received_at);
    let routes = state.inner.ingestor.ingest(&parsed_events);

    let entry = state.inner.broadcaster.publish(Delivery {
        timestamp: received_at,
        payload,
        parsed_events: parsed_events.clone(),
    });
    info!(seq = entry.seq, events = parsed_events.len(), "webhook delivery stored");

    Ok(Json(Receipt {
        success: true,
        parsed_events,
        routes,
    }))
}

async fn list_events(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "events": state.inner.broadcaster.snapshot() }))
}

async fn stream_events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = state.inner.broadcaster.subscribe();
    Sse::new(feed_stream(subscriber, state.inner.keepalive))
}

/// Turns a subscriber into SSE events. The subscriber is dropped, and so
/// deregistered, when the client goes away and axum drops the stream.
fn feed_stream(subscriber: Subscriber, idle: Duration) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscriber, move |mut subscriber| async move {
        let event = match subscriber.next(idle).await? {
            Feed::Entry(entry) => match Event::default().id(entry.seq.to_string()).json_data(&*entry) {
                Ok(event) => event,
                Err(e) => {
                    warn!(seq = entry.seq, error = %e, "could not encode event for stream");
                    Event::default().comment("skipped")
                }
            },
            Feed::Keepalive => Event::default().comment("keepalive"),
        };
        Some((Ok(event), subscriber))
    })
}
