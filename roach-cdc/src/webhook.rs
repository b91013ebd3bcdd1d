//! HTTP boundary of the webhook sink.
//!
//! The database posts change feed deliveries to `/{subscriber_id}`. A
//! payload delivery does not get a response until every payload is
//! buffered, so a full buffer slows down the sink, which is expected to
//! retry with backoff.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use actix_web::{
    delete, get,
    http::{header::ContentType, StatusCode},
    post,
    web::{Bytes, Data, Path, ServiceConfig},
    HttpResponse, ResponseError,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn, Level};

use crate::dispatcher::ChangeFeedDispatcher;
use crate::error::CdcError;
use crate::event::ChangeFeedEvent;
use crate::subscriber::SubscriberSnapshot;

/// Delivery counters of the webhook endpoint.
#[derive(Debug, Default)]
pub struct WebhookMetrics {
    received: AtomicU64,
    resolved: AtomicU64,
    published: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WebhookMetricsSnapshot {
    pub received: u64,
    pub resolved: u64,
    pub published: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl WebhookMetrics {
    fn increment(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WebhookMetricsSnapshot {
        WebhookMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Shared state of the webhook routes.
pub struct WebhookState {
    dispatcher: Arc<ChangeFeedDispatcher>,
    shutdown: CancellationToken,
    metrics: WebhookMetrics,
}

impl WebhookState {
    /// `shutdown` releases deliveries waiting for buffer capacity.
    pub fn new(dispatcher: Arc<ChangeFeedDispatcher>, shutdown: CancellationToken) -> Self {
        WebhookState {
            dispatcher,
            shutdown,
            metrics: WebhookMetrics::default(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ChangeFeedDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &WebhookMetrics {
        &self.metrics
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    pub error: String,
}

impl ResponseError for CdcError {
    fn status_code(&self) -> StatusCode {
        match self {
            CdcError::SubscriberNotFound(_) => StatusCode::NOT_FOUND,
            CdcError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
            CdcError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            CdcError::RegistrationConflict(_) => StatusCode::CONFLICT,
            CdcError::InvalidPollTimeout
            | CdcError::InvalidConfig(_)
            | CdcError::Checkpoint(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(ErrorMessage {
                error: self.to_string(),
            })
    }
}

#[derive(Debug, Serialize)]
pub struct ListSubscribersResponse {
    pub subscribers: Vec<SubscriberSnapshot>,
    pub metrics: WebhookMetricsSnapshot,
}

/// Registers the webhook routes.
pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(list_subscribers)
        .service(deliver_event)
        .service(read_subscriber)
        .service(delete_subscriber);
}

#[post("/{subscriber_id}")]
pub async fn deliver_event(
    state: Data<WebhookState>,
    subscriber_id: Path<String>,
    body: Bytes,
) -> Result<HttpResponse, CdcError> {
    let subscriber_id = subscriber_id.into_inner();
    let metrics = &state.metrics;

    if tracing::enabled!(Level::TRACE) {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
            trace!(
                subscriber_id = %subscriber_id,
                "Change event:\n{}",
                serde_json::to_string_pretty(&value).unwrap_or_default()
            );
        }
    }

    // Unknown subscribers are rejected before looking at the body, the sink
    // keeps retrying until the job registered.
    if state.dispatcher.get_subscriber(&subscriber_id).await.is_none() {
        WebhookMetrics::increment(&metrics.rejected);
        return Err(CdcError::SubscriberNotFound(subscriber_id));
    }
    WebhookMetrics::increment(&metrics.received);

    let event = ChangeFeedEvent::from_slice(&body).map_err(|err| {
        WebhookMetrics::increment(&metrics.failed);
        warn!(subscriber_id = %subscriber_id, error = %err, "Rejecting change event");
        err
    })?;

    let counter = if event.is_resolved() {
        &metrics.resolved
    } else {
        &metrics.published
    };
    WebhookMetrics::increment(counter);

    match state
        .dispatcher
        .dispatch(&subscriber_id, event, &state.shutdown)
        .await
    {
        Ok(()) => Ok(HttpResponse::Ok().finish()),
        Err(err @ CdcError::SubscriberNotFound(_)) => {
            WebhookMetrics::increment(&metrics.rejected);
            Err(err)
        }
        Err(err) => {
            WebhookMetrics::increment(&metrics.failed);
            Err(err)
        }
    }
}

#[get("/{subscriber_id}")]
pub async fn read_subscriber(
    state: Data<WebhookState>,
    subscriber_id: Path<String>,
) -> Result<HttpResponse, CdcError> {
    let subscriber_id = subscriber_id.into_inner();
    let snapshot = state
        .dispatcher
        .describe(&subscriber_id)
        .await
        .ok_or(CdcError::SubscriberNotFound(subscriber_id))?;
    Ok(HttpResponse::Ok().json(snapshot))
}

#[delete("/{subscriber_id}")]
pub async fn delete_subscriber(
    state: Data<WebhookState>,
    subscriber_id: Path<String>,
) -> Result<HttpResponse, CdcError> {
    let subscriber_id = subscriber_id.into_inner();
    if state.dispatcher.unregister(&subscriber_id).await {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(CdcError::SubscriberNotFound(subscriber_id))
    }
}

#[get("/")]
pub async fn list_subscribers(state: Data<WebhookState>) -> HttpResponse {
    HttpResponse::Ok().json(ListSubscribersResponse {
        subscribers: state.dispatcher.describe_all().await,
        metrics: state.metrics.snapshot(),
    })
}
