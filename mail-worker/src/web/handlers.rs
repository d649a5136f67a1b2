//! HTTP endpoint handlers.
//!
//! The notification endpoint publishes through the retrying publisher but
//! never fails because of it: a publish failure is logged and reported as
//! `queued: false` with a 200 status.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue::{NotificationMessage, SharedPublisher};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub publisher: SharedPublisher,
}

impl AppState {
    pub fn new(config: Config, publisher: SharedPublisher) -> Self {
        Self {
            config: Arc::new(config),
            publisher,
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification trigger payload.
#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    #[serde(default, rename = "clientId")]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct NotifyResponse {
    pub ok: bool,
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

/// Notification endpoint.
///
/// This endpoint:
/// 1. Requires a non-empty `email`
/// 2. Skips publishing when emails are disabled
/// 3. Publishes with retries, reporting but not failing on error
///
/// The response is sent only after the publish settles. With the broker
/// down that is the whole retry chain: up to `PUBLISH_MAX_RETRIES + 1`
/// attempts, each bounded by `BROKER_CONNECT_TIMEOUT_MS` plus
/// `PUBLISH_CONFIRM_TIMEOUT_MS`, with the publish backoff in between
/// (about 80s with the defaults). Lower those settings for callers with
/// tighter HTTP timeouts.
pub async fn notify(
    State(state): State<AppState>,
    Json(request): Json<NotifyRequest>,
) -> (StatusCode, Json<NotifyResponse>) {
    let email = request.email.trim();
    if email.is_empty() {
        warn!("notify_missing_email");
        return (
            StatusCode::BAD_REQUEST,
            Json(NotifyResponse {
                ok: false,
                queued: false,
                error: Some("email is required"),
            }),
        );
    }

    if !state.config.enable_emails {
        info!(email = %email, "notify_emails_disabled");
        return (
            StatusCode::OK,
            Json(NotifyResponse {
                ok: true,
                queued: false,
                error: None,
            }),
        );
    }

    let mut message = NotificationMessage::new(
        email,
        request.subject.unwrap_or_default(),
        request.body.unwrap_or_default(),
    );
    message.client_id = request.client_id;
    message.name = request.name;

    let queued = state.publisher.publish_or_report(&message).await;

    info!(email = %email, queued = queued, "notify_handled");

    (
        StatusCode::OK,
        Json(NotifyResponse {
            ok: true,
            queued,
            error: None,
        }),
    )
}
