use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use retouch_core::error::LedgerError;
use retouch_core::types::{ApiResponse, TaskOutcome};

use crate::AppState;

/// The vendor may deliver a full-size result image in the callback body.
pub(crate) const WEBHOOK_BODY_LIMIT: usize = 50 * 1024 * 1024;

const RESULT_CAPTION: &str = "✨ Your image is ready!\n\
     To process another photo, tap 💫 Start processing.";
const UNDERAGE_TEXT: &str = "🔞 A person under 18 was detected on the image.\n\
     Processing such images is not allowed. 1 credit has been returned.";

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookQuery {
    #[serde(default)]
    id_gen: Option<String>,
}

/// The vendor's callback shape is its own concern and drifts between
/// structured status payloads and bare result fields, so every field is
/// optional and the verdict is derived from what is actually present.
#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    id_gen: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    img_message: Option<String>,
    #[serde(default)]
    img_message_2: Option<String>,
    #[serde(default)]
    result: Option<String>,
}

impl WebhookPayload {
    fn error_message(&self) -> Option<String> {
        if self.status.as_deref() == Some("500") {
            return Some(
                non_empty(self.img_message.as_deref())
                    .or_else(|| non_empty(self.img_message_2.as_deref()))
                    .unwrap_or("Unknown error")
                    .to_string(),
            );
        }
        non_empty(self.img_message.as_deref())
            .or_else(|| non_empty(self.img_message_2.as_deref()))
            .map(str::to_string)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Task ids are minted as `user_{user_id}_{unix_seconds}`; the owner is
/// recoverable from the id alone.
pub(crate) fn parse_task_user_id(task_id: &str) -> Option<i64> {
    let mut parts = task_id.split('_');
    if parts.next()? != "user" {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Inbound completion/error callback from the processing gateway. All ledger
/// effects go through the task lifecycle; this layer only parses, dispatches
/// and notifies. The vendor always gets an answer, and a late or duplicate
/// callback answers 200 so its retry loop stops.
pub(crate) async fn gateway_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<ApiResponse<Value>>) {
    info!("webhook received: body_bytes={}", body.len());

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("application/json"));

    let (task_id, outcome, image) = if is_json {
        let payload: WebhookPayload = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(err) => {
                warn!("webhook payload unparseable: err={}", err);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::err("invalid payload")),
                );
            }
        };

        let Some(task_id) = payload.id_gen.clone().or_else(|| query.id_gen.clone()) else {
            warn!("webhook carries no task id");
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::err("missing task id")),
            );
        };

        match payload.error_message() {
            Some(reason) => (task_id, TaskOutcome::Failure(reason), None),
            None => {
                let image = payload.result.as_deref().and_then(|encoded| {
                    base64::engine::general_purpose::STANDARD
                        .decode(encoded.trim())
                        .ok()
                });
                (task_id, TaskOutcome::Success, image)
            }
        }
    } else {
        // raw-bytes delivery: the body is the image, identity rides on the
        // query parameter the callback URL was registered with
        let Some(task_id) = query.id_gen.clone() else {
            warn!("raw webhook without id_gen query parameter");
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::err("missing task id")),
            );
        };
        (task_id, TaskOutcome::Success, Some(body.to_vec()))
    };

    let Some(user_id) = parse_task_user_id(&task_id) else {
        warn!("webhook task id unparseable: task_id={}", task_id);
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::err("unparseable task id")),
        );
    };

    match state.store.user_exists(user_id) {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                "webhook for unknown user: user_id={} task_id={}",
                user_id, task_id
            );
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::err("user not found")),
            );
        }
        Err(err) => {
            error!("webhook user lookup failed: err={}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("Database error")),
            );
        }
    }

    // A success callback with nothing to deliver settles nothing: the vendor
    // may retry with a usable payload, and the sweeper reclaims otherwise.
    let image = match (&outcome, image) {
        (TaskOutcome::Success, Some(bytes)) if !bytes.is_empty() => Some(bytes),
        (TaskOutcome::Success, _) => {
            error!(
                "webhook success without image data: user_id={} task_id={}",
                user_id, task_id
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("no image data in callback")),
            );
        }
        (TaskOutcome::Failure(_), _) => None,
    };

    match state.tasks.complete_task(user_id, Some(&task_id), &outcome) {
        Ok(()) => {}
        Err(LedgerError::UnknownTask) => {
            info!(
                "webhook for settled task ignored: user_id={} task_id={}",
                user_id, task_id
            );
            return (
                StatusCode::OK,
                Json(ApiResponse::ok(json!({ "status": "ignored" }))),
            );
        }
        Err(err) => {
            error!(
                "webhook settle failed: user_id={} task_id={} err={}",
                user_id, task_id, err
            );
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("Database error")),
            );
        }
    }

    match &outcome {
        TaskOutcome::Success => {
            if let Some(bytes) = image {
                if let Err(err) = state.notifier.send_photo(user_id, bytes, RESULT_CAPTION).await {
                    warn!(
                        "webhook result delivery failed: user_id={} task_id={} err={}",
                        user_id, task_id, err
                    );
                }
            }
        }
        TaskOutcome::Failure(reason) => {
            let text = if reason.contains("Age is too young") {
                UNDERAGE_TEXT.to_string()
            } else {
                format!("❌ Could not process the image:\n{reason}\n1 credit has been returned.")
            };
            if let Err(err) = state.notifier.send_text(user_id, &text).await {
                warn!(
                    "webhook failure notice undelivered: user_id={} task_id={} err={}",
                    user_id, task_id, err
                );
            }
        }
    }

    (
        StatusCode::OK,
        Json(ApiResponse::ok(json!({ "status": "success" }))),
    )
}
