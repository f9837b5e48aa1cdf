//! REST handlers. Each one resolves the instance by name through the
//! manager and maps `InstanceError` to an HTTP status via `ApiError`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use wagate_core::protocol::SendReceipt;
use wagate_engine::{looks_like_audio, ConfigPatch, InstanceSnapshot, MediaMessage, QrReport, StatusReport};
use wagate_telemetry::{LogQuery, LogRecord};

use crate::auth::authorize_instance;
use crate::error::ApiError;
use crate::server::AppState;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateInstance {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebhookUpdate {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendTextRequest {
    pub number: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SendMediaRequest {
    pub number: String,
    /// Standard base64.
    pub media: String,
    pub mimetype: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendResponse {
    pub message_id: String,
    pub timestamp: String,
}

impl From<SendReceipt> for SendResponse {
    fn from(receipt: SendReceipt) -> Self {
        Self {
            message_id: receipt.message_id,
            timestamp: receipt.timestamp.to_rfc3339(),
        }
    }
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "instances": state.manager.list().len() }))
}

pub(crate) async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceSnapshot>> {
    Json(state.manager.list())
}

pub(crate) async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstance>,
) -> ApiResult<(StatusCode, Json<InstanceSnapshot>)> {
    let snapshot = state.manager.create(body.name.trim())?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub(crate) async fn get_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    Ok(Json(state.manager.snapshot(&name)?))
}

pub(crate) async fn delete_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.remove(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn instance_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.manager.status(&name)?))
}

pub(crate) async fn connect_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    Ok(Json(state.manager.connect(&name).await?))
}

pub(crate) async fn disconnect_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<InstanceSnapshot>> {
    Ok(Json(state.manager.disconnect(&name).await?))
}

pub(crate) async fn update_webhook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<WebhookUpdate>,
) -> ApiResult<Json<InstanceSnapshot>> {
    Ok(Json(state.manager.update_webhook(&name, body.webhook_url.as_deref())?))
}

pub(crate) async fn update_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<Json<InstanceSnapshot>> {
    Ok(Json(state.manager.update_config(&name, patch)?))
}

pub(crate) async fn rotate_api_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let api_key = state.manager.regenerate_api_key(&name)?;
    info!(instance = %name, "api key rotated");
    Ok(Json(json!({ "api_key": api_key })))
}

pub(crate) async fn qrcode(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<QrReport>> {
    Ok(Json(state.manager.qr(&name)?))
}

pub(crate) async fn send_text(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendTextRequest>,
) -> ApiResult<Json<SendResponse>> {
    let instance = authorize_instance(&state, &name, &headers)?;
    if body.number.trim().is_empty() || body.message.is_empty() {
        return Err(ApiError::BadRequest("number and message are required".into()));
    }
    let receipt = instance.send_text(&body.number, body.message).await?;
    Ok(Json(receipt.into()))
}

pub(crate) async fn send_media(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMediaRequest>,
) -> ApiResult<Json<SendResponse>> {
    let instance = authorize_instance(&state, &name, &headers)?;
    if body.number.trim().is_empty() || body.mimetype.is_empty() {
        return Err(ApiError::BadRequest("number and mimetype are required".into()));
    }
    let data = STANDARD
        .decode(body.media.trim())
        .map_err(|e| ApiError::BadRequest(format!("media is not valid base64: {e}")))?;
    let is_audio = looks_like_audio(body.kind.as_deref(), &body.mimetype, body.filename.as_deref());
    let media = MediaMessage {
        data: Bytes::from(data),
        mime_type: body.mimetype,
        filename: body.filename,
        caption: body.caption,
        is_audio,
    };
    let receipt = instance.send_media(&body.number, media).await?;
    Ok(Json(receipt.into()))
}

/// Persisted warn+ logs; empty when persistence is disabled.
pub(crate) async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<LogRecord>>> {
    let Some(sink) = &state.logs else {
        return Ok(Json(Vec::new()));
    };
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(records))
}
