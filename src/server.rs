//! HTTP control surface.
//!
//! Thin JSON layer over [`Controller`]: every handler maps one request onto
//! one controller operation. Mutating endpoints answer `200` with an empty
//! body; failures answer `{"error": "..."}` with 400 (bad request, task busy,
//! invalid settings), 404 (unknown task) or 500.

use crate::controller::Controller;
use crate::error::ForgeError;
use crate::store::SubjectConfig;
use axum::{
    extract::{Json as ExtractJson, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::info;

type ApiResult<T> = Result<T, ApiError>;

/// Error response body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<ForgeError> for ApiError {
    fn from(e: ForgeError) -> Self {
        let status = match &e {
            ForgeError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            ForgeError::TaskBusy(_) | ForgeError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileIdBody {
    file_id: Option<String>,
}

impl FileIdBody {
    fn require(self) -> ApiResult<String> {
        self.file_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::bad_request("fileId required"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReorderBody {
    ordered_ids: Option<Vec<String>>,
}

/// Build the router over a controller.
pub fn router(controller: Controller) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/config", get(config))
        .route("/api/config/defaults", get(defaults))
        .route("/api/config/settings", post(update_settings))
        .route("/api/config/subjects", post(replace_subjects))
        .route("/api/control/start", post(start))
        .route("/api/control/stop", post(stop))
        .route("/api/control/clear", post(clear))
        .route("/api/control/reset-limit", post(reset_limit))
        .route("/api/control/process-single", post(process_single))
        .route("/api/queue/reorder", post(reorder))
        .route("/api/queue/redo", post(redo))
        .with_state(controller)
        .layer(CorsLayer::permissive())
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(controller: Controller, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("NoteForge server running on http://{addr}");
    axum::serve(listener, router(controller)).await
}

async fn status(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.status())
}

async fn config(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.config())
}

async fn defaults(State(c): State<Controller>) -> impl IntoResponse {
    Json(c.default_prompts())
}

async fn update_settings(
    State(c): State<Controller>,
    ExtractJson(patch): ExtractJson<Value>,
) -> ApiResult<StatusCode> {
    if !patch.is_object() {
        return Err(ApiError::bad_request("settings object required"));
    }
    c.update_settings(&patch)?;
    Ok(StatusCode::OK)
}

async fn replace_subjects(
    State(c): State<Controller>,
    ExtractJson(body): ExtractJson<Value>,
) -> ApiResult<StatusCode> {
    let incoming: Vec<SubjectConfig> = match body {
        Value::Array(_) => serde_json::from_value(body)
            .map_err(|e| ApiError::bad_request(format!("invalid subject list: {e}")))?,
        _ => Vec::new(),
    };
    c.replace_subjects(incoming)?;
    Ok(StatusCode::OK)
}

async fn start(State(c): State<Controller>) -> StatusCode {
    c.start();
    StatusCode::OK
}

async fn stop(State(c): State<Controller>) -> StatusCode {
    c.stop();
    StatusCode::OK
}

async fn clear(State(c): State<Controller>) -> StatusCode {
    c.clear_history();
    StatusCode::OK
}

async fn reset_limit(State(c): State<Controller>) -> StatusCode {
    c.reset_quota();
    StatusCode::OK
}

async fn process_single(
    State(c): State<Controller>,
    ExtractJson(body): ExtractJson<FileIdBody>,
) -> ApiResult<StatusCode> {
    c.process_single(&body.require()?)?;
    Ok(StatusCode::OK)
}

async fn reorder(
    State(c): State<Controller>,
    ExtractJson(body): ExtractJson<ReorderBody>,
) -> ApiResult<StatusCode> {
    let ids = body
        .ordered_ids
        .ok_or_else(|| ApiError::bad_request("orderedIds required"))?;
    c.reorder(&ids);
    Ok(StatusCode::OK)
}

async fn redo(
    State(c): State<Controller>,
    ExtractJson(body): ExtractJson<FileIdBody>,
) -> ApiResult<StatusCode> {
    c.redo(&body.require()?)?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses() {
        let e: ApiError = ForgeError::TaskNotFound("x".into()).into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        let e: ApiError = ForgeError::TaskBusy("a.pdf".into()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        let e: ApiError = ForgeError::Internal("boom".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn file_id_is_required() {
        let body: FileIdBody = serde_json::from_str("{}").unwrap();
        assert_eq!(body.require().unwrap_err().status, StatusCode::BAD_REQUEST);
        let body: FileIdBody = serde_json::from_str(r#"{"fileId":"abc"}"#).unwrap();
        assert_eq!(body.require().unwrap(), "abc");
    }

    #[test]
    fn reorder_body_accepts_camel_case() {
        let body: ReorderBody = serde_json::from_str(r#"{"orderedIds":["a","b"]}"#).unwrap();
        assert_eq!(body.ordered_ids.unwrap(), vec!["a", "b"]);
    }
}
