//! HTTP route handlers.
//!
//! Every handler answers with the same envelope. Failures carry the error's
//! `kind` so clients can branch without parsing messages.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, rejection::JsonRejection, Multipart, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use zx16_core::{RunMode, SessionId, SimError};

use super::SharedState;

/// Response envelope for every route.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

type Reply = (StatusCode, Json<ApiResponse>);

/// Request body for `/step` and `/stop`.
#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: SessionId,
}

fn ok<T: Serialize>(data: T) -> Reply {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or_default()),
            error: None,
            kind: None,
        }),
    )
}

fn fail(err: SimError) -> Reply {
    (
        status_for(&err),
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(err.public_message()),
            kind: Some(err.kind().to_string()),
        }),
    )
}

/// Map an error kind onto an HTTP status.
pub fn status_for(err: &SimError) -> StatusCode {
    match err {
        SimError::Validation(_) => StatusCode::BAD_REQUEST,
        SimError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
        SimError::NotFound(_) => StatusCode::NOT_FOUND,
        SimError::ProcessTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SimError::Cancelled(_) => StatusCode::CONFLICT,
        SimError::ProcessSpawn(_)
        | SimError::ProcessCrash { .. }
        | SimError::Io(_)
        | SimError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler for GET /health
pub async fn health(State(state): State<Arc<SharedState>>) -> Reply {
    ok(state.supervisor.capability())
}

/// Handler for POST /build
///
/// The compiler runs on the blocking pool.
pub async fn build(State(state): State<Arc<SharedState>>) -> Reply {
    let supervisor = Arc::clone(&state.supervisor);
    match tokio::task::spawn_blocking(move || supervisor.build()).await {
        Ok(Ok(message)) => ok(serde_json::json!({ "message": message })),
        Ok(Err(err)) => fail(err),
        Err(err) => fail(SimError::Io(format!("Build task failed: {}", err))),
    }
}

/// Handler for POST /simulate
///
/// Multipart fields: `binfile` (the image) and optional `mode`
/// (`full` or `step`, default `full`).
pub async fn simulate(State(state): State<Arc<SharedState>>, multipart: Multipart) -> Reply {
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(err) => return fail(err),
    };
    log::debug!(
        "HTTP simulate: {} ({} bytes, {:?})",
        upload.file_name,
        upload.bytes.len(),
        upload.mode
    );

    match state
        .supervisor
        .simulate(&upload.file_name, &upload.bytes, upload.mode)
        .await
    {
        Ok(outcome) => ok(outcome),
        Err(err) => fail(err),
    }
}

/// Handler for POST /step
pub async fn step(
    State(state): State<Arc<SharedState>>,
    request: Result<Json<SessionRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return fail(SimError::Validation(rejection.body_text())),
    };

    match state.supervisor.next_step(&request.session_id).await {
        Ok(result) => ok(result),
        Err(err) => fail(err),
    }
}

/// Handler for POST /stop
pub async fn stop(
    State(state): State<Arc<SharedState>>,
    request: Result<Json<SessionRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return fail(SimError::Validation(rejection.body_text())),
    };

    ok(state.supervisor.stop(&request.session_id).await)
}

#[derive(Debug)]
struct Upload {
    file_name: String,
    bytes: Vec<u8>,
    mode: RunMode,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, SimError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut mode = RunMode::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("binfile") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                file = Some((name, bytes.to_vec()));
            }
            Some("mode") => {
                mode = field.text().await.map_err(multipart_error)?.parse()?;
            }
            _ => {}
        }
    }

    let (file_name, bytes) =
        file.ok_or_else(|| SimError::Validation("No file uploaded".to_string()))?;
    Ok(Upload {
        file_name,
        bytes,
        mode,
    })
}

fn multipart_error(err: MultipartError) -> SimError {
    SimError::Validation(format!("Malformed upload: {}", err.body_text()))
}

// ============================================================================
// TESTS
// ============================================================================
