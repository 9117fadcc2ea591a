//! Upload Routes
//!
//! HTTP endpoints for the resumable chunk protocol.
//!
//! Endpoints:
//! - GET /fichiers/job/:id - Where to resume, or whether the upload is done
//! - PUT /fichiers/:id/:position - Upload one chunk at a byte offset
//! - POST /fichiers/:id - Finalize: verify the assembled file and hand it off
//! - DELETE /fichiers/:id - Abort an unfinalized session

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;

use crate::auth::Tenant;
use crate::handoff::IntakeState;
use crate::state::AppState;
use crate::upload::{
    ChunkStatus, FinalizeRequest, FinalizeState, PutOutcome, SessionKey, StatusResponse,
    UploadError,
};

/// Optional per-chunk digest header
pub const CONTENT_HASH_HEADER: &str = "x-content-hash";

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let error = if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
            "Internal error".to_string()
        } else if status == StatusCode::FAILED_DEPENDENCY {
            tracing::info!(error = %self, "Upload rejected");
            "Verification failed".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorResponse {
            error,
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

#[derive(Serialize)]
struct AckResponse {
    ok: bool,
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/job/:content_id", get(upload_status))
        .route("/:content_id/:position", put(put_chunk))
        .route("/:content_id", post(finalize).delete(abort))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /fichiers/job/:content_id
///
/// The intake is consulted first: a handed-off upload reports processing or
/// complete. Otherwise the staged chunks give the resume offset.
async fn upload_status(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_id): Path<String>,
) -> Result<Json<StatusResponse>, UploadError> {
    let key = SessionKey::new(tenant, content_id)?;

    match state.intake().state(&key).await {
        IntakeState::Complete => {
            return Ok(Json(StatusResponse {
                complet: true,
                position: None,
                en_traitement: None,
            }));
        }
        IntakeState::Processing => {
            return Ok(Json(StatusResponse {
                complet: false,
                position: None,
                en_traitement: Some(true),
            }));
        }
        IntakeState::Absent => {}
    }

    let response = match state.chunk_store().status(&key).await {
        ChunkStatus::Absent => return Err(UploadError::SessionNotFound(key.to_string())),
        ChunkStatus::InFlight { next_offset } => StatusResponse {
            complet: false,
            position: Some(next_offset),
            en_traitement: None,
        },
        ChunkStatus::AwaitingFinalize => StatusResponse {
            complet: false,
            position: None,
            en_traitement: Some(true),
        },
    };

    Ok(Json(response))
}

/// PUT /fichiers/:content_id/:position
///
/// The raw request body is the chunk, streamed straight to disk.
async fn put_chunk(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path((content_id, position)): Path<(String, u64)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<AckResponse>, UploadError> {
    let key = SessionKey::new(tenant, content_id)?;

    let expected_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let content_hash = headers
        .get(CONTENT_HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let stream = body.into_data_stream().map_err(std::io::Error::other);

    match state
        .chunk_store()
        .put_chunk(&key, position, expected_length, content_hash, stream)
        .await?
    {
        PutOutcome::Accepted => Ok(Json(AckResponse { ok: true })),
        PutOutcome::Rejected(reason) => Err(UploadError::ChunkRejected { position, reason }),
    }
}

/// POST /fichiers/:content_id
///
/// - 202: verified and handed off
/// - 201: still verifying, poll the status endpoint
/// - 424: verification failed, the session was purged
async fn finalize(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_id): Path<String>,
    body: Bytes,
) -> Result<Response, UploadError> {
    let key = SessionKey::new(tenant, content_id)?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        FinalizeRequest::for_content_id(key.content_id())
    } else {
        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| UploadError::InvalidBody(e.to_string()))?;
        FinalizeRequest::from_json(value)?
    };

    tracing::info!(session = %key, hash = %request.state.hachage, "Finalize requested");

    let response = match state.coordinator().finalize(&key, request).await? {
        FinalizeState::Verified => (StatusCode::ACCEPTED, Json(AckResponse { ok: true })).into_response(),
        FinalizeState::InProgressTimedOut | FinalizeState::AwaitingVerification => {
            (StatusCode::CREATED, Json(AckResponse { ok: true })).into_response()
        }
        FinalizeState::Failed(reason) => {
            tracing::info!(session = %key, reason = %reason, "Finalize failed");
            let body = Json(ErrorResponse {
                error: "Verification failed".to_string(),
                code: "INTEGRITY_ERROR".to_string(),
            });
            (StatusCode::FAILED_DEPENDENCY, body).into_response()
        }
    };

    Ok(response)
}

/// DELETE /fichiers/:content_id
async fn abort(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(content_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    let key = SessionKey::new(tenant, content_id)?;
    state.chunk_store().abort(&key).await?;

    tracing::info!(session = %key, "Upload aborted");
    Ok(StatusCode::NO_CONTENT)
}
