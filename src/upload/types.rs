//! Upload types for the resumable chunk protocol

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::hash::IntegrityError;
use crate::handoff::HandoffError;

// ============================================================================
// Constants
// ============================================================================

/// Suffix of a committed chunk file (`{position}.part`)
pub const PART_SUFFIX: &str = ".part";

/// Suffix of a chunk still being written (`{position}.part.work`)
pub const WORK_SUFFIX: &str = ".part.work";

/// Transaction manifest written at finalize time
pub const TRANSACTION_FILE: &str = "transaction.json";

/// State/metadata record written at finalize time
pub const STATE_FILE: &str = "etat.json";

/// Staging subdirectory holding in-progress sessions
pub const UPLOAD_DIR: &str = "upload";

/// Staging subdirectory holding handed-off sessions
pub const INTAKE_DIR: &str = "intake";

/// Read/write block size when streaming chunk files: 64KB
pub const IO_BLOCK_SIZE: usize = 64 * 1024;

/// Action recorded in the transaction manifest
pub const HANDOFF_ACTION: &str = "ajouterFichier";

// ============================================================================
// Session Identity
// ============================================================================

/// Identifies one upload session: the tenant from the bearer token plus the
/// content id from the URL. Both become path components on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    tenant: String,
    content_id: String,
}

impl SessionKey {
    pub fn new(tenant: impl Into<String>, content_id: impl Into<String>) -> Result<Self, UploadError> {
        let tenant = tenant.into();
        let content_id = content_id.into();
        validate_component(&tenant)?;
        validate_component(&content_id)?;
        Ok(Self { tenant, content_id })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.content_id)
    }
}

/// Reject anything that could escape the staging tree
pub fn validate_component(value: &str) -> Result<(), UploadError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(UploadError::InvalidIdentifier(value.to_string()))
    }
}

// ============================================================================
// Chunk Types
// ============================================================================

/// A committed chunk as seen by readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Starting byte offset in the assembled file
    pub position: u64,

    /// Length in bytes
    pub length: u64,
}

impl ChunkInfo {
    pub fn end(&self) -> u64 {
        self.position + self.length
    }

    pub fn file_name(&self) -> String {
        part_file_name(self.position)
    }
}

pub fn part_file_name(position: u64) -> String {
    format!("{}{}", position, PART_SUFFIX)
}

pub fn work_file_name(position: u64) -> String {
    format!("{}{}", position, WORK_SUFFIX)
}

/// Resume state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// No session directory
    Absent,
    /// Receiving chunks; the client resumes at `next_offset`
    InFlight { next_offset: u64 },
    /// Finalize was requested and verification has not finished
    AwaitingFinalize,
}

/// Result of a chunk PUT that did not hit an I/O error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Accepted,
    Rejected(ChunkRejection),
}

/// Why a chunk was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRejection {
    /// Per-chunk digest did not match; the whole session was purged
    HashMismatch,
    /// Written size differs from the declared length; only this chunk was dropped
    LengthMismatch { expected: u64, actual: u64 },
}

impl fmt::Display for ChunkRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatch => write!(f, "chunk hash mismatch"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "chunk length mismatch: expected {}, got {}", expected, actual)
            }
        }
    }
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Finalize state machine.
///
/// `AwaitingVerification` answers a finalize that found a job for the session
/// already queued or running. `InProgressTimedOut` is what a caller sees when
/// its own wait expired before the job finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeState {
    AwaitingVerification,
    Verified,
    Failed(String),
    InProgressTimedOut,
}

/// State/metadata record persisted as `etat.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    /// Expected digest of the assembled file
    pub hachage: String,

    /// Number of previous finalize attempts for this session
    #[serde(default)]
    pub retry_count: u32,

    /// Creation time, milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,

    /// Declared total size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taille: Option<u64>,

    /// Client metadata carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StateRecord {
    pub fn with_hash(hachage: impl Into<String>) -> Self {
        Self {
            hachage: hachage.into(),
            retry_count: 0,
            created: None,
            taille: None,
            extra: Map::new(),
        }
    }
}

/// Parsed finalize body
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeRequest {
    pub state: StateRecord,

    /// Optional decryption-key bundle forwarded to the intake
    pub keys: Option<Value>,
}

impl FinalizeRequest {
    /// Request synthesized when the client sends no body: the content id is
    /// the expected digest.
    pub fn for_content_id(content_id: &str) -> Self {
        Self {
            state: StateRecord::with_hash(content_id),
            keys: None,
        }
    }

    /// Accepts both `{"etat": {...}, "cles": {...}}` and a flat
    /// `{"hachage": ..., ...}` object.
    pub fn from_json(value: Value) -> Result<Self, UploadError> {
        let Value::Object(mut map) = value else {
            return Err(UploadError::InvalidBody("expected a JSON object".to_string()));
        };

        let keys = map.remove("cles").filter(|v| !v.is_null());
        let state = match map.remove("etat") {
            Some(etat) => etat,
            None => Value::Object(map),
        };

        let state: StateRecord = serde_json::from_value(state)
            .map_err(|e| UploadError::InvalidBody(e.to_string()))?;

        Ok(Self { state, keys })
    }
}

/// Transaction manifest persisted as `transaction.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionManifest {
    pub id: uuid::Uuid,
    pub tenant: String,
    pub content_id: String,
    pub action: String,
    pub hachage: String,
    pub created: i64,
}

/// Body of the resume-status response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub complet: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en_traitement: Option<bool>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Chunk rejected at position {position}: {reason}")]
    ChunkRejected { position: u64, reason: ChunkRejection },

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid finalize body: {0}")]
    InvalidBody(String),

    #[error("Verification in progress: {0}")]
    VerificationInProgress(String),

    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Hand-off failed: {0}")]
    Handoff(#[from] HandoffError),

    #[error("Verification cancelled by shutdown")]
    Cancelled,

    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::ChunkRejected { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidDigest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::VerificationInProgress(_) => StatusCode::CONFLICT,
            Self::Integrity(_) => StatusCode::FAILED_DEPENDENCY,
            Self::Handoff(_) => StatusCode::FAILED_DEPENDENCY,
            Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier(_) => "INVALID_IDENTIFIER",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ChunkRejected { reason: ChunkRejection::HashMismatch, .. } => "CHUNK_HASH_MISMATCH",
            Self::ChunkRejected { .. } => "CHUNK_LENGTH_MISMATCH",
            Self::InvalidDigest(_) => "INVALID_DIGEST",
            Self::InvalidBody(_) => "INVALID_BODY",
            Self::VerificationInProgress(_) => "VERIFICATION_IN_PROGRESS",
            Self::Integrity(_) => "INTEGRITY_ERROR",
            Self::Handoff(_) => "HANDOFF_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::InvariantViolation(_) => "INTERNAL_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}
