//! Intake hand-off
//!
//! Once a session's assembled content matches its declared digest, the
//! verified files are handed to the downstream intake, which owns them from
//! then on. `IntakeHandoff` is the seam; `DirectoryIntake` is the
//! filesystem-backed implementation used by the server.

use std::path::PathBuf;

use serde_json::Value;

use crate::upload::SessionKey;

/// Written by the downstream consumer once ingestion is done
pub const COMPLETE_MARKER: &str = "complete";

/// Key bundle forwarded alongside the chunks
pub const KEYS_FILE: &str = "cles.json";

/// A session that passed whole-file verification
#[derive(Debug, Clone)]
pub struct VerifiedUpload {
    pub key: SessionKey,

    /// Session directory holding the `.part` files and manifests
    pub directory: PathBuf,

    /// Assembled size in bytes
    pub size: u64,

    /// Optional decryption-key bundle from the finalize body
    pub keys: Option<Value>,
}

/// Where an upload stands in the intake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeState {
    Absent,
    Processing,
    Complete,
}

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("upload already in intake: {0}")]
    AlreadyPresent(String),

    #[error("intake rejected upload: {0}")]
    Rejected(String),

    #[error("intake I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Downstream ingestion contract
#[async_trait::async_trait]
pub trait IntakeHandoff: Send + Sync {
    /// Take ownership of a verified session. Called exactly once per session.
    async fn add_upload(&self, upload: VerifiedUpload) -> Result<(), HandoffError>;

    /// Report whether the intake holds this content
    async fn state(&self, key: &SessionKey) -> IntakeState;
}

// ============================================================================
// Directory Intake
// ============================================================================

/// Moves verified sessions under `{root}/{tenant}/{content_id}`
pub struct DirectoryIntake {
    root: PathBuf,
}

impl DirectoryIntake {
    pub async fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.tenant()).join(key.content_id())
    }
}

#[async_trait::async_trait]
impl IntakeHandoff for DirectoryIntake {
    async fn add_upload(&self, upload: VerifiedUpload) -> Result<(), HandoffError> {
        let target = self.path_for(&upload.key);
        if tokio::fs::try_exists(&target).await? {
            return Err(HandoffError::AlreadyPresent(upload.key.to_string()));
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&upload.directory, &target).await?;

        if let Some(keys) = &upload.keys {
            let contents = serde_json::to_vec(keys)
                .map_err(|e| HandoffError::Rejected(format!("unserializable key bundle: {}", e)))?;
            tokio::fs::write(target.join(KEYS_FILE), contents).await?;
        }

        tracing::info!(
            session = %upload.key,
            size = upload.size,
            path = %target.display(),
            "Upload handed off to intake"
        );

        Ok(())
    }

    async fn state(&self, key: &SessionKey) -> IntakeState {
        let path = self.path_for(key);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            IntakeState::Absent
        } else if tokio::fs::try_exists(path.join(COMPLETE_MARKER)).await.unwrap_or(false) {
            IntakeState::Complete
        } else {
            IntakeState::Processing
        }
    }
}
