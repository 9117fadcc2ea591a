//! Shared fixtures for upload tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::types::SessionKey;
use crate::handoff::{HandoffError, IntakeHandoff, IntakeState, VerifiedUpload};

/// Intake double that records hand-offs, optionally slowly or failing
#[derive(Default)]
pub struct RecordingIntake {
    pub uploads: Mutex<Vec<VerifiedUpload>>,
    pub delay: Option<Duration>,
    pub fail: bool,
}

impl RecordingIntake {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub async fn count(&self) -> usize {
        self.uploads.lock().await.len()
    }
}

#[async_trait::async_trait]
impl IntakeHandoff for RecordingIntake {
    async fn add_upload(&self, upload: VerifiedUpload) -> Result<(), HandoffError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(HandoffError::Rejected("intake offline".to_string()));
        }
        self.uploads.lock().await.push(upload);
        Ok(())
    }

    async fn state(&self, key: &SessionKey) -> IntakeState {
        let uploads = self.uploads.lock().await;
        if uploads.iter().any(|u| &u.key == key) {
            IntakeState::Processing
        } else {
            IntakeState::Absent
        }
    }
}

/// In-memory chunk body for `ChunkStore::put_chunk`
pub fn body(data: &[u8]) -> futures::stream::Iter<std::vec::IntoIter<std::io::Result<Vec<u8>>>> {
    let parts: Vec<std::io::Result<Vec<u8>>> = data.chunks(4096).map(|c| Ok(c.to_vec())).collect();
    futures::stream::iter(parts)
}
