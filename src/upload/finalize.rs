//! Finalize Coordinator
//!
//! Turns a finalize request into a verification job and waits a bounded time
//! for its outcome. The job keeps running after the wait expires; the client
//! polls the status endpoint to learn where it landed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::chunk_store::ChunkStore;
use super::queue::{VerificationJob, VerificationQueue};
use super::types::{
    FinalizeRequest, FinalizeState, SessionKey, StateRecord, TransactionManifest, UploadError,
    HANDOFF_ACTION, STATE_FILE, TRANSACTION_FILE,
};

#[derive(Clone)]
pub struct FinalizeCoordinator {
    inner: Arc<FinalizeInner>,
}

struct FinalizeInner {
    chunk_store: ChunkStore,
    queue: VerificationQueue,
    timeout: Duration,
}

impl FinalizeCoordinator {
    pub fn new(chunk_store: ChunkStore, queue: VerificationQueue, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(FinalizeInner {
                chunk_store,
                queue,
                timeout,
            }),
        }
    }

    /// Finalize a session.
    ///
    /// Returns `Verified` or `Failed` when the job finished within the
    /// deadline, `InProgressTimedOut` otherwise. `AwaitingVerification` when
    /// a job for the session is already queued or running. `Err` is reserved for
    /// requests that never produced a job and for shutdown.
    pub async fn finalize(
        &self,
        key: &SessionKey,
        request: FinalizeRequest,
    ) -> Result<FinalizeState, UploadError> {
        let store = &self.inner.chunk_store;

        if !store.begin_finalize(key).await? {
            tracing::debug!(session = %key, "Finalize already in progress");
            return Ok(FinalizeState::AwaitingVerification);
        }

        let handle = match self.submit(key, request).await {
            Ok(handle) => handle,
            Err(e) => {
                store.end_finalize(key).await;
                return Err(e);
            }
        };

        match handle.wait(self.inner.timeout).await {
            Some(Ok(())) => Ok(FinalizeState::Verified),
            Some(Err(UploadError::Cancelled)) => Err(UploadError::Cancelled),
            Some(Err(UploadError::InvariantViolation(message))) => {
                Err(UploadError::InvariantViolation(message))
            }
            Some(Err(e)) => {
                // Worker already purged; repeat in case it could not
                if let Err(purge_error) = store.purge_session(key).await {
                    tracing::error!(session = %key, error = %purge_error, "Failed to purge session");
                }
                Ok(FinalizeState::Failed(e.to_string()))
            }
            None => {
                tracing::info!(
                    session = %key,
                    timeout_secs = self.inner.timeout.as_secs(),
                    "Finalize still running after deadline"
                );
                Ok(FinalizeState::InProgressTimedOut)
            }
        }
    }

    async fn submit(
        &self,
        key: &SessionKey,
        request: FinalizeRequest,
    ) -> Result<super::queue::JobHandle, UploadError> {
        let directory = self.inner.chunk_store.session_dir(key);
        let FinalizeRequest { mut state, keys } = request;

        write_manifests(&directory, key, &mut state).await?;

        let (job, handle) = VerificationJob::new(
            key.clone(),
            directory,
            state.hachage.clone(),
            state.taille,
            keys,
        );
        self.inner.queue.enqueue(job).await?;

        tracing::debug!(session = %key, hash = %state.hachage, "Verification job queued");
        Ok(handle)
    }
}

/// Persist `transaction.json` and `etat.json` into the session directory.
///
/// A previous `etat.json` means this is a retry: its creation time is kept
/// and its retry counter incremented.
pub async fn write_manifests(
    directory: &Path,
    key: &SessionKey,
    state: &mut StateRecord,
) -> Result<(), UploadError> {
    let now = Utc::now().timestamp_millis();
    let state_path = directory.join(STATE_FILE);

    match tokio::fs::read(&state_path).await {
        Ok(bytes) => match serde_json::from_slice::<StateRecord>(&bytes) {
            Ok(previous) => {
                state.retry_count = previous.retry_count + 1;
                state.created = previous.created.or(Some(now));
            }
            Err(e) => {
                tracing::warn!(session = %key, error = %e, "Ignoring unreadable state record");
                state.created = Some(now);
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            state.created = state.created.or(Some(now));
        }
        Err(e) => return Err(e.into()),
    }

    let manifest = TransactionManifest {
        id: uuid::Uuid::new_v4(),
        tenant: key.tenant().to_string(),
        content_id: key.content_id().to_string(),
        action: HANDOFF_ACTION.to_string(),
        hachage: state.hachage.clone(),
        created: now,
    };

    let manifest = serde_json::to_vec_pretty(&manifest).map_err(std::io::Error::other)?;
    tokio::fs::write(directory.join(TRANSACTION_FILE), manifest).await?;

    let record = serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?;
    tokio::fs::write(&state_path, record).await?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::IntakeHandoff;
    use crate::upload::hash::compute_hash;
    use crate::upload::queue::{WorkerConfig, WorkerPool};
    use crate::upload::test_support::{body, RecordingIntake};
    use crate::upload::ChunkStatus;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _temp_dir: TempDir,
        store: ChunkStore,
        coordinator: FinalizeCoordinator,
        cancel: CancellationToken,
        pool: WorkerPool,
    }

    async fn harness(intake: Arc<dyn IntakeHandoff>, timeout: Duration) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::open(temp_dir.path()).await.unwrap();
        let (queue, rx) = VerificationQueue::bounded(20);
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(WorkerConfig::default(), rx, store.clone(), intake, cancel.clone());
        let coordinator = FinalizeCoordinator::new(store.clone(), queue, timeout);
        Harness {
            _temp_dir: temp_dir,
            store,
            coordinator,
            cancel,
            pool,
        }
    }

    async fn upload(store: &ChunkStore, key: &SessionKey, data: &[u8], chunk: usize) {
        for (i, part) in data.chunks(chunk).enumerate() {
            let position = (i * chunk) as u64;
            store
                .put_chunk(key, position, Some(part.len() as u64), None, body(part))
                .await
                .unwrap();
        }
    }

    fn request(hash: String) -> FinalizeRequest {
        FinalizeRequest {
            state: StateRecord::with_hash(hash),
            keys: None,
        }
    }

    #[tokio::test]
    async fn test_finalize_verified() {
        let intake = RecordingIntake::new();
        let h = harness(intake.clone(), Duration::from_secs(5)).await;
        let key = SessionKey::new("tenant", "content").unwrap();
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();

        upload(&h.store, &key, &data, 64 * 1024).await;

        let state = h.coordinator.finalize(&key, request(compute_hash(&data))).await.unwrap();
        assert_eq!(state, FinalizeState::Verified);
        assert_eq!(intake.count().await, 1);
        assert_eq!(h.store.status(&key).await, ChunkStatus::Absent);

        h.cancel.cancel();
        h.pool.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_finalize_mismatch_purges() {
        let intake = RecordingIntake::new();
        let h = harness(intake.clone(), Duration::from_secs(5)).await;
        let key = SessionKey::new("tenant", "content").unwrap();

        upload(&h.store, &key, b"some file content", 5).await;

        let state = h
            .coordinator
            .finalize(&key, request(compute_hash(b"different content")))
            .await
            .unwrap();
        assert!(matches!(state, FinalizeState::Failed(_)));
        assert_eq!(intake.count().await, 0);
        assert_eq!(h.store.status(&key).await, ChunkStatus::Absent);
        assert!(!h.store.session_dir(&key).exists());
    }

    #[tokio::test]
    async fn test_finalize_timeout_then_eventual_handoff() {
        let intake = RecordingIntake::slow(Duration::from_millis(300));
        let h = harness(intake.clone(), Duration::from_millis(50)).await;
        let key = SessionKey::new("tenant", "content").unwrap();

        upload(&h.store, &key, b"abcdef", 3).await;

        let state = h.coordinator.finalize(&key, request(compute_hash(b"abcdef"))).await.unwrap();
        assert_eq!(state, FinalizeState::InProgressTimedOut);
        assert_eq!(h.store.status(&key).await, ChunkStatus::AwaitingFinalize);

        // A second finalize while the first is running does not queue again
        let again = h.coordinator.finalize(&key, request(compute_hash(b"abcdef"))).await.unwrap();
        assert_eq!(again, FinalizeState::AwaitingVerification);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(intake.count().await, 1);
        assert_eq!(h.store.status(&key).await, ChunkStatus::Absent);
    }

    #[tokio::test]
    async fn test_finalize_independent_of_upload_order() {
        let intake = RecordingIntake::new();
        let h = harness(intake.clone(), Duration::from_secs(5)).await;
        let key = SessionKey::new("tenant", "reordered").unwrap();

        for (position, part) in [(8u64, &b"89"[..]), (0, &b"0123"[..]), (4, &b"4567"[..])] {
            h.store
                .put_chunk(&key, position, Some(part.len() as u64), None, body(part))
                .await
                .unwrap();
        }

        let state = h
            .coordinator
            .finalize(&key, request(compute_hash(b"0123456789")))
            .await
            .unwrap();
        assert_eq!(state, FinalizeState::Verified);
    }

    #[tokio::test]
    async fn test_finalize_unknown_session() {
        let h = harness(RecordingIntake::new(), Duration::from_secs(1)).await;
        let key = SessionKey::new("tenant", "missing").unwrap();

        let result = h.coordinator.finalize(&key, request(compute_hash(b"x"))).await;
        assert!(matches!(result, Err(UploadError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_finalize_after_shutdown_keeps_chunks() {
        let h = harness(RecordingIntake::new(), Duration::from_secs(1)).await;
        let key = SessionKey::new("tenant", "content").unwrap();
        upload(&h.store, &key, b"abc", 3).await;

        h.cancel.cancel();
        h.pool.wait().await.unwrap();

        let result = h.coordinator.finalize(&key, request(compute_hash(b"abc"))).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(h.store.status(&key).await, ChunkStatus::InFlight { next_offset: 3 });
    }

    #[tokio::test]
    async fn test_write_manifests_counts_retries() {
        let temp_dir = TempDir::new().unwrap();
        let key = SessionKey::new("tenant", "content").unwrap();

        let mut first = StateRecord::with_hash("abcd");
        write_manifests(temp_dir.path(), &key, &mut first).await.unwrap();
        assert_eq!(first.retry_count, 0);
        let created = first.created.unwrap();

        let mut second = StateRecord::with_hash("abcd");
        write_manifests(temp_dir.path(), &key, &mut second).await.unwrap();
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.created, Some(created));

        let manifest: TransactionManifest = serde_json::from_slice(
            &std::fs::read(temp_dir.path().join(TRANSACTION_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.action, HANDOFF_ACTION);
        assert_eq!(manifest.tenant, "tenant");
        assert_eq!(manifest.hachage, "abcd");
    }
}
