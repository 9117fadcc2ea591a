//! Verification Queue
//!
//! Bounded queue between finalize requests and a fixed pool of workers that
//! re-hash assembled sessions. Enqueueing waits when the queue is full, which
//! caps both memory and concurrent hashing work.
//!
//! Each job completes exactly once through a oneshot channel. A caller that
//! stopped waiting simply drops its receiver; the worker still drives the
//! session to hand-off or purge.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::chunk_store::ChunkStore;
use super::hash::{HashVerifier, IntegrityError};
use super::types::{ChunkInfo, SessionKey, UploadError, IO_BLOCK_SIZE};
use crate::handoff::{IntakeHandoff, VerifiedUpload};

type JobResult = Result<(), UploadError>;

// ============================================================================
// Jobs
// ============================================================================

/// Whole-file verification of one session
pub struct VerificationJob {
    pub key: SessionKey,
    pub directory: PathBuf,
    pub expected_hash: String,
    pub declared_size: Option<u64>,
    pub keys: Option<Value>,
    done: oneshot::Sender<JobResult>,
}

impl VerificationJob {
    pub fn new(
        key: SessionKey,
        directory: PathBuf,
        expected_hash: String,
        declared_size: Option<u64>,
        keys: Option<Value>,
    ) -> (Self, JobHandle) {
        let (done, rx) = oneshot::channel();
        let job = Self {
            key,
            directory,
            expected_hash,
            declared_size,
            keys,
            done,
        };
        (job, JobHandle { rx })
    }

    fn complete(self, result: JobResult) {
        // Receiver is gone when the finalize caller already timed out
        let _ = self.done.send(result);
    }
}

/// Caller side of a job's completion signal
pub struct JobHandle {
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    /// Wait for the job's outcome. `None` when the deadline passed first.
    pub async fn wait(self, deadline: Duration) -> Option<JobResult> {
        match tokio::time::timeout(deadline, self.rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => Some(Err(UploadError::InvariantViolation(
                "verification job dropped without completion".to_string(),
            ))),
            Err(_) => None,
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Clone)]
pub struct VerificationQueue {
    tx: mpsc::Sender<VerificationJob>,
}

impl VerificationQueue {
    /// Create a queue holding at most `depth` pending jobs
    pub fn bounded(depth: usize) -> (Self, mpsc::Receiver<VerificationJob>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue a job, waiting for room when the queue is full
    pub async fn enqueue(&self, job: VerificationJob) -> Result<(), UploadError> {
        self.tx.send(job).await.map_err(|_| UploadError::Cancelled)
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Number of concurrent verification workers
    pub workers: usize,

    /// How long an in-flight job may keep running after the stop signal
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<JobResult>>,
}

impl WorkerPool {
    pub fn spawn(
        config: WorkerConfig,
        receiver: mpsc::Receiver<VerificationJob>,
        chunk_store: ChunkStore,
        intake: Arc<dyn IntakeHandoff>,
        cancel: CancellationToken,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let worker = Arc::new(Worker {
            chunk_store,
            intake,
            shutdown_grace: config.shutdown_grace,
        });

        let handles = (0..config.workers.max(1))
            .map(|id| {
                let worker = worker.clone();
                let receiver = receiver.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(id, receiver, cancel).await })
            })
            .collect();

        tracing::info!(workers = config.workers.max(1), "Verification workers started");
        Self { handles }
    }

    /// Wait for every worker to stop.
    ///
    /// Returns the first fatal error; the caller must take the process down.
    pub async fn wait(self) -> Result<(), UploadError> {
        futures::future::try_join_all(self.handles.into_iter().map(|handle| async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(UploadError::InvariantViolation(format!(
                    "verification worker failed: {}",
                    e
                ))),
            }
        }))
        .await?;
        Ok(())
    }
}

struct Worker {
    chunk_store: ChunkStore,
    intake: Arc<dyn IntakeHandoff>,
    shutdown_grace: Duration,
}

impl Worker {
    async fn run(
        &self,
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<VerificationJob>>>,
        cancel: CancellationToken,
    ) -> JobResult {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = async { receiver.lock().await.recv().await } => job,
            };

            let Some(job) = next else {
                if cancel.is_cancelled() {
                    break;
                }
                // Every sender is gone but nobody asked us to stop: a lost
                // wakeup we cannot recover from.
                tracing::error!(worker = id, "Verification queue closed while not stopping");
                return Err(UploadError::InvariantViolation(
                    "verification queue closed while not stopping".to_string(),
                ));
            };

            self.run_job(id, job, &cancel).await;
        }

        self.drain(id, &receiver).await;
        tracing::debug!(worker = id, "Verification worker stopped");
        Ok(())
    }

    async fn run_job(&self, id: usize, job: VerificationJob, cancel: &CancellationToken) {
        tracing::debug!(worker = id, session = %job.key, "Verifying assembled upload");

        // Stops the blocking re-hash between blocks once the grace period is over
        let abort = CancellationToken::new();

        let result = {
            let task = self.process(&job, &abort);
            tokio::pin!(task);

            tokio::select! {
                result = &mut task => result,
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(self.shutdown_grace, &mut task).await {
                        Ok(result) => result,
                        Err(_) => {
                            abort.cancel();
                            tracing::warn!(worker = id, session = %job.key, "Verification cancelled after shutdown grace");
                            Err(UploadError::Cancelled)
                        }
                    }
                }
            }
        };

        match &result {
            Ok(()) => {
                tracing::info!(worker = id, session = %job.key, "Upload verified and handed off");
            }
            Err(UploadError::Cancelled) => {
                self.chunk_store.end_finalize(&job.key).await;
            }
            Err(e) => {
                tracing::error!(worker = id, session = %job.key, error = %e, "Verification failed");
                if let Err(purge_error) = self.chunk_store.purge_session(&job.key).await {
                    tracing::error!(session = %job.key, error = %purge_error, "Failed to purge session");
                }
            }
        }

        job.complete(result);
    }

    async fn process(&self, job: &VerificationJob, abort: &CancellationToken) -> JobResult {
        let chunks = self.chunk_store.ordered_chunks(&job.key).await?;
        let directory = job.directory.clone();
        let expected = job.expected_hash.clone();
        let declared_size = job.declared_size;
        let abort = abort.clone();

        let size = tokio::task::spawn_blocking(move || {
            verify_assembled(&directory, &chunks, &expected, declared_size, &abort)
        })
        .await
        .map_err(|e| UploadError::Storage(std::io::Error::other(e.to_string())))??;

        self.intake
            .add_upload(VerifiedUpload {
                key: job.key.clone(),
                directory: job.directory.clone(),
                size,
                keys: job.keys.clone(),
            })
            .await?;

        // The intake owns the files now
        self.chunk_store.forget(&job.key).await;
        Ok(())
    }

    async fn drain(&self, id: usize, receiver: &Mutex<mpsc::Receiver<VerificationJob>>) {
        let mut receiver = receiver.lock().await;
        receiver.close();

        let mut cancelled = 0;
        while let Ok(job) = receiver.try_recv() {
            self.chunk_store.end_finalize(&job.key).await;
            job.complete(Err(UploadError::Cancelled));
            cancelled += 1;
        }

        if cancelled > 0 {
            tracing::info!(worker = id, cancelled = cancelled, "Cancelled queued verification jobs");
        }
    }
}

/// Re-read every chunk in ascending position order through a fresh verifier.
///
/// Returns the assembled size. `abort` is checked between blocks.
fn verify_assembled(
    directory: &Path,
    chunks: &[ChunkInfo],
    expected_hash: &str,
    declared_size: Option<u64>,
    abort: &CancellationToken,
) -> Result<u64, UploadError> {
    let mut verifier = HashVerifier::new(expected_hash)?;
    if chunks.is_empty() {
        return Err(IntegrityError::Empty.into());
    }

    let mut buffer = vec![0u8; IO_BLOCK_SIZE];
    let mut offset = 0u64;

    for chunk in chunks {
        if chunk.position != offset {
            return Err(IntegrityError::Gap(offset).into());
        }

        let mut file = std::fs::File::open(directory.join(chunk.file_name()))?;
        loop {
            if abort.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            verifier.update(&buffer[..read]);
            offset += read as u64;
        }
    }

    if let Some(declared) = declared_size {
        if declared != offset {
            return Err(IntegrityError::SizeMismatch {
                declared,
                actual: offset,
            }
            .into());
        }
    }

    verifier.verify()?;
    Ok(offset)
}

// ============================================================================
// Tests
// ============================================================================
