//! Chunk Store
//!
//! Durable staging of upload chunks, one directory per (tenant, content id).
//!
//! A chunk is streamed into `{position}.part.work` and renamed to
//! `{position}.part` only once its length (and optional digest) checked out.
//! The rename is the commit point: readers only ever look at `.part` files,
//! so no lock is needed between a chunk writer and the verification worker.
//!
//! Positions are tracked in an in-memory index rebuilt from disk once at
//! startup and updated on every commit, so status queries never walk the
//! directory.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::RwLock;

use super::hash::HashVerifier;
use super::types::{
    part_file_name, work_file_name, ChunkInfo, ChunkRejection, ChunkStatus, PutOutcome, SessionKey, UploadError, IO_BLOCK_SIZE, PART_SUFFIX, WORK_SUFFIX,
};

// ============================================================================
// Chunk Store
// ============================================================================

#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// `{staging}/upload`
    root: PathBuf,

    /// Committed chunks and finalize state per session
    sessions: RwLock<HashMap<SessionKey, SessionIndex>>,
}

#[derive(Debug, Default)]
struct SessionIndex {
    /// position -> length
    chunks: BTreeMap<u64, u64>,

    /// A verification job is queued or running
    verifying: bool,
}

impl SessionIndex {
    fn next_offset(&self) -> u64 {
        self.chunks
            .last_key_value()
            .map(|(position, length)| position + length)
            .unwrap_or(0)
    }
}

impl ChunkStore {
    /// Open the store rooted at `root`, recovering any sessions left on disk
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let sessions = recover_sessions(&root).await?;
        let chunk_count: usize = sessions.values().map(|s| s.chunks.len()).sum();
        tracing::info!(
            root = %root.display(),
            sessions = sessions.len(),
            chunks = chunk_count,
            "Chunk store recovered"
        );

        Ok(Self {
            inner: Arc::new(ChunkStoreInner {
                root,
                sessions: RwLock::new(sessions),
            }),
        })
    }

    /// Directory holding a session's chunk files
    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.inner.root.join(key.tenant()).join(key.content_id())
    }

    /// Resume status of a session
    pub async fn status(&self, key: &SessionKey) -> ChunkStatus {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(key) {
            None => ChunkStatus::Absent,
            Some(index) if index.verifying => ChunkStatus::AwaitingFinalize,
            Some(index) => ChunkStatus::InFlight {
                next_offset: index.next_offset(),
            },
        }
    }

    /// Committed chunks in ascending position order
    pub async fn ordered_chunks(&self, key: &SessionKey) -> Result<Vec<ChunkInfo>, UploadError> {
        let sessions = self.inner.sessions.read().await;
        let index = sessions
            .get(key)
            .ok_or_else(|| UploadError::SessionNotFound(key.to_string()))?;

        Ok(index
            .chunks
            .iter()
            .map(|(&position, &length)| ChunkInfo { position, length })
            .collect())
    }

    /// Store one chunk.
    ///
    /// A digest mismatch purges the whole session; a length mismatch only
    /// drops this chunk, leaving the rest resumable.
    pub async fn put_chunk<S, B>(
        &self,
        key: &SessionKey,
        position: u64,
        expected_length: Option<u64>,
        content_hash: Option<&str>,
        mut body: S,
    ) -> Result<PutOutcome, UploadError>
    where
        S: Stream<Item = std::io::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let mut verifier = content_hash
            .map(HashVerifier::new)
            .transpose()
            .map_err(|e| UploadError::InvalidDigest(e.to_string()))?;

        // Retry of a chunk we already hold
        if let Some(length) = expected_length {
            let sessions = self.inner.sessions.read().await;
            let existing = sessions.get(key).and_then(|s| s.chunks.get(&position));
            if existing == Some(&length) {
                tracing::debug!(
                    session = %key,
                    position = position,
                    length = length,
                    "Chunk already stored, skipping"
                );
                return Ok(PutOutcome::Accepted);
            }
        }

        let dir = self.session_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        self.inner
            .sessions
            .write()
            .await
            .entry(key.clone())
            .or_default();

        let work_path = dir.join(work_file_name(position));
        let written = match write_work_file(&work_path, &mut body, verifier.as_mut()).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&work_path).await;
                return Err(e.into());
            }
        };

        if let Some(verifier) = verifier {
            if let Err(e) = verifier.verify() {
                tracing::info!(
                    session = %key,
                    position = position,
                    error = %e,
                    "Chunk hash mismatch, purging session"
                );
                self.purge_session(key).await?;
                return Ok(PutOutcome::Rejected(ChunkRejection::HashMismatch));
            }
        }

        if let Some(expected) = expected_length {
            if written != expected {
                tracing::info!(
                    session = %key,
                    position = position,
                    expected = expected,
                    actual = written,
                    "Chunk length mismatch"
                );
                let _ = tokio::fs::remove_file(&work_path).await;
                return Ok(PutOutcome::Rejected(ChunkRejection::LengthMismatch {
                    expected,
                    actual: written,
                }));
            }
        }

        // Commit under the index lock so a concurrent purge cannot interleave
        // between the rename and the index update
        let mut sessions = self.inner.sessions.write().await;
        let Some(index) = sessions.get_mut(key) else {
            drop(sessions);
            let _ = tokio::fs::remove_file(&work_path).await;
            tracing::info!(session = %key, position = position, "Session purged while chunk was written");
            return Err(UploadError::SessionNotFound(key.to_string()));
        };
        tokio::fs::rename(&work_path, dir.join(part_file_name(position))).await?;
        index.chunks.insert(position, written);
        drop(sessions);

        tracing::debug!(
            session = %key,
            position = position,
            length = written,
            "Chunk committed"
        );

        Ok(PutOutcome::Accepted)
    }

    /// Mark a session as awaiting verification.
    ///
    /// Returns `false` when a verification job is already in flight.
    pub async fn begin_finalize(&self, key: &SessionKey) -> Result<bool, UploadError> {
        let mut sessions = self.inner.sessions.write().await;
        let index = sessions
            .get_mut(key)
            .ok_or_else(|| UploadError::SessionNotFound(key.to_string()))?;

        if index.verifying {
            return Ok(false);
        }
        index.verifying = true;
        Ok(true)
    }

    /// Return a session to the resumable state (job cancelled at shutdown)
    pub async fn end_finalize(&self, key: &SessionKey) {
        if let Some(index) = self.inner.sessions.write().await.get_mut(key) {
            index.verifying = false;
        }
    }

    /// Drop a session from the index without touching disk; used once the
    /// intake owns the files.
    pub async fn forget(&self, key: &SessionKey) {
        self.inner.sessions.write().await.remove(key);
    }

    /// Delete every file of a session. Returns whether a directory was removed.
    pub async fn purge_session(&self, key: &SessionKey) -> Result<bool, UploadError> {
        self.inner.sessions.write().await.remove(key);

        match tokio::fs::remove_dir_all(self.session_dir(key)).await {
            Ok(()) => {
                tracing::info!(session = %key, "Session purged");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Client-requested abort of an unfinalized session
    pub async fn abort(&self, key: &SessionKey) -> Result<(), UploadError> {
        match self.status(key).await {
            ChunkStatus::Absent => Err(UploadError::SessionNotFound(key.to_string())),
            ChunkStatus::AwaitingFinalize => Err(UploadError::VerificationInProgress(key.to_string())),
            ChunkStatus::InFlight { .. } => {
                self.purge_session(key).await?;
                Ok(())
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn write_work_file<S, B>(
    path: &Path,
    body: &mut S,
    mut verifier: Option<&mut HashVerifier>,
) -> std::io::Result<u64>
where
    S: Stream<Item = std::io::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    let file = tokio::fs::File::create(path).await?;
    let mut writer = BufWriter::with_capacity(16 * IO_BLOCK_SIZE, file);
    let mut written = 0u64;

    while let Some(data) = body.next().await {
        let data = data?;
        let data = data.as_ref();
        if let Some(verifier) = verifier.as_deref_mut() {
            verifier.update(data);
        }
        writer.write_all(data).await?;
        written += data.len() as u64;
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(written)
}

/// Rebuild the index from `{root}/{tenant}/{content_id}/*.part`, deleting
/// work files left by an interrupted process.
async fn recover_sessions(root: &Path) -> std::io::Result<HashMap<SessionKey, SessionIndex>> {
    let mut sessions = HashMap::new();

    let mut tenants = tokio::fs::read_dir(root).await?;
    while let Some(tenant) = tenants.next_entry().await? {
        if !tenant.file_type().await?.is_dir() {
            continue;
        }

        let mut contents = tokio::fs::read_dir(tenant.path()).await?;
        while let Some(content) = contents.next_entry().await? {
            if !content.file_type().await?.is_dir() {
                continue;
            }

            let tenant_name = tenant.file_name().to_string_lossy().into_owned();
            let content_name = content.file_name().to_string_lossy().into_owned();
            let Ok(key) = SessionKey::new(tenant_name, content_name) else {
                tracing::warn!(path = %content.path().display(), "Skipping unrecognised staging directory");
                continue;
            };

            let mut index = SessionIndex::default();
            let mut files = tokio::fs::read_dir(content.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name().to_string_lossy().into_owned();
                if name.ends_with(WORK_SUFFIX) {
                    tracing::debug!(path = %file.path().display(), "Removing stale work file");
                    tokio::fs::remove_file(file.path()).await?;
                } else if let Some(position) = name
                    .strip_suffix(PART_SUFFIX)
                    .and_then(|p| p.parse::<u64>().ok())
                {
                    index.chunks.insert(position, file.metadata().await?.len());
                }
            }

            sessions.insert(key, index);
        }
    }

    Ok(sessions)
}

// ============================================================================
// Tests
// ============================================================================
