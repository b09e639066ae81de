use chrono::Utc;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::{Result, ScribeError};
use crate::models::{ArtifactId, ArtifactState, MediaKind, UploadArtifact, UploadMeta};

/// Every file the store creates starts with this prefix; the sweeper only
/// ever touches files that carry it.
pub const SCRATCH_PREFIX: &str = "scribe-";

/// Bytes inspected for content sniffing before anything is written.
const SNIFF_LEN: usize = 8 * 1024;

const MAX_ID_ATTEMPTS: usize = 5;

/// Owner of the scratch directory.
///
/// Cheap to clone; all clones share the same root and limits.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    max_upload_bytes: u64,
    allowed_mime_types: Vec<String>,
    orphan_grace: Duration,
}

/// What `release` removed from scratch storage.
#[derive(Debug, Clone)]
pub struct ReleaseReport {
    pub artifact_id: ArtifactId,
    pub removed: Vec<PathBuf>,
    pub failures: usize,
}

impl ArtifactStore {
    /// Create the scratch root if needed and return a store over it.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.scratch_dir).await?;
        info!(root = %config.scratch_dir.display(), "Scratch storage ready");

        Ok(Self {
            inner: Arc::new(StoreInner {
                root: config.scratch_dir.clone(),
                max_upload_bytes: config.max_upload_bytes,
                allowed_mime_types: config
                    .allowed_mime_types
                    .iter()
                    .map(|m| normalize_mime(m))
                    .collect(),
                orphan_grace: Duration::from_secs(config.orphan_grace_secs),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.inner.max_upload_bytes
    }

    /// Persist an incoming byte stream as a new artifact.
    ///
    /// Size and type are checked before the file is created; on any failure
    /// after that the partial file is removed, including when the returned
    /// future is dropped mid-write.
    pub async fn acquire<S, B>(&self, meta: UploadMeta, mut stream: S) -> Result<ArtifactLease>
    where
        S: Stream<Item = std::io::Result<B>> + Send + Unpin,
        B: AsRef<[u8]> + Send,
    {
        let limit = self.inner.max_upload_bytes;

        if let Some(size) = meta.declared_size {
            if size > limit {
                return Err(ScribeError::PayloadTooLarge { size, limit });
            }
        }

        // Validation prefix: buffered in memory until the type is known.
        let mut prefix: Vec<u8> = Vec::new();
        let mut stream_done = false;
        while prefix.len() < SNIFF_LEN {
            match stream.next().await {
                Some(chunk) => {
                    prefix.extend_from_slice(chunk.map_err(interrupted)?.as_ref());
                    if prefix.len() as u64 > limit {
                        return Err(ScribeError::PayloadTooLarge {
                            size: prefix.len() as u64,
                            limit,
                        });
                    }
                }
                None => {
                    stream_done = true;
                    break;
                }
            }
        }

        if prefix.is_empty() {
            return Err(ScribeError::CorruptMedia("empty payload".to_string()));
        }

        let mime_type = self.resolve_mime(&meta, &prefix[..prefix.len().min(SNIFF_LEN)])?;
        let kind = MediaKind::from_mime(&mime_type)
            .ok_or_else(|| ScribeError::UnsupportedType(mime_type.clone()))?;

        let (id, path, mut file) = self.create_unique().await?;
        let mut guard = PartialUpload::new(path.clone());

        let mut hasher = Sha256::new();
        let mut size = prefix.len() as u64;
        hasher.update(&prefix);
        file.write_all(&prefix).await?;
        drop(prefix);

        if !stream_done {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(interrupted)?;
                let bytes = chunk.as_ref();
                size += bytes.len() as u64;
                if size > limit {
                    debug!(artifact_id = %id, size, limit, "Upload exceeded limit mid-stream");
                    return Err(ScribeError::PayloadTooLarge { size, limit });
                }
                hasher.update(bytes);
                file.write_all(bytes).await?;
            }
        }

        file.flush().await?;
        drop(file);
        guard.disarm();

        let artifact = UploadArtifact {
            id,
            original_filename: meta.filename,
            mime_type,
            kind,
            size_bytes: size,
            sha256: format!("{:x}", hasher.finalize()),
            path,
            created_at: Utc::now(),
            state: ArtifactState::Received,
        };

        info!(
            artifact_id = %artifact.id,
            mime_type = %artifact.mime_type,
            size_bytes = artifact.size_bytes,
            "Artifact received"
        );

        Ok(ArtifactLease::new(self.inner.root.clone(), artifact))
    }

    /// Remove the artifact file and everything the lease tracked.
    pub async fn release(&self, mut lease: ArtifactLease) -> ReleaseReport {
        let mut removed = Vec::new();
        let mut failures = 0;

        for path in lease.close() {
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
                    failures += 1;
                }
            }
        }

        lease.mark_purged();

        debug!(
            artifact_id = %lease.artifact.id,
            removed = removed.len(),
            failures,
            "Artifact released"
        );

        ReleaseReport {
            artifact_id: lease.artifact.id.clone(),
            removed,
            failures,
        }
    }

    /// Remove scratch files older than the grace period.
    ///
    /// Returns the number of files removed. Individual failures are logged
    /// and skipped.
    pub async fn sweep_orphans(&self) -> Result<u64> {
        let now = SystemTime::now();
        let mut removed = 0u64;

        for path in self.scratch_files().await? {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.inner.orphan_grace {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "Removed orphan");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphan"),
            }
        }

        Ok(removed)
    }

    /// Scratch files currently owned by the store, in no particular order.
    pub async fn scratch_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.inner.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_ours = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(SCRATCH_PREFIX))
                .unwrap_or(false);
            if is_ours && entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn resolve_mime(&self, meta: &UploadMeta, prefix: &[u8]) -> Result<String> {
        let declared = meta
            .declared_type
            .as_deref()
            .map(normalize_mime)
            .filter(|m| !m.is_empty() && m != "application/octet-stream");

        let claimed = declared.or_else(|| {
            meta.filename
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first_raw())
                .map(normalize_mime)
        });

        // Content wins over what the client claims.
        let sniffed = infer::get(prefix).map(|kind| normalize_mime(kind.mime_type()));

        if let Some(sniffed) = &sniffed {
            if !self.is_allowed(sniffed) {
                return Err(ScribeError::UnsupportedType(sniffed.clone()));
            }
        }

        let resolved = sniffed
            .or(claimed)
            .ok_or_else(|| ScribeError::UnsupportedType("unknown".to_string()))?;

        if !self.is_allowed(&resolved) {
            return Err(ScribeError::UnsupportedType(resolved));
        }

        Ok(resolved)
    }

    fn is_allowed(&self, mime: &str) -> bool {
        self.inner.allowed_mime_types.iter().any(|m| m == mime)
    }

    async fn create_unique(&self) -> Result<(ArtifactId, PathBuf, fs::File)> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = ArtifactId::generate();
            let path = self
                .inner
                .root
                .join(format!("{SCRATCH_PREFIX}{id}.upload"));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((id, path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    warn!(artifact_id = %id, "Artifact id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ScribeError::Internal(
            "could not allocate a unique artifact id".to_string(),
        ))
    }
}

/// A failed read from the client is a bad request, not a storage fault.
fn interrupted(e: std::io::Error) -> ScribeError {
    ScribeError::Validation(format!("upload interrupted: {e}"))
}

fn normalize_mime(raw: &str) -> String {
    let essence = raw.split(';').next().unwrap_or("").trim().to_lowercase();
    match essence.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "video/x-quicktime" => "video/quicktime".to_string(),
        "video/avi" | "video/msvideo" => "video/x-msvideo".to_string(),
        "video/mkv" => "video/x-matroska".to_string(),
        _ => essence,
    }
}

/// Removes a half-written upload unless disarmed.
struct PartialUpload {
    path: Option<PathBuf>,
}

impl PartialUpload {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove partial upload");
                }
            }
        }
    }
}

/// Exclusive handle on one artifact and the intermediates derived from it.
///
/// Release it through [`ArtifactStore::release`]. A lease dropped without
/// release removes its files synchronously.
pub struct ArtifactLease {
    root: PathBuf,
    artifact: UploadArtifact,
    intermediates: Arc<Mutex<Intermediates>>,
    released: bool,
}

/// Derived files of one lease. Once closed, no new file may appear.
#[derive(Debug, Default)]
struct Intermediates {
    paths: Vec<PathBuf>,
    closed: bool,
}

fn lock(ledger: &Mutex<Intermediates>) -> std::sync::MutexGuard<'_, Intermediates> {
    ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes one tracked intermediate file from a blocking thread.
///
/// The write holds the lease's ledger lock, so it either lands before the
/// lease closes (and is removed with it) or is skipped.
#[derive(Debug, Clone)]
pub struct IntermediateWriter {
    path: PathBuf,
    ledger: Arc<Mutex<Intermediates>>,
}

impl IntermediateWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `false` when the lease was already released.
    pub fn write(&self, bytes: &[u8]) -> Result<bool> {
        let ledger = lock(&self.ledger);
        if ledger.closed {
            return Ok(false);
        }
        std::fs::write(&self.path, bytes)?;
        Ok(true)
    }
}

impl ArtifactLease {
    fn new(root: PathBuf, artifact: UploadArtifact) -> Self {
        Self {
            root,
            artifact,
            intermediates: Arc::new(Mutex::new(Intermediates::default())),
            released: false,
        }
    }

    pub fn artifact(&self) -> &UploadArtifact {
        &self.artifact
    }

    pub fn id(&self) -> &ArtifactId {
        &self.artifact.id
    }

    pub fn state(&self) -> ArtifactState {
        self.artifact.state
    }

    pub fn begin_processing(&mut self) -> Result<()> {
        self.artifact.transition(ArtifactState::Processing)
    }

    pub fn finish(&mut self, succeeded: bool) -> Result<()> {
        let next = if succeeded {
            ArtifactState::Completed
        } else {
            ArtifactState::Failed
        };
        self.artifact.transition(next)
    }

    /// Allocate a tracked derived file. Nothing is created until the
    /// writer writes; whatever ends up there is removed on release.
    pub fn intermediate(&self, label: &str, extension: &str) -> IntermediateWriter {
        let path = self.root.join(format!(
            "{SCRATCH_PREFIX}{}.{label}.{extension}",
            self.artifact.id
        ));
        lock(&self.intermediates).paths.push(path.clone());
        IntermediateWriter {
            path,
            ledger: Arc::clone(&self.intermediates),
        }
    }

    /// Close the ledger and list every file the lease owns.
    fn close(&self) -> Vec<PathBuf> {
        let mut ledger = lock(&self.intermediates);
        ledger.closed = true;
        let mut files = vec![self.artifact.path.clone()];
        files.extend(ledger.paths.iter().cloned());
        files
    }

    fn mark_purged(&mut self) {
        if !self.artifact.state.is_terminal() {
            // received or processing: the request ended without finishing
            self.artifact.state = ArtifactState::Failed;
        }
        self.artifact.state = ArtifactState::Purged;
        self.released = true;
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(artifact_id = %self.artifact.id, "Lease dropped without release, purging");
        for path in self.close() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
                }
            }
        }
    }
}
