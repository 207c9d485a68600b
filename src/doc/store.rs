//! Authoritative document state.
//!
//! One canonical markup string, mutated only by patch application. Patches
//! arrive in the standard diff-match-patch patch-text format and are applied
//! fuzzily, hunk by hunk; a single failing hunk discards the whole candidate.
//! Size accounting is UTF-8 byte length throughout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use diff_match_patch_rs::{DiffMatchPatch, Efficient};
use parking_lot::Mutex;
use tracing::{info, warn};

/// Markup seeded into a brand-new document.
pub const DEFAULT_CONTENT: &str =
    "<h1>Untitled pad</h1><p>Start typing to share this document with everyone on this page.</p>";

/// Replacement markup when the persisted file exceeds the size cap at load.
pub const OVERSIZE_BANNER: &str =
    "<h1>Document reset</h1><p>The stored document exceeded the size limit and could not be loaded.</p>";

/// Outcome of applying one patch to the canonical content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The patch produced the current content; nothing changed.
    NoChange,
    /// The patch was committed; carries the new content size in bytes.
    Applied(usize),
    /// The patch did not apply cleanly; the client should resync.
    Failed(String),
    /// The result violated a hard limit; state untouched.
    Rejected(String),
}

struct DocState {
    content: String,
    dirty: bool,
}

/// Owner of the canonical document string.
///
/// All mutations are serialized through the internal mutex; the lock is never
/// held across disk I/O. Disk writers (sync and async) are serialized by the
/// `saving` gate: an in-progress save suppresses concurrent saves.
pub struct DocumentStore {
    path: PathBuf,
    max_bytes: usize,
    state: Mutex<DocState>,
    saving: AtomicBool,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            state: Mutex::new(DocState {
                content: DEFAULT_CONTENT.to_string(),
                dirty: false,
            }),
            saving: AtomicBool::new(false),
        }
    }

    /// Read the persisted file into memory.
    ///
    /// A missing file seeds the default content and writes it back
    /// synchronously. A file longer than the size cap is not read: the
    /// in-memory content becomes a human-readable banner and the file is
    /// overwritten with it (best effort, logged).
    pub fn load(&self) -> io::Result<()> {
        match fs::metadata(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no document on disk, seeding default");
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent)?;
                    }
                }
                self.state.lock().content = DEFAULT_CONTENT.to_string();
                self.write_atomic(DEFAULT_CONTENT)?;
                Ok(())
            }
            Err(e) => Err(e),
            Ok(meta) if meta.len() > self.max_bytes as u64 => {
                warn!(
                    path = %self.path.display(),
                    size = meta.len(),
                    max = self.max_bytes,
                    "persisted document exceeds size cap, replacing with banner"
                );
                self.state.lock().content = OVERSIZE_BANNER.to_string();
                if let Err(e) = self.write_atomic(OVERSIZE_BANNER) {
                    warn!("failed to overwrite oversize document: {e}");
                }
                Ok(())
            }
            Ok(_) => {
                let content = fs::read_to_string(&self.path)?;
                info!(path = %self.path.display(), bytes = content.len(), "document loaded");
                self.state.lock().content = content;
                Ok(())
            }
        }
    }

    /// Apply a patch-text blob to the current content.
    ///
    /// Every hunk must apply; the size check runs on the candidate before the
    /// equality check so an oversize no-op is still rejected. Either the
    /// whole candidate replaces the content or nothing changes.
    pub fn apply_patch(&self, patch_text: &str) -> ApplyOutcome {
        let dmp = DiffMatchPatch::new();
        let patches = match dmp.patch_from_text::<Efficient>(patch_text) {
            Ok(p) => p,
            Err(e) => return ApplyOutcome::Failed(format!("patch parse failed: {e:?}")),
        };

        let mut state = self.state.lock();
        let (candidate, hunk_results) = match dmp.patch_apply(&patches, &state.content) {
            Ok(r) => r,
            Err(e) => return ApplyOutcome::Failed(format!("patch apply failed: {e:?}")),
        };
        if hunk_results.iter().any(|applied| !applied) {
            return ApplyOutcome::Failed("patch apply failed".to_string());
        }
        if candidate.len() > self.max_bytes {
            return ApplyOutcome::Rejected("document size limit exceeded".to_string());
        }
        if candidate == state.content {
            return ApplyOutcome::NoChange;
        }

        let size = candidate.len();
        state.content = candidate;
        state.dirty = true;
        ApplyOutcome::Applied(size)
    }

    /// Current content, cloned for broadcasting or persistence.
    pub fn snapshot(&self) -> String {
        self.state.lock().content.clone()
    }

    /// Current content size in UTF-8 bytes.
    pub fn byte_len(&self) -> usize {
        self.state.lock().content.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking write-through of the current content.
    ///
    /// Suppressed while another save is in flight. The dirty flag is cleared
    /// when the snapshot is taken and restored on failure so a later tick
    /// retries.
    pub fn save_sync(&self) -> io::Result<()> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let content = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.content.clone()
        };
        let result = self.write_atomic(&content);
        if result.is_err() {
            self.state.lock().dirty = true;
        }
        self.saving.store(false, Ordering::SeqCst);
        result
    }

    /// Asynchronous write-through with the same discipline as [`save_sync`].
    ///
    /// [`save_sync`]: DocumentStore::save_sync
    pub async fn save_async(&self) -> io::Result<()> {
        if self.saving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let content = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.content.clone()
        };
        let result = self.write_atomic_async(&content).await;
        if result.is_err() {
            self.state.lock().dirty = true;
        }
        self.saving.store(false, Ordering::SeqCst);
        result
    }

    fn tmp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_owned();
        os.push(".tmp");
        PathBuf::from(os)
    }

    /// Temp-file-plus-rename write. The rename is the only step that mutates
    /// the durable path; any failure unlinks the temp file.
    fn write_atomic(&self, content: &str) -> io::Result<()> {
        if content.len() > self.max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "document size limit exceeded",
            ));
        }
        let tmp = self.tmp_path();
        if let Err(e) = fs::write(&tmp, content) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }

    async fn write_atomic_async(&self, content: &str) -> io::Result<()> {
        if content.len() > self.max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "document size limit exceeded",
            ));
        }
        let tmp = self.tmp_path();
        if let Err(e) = tokio::fs::write(&tmp, content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(())
    }
}
