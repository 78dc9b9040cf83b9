use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::RunState;
use crate::core::errors::{CascadeError, Result};

/// Storage trait for run state persistence
///
/// `save` must replace the stored state atomically: a concurrent `load`, from
/// this process or another, sees either the previous state or the new one.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Load the last saved state, `None` if nothing was ever saved
    async fn load(&self) -> Result<Option<RunState>>;

    /// Replace the stored state
    async fn save(&self, state: &RunState) -> Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
///
/// The temp file is synced before the rename and the directory after it, so a
/// crash leaves either the old file or the complete new one in place. A failed
/// write removes the temp file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().ok_or_else(|| {
        CascadeError::configuration(format!("state path {} has no file name", path.display()))
    })?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| CascadeError::persistence("create state directory", Some(parent.clone()), e))?;

    if let Err(e) = write_synced(&tmp_path, bytes).await {
        if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", tmp_path.display(), cleanup);
            }
        }
        return Err(e);
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(CascadeError::persistence(
            "replace state file",
            Some(path.to_path_buf()),
            e,
        ));
    }
    sync_dir(&parent).await
}

async fn write_synced(tmp_path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .map_err(|e| CascadeError::persistence("create temp file", Some(tmp_path.to_path_buf()), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CascadeError::persistence("write temp file", Some(tmp_path.to_path_buf()), e))?;
    file.sync_all()
        .await
        .map_err(|e| CascadeError::persistence("sync temp file", Some(tmp_path.to_path_buf()), e))?;
    Ok(())
}

/// Make the rename durable
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(|e| CascadeError::persistence("open state directory", Some(dir.to_path_buf()), e))?;
    handle
        .sync_all()
        .await
        .map_err(|e| CascadeError::persistence("sync state directory", Some(dir.to_path_buf()), e))
}

// Directories cannot be opened as files here; the rename is as durable as it gets.
#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// In-process store; state is lost on exit
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<Option<RunState>>,
    saves: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state: RwLock::new(Some(state)),
            saves: AtomicU64::new(0),
        }
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RunStateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<RunState>> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        *self.state.write().await = Some(state.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// JSON document on disk, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RunStateStore for JsonFileStateStore {
    async fn load(&self) -> Result<Option<RunState>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CascadeError::persistence(
                    "read run state",
                    Some(self.path.clone()),
                    e,
                ))
            }
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            CascadeError::persistence("decode run state", Some(self.path.clone()), e)
        })?;
        Ok(Some(state))
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(
            "JsonFileStateStore: saved iteration {} to {}",
            state.iteration,
            self.path.display()
        );
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

/// Database-backed store; the state is one sled key, flushed on every save
///
/// sled locks its database for a single process. Other processes read the run
/// through the JSON mirror set with [`SledStateStore::with_mirror`].
#[derive(Debug, Clone)]
pub struct SledStateStore {
    db: sled::Db,
    key: String,
    mirror: Option<PathBuf>,
}

impl SledStateStore {
    pub fn open(path: impl AsRef<Path>, cascade_id: &str) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Ok(Self::from_db(db, cascade_id))
    }

    pub fn from_db(db: sled::Db, cascade_id: &str) -> Self {
        Self {
            db,
            key: format!("run_state/{cascade_id}"),
            mirror: None,
        }
    }

    /// Also write every saved state to `path`, atomically, as JSON
    pub fn with_mirror(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror = Some(path.into());
        self
    }
}

#[async_trait]
impl RunStateStore for SledStateStore {
    async fn load(&self) -> Result<Option<RunState>> {
        match self.db.get(self.key.as_bytes())? {
            Some(value) => {
                let state = serde_json::from_slice(&value)
                    .map_err(|e| CascadeError::persistence("decode run state", None, e))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let bytes = serde_json::to_vec(state)?;
        self.db.insert(self.key.as_bytes(), bytes)?;
        self.db.flush_async().await?;

        // The database is authoritative; a stale mirror only delays readers
        if let Some(mirror) = &self.mirror {
            let mirrored = match serde_json::to_vec_pretty(state) {
                Ok(bytes) => write_atomic(mirror, &bytes).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = mirrored {
                warn!("SledStateStore: could not update mirror {}: {}", mirror.display(), e);
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sled:{}", self.key)
    }
}
