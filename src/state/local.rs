//! Local file-based state storage backend.
//!
//! State lives in a single JSON document next to a lock file. Saves go
//! through a temporary file, `fsync` and an atomic rename.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{KestrelError, Result, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::AppliedStateSet;

/// Default state directory name.
pub const STATE_DIR: &str = ".kestrel";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store in `.kestrel` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| KestrelError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Path of the state document.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::io(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Writes the lock file, failing if another process created it first.
    async fn write_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            })?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;

        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(())
    }

    /// Overwrites the lock file in place through a temporary file.
    async fn replace_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let temp_path = self.lock_path.with_extension("lock.tmp");
        fs::write(&temp_path, content.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write renewed lock: {e}"),
            })?;

        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to replace lock file: {e}"),
            })?;

        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)
                .await
                .map_err(|e| StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<AppliedStateSet>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to read state file: {e}")))?;

        AppliedStateSet::from_json(&content).map(Some)
    }

    async fn save(&self, state: &AppliedStateSet) -> Result<()> {
        self.ensure_dir().await?;

        debug!(
            "Saving state (serial {}) to: {}",
            state.serial,
            self.state_path.display()
        );

        let content = state.to_json()?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::io(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::io(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::io(format!("Failed to delete state file: {e}")))?;
        }

        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
            self.delete_lock_file().await?;
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id);
        self.write_lock_file(&lock_info).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut current = match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => current,
            other => {
                warn!(
                    "State lock {} was replaced by {}",
                    lock.lock_id,
                    other.map_or_else(|| String::from("nothing"), |l| l.holder)
                );
                return Err(StateError::LockLost {
                    lock_id: lock.lock_id.clone(),
                }
                .into());
            }
        };

        current.refresh();
        self.replace_lock_file(&current).await?;
        debug!(
            "Renewed state lock {} (renewal {}, expires {})",
            current.lock_id,
            current.renewals,
            current.expires_at.to_rfc3339()
        );

        Ok(current)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceDescriptor, ResourceKind};
    use crate::state::AppliedState;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path().join(STATE_DIR));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let mut state = AppliedStateSet::new();
        let rg = ResourceDescriptor::new(ResourceKind::ResourceGroup, "rg1")
            .with_attr("location", "East US");
        state.upsert(AppliedState::from_descriptor(&rg, "rg-1"));
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.get("rg1").map(|r| r.provider_id.as_str()), Some("rg-1"));
        assert!(!store.state_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(!store.exists().await.expect("exists check failed"));
    }

    #[tokio::test]
    async fn test_load_rejects_unsupported_version() {
        let (store, _temp) = create_test_store();
        store.save(&AppliedStateSet::new()).await.expect("save");
        std::fs::write(
            store.state_path(),
            r#"{"version": 99, "last_updated": "2024-01-01T00:00:00Z"}"#,
        )
        .expect("write");

        let err = store.load().await.unwrap_err();
        assert!(matches!(
            err,
            KestrelError::State(StateError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.get_lock_info().await.expect("lock info").is_some());

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(store.get_lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(KestrelError::State(StateError::LockedByOther { .. }))
        ));
    }

    #[tokio::test]
    async fn test_renew_extends_own_lock() {
        let (store, _temp) = create_test_store();
        let mut lock = store.acquire_lock("holder-1").await.expect("acquire");
        lock.expires_at = chrono::Utc::now() + chrono::Duration::seconds(30);
        store.replace_lock_file(&lock).await.expect("age lock");

        let renewed = store.renew_lock(&lock).await.expect("renew");

        assert_eq!(renewed.lock_id, lock.lock_id);
        assert_eq!(renewed.renewals, 1);
        assert!(renewed.expires_at > lock.expires_at);
        assert_eq!(store.get_lock_info().await.expect("lock info"), Some(renewed));
        assert!(!store.lock_path.with_extension("lock.tmp").exists());
    }

    #[tokio::test]
    async fn test_renew_fails_after_takeover() {
        let (store, _temp) = create_test_store();
        let mut stale = store.acquire_lock("holder-1").await.expect("acquire");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        store.replace_lock_file(&stale).await.expect("expire lock");

        let usurper = store.acquire_lock("holder-2").await.expect("take over");
        let err = store.renew_lock(&stale).await.unwrap_err();

        assert!(matches!(
            err,
            KestrelError::State(StateError::LockLost { ref lock_id }) if *lock_id == stale.lock_id
        ));
        assert_eq!(store.get_lock_info().await.expect("lock info"), Some(usurper));
    }

    #[tokio::test]
    async fn test_renew_fails_once_released() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder-1").await.expect("acquire");
        store.release_lock(&lock.lock_id).await.expect("release");

        assert!(store.renew_lock(&lock).await.is_err());
    }
}
