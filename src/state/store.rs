//! Storage seam for the applied state.
//!
//! The engine only needs whole-document load and save plus an advisory
//! lock; [`LocalStateStore`](super::LocalStateStore) implements both on the
//! filesystem.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::AppliedStateSet;

/// Where the applied state lives and how writers are serialized.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state, migrating older formats. `None` if nothing
    /// has been saved yet.
    async fn load(&self) -> Result<Option<AppliedStateSet>>;

    /// Replaces the applied state atomically: a concurrent reader sees
    /// either the previous document or the new one, never a partial write.
    async fn save(&self, state: &AppliedStateSet) -> Result<()>;

    /// Removes the state document.
    async fn delete(&self) -> Result<()>;

    /// Checks whether a state document exists.
    async fn exists(&self) -> Result<bool>;

    /// Takes the lock for `holder`, replacing a lapsed one. Fails with
    /// `LockedByOther` while someone else holds a live lock.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends `lock` and returns the renewed record. Fails with
    /// `LockLost` if the lock on file is no longer `lock`.
    async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Drops the lock if it is still `lock_id`; a foreign lock is left alone.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// The lock currently on file, live or lapsed.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Short backend name for logs.
    fn backend_type(&self) -> &'static str;
}
