//! Locked read-modify-write access to the applied state.
//!
//! A transaction holds the state lock for the duration of an apply cycle.
//! Each [`StateTransaction::record`] call persists one change; if the save
//! fails the in-memory copy is left untouched so memory and disk never
//! disagree. The lock is renewed before a save once half its validity has
//! passed, and a save never happens under a lock that was lost.

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{KestrelError, Result, StateError};

use super::lock::LockInfo;
use super::store::StateStore;
use super::types::AppliedStateSet;

/// An open, locked view of the applied state.
pub struct StateTransaction<'a> {
    store: &'a dyn StateStore,
    lock: LockInfo,
    state: AppliedStateSet,
    /// Set once a renewal found the lock taken over.
    lost: bool,
}

impl<'a> StateTransaction<'a> {
    /// Acquires the state lock and loads the current state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or the state cannot be
    /// loaded. The lock is released again if loading fails.
    pub async fn begin(store: &'a dyn StateStore, holder: &str) -> Result<Self> {
        let lock = store.acquire_lock(holder).await?;

        let state = match store.load().await {
            Ok(state) => state.unwrap_or_default(),
            Err(e) => {
                if let Err(release_err) = store.release_lock(&lock.lock_id).await {
                    warn!("Failed to release state lock after load error: {release_err}");
                }
                return Err(e);
            }
        };

        debug!(
            "Opened state transaction {} on {} store at serial {}",
            lock.lock_id,
            store.backend_type(),
            state.serial
        );

        Ok(Self {
            store,
            lock,
            state,
            lost: false,
        })
    }

    /// The state as last persisted.
    #[must_use]
    pub const fn state(&self) -> &AppliedStateSet {
        &self.state
    }

    /// Lock held by this transaction.
    #[must_use]
    pub const fn lock(&self) -> &LockInfo {
        &self.lock
    }

    /// Extends the lock held by this transaction.
    ///
    /// # Errors
    ///
    /// Returns `LockLost` if another process has taken the lock over.
    pub async fn renew_lock(&mut self) -> Result<()> {
        match self.store.renew_lock(&self.lock).await {
            Ok(lock) => {
                self.lock = lock;
                Ok(())
            }
            Err(e) => {
                if matches!(e, KestrelError::State(StateError::LockLost { .. })) {
                    self.lost = true;
                }
                Err(e)
            }
        }
    }

    /// Applies `change` and persists the result.
    ///
    /// # Errors
    ///
    /// Returns the store error if the save fails, or `LockLost` if the lock
    /// had to be renewed and could not be; the in-memory state is then left
    /// at its previous value.
    pub async fn record<F>(&mut self, change: F) -> Result<()>
    where
        F: FnOnce(&mut AppliedStateSet),
    {
        if self.lost {
            return Err(StateError::LockLost {
                lock_id: self.lock.lock_id.clone(),
            }
            .into());
        }
        if self.lock.needs_renewal() {
            self.renew_lock().await?;
        }

        let mut next = self.state.clone();
        change(&mut next);
        next.serial = self.state.serial.saturating_add(1);
        next.last_updated = Utc::now();

        self.store.save(&next).await?;
        self.state = next;
        Ok(())
    }

    /// Releases the lock and returns the final state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be released.
    pub async fn commit(self) -> Result<AppliedStateSet> {
        self.store.release_lock(&self.lock.lock_id).await?;
        debug!("Closed state transaction {}", self.lock.lock_id);
        Ok(self.state)
    }
}

/// Runs `change` on a copy of the state under the lock and saves the copy
/// only if `change` succeeds. The lock is always released.
///
/// # Errors
///
/// Returns the error of `change`, or a lock or store error.
pub async fn with_transaction<T, F>(store: &dyn StateStore, holder: &str, change: F) -> Result<T>
where
    F: FnOnce(&mut AppliedStateSet) -> Result<T>,
{
    let mut tx = StateTransaction::begin(store, holder).await?;

    let mut draft = tx.state.clone();
    let outcome = match change(&mut draft) {
        Ok(value) => tx.record(|state| *state = draft).await.map(|()| value),
        Err(e) => Err(e),
    };

    let released = tx.commit().await;
    let value = outcome?;
    released?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceDescriptor, ResourceKind};
    use crate::state::{AppliedState, LocalStateStore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn rg(name: &str) -> AppliedState {
        let desc = ResourceDescriptor::new(ResourceKind::ResourceGroup, name).with_attr("location", "East US");
        AppliedState::from_descriptor(&desc, &format!("{name}-id"))
    }

    #[tokio::test]
    async fn test_record_persists_each_change() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let mut tx = StateTransaction::begin(&store, "test").await.unwrap();
        tx.record(|s| s.upsert(rg("rg1"))).await.unwrap();
        tx.record(|s| s.upsert(rg("rg2"))).await.unwrap();
        assert_eq!(tx.state().serial, 2);

        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk.serial, 2);

        let state = tx.commit().await.unwrap();
        assert_eq!(state, on_disk);
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_fails_while_locked() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let _held = StateTransaction::begin(&store, "first").await.unwrap();
        let second = StateTransaction::begin(&store, "second").await;
        assert!(matches!(
            second,
            Err(KestrelError::State(StateError::LockedByOther { .. }))
        ));
    }

    /// Store whose saves always fail.
    struct ReadOnlyStore {
        inner: LocalStateStore,
    }

    #[async_trait]
    impl StateStore for ReadOnlyStore {
        async fn load(&self) -> Result<Option<AppliedStateSet>> {
            self.inner.load().await
        }
        async fn save(&self, _state: &AppliedStateSet) -> Result<()> {
            Err(StateError::io("disk full").into())
        }
        async fn delete(&self) -> Result<()> {
            self.inner.delete().await
        }
        async fn exists(&self) -> Result<bool> {
            self.inner.exists().await
        }
        async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
            self.inner.acquire_lock(holder).await
        }
        async fn renew_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
            self.inner.renew_lock(lock).await
        }
        async fn release_lock(&self, lock_id: &str) -> Result<()> {
            self.inner.release_lock(lock_id).await
        }
        async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
            self.inner.get_lock_info().await
        }
        fn backend_type(&self) -> &'static str {
            "read-only"
        }
    }

    #[tokio::test]
    async fn test_with_transaction_saves_only_on_success() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let count = with_transaction(&store, "test", |s| {
            s.upsert(rg("rg1"));
            Ok(s.len())
        })
        .await
        .unwrap();
        assert_eq!(count, 1);

        let failed: Result<()> = with_transaction(&store, "test", |s| {
            s.remove("rg1");
            Err(StateError::corrupted("abort").into())
        })
        .await;
        assert!(failed.is_err());

        let on_disk = store.load().await.unwrap().unwrap();
        assert!(on_disk.get("rg1").is_some());
        assert_eq!(on_disk.serial, 1);
        assert!(store.get_lock_info().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let temp = TempDir::new().unwrap();
        let store = ReadOnlyStore {
            inner: LocalStateStore::with_base_dir(temp.path()),
        };

        let mut tx = StateTransaction::begin(&store, "test").await.unwrap();
        let result = tx.record(|s| s.upsert(rg("rg1"))).await;

        assert!(result.is_err());
        assert!(tx.state().is_empty());
        assert_eq!(tx.state().serial, 0);
    }

    #[tokio::test]
    async fn test_record_renews_aging_lock() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let mut tx = StateTransaction::begin(&store, "test").await.unwrap();
        tx.lock.expires_at = Utc::now() + chrono::Duration::seconds(60);

        tx.record(|s| s.upsert(rg("rg1"))).await.unwrap();

        assert_eq!(tx.lock().renewals, 1);
        assert!(!tx.lock().needs_renewal());
        let on_file = store.get_lock_info().await.unwrap().unwrap();
        assert_eq!(on_file.renewals, 1);
    }

    #[tokio::test]
    async fn test_record_refuses_to_save_under_lost_lock() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let mut tx = StateTransaction::begin(&store, "first").await.unwrap();
        tx.lock.expires_at = Utc::now() + chrono::Duration::seconds(60);

        // Another process clears the lock and takes it.
        store.release_lock(&tx.lock().lock_id.clone()).await.unwrap();
        store.acquire_lock("second").await.unwrap();

        let err = tx.record(|s| s.upsert(rg("rg1"))).await.unwrap_err();

        assert!(matches!(err, KestrelError::State(StateError::LockLost { .. })));
        assert!(tx.state().is_empty());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_saves_after_failed_renewal() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());

        let mut tx = StateTransaction::begin(&store, "first").await.unwrap();
        store.release_lock(&tx.lock().lock_id.clone()).await.unwrap();
        store.acquire_lock("second").await.unwrap();

        assert!(tx.renew_lock().await.is_err());
        // The lock is fresh, so record would not renew on its own.
        assert!(!tx.lock().needs_renewal());
        let err = tx.record(|s| s.upsert(rg("rg1"))).await.unwrap_err();

        assert!(matches!(err, KestrelError::State(StateError::LockLost { .. })));
        assert!(store.load().await.unwrap().is_none());
    }
}
