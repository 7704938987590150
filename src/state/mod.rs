//! Applied-state persistence.
//!
//! Records what has been provisioned so the next run can diff against it,
//! guarded by a lock file so that only one apply cycle writes at a time.

mod store;
mod local;
mod lock;
mod transaction;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, renew_interval, LockInfo, LOCK_EXPIRY_SECS, LOCK_RENEW_INTERVAL_SECS};
pub use transaction::{with_transaction, StateTransaction};
pub use types::{
    AppliedState, AppliedStateSet, ApplyHistoryEntry, ApplyOperation, MIN_STATE_VERSION,
    STATE_VERSION,
};
