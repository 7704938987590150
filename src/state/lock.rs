//! State lock records.
//!
//! The lock file names one holder at a time. A lock lapses
//! [`LOCK_EXPIRY_SECS`] after it was taken or last renewed; an apply cycle
//! renews it every [`LOCK_RENEW_INTERVAL_SECS`] while it runs, so only an
//! abandoned lock can be taken over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Seconds a lock stays valid after it was taken or renewed.
pub const LOCK_EXPIRY_SECS: i64 = 1800;

/// Seconds between renewals while an apply cycle holds the lock.
pub const LOCK_RENEW_INTERVAL_SECS: u64 = 600;

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock lapses unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Times the holder has extended the lock.
    #[serde(default)]
    pub renewals: u32,
}

impl LockInfo {
    /// Creates a fresh lock for `holder`.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
            renewals: 0,
        }
    }

    /// Checks if the lock has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry a full period past now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
        self.renewals = self.renewals.saturating_add(1);
    }

    /// Returns true once less than half of the validity period is left.
    #[must_use]
    pub fn needs_renewal(&self) -> bool {
        self.remaining_secs() < LOCK_EXPIRY_SECS / 2
    }

    /// Seconds until the lock lapses; zero once expired.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Interval at which a running cycle renews its lock.
#[must_use]
pub const fn renew_interval() -> Duration {
    Duration::from_secs(LOCK_RENEW_INTERVAL_SECS)
}

/// Builds a holder name from host, process id and a random suffix.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("{hostname}-{}-{suffix}", std::process::id())
}
