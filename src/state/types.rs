//! Persisted state types.
//!
//! The applied state set records, for every resource the engine has
//! successfully provisioned, the provider identifier and the attribute
//! snapshot that was applied. It is the source of truth for the next diff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, StateError};
use crate::resource::{Fingerprint, ResourceDescriptor, ResourceKind, ResourceRef};

/// Current version of the state format.
pub const STATE_VERSION: u32 = 2;

/// Oldest state version that can still be migrated on load.
pub const MIN_STATE_VERSION: u32 = 1;

/// Maximum number of history entries kept in the state file.
const MAX_HISTORY: usize = 100;

/// The complete applied state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppliedStateSet {
    /// State format version.
    pub version: u32,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Applied resources keyed by name.
    #[serde(default)]
    pub resources: BTreeMap<String, AppliedState>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// Last-applied record of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedState {
    /// Resource name.
    pub name: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier.
    pub provider_id: String,
    /// Attribute snapshot at apply time.
    pub attributes: BTreeMap<String, Value>,
    /// References at apply time; used to order deletes.
    #[serde(default)]
    pub references: BTreeSet<ResourceRef>,
    /// Fingerprint of `attributes`.
    pub fingerprint: String,
    /// When the resource was last applied.
    pub applied_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyHistoryEntry {
    /// When the cycle finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of cycle.
    pub operation: ApplyOperation,
    /// Fingerprint of the desired set the cycle planned against.
    pub plan_fingerprint: String,
    /// Resources created.
    pub created: usize,
    /// Resources updated.
    pub updated: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Operations that failed.
    pub failed: usize,
    /// Operations skipped.
    pub skipped: usize,
}

/// Kinds of apply cycles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Converge towards the configured cluster.
    Apply,
    /// Remove every managed resource.
    Destroy,
}

/// Version 1 layout: resources as a list, identifier stored as `id`.
#[derive(Debug, Deserialize)]
struct StateV1 {
    #[serde(default)]
    resources: Vec<AppliedStateV1>,
    last_updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AppliedStateV1 {
    name: String,
    kind: ResourceKind,
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
    applied_at: DateTime<Utc>,
}

impl AppliedStateSet {
    /// Creates a new empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION,
            serial: 0,
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Parses a state document, migrating older schema versions.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnsupportedVersion`] for versions outside
    /// [`MIN_STATE_VERSION`]..=[`STATE_VERSION`], or
    /// [`StateError::Corrupted`] if the document does not parse.
    pub fn from_json(content: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state file: {e}")))?;

        let version = document
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StateError::corrupted("State file has no numeric version"))?;

        match u32::try_from(version) {
            Ok(STATE_VERSION) => serde_json::from_value(document)
                .map_err(|e| StateError::corrupted(format!("Invalid state document: {e}")).into()),
            Ok(1) => Self::migrate_v1(document),
            _ => Err(StateError::UnsupportedVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                supported: format!("{MIN_STATE_VERSION}..={STATE_VERSION}"),
            }
            .into()),
        }
    }

    /// Upgrades a version 1 document.
    fn migrate_v1(document: Value) -> Result<Self> {
        let old: StateV1 = serde_json::from_value(document)
            .map_err(|e| StateError::corrupted(format!("Invalid v1 state document: {e}")))?;

        let hasher = Fingerprint::new();
        let resources = old
            .resources
            .into_iter()
            .map(|r| {
                let fingerprint = hasher.hash_attributes(&r.attributes);
                let state = AppliedState {
                    name: r.name.clone(),
                    kind: r.kind,
                    provider_id: r.id,
                    attributes: r.attributes,
                    references: BTreeSet::new(),
                    fingerprint,
                    applied_at: r.applied_at,
                };
                (r.name, state)
            })
            .collect();

        tracing::info!("Migrated state from version 1 to version {STATE_VERSION}");

        Ok(Self {
            version: STATE_VERSION,
            serial: 0,
            last_updated: old.last_updated,
            resources,
            history: Vec::new(),
        })
    }

    /// Serializes the state in the current format.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AppliedState> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource record.
    pub fn upsert(&mut self, resource: AppliedState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove(&mut self, name: &str) -> Option<AppliedState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns the number of applied resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for AppliedStateSet {
    fn default() -> Self {
        Self::new()
    }
}

impl AppliedState {
    /// Creates a record from the descriptor that was just applied.
    #[must_use]
    pub fn from_descriptor(descriptor: &ResourceDescriptor, provider_id: &str) -> Self {
        Self {
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            provider_id: provider_id.to_string(),
            attributes: descriptor.attributes.clone(),
            references: descriptor.references.clone(),
            fingerprint: Fingerprint::new().hash_attributes(&descriptor.attributes),
            applied_at: Utc::now(),
        }
    }
}

impl AppliedState {
    /// Returns true if this resource may still rest on `other` in the
    /// cloud, so `other` must not be deleted before this one is deleted or
    /// moved. Records without references (migrated from version 1) fall
    /// back to kind depth.
    #[must_use]
    pub fn may_depend_on(&self, other: &Self) -> bool {
        if self.references.is_empty() {
            self.kind.depth() > other.kind.depth()
        } else {
            self.references.iter().any(|r| r.name == other.name)
        }
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
