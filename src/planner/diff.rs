//! Field-level comparison of a desired descriptor against its applied record.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::resource::{Fingerprint, ResourceDescriptor, ResourceRef};
use crate::state::AppliedState;

/// Engine for computing diffs between desired and applied resources.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Attribute hasher.
    hasher: Fingerprint,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffDetail {
    /// Field that differs (`attributes.<key>` or `references`).
    pub field: String,
    /// Applied value.
    pub old_value: Option<Value>,
    /// Desired value.
    pub new_value: Option<Value>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: Fingerprint::new(),
        }
    }

    /// Lists every field where `desired` differs from `applied`.
    ///
    /// An empty result means the resource is unchanged. Records migrated
    /// from older state carry no references; those are not compared.
    #[must_use]
    pub fn diff(&self, desired: &ResourceDescriptor, applied: &AppliedState) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        if self.hasher.hash_attributes(&desired.attributes) != applied.fingerprint {
            let keys: BTreeSet<&String> = desired
                .attributes
                .keys()
                .chain(applied.attributes.keys())
                .collect();

            for key in keys {
                let old_value = applied.attributes.get(key);
                let new_value = desired.attributes.get(key);
                if old_value != new_value {
                    details.push(DiffDetail {
                        field: format!("attributes.{key}"),
                        old_value: old_value.cloned(),
                        new_value: new_value.cloned(),
                    });
                }
            }

            // The stored fingerprint disagrees with the stored snapshot.
            if details.is_empty() {
                details.push(DiffDetail {
                    field: String::from("fingerprint"),
                    old_value: Some(Value::from(applied.fingerprint.clone())),
                    new_value: Some(Value::from(self.hasher.hash_attributes(&desired.attributes))),
                });
            }
        }

        if !applied.references.is_empty() && applied.references != desired.references {
            details.push(DiffDetail {
                field: String::from("references"),
                old_value: Some(refs_value(&applied.references)),
                new_value: Some(refs_value(&desired.references)),
            });
        }

        details
    }
}

fn refs_value(references: &BTreeSet<ResourceRef>) -> Value {
    Value::Array(references.iter().map(|r| Value::from(r.to_string())).collect())
}

impl std::fmt::Display for DiffDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("(none)"), Value::to_string);
        write!(f, "{}: {} -> {}", self.field, show(&self.old_value), show(&self.new_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    fn vm(size: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Vm, "k3s-node-0")
            .with_attr("location", "East US")
            .with_attr("vm_size", size)
            .with_ref(ResourceKind::Nic, "nic-0")
    }

    #[test]
    fn test_identical_resource_has_no_diff() {
        let desired = vm("Standard_B2s");
        let applied = AppliedState::from_descriptor(&desired, "vm-1");
        assert!(DiffEngine::new().diff(&desired, &applied).is_empty());
    }

    #[test]
    fn test_changed_attribute_is_reported() {
        let applied = AppliedState::from_descriptor(&vm("Standard_B2s"), "vm-1");
        let details = DiffEngine::new().diff(&vm("Standard_D4s_v3"), &applied);

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].field, "attributes.vm_size");
        assert_eq!(details[0].old_value, Some(Value::from("Standard_B2s")));
        assert_eq!(details[0].new_value, Some(Value::from("Standard_D4s_v3")));
    }

    #[test]
    fn test_changed_reference_is_reported() {
        let applied = AppliedState::from_descriptor(&vm("Standard_B2s"), "vm-1");
        let mut desired = vm("Standard_B2s");
        desired.references.clear();
        let desired = desired.with_ref(ResourceKind::Nic, "nic-9");

        let details = DiffEngine::new().diff(&desired, &applied);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].field, "references");
    }

    #[test]
    fn test_migrated_record_ignores_references() {
        let mut applied = AppliedState::from_descriptor(&vm("Standard_B2s"), "vm-1");
        applied.references.clear();
        assert!(DiffEngine::new().diff(&vm("Standard_B2s"), &applied).is_empty());
    }
}
