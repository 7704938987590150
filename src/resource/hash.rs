//! Deterministic fingerprints for attribute snapshots and descriptor sets.
//!
//! Fingerprints are stored next to every applied resource and on each plan
//! so that a change in desired state is visible without a field-by-field
//! comparison.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::descriptor::ResourceDescriptor;

/// Hasher for computing fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fingerprint;

impl Fingerprint {
    /// Creates a new fingerprint hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of an attribute map.
    ///
    /// Keys are visited in order, so two maps with the same content always
    /// produce the same fingerprint.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a whole descriptor set, independent of
    /// the order descriptors were declared in.
    #[must_use]
    pub fn hash_descriptors(&self, descriptors: &[ResourceDescriptor]) -> String {
        let mut sorted: Vec<&ResourceDescriptor> = descriptors.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut hasher = Sha256::new();
        for descriptor in sorted {
            hasher.update(descriptor.kind.as_str().as_bytes());
            hasher.update(descriptor.name.as_bytes());
            hasher.update(self.hash_attributes(&descriptor.attributes).as_bytes());
            for reference in &descriptor.references {
                hasher.update(reference.to_string().as_bytes());
            }
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }

    /// Returns the short form of a fingerprint used in output.
    #[must_use]
    pub fn short(hash: &str) -> &str {
        hash.get(..8).unwrap_or(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;

    #[test]
    fn test_attribute_hash_is_deterministic() {
        let mut a = BTreeMap::new();
        a.insert(String::from("location"), Value::from("East US"));
        a.insert(String::from("vm_size"), Value::from("Standard_B2s"));

        let mut b = BTreeMap::new();
        b.insert(String::from("vm_size"), Value::from("Standard_B2s"));
        b.insert(String::from("location"), Value::from("East US"));

        let hasher = Fingerprint::new();
        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));

        b.insert(String::from("vm_size"), Value::from("Standard_B4ms"));
        assert_ne!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_descriptor_hash_ignores_declaration_order() {
        let rg = ResourceDescriptor::new(ResourceKind::ResourceGroup, "rg").with_attr("location", "x");
        let ip = ResourceDescriptor::new(ResourceKind::PublicIp, "ip")
            .with_attr("location", "x")
            .with_ref(ResourceKind::ResourceGroup, "rg");

        let hasher = Fingerprint::new();
        assert_eq!(
            hasher.hash_descriptors(&[rg.clone(), ip.clone()]),
            hasher.hash_descriptors(&[ip, rg])
        );
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(Fingerprint::short("0123456789abcdef"), "01234567");
        assert_eq!(Fingerprint::short("abc"), "abc");
    }
}
