//! Descriptor validation.
//!
//! Checks every descriptor against the requirements of its kind and reports
//! every problem found in a single pass.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;

use crate::error::{FieldError, ModelError, Result};

use super::descriptor::{ResourceDescriptor, ResourceKind};

/// Validator for resource descriptor sets.
#[derive(Debug, Default)]
pub struct DescriptorValidator;

impl DescriptorValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a descriptor set.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Validation`] listing every missing or invalid
    /// field if any descriptor is invalid.
    pub fn validate(&self, descriptors: &[ResourceDescriptor]) -> Result<()> {
        let errors = self.collect_errors(descriptors);

        if errors.is_empty() {
            debug!("Validated {} descriptors", descriptors.len());
            Ok(())
        } else {
            Err(ModelError::Validation { errors }.into())
        }
    }

    /// Returns every validation error in the set, in descriptor order.
    #[must_use]
    pub fn collect_errors(&self, descriptors: &[ResourceDescriptor]) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let kinds: HashMap<&str, ResourceKind> = descriptors
            .iter()
            .map(|d| (d.name.as_str(), d.kind))
            .collect();

        for descriptor in descriptors {
            let resource = if descriptor.name.is_empty() {
                format!("<unnamed {}>", descriptor.kind)
            } else {
                descriptor.name.clone()
            };

            if !seen.insert(descriptor.name.as_str()) {
                errors.push(field_error(&resource, "name", "duplicate resource name"));
            }

            if !is_valid_name(&descriptor.name) {
                errors.push(field_error(
                    &resource,
                    "name",
                    "must be lowercase alphanumeric with hyphens, starting with a letter",
                ));
            }

            Self::validate_attributes(descriptor, &resource, &mut errors);
            Self::validate_references(descriptor, &resource, &kinds, &mut errors);
        }

        errors
    }

    /// Checks required attributes for the descriptor's kind.
    fn validate_attributes(
        descriptor: &ResourceDescriptor,
        resource: &str,
        errors: &mut Vec<FieldError>,
    ) {
        for key in descriptor.kind.required_attributes() {
            match descriptor.attributes.get(*key) {
                None | Some(Value::Null) => errors.push(field_error(
                    resource,
                    &format!("attributes.{key}"),
                    &format!("is required for {}", descriptor.kind),
                )),
                Some(Value::String(s)) if s.trim().is_empty() => errors.push(field_error(
                    resource,
                    &format!("attributes.{key}"),
                    "must not be empty",
                )),
                Some(Value::Array(items)) if items.is_empty() => errors.push(field_error(
                    resource,
                    &format!("attributes.{key}"),
                    "must not be empty",
                )),
                Some(_) => {}
            }
        }
    }

    /// Checks reference shape: required kinds, self references and kind mismatches.
    fn validate_references(
        descriptor: &ResourceDescriptor,
        resource: &str,
        kinds: &HashMap<&str, ResourceKind>,
        errors: &mut Vec<FieldError>,
    ) {
        for required in descriptor.kind.required_references() {
            let count = descriptor
                .references
                .iter()
                .filter(|r| r.kind == *required)
                .count();
            if count != 1 {
                errors.push(field_error(
                    resource,
                    "references",
                    &format!("must reference exactly one {required} (found {count})"),
                ));
            }
        }

        for reference in &descriptor.references {
            if reference.name == descriptor.name {
                errors.push(field_error(resource, "references", "must not reference itself"));
                continue;
            }

            if let Some(actual) = kinds.get(reference.name.as_str())
                && *actual != reference.kind
            {
                errors.push(field_error(
                    resource,
                    "references",
                    &format!(
                        "'{}' is declared as {} but is a {actual}",
                        reference.name, reference.kind
                    ),
                ));
            }
        }
    }
}

fn field_error(resource: &str, field: &str, message: &str) -> FieldError {
    FieldError {
        resource: resource.to_string(),
        field: field.to_string(),
        message: message.to_string(),
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::Subnet, name)
            .with_attr("address_prefix", "10.0.1.0/24")
            .with_ref(ResourceKind::VNet, "vnet1")
    }

    fn vnet() -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceKind::VNet, "vnet1")
            .with_attr("location", "East US")
            .with_attr("address_space", serde_json::json!(["10.0.0.0/16"]))
            .with_ref(ResourceKind::ResourceGroup, "rg1")
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("k3s-node-0"));
        assert!(is_valid_name("rg1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Node"));
        assert!(!is_valid_name("0node"));
        assert!(!is_valid_name("node_0"));
        assert!(!is_valid_name("node-"));
        assert!(!is_valid_name("node--0"));
    }

    #[test]
    fn test_valid_set_passes() {
        let rg = ResourceDescriptor::new(ResourceKind::ResourceGroup, "rg1")
            .with_attr("location", "East US");
        let validator = DescriptorValidator::new();
        assert!(validator.validate(&[rg, vnet(), subnet("sub1")]).is_ok());
    }

    #[test]
    fn test_reports_every_missing_field_in_one_pass() {
        let bare_subnet = ResourceDescriptor::new(ResourceKind::Subnet, "sub1");
        let bare_vm = ResourceDescriptor::new(ResourceKind::Vm, "vm1").with_attr("location", "");

        let errors = DescriptorValidator::new().collect_errors(&[bare_subnet, bare_vm]);
        let fields: Vec<String> = errors
            .iter()
            .map(|e| format!("{}.{}", e.resource, e.field))
            .collect();

        assert!(fields.contains(&String::from("sub1.attributes.address_prefix")));
        assert!(fields.contains(&String::from("vm1.attributes.location")));
        assert!(fields.contains(&String::from("vm1.attributes.vm_size")));
        assert!(fields.contains(&String::from("vm1.attributes.admin_username")));
        assert!(fields.contains(&String::from("vm1.attributes.ssh_public_key")));
        // sub1 missing vnet ref, vm1 missing nic ref
        assert_eq!(fields.iter().filter(|f| f.ends_with(".references")).count(), 2);
    }

    #[test]
    fn test_rejects_kind_mismatch_and_self_reference() {
        let wrong = ResourceDescriptor::new(ResourceKind::Subnet, "sub1")
            .with_attr("address_prefix", "10.0.1.0/24")
            .with_ref(ResourceKind::VNet, "sub1");
        let mismatched = ResourceDescriptor::new(ResourceKind::Subnet, "sub2")
            .with_attr("address_prefix", "10.0.2.0/24")
            .with_ref(ResourceKind::VNet, "sub1");

        let errors = DescriptorValidator::new().collect_errors(&[wrong, mismatched]);
        assert!(errors.iter().any(|e| e.resource == "sub1" && e.message.contains("itself")));
        assert!(errors.iter().any(|e| e.resource == "sub2" && e.message.contains("is a subnet")));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let errors = DescriptorValidator::new().collect_errors(&[
            vnet(),
            subnet("sub1"),
            subnet("sub1"),
        ]);
        assert!(errors.iter().any(|e| e.message == "duplicate resource name"));
    }

    #[test]
    fn test_validate_returns_model_error() {
        let result = DescriptorValidator::new()
            .validate(&[ResourceDescriptor::new(ResourceKind::ResourceGroup, "rg1")]);
        assert!(matches!(
            result,
            Err(crate::error::KestrelError::Model(ModelError::Validation { .. }))
        ));
    }
}
