//! Typed resource descriptors.
//!
//! A descriptor is the declarative specification of one cloud resource:
//! its kind, a plan-unique name, the attributes we want it to have and the
//! typed references to the resources it depends on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Kinds of resources the engine knows how to provision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Container for every other resource of the cluster.
    ResourceGroup,
    /// Virtual network.
    #[serde(rename = "vnet")]
    VNet,
    /// Subnet of a virtual network.
    Subnet,
    /// Public IP address.
    PublicIp,
    /// Network interface.
    Nic,
    /// Virtual machine.
    Vm,
}

/// A typed reference to another descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    /// Kind the referenced resource must have.
    pub kind: ResourceKind,
    /// Name of the referenced resource.
    pub name: String,
}

/// Declarative specification of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Name, unique within a plan.
    pub name: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Resources this one depends on.
    #[serde(default)]
    pub references: BTreeSet<ResourceRef>,
}

impl ResourceKind {
    /// All kinds, leaf first.
    pub const ALL: [Self; 6] = [
        Self::ResourceGroup,
        Self::VNet,
        Self::Subnet,
        Self::PublicIp,
        Self::Nic,
        Self::Vm,
    ];

    /// Returns the wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource_group",
            Self::VNet => "vnet",
            Self::Subnet => "subnet",
            Self::PublicIp => "public_ip",
            Self::Nic => "nic",
            Self::Vm => "vm",
        }
    }

    /// Attributes every descriptor of this kind must declare.
    #[must_use]
    pub const fn required_attributes(self) -> &'static [&'static str] {
        match self {
            Self::ResourceGroup => &["location"],
            Self::VNet => &["location", "address_space"],
            Self::Subnet => &["address_prefix"],
            Self::PublicIp => &["location", "allocation_method"],
            Self::Nic => &["location"],
            Self::Vm => &["location", "vm_size", "admin_username", "ssh_public_key"],
        }
    }

    /// Length of the longest reference chain below this kind: a resource
    /// group is 0, a VM is 4. A resource can only rest on kinds of lower
    /// depth.
    #[must_use]
    pub const fn depth(self) -> usize {
        match self {
            Self::ResourceGroup => 0,
            Self::VNet | Self::PublicIp => 1,
            Self::Subnet => 2,
            Self::Nic => 3,
            Self::Vm => 4,
        }
    }

    /// Kinds this kind must reference exactly once.
    #[must_use]
    pub const fn required_references(self) -> &'static [Self] {
        match self {
            Self::ResourceGroup => &[],
            Self::VNet | Self::PublicIp => &[Self::ResourceGroup],
            Self::Subnet => &[Self::VNet],
            Self::Nic => &[Self::Subnet],
            Self::Vm => &[Self::Nic],
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl ResourceRef {
    /// Creates a new typed reference.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl ResourceDescriptor {
    /// Creates a descriptor with no attributes or references.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            attributes: BTreeMap::new(),
            references: BTreeSet::new(),
        }
    }

    /// Sets a desired attribute.
    #[must_use]
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds a typed reference.
    #[must_use]
    pub fn with_ref(mut self, kind: ResourceKind, name: impl Into<String>) -> Self {
        self.references.insert(ResourceRef::new(kind, name));
        self
    }

    /// Names of every referenced resource.
    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(|r| r.name.as_str())
    }

    /// Returns a string attribute, if present and a string.
    #[must_use]
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}
