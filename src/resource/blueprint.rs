//! Cluster blueprint.
//!
//! Expands a [`ClusterConfig`] into the descriptor set of a k3s cluster: one
//! resource group, one virtual network with one subnet, and for every node a
//! public IP, a network interface attached to both, and a VM on that
//! interface bootstrapped with k3s.

use serde_json::json;

use crate::config::ClusterConfig;

use super::descriptor::{ResourceDescriptor, ResourceKind};

/// Bootstrap profile recorded on every node.
pub const BOOTSTRAP_PROFILE: &str = "k3s";

/// Builds the descriptor set for a cluster configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClusterBlueprint<'a> {
    cluster: &'a ClusterConfig,
}

impl<'a> ClusterBlueprint<'a> {
    /// Creates a blueprint for the given cluster.
    #[must_use]
    pub const fn new(cluster: &'a ClusterConfig) -> Self {
        Self { cluster }
    }

    /// Returns every descriptor of the cluster, leaf resources first.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ResourceDescriptor> {
        let c = self.cluster;
        let mut out = Vec::with_capacity(3 + 3 * c.node_count as usize);

        out.push(
            ResourceDescriptor::new(ResourceKind::ResourceGroup, &c.resource_group)
                .with_attr("location", c.location.as_str()),
        );

        out.push(
            ResourceDescriptor::new(ResourceKind::VNet, &c.network.vnet_name)
                .with_attr("location", c.location.as_str())
                .with_attr("address_space", json!([c.network.address_space]))
                .with_ref(ResourceKind::ResourceGroup, &c.resource_group),
        );

        out.push(
            ResourceDescriptor::new(ResourceKind::Subnet, &c.network.subnet_name)
                .with_attr("address_prefix", c.network.subnet_prefix.as_str())
                .with_ref(ResourceKind::VNet, &c.network.vnet_name),
        );

        for i in 0..c.node_count {
            out.extend(self.node(i));
        }

        out
    }

    /// Descriptors for a single node: public IP, NIC and VM.
    fn node(&self, index: u32) -> [ResourceDescriptor; 3] {
        let c = self.cluster;
        let ip_name = ClusterConfig::public_ip_name(index);
        let nic_name = ClusterConfig::nic_name(index);
        let vm_name = ClusterConfig::node_name(index);

        let public_ip = ResourceDescriptor::new(ResourceKind::PublicIp, &ip_name)
            .with_attr("location", c.location.as_str())
            .with_attr("allocation_method", "Dynamic")
            .with_ref(ResourceKind::ResourceGroup, &c.resource_group);

        let nic = ResourceDescriptor::new(ResourceKind::Nic, &nic_name)
            .with_attr("location", c.location.as_str())
            .with_attr("ip_configuration", "ipconfig")
            .with_ref(ResourceKind::Subnet, &c.network.subnet_name)
            .with_ref(ResourceKind::PublicIp, &ip_name);

        let vm = ResourceDescriptor::new(ResourceKind::Vm, &vm_name)
            .with_attr("location", c.location.as_str())
            .with_attr("vm_size", c.vm_size.as_str())
            .with_attr("computer_name", vm_name.as_str())
            .with_attr("admin_username", c.admin_username.as_str())
            .with_attr("ssh_public_key", c.ssh_public_key.as_str())
            .with_attr(
                "image",
                json!({
                    "publisher": c.image.publisher,
                    "offer": c.image.offer,
                    "sku": c.image.sku,
                }),
            )
            .with_attr("bootstrap", BOOTSTRAP_PROFILE)
            .with_ref(ResourceKind::Nic, &nic_name);

        [public_ip, nic, vm]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImageConfig, NetworkConfig};
    use crate::resource::DescriptorValidator;

    fn cluster(nodes: u32) -> ClusterConfig {
        ClusterConfig {
            resource_group: String::from("k3s-rg"),
            location: String::from("East US"),
            vm_size: String::from("Standard_B2s"),
            admin_username: String::from("azureuser"),
            ssh_public_key: String::from("ssh-ed25519 AAAA"),
            node_count: nodes,
            network: NetworkConfig::default(),
            image: ImageConfig::default(),
        }
    }

    #[test]
    fn test_three_node_cluster_has_twelve_resources() {
        let config = cluster(3);
        let descriptors = ClusterBlueprint::new(&config).descriptors();
        assert_eq!(descriptors.len(), 12);

        let vms = descriptors.iter().filter(|d| d.kind == ResourceKind::Vm).count();
        assert_eq!(vms, 3);
    }

    #[test]
    fn test_blueprint_passes_validation() {
        let config = cluster(3);
        let descriptors = ClusterBlueprint::new(&config).descriptors();
        assert!(DescriptorValidator::new().validate(&descriptors).is_ok());
    }

    #[test]
    fn test_nic_attaches_subnet_and_public_ip() {
        let config = cluster(1);
        let descriptors = ClusterBlueprint::new(&config).descriptors();
        let nic = descriptors.iter().find(|d| d.name == "nic-0").unwrap();

        let refs: Vec<&str> = nic.reference_names().collect();
        assert!(refs.contains(&"k3s-subnet"));
        assert!(refs.contains(&"public-ip-0"));

        let vm = descriptors.iter().find(|d| d.name == "k3s-node-0").unwrap();
        assert_eq!(vm.attr_str("bootstrap"), Some("k3s"));
        assert_eq!(vm.attr_str("computer_name"), Some("k3s-node-0"));
    }
}
