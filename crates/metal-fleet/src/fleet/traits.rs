//! Fleet API trait and the node/network types it exchanges.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constraints::QueryParams;
use crate::error::Result;

/// Provider-assigned node reference (the node's resource URI).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap a resource reference.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The fleet system id: the last path segment of the resource URI.
    ///
    /// `/api/1.0/nodes/node-abc/` yields `node-abc`; a bare id is returned
    /// unchanged.
    #[must_use]
    pub fn system_id(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A MAC address attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress {
    /// MAC address (e.g., "aa:bb:cc:dd:ee:ff").
    pub mac_address: String,
}

/// A physical machine known to the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Fleet system id.
    pub system_id: String,
    /// Node hostname.
    #[serde(default)]
    pub hostname: String,
    /// Resource URI, used as the instance id.
    #[serde(default)]
    pub resource_uri: String,
    /// Architecture (e.g., "amd64/generic").
    #[serde(default)]
    pub architecture: Option<String>,
    /// User currently owning the node, if acquired.
    #[serde(default)]
    pub owner: Option<String>,
    /// Agent name the node was acquired with.
    #[serde(default)]
    pub agent_name: Option<String>,
    /// MAC addresses of the node's interfaces.
    #[serde(default)]
    pub macaddress_set: Vec<MacAddress>,
}

impl Node {
    /// Node with only a system id set.
    #[must_use]
    pub fn new(system_id: impl Into<String>) -> Self {
        let system_id = system_id.into();
        Self {
            resource_uri: format!("/api/1.0/nodes/{system_id}/"),
            system_id,
            hostname: String::new(),
            architecture: None,
            owner: None,
            agent_name: None,
            macaddress_set: Vec::new(),
        }
    }

    /// Instance id of this node.
    #[must_use]
    pub fn id(&self) -> InstanceId {
        if self.resource_uri.is_empty() {
            InstanceId::new(self.system_id.clone())
        } else {
            InstanceId::new(self.resource_uri.clone())
        }
    }

    /// Whether the node is currently acquired.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owner.as_deref().is_some_and(|o| !o.is_empty())
    }

    /// Base architecture without the sub-architecture (`amd64/generic` -> `amd64`).
    #[must_use]
    pub fn arch(&self) -> Option<&str> {
        self.architecture
            .as_deref()
            .and_then(|a| a.split('/').next())
            .filter(|a| !a.is_empty())
    }

    /// MAC addresses of the node.
    pub fn macs(&self) -> impl Iterator<Item = &str> {
        self.macaddress_set.iter().map(|m| m.mac_address.as_str())
    }
}

/// A fleet network segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDetails {
    /// Network name, also its provider id.
    pub name: String,
    /// Network address (e.g., "192.168.2.1").
    pub ip: String,
    /// Dotted netmask (e.g., "255.255.255.0").
    pub netmask: String,
    /// VLAN tag; `None` when untagged.
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
}

impl NetworkDetails {
    /// VLAN tag, 0 when untagged.
    #[must_use]
    pub fn vlan(&self) -> u16 {
        self.vlan_tag.unwrap_or(0)
    }
}

/// Filter for node listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Restrict to these system ids; empty means all.
    pub system_ids: Vec<String>,
    /// Restrict to nodes acquired with this agent name.
    pub agent_name: Option<String>,
}

/// Remote fleet inventory service.
///
/// Each method is a single remote call; ownership conflicts are resolved by
/// the fleet itself.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Acquire a free node matching the query parameters.
    ///
    /// Fails with [`FleetError::Capacity`](crate::FleetError::Capacity) when
    /// no node matches.
    async fn acquire(&self, params: &QueryParams) -> Result<Node>;

    /// Start an acquired node with first-boot user data.
    async fn start(&self, system_id: &str, user_data: &[u8]) -> Result<()>;

    /// Release nodes in one call. Nodes that are not owned are ignored.
    async fn release(&self, system_ids: &[String]) -> Result<()>;

    /// List nodes matching the filter.
    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>>;

    /// Networks the node is attached to.
    async fn list_networks(&self, system_id: &str) -> Result<Vec<NetworkDetails>>;

    /// MAC addresses connected to a network.
    async fn network_macs(&self, network: &str) -> Result<Vec<String>>;

    /// Raw hardware report (lshw XML) of a node.
    async fn hardware_report(&self, system_id: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_id_from_resource_uri() {
        assert_eq!(
            InstanceId::new("/api/1.0/nodes/node-abc/").system_id(),
            "node-abc"
        );
        assert_eq!(InstanceId::new("node-abc").system_id(), "node-abc");
    }

    #[test]
    fn test_node_deserialization_defaults() {
        let node: Node = serde_json::from_str(r#"{"system_id": "test-allocated"}"#).unwrap();
        assert_eq!(node.system_id, "test-allocated");
        assert!(!node.is_owned());
        assert_eq!(node.id().as_str(), "test-allocated");
        assert_eq!(node.arch(), None);
    }

    #[test]
    fn test_node_arch_and_ownership() {
        let node: Node = serde_json::from_str(
            r#"{"system_id": "n1", "architecture": "arm64/generic", "owner": "admin",
                "resource_uri": "/api/1.0/nodes/n1/",
                "macaddress_set": [{"mac_address": "aa:bb:cc:dd:ee:ff"}]}"#,
        )
        .unwrap();
        assert_eq!(node.arch(), Some("arm64"));
        assert!(node.is_owned());
        assert_eq!(node.id().system_id(), "n1");
        assert_eq!(node.macs().collect::<Vec<_>>(), vec!["aa:bb:cc:dd:ee:ff"]);
    }

    #[test]
    fn test_network_untagged_vlan() {
        let net: NetworkDetails = serde_json::from_str(
            r#"{"name": "LAN", "ip": "192.168.2.1", "netmask": "255.255.255.0", "vlan_tag": null}"#,
        )
        .unwrap();
        assert_eq!(net.vlan(), 0);
    }
}
