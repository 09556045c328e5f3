//! In-memory fleet used by unit tests.
//!
//! Records the operations performed on each node and the parameters each
//! call was made with, and keeps the ownership map the real fleet would.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::traits::{FleetApi, NetworkDetails, Node, NodeFilter};
use crate::constraints::{QueryParams, PARAM_AGENT_NAME, PARAM_ARCH, PARAM_NAME};
use crate::error::{FleetError, Result};

#[derive(Default)]
struct FakeState {
    nodes: Vec<Node>,
    details: HashMap<String, String>,
    networks: Vec<NetworkDetails>,
    // (system id, network name, mac)
    connections: Vec<(String, String, String)>,
    node_operations: HashMap<String, Vec<String>>,
    request_values: HashMap<String, Vec<QueryParams>>,
    user_data: HashMap<String, Vec<u8>>,
    nodes_operations: Vec<String>,
    failing_releases: HashSet<String>,
}

/// Fake fleet with a process-local node inventory.
#[derive(Default)]
pub struct FakeFleet {
    state: Mutex<FakeState>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake fleet lock poisoned");
        f(&mut state)
    }

    /// Add a free amd64 node.
    pub fn add_node(&self, system_id: &str, hostname: &str) -> Node {
        let mut node = Node::new(system_id);
        node.hostname = hostname.to_string();
        node.architecture = Some("amd64/generic".to_string());
        self.add(node)
    }

    /// Add a fully specified node.
    pub fn add(&self, node: Node) -> Node {
        self.with_state(|s| s.nodes.push(node.clone()));
        node
    }

    /// Mark a node as acquired by `agent_name`, as if acquired earlier.
    pub fn set_owned(&self, system_id: &str, agent_name: &str) {
        self.with_state(|s| {
            if let Some(node) = s.nodes.iter_mut().find(|n| n.system_id == system_id) {
                node.owner = Some("admin".to_string());
                node.agent_name = Some(agent_name.to_string());
            }
        });
    }

    pub fn is_owned(&self, system_id: &str) -> bool {
        self.with_state(|s| {
            s.nodes
                .iter()
                .any(|n| n.system_id == system_id && n.is_owned())
        })
    }

    pub fn add_node_details(&self, system_id: &str, lshw: &str) {
        self.with_state(|s| {
            s.details.insert(system_id.to_string(), lshw.to_string());
        });
    }

    /// Add a network named `name` with address `192.168.{id}.1/24`.
    pub fn add_network(&self, name: &str, id: u8, vlan_tag: u16) {
        self.with_state(|s| {
            s.networks.push(NetworkDetails {
                name: name.to_string(),
                ip: format!("192.168.{id}.1"),
                netmask: "255.255.255.0".to_string(),
                vlan_tag: (vlan_tag != 0).then_some(vlan_tag),
                description: format!("{name}_{id}_{vlan_tag}"),
            });
        });
    }

    pub fn connect(&self, system_id: &str, network: &str, mac: &str) {
        self.with_state(|s| {
            s.connections
                .push((system_id.to_string(), network.to_string(), mac.to_string()));
        });
    }

    /// Make any release call covering `system_id` fail.
    pub fn fail_release_of(&self, system_id: &str) {
        self.with_state(|s| {
            s.failing_releases.insert(system_id.to_string());
        });
    }

    /// Operations performed on individual nodes.
    pub fn node_operations(&self) -> HashMap<String, Vec<String>> {
        self.with_state(|s| s.node_operations.clone())
    }

    /// Operations performed on the node collection (bulk calls).
    pub fn nodes_operations(&self) -> Vec<String> {
        self.with_state(|s| s.nodes_operations.clone())
    }

    pub fn request_values(&self, system_id: &str) -> Vec<QueryParams> {
        self.with_state(|s| {
            s.request_values
                .get(system_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn user_data(&self, system_id: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.user_data.get(system_id).cloned())
    }

    fn record(s: &mut FakeState, system_id: &str, op: &str, params: QueryParams) {
        s.node_operations
            .entry(system_id.to_string())
            .or_default()
            .push(op.to_string());
        s.request_values
            .entry(system_id.to_string())
            .or_default()
            .push(params);
    }
}

#[async_trait]
impl FleetApi for FakeFleet {
    async fn acquire(&self, params: &QueryParams) -> Result<Node> {
        self.with_state(|s| {
            let name = params.get(PARAM_NAME);
            let arch = params.get(PARAM_ARCH);
            let node = s
                .nodes
                .iter_mut()
                .filter(|n| !n.is_owned())
                .filter(|n| name.map_or(true, |h| n.hostname == h))
                .find(|n| arch.map_or(true, |a| n.arch() == Some(a)))
                .ok_or_else(|| {
                    FleetError::Capacity("409 CONFLICT (No matching node is available.)".into())
                })?;

            node.owner = Some("admin".to_string());
            node.agent_name = params.get(PARAM_AGENT_NAME).map(str::to_string);
            let node = node.clone();
            Self::record(s, &node.system_id, "acquire", params.clone());
            Ok(node)
        })
    }

    async fn start(&self, system_id: &str, user_data: &[u8]) -> Result<()> {
        self.with_state(|s| {
            if !s.nodes.iter().any(|n| n.system_id == system_id) {
                return Err(FleetError::Api {
                    operation: "start",
                    target: system_id.to_string(),
                    status: 404,
                    message: format!("no node {system_id}"),
                });
            }
            let mut params = QueryParams::new();
            params.set("user_data", String::from_utf8_lossy(user_data));
            Self::record(s, system_id, "start", params);
            s.user_data.insert(system_id.to_string(), user_data.to_vec());
            Ok(())
        })
    }

    async fn release(&self, system_ids: &[String]) -> Result<()> {
        self.with_state(|s| {
            s.nodes_operations.push("release".to_string());
            if let Some(id) = system_ids.iter().find(|id| s.failing_releases.contains(*id)) {
                return Err(FleetError::Api {
                    operation: "release",
                    target: id.clone(),
                    status: 500,
                    message: format!("cannot release {id}"),
                });
            }
            for node in s
                .nodes
                .iter_mut()
                .filter(|n| system_ids.contains(&n.system_id))
            {
                node.owner = None;
                node.agent_name = None;
            }
            Ok(())
        })
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        self.with_state(|s| {
            Ok(s.nodes
                .iter()
                .filter(|n| filter.system_ids.is_empty() || filter.system_ids.contains(&n.system_id))
                .filter(|n| {
                    filter
                        .agent_name
                        .as_ref()
                        .map_or(true, |a| n.agent_name.as_ref() == Some(a))
                })
                .cloned()
                .collect())
        })
    }

    async fn list_networks(&self, system_id: &str) -> Result<Vec<NetworkDetails>> {
        self.with_state(|s| {
            let names: HashSet<&str> = s
                .connections
                .iter()
                .filter(|(node, _, _)| node == system_id)
                .map(|(_, net, _)| net.as_str())
                .collect();
            Ok(s.networks
                .iter()
                .filter(|n| names.contains(n.name.as_str()))
                .cloned()
                .collect())
        })
    }

    async fn network_macs(&self, network: &str) -> Result<Vec<String>> {
        self.with_state(|s| {
            Ok(s.connections
                .iter()
                .filter(|(_, net, _)| net == network)
                .map(|(_, _, mac)| mac.clone())
                .collect())
        })
    }

    async fn hardware_report(&self, system_id: &str) -> Result<Vec<u8>> {
        self.with_state(|s| {
            s.details
                .get(system_id)
                .map(|d| d.as_bytes().to_vec())
                .ok_or_else(|| FleetError::Api {
                    operation: "node details",
                    target: system_id.to_string(),
                    status: 404,
                    message: format!("no details for {system_id}"),
                })
        })
    }
}
