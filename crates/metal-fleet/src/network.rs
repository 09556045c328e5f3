//! Network interface resolution for acquired nodes.
//!
//! Joins the interfaces found in a node's hardware report with the fleet's
//! network memberships (network, MAC) to describe which interface sits on
//! which network, and whether it should be brought up.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::fleet::{FleetApi, NetworkDetails, Node};
use crate::hardware::{discover_interfaces, DiscoveredInterface};

/// A network interface of a node, ready to be configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// MAC address of the interface.
    pub mac_address: String,
    /// Kernel interface name (e.g., "eth0").
    pub interface_name: String,
    /// Address block, `ip/prefix`.
    pub cidr: String,
    /// VLAN tag, 0 when untagged.
    pub vlan_tag: u16,
    /// Network name.
    pub network_name: String,
    /// Provider-side network id.
    pub provider_id: String,
    /// Whether the interface should be left down.
    pub disabled: bool,
}

/// A MAC address attached to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    /// The network.
    pub network: NetworkDetails,
    /// MAC address connected to it.
    pub mac: String,
}

/// Render `ip/prefix` from a dotted netmask.
///
/// # Errors
/// Returns [`FleetError::Config`] if the netmask is not a contiguous IPv4 mask.
pub fn cidr(ip: &str, netmask: &str) -> Result<String> {
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| FleetError::Config(format!("invalid netmask {netmask:?}")))?;
    let bits = u32::from(mask);
    if bits.leading_ones() != bits.count_ones() {
        return Err(FleetError::Config(format!(
            "netmask {netmask} is not contiguous"
        )));
    }
    Ok(format!("{ip}/{}", bits.count_ones()))
}

/// Describe every interface that has a network membership.
///
/// Output follows interface discovery order; memberships whose MAC matches
/// no interface are dropped. With an empty `include` set nothing is
/// disabled; otherwise networks outside it are disabled.
///
/// # Errors
/// Returns an error if a matched network has an invalid netmask.
pub fn resolve_interfaces(
    interfaces: &[DiscoveredInterface],
    memberships: &[Membership],
    include: &[String],
) -> Result<Vec<NetworkInfo>> {
    let include: HashSet<&str> = include.iter().map(String::as_str).collect();
    let mut result = Vec::new();

    for iface in interfaces {
        for membership in memberships.iter().filter(|m| m.mac == iface.mac) {
            let net = &membership.network;
            result.push(NetworkInfo {
                mac_address: iface.mac.clone(),
                interface_name: iface.name.clone(),
                cidr: cidr(&net.ip, &net.netmask)?,
                vlan_tag: net.vlan(),
                network_name: net.name.clone(),
                provider_id: net.name.clone(),
                disabled: !include.is_empty() && !include.contains(net.name.as_str()),
            });
        }
    }

    Ok(result)
}

/// Resolves node network interfaces through the fleet API.
#[derive(Clone)]
pub struct NetworkResolver {
    fleet: Arc<dyn FleetApi>,
}

impl NetworkResolver {
    #[must_use]
    pub fn new(fleet: Arc<dyn FleetApi>) -> Self {
        Self { fleet }
    }

    /// Interfaces listed in the node's hardware report, in document order.
    ///
    /// # Errors
    /// Returns an error if the report cannot be fetched or parsed.
    pub async fn interfaces(&self, system_id: &str) -> Result<Vec<DiscoveredInterface>> {
        let report = self.fleet.hardware_report(system_id).await?;
        discover_interfaces(&report)
    }

    /// Networks the node is attached to.
    ///
    /// # Errors
    /// Returns an error if the fleet call fails.
    pub async fn node_networks(&self, system_id: &str) -> Result<Vec<NetworkDetails>> {
        self.fleet.list_networks(system_id).await
    }

    /// Every (network, MAC) pair for the node's networks.
    ///
    /// # Errors
    /// Returns an error if a fleet call fails.
    pub async fn memberships(&self, system_id: &str) -> Result<Vec<Membership>> {
        let mut memberships = Vec::new();
        for network in self.node_networks(system_id).await? {
            let macs = self.fleet.network_macs(&network.name).await?;
            memberships.extend(macs.into_iter().map(|mac| Membership {
                network: network.clone(),
                mac,
            }));
        }
        Ok(memberships)
    }

    /// Describe the node's network interfaces, enabling those on `include`.
    ///
    /// # Errors
    /// Returns an error if the hardware report is malformed or a fleet call
    /// fails. No matching interfaces is not an error.
    pub async fn setup_networks(&self, node: &Node, include: &[String]) -> Result<Vec<NetworkInfo>> {
        let interfaces = self.interfaces(&node.system_id).await?;
        let memberships = self.memberships(&node.system_id).await?;
        let info = resolve_interfaces(&interfaces, &memberships, include)?;

        debug!(
            system_id = %node.system_id,
            interfaces = interfaces.len(),
            memberships = memberships.len(),
            resolved = info.len(),
            "Resolved node networks"
        );
        Ok(info)
    }
}
