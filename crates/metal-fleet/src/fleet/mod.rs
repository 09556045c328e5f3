//! Fleet API abstraction and the MAAS implementation.

#[cfg(test)]
pub(crate) mod fake;
pub mod maas;
mod traits;

pub use traits::{FleetApi, InstanceId, MacAddress, NetworkDetails, Node, NodeFilter};
