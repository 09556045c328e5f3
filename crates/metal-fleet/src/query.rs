//! Lookup of previously allocated nodes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{FleetError, Result};
use crate::fleet::{FleetApi, InstanceId, Node, NodeFilter};
use crate::state::BootstrapStateStore;

/// Outcome of a batch lookup.
///
/// Transport failures are reported separately as `Err`; this type only
/// describes how many of the requested ids were found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceLookup {
    /// Every id resolved; nodes are in request order.
    Complete(Vec<Node>),
    /// Some ids resolved. One slot per requested id, `None` where unresolved.
    Partial(Vec<Option<Node>>),
    /// Nothing was requested, or nothing resolved.
    Empty,
}

impl InstanceLookup {
    /// Classify positional results.
    #[must_use]
    pub fn from_slots(slots: Vec<Option<Node>>) -> Self {
        let found = slots.iter().filter(|s| s.is_some()).count();
        if found == 0 {
            Self::Empty
        } else if found == slots.len() {
            Self::Complete(slots.into_iter().flatten().collect())
        } else {
            Self::Partial(slots)
        }
    }

    /// The error this outcome corresponds to, if any.
    #[must_use]
    pub fn error(&self) -> Option<FleetError> {
        match self {
            Self::Complete(_) => None,
            Self::Partial(_) => Some(FleetError::PartialInstances),
            Self::Empty => Some(FleetError::NoInstances),
        }
    }

    /// Whether every requested id resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// One slot per requested id. Empty when nothing resolved.
    #[must_use]
    pub fn into_slots(self) -> Vec<Option<Node>> {
        match self {
            Self::Complete(nodes) => nodes.into_iter().map(Some).collect(),
            Self::Partial(slots) => slots,
            Self::Empty => Vec::new(),
        }
    }

    /// Nodes when every id resolved.
    ///
    /// # Errors
    /// Returns [`FleetError::PartialInstances`] or [`FleetError::NoInstances`].
    pub fn into_result(self) -> Result<Vec<Node>> {
        match self {
            Self::Complete(nodes) => Ok(nodes),
            Self::Partial(_) => Err(FleetError::PartialInstances),
            Self::Empty => Err(FleetError::NoInstances),
        }
    }
}

/// Batch lookup of nodes by instance id.
#[derive(Clone)]
pub struct InstanceQuery {
    fleet: Arc<dyn FleetApi>,
    agent_name: String,
}

impl InstanceQuery {
    /// Create a query engine for nodes acquired under `agent_name`.
    #[must_use]
    pub fn new(fleet: Arc<dyn FleetApi>, agent_name: impl Into<String>) -> Self {
        Self {
            fleet,
            agent_name: agent_name.into(),
        }
    }

    /// Look up nodes by id.
    ///
    /// An empty request yields [`InstanceLookup::Empty`] without calling the
    /// fleet.
    ///
    /// # Errors
    /// Returns an error only if the fleet call fails.
    pub async fn lookup(&self, ids: &[InstanceId]) -> Result<InstanceLookup> {
        if ids.is_empty() {
            return Ok(InstanceLookup::Empty);
        }

        let filter = NodeFilter {
            system_ids: ids.iter().map(|id| id.system_id().to_string()).collect(),
            agent_name: None,
        };
        let by_system_id: HashMap<String, Node> = self
            .fleet
            .list_nodes(&filter)
            .await?
            .into_iter()
            .map(|n| (n.system_id.clone(), n))
            .collect();

        let slots = ids
            .iter()
            .map(|id| by_system_id.get(id.system_id()).cloned())
            .collect();

        let outcome = InstanceLookup::from_slots(slots);
        debug!(requested = ids.len(), complete = outcome.is_complete(), "Looked up instances");
        Ok(outcome)
    }

    /// Every node acquired under this orchestrator's agent name.
    ///
    /// # Errors
    /// Returns an error if the fleet call fails.
    pub async fn list_all(&self) -> Result<Vec<Node>> {
        let filter = NodeFilter {
            system_ids: Vec::new(),
            agent_name: Some(self.agent_name.clone()),
        };
        Ok(self
            .fleet
            .list_nodes(&filter)
            .await?
            .into_iter()
            .filter(Node::is_owned)
            .collect())
    }

    /// Nodes recorded as running the control plane.
    ///
    /// # Errors
    /// Returns [`FleetError::NotBootstrapped`] when no state is recorded, or
    /// an error if the fleet call fails.
    pub async fn control_plane_nodes(&self, state: &BootstrapStateStore) -> Result<InstanceLookup> {
        let ids = state.read_state_server_instances().await?;
        self.lookup(&ids).await
    }
}
