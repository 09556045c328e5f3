//! Cluster bootstrap state persistence.
//!
//! Records which nodes run the orchestrator's own control plane. The record
//! is a single YAML object in durable storage; its absence means the cluster
//! was never bootstrapped. Writes replace the whole record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FleetError, Result};
use crate::fleet::InstanceId;
use crate::storage::ObjectStorage;

/// Storage key of the bootstrap state record.
pub const STATE_FILE: &str = "provider-state";

/// Current record format version.
pub const STATE_VERSION: u32 = 1;

/// Persisted bootstrap state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapState {
    /// Record format version; records written before versioning read as 0.
    #[serde(default)]
    pub version: u32,
    /// Instances running the control plane.
    #[serde(rename = "state-instances", default)]
    pub state_instances: Vec<InstanceId>,
    /// Time of the last write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BootstrapState {
    /// State recording the given control-plane instances.
    #[must_use]
    pub fn new(state_instances: Vec<InstanceId>) -> Self {
        Self {
            version: STATE_VERSION,
            state_instances,
            updated_at: None,
        }
    }
}

/// Reads and writes the bootstrap state record.
#[derive(Clone)]
pub struct BootstrapStateStore {
    storage: Arc<dyn ObjectStorage>,
}

impl BootstrapStateStore {
    /// Create a store over durable storage.
    #[must_use]
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }

    /// Load the whole record.
    ///
    /// # Errors
    /// Returns [`FleetError::NotBootstrapped`] when no record exists, or a
    /// parse error when the record is unreadable.
    pub async fn load(&self) -> Result<BootstrapState> {
        let data = match self.storage.get(STATE_FILE).await {
            Ok(data) => data,
            Err(FleetError::ObjectNotFound(_)) => return Err(FleetError::NotBootstrapped),
            Err(e) => return Err(e),
        };

        let state: BootstrapState = serde_yaml::from_slice(&data)?;
        if state.version > STATE_VERSION {
            return Err(FleetError::Config(format!(
                "bootstrap state version {} is newer than supported version {STATE_VERSION}",
                state.version
            )));
        }

        debug!(instances = state.state_instances.len(), "Loaded bootstrap state");
        Ok(state)
    }

    /// Replace the whole record.
    ///
    /// # Errors
    /// Returns an error if the record cannot be serialized or stored.
    pub async fn save(&self, state: &BootstrapState) -> Result<()> {
        let mut state = state.clone();
        state.version = STATE_VERSION;
        state.updated_at = Some(Utc::now());

        let data = serde_yaml::to_string(&state)?;
        self.storage.put(STATE_FILE, data.as_bytes()).await?;

        info!(
            instances = state.state_instances.len(),
            "Saved bootstrap state"
        );
        Ok(())
    }

    /// Instances running the control plane.
    ///
    /// Order is not meaningful; compare as a set.
    ///
    /// # Errors
    /// Returns [`FleetError::NotBootstrapped`] when no record exists.
    pub async fn read_state_server_instances(&self) -> Result<Vec<InstanceId>> {
        Ok(self.load().await?.state_instances)
    }

    /// Record the control-plane instances, replacing any previous record.
    ///
    /// # Errors
    /// Returns an error if the record cannot be stored.
    pub async fn write_state(&self, ids: &[InstanceId]) -> Result<()> {
        self.save(&BootstrapState::new(ids.to_vec())).await
    }

    /// Delete the record.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn remove(&self) -> Result<()> {
        self.storage.remove(STATE_FILE).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> (BootstrapStateStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (BootstrapStateStore::new(storage.clone()), storage)
    }

    fn ids(names: &[&str]) -> Vec<InstanceId> {
        names.iter().map(|n| InstanceId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_not_bootstrapped_without_record() {
        let (store, _) = store();
        assert!(matches!(
            store.read_state_server_instances().await,
            Err(FleetError::NotBootstrapped)
        ));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (store, _) = store();
        for expected in [ids(&[]), ids(&["inst-0"]), ids(&["inst-0", "inst-1"])] {
            store.write_state(&expected).await.unwrap();
            let read: BTreeSet<_> = store
                .read_state_server_instances()
                .await
                .unwrap()
                .into_iter()
                .collect();
            assert_eq!(read, expected.into_iter().collect::<BTreeSet<_>>());
        }
    }

    #[tokio::test]
    async fn test_write_replaces_whole_record() {
        let (store, _) = store();
        store.write_state(&ids(&["a", "b"])).await.unwrap();
        store.write_state(&ids(&["c"])).await.unwrap();
        assert_eq!(store.read_state_server_instances().await.unwrap(), ids(&["c"]));
    }

    #[tokio::test]
    async fn test_reads_unversioned_record() {
        let (store, storage) = store();
        storage
            .put(STATE_FILE, b"state-instances:\n- /api/1.0/nodes/node0/\n")
            .await
            .unwrap();
        let state = store.load().await.unwrap();
        assert_eq!(state.version, 0);
        assert_eq!(state.state_instances, ids(&["/api/1.0/nodes/node0/"]));
    }

    #[tokio::test]
    async fn test_rejects_newer_record() {
        let (store, storage) = store();
        storage
            .put(STATE_FILE, b"version: 99\nstate-instances: []\n")
            .await
            .unwrap();
        assert!(matches!(store.load().await, Err(FleetError::Config(_))));
    }

    #[tokio::test]
    async fn test_remove_forgets_bootstrap() {
        let (store, _) = store();
        store.write_state(&ids(&["a"])).await.unwrap();
        store.remove().await.unwrap();
        assert!(matches!(store.load().await, Err(FleetError::NotBootstrapped)));
    }
}
