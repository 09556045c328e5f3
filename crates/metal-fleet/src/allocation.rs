//! Node allocation: acquire, start, release and full teardown.
//!
//! A provisioning attempt moves through [`ProvisionState`]:
//! `Requested -> Acquiring -> Acquired -> Starting -> Started`, or ends in
//! `Failed`. Anything that fails after the node was acquired releases it
//! again so no machine is left claimed by a half-started attempt.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constraints::{
    translate, translate_network_filter, ConstraintSet, ConstraintValidator, NetworkFilter,
    PARAM_AGENT_NAME, PARAM_NAME,
};
use crate::error::{FleetError, Result};
use crate::fleet::{FleetApi, InstanceId, Node};
use crate::network::{NetworkInfo, NetworkResolver};
use crate::query::InstanceQuery;
use crate::state::BootstrapStateStore;
use crate::storage::ObjectStorage;
use crate::tools::{self, ToolsVersion};
use crate::userdata::{CloudConfigBuilder, UserDataBuilder};

/// Stage of a provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    /// Request received, nothing sent to the fleet yet.
    Requested,
    /// Acquire call in flight.
    Acquiring,
    /// Node claimed.
    Acquired,
    /// Networks resolved, start call in flight.
    Starting,
    /// Node started.
    Started,
    /// Attempt failed.
    Failed,
}

impl ProvisionState {
    /// Whether `next` may follow this state.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Requested, Self::Acquiring)
                | (Self::Acquiring, Self::Acquired)
                | (Self::Acquired, Self::Starting)
                | (Self::Starting, Self::Started)
                | (Self::Requested | Self::Acquiring | Self::Acquired | Self::Starting, Self::Failed)
        )
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Acquiring => write!(f, "acquiring"),
            Self::Acquired => write!(f, "acquired"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Tracks one provisioning attempt's state.
struct Attempt {
    label: String,
    state: ProvisionState,
}

impl Attempt {
    fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: ProvisionState::Requested,
        }
    }

    fn advance(&mut self, next: ProvisionState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid transition {} -> {next}",
            self.state
        );
        debug!(attempt = %self.label, from = %self.state, to = %next, "Provisioning transition");
        self.state = next;
    }
}

/// Request to provision one node.
#[derive(Debug, Clone, Default)]
pub struct StartInstanceParams {
    /// Hostname of a specific node to acquire; empty lets the fleet choose.
    pub hostname: String,
    /// Resource constraints.
    pub constraints: ConstraintSet,
    /// Networks to include and exclude.
    pub networks: NetworkFilter,
    /// Agent tools the node may run.
    pub tools: Vec<ToolsVersion>,
}

/// A node that was acquired and started.
#[derive(Debug, Clone)]
pub struct StartedInstance {
    /// The node.
    pub node: Node,
    /// Tools selected for the node's architecture.
    pub tools: ToolsVersion,
    /// The node's network interfaces.
    pub networks: Vec<NetworkInfo>,
}

/// Drives the acquire / start / release protocol against the fleet.
#[derive(Clone)]
pub struct AllocationManager {
    fleet: Arc<dyn FleetApi>,
    storage: Arc<dyn ObjectStorage>,
    resolver: NetworkResolver,
    query: InstanceQuery,
    user_data: Arc<dyn UserDataBuilder>,
    agent_name: String,
}

impl AllocationManager {
    /// Create a manager acquiring nodes under `agent_name`.
    #[must_use]
    pub fn new(
        fleet: Arc<dyn FleetApi>,
        storage: Arc<dyn ObjectStorage>,
        agent_name: impl Into<String>,
    ) -> Self {
        let agent_name = agent_name.into();
        Self {
            resolver: NetworkResolver::new(fleet.clone()),
            query: InstanceQuery::new(fleet.clone(), agent_name.clone()),
            fleet,
            storage,
            user_data: Arc::new(CloudConfigBuilder),
            agent_name,
        }
    }

    /// Use a different first-boot payload builder.
    #[must_use]
    pub fn with_user_data_builder(mut self, builder: Arc<dyn UserDataBuilder>) -> Self {
        self.user_data = builder;
        self
    }

    /// Agent name attached to acquired nodes.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Query engine sharing this manager's fleet.
    #[must_use]
    pub fn query(&self) -> &InstanceQuery {
        &self.query
    }

    /// Network resolver sharing this manager's fleet.
    #[must_use]
    pub fn resolver(&self) -> &NetworkResolver {
        &self.resolver
    }

    /// Bootstrap state store over this manager's storage.
    #[must_use]
    pub fn state_store(&self) -> BootstrapStateStore {
        BootstrapStateStore::new(self.storage.clone())
    }

    /// Validator for constraints given the architectures `tools` cover.
    #[must_use]
    pub fn constraints_validator(tools: &[ToolsVersion]) -> ConstraintValidator {
        ConstraintValidator::new(tools::supported_arches(tools))
    }

    /// Acquire a node and pick the tools for its architecture.
    ///
    /// A non-empty `hostname` targets that node by name. The agent name is
    /// always attached so acquired nodes can be recognised later.
    ///
    /// # Errors
    /// Returns [`FleetError::InvalidNetworkFilter`] for overlapping filters,
    /// [`FleetError::Capacity`] when no node matches, and
    /// [`FleetError::NoMatchingTools`] (after releasing the node) when no
    /// tools fit its architecture.
    pub async fn acquire_node(
        &self,
        hostname: &str,
        constraints: &ConstraintSet,
        include: &[String],
        exclude: &[String],
        available_tools: &[ToolsVersion],
    ) -> Result<(Node, ToolsVersion)> {
        NetworkFilter::new(include.to_vec(), exclude.to_vec())?;

        let mut params = translate(constraints);
        params.merge(translate_network_filter(include, exclude));
        params.set(PARAM_AGENT_NAME, self.agent_name.as_str());
        if !hostname.is_empty() {
            params.set(PARAM_NAME, hostname);
        }

        let node = self.fleet.acquire(&params).await?;

        let Some(tools) = tools::match_arch(available_tools, node.arch()).cloned() else {
            let arch = node.arch().unwrap_or_default().to_string();
            warn!(system_id = %node.system_id, arch = %arch, "No tools for acquired node, releasing");
            self.release_after_failure(&node).await;
            return Err(FleetError::NoMatchingTools { arch });
        };

        Ok((node, tools))
    }

    /// Acquire a node, resolve its networks and start it.
    ///
    /// # Errors
    /// Returns the first failure. If the node had already been acquired it
    /// is released before returning.
    pub async fn start_instance(&self, params: &StartInstanceParams) -> Result<StartedInstance> {
        let label = if params.hostname.is_empty() {
            "any".to_string()
        } else {
            params.hostname.clone()
        };
        let mut attempt = Attempt::new(label);

        if params.tools.is_empty() {
            attempt.advance(ProvisionState::Failed);
            return Err(FleetError::Config("no tools available to start an instance".into()));
        }
        let unsupported = Self::constraints_validator(&params.tools)
            .validate(&params.constraints)
            .inspect_err(|_| attempt.advance(ProvisionState::Failed))?;
        if !unsupported.is_empty() {
            warn!(constraints = ?unsupported, "Ignoring unsupported constraints");
        }

        attempt.advance(ProvisionState::Acquiring);
        let (node, tools) = match self
            .acquire_node(
                &params.hostname,
                &params.constraints,
                &params.networks.include,
                &params.networks.exclude,
                &params.tools,
            )
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                attempt.advance(ProvisionState::Failed);
                return Err(e);
            }
        };
        attempt.advance(ProvisionState::Acquired);

        match self.start_acquired(&node, &tools, params, &mut attempt).await {
            Ok(networks) => {
                attempt.advance(ProvisionState::Started);
                info!(
                    system_id = %node.system_id,
                    hostname = %node.hostname,
                    tools = %tools.version,
                    networks = networks.len(),
                    "Instance started"
                );
                Ok(StartedInstance {
                    node,
                    tools,
                    networks,
                })
            }
            Err(e) => {
                attempt.advance(ProvisionState::Failed);
                warn!(system_id = %node.system_id, error = %e, "Failed to start instance, releasing");
                self.release_after_failure(&node).await;
                Err(e)
            }
        }
    }

    async fn start_acquired(
        &self,
        node: &Node,
        tools: &ToolsVersion,
        params: &StartInstanceParams,
        attempt: &mut Attempt,
    ) -> Result<Vec<NetworkInfo>> {
        let networks = self
            .resolver
            .setup_networks(node, &params.networks.include)
            .await?;

        let hostname = if node.hostname.is_empty() {
            node.system_id.as_str()
        } else {
            node.hostname.as_str()
        };
        let user_data = self.user_data.build(hostname, tools)?;

        attempt.advance(ProvisionState::Starting);
        self.fleet.start(&node.system_id, &user_data).await?;
        Ok(networks)
    }

    /// Start several instances concurrently.
    ///
    /// Returns one result per request, in request order; a failure of one
    /// attempt does not affect the others.
    pub async fn start_instances(
        &self,
        requests: &[StartInstanceParams],
    ) -> Vec<Result<StartedInstance>> {
        join_all(requests.iter().map(|p| self.start_instance(p))).await
    }

    async fn release_after_failure(&self, node: &Node) {
        if let Err(e) = self.fleet.release(&[node.system_id.clone()]).await {
            warn!(system_id = %node.system_id, error = %e, "Failed to release node");
        }
    }

    /// Release nodes in one bulk call. Nodes not owned are ignored by the fleet.
    ///
    /// # Errors
    /// Returns an error if the release call fails.
    pub async fn release(&self, ids: &[InstanceId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let system_ids: Vec<String> = ids.iter().map(|id| id.system_id().to_string()).collect();
        info!(nodes = ?system_ids, "Releasing nodes");
        self.fleet.release(&system_ids).await
    }

    /// Release every node, falling back to one call per node if the bulk
    /// call fails. All nodes are attempted; failures are aggregated.
    async fn release_all(&self, system_ids: Vec<String>) -> Result<()> {
        if system_ids.is_empty() {
            return Ok(());
        }

        let Err(bulk) = self.fleet.release(&system_ids).await else {
            return Ok(());
        };
        warn!(error = %bulk, "Bulk release failed, releasing nodes one by one");

        let results = join_all(system_ids.iter().map(|id| async move {
            let result = self.fleet.release(std::slice::from_ref(id)).await;
            (id, result)
        }))
        .await;

        let failures: Vec<(String, String)> = results
            .into_iter()
            .filter_map(|(id, r)| r.err().map(|e| (id.clone(), e.to_string())))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FleetError::ReleaseFailed(failures))
        }
    }

    /// Tear down everything this orchestrator owns.
    ///
    /// Lists all nodes acquired under the agent name, releases them, then
    /// deletes every object in durable storage. Storage is only touched once
    /// every node has been released.
    ///
    /// # Errors
    /// Returns the listing error, an aggregated [`FleetError::ReleaseFailed`],
    /// or a storage error.
    pub async fn destroy(&self) -> Result<()> {
        info!(agent = %self.agent_name, "Destroying environment");

        let nodes = self.query.list_all().await?;
        let owned: Vec<String> = nodes
            .iter()
            .filter(|n| n.is_owned())
            .map(|n| n.system_id.clone())
            .collect();
        info!(nodes = owned.len(), "Releasing owned nodes");
        self.release_all(owned).await?;

        self.storage.remove_all().await?;
        info!("Environment destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::fake::FakeFleet;
    use crate::hardware::tests::lshw_report;
    use crate::storage::MemoryStorage;
    use crate::tools::tests::tools;
    use crate::userdata::{CloudConfig, MachineInfo};

    const AGENT: &str = "fleet-test";

    struct Fixture {
        fleet: Arc<FakeFleet>,
        storage: Arc<MemoryStorage>,
        manager: AllocationManager,
    }

    fn fixture() -> Fixture {
        let fleet = Arc::new(FakeFleet::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = AllocationManager::new(fleet.clone(), storage.clone(), AGENT);
        Fixture {
            fleet,
            storage,
            manager,
        }
    }

    fn amd64_tools() -> Vec<ToolsVersion> {
        vec![tools("1.0.0", "amd64")]
    }

    fn params(hostname: &str) -> StartInstanceParams {
        StartInstanceParams {
            hostname: hostname.to_string(),
            tools: amd64_tools(),
            ..Default::default()
        }
    }

    #[test]
    fn test_provision_state_transitions() {
        use ProvisionState::*;
        assert!(Requested.can_advance_to(Acquiring));
        assert!(Acquiring.can_advance_to(Acquired));
        assert!(Acquired.can_advance_to(Starting));
        assert!(Starting.can_advance_to(Started));
        assert!(Acquiring.can_advance_to(Failed));
        assert!(!Requested.can_advance_to(Started));
        assert!(!Started.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Acquiring));
    }

    #[tokio::test]
    async fn test_acquire_node() {
        let f = fixture();
        f.fleet.add_node("node0", "host0");

        f.manager
            .acquire_node("", &ConstraintSet::default(), &[], &[], &amd64_tools())
            .await
            .unwrap();

        assert_eq!(f.fleet.node_operations()["node0"], vec!["acquire"]);
        let values = &f.fleet.request_values("node0")[0];
        assert!(!values.contains_key("name"));
        assert_eq!(values.get("agent_name"), Some(AGENT));
    }

    #[tokio::test]
    async fn test_acquire_node_by_name() {
        let f = fixture();
        f.fleet.add_node("node0", "host0");
        f.fleet.add_node("node1", "host1");

        let (node, _) = f
            .manager
            .acquire_node("host1", &ConstraintSet::default(), &[], &[], &amd64_tools())
            .await
            .unwrap();

        assert_eq!(node.system_id, "node1");
        let values = &f.fleet.request_values("node1")[0];
        assert_eq!(values.get("name"), Some("host1"));
        assert_eq!(values.get("agent_name"), Some(AGENT));
    }

    #[tokio::test]
    async fn test_acquire_node_takes_constraints_into_account() {
        let f = fixture();
        f.fleet.add_node("node0", "host0");
        let cons = ConstraintSet {
            arch: Some("amd64".into()),
            mem: Some(1024),
            ..Default::default()
        };

        f.manager
            .acquire_node(
                "",
                &cons,
                &["lan".to_string()],
                &["dmz".to_string()],
                &amd64_tools(),
            )
            .await
            .unwrap();

        let values = &f.fleet.request_values("node0")[0];
        assert_eq!(values.get("arch"), Some("amd64"));
        assert_eq!(values.get("mem"), Some("1024"));
        assert_eq!(values.get("networks"), Some("lan"));
        assert_eq!(values.get("not_networks"), Some("dmz"));
    }

    #[tokio::test]
    async fn test_acquire_node_without_capacity() {
        let f = fixture();
        let err = f
            .manager
            .acquire_node("", &ConstraintSet::default(), &[], &[], &amd64_tools())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Capacity(ref m) if m.contains("409")));
    }

    #[tokio::test]
    async fn test_acquire_node_rejects_overlapping_networks() {
        let f = fixture();
        f.fleet.add_node("node0", "host0");
        let err = f
            .manager
            .acquire_node(
                "",
                &ConstraintSet::default(),
                &["lan".to_string()],
                &["lan".to_string()],
                &amd64_tools(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidNetworkFilter(_)));
        assert!(f.fleet.node_operations().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_node_releases_when_no_tools_match() {
        let f = fixture();
        f.fleet.add_node("node0", "host0");

        let err = f
            .manager
            .acquire_node(
                "",
                &ConstraintSet::default(),
                &[],
                &[],
                &[tools("1.0.0", "arm64")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoMatchingTools { ref arch } if arch == "amd64"));
        assert!(!f.fleet.is_owned("node0"));
    }

    #[tokio::test]
    async fn test_start_instance() {
        let f = fixture();
        f.fleet.add_node("node1", "host1");
        f.fleet
            .add_node_details("node1", &lshw_report(&[("aa:bb:cc:dd:ee:f1", "eth0")]));
        f.fleet.add_network("LAN", 2, 42);
        f.fleet.connect("node1", "LAN", "aa:bb:cc:dd:ee:f1");

        let started = f.manager.start_instance(&params("")).await.unwrap();

        assert_eq!(started.node.system_id, "node1");
        assert_eq!(started.tools.arch, "amd64");
        assert_eq!(started.networks.len(), 1);
        assert_eq!(started.networks[0].interface_name, "eth0");
        assert_eq!(
            f.fleet.node_operations()["node1"],
            vec!["acquire", "start"]
        );

        let user_data = String::from_utf8(f.fleet.user_data("node1").unwrap()).unwrap();
        let config: CloudConfig = serde_yaml::from_str(&user_data).unwrap();
        assert_eq!(
            config.runcmd[0],
            MachineInfo::new("host1").run_cmd().unwrap()
        );
    }

    #[tokio::test]
    async fn test_start_instance_releases_on_parse_failure() {
        let f = fixture();
        f.fleet.add_node("node1", "host1");
        f.fleet.add_node_details("node1", "<list><node>");

        let err = f.manager.start_instance(&params("")).await.unwrap_err();
        assert!(matches!(err, FleetError::Parse(_)));
        assert!(!f.fleet.is_owned("node1"));
        assert_eq!(f.fleet.node_operations()["node1"], vec!["acquire"]);
        assert_eq!(f.fleet.nodes_operations(), vec!["release"]);
    }

    #[tokio::test]
    async fn test_start_instance_rejects_unsupported_arch() {
        let f = fixture();
        f.fleet.add_node("node1", "host1");
        let mut request = params("");
        request.constraints = ConstraintSet::with_arch("ppc64el");

        let err = f.manager.start_instance(&request).await.unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
        assert!(f.fleet.node_operations().is_empty());
    }

    #[tokio::test]
    async fn test_start_instances_isolates_failures() {
        let f = fixture();
        f.fleet.add_node("good", "good-host");
        f.fleet
            .add_node_details("good", &lshw_report(&[("aa:bb:cc:dd:ee:01", "eth0")]));
        f.fleet.add_node("bad", "bad-host");
        f.fleet.add_node_details("bad", "<list><node>");

        let results = f
            .manager
            .start_instances(&[params("bad-host"), params("good-host")])
            .await;

        assert!(matches!(results[0], Err(FleetError::Parse(_))));
        assert_eq!(results[1].as_ref().unwrap().node.system_id, "good");
        assert!(!f.fleet.is_owned("bad"));
        assert!(f.fleet.is_owned("good"));
    }

    #[tokio::test]
    async fn test_release_empty_is_noop() {
        let f = fixture();
        f.fleet.add_node("test1", "");
        f.manager.release(&[]).await.unwrap();
        assert!(f.fleet.node_operations().is_empty());
        assert!(f.fleet.nodes_operations().is_empty());
    }

    #[tokio::test]
    async fn test_release_ignores_free_nodes() {
        let f = fixture();
        let ids: Vec<InstanceId> = ["test1", "test2", "test3"]
            .iter()
            .map(|id| f.fleet.add_node(id, "").id())
            .collect();
        f.fleet.set_owned("test1", AGENT);
        f.fleet.set_owned("test2", AGENT);

        f.manager.release(&ids).await.unwrap();

        assert_eq!(f.fleet.nodes_operations(), vec!["release"]);
        assert!(!f.fleet.is_owned("test1"));
        assert!(!f.fleet.is_owned("test2"));
        assert!(!f.fleet.is_owned("test3"));
    }

    #[tokio::test]
    async fn test_destroy() {
        let f = fixture();
        f.fleet.add_node("test1", "");
        f.fleet.set_owned("test1", AGENT);
        f.storage.put("filename", b"0123456789").await.unwrap();
        f.manager.state_store().write_state(&[]).await.unwrap();

        f.manager.destroy().await.unwrap();

        assert_eq!(f.fleet.nodes_operations(), vec!["release"]);
        assert!(!f.fleet.is_owned("test1"));
        assert!(f.storage.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_aggregates_release_failures_and_keeps_storage() {
        let f = fixture();
        for id in ["a", "b", "c"] {
            f.fleet.add_node(id, "");
            f.fleet.set_owned(id, AGENT);
        }
        f.fleet.fail_release_of("a");
        f.fleet.fail_release_of("c");
        f.storage.put("filename", b"data").await.unwrap();

        let err = f.manager.destroy().await.unwrap_err();

        let FleetError::ReleaseFailed(failures) = err else {
            panic!("expected ReleaseFailed, got {err:?}");
        };
        let mut failed: Vec<_> = failures.iter().map(|(id, _)| id.as_str()).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec!["a", "c"]);

        // "b" was still released, storage was left alone.
        assert!(!f.fleet.is_owned("b"));
        assert_eq!(f.storage.list("").await.unwrap(), vec!["filename"]);
    }
}
