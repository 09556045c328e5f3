//! metal-fleet CLI - acquire, start, inspect and release fleet nodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use metal_fleet::config::{DEFAULT_API_VERSION, DEFAULT_TIMEOUT_SECS};
use metal_fleet::{
    AllocationManager, ConstraintSet, FileStorage, FleetConfig, FleetError, InstanceId,
    InstanceLookup, MaasClient, NetworkFilter, Node, StartInstanceParams, ToolsVersion,
};

/// metal-fleet CLI - bare metal provisioning against a MAAS fleet.
#[derive(Parser)]
#[command(name = "metal-fleet")]
#[command(about = "Acquire, start, inspect and release bare metal nodes")]
struct Cli {
    /// YAML config file; overrides the connection flags below.
    #[arg(long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// MAAS server URL (or set `MAAS_SERVER` env var).
    #[arg(long, env = "MAAS_SERVER", required_unless_present = "config")]
    server: Option<String>,

    /// MAAS API key, `consumer:token:secret` (or set `MAAS_API_KEY` env var).
    #[arg(long, env = "MAAS_API_KEY", required_unless_present = "config")]
    api_key: Option<String>,

    /// Agent name tagging every node this orchestrator acquires.
    #[arg(long, env = "FLEET_AGENT_NAME", required_unless_present = "config")]
    agent_name: Option<String>,

    /// MAAS API version.
    #[arg(long, env = "MAAS_API_VERSION", default_value = DEFAULT_API_VERSION)]
    api_version: String,

    /// Durable storage directory.
    #[arg(long, env = "FLEET_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Request timeout in seconds.
    #[arg(long, env = "FLEET_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct NodeRequest {
    /// Hostname of a specific node to acquire.
    #[arg(long, default_value = "")]
    hostname: String,

    /// Architecture (e.g., amd64).
    #[arg(long)]
    arch: Option<String>,

    /// Minimum CPU cores.
    #[arg(long)]
    cpu_cores: Option<u64>,

    /// Minimum memory in MB.
    #[arg(long)]
    mem: Option<u64>,

    /// Required tags (comma-separated).
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Networks the node must be attached to (comma-separated).
    #[arg(long, value_delimiter = ',')]
    networks: Vec<String>,

    /// Networks the node must not be attached to (comma-separated).
    #[arg(long, value_delimiter = ',')]
    not_networks: Vec<String>,

    /// YAML file listing the available agent tools.
    #[arg(long)]
    tools_file: PathBuf,
}

impl NodeRequest {
    fn constraints(&self) -> ConstraintSet {
        ConstraintSet {
            arch: self.arch.clone(),
            cpu_cores: self.cpu_cores,
            mem: self.mem,
            tags: (!self.tags.is_empty()).then(|| self.tags.clone()),
            ..Default::default()
        }
    }

    fn tools(&self) -> Result<Vec<ToolsVersion>> {
        load_tools(&self.tools_file)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List all nodes acquired under the agent name.
    List,

    /// Look up nodes by instance id.
    Lookup {
        /// Instance ids (resource URIs or system ids).
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
    },

    /// Acquire a node without starting it.
    Acquire(NodeRequest),

    /// Acquire a node, resolve its networks and start it.
    Start {
        #[command(flatten)]
        request: NodeRequest,

        /// Record the started node as the control plane.
        #[arg(long, default_value = "false")]
        bootstrap: bool,
    },

    /// Release nodes.
    Release {
        /// Instance ids (resource URIs or system ids).
        #[arg(long = "id", required = true)]
        ids: Vec<String>,
    },

    /// Show the control-plane nodes recorded in bootstrap state.
    State,

    /// Release every owned node and wipe durable storage.
    Destroy {
        /// Confirm the teardown.
        #[arg(long, default_value = "false")]
        yes: bool,
    },
}

fn load_tools(path: &Path) -> Result<Vec<ToolsVersion>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tools file {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse tools file {}", path.display()))
}

fn resolve_config(cli: &Cli) -> Result<FleetConfig> {
    if let Some(path) = &cli.config {
        return FleetConfig::load(path);
    }

    let mut config = FleetConfig::new(
        cli.server.clone().unwrap_or_default(),
        cli.api_key.clone().unwrap_or_default(),
        cli.agent_name.clone().unwrap_or_default(),
    );
    config.api_version.clone_from(&cli.api_version);
    config.timeout_secs = cli.timeout;
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir.clone_from(dir);
    }
    config.validate()?;
    Ok(config)
}

fn print_nodes(nodes: &[Option<Node>], ids: &[String]) {
    println!(
        "\n{:<24} {:<20} {:<16} {:<8}",
        "SYSTEM ID", "HOSTNAME", "ARCH", "OWNED"
    );
    println!("{}", "-".repeat(70));
    for (i, node) in nodes.iter().enumerate() {
        match node {
            Some(node) => println!(
                "{:<24} {:<20} {:<16} {:<8}",
                node.system_id,
                node.hostname,
                node.architecture.as_deref().unwrap_or("-"),
                node.is_owned()
            ),
            None => println!(
                "{:<24} {:<20}",
                ids.get(i).map_or("?", String::as_str),
                "(not found)"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = resolve_config(&cli)?;
    let fleet = Arc::new(MaasClient::from_config(&config).context("Failed to create MAAS client")?);
    let storage = Arc::new(FileStorage::new(&config.storage_dir));
    let manager = AllocationManager::new(fleet, storage, &config.agent_name);

    match cli.command {
        Commands::List => {
            let nodes: Vec<Option<Node>> =
                manager.query().list_all().await?.into_iter().map(Some).collect();
            print_nodes(&nodes, &[]);
        }

        Commands::Lookup { ids } => {
            let instance_ids: Vec<InstanceId> = ids.iter().map(|id| InstanceId::from(id.as_str())).collect();
            let outcome = manager.query().lookup(&instance_ids).await?;
            if let InstanceLookup::Partial(_) = &outcome {
                println!("Warning: only some instances were found");
            }
            if outcome == InstanceLookup::Empty {
                anyhow::bail!(FleetError::NoInstances);
            }
            print_nodes(&outcome.into_slots(), &ids);
        }

        Commands::Acquire(request) => {
            NetworkFilter::new(request.networks.clone(), request.not_networks.clone())?;
            let tools = request.tools()?;
            let (node, tools) = manager
                .acquire_node(
                    &request.hostname,
                    &request.constraints(),
                    &request.networks,
                    &request.not_networks,
                    &tools,
                )
                .await?;
            println!("Acquired {} ({})", node.system_id, node.hostname);
            println!("  Instance ID: {}", node.id());
            println!("  Tools:       {} ({})", tools.version, tools.arch);
        }

        Commands::Start { request, bootstrap } => {
            let params = StartInstanceParams {
                hostname: request.hostname.clone(),
                constraints: request.constraints(),
                networks: NetworkFilter::new(request.networks.clone(), request.not_networks.clone())?,
                tools: request.tools()?,
            };
            let started = manager.start_instance(&params).await?;

            println!("Started {} ({})", started.node.system_id, started.node.hostname);
            println!("  Instance ID: {}", started.node.id());
            println!("  Tools:       {} ({})", started.tools.version, started.tools.arch);
            for net in &started.networks {
                println!(
                    "  {:<8} {:<18} {:<18} {:<12} vlan={} {}",
                    net.interface_name,
                    net.mac_address,
                    net.cidr,
                    net.network_name,
                    net.vlan_tag,
                    if net.disabled { "disabled" } else { "enabled" }
                );
            }

            if bootstrap {
                manager.state_store().write_state(&[started.node.id()]).await?;
                info!(system_id = %started.node.system_id, "Recorded control plane");
            }
        }

        Commands::Release { ids } => {
            let instance_ids: Vec<InstanceId> = ids.iter().map(|id| InstanceId::from(id.as_str())).collect();
            manager.release(&instance_ids).await?;
            println!("Released {} node(s)", instance_ids.len());
        }

        Commands::State => {
            let store = manager.state_store();
            let ids = store.read_state_server_instances().await?;
            println!("Control plane instances: {}", ids.len());
            let outcome = manager.query().control_plane_nodes(&store).await?;
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            print_nodes(&outcome.into_slots(), &ids);
        }

        Commands::Destroy { yes } => {
            if !yes {
                anyhow::bail!("Refusing to destroy without --yes");
            }
            manager.destroy().await?;
            println!("All nodes released and storage removed");
        }
    }

    Ok(())
}
