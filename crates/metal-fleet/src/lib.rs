//! Bare metal fleet provisioning.
//!
//! This crate drives a MAAS-style fleet of physical machines: it acquires
//! nodes matching resource constraints, resolves their network interfaces
//! from hardware reports, starts them with a first-boot payload, looks them
//! up again later, and releases them on teardown. Which nodes run the
//! control plane is recorded in durable storage.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use metal_fleet::{AllocationManager, FileStorage, FleetConfig, MaasClient, StartInstanceParams};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FleetConfig::from_env()?;
//!     let fleet = Arc::new(MaasClient::from_config(&config)?);
//!     let storage = Arc::new(FileStorage::new(&config.storage_dir));
//!     let manager = AllocationManager::new(fleet, storage, &config.agent_name);
//!
//!     let started = manager
//!         .start_instance(&StartInstanceParams {
//!             tools: load_tools()?,
//!             ..Default::default()
//!         })
//!         .await?;
//!     manager.state_store().write_state(&[started.node.id()]).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocation;
pub mod config;
pub mod constraints;
pub mod error;
pub mod fleet;
pub mod hardware;
pub mod network;
pub mod query;
pub mod state;
pub mod storage;
pub mod tools;
pub mod userdata;

pub use allocation::{AllocationManager, ProvisionState, StartInstanceParams, StartedInstance};
pub use config::FleetConfig;
pub use constraints::{ConstraintSet, ConstraintValidator, NetworkFilter, QueryParams};
pub use error::{FleetError, Result};
pub use fleet::maas::MaasClient;
pub use fleet::{FleetApi, InstanceId, Node};
pub use network::{NetworkInfo, NetworkResolver};
pub use query::{InstanceLookup, InstanceQuery};
pub use state::{BootstrapState, BootstrapStateStore};
pub use storage::{FileStorage, MemoryStorage, ObjectStorage};
pub use tools::ToolsVersion;
