//! First-boot (cloud-init) payloads for started nodes.
//!
//! A [`UserDataBuilder`] renders the document handed to the fleet's `start`
//! call. The transport wraps it in a gzip + base64 envelope with
//! [`encode_user_data`].

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::tools::ToolsVersion;

/// Directory on the node holding agent data.
pub const DATA_DIR: &str = "/var/lib/metal-fleet";

/// File on the node recording which fleet machine it is.
pub const MACHINE_INFO_FILE: &str = "/var/lib/metal-fleet/machine.yaml";

/// Renders the first-boot document for a node.
pub trait UserDataBuilder: Send + Sync {
    /// Build the serialized first-boot document.
    ///
    /// # Errors
    /// Returns an error if the document cannot be rendered.
    fn build(&self, hostname: &str, tools: &ToolsVersion) -> Result<Vec<u8>>;
}

/// Machine identity written onto the node at first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Fleet hostname of the node.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
}

impl MachineInfo {
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Shell command that records this machine's info on the node.
    ///
    /// # Errors
    /// Returns an error if the info cannot be serialized.
    pub fn run_cmd(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(format!(
            "mkdir -p {}; echo -n {} > {}",
            sh_quote(DATA_DIR),
            sh_quote(&yaml),
            sh_quote(MACHINE_INFO_FILE)
        ))
    }
}

/// Cloud-config document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Commands run once on first boot.
    #[serde(default)]
    pub runcmd: Vec<String>,
}

impl CloudConfig {
    /// Serialize with the `#cloud-config` header.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn render(&self) -> Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

/// Builder writing machine info and fetching the agent tools.
#[derive(Debug, Clone, Default)]
pub struct CloudConfigBuilder;

impl UserDataBuilder for CloudConfigBuilder {
    fn build(&self, hostname: &str, tools: &ToolsVersion) -> Result<Vec<u8>> {
        let tools_dir = format!("{DATA_DIR}/tools/{}-{}", tools.version, tools.arch);
        let config = CloudConfig {
            runcmd: vec![
                MachineInfo::new(hostname).run_cmd()?,
                format!("mkdir -p {}", sh_quote(&tools_dir)),
                format!(
                    "curl -sSfL {} | tar xz -C {}",
                    sh_quote(&tools.url),
                    sh_quote(&tools_dir)
                ),
            ],
        };
        Ok(config.render()?.into_bytes())
    }
}

/// Quote a string for POSIX sh.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Gzip and base64-encode a user data document for the fleet API.
///
/// # Errors
/// Returns an error if compression fails.
pub fn encode_user_data(data: &[u8]) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// Reverse [`encode_user_data`].
///
/// # Errors
/// Returns an error if the input is not base64-encoded gzip.
pub fn decode_user_data(encoded: &str) -> Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| FleetError::Envelope(format!("not base64: {e}")))?;
    let mut data = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut data)
        .map_err(|e| FleetError::Envelope(format!("not gzip: {e}")))?;
    Ok(data)
}
