//! Agent tools available to newly started nodes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One downloadable build of the agent tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsVersion {
    /// Tools version (e.g., "1.20.1").
    pub version: String,
    /// Architecture the build targets (e.g., "amd64").
    pub arch: String,
    /// Download URL.
    pub url: String,
    /// SHA-256 of the tarball.
    #[serde(default)]
    pub sha256: String,
    /// Size of the tarball in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Tools entry matching `arch`; the first entry when `arch` is unknown.
#[must_use]
pub fn match_arch<'a>(tools: &'a [ToolsVersion], arch: Option<&str>) -> Option<&'a ToolsVersion> {
    match arch {
        Some(arch) => tools.iter().find(|t| t.arch == arch),
        None => tools.first(),
    }
}

/// Distinct architectures covered by `tools`, sorted.
#[must_use]
pub fn supported_arches(tools: &[ToolsVersion]) -> Vec<String> {
    tools
        .iter()
        .map(|t| t.arch.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
