//! Error types for fleet provisioning.

use thiserror::Error;

/// Errors that can occur while provisioning, querying or tearing down nodes.
#[derive(Error, Debug)]
pub enum FleetError {
    /// The caller asked for no instances, or none of the requested ones exist.
    #[error("no instances found")]
    NoInstances,

    /// Some of the requested instances exist and some do not.
    #[error("only some instances were found")]
    PartialInstances,

    /// No bootstrap state has been recorded for this cluster.
    #[error("cluster is not bootstrapped")]
    NotBootstrapped,

    /// The fleet had no free node matching the request.
    #[error("no matching node available: {0}")]
    Capacity(String),

    /// The hardware report is not well-formed markup.
    #[error("cannot parse hardware report: {0}")]
    Parse(String),

    /// A remote call failed before a response could be read.
    #[error("{operation} {target} failed: {source}")]
    Transport {
        operation: &'static str,
        target: String,
        #[source]
        source: reqwest::Error,
    },

    /// The fleet API returned an error response.
    #[error("{operation} {target} failed: API error {status} - {message}")]
    Api {
        operation: &'static str,
        target: String,
        status: u16,
        message: String,
    },

    /// A network appears in both the include and the exclude filter.
    #[error("network {0:?} is both included and excluded")]
    InvalidNetworkFilter(String),

    /// None of the available tools match the acquired node.
    #[error("no tools available for architecture {arch:?}")]
    NoMatchingTools { arch: String },

    /// One or more nodes could not be released.
    #[error("failed to release {} node(s): {}", .0.len(), format_release_failures(.0))]
    ReleaseFailed(Vec<(String, String)>),

    /// Durable storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// An object requested from durable storage does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// A user data envelope is not base64-encoded gzip.
    #[error("invalid user data envelope: {0}")]
    Envelope(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Local I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Wrap a transport error with the operation and node it concerned.
    pub(crate) fn transport(
        operation: &'static str,
        target: impl Into<String>,
        source: reqwest::Error,
    ) -> Self {
        Self::Transport {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Whether this error means "nothing was found" rather than a failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoInstances | Self::ObjectNotFound(_))
    }
}

fn format_release_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{id}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias used throughout the crate.
pub type Result<T, E = FleetError> = std::result::Result<T, E>;
