//! Translation of abstract machine constraints into fleet query parameters.
//!
//! The fleet selects nodes with a small query vocabulary (`arch`,
//! `cpu_count`, `mem`, `tags`, `networks`, `not_networks`). Constraints with
//! no analogue in that vocabulary (CPU power, root disk, instance type) are
//! dropped here and reported by [`ConstraintValidator`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Query parameter carrying the architecture.
pub const PARAM_ARCH: &str = "arch";
/// Query parameter carrying the CPU core count.
pub const PARAM_CPU_COUNT: &str = "cpu_count";
/// Query parameter carrying memory in MB.
pub const PARAM_MEM: &str = "mem";
/// Query parameter carrying comma-joined tags.
pub const PARAM_TAGS: &str = "tags";
/// Query parameter listing networks the node must be attached to.
pub const PARAM_NETWORKS: &str = "networks";
/// Query parameter listing networks the node must not be attached to.
pub const PARAM_NOT_NETWORKS: &str = "not_networks";
/// Query parameter tagging an acquired node with the orchestrator's name.
pub const PARAM_AGENT_NAME: &str = "agent_name";
/// Query parameter targeting a specific node by hostname.
pub const PARAM_NAME: &str = "name";

/// Abstract machine constraints, as produced by the constraint parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSet {
    /// Machine architecture (e.g., "amd64", "arm").
    pub arch: Option<String>,
    /// Minimum number of CPU cores.
    pub cpu_cores: Option<u64>,
    /// Relative CPU power. Not supported by the fleet.
    pub cpu_power: Option<u64>,
    /// Minimum memory in MB.
    pub mem: Option<u64>,
    /// Root disk size in MB. Not supported by the fleet.
    pub root_disk: Option<u64>,
    /// Tags the node must carry.
    pub tags: Option<Vec<String>>,
    /// Provider instance type. Not supported by the fleet.
    pub instance_type: Option<String>,
}

impl ConstraintSet {
    /// Constraint set restricted to one architecture.
    #[must_use]
    pub fn with_arch(arch: impl Into<String>) -> Self {
        Self {
            arch: Some(arch.into()),
            ..Self::default()
        }
    }
}

/// Networks a node must (or must not) be attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFilter {
    /// Networks to include, in caller order.
    pub include: Vec<String>,
    /// Networks to exclude, in caller order.
    pub exclude: Vec<String>,
}

impl NetworkFilter {
    /// Create a filter, rejecting names that are both included and excluded.
    ///
    /// # Errors
    /// Returns [`FleetError::InvalidNetworkFilter`] when the sets overlap.
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Result<Self> {
        let filter = Self { include, exclude };
        filter.validate()?;
        Ok(filter)
    }

    /// Check that no network name appears in both sets.
    ///
    /// # Errors
    /// Returns [`FleetError::InvalidNetworkFilter`] naming the first overlap.
    pub fn validate(&self) -> Result<()> {
        let excluded: BTreeSet<&str> = self.exclude.iter().map(String::as_str).collect();
        match self.include.iter().find(|n| excluded.contains(n.as_str())) {
            Some(name) => Err(FleetError::InvalidNetworkFilter(name.clone())),
            None => Ok(()),
        }
    }

    /// Whether the filter is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// Multi-valued query parameters, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, Vec<String>>);

impl QueryParams {
    /// Empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Append a value to `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// All values of `key`, in insertion order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map_or(&[], Vec::as_slice)
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append every value of `other` to this set.
    pub fn merge(&mut self, other: Self) {
        for (key, values) in other.0 {
            self.0.entry(key).or_default().extend(values);
        }
    }

    /// Flatten into `(key, value)` pairs for form or query encoding.
    #[must_use]
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.clone(), v.clone())))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.add(k, v);
        }
        params
    }
}

/// Translate a constraint set into fleet query parameters.
///
/// CPU power, root disk and instance type have no fleet equivalent and are
/// dropped. Absent fields produce no parameter.
#[must_use]
pub fn translate(cons: &ConstraintSet) -> QueryParams {
    let mut params = QueryParams::new();
    if let Some(arch) = &cons.arch {
        params.set(PARAM_ARCH, arch.as_str());
    }
    if let Some(cores) = cons.cpu_cores {
        params.set(PARAM_CPU_COUNT, cores.to_string());
    }
    if let Some(mem) = cons.mem {
        params.set(PARAM_MEM, mem.to_string());
    }
    if let Some(tags) = &cons.tags {
        if !tags.is_empty() {
            params.set(PARAM_TAGS, tags.join(","));
        }
    }
    params
}

/// Translate include/exclude network names into fleet query parameters.
#[must_use]
pub fn translate_network_filter(include: &[String], exclude: &[String]) -> QueryParams {
    let mut params = QueryParams::new();
    for name in include {
        params.add(PARAM_NETWORKS, name.as_str());
    }
    for name in exclude {
        params.add(PARAM_NOT_NETWORKS, name.as_str());
    }
    params
}

/// Checks constraints against what the fleet can honour.
#[derive(Debug, Clone)]
pub struct ConstraintValidator {
    supported_arches: Vec<String>,
}

impl ConstraintValidator {
    /// Create a validator for the given supported architectures.
    #[must_use]
    pub fn new(supported_arches: Vec<String>) -> Self {
        Self { supported_arches }
    }

    /// Architectures this validator accepts.
    #[must_use]
    pub fn supported_arches(&self) -> &[String] {
        &self.supported_arches
    }

    /// Constraint names that are set but ignored by the fleet.
    #[must_use]
    pub fn unsupported(cons: &ConstraintSet) -> Vec<&'static str> {
        let mut names = Vec::new();
        if cons.cpu_power.is_some() {
            names.push("cpu-power");
        }
        if cons.instance_type.is_some() {
            names.push("instance-type");
        }
        names
    }

    /// Validate constraint values, returning the unsupported constraint names.
    ///
    /// # Errors
    /// Returns [`FleetError::Config`] when the architecture is not supported.
    pub fn validate(&self, cons: &ConstraintSet) -> Result<Vec<&'static str>> {
        if let Some(arch) = &cons.arch {
            if !self.supported_arches.iter().any(|a| a == arch) {
                return Err(FleetError::Config(format!(
                    "invalid constraint value: arch={arch}\nvalid values are: {:?}",
                    self.supported_arches
                )));
            }
        }
        Ok(Self::unsupported(cons))
    }
}
