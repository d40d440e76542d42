//! Sweep targets.
//!
//! A `Target` is a named, retry-counted reference to one node's connection
//! details. The manager queues targets by health: the more retries a target
//! has left, the earlier a worker picks it up.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::str::FromStr;

use itertools::sorted;
use serde::Deserialize;
use void::Void;

use crate::error::SweepError;
use crate::serde::string_or_mapping;

/// How to reach a node. Replaces ad-hoc string tags with a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Ssh,
    Local,
}

/// Connection descriptor for one node, supplied entirely by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeDetails {
    /// SSH destination. May be a plain hostname, `host:port`, or an
    /// ssh_config alias.
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub kind: NodeKind,
    /// Node-specific parameters, e.g. `gpus: "0,1"` for local nodes.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl NodeDetails {
    pub fn new(address: String) -> Self {
        Self {
            address,
            username: None,
            password: None,
            key_path: None,
            kind: NodeKind::Ssh,
            params: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Target {
    /// Unique identity within the target pool.
    pub name: String,
    pub details: NodeDetails,
    /// Remaining connection attempts. Never increases; the target is
    /// permanently dropped once this reaches zero.
    pub retries: u32,
}

impl Target {
    pub fn new(name: String, details: NodeDetails, retries: u32) -> Self {
        Self {
            name,
            details,
            retries,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.details.params.is_empty() {
            write!(f, "[{}]", self.name)?;
        } else {
            write!(f, "[{} (", self.name)?;
            for (i, (key, value)) in sorted(self.details.params.iter()).enumerate() {
                if i == 0 {
                    write!(f, "{}={}", key, value)?;
                } else {
                    write!(f, ",{}={}", key, value)?;
                }
            }
            write!(f, ")]")?;
        }
        Ok(())
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.retries == other.retries && self.name == other.name
    }
}

impl Eq for Target {}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Target {
    /// Healthier targets (more retries left) compare greater, so a max-heap
    /// hands them out first. Names break ties to keep the order total.
    fn cmp(&self, other: &Self) -> Ordering {
        self.retries
            .cmp(&other.retries)
            .then_with(|| other.name.cmp(&self.name))
    }
}

#[derive(Debug, Deserialize)]
struct TargetSpec(#[serde(deserialize_with = "string_or_mapping")] TargetSpecInner);

#[derive(Debug, Deserialize)]
struct TargetSpecInner {
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    details: NodeDetails,
}

impl FromStr for TargetSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            name: None,
            details: NodeDetails::new(s.to_string()),
        })
    }
}

/// Reads and validates a target file.
///
/// Each entry is either a bare address string or a mapping with explicit
/// connection details. Entry names must be unique; they default to the
/// address. SSH targets without a password or key path are accepted but
/// flagged, since authentication then depends on ssh_config or an agent.
pub fn get_targets(targets_file: &str) -> Result<HashMap<String, NodeDetails>, SweepError> {
    let fd = File::open(targets_file)?;
    let specs: Vec<TargetSpec> = serde_yaml::from_reader(fd)?;

    let mut targets = HashMap::with_capacity(specs.len());
    for TargetSpec(spec) in specs {
        let name = spec.name.unwrap_or_else(|| spec.details.address.clone());
        if spec.details.address.is_empty() {
            return Err(SweepError::InvalidTarget(format!(
                "target '{}' has an empty address",
                name
            )));
        }
        if spec.details.kind == NodeKind::Ssh
            && spec.details.password.is_none()
            && spec.details.key_path.is_none()
        {
            tracing::warn!(
                target_name = %name,
                "no password or key_path given; relying on ssh_config or agent auth"
            );
        }
        if targets.insert(name.clone(), spec.details).is_some() {
            return Err(SweepError::InvalidTarget(format!(
                "duplicate target name '{}'",
                name
            )));
        }
    }
    Ok(targets)
}
