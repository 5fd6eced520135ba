//! Seams to the outside world: the configuration-management executor that
//! performs a phase's action on hosts, and the reachability probe run first.

use crate::error::ExecutorError;
use crate::plan::Action;
use crate::secrets::SecretValue;
use crate::topology::Node;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Host as handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub name: String,
    pub address: String,
    pub user: String,
}

impl From<&Node> for HostTarget {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            address: node.address.clone(),
            user: node.user.clone(),
        }
    }
}

/// How the executor should treat the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Apply,
    /// Report what would change without changing it
    Check,
}

/// One executor invocation: an action against a resolved host set.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Phase label for logs (`worker-join/worker01`, `reset`)
    pub label: String,
    pub action: Action,
    /// Inventory file describing every node of the topology
    pub inventory: PathBuf,
    pub hosts: Vec<HostTarget>,
    pub tags: Vec<String>,
    pub vars: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, SecretValue>,
    pub mode: ExecutionMode,
    pub verbosity: u8,
    /// Parallel host limit inside the executor
    pub forks: usize,
}

impl ExecutionRequest {
    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    Ok,
    Failed(String),
    Unreachable(String),
}

impl HostStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HostStatus::Ok)
    }
}

/// Per-host result plus any named outputs the action reported.
#[derive(Debug, Clone)]
pub struct HostReport {
    pub host: String,
    pub status: HostStatus,
    pub outputs: BTreeMap<String, String>,
}

impl HostReport {
    pub fn ok(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Ok,
            outputs: BTreeMap::new(),
        }
    }

    pub fn failed(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Failed(reason.into()),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub hosts: Vec<HostReport>,
}

impl ExecutionReport {
    pub fn host(&self, name: &str) -> Option<&HostReport> {
        self.hosts.iter().find(|h| h.host == name)
    }
}

/// Opaque configuration-management executor.
///
/// Implementations run the action once per invocation and report one result
/// per targeted host. No retries are layered on top.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError>;
}

/// Reachability check run against every target before the action.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// `Err` carries a human-readable reason.
    async fn probe(&self, host: &HostTarget) -> Result<(), String>;
}
