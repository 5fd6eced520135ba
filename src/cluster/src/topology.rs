//! Cluster topology: declared nodes, their roles, and the derived deployment shape.
//!
//! A [`Topology`] is built once from the operator's declaration and passed by
//! reference to the plan builder and orchestrator. Node names are assigned per
//! role in declaration order (`controlplane01`, `worker02`, ...) and never
//! change for the lifetime of the topology.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role a node plays in the cluster. Each node has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    ControlPlane,
    Worker,
    LoadBalancer,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::ControlPlane, Role::Worker, Role::LoadBalancer];

    /// Prefix for generated node names.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            Role::ControlPlane => "controlplane",
            Role::Worker => "worker",
            Role::LoadBalancer => "loadbalancer",
        }
    }

    /// Inventory group the role's hosts are listed under.
    pub fn inventory_group(&self) -> &'static str {
        match self {
            Role::ControlPlane => "controlplane",
            Role::Worker => "workers",
            Role::LoadBalancer => "loadbalancer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::ControlPlane => "control-plane",
            Role::Worker => "worker",
            Role::LoadBalancer => "load-balancer",
        })
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "control-plane" | "controlplane" | "master" => Ok(Role::ControlPlane),
            "worker" => Ok(Role::Worker),
            "load-balancer" | "loadbalancer" | "lb" => Ok(Role::LoadBalancer),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// One declared host before names are assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDecl {
    pub address: String,
    /// Login principal used by the executor
    pub user: String,
    pub role: Role,
}

impl NodeDecl {
    pub fn new(address: impl Into<String>, user: impl Into<String>, role: Role) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            role,
        }
    }
}

/// A named node of a validated topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub user: String,
    pub role: Role,
}

/// Address and port of the cluster's API front door.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    #[error("at least one control-plane node is required")]
    NoControlPlane,

    #[error("{control_planes} control-plane nodes require a load-balancer node as a stable endpoint")]
    MissingLoadBalancer { control_planes: usize },

    #[error("at most one load-balancer node is supported, {0} declared")]
    MultipleLoadBalancers(usize),

    #[error("node #{index} has an empty address")]
    EmptyAddress { index: usize },

    #[error("node {address} has an empty login principal")]
    EmptyPrincipal { address: String },

    #[error("address {0} is declared more than once")]
    DuplicateAddress(String),

    #[error("duplicate node name {0}")]
    DuplicateName(String),

    #[error("storage server {0} is not a node of this topology")]
    UnknownStorageServer(String),
}

/// Validated, ordered set of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    nodes: Vec<Node>,
    api_port: u16,
}

impl Topology {
    /// Validate a declaration and assign stable names by role ordinal.
    pub fn declare(decls: &[NodeDecl], api_port: u16) -> Result<Self, TopologyError> {
        let mut seen = HashSet::new();
        let mut counters = [0usize; 3];
        let mut nodes = Vec::with_capacity(decls.len());

        for (index, decl) in decls.iter().enumerate() {
            let address = decl.address.trim();
            if address.is_empty() {
                return Err(TopologyError::EmptyAddress { index });
            }
            if decl.user.trim().is_empty() {
                return Err(TopologyError::EmptyPrincipal {
                    address: address.to_string(),
                });
            }
            if !seen.insert(address.to_string()) {
                return Err(TopologyError::DuplicateAddress(address.to_string()));
            }

            let slot = match decl.role {
                Role::ControlPlane => 0,
                Role::Worker => 1,
                Role::LoadBalancer => 2,
            };
            counters[slot] += 1;

            nodes.push(Node {
                name: format!("{}{:02}", decl.role.name_prefix(), counters[slot]),
                address: address.to_string(),
                user: decl.user.trim().to_string(),
                role: decl.role,
            });
        }

        let topology = Self { nodes, api_port };
        topology.validate()?;

        tracing::debug!(
            "[Topology] Declared {} control-plane, {} worker, load balancer: {}",
            topology.control_plane_count(),
            topology.worker_count(),
            topology.has_load_balancer()
        );

        Ok(topology)
    }

    /// Check role cardinality and name uniqueness. Also run on topologies
    /// loaded from disk.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let control_planes = self.control_plane_count();
        let balancers = self.count(Role::LoadBalancer);

        if control_planes == 0 {
            return Err(TopologyError::NoControlPlane);
        }
        if balancers > 1 {
            return Err(TopologyError::MultipleLoadBalancers(balancers));
        }
        if control_planes > 1 && balancers == 0 {
            return Err(TopologyError::MissingLoadBalancer { control_planes });
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(TopologyError::DuplicateName(node.name.clone()));
            }
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    fn count(&self, role: Role) -> usize {
        self.nodes.iter().filter(|n| n.role == role).count()
    }

    pub fn control_plane_count(&self) -> usize {
        self.count(Role::ControlPlane)
    }

    pub fn worker_count(&self) -> usize {
        self.count(Role::Worker)
    }

    pub fn has_load_balancer(&self) -> bool {
        self.count(Role::LoadBalancer) > 0
    }

    /// Nodes of one role, in declaration order. Join phases depend on this order.
    pub fn hosts_for_role(&self, role: Role) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.role == role).collect()
    }

    /// First declared control-plane node; it runs cluster initialization.
    pub fn primary_control_plane(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.role == Role::ControlPlane)
    }

    pub fn load_balancer(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.role == Role::LoadBalancer)
    }

    /// The load balancer's address when present, otherwise the sole
    /// control-plane node's address.
    pub fn control_plane_endpoint(&self) -> Endpoint {
        let host = self
            .load_balancer()
            .or_else(|| self.primary_control_plane())
            .map(|n| n.address.clone())
            .unwrap_or_default();
        Endpoint {
            host,
            port: self.api_port,
        }
    }
}
