//! Phase plan builder.
//!
//! Turns a validated [`Topology`] into the ordered list of phases needed to
//! bring the cluster up. Every branch is decided from topology facts and the
//! declared storage request, so the plan is fixed before any phase runs.

use crate::secrets::CredentialKind;
use crate::settings::{ClusterSpec, Cni, StorageSpec};
use crate::topology::{Role, Topology, TopologyError};
use serde::{Deserialize, Serialize};

/// Tagged phase identifier. Join phases carry the node they join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PhaseId {
    Network,
    ContainerRuntime,
    ClusterTooling,
    LoadBalancer,
    PrimaryInit,
    ControlPlaneJoin(String),
    WorkerJoin(String),
    Overlay,
    SharedStorage,
}

const CONTROL_PLANE_JOIN_PREFIX: &str = "control-plane-join/";
const WORKER_JOIN_PREFIX: &str = "worker-join/";

impl PhaseId {
    /// Node a join phase targets.
    pub fn node(&self) -> Option<&str> {
        match self {
            PhaseId::ControlPlaneJoin(node) | PhaseId::WorkerJoin(node) => Some(node),
            _ => None,
        }
    }

    /// Credentials the phase must be presented with before it runs.
    pub fn consumes(&self) -> &'static [CredentialKind] {
        match self {
            PhaseId::ControlPlaneJoin(_) => &[
                CredentialKind::JoinTokenControlPlane,
                CredentialKind::CertificateUploadKey,
            ],
            PhaseId::WorkerJoin(_) => &[CredentialKind::JoinTokenWorker],
            _ => &[],
        }
    }

    pub fn is_join(&self) -> bool {
        self.node().is_some()
    }

    pub fn group(&self) -> PhaseGroup {
        match self {
            PhaseId::Network => PhaseGroup::Network,
            PhaseId::ContainerRuntime => PhaseGroup::Runtime,
            PhaseId::ClusterTooling => PhaseGroup::Tooling,
            PhaseId::LoadBalancer => PhaseGroup::LoadBalancer,
            PhaseId::PrimaryInit | PhaseId::ControlPlaneJoin(_) | PhaseId::WorkerJoin(_) => {
                PhaseGroup::Cluster
            }
            PhaseId::Overlay => PhaseGroup::Overlay,
            PhaseId::SharedStorage => PhaseGroup::Storage,
        }
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseId::Network => f.write_str("network"),
            PhaseId::ContainerRuntime => f.write_str("container-runtime"),
            PhaseId::ClusterTooling => f.write_str("cluster-tooling"),
            PhaseId::LoadBalancer => f.write_str("load-balancer"),
            PhaseId::PrimaryInit => f.write_str("primary-init"),
            PhaseId::ControlPlaneJoin(node) => write!(f, "{}{}", CONTROL_PLANE_JOIN_PREFIX, node),
            PhaseId::WorkerJoin(node) => write!(f, "{}{}", WORKER_JOIN_PREFIX, node),
            PhaseId::Overlay => f.write_str("overlay-network"),
            PhaseId::SharedStorage => f.write_str("shared-storage"),
        }
    }
}

impl std::str::FromStr for PhaseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(node) = s.strip_prefix(CONTROL_PLANE_JOIN_PREFIX) {
            if !node.is_empty() {
                return Ok(PhaseId::ControlPlaneJoin(node.to_string()));
            }
        }
        if let Some(node) = s.strip_prefix(WORKER_JOIN_PREFIX) {
            if !node.is_empty() {
                return Ok(PhaseId::WorkerJoin(node.to_string()));
            }
        }
        match s {
            "network" => Ok(PhaseId::Network),
            "container-runtime" => Ok(PhaseId::ContainerRuntime),
            "cluster-tooling" => Ok(PhaseId::ClusterTooling),
            "load-balancer" => Ok(PhaseId::LoadBalancer),
            "primary-init" => Ok(PhaseId::PrimaryInit),
            "overlay-network" => Ok(PhaseId::Overlay),
            "shared-storage" => Ok(PhaseId::SharedStorage),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

impl From<PhaseId> for String {
    fn from(id: PhaseId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for PhaseId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Operator-facing entry points; each owns a contiguous slice of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseGroup {
    Network,
    Runtime,
    Tooling,
    LoadBalancer,
    Cluster,
    Overlay,
    Storage,
}

impl std::fmt::Display for PhaseGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PhaseGroup::Network => "network",
            PhaseGroup::Runtime => "runtime",
            PhaseGroup::Tooling => "tooling",
            PhaseGroup::LoadBalancer => "load-balancer",
            PhaseGroup::Cluster => "cluster",
            PhaseGroup::Overlay => "overlay",
            PhaseGroup::Storage => "storage",
        })
    }
}

/// Delegated action the external executor performs for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ConfigureNetwork,
    InstallContainerRuntime,
    InstallClusterTooling,
    InstallLoadBalancer,
    InitControlPlane,
    JoinControlPlane,
    JoinWorker,
    DeployOverlay(Cni),
    ConfigureStorage,
    /// Out-of-band teardown, never part of a plan
    Reset,
}

impl Action {
    pub fn id(&self) -> &'static str {
        match self {
            Action::ConfigureNetwork => "configure-network",
            Action::InstallContainerRuntime => "install-container-runtime",
            Action::InstallClusterTooling => "install-cluster-tooling",
            Action::InstallLoadBalancer => "install-load-balancer",
            Action::InitControlPlane => "init-control-plane",
            Action::JoinControlPlane => "join-control-plane",
            Action::JoinWorker => "join-worker",
            Action::DeployOverlay(Cni::Calico) => "deploy-overlay-calico",
            Action::DeployOverlay(Cni::Flannel) => "deploy-overlay-flannel",
            Action::ConfigureStorage => "configure-storage",
            Action::Reset => "reset-cluster",
        }
    }

    /// Playbook file implementing the action.
    pub fn playbook(&self) -> String {
        format!("{}.yml", self.id())
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Idempotency {
    SafeToRepeat,
    Destructive,
}

/// One role-targeted step of the plan.
#[derive(Debug, Clone)]
pub struct Phase {
    pub id: PhaseId,
    pub action: Action,
    /// Roles whose hosts the phase targets, resolved in this order
    pub roles: Vec<Role>,
    /// Narrow the resolved hosts to one node
    pub limit: Option<String>,
    pub preconditions: Vec<PhaseId>,
    pub idempotency: Idempotency,
    /// Keep going when some (not all) hosts fail
    pub tolerates_partial_failure: bool,
}

impl Phase {
    fn new(id: PhaseId, action: Action, roles: &[Role]) -> Self {
        Self {
            id,
            action,
            roles: roles.to_vec(),
            limit: None,
            preconditions: Vec::new(),
            idempotency: Idempotency::SafeToRepeat,
            tolerates_partial_failure: false,
        }
    }

    fn after(mut self, preconditions: impl IntoIterator<Item = PhaseId>) -> Self {
        self.preconditions.extend(preconditions);
        self
    }

    fn limit(mut self, node: &str) -> Self {
        self.limit = Some(node.to_string());
        self
    }

    fn destructive(mut self) -> Self {
        self.idempotency = Idempotency::Destructive;
        self
    }

    fn tolerant(mut self) -> Self {
        self.tolerates_partial_failure = true;
        self
    }
}

/// Ordered phase list for one topology.
#[derive(Debug, Clone)]
pub struct Plan {
    phases: Vec<Phase>,
    warnings: Vec<String>,
}

impl Plan {
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, id: &PhaseId) -> Option<&Phase> {
        self.phases.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &PhaseId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<PhaseId> {
        self.phases.iter().map(|p| p.id.clone()).collect()
    }

    pub fn group(&self, group: PhaseGroup) -> Vec<&Phase> {
        self.phases.iter().filter(|p| p.id.group() == group).collect()
    }

    /// Non-fatal findings from building the plan.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

pub struct PlanBuilder<'a> {
    topology: &'a Topology,
    cluster: &'a ClusterSpec,
    storage: Option<&'a StorageSpec>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(topology: &'a Topology, cluster: &'a ClusterSpec) -> Self {
        Self {
            topology,
            cluster,
            storage: None,
        }
    }

    pub fn with_storage(mut self, storage: Option<&'a StorageSpec>) -> Self {
        self.storage = storage;
        self
    }

    pub fn build(&self) -> Result<Plan, TopologyError> {
        let topology = self.topology;
        let primary = topology
            .primary_control_plane()
            .ok_or(TopologyError::NoControlPlane)?;
        let mut phases = Vec::new();
        let mut warnings = Vec::new();

        phases.push(Phase::new(
            PhaseId::Network,
            Action::ConfigureNetwork,
            &Role::ALL,
        ));
        phases.push(
            Phase::new(
                PhaseId::ContainerRuntime,
                Action::InstallContainerRuntime,
                &[Role::ControlPlane, Role::Worker],
            )
            .after([PhaseId::Network]),
        );
        phases.push(
            Phase::new(
                PhaseId::ClusterTooling,
                Action::InstallClusterTooling,
                &[Role::ControlPlane, Role::Worker],
            )
            .after([PhaseId::ContainerRuntime]),
        );

        let mut init_after = vec![PhaseId::ClusterTooling];
        if topology.has_load_balancer() {
            phases.push(
                Phase::new(
                    PhaseId::LoadBalancer,
                    Action::InstallLoadBalancer,
                    &[Role::LoadBalancer],
                )
                .after([PhaseId::Network]),
            );
            init_after.push(PhaseId::LoadBalancer);
        }

        phases.push(
            Phase::new(
                PhaseId::PrimaryInit,
                Action::InitControlPlane,
                &[Role::ControlPlane],
            )
            .limit(&primary.name)
            .after(init_after)
            .destructive(),
        );

        for node in topology
            .hosts_for_role(Role::ControlPlane)
            .into_iter()
            .skip(1)
        {
            phases.push(
                Phase::new(
                    PhaseId::ControlPlaneJoin(node.name.clone()),
                    Action::JoinControlPlane,
                    &[Role::ControlPlane],
                )
                .limit(&node.name)
                .after([PhaseId::PrimaryInit])
                .destructive(),
            );
        }

        for node in topology.hosts_for_role(Role::Worker) {
            phases.push(
                Phase::new(
                    PhaseId::WorkerJoin(node.name.clone()),
                    Action::JoinWorker,
                    &[Role::Worker],
                )
                .limit(&node.name)
                .after([PhaseId::PrimaryInit])
                .destructive(),
            );
        }

        phases.push(
            Phase::new(
                PhaseId::Overlay,
                Action::DeployOverlay(self.cluster.cni),
                &[Role::ControlPlane],
            )
            .limit(&primary.name)
            .after([PhaseId::PrimaryInit]),
        );

        if let Some(storage) = self.storage {
            let server = topology
                .node(&storage.server)
                .ok_or_else(|| TopologyError::UnknownStorageServer(storage.server.clone()))?;

            let mut roles = vec![Role::ControlPlane, Role::Worker];
            if server.role == Role::LoadBalancer {
                let warning = format!(
                    "NFS server {} is the load-balancer node; a control-plane or worker node is recommended",
                    server.name
                );
                tracing::warn!("[PlanBuilder] {}", warning);
                warnings.push(warning);
                roles.push(Role::LoadBalancer);
            }

            phases.push(
                Phase::new(PhaseId::SharedStorage, Action::ConfigureStorage, &roles)
                    .after([PhaseId::Overlay])
                    .tolerant(),
            );
        }

        tracing::info!(
            "[PlanBuilder] Planned {} phases for {} control-plane / {} worker nodes (endpoint {})",
            phases.len(),
            topology.control_plane_count(),
            topology.worker_count(),
            topology.control_plane_endpoint()
        );

        Ok(Plan { phases, warnings })
    }
}
