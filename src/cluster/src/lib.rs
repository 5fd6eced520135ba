//! cluster: phase-ordered bootstrap of a kubeadm cluster.
//!
//! Topology declaration, the phase plan derived from it, short-lived join
//! credentials, the durable execution ledger, and the orchestrator that drives
//! an external executor through the plan.

pub mod error;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod secrets;
pub mod settings;
pub mod state;
pub mod templates;
pub mod topology;

pub use error::{BootstrapError, ExecutorError, StateError};
pub use executor::{
    ExecutionMode, ExecutionReport, ExecutionRequest, HostProbe, HostReport, HostStatus,
    HostTarget, PhaseExecutor,
};
pub use ledger::{Ledger, Outcome, PhaseRun};
pub use orchestrator::{
    CancelFlag, ExecutionSettings, Orchestrator, PhaseSelection, PlannedStep, ResetPlan,
    RunMode, RunOptions, RunSummary,
};
pub use plan::{Action, Idempotency, Phase, PhaseGroup, PhaseId, Plan, PlanBuilder};
pub use progress::{BootstrapProgress, ChannelProgressReporter, LogProgressReporter, ProgressReporter};
pub use secrets::{
    AdminCredentialBundle, BootstrapCredential, CredentialKind, SecretError, SecretManager,
    SecretValue,
};
pub use settings::{ClusterSpec, Cni, CredentialPolicy, StorageSpec};
pub use state::StateStore;
pub use topology::{Endpoint, Node, NodeDecl, Role, Topology, TopologyError};
