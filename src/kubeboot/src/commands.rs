//! Command handlers behind the CLI.
//!
//! Each handler works on a loaded [`Workspace`] and returns text for the
//! binary to print. Exit codes come from [`CommandError::exit_code`].

use crate::ansible::AnsibleExecutor;
use crate::config::{ConfigError, KubebootConfig};
use crate::probe::TcpProbe;
use cluster::error::{BootstrapError, StateError};
use cluster::ledger::Ledger;
use cluster::orchestrator::{
    CancelFlag, Orchestrator, PlannedStep, ResetPlan, RunMode, RunOptions, RunSummary,
};
use cluster::plan::{Idempotency, Plan, PlanBuilder};
use cluster::secrets::SecretManager;
use cluster::state::StateStore;
use cluster::topology::{Topology, TopologyError};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("Failed to write to the terminal: {0}")]
    Io(#[from] io::Error),
}

impl CommandError {
    /// 2 for configuration and usage errors, 1 for a halted run.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Config(_) | CommandError::Topology(_) => 2,
            CommandError::Bootstrap(
                BootstrapError::InvalidTopology(_)
                | BootstrapError::UnknownPhase(_)
                | BootstrapError::ResetNotConfirmed { .. },
            ) => 2,
            _ => 1,
        }
    }
}

/// Configuration, derived topology and plan, and the opened state directory.
pub struct Workspace {
    pub config: KubebootConfig,
    pub config_path: PathBuf,
    pub topology: Topology,
    pub plan: Plan,
    pub store: StateStore,
}

impl Workspace {
    pub fn load(config: Option<&Path>) -> Result<Self, CommandError> {
        let (config, config_path) = KubebootConfig::load(config)?;
        Self::from_config(config, config_path)
    }

    pub fn from_config(config: KubebootConfig, config_path: PathBuf) -> Result<Self, CommandError> {
        let topology = config.topology()?;
        let plan = PlanBuilder::new(&topology, &config.cluster)
            .with_storage(config.storage.as_ref())
            .build()?;
        for warning in plan.warnings() {
            tracing::warn!("[Workspace] {}", warning);
        }
        let store = StateStore::open(&config.state_dir)?;
        Ok(Self {
            config,
            config_path,
            topology,
            plan,
            store,
        })
    }

    pub fn orchestrator(&self, cancel: CancelFlag) -> Orchestrator<'_> {
        let executor = AnsibleExecutor::new(&self.config.executor);
        let settings = self.config.execution_settings();
        let probe = TcpProbe::new(self.config.executor.ssh_port, settings.probe_timeout);

        Orchestrator::new(
            &self.topology,
            &self.config.cluster,
            &self.plan,
            &self.store,
            Arc::new(executor),
            Arc::new(probe),
        )
        .with_storage(self.config.storage.as_ref())
        .with_secrets(SecretManager::new(self.config.credentials.clone()))
        .with_settings(settings)
        .with_cancel(cancel)
    }
}

/// Validate and persist the topology and inventory.
pub fn declare(workspace: &Workspace) -> Result<String, CommandError> {
    let _lock = workspace.store.lock()?;
    let session = workspace
        .store
        .open_session(&workspace.topology, &workspace.config.cluster)?;

    let mut out = render_topology(&workspace.topology);
    let _ = writeln!(
        out,
        "Inventory written to {}",
        workspace.store.inventory_path().display()
    );
    if let Some(archived) = session.archived_ledger {
        let _ = writeln!(
            out,
            "Control-plane endpoint changed; previous ledger archived to {}",
            archived.display()
        );
    }
    Ok(out)
}

pub fn render_topology(topology: &Topology) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Control-plane endpoint: {}", topology.control_plane_endpoint());
    for node in topology.nodes() {
        let _ = writeln!(
            out,
            "  {:<16} {:<14} {}@{}",
            node.name,
            node.role.to_string(),
            node.user,
            node.address
        );
    }
    out
}

/// Resolved plan with hosts and completion state. Contacts nothing.
pub async fn plan(workspace: &Workspace) -> Result<String, CommandError> {
    let options = RunOptions {
        mode: RunMode::DryRun,
        ..RunOptions::default()
    };
    let summary = workspace.orchestrator(CancelFlag::new()).run(&options).await?;
    Ok(render_plan(&workspace.plan, &summary.planned))
}

pub fn render_plan(plan: &Plan, steps: &[PlannedStep]) -> String {
    let mut out = String::new();
    for (index, step) in steps.iter().enumerate() {
        let mut flags = Vec::new();
        if let Some(phase) = plan.get(&step.phase) {
            if phase.idempotency == Idempotency::Destructive {
                flags.push("destructive");
            }
            if phase.tolerates_partial_failure {
                flags.push("tolerates partial failure");
            }
        }
        if step.already_succeeded {
            flags.push("done");
        }
        let _ = writeln!(
            out,
            "{:>2}. {:<36} {:<28} [{}]{}",
            index + 1,
            step.phase.to_string(),
            step.action.to_string(),
            step.hosts.join(", "),
            if flags.is_empty() {
                String::new()
            } else {
                format!("  ({})", flags.join(", "))
            }
        );
    }
    for warning in plan.warnings() {
        let _ = writeln!(out, "warning: {}", warning);
    }
    out
}

pub fn status(workspace: &Workspace) -> Result<String, CommandError> {
    let ledger = workspace.store.peek_ledger(&workspace.topology)?;
    let mut out = render_topology(&workspace.topology);
    out.push_str(&render_status(&workspace.plan, &ledger));
    for artifact in workspace.store.artifacts() {
        let _ = writeln!(out, "Artifact: {}", artifact.display());
    }
    Ok(out)
}

/// Latest outcome per planned phase and the resume point.
pub fn render_status(plan: &Plan, ledger: &Ledger) -> String {
    let mut out = String::new();
    for phase in plan.phases() {
        let line = match ledger.last_attempt(&phase.id) {
            Some(run) => {
                let mut line = format!(
                    "{} at {} ({}s)",
                    run.outcome,
                    run.finished_at.format("%Y-%m-%d %H:%M:%S"),
                    run.duration().num_seconds()
                );
                if !run.failed_hosts.is_empty() {
                    let _ = write!(line, " failed on {}", run.failed_hosts.join(", "));
                }
                line
            }
            None => "pending".to_string(),
        };
        let _ = writeln!(out, "  {:<36} {}", phase.id.to_string(), line);
    }
    match ledger.resume_point(plan) {
        Some(next) => {
            let _ = writeln!(out, "Next phase: {}", next);
        }
        None => {
            let _ = writeln!(out, "All phases succeeded");
        }
    }
    out
}

pub async fn run(
    workspace: &Workspace,
    options: &RunOptions,
    cancel: CancelFlag,
) -> Result<String, CommandError> {
    let summary = workspace.orchestrator(cancel).run(options).await?;
    if options.mode == RunMode::DryRun {
        return Ok(render_plan(&workspace.plan, &summary.planned));
    }
    Ok(render_summary(&summary, options.mode))
}

pub fn render_summary(summary: &RunSummary, mode: RunMode) -> String {
    let mut out = String::new();
    let verb = if mode == RunMode::Check {
        "Verified"
    } else {
        "Ran"
    };
    for id in &summary.executed {
        let _ = writeln!(out, "{} {}", verb, id);
    }
    for id in &summary.skipped {
        let _ = writeln!(out, "Skipped {} (already succeeded)", id);
    }
    if let Some(archived) = &summary.archived_ledger {
        let _ = writeln!(out, "Stale ledger archived to {}", archived.display());
    }
    if let Some(archived) = &summary.archived_artifacts {
        let _ = writeln!(out, "Stale artifacts archived to {}", archived.display());
    }
    if let Some(bundle) = &summary.admin_bundle {
        let _ = writeln!(
            out,
            "Cluster ready. Admin kubeconfig: {} (sensitive, unencrypted)",
            bundle.display()
        );
    } else if summary.complete {
        let _ = writeln!(out, "Cluster ready.");
    }
    out
}

/// Describe the reset on `notice`, then perform it only with a matching
/// confirmation. The description is written before any host is contacted.
pub async fn reset(
    workspace: &Workspace,
    confirmation: Option<&str>,
    options: &RunOptions,
    cancel: CancelFlag,
    notice: &mut dyn io::Write,
) -> Result<String, CommandError> {
    let mut orchestrator = workspace.orchestrator(cancel);
    let described: ResetPlan = orchestrator.describe_reset();
    write!(notice, "{}", described)?;

    if confirmation != Some(described.endpoint.as_str()) {
        writeln!(
            notice,
            "Re-run with --confirm-destroy {} to proceed.",
            described.endpoint
        )?;
        notice.flush()?;
        return Err(BootstrapError::ResetNotConfirmed {
            expected: described.endpoint,
        }
        .into());
    }
    notice.flush()?;

    orchestrator.reset(confirmation, options).await?;
    Ok("Reset complete.\n".to_string())
}
