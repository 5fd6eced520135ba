//! Phase orchestrator.
//!
//! Walks the plan strictly in order. Each phase is a barrier: its hosts are
//! resolved, its preconditions and credentials checked, its targets probed,
//! and the executor invoked once for the whole host set. The PhaseRun is
//! recorded before the next phase may start. Any failure halts the run.
//! Re-invoking skips phases the ledger already shows as succeeded.

use crate::error::{BootstrapError, ExecutorError};
use crate::executor::{
    ExecutionMode, ExecutionReport, ExecutionRequest, HostProbe, HostStatus, HostTarget,
    PhaseExecutor,
};
use crate::ledger::{Ledger, Outcome, PhaseRun};
use crate::plan::{Action, Idempotency, Phase, PhaseGroup, PhaseId, Plan};
use crate::progress::{step_progress, LogProgressReporter, ProgressReporter};
use crate::secrets::SecretManager;
use crate::settings::{ClusterSpec, StorageSpec};
use crate::state::StateStore;
use crate::templates::TranscriptEntry;
use crate::topology::{Role, Topology};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Stops a run before its next phase. In-flight phases always finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Limits applied to every phase.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub forks: usize,
    pub executor_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            forks: 5,
            executor_timeout: Duration::from_secs(30 * 60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Which part of the plan a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PhaseSelection {
    #[default]
    All,
    Group(PhaseGroup),
    Only(PhaseId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Apply,
    /// Verification only; the ledger is not written
    Check,
    /// Resolve and print; nothing is contacted
    DryRun,
}

/// Mode selector, resolved once at the command boundary.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub selection: PhaseSelection,
    pub mode: RunMode,
    pub tags: Vec<String>,
    pub verbosity: u8,
    /// Re-run succeeded phases of the selection (safe-to-repeat only)
    pub force: bool,
}

/// A phase as a dry run would execute it.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub phase: PhaseId,
    pub action: Action,
    pub hosts: Vec<String>,
    pub already_succeeded: bool,
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub executed: Vec<PhaseId>,
    pub skipped: Vec<PhaseId>,
    pub planned: Vec<PlannedStep>,
    pub admin_bundle: Option<PathBuf>,
    /// Every plan phase has succeeded
    pub complete: bool,
    pub archived_ledger: Option<PathBuf>,
    pub archived_artifacts: Option<PathBuf>,
}

impl RunSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            executed: Vec::new(),
            skipped: Vec::new(),
            planned: Vec::new(),
            admin_bundle: None,
            complete: false,
            archived_ledger: None,
            archived_artifacts: None,
        }
    }
}

/// Everything a reset will destroy.
#[derive(Debug, Clone)]
pub struct ResetPlan {
    pub endpoint: String,
    pub nodes: Vec<HostTarget>,
    pub ledger: PathBuf,
    pub artifacts: Vec<PathBuf>,
}

impl std::fmt::Display for ResetPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reset of cluster at {} will destroy:", self.endpoint)?;
        for node in &self.nodes {
            writeln!(
                f,
                "  node {} ({}): kubeadm state, etcd data, CNI configuration",
                node.name, node.address
            )?;
        }
        writeln!(f, "  execution ledger {}", self.ledger.display())?;
        for artifact in &self.artifacts {
            writeln!(f, "  artifact {}", artifact.display())?;
        }
        Ok(())
    }
}

/// One phase execution in progress.
struct Attempt {
    phase: PhaseId,
    hosts: Vec<String>,
    started_at: DateTime<Utc>,
}

impl Attempt {
    fn begin(phase: &Phase, targets: &[HostTarget]) -> Self {
        Self {
            phase: phase.id.clone(),
            hosts: targets.iter().map(|h| h.name.clone()).collect(),
            started_at: Utc::now(),
        }
    }

    fn finish(
        &self,
        run_id: Uuid,
        outcome: Outcome,
        failed_hosts: Vec<String>,
        error: Option<String>,
    ) -> PhaseRun {
        PhaseRun {
            run_id,
            phase: self.phase.clone(),
            hosts: self.hosts.clone(),
            failed_hosts,
            started_at: self.started_at,
            finished_at: Utc::now(),
            outcome,
            error,
        }
    }
}

pub struct Orchestrator<'a> {
    topology: &'a Topology,
    cluster: &'a ClusterSpec,
    storage: Option<&'a StorageSpec>,
    plan: &'a Plan,
    store: &'a StateStore,
    executor: Arc<dyn PhaseExecutor>,
    probe: Arc<dyn HostProbe>,
    secrets: SecretManager,
    progress: Arc<dyn ProgressReporter>,
    settings: ExecutionSettings,
    cancel: CancelFlag,
    ledger: Ledger,
    inventory: PathBuf,
    run_id: Uuid,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        topology: &'a Topology,
        cluster: &'a ClusterSpec,
        plan: &'a Plan,
        store: &'a StateStore,
        executor: Arc<dyn PhaseExecutor>,
        probe: Arc<dyn HostProbe>,
    ) -> Self {
        Self {
            topology,
            cluster,
            storage: None,
            plan,
            store,
            executor,
            probe,
            secrets: SecretManager::new(Default::default()),
            progress: Arc::new(LogProgressReporter),
            settings: ExecutionSettings::default(),
            cancel: CancelFlag::new(),
            ledger: Ledger::new(),
            inventory: store.inventory_path(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_storage(mut self, storage: Option<&'a StorageSpec>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_secrets(mut self, secrets: SecretManager) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn secrets(&self) -> &SecretManager {
        &self.secrets
    }

    fn select(&self, selection: &PhaseSelection) -> Result<Vec<&'a Phase>, BootstrapError> {
        let plan: &'a Plan = self.plan;
        match selection {
            PhaseSelection::All => Ok(plan.phases().iter().collect()),
            PhaseSelection::Group(group) => {
                let phases = plan.group(*group);
                if phases.is_empty() {
                    return Err(BootstrapError::UnknownPhase(group.to_string()));
                }
                Ok(phases)
            }
            PhaseSelection::Only(id) => plan
                .get(id)
                .map(|p| vec![p])
                .ok_or_else(|| BootstrapError::UnknownPhase(id.to_string())),
        }
    }

    /// Hosts of the phase's roles in declaration order, narrowed by its limit.
    pub fn resolve_targets(&self, phase: &Phase) -> Vec<HostTarget> {
        phase
            .roles
            .iter()
            .flat_map(|role| self.topology.hosts_for_role(*role))
            .filter(|node| phase.limit.as_ref().map_or(true, |l| &node.name == l))
            .map(HostTarget::from)
            .collect()
    }

    /// Run the selected phases.
    pub async fn run(&mut self, options: &RunOptions) -> Result<RunSummary, BootstrapError> {
        let phases = self.select(&options.selection)?;

        if options.mode == RunMode::DryRun {
            return self.dry_run(&phases);
        }

        let _lock = self.store.lock()?;
        let session = if options.mode == RunMode::Check {
            self.store.check_session(self.topology, self.cluster)?
        } else {
            self.store.open_session(self.topology, self.cluster)?
        };
        self.ledger = session.ledger;
        self.inventory = session.inventory;

        let endpoint = self.topology.control_plane_endpoint().to_string();
        if options.mode == RunMode::Apply {
            if let Some(bundle) = self.store.load_admin_bundle(&endpoint)? {
                self.secrets.restore_admin(bundle);
            }
        }

        let mut summary = RunSummary::new(self.run_id);
        summary.archived_ledger = session.archived_ledger;
        summary.archived_artifacts = session.archived_artifacts;

        tracing::info!(
            "[Orchestrator] Run {} ({:?}): {} phases selected, endpoint {}",
            self.run_id,
            options.mode,
            phases.len(),
            endpoint
        );
        if let Some(resume) = self.ledger.resume_point(self.plan) {
            if !self.ledger.is_empty() {
                tracing::info!("[Orchestrator] Resuming at {}", resume);
            }
        }

        let mut verified = HashSet::new();
        let total = phases.len();

        for (index, phase) in phases.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!("[Orchestrator] Cancelled before {}", phase.id);
                return Err(BootstrapError::Cancelled {
                    next: phase.id.clone(),
                });
            }

            if options.mode == RunMode::Apply && self.ledger.has_succeeded(&phase.id) {
                if !options.force {
                    tracing::info!("[Orchestrator] Skipping {} (already succeeded)", phase.id);
                    summary.skipped.push(phase.id.clone());
                    continue;
                }
                if phase.idempotency == Idempotency::Destructive {
                    return Err(BootstrapError::DestructiveRerun {
                        phase: phase.id.clone(),
                    });
                }
                tracing::info!("[Orchestrator] Re-running {} on request", phase.id);
            }

            let label = phase.id.to_string();
            self.progress.emit_phase(
                step_progress(0, 100, index, total),
                format!("Running {}", label),
                &label,
            );

            self.run_phase(phase, options, &mut verified).await?;
            summary.executed.push(phase.id.clone());

            self.progress.emit_phase(
                step_progress(0, 100, index + 1, total),
                format!("Completed {}", label),
                &label,
            );
        }

        if options.mode == RunMode::Apply && self.ledger.is_complete(self.plan) {
            summary.complete = true;
            match self.secrets.finalize() {
                Ok(bundle) => {
                    let path = self.store.save_admin_bundle(&bundle)?;
                    tracing::warn!(
                        "[Orchestrator] Admin credentials written unencrypted to {:?}; treat this file as sensitive",
                        path
                    );
                    summary.admin_bundle = Some(path);
                }
                Err(e) => {
                    tracing::warn!("[Orchestrator] Plan complete but {}", e);
                }
            }
        }

        Ok(summary)
    }

    fn dry_run(&self, phases: &[&'a Phase]) -> Result<RunSummary, BootstrapError> {
        let ledger = self.store.peek_ledger(self.topology)?;
        let mut summary = RunSummary::new(self.run_id);
        for phase in phases {
            let step = PlannedStep {
                phase: phase.id.clone(),
                action: phase.action,
                hosts: self
                    .resolve_targets(phase)
                    .into_iter()
                    .map(|h| h.name)
                    .collect(),
                already_succeeded: ledger.has_succeeded(&phase.id),
            };
            tracing::info!(
                "[Orchestrator] Dry run: {} -> {} on [{}]{}",
                step.phase,
                step.action,
                step.hosts.join(", "),
                if step.already_succeeded {
                    " (already succeeded)"
                } else {
                    ""
                }
            );
            summary.planned.push(step);
        }
        summary.complete = ledger.is_complete(self.plan);
        Ok(summary)
    }

    async fn run_phase(
        &mut self,
        phase: &Phase,
        options: &RunOptions,
        verified: &mut HashSet<PhaseId>,
    ) -> Result<(), BootstrapError> {
        let timer = Instant::now();
        let targets = self.resolve_targets(phase);
        let attempt = Attempt::begin(phase, &targets);

        if targets.is_empty() {
            tracing::info!("[Orchestrator] {} has no target hosts", phase.id);
            self.record(attempt.finish(self.run_id, Outcome::Skipped, Vec::new(), None), options)?;
            return Ok(());
        }

        for pre in &phase.preconditions {
            if !self.ledger.has_succeeded(pre) && !verified.contains(pre) {
                let err = BootstrapError::PreconditionNotMet {
                    phase: phase.id.clone(),
                    missing: pre.clone(),
                };
                return Err(self.halt(&attempt, Vec::new(), err, options));
            }
        }

        let mut secrets = BTreeMap::new();
        if options.mode == RunMode::Apply {
            match self.secrets.present_for(&phase.id) {
                Ok(credentials) => {
                    for credential in credentials {
                        secrets.insert(credential.kind.variable().to_string(), credential.value);
                    }
                }
                Err(e) => {
                    let err = BootstrapError::from_secret(&phase.id, e);
                    return Err(self.halt(&attempt, Vec::new(), err, options));
                }
            }
        }

        let unreachable = self.probe_hosts(&targets).await;
        let mut contact = targets.clone();
        if !unreachable.is_empty() {
            if !phase.tolerates_partial_failure || unreachable.len() == targets.len() {
                let err = BootstrapError::HostUnreachable {
                    phase: phase.id.clone(),
                    hosts: unreachable.clone(),
                };
                return Err(self.halt(&attempt, unreachable, err, options));
            }
            contact.retain(|h| !unreachable.contains(&h.name));
        }

        let request = self.build_request(phase, contact, secrets, options);
        tracing::info!(
            "[Orchestrator] {} -> {} on [{}]",
            phase.id,
            request.action,
            request.host_names().join(", ")
        );

        let result =
            tokio::time::timeout(self.settings.executor_timeout, self.executor.execute(&request))
                .await;
        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(source)) => {
                let err = BootstrapError::Executor {
                    phase: phase.id.to_string(),
                    source,
                };
                return Err(self.halt(&attempt, attempt.hosts.clone(), err, options));
            }
            Err(_) => {
                let err = BootstrapError::Executor {
                    phase: phase.id.to_string(),
                    source: ExecutorError::Timeout(self.settings.executor_timeout),
                };
                return Err(self.halt(&attempt, attempt.hosts.clone(), err, options));
            }
        };

        let mut failed = unreachable.clone();
        let mut unreachable_all = unreachable;
        for host in &request.hosts {
            match report.host(&host.name).map(|r| &r.status) {
                Some(HostStatus::Ok) => {}
                Some(HostStatus::Failed(reason)) => {
                    tracing::warn!("[Orchestrator] {} failed on {}: {}", phase.id, host.name, reason);
                    failed.push(host.name.clone());
                }
                Some(HostStatus::Unreachable(reason)) => {
                    tracing::warn!(
                        "[Orchestrator] {} could not reach {}: {}",
                        phase.id,
                        host.name,
                        reason
                    );
                    failed.push(host.name.clone());
                    unreachable_all.push(host.name.clone());
                }
                None => {
                    tracing::warn!("[Orchestrator] {} reported nothing for {}", phase.id, host.name);
                    failed.push(host.name.clone());
                }
            }
        }

        let succeeded =
            failed.is_empty() || (phase.tolerates_partial_failure && failed.len() < targets.len());

        if !succeeded {
            let err = if failed.iter().all(|h| unreachable_all.contains(h)) {
                BootstrapError::HostUnreachable {
                    phase: phase.id.clone(),
                    hosts: failed.clone(),
                }
            } else {
                BootstrapError::PhaseActionFailed {
                    phase: phase.id.clone(),
                    hosts: failed.clone(),
                }
            };
            return Err(self.halt(&attempt, failed, err, options));
        }
        if !failed.is_empty() {
            tracing::warn!(
                "[Orchestrator] {} tolerated failures on: {}",
                phase.id,
                failed.join(", ")
            );
        }

        // Initialization only counts once its credentials are in hand.
        if options.mode == RunMode::Apply && phase.id == PhaseId::PrimaryInit {
            if let Err(err) = self.harvest_credentials(&report) {
                tracing::error!(
                    "[Orchestrator] Initialization ran but its credentials are unusable; reset before re-running {}",
                    phase.id
                );
                return Err(self.halt(&attempt, failed, err, options));
            }
        }

        self.record(
            attempt.finish(self.run_id, Outcome::Succeeded, failed, None),
            options,
        )?;
        tracing::info!(
            "[TIMING] Phase {} succeeded in {}ms",
            phase.id,
            timer.elapsed().as_millis()
        );
        verified.insert(phase.id.clone());

        if options.mode == RunMode::Apply && phase.id.is_join() {
            self.secrets.mark_consumed(&phase.id);
            self.record_join(phase)?;
        }

        Ok(())
    }

    /// Record a failed attempt and hand back the error that halts the run.
    fn halt(
        &mut self,
        attempt: &Attempt,
        failed_hosts: Vec<String>,
        err: BootstrapError,
        options: &RunOptions,
    ) -> BootstrapError {
        tracing::error!("[Orchestrator] {}", err);
        let run = attempt.finish(self.run_id, Outcome::Failed, failed_hosts, Some(err.to_string()));
        match self.record(run, options) {
            Ok(()) => err,
            Err(record_err) => record_err,
        }
    }

    /// Probe every target concurrently. Returns the names that did not answer,
    /// in target order.
    async fn probe_hosts(&self, hosts: &[HostTarget]) -> Vec<String> {
        let timeout = self.settings.probe_timeout;
        let results: Vec<(String, Result<(), String>)> = futures::stream::iter(hosts.iter().cloned())
            .map(|host| {
                let probe = Arc::clone(&self.probe);
                async move {
                    let result = match tokio::time::timeout(timeout, probe.probe(&host)).await {
                        Ok(result) => result,
                        Err(_) => Err(format!("no answer within {:?}", timeout)),
                    };
                    (host.name, result)
                }
            })
            .buffer_unordered(self.settings.forks.max(1))
            .collect()
            .await;

        let mut down = Vec::new();
        for host in hosts {
            if let Some((name, Err(reason))) = results.iter().find(|(n, _)| n == &host.name) {
                tracing::warn!("[Orchestrator] {} unreachable: {}", name, reason);
                down.push(name.clone());
            }
        }
        down
    }

    fn base_vars(&self) -> BTreeMap<String, String> {
        let endpoint = self.topology.control_plane_endpoint();
        let mut vars = BTreeMap::new();
        vars.insert("cluster_name".to_string(), self.cluster.name.clone());
        vars.insert(
            "kubernetes_version".to_string(),
            self.cluster.kubernetes_version.clone(),
        );
        vars.insert("pod_cidr".to_string(), self.cluster.pod_cidr.clone());
        vars.insert("service_cidr".to_string(), self.cluster.service_cidr.clone());
        vars.insert("cni".to_string(), self.cluster.cni.to_string());
        vars.insert("control_plane_endpoint".to_string(), endpoint.to_string());
        vars.insert("control_plane_endpoint_host".to_string(), endpoint.host);
        vars.insert("api_port".to_string(), endpoint.port.to_string());
        if let Some(primary) = self.topology.primary_control_plane() {
            vars.insert("primary_control_plane".to_string(), primary.address.clone());
        }
        let control_planes: Vec<&str> = self
            .topology
            .hosts_for_role(Role::ControlPlane)
            .into_iter()
            .map(|n| n.address.as_str())
            .collect();
        vars.insert("control_plane_addresses".to_string(), control_planes.join(","));
        if let Some(storage) = self.storage {
            if let Some(server) = self.topology.node(&storage.server) {
                vars.insert("nfs_server".to_string(), server.address.clone());
                vars.insert("nfs_server_name".to_string(), server.name.clone());
            }
            vars.insert("nfs_export_path".to_string(), storage.export_path.clone());
        }
        vars
    }

    fn build_request(
        &self,
        phase: &Phase,
        hosts: Vec<HostTarget>,
        secrets: BTreeMap<String, crate::secrets::SecretValue>,
        options: &RunOptions,
    ) -> ExecutionRequest {
        let mut vars = self.base_vars();
        vars.insert("phase".to_string(), phase.id.to_string());
        if let Some(node) = phase.id.node() {
            vars.insert("join_node".to_string(), node.to_string());
            if let Some(hash) = self.secrets.ca_cert_hash() {
                vars.insert("ca_cert_hash".to_string(), hash.to_string());
            }
        }

        ExecutionRequest {
            label: phase.id.to_string(),
            action: phase.action,
            inventory: self.inventory.clone(),
            hosts,
            tags: options.tags.clone(),
            vars,
            secrets,
            mode: match options.mode {
                RunMode::Check => ExecutionMode::Check,
                _ => ExecutionMode::Apply,
            },
            verbosity: options.verbosity,
            forks: self.settings.forks,
        }
    }

    /// Append to the ledger. Verification runs only log.
    fn record(&mut self, run: PhaseRun, options: &RunOptions) -> Result<(), BootstrapError> {
        if options.mode != RunMode::Apply {
            tracing::info!("[Orchestrator] Verified {}: {}", run.phase, run.outcome);
            return Ok(());
        }

        self.store.append_run(&run)?;
        self.ledger.push(run);
        Ok(())
    }

    fn harvest_credentials(&mut self, report: &ExecutionReport) -> Result<(), BootstrapError> {
        let endpoint = self.topology.control_plane_endpoint().to_string();
        let outputs = self
            .topology
            .primary_control_plane()
            .and_then(|primary| report.host(&primary.name))
            .map(|r| r.outputs.clone())
            .unwrap_or_default();
        let needs_certificate_key = self.topology.control_plane_count() > 1;

        let issued = self
            .secrets
            .harvest(&outputs, &endpoint, needs_certificate_key)
            .map_err(|e| BootstrapError::from_secret(&PhaseId::PrimaryInit, e))?;
        tracing::info!(
            "[Orchestrator] Initialization issued: {}",
            issued
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if let Some(bundle) = self.secrets.admin() {
            let path = self.store.save_admin_bundle(bundle)?;
            tracing::warn!(
                "[Orchestrator] Admin kubeconfig stored unencrypted at {:?}",
                path
            );
        }
        Ok(())
    }

    fn record_join(&self, phase: &Phase) -> Result<(), BootstrapError> {
        let Some(node) = phase.id.node().and_then(|n| self.topology.node(n)) else {
            return Ok(());
        };
        let entry = TranscriptEntry {
            at: Utc::now().to_rfc3339(),
            node: node.name.clone(),
            address: node.address.clone(),
            control_plane: matches!(phase.id, PhaseId::ControlPlaneJoin(_)),
            ca_cert_hash: self
                .secrets
                .ca_cert_hash()
                .unwrap_or("<unknown>")
                .to_string(),
        };
        let endpoint = self.topology.control_plane_endpoint().to_string();
        self.store
            .record_join(&self.cluster.name, &endpoint, entry)?;
        Ok(())
    }

    /// What [`Orchestrator::reset`] would destroy.
    pub fn describe_reset(&self) -> ResetPlan {
        ResetPlan {
            endpoint: self.topology.control_plane_endpoint().to_string(),
            nodes: self.topology.nodes().iter().map(HostTarget::from).collect(),
            ledger: self.store.ledger_path(),
            artifacts: self.store.artifacts(),
        }
    }

    /// Tear the cluster down and clear the ledger.
    ///
    /// `confirmation` must equal the control-plane endpoint. Nothing is
    /// contacted without it.
    pub async fn reset(
        &mut self,
        confirmation: Option<&str>,
        options: &RunOptions,
    ) -> Result<ResetPlan, BootstrapError> {
        let plan = self.describe_reset();
        if confirmation != Some(plan.endpoint.as_str()) {
            return Err(BootstrapError::ResetNotConfirmed {
                expected: plan.endpoint,
            });
        }

        let _lock = self.store.lock()?;
        tracing::warn!("[Orchestrator] Resetting cluster at {}", plan.endpoint);
        self.progress.emit_phase(0, plan.to_string(), "reset");

        let unreachable = self.probe_hosts(&plan.nodes).await;
        if !unreachable.is_empty() {
            return Err(BootstrapError::ResetFailed { hosts: unreachable });
        }

        let inventory = self.store.save_inventory(self.topology, self.cluster)?;
        let mut vars = self.base_vars();
        vars.insert("phase".to_string(), "reset".to_string());
        let request = ExecutionRequest {
            label: "reset".to_string(),
            action: Action::Reset,
            inventory,
            hosts: plan.nodes.clone(),
            tags: options.tags.clone(),
            vars,
            secrets: BTreeMap::new(),
            mode: ExecutionMode::Apply,
            verbosity: options.verbosity,
            forks: self.settings.forks,
        };

        let result =
            tokio::time::timeout(self.settings.executor_timeout, self.executor.execute(&request))
                .await;
        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(source)) => {
                return Err(BootstrapError::Executor {
                    phase: "reset".to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(BootstrapError::Executor {
                    phase: "reset".to_string(),
                    source: ExecutorError::Timeout(self.settings.executor_timeout),
                })
            }
        };

        let failed: Vec<String> = request
            .hosts
            .iter()
            .filter(|h| !report.host(&h.name).is_some_and(|r| r.status.is_ok()))
            .map(|h| h.name.clone())
            .collect();
        if !failed.is_empty() {
            return Err(BootstrapError::ResetFailed { hosts: failed });
        }

        self.store.archive_ledger("reset")?;
        self.store.remove_artifacts()?;
        self.ledger = Ledger::new();
        tracing::info!("[Orchestrator] Reset complete; ledger cleared");
        Ok(plan)
    }
}
