//! Orchestrator runs against a scripted executor and probe.
//!
//! The executor records every request and fails the hosts it is told to fail.
//! Initialization reports the outputs a real kubeadm init would.

use async_trait::async_trait;
use cluster::orchestrator::{CancelFlag, Orchestrator, PhaseSelection, RunMode, RunOptions};
use cluster::progress::{ChannelProgressReporter, ProgressReporter};
use cluster::plan::{Action, PhaseGroup, PhaseId, Plan, PlanBuilder};
use cluster::secrets::{
    AdminCredentialBundle, SecretError, SecretManager, OUTPUT_ADMIN_KUBECONFIG, OUTPUT_CA_CERT_HASH, OUTPUT_CERTIFICATE_KEY,
    OUTPUT_JOIN_TOKEN,
};
use cluster::settings::{ClusterSpec, CredentialPolicy, StorageSpec};
use cluster::state::StateStore;
use cluster::topology::{NodeDecl, Role, Topology};
use cluster::{
    BootstrapError, ExecutionMode, ExecutionReport, ExecutionRequest, ExecutorError, HostProbe,
    HostReport, HostTarget, Outcome, PhaseExecutor,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct ScriptedExecutor {
    calls: Mutex<Vec<ExecutionRequest>>,
    failures: Mutex<HashMap<String, Vec<String>>>,
    cancel_after: Mutex<Option<(String, CancelFlag)>>,
    /// Initialization outputs left out of the report
    omitted: Mutex<Vec<&'static str>>,
    journal: Journal,
}

/// Progress reporter writing into the executor's journal.
struct JournalReporter(Journal);

impl ProgressReporter for JournalReporter {
    fn emit(&self, _percentage: u32, message: String) {
        self.0.lock().unwrap().push(format!("progress: {}", message));
    }
}

impl ScriptedExecutor {
    fn fail(&self, label: &str, hosts: &[&str]) {
        self.failures.lock().unwrap().insert(
            label.to_string(),
            hosts.iter().map(|h| h.to_string()).collect(),
        );
    }

    fn omit(&self, output: &'static str) {
        self.omitted.lock().unwrap().push(output);
    }

    fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    fn cancel_after(&self, label: &str, flag: CancelFlag) {
        *self.cancel_after.lock().unwrap() = Some((label.to_string(), flag));
    }

    fn labels(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.label.clone())
            .collect()
    }

    fn request(&self, label: &str) -> Option<ExecutionRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.label == label)
            .cloned()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl PhaseExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        self.calls.lock().unwrap().push(request.clone());
        self.journal
            .lock()
            .unwrap()
            .push(format!("execute: {}", request.label));
        let omitted = self.omitted.lock().unwrap().clone();
        let failing = self
            .failures
            .lock()
            .unwrap()
            .get(&request.label)
            .cloned()
            .unwrap_or_default();

        let hosts = request
            .hosts
            .iter()
            .map(|host| {
                if failing.contains(&host.name) {
                    HostReport::failed(&host.name, "task failed")
                } else if request.action == Action::InitControlPlane {
                    let mut report = HostReport::ok(&host.name);
                    for (key, value) in [
                        (OUTPUT_JOIN_TOKEN, "abcdef.0123456789abcdef".to_string()),
                        (OUTPUT_CERTIFICATE_KEY, "f00d".repeat(16)),
                        (OUTPUT_CA_CERT_HASH, "sha256:1234".to_string()),
                        (OUTPUT_ADMIN_KUBECONFIG, "apiVersion: v1\nkind: Config\n".to_string()),
                    ] {
                        if !omitted.contains(&key) {
                            report = report.with_output(key, value);
                        }
                    }
                    report
                } else {
                    HostReport::ok(&host.name)
                }
            })
            .collect();

        if let Some((label, flag)) = self.cancel_after.lock().unwrap().as_ref() {
            if label == &request.label {
                flag.cancel();
            }
        }

        Ok(ExecutionReport { hosts })
    }
}

#[derive(Default)]
struct Reachability {
    down: Mutex<HashSet<String>>,
}

#[async_trait]
impl HostProbe for Reachability {
    async fn probe(&self, host: &HostTarget) -> Result<(), String> {
        if self.down.lock().unwrap().contains(&host.name) {
            Err("connection refused".to_string())
        } else {
            Ok(())
        }
    }
}

struct Fixture {
    _dir: TempDir,
    topology: Topology,
    cluster: ClusterSpec,
    storage: Option<StorageSpec>,
    plan: Plan,
    store: StateStore,
    executor: Arc<ScriptedExecutor>,
    probe: Arc<Reachability>,
}

impl Fixture {
    fn new(decls: &[NodeDecl], storage: Option<StorageSpec>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let topology = Topology::declare(decls, 6443).unwrap();
        let cluster = ClusterSpec {
            name: "demo".to_string(),
            ..ClusterSpec::default()
        };
        let plan = PlanBuilder::new(&topology, &cluster)
            .with_storage(storage.as_ref())
            .build()
            .unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        Self {
            _dir: dir,
            topology,
            cluster,
            storage,
            plan,
            store,
            executor: Arc::new(ScriptedExecutor::default()),
            probe: Arc::new(Reachability::default()),
        }
    }

    /// Two control planes, two workers and a load balancer.
    fn ha() -> Self {
        Self::new(
            &[
                NodeDecl::new("10.0.0.10", "ubuntu", Role::ControlPlane),
                NodeDecl::new("10.0.0.11", "ubuntu", Role::ControlPlane),
                NodeDecl::new("10.0.0.20", "ubuntu", Role::Worker),
                NodeDecl::new("10.0.0.21", "ubuntu", Role::Worker),
                NodeDecl::new("10.0.0.5", "ubuntu", Role::LoadBalancer),
            ],
            None,
        )
    }

    fn single_with_storage() -> Self {
        Self::new(
            &[
                NodeDecl::new("10.0.0.10", "ubuntu", Role::ControlPlane),
                NodeDecl::new("10.0.0.20", "ubuntu", Role::Worker),
            ],
            Some(StorageSpec {
                server: "worker01".to_string(),
                export_path: "/srv/nfs/kubedata".to_string(),
            }),
        )
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            &self.topology,
            &self.cluster,
            &self.plan,
            &self.store,
            self.executor.clone(),
            self.probe.clone(),
        )
        .with_storage(self.storage.as_ref())
    }
}

fn apply() -> RunOptions {
    RunOptions::default()
}

#[tokio::test]
async fn test_full_run_executes_every_phase_in_order() {
    let fixture = Fixture::ha();
    let mut orchestrator = fixture.orchestrator();

    let summary = orchestrator.run(&apply()).await.unwrap();

    assert_eq!(
        fixture.executor.labels(),
        vec![
            "network",
            "container-runtime",
            "cluster-tooling",
            "load-balancer",
            "primary-init",
            "control-plane-join/controlplane02",
            "worker-join/worker01",
            "worker-join/worker02",
            "overlay-network",
        ]
    );
    assert_eq!(summary.executed.len(), 9);
    assert!(summary.complete);
    let bundle = summary.admin_bundle.expect("admin bundle written");
    assert_eq!(
        std::fs::read_to_string(bundle).unwrap(),
        "apiVersion: v1\nkind: Config"
    );

    let ledger = fixture.store.load_ledger().unwrap();
    assert!(ledger.is_complete(&fixture.plan));
    assert_eq!(fixture.store.load_transcript().unwrap().len(), 3);
}

#[tokio::test]
async fn test_progress_reports_each_phase() {
    let fixture = Fixture::ha();
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let reporter = ChannelProgressReporter::with_cluster_name(tx, "demo".to_string());

    fixture
        .orchestrator()
        .with_progress(Arc::new(reporter))
        .run(&apply())
        .await
        .unwrap();

    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    assert_eq!(updates.len(), 18);
    assert_eq!(updates[0].phase.as_deref(), Some("network"));
    assert_eq!(updates[0].cluster_name.as_deref(), Some("demo"));
    assert_eq!(updates[0].percentage, 0);
    let last = updates.last().unwrap();
    assert_eq!(last.percentage, 100);
    assert_eq!(last.message, "Completed overlay-network");
}

#[tokio::test]
async fn test_hosts_resolved_per_phase() {
    let fixture = Fixture::ha();
    fixture.orchestrator().run(&apply()).await.unwrap();

    let network = fixture.executor.request("network").unwrap();
    assert_eq!(
        network.host_names(),
        vec![
            "controlplane01",
            "controlplane02",
            "worker01",
            "worker02",
            "loadbalancer01"
        ]
    );
    let init = fixture.executor.request("primary-init").unwrap();
    assert_eq!(init.host_names(), vec!["controlplane01"]);
    assert_eq!(
        init.vars.get("control_plane_endpoint").map(String::as_str),
        Some("10.0.0.5:6443")
    );
    let lb = fixture.executor.request("load-balancer").unwrap();
    assert_eq!(lb.host_names(), vec!["loadbalancer01"]);
}

#[tokio::test]
async fn test_join_phases_receive_credentials() {
    let fixture = Fixture::ha();
    fixture.orchestrator().run(&apply()).await.unwrap();

    let init = fixture.executor.request("primary-init").unwrap();
    assert!(init.secrets.is_empty());

    let worker = fixture.executor.request("worker-join/worker01").unwrap();
    assert_eq!(
        worker.secrets.get("join_token").map(|s| s.expose()),
        Some("abcdef.0123456789abcdef")
    );
    assert!(!worker.secrets.contains_key("certificate_key"));
    assert_eq!(
        worker.vars.get("ca_cert_hash").map(String::as_str),
        Some("sha256:1234")
    );

    let control_plane = fixture
        .executor
        .request("control-plane-join/controlplane02")
        .unwrap();
    assert!(control_plane.secrets.contains_key("join_token"));
    assert!(control_plane.secrets.contains_key("certificate_key"));
}

#[tokio::test]
async fn test_failed_phase_halts_plan() {
    let fixture = Fixture::ha();
    fixture.executor.fail("container-runtime", &["worker02"]);

    let err = fixture.orchestrator().run(&apply()).await.unwrap_err();

    match err {
        BootstrapError::PhaseActionFailed { phase, hosts } => {
            assert_eq!(phase, PhaseId::ContainerRuntime);
            assert_eq!(hosts, vec!["worker02"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        fixture.executor.labels(),
        vec!["network", "container-runtime"]
    );

    let ledger = fixture.store.load_ledger().unwrap();
    let last = ledger.last_attempt(&PhaseId::ContainerRuntime).unwrap();
    assert_eq!(last.outcome, Outcome::Failed);
    assert_eq!(last.failed_hosts, vec!["worker02"]);
}

#[tokio::test]
async fn test_resume_skips_succeeded_phases() {
    let fixture = Fixture::ha();
    fixture.executor.fail("cluster-tooling", &["worker01"]);
    assert!(fixture.orchestrator().run(&apply()).await.is_err());

    fixture.executor.heal();
    fixture.executor.clear();

    let summary = fixture.orchestrator().run(&apply()).await.unwrap();

    assert_eq!(
        summary.skipped,
        vec![PhaseId::Network, PhaseId::ContainerRuntime]
    );
    assert_eq!(fixture.executor.labels()[0], "cluster-tooling");
    assert!(summary.complete);
}

#[tokio::test]
async fn test_join_retry_in_same_process_reuses_credentials() {
    let fixture = Fixture::ha();
    fixture.executor.fail("worker-join/worker02", &["worker02"]);

    let mut orchestrator = fixture.orchestrator();
    assert!(orchestrator.run(&apply()).await.is_err());

    fixture.executor.heal();
    fixture.executor.clear();
    let summary = orchestrator.run(&apply()).await.unwrap();

    assert_eq!(
        fixture.executor.labels(),
        vec!["worker-join/worker02", "overlay-network"]
    );
    assert!(summary.complete);
}

#[tokio::test]
async fn test_new_process_cannot_join_without_credentials() {
    let fixture = Fixture::ha();
    fixture
        .executor
        .fail("control-plane-join/controlplane02", &["controlplane02"]);
    assert!(fixture.orchestrator().run(&apply()).await.is_err());

    fixture.executor.heal();
    fixture.executor.clear();
    let err = fixture.orchestrator().run(&apply()).await.unwrap_err();

    assert!(matches!(err, BootstrapError::CredentialNotIssued { .. }));
    assert!(!err.is_retryable());
    assert!(fixture.executor.labels().is_empty());
}

#[tokio::test]
async fn test_expired_credential_halts_join() {
    let fixture = Fixture::ha();
    let policy = CredentialPolicy {
        join_token_ttl_secs: 0,
        certificate_key_ttl_secs: 0,
    };
    let mut orchestrator = fixture
        .orchestrator()
        .with_secrets(SecretManager::new(policy));

    let err = orchestrator.run(&apply()).await.unwrap_err();

    match err {
        BootstrapError::CredentialExpired { phase, .. } => {
            assert_eq!(phase, PhaseId::ControlPlaneJoin("controlplane02".to_string()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture
        .executor
        .request("control-plane-join/controlplane02")
        .is_none());
    let ledger = fixture.store.load_ledger().unwrap();
    assert!(!ledger.has_succeeded(&PhaseId::ControlPlaneJoin("controlplane02".to_string())));
}

#[tokio::test]
async fn test_precondition_not_met_makes_no_executor_call() {
    let fixture = Fixture::ha();
    let options = RunOptions {
        selection: PhaseSelection::Only(PhaseId::PrimaryInit),
        ..RunOptions::default()
    };

    let err = fixture.orchestrator().run(&options).await.unwrap_err();

    match err {
        BootstrapError::PreconditionNotMet { phase, missing } => {
            assert_eq!(phase, PhaseId::PrimaryInit);
            assert_eq!(missing, PhaseId::ClusterTooling);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.executor.labels().is_empty());
}

#[tokio::test]
async fn test_unreachable_host_halts_before_action() {
    let fixture = Fixture::ha();
    fixture
        .probe
        .down
        .lock()
        .unwrap()
        .insert("worker01".to_string());

    let err = fixture.orchestrator().run(&apply()).await.unwrap_err();

    match &err {
        BootstrapError::HostUnreachable { phase, hosts } => {
            assert_eq!(phase, &PhaseId::Network);
            assert_eq!(hosts, &vec!["worker01".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());
    assert!(fixture.executor.labels().is_empty());
}

#[tokio::test]
async fn test_storage_tolerates_partial_failure() {
    let fixture = Fixture::single_with_storage();
    fixture.executor.fail("shared-storage", &["controlplane01"]);

    let summary = fixture.orchestrator().run(&apply()).await.unwrap();

    assert!(summary.complete);
    let ledger = fixture.store.load_ledger().unwrap();
    let storage = ledger.last_attempt(&PhaseId::SharedStorage).unwrap();
    assert_eq!(storage.outcome, Outcome::Succeeded);
    assert_eq!(storage.failed_hosts, vec!["controlplane01"]);

    let request = fixture.executor.request("shared-storage").unwrap();
    assert_eq!(
        request.vars.get("nfs_server").map(String::as_str),
        Some("10.0.0.20")
    );
}

#[tokio::test]
async fn test_storage_fails_when_every_host_fails() {
    let fixture = Fixture::single_with_storage();
    fixture
        .executor
        .fail("shared-storage", &["controlplane01", "worker01"]);

    let err = fixture.orchestrator().run(&apply()).await.unwrap_err();
    assert!(matches!(err, BootstrapError::PhaseActionFailed { .. }));
}

#[tokio::test]
async fn test_cancel_stops_before_next_phase() {
    let fixture = Fixture::ha();
    let cancel = CancelFlag::new();
    fixture
        .executor
        .cancel_after("container-runtime", cancel.clone());

    let err = fixture
        .orchestrator()
        .with_cancel(cancel)
        .run(&apply())
        .await
        .unwrap_err();

    match err {
        BootstrapError::Cancelled { next } => assert_eq!(next, PhaseId::ClusterTooling),
        other => panic!("unexpected error: {other}"),
    }
    let ledger = fixture.store.load_ledger().unwrap();
    assert!(ledger.has_succeeded(&PhaseId::ContainerRuntime));
    assert!(ledger.last_attempt(&PhaseId::ClusterTooling).is_none());
}

#[tokio::test]
async fn test_force_reruns_safe_phase_only() {
    let fixture = Fixture::ha();
    fixture.orchestrator().run(&apply()).await.unwrap();
    fixture.executor.clear();

    let network = RunOptions {
        selection: PhaseSelection::Group(PhaseGroup::Network),
        force: true,
        ..RunOptions::default()
    };
    let summary = fixture.orchestrator().run(&network).await.unwrap();
    assert_eq!(summary.executed, vec![PhaseId::Network]);
    assert_eq!(fixture.executor.labels(), vec!["network"]);

    let init = RunOptions {
        selection: PhaseSelection::Only(PhaseId::PrimaryInit),
        force: true,
        ..RunOptions::default()
    };
    let err = fixture.orchestrator().run(&init).await.unwrap_err();
    assert!(matches!(err, BootstrapError::DestructiveRerun { .. }));
}

#[tokio::test]
async fn test_group_not_in_plan_is_rejected() {
    let fixture = Fixture::single_with_storage();
    let options = RunOptions {
        selection: PhaseSelection::Group(PhaseGroup::LoadBalancer),
        ..RunOptions::default()
    };
    let err = fixture.orchestrator().run(&options).await.unwrap_err();
    assert!(matches!(err, BootstrapError::UnknownPhase(_)));
}

#[tokio::test]
async fn test_check_mode_writes_no_ledger() {
    let fixture = Fixture::ha();
    let options = RunOptions {
        mode: RunMode::Check,
        ..RunOptions::default()
    };

    let summary = fixture.orchestrator().run(&options).await.unwrap();

    assert_eq!(summary.executed.len(), 9);
    assert!(!summary.complete);
    assert!(fixture.store.load_ledger().unwrap().is_empty());
    let calls = fixture.executor.calls.lock().unwrap();
    assert!(calls.iter().all(|r| r.mode == ExecutionMode::Check));
    assert!(calls.iter().all(|r| r.secrets.is_empty()));
}

#[tokio::test]
async fn test_dry_run_contacts_nothing() {
    let fixture = Fixture::ha();
    let options = RunOptions {
        mode: RunMode::DryRun,
        ..RunOptions::default()
    };

    let summary = fixture.orchestrator().run(&options).await.unwrap();

    assert_eq!(summary.planned.len(), 9);
    assert!(summary.planned.iter().all(|s| !s.already_succeeded));
    assert_eq!(summary.planned[4].hosts, vec!["controlplane01"]);
    assert!(fixture.executor.labels().is_empty());
    assert!(!fixture.store.ledger_path().exists());
}

#[tokio::test]
async fn test_reset_requires_exact_confirmation() {
    let fixture = Fixture::ha();
    let err = fixture
        .orchestrator()
        .reset(Some("10.0.0.6:6443"), &apply())
        .await
        .unwrap_err();

    match err {
        BootstrapError::ResetNotConfirmed { expected } => assert_eq!(expected, "10.0.0.5:6443"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(fixture.executor.labels().is_empty());
}

#[tokio::test]
async fn test_reset_clears_ledger_and_artifacts() {
    let fixture = Fixture::ha();
    fixture.orchestrator().run(&apply()).await.unwrap();
    fixture.executor.clear();

    let mut orchestrator = fixture.orchestrator();
    let described = orchestrator.describe_reset();
    assert_eq!(described.nodes.len(), 5);
    assert!(!described.artifacts.is_empty());
    assert!(described.to_string().contains("controlplane01"));

    orchestrator
        .reset(Some("10.0.0.5:6443"), &apply())
        .await
        .unwrap();

    assert_eq!(fixture.executor.labels(), vec!["reset"]);
    assert_eq!(
        fixture.executor.request("reset").unwrap().action,
        Action::Reset
    );
    assert!(fixture.store.load_ledger().unwrap().is_empty());
    assert!(fixture.store.artifacts().is_empty());
}

#[tokio::test]
async fn test_reset_announces_targets_before_executing() {
    let fixture = Fixture::ha();
    let journal = fixture.executor.journal.clone();

    fixture
        .orchestrator()
        .with_progress(Arc::new(JournalReporter(journal.clone())))
        .reset(Some("10.0.0.5:6443"), &apply())
        .await
        .unwrap();

    let entries = journal.lock().unwrap().clone();
    let announced = entries
        .iter()
        .position(|e| e.starts_with("progress: Reset of cluster at 10.0.0.5:6443 will destroy"))
        .expect("reset plan announced");
    let executed = entries
        .iter()
        .position(|e| e == "execute: reset")
        .expect("reset executed");
    assert!(announced < executed);
    assert!(entries[announced].contains("worker02 (10.0.0.21)"));
}

fn previous_cluster(fixture: &Fixture) {
    let old = Topology::declare(
        &[NodeDecl::new("10.0.0.99", "ubuntu", Role::ControlPlane)],
        6443,
    )
    .unwrap();
    fixture.store.save_topology(&old).unwrap();
    fixture
        .store
        .save_admin_bundle(&AdminCredentialBundle {
            kubeconfig: cluster::SecretValue::new("OLD-CLUSTER-KUBECONFIG"),
            endpoint: "10.0.0.99:6443".to_string(),
            issued_at: chrono::Utc::now(),
        })
        .unwrap();
    fixture
        .store
        .record_join(
            "old",
            "10.0.0.99:6443",
            cluster::templates::TranscriptEntry {
                at: chrono::Utc::now().to_rfc3339(),
                node: "worker07".to_string(),
                address: "10.0.0.98".to_string(),
                control_plane: false,
                ca_cert_hash: "sha256:old".to_string(),
            },
        )
        .unwrap();
}

#[tokio::test]
async fn test_endpoint_change_does_not_reuse_previous_artifacts() {
    let fixture = Fixture::ha();
    previous_cluster(&fixture);
    fixture.executor.omit(OUTPUT_ADMIN_KUBECONFIG);

    let summary = fixture.orchestrator().run(&apply()).await.unwrap();

    assert!(summary.complete);
    assert!(summary.admin_bundle.is_none());
    let archived = summary.archived_artifacts.expect("artifacts archived");
    assert_eq!(
        std::fs::read_to_string(archived.join("admin.conf")).unwrap(),
        "OLD-CLUSTER-KUBECONFIG"
    );
    assert!(!fixture.store.admin_bundle_path().exists());

    let transcript = fixture.store.load_transcript().unwrap();
    assert_eq!(transcript.len(), 3);
    assert!(transcript.iter().all(|e| e.node != "worker07"));
}

#[tokio::test]
async fn test_admin_bundle_from_other_endpoint_is_not_restored() {
    let fixture = Fixture::ha();
    fixture
        .store
        .save_admin_bundle(&AdminCredentialBundle {
            kubeconfig: cluster::SecretValue::new("OLD-CLUSTER-KUBECONFIG"),
            endpoint: "10.0.0.99:6443".to_string(),
            issued_at: chrono::Utc::now(),
        })
        .unwrap();
    fixture.executor.omit(OUTPUT_ADMIN_KUBECONFIG);

    let summary = fixture.orchestrator().run(&apply()).await.unwrap();

    assert!(summary.complete);
    assert!(summary.admin_bundle.is_none());
}

#[tokio::test]
async fn test_init_without_join_token_is_recorded_failed() {
    let fixture = Fixture::ha();
    fixture.executor.omit(OUTPUT_JOIN_TOKEN);

    let err = fixture.orchestrator().run(&apply()).await.unwrap_err();

    assert!(matches!(
        err,
        BootstrapError::Credential {
            source: SecretError::MissingOutput(OUTPUT_JOIN_TOKEN),
            ..
        }
    ));
    let ledger = fixture.store.load_ledger().unwrap();
    let init = ledger.last_attempt(&PhaseId::PrimaryInit).unwrap();
    assert_eq!(init.outcome, Outcome::Failed);
    assert!(init.error.as_deref().unwrap().contains(OUTPUT_JOIN_TOKEN));
    assert_eq!(
        ledger.resume_point(&fixture.plan),
        Some(&PhaseId::PrimaryInit)
    );
    assert!(fixture
        .executor
        .request("control-plane-join/controlplane02")
        .is_none());
}

#[tokio::test]
async fn test_check_mode_leaves_stored_state_alone() {
    let fixture = Fixture::ha();
    previous_cluster(&fixture);
    let topology_path = fixture.store.root().join("topology.json");
    let stored_before = std::fs::read_to_string(&topology_path).unwrap();
    fixture
        .store
        .append_run(&cluster::PhaseRun {
            run_id: uuid::Uuid::new_v4(),
            phase: PhaseId::Network,
            hosts: vec!["controlplane01".to_string()],
            failed_hosts: Vec::new(),
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            outcome: Outcome::Succeeded,
            error: None,
        })
        .unwrap();

    let options = RunOptions {
        mode: RunMode::Check,
        ..RunOptions::default()
    };
    let summary = fixture.orchestrator().run(&options).await.unwrap();

    assert!(summary.archived_ledger.is_none());
    assert!(summary.archived_artifacts.is_none());
    assert_eq!(std::fs::read_to_string(&topology_path).unwrap(), stored_before);
    assert_eq!(fixture.store.load_ledger().unwrap().runs().len(), 1);
    assert!(!fixture.store.inventory_path().exists());
    assert!(fixture.store.admin_bundle_path().exists());

    let network = fixture.executor.request("network").unwrap();
    assert_eq!(network.inventory, fixture.store.check_inventory_path());
    let inventory = std::fs::read_to_string(&network.inventory).unwrap();
    assert!(inventory.contains("control_plane_endpoint=10.0.0.5:6443"));
}
