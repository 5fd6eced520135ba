//! kubeboot CLI: declare a topology, then bring the cluster up phase by phase.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use cluster::orchestrator::{CancelFlag, PhaseSelection, RunMode, RunOptions};
use cluster::plan::{PhaseGroup, PhaseId};
use kubeboot::commands::{self, CommandError, Workspace};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Bootstrap a kubeadm cluster over SSH with ansible playbooks.
#[derive(Parser)]
#[command(name = "kubeboot", version)]
#[command(about = "Phase-ordered kubeadm cluster bootstrap")]
struct Cli {
    /// Configuration file (default: ./kubeboot.toml, then ~/.kubeboot/kubeboot.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity; repeated flags are passed on to ansible-playbook.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Verify only (ansible --check --diff); the ledger is not written.
    #[arg(long, conflicts_with = "dry_run")]
    check: bool,

    /// Print the resolved phases and hosts without contacting anything.
    #[arg(long)]
    dry_run: bool,

    /// Run only tasks carrying these tags (comma-separated).
    #[arg(short, long, value_delimiter = ',')]
    tags: Vec<String>,

    /// Re-run phases that already succeeded (safe-to-repeat phases only).
    #[arg(long)]
    force: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the declared nodes and write the topology and inventory.
    Declare,

    /// Show the phase plan with target hosts.
    Plan,

    /// Show the latest outcome of every planned phase.
    Status,

    /// Run every phase, resuming after the last success.
    Up(RunArgs),

    /// Host network prerequisites on every node.
    Network(RunArgs),

    /// Container runtime on control-plane and worker nodes.
    Runtime(RunArgs),

    /// kubeadm, kubelet and kubectl on control-plane and worker nodes.
    Tooling(RunArgs),

    /// Load balancer in front of the control plane.
    LoadBalancer(RunArgs),

    /// Control-plane initialization and node joins.
    Cluster(RunArgs),

    /// Overlay network plugin.
    Overlay(RunArgs),

    /// Shared NFS storage.
    Storage(RunArgs),

    /// Run a single phase by id (e.g. worker-join/worker01).
    Phase {
        id: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Tear the cluster down on every node and clear the ledger.
    Reset {
        /// Control-plane endpoint of the cluster being destroyed.
        #[arg(long)]
        confirm_destroy: Option<String>,
    },
}

impl RunArgs {
    fn options(&self, selection: PhaseSelection, verbosity: u8) -> RunOptions {
        let mode = if self.dry_run {
            RunMode::DryRun
        } else if self.check {
            RunMode::Check
        } else {
            RunMode::Apply
        };
        RunOptions {
            selection,
            mode,
            tags: self.tags.clone(),
            verbosity,
            force: self.force,
        }
    }
}

fn init_tracing(verbose: u8) {
    // RUST_LOG wins over -v
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Set the cancel flag on Ctrl-C. The in-flight phase is allowed to finish.
fn watch_interrupt(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping after the current phase");
            cancel.cancel();
        }
    });
}

async fn dispatch(cli: Cli) -> Result<String, CommandError> {
    let workspace = Workspace::load(cli.config.as_deref())?;
    tracing::debug!("Using config {}", workspace.config_path.display());

    let cancel = CancelFlag::new();
    let verbosity = cli.verbose;

    let (run, selection) = match cli.command {
        Commands::Declare => return commands::declare(&workspace),
        Commands::Plan => return commands::plan(&workspace).await,
        Commands::Status => return commands::status(&workspace),
        Commands::Reset { confirm_destroy } => {
            watch_interrupt(cancel.clone());
            return commands::reset(
                &workspace,
                confirm_destroy.as_deref(),
                &RunOptions {
                    verbosity,
                    ..RunOptions::default()
                },
                cancel,
                &mut std::io::stderr(),
            )
            .await;
        }
        Commands::Up(run) => (run, PhaseSelection::All),
        Commands::Network(run) => (run, PhaseSelection::Group(PhaseGroup::Network)),
        Commands::Runtime(run) => (run, PhaseSelection::Group(PhaseGroup::Runtime)),
        Commands::Tooling(run) => (run, PhaseSelection::Group(PhaseGroup::Tooling)),
        Commands::LoadBalancer(run) => (run, PhaseSelection::Group(PhaseGroup::LoadBalancer)),
        Commands::Cluster(run) => (run, PhaseSelection::Group(PhaseGroup::Cluster)),
        Commands::Overlay(run) => (run, PhaseSelection::Group(PhaseGroup::Overlay)),
        Commands::Storage(run) => (run, PhaseSelection::Group(PhaseGroup::Storage)),
        Commands::Phase { id, run } => {
            let id = id
                .parse::<PhaseId>()
                .map_err(|_| cluster::BootstrapError::UnknownPhase(id.clone()))?;
            (run, PhaseSelection::Only(id))
        }
    };

    watch_interrupt(cancel.clone());
    commands::run(&workspace, &run.options(selection, verbosity), cancel).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let code = match rt.block_on(dispatch(cli)) {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    drop(rt);
    std::process::exit(code);
}
