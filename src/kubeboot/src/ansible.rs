//! `ansible-playbook` as the phase executor.
//!
//! One invocation per phase: the phase's playbook from the playbook directory,
//! the inventory named by the request, `--limit` set to the resolved hosts.
//! Variables and credentials go through an `-e @file` vars file inside a
//! private temp directory, never on the command line. Per-host results come
//! from the JSON stdout callback's `stats` block. Named outputs (join token,
//! CA hash, ...) are files the playbook writes under
//! `bootstrap_output_dir/<host>/<key>`.

use async_trait::async_trait;
use cluster::error::ExecutorError;
use cluster::executor::{
    ExecutionMode, ExecutionReport, ExecutionRequest, HostReport, HostStatus, PhaseExecutor,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use crate::config::ExecutorConfig;

/// Variable naming the directory playbooks write their outputs to.
pub const OUTPUT_DIR_VAR: &str = "bootstrap_output_dir";

const VARS_FILE: &str = "vars.json";
const OUTPUTS_DIR: &str = "outputs";
const MAX_VERBOSITY: u8 = 4;

/// Per-host counters of the JSON callback.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct HostStats {
    #[serde(default)]
    pub ok: u32,
    #[serde(default)]
    pub changed: u32,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub unreachable: u32,
    #[serde(default)]
    pub skipped: u32,
    #[serde(default)]
    pub rescued: u32,
    #[serde(default)]
    pub ignored: u32,
}

#[derive(Debug, Default, Deserialize)]
struct PlaybookOutput {
    #[serde(default)]
    plays: Vec<PlayOutput>,
    #[serde(default)]
    stats: BTreeMap<String, HostStats>,
}

#[derive(Debug, Default, Deserialize)]
struct PlayOutput {
    #[serde(default)]
    tasks: Vec<TaskOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskOutput {
    #[serde(default)]
    task: TaskName,
    #[serde(default)]
    hosts: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskName {
    #[serde(default)]
    name: String,
}

/// Parsed result of one playbook run.
#[derive(Debug, Default)]
pub struct PlaybookResult {
    pub stats: BTreeMap<String, HostStats>,
    /// First failed task per host, as `task: message`
    pub failures: BTreeMap<String, String>,
}

impl PlaybookResult {
    /// Map callback counters to a host status.
    pub fn status(&self, host: &str) -> Option<HostStatus> {
        let stats = self.stats.get(host)?;
        let reason = || {
            self.failures
                .get(host)
                .cloned()
                .unwrap_or_else(|| format!("{} task(s) failed", stats.failures))
        };
        Some(if stats.unreachable > 0 {
            HostStatus::Unreachable(reason())
        } else if stats.failures > 0 {
            HostStatus::Failed(reason())
        } else {
            HostStatus::Ok
        })
    }
}

/// Parse JSON callback stdout. Anything before the first `{` is ignored.
pub fn parse_playbook_output(stdout: &[u8]) -> Result<PlaybookResult, ExecutorError> {
    let start = stdout
        .iter()
        .position(|b| *b == b'{')
        .ok_or_else(|| ExecutorError::Output("no JSON document on stdout".to_string()))?;
    let output: PlaybookOutput = serde_json::from_slice(&stdout[start..])
        .map_err(|e| ExecutorError::Output(format!("invalid callback JSON: {}", e)))?;

    let mut failures = BTreeMap::new();
    for task in output.plays.iter().flat_map(|p| p.tasks.iter()) {
        for (host, result) in &task.hosts {
            let failed = result.get("failed").and_then(|v| v.as_bool()) == Some(true)
                || result.get("unreachable").and_then(|v| v.as_bool()) == Some(true);
            if !failed || failures.contains_key(host) {
                continue;
            }
            let msg = result
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("no message");
            failures.insert(host.clone(), format!("{}: {}", task.task.name, msg));
        }
    }

    Ok(PlaybookResult {
        stats: output.stats,
        failures,
    })
}

pub struct AnsibleExecutor {
    program: String,
    playbook_dir: PathBuf,
    private_key: Option<PathBuf>,
    ssh_port: u16,
}

impl AnsibleExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            program: config.program.clone(),
            playbook_dir: config.playbook_dir.clone(),
            private_key: config.private_key.clone(),
            ssh_port: config.ssh_port,
        }
    }

    pub fn playbook_path(&self, request: &ExecutionRequest) -> PathBuf {
        self.playbook_dir.join(request.action.playbook())
    }

    /// Command line for a request. Carries no secret values.
    pub fn command_args(&self, request: &ExecutionRequest, vars_file: &Path) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            request.inventory.display().to_string(),
            self.playbook_path(request).display().to_string(),
            "--limit".to_string(),
            request.host_names().join(","),
            "--forks".to_string(),
            request.forks.max(1).to_string(),
            "-e".to_string(),
            format!("@{}", vars_file.display()),
        ];
        if !request.tags.is_empty() {
            args.push("--tags".to_string());
            args.push(request.tags.join(","));
        }
        if let Some(key) = &self.private_key {
            args.push("--private-key".to_string());
            args.push(key.display().to_string());
        }
        if request.mode == ExecutionMode::Check {
            args.push("--check".to_string());
            args.push("--diff".to_string());
        }
        if request.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(request.verbosity.min(MAX_VERBOSITY) as usize)));
        }
        args
    }

    /// Vars file content: phase variables, credentials and the output directory.
    pub fn vars_document(&self, request: &ExecutionRequest, output_dir: &Path) -> serde_json::Value {
        let mut vars = serde_json::Map::new();
        for (key, value) in &request.vars {
            vars.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        for (key, value) in &request.secrets {
            vars.insert(key.clone(), serde_json::Value::String(value.expose().to_string()));
        }
        vars.insert(
            OUTPUT_DIR_VAR.to_string(),
            serde_json::Value::String(output_dir.display().to_string()),
        );
        vars.insert(
            "ansible_port".to_string(),
            serde_json::Value::from(self.ssh_port),
        );
        serde_json::Value::Object(vars)
    }

    fn write_vars_file(&self, path: &Path, document: &serde_json::Value) -> Result<(), ExecutorError> {
        let content = serde_json::to_vec(document)
            .map_err(|e| ExecutorError::Other(format!("Failed to encode vars: {}", e)))?;
        std::fs::write(path, content).map_err(ExecutorError::Spawn)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(ExecutorError::Spawn)?;
        }
        Ok(())
    }
}

/// Files under `dir`, keyed by file name, trimmed.
pub async fn read_outputs(dir: &Path) -> BTreeMap<String, String> {
    let mut outputs = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return outputs,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(key) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => {
                outputs.insert(key, value.trim().to_string());
            }
            Err(e) => {
                tracing::warn!("[AnsibleExecutor] Unreadable output {:?}: {}", path, e);
            }
        }
    }
    outputs
}

#[async_trait]
impl PhaseExecutor for AnsibleExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecutorError> {
        let start = Instant::now();
        let workdir = tempfile::Builder::new()
            .prefix("kubeboot-")
            .tempdir()
            .map_err(ExecutorError::Spawn)?;
        let output_dir = workdir.path().join(OUTPUTS_DIR);
        std::fs::create_dir_all(&output_dir).map_err(ExecutorError::Spawn)?;

        let vars_path = workdir.path().join(VARS_FILE);
        self.write_vars_file(&vars_path, &self.vars_document(request, &output_dir))?;

        let args = self.command_args(request, &vars_path);
        tracing::info!(
            "[AnsibleExecutor] {}: {} {}",
            request.label,
            self.program,
            args.join(" ")
        );

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "False")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ExecutorError::Spawn)?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!("[AnsibleExecutor] {}", line);
        }

        let result = match parse_playbook_output(&output.stdout) {
            Ok(result) => result,
            Err(e) if !output.status.success() => {
                tracing::debug!("[AnsibleExecutor] Callback output unusable: {}", e);
                let mut tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                tail.reverse();
                return Err(ExecutorError::Output(format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    tail.join(" | ")
                )));
            }
            Err(e) => return Err(e),
        };

        let mut hosts = Vec::with_capacity(request.hosts.len());
        for host in &request.hosts {
            let Some(status) = result.status(&host.name) else {
                tracing::warn!("[AnsibleExecutor] No stats for {}", host.name);
                continue;
            };
            hosts.push(HostReport {
                host: host.name.clone(),
                status,
                outputs: read_outputs(&output_dir.join(&host.name)).await,
            });
        }

        tracing::info!(
            "[TIMING] {} finished in {}ms (exit {})",
            request.label,
            start.elapsed().as_millis(),
            output.status
        );
        Ok(ExecutionReport { hosts })
    }
}
