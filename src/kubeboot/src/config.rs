/// kubeboot configuration
/// Loaded from kubeboot.toml
use cluster::orchestrator::ExecutionSettings;
use cluster::settings::{ClusterSpec, CredentialPolicy, StorageSpec};
use cluster::topology::{NodeDecl, Topology, TopologyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "kubeboot.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("No {} found (searched: {})", CONFIG_FILE, .0.join(", "))]
    NotFound(Vec<String>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubebootConfig {
    /// Where topology, ledger and artifacts are kept
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub cluster: ClusterSpec,

    /// Declared hosts. Required.
    pub nodes: Vec<NodeDecl>,

    /// Presence requests the shared storage phase
    #[serde(default)]
    pub storage: Option<StorageSpec>,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub credentials: CredentialPolicy,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".kubeboot")
}

/// ansible-playbook invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_program")]
    pub program: String,

    /// Directory holding one playbook per action (`init-control-plane.yml`, ...)
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: PathBuf,

    #[serde(default = "default_forks")]
    pub forks: usize,

    /// Upper bound on one phase's executor invocation
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default)]
    pub private_key: Option<PathBuf>,
}

fn default_program() -> String {
    "ansible-playbook".to_string()
}

fn default_playbook_dir() -> PathBuf {
    PathBuf::from("playbooks")
}

fn default_forks() -> usize {
    5
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            playbook_dir: default_playbook_dir(),
            forks: default_forks(),
            timeout_secs: default_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            ssh_port: default_ssh_port(),
            private_key: None,
        }
    }
}

impl KubebootConfig {
    /// Search order: explicit path, `./kubeboot.toml`, `~/.kubeboot/kubeboot.toml`.
    pub fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit {
            return vec![path.to_path_buf()];
        }
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".kubeboot").join(CONFIG_FILE));
        }
        paths
    }

    /// Load, anchor relative paths at the file's directory, and validate.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        let candidates = Self::candidate_paths(explicit);

        for path in &candidates {
            if explicit.is_none() && !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let mut config = Self::parse(&content, path)?;
            if let Some(dir) = path.parent() {
                config.anchor(dir);
            }
            config.validate()?;
            tracing::info!("[Config] Loaded kubeboot config from {:?}", path);
            return Ok((config, path.clone()));
        }

        Err(ConfigError::NotFound(
            candidates.iter().map(|p| p.display().to_string()).collect(),
        ))
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve relative directories against `dir` and expand `~/` in the key path.
    pub fn anchor(&mut self, dir: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = dir.join(&self.state_dir);
        }
        if self.executor.playbook_dir.is_relative() {
            self.executor.playbook_dir = dir.join(&self.executor.playbook_dir);
        }
        if let Some(key) = self.executor.private_key.take() {
            self.executor.private_key = Some(expand_home(&key));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no [[nodes]] declared".to_string()));
        }
        if self.executor.program.trim().is_empty() {
            return Err(ConfigError::Invalid("executor.program is empty".to_string()));
        }
        if self.executor.forks == 0 {
            return Err(ConfigError::Invalid("executor.forks must be at least 1".to_string()));
        }
        if self.executor.timeout_secs == 0 || self.executor.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor timeouts must be greater than zero".to_string(),
            ));
        }
        if self.cluster.api_port == 0 {
            return Err(ConfigError::Invalid("cluster.api_port must not be 0".to_string()));
        }
        if let Some(storage) = &self.storage {
            if storage.server.trim().is_empty() {
                return Err(ConfigError::Invalid("storage.server is empty".to_string()));
            }
            if !storage.export_path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "storage.export_path must be absolute, got {}",
                    storage.export_path
                )));
            }
        }
        Ok(())
    }

    pub fn topology(&self) -> Result<Topology, TopologyError> {
        Topology::declare(&self.nodes, self.cluster.api_port)
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            forks: self.executor.forks,
            executor_timeout: Duration::from_secs(self.executor.timeout_secs),
            probe_timeout: Duration::from_secs(self.executor.probe_timeout_secs),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
