//! kubeboot: drives `ansible-playbook` through the cluster bootstrap plan.

pub mod ansible;
pub mod commands;
pub mod config;
pub mod probe;

pub use commands::{CommandError, Workspace};
pub use config::{ConfigError, ExecutorConfig, KubebootConfig};
