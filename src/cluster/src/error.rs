//! Error taxonomy for bootstrap runs.

use crate::plan::PhaseId;
use crate::secrets::{CredentialKind, SecretError};
use crate::topology::TopologyError;
use std::path::PathBuf;
use std::time::Duration;

/// Errors raised by the persisted state layer.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State directory {path} is locked by another run ({holder})")]
    Locked { path: PathBuf, holder: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Stored topology is invalid: {0}")]
    StoredTopology(#[from] TopologyError),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by an external executor or reachability probe.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to launch executor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Executor did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Unreadable executor output: {0}")]
    Output(String),

    #[error("Executor error: {0}")]
    Other(String),
}

/// Error type for a bootstrap run.
///
/// Every phase-level variant halts the plan. Re-invoking the run is the only
/// retry mechanism.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Invalid topology: {0}")]
    InvalidTopology(#[from] TopologyError),

    #[error("Phase {phase} requires {missing} to have succeeded first")]
    PreconditionNotMet { phase: PhaseId, missing: PhaseId },

    #[error("Phase {phase}: hosts unreachable: {}", hosts.join(", "))]
    HostUnreachable { phase: PhaseId, hosts: Vec<String> },

    #[error("Phase {phase}: {kind} expired at {expired_at}; re-run initialization after a reset")]
    CredentialExpired {
        phase: PhaseId,
        kind: CredentialKind,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Phase {phase}: {kind} was never issued in this process; re-run initialization after a reset")]
    CredentialNotIssued { phase: PhaseId, kind: CredentialKind },

    #[error("Phase {phase}: credential rejected: {source}")]
    Credential {
        phase: PhaseId,
        #[source]
        source: SecretError,
    },

    #[error("Phase {phase} failed on: {}", hosts.join(", "))]
    PhaseActionFailed { phase: PhaseId, hosts: Vec<String> },

    #[error("Phase {phase} is destructive and already succeeded; refusing to re-run it")]
    DestructiveRerun { phase: PhaseId },

    #[error("Phase {0} is not part of the plan for this topology")]
    UnknownPhase(String),

    #[error("Run cancelled before phase {next}")]
    Cancelled { next: PhaseId },

    #[error("Reset not confirmed: expected --confirm-destroy {expected}")]
    ResetNotConfirmed { expected: String },

    #[error("Reset failed on: {}", hosts.join(", "))]
    ResetFailed { hosts: Vec<String> },

    #[error("Executor error in {phase}: {source}")]
    Executor {
        phase: String,
        #[source]
        source: ExecutorError,
    },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

impl BootstrapError {
    /// Attach the phase that was about to consume a credential.
    pub fn from_secret(phase: &PhaseId, err: SecretError) -> Self {
        match err {
            SecretError::Expired { kind, expired_at } => BootstrapError::CredentialExpired {
                phase: phase.clone(),
                kind,
                expired_at,
            },
            SecretError::NotIssued { kind } => BootstrapError::CredentialNotIssued {
                phase: phase.clone(),
                kind,
            },
            other => BootstrapError::Credential {
                phase: phase.clone(),
                source: other,
            },
        }
    }

    /// Whether plain re-invocation can succeed without operator changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BootstrapError::HostUnreachable { .. }
                | BootstrapError::PhaseActionFailed { .. }
                | BootstrapError::Cancelled { .. }
                | BootstrapError::Executor { .. }
        )
    }
}
