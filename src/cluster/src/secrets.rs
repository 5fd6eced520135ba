//! Bootstrap credential lifecycle.
//!
//! Join tokens and the certificate-upload key are harvested from the primary
//! initialization phase, kept in memory only, and checked for expiry every time
//! a join phase asks for them. The admin kubeconfig is the one long-lived
//! artifact and is handed to the state store by the orchestrator.

use crate::plan::PhaseId;
use crate::settings::CredentialPolicy;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// Output keys the initialization action reports for the primary node.
pub const OUTPUT_JOIN_TOKEN: &str = "join_token";
pub const OUTPUT_CERTIFICATE_KEY: &str = "certificate_key";
pub const OUTPUT_CA_CERT_HASH: &str = "ca_cert_hash";
pub const OUTPUT_ADMIN_KUBECONFIG: &str = "admin_kubeconfig";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CredentialKind {
    JoinTokenWorker,
    JoinTokenControlPlane,
    CertificateUploadKey,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::JoinTokenWorker => "join-token-worker",
            CredentialKind::JoinTokenControlPlane => "join-token-control-plane",
            CredentialKind::CertificateUploadKey => "certificate-upload-key",
        }
    }

    /// Executor variable the credential is passed as.
    pub fn variable(&self) -> &'static str {
        match self {
            CredentialKind::JoinTokenWorker | CredentialKind::JoinTokenControlPlane => {
                OUTPUT_JOIN_TOKEN
            }
            CredentialKind::CertificateUploadKey => OUTPUT_CERTIFICATE_KEY,
        }
    }

    /// Family of phases allowed to consume the credential.
    pub fn consumer(&self) -> &'static str {
        match self {
            CredentialKind::JoinTokenWorker => "worker-join",
            CredentialKind::JoinTokenControlPlane | CredentialKind::CertificateUploadKey => {
                "control-plane-join"
            }
        }
    }
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret string that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl std::fmt::Display for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapCredential {
    pub kind: CredentialKind,
    pub value: SecretValue,
    pub issued_at: DateTime<Utc>,
    pub validity: Duration,
    pub consumer: &'static str,
}

impl BootstrapCredential {
    pub fn expires_at(&self) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.validity) {
            Ok(validity) => self
                .issued_at
                .checked_add_signed(validity)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Err(_) => DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Durable administrative credential produced once the plan completes.
#[derive(Debug, Clone)]
pub struct AdminCredentialBundle {
    pub kubeconfig: SecretValue,
    pub endpoint: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SecretError {
    #[error("{kind} expired at {expired_at}")]
    Expired {
        kind: CredentialKind,
        expired_at: DateTime<Utc>,
    },

    #[error("{kind} has not been issued")]
    NotIssued { kind: CredentialKind },

    #[error("{kind} was already consumed by {node}")]
    Consumed { kind: CredentialKind, node: String },

    #[error("initialization output is missing {0}")]
    MissingOutput(&'static str),

    #[error("admin credential bundle has not been issued")]
    AdminNotIssued,
}

/// Tracks issued credentials for one process lifetime.
pub struct SecretManager {
    policy: CredentialPolicy,
    credentials: HashMap<CredentialKind, BootstrapCredential>,
    consumed: HashSet<(CredentialKind, String)>,
    ca_cert_hash: Option<String>,
    admin: Option<AdminCredentialBundle>,
}

impl SecretManager {
    pub fn new(policy: CredentialPolicy) -> Self {
        Self {
            policy,
            credentials: HashMap::new(),
            consumed: HashSet::new(),
            ca_cert_hash: None,
            admin: None,
        }
    }

    pub fn policy(&self) -> &CredentialPolicy {
        &self.policy
    }

    /// Issue a credential now. Replaces any earlier credential of the same kind.
    pub fn issue(
        &mut self,
        kind: CredentialKind,
        value: SecretValue,
        validity: Duration,
    ) -> &BootstrapCredential {
        self.issue_at(kind, value, validity, Utc::now())
    }

    pub fn issue_at(
        &mut self,
        kind: CredentialKind,
        value: SecretValue,
        validity: Duration,
        issued_at: DateTime<Utc>,
    ) -> &BootstrapCredential {
        tracing::info!(
            "[Secrets] Issued {} valid for {}s",
            kind,
            validity.as_secs()
        );
        self.consumed.retain(|(k, _)| *k != kind);
        self.credentials.insert(
            kind,
            BootstrapCredential {
                kind,
                value,
                issued_at,
                validity,
                consumer: kind.consumer(),
            },
        );
        &self.credentials[&kind]
    }

    /// Take the credentials out of the primary initialization outputs.
    ///
    /// The join token is required. The certificate key is required only when
    /// secondary control-plane nodes will join.
    pub fn harvest(
        &mut self,
        outputs: &BTreeMap<String, String>,
        endpoint: &str,
        needs_certificate_key: bool,
    ) -> Result<Vec<CredentialKind>, SecretError> {
        self.harvest_at(outputs, endpoint, needs_certificate_key, Utc::now())
    }

    pub fn harvest_at(
        &mut self,
        outputs: &BTreeMap<String, String>,
        endpoint: &str,
        needs_certificate_key: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<CredentialKind>, SecretError> {
        let output = |key: &'static str| {
            outputs
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let token = output(OUTPUT_JOIN_TOKEN).ok_or(SecretError::MissingOutput(OUTPUT_JOIN_TOKEN))?;
        let certificate_key = output(OUTPUT_CERTIFICATE_KEY);
        if needs_certificate_key && certificate_key.is_none() {
            return Err(SecretError::MissingOutput(OUTPUT_CERTIFICATE_KEY));
        }

        let token_ttl = self.policy.join_token_ttl();
        let key_ttl = self.policy.certificate_key_ttl();
        let mut issued = Vec::new();

        for kind in [
            CredentialKind::JoinTokenWorker,
            CredentialKind::JoinTokenControlPlane,
        ] {
            self.issue_at(kind, SecretValue::new(token), token_ttl, now);
            issued.push(kind);
        }
        if let Some(key) = certificate_key {
            self.issue_at(
                CredentialKind::CertificateUploadKey,
                SecretValue::new(key),
                key_ttl,
                now,
            );
            issued.push(CredentialKind::CertificateUploadKey);
        }

        self.ca_cert_hash = output(OUTPUT_CA_CERT_HASH).map(str::to_string);

        if let Some(kubeconfig) = output(OUTPUT_ADMIN_KUBECONFIG) {
            self.admin = Some(AdminCredentialBundle {
                kubeconfig: SecretValue::new(kubeconfig),
                endpoint: endpoint.to_string(),
                issued_at: now,
            });
        } else {
            // A bundle restored from an earlier run does not belong to this cluster.
            self.admin = None;
            tracing::warn!("[Secrets] Initialization reported no admin kubeconfig");
        }

        Ok(issued)
    }

    /// Discovery hash of the cluster CA, passed to join phases alongside the token.
    pub fn ca_cert_hash(&self) -> Option<&str> {
        self.ca_cert_hash.as_deref()
    }

    pub fn credential(&self, kind: CredentialKind) -> Option<&BootstrapCredential> {
        self.credentials.get(&kind)
    }

    /// Credentials a join phase needs, checked against the clock.
    pub fn present_for(&self, phase: &PhaseId) -> Result<Vec<BootstrapCredential>, SecretError> {
        self.present_for_at(phase, Utc::now())
    }

    pub fn present_for_at(
        &self,
        phase: &PhaseId,
        now: DateTime<Utc>,
    ) -> Result<Vec<BootstrapCredential>, SecretError> {
        let mut presented = Vec::new();
        for kind in phase.consumes() {
            let credential = self
                .credentials
                .get(kind)
                .ok_or(SecretError::NotIssued { kind: *kind })?;

            if credential.is_expired_at(now) {
                tracing::warn!(
                    "[Secrets] Refusing {} for {}: expired at {}",
                    kind,
                    phase,
                    credential.expires_at()
                );
                return Err(SecretError::Expired {
                    kind: *kind,
                    expired_at: credential.expires_at(),
                });
            }

            if let Some(node) = phase.node() {
                if self.consumed.contains(&(*kind, node.to_string())) {
                    return Err(SecretError::Consumed {
                        kind: *kind,
                        node: node.to_string(),
                    });
                }
            }
            presented.push(credential.clone());
        }
        Ok(presented)
    }

    /// Record that a join phase used its credentials successfully.
    pub fn mark_consumed(&mut self, phase: &PhaseId) {
        if let Some(node) = phase.node() {
            for kind in phase.consumes() {
                self.consumed.insert((*kind, node.to_string()));
            }
        }
    }

    /// Reinstate an admin bundle persisted by an earlier run.
    pub fn restore_admin(&mut self, bundle: AdminCredentialBundle) {
        if self.admin.is_none() {
            self.admin = Some(bundle);
        }
    }

    pub fn admin(&self) -> Option<&AdminCredentialBundle> {
        self.admin.as_ref()
    }

    /// Produce the durable admin credential once the plan has completed.
    pub fn finalize(&self) -> Result<AdminCredentialBundle, SecretError> {
        self.admin.clone().ok_or(SecretError::AdminNotIssued)
    }
}
