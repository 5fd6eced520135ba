/// Cluster-wide parameters handed to every phase.
/// Deserialized from the `[cluster]`, `[storage]` and `[credentials]` config sections.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default kube-apiserver port, fronted unchanged by the load balancer.
pub const DEFAULT_API_PORT: u16 = 6443;

/// kubeadm bootstrap token default TTL (24h).
pub const DEFAULT_JOIN_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// kubeadm deletes uploaded certificates after two hours.
pub const DEFAULT_CERTIFICATE_KEY_TTL_SECS: u64 = 2 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default = "default_kubernetes_version")]
    pub kubernetes_version: String,
    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,
    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,
    #[serde(default)]
    pub cni: Cni,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

fn default_kubernetes_version() -> String {
    "1.30".to_string()
}

fn default_pod_cidr() -> String {
    "10.244.0.0/16".to_string()
}

fn default_service_cidr() -> String {
    "10.96.0.0/12".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            kubernetes_version: default_kubernetes_version(),
            pod_cidr: default_pod_cidr(),
            service_cidr: default_service_cidr(),
            cni: Cni::default(),
            api_port: default_api_port(),
        }
    }
}

/// Overlay network plugin deployed after control-plane bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cni {
    #[default]
    Calico,
    Flannel,
}

impl Cni {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cni::Calico => "calico",
            Cni::Flannel => "flannel",
        }
    }
}

impl std::fmt::Display for Cni {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Cni {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "calico" => Ok(Cni::Calico),
            "flannel" => Ok(Cni::Flannel),
            _ => Err(format!("Unknown CNI plugin: {}", s)),
        }
    }
}

/// Shared NFS storage request. Its presence adds the storage phase to the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSpec {
    /// Generated node name of the NFS server (e.g. "worker01")
    pub server: String,
    #[serde(default = "default_export_path")]
    pub export_path: String,
}

fn default_export_path() -> String {
    "/srv/nfs/kubedata".to_string()
}

/// Validity windows for bootstrap credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPolicy {
    #[serde(default = "default_join_token_ttl")]
    pub join_token_ttl_secs: u64,
    #[serde(default = "default_certificate_key_ttl")]
    pub certificate_key_ttl_secs: u64,
}

fn default_join_token_ttl() -> u64 {
    DEFAULT_JOIN_TOKEN_TTL_SECS
}

fn default_certificate_key_ttl() -> u64 {
    DEFAULT_CERTIFICATE_KEY_TTL_SECS
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            join_token_ttl_secs: default_join_token_ttl(),
            certificate_key_ttl_secs: default_certificate_key_ttl(),
        }
    }
}

impl CredentialPolicy {
    pub fn join_token_ttl(&self) -> Duration {
        Duration::from_secs(self.join_token_ttl_secs)
    }

    pub fn certificate_key_ttl(&self) -> Duration {
        Duration::from_secs(self.certificate_key_ttl_secs)
    }
}
