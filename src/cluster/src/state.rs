//! Durable bootstrap state.
//!
//! Layout under the state directory:
//!
//! ```text
//! topology.json              declared topology (replaced whole)
//! inventory.ini              executor inventory rendered from the topology
//! inventory.check.ini        inventory for verification runs
//! ledger.jsonl               execution ledger, one PhaseRun per line (append-only)
//! artifacts/admin.conf       admin kubeconfig (sensitive, mode 0600)
//! artifacts/admin.json       endpoint and issue time of admin.conf
//! artifacts/join-transcript.json / .txt
//! .lock                      advisory lock held for the duration of a run
//! ```
//!
//! Ledger and artifacts belong to one control-plane endpoint. When the
//! declared endpoint changes both are moved aside, never deleted.

use crate::error::StateError;
use crate::ledger::{Ledger, PhaseRun};
use crate::secrets::{AdminCredentialBundle, SecretValue};
use crate::settings::ClusterSpec;
use crate::templates::{TemplateRenderer, TranscriptEntry};
use crate::topology::Topology;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const TOPOLOGY_FILE: &str = "topology.json";
const INVENTORY_FILE: &str = "inventory.ini";
const CHECK_INVENTORY_FILE: &str = "inventory.check.ini";
const LEDGER_FILE: &str = "ledger.jsonl";
const LOCK_FILE: &str = ".lock";
const ARTIFACTS_DIR: &str = "artifacts";
const ADMIN_BUNDLE_FILE: &str = "admin.conf";
const ADMIN_META_FILE: &str = "admin.json";
const TRANSCRIPT_DATA_FILE: &str = "join-transcript.json";
const TRANSCRIPT_FILE: &str = "join-transcript.txt";

/// Advisory lock on a state directory. Released when dropped.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("[StateStore] Failed to release lock {:?}: {}", self.path, e);
        } else {
            tracing::debug!("[StateStore] Released lock {:?}", self.path);
        }
    }
}

/// What the store found when a run opened its session.
#[derive(Debug)]
pub struct Session {
    pub ledger: Ledger,
    /// Inventory the executor should be pointed at
    pub inventory: PathBuf,
    /// Ledger moved aside because the stored endpoint differed
    pub archived_ledger: Option<PathBuf>,
    /// Artifacts of the previous endpoint, moved aside with the ledger
    pub archived_artifacts: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminBundleMeta {
    endpoint: String,
    issued_at: DateTime<Utc>,
}

fn archive_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

pub struct StateStore {
    root: PathBuf,
    artifacts: PathBuf,
    renderer: TemplateRenderer,
}

impl StateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StateError> {
        let root = root.into();
        let artifacts = root.join(ARTIFACTS_DIR);
        fs::create_dir_all(&artifacts).map_err(|e| StateError::io(&artifacts, e))?;

        Ok(Self {
            root,
            artifacts,
            renderer: TemplateRenderer::from_embedded()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE)
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.root.join(INVENTORY_FILE)
    }

    pub fn check_inventory_path(&self) -> PathBuf {
        self.root.join(CHECK_INVENTORY_FILE)
    }

    pub fn admin_bundle_path(&self) -> PathBuf {
        self.artifacts.join(ADMIN_BUNDLE_FILE)
    }

    fn admin_meta_path(&self) -> PathBuf {
        self.artifacts.join(ADMIN_META_FILE)
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.artifacts.join(TRANSCRIPT_FILE)
    }

    /// Take the advisory lock. Fails if another run holds it.
    pub fn lock(&self) -> Result<StateLock, StateError> {
        let path = self.root.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let holder = format!("pid {} since {}", std::process::id(), Utc::now().to_rfc3339());
                file.write_all(holder.as_bytes())
                    .map_err(|e| StateError::io(&path, e))?;
                tracing::debug!("[StateStore] Acquired lock {:?}", path);
                Ok(StateLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_else(|_| "unknown".to_string());
                Err(StateError::Locked {
                    path,
                    holder: holder.trim().to_string(),
                })
            }
            Err(e) => Err(StateError::io(path, e)),
        }
    }

    /// Write `content` through a temp file in the same directory, then rename.
    fn replace_file(&self, path: &Path, content: &[u8]) -> Result<(), StateError> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
        tmp.write_all(content).map_err(|e| StateError::io(path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StateError::io(path, e))?;
        tmp.persist(path)
            .map_err(|e| StateError::io(path, e.error))?;
        Ok(())
    }

    pub fn load_topology(&self) -> Result<Option<Topology>, StateError> {
        let path = self.root.join(TOPOLOGY_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };
        let topology: Topology =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: path.clone(),
                source,
            })?;
        topology.validate()?;
        Ok(Some(topology))
    }

    pub fn save_topology(&self, topology: &Topology) -> Result<(), StateError> {
        let path = self.root.join(TOPOLOGY_FILE);
        let content = serde_json::to_vec_pretty(topology).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        self.replace_file(&path, &content)
    }

    pub fn save_inventory(
        &self,
        topology: &Topology,
        cluster: &ClusterSpec,
    ) -> Result<PathBuf, StateError> {
        let path = self.inventory_path();
        let content = self.renderer.render_inventory(topology, cluster)?;
        self.replace_file(&path, content.as_bytes())?;
        Ok(path)
    }

    pub fn load_ledger(&self) -> Result<Ledger, StateError> {
        let path = self.ledger_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::new()),
            Err(e) => return Err(StateError::io(path, e)),
        };

        let mut runs = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let run: PhaseRun = serde_json::from_str(line).map_err(|source| StateError::Corrupt {
                path: path.clone(),
                source,
            })?;
            runs.push(run);
        }
        Ok(Ledger::from_runs(runs))
    }

    pub fn append_run(&self, run: &PhaseRun) -> Result<(), StateError> {
        let path = self.ledger_path();
        let mut line = serde_json::to_string(run).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            source,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StateError::io(&path, e))?;
        file.sync_data().map_err(|e| StateError::io(&path, e))?;
        Ok(())
    }

    /// Move the ledger aside so the next run starts from scratch.
    pub fn archive_ledger(&self, reason: &str) -> Result<Option<PathBuf>, StateError> {
        let path = self.ledger_path();
        if !path.exists() {
            return Ok(None);
        }
        let archived = self
            .root
            .join(format!("ledger.{}.{}.jsonl", archive_stamp(), reason));
        fs::rename(&path, &archived).map_err(|e| StateError::io(&path, e))?;
        tracing::info!("[StateStore] Archived ledger to {:?}", archived);
        Ok(Some(archived))
    }

    /// Move the artifacts directory aside and start an empty one.
    pub fn archive_artifacts(&self, reason: &str) -> Result<Option<PathBuf>, StateError> {
        if self.artifacts().is_empty() {
            return Ok(None);
        }
        let archived = self
            .root
            .join(format!("{}.{}.{}", ARTIFACTS_DIR, archive_stamp(), reason));
        fs::rename(&self.artifacts, &archived).map_err(|e| StateError::io(&self.artifacts, e))?;
        fs::create_dir_all(&self.artifacts).map_err(|e| StateError::io(&self.artifacts, e))?;
        tracing::info!("[StateStore] Archived artifacts to {:?}", archived);
        Ok(Some(archived))
    }

    /// Ledger for `declared` without writing anything. A stored topology with
    /// a different endpoint yields an empty ledger.
    pub fn peek_ledger(&self, declared: &Topology) -> Result<Ledger, StateError> {
        match self.load_topology()? {
            Some(stored)
                if stored.control_plane_endpoint() != declared.control_plane_endpoint() =>
            {
                Ok(Ledger::new())
            }
            _ => self.load_ledger(),
        }
    }

    /// Persist the declared topology and return the ledger to resume from.
    ///
    /// If the stored topology derives a different control-plane endpoint the
    /// existing ledger is archived: credentials and joined nodes were bound
    /// to the old endpoint.
    pub fn open_session(
        &self,
        declared: &Topology,
        cluster: &ClusterSpec,
    ) -> Result<Session, StateError> {
        let mut archived_ledger = None;
        let mut archived_artifacts = None;
        if let Some(stored) = self.load_topology()? {
            let old = stored.control_plane_endpoint();
            let new = declared.control_plane_endpoint();
            if old != new {
                tracing::warn!(
                    "[StateStore] Control-plane endpoint changed from {} to {}; not reusing the existing ledger",
                    old,
                    new
                );
                archived_ledger = self.archive_ledger("stale")?;
                archived_artifacts = self.archive_artifacts("stale")?;
            }
        }

        self.save_topology(declared)?;
        let inventory = self.save_inventory(declared, cluster)?;
        let ledger = self.load_ledger()?;

        Ok(Session {
            ledger,
            inventory,
            archived_ledger,
            archived_artifacts,
        })
    }

    /// Session for a verification run. Stored topology, inventory and ledger
    /// are left untouched; the declared topology gets its own inventory.
    pub fn check_session(
        &self,
        declared: &Topology,
        cluster: &ClusterSpec,
    ) -> Result<Session, StateError> {
        let ledger = self.peek_ledger(declared)?;
        let inventory = self.check_inventory_path();
        let content = self.renderer.render_inventory(declared, cluster)?;
        self.replace_file(&inventory, content.as_bytes())?;

        Ok(Session {
            ledger,
            inventory,
            archived_ledger: None,
            archived_artifacts: None,
        })
    }

    /// Write the admin kubeconfig with owner-only permissions, plus the
    /// endpoint it was issued for.
    pub fn save_admin_bundle(&self, bundle: &AdminCredentialBundle) -> Result<PathBuf, StateError> {
        let path = self.admin_bundle_path();
        self.replace_file(&path, bundle.kubeconfig.expose().as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .map_err(|e| StateError::io(&path, e))?;
        }

        let meta_path = self.admin_meta_path();
        let meta = AdminBundleMeta {
            endpoint: bundle.endpoint.clone(),
            issued_at: bundle.issued_at,
        };
        let content = serde_json::to_vec_pretty(&meta).map_err(|source| StateError::Corrupt {
            path: meta_path.clone(),
            source,
        })?;
        self.replace_file(&meta_path, &content)?;
        Ok(path)
    }

    /// Admin bundle issued for `endpoint`. A bundle without metadata or for
    /// another endpoint is not returned.
    pub fn load_admin_bundle(&self, endpoint: &str) -> Result<Option<AdminCredentialBundle>, StateError> {
        let meta_path = self.admin_meta_path();
        let meta: AdminBundleMeta = match fs::read_to_string(&meta_path) {
            Ok(c) => serde_json::from_str(&c).map_err(|source| StateError::Corrupt {
                path: meta_path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(meta_path, e)),
        };
        if meta.endpoint != endpoint {
            tracing::warn!(
                "[StateStore] Ignoring admin bundle issued for {} (current endpoint {})",
                meta.endpoint,
                endpoint
            );
            return Ok(None);
        }

        let path = self.admin_bundle_path();
        let kubeconfig = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::io(path, e)),
        };

        Ok(Some(AdminCredentialBundle {
            kubeconfig: SecretValue::new(kubeconfig),
            endpoint: meta.endpoint,
            issued_at: meta.issued_at,
        }))
    }

    pub fn load_transcript(&self) -> Result<Vec<TranscriptEntry>, StateError> {
        let path = self.artifacts.join(TRANSCRIPT_DATA_FILE);
        match fs::read_to_string(&path) {
            Ok(c) => serde_json::from_str(&c).map_err(|source| StateError::Corrupt { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StateError::io(path, e)),
        }
    }

    /// Add a join to the transcript and re-render the readable copy.
    pub fn record_join(
        &self,
        cluster_name: &str,
        endpoint: &str,
        entry: TranscriptEntry,
    ) -> Result<PathBuf, StateError> {
        let mut entries = self.load_transcript()?;
        entries.retain(|e| e.node != entry.node);
        entries.push(entry);

        let data_path = self.artifacts.join(TRANSCRIPT_DATA_FILE);
        let data = serde_json::to_vec_pretty(&entries).map_err(|source| StateError::Corrupt {
            path: data_path.clone(),
            source,
        })?;
        self.replace_file(&data_path, &data)?;

        let text = self
            .renderer
            .render_transcript(cluster_name, endpoint, &entries)?;
        let path = self.transcript_path();
        self.replace_file(&path, text.as_bytes())?;
        Ok(path)
    }

    /// Artifact files currently present.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        [
            self.admin_bundle_path(),
            self.admin_meta_path(),
            self.transcript_path(),
            self.artifacts.join(TRANSCRIPT_DATA_FILE),
        ]
        .into_iter()
        .filter(|p| p.exists())
        .collect()
    }

    pub fn remove_artifacts(&self) -> Result<(), StateError> {
        for path in self.artifacts() {
            fs::remove_file(&path).map_err(|e| StateError::io(&path, e))?;
            tracing::info!("[StateStore] Removed {:?}", path);
        }
        Ok(())
    }
}
