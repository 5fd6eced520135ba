/// Tera rendering of the persisted inventory and the join transcript.
/// Templates are compiled into the binary so the tool works from a bare install.
use crate::error::StateError;
use crate::settings::ClusterSpec;
use crate::topology::{Role, Topology};
use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

pub const INVENTORY_TEMPLATE: &str = "inventory.ini.j2";
pub const TRANSCRIPT_TEMPLATE: &str = "join-transcript.txt.j2";

const ALL_TEMPLATES: &[(&str, &str)] = &[
    (
        INVENTORY_TEMPLATE,
        include_str!("templates/inventory.ini.j2"),
    ),
    (
        TRANSCRIPT_TEMPLATE,
        include_str!("templates/join-transcript.txt.j2"),
    ),
];

#[derive(Serialize)]
struct InventoryHost<'a> {
    name: &'a str,
    address: &'a str,
    user: &'a str,
}

#[derive(Serialize)]
struct InventoryGroup<'a> {
    name: &'static str,
    hosts: Vec<InventoryHost<'a>>,
}

/// One join recorded in the transcript. Carries no secret material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub at: String,
    pub node: String,
    pub address: String,
    pub control_plane: bool,
    pub ca_cert_hash: String,
}

pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn from_embedded() -> Result<Self, StateError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        for (name, content) in ALL_TEMPLATES {
            tera.add_raw_template(name, content).map_err(|e| {
                StateError::Template(format!("Failed to add template {}: {}", name, e))
            })?;
            tracing::debug!("[TemplateRenderer] Loaded embedded template: {}", name);
        }
        Ok(Self { tera })
    }

    pub fn render(&self, template: &str, context: &Context) -> Result<String, StateError> {
        self.tera
            .render(template, context)
            .map_err(|e| StateError::Template(format!("Failed to render {}: {:?}", template, e)))
    }

    /// Inventory grouped by role, hosts in declaration order.
    pub fn render_inventory(
        &self,
        topology: &Topology,
        cluster: &ClusterSpec,
    ) -> Result<String, StateError> {
        let groups: Vec<InventoryGroup> = Role::ALL
            .iter()
            .map(|role| InventoryGroup {
                name: role.inventory_group(),
                hosts: topology
                    .hosts_for_role(*role)
                    .into_iter()
                    .map(|n| InventoryHost {
                        name: &n.name,
                        address: &n.address,
                        user: &n.user,
                    })
                    .collect(),
            })
            .collect();

        let endpoint = topology.control_plane_endpoint();
        let mut context = Context::new();
        context.insert("groups", &groups);
        context.insert("cluster_name", &cluster.name);
        context.insert("endpoint", &endpoint.to_string());
        context.insert("endpoint_host", &endpoint.host);
        context.insert("api_port", &endpoint.port);
        context.insert("kubernetes_version", &cluster.kubernetes_version);
        context.insert("pod_cidr", &cluster.pod_cidr);
        context.insert("service_cidr", &cluster.service_cidr);
        context.insert("cni", cluster.cni.as_str());

        self.render(INVENTORY_TEMPLATE, &context)
    }

    pub fn render_transcript(
        &self,
        cluster_name: &str,
        endpoint: &str,
        entries: &[TranscriptEntry],
    ) -> Result<String, StateError> {
        let mut context = Context::new();
        context.insert("cluster_name", cluster_name);
        context.insert("endpoint", endpoint);
        context.insert("entries", entries);
        self.render(TRANSCRIPT_TEMPLATE, &context)
    }
}
