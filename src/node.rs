// System
use std::collections::BTreeMap;
use std::sync::Arc;

// Third Party
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use serde_json::json;
use tracing::info;

// Local
use crate::metadata::InstanceSnapshot;

pub const LABEL_KEY: &str = "linode_label";
pub const ID_KEY: &str = "linode_id";
pub const REGION_KEY: &str = "linode_region";
pub const TYPE_KEY: &str = "linode_type";
pub const HOST_KEY: &str = "linode_host";

/// Capability to read this machine's Node object and persist its labels.
///
/// No optimistic-concurrency contract beyond last write wins.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_by_name(&self, name: &str) -> Result<Node, kube::Error>;
    async fn save(&self, node: &Node) -> Result<(), kube::Error>;
}

pub struct KubeNodeStore {
    nodes: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: &Client) -> Self {
        Self {
            nodes: Api::all(client.clone()),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get_by_name(&self, name: &str) -> Result<Node, kube::Error> {
        self.nodes.get(name).await
    }

    async fn save(&self, node: &Node) -> Result<(), kube::Error> {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({
                    "metadata": { "labels": node.metadata.labels }
                })),
            )
            .await?;
        Ok(())
    }
}

/// Set the `linode_*` labels on `node` from `snapshot`, overwriting prior
/// values. Labels outside this schema are left untouched.
pub fn update_node_labels(node: &mut Node, snapshot: &InstanceSnapshot) {
    let labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_KEY.to_string(), snapshot.label.clone());
    labels.insert(ID_KEY.to_string(), snapshot.id.to_string());
    labels.insert(REGION_KEY.to_string(), snapshot.region.clone());
    labels.insert(TYPE_KEY.to_string(), snapshot.instance_type.clone());
    labels.insert(HOST_KEY.to_string(), snapshot.host_uuid.clone());
}

/// Projects instance snapshots onto the node's label mapping and persists
/// the result. Applying the same snapshot twice is a no-op for the stored
/// state and not an error.
pub struct LabelSynchronizer {
    store: Arc<dyn NodeStore>,
}

impl LabelSynchronizer {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    /// Mutates `node`'s labels in place, then saves. On a save error the
    /// in-memory mutation is kept; the next successful apply reconciles the
    /// stored state.
    pub async fn apply(
        &self,
        node: &mut Node,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), kube::Error> {
        info!(
            "Updating node labels with Linode instance data: {:?}",
            snapshot
        );
        update_node_labels(node, snapshot);
        self.store.save(node).await
    }
}
