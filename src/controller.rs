// System
use std::sync::Arc;
use std::time::Duration;

// Third Party
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Local
use crate::metadata::MetadataSource;
use crate::node::{LabelSynchronizer, NodeStore};
use crate::watcher::InstanceWatcher;

/// Orchestrates the bootstrap synchronization and the steady-state event
/// loop for a single node.
pub struct Controller {
    node_name: String,
    store: Arc<dyn NodeStore>,
    source: Arc<dyn MetadataSource>,
    poll_interval: Duration,
}

impl Controller {
    pub fn new(
        node_name: String,
        store: Arc<dyn NodeStore>,
        source: Arc<dyn MetadataSource>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            node_name,
            store,
            source,
            poll_interval,
        }
    }

    /// Run until `token` is cancelled.
    ///
    /// Failing to resolve our own Node is fatal and propagated. A failed
    /// bootstrap fetch is only logged: the watcher's first successful tick
    /// always emits a change and performs the initial label application.
    pub async fn run(self, token: CancellationToken) -> Result<(), anyhow::Error> {
        let mut node = self
            .store
            .get_by_name(&self.node_name)
            .await
            .with_context(|| format!("failed to get node {}", self.node_name))?;
        let synchronizer = LabelSynchronizer::new(self.store.clone());

        // Bootstrap sync.
        match self.source.fetch().await {
            Ok(snapshot) => {
                if let Err(error) = synchronizer.apply(&mut node, &snapshot).await {
                    error!("Failed to apply the initial node labels: {}", error);
                }
            }
            Err(error) => {
                error!("Failed to get the initial instance data: {}", error);
            }
        }

        let (watcher, mut streams) = InstanceWatcher::new(self.source.clone(), self.poll_interval)?;
        tokio::spawn(watcher.start(token.clone()));

        // Steady state: handle whichever stream is ready first. The node's
        // label map is only ever mutated from this loop.
        let mut errors_closed = false;
        loop {
            tokio::select! {
                update = streams.updates.recv() => {
                    let Some(snapshot) = update else { break };
                    info!("Change to instance detected. New data: {:?}", snapshot);
                    if let Err(error) = synchronizer.apply(&mut node, &snapshot).await {
                        error!("Failed to update node labels: {}", error);
                    }
                }
                fault = streams.errors.recv(), if !errors_closed => {
                    match fault {
                        Some(error) => error!("Got error from instance watcher: {}", error),
                        None => errors_closed = true,
                    }
                }
            }
        }
        info!("Instance watcher stopped, shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // System
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // Third Party
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::error::ErrorResponse;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    // Local
    use super::Controller;
    use crate::metadata::{InstanceSnapshot, MetadataError, MetadataSource};
    use crate::node::NodeStore;

    fn snapshot(region: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            id: 123,
            label: "my-node".to_string(),
            region: region.to_string(),
            instance_type: "g6-standard-2".to_string(),
            host_uuid: "abc".to_string(),
        }
    }

    struct ScriptedSource {
        script: tokio::sync::Mutex<VecDeque<Result<InstanceSnapshot, MetadataError>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<InstanceSnapshot, MetadataError>>) -> Arc<Self> {
            Arc::new(Self {
                script: tokio::sync::Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        async fn fetch(&self) -> Result<InstanceSnapshot, MetadataError> {
            let next = self.script.lock().await.pop_front();
            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }

    /// Store whose node carries a pre-existing unrelated label, records every
    /// saved label map, and can fail the first N saves.
    struct RecordingStore {
        saves: tokio::sync::Mutex<Vec<BTreeMap<String, String>>>,
        failures_remaining: AtomicUsize,
    }

    impl RecordingStore {
        fn new(failing_saves: usize) -> Arc<Self> {
            Arc::new(Self {
                saves: tokio::sync::Mutex::new(Vec::new()),
                failures_remaining: AtomicUsize::new(failing_saves),
            })
        }

        async fn save_count(&self) -> usize {
            self.saves.lock().await.len()
        }
    }

    #[async_trait]
    impl NodeStore for RecordingStore {
        async fn get_by_name(&self, name: &str) -> Result<Node, kube::Error> {
            Ok(Node {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(BTreeMap::from([(
                        "kubernetes.io/os".to_string(),
                        "linux".to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            })
        }

        async fn save(&self, node: &Node) -> Result<(), kube::Error> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "injected save failure".to_string(),
                    reason: "InternalError".to_string(),
                    code: 500,
                }));
            }
            self.saves
                .lock()
                .await
                .push(node.metadata.labels.clone().unwrap_or_default());
            Ok(())
        }
    }

    fn spawn_controller(
        store: Arc<RecordingStore>,
        source: Arc<ScriptedSource>,
    ) -> CancellationToken {
        let controller = Controller::new(
            "node1".to_string(),
            store,
            source,
            Duration::from_secs(1),
        );
        let token = CancellationToken::new();
        tokio::spawn(controller.run(token.clone()));
        token
    }

    async fn wait_for_saves(store: &RecordingStore, count: usize) {
        timeout(Duration::from_secs(120), async {
            while store.save_count().await < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_applies_labels_once() {
        let store = RecordingStore::new(0);
        let source = ScriptedSource::new(vec![Ok(snapshot("us-east"))]);
        let token = spawn_controller(store.clone(), source);

        wait_for_saves(&store, 1).await;
        let saves = store.saves.lock().await;
        assert_eq!(saves[0].get("linode_region").unwrap(), "us-east");
        // Unrelated labels survive synchronization.
        assert_eq!(saves[0].get("kubernetes.io/os").unwrap(), "linux");
        drop(saves);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_fetch_failure_is_recovered_by_the_watcher() {
        let store = RecordingStore::new(0);
        let source = ScriptedSource::new(vec![
            Err(MetadataError::Token("bootstrap outage".to_string())),
            Ok(snapshot("us-east")),
        ]);
        let token = spawn_controller(store.clone(), source);

        // The watcher's first successful fetch drives the initial apply.
        wait_for_saves(&store, 1).await;
        let saves = store.saves.lock().await;
        assert_eq!(saves[0].get("linode_label").unwrap(), "my-node");
        drop(saves);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn change_events_are_synchronized_in_order() {
        let store = RecordingStore::new(0);
        // Bootstrap takes the first result; the watcher sees the rest.
        let source = ScriptedSource::new(vec![
            Ok(snapshot("us-east")),
            Ok(snapshot("us-east")),
            Ok(snapshot("eu-west")),
        ]);
        let token = spawn_controller(store.clone(), source);

        wait_for_saves(&store, 3).await;
        let saves = store.saves.lock().await;
        assert_eq!(saves[1].get("linode_region").unwrap(), "us-east");
        assert_eq!(saves[2].get("linode_region").unwrap(), "eu-west");
        drop(saves);
        token.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_does_not_stop_the_loop() {
        // First save (bootstrap apply) fails; the loop carries on and the
        // next change event persists fine.
        let store = RecordingStore::new(1);
        let source = ScriptedSource::new(vec![
            Ok(snapshot("us-east")),
            Ok(snapshot("eu-west")),
        ]);
        let token = spawn_controller(store.clone(), source);

        wait_for_saves(&store, 1).await;
        let saves = store.saves.lock().await;
        assert_eq!(saves[0].get("linode_region").unwrap(), "eu-west");
        drop(saves);
        token.cancel();
    }
}
