// System
use std::sync::Arc;

// Third Party
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

// Local
use linode_node_decorator::{
    config::{Config, Options},
    controller::Controller,
    metadata::LinodeMetadataSource,
    node::KubeNodeStore,
    utils::{init_tracing, setup_exit_hooks},
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let options = Options::parse();
    init_tracing("linode_node_decorator", tracing::Level::INFO);
    setup_exit_hooks()?;

    info!(
        "Starting Linode Kubernetes Node Decorator: version {}",
        env!("CARGO_PKG_VERSION")
    );
    let config = Config::load(&options)?;
    info!("The poll interval is set to {:?}", config.poll_interval);

    let client = Client::try_default().await?;
    let store = Arc::new(KubeNodeStore::new(&client));
    let source = Arc::new(LinodeMetadataSource::new()?);

    let controller = Controller::new(config.node_name, store, source, config.poll_interval);

    // Runs until the process is killed; only startup failures return.
    controller.run(CancellationToken::new()).await
}
