use std::sync::Arc;

use intel_dra_driver::client::InMemoryStateClient;
use intel_dra_driver::config::Config;
use intel_dra_driver::Controller;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    info!(namespace = %config.namespace, "controller starting");

    // The deployment wires in its state-store binding; standalone runs use
    // the in-memory store.
    let client = Arc::new(InMemoryStateClient::new());
    let _controller = Controller::new(client);
    info!("controller ready");

    signal(SignalKind::terminate())?.recv().await;
    info!("SIGTERM received, exiting...");

    Ok(())
}
