use std::fs;
use std::process::exit;
use std::sync::Arc;

use intel_dra_driver::client::InMemoryStateClient;
use intel_dra_driver::config::Config;
use intel_dra_driver::{NodeAgent, PluginServer};
use tokio::signal::unix::{signal, SignalKind};
use tokio::spawn;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = match Config::from_env_for_node() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            exit(1);
        }
    };
    if let Err(e) = fs::create_dir_all(&config.plugin_dir) {
        error!("plugin directory {:?} unusable: {e}", config.plugin_dir);
        exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The deployment wires in its state-store binding; standalone runs use
    // the in-memory store.
    let client = Arc::new(InMemoryStateClient::new());
    let agent = match NodeAgent::new(config.clone(), client, shutdown_rx.clone()).await {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!("failed to publish node resources: {e}");
            exit(1);
        }
    };

    let server = PluginServer::new(&config, agent);
    let handle = spawn(server.run(shutdown_rx));

    signal(SignalKind::terminate())?.recv().await;
    info!("SIGTERM received, exiting...");
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    Ok(())
}
