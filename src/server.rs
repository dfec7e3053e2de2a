//! Serving lifecycle of the node agent. The plugin socket lives in the
//! driver's own directory and is bound exactly once per process; what comes
//! and goes is the kubelet on the other side, so the loop here watches the
//! kubelet's registrar socket and repeats the registration handshake (with
//! backoff) whenever that socket is recreated.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use notify::{recommended_watcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::net::{UnixListener, UnixStream};
use tokio::spawn;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;
use tracing::{error, info, warn};

use crate::agent::{DraPluginService, NodeAgent};
use crate::client::StateClient;
use crate::config::{Config, DRIVER_NAME, PLUGIN_SOCK};
use crate::pb::dra_plugin_server::DraPluginServer;
use crate::pb::registration_client::RegistrationClient;
use crate::pb::RegisterRequest;

static VERSION: &str = "v1alpha1";
static KUBELET_SOCK: &str = "kubelet.sock";

const INITIAL_REGISTER_BACKOFF: Duration = Duration::from_millis(500);
const MAX_REGISTER_BACKOFF: Duration = Duration::from_secs(30);

pub struct PluginServer<C: StateClient> {
    socket_path: PathBuf,
    registrar_dir: PathBuf,
    agent: Arc<NodeAgent<C>>,
}

impl<C: StateClient> PluginServer<C> {
    pub fn new(config: &Config, agent: Arc<NodeAgent<C>>) -> Self {
        PluginServer {
            socket_path: config.socket_path(),
            registrar_dir: config.registrar_dir.clone(),
            agent,
        }
    }

    /// Serves the plugin API until `shutdown` fires. The socket is bound
    /// once; the registration handshake is repeated, with backoff, every
    /// time the kubelet's registrar socket reappears after a restart. An
    /// unexpected server exit is an error, not a restart.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self.bind_socket()?;
        info!(socket = ?self.socket_path, "plugin listening");

        let mut serve_shutdown = shutdown.clone();
        let mut server = spawn(
            Server::builder()
                .add_service(DraPluginServer::new(DraPluginService(self.agent.clone())))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    let _ = serve_shutdown.changed().await;
                }),
        );

        let (registrar_tx, mut registrar_events) = watch::channel(());
        let _watcher = match self.watch_registrar(registrar_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                // Without the watcher a kubelet restart goes unnoticed; the
                // initial registration below still happens.
                warn!(dir = ?self.registrar_dir, error = %e, "cannot watch registrar directory");
                None
            }
        };

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.register_with_backoff(&mut shutdown).await;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = registrar_events.changed() => {
                    info!("registrar socket changed, repeating registration");
                }
                outcome = &mut server => {
                    let _ = fs::remove_file(&self.socket_path);
                    return match outcome {
                        Ok(Ok(())) => bail!("plugin server stopped unexpectedly"),
                        Ok(Err(e)) => Err(e.into()),
                        Err(e) => Err(e.into()),
                    };
                }
            }
        }

        let _ = server.await;
        let _ = fs::remove_file(&self.socket_path);
        info!("plugin server stopped");
        Ok(())
    }

    /// Claims the driver socket. A connectable socket means a second agent
    /// instance is alive, which is fatal; anything else there is debris from
    /// an earlier run and is swept away.
    fn bind_socket(&self) -> anyhow::Result<UnixListener> {
        if let Some(dir) = self.socket_path.parent() {
            fs::create_dir_all(dir)?;
        }
        match std::os::unix::net::UnixStream::connect(&self.socket_path) {
            Ok(_) => bail!(
                "another agent instance is serving on {:?}",
                self.socket_path
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(_) => fs::remove_file(&self.socket_path)?,
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    /// Signals whenever the kubelet's registration socket is created or
    /// removed in the registrar directory; other files there are ignored.
    fn watch_registrar(&self, tx: watch::Sender<()>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if event.paths.iter().any(|p| p.ends_with(KUBELET_SOCK)) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!("registrar watch failed: {e}"),
            }
        })?;
        watcher.watch(&self.registrar_dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Keeps retrying the handshake until it lands or shutdown wins; the
    /// kubelet being down is expected during node startup and upgrades.
    async fn register_with_backoff(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut backoff = INITIAL_REGISTER_BACKOFF;
        loop {
            match self.register_once().await {
                Ok(()) => {
                    info!(driver = DRIVER_NAME, "registered with the kubelet");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, delay = ?backoff, "kubelet registration failed");
                }
            }
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(MAX_REGISTER_BACKOFF);
        }
    }

    async fn register_once(&self) -> anyhow::Result<()> {
        let registrar_socket = self.registrar_dir.join(KUBELET_SOCK);
        if !registrar_socket.exists() {
            bail!("registrar socket {registrar_socket:?} is not present");
        }

        let announcement = RegisterRequest {
            version: VERSION.to_string(),
            endpoint: PLUGIN_SOCK.to_string(),
            resource_name: DRIVER_NAME.to_string(),
        };
        let mut kubelet = RegistrationClient::new(self.registrar_channel(registrar_socket).await?);
        kubelet.register(announcement).await?;
        Ok(())
    }

    /// Opens a gRPC channel over the registrar's Unix socket; the URI is a
    /// placeholder the connector never looks at.
    async fn registrar_channel(&self, socket: PathBuf) -> anyhow::Result<Channel> {
        let channel = Endpoint::from_static("http://kubelet")
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(socket.clone())
            }))
            .await?;
        Ok(channel)
    }
}
