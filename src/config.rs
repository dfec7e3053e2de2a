use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

/// Driver name; namespaces the plugin socket and kubelet registration.
pub static DRIVER_NAME: &str = "gpu.intel.com";
/// API group served by the controller.
pub static API_GROUP: &str = "gpu.resource.intel.com";
/// CDI vendor/class pair; device names are `intel.com/gpu=<uid>`.
pub static CDI_VENDOR: &str = "intel.com";
pub static CDI_CLASS: &str = "gpu";
/// Resource handle selecting the telemetry path.
pub static MONITOR_HANDLE: &str = "monitor";

static DEFAULT_SYSFS_ROOT: &str = "/sys";
static DEFAULT_DEV_DRI: &str = "/dev/dri";
static DEFAULT_CDI_ROOT: &str = "/etc/cdi";
static DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/plugins/gpu.intel.com";
static DEFAULT_REGISTRAR_DIR: &str = "/var/lib/kubelet/plugins_registry";
static DEFAULT_NAMESPACE: &str = "default";

/// Name of the journal file inside the plugin directory.
pub static JOURNAL_FILE: &str = "preparedClaims.json";
/// Socket the plugin serves on inside the plugin directory.
pub static PLUGIN_SOCK: &str = "intel-dra.sock";

/// Runtime configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base of the sysfs tree; overridable for tests via `SYSFS_ROOT`.
    pub sysfs_root: PathBuf,
    /// Where DRM device nodes live; overridable via `DEV_DRI_PATH`.
    pub dev_dri_path: PathBuf,
    /// Namespace holding the per-node allocation-state records.
    pub namespace: String,
    /// Name of the local node; required by the node agent.
    pub node_name: String,
    /// CDI spec directory.
    pub cdi_root: PathBuf,
    /// Kubelet plugin directory (socket + journal).
    pub plugin_dir: PathBuf,
    /// Directory of the kubelet's plugin-registration socket.
    pub registrar_dir: PathBuf,
    /// Poll budget for SR-IOV provisioning and dismantling.
    pub provision_attempts: u32,
    pub provision_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            dev_dri_path: PathBuf::from(DEFAULT_DEV_DRI),
            namespace: DEFAULT_NAMESPACE.to_string(),
            node_name: String::new(),
            cdi_root: PathBuf::from(DEFAULT_CDI_ROOT),
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            registrar_dir: PathBuf::from(DEFAULT_REGISTRAR_DIR),
            provision_attempts: 10,
            provision_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut config = Config::default();
        if let Ok(v) = env::var("SYSFS_ROOT") {
            config.sysfs_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("DEV_DRI_PATH") {
            config.dev_dri_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("POD_NAMESPACE") {
            config.namespace = v;
        }
        if let Ok(v) = env::var("NODE_NAME") {
            config.node_name = v;
        }
        if let Ok(v) = env::var("CDI_ROOT") {
            config.cdi_root = PathBuf::from(v);
        }
        config
    }

    /// Node-agent configuration; unlike the controller it must know its node.
    pub fn from_env_for_node() -> anyhow::Result<Config> {
        let config = Config::from_env();
        if config.node_name.is_empty() {
            bail!("NODE_NAME is not set");
        }
        Ok(config)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(PLUGIN_SOCK)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.plugin_dir.join(JOURNAL_FILE)
    }
}
