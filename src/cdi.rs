//! CDI registry reconciliation: keeps the vendor's CDI specs in sync with
//! the discovered catalog so the container runtime always resolves device
//! names to live device nodes. Spec files are written atomically (tempfile
//! plus rename) and with sorted device lists, so rewriting an unchanged spec
//! is byte-identical.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CDI_CLASS, CDI_VENDOR};
use crate::device::{Device, DeviceMap};
use crate::error::{DriverError, Result};

/// Plain device-node edits need 0.5.0; explicit host paths need 0.6.0.
static BASE_VERSION: &str = "0.5.0";
static HOST_PATH_VERSION: &str = "0.6.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    pub devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    /// The allocatable device uid.
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

pub struct CdiRegistry {
    root: PathBuf,
    dev_dri: PathBuf,
}

impl CdiRegistry {
    pub fn new(root: PathBuf, dev_dri: PathBuf) -> Self {
        CdiRegistry { root, dev_dri }
    }

    pub fn vendor_kind() -> String {
        format!("{CDI_VENDOR}/{CDI_CLASS}")
    }

    /// Stable filename derived from the vendor spec.
    fn default_spec_path(&self) -> PathBuf {
        self.root.join(format!("{CDI_VENDOR}-{CDI_CLASS}.json"))
    }

    fn spec_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(false, |e| e == "json") {
                    paths.push(path);
                }
            }
        }
        paths.sort();
        paths
    }

    fn load(path: &Path) -> Result<CdiSpec> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The device nodes a container must receive for this device. Host paths
    /// are only spelled out when the node lives outside `/dev/dri`.
    fn device_nodes(&self, dev: &Device) -> Vec<DeviceNode> {
        let default_root = Path::new("/dev/dri");
        let host_path = |name: &str| {
            if self.dev_dri == default_root {
                None
            } else {
                Some(self.dev_dri.join(name).to_string_lossy().into_owned())
            }
        };
        let mut nodes = vec![DeviceNode {
            path: format!("/dev/dri/card{}", dev.card_idx),
            host_path: host_path(&format!("card{}", dev.card_idx)),
        }];
        if dev.has_render_node() {
            nodes.push(DeviceNode {
                path: format!("/dev/dri/renderD{}", dev.render_idx),
                host_path: host_path(&format!("renderD{}", dev.render_idx)),
            });
        }
        nodes
    }

    /// One reconciliation pass: refresh device-node paths of known uids,
    /// delete records of vanished uids when `cleanup` is set, and append
    /// records for catalog devices no spec mentions yet.
    pub fn sync(&self, catalog: &DeviceMap, cleanup: bool) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let mut to_add: BTreeSet<String> = catalog.keys().cloned().collect();
        let mut first_vendor_spec: Option<PathBuf> = None;

        for path in self.spec_paths() {
            let mut spec = Self::load(&path)?;
            if spec.kind != Self::vendor_kind() {
                continue;
            }
            first_vendor_spec.get_or_insert_with(|| path.clone());

            let mut changed = false;
            spec.devices.retain_mut(|record| {
                match catalog.get(&record.name) {
                    Some(dev) => {
                        let nodes = self.device_nodes(dev);
                        if record.container_edits.device_nodes != nodes {
                            record.container_edits.device_nodes = nodes;
                            changed = true;
                        }
                        to_add.remove(&record.name);
                        true
                    }
                    None if cleanup => {
                        changed = true;
                        false
                    }
                    None => true,
                }
            });
            if changed {
                self.write_spec(&path, spec)?;
            }
        }

        if to_add.is_empty() {
            return Ok(());
        }

        let path = first_vendor_spec.unwrap_or_else(|| self.default_spec_path());
        let mut spec = if path.exists() {
            Self::load(&path)?
        } else {
            CdiSpec {
                cdi_version: BASE_VERSION.to_string(),
                kind: Self::vendor_kind(),
                devices: Vec::new(),
            }
        };
        for uid in to_add {
            let dev = catalog
                .get(&uid)
                .ok_or_else(|| DriverError::internal("catalog changed during CDI sync"))?;
            spec.devices.push(CdiDevice {
                name: uid,
                container_edits: ContainerEdits {
                    device_nodes: self.device_nodes(dev),
                },
            });
        }
        self.write_spec(&path, spec)
    }

    /// Deletes the records of the given uids from every vendor spec.
    pub fn prune(&self, uids: &[String]) -> Result<()> {
        for path in self.spec_paths() {
            let mut spec = Self::load(&path)?;
            if spec.kind != Self::vendor_kind() {
                continue;
            }
            let before = spec.devices.len();
            spec.devices.retain(|d| !uids.contains(&d.name));
            if spec.devices.len() != before {
                debug!(path = %path.display(), removed = before - spec.devices.len(), "pruned CDI records");
                self.write_spec(&path, spec)?;
            }
        }
        Ok(())
    }

    /// Uids currently present in the vendor specs.
    pub fn registered_uids(&self) -> Result<BTreeSet<String>> {
        let mut uids = BTreeSet::new();
        for path in self.spec_paths() {
            let spec = Self::load(&path)?;
            if spec.kind != Self::vendor_kind() {
                continue;
            }
            uids.extend(spec.devices.into_iter().map(|d| d.name));
        }
        Ok(uids)
    }

    fn write_spec(&self, path: &Path, mut spec: CdiSpec) -> Result<()> {
        spec.devices.sort_by(|a, b| a.name.cmp(&b.name));

        let required = minimum_required_version(&spec);
        if version_lt(&spec.cdi_version, required) {
            spec.cdi_version = required.to_string();
        }

        let mut bytes = serde_json::to_vec_pretty(&spec)?;
        bytes.push(b'\n');
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), devices = spec.devices.len(), "CDI spec written");
        Ok(())
    }
}

/// The lowest CDI version whose features the spec actually uses.
fn minimum_required_version(spec: &CdiSpec) -> &'static str {
    let uses_host_path = spec.devices.iter().any(|d| {
        d.container_edits
            .device_nodes
            .iter()
            .any(|n| n.host_path.is_some())
    });
    if uses_host_path {
        HOST_PATH_VERSION
    } else {
        BASE_VERSION
    }
}

fn version_lt(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> (u32, u32, u32) {
        let mut parts = v.split('.').map(|p| p.parse().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    };
    parse(a) < parse(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{device_uid, DeviceType};

    fn gpu(addr: &str, card: u32, render: u32) -> Device {
        Device {
            uid: device_uid(addr, "0x56c0"),
            pci_address: addr.to_string(),
            model_id: "0x56c0".to_string(),
            device_type: DeviceType::Gpu,
            card_idx: card,
            render_idx: render,
            memory_mib: 14248,
            millicores: 1000,
            max_vfs: 16,
            tiles: 1,
            ..Default::default()
        }
    }

    fn catalog(devices: &[Device]) -> DeviceMap {
        devices.iter().map(|d| (d.uid.clone(), d.clone())).collect()
    }

    fn registry(root: &Path) -> CdiRegistry {
        CdiRegistry::new(root.to_path_buf(), PathBuf::from("/dev/dri"))
    }

    #[test]
    fn sync_creates_records_for_every_device() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let devs = [gpu("0000:01:00.0", 0, 128), gpu("0000:02:00.0", 1, 129)];
        reg.sync(&catalog(&devs), false).unwrap();

        let uids = reg.registered_uids().unwrap();
        assert_eq!(uids.len(), 2);
        for dev in &devs {
            assert!(uids.contains(&dev.uid));
        }

        let spec = CdiRegistry::load(&tmp.path().join("intel.com-gpu.json")).unwrap();
        assert_eq!(spec.cdi_version, BASE_VERSION);
        assert_eq!(spec.kind, "intel.com/gpu");
        let record = &spec.devices[0];
        assert_eq!(
            record.container_edits.device_nodes[0].path,
            "/dev/dri/card0"
        );
        assert_eq!(
            record.container_edits.device_nodes[1].path,
            "/dev/dri/renderD128"
        );
    }

    #[test]
    fn sync_updates_stale_node_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let mut dev = gpu("0000:01:00.0", 0, 128);
        reg.sync(&catalog(&[dev.clone()]), false).unwrap();

        // The card index moved after a reset.
        dev.card_idx = 2;
        dev.render_idx = 130;
        reg.sync(&catalog(&[dev.clone()]), false).unwrap();

        let spec = CdiRegistry::load(&tmp.path().join("intel.com-gpu.json")).unwrap();
        assert_eq!(
            spec.devices[0].container_edits.device_nodes[0].path,
            "/dev/dri/card2"
        );
    }

    #[test]
    fn cleanup_removes_vanished_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let keep = gpu("0000:01:00.0", 0, 128);
        let vanish = gpu("0000:02:00.0", 1, 129);
        reg.sync(&catalog(&[keep.clone(), vanish]), false).unwrap();

        reg.sync(&catalog(&[keep.clone()]), true).unwrap();
        let uids = reg.registered_uids().unwrap();
        assert_eq!(uids.len(), 1);
        assert!(uids.contains(&keep.uid));
    }

    #[test]
    fn without_cleanup_unknown_records_survive() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let a = gpu("0000:01:00.0", 0, 128);
        let b = gpu("0000:02:00.0", 1, 129);
        reg.sync(&catalog(&[a.clone(), b.clone()]), false).unwrap();
        reg.sync(&catalog(&[a]), false).unwrap();
        assert_eq!(reg.registered_uids().unwrap().len(), 2);
    }

    #[test]
    fn prune_targets_only_named_uids() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let a = gpu("0000:01:00.0", 0, 128);
        let b = gpu("0000:02:00.0", 1, 129);
        reg.sync(&catalog(&[a.clone(), b.clone()]), false).unwrap();

        reg.prune(&[b.uid.clone()]).unwrap();
        let uids = reg.registered_uids().unwrap();
        assert!(uids.contains(&a.uid));
        assert!(!uids.contains(&b.uid));
    }

    #[test]
    fn rewrite_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        let devs = [gpu("0000:01:00.0", 0, 128), gpu("0000:02:00.0", 1, 129)];
        reg.sync(&catalog(&devs), false).unwrap();

        let path = tmp.path().join("intel.com-gpu.json");
        let before = fs::read(&path).unwrap();
        let spec = CdiRegistry::load(&path).unwrap();
        reg.write_spec(&path, spec).unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
        // No leftover temp file from the atomic write.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn overridden_dev_dri_bumps_the_version() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = CdiRegistry::new(tmp.path().to_path_buf(), tmp.path().join("dri"));
        reg.sync(&catalog(&[gpu("0000:01:00.0", 0, 128)]), false)
            .unwrap();
        let spec = CdiRegistry::load(&tmp.path().join("intel.com-gpu.json")).unwrap();
        assert_eq!(spec.cdi_version, HOST_PATH_VERSION);
        assert!(spec.devices[0].container_edits.device_nodes[0]
            .host_path
            .is_some());
    }

    #[test]
    fn foreign_vendor_specs_are_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let foreign = CdiSpec {
            cdi_version: BASE_VERSION.to_string(),
            kind: "other.example/thing".to_string(),
            devices: vec![CdiDevice {
                name: "foreign-dev".to_string(),
                container_edits: ContainerEdits::default(),
            }],
        };
        let path = tmp.path().join("aaa-other.json");
        fs::write(&path, serde_json::to_vec_pretty(&foreign).unwrap()).unwrap();

        let reg = registry(tmp.path());
        reg.sync(&catalog(&[gpu("0000:01:00.0", 0, 128)]), true)
            .unwrap();
        reg.prune(&["foreign-dev".to_string()]).unwrap();

        let kept = CdiRegistry::load(&path).unwrap();
        assert_eq!(kept.devices.len(), 1);
    }
}
