//! Local device discovery: walks the driver-bound PCI entries under sysfs,
//! classifies physical GPUs, SR-IOV virtual functions and Gaudi accelerators,
//! and derives per-device capacity. Pure read path; never mutates sysfs.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::device::{device_uid, Device, DeviceMap, DeviceType};
use crate::error::Result;
use crate::profiles::{self, GpuModel, FAIR_SHARE_PROFILE};

/// Kernel drivers whose bound devices this driver manages.
static DRIVERS: &[&str] = &["i915", "habanalabs"];

pub fn discover(sysfs_root: &Path) -> Result<DeviceMap> {
    let mut catalog = DeviceMap::new();
    for driver in DRIVERS {
        scan_driver(sysfs_root, driver, &mut catalog);
    }
    debug!(devices = catalog.len(), "discovery pass finished");
    Ok(catalog)
}

fn scan_driver(sysfs_root: &Path, driver: &str, catalog: &mut DeviceMap) {
    let driver_dir = sysfs_root.join("bus/pci/drivers").join(driver);
    let entries = match fs::read_dir(&driver_dir) {
        Ok(entries) => entries,
        // A node without the driver simply contributes nothing.
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if !is_pci_address(&name) {
            continue;
        }
        match read_device(&driver_dir, &name, driver) {
            Ok(Some(device)) => {
                catalog.insert(device.uid.clone(), device);
            }
            Ok(None) => {}
            Err(e) => warn!(address = %name, driver, error = %e, "skipping unreadable device"),
        }
    }
}

/// `dddd:bb:dd.f` with hex components.
fn is_pci_address(name: &str) -> bool {
    let parts: Vec<&str> = name.split(':').collect();
    if parts.len() != 3 {
        return false;
    }
    let (slot, func) = match parts[2].split_once('.') {
        Some(pair) => pair,
        None => return false,
    };
    parts[0].len() == 4
        && !parts[1].is_empty()
        && !slot.is_empty()
        && !func.is_empty()
        && parts[0].chars().all(|c| c.is_ascii_hexdigit())
        && parts[1].chars().all(|c| c.is_ascii_hexdigit())
        && slot.chars().all(|c| c.is_ascii_hexdigit())
        && func.chars().all(|c| c.is_ascii_hexdigit())
}

fn read_device(driver_dir: &Path, address: &str, driver: &str) -> Result<Option<Device>> {
    let dev_dir = driver_dir.join(address);
    let model_id = read_trimmed(&dev_dir.join("device"))?.to_lowercase();
    let model = match profiles::model_for_device_id(&model_id) {
        Some(model) => model,
        None => {
            warn!(address, model_id, "unrecognized device id");
            return Ok(None);
        }
    };

    if driver == "habanalabs" {
        return Ok(Some(Device {
            uid: device_uid(address, &model_id),
            pci_address: address.to_string(),
            model_id,
            device_type: DeviceType::Accel,
            memory_mib: model.memory_mib,
            millicores: 1000,
            tiles: 1,
            ..Default::default()
        }));
    }

    let is_vf = dev_dir.join("physfn").exists();
    let (card_idx, render_idx) = drm_indices(&dev_dir);
    let tiles = tile_count(&dev_dir);
    let memory_mib = local_memory_mib(&dev_dir).unwrap_or(model.memory_mib);

    if is_vf {
        return read_vf(&dev_dir, address, &model_id, model, card_idx, render_idx, memory_mib)
            .map(Some);
    }

    let max_vfs = read_u64(&dev_dir.join("sriov_totalvfs")).unwrap_or(0);
    let ecc_on = !model.profiles.is_empty() && memory_mib < model.max_single_vf_memory();

    Ok(Some(Device {
        uid: device_uid(address, &model_id),
        pci_address: address.to_string(),
        model_id,
        device_type: DeviceType::Gpu,
        card_idx,
        render_idx,
        memory_mib,
        millicores: 1000,
        max_vfs,
        ecc_on,
        tiles,
        ..Default::default()
    }))
}

fn read_vf(
    dev_dir: &Path,
    address: &str,
    model_id: &str,
    model: &'static GpuModel,
    card_idx: u32,
    render_idx: u32,
    memory_mib: u64,
) -> Result<Device> {
    let parent_address = link_basename(&dev_dir.join("physfn"))
        .ok_or_else(|| crate::error::DriverError::internal("physfn link unreadable"))?;
    let parent_dir = dev_dir
        .parent()
        .map(|d| d.join(&parent_address))
        .unwrap_or_default();
    let parent_uid = device_uid(&parent_address, model_id);
    let vf_index = vf_index_on_parent(&parent_dir, address).unwrap_or(0);

    let parent_memory = local_memory_mib(&parent_dir).unwrap_or(model.memory_mib);
    let parent_ecc = !model.profiles.is_empty() && parent_memory < model.max_single_vf_memory();

    // A parent left in auto-provisioning mode splits the compute share evenly
    // over however many VFs exist right now; a preconfigured parent maps the
    // VF's memory quota back to the profile it was cut from.
    let auto = read_trimmed(&parent_dir.join("prelim_iov/pf/auto_provisioning"))
        .map(|v| v == "1")
        .unwrap_or(true);
    let (profile_name, millicores) = if auto {
        let numvfs = read_u64(&parent_dir.join("sriov_numvfs")).unwrap_or(1).max(1);
        (FAIR_SHARE_PROFILE.to_string(), (1000 / numvfs) as u32)
    } else {
        match model.profile_for_vf_memory(memory_mib, parent_ecc) {
            Some(profile) => (profile.name.to_string(), profile.millicores()),
            None => {
                let numvfs = read_u64(&parent_dir.join("sriov_numvfs")).unwrap_or(1).max(1);
                (FAIR_SHARE_PROFILE.to_string(), (1000 / numvfs) as u32)
            }
        }
    };

    Ok(Device {
        uid: device_uid(address, model_id),
        pci_address: address.to_string(),
        model_id: model_id.to_string(),
        device_type: DeviceType::Vf,
        card_idx,
        render_idx,
        memory_mib,
        millicores,
        tiles: 1,
        parent_uid,
        vf_index,
        vf_profile: profile_name,
        ..Default::default()
    })
}

/// Matches the parent's `virtfn<N>` links against the VF's address; N is the
/// VF's 0-based index in PCI ordering.
fn vf_index_on_parent(parent_dir: &Path, vf_address: &str) -> Option<u64> {
    let entries = fs::read_dir(parent_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().into_string().ok()?;
        if let Some(index) = name.strip_prefix("virtfn") {
            if link_basename(&entry.path()).as_deref() == Some(vf_address) {
                return index.parse().ok();
            }
        }
    }
    None
}

fn drm_indices(dev_dir: &Path) -> (u32, u32) {
    let mut card = 0;
    let mut render = 0;
    if let Ok(entries) = fs::read_dir(dev_dir.join("drm")) {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                if let Some(n) = name.strip_prefix("renderD") {
                    render = n.parse().unwrap_or(0);
                } else if let Some(n) = name.strip_prefix("card") {
                    card = n.parse().unwrap_or(0);
                }
            }
        }
    }
    (card, render)
}

/// Tiled devices expose one `gt/gt<T>` directory per tile.
fn tile_count(dev_dir: &Path) -> u32 {
    let mut tiles = 0;
    if let Ok(entries) = fs::read_dir(dev_dir.join("gt")) {
        for entry in entries.flatten() {
            if let Ok(name) = entry.file_name().into_string() {
                if name.strip_prefix("gt").map_or(false, |n| n.parse::<u32>().is_ok()) {
                    tiles += 1;
                }
            }
        }
    }
    tiles.max(1)
}

/// Local memory in MiB, summed over tiles when the device is tiled.
fn local_memory_mib(dev_dir: &Path) -> Option<u64> {
    let mut total_bytes = 0u64;
    let mut found = false;
    if let Ok(entries) = fs::read_dir(dev_dir.join("gt")) {
        for entry in entries.flatten() {
            if let Ok(bytes) = read_u64(&entry.path().join("lmem_total_bytes")) {
                total_bytes += bytes;
                found = true;
            }
        }
    }
    if !found {
        total_bytes = read_u64(&dev_dir.join("lmem_total_bytes")).ok()?;
    }
    Some(total_bytes / (1024 * 1024))
}

fn link_basename(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;
    target.file_name()?.to_str().map(str::to_string)
}

fn read_trimmed(path: &Path) -> std::io::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

fn read_u64(path: &Path) -> Result<u64> {
    let text = read_trimmed(path)?;
    text.parse::<u64>()
        .map_err(|e| crate::error::DriverError::internal(format!("{}: {e}", path.display())))
}
