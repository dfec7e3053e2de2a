//! Typed records of every allocatable device on a node, plus the consumed-map
//! bookkeeping the fitting engine deducts against.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{CDI_CLASS, CDI_VENDOR};

/// Classification of a discovered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Gpu,
    Vf,
    Accel,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceType::Gpu => "gpu",
            DeviceType::Vf => "vf",
            DeviceType::Accel => "accel",
        };
        write!(f, "{}", s)
    }
}

/// One allocatable device. GPU-only fields are zero on VFs and accelerators
/// and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub uid: String,
    pub pci_address: String,
    pub model_id: String,
    pub device_type: DeviceType,
    pub card_idx: u32,
    pub render_idx: u32,
    pub memory_mib: u64,
    /// Compute-share budget; 1000 is a whole device.
    pub millicores: u32,
    /// SR-IOV VF budget; 0 means SR-IOV disabled. GPUs only.
    pub max_vfs: u64,
    pub ecc_on: bool,
    pub tiles: u32,
    /// VF only: uid of the physical function.
    pub parent_uid: String,
    /// VF only: 0-based index in the parent's PCI ordering.
    pub vf_index: u64,
    /// VF only: name of the provisioned profile.
    pub vf_profile: String,
}

/// Flattens a PCI address and model id into an RFC-1123 safe uid,
/// e.g. `0000:03:00.0` + `0x56c0` -> `0000-03-00-0-0x56c0`.
pub fn device_uid(pci_address: &str, model_id: &str) -> String {
    format!(
        "{}-{}",
        pci_address.replace([':', '.'], "-"),
        model_id.to_lowercase()
    )
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        self.device_type == DeviceType::Gpu
    }

    pub fn is_vf(&self) -> bool {
        self.device_type == DeviceType::Vf
    }

    pub fn is_accel(&self) -> bool {
        self.device_type == DeviceType::Accel
    }

    pub fn sriov_enabled(&self) -> bool {
        self.is_gpu() && self.max_vfs > 0
    }

    /// Kernel driver the device is bound to.
    pub fn driver(&self) -> &'static str {
        match self.device_type {
            DeviceType::Accel => "habanalabs",
            _ => "i915",
        }
    }

    /// Fully-qualified CDI device name.
    pub fn cdi_name(&self) -> String {
        format!("{}/{}={}", CDI_VENDOR, CDI_CLASS, self.uid)
    }

    /// Whether the device exposes a render node.
    pub fn has_render_node(&self) -> bool {
        self.render_idx > 0
    }
}

pub type DeviceMap = HashMap<String, Device>;

/// Tentative deductions accumulated while fitting, keyed like the
/// allocatable map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consumed {
    pub memory_mib: u64,
    pub millicores: u32,
    /// VF slots in use on a physical function: planned plus already present.
    pub vfs: u64,
}

impl Consumed {
    pub fn is_zero(&self) -> bool {
        self.memory_mib == 0 && self.millicores == 0 && self.vfs == 0
    }
}

pub type ConsumedMap = HashMap<String, Consumed>;
