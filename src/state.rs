//! The per-node allocation-state record: what is allocatable, what is
//! tainted, what has been requested, committed and prepared. The controller
//! writes the requested/committed maps, the node agent writes allocatable,
//! prepared and the status.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::device::{ConsumedMap, Device, DeviceMap, DeviceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    NotReady,
    Ready,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::NotReady => "not_ready",
            NodeStatus::Ready => "ready",
        };
        write!(f, "{}", s)
    }
}

/// One device held by a claim. For a VF that is planned on a parent but not
/// yet provisioned, `uid` is empty and `parent_uid`/`vf_index`/`profile`
/// identify what to provision; the concrete uid is learned at prepare time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatedDevice {
    pub uid: String,
    pub device_type: DeviceType,
    pub parent_uid: String,
    /// Memory this claim consumes from the device (or from the parent, for a
    /// planned VF).
    pub memory_mib: u64,
    pub millicores: u32,
    pub vf_index: u64,
    pub profile: String,
}

impl AllocatedDevice {
    /// A VF that still has to be provisioned on its parent.
    pub fn needs_provisioning(&self) -> bool {
        self.device_type == DeviceType::Vf && self.uid.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocatedClaim {
    /// UID of the owning workload; empty when the claim has no owner.
    pub owner: String,
    pub devices: Vec<AllocatedDevice>,
}

/// Map of taint reasons per device uid; a device is schedulable only when its
/// reason set is empty or absent.
pub type TaintMap = HashMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationState {
    pub status: NodeStatus,
    pub allocatable: DeviceMap,
    pub tainted: TaintMap,
    pub requested: HashMap<String, AllocatedClaim>,
    pub committed: HashMap<String, AllocatedClaim>,
    pub prepared: HashMap<String, Vec<AllocatedDevice>>,
}

impl AllocationState {
    pub fn is_tainted(&self, uid: &str) -> bool {
        self.tainted.get(uid).map_or(false, |r| !r.is_empty())
    }

    /// Rebuilds the consumed map from the requested and committed claims and
    /// from the VFs already present in the catalog. Always derived, never
    /// stored, so no drift can accumulate.
    pub fn consumed(&self) -> ConsumedMap {
        let mut consumed = ConsumedMap::new();

        // Physical VFs occupy a slot on their parent whether or not a claim
        // holds them yet.
        for dev in self.allocatable.values() {
            if dev.device_type == DeviceType::Vf && !dev.parent_uid.is_empty() {
                consumed.entry(dev.parent_uid.clone()).or_default().vfs += 1;
            }
        }

        for claim in self.requested.values().chain(self.committed.values()) {
            add_claim_consumption(&mut consumed, claim);
        }
        consumed
    }

    /// Owner of the VFs held on a physical function, from requested and
    /// committed claims. `None` when no claim holds a VF of that parent.
    /// An empty string is a real value: a claim without an owner.
    pub fn vf_owner(&self, parent_uid: &str) -> Option<String> {
        for claim in self.requested.values().chain(self.committed.values()) {
            for dev in &claim.devices {
                if dev.device_type != DeviceType::Vf {
                    continue;
                }
                let parent = if dev.parent_uid.is_empty() {
                    self.allocatable
                        .get(&dev.uid)
                        .map(|d| d.parent_uid.clone())
                        .unwrap_or_default()
                } else {
                    dev.parent_uid.clone()
                };
                if parent == parent_uid {
                    return Some(claim.owner.clone());
                }
            }
        }
        None
    }

    /// Committed claims (other than `except`) that hold a VF of the parent.
    pub fn committed_vf_claims_on(&self, parent_uid: &str, except: &str) -> Vec<String> {
        let mut uids = Vec::new();
        for (claim_uid, claim) in &self.committed {
            if claim_uid == except {
                continue;
            }
            let holds = claim.devices.iter().any(|d| {
                d.device_type == DeviceType::Vf
                    && (d.parent_uid == parent_uid
                        || self
                            .allocatable
                            .get(&d.uid)
                            .map_or(false, |v| v.parent_uid == parent_uid))
            });
            if holds {
                uids.push(claim_uid.clone());
            }
        }
        uids.sort();
        uids
    }

    /// Devices of the catalog that are schedulable at all: present and not
    /// tainted.
    pub fn untainted(&self) -> DeviceMap {
        self.allocatable
            .iter()
            .filter(|(uid, _)| !self.is_tainted(uid))
            .map(|(uid, dev)| (uid.clone(), dev.clone()))
            .collect()
    }
}

fn add_claim_consumption(consumed: &mut ConsumedMap, claim: &AllocatedClaim) {
    for dev in &claim.devices {
        if dev.needs_provisioning() {
            // A planned VF eats into its parent's budget.
            let entry = consumed.entry(dev.parent_uid.clone()).or_default();
            entry.vfs += 1;
            entry.memory_mib += dev.memory_mib;
            entry.millicores += dev.millicores;
        } else if !dev.uid.is_empty() {
            let entry = consumed.entry(dev.uid.clone()).or_default();
            entry.memory_mib += dev.memory_mib;
            entry.millicores += dev.millicores;
        }
    }
}

/// Helper used by tests and debug assertions: the invariants of a state
/// record that must hold after every operation.
pub fn check_invariants(state: &AllocationState) -> Result<(), String> {
    for (claim_uid, claim) in &state.committed {
        for dev in &claim.devices {
            if dev.needs_provisioning() {
                let parent = state.allocatable.get(&dev.parent_uid).ok_or(format!(
                    "claim {claim_uid}: parent {} not allocatable",
                    dev.parent_uid
                ))?;
                if parent.max_vfs == 0 {
                    return Err(format!(
                        "claim {claim_uid}: parent {} has SR-IOV disabled",
                        dev.parent_uid
                    ));
                }
            } else if !state.allocatable.contains_key(&dev.uid) {
                return Err(format!("claim {claim_uid}: device {} unknown", dev.uid));
            }
        }
    }

    let consumed = state.consumed();
    for (uid, used) in &consumed {
        if let Some(dev) = state.allocatable.get(uid) {
            if used.memory_mib > dev.memory_mib {
                return Err(format!("device {uid}: memory over-committed"));
            }
            if used.millicores > 1000 {
                return Err(format!("device {uid}: millicores over-committed"));
            }
            if dev.is_gpu() && used.vfs > dev.max_vfs {
                return Err(format!("device {uid}: VF slots over-committed"));
            }
        }
    }

    // Single-owner rule per physical function.
    let mut owners: HashMap<String, String> = HashMap::new();
    for claim in state.committed.values() {
        for dev in &claim.devices {
            if dev.device_type != DeviceType::Vf {
                continue;
            }
            let parent = if dev.parent_uid.is_empty() {
                match state.allocatable.get(&dev.uid) {
                    Some(v) => v.parent_uid.clone(),
                    None => continue,
                }
            } else {
                dev.parent_uid.clone()
            };
            if claim.owner.is_empty() {
                continue;
            }
            match owners.get(&parent) {
                Some(existing) if *existing != claim.owner => {
                    return Err(format!("parent {parent}: VFs from two owners"));
                }
                _ => {
                    owners.insert(parent, claim.owner.clone());
                }
            }
        }
    }
    Ok(())
}

/// Converts a discovered device into the claim-side record of an exclusive
/// hold on it: the device's whole memory and compute budget.
pub fn exclusive_hold(dev: &Device) -> AllocatedDevice {
    AllocatedDevice {
        uid: dev.uid.clone(),
        device_type: dev.device_type,
        parent_uid: dev.parent_uid.clone(),
        memory_mib: dev.memory_mib,
        millicores: dev.millicores,
        vf_index: dev.vf_index,
        profile: dev.vf_profile.clone(),
    }
}
