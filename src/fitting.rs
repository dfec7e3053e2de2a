//! The device-fitting engine. For a batch of claims it either returns a
//! placement for every claim on the node or fails with insufficient
//! resources; partial placements are never returned. The engine works on
//! copies of the allocatable/consumed maps, so a failed fit leaves no side
//! effect on the caller.

use std::collections::HashMap;

use crate::api::{ClaimParameters, GpuClaimParameters, Policy, PolicyKind, PolicyResource};
use crate::device::{Consumed, ConsumedMap, Device, DeviceMap, DeviceType};
use crate::error::{DriverError, Result};
use crate::profiles::{self, VfProfile};
use crate::state::{exclusive_hold, AllocatedClaim, AllocatedDevice, TaintMap};

/// One claim in a fitting batch.
#[derive(Debug, Clone)]
pub struct FitClaim {
    pub claim_uid: String,
    /// UID of the owning workload; empty when none. Gates VF co-tenancy.
    pub owner: String,
    pub params: ClaimParameters,
}

/// Computes a placement for every claim in the batch or fails. Claims whose
/// uid is already committed reuse the prior decision verbatim. `consumed`
/// must reflect the requested and committed claims of the node (see
/// `AllocationState::consumed`); VF slots already occupied in the catalog are
/// re-derived here as a floor.
pub fn fit(
    claims: &[FitClaim],
    allocatable: &DeviceMap,
    consumed: &ConsumedMap,
    committed: &HashMap<String, AllocatedClaim>,
    tainted: &TaintMap,
    policy: Policy,
) -> Result<HashMap<String, Vec<AllocatedDevice>>> {
    let mut engine = Engine::new(allocatable, consumed, committed, tainted, policy);
    let mut placements = HashMap::with_capacity(claims.len());

    // VF claims are handled first so a VF that consumes a parent removes the
    // parent from GPU candidacy for later claims in the batch.
    let ordered = claims
        .iter()
        .filter(|c| c.params.wants_vf())
        .chain(claims.iter().filter(|c| !c.params.wants_vf()));

    for claim in ordered {
        if let Some(prior) = committed.get(&claim.claim_uid) {
            // The prior decision wins over recomputation.
            placements.insert(claim.claim_uid.clone(), prior.devices.clone());
            continue;
        }
        let devices = engine.place(claim)?;
        placements.insert(claim.claim_uid.clone(), devices);
    }
    Ok(placements)
}

struct Engine {
    devices: DeviceMap,
    consumed: ConsumedMap,
    /// Parent uid -> owner of the VFs held on it.
    owners: HashMap<String, String>,
    policy: Policy,
}

impl Engine {
    fn new(
        allocatable: &DeviceMap,
        consumed: &ConsumedMap,
        committed: &HashMap<String, AllocatedClaim>,
        tainted: &TaintMap,
        policy: Policy,
    ) -> Self {
        let tainted_uid =
            |uid: &str| tainted.get(uid).map_or(false, |reasons| !reasons.is_empty());
        let devices: DeviceMap = allocatable
            .iter()
            .filter(|(uid, _)| !tainted_uid(uid))
            .map(|(uid, dev)| (uid.clone(), dev.clone()))
            .collect();

        let mut consumed = consumed.clone();

        // The catalog itself is a floor for VF slot usage on each parent.
        let mut catalog_vfs: HashMap<String, u64> = HashMap::new();
        for dev in devices.values() {
            if dev.is_vf() && !dev.parent_uid.is_empty() {
                *catalog_vfs.entry(dev.parent_uid.clone()).or_default() += 1;
            }
        }
        for (parent, count) in catalog_vfs {
            let entry = consumed.entry(parent).or_default();
            entry.vfs = entry.vfs.max(count);
        }

        let mut owners: HashMap<String, String> = HashMap::new();
        for claim in committed.values() {
            for dev in &claim.devices {
                if dev.device_type != DeviceType::Vf {
                    continue;
                }
                let parent = if !dev.parent_uid.is_empty() {
                    dev.parent_uid.clone()
                } else {
                    match devices.get(&dev.uid) {
                        Some(vf) => vf.parent_uid.clone(),
                        None => continue,
                    }
                };
                let slot = owners.entry(parent).or_default();
                if slot.is_empty() {
                    *slot = claim.owner.clone();
                }
            }
        }

        Engine {
            devices,
            consumed,
            owners,
            policy,
        }
    }

    fn place(&mut self, claim: &FitClaim) -> Result<Vec<AllocatedDevice>> {
        match &claim.params {
            ClaimParameters::Monitor => Err(DriverError::validation(
                "monitor claims are not subject to fitting",
            )),
            ClaimParameters::Accel(p) => self.place_accels(p.count),
            ClaimParameters::Gpu(p) => {
                let mut out = Vec::with_capacity(p.count as usize);
                for _ in 0..p.count {
                    let dev = match p.request_type {
                        crate::api::RequestType::Gpu => self.place_gpu(p)?,
                        crate::api::RequestType::Vf => self.place_vf(&claim.owner, p)?,
                        crate::api::RequestType::Any => self.place_any(&claim.owner, p)?,
                    };
                    out.push(dev);
                }
                Ok(out)
            }
        }
    }

    fn used(&self, uid: &str) -> Consumed {
        self.consumed.get(uid).cloned().unwrap_or_default()
    }

    fn remaining(&self, dev: &Device, resource: PolicyResource) -> u64 {
        let used = self.used(&dev.uid);
        match resource {
            PolicyResource::Memory => dev.memory_mib.saturating_sub(used.memory_mib),
            PolicyResource::Millicores => {
                (dev.millicores.saturating_sub(used.millicores)) as u64
            }
        }
    }

    /// Per-device fit predicate for shareable and exclusive requests. Zero
    /// requested memory or millicores disables the respective check.
    fn request_fits(&self, dev: &Device, p: &GpuClaimParameters) -> bool {
        let used = self.used(&dev.uid);
        if !p.shared {
            return used.is_zero();
        }
        if p.memory_mib > 0 && dev.memory_mib.saturating_sub(used.memory_mib) < p.memory_mib {
            return false;
        }
        if p.millicores > 0 && dev.millicores.saturating_sub(used.millicores) < p.millicores {
            return false;
        }
        true
    }

    fn owner_allows(&self, parent_uid: &str, owner: &str) -> bool {
        match self.owners.get(parent_uid) {
            None => true,
            Some(existing) => existing.is_empty() || owner.is_empty() || existing == owner,
        }
    }

    /// Deterministic choice among equally feasible devices: "none" takes uid
    /// order, "packed" the least remaining capacity of the policy resource,
    /// "balanced" the most; ties fall through to the secondary resource and
    /// then to the uid.
    fn pick_by_policy(&self, mut candidates: Vec<String>) -> Option<String> {
        candidates.sort();
        match self.policy.kind {
            PolicyKind::None => candidates.into_iter().next(),
            PolicyKind::Packed => self.pick_extreme(candidates, false),
            PolicyKind::Balanced => self.pick_extreme(candidates, true),
        }
    }

    fn pick_extreme(&self, candidates: Vec<String>, largest: bool) -> Option<String> {
        let primary = self.policy.resource;
        let secondary = primary.secondary();
        let mut best: Option<(u64, u64, String)> = None;
        for uid in candidates {
            let dev = match self.devices.get(&uid) {
                Some(d) => d,
                None => continue,
            };
            let key = (self.remaining(dev, primary), self.remaining(dev, secondary));
            let better = match &best {
                None => true,
                Some((bp, bs, _)) => {
                    // Strict comparison keeps the lexicographically first uid
                    // on ties because candidates arrive sorted.
                    if largest {
                        key > (*bp, *bs)
                    } else {
                        key < (*bp, *bs)
                    }
                }
            };
            if better {
                best = Some((key.0, key.1, uid));
            }
        }
        best.map(|(_, _, uid)| uid)
    }

    fn place_accels(&mut self, count: u64) -> Result<Vec<AllocatedDevice>> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut candidates: Vec<String> = self
                .devices
                .values()
                .filter(|d| d.is_accel() && self.used(&d.uid).is_zero())
                .map(|d| d.uid.clone())
                .collect();
            candidates.sort();
            let uid = candidates.into_iter().next().ok_or_else(|| {
                DriverError::insufficient("not enough free accelerator devices")
            })?;
            let dev = self
                .devices
                .get(&uid)
                .cloned()
                .ok_or_else(|| DriverError::internal("candidate vanished from working set"))?;
            let used = self.consumed.entry(uid).or_default();
            used.memory_mib += dev.memory_mib;
            used.millicores += 1000;
            out.push(exclusive_hold(&dev));
        }
        Ok(out)
    }

    fn place_gpu(&mut self, p: &GpuClaimParameters) -> Result<AllocatedDevice> {
        let candidates: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.is_gpu() && self.used(&d.uid).vfs == 0 && self.request_fits(d, p))
            .map(|d| d.uid.clone())
            .collect();
        let uid = self
            .pick_by_policy(candidates)
            .ok_or_else(|| DriverError::insufficient("no GPU fits the request"))?;
        self.consume_device(&uid, p)
    }

    fn consume_device(&mut self, uid: &str, p: &GpuClaimParameters) -> Result<AllocatedDevice> {
        let dev = self
            .devices
            .get(uid)
            .cloned()
            .ok_or_else(|| DriverError::internal("candidate vanished from working set"))?;
        let used = self.consumed.entry(uid.to_string()).or_default();
        if p.shared {
            used.memory_mib += p.memory_mib;
            used.millicores += p.millicores;
            Ok(AllocatedDevice {
                uid: dev.uid.clone(),
                device_type: dev.device_type,
                parent_uid: dev.parent_uid.clone(),
                memory_mib: p.memory_mib,
                millicores: p.millicores,
                vf_index: dev.vf_index,
                profile: dev.vf_profile.clone(),
            })
        } else {
            used.memory_mib += dev.memory_mib;
            used.millicores += dev.millicores;
            Ok(exclusive_hold(&dev))
        }
    }

    /// VF placement: the smallest existing VF that fits wins; otherwise a
    /// parent with free VF slots and compatible tenancy hosts a new VF of the
    /// derived profile.
    fn place_vf(&mut self, owner: &str, p: &GpuClaimParameters) -> Result<AllocatedDevice> {
        if let Some(uid) = self.pick_existing_vf(owner, p) {
            return self.take_existing_vf(&uid, owner);
        }
        self.plan_new_vf(owner, p)
    }

    fn pick_existing_vf(&self, owner: &str, p: &GpuClaimParameters) -> Option<String> {
        let mut candidates: Vec<(u64, String)> = self
            .devices
            .values()
            .filter(|d| {
                d.is_vf()
                    && self.used(&d.uid).is_zero()
                    && self.owner_allows(&d.parent_uid, owner)
                    && (p.memory_mib == 0 || d.memory_mib >= p.memory_mib)
                    && (p.millicores == 0 || d.millicores >= p.millicores)
            })
            .map(|d| (d.memory_mib, d.uid.clone()))
            .collect();
        candidates.sort();
        candidates.into_iter().next().map(|(_, uid)| uid)
    }

    fn take_existing_vf(&mut self, uid: &str, owner: &str) -> Result<AllocatedDevice> {
        let dev = self
            .devices
            .remove(uid)
            .ok_or_else(|| DriverError::internal("candidate vanished from working set"))?;
        // Existing VFs are held whole; drop them from both maps so no later
        // request in the batch can see them.
        self.consumed.remove(uid);
        self.owners
            .entry(dev.parent_uid.clone())
            .or_insert_with(|| owner.to_string());
        Ok(exclusive_hold(&dev))
    }

    fn plan_new_vf(&mut self, owner: &str, p: &GpuClaimParameters) -> Result<AllocatedDevice> {
        let mut parents: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.sriov_enabled() && self.owner_allows(&d.uid, owner))
            .map(|d| d.uid.clone())
            .collect();
        parents.sort();

        for uid in parents {
            let dev = match self.devices.get(&uid) {
                Some(d) => d.clone(),
                None => continue,
            };
            let model = match profiles::model_for_device_id(&dev.model_id) {
                Some(m) => m,
                None => continue,
            };
            let profile: &VfProfile = match if p.memory_mib > 0 {
                model.smallest_profile_with_memory(p.memory_mib, dev.ecc_on)
            } else {
                model.default_vf_profile()
            } {
                Some(profile) => profile,
                None => continue,
            };

            let used = self.used(&uid);
            if used.vfs >= dev.max_vfs {
                continue;
            }
            let memory = profile.memory(dev.ecc_on);
            if dev.memory_mib.saturating_sub(used.memory_mib) < memory {
                continue;
            }
            if dev.millicores.saturating_sub(used.millicores) < profile.millicores() {
                continue;
            }

            let vf_index = used.vfs;
            let entry = self.consumed.entry(uid.clone()).or_default();
            entry.vfs += 1;
            entry.memory_mib += memory;
            entry.millicores += profile.millicores();
            self.owners.insert(uid.clone(), owner.to_string());

            return Ok(AllocatedDevice {
                uid: String::new(),
                device_type: DeviceType::Vf,
                parent_uid: uid,
                memory_mib: memory,
                millicores: profile.millicores(),
                vf_index,
                profile: profile.name.to_string(),
            });
        }
        Err(DriverError::insufficient(
            "no existing VF fits and no parent can host a new one",
        ))
    }

    /// "any" requests accept a free GPU or an existing VF, chosen together in
    /// policy order; no provisioning happens for them.
    fn place_any(&mut self, owner: &str, p: &GpuClaimParameters) -> Result<AllocatedDevice> {
        let candidates: Vec<String> = self
            .devices
            .values()
            .filter(|d| match d.device_type {
                DeviceType::Gpu => self.used(&d.uid).vfs == 0 && self.request_fits(d, p),
                DeviceType::Vf => {
                    self.used(&d.uid).is_zero()
                        && self.owner_allows(&d.parent_uid, owner)
                        && (p.memory_mib == 0 || d.memory_mib >= p.memory_mib)
                        && (p.millicores == 0 || d.millicores >= p.millicores)
                }
                DeviceType::Accel => false,
            })
            .map(|d| d.uid.clone())
            .collect();
        let uid = self
            .pick_by_policy(candidates)
            .ok_or_else(|| DriverError::insufficient("no GPU or VF fits the request"))?;
        let is_vf = self.devices.get(&uid).map_or(false, |d| d.is_vf());
        if is_vf {
            self.take_existing_vf(&uid, owner)
        } else {
            self.consume_device(&uid, p)
        }
    }
}
