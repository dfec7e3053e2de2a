//! SR-IOV lifecycle on a physical function: preconfigure per-VF quotas,
//! trigger creation through the kernel's numvfs control point, validate that
//! the VFs materialized, and dismantle them again. Teardown always runs to
//! completion; partial failures are logged and the first error encountered
//! determines the final kind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::device::Device;
use crate::error::{DriverError, ProvisioningFailure, Result};
use crate::profiles::{self, GpuModel, VfProfile, FAIR_SHARE_PROFILE};

const MIB: u64 = 1024 * 1024;

static QUOTA_FILES: &[&str] = &[
    "contexts_quota",
    "doorbells_quota",
    "exec_quantum_ms",
    "ggtt_quota",
    "lmem_quota",
    "preempt_timeout_us",
];

/// One VF to create on a physical function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfSpec {
    pub vf_index: u64,
    pub profile: String,
}

/// Everything needed to provision the VFs of one physical function.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub parent: Device,
    pub vfs: Vec<VfSpec>,
}

/// Lifecycle of a physical function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PfState {
    #[default]
    Unconfigured,
    Provisioning,
    Provisioned,
    Cleanup,
}

pub struct SriovManager {
    sysfs_root: PathBuf,
    attempts: u32,
    interval: Duration,
    states: StdMutex<HashMap<String, PfState>>,
}

impl SriovManager {
    pub fn new(sysfs_root: PathBuf, attempts: u32, interval: Duration) -> Self {
        SriovManager {
            sysfs_root,
            attempts,
            interval,
            states: StdMutex::new(HashMap::new()),
        }
    }

    pub fn pf_state(&self, parent_uid: &str) -> PfState {
        self.states
            .lock()
            .expect("PF state map poisoned")
            .get(parent_uid)
            .copied()
            .unwrap_or_default()
    }

    fn set_state(&self, parent_uid: &str, state: PfState) {
        self.states
            .lock()
            .expect("PF state map poisoned")
            .insert(parent_uid.to_string(), state);
    }

    fn device_dir(&self, dev: &Device) -> PathBuf {
        self.sysfs_root
            .join("bus/pci/drivers")
            .join(dev.driver())
            .join(&dev.pci_address)
    }

    /// A plan is acceptable only when its indices form a duplicate-free
    /// contiguous prefix within the parent's VF budget and its profiles do
    /// not mix fair-share with named ones.
    pub fn validate_plan(plan: &ProvisionPlan) -> Result<()> {
        if plan.vfs.is_empty() {
            return Err(DriverError::validation("empty provisioning plan"));
        }
        if !plan.parent.sriov_enabled() {
            return Err(DriverError::insufficient(format!(
                "device {} has SR-IOV disabled",
                plan.parent.uid
            )));
        }
        if plan.vfs.len() as u64 > plan.parent.max_vfs {
            return Err(DriverError::validation(format!(
                "plan wants {} VFs, parent allows {}",
                plan.vfs.len(),
                plan.parent.max_vfs
            )));
        }
        let mut indices: Vec<u64> = plan.vfs.iter().map(|v| v.vf_index).collect();
        indices.sort_unstable();
        for (expected, actual) in indices.iter().enumerate() {
            if *actual != expected as u64 {
                return Err(DriverError::validation(format!(
                    "VF indices are not a contiguous prefix: {indices:?}"
                )));
            }
        }
        let fair = plan
            .vfs
            .iter()
            .filter(|v| v.profile == FAIR_SHARE_PROFILE)
            .count();
        if fair != 0 && fair != plan.vfs.len() {
            return Err(DriverError::provisioning(
                ProvisioningFailure::ProfileMix,
                format!("fair-share and named profiles mixed on {}", plan.parent.uid),
            ));
        }
        Ok(())
    }

    /// Leftover reuse: when the requested VFs leave unused capacity on the
    /// parent, appends additional VFs to fill the gap. A homogeneous request
    /// is topped up to its profile's VF count; otherwise smaller profiles are
    /// fitted greedily while memory and doorbells allow.
    pub fn fill_leftover(plan: &mut ProvisionPlan) {
        let model = match profiles::model_for_device_id(&plan.parent.model_id) {
            Some(model) => model,
            None => return,
        };
        if plan.vfs.is_empty() || plan.vfs.iter().any(|v| v.profile == FAIR_SHARE_PROFILE) {
            return;
        }
        let ecc = plan.parent.ecc_on;

        let first = plan.vfs[0].profile.clone();
        if plan.vfs.iter().all(|v| v.profile == first) {
            if let Some(profile) = model.profile(&first) {
                if plan.parent.max_vfs >= profile.numvfs {
                    let mut next = plan.vfs.len() as u64;
                    while next < profile.numvfs {
                        plan.vfs.push(VfSpec {
                            vf_index: next,
                            profile: first.clone(),
                        });
                        next += 1;
                    }
                    return;
                }
            }
        }

        let mut remaining_memory = plan
            .parent
            .memory_mib
            .saturating_sub(used_memory(plan, model, ecc));
        let mut remaining_doorbells = model.doorbells.saturating_sub(used_doorbells(plan, model));
        let min_memory = model.min_profile_memory(ecc);
        let min_doorbells = model
            .profiles
            .iter()
            .map(|p| p.doorbells)
            .min()
            .unwrap_or(0);

        let mut next = plan.vfs.len() as u64;
        while next < plan.parent.max_vfs
            && remaining_memory >= min_memory
            && remaining_doorbells >= min_doorbells
        {
            let candidate = model
                .profiles
                .iter()
                .filter(|p| p.memory(ecc) <= remaining_memory && p.doorbells <= remaining_doorbells)
                .max_by_key(|p| p.memory(ecc));
            let profile = match candidate {
                Some(profile) => profile,
                None => break,
            };
            remaining_memory -= profile.memory(ecc);
            remaining_doorbells -= profile.doorbells;
            plan.vfs.push(VfSpec {
                vf_index: next,
                profile: profile.name.to_string(),
            });
            next += 1;
        }
    }

    /// Runs the full provisioning cycle for one physical function. On any
    /// validation failure after the numvfs write the teardown path runs
    /// unconditionally, also when the caller cancels mid-flight.
    pub async fn provision(
        &self,
        plan: &ProvisionPlan,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        Self::validate_plan(plan)?;
        let parent_uid = plan.parent.uid.clone();
        self.set_state(&parent_uid, PfState::Provisioning);

        let needs_preconfig = plan.vfs.iter().any(|v| v.profile != FAIR_SHARE_PROFILE);
        if needs_preconfig {
            if let Err(e) = self.preconfigure(plan) {
                // Zero out everything already written before reporting.
                if let Err(ze) = self.zero_quotas(&plan.parent) {
                    warn!(parent = %parent_uid, error = %ze, "quota zero-out incomplete");
                }
                self.set_state(&parent_uid, PfState::Unconfigured);
                return Err(DriverError::provisioning(
                    ProvisioningFailure::PreconfigFailed,
                    e.to_string(),
                ));
            }
        }

        let numvfs = self.device_dir(&plan.parent).join("sriov_numvfs");
        if let Err(e) = write_value(&numvfs, plan.vfs.len() as u64) {
            self.set_state(&parent_uid, PfState::Unconfigured);
            return Err(e);
        }

        match self.await_vfs_ready(plan, cancel).await {
            Ok(()) => {
                self.set_state(&parent_uid, PfState::Provisioned);
                info!(parent = %parent_uid, vfs = plan.vfs.len(), "VFs provisioned");
                Ok(())
            }
            Err(first) => {
                self.set_state(&parent_uid, PfState::Cleanup);
                let teardown = self.remove_all_vfs(&plan.parent).await;
                self.set_state(&parent_uid, PfState::Unconfigured);
                match teardown {
                    // A teardown that timed out trumps the validation error.
                    Err(
                        e @ DriverError::Provisioning {
                            kind: ProvisioningFailure::DismantleTimeout,
                            ..
                        },
                    ) => Err(e),
                    Err(e) => {
                        warn!(parent = %parent_uid, error = %e, "teardown after failed provisioning");
                        Err(first)
                    }
                    Ok(()) => Err(first),
                }
            }
        }
    }

    /// Writes 0 to numvfs, waits for every VF link to disappear, zeroes the
    /// quota tree and re-enables auto-provisioning. All steps run even when
    /// one fails; the first error wins.
    pub async fn remove_all_vfs(&self, parent: &Device) -> Result<()> {
        let dir = self.device_dir(parent);
        let mut first_error: Option<DriverError> = None;

        if let Err(e) = write_value(&dir.join("sriov_numvfs"), 0u64) {
            warn!(parent = %parent.uid, error = %e, "numvfs reset failed");
            first_error.get_or_insert(e);
        }

        let mut gone = false;
        for _ in 0..self.attempts {
            if count_virtfn_links(&dir) == 0 {
                gone = true;
                break;
            }
            sleep(self.interval).await;
        }
        if !gone {
            let e = DriverError::provisioning(
                ProvisioningFailure::DismantleTimeout,
                format!("VF links of {} did not disappear", parent.uid),
            );
            warn!(parent = %parent.uid, "dismantle timed out");
            first_error.get_or_insert(e);
        }

        if let Err(e) = self.zero_quotas(parent) {
            warn!(parent = %parent.uid, error = %e, "quota zero-out incomplete");
            first_error.get_or_insert(e);
        }

        let auto = dir.join("prelim_iov/pf/auto_provisioning");
        if auto.parent().map_or(false, Path::exists) {
            if let Err(e) = write_value(&auto, 1u64) {
                warn!(parent = %parent.uid, error = %e, "auto-provisioning re-enable failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(parent = %parent.uid, "VFs dismantled");
                Ok(())
            }
        }
    }

    /// Writes the per-VF per-tile quota files. The quota directories are
    /// 1-based (`vf1` is VF index 0); doorbells, GGTT and memory are split
    /// evenly across tiles.
    fn preconfigure(&self, plan: &ProvisionPlan) -> Result<()> {
        let model = model_of(&plan.parent)?;
        let dir = self.device_dir(&plan.parent);
        let tiles = plan.parent.tiles.max(1) as u64;

        for vf in &plan.vfs {
            let profile = model.profile(&vf.profile).ok_or_else(|| {
                DriverError::validation(format!("unknown profile {}", vf.profile))
            })?;
            for tile in 0..tiles {
                let gt_dir = dir
                    .join("prelim_iov")
                    .join(format!("vf{}", vf.vf_index + 1))
                    .join(format!("gt{tile}"));
                fs::create_dir_all(&gt_dir)?;
                write_quotas(&gt_dir, profile, plan.parent.ecc_on, tiles)?;
            }
        }
        write_value(&pf_auto_provisioning(&dir), 0u64)?;
        Ok(())
    }

    /// Zeroes every quota file under the parent's prelim_iov tree. Failures
    /// are collected, not fatal per file.
    fn zero_quotas(&self, parent: &Device) -> Result<()> {
        let iov_dir = self.device_dir(parent).join("prelim_iov");
        let mut first_error: Option<DriverError> = None;
        let entries = match fs::read_dir(&iov_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for vf_entry in entries.flatten() {
            let name = vf_entry.file_name();
            if !name.to_string_lossy().starts_with("vf") {
                continue;
            }
            let gt_entries = match fs::read_dir(vf_entry.path()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for gt_entry in gt_entries.flatten() {
                for quota in QUOTA_FILES {
                    let path = gt_entry.path().join(quota);
                    if !path.exists() {
                        continue;
                    }
                    if let Err(e) = write_value(&path, 0u64) {
                        warn!(path = %path.display(), error = %e, "quota zero failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Polls until every planned VF exposes a render device node, the budget
    /// runs out, or the caller cancels. Cancellation surfaces as an error so
    /// the caller's teardown path still runs.
    async fn await_vfs_ready(
        &self,
        plan: &ProvisionPlan,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let dir = self.device_dir(&plan.parent);
        let mut cancel = cancel.clone();
        for _ in 0..self.attempts {
            if *cancel.borrow() {
                return Err(DriverError::internal("provisioning cancelled"));
            }
            if plan.vfs.iter().all(|vf| vf_ready(&dir, vf.vf_index)) {
                return Ok(());
            }
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = cancel.changed() => {}
            }
        }
        if *cancel.borrow() {
            return Err(DriverError::internal("provisioning cancelled"));
        }
        Err(DriverError::provisioning(
            ProvisioningFailure::VfValidateFailed,
            format!(
                "not all of {} VFs appeared on {}",
                plan.vfs.len(),
                plan.parent.uid
            ),
        ))
    }
}

fn model_of(parent: &Device) -> Result<&'static GpuModel> {
    profiles::model_for_device_id(&parent.model_id)
        .ok_or_else(|| DriverError::validation(format!("unknown model id {}", parent.model_id)))
}

fn used_memory(plan: &ProvisionPlan, model: &GpuModel, ecc: bool) -> u64 {
    plan.vfs
        .iter()
        .filter_map(|v| model.profile(&v.profile))
        .map(|p| p.memory(ecc))
        .sum()
}

fn used_doorbells(plan: &ProvisionPlan, model: &GpuModel) -> u64 {
    plan.vfs
        .iter()
        .filter_map(|v| model.profile(&v.profile))
        .map(|p| p.doorbells)
        .sum()
}

fn pf_auto_provisioning(dev_dir: &Path) -> PathBuf {
    let path = dev_dir.join("prelim_iov/pf/auto_provisioning");
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    path
}

fn write_quotas(gt_dir: &Path, profile: &VfProfile, ecc: bool, tiles: u64) -> Result<()> {
    write_value(&gt_dir.join("contexts_quota"), profile.contexts)?;
    write_value(&gt_dir.join("doorbells_quota"), profile.doorbells / tiles)?;
    write_value(&gt_dir.join("exec_quantum_ms"), profile.exec_quantum_ms)?;
    write_value(&gt_dir.join("ggtt_quota"), profile.ggtt_mib * MIB / tiles)?;
    write_value(&gt_dir.join("lmem_quota"), profile.memory(ecc) * MIB / tiles)?;
    write_value(&gt_dir.join("preempt_timeout_us"), profile.preempt_timeout_us)?;
    Ok(())
}

fn write_value(path: &Path, value: u64) -> Result<()> {
    fs::write(path, format!("{value}\n"))
        .map_err(|e| DriverError::internal(format!("{}: {e}", path.display())))
}

fn count_virtfn_links(dev_dir: &Path) -> usize {
    match fs::read_dir(dev_dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("virtfn"))
            .count(),
        Err(_) => 0,
    }
}

/// A VF is ready once the parent's `virtfn<N>` link resolves to a device that
/// exposes a render node.
fn vf_ready(parent_dir: &Path, vf_index: u64) -> bool {
    let link = parent_dir.join(format!("virtfn{vf_index}"));
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(_) => return false,
    };
    let vf_dir = match target.file_name() {
        Some(name) => parent_dir.parent().map(|p| p.join(name)),
        None => None,
    };
    let vf_dir = match vf_dir {
        Some(dir) => dir,
        None => return false,
    };
    match fs::read_dir(vf_dir.join("drm")) {
        Ok(entries) => entries
            .flatten()
            .any(|e| e.file_name().to_string_lossy().starts_with("renderD")),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{device_uid, DeviceType};
    use std::os::unix::fs::symlink;

    fn flex_pf(addr: &str, sysfs: &Path) -> Device {
        let dev = Device {
            uid: device_uid(addr, "0x56c0"),
            pci_address: addr.to_string(),
            model_id: "0x56c0".to_string(),
            device_type: DeviceType::Gpu,
            memory_mib: 14248,
            millicores: 1000,
            max_vfs: 16,
            tiles: 1,
            ..Default::default()
        };
        let dir = sysfs
            .join("bus/pci/drivers/i915")
            .join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("sriov_numvfs"), "0\n").unwrap();
        dev
    }

    fn manager(sysfs: &Path) -> SriovManager {
        SriovManager::new(sysfs.to_path_buf(), 3, Duration::from_millis(10))
    }

    fn plan(parent: &Device, profiles: &[&str]) -> ProvisionPlan {
        ProvisionPlan {
            parent: parent.clone(),
            vfs: profiles
                .iter()
                .enumerate()
                .map(|(i, p)| VfSpec {
                    vf_index: i as u64,
                    profile: p.to_string(),
                })
                .collect(),
        }
    }

    fn materialize_vf(sysfs: &Path, parent: &str, index: u64) {
        let driver = sysfs.join("bus/pci/drivers/i915");
        let vf_addr = format!("{}.{}", &parent[..parent.len() - 2], index + 1);
        let vf_dir = driver.join(&vf_addr);
        fs::create_dir_all(vf_dir.join(format!("drm/renderD{}", 129 + index))).unwrap();
        symlink(
            format!("../{vf_addr}"),
            driver.join(parent).join(format!("virtfn{index}")),
        )
        .unwrap();
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn plan_indices_must_be_contiguous() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());

        let mut bad = plan(&pf, &["flex170_m2", "flex170_m2"]);
        bad.vfs[1].vf_index = 3;
        assert!(SriovManager::validate_plan(&bad).is_err());

        bad.vfs[1].vf_index = 0;
        assert!(SriovManager::validate_plan(&bad).is_err());

        let good = plan(&pf, &["flex170_m2", "flex170_m2"]);
        assert!(SriovManager::validate_plan(&good).is_ok());
    }

    #[test]
    fn mixing_fair_share_and_named_profiles_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mixed = plan(&pf, &["flex170_m2", FAIR_SHARE_PROFILE]);
        let err = SriovManager::validate_plan(&mixed).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Provisioning {
                kind: ProvisioningFailure::ProfileMix,
                ..
            }
        ));
    }

    #[test]
    fn homogeneous_leftover_fills_to_profile_count() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mut p = plan(&pf, &["flex170_m2"]);
        SriovManager::fill_leftover(&mut p);
        assert_eq!(p.vfs.len(), 2);
        assert_eq!(p.vfs[1].vf_index, 1);
        assert!(p.vfs.iter().all(|v| v.profile == "flex170_m2"));
    }

    #[test]
    fn heterogeneous_leftover_fills_greedily() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mut p = plan(&pf, &["flex170_m2", "flex170_m4"]);
        SriovManager::fill_leftover(&mut p);
        // 14248 - 7124 - 3562 leaves room for exactly one more m4.
        assert_eq!(p.vfs.len(), 3);
        assert_eq!(p.vfs[2].profile, "flex170_m4");
        assert_eq!(p.vfs[2].vf_index, 2);
    }

    #[tokio::test]
    async fn preconfigure_writes_split_quotas() {
        let tmp = tempfile::tempdir().unwrap();
        let mut pf = flex_pf("0000:03:00.0", tmp.path());
        pf.tiles = 2;
        let mgr = manager(tmp.path());

        let p = plan(&pf, &["flex170_m2", "flex170_m2"]);
        mgr.preconfigure(&p).unwrap();

        let dir = tmp
            .path()
            .join("bus/pci/drivers/i915/0000:03:00.0/prelim_iov");
        for vf in ["vf1", "vf2"] {
            for gt in ["gt0", "gt1"] {
                let gt_dir = dir.join(vf).join(gt);
                let lmem: u64 = fs::read_to_string(gt_dir.join("lmem_quota"))
                    .unwrap()
                    .trim()
                    .parse()
                    .unwrap();
                assert_eq!(lmem, 7124 * MIB / 2);
                let doorbells: u64 = fs::read_to_string(gt_dir.join("doorbells_quota"))
                    .unwrap()
                    .trim()
                    .parse()
                    .unwrap();
                assert_eq!(doorbells, 60);
                let contexts: u64 = fs::read_to_string(gt_dir.join("contexts_quota"))
                    .unwrap()
                    .trim()
                    .parse()
                    .unwrap();
                assert_eq!(contexts, 512);
            }
        }
        let auto = fs::read_to_string(dir.join("pf/auto_provisioning")).unwrap();
        assert_eq!(auto.trim(), "0");
    }

    #[tokio::test]
    async fn provision_succeeds_when_vfs_appear() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mgr = manager(tmp.path());

        materialize_vf(tmp.path(), "0000:03:00.0", 0);
        materialize_vf(tmp.path(), "0000:03:00.0", 1);

        let (_keep_open, cancel) = no_cancel();
        let p = plan(&pf, &["flex170_m2", "flex170_m2"]);
        mgr.provision(&p, &cancel).await.unwrap();
        assert_eq!(mgr.pf_state(&pf.uid), PfState::Provisioned);

        let numvfs = fs::read_to_string(
            tmp.path().join("bus/pci/drivers/i915/0000:03:00.0/sriov_numvfs"),
        )
        .unwrap();
        assert_eq!(numvfs.trim(), "2");
    }

    #[tokio::test]
    async fn provision_tears_down_when_vfs_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mgr = manager(tmp.path());

        let (_keep_open, cancel) = no_cancel();
        let p = plan(&pf, &["flex170_m2", "flex170_m2"]);
        let err = mgr.provision(&p, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Provisioning {
                kind: ProvisioningFailure::VfValidateFailed,
                ..
            }
        ));
        assert_eq!(mgr.pf_state(&pf.uid), PfState::Unconfigured);

        let dir = tmp.path().join("bus/pci/drivers/i915/0000:03:00.0");
        assert_eq!(fs::read_to_string(dir.join("sriov_numvfs")).unwrap().trim(), "0");
        // Quotas were zeroed and auto-provisioning restored.
        let lmem = fs::read_to_string(dir.join("prelim_iov/vf1/gt0/lmem_quota")).unwrap();
        assert_eq!(lmem.trim(), "0");
        let auto = fs::read_to_string(dir.join("prelim_iov/pf/auto_provisioning")).unwrap();
        assert_eq!(auto.trim(), "1");
    }

    #[tokio::test]
    async fn dismantle_times_out_on_lingering_links() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mgr = manager(tmp.path());

        // A link that never goes away: nothing removes it in this test.
        materialize_vf(tmp.path(), "0000:03:00.0", 0);

        let err = mgr.remove_all_vfs(&pf).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Provisioning {
                kind: ProvisioningFailure::DismantleTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_still_runs_teardown() {
        let tmp = tempfile::tempdir().unwrap();
        let pf = flex_pf("0000:03:00.0", tmp.path());
        let mgr = manager(tmp.path());

        let (tx, rx) = watch::channel(true);
        let p = plan(&pf, &["flex170_m2", "flex170_m2"]);
        let err = mgr.provision(&p, &rx).await.unwrap_err();
        drop(tx);
        assert!(matches!(err, DriverError::Internal(_)));

        // numvfs was reset as part of the teardown.
        let numvfs = fs::read_to_string(
            tmp.path().join("bus/pci/drivers/i915/0000:03:00.0/sriov_numvfs"),
        )
        .unwrap();
        assert_eq!(numvfs.trim(), "0");
    }
}
