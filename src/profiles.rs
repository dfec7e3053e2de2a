//! Static SR-IOV profile tables per hardware model: VF memory, doorbell and
//! context quotas, and the VF counts each profile is sized for. The numbers
//! are vendor data consumed as-is; everything else in this module is queries
//! over them.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Profile name meaning "no explicit quotas, kernel auto-provisioning".
pub static FAIR_SHARE_PROFILE: &str = "fairShare";

/// A named set of per-VF quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfProfile {
    pub name: &'static str,
    /// VF count the profile is sized for; provisioning `numvfs` of these
    /// consumes the whole device.
    pub numvfs: u64,
    pub memory_mib: u64,
    /// Memory quota when the parent runs with ECC enabled.
    pub memory_mib_ecc: u64,
    pub doorbells: u64,
    pub contexts: u64,
    pub ggtt_mib: u64,
    pub exec_quantum_ms: u64,
    pub preempt_timeout_us: u64,
}

impl VfProfile {
    pub fn memory(&self, ecc: bool) -> u64 {
        if ecc {
            self.memory_mib_ecc
        } else {
            self.memory_mib
        }
    }

    /// Compute share of one VF of this profile.
    pub fn millicores(&self) -> u32 {
        (1000 / self.numvfs) as u32
    }

    pub fn is_fair_share(&self) -> bool {
        self.name == FAIR_SHARE_PROFILE
    }
}

/// Per-model capacity figures and the profiles defined for it.
#[derive(Debug, Clone, Copy)]
pub struct GpuModel {
    pub name: &'static str,
    pub device_ids: &'static [&'static str],
    pub memory_mib: u64,
    pub doorbells: u64,
    pub contexts: u64,
    pub ggtt_mib: u64,
    pub tiles: u32,
    pub max_vfs: u64,
    /// Profile used when a VF request does not constrain memory.
    pub default_profile: &'static str,
    pub profiles: &'static [VfProfile],
}

macro_rules! profile {
    ($name:literal, $numvfs:literal, $mem:literal, $mem_ecc:literal, $db:literal, $ctx:literal, $ggtt:literal, $eq:literal, $pt:literal) => {
        VfProfile {
            name: $name,
            numvfs: $numvfs,
            memory_mib: $mem,
            memory_mib_ecc: $mem_ecc,
            doorbells: $db,
            contexts: $ctx,
            ggtt_mib: $ggtt,
            exec_quantum_ms: $eq,
            preempt_timeout_us: $pt,
        }
    };
}

static FLEX170_PROFILES: &[VfProfile] = &[
    profile!("flex170_m1", 1, 14248, 14000, 240, 1024, 4096, 64, 128000),
    profile!("flex170_m2", 2, 7124, 7000, 120, 512, 2048, 32, 64000),
    profile!("flex170_m4", 4, 3562, 3500, 60, 256, 1024, 16, 32000),
    profile!("flex170_m8", 8, 1781, 1750, 30, 128, 512, 8, 16000),
    profile!("flex170_m16", 16, 890, 875, 15, 64, 256, 4, 8000),
];

static MAX1550_PROFILES: &[VfProfile] = &[
    profile!("max1550_m1", 1, 131072, 128000, 480, 2048, 8192, 64, 128000),
    profile!("max1550_m2", 2, 65536, 64000, 240, 1024, 4096, 32, 64000),
    profile!("max1550_m4", 4, 32768, 32000, 120, 512, 2048, 16, 32000),
    profile!("max1550_m8", 8, 16384, 16000, 60, 256, 1024, 8, 16000),
    profile!("max1550_m16", 16, 8192, 8000, 30, 128, 512, 4, 8000),
];

static MAX1100_PROFILES: &[VfProfile] = &[
    profile!("max1100_m1", 1, 49152, 48000, 240, 1024, 4096, 64, 128000),
    profile!("max1100_m2", 2, 24576, 24000, 120, 512, 2048, 32, 64000),
    profile!("max1100_m4", 4, 12288, 12000, 60, 256, 1024, 16, 32000),
    profile!("max1100_m8", 8, 6144, 6000, 30, 128, 512, 8, 16000),
];

static MODELS: &[GpuModel] = &[
    GpuModel {
        name: "flex170",
        device_ids: &["0x56c0"],
        memory_mib: 14248,
        doorbells: 240,
        contexts: 1024,
        ggtt_mib: 4096,
        tiles: 1,
        max_vfs: 16,
        default_profile: "flex170_m16",
        profiles: FLEX170_PROFILES,
    },
    GpuModel {
        name: "max1550",
        device_ids: &["0x0bd5"],
        memory_mib: 131072,
        doorbells: 480,
        contexts: 2048,
        ggtt_mib: 8192,
        tiles: 2,
        max_vfs: 16,
        default_profile: "max1550_m16",
        profiles: MAX1550_PROFILES,
    },
    GpuModel {
        name: "max1100",
        device_ids: &["0x0bda"],
        memory_mib: 49152,
        doorbells: 240,
        contexts: 1024,
        ggtt_mib: 4096,
        tiles: 1,
        max_vfs: 8,
        default_profile: "max1100_m8",
        profiles: MAX1100_PROFILES,
    },
    // Gaudi accelerators expose no SR-IOV and no profiles.
    GpuModel {
        name: "gaudi2",
        device_ids: &["0x1020"],
        memory_mib: 98304,
        doorbells: 0,
        contexts: 0,
        ggtt_mib: 0,
        tiles: 1,
        max_vfs: 0,
        default_profile: "",
        profiles: &[],
    },
];

static MODELS_BY_DEVICE_ID: Lazy<HashMap<&'static str, &'static GpuModel>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for model in MODELS {
        for id in model.device_ids {
            map.insert(*id, model);
        }
    }
    map
});

static MODELS_BY_NAME: Lazy<HashMap<&'static str, &'static GpuModel>> =
    Lazy::new(|| MODELS.iter().map(|m| (m.name, m)).collect());

pub fn model_for_device_id(device_id: &str) -> Option<&'static GpuModel> {
    MODELS_BY_DEVICE_ID.get(device_id).copied()
}

pub fn model_by_name(name: &str) -> Option<&'static GpuModel> {
    MODELS_BY_NAME.get(name).copied()
}

/// Smallest minimum-profile memory across all models that define profiles;
/// the lower bound for claim validation when the model is not yet known.
pub fn global_min_profile_memory() -> u64 {
    MODELS
        .iter()
        .filter(|m| !m.profiles.is_empty())
        .map(|m| m.min_profile_memory(false))
        .min()
        .unwrap_or(0)
}

/// Largest model memory; the upper bound for claim validation.
pub fn global_max_device_memory() -> u64 {
    MODELS.iter().map(|m| m.memory_mib).max().unwrap_or(0)
}

impl GpuModel {
    pub fn profile(&self, name: &str) -> Option<&'static VfProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn default_vf_profile(&self) -> Option<&'static VfProfile> {
        self.profile(self.default_profile)
    }

    /// Smallest profile whose (ECC-aware) memory covers the request.
    pub fn smallest_profile_with_memory(
        &self,
        memory_mib: u64,
        ecc: bool,
    ) -> Option<&'static VfProfile> {
        self.profiles
            .iter()
            .filter(|p| p.memory(ecc) >= memory_mib)
            .min_by_key(|p| p.memory(ecc))
    }

    /// Profile whose (ECC-aware) memory quota matches a discovered VF.
    pub fn profile_for_vf_memory(&self, memory_mib: u64, ecc: bool) -> Option<&'static VfProfile> {
        self.profiles.iter().find(|p| p.memory(ecc) == memory_mib)
    }

    pub fn min_profile_memory(&self, ecc: bool) -> u64 {
        self.profiles
            .iter()
            .map(|p| p.memory(ecc))
            .min()
            .unwrap_or(0)
    }

    /// Memory of the largest single-VF profile; a device reporting less is
    /// running with ECC enabled.
    pub fn max_single_vf_memory(&self) -> u64 {
        self.profiles
            .iter()
            .map(|p| p.memory_mib)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_device_id_and_name() {
        let flex = model_for_device_id("0x56c0").unwrap();
        assert_eq!(flex.name, "flex170");
        assert_eq!(model_by_name("flex170").unwrap().max_vfs, 16);
        assert!(model_for_device_id("0xdead").is_none());
    }

    #[test]
    fn smallest_fitting_profile() {
        let flex = model_by_name("flex170").unwrap();
        let p = flex.smallest_profile_with_memory(4000, false).unwrap();
        assert_eq!(p.name, "flex170_m2");
        let p = flex.smallest_profile_with_memory(890, false).unwrap();
        assert_eq!(p.name, "flex170_m16");
        assert!(flex.smallest_profile_with_memory(20000, false).is_none());
    }

    #[test]
    fn ecc_column_is_smaller() {
        for model in MODELS.iter().filter(|m| !m.profiles.is_empty()) {
            for p in model.profiles {
                assert!(p.memory_mib_ecc < p.memory_mib, "{}", p.name);
            }
        }
    }

    #[test]
    fn profile_millicores_split_evenly() {
        let flex = model_by_name("flex170").unwrap();
        assert_eq!(flex.profile("flex170_m2").unwrap().millicores(), 500);
        assert_eq!(flex.profile("flex170_m16").unwrap().millicores(), 62);
    }

    #[test]
    fn min_profile_memory_bounds() {
        let flex = model_by_name("flex170").unwrap();
        assert_eq!(flex.min_profile_memory(false), 890);
        assert_eq!(global_min_profile_memory(), 890);
        assert!(global_max_device_memory() >= 131072);
    }

    #[test]
    fn gaudi_has_no_sriov() {
        let gaudi = model_by_name("gaudi2").unwrap();
        assert_eq!(gaudi.max_vfs, 0);
        assert!(gaudi.default_vf_profile().is_none());
    }

    #[test]
    fn ecc_detection_threshold() {
        let flex = model_by_name("flex170").unwrap();
        assert_eq!(flex.max_single_vf_memory(), 14248);
    }
}
