//! Orchestrator-facing parameter records: resource classes, claim parameters
//! and the placement policy they carry. These are the only shapes the
//! controller accepts from the claim lifecycle API.

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Which resource the packing policies compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyResource {
    #[default]
    Memory,
    Millicores,
}

impl PolicyResource {
    /// Tie-break resource for the policy comparisons.
    pub fn secondary(self) -> PolicyResource {
        match self {
            PolicyResource::Memory => PolicyResource::Millicores,
            PolicyResource::Millicores => PolicyResource::Memory,
        }
    }
}

/// Selection among equally feasible GPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// First fit on deterministic (uid) iteration order.
    #[default]
    None,
    /// Prefer the device with the least remaining capacity.
    Packed,
    /// Prefer the device with the most remaining capacity.
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Policy {
    pub kind: PolicyKind,
    pub resource: PolicyResource,
}

/// Parameters attached to a resource class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassParameters {
    /// Whether claims of this class may share a device.
    pub shared: bool,
    /// Telemetry classes bypass fitting and preparation bookkeeping.
    pub monitor: bool,
    pub policy: PolicyKind,
    pub policy_resource: PolicyResource,
}

impl Default for ClassParameters {
    fn default() -> Self {
        ClassParameters {
            shared: true,
            monitor: false,
            policy: PolicyKind::None,
            policy_resource: PolicyResource::Memory,
        }
    }
}

impl ClassParameters {
    pub fn placement_policy(&self) -> Policy {
        Policy {
            kind: self.policy,
            resource: self.policy_resource,
        }
    }
}

/// A resource class as handed over by the orchestrator. `parameters_ref`
/// names a parameter record registered with the controller; inline
/// `parameters` win when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClass {
    pub name: String,
    pub api_group: String,
    #[serde(default)]
    pub parameters: Option<ClassParameters>,
    #[serde(default)]
    pub parameters_ref: Option<String>,
}

/// Device flavor a GPU claim asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    #[default]
    Gpu,
    Vf,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuClaimParameters {
    pub count: u64,
    #[serde(rename = "type")]
    pub request_type: RequestType,
    /// 0 means "any amount"; otherwise at least the smallest VF profile.
    pub memory_mib: u64,
    /// Compute share in milli-units; 1000 is a whole device, 0 means "any".
    pub millicores: u32,
    pub shared: bool,
}

impl Default for GpuClaimParameters {
    fn default() -> Self {
        GpuClaimParameters {
            count: 1,
            request_type: RequestType::Gpu,
            memory_mib: 0,
            millicores: 0,
            shared: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccelClaimParameters {
    pub count: u64,
}

/// The tagged sum of claim parameter variants the fitting engine dispatches on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ClaimParameters {
    Gpu(GpuClaimParameters),
    Accel(AccelClaimParameters),
    Monitor,
}

impl ClaimParameters {
    pub fn count(&self) -> u64 {
        match self {
            ClaimParameters::Gpu(p) => p.count,
            ClaimParameters::Accel(p) => p.count,
            ClaimParameters::Monitor => 0,
        }
    }

    pub fn is_monitor(&self) -> bool {
        matches!(self, ClaimParameters::Monitor)
    }

    /// Whether this claim asks for a virtual function and therefore must be
    /// placed ahead of GPU claims in a batch.
    pub fn wants_vf(&self) -> bool {
        matches!(
            self,
            ClaimParameters::Gpu(GpuClaimParameters {
                request_type: RequestType::Vf,
                ..
            })
        )
    }

    /// Structural validation; resource-table checks live in the controller.
    pub fn validate(&self) -> Result<()> {
        match self {
            ClaimParameters::Gpu(p) => {
                if p.count < 1 {
                    return Err(DriverError::validation("count must be at least 1"));
                }
                if p.millicores > 1000 {
                    return Err(DriverError::validation(format!(
                        "millicores {} exceeds 1000",
                        p.millicores
                    )));
                }
                Ok(())
            }
            ClaimParameters::Accel(p) => {
                if p.count < 1 {
                    return Err(DriverError::validation("count must be at least 1"));
                }
                Ok(())
            }
            ClaimParameters::Monitor => Ok(()),
        }
    }
}

/// A claim as handed over by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    /// UID of the owning workload; gates VF co-tenancy. Empty means no owner.
    #[serde(default)]
    pub owner_uid: String,
    pub parameters: ClaimParameters,
}
