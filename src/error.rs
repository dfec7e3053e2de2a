use std::fmt;

/// Sub-kinds of an SR-IOV provisioning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningFailure {
    /// Writing per-VF quotas failed; the quota tree was zeroed out again.
    PreconfigFailed,
    /// VF links did not disappear within the teardown budget.
    DismantleTimeout,
    /// Provisioned VFs did not show up or did not match the plan.
    VfValidateFailed,
    /// Fair-share and named profiles mixed on one physical function.
    ProfileMix,
}

impl fmt::Display for ProvisioningFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisioningFailure::PreconfigFailed => "preconfig failed",
            ProvisioningFailure::DismantleTimeout => "dismantle timeout",
            ProvisioningFailure::VfValidateFailed => "VF validation failed",
            ProvisioningFailure::ProfileMix => "profile mix",
        };
        write!(f, "{}", s)
    }
}

/// Errors propagated through the allocation and preparation engine.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Claim or class parameters rejected; surfaced to the orchestrator unchanged.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The resource class references an API group this driver does not serve.
    #[error("unknown API group: {0}")]
    UnknownApiGroup(String),

    /// A referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency clash on a shared record.
    #[error("conflicting write: {0}")]
    Conflict(String),

    /// The node cannot satisfy the claim.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// No node could satisfy an immediate allocation.
    #[error("no suitable node")]
    NoSuitableNode,

    /// SR-IOV provisioning failed; the claim is reported as unprepared.
    #[error("provisioning failed ({kind}): {message}")]
    Provisioning {
        kind: ProvisioningFailure,
        message: String,
    },

    /// A committed device is neither in the catalog nor recoverable by
    /// provisioning; the claim must be re-allocated.
    #[error("catalog mismatch: {0}")]
    CatalogMismatch(String),

    /// I/O and plumbing failures that carry no recovery semantics.
    #[error("{0}")]
    Internal(String),
}

impl DriverError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DriverError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        DriverError::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DriverError::Conflict(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        DriverError::InsufficientResources(msg.into())
    }

    pub fn provisioning(kind: ProvisioningFailure, msg: impl Into<String>) -> Self {
        DriverError::Provisioning {
            kind,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        DriverError::Internal(msg.into())
    }

    /// Whether a retry against the shared store may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DriverError::Conflict(_))
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
