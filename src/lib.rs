//! DRA resource driver for Intel GPUs and Gaudi accelerators.
//!
//! Two coordinating control loops share this crate: the central
//! [`Controller`], which computes and commits device assignments into
//! per-node allocation-state records, and the per-node [`NodeAgent`], which
//! discovers local devices (including SR-IOV virtual functions), provisions
//! VFs for committed claims and exposes the result to the container runtime
//! through CDI.

pub mod agent;
pub mod api;
pub mod cdi;
pub mod client;
pub mod config;
pub mod controller;
pub mod device;
pub mod discovery;
pub mod error;
pub mod fitting;
pub mod journal;
pub mod locking;
pub mod profiles;
pub mod server;
pub mod sriov;
pub mod state;

pub mod pb {
    tonic::include_proto!("v1alpha1");
}

pub use agent::{DraPluginService, NodeAgent};
pub use controller::{ClaimAllocation, Controller};
pub use error::{DriverError, Result};
pub use server::PluginServer;
