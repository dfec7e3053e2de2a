//! The node agent: discovers local devices, publishes the allocatable set,
//! prepares committed claims (provisioning SR-IOV VFs where the controller
//! planned them) and exposes every prepared device to the container runtime
//! through its CDI name. One instance runs per node.

use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::cdi::CdiRegistry;
use crate::client::{update_state, upsert_state, StateClient};
use crate::config::{Config, MONITOR_HANDLE};
use crate::device::{Device, DeviceMap, DeviceType};
use crate::discovery;
use crate::error::{DriverError, ProvisioningFailure, Result};
use crate::journal::PreparedClaims;
use crate::pb;
use crate::sriov::{ProvisionPlan, SriovManager, VfSpec};
use crate::state::{AllocatedDevice, NodeStatus};

pub struct NodeAgent<C: StateClient> {
    config: Config,
    client: Arc<C>,
    journal: PreparedClaims,
    sriov: SriovManager,
    cdi: CdiRegistry,
    catalog: RwLock<DeviceMap>,
    publish: watch::Sender<Vec<pb::NamedResourceInstance>>,
    /// Serializes every prepare/unprepare that may touch sysfs on this node.
    prepare_lock: Mutex<()>,
    cancel: watch::Receiver<bool>,
}

impl<C: StateClient> NodeAgent<C> {
    /// Discovers the node, loads the journal, reconciles the CDI registry
    /// (cleanup mode) and publishes the initial allocatable set.
    pub async fn new(
        config: Config,
        client: Arc<C>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        let catalog = discovery::discover(&config.sysfs_root)?;
        let journal = PreparedClaims::load(config.journal_path())?;
        let cdi = CdiRegistry::new(config.cdi_root.clone(), config.dev_dri_path.clone());
        cdi.sync(&catalog, true)?;

        let sriov = SriovManager::new(
            config.sysfs_root.clone(),
            config.provision_attempts,
            config.provision_interval,
        );

        let prepared = journal.snapshot().await;
        let catalog_for_state = catalog.clone();
        upsert_state(&client, &config.node_name, move |s| {
            s.allocatable = catalog_for_state.clone();
            s.prepared = prepared.clone();
            s.status = NodeStatus::Ready;
            Ok(())
        })
        .await?;

        let (publish, _) = watch::channel(instances_of(&catalog));
        info!(node = %config.node_name, devices = catalog.len(), "node agent ready");

        Ok(NodeAgent {
            config,
            client,
            journal,
            sriov,
            cdi,
            catalog: RwLock::new(catalog),
            publish,
            prepare_lock: Mutex::new(()),
            cancel,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<pb::NamedResourceInstance>> {
        self.publish.subscribe()
    }

    pub async fn catalog(&self) -> DeviceMap {
        self.catalog.read().await.clone()
    }

    async fn replace_catalog(&self, catalog: DeviceMap) {
        let _ = self.publish.send(instances_of(&catalog));
        *self.catalog.write().await = catalog;
    }

    /// Prepares one claim and returns the fully-qualified CDI names of its
    /// devices. Idempotent through the journal.
    pub async fn prepare_claim(&self, claim: &pb::Claim) -> Result<Vec<String>> {
        if let Some(devices) = self.journal.get(&claim.uid).await {
            return Ok(cdi_names(&devices));
        }

        if claim.resource_handle == MONITOR_HANDLE {
            return self.prepare_monitor(claim).await;
        }

        let _serial = self.prepare_lock.lock().await;
        let node = &self.config.node_name;
        let state = self.client.get(node).await?.state;
        let allocation = state.committed.get(&claim.uid).ok_or_else(|| {
            DriverError::not_found(format!("claim {} is not committed on {node}", claim.uid))
        })?;

        let catalog = self.catalog.read().await.clone();
        let mut resolved: Vec<AllocatedDevice> = Vec::new();
        let mut planned: Vec<AllocatedDevice> = Vec::new();
        let mut to_provision: HashMap<String, Vec<VfSpec>> = HashMap::new();

        for dev in &allocation.devices {
            if dev.needs_provisioning() {
                // A sibling claim may have provisioned this VF already; a
                // leftover with the wrong profile does not count.
                match find_vf(&catalog, &dev.parent_uid, dev.vf_index) {
                    Some(vf) if vf.vf_profile == dev.profile => {
                        resolved.push(concrete_vf(vf, dev))
                    }
                    _ => {
                        to_provision
                            .entry(dev.parent_uid.clone())
                            .or_default()
                            .push(VfSpec {
                                vf_index: dev.vf_index,
                                profile: dev.profile.clone(),
                            });
                        planned.push(dev.clone());
                    }
                }
            } else if catalog.contains_key(&dev.uid) {
                resolved.push(dev.clone());
            } else if dev.device_type == DeviceType::Vf
                && catalog
                    .get(&dev.parent_uid)
                    .map_or(false, Device::sriov_enabled)
            {
                // An allocated VF that disappeared (parent reset): recreate
                // it with the same profile and index.
                to_provision
                    .entry(dev.parent_uid.clone())
                    .or_default()
                    .push(VfSpec {
                        vf_index: dev.vf_index,
                        profile: dev.profile.clone(),
                    });
                planned.push(dev.clone());
            } else {
                return Err(DriverError::CatalogMismatch(dev.uid.clone()));
            }
        }

        if !to_provision.is_empty() {
            // Sibling committed claims that planned VFs on the same parents
            // are provisioned in the same numvfs write.
            for (sibling_uid, sibling) in &state.committed {
                if sibling_uid == &claim.uid {
                    continue;
                }
                for dev in &sibling.devices {
                    if !dev.needs_provisioning() {
                        continue;
                    }
                    if let Some(vfs) = to_provision.get_mut(&dev.parent_uid) {
                        if !vfs.iter().any(|v| v.vf_index == dev.vf_index) {
                            vfs.push(VfSpec {
                                vf_index: dev.vf_index,
                                profile: dev.profile.clone(),
                            });
                        }
                    }
                }
            }

            for (parent_uid, mut vfs) in to_provision {
                let parent = catalog
                    .get(&parent_uid)
                    .cloned()
                    .ok_or_else(|| DriverError::CatalogMismatch(parent_uid.clone()))?;

                // Leftover VFs of an earlier partition block the numvfs
                // write; dismantle them first, but never while a committed
                // claim still references one.
                let stale: Vec<&Device> = catalog
                    .values()
                    .filter(|d| d.is_vf() && d.parent_uid == parent_uid)
                    .collect();
                if !stale.is_empty() {
                    let in_use = stale.iter().any(|vf| {
                        state
                            .committed
                            .values()
                            .any(|c| c.devices.iter().any(|d| d.uid == vf.uid))
                    });
                    if in_use {
                        return Err(DriverError::insufficient(format!(
                            "parent {parent_uid} still hosts VFs in use"
                        )));
                    }
                    self.sriov.remove_all_vfs(&parent).await?;
                }

                vfs.sort_by_key(|v| v.vf_index);
                let mut plan = ProvisionPlan { parent, vfs };
                SriovManager::fill_leftover(&mut plan);
                self.sriov.provision(&plan, &self.cancel).await?;
            }

            let refreshed = discovery::discover(&self.config.sysfs_root)?;
            let removed: Vec<String> = catalog
                .keys()
                .filter(|uid| !refreshed.contains_key(*uid))
                .cloned()
                .collect();
            if !removed.is_empty() {
                self.cdi.prune(&removed)?;
            }
            self.cdi.sync(&refreshed, false)?;
            for dev in &planned {
                let vf = find_vf(&refreshed, &dev.parent_uid, dev.vf_index).ok_or_else(|| {
                    DriverError::provisioning(
                        ProvisioningFailure::VfValidateFailed,
                        format!("VF {} of {} not discovered", dev.vf_index, dev.parent_uid),
                    )
                })?;
                resolved.push(concrete_vf(vf, dev));
            }
            self.replace_catalog(refreshed).await;
        }

        let current_catalog = self.catalog.read().await.clone();
        let claim_uid = claim.uid.clone();
        let prepared = resolved.clone();
        update_state(&self.client, node, move |s| {
            s.prepared.insert(claim_uid.clone(), prepared.clone());
            s.allocatable = current_catalog.clone();
            Ok(())
        })
        .await?;
        self.journal.insert(&claim.uid, resolved.clone()).await?;

        info!(claim = %claim.uid, devices = resolved.len(), "claim prepared");
        Ok(cdi_names(&resolved))
    }

    /// Monitor claims see every discovered device and reserve nothing.
    async fn prepare_monitor(&self, claim: &pb::Claim) -> Result<Vec<String>> {
        let catalog = self.catalog.read().await.clone();
        let mut devices: Vec<AllocatedDevice> = catalog
            .values()
            .map(|dev| AllocatedDevice {
                uid: dev.uid.clone(),
                device_type: dev.device_type,
                parent_uid: dev.parent_uid.clone(),
                // Telemetry access consumes nothing.
                memory_mib: 0,
                millicores: 0,
                vf_index: dev.vf_index,
                profile: dev.vf_profile.clone(),
            })
            .collect();
        devices.sort_by(|a, b| a.uid.cmp(&b.uid));

        let claim_uid = claim.uid.clone();
        let prepared = devices.clone();
        update_state(&self.client, &self.config.node_name, move |s| {
            s.prepared.insert(claim_uid.clone(), prepared.clone());
            Ok(())
        })
        .await?;
        self.journal.insert(&claim.uid, devices.clone()).await?;
        Ok(cdi_names(&devices))
    }

    /// Releases a prepared claim. Parents whose VFs are no longer referenced
    /// by any committed claim are dismantled; partial teardown failures do
    /// not stop the remaining parents, and the first error wins.
    pub async fn unprepare_claim(&self, claim_uid: &str) -> Result<()> {
        let _serial = self.prepare_lock.lock().await;

        let devices = match self.journal.get(claim_uid).await {
            Some(devices) => devices,
            None => return Ok(()),
        };

        let node = &self.config.node_name;
        let state = self.client.get(node).await?.state;

        // Monitor claims are never committed, so they skip the sysfs path.
        if state.committed.contains_key(claim_uid) {
            let catalog = self.catalog.read().await.clone();
            let mut parents: BTreeSet<String> = BTreeSet::new();
            for dev in &devices {
                if dev.device_type != DeviceType::Vf {
                    continue;
                }
                let parent = if !dev.parent_uid.is_empty() {
                    dev.parent_uid.clone()
                } else {
                    match catalog.get(&dev.uid) {
                        Some(vf) => vf.parent_uid.clone(),
                        None => continue,
                    }
                };
                parents.insert(parent);
            }

            let mut first_error: Option<DriverError> = None;
            let mut dismantled = false;
            for parent_uid in parents {
                if !state
                    .committed_vf_claims_on(&parent_uid, claim_uid)
                    .is_empty()
                {
                    continue;
                }
                let parent = match catalog.get(&parent_uid) {
                    Some(parent) => parent.clone(),
                    None => continue,
                };
                match self.sriov.remove_all_vfs(&parent).await {
                    Ok(()) => dismantled = true,
                    Err(e) => {
                        warn!(parent = %parent_uid, error = %e, "VF removal failed");
                        first_error.get_or_insert(e);
                    }
                }
            }

            if dismantled {
                let refreshed = discovery::discover(&self.config.sysfs_root)?;
                let removed: Vec<String> = catalog
                    .keys()
                    .filter(|uid| !refreshed.contains_key(*uid))
                    .cloned()
                    .collect();
                if !removed.is_empty() {
                    self.cdi.prune(&removed)?;
                }
                self.replace_catalog(refreshed).await;
            }

            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let current_catalog = self.catalog.read().await.clone();
        let claim_key = claim_uid.to_string();
        update_state(&self.client, node, move |s| {
            s.prepared.remove(&claim_key);
            s.allocatable = current_catalog.clone();
            Ok(())
        })
        .await?;
        self.journal.remove(claim_uid).await?;

        info!(claim = %claim_uid, "claim unprepared");
        Ok(())
    }
}

fn cdi_names(devices: &[AllocatedDevice]) -> Vec<String> {
    devices
        .iter()
        .map(|d| {
            format!(
                "{}/{}={}",
                crate::config::CDI_VENDOR,
                crate::config::CDI_CLASS,
                d.uid
            )
        })
        .collect()
}

fn find_vf<'a>(catalog: &'a DeviceMap, parent_uid: &str, vf_index: u64) -> Option<&'a Device> {
    catalog
        .values()
        .find(|d| d.is_vf() && d.parent_uid == parent_uid && d.vf_index == vf_index)
}

/// The claim-side record of a VF once it exists in the catalog.
fn concrete_vf(vf: &Device, planned: &AllocatedDevice) -> AllocatedDevice {
    AllocatedDevice {
        uid: vf.uid.clone(),
        device_type: DeviceType::Vf,
        parent_uid: vf.parent_uid.clone(),
        memory_mib: planned.memory_mib,
        millicores: planned.millicores,
        vf_index: vf.vf_index,
        profile: planned.profile.clone(),
    }
}

fn instances_of(catalog: &DeviceMap) -> Vec<pb::NamedResourceInstance> {
    let mut instances: Vec<pb::NamedResourceInstance> = catalog
        .values()
        .map(|dev| pb::NamedResourceInstance {
            uid: dev.uid.clone(),
            model: dev.model_id.clone(),
            device_type: dev.device_type.to_string(),
            memory_mib: dev.memory_mib,
            millicores: dev.millicores,
            parent_uid: dev.parent_uid.clone(),
        })
        .collect();
    instances.sort_by(|a, b| a.uid.cmp(&b.uid));
    instances
}

/// gRPC surface of the node agent.
pub struct DraPluginService<C: StateClient>(pub Arc<NodeAgent<C>>);

#[tonic::async_trait]
impl<C: StateClient> pb::dra_plugin_server::DraPlugin for DraPluginService<C> {
    async fn node_prepare_resources(
        &self,
        request: Request<pb::NodePrepareResourcesRequest>,
    ) -> std::result::Result<Response<pb::NodePrepareResourcesResponse>, Status> {
        let mut claims = HashMap::new();
        for claim in request.into_inner().claims {
            let response = match self.0.prepare_claim(&claim).await {
                Ok(cdi_devices) => pb::NodePrepareResourceResponse {
                    cdi_devices,
                    error: String::new(),
                },
                Err(e) => {
                    error!(claim = %claim.uid, error = %e, "prepare failed");
                    pb::NodePrepareResourceResponse {
                        cdi_devices: Vec::new(),
                        error: e.to_string(),
                    }
                }
            };
            claims.insert(claim.uid, response);
        }
        Ok(Response::new(pb::NodePrepareResourcesResponse { claims }))
    }

    async fn node_unprepare_resources(
        &self,
        request: Request<pb::NodeUnprepareResourcesRequest>,
    ) -> std::result::Result<Response<pb::NodeUnprepareResourcesResponse>, Status> {
        let mut claims = HashMap::new();
        for claim in request.into_inner().claims {
            let response = match self.0.unprepare_claim(&claim.uid).await {
                Ok(()) => pb::NodeUnprepareResourceResponse {
                    error: String::new(),
                },
                Err(e) => {
                    error!(claim = %claim.uid, error = %e, "unprepare failed");
                    pb::NodeUnprepareResourceResponse {
                        error: e.to_string(),
                    }
                }
            };
            claims.insert(claim.uid, response);
        }
        Ok(Response::new(pb::NodeUnprepareResourcesResponse { claims }))
    }

    type NodeListAndWatchResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<pb::NodeListAndWatchResourcesResponse, Status>> + Send>>;

    /// Emits the allocatable set now and again on every catalog change.
    async fn node_list_and_watch_resources(
        &self,
        _request: Request<pb::NodeListAndWatchResourcesRequest>,
    ) -> std::result::Result<Response<Self::NodeListAndWatchResourcesStream>, Status> {
        let mut updates = self.0.subscribe();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                let instances = updates.borrow_and_update().clone();
                if tx
                    .send(Ok(pb::NodeListAndWatchResourcesResponse { instances }))
                    .await
                    .is_err()
                {
                    break;
                }
                if updates.changed().await.is_err() {
                    break;
                }
            }
            info!("resource publication stream closed");
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
