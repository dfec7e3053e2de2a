//! The central controller: computes tentative device assignments for pending
//! claims, answers suitability queries per candidate node, and commits or
//! releases assignments in the per-node allocation-state records. One
//! instance runs per cluster.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::{ClaimParameters, ClassParameters, DeviceClass, ResourceClaim};
use crate::client::{update_state, StateClient};
use crate::config::API_GROUP;
use crate::device::DeviceType;
use crate::error::{DriverError, Result};
use crate::fitting::{fit, FitClaim};
use crate::locking::{NodeLocks, PendingClaims};
use crate::profiles;
use crate::state::{AllocatedClaim, AllocatedDevice, AllocationState, NodeStatus};

/// A claim travelling through a scheduling pass, together with its resolved
/// parameters and the nodes found unsuitable for it.
#[derive(Debug, Clone)]
pub struct ClaimAllocation {
    pub claim: ResourceClaim,
    pub class_params: ClassParameters,
    pub claim_params: ClaimParameters,
    pub unsuitable_nodes: Vec<String>,
}

impl ClaimAllocation {
    pub fn new(
        claim: ResourceClaim,
        class_params: ClassParameters,
        claim_params: ClaimParameters,
    ) -> Self {
        ClaimAllocation {
            claim,
            class_params,
            claim_params,
            unsuitable_nodes: Vec::new(),
        }
    }

    fn fit_claim(&self) -> FitClaim {
        FitClaim {
            claim_uid: self.claim.uid.clone(),
            owner: self.claim.owner_uid.clone(),
            params: self.claim_params.clone(),
        }
    }
}

pub struct Controller<C: StateClient> {
    client: Arc<C>,
    locks: NodeLocks,
    pending: PendingClaims,
    /// Named class parameter records resolvable through `parameters_ref`.
    class_registry: RwLock<HashMap<String, ClassParameters>>,
}

impl<C: StateClient> Controller<C> {
    pub fn new(client: Arc<C>) -> Self {
        Controller {
            client,
            locks: NodeLocks::new(),
            pending: PendingClaims::new(),
            class_registry: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_class_parameters(&self, name: &str, params: ClassParameters) {
        self.class_registry
            .write()
            .await
            .insert(name.to_string(), params);
    }

    /// Returns the default parameters or the referenced record.
    pub async fn get_class_parameters(&self, class: &DeviceClass) -> Result<ClassParameters> {
        if class.api_group != API_GROUP {
            return Err(DriverError::UnknownApiGroup(class.api_group.clone()));
        }
        if let Some(params) = &class.parameters {
            return Ok(params.clone());
        }
        if let Some(reference) = &class.parameters_ref {
            return self
                .class_registry
                .read()
                .await
                .get(reference)
                .cloned()
                .ok_or_else(|| DriverError::not_found(format!("class parameters {reference}")));
        }
        Ok(ClassParameters::default())
    }

    /// Validates the claim's parameters against the class and the profile
    /// tables.
    pub fn get_claim_parameters(
        &self,
        claim: &ResourceClaim,
        _class: &DeviceClass,
        class_params: &ClassParameters,
    ) -> Result<ClaimParameters> {
        if class_params.monitor {
            return Ok(ClaimParameters::Monitor);
        }
        let mut params = claim.parameters.clone();
        params.validate()?;
        if let ClaimParameters::Gpu(p) = &mut params {
            if p.memory_mib > 0 {
                let min = profiles::global_min_profile_memory();
                let max = profiles::global_max_device_memory();
                if p.memory_mib < min || p.memory_mib > max {
                    return Err(DriverError::validation(format!(
                        "memory {} MiB outside [{min}, {max}]",
                        p.memory_mib
                    )));
                }
            }
            // Sharing is an opt-in of the class.
            if !class_params.shared {
                p.shared = false;
            }
        }
        Ok(params)
    }

    /// For each candidate node, decides under that node's mutex whether the
    /// whole batch fits; nodes that cannot take every claim are appended to
    /// each claim's (deduplicated) unsuitable list. Successful placements are
    /// recorded in the pending table and as requested claims in the node's
    /// allocation state.
    pub async fn unsuitable_nodes(
        &self,
        claims: &mut [ClaimAllocation],
        potential_nodes: &[String],
    ) -> Result<()> {
        for node in potential_nodes {
            self.unsuitable_node(claims, node).await;
        }
        for ca in claims.iter_mut() {
            ca.unsuitable_nodes.sort();
            ca.unsuitable_nodes.dedup();
        }
        Ok(())
    }

    async fn unsuitable_node(&self, claims: &mut [ClaimAllocation], node: &str) {
        let _guard = self.locks.lock(node).await;

        let state = match self.client.get(node).await {
            Ok(versioned) => versioned.state,
            Err(e) => {
                debug!(node, error = %e, "no usable allocation state");
                mark_unsuitable(claims, node);
                return;
            }
        };
        if state.status != NodeStatus::Ready {
            mark_unsuitable(claims, node);
            return;
        }

        // Monitor claims need only the status check above.
        let fit_claims: Vec<FitClaim> = claims
            .iter()
            .filter(|ca| !ca.claim_params.is_monitor())
            .map(ClaimAllocation::fit_claim)
            .collect();
        if fit_claims.is_empty() {
            return;
        }

        let policy = claims[0].class_params.placement_policy();
        let placements = match fit(
            &fit_claims,
            &state.allocatable,
            &state.consumed(),
            &state.committed,
            &state.tainted,
            policy,
        ) {
            Ok(placements) => placements,
            Err(e) => {
                debug!(node, error = %e, "claim batch does not fit");
                mark_unsuitable(claims, node);
                return;
            }
        };

        let owners: HashMap<String, String> = claims
            .iter()
            .map(|ca| (ca.claim.uid.clone(), ca.claim.owner_uid.clone()))
            .collect();
        let tentative = placements.clone();
        let written = update_state(&self.client, node, move |s| {
            for (claim_uid, devices) in &tentative {
                // A commit that happened in the meantime wins.
                if s.committed.contains_key(claim_uid) {
                    continue;
                }
                s.requested.insert(
                    claim_uid.clone(),
                    AllocatedClaim {
                        owner: owners.get(claim_uid).cloned().unwrap_or_default(),
                        devices: devices.clone(),
                    },
                );
            }
            Ok(())
        })
        .await;
        if let Err(e) = written {
            warn!(node, error = %e, "failed to record tentative placements");
            mark_unsuitable(claims, node);
            return;
        }

        for (claim_uid, devices) in placements {
            self.pending.set(&claim_uid, node, devices).await;
        }
    }

    /// Allocates every claim, either on the orchestrator-selected node or, in
    /// immediate mode (`selected_node` empty), on the first node that fits.
    /// Results are index-aligned with `claims`.
    pub async fn allocate(
        &self,
        claims: &[ClaimAllocation],
        selected_node: &str,
    ) -> Vec<Result<Vec<AllocatedDevice>>> {
        let mut results = Vec::with_capacity(claims.len());
        for ca in claims {
            let result = if selected_node.is_empty() {
                self.allocate_immediate(ca).await
            } else {
                self.allocate_targeted(ca, selected_node).await
            };
            if let Err(e) = &result {
                info!(claim = %ca.claim.uid, error = %e, "allocation failed");
            }
            results.push(result);
        }
        results
    }

    async fn allocate_immediate(&self, ca: &ClaimAllocation) -> Result<Vec<AllocatedDevice>> {
        let mut nodes = self.client.list_nodes().await?;
        nodes.sort();
        for node in &nodes {
            match self.commit_on_node(ca, node, true).await {
                Ok(devices) => {
                    self.release_tentative_elsewhere(&ca.claim.uid, node).await;
                    return Ok(devices);
                }
                Err(e) => {
                    debug!(node, claim = %ca.claim.uid, error = %e, "node exhausted");
                }
            }
        }
        Err(DriverError::NoSuitableNode)
    }

    async fn allocate_targeted(
        &self,
        ca: &ClaimAllocation,
        node: &str,
    ) -> Result<Vec<AllocatedDevice>> {
        let devices = self.commit_on_node(ca, node, false).await?;
        self.release_tentative_elsewhere(&ca.claim.uid, node).await;
        Ok(devices)
    }

    /// Commits a claim on one node under its mutex. In immediate mode a fresh
    /// fit is computed; otherwise the pending placement must exist and still
    /// validate against the current state.
    async fn commit_on_node(
        &self,
        ca: &ClaimAllocation,
        node: &str,
        immediate: bool,
    ) -> Result<Vec<AllocatedDevice>> {
        let _guard = self.locks.lock(node).await;

        let state = self.client.get(node).await?.state;
        let claim_uid = &ca.claim.uid;

        if let Some(existing) = state.committed.get(claim_uid) {
            // Committed once is committed for good.
            self.pending.remove(claim_uid).await;
            return Ok(existing.devices.clone());
        }

        if ca.claim_params.is_monitor() {
            if state.status != NodeStatus::Ready {
                return Err(DriverError::insufficient(format!("node {node} not ready")));
            }
            return Ok(Vec::new());
        }

        if state.status != NodeStatus::Ready {
            return Err(DriverError::insufficient(format!("node {node} not ready")));
        }

        // Validation happens against the node without this claim's own
        // tentative entry, so its consumption is not double-counted.
        let mut other = state.clone();
        other.requested.remove(claim_uid);

        let devices = if immediate {
            let policy = ca.class_params.placement_policy();
            let mut placements = fit(
                &[ca.fit_claim()],
                &other.allocatable,
                &other.consumed(),
                &other.committed,
                &other.tainted,
                policy,
            )?;
            placements
                .remove(claim_uid)
                .ok_or_else(|| DriverError::internal("fit returned no placement"))?
        } else {
            let pending = self
                .pending
                .get(claim_uid, node)
                .await
                .ok_or_else(|| {
                    DriverError::insufficient(format!("no pending allocation on node {node}"))
                })?;
            validate_pending(&other, &pending, &ca.claim.owner_uid)?
        };

        let owner = ca.claim.owner_uid.clone();
        let claim_key = claim_uid.clone();
        let committed_devices = devices.clone();
        update_state(&self.client, node, move |s| {
            s.requested.remove(&claim_key);
            s.committed.insert(
                claim_key.clone(),
                AllocatedClaim {
                    owner: owner.clone(),
                    devices: committed_devices.clone(),
                },
            );
            Ok(())
        })
        .await?;

        info!(claim = %claim_uid, node, devices = devices.len(), "claim committed");
        Ok(devices)
    }

    /// After a commit, tentative placements on all other nodes are stale:
    /// drop them from the pending table and from those nodes' requested maps.
    async fn release_tentative_elsewhere(&self, claim_uid: &str, committed_node: &str) {
        let nodes = self.pending.nodes_for(claim_uid).await;
        self.pending.remove(claim_uid).await;
        for node in nodes {
            if node == committed_node {
                continue;
            }
            let _guard = self.locks.lock(&node).await;
            let claim_key = claim_uid.to_string();
            let result = update_state(&self.client, &node, move |s| {
                s.requested.remove(&claim_key);
                Ok(())
            })
            .await;
            if let Err(e) = result {
                warn!(node, claim = %claim_uid, error = %e, "failed to release tentative placement");
            }
        }
    }

    /// Removes the claim from the node's committed/requested maps and from
    /// the pending table; a no-op when the claim is not present.
    pub async fn deallocate(&self, claim_uid: &str, node: &str) -> Result<()> {
        self.pending.remove(claim_uid).await;
        if node.is_empty() {
            return Ok(());
        }
        let _guard = self.locks.lock(node).await;
        let claim_key = claim_uid.to_string();
        match update_state(&self.client, node, move |s| {
            s.requested.remove(&claim_key);
            s.committed.remove(&claim_key);
            Ok(())
        })
        .await
        {
            Ok(_) => Ok(()),
            Err(DriverError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn mark_unsuitable(claims: &mut [ClaimAllocation], node: &str) {
    for ca in claims.iter_mut() {
        ca.unsuitable_nodes.push(node.to_string());
    }
}

/// Re-checks a tentative placement against the current state of the node.
/// A VF uid that has vanished while its parent still has budget is re-marked
/// as needing provisioning and stays valid.
fn validate_pending(
    state: &AllocationState,
    devices: &[AllocatedDevice],
    owner: &str,
) -> Result<Vec<AllocatedDevice>> {
    let consumed = state.consumed();
    let mut out = Vec::with_capacity(devices.len());

    let owner_ok = |parent_uid: &str| -> bool {
        match state.vf_owner(parent_uid) {
            None => true,
            Some(existing) => existing.is_empty() || owner.is_empty() || existing == owner,
        }
    };

    for dev in devices {
        if dev.device_type == DeviceType::Vf {
            let parent_uid = &dev.parent_uid;
            if !dev.uid.is_empty() && state.allocatable.contains_key(&dev.uid) {
                // The VF still exists; it must be unheld and tenancy-compatible.
                if !consumed.get(&dev.uid).map_or(true, |c| c.is_zero()) {
                    return Err(DriverError::insufficient(format!(
                        "VF {} already held",
                        dev.uid
                    )));
                }
                if !owner_ok(parent_uid) {
                    return Err(DriverError::insufficient(format!(
                        "parent {parent_uid} serves another owner"
                    )));
                }
                out.push(dev.clone());
                continue;
            }

            // Planned VF, or an allocated VF that disappeared from the
            // catalog: the parent must still be able to host it.
            let parent = state.allocatable.get(parent_uid).ok_or_else(|| {
                DriverError::insufficient(format!("parent {parent_uid} no longer allocatable"))
            })?;
            let used = consumed.get(parent_uid).cloned().unwrap_or_default();
            if parent.max_vfs == 0 || used.vfs >= parent.max_vfs {
                return Err(DriverError::insufficient(format!(
                    "parent {parent_uid} has no free VF slots"
                )));
            }
            if !owner_ok(parent_uid) {
                return Err(DriverError::insufficient(format!(
                    "parent {parent_uid} serves another owner"
                )));
            }
            if parent.memory_mib.saturating_sub(used.memory_mib) < dev.memory_mib {
                return Err(DriverError::insufficient(format!(
                    "parent {parent_uid} lacks memory for the VF"
                )));
            }
            let mut planned = dev.clone();
            planned.uid.clear();
            out.push(planned);
        } else {
            let device = state.allocatable.get(&dev.uid).ok_or_else(|| {
                DriverError::insufficient(format!("device {} no longer allocatable", dev.uid))
            })?;
            let used = consumed.get(&dev.uid).cloned().unwrap_or_default();
            if device.memory_mib.saturating_sub(used.memory_mib) < dev.memory_mib
                || device.millicores.saturating_sub(used.millicores) < dev.millicores
            {
                return Err(DriverError::insufficient(format!(
                    "device {} no longer has capacity",
                    dev.uid
                )));
            }
            out.push(dev.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AccelClaimParameters, GpuClaimParameters, RequestType};
    use crate::client::InMemoryStateClient;
    use crate::device::{device_uid, Device};
    use crate::state::check_invariants;

    fn gaudi(uid: &str) -> Device {
        Device {
            uid: uid.to_string(),
            model_id: "0x1020".to_string(),
            device_type: DeviceType::Accel,
            memory_mib: 98304,
            millicores: 1000,
            ..Default::default()
        }
    }

    fn flex(addr: &str) -> Device {
        Device {
            uid: device_uid(addr, "0x56c0"),
            pci_address: addr.to_string(),
            model_id: "0x56c0".to_string(),
            device_type: DeviceType::Gpu,
            memory_mib: 14248,
            millicores: 1000,
            max_vfs: 16,
            tiles: 1,
            ..Default::default()
        }
    }

    fn ready_state(devices: &[Device]) -> AllocationState {
        AllocationState {
            status: NodeStatus::Ready,
            allocatable: devices
                .iter()
                .map(|d| (d.uid.clone(), d.clone()))
                .collect(),
            ..Default::default()
        }
    }

    fn accel_claim(uid: &str, count: u64) -> ClaimAllocation {
        let claim = ResourceClaim {
            uid: uid.to_string(),
            name: uid.to_string(),
            namespace: "default".to_string(),
            owner_uid: String::new(),
            parameters: ClaimParameters::Accel(AccelClaimParameters { count }),
        };
        ClaimAllocation::new(
            claim.clone(),
            ClassParameters::default(),
            claim.parameters.clone(),
        )
    }

    fn vf_claim(uid: &str, owner: &str) -> ClaimAllocation {
        let claim = ResourceClaim {
            uid: uid.to_string(),
            name: uid.to_string(),
            namespace: "default".to_string(),
            owner_uid: owner.to_string(),
            parameters: ClaimParameters::Gpu(GpuClaimParameters {
                request_type: RequestType::Vf,
                ..Default::default()
            }),
        };
        ClaimAllocation::new(
            claim.clone(),
            ClassParameters::default(),
            claim.parameters.clone(),
        )
    }

    async fn controller_with(
        states: Vec<(&str, AllocationState)>,
    ) -> Controller<InMemoryStateClient> {
        let client = Arc::new(InMemoryStateClient::new());
        for (node, state) in states {
            client.seed(node, state).await;
        }
        Controller::new(client)
    }

    #[tokio::test]
    async fn immediate_allocation_fills_then_exhausts() {
        let state = ready_state(&[gaudi("duuid1"), gaudi("duuid2")]);
        let controller = controller_with(vec![("node-1", state)]).await;

        let r1 = controller.allocate(&[accel_claim("cuuid1", 1)], "").await;
        let d1 = r1[0].as_ref().unwrap();
        assert_eq!(d1[0].uid, "duuid1");

        let r2 = controller.allocate(&[accel_claim("cuuid2", 1)], "").await;
        assert_eq!(r2[0].as_ref().unwrap()[0].uid, "duuid2");

        let r3 = controller.allocate(&[accel_claim("cuuid3", 1)], "").await;
        assert!(matches!(
            r3[0].as_ref().unwrap_err(),
            DriverError::NoSuitableNode
        ));

        let state = controller.client.get("node-1").await.unwrap().state;
        assert!(check_invariants(&state).is_ok());
    }

    #[tokio::test]
    async fn targeted_allocation_validates_pending_and_is_idempotent() {
        let mut state = ready_state(&[gaudi("duuid1"), gaudi("duuid2")]);
        state.committed.insert(
            "cuuid2".to_string(),
            AllocatedClaim {
                owner: String::new(),
                devices: vec![AllocatedDevice {
                    uid: "duuid1".to_string(),
                    device_type: DeviceType::Accel,
                    memory_mib: 98304,
                    millicores: 1000,
                    ..Default::default()
                }],
            },
        );
        let controller = controller_with(vec![("node-1", state)]).await;

        let mut claims = [accel_claim("cuuid1", 1)];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert!(claims[0].unsuitable_nodes.is_empty());

        let r = controller.allocate(&claims, "node-1").await;
        let devices = r[0].as_ref().unwrap();
        assert_eq!(devices[0].uid, "duuid2");

        // Commit is idempotent on retry and does not need a pending entry.
        let r = controller.allocate(&claims, "node-1").await;
        assert_eq!(r[0].as_ref().unwrap()[0].uid, "duuid2");

        let state = controller.client.get("node-1").await.unwrap().state;
        assert!(state.requested.is_empty());
        assert!(state.committed.contains_key("cuuid1"));
    }

    #[tokio::test]
    async fn targeted_allocation_without_pending_fails() {
        let state = ready_state(&[gaudi("duuid1")]);
        let controller = controller_with(vec![("node-1", state)]).await;
        let r = controller.allocate(&[accel_claim("cuuid1", 1)], "node-1").await;
        assert!(matches!(
            r[0].as_ref().unwrap_err(),
            DriverError::InsufficientResources(_)
        ));
    }

    #[tokio::test]
    async fn tainted_devices_shrink_the_node() {
        let mut state = ready_state(&[
            gaudi("gaudi-a"),
            gaudi("gaudi-b"),
            gaudi("gaudi-c"),
            gaudi("gaudi-d"),
        ]);
        for uid in ["gaudi-a", "gaudi-c"] {
            state
                .tainted
                .entry(uid.to_string())
                .or_default()
                .insert("alert".to_string());
        }
        let controller = controller_with(vec![("node-1", state)]).await;

        let mut claims = [accel_claim("cuuid1", 2)];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert!(claims[0].unsuitable_nodes.is_empty());
        let r = controller.allocate(&claims, "node-1").await;
        let mut uids: Vec<&str> = r[0]
            .as_ref()
            .unwrap()
            .iter()
            .map(|d| d.uid.as_str())
            .collect();
        uids.sort();
        assert_eq!(uids, vec!["gaudi-b", "gaudi-d"]);

        // count=3 cannot fit two untainted devices.
        let mut claims = [accel_claim("cuuid2", 3)];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert_eq!(claims[0].unsuitable_nodes, vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn unsuitable_nodes_deduplicates_and_checks_status() {
        let not_ready = AllocationState::default();
        let controller = controller_with(vec![("node-1", not_ready)]).await;
        let mut claims = [accel_claim("cuuid1", 1)];
        let nodes = ["node-1".to_string(), "node-1".to_string(), "node-2".to_string()];
        controller.unsuitable_nodes(&mut claims, &nodes).await.unwrap();
        // node-1 is not ready, node-2 has no record; both appear exactly once.
        assert_eq!(
            claims[0].unsuitable_nodes,
            vec!["node-1".to_string(), "node-2".to_string()]
        );
    }

    #[tokio::test]
    async fn vf_owner_gating_across_claims() {
        let state = ready_state(&[flex("0000:01:00.0")]);
        let controller = controller_with(vec![("node-1", state)]).await;

        let mut claims = [vf_claim("claim-a", "owner-a")];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        let r = controller.allocate(&claims, "node-1").await;
        assert!(r[0].is_ok());

        // A different owner no longer fits on the same parent.
        let mut claims = [vf_claim("claim-b", "owner-b")];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert_eq!(claims[0].unsuitable_nodes, vec!["node-1".to_string()]);

        let state = controller.client.get("node-1").await.unwrap().state;
        assert!(check_invariants(&state).is_ok());
    }

    #[tokio::test]
    async fn pending_placement_invalidated_by_stolen_capacity() {
        let state = ready_state(&[gaudi("duuid1")]);
        let controller = controller_with(vec![("node-1", state)]).await;

        let mut claims = [accel_claim("cuuid1", 1)];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert!(claims[0].unsuitable_nodes.is_empty());

        // A competing claim takes the device before the commit lands.
        let client = controller.client.clone();
        crate::client::update_state(&client, "node-1", |s| {
            s.committed.insert(
                "thief".to_string(),
                AllocatedClaim {
                    owner: String::new(),
                    devices: vec![AllocatedDevice {
                        uid: "duuid1".to_string(),
                        device_type: DeviceType::Accel,
                        memory_mib: 98304,
                        millicores: 1000,
                        ..Default::default()
                    }],
                },
            );
            Ok(())
        })
        .await
        .unwrap();

        let r = controller.allocate(&claims, "node-1").await;
        assert!(matches!(
            r[0].as_ref().unwrap_err(),
            DriverError::InsufficientResources(_)
        ));
    }

    #[tokio::test]
    async fn vanished_vf_is_remarked_for_provisioning_on_commit() {
        let parent = flex("0000:01:00.0");
        let vf = Device {
            uid: device_uid("0000:01:00.1", "0x56c0"),
            pci_address: "0000:01:00.1".to_string(),
            model_id: "0x56c0".to_string(),
            device_type: DeviceType::Vf,
            memory_mib: 7124,
            millicores: 500,
            parent_uid: parent.uid.clone(),
            vf_index: 0,
            vf_profile: "flex170_m2".to_string(),
            ..Default::default()
        };
        let state = ready_state(&[parent.clone(), vf.clone()]);
        let controller = controller_with(vec![("node-1", state)]).await;

        let mut claims = [vf_claim("cuuid1", "owner-a")];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert!(claims[0].unsuitable_nodes.is_empty());

        // The VF disappears (parent reset) before the orchestrator commits,
        // but the parent keeps its VF budget.
        let client = controller.client.clone();
        let vf_uid = vf.uid.clone();
        crate::client::update_state(&client, "node-1", move |s| {
            s.allocatable.remove(&vf_uid);
            Ok(())
        })
        .await
        .unwrap();

        let r = controller.allocate(&claims, "node-1").await;
        let devices = r[0].as_ref().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].needs_provisioning());
        assert_eq!(devices[0].parent_uid, parent.uid);
        assert_eq!(devices[0].vf_index, 0);

        let state = controller.client.get("node-1").await.unwrap().state;
        assert!(check_invariants(&state).is_ok());
    }

    #[tokio::test]
    async fn deallocate_is_idempotent_and_frees_capacity() {
        let state = ready_state(&[gaudi("duuid1")]);
        let controller = controller_with(vec![("node-1", state)]).await;

        let r = controller.allocate(&[accel_claim("cuuid1", 1)], "").await;
        assert!(r[0].is_ok());

        controller.deallocate("cuuid1", "node-1").await.unwrap();
        controller.deallocate("cuuid1", "node-1").await.unwrap();

        let r = controller.allocate(&[accel_claim("cuuid2", 1)], "").await;
        assert_eq!(r[0].as_ref().unwrap()[0].uid, "duuid1");
    }

    #[tokio::test]
    async fn monitor_claims_bypass_fitting() {
        let state = ready_state(&[]);
        let controller = controller_with(vec![("node-1", state)]).await;

        let claim = ResourceClaim {
            uid: "mon-1".to_string(),
            name: "mon-1".to_string(),
            namespace: "default".to_string(),
            owner_uid: String::new(),
            parameters: ClaimParameters::Monitor,
        };
        let ca = ClaimAllocation::new(claim, ClassParameters::default(), ClaimParameters::Monitor);

        let mut claims = [ca.clone()];
        controller
            .unsuitable_nodes(&mut claims, &["node-1".to_string()])
            .await
            .unwrap();
        assert!(claims[0].unsuitable_nodes.is_empty());

        let r = controller.allocate(&[ca], "node-1").await;
        assert!(r[0].as_ref().unwrap().is_empty());
        let state = controller.client.get("node-1").await.unwrap().state;
        assert!(state.committed.is_empty());
    }

    #[tokio::test]
    async fn class_parameter_resolution() {
        let controller = controller_with(vec![]).await;
        let mut class = DeviceClass {
            name: "gpu".to_string(),
            api_group: API_GROUP.to_string(),
            parameters: None,
            parameters_ref: None,
        };
        assert!(controller.get_class_parameters(&class).await.is_ok());

        class.parameters_ref = Some("missing".to_string());
        assert!(matches!(
            controller.get_class_parameters(&class).await.unwrap_err(),
            DriverError::NotFound(_)
        ));

        controller
            .register_class_parameters("missing", ClassParameters::default())
            .await;
        assert!(controller.get_class_parameters(&class).await.is_ok());

        class.api_group = "foreign.example.com".to_string();
        assert!(matches!(
            controller.get_class_parameters(&class).await.unwrap_err(),
            DriverError::UnknownApiGroup(_)
        ));
    }

    #[tokio::test]
    async fn claim_parameter_validation_bounds_memory() {
        let controller = controller_with(vec![]).await;
        let class = DeviceClass {
            name: "gpu".to_string(),
            api_group: API_GROUP.to_string(),
            parameters: None,
            parameters_ref: None,
        };
        let class_params = ClassParameters::default();

        let mut claim = ResourceClaim {
            uid: "c".to_string(),
            name: "c".to_string(),
            namespace: "default".to_string(),
            owner_uid: String::new(),
            parameters: ClaimParameters::Gpu(GpuClaimParameters {
                memory_mib: 100,
                ..Default::default()
            }),
        };
        assert!(controller
            .get_claim_parameters(&claim, &class, &class_params)
            .is_err());

        claim.parameters = ClaimParameters::Gpu(GpuClaimParameters {
            memory_mib: 890,
            ..Default::default()
        });
        assert!(controller
            .get_claim_parameters(&claim, &class, &class_params)
            .is_ok());
    }
}
