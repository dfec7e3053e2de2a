//! Per-node mutual exclusion and the controller-local table of tentative
//! claim placements. Both are process-wide singletons owned by the
//! controller; the narrow async interfaces keep them testable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::state::AllocatedDevice;

/// A named mutex per node, created on first use. The controller holds the
/// node's mutex for the whole read-modify-write cycle on that node's
/// allocation state, including fitting.
#[derive(Default)]
pub struct NodeLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, node: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().expect("node lock map poisoned");
            locks
                .entry(node.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }
}

/// Tentative (not yet committed) placements: claim uid -> node -> devices.
/// Entries appear while candidate nodes are evaluated and disappear when the
/// claim is committed somewhere or deallocated.
#[derive(Default)]
pub struct PendingClaims {
    inner: RwLock<HashMap<String, HashMap<String, Vec<AllocatedDevice>>>>,
}

impl PendingClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, claim_uid: &str, node: &str, devices: Vec<AllocatedDevice>) {
        let mut inner = self.inner.write().await;
        inner
            .entry(claim_uid.to_string())
            .or_default()
            .insert(node.to_string(), devices);
    }

    pub async fn get(&self, claim_uid: &str, node: &str) -> Option<Vec<AllocatedDevice>> {
        let inner = self.inner.read().await;
        inner.get(claim_uid).and_then(|nodes| nodes.get(node)).cloned()
    }

    pub async fn contains(&self, claim_uid: &str) -> bool {
        self.inner.read().await.contains_key(claim_uid)
    }

    /// Nodes currently carrying a tentative placement of the claim.
    pub async fn nodes_for(&self, claim_uid: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<String> = inner
            .get(claim_uid)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        nodes.sort();
        nodes
    }

    /// Drops every tentative placement of the claim, on all nodes.
    pub async fn remove(&self, claim_uid: &str) {
        self.inner.write().await.remove(claim_uid);
    }

    /// Drops the claim's placement on one node, e.g. when the controller
    /// learns the node was not chosen.
    pub async fn remove_on_node(&self, claim_uid: &str, node: &str) {
        let mut inner = self.inner.write().await;
        if let Some(nodes) = inner.get_mut(claim_uid) {
            nodes.remove(node);
            if nodes.is_empty() {
                inner.remove(claim_uid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_node_is_exclusive() {
        let locks = Arc::new(NodeLocks::new());
        let guard = locks.lock("node-1").await;

        let locks2 = locks.clone();
        let contender = tokio::spawn(async move {
            let _g = locks2.lock("node-1").await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("contender should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn different_nodes_do_not_contend() {
        let locks = NodeLocks::new();
        let _a = locks.lock("node-1").await;
        // Must not deadlock.
        let _b = locks.lock("node-2").await;
    }

    #[tokio::test]
    async fn pending_lifecycle() {
        let pending = PendingClaims::new();
        pending.set("claim-1", "node-1", vec![]).await;
        pending.set("claim-1", "node-2", vec![]).await;
        assert!(pending.contains("claim-1").await);
        assert!(pending.get("claim-1", "node-1").await.is_some());

        pending.remove_on_node("claim-1", "node-1").await;
        assert!(pending.get("claim-1", "node-1").await.is_none());
        assert!(pending.get("claim-1", "node-2").await.is_some());

        pending.remove("claim-1").await;
        assert!(!pending.contains("claim-1").await);
    }
}
