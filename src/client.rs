//! Access to the per-node allocation-state records. The orchestrator's API
//! is reached through the `StateClient` trait so the engine stays testable;
//! writes carry a resource version and conflicting updates are retried from
//! the read step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{DriverError, Result};
use crate::state::AllocationState;

/// How often a conflicting state write is retried before giving up.
const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// An allocation-state record together with its resource version.
#[derive(Debug, Clone, Default)]
pub struct VersionedState {
    pub version: u64,
    pub state: AllocationState,
}

/// Read/write surface over the per-node allocation-state records. The store
/// is namespace-scoped at construction time (`POD_NAMESPACE`), so records of
/// other namespaces are simply not found.
#[async_trait]
pub trait StateClient: Send + Sync + 'static {
    /// Node names that currently have a record, in unspecified order.
    async fn list_nodes(&self) -> Result<Vec<String>>;

    async fn get(&self, node: &str) -> Result<VersionedState>;

    /// Writes `state` if the record still is at `expected_version`;
    /// `expected_version` 0 creates the record. Returns the new version or
    /// `Conflict`.
    async fn put(&self, node: &str, expected_version: u64, state: AllocationState) -> Result<u64>;

    async fn delete(&self, node: &str) -> Result<()>;
}

/// In-memory store used by tests and the binaries' standalone mode.
#[derive(Default)]
pub struct InMemoryStateClient {
    records: RwLock<HashMap<String, VersionedState>>,
}

impl InMemoryStateClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record bypassing version checks.
    pub async fn seed(&self, node: &str, state: AllocationState) {
        let mut records = self.records.write().await;
        let version = records.get(node).map(|v| v.version).unwrap_or(0) + 1;
        records.insert(node.to_string(), VersionedState { version, state });
    }
}

#[async_trait]
impl StateClient for InMemoryStateClient {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn get(&self, node: &str) -> Result<VersionedState> {
        self.records
            .read()
            .await
            .get(node)
            .cloned()
            .ok_or_else(|| DriverError::not_found(format!("allocation state for node {node}")))
    }

    async fn put(&self, node: &str, expected_version: u64, state: AllocationState) -> Result<u64> {
        let mut records = self.records.write().await;
        let current = records.get(node).map(|v| v.version).unwrap_or(0);
        if current != expected_version {
            return Err(DriverError::conflict(format!(
                "node {node}: version {expected_version} is stale (now {current})"
            )));
        }
        let version = current + 1;
        records.insert(node.to_string(), VersionedState { version, state });
        Ok(version)
    }

    async fn delete(&self, node: &str) -> Result<()> {
        self.records.write().await.remove(node);
        Ok(())
    }
}

/// Read-modify-write with bounded conflict retries. The mutation must be a
/// pure function of the record so it can be re-applied against a fresh read.
pub async fn update_state<C, F>(client: &Arc<C>, node: &str, mutate: F) -> Result<AllocationState>
where
    C: StateClient + ?Sized,
    F: Fn(&mut AllocationState) -> Result<()>,
{
    let mut attempt = 0;
    loop {
        let VersionedState { version, mut state } = client.get(node).await?;
        mutate(&mut state)?;
        match client.put(node, version, state.clone()).await {
            Ok(_) => return Ok(state),
            Err(e) if e.is_retriable() && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                warn!(node, attempt, "allocation state write conflicted, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like `update_state` but creates the record when it does not exist yet.
pub async fn upsert_state<C, F>(client: &Arc<C>, node: &str, mutate: F) -> Result<AllocationState>
where
    C: StateClient + ?Sized,
    F: Fn(&mut AllocationState) -> Result<()>,
{
    let mut attempt = 0;
    loop {
        let VersionedState { version, mut state } = match client.get(node).await {
            Ok(v) => v,
            Err(DriverError::NotFound(_)) => VersionedState::default(),
            Err(e) => return Err(e),
        };
        mutate(&mut state)?;
        match client.put(node, version, state.clone()).await {
            Ok(_) => return Ok(state),
            Err(e) if e.is_retriable() && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                warn!(node, attempt, "allocation state write conflicted, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
