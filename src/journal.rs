//! The durable prepared-claim journal: a map of claim uid to the devices
//! prepared for it, mirrored to disk before any prepare or unprepare returns
//! success and read back at agent startup. Writes go to a temp file that is
//! renamed into place, so a crash never leaves a partial journal.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;
use crate::state::AllocatedDevice;

pub struct PreparedClaims {
    path: PathBuf,
    map: RwLock<HashMap<String, Vec<AllocatedDevice>>>,
}

impl PreparedClaims {
    /// Loads the journal from `path`; a missing file is an empty journal.
    pub fn load(path: PathBuf) -> Result<Self> {
        let map = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        if !map.is_empty() {
            info!(claims = map.len(), path = %path.display(), "prepared-claim journal loaded");
        }
        Ok(PreparedClaims {
            path,
            map: RwLock::new(map),
        })
    }

    pub async fn get(&self, claim_uid: &str) -> Option<Vec<AllocatedDevice>> {
        self.map.read().await.get(claim_uid).cloned()
    }

    pub async fn contains(&self, claim_uid: &str) -> bool {
        self.map.read().await.contains_key(claim_uid)
    }

    /// Records the claim and persists before returning; the in-memory map
    /// and the file never diverge.
    pub async fn insert(&self, claim_uid: &str, devices: Vec<AllocatedDevice>) -> Result<()> {
        let mut map = self.map.write().await;
        map.insert(claim_uid.to_string(), devices);
        self.persist(&map)
    }

    pub async fn remove(&self, claim_uid: &str) -> Result<Option<Vec<AllocatedDevice>>> {
        let mut map = self.map.write().await;
        let removed = map.remove(claim_uid);
        if removed.is_some() {
            self.persist(&map)?;
        }
        Ok(removed)
    }

    pub async fn snapshot(&self) -> HashMap<String, Vec<AllocatedDevice>> {
        self.map.read().await.clone()
    }

    fn persist(&self, map: &HashMap<String, Vec<AllocatedDevice>>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        // BTreeMap ordering keeps the serialization stable across rewrites.
        let ordered: BTreeMap<&String, &Vec<AllocatedDevice>> = map.iter().collect();
        let mut bytes = serde_json::to_vec_pretty(&ordered)?;
        bytes.push(b'\n');
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;

    fn device(uid: &str) -> AllocatedDevice {
        AllocatedDevice {
            uid: uid.to_string(),
            device_type: DeviceType::Gpu,
            memory_mib: 14248,
            millicores: 1000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("preparedClaims.json");

        let journal = PreparedClaims::load(path.clone()).unwrap();
        journal
            .insert("claim-1", vec![device("dev-1"), device("dev-2")])
            .await
            .unwrap();
        drop(journal);

        let journal = PreparedClaims::load(path).unwrap();
        let devices = journal.get("claim-1").await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].uid, "dev-1");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = PreparedClaims::load(tmp.path().join("j.json")).unwrap();
        journal.insert("claim-1", vec![device("dev-1")]).await.unwrap();

        assert!(journal.remove("claim-1").await.unwrap().is_some());
        assert!(journal.remove("claim-1").await.unwrap().is_none());
        assert!(!journal.contains("claim-1").await);
    }

    #[tokio::test]
    async fn rewrite_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("j.json");
        let journal = PreparedClaims::load(path.clone()).unwrap();
        journal.insert("claim-b", vec![device("dev-2")]).await.unwrap();
        journal.insert("claim-a", vec![device("dev-1")]).await.unwrap();
        let before = fs::read(&path).unwrap();

        // Reload and persist without changes.
        let journal = PreparedClaims::load(path.clone()).unwrap();
        let map = journal.snapshot().await;
        journal.persist(&map).unwrap();
        let after = fs::read(&path).unwrap();
        assert_eq!(before, after);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_empty_journal() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = PreparedClaims::load(tmp.path().join("absent.json")).unwrap();
        assert!(journal.snapshot().await.is_empty());
    }
}
