use crate::dht::identifier::Cid;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

const NODES_TREE: &str = "nodes";
const META_TREE: &str = "meta";
const SAVED_AT_KEY: &[u8] = b"saved_at";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

/// 持久化的节点记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub cid: Cid,
    pub ip: IpAddr,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub ip_verified: bool,
}

impl NodeRecord {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// 路由表快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<NodeRecord>,
}

/// Durable storage for routing-table snapshots
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    fn load(&self) -> Result<Option<Snapshot>, PersistError>;

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistError>;
}

/// 以JSON文件保存快照
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Option<Snapshot>, PersistError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Err(PersistError::Corrupt(format!(
                "{} is empty",
                self.path.display()
            )));
        }

        Ok(Some(serde_json::from_str(&content)?))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // 先写临时文件再重命名，避免写入中断产生损坏的文件
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            let content = serde_json::to_string_pretty(snapshot)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}

/// 使用sled数据库保存快照
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl SnapshotStore for SledStore {
    fn load(&self) -> Result<Option<Snapshot>, PersistError> {
        let meta = self.db.open_tree(META_TREE)?;
        let saved_at = match meta.get(SAVED_AT_KEY)? {
            Some(value) => bincode::deserialize::<DateTime<Utc>>(&value)?,
            None => return Ok(None),
        };

        let tree = self.db.open_tree(NODES_TREE)?;
        let mut nodes = Vec::new();
        for item in tree.iter() {
            let (_, value) = item?;
            nodes.push(bincode::deserialize::<NodeRecord>(&value)?);
        }

        Ok(Some(Snapshot { saved_at, nodes }))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        let tree = self.db.open_tree(NODES_TREE)?;

        let mut batch = sled::Batch::default();
        for key in tree.iter().keys() {
            batch.remove(key?);
        }
        for record in &snapshot.nodes {
            batch.insert(record.cid.as_bytes().as_ref(), bincode::serialize(record)?);
        }
        tree.apply_batch(batch)?;

        let meta = self.db.open_tree(META_TREE)?;
        meta.insert(SAVED_AT_KEY, bincode::serialize(&snapshot.saved_at)?)?;

        self.db.flush()?;
        Ok(())
    }
}

/// Keeps the last snapshot in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<Snapshot>, PersistError> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Snapshot {
        Snapshot {
            saved_at: Utc::now(),
            nodes: (0..3)
                .map(|i| NodeRecord {
                    cid: Cid::random(),
                    ip: "10.0.0.1".parse().unwrap(),
                    port: 6250 + i,
                    last_seen: Utc::now(),
                    ip_verified: i == 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("dht.json"));
        assert!(store.load().unwrap().is_none());

        let snapshot = sample();
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));
    }

    #[test]
    fn test_json_store_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dht.json");

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonFileStore::new(&path).load(), Err(PersistError::Json(_))));

        fs::write(&path, "").unwrap();
        assert!(matches!(JsonFileStore::new(&path).load(), Err(PersistError::Corrupt(_))));
    }

    #[test]
    fn test_json_record_requires_mandatory_fields() {
        let json = r#"{"saved_at":"2024-01-01T00:00:00Z","nodes":[{"cid":"00","ip":"10.0.0.1"}]}"#;
        assert!(serde_json::from_str::<Snapshot>(json).is_err());
    }

    #[test]
    fn test_sled_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path().join("db")).unwrap();
        assert!(store.load().unwrap().is_none());

        let mut snapshot = sample();
        store.save(&snapshot).unwrap();

        // 第二次保存替换旧记录
        snapshot.nodes.truncate(1);
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.nodes, snapshot.nodes);
        assert_eq!(loaded.saved_at, snapshot.saved_at);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        let snapshot = sample();
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));
    }
}
