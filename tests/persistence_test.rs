use adc_dht::dht::{
    Cid, DhtConfig, DhtEngine, JsonFileStore, MemoryStore, SledStore, SnapshotStore,
};
use adc_dht::dht::persistence::{NodeRecord, PersistError, Snapshot};
use chrono::{Duration as ChronoDuration, Utc};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

fn fill(engine: &DhtEngine, count: u8) -> Vec<Cid> {
    (1..=count)
        .map(|i| {
            let cid = Cid::random();
            let addr: SocketAddr = format!("10.0.4.{}:6250", i).parse().unwrap();
            let node = engine.create_node(cid, addr, false, false);
            assert!(engine.add_node(&node, true));
            cid
        })
        .collect()
}

fn roundtrip(store: Arc<dyn SnapshotStore>) {
    let local_id = Cid::random();
    let first = DhtEngine::new(DhtConfig::default(), local_id, store.clone());
    let saved = fill(&first, 4);
    assert!(first.is_dirty());
    assert_eq!(first.save_data().unwrap(), 4);
    assert!(!first.is_dirty());

    let second = DhtEngine::new(DhtConfig::default(), local_id, store);
    assert_eq!(second.load_data(), 4);
    assert_eq!(second.get_nodes_count(), 4);
    for cid in &saved {
        let node = second.get_node(cid).expect("restored node missing");
        // 载入的节点需要重新确认
        assert!(!node.is_online());
    }
    assert!(!second.is_dirty());
}

/// 保存后用相同的本地ID重新载入
#[test]
fn test_roundtrip_memory() {
    roundtrip(Arc::new(MemoryStore::new()));
}

#[test]
fn test_roundtrip_json_file() {
    let dir = tempdir().unwrap();
    roundtrip(Arc::new(JsonFileStore::new(dir.path().join("dht.json"))));
}

#[test]
fn test_roundtrip_sled() {
    let dir = tempdir().unwrap();
    roundtrip(Arc::new(SledStore::open(dir.path().join("dht.db")).unwrap()));
}

#[test]
fn test_corrupt_file_starts_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dht.json");
    std::fs::write(&path, "{ this is not json").unwrap();

    let engine = DhtEngine::new(DhtConfig::default(), Cid::random(), Arc::new(JsonFileStore::new(&path)));
    assert_eq!(engine.load_data(), 0);
    assert_eq!(engine.get_nodes_count(), 0);

    // 下一次保存会覆盖损坏的文件
    fill(&engine, 1);
    assert_eq!(engine.save_data().unwrap(), 1);
    let reloaded = DhtEngine::new(DhtConfig::default(), Cid::random(), Arc::new(JsonFileStore::new(&path)));
    assert_eq!(reloaded.load_data(), 1);
}

#[test]
fn test_missing_file_starts_empty() {
    let dir = tempdir().unwrap();
    let engine = DhtEngine::new(
        DhtConfig::default(),
        Cid::random(),
        Arc::new(JsonFileStore::new(dir.path().join("absent.json"))),
    );
    assert_eq!(engine.load_data(), 0);
}

#[test]
fn test_old_records_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let record = |hours: i64, last: u8| NodeRecord {
        cid: Cid::random(),
        ip: format!("10.0.5.{}", last).parse().unwrap(),
        port: 6250,
        last_seen: now - ChronoDuration::hours(hours),
        ip_verified: false,
    };
    store
        .save(&Snapshot {
            saved_at: now,
            nodes: vec![record(1, 1), record(2, 2), record(4, 3)],
        })
        .unwrap();

    let engine = DhtEngine::new(DhtConfig::default(), Cid::random(), store);
    // 超过删除时间 (3小时) 的节点不再载入
    assert_eq!(engine.load_data(), 2);
}

#[test]
fn test_dead_nodes_are_not_saved() {
    let store = Arc::new(MemoryStore::new());
    let engine = DhtEngine::new(DhtConfig::default(), Cid::random(), store.clone());
    let cids = fill(&engine, 3);

    let dead = engine.get_node(&cids[0]).unwrap();
    for _ in 0..4 {
        dead.mark_probed(std::time::Instant::now());
    }
    assert!(dead.is_dead());

    assert_eq!(engine.save_data().unwrap(), 2);
    let snapshot = store.load().unwrap().unwrap();
    assert!(snapshot.nodes.iter().all(|r| r.cid != cids[0]));
}

/// 保存过程中会往路由表加入一个节点的存储
struct BusyStore {
    inner: MemoryStore,
    engine: Mutex<Option<Arc<DhtEngine>>>,
    fail: bool,
}

impl SnapshotStore for BusyStore {
    fn load(&self) -> Result<Option<Snapshot>, PersistError> {
        self.inner.load()
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistError> {
        if let Some(engine) = self.engine.lock().unwrap().take() {
            let node = engine.create_node(Cid::random(), "10.0.6.1:6250".parse().unwrap(), false, false);
            assert!(engine.add_node(&node, true));
        }
        if self.fail {
            return Err(PersistError::Corrupt("disk full".to_string()));
        }
        self.inner.save(snapshot)
    }
}

fn busy_engine(fail: bool) -> (Arc<DhtEngine>, Arc<BusyStore>) {
    let store = Arc::new(BusyStore {
        inner: MemoryStore::new(),
        engine: Mutex::new(None),
        fail,
    });
    let engine = Arc::new(DhtEngine::new(DhtConfig::default(), Cid::random(), store.clone()));
    *store.engine.lock().unwrap() = Some(engine.clone());
    (engine, store)
}

/// 保存期间加入的节点不在快照里, 路由表保持脏状态
#[test]
fn test_change_during_save_keeps_dirty() {
    let (engine, store) = busy_engine(false);
    fill(&engine, 2);

    assert_eq!(engine.save_data().unwrap(), 2);
    assert_eq!(engine.get_nodes_count(), 3);
    assert_eq!(store.load().unwrap().unwrap().nodes.len(), 2);
    assert!(engine.is_dirty());

    // 下一次保存写入全部节点
    assert_eq!(engine.save_data().unwrap(), 3);
    assert!(!engine.is_dirty());
}

#[test]
fn test_failed_save_stays_dirty() {
    let (engine, store) = busy_engine(true);
    fill(&engine, 1);

    assert!(engine.save_data().is_err());
    assert!(engine.is_dirty());
    assert!(store.load().unwrap().is_none());
}
