use adc_dht::dht::{Cid, DhtConfig, DhtEngine, MemoryStore, RoutingTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

fn addr(i: u32) -> SocketAddr {
    format!("10.{}.{}.{}:6250", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff)
        .parse()
        .unwrap()
}

#[test]
fn test_distance_is_symmetric() {
    for _ in 0..100 {
        let a = Cid::random();
        let b = Cid::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
        if a != b {
            assert!(!a.distance(&b).is_zero());
        }
    }
}

/// 路由表为空时, 添加一个引导节点后节点数为1
#[test]
fn test_bootstrap_node_counts() {
    let engine = DhtEngine::new(DhtConfig::default(), Cid::random(), Arc::new(MemoryStore::new()));
    assert_eq!(engine.get_nodes_count(), 0);

    let node = engine.create_node(Cid::random(), addr(1), false, false);
    assert!(engine.add_node(&node, true));
    assert_eq!(engine.get_nodes_count(), 1);
}

#[test]
fn test_buckets_never_exceed_k() {
    let config = DhtConfig {
        k_value: 4,
        ..DhtConfig::default()
    };
    let mut table = RoutingTable::new(Cid::random(), &config);
    let now = Instant::now();

    for i in 0..500 {
        let node = table.create_node(Cid::random(), addr(i), false, false, now);
        table.add_node(&node, true);
    }

    for idx in 0..table.bucket_count() {
        assert!(table.bucket_len(idx) <= 4, "bucket {} overflowed", idx);
    }
    assert!(table.len() <= 4 * table.bucket_count());
}

#[test]
fn test_full_bucket_of_live_nodes_is_unchanged() {
    let config = DhtConfig {
        k_value: 2,
        ..DhtConfig::default()
    };
    let mut local = [0u8; 24];
    local[0] = 0xff;
    let mut table = RoutingTable::new(Cid(local), &config);
    let now = Instant::now();

    // 都落在与本地ID最远的bucket
    let far = |n: u8| {
        let mut id = [0u8; 24];
        id[23] = n;
        Cid(id)
    };
    // 一个与本地ID共享前缀的节点让根bucket分裂
    let mut near = local;
    near[23] = 1;

    assert!({
        let n = table.create_node(Cid(near), addr(100), false, false, now);
        table.add_node(&n, true)
    });
    for i in 1..=2 {
        let n = table.create_node(far(i), addr(i as u32), false, false, now);
        assert!(table.add_node(&n, true));
    }
    let before: Vec<Cid> = table.all_nodes().iter().map(|n| *n.cid()).collect();

    let extra = table.create_node(far(3), addr(3), false, false, now);
    assert!(!table.add_node(&extra, true));
    let after: Vec<Cid> = table.all_nodes().iter().map(|n| *n.cid()).collect();
    assert_eq!(before, after);
    assert!(!extra.is_in_table());
}

#[test]
fn test_closest_nodes_sorted_and_truncated() {
    let mut table = RoutingTable::new(Cid::random(), &DhtConfig::default());
    let now = Instant::now();
    for i in 0..200 {
        let node = table.create_node(Cid::random(), addr(i), false, false, now);
        table.add_node(&node, true);
    }

    let target = Cid::random();
    let closest = table.get_closest_nodes(&target, 8, 0);
    assert_eq!(closest.len(), 8);
    for pair in closest.windows(2) {
        assert!(pair[0].cid().distance(&target) < pair[1].cid().distance(&target));
    }

    // 没有更近的节点被遗漏
    let worst = closest[7].cid().distance(&target);
    let closer = table
        .all_nodes()
        .iter()
        .filter(|n| n.cid().distance(&target) < worst)
        .count();
    assert_eq!(closer, 7);
}

#[test]
fn test_expired_node_not_returned() {
    let config = DhtConfig::default();
    let mut table = RoutingTable::new(Cid::random(), &config);
    let now = Instant::now();

    let old = table.create_node(Cid::random(), addr(1), false, false, now);
    table.add_node(&old, true);

    let later = now + config.node_removal_timeout;
    let fresh = table.create_node(Cid::random(), addr(2), false, false, later);
    table.add_node(&fresh, true);

    let report = table.check_expiration(later);
    assert_eq!(report.removed.len(), 1);

    let results = table.get_closest_nodes(old.cid(), 10, u8::MAX);
    assert!(results.iter().all(|n| n.cid() != old.cid()));
    assert_eq!(results.len(), 1);
}
