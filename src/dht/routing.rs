use crate::dht::config::DhtConfig;
use crate::dht::identifier::{Cid, Distance, ID_BITS};
use crate::dht::node::Node;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 单个k-bucket
///
/// Bucket `i` holds nodes sharing exactly `i` leading bits with the local
/// identifier; the last bucket holds everything sharing `i` or more bits and
/// is the only one allowed to split.
#[derive(Debug)]
struct Bucket {
    depth: usize,
    nodes: VecDeque<Arc<Node>>,
}

impl Bucket {
    fn new(depth: usize, capacity: usize) -> Self {
        Self {
            depth,
            nodes: VecDeque::with_capacity(capacity),
        }
    }

    fn position(&self, cid: &Cid) -> Option<usize> {
        self.nodes.iter().position(|n| n.cid() == cid)
    }

    /// 最久未见的过期节点
    fn eviction_candidate(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_stale())
            .min_by_key(|(_, n)| n.last_seen())
            .map(|(i, _)| i)
    }
}

/// Result of one expiration sweep
#[derive(Debug, Default)]
pub struct ExpirationReport {
    /// Nodes evicted from the table
    pub removed: Vec<Arc<Node>>,
    /// Number of nodes that went offline during this sweep
    pub went_offline: usize,
    /// Node selected for a liveness probe, already marked as probed
    pub probe: Option<Arc<Node>>,
}

/// 路由表实现，基于Kademlia的k-bucket结构
pub struct RoutingTable {
    /// 本地节点ID
    local_id: Cid,

    /// 每个bucket的容量 (k值)
    k: usize,

    /// k-buckets, 按与本地ID的公共前缀长度排列
    buckets: Vec<Bucket>,

    /// 地址到节点ID的映射，同一地址只允许一个节点
    addresses: HashMap<SocketAddr, Cid>,

    liveness_timeout: Duration,
    removal_timeout: Duration,
    response_timeout: Duration,

    /// 路由表自上次保存以来是否被修改
    dirty: bool,
}

impl RoutingTable {
    /// 创建新的路由表
    pub fn new(local_id: Cid, config: &DhtConfig) -> Self {
        let k = config.k_value.max(1);

        Self {
            local_id,
            k,
            buckets: vec![Bucket::new(0, k)],
            addresses: HashMap::new(),
            liveness_timeout: config.node_liveness_timeout,
            removal_timeout: config.node_removal_timeout,
            response_timeout: config.node_response_timeout,
            dirty: false,
        }
    }

    pub fn local_id(&self) -> &Cid {
        &self.local_id
    }

    /// 计算应该放入哪个bucket
    fn bucket_index(&self, cid: &Cid) -> usize {
        let prefix = self.local_id.common_prefix_len(cid);
        prefix.min(self.buckets.len() - 1)
    }

    /// Returns the table's node for `cid` (updated in place) or a new transient
    /// node that is not part of any bucket yet.
    ///
    /// An ip-verified address is never replaced by an unverified one.
    pub fn create_node(
        &mut self,
        cid: Cid,
        addr: SocketAddr,
        update: bool,
        ip_verified: bool,
        now: Instant,
    ) -> Arc<Node> {
        if let Some(node) = self.get_node(&cid) {
            let old_addr = node.addr();
            if old_addr != addr {
                if node.is_ip_verified() && !ip_verified {
                    return node;
                }

                let addr_free = self.addresses.get(&addr).map_or(true, |owner| *owner == cid);
                if update && addr_free {
                    self.addresses.remove(&old_addr);
                    self.addresses.insert(addr, cid);
                    node.set_addr(addr, ip_verified);
                    self.dirty = true;
                }
            }
            return node;
        }

        Arc::new(Node::new(cid, addr, ip_verified, now))
    }

    /// 添加节点到路由表
    ///
    /// Returns `false` when the node's bucket is full of live nodes and cannot
    /// split, or when another node already owns the node's address. The table
    /// is left unchanged in that case.
    pub fn add_node(&mut self, node: &Arc<Node>, make_online: bool) -> bool {
        if node.cid() == &self.local_id {
            return false;
        }

        if make_online {
            node.set_online(true);
        }

        let idx = self.bucket_index(node.cid());
        if let Some(pos) = self.buckets[idx].position(node.cid()) {
            // 已存在，移到队列末尾（最近看到的）
            if let Some(existing) = self.buckets[idx].nodes.remove(pos) {
                self.buckets[idx].nodes.push_back(existing);
            }
            return true;
        }

        let addr = node.addr();
        if let Some(owner) = self.addresses.get(&addr) {
            if owner != node.cid() {
                return false;
            }
        }

        loop {
            let idx = self.bucket_index(node.cid());
            let last = self.buckets.len() - 1;

            if self.buckets[idx].nodes.len() < self.k {
                self.insert_into(idx, node);
                return true;
            }

            // 只有包含本地ID的bucket可以分裂
            if idx == last && self.buckets.len() < ID_BITS {
                self.split_last();
                continue;
            }

            return match self.buckets[idx].eviction_candidate() {
                Some(pos) => {
                    if let Some(evicted) = self.buckets[idx].nodes.remove(pos) {
                        self.addresses.remove(&evicted.addr());
                        evicted.set_in_table(false);
                    }
                    self.insert_into(idx, node);
                    true
                }
                None => false,
            };
        }
    }

    fn insert_into(&mut self, idx: usize, node: &Arc<Node>) {
        self.buckets[idx].nodes.push_back(Arc::clone(node));
        self.addresses.insert(node.addr(), *node.cid());
        node.set_in_table(true);
        self.dirty = true;
    }

    /// Splits the last bucket, moving nodes that share more bits with the
    /// local identifier into a new last bucket.
    fn split_last(&mut self) {
        let depth = self.buckets.len() - 1;
        let mut next = Bucket::new(depth + 1, self.k);
        let local_id = self.local_id;

        let old = &mut self.buckets[depth];
        let (stay, moved): (VecDeque<_>, VecDeque<_>) = old
            .nodes
            .drain(..)
            .partition(|n| local_id.common_prefix_len(n.cid()) == depth);
        old.nodes = stay;
        next.nodes = moved;

        log::debug!("Split bucket {} ({} nodes moved)", depth, next.nodes.len());
        self.buckets.push(next);
    }

    /// Moves a known node to the most-recently-seen end of its bucket
    pub fn refresh(&mut self, cid: &Cid) {
        let idx = self.bucket_index(cid);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.position(cid) {
            if let Some(node) = bucket.nodes.remove(pos) {
                bucket.nodes.push_back(node);
            }
        }
    }

    /// 获取特定节点信息
    pub fn get_node(&self, cid: &Cid) -> Option<Arc<Node>> {
        let bucket = &self.buckets[self.bucket_index(cid)];
        bucket.nodes.iter().find(|n| n.cid() == cid).cloned()
    }

    pub fn remove_node(&mut self, cid: &Cid) -> Option<Arc<Node>> {
        let idx = self.bucket_index(cid);
        let pos = self.buckets[idx].position(cid)?;
        let node = self.buckets[idx].nodes.remove(pos)?;

        self.addresses.remove(&node.addr());
        node.set_in_table(false);
        self.dirty = true;
        Some(node)
    }

    /// 获取离目标节点最近的节点
    ///
    /// Only nodes whose type is at most `max_type` are returned. Sorting is
    /// stable, so equal distances keep bucket order.
    pub fn get_closest_nodes(&self, target: &Cid, max: usize, max_type: u8) -> Vec<Arc<Node>> {
        let mut nodes_with_distance: Vec<(Distance, Arc<Node>)> = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| n.node_type() <= max_type)
            .map(|n| (n.cid().distance(target), Arc::clone(n)))
            .collect();

        nodes_with_distance.sort_by(|a, b| a.0.cmp(&b.0));

        nodes_with_distance
            .into_iter()
            .take(max)
            .map(|(_, node)| node)
            .collect()
    }

    /// 清理过期节点
    ///
    /// Runs a single scan: idle nodes go offline, long-idle or dead nodes are
    /// evicted, and the least recently seen offline node is picked for a probe.
    /// Sending the probe is left to the caller.
    pub fn check_expiration(&mut self, now: Instant) -> ExpirationReport {
        let liveness = self.liveness_timeout;
        let removal = self.removal_timeout;
        let response = self.response_timeout;
        let mut report = ExpirationReport::default();

        for bucket in &mut self.buckets {
            bucket.nodes.retain(|node| {
                let idle = now.saturating_duration_since(node.last_seen());
                let probe_expired = node
                    .last_probe()
                    .map_or(false, |at| now.saturating_duration_since(at) >= response);

                if idle >= removal || (node.is_dead() && probe_expired) {
                    report.removed.push(Arc::clone(node));
                    return false;
                }

                if idle >= liveness && node.is_online() {
                    node.set_online(false);
                    report.went_offline += 1;
                }
                true
            });
        }

        for node in &report.removed {
            if self.addresses.get(&node.addr()) == Some(node.cid()) {
                self.addresses.remove(&node.addr());
            }
            node.set_in_table(false);
            node.set_online(false);
        }
        if !report.removed.is_empty() {
            self.dirty = true;
        }

        report.probe = self
            .buckets
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter(|n| !n.is_online() && !n.is_dead())
            .filter(|n| now.saturating_duration_since(n.last_seen()) >= liveness)
            .filter(|n| {
                n.last_probe()
                    .map_or(true, |at| now.saturating_duration_since(at) >= response)
            })
            .min_by_key(|n| n.last_seen())
            .cloned();

        if let Some(node) = &report.probe {
            node.mark_probed(now);
        }

        report
    }

    /// 获取路由表中的节点总数
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    /// 检查路由表是否为空
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.nodes.is_empty())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of nodes in bucket `idx`, zero when out of range
    pub fn bucket_len(&self, idx: usize) -> usize {
        self.buckets.get(idx).map_or(0, |b| b.nodes.len())
    }

    /// 获取路由表中的所有节点
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes.iter().cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        for node in self.all_nodes() {
            node.set_in_table(false);
        }
        self.buckets = vec![Bucket::new(0, self.k)];
        self.addresses.clear();
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Depth of the bucket holding `cid`
    pub fn depth_of(&self, cid: &Cid) -> usize {
        self.buckets[self.bucket_index(cid)].depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::identifier::CID_BYTES;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config(k: usize) -> DhtConfig {
        DhtConfig {
            k_value: k,
            node_liveness_timeout: Duration::from_secs(60),
            node_removal_timeout: Duration::from_secs(600),
            node_response_timeout: Duration::from_secs(10),
            ..DhtConfig::default()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    fn cid(first: u8, second: u8) -> Cid {
        let mut id = [0u8; CID_BYTES];
        id[0] = first;
        id[1] = second;
        Cid(id)
    }

    fn online_node(table: &mut RoutingTable, id: Cid, port: u16, now: Instant) -> Arc<Node> {
        let node = table.create_node(id, addr(port), true, false, now);
        assert!(table.add_node(&node, true));
        node
    }

    #[test]
    fn test_add_and_get_node() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));

        let node = table.create_node(cid(1, 0), addr(1000), true, false, now);
        assert!(!node.is_in_table());
        assert!(table.is_empty());

        assert!(table.add_node(&node, true));
        assert_eq!(table.len(), 1);
        assert!(node.is_in_table());
        assert!(node.is_online());
        assert!(table.is_dirty());

        let retrieved = table.get_node(&cid(1, 0)).unwrap();
        assert!(Arc::ptr_eq(&retrieved, &node));

        // 重复添加不会产生重复项
        assert!(table.add_node(&node, false));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_local_id_is_rejected() {
        let local = Cid::random();
        let mut table = RoutingTable::new(local, &test_config(4));
        let node = table.create_node(local, addr(1), true, false, Instant::now());
        assert!(!table.add_node(&node, true));
        assert!(table.is_empty());
    }

    #[test]
    fn test_create_node_updates_in_place() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        let node = online_node(&mut table, cid(0x80, 0), 1000, now);

        let same = table.create_node(cid(0x80, 0), addr(2000), true, false, now);
        assert!(Arc::ptr_eq(&same, &node));
        assert_eq!(node.addr(), addr(2000));

        // 不带 update 标志时地址不变
        table.create_node(cid(0x80, 0), addr(3000), false, false, now);
        assert_eq!(node.addr(), addr(2000));
    }

    #[test]
    fn test_verified_address_not_overwritten() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        let node = table.create_node(cid(0x80, 0), addr(1000), true, true, now);
        assert!(table.add_node(&node, true));

        table.create_node(cid(0x80, 0), addr(2000), true, false, now);
        assert_eq!(node.addr(), addr(1000));

        table.create_node(cid(0x80, 0), addr(2000), true, true, now);
        assert_eq!(node.addr(), addr(2000));
    }

    #[test]
    fn test_address_uniqueness() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        online_node(&mut table, cid(0x80, 0), 1000, now);

        let other = table.create_node(cid(0x40, 0), addr(1000), true, false, now);
        assert!(!table.add_node(&other, true));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_bucket_without_split_rejects_live_node() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(2));

        // 一个近节点迫使根bucket分裂，之后远端bucket不能再分裂
        online_node(&mut table, cid(0x01, 0), 1, now);
        online_node(&mut table, cid(0x80, 1), 2, now);
        online_node(&mut table, cid(0x80, 2), 3, now);
        assert_eq!(table.bucket_count(), 2);
        assert_eq!(table.depth_of(&cid(0x80, 2)), 0);
        assert_eq!(table.bucket_len(0), 2);

        let before: Vec<Cid> = table.all_nodes().iter().map(|n| *n.cid()).collect();
        let rejected = table.create_node(cid(0x90, 0), addr(5), true, false, now);
        assert!(!table.add_node(&rejected, true));

        let after: Vec<Cid> = table.all_nodes().iter().map(|n| *n.cid()).collect();
        assert_eq!(before, after);
        assert!(!rejected.is_in_table());
        assert!(table.bucket_len(0) <= 2);
    }

    #[test]
    fn test_full_bucket_evicts_stale_node() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(2));
        online_node(&mut table, cid(0x01, 0), 1, now);
        let stale = online_node(&mut table, cid(0x80, 1), 2, now);
        online_node(&mut table, cid(0x80, 2), 3, now);

        let oldest_live = table.get_node(&cid(0x80, 2)).unwrap();
        stale.set_online(false);

        let newcomer = table.create_node(cid(0x90, 0), addr(5), true, false, now);
        assert!(table.add_node(&newcomer, true));
        assert!(table.get_node(&cid(0x80, 1)).is_none());
        assert!(!stale.is_in_table());
        assert!(oldest_live.is_in_table());
        assert!(table.get_node(&cid(0x90, 0)).is_some());
    }

    #[test]
    fn test_split_keeps_all_nodes_reachable() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(3));

        let mut inserted = Vec::new();
        for i in 0..8u8 {
            // 不同的前缀长度
            let id = cid(0x80 >> i, i);
            let node = table.create_node(id, addr(100 + i as u16), true, false, now);
            if table.add_node(&node, true) {
                inserted.push(id);
            }
        }

        assert_eq!(inserted.len(), 8);
        assert!(table.bucket_count() > 1);
        for id in &inserted {
            assert!(table.get_node(id).is_some(), "node {:?} lost after split", id);
        }
        assert!(table.len() <= 3 * ID_BITS);
    }

    #[test]
    fn test_get_closest_sorted_and_truncated() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::random(), &test_config(20));
        for i in 1..30u16 {
            let node = table.create_node(Cid::random(), addr(i), true, false, now);
            table.add_node(&node, true);
        }

        let target = Cid::random();
        let closest = table.get_closest_nodes(&target, 5, 4);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(pair[0].cid().distance(&target) < pair[1].cid().distance(&target));
        }

        // 最近的节点必须是全局最近的
        let best = table
            .all_nodes()
            .into_iter()
            .min_by_key(|n| n.cid().distance(&target))
            .unwrap();
        assert_eq!(closest[0].cid(), best.cid());
    }

    #[test]
    fn test_get_closest_filters_by_type() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        let good = online_node(&mut table, cid(0x80, 0), 1, now);
        let probed = online_node(&mut table, cid(0x40, 0), 2, now);
        for _ in 0..3 {
            probed.mark_probed(now);
        }

        let closest = table.get_closest_nodes(&Cid::default(), 10, 2);
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].cid(), good.cid());
    }

    #[test]
    fn test_expiration_marks_offline_then_removes() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        let node = online_node(&mut table, cid(0x80, 0), 1, now);
        table.set_dirty(false);

        let report = table.check_expiration(now + Duration::from_secs(61));
        assert_eq!(report.went_offline, 1);
        assert!(report.removed.is_empty());
        assert!(!node.is_online());
        assert!(Arc::ptr_eq(report.probe.as_ref().unwrap(), &node));
        assert_eq!(node.node_type(), 1);

        let report = table.check_expiration(now + Duration::from_secs(600));
        assert_eq!(report.removed.len(), 1);
        assert!(table.is_empty());
        assert!(table.is_dirty());
        assert!(table.get_closest_nodes(&Cid::default(), 10, 4).is_empty());

        // 地址被释放
        let reuse = table.create_node(cid(0x40, 0), addr(1), true, false, now);
        assert!(table.add_node(&reuse, true));
    }

    #[test]
    fn test_dead_node_removed_after_response_timeout() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        let node = online_node(&mut table, cid(0x80, 0), 1, now);

        let mut t = now + Duration::from_secs(61);
        for _ in 0..4 {
            let report = table.check_expiration(t);
            assert!(report.removed.is_empty());
            t += Duration::from_secs(11);
        }
        assert!(node.is_dead());

        let report = table.check_expiration(t);
        assert_eq!(report.removed.len(), 1);
    }

    #[test]
    fn test_touched_node_survives_expiration() {
        let now = Instant::now();
        let mut table = RoutingTable::new(Cid::default(), &test_config(4));
        let node = online_node(&mut table, cid(0x80, 0), 1, now);

        node.touch(now + Duration::from_secs(590));
        let report = table.check_expiration(now + Duration::from_secs(600));
        assert!(report.removed.is_empty());
        assert!(report.probe.is_none());
        assert!(node.is_online());
    }
}
