use crate::dht::bootstrap::{BootstrapSource, StaticBootstrap};
use crate::dht::collaborators::Collaborators;
use crate::dht::config::DhtConfig;
use crate::dht::firewall::FirewallCheck;
use crate::dht::flood::FloodGuard;
use crate::dht::identifier::{Cid, Tth};
use crate::dht::index::ProviderIndex;
use crate::dht::node::{Node, NodeSnapshot, DEAD_NODE_TYPE};
use crate::dht::persistence::{NodeRecord, PersistError, Snapshot, SnapshotStore};
use crate::dht::protocol::{format_node_entry, AdcCommand, CommandTag, InfType, SearchType};
use crate::dht::routing::{ExpirationReport, RoutingTable};
use crate::dht::search::{FinishedSearch, SearchKind, SearchManager, SearchOutcome, SearchSettings};
use crate::dht::transport::{Transport, UdpTransport};
use crate::dht::DhtError;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Protocol name announced in connection requests
pub const CONNECTION_PROTOCOL: &str = "ADC/1.0";

/// DHT引擎
///
/// Owns the routing table and every piece of transient state. Each concern is
/// guarded by its own lock and no lock is held while sending.
pub struct DhtEngine {
    pub(super) config: DhtConfig,
    pub(super) local_id: Cid,
    pub(super) table: Mutex<RoutingTable>,
    pub(super) firewall: Mutex<FirewallCheck>,
    pub(super) searches: Mutex<SearchManager>,
    pub(super) providers: Mutex<ProviderIndex>,
    pub(super) flood: Mutex<FloodGuard>,
    last_packet: Mutex<Option<Instant>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    store: Arc<dyn SnapshotStore>,
    bootstrap: Arc<dyn BootstrapSource>,
    pub(super) collaborators: Collaborators,
    /// 启动时从快照载入、待探测的节点
    restored: Mutex<Vec<SocketAddr>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DhtEngine {
    pub fn new(config: DhtConfig, local_id: Cid, store: Arc<dyn SnapshotStore>) -> Self {
        let settings = SearchSettings {
            k: config.k_value,
            alpha: config.alpha_value,
            query_timeout: config.search_query_timeout,
            node_lifetime: config.search_node_lifetime,
            file_lifetime: config.search_file_lifetime,
        };

        Self {
            table: Mutex::new(RoutingTable::new(local_id, &config)),
            firewall: Mutex::new(FirewallCheck::new(config.fw_responses, config.fw_check_window)),
            searches: Mutex::new(SearchManager::new(local_id, settings)),
            providers: Mutex::new(ProviderIndex::new(config.provider_ttl)),
            flood: Mutex::new(FloodGuard::new(config.flood_window)),
            last_packet: Mutex::new(None),
            transport: RwLock::new(None),
            store,
            bootstrap: Arc::new(StaticBootstrap::default()),
            collaborators: Collaborators::default(),
            restored: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
            local_id,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn BootstrapSource>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn local_id(&self) -> &Cid {
        &self.local_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 启动DHT: 载入快照, 绑定UDP端口, 启动定时任务
    pub async fn start(self: &Arc<Self>) -> Result<(), DhtError> {
        if self.is_running() {
            return Ok(());
        }

        let loaded = self.load_data();
        debug!("Loaded {} nodes from snapshot", loaded);

        let transport = UdpTransport::bind(self.config.listen_addr).await?;
        let weak = Arc::downgrade(self);
        transport.spawn_receiver(move |data, from| {
            if let Some(engine) = weak.upgrade() {
                engine.dispatch(data, from, false);
            }
        });

        self.start_with_transport(Arc::new(transport));
        Ok(())
    }

    /// Starts timers and bootstrap on an already opened transport
    pub fn start_with_transport(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        self.attach_transport(transport);

        self.spawn_timer(self.config.expiration_interval, |engine, now| {
            engine.check_expiration(now);
            engine.check_fw_window(now);
            engine.flood.lock().purge(now);
            engine.providers.lock().purge(now);
            if engine.get_nodes_count() < engine.config.k_value {
                engine.refresh_table();
            }
        });

        self.spawn_timer(self.config.save_interval, |engine, _| {
            if engine.is_dirty() {
                if let Err(e) = engine.save_data() {
                    warn!("Failed to save DHT nodes: {}", e);
                }
            }
        });

        self.spawn_timer(self.config.search_interval, |engine, now| {
            engine.process_searches(now);
        });

        self.bootstrap_nodes();
        info!(
            "DHT started as {} on port {}",
            self.local_id,
            self.local_port().unwrap_or_default()
        );
    }

    /// Uses `transport` for sending without spawning any task
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write() = Some(transport);
        self.running.store(true, Ordering::SeqCst);
    }

    fn spawn_timer<F>(self: &Arc<Self>, period: Duration, tick: F)
    where
        F: Fn(&DhtEngine, Instant) + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 第一次tick立即返回
            interval.tick().await;

            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(engine) => tick(&engine, Instant::now()),
                    None => break,
                }
            }
        });

        self.tasks.lock().push(handle);
    }

    /// 停止DHT
    ///
    /// The routing table is always saved. Unless `exiting`, all in-memory
    /// state is dropped so the engine can be started again from the snapshot.
    pub fn stop(&self, exiting: bool) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            transport.close();
        }

        match self.save_data() {
            Ok(count) => info!("Saved {} DHT nodes", count),
            Err(e) => warn!("Failed to save DHT nodes: {}", e),
        }

        if !exiting {
            self.table.lock().clear();
            self.searches.lock().clear();
            self.providers.lock().clear();
            self.restored.lock().clear();
            *self.last_packet.lock() = None;
        }
        info!("DHT stopped");
    }

    /// Pings restored and seed nodes, asking seeds for their node lists
    fn bootstrap_nodes(&self) {
        let restored: Vec<SocketAddr> = std::mem::take(&mut *self.restored.lock());
        for addr in restored {
            self.ping(addr);
        }

        let seeds = self.bootstrap.seed_nodes();
        if seeds.is_empty() {
            return;
        }

        info!("Bootstrapping from {} seed nodes", seeds.len());
        let now = Instant::now();
        for seed in seeds {
            if let Some(cid) = seed.cid {
                let mut table = self.table.lock();
                let node = table.create_node(cid, seed.addr, false, false, now);
                table.add_node(&node, false);
            }
            self.ping(seed.addr);

            let mut get = AdcCommand::new(CommandTag::Get, self.local_id);
            get.add_param("nodes");
            self.send(&get, seed.addr);
        }
    }

    fn ping(&self, addr: SocketAddr) {
        if let Err(e) = self.info(addr, InfType::PING | InfType::MAKE_ONLINE) {
            debug!("Failed to ping {}: {}", addr, e);
        }
    }

    /// Looks up our own identifier to fill nearby buckets
    pub fn refresh_table(&self) {
        match self.find_node(self.local_id) {
            Ok(_) => debug!("Refreshing routing table"),
            Err(DhtError::NoCandidates) | Err(DhtError::DuplicateSearch(_)) => {}
            Err(e) => debug!("Routing table refresh failed: {}", e),
        }
    }

    // -- routing table ----------------------------------------------------

    pub fn create_node(&self, cid: Cid, addr: SocketAddr, update: bool, udp_key_valid: bool) -> Arc<Node> {
        self.table
            .lock()
            .create_node(cid, addr, update, udp_key_valid, Instant::now())
    }

    pub fn add_node(&self, node: &Arc<Node>, make_online: bool) -> bool {
        self.table.lock().add_node(node, make_online)
    }

    pub fn get_nodes_count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn get_node(&self, cid: &Cid) -> Option<Arc<Node>> {
        self.table.lock().get_node(cid)
    }

    pub fn get_closest_nodes(&self, target: &Cid, max: usize, max_type: u8) -> Vec<Arc<Node>> {
        self.table.lock().get_closest_nodes(target, max, max_type)
    }

    /// Point-in-time view of every node in the table
    pub fn nodes(&self) -> Vec<NodeSnapshot> {
        self.table
            .lock()
            .all_nodes()
            .iter()
            .map(|n| n.snapshot())
            .collect()
    }

    /// 清理过期节点并探测离线节点
    pub fn check_expiration(&self, now: Instant) -> ExpirationReport {
        let report = self.table.lock().check_expiration(now);

        if !report.removed.is_empty() {
            let mut providers = self.providers.lock();
            for node in &report.removed {
                providers.remove_node(node.cid());
            }
            debug!("Expired {} DHT nodes", report.removed.len());
        }

        if let Some(node) = &report.probe {
            debug!("Probing {:?} (type {})", node.cid(), node.node_type());
            self.ping(node.addr());
        }
        report
    }

    // -- messaging --------------------------------------------------------

    /// Entry point for every received datagram. Never fails; bad input is dropped.
    pub fn dispatch(&self, data: &[u8], from: SocketAddr, udp_key_valid: bool) {
        let line = match std::str::from_utf8(data) {
            Ok(line) => line,
            Err(_) => {
                debug!("Dropping non UTF-8 packet from {}", from);
                return;
            }
        };

        let cmd = match AdcCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        if !is_valid_source(&from) {
            debug!("Dropping {} from invalid address {}", cmd.tag, from);
            return;
        }

        if cmd.from == self.local_id {
            debug!("Dropping {} carrying our own CID from {}", cmd.tag, from);
            return;
        }

        let now = Instant::now();
        if !self.flood.lock().check(from.ip(), &cmd, now) {
            return;
        }

        let node = {
            let mut table = self.table.lock();
            let node = table.create_node(cmd.from, from, true, udp_key_valid, now);
            node.touch(now);
            table.refresh(node.cid());
            node
        };
        *self.last_packet.lock() = Some(now);

        self.handle_command(node, cmd, from, now);
    }

    /// Sends a command; failures are logged
    pub(super) fn send(&self, cmd: &AdcCommand, addr: SocketAddr) {
        let transport = match self.transport.read().clone() {
            Some(transport) => transport,
            None => {
                debug!("Not sending {} to {}: DHT is not running", cmd.tag, addr);
                return;
            }
        };

        self.flood
            .lock()
            .track_outgoing(addr.ip(), cmd.tag, Instant::now());

        if let Err(e) = transport.send_datagram(cmd.to_bytes(), addr) {
            debug!("Failed to send {} to {}: {}", cmd.tag, addr, e);
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        self.transport.read().as_ref().map(|t| t.local_port())
    }

    /// 发送我们的 INF
    pub fn info(&self, addr: SocketAddr, inf_type: InfType) -> Result<(), DhtError> {
        let port = self.local_port().ok_or(DhtError::NotRunning)?;

        let mut cmd = AdcCommand::new(CommandTag::Inf, self.local_id);
        cmd.add_named("TY", inf_type.0);
        cmd.add_named("NI", &self.config.nick);
        cmd.add_named("VE", concat!("adc-dht ", env!("CARGO_PKG_VERSION")));
        cmd.add_named("U4", port);

        let firewalled = {
            let mut firewall = self.firewall.lock();
            if firewall.want_check(addr.ip()) {
                cmd.add_named("FW", 1);
            }
            firewall.is_firewalled()
        };
        cmd.add_named("SU", if firewalled { "UDP4" } else { "TCP4,UDP4" });

        self.send(&cmd, addr);
        Ok(())
    }

    /// 请求与节点建立连接
    pub fn connect(&self, cid: &Cid, token: &str) -> Result<(), DhtError> {
        let node = self.get_node(cid).ok_or(DhtError::UnknownNode(*cid))?;

        let cmd = if self.is_firewalled() {
            let mut cmd = AdcCommand::new(CommandTag::Rcm, self.local_id);
            cmd.add_param(CONNECTION_PROTOCOL).add_param(token);
            cmd
        } else {
            let mut cmd = AdcCommand::new(CommandTag::Ctm, self.local_id);
            cmd.add_param(CONNECTION_PROTOCOL)
                .add_param(self.config.tcp_port.to_string())
                .add_param(token);
            cmd
        };

        self.send(&cmd, node.addr());
        Ok(())
    }

    /// 发送私聊消息
    pub fn private_message(&self, cid: &Cid, text: &str, third_person: bool) -> Result<(), DhtError> {
        let node = self.get_node(cid).ok_or(DhtError::UnknownNode(*cid))?;

        let mut cmd = AdcCommand::new(CommandTag::Msg, self.local_id);
        cmd.add_param(text);
        if third_person {
            cmd.add_named("ME", 1);
        }

        self.send(&cmd, node.addr());
        Ok(())
    }

    // -- searches ---------------------------------------------------------

    fn start_search(
        &self,
        token: String,
        target: Tth,
        kind: SearchKind,
    ) -> Result<oneshot::Receiver<SearchOutcome>, DhtError> {
        if !self.is_running() {
            return Err(DhtError::NotRunning);
        }

        let now = Instant::now();
        let seeds = self.get_closest_nodes(&target, self.config.k_value, self.config.max_node_type);
        let rx = self.searches.lock().start(token, target, kind, seeds, now)?;

        self.process_searches(now);
        Ok(rx)
    }

    /// 查找文件来源
    pub fn find_file(&self, tth: Tth, token: &str) -> Result<oneshot::Receiver<SearchOutcome>, DhtError> {
        self.start_search(token.to_string(), tth, SearchKind::File)
    }

    /// 查找节点
    pub fn find_node(&self, cid: Cid) -> Result<oneshot::Receiver<SearchOutcome>, DhtError> {
        self.start_search(crate::utils::random_token(), cid, SearchKind::Node)
    }

    /// Announces a shared file to the nodes closest to its hash
    pub fn publish_file(
        &self,
        tth: Tth,
        size: u64,
        partial: bool,
    ) -> Result<oneshot::Receiver<SearchOutcome>, DhtError> {
        self.start_search(crate::utils::random_token(), tth, SearchKind::Store { size, partial })
    }

    /// Drives all running searches one step
    pub fn process_searches(&self, now: Instant) {
        let result = self.searches.lock().process(now);

        for query in result.queries {
            let ty = match query.kind {
                SearchKind::Node => SearchType::Node,
                SearchKind::File => SearchType::File,
                SearchKind::Store { .. } => SearchType::Store,
            };

            let mut cmd = AdcCommand::new(CommandTag::Sch, self.local_id);
            cmd.add_named("TO", &query.token)
                .add_named("TR", query.target)
                .add_named("TY", ty.as_param());
            self.send(&cmd, query.node.addr());
        }

        for finished in result.finished {
            self.search_finished(finished);
        }
    }

    fn search_finished(&self, finished: FinishedSearch) {
        match (&finished.kind, &finished.outcome) {
            (SearchKind::Store { size, partial }, outcome) => {
                let targets = outcome.closest();
                for node in targets {
                    let mut cmd = AdcCommand::new(CommandTag::Pub, self.local_id);
                    cmd.add_named("TR", finished.target).add_named("SI", size);
                    if *partial {
                        cmd.add_named("PF", 1);
                    }
                    self.send(&cmd, node.addr());
                }
                info!("Published {} to {} nodes", finished.target, targets.len());
            }
            (SearchKind::File, SearchOutcome::Found(sources)) => {
                info!("Found {} sources for {}", sources.len(), finished.target);
            }
            (_, outcome) => {
                debug!("Search {} for {} ended: {:?}", finished.token, finished.target, outcome);
            }
        }
    }

    pub fn active_searches(&self) -> usize {
        self.searches.lock().len()
    }

    pub fn provider_count(&self) -> usize {
        self.providers.lock().len()
    }

    /// Builds `ND` entries for the nodes closest to `target`
    pub(super) fn closest_entries(&self, target: &Cid, max: usize, exclude: &Cid) -> Vec<String> {
        self.get_closest_nodes(target, max, self.config.max_node_type)
            .iter()
            .filter(|n| n.cid() != exclude)
            .map(|n| format_node_entry(n.cid(), &n.addr()))
            .collect()
    }

    // -- reachability -----------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.last_packet
            .lock()
            .map_or(false, |at| at.elapsed() < self.config.connected_timeout)
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewall.lock().is_firewalled()
    }

    pub fn get_last_external_ip(&self) -> Option<IpAddr> {
        self.firewall.lock().last_external_ip()
    }

    pub fn set_request_fw_check(&self) {
        self.firewall.lock().request(Instant::now());
    }

    /// Starts a reachability check and pings enough nodes to answer it
    pub fn probe_reachability(&self) -> usize {
        self.set_request_fw_check();

        let nodes = self.get_closest_nodes(&Cid::random(), self.config.fw_responses, 0);
        for node in &nodes {
            self.ping(node.addr());
        }
        nodes.len()
    }

    pub fn check_fw_window(&self, now: Instant) -> bool {
        let expired = self.firewall.lock().check_window(now);
        if expired {
            info!("No reachability answers, assuming firewalled");
        }
        expired
    }

    // -- persistence ------------------------------------------------------

    pub fn set_dirty(&self) {
        self.table.lock().set_dirty(true);
    }

    pub fn is_dirty(&self) -> bool {
        self.table.lock().is_dirty()
    }

    /// 保存路由表
    pub fn save_data(&self) -> Result<usize, PersistError> {
        let now = Instant::now();
        let now_utc = Utc::now();

        // 快照和清除脏标记在同一把锁内, 保存期间的修改会重新置脏
        let nodes = {
            let mut table = self.table.lock();
            table.set_dirty(false);
            table.all_nodes()
        };
        let records: Vec<NodeRecord> = nodes
            .iter()
            .filter(|n| n.node_type() < DEAD_NODE_TYPE)
            .map(|n| {
                let addr = n.addr();
                NodeRecord {
                    cid: *n.cid(),
                    ip: addr.ip(),
                    port: addr.port(),
                    last_seen: instant_to_utc(n.last_seen(), now, now_utc),
                    ip_verified: n.is_ip_verified(),
                }
            })
            .collect();

        let count = records.len();
        if let Err(e) = self.store.save(&Snapshot {
            saved_at: now_utc,
            nodes: records,
        }) {
            self.table.lock().set_dirty(true);
            return Err(e);
        }

        debug!("Saved {} DHT nodes", count);
        Ok(count)
    }

    /// 载入路由表快照, 返回载入的节点数
    ///
    /// Missing or unreadable data leaves the table empty.
    pub fn load_data(&self) -> usize {
        let snapshot = match self.store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return 0,
            Err(e) => {
                warn!("Failed to load DHT nodes, starting with an empty table: {}", e);
                return 0;
            }
        };

        let now = Instant::now();
        let now_utc = Utc::now();
        let mut loaded = Vec::new();
        {
            let mut table = self.table.lock();
            for record in snapshot.nodes {
                let age = (now_utc - record.last_seen).to_std().unwrap_or_default();
                if age >= self.config.node_removal_timeout {
                    continue;
                }

                let last_seen = now.checked_sub(age).unwrap_or(now);
                let node = Arc::new(Node::restored(
                    record.cid,
                    record.addr(),
                    last_seen,
                    record.ip_verified,
                ));
                if table.add_node(&node, false) {
                    loaded.push(record.addr());
                }
            }
            table.set_dirty(false);
        }

        let count = loaded.len();
        self.restored.lock().extend(loaded);
        count
    }
}

impl Drop for DhtEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn instant_to_utc(at: Instant, now: Instant, now_utc: DateTime<Utc>) -> DateTime<Utc> {
    let age = now.saturating_duration_since(at);
    chrono::Duration::from_std(age)
        .map(|age| now_utc - age)
        .unwrap_or(now_utc)
}

/// Rejects addresses no real peer can send from
pub fn is_valid_source(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
        IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
    }
}
