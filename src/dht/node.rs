use crate::dht::identifier::Cid;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Node type after which a node is considered dead (four unanswered probes)
pub const DEAD_NODE_TYPE: u8 = 4;

/// 节点的可变状态
#[derive(Debug, Clone)]
struct NodeState {
    addr: SocketAddr,
    last_seen: Instant,
    /// 0 = 已确认在线, 每次探测未响应加一
    node_type: u8,
    ip_verified: bool,
    online: bool,
    in_table: bool,
    last_probe: Option<Instant>,
    /// INF 中携带的两字母字段 (NI, AP, VE ...)
    info: BTreeMap<String, String>,
}

/// A remote peer.
///
/// Nodes are shared between the routing table and running searches through
/// `Arc<Node>`; the identifier is immutable and everything else lives behind
/// a short-lived lock.
pub struct Node {
    cid: Cid,
    created: Instant,
    state: RwLock<NodeState>,
}

/// Point-in-time copy of a node handed to collaborators and the console
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub cid: Cid,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub node_type: u8,
    pub online: bool,
    pub ip_verified: bool,
    pub nick: Option<String>,
}

impl Node {
    pub fn new(cid: Cid, addr: SocketAddr, ip_verified: bool, now: Instant) -> Self {
        Self {
            cid,
            created: now,
            state: RwLock::new(NodeState {
                addr,
                last_seen: now,
                node_type: 0,
                ip_verified,
                online: false,
                in_table: false,
                last_probe: None,
                info: BTreeMap::new(),
            }),
        }
    }

    /// Rebuilds a node from persisted data; it starts offline.
    pub fn restored(cid: Cid, addr: SocketAddr, last_seen: Instant, ip_verified: bool) -> Self {
        Self::new(cid, addr, ip_verified, last_seen)
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn addr(&self) -> SocketAddr {
        self.state.read().addr
    }

    pub fn set_addr(&self, addr: SocketAddr, ip_verified: bool) {
        let mut state = self.state.write();
        state.addr = addr;
        state.ip_verified = ip_verified;
    }

    pub fn last_seen(&self) -> Instant {
        self.state.read().last_seen
    }

    /// 收到该节点的任何消息后调用
    pub fn touch(&self, now: Instant) {
        let mut state = self.state.write();
        if now > state.last_seen {
            state.last_seen = now;
        }
        state.node_type = 0;
        state.last_probe = None;
    }

    /// Records an outgoing liveness probe that has not been answered yet
    pub fn mark_probed(&self, now: Instant) {
        let mut state = self.state.write();
        if state.node_type < DEAD_NODE_TYPE {
            state.node_type += 1;
        }
        state.last_probe = Some(now);
    }

    pub fn last_probe(&self) -> Option<Instant> {
        self.state.read().last_probe
    }

    pub fn node_type(&self) -> u8 {
        self.state.read().node_type
    }

    pub fn is_dead(&self) -> bool {
        self.node_type() >= DEAD_NODE_TYPE
    }

    /// Offline or with an unanswered probe; such nodes may be evicted
    pub fn is_stale(&self) -> bool {
        let state = self.state.read();
        !state.online || state.node_type > 0
    }

    pub fn is_ip_verified(&self) -> bool {
        self.state.read().ip_verified
    }

    pub fn is_online(&self) -> bool {
        self.state.read().online
    }

    pub fn set_online(&self, online: bool) {
        self.state.write().online = online;
    }

    pub fn is_in_table(&self) -> bool {
        self.state.read().in_table
    }

    pub(crate) fn set_in_table(&self, in_table: bool) {
        self.state.write().in_table = in_table;
    }

    pub fn set_info(&self, name: &str, value: &str) {
        let mut state = self.state.write();
        if value.is_empty() {
            state.info.remove(name);
        } else {
            state.info.insert(name.to_string(), value.to_string());
        }
    }

    pub fn info(&self, name: &str) -> Option<String> {
        self.state.read().info.get(name).cloned()
    }

    pub fn nick(&self) -> Option<String> {
        self.info("NI")
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.read();
        NodeSnapshot {
            cid: self.cid,
            addr: state.addr,
            last_seen: state.last_seen,
            node_type: state.node_type,
            online: state.online,
            ip_verified: state.ip_verified,
            nick: state.info.get("NI").cloned(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Node")
            .field("cid", &self.cid)
            .field("addr", &state.addr)
            .field("node_type", &state.node_type)
            .field("online", &state.online)
            .finish()
    }
}
