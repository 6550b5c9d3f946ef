use crate::dht::identifier::Cid;
use std::net::SocketAddr;

/// 引导节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedNode {
    /// 已知时的节点ID，未知时只能先发送 INF 探测
    pub cid: Option<Cid>,
    pub addr: SocketAddr,
}

/// Source of seed nodes used on cold start
pub trait BootstrapSource: Send + Sync {
    fn seed_nodes(&self) -> Vec<SeedNode>;
}

/// 使用配置文件中的静态节点列表
#[derive(Debug, Clone, Default)]
pub struct StaticBootstrap {
    nodes: Vec<SeedNode>,
}

impl StaticBootstrap {
    pub fn new(nodes: Vec<SeedNode>) -> Self {
        Self { nodes }
    }

    /// Parses `cid@ip:port` or `ip:port` entries, skipping invalid ones
    pub fn from_strings<S: AsRef<str>>(entries: &[S]) -> Self {
        let nodes = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                match parse_seed(entry) {
                    Some(seed) => Some(seed),
                    None => {
                        log::warn!("Ignoring invalid bootstrap node '{}'", entry);
                        None
                    }
                }
            })
            .collect();

        Self { nodes }
    }

    /// 添加引导节点
    pub fn add(&mut self, seed: SeedNode) {
        if !self.nodes.contains(&seed) {
            self.nodes.push(seed);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl BootstrapSource for StaticBootstrap {
    fn seed_nodes(&self) -> Vec<SeedNode> {
        self.nodes.clone()
    }
}

/// 解析单个引导节点
pub fn parse_seed(entry: &str) -> Option<SeedNode> {
    match entry.split_once('@') {
        Some((cid, addr)) => Some(SeedNode {
            cid: Some(cid.parse().ok()?),
            addr: addr.parse().ok()?,
        }),
        None => Some(SeedNode {
            cid: None,
            addr: entry.parse().ok()?,
        }),
    }
}
