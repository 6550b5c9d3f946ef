use crate::dht::identifier::{Cid, Tth};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// 每个内容哈希最多保存的来源数
pub const MAX_SOURCES_PER_FILE: usize = 10;

/// 索引中最多保存的内容哈希数
pub const MAX_INDEXED_FILES: usize = 10_000;

/// A peer announcing that it shares a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub cid: Cid,
    pub addr: SocketAddr,
    pub size: u64,
    pub partial: bool,
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    source: Source,
    announced_at: Instant,
}

/// Transient provider hints received through `PUB`.
///
/// Entries expire after the configured lifetime and disappear together with
/// their owner when it leaves the routing table.
#[derive(Debug)]
pub struct ProviderIndex {
    ttl: Duration,
    files: HashMap<Tth, Vec<ProviderEntry>>,
}

impl ProviderIndex {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            files: HashMap::new(),
        }
    }

    /// 添加来源，同一节点的旧记录被替换
    pub fn add(&mut self, tth: Tth, source: Source, now: Instant) -> bool {
        if !self.files.contains_key(&tth) && self.files.len() >= MAX_INDEXED_FILES {
            log::debug!("Provider index full, dropping hint for {}", tth);
            return false;
        }

        let ttl = self.ttl;
        let entries = self.files.entry(tth).or_default();
        entries.retain(|e| now.saturating_duration_since(e.announced_at) < ttl);
        entries.retain(|e| e.source.cid != source.cid);

        if entries.len() >= MAX_SOURCES_PER_FILE {
            // 替换最旧的记录
            entries.remove(0);
        }
        entries.push(ProviderEntry {
            source,
            announced_at: now,
        });
        true
    }

    pub fn find(&self, tth: &Tth, now: Instant) -> Vec<Source> {
        self.files
            .get(tth)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now.saturating_duration_since(e.announced_at) < self.ttl)
                    .map(|e| e.source.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops every hint announced by `cid`
    pub fn remove_node(&mut self, cid: &Cid) -> usize {
        let mut removed = 0;
        self.files.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| &e.source.cid != cid);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub fn purge(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.files.retain(|_, entries| {
            entries.retain(|e| now.saturating_duration_since(e.announced_at) < ttl);
            !entries.is_empty()
        });
    }

    /// Number of indexed content hashes
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }
}
