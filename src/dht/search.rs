use crate::dht::identifier::{Cid, Distance, Tth};
use crate::dht::index::Source;
use crate::dht::node::Node;
use crate::dht::DhtError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// 查找类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    /// 查找节点
    Node,
    /// 查找文件来源
    File,
    /// 查找发布目标
    Store { size: u64, partial: bool },
}

/// 查找结果
#[derive(Clone)]
pub enum SearchOutcome {
    /// Sources for the searched content
    Found(Vec<Source>),
    /// The searched node itself answered or was returned by a peer
    NodeFound(Arc<Node>),
    /// No closer node appeared during a full round
    Converged { closest: Vec<Arc<Node>> },
    /// The lookup lifetime elapsed first
    TimedOut { closest: Vec<Arc<Node>> },
}

impl SearchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, SearchOutcome::Found(_) | SearchOutcome::NodeFound(_))
    }

    /// Closest nodes known when the lookup ended
    pub fn closest(&self) -> &[Arc<Node>] {
        match self {
            SearchOutcome::Converged { closest } | SearchOutcome::TimedOut { closest } => closest,
            _ => &[],
        }
    }
}

impl fmt::Debug for SearchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchOutcome::Found(sources) => write!(f, "Found({} sources)", sources.len()),
            SearchOutcome::NodeFound(node) => write!(f, "NodeFound({:?})", node.cid()),
            SearchOutcome::Converged { closest } => write!(f, "Converged({} nodes)", closest.len()),
            SearchOutcome::TimedOut { closest } => write!(f, "TimedOut({} nodes)", closest.len()),
        }
    }
}

/// A query the engine has to send once the search lock is released
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub token: String,
    pub target: Tth,
    pub kind: SearchKind,
    pub node: Arc<Node>,
}

/// A search that ended during `process`
#[derive(Debug, Clone)]
pub struct FinishedSearch {
    pub token: String,
    pub target: Tth,
    pub kind: SearchKind,
    pub outcome: SearchOutcome,
}

/// Output of one driver tick
#[derive(Debug, Default)]
pub struct ProcessResult {
    pub queries: Vec<SearchQuery>,
    pub finished: Vec<FinishedSearch>,
}

/// 单个查找上下文
struct Search {
    token: String,
    target: Tth,
    kind: SearchKind,
    /// 按距离排序的候选节点
    candidates: Vec<Arc<Node>>,
    /// 已发送查询的节点
    queried: HashSet<Cid>,
    /// 等待回复的节点 -> 截止时间
    in_flight: HashMap<Cid, Instant>,
    round_best: Option<Distance>,
    improved: bool,
    rounds: usize,
    started: Instant,
    lifetime: Duration,
    sources: Vec<Source>,
    tx: Option<oneshot::Sender<SearchOutcome>>,
}

impl Search {
    fn best_distance(&self) -> Option<Distance> {
        self.candidates.first().map(|n| n.cid().distance(&self.target))
    }

    fn merge(&mut self, nodes: Vec<Arc<Node>>, local_id: &Cid, k: usize) {
        let before = self.best_distance();

        for node in nodes {
            if node.cid() == local_id {
                continue;
            }
            if self.candidates.iter().any(|c| c.cid() == node.cid()) {
                continue;
            }
            self.candidates.push(node);
        }

        let target = self.target;
        self.candidates.sort_by_key(|n| n.cid().distance(&target));
        // 已查询的节点不能被挤出，否则会重复查询
        let queried = &self.queried;
        let mut kept = 0usize;
        self.candidates.retain(|n| {
            if kept < k || queried.contains(n.cid()) {
                kept += 1;
                true
            } else {
                false
            }
        });

        let after = self.best_distance();
        let reference = self.round_best.or(before);
        if let (Some(after), Some(reference)) = (after, reference) {
            if after < reference {
                self.improved = true;
            }
        }
    }

    fn closest(&self, k: usize) -> Vec<Arc<Node>> {
        self.candidates.iter().take(k).cloned().collect()
    }

    fn lifetime_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.lifetime
    }

    /// 推进一步，返回结束原因或待发送的查询
    fn step(
        &mut self,
        now: Instant,
        alpha: usize,
        k: usize,
        timeout: Duration,
    ) -> Result<Vec<Arc<Node>>, SearchOutcome> {
        if !self.sources.is_empty() {
            return Err(SearchOutcome::Found(std::mem::take(&mut self.sources)));
        }

        if self.kind == SearchKind::Node {
            if let Some(node) = self.candidates.iter().find(|n| n.cid() == &self.target) {
                return Err(SearchOutcome::NodeFound(Arc::clone(node)));
            }
        }

        if self.lifetime_elapsed(now) {
            return Err(SearchOutcome::TimedOut {
                closest: self.closest(k),
            });
        }

        self.in_flight.retain(|_, deadline| *deadline > now);
        if !self.in_flight.is_empty() {
            return Ok(Vec::new());
        }

        // 一轮结束
        if self.rounds > 0 && !self.improved {
            return Err(SearchOutcome::Converged {
                closest: self.closest(k),
            });
        }

        let next: Vec<Arc<Node>> = self
            .candidates
            .iter()
            .filter(|n| !self.queried.contains(n.cid()))
            .take(alpha)
            .cloned()
            .collect();

        if next.is_empty() {
            return Err(SearchOutcome::Converged {
                closest: self.closest(k),
            });
        }

        self.rounds += 1;
        self.improved = false;
        self.round_best = self.best_distance();

        let deadline = now + timeout;
        for node in &next {
            self.queried.insert(*node.cid());
            self.in_flight.insert(*node.cid(), deadline);
        }
        Ok(next)
    }

    fn finish(&mut self, outcome: SearchOutcome) -> FinishedSearch {
        if let Some(tx) = self.tx.take() {
            // 接收方可能已经放弃等待
            let _ = tx.send(outcome.clone());
        }
        FinishedSearch {
            token: self.token.clone(),
            target: self.target,
            kind: self.kind,
            outcome,
        }
    }
}

/// Parameters shared by every lookup
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub k: usize,
    pub alpha: usize,
    pub query_timeout: Duration,
    pub node_lifetime: Duration,
    pub file_lifetime: Duration,
}

/// 管理所有正在进行的查找
///
/// The manager itself performs no I/O: `process` returns the queries to send
/// and the searches that ended, so the caller can release its lock first.
pub struct SearchManager {
    local_id: Cid,
    settings: SearchSettings,
    searches: HashMap<String, Search>,
}

impl SearchManager {
    pub fn new(local_id: Cid, settings: SearchSettings) -> Self {
        Self {
            local_id,
            settings,
            searches: HashMap::new(),
        }
    }

    /// 开始新的查找
    pub fn start(
        &mut self,
        token: String,
        target: Tth,
        kind: SearchKind,
        seeds: Vec<Arc<Node>>,
        now: Instant,
    ) -> Result<oneshot::Receiver<SearchOutcome>, DhtError> {
        if self.searches.contains_key(&token) {
            return Err(DhtError::DuplicateSearch(token));
        }

        let lifetime = match kind {
            SearchKind::File => self.settings.file_lifetime,
            SearchKind::Node | SearchKind::Store { .. } => self.settings.node_lifetime,
        };

        let (tx, rx) = oneshot::channel();
        let mut search = Search {
            token: token.clone(),
            target,
            kind,
            candidates: Vec::new(),
            queried: HashSet::new(),
            in_flight: HashMap::new(),
            round_best: None,
            improved: false,
            rounds: 0,
            started: now,
            lifetime,
            sources: Vec::new(),
            tx: Some(tx),
        };
        search.merge(seeds, &self.local_id, self.settings.k);

        if search.candidates.is_empty() {
            return Err(DhtError::NoCandidates);
        }

        log::debug!(
            "Search {} for {} started with {} candidates",
            token,
            target,
            search.candidates.len()
        );
        self.searches.insert(token, search);
        Ok(rx)
    }

    /// Drives every search one step
    pub fn process(&mut self, now: Instant) -> ProcessResult {
        let mut result = ProcessResult::default();
        let settings = &self.settings;

        let mut done = Vec::new();
        for (token, search) in self.searches.iter_mut() {
            match search.step(now, settings.alpha, settings.k, settings.query_timeout) {
                Ok(nodes) => {
                    result.queries.extend(nodes.into_iter().map(|node| SearchQuery {
                        token: token.clone(),
                        target: search.target,
                        kind: search.kind,
                        node,
                    }));
                }
                Err(outcome) => {
                    log::debug!("Search {} finished after {} rounds: {:?}", token, search.rounds, outcome);
                    result.finished.push(search.finish(outcome));
                    done.push(token.clone());
                }
            }
        }

        for token in done {
            self.searches.remove(&token);
        }
        result
    }

    /// Feeds a `RES` into the search with `token`; `false` when no such search exists
    pub fn on_result(
        &mut self,
        token: &str,
        from: &Cid,
        nodes: Vec<Arc<Node>>,
        sources: Vec<Source>,
    ) -> bool {
        let k = self.settings.k;
        let local_id = self.local_id;
        let search = match self.searches.get_mut(token) {
            Some(search) => search,
            None => return false,
        };

        // 只接受我们查询过的节点的回复
        if !search.queried.contains(from) {
            return false;
        }
        search.in_flight.remove(from);

        // 只有文件查找收集来源
        if search.kind == SearchKind::File {
            for source in sources {
                if !search.sources.iter().any(|s| s.cid == source.cid) {
                    search.sources.push(source);
                }
            }
        }
        search.merge(nodes, &local_id, k);
        true
    }

    pub fn is_active(&self, token: &str) -> bool {
        self.searches.contains_key(token)
    }

    /// Whether `node` has been queried by the search with `token`
    pub fn was_queried(&self, token: &str, node: &Cid) -> bool {
        self.searches
            .get(token)
            .map_or(false, |s| s.queried.contains(node))
    }

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }

    pub fn clear(&mut self) {
        self.searches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::identifier::CID_BYTES;
    use std::net::SocketAddr;

    fn settings() -> SearchSettings {
        SearchSettings {
            k: 10,
            alpha: 3,
            query_timeout: Duration::from_secs(3),
            node_lifetime: Duration::from_secs(20),
            file_lifetime: Duration::from_secs(45),
        }
    }

    fn cid(first: u8) -> Cid {
        let mut id = [0u8; CID_BYTES];
        id[0] = first;
        id[CID_BYTES - 1] = 1;
        Cid(id)
    }

    fn node(id: Cid, now: Instant) -> Arc<Node> {
        let addr: SocketAddr = format!("10.0.0.{}:6250", id.0[0]).parse().unwrap();
        Arc::new(Node::new(id, addr, false, now))
    }

    #[test]
    fn test_empty_seed_rejected() {
        let mut manager = SearchManager::new(Cid::random(), settings());
        let res = manager.start("t".into(), Cid::random(), SearchKind::File, vec![], Instant::now());
        assert!(matches!(res, Err(DhtError::NoCandidates)));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_duplicate_token_rejected() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::random(), settings());
        let seeds = vec![node(cid(1), now)];
        assert!(manager.start("t".into(), cid(9), SearchKind::File, seeds.clone(), now).is_ok());
        assert!(matches!(
            manager.start("t".into(), cid(9), SearchKind::File, seeds, now),
            Err(DhtError::DuplicateSearch(_))
        ));
    }

    #[test]
    fn test_queries_alpha_closest_first() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let target = cid(0);
        let seeds: Vec<_> = [0x40, 0x10, 0x80, 0x08, 0x20].iter().map(|b| node(cid(*b), now)).collect();
        manager.start("t".into(), target, SearchKind::File, seeds, now).unwrap();

        let result = manager.process(now);
        let queried: Vec<u8> = result.queries.iter().map(|q| q.node.cid().0[0]).collect();
        assert_eq!(queried, vec![0x08, 0x10, 0x20]);

        // 查询中的节点不会再次被查询
        let result = manager.process(now + Duration::from_secs(1));
        assert!(result.queries.is_empty());
    }

    #[test]
    fn test_found_sources() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let seed = node(cid(1), now);
        let mut rx = manager
            .start("t".into(), cid(2), SearchKind::File, vec![Arc::clone(&seed)], now)
            .unwrap();
        manager.process(now);

        let source = Source {
            cid: cid(1),
            addr: seed.addr(),
            size: 42,
            partial: false,
        };
        assert!(manager.on_result("t", seed.cid(), vec![], vec![source.clone()]));

        let result = manager.process(now);
        assert_eq!(result.finished.len(), 1);
        assert!(!manager.is_active("t"));
        match rx.try_recv().unwrap() {
            SearchOutcome::Found(sources) => assert_eq!(sources, vec![source]),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_store_lookup_ignores_sources() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let seed = node(cid(1), now);
        let kind = SearchKind::Store { size: 7, partial: false };
        let mut rx = manager
            .start("t".into(), cid(2), kind, vec![Arc::clone(&seed)], now)
            .unwrap();
        manager.process(now);

        let source = Source {
            cid: cid(1),
            addr: seed.addr(),
            size: 7,
            partial: false,
        };
        assert!(manager.on_result("t", seed.cid(), vec![], vec![source]));

        let result = manager.process(now);
        assert_eq!(result.finished.len(), 1);
        assert_eq!(result.finished[0].outcome.closest().len(), 1);
        assert!(matches!(rx.try_recv().unwrap(), SearchOutcome::Converged { .. }));
    }

    #[test]
    fn test_converges_without_requery() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let target = cid(0);
        let seeds: Vec<_> = (1..=4).map(|b| node(cid(b * 0x10), now)).collect();
        let mut rx = manager.start("t".into(), target, SearchKind::File, seeds, now).unwrap();

        let mut sent: Vec<Cid> = Vec::new();
        let mut t = now;
        for _ in 0..20 {
            let result = manager.process(t);
            for q in &result.queries {
                assert!(!sent.contains(q.node.cid()), "node queried twice");
                sent.push(*q.node.cid());
            }
            // 所有节点只返回更远的节点
            for q in result.queries {
                let far = node(cid(0xF0), now);
                manager.on_result("t", q.node.cid(), vec![far], vec![]);
            }
            if !result.finished.is_empty() {
                break;
            }
            t += Duration::from_millis(100);
        }

        assert!(!manager.is_active("t"));
        assert!(matches!(rx.try_recv().unwrap(), SearchOutcome::Converged { .. }));
        assert!(sent.len() <= 5);
    }

    #[test]
    fn test_unanswered_round_ends_by_deadline() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let seeds: Vec<_> = (1..=2).map(|b| node(cid(b), now)).collect();
        manager.start("t".into(), cid(0x80), SearchKind::Store { size: 1, partial: false }, seeds, now).unwrap();

        assert_eq!(manager.process(now).queries.len(), 2);
        assert!(manager.process(now + Duration::from_secs(2)).finished.is_empty());

        let result = manager.process(now + Duration::from_secs(3));
        assert_eq!(result.finished.len(), 1);
        assert_eq!(result.finished[0].outcome.closest().len(), 2);
    }

    #[test]
    fn test_timeout() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let mut rx = manager
            .start("t".into(), cid(9), SearchKind::Node, vec![node(cid(1), now)], now)
            .unwrap();
        manager.process(now);

        manager.process(now + Duration::from_secs(20));
        assert!(matches!(rx.try_recv().unwrap(), SearchOutcome::TimedOut { .. }));
    }

    #[test]
    fn test_node_found() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        let seed = node(cid(1), now);
        let target = cid(7);
        let mut rx = manager
            .start("t".into(), target, SearchKind::Node, vec![Arc::clone(&seed)], now)
            .unwrap();
        manager.process(now);

        manager.on_result("t", seed.cid(), vec![node(target, now)], vec![]);
        manager.process(now);
        match rx.try_recv().unwrap() {
            SearchOutcome::NodeFound(found) => assert_eq!(found.cid(), &target),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_result_for_unknown_token_is_ignored() {
        let mut manager = SearchManager::new(Cid::default(), settings());
        assert!(!manager.on_result("missing", &Cid::random(), vec![], vec![]));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_result_from_unqueried_node_is_ignored() {
        let now = Instant::now();
        let mut manager = SearchManager::new(Cid::default(), settings());
        manager
            .start("t".into(), cid(9), SearchKind::File, vec![node(cid(1), now)], now)
            .unwrap();
        assert!(!manager.on_result("t", &cid(1), vec![], vec![]));
    }
}
