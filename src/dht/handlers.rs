use crate::dht::engine::DhtEngine;
use crate::dht::index::Source;
use crate::dht::node::Node;
use crate::dht::protocol::{
    parse_node_entry, parse_source_entry, AdcCommand, CommandTag, InfType, SearchType,
    STATUS_SUCCESS,
};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Key of the node-list exchange in GET/SND
pub(super) const NODES_KEY: &str = "nodes";

/// 命令处理
impl DhtEngine {
    pub(super) fn handle_command(&self, node: Arc<Node>, cmd: AdcCommand, from: SocketAddr, now: Instant) {
        match cmd.tag {
            CommandTag::Inf => self.handle_inf(node, &cmd, from),
            CommandTag::Sch => self.handle_sch(&node, &cmd, from, now),
            CommandTag::Res => self.handle_res(node, &cmd, from, now),
            CommandTag::Pub => self.handle_pub(&node, &cmd, from, now),
            CommandTag::Ctm => self.handle_ctm(&node, &cmd),
            CommandTag::Rcm => self.handle_rcm(&node, &cmd),
            CommandTag::Sta => self.handle_sta(&node, &cmd, from),
            CommandTag::Psr => self.handle_psr(&node, &cmd, from),
            CommandTag::Msg => self.handle_msg(&node, &cmd),
            CommandTag::Get => self.handle_get(&node, &cmd, from),
            CommandTag::Snd => self.handle_snd(&node, &cmd, now),
            CommandTag::Unknown(_) => {}
        }
    }

    /// 节点信息
    fn handle_inf(&self, node: Arc<Node>, cmd: &AdcCommand, from: SocketAddr) {
        let ty = cmd
            .named("TY")
            .and_then(|v| v.parse::<u8>().ok())
            .map(InfType)
            .unwrap_or_default();

        for param in &cmd.params {
            if let (Some(name), Some(value)) = (param.get(..2), param.get(2..)) {
                if name != "TY" && name != "FW" {
                    node.set_info(name, value);
                }
            }
        }

        if cmd.has_flag("FW") {
            // 告诉对方我们看到的地址
            let mut reply = AdcCommand::status(self.local_id, STATUS_SUCCESS, "FW check");
            reply.add_named("FC", "FWCHECK");
            match from.ip() {
                IpAddr::V4(ip) => reply.add_named("I4", ip),
                IpAddr::V6(ip) => reply.add_named("I6", ip),
            };
            reply.add_named("U4", from.port());
            self.send(&reply, from);
        }

        if ty.contains(InfType::PING) {
            if let Err(e) = self.info(from, InfType::NONE) {
                debug!("Failed to answer ping from {}: {}", from, e);
            }
        }

        let make_online = ty.contains(InfType::MAKE_ONLINE) || !ty.contains(InfType::PING);
        if !self.table.lock().add_node(&node, make_online) {
            debug!("No room for {:?} in routing table", node.cid());
        }
    }

    /// 搜索请求
    fn handle_sch(&self, node: &Arc<Node>, cmd: &AdcCommand, from: SocketAddr, now: Instant) {
        let token = match cmd.named("TO") {
            Some(token) => token,
            None => return,
        };
        let target = match cmd.named("TR").and_then(|t| t.parse().ok()) {
            Some(target) => target,
            None => {
                debug!("SCH without valid target from {}", from);
                return;
            }
        };
        let ty = cmd
            .named("TY")
            .and_then(SearchType::from_param)
            .unwrap_or(SearchType::Node);

        let mut res = AdcCommand::new(CommandTag::Res, self.local_id);
        res.add_named("TO", token);

        let mut answered = false;
        if ty == SearchType::File {
            let mut size = self.collaborators.content.has_file(&target);
            if size.is_some() {
                res.add_named("SO", self.local_id);
            }

            let sources = self.providers.lock().find(&target, now);
            for source in sources.iter().filter(|s| !s.partial) {
                res.add_named("SO", format!("{}@{}", source.cid, source.addr));
                size = size.or(Some(source.size));
            }

            if let Some(size) = size {
                res.add_named("SI", size);
                answered = true;
            }
        }

        if !answered {
            for entry in self.closest_entries(&target, self.config.k_value, node.cid()) {
                res.add_named("ND", entry);
            }
        }

        self.send(&res, from);
    }

    /// 搜索结果
    fn handle_res(&self, node: Arc<Node>, cmd: &AdcCommand, from: SocketAddr, now: Instant) {
        let token = match cmd.named("TO") {
            Some(token) => token,
            None => return,
        };

        {
            let searches = self.searches.lock();
            if !searches.is_active(token) {
                debug!("Discarding RES for unknown search {} from {}", token, from);
                return;
            }
            // 未被查询过的节点的回复不能改动路由表
            if !searches.was_queried(token, node.cid()) {
                debug!("Discarding RES for search {} from unqueried {}", token, from);
                return;
            }
        }

        // ND 节点还未联系过, 先以离线状态加入
        let nodes: Vec<Arc<Node>> = {
            let mut table = self.table.lock();
            let nodes: Vec<Arc<Node>> = cmd
                .named_all("ND")
                .filter_map(parse_node_entry)
                .filter(|(cid, _)| cid != &self.local_id)
                .map(|(cid, addr)| table.create_node(cid, addr, false, false, now))
                .collect();
            for n in &nodes {
                table.add_node(n, false);
            }
            table.add_node(&node, true);
            nodes
        };

        let size = cmd.named("SI").and_then(|s| s.parse().ok()).unwrap_or(0);
        let sources: Vec<Source> = cmd
            .named_all("SO")
            .filter_map(|entry| parse_source_entry(entry, from))
            .map(|(cid, addr)| Source {
                cid,
                addr,
                size,
                partial: false,
            })
            .collect();

        let accepted = self
            .searches
            .lock()
            .on_result(token, node.cid(), nodes, sources);
        if accepted {
            self.process_searches(now);
        }
    }

    /// 发布请求
    fn handle_pub(&self, node: &Arc<Node>, cmd: &AdcCommand, from: SocketAddr, now: Instant) {
        let tth = match cmd.named("TR").and_then(|t| t.parse().ok()) {
            Some(tth) => tth,
            None => return,
        };
        let size = cmd.named("SI").and_then(|s| s.parse().ok()).unwrap_or(0);

        let source = Source {
            cid: *node.cid(),
            addr: from,
            size,
            partial: cmd.has_flag("PF"),
        };
        if !self.providers.lock().add(tth, source, now) {
            return;
        }

        let mut reply = AdcCommand::status(self.local_id, STATUS_SUCCESS, "File published");
        reply.add_named("FC", "PUB").add_named("TR", tth);
        self.send(&reply, from);
    }

    fn handle_ctm(&self, node: &Arc<Node>, cmd: &AdcCommand) {
        let (protocol, port, token) = match (cmd.param(0), cmd.param(1), cmd.param(2)) {
            (Some(protocol), Some(port), Some(token)) => (protocol, port, token),
            _ => return,
        };
        let port = match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return,
        };

        self.collaborators
            .connections
            .connect_to_me(&node.snapshot(), protocol, port, token);
    }

    fn handle_rcm(&self, node: &Arc<Node>, cmd: &AdcCommand) {
        if let (Some(protocol), Some(token)) = (cmd.param(0), cmd.param(1)) {
            self.collaborators
                .connections
                .reverse_connect(&node.snapshot(), protocol, token);
        }
    }

    /// 状态消息
    fn handle_sta(&self, node: &Arc<Node>, cmd: &AdcCommand, from: SocketAddr) {
        let code = match cmd.param(0).and_then(|c| c.parse::<u16>().ok()) {
            Some(code) => code,
            None => return,
        };

        if code != STATUS_SUCCESS {
            warn!(
                "DHT status {:03} from {:?}: {}",
                code,
                node.cid(),
                cmd.param(1).unwrap_or_default()
            );
            return;
        }

        match cmd.named_from("FC", 2) {
            Some("FWCHECK") => {
                let ip = cmd
                    .named_from("I4", 2)
                    .or_else(|| cmd.named_from("I6", 2))
                    .and_then(|ip| ip.parse::<IpAddr>().ok());
                let port = cmd.named_from("U4", 2).and_then(|p| p.parse::<u16>().ok());
                let (ip, port) = match (ip, port) {
                    (Some(ip), Some(port)) => (ip, port),
                    _ => return,
                };
                let local_port = match self.local_port() {
                    Some(port) => port,
                    None => return,
                };

                let verdict = self
                    .firewall
                    .lock()
                    .on_response(from.ip(), SocketAddr::new(ip, port), local_port);
                if let Some(firewalled) = verdict {
                    info!(
                        "Reachability check finished: {} (external IP {})",
                        if firewalled { "firewalled" } else { "open" },
                        ip
                    );
                }
            }
            Some("PUB") => debug!("{:?} stored our publish", node.cid()),
            _ => {}
        }
    }

    /// 部分文件请求
    fn handle_psr(&self, node: &Arc<Node>, cmd: &AdcCommand, from: SocketAddr) {
        let reply_params = self
            .collaborators
            .partial_files
            .partial_request(&node.snapshot(), &cmd.params);

        if let Some(params) = reply_params {
            let mut reply = AdcCommand::new(CommandTag::Psr, self.local_id);
            for param in params {
                reply.add_param(param);
            }
            self.send(&reply, from);
        }
    }

    fn handle_msg(&self, node: &Arc<Node>, cmd: &AdcCommand) {
        if let Some(text) = cmd.param(0) {
            self.collaborators
                .messages
                .private_message(&node.snapshot(), text, cmd.has_flag("ME"));
        }
    }

    fn handle_get(&self, node: &Arc<Node>, cmd: &AdcCommand, from: SocketAddr) {
        let key = match cmd.param(0) {
            Some(key) => key,
            None => return,
        };

        let mut reply = AdcCommand::new(CommandTag::Snd, self.local_id);
        reply.add_param(key);

        if key == NODES_KEY {
            let entries = self.closest_entries(node.cid(), self.config.max_node_list, node.cid());
            for entry in entries {
                reply.add_named("ND", entry);
            }
        } else {
            match self.collaborators.values.get(key) {
                Some(value) => {
                    reply.add_param(value);
                }
                None => return,
            }
        }

        self.send(&reply, from);
    }

    fn handle_snd(&self, node: &Arc<Node>, cmd: &AdcCommand, now: Instant) {
        let key = match cmd.param(0) {
            Some(key) => key,
            None => return,
        };

        if key == NODES_KEY {
            let mut table = self.table.lock();
            let mut added = 0;
            for (cid, addr) in cmd.named_all("ND").filter_map(parse_node_entry) {
                if cid == self.local_id {
                    continue;
                }
                let n = table.create_node(cid, addr, false, false, now);
                if table.add_node(&n, false) {
                    added += 1;
                }
            }
            debug!("Merged {} nodes from {:?}", added, node.cid());
        } else if let Some(value) = cmd.param(1) {
            self.collaborators
                .values
                .put(&node.snapshot(), key, value);
        }
    }
}
