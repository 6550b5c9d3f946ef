use crate::cli::helpers::{format_bytes, format_nodes, format_outcome};
use crate::dht::search::SearchOutcome;
use crate::dht::{Cid, DhtEngine, DhtError, InfType, Tth};
use crate::utils::random_token;

use colored::*;
use indoc::indoc;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// 命令结果
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Success(String),
    Info(String),
    Warning(String),
    Error(String),
    Exit,
}

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Help,
    Exit,
    Status,
    Nodes,
    Find,
    Lookup,
    Publish,
    Ping,
    Msg,
    FwCheck,
    Save,
}

/// 命令上下文
#[derive(Clone)]
pub struct CommandContext {
    pub engine: Arc<DhtEngine>,
    pub args: Vec<String>,
}

// DhtEngine 没有实现 Debug
impl std::fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandContext")
            .field("local_id", self.engine.local_id())
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// 根据名字查找命令
    pub fn from_name(name: &str) -> Option<Self> {
        let cmd = match name {
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            "status" => Command::Status,
            "nodes" => Command::Nodes,
            "find" => Command::Find,
            "lookup" => Command::Lookup,
            "publish" => Command::Publish,
            "ping" => Command::Ping,
            "msg" => Command::Msg,
            "fwcheck" => Command::FwCheck,
            "save" => Command::Save,
            _ => return None,
        };
        Some(cmd)
    }

    /// Names offered for completion
    pub fn names() -> &'static [&'static str] {
        &[
            "help", "exit", "status", "nodes", "find", "lookup", "publish", "ping", "msg", "fwcheck",
            "save",
        ]
    }

    /// 执行命令
    pub async fn execute(&self, context: CommandContext) -> CommandResult {
        match self {
            Command::Help => Self::help(),
            Command::Exit => CommandResult::Exit,
            Command::Status => Self::status(context),
            Command::Nodes => Self::nodes(context),
            Command::Find => Self::find(context),
            Command::Lookup => Self::lookup(context),
            Command::Publish => Self::publish(context),
            Command::Ping => Self::ping(context),
            Command::Msg => Self::msg(context),
            Command::FwCheck => Self::fwcheck(context),
            Command::Save => Self::save(context).await,
        }
    }

    /// 帮助命令
    fn help() -> CommandResult {
        let help_text = indoc! {"
            Available commands:

            /help                      - Show this help message
            /exit, /quit               - Stop the DHT and exit
            /status                    - Show DHT status
            /nodes                     - Show the routing table
            /find <tth>                - Search the DHT for sources of a file
            /lookup <cid>              - Look up a node by CID
            /publish <tth> <size>      - Announce a shared file
            /ping <ip:port>            - Send our INF to an address
            /msg <cid> <text>          - Send a private message
            /fwcheck                   - Check whether we are reachable over UDP
            /save                      - Save the routing table now
        "};

        CommandResult::Info(help_text.to_string())
    }

    /// 显示DHT状态
    fn status(context: CommandContext) -> CommandResult {
        let engine = &context.engine;

        let result = format!(
            indoc! {"
                DHT Status:
                  CID: {}
                  Port: {}
                  Nodes: {}
                  Connected: {}
                  Firewalled: {}
                  External IP: {}
                  Active searches: {}
                  Indexed files: {}
            "},
            engine.local_id().to_string().green(),
            engine
                .local_port()
                .map_or_else(|| "-".to_string(), |p| p.to_string())
                .cyan(),
            engine.get_nodes_count().to_string().green(),
            yes_no(engine.is_connected()),
            yes_no(engine.is_firewalled()),
            engine
                .get_last_external_ip()
                .map_or_else(|| "Unknown".to_string(), |ip| ip.to_string())
                .cyan(),
            engine.active_searches(),
            engine.provider_count(),
        );

        CommandResult::Info(result)
    }

    /// 显示路由表
    fn nodes(context: CommandContext) -> CommandResult {
        let nodes = context.engine.nodes();
        if nodes.is_empty() {
            return CommandResult::Info("DHT routing table is empty.".to_string());
        }

        CommandResult::Info(format!(
            "{} nodes:\n{}",
            nodes.len(),
            format_nodes(&nodes, Instant::now())
        ))
    }

    /// 查找文件
    fn find(context: CommandContext) -> CommandResult {
        let tth = match parse_id::<Tth>(&context.args, 0, "/find <tth>") {
            Ok(tth) => tth,
            Err(e) => return e,
        };

        let token = random_token();
        match context.engine.find_file(tth, &token) {
            Ok(rx) => {
                report_when_done(format!("file {}", tth), rx);
                CommandResult::Success(format!("Searching for {}", tth))
            }
            Err(e) => search_error(e),
        }
    }

    /// 查找节点
    fn lookup(context: CommandContext) -> CommandResult {
        let cid = match parse_id::<Cid>(&context.args, 0, "/lookup <cid>") {
            Ok(cid) => cid,
            Err(e) => return e,
        };

        match context.engine.find_node(cid) {
            Ok(rx) => {
                report_when_done(format!("node {}", cid), rx);
                CommandResult::Success(format!("Looking up {}", cid))
            }
            Err(e) => search_error(e),
        }
    }

    /// 发布文件
    fn publish(context: CommandContext) -> CommandResult {
        let usage = "/publish <tth> <size>";
        let tth = match parse_id::<Tth>(&context.args, 0, usage) {
            Ok(tth) => tth,
            Err(e) => return e,
        };
        let size = match context.args.get(1).map(|s| s.parse::<u64>()) {
            Some(Ok(size)) => size,
            Some(Err(_)) => return CommandResult::Error(format!("Invalid size: {}", context.args[1])),
            None => return CommandResult::Error(format!("Usage: {}", usage)),
        };

        match context.engine.publish_file(tth, size, false) {
            Ok(rx) => {
                report_when_done(format!("publish of {}", tth), rx);
                CommandResult::Success(format!("Publishing {} ({})", tth, format_bytes(size)))
            }
            Err(e) => search_error(e),
        }
    }

    fn ping(context: CommandContext) -> CommandResult {
        let addr = match context.args.first().map(|s| s.parse::<SocketAddr>()) {
            Some(Ok(addr)) => addr,
            Some(Err(_)) => return CommandResult::Error(format!("Invalid address: {}", context.args[0])),
            None => return CommandResult::Error("Usage: /ping <ip:port>".to_string()),
        };

        match context.engine.info(addr, InfType::PING | InfType::MAKE_ONLINE) {
            Ok(()) => CommandResult::Success(format!("Pinged {}", addr)),
            Err(e) => CommandResult::Error(format!("Ping failed: {}", e)),
        }
    }

    /// 发送私聊消息
    fn msg(context: CommandContext) -> CommandResult {
        if context.args.len() < 2 {
            return CommandResult::Error("Usage: /msg <cid> <text>".to_string());
        }
        let cid = match parse_id::<Cid>(&context.args, 0, "/msg <cid> <text>") {
            Ok(cid) => cid,
            Err(e) => return e,
        };
        let text = context.args[1..].join(" ");

        match context.engine.private_message(&cid, &text, false) {
            Ok(()) => CommandResult::Success(format!("Message sent to {}", cid)),
            Err(DhtError::UnknownNode(_)) => {
                CommandResult::Warning(format!("{} is not in the routing table, try /lookup first", cid))
            }
            Err(e) => CommandResult::Error(format!("Failed to send message: {}", e)),
        }
    }

    fn fwcheck(context: CommandContext) -> CommandResult {
        let asked = context.engine.probe_reachability();
        if asked == 0 {
            CommandResult::Warning("No online nodes to ask; the check runs once nodes answer".to_string())
        } else {
            CommandResult::Success(format!("Asked {} nodes to check our UDP port", asked))
        }
    }

    async fn save(context: CommandContext) -> CommandResult {
        let engine = context.engine.clone();
        // sled/文件写入放到阻塞线程
        match tokio::task::spawn_blocking(move || engine.save_data()).await {
            Ok(Ok(count)) => CommandResult::Success(format!("Saved {} nodes", count)),
            Ok(Err(e)) => CommandResult::Error(format!("Failed to save nodes: {}", e)),
            Err(e) => CommandResult::Error(format!("Save task failed: {}", e)),
        }
    }
}

fn yes_no(value: bool) -> ColoredString {
    if value {
        "yes".green()
    } else {
        "no".yellow()
    }
}

fn parse_id<T: std::str::FromStr>(args: &[String], index: usize, usage: &str) -> Result<T, CommandResult> {
    let raw = args
        .get(index)
        .ok_or_else(|| CommandResult::Error(format!("Usage: {}", usage)))?;
    raw.parse::<T>()
        .map_err(|_| CommandResult::Error(format!("Invalid identifier: {}", raw)))
}

fn search_error(e: DhtError) -> CommandResult {
    match e {
        DhtError::NoCandidates => {
            CommandResult::Warning("Routing table is empty, bootstrap first".to_string())
        }
        DhtError::DuplicateSearch(token) => {
            CommandResult::Warning(format!("Search {} is already running", token))
        }
        e => CommandResult::Error(format!("Search failed: {}", e)),
    }
}

/// 查找结束后打印结果
fn report_when_done(label: String, rx: oneshot::Receiver<SearchOutcome>) {
    tokio::spawn(async move {
        match rx.await {
            Ok(outcome) => println!("{}", format_outcome(&label, &outcome)),
            Err(_) => debug!("Search for {} was dropped", label),
        }
    });
}
