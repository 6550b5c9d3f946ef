use crate::dht::protocol::{AdcCommand, CommandTag};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// How long an outgoing SCH/GET makes the matching reply acceptable
pub const REPLY_WINDOW: Duration = Duration::from_secs(3 * 60);

/// Per-window packet budget for an incoming command from one IP
fn budget(tag: CommandTag) -> Option<usize> {
    match tag {
        CommandTag::Sch => Some(20),
        CommandTag::Pub => Some(10),
        CommandTag::Msg => Some(10),
        CommandTag::Inf => Some(3),
        CommandTag::Psr => Some(3),
        CommandTag::Ctm => Some(2),
        CommandTag::Rcm => Some(2),
        CommandTag::Get => Some(2),
        CommandTag::Unknown(_) => Some(10),
        // 状态消息不限制; RES/SND 由请求记录决定
        CommandTag::Sta | CommandTag::Res | CommandTag::Snd => None,
    }
}

/// 防洪保护
///
/// Sliding-window accounting keyed by `(ip, command)`. Replies (`RES`, `SND`)
/// are only accepted from IPs we recently sent the matching request to.
#[derive(Debug)]
pub struct FloodGuard {
    window: Duration,
    received: HashMap<(IpAddr, CommandTag), VecDeque<Instant>>,
    requested: HashMap<(IpAddr, CommandTag), Instant>,
}

impl FloodGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            received: HashMap::new(),
            requested: HashMap::new(),
        }
    }

    /// Remembers an outgoing request so the reply passes the guard
    pub fn track_outgoing(&mut self, ip: IpAddr, tag: CommandTag, now: Instant) {
        let reply = match tag {
            CommandTag::Sch => CommandTag::Res,
            CommandTag::Get => CommandTag::Snd,
            _ => return,
        };
        self.requested.insert((ip, reply), now);
    }

    /// Returns `true` when the packet may be processed
    pub fn check(&mut self, ip: IpAddr, cmd: &AdcCommand, now: Instant) -> bool {
        if cmd.params.is_empty() {
            return false;
        }

        match cmd.tag {
            CommandTag::Sta => true,
            CommandTag::Res | CommandTag::Snd => self
                .requested
                .get(&(ip, cmd.tag))
                .map_or(false, |at| now.saturating_duration_since(*at) < REPLY_WINDOW),
            tag => {
                let limit = match budget(tag) {
                    Some(limit) => limit,
                    None => return true,
                };

                let window = self.window;
                let history = self.received.entry((ip, tag)).or_default();
                while let Some(front) = history.front() {
                    if now.saturating_duration_since(*front) >= window {
                        history.pop_front();
                    } else {
                        break;
                    }
                }

                if history.len() >= limit {
                    log::debug!("Flood guard dropped {} from {}", tag, ip);
                    return false;
                }
                history.push_back(now);
                true
            }
        }
    }

    /// 清理过期记录
    pub fn purge(&mut self, now: Instant) {
        let window = self.window;
        self.received.retain(|_, history| {
            history.retain(|at| now.saturating_duration_since(*at) < window);
            !history.is_empty()
        });
        self.requested
            .retain(|_, at| now.saturating_duration_since(*at) < REPLY_WINDOW);
    }

    pub fn tracked_len(&self) -> usize {
        self.received.len() + self.requested.len()
    }
}
