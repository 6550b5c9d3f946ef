use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// 防火墙检测状态
///
/// While a check is requested, outgoing `INF` packets ask a limited number of
/// peers to report the address they saw us from. Once enough reports arrive,
/// a vote over the observed UDP ports decides whether we are reachable.
#[derive(Debug)]
pub struct FirewallCheck {
    firewalled: bool,
    request_fw_check: bool,
    requested_at: Option<Instant>,
    /// 已请求检测但尚未回复的IP
    firewalled_wanted: HashSet<IpAddr>,
    /// 已回复的IP -> 对方看到的外部地址
    firewalled_checks: HashMap<IpAddr, SocketAddr>,
    last_external_ip: Option<IpAddr>,
    required: usize,
    window: Duration,
}

impl FirewallCheck {
    pub fn new(required: usize, window: Duration) -> Self {
        Self {
            firewalled: true,
            request_fw_check: false,
            requested_at: None,
            firewalled_wanted: HashSet::new(),
            firewalled_checks: HashMap::new(),
            last_external_ip: None,
            required: required.max(1),
            window,
        }
    }

    /// Starts a new check cycle
    pub fn request(&mut self, now: Instant) {
        self.request_fw_check = true;
        self.requested_at = Some(now);
        self.firewalled_wanted.clear();
        self.firewalled_checks.clear();
    }

    pub fn is_requested(&self) -> bool {
        self.request_fw_check
    }

    /// Returns `true` when the next `INF` to `ip` should carry `FW1`
    pub fn want_check(&mut self, ip: IpAddr) -> bool {
        if !self.request_fw_check {
            return false;
        }
        if self.firewalled_wanted.len() + self.firewalled_checks.len() >= self.required {
            return false;
        }
        if self.firewalled_checks.contains_key(&ip) {
            return false;
        }
        self.firewalled_wanted.insert(ip);
        true
    }

    /// Records a reachability report from `responder`.
    ///
    /// Returns the new classification once enough reports are collected.
    pub fn on_response(
        &mut self,
        responder: IpAddr,
        observed: SocketAddr,
        local_port: u16,
    ) -> Option<bool> {
        if !self.request_fw_check || !self.firewalled_wanted.remove(&responder) {
            return None;
        }

        self.firewalled_checks.insert(responder, observed);
        if self.firewalled_checks.len() < self.required {
            return None;
        }

        // 端口不同说明经过了NAT映射
        let vote: i32 = self
            .firewalled_checks
            .values()
            .map(|addr| if addr.port() != local_port { 1 } else { -1 })
            .sum();

        self.firewalled = vote >= 0;
        self.last_external_ip = Some(observed.ip());
        self.finish();

        Some(self.firewalled)
    }

    /// Ends an unanswered check after the window; returns `true` if it did
    pub fn check_window(&mut self, now: Instant) -> bool {
        let expired = match (self.request_fw_check, self.requested_at) {
            (true, Some(at)) => now.saturating_duration_since(at) >= self.window,
            _ => false,
        };

        if expired {
            self.firewalled = true;
            self.finish();
        }
        expired
    }

    fn finish(&mut self) {
        self.request_fw_check = false;
        self.requested_at = None;
        self.firewalled_wanted.clear();
        self.firewalled_checks.clear();
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled
    }

    pub fn last_external_ip(&self) -> Option<IpAddr> {
        self.last_external_ip
    }

    /// Number of peers asked plus peers that answered
    pub fn pending(&self) -> usize {
        self.firewalled_wanted.len() + self.firewalled_checks.len()
    }
}
