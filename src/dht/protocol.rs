use crate::dht::identifier::Cid;
use std::fmt;
use std::net::SocketAddr;
use std::ops::BitOr;
use thiserror::Error;

/// 协议解析错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty command")]
    Empty,

    #[error("Invalid command header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported command type '{0}', only UDP commands are accepted")]
    UnsupportedType(char),

    #[error("Invalid sender CID: {0}")]
    InvalidCid(String),

    #[error("Invalid escape sequence in '{0}'")]
    InvalidEscape(String),
}

/// 三字母命令标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    Inf,
    Sch,
    Res,
    Pub,
    Ctm,
    Rcm,
    Sta,
    Psr,
    Msg,
    Get,
    Snd,
    Unknown([u8; 3]),
}

impl CommandTag {
    pub fn from_bytes(tag: [u8; 3]) -> Self {
        match &tag {
            b"INF" => CommandTag::Inf,
            b"SCH" => CommandTag::Sch,
            b"RES" => CommandTag::Res,
            b"PUB" => CommandTag::Pub,
            b"CTM" => CommandTag::Ctm,
            b"RCM" => CommandTag::Rcm,
            b"STA" => CommandTag::Sta,
            b"PSR" => CommandTag::Psr,
            b"MSG" => CommandTag::Msg,
            b"GET" => CommandTag::Get,
            b"SND" => CommandTag::Snd,
            _ => CommandTag::Unknown(tag),
        }
    }

    pub fn as_bytes(&self) -> [u8; 3] {
        match self {
            CommandTag::Inf => *b"INF",
            CommandTag::Sch => *b"SCH",
            CommandTag::Res => *b"RES",
            CommandTag::Pub => *b"PUB",
            CommandTag::Ctm => *b"CTM",
            CommandTag::Rcm => *b"RCM",
            CommandTag::Sta => *b"STA",
            CommandTag::Psr => *b"PSR",
            CommandTag::Msg => *b"MSG",
            CommandTag::Get => *b"GET",
            CommandTag::Snd => *b"SND",
            CommandTag::Unknown(tag) => *tag,
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.as_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

/// INF 命令中的 TY 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InfType(pub u8);

impl InfType {
    pub const NONE: InfType = InfType(0);
    /// 请求对方回复 INF
    pub const PING: InfType = InfType(1);
    /// 请求对方将我们标记为在线
    pub const MAKE_ONLINE: InfType = InfType(2);

    pub fn contains(&self, other: InfType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for InfType {
    type Output = InfType;

    fn bitor(self, rhs: Self) -> Self::Output {
        InfType(self.0 | rhs.0)
    }
}

/// SCH 命令中的 TY 值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    Node = 1,
    File = 2,
    Store = 3,
}

impl SearchType {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "1" => Some(SearchType::Node),
            "2" => Some(SearchType::File),
            "3" => Some(SearchType::Store),
            _ => None,
        }
    }

    pub fn as_param(&self) -> &'static str {
        match self {
            SearchType::Node => "1",
            SearchType::File => "2",
            SearchType::Store => "3",
        }
    }
}

/// STA 状态码中的成功值
pub const STATUS_SUCCESS: u16 = 0;
/// 通用错误
pub const STATUS_GENERIC_ERROR: u16 = 100;

/// A single UDP command of the form `U<TAG> <cid> <params...>`.
///
/// Parameters are stored unescaped. Named parameters are plain parameters
/// whose first two characters are the name (`TOtoken`, `TY1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcCommand {
    pub tag: CommandTag,
    pub from: Cid,
    pub params: Vec<String>,
}

impl AdcCommand {
    pub fn new(tag: CommandTag, from: Cid) -> Self {
        Self {
            tag,
            from,
            params: Vec::new(),
        }
    }

    /// Builds a `STA` reply with a three digit code and a description
    pub fn status(from: Cid, code: u16, description: &str) -> Self {
        let mut cmd = Self::new(CommandTag::Sta, from);
        cmd.add_param(format!("{:03}", code));
        cmd.add_param(description);
        cmd
    }

    /// 解析一行命令
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut parts = line.split(' ');
        let header = parts.next().unwrap_or_default();
        let header_bytes = header.as_bytes();
        if header_bytes.len() != 4 {
            return Err(ProtocolError::InvalidHeader(header.to_string()));
        }

        let kind = header_bytes[0] as char;
        if kind != 'U' {
            return Err(ProtocolError::UnsupportedType(kind));
        }

        let mut tag = [0u8; 3];
        tag.copy_from_slice(&header_bytes[1..4]);
        if !tag.iter().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtocolError::InvalidHeader(header.to_string()));
        }

        let from_str = parts
            .next()
            .ok_or_else(|| ProtocolError::InvalidCid(String::new()))?;
        let from = from_str
            .parse::<Cid>()
            .map_err(|_| ProtocolError::InvalidCid(from_str.to_string()))?;

        let params = parts
            .filter(|p| !p.is_empty())
            .map(unescape)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tag: CommandTag::from_bytes(tag),
            from,
            params,
        })
    }

    /// 格式化为一行以 `\n` 结尾的命令
    pub fn to_line(&self) -> String {
        let mut line = format!("U{} {}", self.tag, self.from);
        for param in &self.params {
            line.push(' ');
            line.push_str(&escape(param));
        }
        line.push('\n');
        line
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// First value of named parameter `name`
    pub fn named(&self, name: &str) -> Option<&str> {
        self.named_from(name, 0)
    }

    /// First value of named parameter `name` at or after position `start`
    pub fn named_from(&self, name: &str, start: usize) -> Option<&str> {
        self.params
            .iter()
            .skip(start)
            .find_map(|p| p.strip_prefix(name))
    }

    /// All values of a repeated named parameter
    pub fn named_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.params.iter().filter_map(move |p| p.strip_prefix(name))
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.named(name) == Some("1")
    }

    pub fn add_param(&mut self, param: impl Into<String>) -> &mut Self {
        self.params.push(param.into());
        self
    }

    pub fn add_named(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.params.push(format!("{}{}", name, value));
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_line().into_bytes()
    }
}

/// ADC 转义: 空格 -> `\s`, 换行 -> `\n`, 反斜杠 -> `\\`
pub fn escape(param: &str) -> String {
    let mut out = String::with_capacity(param.len());
    for c in param.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(param: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(param.len());
    let mut chars = param.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            _ => return Err(ProtocolError::InvalidEscape(param.to_string())),
        }
    }
    Ok(out)
}

/// Formats a node entry `cid@ip:port` as carried in `ND` parameters
pub fn format_node_entry(cid: &Cid, addr: &SocketAddr) -> String {
    format!("{}@{}", cid, addr)
}

/// Parses a `cid@ip:port` node entry
pub fn parse_node_entry(entry: &str) -> Option<(Cid, SocketAddr)> {
    let (cid, addr) = entry.split_once('@')?;
    Some((cid.parse().ok()?, addr.parse().ok()?))
}

/// Parses a source entry `cid[@ip:port]`; without an address the source is the responder
pub fn parse_source_entry(entry: &str, responder: SocketAddr) -> Option<(Cid, SocketAddr)> {
    match entry.split_once('@') {
        Some((cid, addr)) => Some((cid.parse().ok()?, addr.parse().ok()?)),
        None => Some((entry.parse().ok()?, responder)),
    }
}
