use crate::dht::config::{DhtConfig, DEFAULT_DHT_PORT};
use crate::dht::persistence::{JsonFileStore, PersistError, SledStore, SnapshotStore};
use crate::dht::Cid;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Storage error: {0}")]
    StorageError(#[from] PersistError),
}

/// 路由表快照的存储方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Json,
    Sled,
}

/// DHT调优参数，时间单位为秒
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    pub k_value: usize,
    pub alpha_value: usize,
    pub max_node_type: u8,
    pub node_liveness_secs: u64,
    pub node_removal_secs: u64,
    pub node_response_secs: u64,
    pub connected_secs: u64,
    pub search_query_secs: u64,
    pub search_node_lifetime_secs: u64,
    pub search_file_lifetime_secs: u64,
    pub fw_responses: usize,
    pub fw_check_window_secs: u64,
    pub provider_ttl_secs: u64,
    pub max_node_list: usize,
    pub flood_window_secs: u64,
    pub expiration_interval_secs: u64,
    pub save_interval_secs: u64,
}

impl Default for DhtSettings {
    fn default() -> Self {
        let d = DhtConfig::default();
        Self {
            k_value: d.k_value,
            alpha_value: d.alpha_value,
            max_node_type: d.max_node_type,
            node_liveness_secs: d.node_liveness_timeout.as_secs(),
            node_removal_secs: d.node_removal_timeout.as_secs(),
            node_response_secs: d.node_response_timeout.as_secs(),
            connected_secs: d.connected_timeout.as_secs(),
            search_query_secs: d.search_query_timeout.as_secs(),
            search_node_lifetime_secs: d.search_node_lifetime.as_secs(),
            search_file_lifetime_secs: d.search_file_lifetime.as_secs(),
            fw_responses: d.fw_responses,
            fw_check_window_secs: d.fw_check_window.as_secs(),
            provider_ttl_secs: d.provider_ttl.as_secs(),
            max_node_list: d.max_node_list,
            flood_window_secs: d.flood_window.as_secs(),
            expiration_interval_secs: d.expiration_interval.as_secs(),
            save_interval_secs: d.save_interval.as_secs(),
        }
    }
}

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 私有ID (十六进制)，首次运行时生成
    pub pid: Option<String>,

    /// 昵称
    pub nick: String,

    /// UDP监听地址
    pub listen_addr: String,

    /// 在连接请求中公布的TCP端口
    pub tcp_port: u16,

    /// DHT引导节点, `cid@ip:port` 或 `ip:port`
    pub bootstrap_nodes: Vec<String>,

    /// 日志级别
    pub log_level: String,

    /// 数据目录
    pub data_dir: PathBuf,

    /// 快照存储方式
    pub storage: StorageBackend,

    /// DHT调优参数
    pub dht: DhtSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pid: None,
            nick: "adc-dht".to_string(),
            listen_addr: format!("0.0.0.0:{}", DEFAULT_DHT_PORT),
            tcp_port: 0,
            bootstrap_nodes: vec![],
            log_level: "info".to_string(),
            data_dir: default_data_dir(),
            storage: StorageBackend::Json,
            dht: DhtSettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("adc-dht"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

impl Config {
    /// 默认配置文件路径
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("adc-dht").join("config.json"))
            .ok_or_else(|| ConfigError::PathError("No config directory on this platform".to_string()))
    }

    /// 从文件加载配置
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // 检查文件是否存在
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Loads `path`, writing the defaults there first if it does not exist
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }

        let config = Self::default();
        config.save(path)?;
        log::info!("Created default configuration at {}", path.display());
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// 确保数据目录存在
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Returns the private id, generating one when none is configured.
    ///
    /// The boolean is `true` when a new id was generated and the
    /// configuration should be saved.
    pub fn local_pid(&mut self) -> Result<(Cid, bool), ConfigError> {
        if let Some(pid) = &self.pid {
            let parsed = pid.parse::<Cid>().map_err(|_| ConfigError::InvalidValue {
                field: "pid",
                value: pid.clone(),
            })?;
            return Ok((parsed, false));
        }

        let pid = Cid::random();
        self.pid = Some(pid.to_string());
        Ok((pid, true))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                field: "listen_addr",
                value: self.listen_addr.clone(),
            })
    }

    /// 转换为引擎配置
    pub fn to_dht_config(&self) -> Result<DhtConfig, ConfigError> {
        let s = &self.dht;
        if s.k_value == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dht.k_value",
                value: "0".to_string(),
            });
        }
        if s.alpha_value == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dht.alpha_value",
                value: "0".to_string(),
            });
        }

        Ok(DhtConfig {
            listen_addr: self.listen_addr()?,
            tcp_port: self.tcp_port,
            nick: self.nick.clone(),
            k_value: s.k_value,
            alpha_value: s.alpha_value,
            max_node_type: s.max_node_type,
            node_liveness_timeout: Duration::from_secs(s.node_liveness_secs),
            node_removal_timeout: Duration::from_secs(s.node_removal_secs),
            node_response_timeout: Duration::from_secs(s.node_response_secs),
            connected_timeout: Duration::from_secs(s.connected_secs),
            search_query_timeout: Duration::from_secs(s.search_query_secs),
            search_node_lifetime: Duration::from_secs(s.search_node_lifetime_secs),
            search_file_lifetime: Duration::from_secs(s.search_file_lifetime_secs),
            fw_responses: s.fw_responses,
            fw_check_window: Duration::from_secs(s.fw_check_window_secs),
            provider_ttl: Duration::from_secs(s.provider_ttl_secs),
            max_node_list: s.max_node_list,
            flood_window: Duration::from_secs(s.flood_window_secs),
            expiration_interval: Duration::from_secs(s.expiration_interval_secs.max(1)),
            save_interval: Duration::from_secs(s.save_interval_secs.max(1)),
            ..DhtConfig::default()
        })
    }

    /// 打开快照存储
    pub fn open_store(&self) -> Result<Arc<dyn SnapshotStore>, ConfigError> {
        self.ensure_data_dir()?;
        let store: Arc<dyn SnapshotStore> = match self.storage {
            StorageBackend::Json => Arc::new(JsonFileStore::new(self.data_dir.join("dht.json"))),
            StorageBackend::Sled => Arc::new(SledStore::open(self.data_dir.join("dht.db"))?),
        };
        Ok(store)
    }
}
