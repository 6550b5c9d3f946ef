mod config;
mod logger;

pub use config::{Config, ConfigError, StorageBackend};
pub use logger::{parse_log_level, setup_logger};

/// 获取应用程序版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 获取应用程序名称
pub fn name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

/// 获取应用程序描述
pub fn description() -> &'static str {
    env!("CARGO_PKG_DESCRIPTION")
}

/// 生成随机的搜索令牌
pub fn random_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let id: u32 = rng.gen();
    format!("{:08x}", id)
}
