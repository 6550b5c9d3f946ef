use adc_dht::cli::{CommandProcessor, ConsoleSink};
use adc_dht::dht::{Cid, Collaborators, DhtEngine, StaticBootstrap};
use adc_dht::utils::{parse_log_level, setup_logger, Config, StorageBackend};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use colored::*;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::ctrl_c;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageArg {
    Json,
    Sled,
}

impl From<StorageArg> for StorageBackend {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::Json => StorageBackend::Json,
            StorageArg::Sled => StorageBackend::Sled,
        }
    }
}

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// UDP监听地址, 例如 0.0.0.0:6250
    #[clap(short, long)]
    listen: Option<String>,

    /// 昵称
    #[clap(short, long)]
    nick: Option<String>,

    /// DHT 引导节点列表，格式: <cid>@<ip>:<port> 或 <ip>:<port>
    #[clap(short, long, action = ArgAction::Append)]
    bootstrap: Vec<String>,

    /// 日志级别
    #[clap(long)]
    log_level: Option<String>,

    /// 数据目录
    #[clap(long)]
    data_dir: Option<PathBuf>,

    /// 快照存储方式
    #[clap(long, value_enum)]
    storage: Option<StorageArg>,

    /// 启用详细日志
    #[clap(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// 不启动交互式控制台, 等待 Ctrl+C
    #[clap(long, action = ArgAction::SetTrue)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置文件
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config = Config::load_or_create(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    // 命令行参数覆盖配置
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(nick) = &args.nick {
        config.nick = nick.clone();
    }
    if !args.bootstrap.is_empty() {
        config.bootstrap_nodes = args.bootstrap.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(storage) = args.storage {
        config.storage = storage.into();
    }

    // 初始化日志
    let level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    };
    let level = parse_log_level(&level).map_err(|e| anyhow!(e))?;
    setup_logger(Some(level)).map_err(|e| anyhow!(e))?;

    info!("{}", format!("Starting {} {}...", adc_dht::utils::name(), adc_dht::utils::version()).green().bold());

    // 首次运行时生成并保存 PID
    let (pid, generated) = config.local_pid()?;
    if generated {
        config.save(&config_path)?;
        info!("Generated a new private ID");
    }
    let local_id = Cid::from_pid(&pid);
    info!("Local CID: {}", local_id);

    let dht_config = config.to_dht_config()?;
    let store = config.open_store()?;
    let bootstrap = StaticBootstrap::from_strings(&config.bootstrap_nodes);
    if bootstrap.is_empty() {
        warn!("No bootstrap nodes configured; waiting for incoming peers");
    }

    let collaborators = Collaborators {
        messages: Arc::new(ConsoleSink),
        ..Collaborators::default()
    };

    let engine = Arc::new(
        DhtEngine::new(dht_config, local_id, store)
            .with_bootstrap(Arc::new(bootstrap))
            .with_collaborators(collaborators),
    );
    engine.start().await?;

    if args.no_console {
        // 等待Ctrl+C信号
        match ctrl_c().await {
            Ok(()) => info!("Shutting down..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        }
    } else {
        let processor = CommandProcessor::new(engine.clone());
        tokio::select! {
            result = processor.run() => {
                if let Err(e) = result {
                    error!("Command processor error: {}", e);
                }
            }
            _ = ctrl_c() => info!("Shutting down..."),
        }
    }

    engine.stop(true);
    info!("DHT node stopped.");
    Ok(())
}
