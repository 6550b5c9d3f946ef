use super::commands::{Command, CommandContext, CommandResult};
use crate::dht::DhtEngine;

use anyhow::{anyhow, Result};
use colored::*;
use log::{debug, error};
use rustyline::config::Configurer;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;

/// 解析后的一行输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub command: Command,
    pub args: Vec<String>,
}

/// 解析一行输入
///
/// Empty lines yield `Ok(None)`. Arguments are split shell-style so quoted
/// message text stays in one piece.
pub fn parse_line(line: &str) -> Result<Option<ParsedLine>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let stripped = line
        .strip_prefix('/')
        .ok_or_else(|| anyhow!("Commands start with '/', type /help"))?;

    let mut words = shlex::split(stripped).ok_or_else(|| anyhow!("Unbalanced quotes in: {}", line))?;
    if words.is_empty() {
        return Ok(None);
    }

    let name = words.remove(0).to_lowercase();
    let command = Command::from_name(&name).ok_or_else(|| anyhow!("Unknown command: /{}", name))?;

    Ok(Some(ParsedLine { command, args: words }))
}

/// 命令处理器
pub struct CommandProcessor {
    engine: Arc<DhtEngine>,
    history_path: PathBuf,
}

impl CommandProcessor {
    /// 创建新的命令处理器
    pub fn new(engine: Arc<DhtEngine>) -> Self {
        // 设置历史记录文件路径
        let mut history_path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        history_path.push("adc-dht");
        history_path.push("history.txt");

        // 确保目录存在
        if let Some(parent) = history_path.parent() {
            let _ = create_dir_all(parent);
        }

        Self { engine, history_path }
    }

    /// 运行交互式控制台，直到 /exit、Ctrl-C 或 Ctrl-D
    pub async fn run(self) -> Result<()> {
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || self.run_blocking(handle))
            .await
            .map_err(|e| anyhow!("Console task failed: {}", e))?
    }

    // rustyline 会阻塞线程，命令通过运行时句柄执行
    fn run_blocking(self, handle: Handle) -> Result<()> {
        println!("{}", self.welcome_message());

        let mut editor = self.create_editor()?;
        let prompt = format!("{} ", "adc-dht>".green());

        loop {
            match editor.readline(&prompt) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    if let Err(e) = editor.add_history_entry(line.as_str()) {
                        debug!("Failed to add history entry: {}", e);
                    }

                    let parsed = match parse_line(&line) {
                        Ok(Some(parsed)) => parsed,
                        Ok(None) => continue,
                        Err(e) => {
                            eprintln!("{} {}", "Error:".red().bold(), e);
                            continue;
                        }
                    };

                    let context = CommandContext {
                        engine: self.engine.clone(),
                        args: parsed.args,
                    };
                    let result = handle.block_on(parsed.command.execute(context));
                    if !handle_command_result(result) {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D");
                    break;
                }
                Err(err) => {
                    error!("Error reading line: {}", err);
                    break;
                }
            }
        }

        if let Err(e) = editor.save_history(&self.history_path) {
            debug!("Failed to save command history: {}", e);
        }
        Ok(())
    }

    /// 创建命令行编辑器
    fn create_editor(&self) -> Result<DefaultEditor> {
        let mut editor = DefaultEditor::new()?;

        // 加载历史记录
        let _ = editor.load_history(&self.history_path);

        editor.set_edit_mode(rustyline::EditMode::Emacs);
        editor.set_color_mode(rustyline::ColorMode::Enabled);

        Ok(editor)
    }

    /// 获取欢迎信息
    fn welcome_message(&self) -> String {
        let version = env!("CARGO_PKG_VERSION");

        format!(
            "\n{}\n{}\n\nType {} for a list of available commands.\n\nLocal CID: {}\n",
            format!("adc-dht v{}", version).green().bold(),
            "Kademlia DHT node for ADC peers".cyan(),
            "/help".yellow(),
            self.engine.local_id().to_string().green()
        )
    }
}

/// 打印命令结果, 返回 `false` 表示退出
fn handle_command_result(result: CommandResult) -> bool {
    match result {
        CommandResult::Success(message) => {
            println!("{} {}", "Success:".green().bold(), message);
        }
        CommandResult::Info(message) => {
            println!("{}", message);
        }
        CommandResult::Warning(message) => {
            println!("{} {}", "Warning:".yellow().bold(), message);
        }
        CommandResult::Error(message) => {
            eprintln!("{} {}", "Error:".red().bold(), message);
        }
        CommandResult::Exit => {
            println!("Exiting...");
            return false;
        }
    }
    true
}
