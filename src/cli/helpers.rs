use crate::dht::collaborators::MessageSink;
use crate::dht::node::NodeSnapshot;
use crate::dht::search::SearchOutcome;
use chrono::Local;
use colored::*;
use std::time::Instant;

/// 在控制台打印收到的私聊消息
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl MessageSink for ConsoleSink {
    fn private_message(&self, node: &NodeSnapshot, text: &str, third_person: bool) {
        println!("{}", format_message(node, text, third_person));
    }
}

/// 格式化消息显示
pub fn format_message(node: &NodeSnapshot, text: &str, third_person: bool) -> String {
    let time_str = Local::now().format("%H:%M:%S").to_string();
    let sender = node
        .nick
        .clone()
        .unwrap_or_else(|| short_cid(&node.cid.to_string()));

    if third_person {
        format!("{} [{}] * {} {}", "<<<".bold(), time_str.dimmed(), sender.yellow(), text.green())
    } else {
        format!("{} [{}] {}: {}", "<<<".bold(), time_str.dimmed(), sender.yellow(), text.green())
    }
}

fn short_cid(cid: &str) -> String {
    cid.chars().take(12).collect()
}

/// 格式化表格
pub fn format_table(headers: &[&str], rows: &[Vec<String>], widths: &[usize]) -> String {
    let mut result = String::new();

    // 添加表头
    let header_row = headers
        .iter()
        .zip(widths.iter())
        .map(|(h, w)| format!("{:width$}", h.bold(), width = *w))
        .collect::<Vec<_>>()
        .join(" | ");

    result.push_str(&header_row);
    result.push('\n');

    // 添加分隔线
    let separator = widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>()
        .join("-+-");

    result.push_str(&separator);
    result.push('\n');

    // 添加数据行
    for row in rows {
        let data_row = row
            .iter()
            .zip(widths.iter())
            .map(|(cell, w)| format!("{:width$}", cell, width = *w))
            .collect::<Vec<_>>()
            .join(" | ");

        result.push_str(&data_row);
        result.push('\n');
    }

    result
}

/// Renders the routing table as a table, closest-seen first
pub fn format_nodes(nodes: &[NodeSnapshot], now: Instant) -> String {
    let mut sorted: Vec<&NodeSnapshot> = nodes.iter().collect();
    sorted.sort_by_key(|n| std::cmp::Reverse(n.last_seen));

    let rows: Vec<Vec<String>> = sorted
        .iter()
        .map(|n| {
            vec![
                short_cid(&n.cid.to_string()),
                n.addr.to_string(),
                n.nick.clone().unwrap_or_default(),
                format_duration(now.saturating_duration_since(n.last_seen).as_secs()),
                if n.online { "online".to_string() } else { format!("type {}", n.node_type) },
            ]
        })
        .collect();

    format_table(&["CID", "Address", "Nick", "Seen", "State"], &rows, &[12, 21, 16, 10, 8])
}

/// 格式化查找结果
pub fn format_outcome(label: &str, outcome: &SearchOutcome) -> String {
    match outcome {
        SearchOutcome::Found(sources) => {
            let mut out = format!("{} {}: {} sources", "Found".green().bold(), label, sources.len());
            for source in sources {
                out.push_str(&format!(
                    "\n  {} {} ({})",
                    short_cid(&source.cid.to_string()),
                    source.addr,
                    format_bytes(source.size)
                ));
            }
            out
        }
        SearchOutcome::NodeFound(node) => {
            format!("{} {} at {}", "Found".green().bold(), label, node.addr())
        }
        SearchOutcome::Converged { closest } => format!(
            "{} {}, {} closest nodes known",
            "Not found:".yellow().bold(),
            label,
            closest.len()
        ),
        SearchOutcome::TimedOut { closest } => format!(
            "{} {} after contacting {} nodes",
            "Timed out:".red().bold(),
            label,
            closest.len()
        ),
    }
}

/// 格式化字节大小
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化持续时间
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / (24 * 3600);
    let hours = (seconds % (24 * 3600)) / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::Cid;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_duration(90000), "1d 1h");
    }

    #[test]
    fn test_format_nodes_contains_rows() {
        colored::control::set_override(false);
        let now = Instant::now();
        let node = NodeSnapshot {
            cid: Cid::random(),
            addr: "10.0.0.1:6250".parse().unwrap(),
            last_seen: now,
            node_type: 0,
            online: true,
            ip_verified: false,
            nick: Some("alice".to_string()),
        };

        let table = format_nodes(&[node], now);
        assert!(table.contains("alice"));
        assert!(table.contains("10.0.0.1:6250"));
        assert_eq!(table.lines().count(), 3);
    }
}
