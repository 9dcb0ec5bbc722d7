//! 结果打印
//!
//! 别名表、代理表和遍历报告的表格输出

use crate::spider::SpiderReport;
use crate::types::{AliasMap, BuildFile, ProxyMap};
use colored::Colorize;
use prettytable::{format, row, Table};

fn table() -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    table
}

/// 别名表
pub fn format_aliases(aliases: &AliasMap, proxies: &ProxyMap) -> String {
    if aliases.is_empty() {
        return "Empty set\n".to_string();
    }
    let mut table = table();
    table.set_titles(row!["Alias", "Address", "Proxy"]);
    for (alias, address) in aliases {
        let proxy = if proxies.contains_key(alias) { "yes" } else { "" };
        table.add_row(row![alias, address, proxy]);
    }
    format!("{}{} alias(es)\n", table, aliases.len())
}

/// 代理表
pub fn format_proxies(proxies: &ProxyMap) -> String {
    if proxies.is_empty() {
        return "Empty set\n".to_string();
    }
    let mut table = table();
    table.set_titles(row!["Alias", "Proxy", "Implementation", "Kind"]);
    for (alias, record) in proxies {
        table.add_row(row![alias, record.proxy, record.implementation, record.kind]);
    }
    format!("{}{} proxy(ies)\n", table, proxies.len())
}

/// 构建文件摘要
pub fn format_build_file(build: &BuildFile) -> String {
    let mut table = table();
    table.set_titles(row!["Function", "Mutability"]);
    for entry in build.abi.functions() {
        let mutability = entry.state_mutability.clone().unwrap_or_default();
        table.add_row(row![entry.signature(), mutability]);
    }
    format!(
        "{} ({} functions)\n{}",
        build.contract_name,
        build.abi.functions().count(),
        table
    )
}

/// 遍历报告：新增为绿色，变更为黄色，删除为红色
pub fn format_report(report: &SpiderReport) -> String {
    let mut out = format!(
        "run {} on {} ({}): visited {} contract(s) in {} ms\n",
        report.run_id,
        report.deployment,
        report.network,
        report.visited,
        (report.finished_at - report.started_at).num_milliseconds()
    );

    if report.is_unchanged() {
        out.push_str(&format!("{}\n", "no changes".dimmed()));
    }
    for (alias, address) in &report.added_aliases {
        out.push_str(&format!("{}\n", format!("+ {} = {}", alias, address).green()));
    }
    for (alias, change) in &report.changed_aliases {
        let line = format!("~ {}: {} -> {}", alias, change.before, change.after);
        out.push_str(&format!("{}\n", line.yellow()));
    }
    for alias in &report.removed_aliases {
        out.push_str(&format!("{}\n", format!("- {}", alias).red()));
    }
    for (alias, record) in &report.added_proxies {
        let line = format!("+ proxy {}: {} -> {}", alias, record.proxy, record.implementation);
        out.push_str(&format!("{}\n", line.green()));
    }
    for (alias, change) in &report.changed_proxies {
        let line = format!(
            "~ proxy {}: {} -> {}",
            alias, change.before.implementation, change.after.implementation
        );
        out.push_str(&format!("{}\n", line.yellow()));
    }
    for alias in &report.removed_proxies {
        out.push_str(&format!("{}\n", format!("- proxy {}", alias).red()));
    }

    if !report.skipped.is_empty() {
        out.push_str(&format!("{} relation(s) skipped:\n", report.skipped.len()));
        for skip in &report.skipped {
            out.push_str(&format!("  {} {}: {}\n", skip.address, skip.relation, skip.reason));
        }
    }
    if !report.truncated.is_empty() {
        let line = format!("depth limit reached at: {}", report.truncated.join(", "));
        out.push_str(&format!("{}\n", line.yellow()));
    }
    out
}
