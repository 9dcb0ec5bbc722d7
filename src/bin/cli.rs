//! contract-spider 命令行工具
//!
//! 遍历部署、查看别名和代理、维护根集合

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use contract_spider::printer::{format_aliases, format_build_file, format_proxies, format_report};
use contract_spider::{Address, CancelToken, DeploymentConfig, DeploymentManager, JsonRpcSource, MergeMode, Roots, SpiderOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "contract-spider")]
#[command(about = "合约部署状态管理工具", version = contract_spider::VERSION)]
struct Args {
    /// 配置文件（JSON）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 部署名称，默认同时作为网络名
    #[arg(short, long, default_value = "mainnet")]
    deployment: String,

    /// 将缓存写入磁盘
    #[arg(long)]
    write_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 从根集合遍历并提交结果
    Spider {
        /// 覆盖最大深度
        #[arg(long)]
        max_depth: Option<usize>,

        /// 覆盖并发上限
        #[arg(long)]
        concurrency: Option<usize>,

        /// 只保留本次发现的别名
        #[arg(long)]
        replace: bool,
    },
    /// 列出别名
    Aliases,
    /// 列出代理
    Proxies,
    /// 查看或替换根集合
    Roots {
        /// 从 JSON 文件替换根集合（别名 -> 地址）
        #[arg(long)]
        set: Option<PathBuf>,
    },
    /// 导入地址的构建文件
    Import {
        address: Address,

        /// 覆盖网络名
        #[arg(long)]
        network: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => DeploymentConfig::load(path)?,
        None => DeploymentConfig::default(),
    };
    if args.write_cache {
        config.write_cache_to_disk = true;
    }

    let network = config.network_for(&args.deployment);
    let source = JsonRpcSource::new(config.network_config(&network)?)
        .with_context(|| format!("无法创建网络 {} 的远程数据源", network))?;
    let manager = DeploymentManager::new(&args.deployment, config, Arc::new(source))?;
    info!(deployment = %args.deployment, network = %manager.network(), "session opened");

    run(&manager, args.command).await?;

    for warning in manager.take_cache_warnings() {
        warn!("{}", warning);
    }
    Ok(())
}

async fn run(manager: &DeploymentManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Spider {
            max_depth,
            concurrency,
            replace,
        } => {
            if manager.get_roots()?.is_empty() {
                bail!("部署 {} 没有根集合，请先执行 roots --set", manager.deployment());
            }
            let options = SpiderOptions {
                max_depth: max_depth.unwrap_or(manager.config().max_depth),
                concurrency: concurrency.unwrap_or(manager.config().concurrency),
                merge: if replace {
                    MergeMode::Replace
                } else {
                    MergeMode::Monotonic
                },
            };

            let cancel = CancelToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                }
            });

            let report = manager.spider_with(options, &cancel).await?;
            print!("{}", format_report(&report));
            let metrics = manager.metrics();
            info!(
                fetches = metrics.import_remote_fetches,
                cache_hits = metrics.import_cache_hits,
                retries = metrics.import_retries,
                "import stats"
            );
        }
        Command::Aliases => {
            print!("{}", format_aliases(&manager.get_aliases()?, &manager.get_proxies()?));
        }
        Command::Proxies => {
            print!("{}", format_proxies(&manager.get_proxies()?));
        }
        Command::Roots { set } => {
            if let Some(path) = set {
                let data = std::fs::read(&path)
                    .with_context(|| format!("读取根集合 {:?} 失败", path))?;
                let roots: Roots = serde_json::from_slice(&data)
                    .with_context(|| format!("解析根集合 {:?} 失败", path))?;
                manager.put_roots(roots)?;
            }
            print!("{}", format_aliases(&manager.get_roots()?, &Default::default()));
        }
        Command::Import { address, network } => {
            let build = manager.import(address, network.as_deref()).await?;
            print!("{}", format_build_file(&build));
        }
    }
    Ok(())
}
