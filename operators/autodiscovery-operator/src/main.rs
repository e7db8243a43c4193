//! Auto-Discovery 入口

use anyhow::{Context, Result};
use autodiscovery_common::AutoDiscoveryConfig;
use autodiscovery_operator::{crds_yaml, AutoDiscoveryOperator};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// 自动发现 Kubernetes Service 并调度安全扫描
#[derive(Parser, Debug)]
#[command(name = "auto-discovery", version, about)]
struct Args {
    /// 配置文件路径（YAML 或 JSON），缺省时使用内置默认配置
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别，RUST_LOG 存在时以其为准
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 输出 CRD 后退出
    #[arg(long)]
    print_crds: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        print!("{}", crds_yaml()?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = match &args.config {
        Some(path) => AutoDiscoveryConfig::load(path)
            .with_context(|| format!("加载配置文件 {} 失败", path.display()))?,
        None => {
            info!("未指定配置文件，使用默认配置");
            let config = AutoDiscoveryConfig::default();
            config.validate().context("默认配置无效")?;
            config
        }
    };

    AutoDiscoveryOperator::new(config).await?.run().await
}
