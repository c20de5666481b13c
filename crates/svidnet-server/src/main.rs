//! SVIDNet 签发端守护进程

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use svidnet_server::config::ServerConfig;
use svidnet_server::SvidServer;

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "svidnet-server", version, about = "JWT-SVID 签发与公钥发布服务")]
struct Args {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(short, long, default_value = "/etc/svidnet/server.yaml")]
    config: PathBuf,

    /// 日志级别，覆盖配置文件中的设置
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("无法加载配置文件: {:?}", args.config))?;

    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let server = SvidServer::new(config).await?;
    let handles = server.start().await?;

    tokio::signal::ctrl_c().await.context("等待退出信号失败")?;
    info!("收到退出信号，正在停止");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
