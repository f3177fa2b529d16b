//! 流式文件服务端：响应 `Get` 拉取，接收 `Post` 推送并按跳数转发。
//!
//! # 使用方法
//! ```bash
//! cargo run -p spark-stream-examples --bin stream_server -- 0.0.0.0 8080
//! ```
//! - 恰好两个参数：`<serverHostname> <serverPort>`；参数错误时在创建任何运行时或套接字之前退出；
//! - 环境变量 `SPARK_STREAM_CONFIG` 可指向 TOML 配置文件；
//! - 日志级别由 `RUST_LOG` 控制，默认 `info`；Ctrl-C / SIGTERM 触发有序停机。

use std::{env, sync::Arc};

use anyhow::Context as _;
use spark_stream::{
    ClientBootstrap, PeerInfo, ServerBootstrap, ShutdownCoordinator, TransportConfig,
    socket::{RECEIVE_BUFFER_SIZE, SEND_BUFFER_SIZE},
};
use spark_stream_examples::{SOCKET_BUFFER_SIZE, registry};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: stream_server <serverHostname> <serverPort>";

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let peer = match parse_args(&args) {
        Ok(peer) => peer,
        Err(reason) => {
            eprintln!("{reason}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let outcome = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stream-server")
        .enable_all()
        .build()
        .context("failed to build the server runtime")
        .and_then(|runtime| runtime.block_on(run(peer)));
    if let Err(error) = outcome {
        eprintln!("stream_server failed: {error:#}");
        std::process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<PeerInfo, String> {
    let [host, port] = args else {
        return Err(format!("expected 2 arguments, got {}", args.len()));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("`{port}` is not a valid port"))?;
    Ok(PeerInfo::new(host.as_str(), port))
}

async fn run(peer: PeerInfo) -> anyhow::Result<()> {
    let config = match env::var_os("SPARK_STREAM_CONFIG") {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::default(),
    };

    // 转发用的客户端运行在自己的工作池上，与接入侧互不占用。
    let next_hop = ClientBootstrap::builder(peer.clone())
        .apply_config(&config)
        .option(SEND_BUFFER_SIZE, SOCKET_BUFFER_SIZE)?
        .option(RECEIVE_BUFFER_SIZE, SOCKET_BUFFER_SIZE)?
        .build()?;

    let server = ServerBootstrap::builder(peer.clone())
        .apply_config(&config)
        .registry(registry(next_hop.clone())?)
        .option(SEND_BUFFER_SIZE, SOCKET_BUFFER_SIZE)?
        .option(RECEIVE_BUFFER_SIZE, SOCKET_BUFFER_SIZE)?
        .option(&format!("child.{RECEIVE_BUFFER_SIZE}"), SOCKET_BUFFER_SIZE)?
        .option(&format!("child.{SEND_BUFFER_SIZE}"), SOCKET_BUFFER_SIZE)?
        .build()?;

    let coordinator = Arc::new(ShutdownCoordinator::new());
    coordinator.add_resource(Arc::new(server.clone()))?;
    coordinator.add_resource(Arc::new(next_hop))?;

    let local = server.bind().await?;
    info!(peer = %peer, local = %local, "handling");

    coordinator.install_signal_handler().await?;
    Ok(())
}
