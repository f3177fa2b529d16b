//! 流式文件客户端：从服务端拉取一个文件并写入本地。
//!
//! ```bash
//! cargo run -p spark-stream-examples --bin stream_client -- localhost 8080 /srv/data.bin ./data.bin
//! ```

use std::{env, path::PathBuf};

use anyhow::Context as _;
use spark_stream::{ClientBootstrap, PeerInfo, socket::RECEIVE_BUFFER_SIZE, util::receive_file};
use spark_stream_examples::{Get, SOCKET_BUFFER_SIZE};
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: stream_client <serverHostname> <serverPort> <remoteFile> <localFile>";

struct Args {
    peer: PeerInfo,
    remote: String,
    local: PathBuf,
}

fn main() {
    let raw: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(reason) => {
            eprintln!("{reason}");
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the client runtime")
        .and_then(|runtime| runtime.block_on(run(args)));
    if let Err(error) = outcome {
        eprintln!("stream_client failed: {error:#}");
        std::process::exit(1);
    }
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let [host, port, remote, local] = raw else {
        return Err(format!("expected 4 arguments, got {}", raw.len()));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| format!("`{port}` is not a valid port"))?;
    Ok(Args {
        peer: PeerInfo::new(host.as_str(), port),
        remote: remote.clone(),
        local: PathBuf::from(local),
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let client = ClientBootstrap::builder(args.peer.clone())
        .option(RECEIVE_BUFFER_SIZE, SOCKET_BUFFER_SIZE)?
        .build()?;
    let channel = client.connect().await?;
    let transfer = channel
        .pull(&Get {
            filename: args.remote.clone(),
        })
        .await?;
    let outcome = receive_file(transfer, &args.local).await;
    client.release().await;

    let received = outcome.with_context(|| format!("pulling {} from {}", args.remote, args.peer))?;
    info!(
        remote = %args.remote,
        local = %args.local.display(),
        bytes = received,
        "file received"
    );
    Ok(())
}
