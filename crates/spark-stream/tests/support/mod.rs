//! 集成测试共用的消息、处理器与 Bootstrap 装配工具。
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
};
use spark_stream::{
    ClientBootstrap, HandlerRegistry, MessageError, PeerInfo, PipelineConfig, PullHandler,
    PushHandler, ServerBootstrap, StreamError, TransferError, TransferIn, TransferOut, WireMessage,
    util::send_file,
};
use tokio::sync::mpsc;

macro_rules! text_message {
    ($name:ident, $key:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name(pub String);

        impl WireMessage for $name {
            const TYPE_KEY: &'static str = $key;

            fn encode_body(&self) -> Bytes {
                Bytes::from(self.0.clone().into_bytes())
            }

            fn decode_body(body: Bytes) -> Result<Self, MessageError> {
                String::from_utf8(body.to_vec())
                    .map(Self)
                    .map_err(MessageError::new)
            }
        }
    };
}

text_message!(Count, "test.Count");
text_message!(Broken, "test.Broken");
text_message!(FetchFile, "test.FetchFile");
text_message!(Upload, "test.Upload");
text_message!(Alpha, "test.Alpha");
text_message!(Beta, "test.Beta");

/// 可预测的测试内容。
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index % 251) as u8).collect()
}

/// 第 `index` 个计数块的内容。
pub fn count_chunk(index: usize) -> String {
    format!("chunk-{index:04};")
}

pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("spark-stream-{}-{name}", std::process::id()))
}

/// 等待对端确认 `expected` 字节已经刷出。
pub async fn wait_flushed(transfer: &TransferOut, expected: u64) {
    while transfer.bytes_flushed() < expected {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// 按请求写出 N 个小块。
pub struct CountHandler;

#[async_trait]
impl PullHandler for CountHandler {
    type Request = Count;

    async fn handle_pull(&self, request: Count, mut transfer: TransferOut) -> Result<(), StreamError> {
        let count: usize = request.0.parse().unwrap_or(0);
        for index in 0..count {
            transfer.write(count_chunk(index)).await?;
        }
        transfer.close().await?;
        Ok(())
    }
}

/// 先写出请求指定的字节数，确认刷出后终止。
pub struct BrokenHandler;

#[async_trait]
impl PullHandler for BrokenHandler {
    type Request = Broken;

    async fn handle_pull(&self, request: Broken, mut transfer: TransferOut) -> Result<(), StreamError> {
        let len: usize = request.0.parse().unwrap_or(0);
        if len > 0 {
            transfer.write(pattern(len)).await?;
            wait_flushed(&transfer, len as u64).await;
        }
        transfer.abort("disk failure").await?;
        Ok(())
    }
}

/// 以请求中的路径为文件内容源。
pub struct FileHandler;

#[async_trait]
impl PullHandler for FileHandler {
    type Request = FetchFile;

    async fn handle_pull(&self, request: FetchFile, mut transfer: TransferOut) -> Result<(), StreamError> {
        send_file(&request.0, &mut transfer, false).await?;
        Ok(())
    }
}

pub type Received = (String, Result<Bytes, TransferError>);

/// 收集推送内容并转交给测试。
pub struct UploadHandler {
    pub uploads: mpsc::UnboundedSender<Received>,
}

#[async_trait]
impl PushHandler for UploadHandler {
    type Message = Upload;

    async fn handle_push(&self, message: Upload, transfer: TransferIn) -> Result<(), StreamError> {
        let outcome = transfer.read_to_end().await;
        let _ = self.uploads.send((message.0, outcome));
        Ok(())
    }
}

#[derive(Default)]
pub struct Counters {
    pub alpha: AtomicUsize,
    pub beta: AtomicUsize,
}

pub struct AlphaHandler(pub Arc<Counters>);

#[async_trait]
impl PullHandler for AlphaHandler {
    type Request = Alpha;

    async fn handle_pull(&self, request: Alpha, mut transfer: TransferOut) -> Result<(), StreamError> {
        self.0.alpha.fetch_add(1, Ordering::SeqCst);
        transfer.write(format!("alpha:{}", request.0)).await?;
        transfer.close().await?;
        Ok(())
    }
}

pub struct BetaHandler(pub Arc<Counters>);

#[async_trait]
impl PullHandler for BetaHandler {
    type Request = Beta;

    async fn handle_pull(&self, request: Beta, mut transfer: TransferOut) -> Result<(), StreamError> {
        self.0.beta.fetch_add(1, Ordering::SeqCst);
        transfer.write(format!("beta:{}", request.0)).await?;
        transfer.close().await?;
        Ok(())
    }
}

/// 注册全部测试处理器的服务端夹具。
pub struct Fixture {
    pub registry: Arc<HandlerRegistry>,
    pub counters: Arc<Counters>,
    pub uploads: mpsc::UnboundedReceiver<Received>,
}

impl Fixture {
    pub fn new() -> anyhow::Result<Self> {
        let counters = Arc::new(Counters::default());
        let (sender, uploads) = mpsc::unbounded_channel();
        let registry = HandlerRegistry::builder()
            .pull(CountHandler)?
            .pull(BrokenHandler)?
            .pull(FileHandler)?
            .pull(AlphaHandler(Arc::clone(&counters)))?
            .pull(BetaHandler(Arc::clone(&counters)))?
            .push(UploadHandler { uploads: sender })?
            .build();
        Ok(Self {
            registry,
            counters,
            uploads,
        })
    }
}

/// 在回环地址的随机端口上启动服务端。
pub async fn serve(
    pipeline: PipelineConfig,
    registry: Arc<HandlerRegistry>,
) -> anyhow::Result<(ServerBootstrap, SocketAddr)> {
    let server = ServerBootstrap::builder(PeerInfo::new("127.0.0.1", 0))
        .pipeline(pipeline)
        .registry(registry)
        .option("child.tcpNoDelay", 1)?
        .build()?;
    let addr = server.bind().await?;
    Ok((server, addr))
}

pub fn client(addr: SocketAddr, pipeline: PipelineConfig) -> anyhow::Result<ClientBootstrap> {
    Ok(ClientBootstrap::builder(PeerInfo::from(addr))
        .pipeline(pipeline)
        .option("tcpNoDelay", 1)?
        .build()?)
}

/// 为 `localhost` 生成自签名证书，返回服务端与客户端 TLS 配置。
pub fn tls_configs() -> anyhow::Result<(Arc<ServerConfig>, Arc<ClientConfig>)> {
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_der = cert.der().clone();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)?;

    let mut roots = RootCertStore::empty();
    roots.add(cert_der)?;
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok((Arc::new(server), Arc::new(client)))
}
