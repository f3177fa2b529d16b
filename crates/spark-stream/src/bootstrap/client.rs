use std::{
    borrow::Cow,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info};

use super::{ConnectionFactory, validate_pipeline};
use crate::{
    channel::{Channel, ChannelGroup, ChannelSettings},
    config::{DEFAULT_CLIENT_WORKER_THREADS, DEFAULT_CONNECT_TIMEOUT, TransportConfig},
    error::{self, ConfigError, ConnectionError, StreamError, map_io_error, timeout_error},
    handler::HandlerRegistry,
    peer::PeerInfo,
    pipeline::PipelineConfig,
    runtime::WorkerPool,
    shutdown::Releasable,
    socket::SocketOptions,
};

/// 客户端 Bootstrap：向 `PeerInfo` 建立连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端推送处理器常常需要把数据继续推给下一跳；若建连与回推运行在接入侧的工作池上，
///   接入侧线程被占满时回推会等待自己，形成重入死锁。客户端因此默认持有专属工作池。
///
/// ## 逻辑 (How)
/// - 建连在工作池内完成：解析地址，设置套接字选项，带超时 `connect`，装配管道并启动驱动；
/// - 解析出多个地址时依次尝试，返回最后一个失败原因。
///
/// ## 契约 (What)
/// - 返回的 [`Channel`] 的读写任务与处理器均运行在本 Bootstrap 的工作池上；
/// - `release` 关闭全部连接并关闭自有工作池，此后 `connect` 返回 [`ConfigError::Released`]。
#[derive(Clone)]
pub struct ClientBootstrap {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    peer: PeerInfo,
    pool: WorkerPool,
    connect: Arc<ConnectContext>,
    released: AtomicBool,
}

struct ConnectContext {
    factory: ConnectionFactory,
    options: SocketOptions,
    connect_timeout: Duration,
}

impl ClientBootstrap {
    pub fn builder(peer: PeerInfo) -> ClientBootstrapBuilder {
        ClientBootstrapBuilder::new(peer)
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// 连接到构建时指定的对端。
    pub async fn connect(&self) -> Result<Channel, StreamError> {
        self.connect_to(&self.inner.peer).await
    }

    /// 复用本 Bootstrap 的管道与注册表连接到任意对端。
    pub async fn connect_to(&self, peer: &PeerInfo) -> Result<Channel, StreamError> {
        if self.is_released() {
            return Err(ConfigError::Released.into());
        }
        let ctx = Arc::clone(&self.inner.connect);
        let channel = self
            .inner
            .pool
            .run(establish(ctx, peer.clone()))
            .await??;
        Ok(channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.connect.factory.channels.snapshot()
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// 关闭全部连接与自有工作池。可重复调用。
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let closed = self.inner.connect.factory.channels.close_all();
        self.inner.pool.shutdown();
        info!(peer = %self.inner.peer, closed_channels = closed, "client bootstrap released");
    }
}

impl fmt::Debug for ClientBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBootstrap")
            .field("peer", &self.inner.peer)
            .field("pool", &self.inner.pool)
            .field("released", &self.is_released())
            .finish()
    }
}

#[async_trait]
impl Releasable for ClientBootstrap {
    fn label(&self) -> Cow<'static, str> {
        Cow::Owned(format!("client-bootstrap {}", self.inner.peer))
    }

    async fn release(&self) {
        ClientBootstrap::release(self).await;
    }
}

async fn establish(ctx: Arc<ConnectContext>, peer: PeerInfo) -> Result<Channel, ConnectionError> {
    let mut last_error = None;
    for addr in peer.resolve().await? {
        match connect_once(&ctx, addr).await {
            Ok(stream) => {
                let channel = ctx.factory.open(stream, addr, error::CONNECT).await?;
                debug!(%peer, channel = channel.id(), "client channel connected");
                return Ok(channel);
            }
            Err(err) => {
                debug!(%peer, %addr, error = %err, "connect attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or(ConnectionError::Unresolved {
        peer: peer.to_string(),
    }))
}

async fn connect_once(ctx: &ConnectContext, addr: SocketAddr) -> Result<TcpStream, ConnectionError> {
    let connect_error = |err| map_io_error(error::CONNECT, err);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(connect_error)?;
    ctx.options.apply_to_socket(&socket)?;
    match tokio::time::timeout(ctx.connect_timeout, socket.connect(addr)).await {
        Ok(result) => result.map_err(connect_error),
        Err(_) => Err(timeout_error(error::CONNECT, ctx.connect_timeout)),
    }
}

/// 客户端 Bootstrap 构建器。
pub struct ClientBootstrapBuilder {
    peer: PeerInfo,
    pipeline: PipelineConfig,
    registry: Option<Arc<HandlerRegistry>>,
    options: SocketOptions,
    settings: ChannelSettings,
    pool: Option<WorkerPool>,
    worker_threads: usize,
    connect_timeout: Duration,
}

impl ClientBootstrapBuilder {
    fn new(peer: PeerInfo) -> Self {
        Self {
            peer,
            pipeline: PipelineConfig::default(),
            registry: None,
            options: SocketOptions::default(),
            settings: ChannelSettings::default(),
            pool: None,
            worker_threads: DEFAULT_CLIENT_WORKER_THREADS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// 客户端一侧同样可以服务对端发起的交换；未指定时为空注册表。
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn option(mut self, name: &str, value: i64) -> Result<Self, ConfigError> {
        self.options.set(name, value)?;
        Ok(self)
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    pub fn settings(mut self, settings: ChannelSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 使用给定工作池代替专属工作池。
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 采用配置文件中的管道、套接字、分块与客户端设置，保留已设置的 TLS 阶段。
    pub fn apply_config(mut self, config: &TransportConfig) -> Self {
        self.pipeline = config.apply_pipeline(self.pipeline);
        self.options = config.socket;
        self.settings = config.transfer;
        self.worker_threads = config.client.worker_threads;
        self.connect_timeout = config.client.connect_timeout();
        self
    }

    pub fn build(self) -> Result<ClientBootstrap, ConfigError> {
        validate_pipeline(&self.pipeline, &self.settings, false)?;
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "connect_timeout",
                reason: "must be greater than zero".to_owned(),
            });
        }
        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::dedicated("spark-stream-client", self.worker_threads)?,
        };
        let factory = ConnectionFactory {
            pipeline: Arc::new(self.pipeline),
            registry: self.registry.unwrap_or_else(HandlerRegistry::empty),
            settings: self.settings,
            handle: pool.handle().clone(),
            channels: ChannelGroup::default(),
        };
        Ok(ClientBootstrap {
            inner: Arc::new(ClientInner {
                peer: self.peer,
                pool,
                connect: Arc::new(ConnectContext {
                    factory,
                    options: self.options,
                    connect_timeout: self.connect_timeout,
                }),
                released: AtomicBool::new(false),
            }),
        })
    }
}
