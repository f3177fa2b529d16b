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
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionFactory, validate_pipeline};
use crate::{
    channel::{Channel, ChannelGroup, ChannelSettings},
    config::TransportConfig,
    error::{self, ConfigError, ConnectionError, StreamError, map_io_error},
    handler::HandlerRegistry,
    peer::PeerInfo,
    pipeline::PipelineConfig,
    runtime::WorkerPool,
    shutdown::Releasable,
    socket::{ServerSocketOptions, SocketOptions},
};

/// 监听队列的默认长度。
pub const DEFAULT_BACKLOG: u32 = 1024;
/// 接入失败后的退避时间，避免在文件描述符耗尽时空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 服务端 Bootstrap：监听 `PeerInfo` 地址并为每个接入连接装配管道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 接入循环只负责 `accept` 与派发，TLS 握手等耗时步骤在独立任务中完成，
///   单个慢客户端不会阻塞其他连接的接入。
///
/// ## 逻辑 (How)
/// - `bind` 在工作池内创建监听套接字：先设置 `SO_REUSEADDR` 与监听选项，再 `listen`；
/// - 接入循环以 `CancellationToken` 控制退出，失败时记录日志并短暂退避；
/// - 接入的连接先应用 `child.` 选项，再交由 `ConnectionFactory` 装配。
///
/// ## 契约 (What)
/// - `bind` 返回实际绑定地址，端口 0 表示由系统分配；重复 `bind` 返回
///   [`ConfigError::AlreadyBound`]，释放后 `bind` 返回 [`ConfigError::Released`]；
/// - 句柄可克隆，最后一个句柄释放时接入循环随之停止。
#[derive(Clone)]
pub struct ServerBootstrap {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    peer: PeerInfo,
    listener_options: SocketOptions,
    backlog: u32,
    pool: WorkerPool,
    accept: Arc<AcceptContext>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    bound: AtomicBool,
    released: AtomicBool,
}

/// 接入循环与建连任务共享的上下文。
struct AcceptContext {
    factory: ConnectionFactory,
    child_options: SocketOptions,
    accepting: CancellationToken,
}

impl ServerBootstrap {
    pub fn builder(peer: PeerInfo) -> ServerBootstrapBuilder {
        ServerBootstrapBuilder::new(peer)
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.inner.peer
    }

    /// 开始监听并返回实际绑定的地址。
    pub async fn bind(&self) -> Result<SocketAddr, StreamError> {
        let inner = &self.inner;
        if inner.released.load(Ordering::Acquire) {
            return Err(ConfigError::Released.into());
        }
        if inner.bound.swap(true, Ordering::AcqRel) {
            return Err(ConfigError::AlreadyBound.into());
        }

        let opened = inner
            .pool
            .run(open_listener(
                inner.peer.clone(),
                inner.listener_options,
                inner.backlog,
            ))
            .await;
        let listener = match opened {
            Ok(Ok(listener)) => listener,
            Ok(Err(err)) | Err(err) => {
                inner.bound.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                inner.bound.store(false, Ordering::Release);
                return Err(map_io_error(error::BIND, err).into());
            }
        };

        *inner.local_addr.lock() = Some(local_addr);
        let task = inner
            .pool
            .spawn(accept_loop(listener, Arc::clone(&inner.accept)));
        *inner.accept_task.lock() = Some(task);
        info!(
            peer = %inner.peer,
            local = %local_addr,
            pool = inner.pool.name(),
            "server bootstrap listening"
        );
        Ok(local_addr)
    }

    /// 实际绑定地址；尚未 `bind` 时为 `None`。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// 当前打开的接入连接。
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.accept.factory.channels.snapshot()
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// 停止接入，关闭全部接入连接并关闭自有工作池。可重复调用。
    pub async fn release(&self) {
        let inner = &self.inner;
        if inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.accept.accepting.cancel();
        let task = inner.accept_task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            debug!(peer = %inner.peer, error = %err, "accept loop ended abnormally");
        }
        let closed = inner.accept.factory.channels.close_all();
        inner.pool.shutdown();
        info!(peer = %inner.peer, closed_channels = closed, "server bootstrap released");
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.accept.accepting.cancel();
    }
}

impl fmt::Debug for ServerBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBootstrap")
            .field("peer", &self.inner.peer)
            .field("local_addr", &self.local_addr())
            .field("pool", &self.inner.pool)
            .field("released", &self.is_released())
            .finish()
    }
}

#[async_trait]
impl Releasable for ServerBootstrap {
    fn label(&self) -> Cow<'static, str> {
        Cow::Owned(format!("server-bootstrap {}", self.inner.peer))
    }

    async fn release(&self) {
        ServerBootstrap::release(self).await;
    }
}

/// 依次尝试解析出的地址，返回第一个成功监听的套接字。
async fn open_listener(
    peer: PeerInfo,
    options: SocketOptions,
    backlog: u32,
) -> Result<TcpListener, ConnectionError> {
    let mut last_error = None;
    for addr in peer.resolve().await? {
        match listen_on(addr, &options, backlog) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                debug!(%addr, error = %err, "listen attempt failed");
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or(ConnectionError::Unresolved {
        peer: peer.to_string(),
    }))
}

fn listen_on(
    addr: SocketAddr,
    options: &SocketOptions,
    backlog: u32,
) -> Result<TcpListener, ConnectionError> {
    let bind_error = |err| map_io_error(error::BIND, err);
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    options.apply_to_socket(&socket)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(backlog).map_err(bind_error)
}

async fn accept_loop(listener: TcpListener, ctx: Arc<AcceptContext>) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.accepting.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                let task = establish(stream, peer_addr, Arc::clone(&ctx));
                ctx.factory.handle.spawn(task);
            }
            Err(err) => {
                let err = map_io_error(error::ACCEPT, err);
                warn!(code = err.code(), error = %err, "accept failed");
                tokio::select! {
                    _ = ctx.accepting.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("accept loop stopped");
}

async fn establish(stream: TcpStream, peer_addr: SocketAddr, ctx: Arc<AcceptContext>) {
    if let Err(err) = ctx.child_options.apply_to_stream(&stream) {
        warn!(peer = %peer_addr, code = err.code(), error = %err, "rejecting connection");
        return;
    }
    match ctx.factory.open(stream, peer_addr, error::ACCEPT).await {
        Ok(channel) => {
            if ctx.accepting.is_cancelled() {
                channel.close();
            }
        }
        Err(err) => warn!(
            peer = %peer_addr,
            code = err.code(),
            error = %err,
            "failed to establish inbound channel"
        ),
    }
}

/// 服务端 Bootstrap 构建器。
pub struct ServerBootstrapBuilder {
    peer: PeerInfo,
    pipeline: PipelineConfig,
    registry: Option<Arc<HandlerRegistry>>,
    options: ServerSocketOptions,
    settings: ChannelSettings,
    pool: Option<WorkerPool>,
    worker_threads: Option<usize>,
    backlog: u32,
}

impl ServerBootstrapBuilder {
    fn new(peer: PeerInfo) -> Self {
        Self {
            peer,
            pipeline: PipelineConfig::default(),
            registry: None,
            options: ServerSocketOptions::default(),
            settings: ChannelSettings::default(),
            pool: None,
            worker_threads: None,
            backlog: DEFAULT_BACKLOG,
        }
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 按名称设置套接字选项；`child.` 前缀作用于接入连接。
    pub fn option(mut self, name: &str, value: i64) -> Result<Self, ConfigError> {
        self.options.set(name, value)?;
        Ok(self)
    }

    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.options.listener = options;
        self
    }

    pub fn child_socket_options(mut self, options: SocketOptions) -> Self {
        self.options.child = options;
        self
    }

    pub fn settings(mut self, settings: ChannelSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 使用给定工作池；未指定时复用构建时所在的运行时。
    pub fn worker_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// 为本 Bootstrap 创建拥有 `threads` 个线程的专属工作池。
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// 采用配置文件中的管道、套接字与分块设置，保留已设置的 TLS 阶段。
    pub fn apply_config(mut self, config: &TransportConfig) -> Self {
        self.pipeline = config.apply_pipeline(self.pipeline);
        self.options.listener = config.socket;
        self.options.child = config.child;
        self.settings = config.transfer;
        self
    }

    pub fn build(self) -> Result<ServerBootstrap, ConfigError> {
        validate_pipeline(&self.pipeline, &self.settings, true)?;
        if self.backlog == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "backlog",
                reason: "must be greater than zero".to_owned(),
            });
        }
        let pool = match (self.pool, self.worker_threads) {
            (Some(pool), _) => pool,
            (None, Some(threads)) => WorkerPool::dedicated("spark-stream-server", threads)?,
            (None, None) => WorkerPool::current("spark-stream-server")?,
        };
        let factory = ConnectionFactory {
            pipeline: Arc::new(self.pipeline),
            registry: self.registry.unwrap_or_else(HandlerRegistry::empty),
            settings: self.settings,
            handle: pool.handle().clone(),
            channels: ChannelGroup::default(),
        };
        Ok(ServerBootstrap {
            inner: Arc::new(ServerInner {
                peer: self.peer,
                listener_options: self.options.listener,
                backlog: self.backlog,
                pool,
                accept: Arc::new(AcceptContext {
                    factory,
                    child_options: self.options.child,
                    accepting: CancellationToken::new(),
                }),
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
                bound: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        })
    }
}
