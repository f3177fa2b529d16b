//! 连接（Channel）：一条 TCP 连接上的多路复用交换。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 一条连接上需要同时承载多个拉取与推送，且两个方向都可以发起交换；
//! - 处理器可能长时间流式输出，读路径不能因此停顿。
//!
//! ## 逻辑 (How)
//! - 每条连接有一个读任务与一个写任务（见 `driver`）：读任务只做解码与路由，处理器
//!   被派发到 Bootstrap 的工作池；写任务独占编码端并批量刷新；
//! - 写入者经由有界队列把帧交给写任务，队列满时挂起的是写入方的 future 而不是线程；
//! - 交换以“编号 + 发送方角色”关联，两端各自按本端角色维护路由表。
//!
//! ## 契约 (What)
//! - 同一连接内严格保序，跨连接不保证顺序；
//! - [`Channel::close`] 幂等，拆除流程只执行一次，所有未完成交换随之失败。

pub(crate) mod driver;
pub(crate) mod exchange;

use std::{
    borrow::Cow,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ConfigError, ConnectionError, StreamError},
    handler::WireMessage,
    pipeline::StageKind,
    shutdown::Releasable,
    transfer::{TransferIn, TransferOut},
    wire::{Correlation, PayloadKind, Role, WirePayload},
};
use exchange::{ExchangeState, ExchangeTable, OutboundFrame, Route, inbound_queue};

/// 默认分块大小：64 KiB。
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// 默认出站队列深度（帧）。
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;
/// 默认每个接收中交换的入站队列深度（块）。
pub const DEFAULT_INBOUND_QUEUE_DEPTH: usize = 64;
/// 数据块帧除消息体之外的最大开销，用于校验分块大小与帧上限是否兼容。
pub const CHUNK_FRAME_OVERHEAD: usize = 32;

/// 单条连接上的流控参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelSettings {
    pub chunk_size: usize,
    pub outbound_queue_depth: usize,
    /// 每个入站交换的额度窗口（块）。
    pub inbound_queue_depth: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            inbound_queue_depth: DEFAULT_INBOUND_QUEUE_DEPTH,
        }
    }
}

impl ChannelSettings {
    pub fn validate(&self, max_frame_length: usize) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size + CHUNK_FRAME_OVERHEAD > max_frame_length {
            return Err(ConfigError::InvalidSetting {
                name: "chunk_size",
                reason: format!(
                    "{} must be non-zero and leave {CHUNK_FRAME_OVERHEAD} bytes of headroom below the frame limit {max_frame_length}",
                    self.chunk_size
                ),
            });
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "outbound_queue_depth",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.inbound_queue_depth == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "inbound_queue_depth",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }
}

/// 连接内部共享状态，读写任务、`TransferOut`/`TransferIn` 与句柄共同持有。
pub(crate) struct ChannelShared {
    pub(crate) id: u64,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) stages: Vec<StageKind>,
    pub(crate) settings: ChannelSettings,
    pub(crate) outbound: mpsc::Sender<OutboundFrame>,
    pub(crate) exchanges: ExchangeTable,
    pub(crate) next_exchange: AtomicU64,
    pub(crate) closed: CancellationToken,
    pub(crate) handle: Handle,
}

impl ChannelShared {
    pub(crate) fn next_exchange_id(&self) -> u64 {
        self.next_exchange.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn closed_error(&self) -> ConnectionError {
        ConnectionError::Closed { channel: self.id }
    }

    /// 等待队列空位后入队。
    pub(crate) async fn enqueue(&self, frame: OutboundFrame) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| self.closed_error())
    }

    /// 不等待地入队；队列已满时转交给后台任务。
    ///
    /// 读任务与 `Drop` 路径都不能在写队列上等待。
    pub(crate) fn enqueue_detached(&self, frame: OutboundFrame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let outbound = self.outbound.clone();
                self.handle.spawn(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn send_abort(&self, correlation: Correlation, reason: &str) {
        self.enqueue_detached(OutboundFrame::control(WirePayload::abort(
            correlation,
            reason,
        )));
    }
}

/// 一条已建立连接的句柄，克隆成本为一次引用计数。
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn stages(&self) -> &[StageKind] {
        &self.shared.stages
    }

    pub fn settings(&self) -> ChannelSettings {
        self.shared.settings
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    /// 当前仍在进行中的交换数量。
    pub fn active_exchanges(&self) -> usize {
        self.shared.exchanges.len()
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.shared.closed_error())
        }
    }

    /// 发起拉取：发送请求，返回用于读取响应流的 [`TransferIn`]。
    pub async fn pull<M: WireMessage>(&self, request: &M) -> Result<TransferIn, StreamError> {
        self.pull_raw(M::TYPE_KEY, request.encode_body()).await
    }

    pub async fn pull_raw(
        &self,
        type_key: &str,
        body: impl Into<Bytes>,
    ) -> Result<TransferIn, StreamError> {
        self.ensure_open()?;
        let correlation = Correlation::new(self.shared.next_exchange_id(), Role::Initiator);
        let (events, receiver) = inbound_queue(self.shared.settings.inbound_queue_depth);
        self.shared.exchanges.insert(
            Role::Initiator,
            correlation.exchange,
            Route::Source(events),
        );
        let transfer = TransferIn::new(
            Arc::clone(&self.shared),
            correlation,
            type_key.to_owned(),
            receiver,
        );
        let request = WirePayload::new(PayloadKind::Pull, Some(correlation))
            .with_type_key(type_key)
            .with_body(body);
        self.shared.enqueue(OutboundFrame::control(request)).await?;
        transfer.open_window();
        tracing::debug!(
            channel = self.shared.id,
            exchange = correlation.exchange,
            type_key,
            "pull requested"
        );
        Ok(transfer)
    }

    /// 发起推送：发送消息，返回用于流式写出数据的 [`TransferOut`]。
    pub async fn push<M: WireMessage>(&self, message: &M) -> Result<TransferOut, StreamError> {
        self.push_raw(M::TYPE_KEY, message.encode_body()).await
    }

    pub async fn push_raw(
        &self,
        type_key: &str,
        body: impl Into<Bytes>,
    ) -> Result<TransferOut, StreamError> {
        self.ensure_open()?;
        let correlation = Correlation::new(self.shared.next_exchange_id(), Role::Initiator);
        let state = ExchangeState::new();
        self.shared.exchanges.insert(
            Role::Initiator,
            correlation.exchange,
            Route::Sink(Arc::clone(&state)),
        );
        let transfer = TransferOut::new(
            Arc::clone(&self.shared),
            correlation,
            type_key.to_owned(),
            state,
        );
        let message = WirePayload::new(PayloadKind::Push, Some(correlation))
            .with_type_key(type_key)
            .with_body(body);
        self.shared.enqueue(OutboundFrame::control(message)).await?;
        tracing::debug!(
            channel = self.shared.id,
            exchange = correlation.exchange,
            type_key,
            "push started"
        );
        Ok(transfer)
    }

    /// 关闭连接。可重复调用，拆除只发生一次。
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// 等待连接关闭（本端关闭或对端断开）。
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("local_addr", &self.shared.local_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl Releasable for Channel {
    fn label(&self) -> Cow<'static, str> {
        Cow::Owned(format!("channel#{} ({})", self.shared.id, self.shared.peer_addr))
    }

    async fn release(&self) {
        self.close();
    }
}

/// Bootstrap 名下的连接集合；连接关闭后自动移出。
#[derive(Clone, Default)]
pub(crate) struct ChannelGroup {
    channels: Arc<DashMap<u64, Channel>>,
}

impl ChannelGroup {
    pub(crate) fn track(&self, channel: &Channel) {
        self.channels.insert(channel.id(), channel.clone());
        let channels = Arc::clone(&self.channels);
        let watched = channel.clone();
        channel.shared.handle.spawn(async move {
            watched.closed().await;
            channels.remove(&watched.id());
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 关闭全部连接，返回关闭数量。
    pub(crate) fn close_all(&self) -> usize {
        let channels = self.snapshot();
        for channel in &channels {
            channel.close();
        }
        self.channels.clear();
        channels.len()
    }
}
