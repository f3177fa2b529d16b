//! 交换（exchange）层面的共享状态：路由表、出站帧回执与取消标志。

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, oneshot};

use crate::wire::{PayloadKind, Role, WirePayload};

/// 单个交换可累积的额度上限（块），超出部分直接舍弃。
const MAX_CREDIT: usize = 1 << 20;

/// 发送端的交换状态，由 `TransferOut`、读任务与写任务共享。
///
/// - `credits` 是对端授予的数据块额度，每写出一块消耗一个；
/// - `cancelled` 一旦置位，写任务丢弃该交换尚未写出的数据帧，等待额度的写入方被唤醒；
/// - `flushed` 只统计已经刷入套接字的数据字节，用来区分立即失败与部分传输。
#[derive(Debug)]
pub(crate) struct ExchangeState {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    flushed: AtomicU64,
    credits: Semaphore,
}

impl ExchangeState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
            flushed: AtomicU64::new(0),
            credits: Semaphore::new(0),
        })
    }

    /// 首次取消返回 `true`，之后的调用保留最初的原因。
    pub(crate) fn cancel(&self, reason: &str) -> bool {
        let mut slot = self.reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason.to_owned());
        self.cancelled.store(true, Ordering::Release);
        self.credits.close();
        true
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "exchange cancelled".to_owned())
    }

    pub(crate) fn record_flushed(&self, bytes: u64) {
        self.flushed.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Acquire)
    }

    /// 记入对端授予的额度。
    pub(crate) fn grant(&self, chunks: u64) {
        let room = MAX_CREDIT.saturating_sub(self.credits.available_permits());
        let chunks = usize::try_from(chunks).unwrap_or(usize::MAX).min(room);
        if chunks > 0 {
            self.credits.add_permits(chunks);
        }
    }

    /// 消耗一块额度，没有额度时挂起；交换被取消时返回 `false`。
    pub(crate) async fn acquire_credit(&self) -> bool {
        match self.credits.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn available_credit(&self) -> usize {
        self.credits.available_permits()
    }
}

/// 为接收端建立事件队列：最多 `window` 个未授额的数据块，外加一个结束事件。
pub(crate) fn inbound_queue(
    window: usize,
) -> (mpsc::Sender<InboundEvent>, mpsc::Receiver<InboundEvent>) {
    mpsc::channel(window.max(1) + 1)
}

/// 接收端收到的事件。
#[derive(Debug)]
pub(crate) enum InboundEvent {
    Chunk(Bytes),
    Close,
    Abort(String),
}

/// 一个活动交换在本端的落点。
#[derive(Clone, Debug)]
pub(crate) enum Route {
    /// 本端是数据发送方。
    Sink(Arc<ExchangeState>),
    /// 本端是数据接收方。
    Source(mpsc::Sender<InboundEvent>),
}

/// 活动交换表：按本端角色分成两张表，交换编号只在各自的表内唯一。
#[derive(Debug, Default)]
pub(crate) struct ExchangeTable {
    initiated: DashMap<u64, Route>,
    accepted: DashMap<u64, Route>,
}

impl ExchangeTable {
    fn side(&self, local_role: Role) -> &DashMap<u64, Route> {
        match local_role {
            Role::Initiator => &self.initiated,
            Role::Responder => &self.accepted,
        }
    }

    /// 编号已存在时返回 `false`，原有路由保持不变。
    pub(crate) fn insert(&self, local_role: Role, exchange: u64, route: Route) -> bool {
        match self.side(local_role).entry(exchange) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(route);
                true
            }
        }
    }

    pub(crate) fn get(&self, local_role: Role, exchange: u64) -> Option<Route> {
        self.side(local_role)
            .get(&exchange)
            .map(|route| route.value().clone())
    }

    pub(crate) fn remove(&self, local_role: Role, exchange: u64) -> Option<Route> {
        self.side(local_role)
            .remove(&exchange)
            .map(|(_, route)| route)
    }

    pub(crate) fn len(&self) -> usize {
        self.initiated.len() + self.accepted.len()
    }

    /// 连接终止时让所有活动交换失败：发送端被取消，接收端的队列随发送者一起关闭。
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        let mut failed = 0;
        for table in [&self.initiated, &self.accepted] {
            let exchanges: Vec<u64> = table.iter().map(|entry| *entry.key()).collect();
            for exchange in exchanges {
                if let Some((_, route)) = table.remove(&exchange) {
                    if let Route::Sink(state) = route {
                        state.cancel(reason);
                    }
                    failed += 1;
                }
            }
        }
        failed
    }
}

/// 写任务完成一帧后的回执。
#[derive(Debug, Default)]
pub(crate) struct Receipt {
    exchange: Option<Arc<ExchangeState>>,
    data_bytes: u64,
    ack: Option<oneshot::Sender<Result<(), String>>>,
}

impl Receipt {
    pub(crate) fn succeed(self) {
        if let Some(exchange) = &self.exchange
            && self.data_bytes > 0
        {
            exchange.record_flushed(self.data_bytes);
        }
        if let Some(ack) = self.ack {
            let _ = ack.send(Ok(()));
        }
    }

    pub(crate) fn fail(self, reason: &str) {
        if let Some(ack) = self.ack {
            let _ = ack.send(Err(reason.to_owned()));
        }
    }
}

/// 进入写队列的一帧。
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    payload: WirePayload,
    receipt: Receipt,
}

impl OutboundFrame {
    /// 不隶属于数据流的控制帧（请求、终止），总会被写出。
    pub(crate) fn control(payload: WirePayload) -> Self {
        Self {
            payload,
            receipt: Receipt::default(),
        }
    }

    /// 隶属于某个发送中交换的数据帧或结束帧；交换被取消后会被丢弃。
    pub(crate) fn data(payload: WirePayload, exchange: Arc<ExchangeState>) -> Self {
        let data_bytes = match payload.kind {
            PayloadKind::Chunk => payload.body.len() as u64,
            _ => 0,
        };
        Self {
            payload,
            receipt: Receipt {
                exchange: Some(exchange),
                data_bytes,
                ack: None,
            },
        }
    }

    pub(crate) fn with_ack(mut self, ack: oneshot::Sender<Result<(), String>>) -> Self {
        self.receipt.ack = Some(ack);
        self
    }

    /// 所属交换已取消时返回取消原因。
    pub(crate) fn discard_reason(&self) -> Option<String> {
        self.receipt
            .exchange
            .as_ref()
            .filter(|exchange| exchange.is_cancelled())
            .map(|exchange| exchange.reason())
    }

    pub(crate) fn into_parts(self) -> (WirePayload, Receipt) {
        (self.payload, self.receipt)
    }

    pub(crate) fn fail(self, reason: &str) {
        self.receipt.fail(reason);
    }
}
