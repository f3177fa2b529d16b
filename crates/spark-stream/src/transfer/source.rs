use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, trace};

use super::Phase;
use crate::{
    channel::{
        ChannelShared,
        exchange::{InboundEvent, OutboundFrame},
    },
    error::{StreamError, TransferError},
    wire::{Correlation, WirePayload},
};

/// 一次交换的流式输入端：拉取发起方读取响应，推送处理器读取推送内容。
///
/// 块按发送顺序到达；干净结束时 [`TransferIn::next_chunk`] 返回 `Ok(None)`。对端终止或连接
/// 断开时按已收字节数返回 `ImmediateFailure` 或 `PartialTransfer`。在结束前释放会通知对端终止。
///
/// 输入端以数据块为单位向发送方授予额度：开始时授予一个完整窗口，此后每消费半个窗口
/// 补授一次，因此排队中的块永远不超过窗口大小，读任务也无需等待它。
pub struct TransferIn {
    shared: Arc<ChannelShared>,
    correlation: Correlation,
    type_key: String,
    events: mpsc::Receiver<InboundEvent>,
    phase: Phase,
    received: u64,
    window: usize,
    consumed: usize,
}

impl TransferIn {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        correlation: Correlation,
        type_key: String,
        events: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        let window = shared_window(&shared);
        Self {
            shared,
            correlation,
            type_key,
            events,
            phase: Phase::Open,
            received: 0,
            window,
            consumed: 0,
        }
    }

    /// 向发送方授予初始窗口。必须在打开交换的帧入队之后调用。
    pub(crate) fn open_window(&self) {
        self.grant(self.window);
    }

    fn grant(&self, chunks: usize) {
        self.shared.enqueue_detached(OutboundFrame::control(WirePayload::credit(
            self.correlation,
            chunks as u64,
        )));
    }

    fn consume_credit(&mut self) {
        self.consumed += 1;
        if self.consumed >= (self.window / 2).max(1) {
            self.grant(self.consumed);
            trace!(
                channel = self.shared.id,
                exchange = self.correlation.exchange,
                chunks = self.consumed,
                "credit granted"
            );
            self.consumed = 0;
        }
    }

    pub fn exchange_id(&self) -> u64 {
        self.correlation.exchange
    }

    pub fn channel_id(&self) -> u64 {
        self.shared.id
    }

    pub fn type_key(&self) -> &str {
        &self.type_key
    }

    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    pub fn is_finished(&self) -> bool {
        self.phase != Phase::Open
    }

    fn finish(&mut self, phase: Phase) {
        self.phase = phase;
        self.shared
            .exchanges
            .remove(self.correlation.role, self.correlation.exchange);
    }

    fn on_event(&mut self, event: Option<InboundEvent>) -> Result<Option<Bytes>, TransferError> {
        match event {
            Some(InboundEvent::Chunk(chunk)) => {
                self.received += chunk.len() as u64;
                self.consume_credit();
                Ok(Some(chunk))
            }
            Some(InboundEvent::Close) => {
                self.finish(Phase::Closed);
                debug!(
                    channel = self.shared.id,
                    exchange = self.correlation.exchange,
                    bytes = self.received,
                    "inbound transfer completed"
                );
                Ok(None)
            }
            Some(InboundEvent::Abort(reason)) => {
                self.finish(Phase::Aborted);
                Err(TransferError::failed(self.received, reason))
            }
            None => {
                self.finish(Phase::Aborted);
                Err(TransferError::failed(
                    self.received,
                    format!(
                        "channel {} closed before the transfer completed",
                        self.shared.id
                    ),
                ))
            }
        }
    }

    fn ensure_open(&self) -> Result<bool, TransferError> {
        match self.phase {
            Phase::Open => Ok(true),
            Phase::Closed => Ok(false),
            Phase::Aborted => Err(TransferError::AlreadyFinished {
                state: Phase::Aborted.as_str(),
            }),
        }
    }

    /// 读取下一块；传输干净结束后返回 `Ok(None)`。
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        if !self.ensure_open()? {
            return Ok(None);
        }
        let event = self.events.recv().await;
        self.on_event(event)
    }

    /// 收集全部内容。仅适合体量可控的响应。
    pub async fn read_to_end(mut self) -> Result<Bytes, TransferError> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            content.extend_from_slice(&chunk);
        }
        Ok(content.freeze())
    }

    /// 把内容逐块写入 `writer`，返回总字节数。
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(chunk) = self.next_chunk().await? {
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(self.received)
    }

    /// 放弃接收并通知对端终止。
    pub async fn cancel(mut self, reason: impl Into<String>) {
        if self.phase != Phase::Open {
            return;
        }
        let reason = reason.into();
        self.finish(Phase::Aborted);
        let frame = OutboundFrame::control(WirePayload::abort(self.correlation, &reason));
        let _ = self.shared.enqueue(frame).await;
        debug!(
            channel = self.shared.id,
            exchange = self.correlation.exchange,
            reason = %reason,
            "inbound transfer cancelled"
        );
    }
}

fn shared_window(shared: &ChannelShared) -> usize {
    shared.settings.inbound_queue_depth.max(1)
}

impl Stream for TransferIn {
    type Item = Result<Bytes, TransferError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.phase != Phase::Open {
            return Poll::Ready(None);
        }
        let event = ready!(this.events.poll_recv(cx));
        Poll::Ready(this.on_event(event).transpose())
    }
}

impl Drop for TransferIn {
    fn drop(&mut self) {
        if self.phase != Phase::Open {
            return;
        }
        self.finish(Phase::Aborted);
        self.shared
            .send_abort(self.correlation, "receiver released before the transfer completed");
        debug!(
            channel = self.shared.id,
            exchange = self.correlation.exchange,
            "open inbound transfer dropped, aborting"
        );
    }
}

impl fmt::Debug for TransferIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferIn")
            .field("channel", &self.shared.id)
            .field("exchange", &self.correlation.exchange)
            .field("type_key", &self.type_key)
            .field("phase", &self.phase)
            .field("received", &self.received)
            .finish()
    }
}
