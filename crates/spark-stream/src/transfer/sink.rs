use std::{fmt, sync::Arc};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::Phase;
use crate::{
    channel::{
        ChannelShared,
        exchange::{ExchangeState, OutboundFrame},
    },
    error::TransferError,
    wire::{Correlation, WirePayload},
};

/// 一次交换的流式输出端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 处理器需要把任意大的内容（例如整份文件）逐块写回对端，而不把它整体放进内存；
/// - 输出端独占于一次处理器调用，写完必须显式 `close`，否则对端无法区分“传完了”与
///   “传到一半断了”。
///
/// ## 逻辑 (How)
/// - `write` 把数据切成不超过 `chunk_size` 的块，每块先消耗一份对端授予的额度，
///   再经连接的有界写队列交给写任务；额度耗尽或队列满时 `await` 挂起，数据从不丢弃；
/// - 额度按交换独立计算，一个读得慢的接收方只会挂起自己的发送方；
/// - `close` 在结束帧后附带回执，写任务刷新成功才确认，因此返回时所有先前写入均已
///   交给套接字；
/// - `abort` 置位交换的取消标志，写任务随即丢弃该交换尚未写出的块，并向对端发送终止帧。
///
/// ## 契约 (What)
/// - 终态只有一次：`Closed` 或 `Aborted`；对已结束的输出端再次 `write`/`close`/`abort`
///   返回 [`TransferError::AlreadyFinished`]；
/// - 对端终止或连接断开后，下一次 `write`/`close` 按已刷出字节数返回
///   `ImmediateFailure` 或 `PartialTransfer`；
/// - 未关闭即被释放时视为终止，尽力通知对端。
pub struct TransferOut {
    shared: Arc<ChannelShared>,
    correlation: Correlation,
    type_key: String,
    state: Arc<ExchangeState>,
    phase: Phase,
    written: u64,
}

impl TransferOut {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        correlation: Correlation,
        type_key: String,
        state: Arc<ExchangeState>,
    ) -> Self {
        Self {
            shared,
            correlation,
            type_key,
            state,
            phase: Phase::Open,
            written: 0,
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

    pub fn chunk_size(&self) -> usize {
        self.shared.settings.chunk_size
    }

    /// 已交给写队列的字节数。
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// 已刷入套接字的字节数。
    pub fn bytes_flushed(&self) -> u64 {
        self.state.flushed()
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        match self.phase {
            Phase::Open => Ok(()),
            finished => Err(TransferError::AlreadyFinished {
                state: finished.as_str(),
            }),
        }
    }

    fn fail(&mut self, reason: String) -> TransferError {
        self.phase = Phase::Aborted;
        self.state.cancel(&reason);
        self.shared
            .exchanges
            .remove(self.correlation.role, self.correlation.exchange);
        debug!(
            channel = self.shared.id,
            exchange = self.correlation.exchange,
            flushed = self.state.flushed(),
            reason = %reason,
            "outbound transfer failed"
        );
        TransferError::failed(self.state.flushed(), reason)
    }

    fn check_cancelled(&mut self) -> Result<(), TransferError> {
        if self.state.is_cancelled() {
            let reason = self.state.reason();
            return Err(self.fail(reason));
        }
        Ok(())
    }

    /// 等待对端为本交换授予一块额度；连接关闭或交换取消时返回 `false`。
    async fn wait_for_credit(&self) -> bool {
        tokio::select! {
            granted = self.state.acquire_credit() => granted,
            _ = self.shared.closed.cancelled() => false,
        }
    }

    /// 追加一段数据。超过分块大小的数据按顺序拆成多帧。
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), TransferError> {
        self.ensure_open()?;
        let mut remaining: Bytes = chunk.into();
        let chunk_size = self.chunk_size();
        while !remaining.is_empty() {
            self.check_cancelled()?;
            if !self.wait_for_credit().await {
                self.check_cancelled()?;
                return Err(self.fail(format!("channel {} closed", self.shared.id)));
            }
            let piece = remaining.split_to(remaining.len().min(chunk_size));
            let len = piece.len() as u64;
            let frame = OutboundFrame::data(
                WirePayload::chunk(self.correlation, piece),
                Arc::clone(&self.state),
            );
            if self.shared.enqueue(frame).await.is_err() {
                return Err(self.fail(format!("channel {} closed", self.shared.id)));
            }
            self.written += len;
        }
        Ok(())
    }

    /// 结束输出：等待先前所有数据与结束帧刷出后返回总字节数。
    pub async fn close(&mut self) -> Result<u64, TransferError> {
        self.ensure_open()?;
        self.check_cancelled()?;
        let (ack, flushed) = oneshot::channel();
        let frame = OutboundFrame::data(WirePayload::close(self.correlation), Arc::clone(&self.state))
            .with_ack(ack);
        if self.shared.enqueue(frame).await.is_err() {
            return Err(self.fail(format!("channel {} closed", self.shared.id)));
        }
        match flushed.await {
            Ok(Ok(())) => {
                self.phase = Phase::Closed;
                self.shared
                    .exchanges
                    .remove(self.correlation.role, self.correlation.exchange);
                debug!(
                    channel = self.shared.id,
                    exchange = self.correlation.exchange,
                    bytes = self.written,
                    "outbound transfer closed"
                );
                Ok(self.written)
            }
            Ok(Err(reason)) => Err(self.fail(reason)),
            Err(_) => Err(self.fail(format!(
                "channel {} closed before the transfer was flushed",
                self.shared.id
            ))),
        }
    }

    /// 终止输出：丢弃尚未写出的块并通知对端。关闭之后不能再终止。
    pub async fn abort(&mut self, reason: impl Into<String>) -> Result<(), TransferError> {
        self.ensure_open()?;
        let reason = reason.into();
        self.phase = Phase::Aborted;
        let first = self.state.cancel(&reason);
        self.shared
            .exchanges
            .remove(self.correlation.role, self.correlation.exchange);
        if first {
            let frame = OutboundFrame::control(WirePayload::abort(self.correlation, &reason));
            let _ = self.shared.enqueue(frame).await;
        }
        debug!(
            channel = self.shared.id,
            exchange = self.correlation.exchange,
            reason = %reason,
            "outbound transfer aborted"
        );
        Ok(())
    }
}

impl Drop for TransferOut {
    fn drop(&mut self) {
        if self.phase != Phase::Open {
            return;
        }
        let reason = "transfer released before close";
        if self.state.cancel(reason) {
            self.shared.send_abort(self.correlation, reason);
        }
        self.shared
            .exchanges
            .remove(self.correlation.role, self.correlation.exchange);
        debug!(
            channel = self.shared.id,
            exchange = self.correlation.exchange,
            "open transfer dropped, aborting"
        );
    }
}

impl fmt::Debug for TransferOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOut")
            .field("channel", &self.shared.id)
            .field("exchange", &self.correlation.exchange)
            .field("type_key", &self.type_key)
            .field("phase", &self.phase)
            .field("written", &self.written)
            .finish()
    }
}
