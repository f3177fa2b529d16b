use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    Channel, ChannelSettings, ChannelShared,
    exchange::{
        ExchangeState, ExchangeTable, InboundEvent, OutboundFrame, Receipt, Route, inbound_queue,
    },
};
use crate::{
    error::{DispatchError, FramingError},
    handler::HandlerRegistry,
    pipeline::{Pipeline, PipelineReader, PipelineWriter, StageKind},
    transfer::{TransferIn, TransferOut},
    wire::{Correlation, PayloadKind, Role, WirePayload},
};

/// 写任务一次批量处理的最大帧数。
const MAX_WRITE_BATCH: usize = 64;
/// 关闭写半部时等待缓冲刷出的上限。
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(1);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 建立连接驱动所需的上下文。
pub(crate) struct ChannelContext {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) handle: Handle,
    pub(crate) settings: ChannelSettings,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
}

/// 在 `ctx.handle` 所属的工作池上启动读写任务，返回连接句柄。
pub(crate) fn start(pipeline: Pipeline, ctx: ChannelContext) -> Channel {
    let stages = pipeline.stages().to_vec();
    let (reader, writer) = pipeline.into_parts();
    let (outbound, queue) = mpsc::channel(ctx.settings.outbound_queue_depth);
    let shared = Arc::new(ChannelShared {
        id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        peer_addr: ctx.peer_addr,
        local_addr: ctx.local_addr,
        stages,
        settings: ctx.settings,
        outbound,
        exchanges: ExchangeTable::default(),
        next_exchange: AtomicU64::new(1),
        closed: CancellationToken::new(),
        handle: ctx.handle.clone(),
    });

    ctx.handle
        .spawn(write_loop(writer, queue, shared.id, shared.closed.clone()));
    ctx.handle
        .spawn(read_loop(reader, Arc::clone(&shared), ctx.registry));

    let stage_names: Vec<&'static str> = shared.stages.iter().map(|s| StageKind::name(*s)).collect();
    info!(
        channel = shared.id,
        peer = %shared.peer_addr,
        local = %shared.local_addr,
        stages = ?stage_names,
        "channel established"
    );
    Channel::from_shared(shared)
}

async fn read_loop(
    mut reader: PipelineReader,
    shared: Arc<ChannelShared>,
    registry: Arc<HandlerRegistry>,
) {
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break "channel closed locally".to_owned(),
            next = reader.next() => next,
        };
        match next {
            None => break "peer closed the connection".to_owned(),
            Some(Err(err)) => {
                warn!(
                    channel = shared.id,
                    peer = %shared.peer_addr,
                    code = err.code(),
                    error = %err,
                    "inbound stream failed, tearing down channel"
                );
                break err.to_string();
            }
            Some(Ok(payload)) => route(&shared, &registry, payload),
        }
    };

    shared.closed.cancel();
    let failed = shared.exchanges.fail_all(&reason);
    info!(
        channel = shared.id,
        peer = %shared.peer_addr,
        failed_exchanges = failed,
        reason = %reason,
        "channel closed"
    );
}

/// 分发一个入站信封。只做非阻塞操作：数据块进入按额度限定容量的队列，从不等待接收方。
fn route(shared: &Arc<ChannelShared>, registry: &HandlerRegistry, payload: WirePayload) {
    let Some(correlation) = payload.correlation else {
        warn!(
            channel = shared.id,
            kind = payload.kind.as_str(),
            "dropping payload without correlation metadata"
        );
        return;
    };
    let local_role = correlation.role.opposite();
    let exchange = correlation.exchange;

    match payload.kind {
        PayloadKind::Pull | PayloadKind::Push if correlation.role == Role::Responder => {
            warn!(
                channel = shared.id,
                exchange,
                kind = payload.kind.as_str(),
                "responder frames cannot open an exchange"
            );
        }
        PayloadKind::Pull => dispatch_pull(shared, registry, exchange, payload.type_key, payload.body),
        PayloadKind::Push => dispatch_push(shared, registry, exchange, payload.type_key, payload.body),
        PayloadKind::Chunk => match shared.exchanges.get(local_role, exchange) {
            Some(Route::Source(events)) => match events.try_send(InboundEvent::Chunk(payload.body)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    shared.exchanges.remove(local_role, exchange);
                    warn!(
                        channel = shared.id,
                        exchange,
                        "peer exceeded the granted credit, aborting exchange"
                    );
                    shared.send_abort(
                        Correlation::new(exchange, local_role),
                        "flow-control window exceeded",
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    shared.exchanges.remove(local_role, exchange);
                }
            },
            Some(Route::Sink(_)) => warn!(
                channel = shared.id,
                exchange,
                "peer sent data on an exchange this side is sending"
            ),
            None => trace!(channel = shared.id, exchange, "chunk for inactive exchange dropped"),
        },
        PayloadKind::Credit => match shared.exchanges.get(local_role, exchange) {
            Some(Route::Sink(state)) => match payload.credit_chunks() {
                Some(chunks) => state.grant(chunks),
                None => warn!(channel = shared.id, exchange, "malformed credit dropped"),
            },
            Some(Route::Source(_)) => warn!(
                channel = shared.id,
                exchange,
                "peer granted credit on an exchange this side is receiving"
            ),
            None => trace!(channel = shared.id, exchange, "credit for inactive exchange dropped"),
        },
        PayloadKind::Close => match shared.exchanges.remove(local_role, exchange) {
            Some(Route::Source(events)) => {
                let _ = events.try_send(InboundEvent::Close);
            }
            Some(Route::Sink(state)) => {
                warn!(
                    channel = shared.id,
                    exchange,
                    "peer closed an exchange this side is sending"
                );
                state.cancel("peer closed the exchange out of turn");
            }
            None => trace!(channel = shared.id, exchange, "close for inactive exchange dropped"),
        },
        PayloadKind::Abort => {
            let reason = String::from_utf8_lossy(&payload.body).into_owned();
            match shared.exchanges.remove(local_role, exchange) {
                Some(Route::Source(events)) => {
                    debug!(channel = shared.id, exchange, reason = %reason, "peer aborted inbound transfer");
                    let _ = events.try_send(InboundEvent::Abort(reason));
                }
                Some(Route::Sink(state)) => {
                    debug!(channel = shared.id, exchange, reason = %reason, "peer aborted outbound transfer");
                    state.cancel(&reason);
                }
                None => trace!(channel = shared.id, exchange, "abort for inactive exchange dropped"),
            }
        }
    }
}

fn reject(shared: &ChannelShared, exchange: u64, type_key: &str, err: &DispatchError) {
    warn!(
        channel = shared.id,
        exchange,
        type_key,
        code = err.code(),
        error = %err,
        "rejecting exchange"
    );
    shared.send_abort(Correlation::new(exchange, Role::Responder), &err.to_string());
}

fn dispatch_pull(
    shared: &Arc<ChannelShared>,
    registry: &HandlerRegistry,
    exchange: u64,
    type_key: String,
    body: Bytes,
) {
    let handler = match registry.resolve_pull(&type_key) {
        Ok(handler) => handler,
        Err(err) => return reject(shared, exchange, &type_key, &err),
    };
    let state = ExchangeState::new();
    if !shared
        .exchanges
        .insert(Role::Responder, exchange, Route::Sink(Arc::clone(&state)))
    {
        return reject(shared, exchange, &type_key, &DispatchError::DuplicateExchange(exchange));
    }

    let transfer = TransferOut::new(
        Arc::clone(shared),
        Correlation::new(exchange, Role::Responder),
        type_key.clone(),
        state,
    );
    let channel = shared.id;
    shared.handle.spawn(async move {
        match handler.invoke(body, transfer).await {
            Ok(()) => debug!(channel, exchange, type_key = %type_key, "pull handler completed"),
            Err(err) => warn!(
                channel,
                exchange,
                type_key = %type_key,
                code = err.code(),
                error = %err,
                "pull handler failed"
            ),
        }
    });
}

fn dispatch_push(
    shared: &Arc<ChannelShared>,
    registry: &HandlerRegistry,
    exchange: u64,
    type_key: String,
    body: Bytes,
) {
    let handler = match registry.resolve_push(&type_key) {
        Ok(handler) => handler,
        Err(err) => return reject(shared, exchange, &type_key, &err),
    };
    let (events, receiver) = inbound_queue(shared.settings.inbound_queue_depth);
    if !shared
        .exchanges
        .insert(Role::Responder, exchange, Route::Source(events))
    {
        return reject(shared, exchange, &type_key, &DispatchError::DuplicateExchange(exchange));
    }

    let transfer = TransferIn::new(
        Arc::clone(shared),
        Correlation::new(exchange, Role::Responder),
        type_key.clone(),
        receiver,
    );
    transfer.open_window();
    let channel = shared.id;
    shared.handle.spawn(async move {
        match handler.invoke(body, transfer).await {
            Ok(()) => debug!(channel, exchange, type_key = %type_key, "push handler completed"),
            Err(err) => warn!(
                channel,
                exchange,
                type_key = %type_key,
                code = err.code(),
                error = %err,
                "push handler failed"
            ),
        }
    });
}

async fn write_loop(
    mut writer: PipelineWriter,
    mut queue: mpsc::Receiver<OutboundFrame>,
    channel: u64,
    closed: CancellationToken,
) {
    let mut batch = Vec::with_capacity(MAX_WRITE_BATCH);
    loop {
        let first = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        batch.push(first);
        while batch.len() < MAX_WRITE_BATCH {
            match queue.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            outcome = write_batch(&mut writer, &mut batch) => outcome,
        };
        if let Err(err) = outcome {
            warn!(
                channel,
                code = err.code(),
                error = %err,
                "outbound write failed, closing channel"
            );
            closed.cancel();
            break;
        }
    }

    for frame in batch.drain(..) {
        frame.fail("channel closed");
    }
    queue.close();
    while let Ok(frame) = queue.try_recv() {
        frame.fail("channel closed");
    }
    match tokio::time::timeout(WRITER_CLOSE_GRACE, writer.close()).await {
        Ok(Ok(())) => trace!(channel, "write half shut down"),
        Ok(Err(err)) => debug!(channel, error = %err, "write half shutdown failed"),
        Err(_) => debug!(channel, "write half shutdown timed out"),
    }
}

/// 依次编码一批帧并统一刷新；刷新成功后才确认回执。
async fn write_batch(
    writer: &mut PipelineWriter,
    batch: &mut Vec<OutboundFrame>,
) -> Result<(), FramingError> {
    let mut written: Vec<Receipt> = Vec::with_capacity(batch.len());
    for frame in batch.drain(..) {
        if let Some(reason) = frame.discard_reason() {
            frame.fail(&reason);
            continue;
        }
        let (payload, receipt) = frame.into_parts();
        if let Err(err) = writer.feed(payload).await {
            receipt.fail("outbound write failed");
            for receipt in written {
                receipt.fail("outbound write failed");
            }
            return Err(err);
        }
        written.push(receipt);
    }
    if let Err(err) = writer.flush().await {
        for receipt in written {
            receipt.fail("outbound flush failed");
        }
        return Err(err);
    }
    for receipt in written {
        receipt.succeed();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tracing_test::traced_test;

    use super::*;
    use crate::pipeline::PipelineConfig;

    fn local() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_pull_is_aborted_and_logged() {
        let config = PipelineConfig::new();
        let (near, far) = tokio::io::duplex(64 * 1024);
        let channel = start(
            config.frame(near),
            ChannelContext {
                registry: HandlerRegistry::empty(),
                handle: Handle::current(),
                settings: ChannelSettings::default(),
                peer_addr: local(),
                local_addr: local(),
            },
        );
        let mut peer = config.frame(far);

        let request = WirePayload::new(
            PayloadKind::Pull,
            Some(Correlation::new(9, Role::Initiator)),
        )
        .with_type_key("missing.Type");
        peer.send(request).await.expect("发送请求");

        let reply = peer
            .recv()
            .await
            .expect("连接仍然打开")
            .expect("回复可解码");
        assert_eq!(reply.kind, PayloadKind::Abort);
        assert_eq!(reply.correlation, Some(Correlation::new(9, Role::Responder)));
        assert!(String::from_utf8_lossy(&reply.body).contains("missing.Type"));
        assert!(channel.is_open());
        assert!(logs_contain("rejecting exchange"));

        channel.close();
        channel.closed().await;
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn pull_grants_credit_and_overrunning_peer_is_aborted() {
        let config = PipelineConfig::new();
        let (near, far) = tokio::io::duplex(64 * 1024);
        let channel = start(
            config.frame(near),
            ChannelContext {
                registry: HandlerRegistry::empty(),
                handle: Handle::current(),
                settings: ChannelSettings {
                    inbound_queue_depth: 2,
                    ..ChannelSettings::default()
                },
                peer_addr: local(),
                local_addr: local(),
            },
        );
        let mut peer = config.frame(far);

        let mut transfer = channel.pull_raw("example.Get", Bytes::new()).await.expect("发起拉取");
        let pull = peer.recv().await.expect("连接仍然打开").expect("请求可解码");
        assert_eq!(pull.kind, PayloadKind::Pull);
        let credit = peer.recv().await.expect("连接仍然打开").expect("额度可解码");
        assert_eq!(credit.kind, PayloadKind::Credit);
        assert_eq!(credit.correlation, pull.correlation);
        assert_eq!(credit.credit_chunks(), Some(2));

        let responder = Correlation::new(transfer.exchange_id(), Role::Responder);
        for _ in 0..4 {
            peer.send(WirePayload::chunk(responder, Bytes::from_static(b"x")))
                .await
                .expect("发送数据块");
        }
        let reply = peer.recv().await.expect("连接仍然打开").expect("回复可解码");
        assert_eq!(reply.kind, PayloadKind::Abort);
        assert_eq!(reply.body, Bytes::from_static(b"flow-control window exceeded"));
        assert!(logs_contain("peer exceeded the granted credit"));

        for _ in 0..3 {
            assert!(transfer.next_chunk().await.expect("已排队的块").is_some());
        }
        assert!(transfer.next_chunk().await.is_err());
        assert!(channel.is_open());
    }
}
