#![doc = r#"
# spark-stream

## 设计动机（Why）
- **定位**：在 TCP（可选 TLS）之上提供流式的拉取 / 推送交换：一端发出类型化的请求或推送消息，
  随后以任意长度的分块流传输内容，单个传输不受帧大小或内存约束。
- **架构角色**：本 crate 覆盖从套接字到处理器的完整链路，包括分帧、压缩、信封编解码、
  按类型分发、流控与停机；示例服务器与客户端位于 `spark-stream-examples`。
- **设计理念**：同一连接可以承载多个并发交换，读路径从不运行处理器，写路径经有界队列
  施加背压；执行上下文按 Bootstrap 隔离，回推数据不会与接入侧争用线程。

## 核心契约（What）
- **线上格式**：`[varint32 长度][WirePayload]` 的重复序列，超过上限的帧在分配缓冲前即被拒绝；
- **保序**：单个连接内，`write(chunk_1..n)` 后 `close()` 的对端观察顺序与发送顺序一致；
- **失败语义**：传输要么完整成功，要么整体失败；失败报告区分“尚未送出字节”与“部分送出”；
- **隔离**：未注册类型或消息解码失败只让该交换失败，连接继续可用；分帧错误则关闭连接。

## 实现策略（How）
- **执行框架**：Tokio 多线程运行时作为工作池，`tokio-util` 的 `FramedRead`/`FramedWrite`
  承载编解码，`CancellationToken` 驱动连接拆除；
- **阶段链**：TLS（`tokio-rustls`）→ gzip（`flate2`）→ 分帧 → 信封，由 [`pipeline::PipelineConfig`]
  按固定顺序装配；
- **分发**：[`handler::HandlerRegistry`] 在构建后冻结，按类型键查找类型擦除的处理器适配器。

## 风险与考量（Trade-offs）
- **断点续传**：不支持；中断的传输需要由应用层整体重试。
- **压缩**：gzip 包裹整条字节流，两端必须同时开启，无协商机制。
"#]

pub mod bootstrap;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod peer;
pub mod pipeline;
pub mod runtime;
pub mod shutdown;
pub mod socket;
pub mod transfer;
pub mod util;
pub mod wire;

pub use bootstrap::{ClientBootstrap, ClientBootstrapBuilder, ServerBootstrap, ServerBootstrapBuilder};
pub use channel::{Channel, ChannelSettings};
pub use config::TransportConfig;
pub use error::{
    ConfigError, ConnectionError, DispatchError, FramingError, StreamError, TransferError,
};
pub use handler::{HandlerRegistry, MessageError, PullHandler, PushHandler, WireMessage};
pub use peer::PeerInfo;
pub use pipeline::{Pipeline, PipelineConfig, StageKind, TlsStage};
pub use runtime::WorkerPool;
pub use shutdown::{Releasable, ShutdownCoordinator, ShutdownReport};
pub use socket::SocketOptions;
pub use transfer::{TransferIn, TransferOut};
pub use wire::{PayloadKind, WirePayload};
