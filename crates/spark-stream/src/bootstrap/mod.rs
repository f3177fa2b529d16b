//! 服务端与客户端 Bootstrap：建立连接并把它们交给管道与分发层。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 监听与建连两侧共享同一套装配流程：设置套接字选项、装配管道、启动连接驱动、
//!   纳入连接集合。差异只在于 TCP 连接从哪里来；
//! - Builder 在 `build` 时被消费，选项、管道与注册表此后不可变。
//!
//! ## 逻辑 (How)
//! - [`ServerBootstrap`] 在工作池上运行接入循环，每个接入连接的 TLS 握手与管道装配
//!   在独立任务中完成，不阻塞后续接入；
//! - [`ClientBootstrap`] 默认持有专属工作池，建连总在该池内执行，服务端处理器经它
//!   回推数据时不会占用接入侧线程；
//! - 两侧都通过内部的 `ConnectionFactory` 把 TCP 流变成 [`Channel`]。
//!
//! ## 契约 (What)
//! - 配置错误在创建任何套接字之前返回；
//! - `release` 幂等：停止接入，关闭名下全部连接，关闭自有工作池。

mod client;
mod server;

pub use client::{ClientBootstrap, ClientBootstrapBuilder};
pub use server::{ServerBootstrap, ServerBootstrapBuilder};

use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpStream, runtime::Handle};

use crate::{
    channel::{
        Channel, ChannelGroup, ChannelSettings,
        driver::{self, ChannelContext},
    },
    error::{ConfigError, ConnectionError, OperationKind, map_io_error},
    handler::HandlerRegistry,
    pipeline::PipelineConfig,
};

/// 把已建立的 TCP 流装配为连接。
pub(crate) struct ConnectionFactory {
    pub(crate) pipeline: Arc<PipelineConfig>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) settings: ChannelSettings,
    pub(crate) handle: Handle,
    pub(crate) channels: ChannelGroup,
}

impl ConnectionFactory {
    pub(crate) async fn open(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        kind: OperationKind,
    ) -> Result<Channel, ConnectionError> {
        let local_addr = stream.local_addr().map_err(|err| map_io_error(kind, err))?;
        let pipeline = self.pipeline.assemble(stream, peer_addr).await?;
        let channel = driver::start(
            pipeline,
            ChannelContext {
                registry: Arc::clone(&self.registry),
                handle: self.handle.clone(),
                settings: self.settings,
                peer_addr,
                local_addr,
            },
        );
        self.channels.track(&channel);
        Ok(channel)
    }
}

/// 构建期共用校验：管道参数、TLS 角色与分块设置。
fn validate_pipeline(
    pipeline: &PipelineConfig,
    settings: &ChannelSettings,
    server_side: bool,
) -> Result<(), ConfigError> {
    pipeline.validate()?;
    if let Some(tls) = pipeline.tls()
        && tls.is_server() != server_side
    {
        return Err(ConfigError::TlsRoleMismatch {
            expected: if server_side { "server" } else { "client" },
        });
    }
    settings.validate(pipeline.max_frame_length())
}
