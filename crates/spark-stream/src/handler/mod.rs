//! 按消息类型分发的拉取 / 推送处理器。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 连接上流动的是带类型键的二进制消息；处理器按它所服务的消息类型注册，
//!   分发时只根据类型键查表，不依赖任何运行时反射。
//!
//! ## 逻辑 (How)
//! - [`WireMessage`] 把“类型键 + 编解码”绑定到具体消息类型；
//! - [`PullHandler`] 收到请求后通过 [`TransferOut`] 流式写回响应；
//! - [`PushHandler`] 收到推送消息后通过 [`TransferIn`] 读取推送内容；
//! - 注册表把两类处理器擦除为内部适配器，构建完成后以 `Arc` 冻结共享。
//!
//! ## 契约 (What)
//! - 处理器以任务形式运行在拥有该连接的 Bootstrap 工作池上，必须是非阻塞的；
//! - 找不到处理器或消息无法解码时，只有该交换失败，连接保持可用。

pub mod registry;

pub use registry::{HandlerRegistry, HandlerRegistryBuilder};

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    error::StreamError,
    transfer::{TransferIn, TransferOut},
};

/// 可在线上传输的应用消息。
pub trait WireMessage: Sized + Send + 'static {
    /// 全局唯一的类型键，分发即以此为索引。
    const TYPE_KEY: &'static str;

    fn encode_body(&self) -> Bytes;

    fn decode_body(body: Bytes) -> Result<Self, MessageError>;
}

/// 消息体无法解码。
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MessageError(String);

impl MessageError {
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// 拉取处理器：为一次请求流式写出响应。
///
/// 处理器拥有传入的 [`TransferOut`]，应在写完后调用 `close`；未关闭即返回会使该交换终止。
#[async_trait]
pub trait PullHandler: Send + Sync + 'static {
    type Request: WireMessage;

    async fn handle_pull(
        &self,
        request: Self::Request,
        transfer: TransferOut,
    ) -> Result<(), StreamError>;
}

/// 推送处理器：接收一条推送消息及其随后的数据流。
#[async_trait]
pub trait PushHandler: Send + Sync + 'static {
    type Message: WireMessage;

    async fn handle_push(
        &self,
        message: Self::Message,
        transfer: TransferIn,
    ) -> Result<(), StreamError>;
}
