//! 示例协议：按文件名拉取文件（`Get`），以及带跳数的推送流水线（`Post`）。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 演示同一服务端同时注册拉取与推送处理器，并在推送处理器中经独立的客户端
//!   Bootstrap 把文件继续推给下一跳；
//! - 消息体使用 `serde_json`，类型键沿用 `<包名>.<消息名>` 的命名方式。
//!
//! ## 契约 (What)
//! - `Get` 的响应是文件原始字节；文件不存在时交换以终止结束；
//! - `Post` 把推送内容写入 `filename`，`hops > 0` 时以 `hops - 1` 继续转发。

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use spark_stream::{
    ClientBootstrap, HandlerRegistry, MessageError, PullHandler, PushHandler, StreamError,
    TransferIn, TransferOut, WireMessage,
    error::ConfigError,
    util::{receive_file, send_file},
};
use tracing::info;

/// 服务端与客户端共用的套接字缓冲区大小。
pub const SOCKET_BUFFER_SIZE: i64 = 1024 * 1024;

/// 拉取一个文件。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    pub filename: String,
}

/// 推送一个文件，并要求接收方继续转发 `hops` 次。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub filename: String,
    pub hops: u32,
}

fn encode_json<T: Serialize>(value: &T) -> Bytes {
    serde_json::to_vec(value).map(Bytes::from).unwrap_or_default()
}

fn decode_json<T: DeserializeOwned>(body: Bytes) -> Result<T, MessageError> {
    serde_json::from_slice(&body).map_err(MessageError::new)
}

impl WireMessage for Get {
    const TYPE_KEY: &'static str = "pipeline.Get";

    fn encode_body(&self) -> Bytes {
        encode_json(self)
    }

    fn decode_body(body: Bytes) -> Result<Self, MessageError> {
        decode_json(body)
    }
}

impl WireMessage for Post {
    const TYPE_KEY: &'static str = "pipeline.Post";

    fn encode_body(&self) -> Bytes {
        encode_json(self)
    }

    fn decode_body(body: Bytes) -> Result<Self, MessageError> {
        decode_json(body)
    }
}

/// 以请求中的文件名作为内容源，发送成功后删除源文件。
pub struct FilePullHandler {
    pub delete_after_send: bool,
}

#[async_trait]
impl PullHandler for FilePullHandler {
    type Request = Get;

    async fn handle_pull(&self, request: Get, mut transfer: TransferOut) -> Result<(), StreamError> {
        info!(filename = %request.filename, "pull");
        let sent = send_file(&request.filename, &mut transfer, self.delete_after_send).await?;
        info!(filename = %request.filename, bytes = sent, "sent");
        Ok(())
    }
}

/// 接收推送的文件，需要时经 `next_hop` 继续转发。
pub struct PipelinePushHandler {
    next_hop: ClientBootstrap,
}

impl PipelinePushHandler {
    pub fn new(next_hop: ClientBootstrap) -> Self {
        Self { next_hop }
    }
}

#[async_trait]
impl PushHandler for PipelinePushHandler {
    type Message = Post;

    async fn handle_push(&self, message: Post, transfer: TransferIn) -> Result<(), StreamError> {
        let target = PathBuf::from(&message.filename);
        let received = receive_file(transfer, &target).await?;
        info!(filename = %message.filename, bytes = received, hops = message.hops, "received");
        if message.hops == 0 {
            return Ok(());
        }

        let forward = Post {
            filename: format!("{}.hop{}", message.filename, message.hops),
            hops: message.hops - 1,
        };
        let channel = self.next_hop.connect().await?;
        let mut sink = channel.push(&forward).await?;
        let sent = send_file(&target, &mut sink, false).await?;
        channel.close();
        info!(
            filename = %forward.filename,
            bytes = sent,
            peer = %self.next_hop.peer(),
            "forwarded"
        );
        Ok(())
    }
}

/// 示例服务端注册的全部处理器。
pub fn registry(next_hop: ClientBootstrap) -> Result<Arc<HandlerRegistry>, ConfigError> {
    Ok(HandlerRegistry::builder()
        .pull(FilePullHandler {
            delete_after_send: true,
        })?
        .push(PipelinePushHandler::new(next_hop))?
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_use_json_bodies() {
        let post = Post {
            filename: "data.bin".to_owned(),
            hops: 2,
        };
        let body = post.encode_body();
        assert_eq!(&body[..], br#"{"filename":"data.bin","hops":2}"#);
        assert_eq!(Post::decode_body(body).unwrap(), post);
        assert!(Get::decode_body(Bytes::from_static(b"not json")).is_err());
    }
}
