//! 线上信封 [`WirePayload`] 及其编解码。
//!
//! 每个帧正好承载一个信封；信封以 protobuf 风格的字段列表编码：
//!
//! | 字段 | 线类型 | 含义 |
//! |---|---|---|
//! | 1 | varint | [`PayloadKind`] |
//! | 2 | varint | 交换编号 |
//! | 3 | varint | 发送方在交换中的 [`Role`] |
//! | 4 | length | 消息类型键（UTF-8） |
//! | 5 | length | 消息体 |
//!
//! 未知的 varint / length 字段会被跳过，其余线类型视为格式错误。
//!
//! 每个交换各自做流控：接收方以 `Credit` 信封授予数据块额度，发送方只在持有额度时
//! 写出 `Chunk`，因此单个交换积压不会阻塞同一连接上的其他交换。

mod message;
pub mod varint;

pub use message::{decode_payload, encode_payload, encoded_len};

use bytes::{Bytes, BytesMut};

use crate::error::FramingError;

/// 信封种类。`Pull`/`Push` 开启交换，其余三种推进或终止交换。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Pull,
    Push,
    Chunk,
    Close,
    Abort,
    /// 接收方授予发送方的额度（以数据块计），消息体为 varint 编码的块数。
    Credit,
}

impl PayloadKind {
    pub(crate) fn wire_value(self) -> u64 {
        match self {
            Self::Pull => 1,
            Self::Push => 2,
            Self::Chunk => 3,
            Self::Close => 4,
            Self::Abort => 5,
            Self::Credit => 6,
        }
    }

    pub(crate) fn from_wire(value: u64) -> Result<Self, FramingError> {
        match value {
            1 => Ok(Self::Pull),
            2 => Ok(Self::Push),
            3 => Ok(Self::Chunk),
            4 => Ok(Self::Close),
            5 => Ok(Self::Abort),
            6 => Ok(Self::Credit),
            _ => Err(FramingError::MalformedPayload("unknown payload kind")),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Chunk => "chunk",
            Self::Close => "close",
            Self::Abort => "abort",
            Self::Credit => "credit",
        }
    }
}

/// 发送方在交换中的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// 发出 `Pull`/`Push` 的一方。
    Initiator,
    /// 被调用的一方。
    Responder,
}

impl Role {
    pub fn opposite(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    pub(crate) fn wire_value(self) -> u64 {
        match self {
            Self::Initiator => 0,
            Self::Responder => 1,
        }
    }

    pub(crate) fn from_wire(value: u64) -> Result<Self, FramingError> {
        match value {
            0 => Ok(Self::Initiator),
            1 => Ok(Self::Responder),
            _ => Err(FramingError::MalformedPayload("unknown sender role")),
        }
    }
}

/// 关联元数据：交换编号 + 发送方角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Correlation {
    pub exchange: u64,
    pub role: Role,
}

impl Correlation {
    pub fn new(exchange: u64, role: Role) -> Self {
        Self { exchange, role }
    }
}

/// 一帧解码后的信封。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WirePayload {
    pub kind: PayloadKind,
    pub correlation: Option<Correlation>,
    pub type_key: String,
    pub body: Bytes,
}

impl WirePayload {
    pub fn new(kind: PayloadKind, correlation: Option<Correlation>) -> Self {
        Self {
            kind,
            correlation,
            type_key: String::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_type_key(mut self, type_key: impl Into<String>) -> Self {
        self.type_key = type_key.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub(crate) fn chunk(correlation: Correlation, body: Bytes) -> Self {
        Self::new(PayloadKind::Chunk, Some(correlation)).with_body(body)
    }

    pub(crate) fn close(correlation: Correlation) -> Self {
        Self::new(PayloadKind::Close, Some(correlation))
    }

    pub(crate) fn credit(correlation: Correlation, chunks: u64) -> Self {
        let mut body = BytesMut::with_capacity(varint::varint_len(chunks));
        varint::put_varint(chunks, &mut body);
        Self::new(PayloadKind::Credit, Some(correlation)).with_body(body.freeze())
    }

    /// `Credit` 信封携带的块数；消息体不是合法 varint 时返回 `None`。
    pub(crate) fn credit_chunks(&self) -> Option<u64> {
        match varint::decode_varint64(&self.body) {
            Ok((chunks, width)) if width == self.body.len() => Some(chunks),
            _ => None,
        }
    }

    pub(crate) fn abort(correlation: Correlation, reason: &str) -> Self {
        Self::new(PayloadKind::Abort, Some(correlation))
            .with_body(Bytes::copy_from_slice(reason.as_bytes()))
    }
}
