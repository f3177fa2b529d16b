//! 错误分层：连接、分帧、分发、传输与配置五类错误各自独立，由 [`StreamError`] 聚合。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 不同层级的失败需要不同的处置：分帧错误必须拆除连接，分发错误只让单个交换失败，
//!   传输错误需要区分“一个字节都没送出”和“送出一部分后失败”；
//! - 每个错误都暴露稳定的 `code()`，日志与测试据此断言，而不是匹配易变的文案。
//!
//! ## 逻辑 (How)
//! - 底层 IO 失败通过 [`map_io_error`] 携带 [`OperationKind`]，错误码与默认文案集中定义；
//! - 其余错误使用 `thiserror` 派生，字段保留足以复现问题的上下文（声明长度、上限、已传字节数）。
//!
//! ## 契约 (What)
//! - 所有公开 API 返回 `Result<_, StreamError>` 或更窄的子错误；
//! - 错误码格式统一为 `spark.stream.<领域>.<原因>`。

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.stream.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.stream.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.stream.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "spark.stream.tcp.resolve_failed",
    message: "address resolution",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.stream.tcp.configure_failed",
    message: "socket option",
};
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.stream.tls.handshake_failed",
    message: "tls handshake",
};

const TIMEOUT_CODE: &str = "spark.stream.connection.timeout";

/// 将 IO 错误映射为带操作语义的连接错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ConnectionError {
    ConnectionError::Io {
        kind,
        source: error,
    }
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind, timeout: Duration) -> ConnectionError {
    ConnectionError::TimedOut { kind, timeout }
}

/// 连接级失败：该连接被关闭，其余连接不受影响。
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{}: {source}", .kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("{} timed out after {timeout:?}", .kind.message)]
    TimedOut {
        kind: OperationKind,
        timeout: Duration,
    },
    #[error("no socket address resolved for {peer}")]
    Unresolved { peer: String },
    #[error("channel {channel} is closed")]
    Closed { channel: u64 },
    #[error("worker pool `{pool}` is shut down")]
    PoolShutdown { pool: String },
}

impl ConnectionError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { kind, .. } => kind.code,
            Self::TimedOut { .. } => TIMEOUT_CODE,
            Self::Unresolved { .. } => "spark.stream.tcp.unresolved",
            Self::Closed { .. } => "spark.stream.connection.closed",
            Self::PoolShutdown { .. } => "spark.stream.runtime.pool_shutdown",
        }
    }
}

/// 分帧或编解码失败：连接必须拆除，不做恢复。
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("declared frame length {declared} exceeds the configured maximum {max}")]
    Oversized { declared: u64, max: usize },
    #[error("malformed varint32 length prefix")]
    MalformedLength,
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("malformed wire payload: {0}")]
    MalformedPayload(&'static str),
    #[error("gzip stage failed: {0}")]
    Compression(#[source] io::Error),
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl FramingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Oversized { .. } => "spark.stream.framing.oversized",
            Self::MalformedLength => "spark.stream.framing.malformed_length",
            Self::Truncated { .. } => "spark.stream.framing.truncated",
            Self::MalformedPayload(_) => "spark.stream.framing.malformed_payload",
            Self::Compression(_) => "spark.stream.framing.compression",
            Self::Io(_) => "spark.stream.framing.io",
        }
    }
}

/// 分发失败：只有当前交换失败，连接保持可用。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no pull handler registered for message type `{0}`")]
    NoPullHandler(String),
    #[error("no push handler registered for message type `{0}`")]
    NoPushHandler(String),
    #[error("message of type `{type_key}` could not be decoded: {reason}")]
    MalformedMessage { type_key: String, reason: String },
    #[error("exchange {0} is already active on this channel")]
    DuplicateExchange(u64),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoPullHandler(_) => "spark.stream.dispatch.no_pull_handler",
            Self::NoPushHandler(_) => "spark.stream.dispatch.no_push_handler",
            Self::MalformedMessage { .. } => "spark.stream.dispatch.malformed_message",
            Self::DuplicateExchange(_) => "spark.stream.dispatch.duplicate_exchange",
        }
    }
}

/// 流式传输失败。
///
/// 部分成功永远不算成功：`PartialTransfer` 只是告诉调用方失败前已经送出多少字节。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer failed before any byte was transferred: {reason}")]
    ImmediateFailure { reason: String },
    #[error("transfer failed after {transferred} bytes: {reason}")]
    PartialTransfer { transferred: u64, reason: String },
    #[error("transfer is already {state}")]
    AlreadyFinished { state: &'static str },
}

impl TransferError {
    /// 按已传输字节数在 `ImmediateFailure` 与 `PartialTransfer` 之间选择。
    pub fn failed(transferred: u64, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if transferred == 0 {
            Self::ImmediateFailure { reason }
        } else {
            Self::PartialTransfer {
                transferred,
                reason,
            }
        }
    }

    /// 失败前已经传输的字节数。
    pub fn transferred(&self) -> u64 {
        match self {
            Self::PartialTransfer { transferred, .. } => *transferred,
            _ => 0,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::ImmediateFailure { .. } => "spark.stream.transfer.immediate_failure",
            Self::PartialTransfer { .. } => "spark.stream.transfer.partial",
            Self::AlreadyFinished { .. } => "spark.stream.transfer.already_finished",
        }
    }
}

/// 启动期配置错误：在创建任何套接字之前返回。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown socket option `{0}`")]
    UnknownOption(String),
    #[error("socket option `{name}` rejects value {value}: {reason}")]
    InvalidOption {
        name: String,
        value: i64,
        reason: &'static str,
    },
    #[error("a {kind} handler for message type `{type_key}` is already registered")]
    DuplicateHandler {
        kind: &'static str,
        type_key: String,
    },
    #[error("the tls stage must be configured for the {expected} side")]
    TlsRoleMismatch { expected: &'static str },
    #[error("`{0}` is not a valid tls server name")]
    InvalidServerName(String),
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
    #[error("invalid peer address `{0}`, expected host:port")]
    InvalidPeer(String),
    #[error("no tokio runtime is available and no worker pool was supplied")]
    MissingRuntime,
    #[error("failed to build worker pool `{name}`: {source}")]
    WorkerPool {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("server bootstrap is already bound")]
    AlreadyBound,
    #[error("bootstrap has been released")]
    Released,
    #[error("shutdown already ran; resource `{0}` was not registered")]
    ShutdownCompleted(String),
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOption(_) => "spark.stream.config.unknown_option",
            Self::InvalidOption { .. } => "spark.stream.config.invalid_option",
            Self::DuplicateHandler { .. } => "spark.stream.config.duplicate_handler",
            Self::TlsRoleMismatch { .. } => "spark.stream.config.tls_role_mismatch",
            Self::InvalidServerName(_) => "spark.stream.config.invalid_server_name",
            Self::InvalidSetting { .. } => "spark.stream.config.invalid_setting",
            Self::InvalidPeer(_) => "spark.stream.config.invalid_peer",
            Self::MissingRuntime => "spark.stream.config.missing_runtime",
            Self::WorkerPool { .. } => "spark.stream.config.worker_pool",
            Self::AlreadyBound => "spark.stream.config.already_bound",
            Self::Released => "spark.stream.config.released",
            Self::ShutdownCompleted(_) => "spark.stream.config.shutdown_completed",
            Self::Read { .. } => "spark.stream.config.read_failed",
            Self::Parse(_) => "spark.stream.config.parse_failed",
        }
    }
}

/// crate 级聚合错误。
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// 协作方（例如文件内容源）的 IO 失败。
    #[error("content source failed: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(err) => err.code(),
            Self::Framing(err) => err.code(),
            Self::Dispatch(err) => err.code(),
            Self::Transfer(err) => err.code(),
            Self::Config(err) => err.code(),
            Self::Io(_) => "spark.stream.source.io",
        }
    }
}
