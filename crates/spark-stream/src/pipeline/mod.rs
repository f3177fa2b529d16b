//! 管道装配：把 TLS、压缩、分帧、信封四个阶段按固定顺序套在一条连接上。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 同一个 Bootstrap 产出的每条连接都必须使用完全相同的阶段链，否则两端会对字节流
//!   产生不同解读；因此配置在构建期冻结，并以 `Arc` 在连接之间只读共享。
//!
//! ## 逻辑 (How)
//! - 顺序（由外到内）：`Tls?` → `Compression?` → `FrameCodec` → `MessageCodec`；
//! - TLS 由 [`TlsStage`] 在字节流层面完成握手，其余三个阶段合并进
//!   [`InboundCodec`] / [`OutboundCodec`]；
//! - 装配完成后按读写方向拆分，交给连接驱动的读任务与写任务。
//!
//! ## 契约 (What)
//! - [`PipelineConfig::stages`] 报告实际生效的阶段顺序；
//! - [`PipelineConfig::frame`] 可以在任意 `AsyncRead + AsyncWrite` 上装配非 TLS 阶段，
//!   测试用内存管道即依赖于此。

mod tls;

pub use tls::TlsStage;

use std::{fmt, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    net::TcpStream,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    codec::{
        InboundCodec, OutboundCodec, compression::DEFAULT_COMPRESSION_LEVEL,
        frame::DEFAULT_MAX_FRAME_LENGTH,
    },
    error::{ConfigError, ConnectionError, FramingError},
    wire::WirePayload,
};

/// 默认 TLS 握手超时。
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 允许配置的最小帧上限；再小就装不下控制帧。
pub const MIN_FRAME_LENGTH: usize = 1024;

pub(crate) trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub(crate) type BoxedStream = Box<dyn ByteStream>;

pub(crate) type PipelineReader = FramedRead<ReadHalf<BoxedStream>, InboundCodec>;
pub(crate) type PipelineWriter = FramedWrite<WriteHalf<BoxedStream>, OutboundCodec>;

/// 阶段标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Tls,
    Compression,
    FrameCodec,
    MessageCodec,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Tls => "tls",
            Self::Compression => "gzip",
            Self::FrameCodec => "varint32-frame",
            Self::MessageCodec => "wire-payload",
        }
    }
}

/// 管道配置，构建后不可变。
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    tls: Option<TlsStage>,
    compression_level: Option<u32>,
    max_frame_length: usize,
    handshake_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tls: None,
            compression_level: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(mut self, tls: TlsStage) -> Self {
        self.tls = Some(tls);
        self
    }

    /// 开启或关闭 gzip 阶段，开启时使用默认压缩级别。
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_level = enabled.then_some(DEFAULT_COMPRESSION_LEVEL);
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn tls(&self) -> Option<&TlsStage> {
        self.tls.as_ref()
    }

    pub fn is_compressed(&self) -> bool {
        self.compression_level.is_some()
    }

    pub fn compression_level(&self) -> Option<u32> {
        self.compression_level
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// 由外到内的阶段顺序。
    pub fn stages(&self) -> Vec<StageKind> {
        let mut stages = Vec::with_capacity(4);
        if self.tls.is_some() {
            stages.push(StageKind::Tls);
        }
        if self.is_compressed() {
            stages.push(StageKind::Compression);
        }
        stages.push(StageKind::FrameCodec);
        stages.push(StageKind::MessageCodec);
        stages
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_length < MIN_FRAME_LENGTH || self.max_frame_length > u32::MAX as usize {
            return Err(ConfigError::InvalidSetting {
                name: "max_frame_length",
                reason: format!(
                    "{} is outside {MIN_FRAME_LENGTH}..={}",
                    self.max_frame_length,
                    u32::MAX
                ),
            });
        }
        if let Some(level) = self.compression_level
            && level > 9
        {
            return Err(ConfigError::InvalidSetting {
                name: "compression_level",
                reason: format!("{level} is outside 0..=9"),
            });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "handshake_timeout",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// 新建一对编解码器，每条连接各自持有。
    pub fn codecs(&self) -> (InboundCodec, OutboundCodec) {
        (
            InboundCodec::new(self.is_compressed(), self.max_frame_length),
            OutboundCodec::new(self.compression_level, self.max_frame_length),
        )
    }

    /// 在任意双向字节流上装配压缩、分帧与信封阶段（不含 TLS）。
    pub fn frame<S>(&self, stream: S) -> Pipeline
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut stages = self.stages();
        stages.retain(|stage| *stage != StageKind::Tls);
        self.frame_boxed(Box::new(stream), stages)
    }

    fn frame_boxed(&self, stream: BoxedStream, stages: Vec<StageKind>) -> Pipeline {
        let (read, write) = tokio::io::split(stream);
        let (inbound, outbound) = self.codecs();
        Pipeline {
            reader: FramedRead::new(read, inbound),
            writer: FramedWrite::new(write, outbound),
            stages,
        }
    }

    /// 在 TCP 连接上装配完整阶段链；配置了 TLS 时先完成握手。
    pub(crate) async fn assemble(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Pipeline, ConnectionError> {
        let stream: BoxedStream = match &self.tls {
            Some(tls) => tls.handshake(stream, peer, self.handshake_timeout).await?,
            None => Box::new(stream),
        };
        Ok(self.frame_boxed(stream, self.stages()))
    }
}

/// 一条连接上装配好的阶段链。
pub struct Pipeline {
    reader: PipelineReader,
    writer: PipelineWriter,
    stages: Vec<StageKind>,
}

impl Pipeline {
    pub fn stages(&self) -> &[StageKind] {
        &self.stages
    }

    /// 编码并刷新一个信封。
    pub async fn send(&mut self, payload: WirePayload) -> Result<(), FramingError> {
        self.writer.send(payload).await
    }

    /// 读取下一个完整信封；对端关闭时返回 `None`。
    pub async fn recv(&mut self) -> Option<Result<WirePayload, FramingError>> {
        self.reader.next().await
    }

    pub(crate) fn into_parts(self) -> (PipelineReader, PipelineWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}
