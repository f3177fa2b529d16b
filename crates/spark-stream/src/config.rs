//! TOML 配置文件：传输参数的声明式入口。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 套接字选项、分帧上限、分块大小等参数需要在不重新编译的情况下调整；
//! - 配置与 Builder 共用同一组校验，文件中的非法值与代码中的非法值得到相同的错误。
//!
//! ## 逻辑 (How)
//! - `serde` 反序列化为 [`TransportConfig`]，各节使用 `deny_unknown_fields`，拼写错误立即暴露；
//! - [`TransportConfig::validate`] 在任何套接字创建之前执行；
//! - Builder 通过 `apply_config` 接受整份配置，TLS 阶段仍由代码提供。
//!
//! ## 契约 (What)
//! - 缺省的节与字段取内置默认值，空文件等价于 [`TransportConfig::default`]。
//!
//! ```toml
//! [pipeline]
//! compress = true
//! max_frame_length = 1048576
//!
//! [socket]
//! send_buffer_size = 1048576
//!
//! [child]
//! tcp_nodelay = true
//!
//! [transfer]
//! chunk_size = 65536
//!
//! [client]
//! worker_threads = 2
//! ```

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    channel::ChannelSettings,
    codec::{compression::DEFAULT_COMPRESSION_LEVEL, frame::DEFAULT_MAX_FRAME_LENGTH},
    error::ConfigError,
    pipeline::{DEFAULT_HANDSHAKE_TIMEOUT, PipelineConfig},
    socket::SocketOptions,
};

/// 客户端默认工作线程数。
pub const DEFAULT_CLIENT_WORKER_THREADS: usize = 2;
/// 默认连接超时。
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub pipeline: PipelineSection,
    /// 服务端监听套接字或客户端连接套接字的选项。
    pub socket: SocketOptions,
    /// 服务端已接受连接的选项。
    pub child: SocketOptions,
    pub transfer: ChannelSettings,
    pub client: ClientSection,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub compress: bool,
    pub compression_level: u32,
    pub max_frame_length: usize,
    pub handshake_timeout_ms: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            compress: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub worker_threads: usize,
    pub connect_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_CLIENT_WORKER_THREADS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ClientSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl TransportConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = self.pipeline_config();
        pipeline.validate()?;
        self.transfer.validate(pipeline.max_frame_length())?;
        if self.client.worker_threads == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "client.worker_threads",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.client.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "client.connect_timeout_ms",
                reason: "must be greater than zero".to_owned(),
            });
        }
        Ok(())
    }

    /// 不含 TLS 的阶段配置。
    pub fn pipeline_config(&self) -> PipelineConfig {
        self.apply_pipeline(PipelineConfig::new())
    }

    /// 用本配置覆盖 `base` 的非 TLS 参数，保留其 TLS 阶段。
    pub fn apply_pipeline(&self, base: PipelineConfig) -> PipelineConfig {
        let section = &self.pipeline;
        let mut config = base
            .with_compression(section.compress)
            .with_max_frame_length(section.max_frame_length)
            .with_handshake_timeout(Duration::from_millis(section.handshake_timeout_ms));
        if section.compress {
            config = config.with_compression_level(section.compression_level);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TransportConfig::from_toml_str("").expect("空文件合法");
        assert_eq!(config, TransportConfig::default());
        assert!(!config.pipeline_config().is_compressed());
        assert_eq!(config.client.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn sections_map_onto_runtime_settings() {
        let config = TransportConfig::from_toml_str(
            r#"
            [pipeline]
            compress = true
            compression_level = 3
            max_frame_length = 262144

            [socket]
            send_buffer_size = 1048576

            [child]
            tcp_nodelay = true

            [transfer]
            chunk_size = 16384
            "#,
        )
        .expect("配置合法");

        let pipeline = config.pipeline_config();
        assert!(pipeline.is_compressed());
        assert_eq!(pipeline.compression_level(), Some(3));
        assert_eq!(pipeline.max_frame_length(), 262_144);
        assert_eq!(config.socket.send_buffer_size, Some(1_048_576));
        assert_eq!(config.child.tcp_nodelay, Some(true));
        assert_eq!(config.transfer.chunk_size, 16_384);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TransportConfig::from_toml_str("[pipeline]\ncompres = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn chunk_size_must_fit_frame_limit() {
        let err = TransportConfig::from_toml_str(
            "[pipeline]\nmax_frame_length = 4096\n[transfer]\nchunk_size = 65536\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                name: "chunk_size",
                ..
            }
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = TransportConfig::load("/nonexistent/spark-stream.toml").unwrap_err();
        assert_eq!(err.code(), "spark.stream.config.read_failed");
    }
}
