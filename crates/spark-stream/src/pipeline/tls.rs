use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::BoxedStream;
use crate::error::{self, ConfigError, ConnectionError, map_io_error, timeout_error};

/// 管道最外层的 TLS 阶段。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端与客户端的握手方向不同：服务端持有证书链，客户端持有信任根与目标主机名；
///   用一个枚举表达两种角色，Bootstrap 在构建时校验角色是否匹配。
///
/// ## 逻辑 (How)
/// - 服务端使用 `tokio_rustls::TlsAcceptor`，客户端使用 `TlsConnector`，二者都由
///   `Arc<rustls::*Config>` 构造，克隆成本只是一次引用计数；
/// - 握手受 `timeout` 约束，超时与失败分别映射为 [`ConnectionError::TimedOut`] 与
///   [`ConnectionError::Io`]。
///
/// ## 注意事项 (Trade-offs)
/// - 证书热更新不在此处处理；需要时由调用方重建 Bootstrap。
#[derive(Clone)]
pub enum TlsStage {
    Server(TlsAcceptor),
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl TlsStage {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Self {
        Self::Server(TlsAcceptor::from(config))
    }

    pub fn client(config: Arc<rustls::ClientConfig>, server_name: &str) -> Result<Self, ConfigError> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| ConfigError::InvalidServerName(server_name.to_owned()))?
            .to_owned();
        Ok(Self::Client {
            connector: TlsConnector::from(config),
            server_name: name,
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server(_))
    }

    pub(crate) async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<BoxedStream, ConnectionError> {
        let handshake = async {
            match self {
                Self::Server(acceptor) => acceptor
                    .accept(stream)
                    .await
                    .map(|tls| Box::new(tls) as BoxedStream),
                Self::Client {
                    connector,
                    server_name,
                } => connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map(|tls| Box::new(tls) as BoxedStream),
            }
        };
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(stream)) => {
                tracing::debug!(%peer, "tls handshake completed");
                Ok(stream)
            }
            Ok(Err(err)) => Err(map_io_error(error::HANDSHAKE, err)),
            Err(_) => Err(timeout_error(error::HANDSHAKE, timeout)),
        }
    }
}

impl fmt::Debug for TlsStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(_) => f.write_str("TlsStage::Server"),
            Self::Client { server_name, .. } => f
                .debug_struct("TlsStage::Client")
                .field("server_name", server_name)
                .finish(),
        }
    }
}
