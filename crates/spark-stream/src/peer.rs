use std::{fmt, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{self, ConfigError, ConnectionError, map_io_error};

/// 对端端点标识：主机名加端口，创建后不可变。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端绑定地址与客户端目标地址都以“主机名 + 端口”描述，解析延后到真正建连时，
///   这样配置阶段不需要 DNS。
///
/// ## 契约 (What)
/// - `Display` 输出 `host:port`，`FromStr` 接受同样的格式；IPv6 字面量需写成 `[::1]:port`；
/// - [`PeerInfo::resolve`] 返回解析得到的全部地址，顺序与解析器一致，为空时报告
///   [`ConnectionError::Unresolved`]。
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    host: String,
    port: u16,
}

impl PeerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 异步解析为套接字地址列表。
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>, ConnectionError> {
        let host = self
            .host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), self.port))
            .await
            .map_err(|err| map_io_error(error::RESOLVE, err))?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectionError::Unresolved {
                peer: self.to_string(),
            });
        }
        Ok(addrs)
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerInfo {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = value
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidPeer(value.to_owned()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidPeer(value.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPeer(value.to_owned()))?;
        Ok(Self::new(host, port))
    }
}

impl From<SocketAddr> for PeerInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
