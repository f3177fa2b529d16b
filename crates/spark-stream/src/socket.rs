use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};

use crate::error::{self, ConfigError, ConnectionError, map_io_error};

/// 发送缓冲区大小（字节）。
pub const SEND_BUFFER_SIZE: &str = "sendBufferSize";
/// 接收缓冲区大小（字节）。
pub const RECEIVE_BUFFER_SIZE: &str = "receiveBufferSize";
/// 是否关闭 Nagle 算法，取值 0/1。
pub const TCP_NO_DELAY: &str = "tcpNoDelay";
/// 是否开启 TCP keepalive，取值 0/1。
pub const KEEP_ALIVE: &str = "keepAlive";
/// 服务端为已接受连接单独配置选项时使用的前缀。
pub const CHILD_PREFIX: &str = "child.";

/// 按名称设置的套接字选项集合。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 对外保持“名称 + 整数值”的配置面（例如 `sendBufferSize = 1048576`），方便从命令行
///   或配置文件逐项设置；对内转换为强类型字段，非法名称与越界值在启动期就被拒绝。
///
/// ## 逻辑 (How)
/// - 建连 / 监听前通过 `tokio::net::TcpSocket` 设置，已接受的连接通过
///   `socket2::SockRef` 设置，二者共享同一组字段；
/// - 未设置的字段保持操作系统默认值。
///
/// ## 契约 (What)
/// - 缓冲区大小必须在 `1..=u32::MAX` 之内；布尔选项只接受 0 或 1；
/// - 应用失败映射为 [`ConnectionError`]，错误码 `spark.stream.tcp.configure_failed`。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketOptions {
    pub send_buffer_size: Option<u32>,
    pub receive_buffer_size: Option<u32>,
    pub tcp_nodelay: Option<bool>,
    pub keepalive: Option<bool>,
}

impl SocketOptions {
    /// 以名称设置一个选项。
    pub fn set(&mut self, name: &str, value: i64) -> Result<(), ConfigError> {
        match name {
            SEND_BUFFER_SIZE => self.send_buffer_size = Some(buffer_size(name, value)?),
            RECEIVE_BUFFER_SIZE => self.receive_buffer_size = Some(buffer_size(name, value)?),
            TCP_NO_DELAY => self.tcp_nodelay = Some(flag(name, value)?),
            KEEP_ALIVE => self.keepalive = Some(flag(name, value)?),
            _ => return Err(ConfigError::UnknownOption(name.to_owned())),
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 在 `bind`/`connect` 之前作用于套接字。
    pub(crate) fn apply_to_socket(&self, socket: &TcpSocket) -> Result<(), ConnectionError> {
        let configure = |err| map_io_error(error::CONFIGURE, err);
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size).map_err(configure)?;
        }
        if let Some(size) = self.receive_buffer_size {
            socket.set_recv_buffer_size(size).map_err(configure)?;
        }
        if let Some(nodelay) = self.tcp_nodelay {
            socket.set_nodelay(nodelay).map_err(configure)?;
        }
        if let Some(keepalive) = self.keepalive {
            socket.set_keepalive(keepalive).map_err(configure)?;
        }
        Ok(())
    }

    /// 作用于已经建立的连接（服务端接受的子连接）。
    pub(crate) fn apply_to_stream(&self, stream: &TcpStream) -> Result<(), ConnectionError> {
        let configure = |err| map_io_error(error::CONFIGURE, err);
        let socket = SockRef::from(stream);
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size as usize).map_err(configure)?;
        }
        if let Some(size) = self.receive_buffer_size {
            socket.set_recv_buffer_size(size as usize).map_err(configure)?;
        }
        if let Some(keepalive) = self.keepalive {
            socket.set_keepalive(keepalive).map_err(configure)?;
        }
        if let Some(nodelay) = self.tcp_nodelay {
            stream.set_nodelay(nodelay).map_err(configure)?;
        }
        Ok(())
    }
}

fn buffer_size(name: &str, value: i64) -> Result<u32, ConfigError> {
    u32::try_from(value)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| ConfigError::InvalidOption {
            name: name.to_owned(),
            value,
            reason: "buffer size must be within 1..=4294967295",
        })
}

fn flag(name: &str, value: i64) -> Result<bool, ConfigError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ConfigError::InvalidOption {
            name: name.to_owned(),
            value,
            reason: "expected 0 or 1",
        }),
    }
}

/// 服务端的两组选项：监听套接字与已接受连接。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ServerSocketOptions {
    pub listener: SocketOptions,
    pub child: SocketOptions,
}

impl ServerSocketOptions {
    /// `child.` 前缀的名称作用于已接受连接，其余作用于监听套接字。
    pub(crate) fn set(&mut self, name: &str, value: i64) -> Result<(), ConfigError> {
        match name.strip_prefix(CHILD_PREFIX) {
            Some(child) => self.child.set(child, value).map_err(|err| match err {
                ConfigError::UnknownOption(_) => ConfigError::UnknownOption(name.to_owned()),
                other => other,
            }),
            None => self.listener.set(name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_options_map_to_fields() {
        let mut options = SocketOptions::default();
        assert!(options.is_empty());
        options.set(SEND_BUFFER_SIZE, 1_048_576).unwrap();
        options.set(RECEIVE_BUFFER_SIZE, 1_048_576).unwrap();
        options.set(TCP_NO_DELAY, 1).unwrap();
        assert_eq!(options.send_buffer_size, Some(1_048_576));
        assert_eq!(options.receive_buffer_size, Some(1_048_576));
        assert_eq!(options.tcp_nodelay, Some(true));
        assert_eq!(options.keepalive, None);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let mut options = SocketOptions::default();
        assert!(matches!(
            options.set(SEND_BUFFER_SIZE, -1),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(matches!(
            options.set(SEND_BUFFER_SIZE, i64::from(u32::MAX) + 1),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(matches!(options.set(KEEP_ALIVE, 2), Err(ConfigError::InvalidOption { .. })));
        assert!(matches!(options.set("soLinger", 5), Err(ConfigError::UnknownOption(name)) if name == "soLinger"));
    }

    #[test]
    fn child_prefix_targets_accepted_connections() {
        let mut options = ServerSocketOptions::default();
        options.set("child.sendBufferSize", 65_536).unwrap();
        options.set("receiveBufferSize", 131_072).unwrap();
        assert_eq!(options.child.send_buffer_size, Some(65_536));
        assert_eq!(options.listener.receive_buffer_size, Some(131_072));
        assert!(options.listener.send_buffer_size.is_none());
        assert!(matches!(
            options.set("child.bogus", 1),
            Err(ConfigError::UnknownOption(name)) if name == "child.bogus"
        ));
    }

    #[tokio::test]
    async fn options_apply_to_real_sockets() {
        let mut options = SocketOptions::default();
        options.set(RECEIVE_BUFFER_SIZE, 262_144).unwrap();
        options.set(KEEP_ALIVE, 1).unwrap();
        let socket = TcpSocket::new_v4().unwrap();
        options.apply_to_socket(&socket).unwrap();
        assert!(socket.keepalive().unwrap());
        assert!(socket.recv_buffer_size().unwrap() > 0);
    }
}
