use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

use super::{PullHandler, PushHandler, WireMessage};
use crate::{
    error::{ConfigError, DispatchError, StreamError},
    transfer::{TransferIn, TransferOut},
};

#[async_trait]
pub(crate) trait ErasedPullHandler: Send + Sync {
    async fn invoke(&self, body: Bytes, transfer: TransferOut) -> Result<(), StreamError>;
}

#[async_trait]
pub(crate) trait ErasedPushHandler: Send + Sync {
    async fn invoke(&self, body: Bytes, transfer: TransferIn) -> Result<(), StreamError>;
}

struct PullAdapter<H>(H);

#[async_trait]
impl<H: PullHandler> ErasedPullHandler for PullAdapter<H> {
    async fn invoke(&self, body: Bytes, mut transfer: TransferOut) -> Result<(), StreamError> {
        match <H::Request as WireMessage>::decode_body(body) {
            Ok(request) => self.0.handle_pull(request, transfer).await,
            Err(err) => {
                let error = DispatchError::MalformedMessage {
                    type_key: <H::Request as WireMessage>::TYPE_KEY.to_owned(),
                    reason: err.to_string(),
                };
                let _ = transfer.abort(error.to_string()).await;
                Err(error.into())
            }
        }
    }
}

struct PushAdapter<H>(H);

#[async_trait]
impl<H: PushHandler> ErasedPushHandler for PushAdapter<H> {
    async fn invoke(&self, body: Bytes, transfer: TransferIn) -> Result<(), StreamError> {
        match <H::Message as WireMessage>::decode_body(body) {
            Ok(message) => self.0.handle_push(message, transfer).await,
            Err(err) => {
                let error = DispatchError::MalformedMessage {
                    type_key: <H::Message as WireMessage>::TYPE_KEY.to_owned(),
                    reason: err.to_string(),
                };
                transfer.cancel(error.to_string()).await;
                Err(error.into())
            }
        }
    }
}

/// 类型键到处理器的映射，构建后不可变。
#[derive(Default)]
pub struct HandlerRegistry {
    pull: HashMap<String, Arc<dyn ErasedPullHandler>>,
    push: HashMap<String, Arc<dyn ErasedPushHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// 不含任何处理器的注册表，适用于只发起交换的客户端。
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn has_pull(&self, type_key: &str) -> bool {
        self.pull.contains_key(type_key)
    }

    pub fn has_push(&self, type_key: &str) -> bool {
        self.push.contains_key(type_key)
    }

    pub fn is_empty(&self) -> bool {
        self.pull.is_empty() && self.push.is_empty()
    }

    pub(crate) fn resolve_pull(
        &self,
        type_key: &str,
    ) -> Result<Arc<dyn ErasedPullHandler>, DispatchError> {
        self.pull
            .get(type_key)
            .cloned()
            .ok_or_else(|| DispatchError::NoPullHandler(type_key.to_owned()))
    }

    pub(crate) fn resolve_push(
        &self,
        type_key: &str,
    ) -> Result<Arc<dyn ErasedPushHandler>, DispatchError> {
        self.push
            .get(type_key)
            .cloned()
            .ok_or_else(|| DispatchError::NoPushHandler(type_key.to_owned()))
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pull: Vec<&str> = self.pull.keys().map(String::as_str).collect();
        let mut push: Vec<&str> = self.push.keys().map(String::as_str).collect();
        pull.sort_unstable();
        push.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("pull", &pull)
            .field("push", &push)
            .finish()
    }
}

/// 注册表构建器。同一类型键重复注册同类处理器属于配置错误。
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    registry: HandlerRegistry,
}

impl HandlerRegistryBuilder {
    pub fn pull<H: PullHandler>(mut self, handler: H) -> Result<Self, ConfigError> {
        let type_key = <H::Request as WireMessage>::TYPE_KEY;
        if self.registry.pull.contains_key(type_key) {
            return Err(ConfigError::DuplicateHandler {
                kind: "pull",
                type_key: type_key.to_owned(),
            });
        }
        self.registry
            .pull
            .insert(type_key.to_owned(), Arc::new(PullAdapter(handler)));
        Ok(self)
    }

    pub fn push<H: PushHandler>(mut self, handler: H) -> Result<Self, ConfigError> {
        let type_key = <H::Message as WireMessage>::TYPE_KEY;
        if self.registry.push.contains_key(type_key) {
            return Err(ConfigError::DuplicateHandler {
                kind: "push",
                type_key: type_key.to_owned(),
            });
        }
        self.registry
            .push
            .insert(type_key.to_owned(), Arc::new(PushAdapter(handler)));
        Ok(self)
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageError;

    struct Ping;

    impl WireMessage for Ping {
        const TYPE_KEY: &'static str = "test.Ping";

        fn encode_body(&self) -> Bytes {
            Bytes::new()
        }

        fn decode_body(_: Bytes) -> Result<Self, MessageError> {
            Ok(Ping)
        }
    }

    struct PingPull;

    #[async_trait]
    impl PullHandler for PingPull {
        type Request = Ping;

        async fn handle_pull(&self, _: Ping, mut transfer: TransferOut) -> Result<(), StreamError> {
            transfer.close().await?;
            Ok(())
        }
    }

    struct PingPush;

    #[async_trait]
    impl PushHandler for PingPush {
        type Message = Ping;

        async fn handle_push(&self, _: Ping, transfer: TransferIn) -> Result<(), StreamError> {
            transfer.read_to_end().await?;
            Ok(())
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = HandlerRegistry::builder()
            .pull(PingPull)
            .and_then(|builder| builder.pull(PingPull))
            .err()
            .expect("重复注册必须失败");
        assert!(matches!(
            err,
            ConfigError::DuplicateHandler { kind: "pull", ref type_key } if type_key == "test.Ping"
        ));
    }

    #[test]
    fn pull_and_push_tables_are_independent() {
        let registry = HandlerRegistry::builder()
            .pull(PingPull)
            .and_then(|builder| builder.push(PingPush))
            .expect("同一类型键可以同时拥有拉取与推送处理器")
            .build();
        assert!(registry.has_pull("test.Ping"));
        assert!(registry.has_push("test.Ping"));
        assert!(registry.resolve_pull("test.Ping").is_ok());
        assert_eq!(
            registry.resolve_pull("test.Missing").err(),
            Some(DispatchError::NoPullHandler("test.Missing".to_owned()))
        );
        assert_eq!(
            registry.resolve_push("test.Missing").err(),
            Some(DispatchError::NoPushHandler("test.Missing".to_owned()))
        );
        assert!(HandlerRegistry::empty().is_empty());
    }
}
