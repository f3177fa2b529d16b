use std::{borrow::Cow, fmt, io, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{info, warn};

use crate::error::ConfigError;

/// 可在停机时释放的资源。
///
/// 实现方的 `release` 必须可重复调用；协调器保证自己只调用一次，但同一资源可能也被
/// 直接释放过。
#[async_trait]
pub trait Releasable: Send + Sync {
    /// 日志中使用的标识。
    fn label(&self) -> Cow<'static, str>;

    async fn release(&self);
}

/// 停机报告：按释放顺序列出资源标识。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub released: Vec<String>,
    /// 停机此前已经执行过，本次调用没有释放任何资源。
    pub already_completed: bool,
}

#[derive(Default)]
struct Registry {
    resources: Vec<Arc<dyn Releasable>>,
    drained: bool,
}

/// `ShutdownCoordinator` 按注册顺序释放 Bootstrap、连接与工作池等资源。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 进程退出时要确定地释放所有长寿资源：先停止接入，再关闭连接，最后回收线程池，
///   避免在途交换被孤立在已经消失的线程上；
/// - 信号可能重复到达，显式调用与信号处理也可能并发，停机必须幂等。
///
/// ## 逻辑 (How)
/// - 注册表在启动期只追加，停机时在锁内一次性取空并打上 `drained` 标记；
/// - 释放过程持有异步闸门，并发的第二次调用会等待第一次完成，然后返回空报告；
/// - 逐个 `await` 资源的 `release`，并以 `tracing` 记录每一步。
///
/// ## 契约 (What)
/// - 每个资源至多被释放一次，多次调用 [`Self::shutdown`] 不会失败；
/// - 停机后再注册资源返回 [`ConfigError::ShutdownCompleted`]。
///
/// ## 注意事项 (Trade-offs)
/// - 资源按顺序逐个释放，单个资源释放缓慢会推迟后续资源；当前资源数量有限，顺序
///   语义比并发更重要。
#[derive(Default)]
pub struct ShutdownCoordinator {
    registry: Mutex<Registry>,
    gate: AsyncMutex<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册资源，释放顺序与注册顺序一致。
    pub fn add_resource(&self, resource: Arc<dyn Releasable>) -> Result<(), ConfigError> {
        let mut registry = self.registry.lock();
        if registry.drained {
            return Err(ConfigError::ShutdownCompleted(
                resource.label().into_owned(),
            ));
        }
        registry.resources.push(resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registry.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().drained
    }

    /// 依注册顺序释放全部资源。
    pub async fn shutdown(&self) -> ShutdownReport {
        let _gate = self.gate.lock().await;
        let resources = {
            let mut registry = self.registry.lock();
            if registry.drained {
                return ShutdownReport {
                    released: Vec::new(),
                    already_completed: true,
                };
            }
            registry.drained = true;
            std::mem::take(&mut registry.resources)
        };

        info!(resources = resources.len(), "shutdown started");
        let mut released = Vec::with_capacity(resources.len());
        for resource in resources {
            let label = resource.label().into_owned();
            info!(resource = %label, "releasing resource");
            resource.release().await;
            released.push(label);
        }
        info!(released = released.len(), "shutdown completed");
        ShutdownReport {
            released,
            already_completed: false,
        }
    }

    /// 收到 Ctrl-C / SIGTERM 时触发停机。
    pub fn install_signal_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(signal) => {
                    info!(signal, "termination signal received");
                    coordinator.shutdown().await;
                }
                Err(err) => warn!(error = %err, "failed to listen for termination signals"),
            }
        })
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("ShutdownCoordinator")
            .field("resources", &registry.resources.len())
            .field("drained", &registry.drained)
            .finish()
    }
}

/// 等待进程终止信号，返回信号名称。
pub async fn wait_for_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counted {
        name: &'static str,
        releases: AtomicUsize,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Releasable for Counted {
        fn label(&self) -> Cow<'static, str> {
            Cow::Borrowed(self.name)
        }

        async fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(self.name);
        }
    }

    fn counted(name: &'static str, order: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Counted> {
        Arc::new(Counted {
            name,
            releases: AtomicUsize::new(0),
            order: Arc::clone(order),
        })
    }

    #[tokio::test]
    async fn releases_in_registration_order_exactly_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let server = counted("server", &order);
        let client = counted("client", &order);
        let coordinator = ShutdownCoordinator::new();
        coordinator.add_resource(server.clone()).unwrap();
        coordinator.add_resource(client.clone()).unwrap();

        let first = coordinator.shutdown().await;
        assert_eq!(first.released, vec!["server", "client"]);
        assert!(!first.already_completed);

        let second = coordinator.shutdown().await;
        assert!(second.released.is_empty());
        assert!(second.already_completed);

        assert_eq!(server.releases.load(Ordering::SeqCst), 1);
        assert_eq!(client.releases.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), vec!["server", "client"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_shutdowns_release_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let resource = counted("pool", &order);
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.add_resource(resource.clone()).unwrap();

        let racers: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.shutdown().await })
            })
            .collect();
        let mut released = 0;
        for racer in racers {
            released += racer.await.expect("停机任务不应崩溃").released.len();
        }
        assert_eq!(released, 1);
        assert_eq!(resource.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_after_shutdown_is_rejected() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown().await;
        let err = coordinator
            .add_resource(counted("late", &order))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ShutdownCompleted(label) if label == "late"));
        assert!(coordinator.is_shut_down());
    }
}
