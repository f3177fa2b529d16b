use std::{borrow::Cow, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

use crate::{
    error::{ConfigError, ConnectionError},
    shutdown::Releasable,
};

/// 有界工作线程池，即连接任务与处理器任务所在的执行上下文。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 服务端处理器在服务请求的同时，可能需要经客户端 Bootstrap 向第三方推送数据；
///   若回推与接入侧共用同一组线程，一旦接入侧被占满，回推就会排在自己后面形成死锁。
///   让每个 Bootstrap 持有独立的工作池，可以从结构上排除这种重入。
///
/// ## 逻辑 (How)
/// - [`WorkerPool::dedicated`] 创建专属的多线程 Tokio 运行时；
/// - [`WorkerPool::current`] 复用调用方所在运行时，不拥有其生命周期；
/// - 专属运行时在 [`WorkerPool::shutdown`] 或最后一个句柄释放时以
///   `shutdown_background` 关闭，因此在异步上下文中释放也是安全的。
///
/// ## 契约 (What)
/// - 在池内创建的套接字注册到该池的 IO 驱动；连接建立因此总在池内执行；
/// - 池内任务被取消时，[`WorkerPool::run`] 映射为 [`ConnectionError::PoolShutdown`]；
///   关闭之后不应再向池提交任务，Bootstrap 以自身的释放标志保证这一点。
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerPoolInner>,
}

struct WorkerPoolInner {
    name: String,
    handle: Handle,
    owned: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    /// 创建拥有 `worker_threads` 个线程的专属运行时。
    pub fn dedicated(name: impl Into<String>, worker_threads: usize) -> Result<Self, ConfigError> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(name.clone())
            .enable_all()
            .build()
            .map_err(|source| ConfigError::WorkerPool {
                name: name.clone(),
                source,
            })?;
        let handle = runtime.handle().clone();
        Ok(Self {
            inner: Arc::new(WorkerPoolInner {
                name,
                handle,
                owned: Mutex::new(Some(runtime)),
            }),
        })
    }

    /// 复用当前所在的 Tokio 运行时。
    pub fn current(name: impl Into<String>) -> Result<Self, ConfigError> {
        let handle = Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?;
        Ok(Self::from_handle(name, handle))
    }

    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(WorkerPoolInner {
                name: name.into(),
                handle,
                owned: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub fn is_dedicated(&self) -> bool {
        self.inner.owned.lock().is_some()
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// 在池内运行 `future` 并等待结果。
    pub(crate) async fn run<F, T>(&self, future: F) -> Result<T, ConnectionError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(future)
            .await
            .map_err(|_| ConnectionError::PoolShutdown {
                pool: self.inner.name.clone(),
            })
    }

    /// 关闭专属运行时；复用的运行时不受影响。重复调用无副作用。
    pub fn shutdown(&self) {
        let runtime = self.inner.owned.lock().take();
        if let Some(runtime) = runtime {
            tracing::debug!(pool = %self.inner.name, "shutting down worker pool");
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPoolInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("dedicated", &self.is_dedicated())
            .finish()
    }
}

#[async_trait]
impl Releasable for WorkerPool {
    fn label(&self) -> Cow<'static, str> {
        Cow::Owned(format!("worker-pool {}", self.inner.name))
    }

    async fn release(&self) {
        self.shutdown();
    }
}
