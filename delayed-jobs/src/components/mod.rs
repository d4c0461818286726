//! 后台组件
//! Background components
//!
//! 提供组件生命周期 trait 以及两种执行方式：
//! 轮询数据库并启动 worker 进程的 [`HostSupervisor`](supervisor::HostSupervisor)，
//! 以及由 broker 推动、在进程内执行的 [`Consumer`](consumer::Consumer)
//! Provides the component lifecycle trait and the two execution paths:
//! [`HostSupervisor`](supervisor::HostSupervisor) polls the datastore and starts worker processes,
//! [`Consumer`](consumer::Consumer) is driven by the broker and executes in-process

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod consumer;
pub mod supervisor;

/// 组件生命周期管理接口
/// Component lifecycle interface
///
/// # 实现者 / Implementors
///
/// - [`Consumer`](consumer::Consumer) - 消费 broker 消息并执行任务
///
/// # 注意 / Note
///
/// [`HostSupervisor`](supervisor::HostSupervisor) 没有实现此 trait：
/// 它拥有自己的运行表，`run()` 消费 `self` 并通过 `CancellationToken` 停止
/// [`HostSupervisor`](supervisor::HostSupervisor) does not implement this trait:
/// it owns its running table, `run()` consumes `self` and stops through a `CancellationToken`
///
/// # 示例 / Example
///
/// ```rust,no_run
/// use delayed_jobs::components::ComponentLifecycle;
/// use delayed_jobs::components::consumer::Consumer;
/// use delayed_jobs::config::{ConsumerConfig, ManagerConfig};
/// use delayed_jobs::executor::WorkerExecutor;
/// use delayed_jobs::manager::Manager;
/// use delayed_jobs::memdb::{MemoryBroker, MemoryDatastore};
/// use delayed_jobs::registry::WorkerRegistry;
/// use std::sync::Arc;
///
/// # async fn example() {
/// let manager = Arc::new(Manager::new(
///   Arc::new(MemoryDatastore::new()),
///   Arc::new(MemoryBroker::new()),
///   WorkerRegistry::new(),
///   ManagerConfig::default(),
/// ));
/// let executor = Arc::new(WorkerExecutor::new(manager));
/// let consumer = Arc::new(Consumer::new(executor, ConsumerConfig::default()));
///
/// let handle = consumer.clone().start();
/// assert!(!consumer.is_done());
///
/// consumer.shutdown();
/// assert!(consumer.is_done());
/// handle.await.ok();
/// # }
/// ```
pub trait ComponentLifecycle {
  /// 在后台任务中运行组件，任务在组件停止后结束
  /// Run the component on a background task that ends once the component stops
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 请求停止，进行中的工作先完成
  /// Ask the component to stop, work in progress finishes first
  fn shutdown(&self);

  fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
  use super::consumer::Consumer;
  use super::*;
  use crate::config::{ConsumerConfig, ManagerConfig};
  use crate::executor::WorkerExecutor;
  use crate::manager::Manager;
  use crate::memdb::{MemoryBroker, MemoryDatastore};
  use crate::registry::WorkerRegistry;
  use std::time::Duration;

  #[tokio::test]
  async fn test_shutdown_ends_every_consume_loop() {
    let broker = MemoryBroker::new().with_poll_interval(Duration::from_millis(10));
    let manager = Arc::new(Manager::new(
      Arc::new(MemoryDatastore::new()),
      Arc::new(broker),
      WorkerRegistry::new(),
      ManagerConfig::default(),
    ));
    let executor = Arc::new(WorkerExecutor::new(manager).with_host_name("lifecycle"));
    let consumer = Arc::new(Consumer::new(executor, ConsumerConfig::new().concurrency(3)));

    let handle = consumer.clone().start();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!consumer.is_done());

    consumer.shutdown();
    assert!(consumer.is_done());
    tokio::time::timeout(Duration::from_secs(5), handle)
      .await
      .unwrap()
      .unwrap();
  }
}
