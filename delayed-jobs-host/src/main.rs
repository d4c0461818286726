//! delayed-jobs 主机进程
//! delayed-jobs host process
//!
//! - `host` 运行主机 supervisor，为每个任务启动 `worker` 子进程
//!   - runs the host supervisor, starting a `worker` child process per job
//! - `worker <job-id> [--force]` 执行单个任务，退出码反映结果
//!   - executes one job, the exit code reflects the outcome
//! - `consume` 从 broker 消费并在进程内执行
//!   - consumes from the broker and executes in-process

mod config;
mod shutdown;

use crate::config::{HostConfig, Mode};
use crate::shutdown::install_shutdown_handler;
use delayed_jobs::components::consumer::Consumer;
use delayed_jobs::components::supervisor::HostSupervisor;
use delayed_jobs::components::ComponentLifecycle;
use delayed_jobs::config::{ConsumerConfig, ManagerConfig, SupervisorConfig};
use delayed_jobs::manager::Manager;
use delayed_jobs::observer::TracingObserver;
use delayed_jobs::process::OsProcessSpawner;
use delayed_jobs::rdb::{RedisBroker, RedisBrokerConfig, RedisConnectionConfig, RedisDatastore};
use delayed_jobs::registry::WorkerRegistry;
use delayed_jobs::workers::register_builtin;
use delayed_jobs::WorkerExecutor;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(fmt::layer())
    .with(
      EnvFilter::from_default_env()
        .add_directive("delayed_jobs=info".parse()?)
        .add_directive("delayed_jobs_host=info".parse()?),
    )
    .init();

  let mode = Mode::parse(std::env::args().skip(1))?;
  let config = HostConfig::from_env()?;
  let host_name = hostname::get()
    .map(|name| name.to_string_lossy().to_string())
    .unwrap_or_else(|_| "localhost".to_string());

  let connection =
    RedisConnectionConfig::single(config.redis_url.as_str())?.with_prefix(config.prefix.as_str());
  let broker_config = match mode {
    // 固定的标识让重启后的消费者能取回上次未确认的消息
    Mode::Consume => {
      RedisBrokerConfig::default().consumer_tag(format!("{host_name}.{}", config.consumer_name))
    }
    _ => RedisBrokerConfig::default(),
  };
  let datastore = Arc::new(RedisDatastore::new(connection.clone()).await?);
  let broker = Arc::new(RedisBroker::new(connection, broker_config).await?);

  let mut registry = WorkerRegistry::new();
  register_builtin(&mut registry);

  let manager_config = ManagerConfig::new().broker_disabled(config.broker_disabled);
  manager_config.validate()?;
  let manager = Arc::new(
    Manager::new(datastore.clone(), broker, registry, manager_config)
      .with_observer(Arc::new(TracingObserver)),
  );

  match mode {
    Mode::Worker { job_id, force } => {
      let executor = WorkerExecutor::new(manager).with_host_name(host_name);
      let outcome = executor.run(job_id, force).await?;
      info!(job_id, exit_code = outcome.exit_code(), "worker finished");
      std::process::exit(outcome.exit_code());
    }
    Mode::Host => {
      let command = match config.worker_command {
        Some(command) => command,
        None => vec![
          std::env::current_exe()?.to_string_lossy().to_string(),
          "worker".to_string(),
        ],
      };
      let spawner = Arc::new(OsProcessSpawner::from_command(&command)?);

      let mut supervisor_config = SupervisorConfig::new()
        .worker_name(config.worker_name.as_str());
      if let Some(workers) = config.workers {
        supervisor_config = supervisor_config.worker_count(workers);
      }
      supervisor_config.validate()?;

      let supervisor = HostSupervisor::new(manager, datastore, spawner, supervisor_config);
      let cancel = supervisor.cancellation_token();
      let shutdown = install_shutdown_handler()?;
      tokio::spawn(async move {
        shutdown.cancelled().await;
        cancel.cancel();
      });

      info!(worker_id = %supervisor.worker_id(), "host supervisor starting");
      supervisor.run().await?;
    }
    Mode::Consume => {
      let mut consumer_config = ConsumerConfig::new().worker_name(config.consumer_name.as_str());
      if let Some(concurrency) = config.concurrency {
        consumer_config = consumer_config.concurrency(concurrency);
      }
      consumer_config.validate()?;

      let executor = Arc::new(WorkerExecutor::new(manager).with_host_name(host_name));
      let consumer = Arc::new(Consumer::new(executor, consumer_config));
      let shutdown = install_shutdown_handler()?;
      let mut handle = consumer.clone().start();

      tokio::select! {
        _ = shutdown.cancelled() => {
          consumer.stop().await;
          handle.await?;
        }
        finished = &mut handle => finished?,
      }
    }
  }

  Ok(())
}
