//! Broker 消费者
//! Broker consumer
//!
//! 由 broker 推动的执行方式：消费消息、认领任务并在进程内运行 worker 执行器。
//! 并行度由同时运行的消费循环数决定。
//! Broker-driven execution: consumes messages, claims the job and runs the worker executor
//! in-process. Parallelism is the number of consume loops running side by side.

use crate::base::constants::CRASHED_MESSAGE;
use crate::base::{
  Acknowledgement, BoxFuture, Delivery, HeartbeatHandler, MessageBroker, MessageHandler,
};
use crate::components::ComponentLifecycle;
use crate::config::ConsumerConfig;
use crate::error::{Error, Result};
use crate::executor::{ExecutionOutcome, WorkerExecutor};
use crate::job::JobStatus;
use crate::process::pid_is_alive;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// 消费者统计
/// Consumer statistics
#[derive(Debug)]
pub struct ConsumerStats {
  pub handled: AtomicU64,
  pub dropped: AtomicU64,
  pub requeued: AtomicU64,
  pub in_flight: AtomicUsize,
  last_activity: Mutex<Instant>,
}

impl Default for ConsumerStats {
  fn default() -> Self {
    Self {
      handled: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
      requeued: AtomicU64::new(0),
      in_flight: AtomicUsize::new(0),
      last_activity: Mutex::new(Instant::now()),
    }
  }
}

impl ConsumerStats {
  fn touch(&self) {
    if let Ok(mut at) = self.last_activity.lock() {
      *at = Instant::now();
    }
  }

  /// 距上次处理消息的时间
  /// Time since the last message was handled
  pub fn idle_for(&self) -> Duration {
    self
      .last_activity
      .lock()
      .map(|at| at.elapsed())
      .unwrap_or_default()
  }
}

/// Broker 消费者
/// Broker consumer
pub struct Consumer {
  broker: Arc<dyn MessageBroker>,
  executor: Arc<WorkerExecutor>,
  config: ConsumerConfig,
  worker_id: String,
  pulse_time: Duration,
  started: Instant,
  stats: Arc<ConsumerStats>,
  done: Arc<AtomicBool>,
}

impl Consumer {
  pub fn new(executor: Arc<WorkerExecutor>, config: ConsumerConfig) -> Self {
    let manager = executor.manager();
    let broker = Arc::clone(manager.broker());
    let pulse_time = manager.config().pulse_time;
    let worker_id = format!(
      "{}.{}",
      executor.host_name().unwrap_or("localhost"),
      config.worker_name
    );
    Self {
      broker,
      executor,
      config,
      worker_id,
      pulse_time,
      started: Instant::now(),
      stats: Arc::new(ConsumerStats::default()),
      done: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  pub fn stats(&self) -> &ConsumerStats {
    &self.stats
  }

  /// 处理一次投递并给出确认决定
  /// Handle one delivery and decide how to settle it
  pub async fn handle(&self, delivery: Delivery) -> Acknowledgement {
    self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
    let decision = self.handle_inner(&delivery).await;
    self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    self.stats.touch();
    match decision {
      Acknowledgement::Ack => self.stats.handled.fetch_add(1, Ordering::Relaxed),
      Acknowledgement::Requeue => self.stats.requeued.fetch_add(1, Ordering::Relaxed),
      Acknowledgement::Reject => self.stats.dropped.fetch_add(1, Ordering::Relaxed),
    };
    decision
  }

  async fn handle_inner(&self, delivery: &Delivery) -> Acknowledgement {
    let id = delivery.message.id;
    let datastore = self.executor.manager().datastore();

    match datastore.claim_job(id, &self.worker_id).await {
      Ok(Some(_)) => {}
      Ok(None) => {
        tracing::debug!(job_id = id, "job is not claimable, dropping message");
        return Acknowledgement::Ack;
      }
      Err(e) => {
        tracing::warn!(job_id = id, error = %e, "could not claim job");
        return settle_error(&e);
      }
    }

    tokio::time::sleep(self.config.claim_grace).await;

    let job = match datastore.fetch_job(id).await {
      Ok(job) => job,
      Err(e) => {
        tracing::warn!(job_id = id, error = %e, "could not verify claim");
        return settle_error(&e);
      }
    };
    if job.status != JobStatus::Busy || job.locked_by.as_deref() != Some(self.worker_id.as_str()) {
      tracing::debug!(job_id = id, "claim lost during grace period");
      return Acknowledgement::Ack;
    }

    match self.executor.run_job(job, false).await {
      Ok(ExecutionOutcome::NotFound(_)) => Acknowledgement::Reject,
      Ok(_) => Acknowledgement::Ack,
      Err(e) => {
        tracing::error!(job_id = id, error = %e, "could not record job outcome, requeueing");
        Acknowledgement::Requeue
      }
    }
  }

  /// 释放上次运行遗留在本池名下的 BUSY 任务，返回释放的数量
  /// Release BUSY jobs a previous run left under this pool, returns how many were released
  pub async fn recover_abandoned(&self) -> Result<usize> {
    let manager = self.executor.manager();
    let own_pid = std::process::id();
    let mut released = 0;
    for mut job in manager.datastore().running_by_host(&self.worker_id).await? {
      let abandoned = match job.pid {
        None => true,
        Some(pid) => pid != own_pid && !pid_is_alive(pid),
      };
      if !abandoned {
        continue;
      }
      tracing::warn!(job_id = ?job.id, pid = ?job.pid, "releasing job abandoned by a previous consumer");
      manager.failed(&mut job, CRASHED_MESSAGE, false).await?;
      released += 1;
    }
    Ok(released)
  }

  async fn heartbeat(&self) {
    let in_flight = self.stats.in_flight.load(Ordering::SeqCst);
    let idle = self.stats.idle_for();
    if in_flight > 0 && idle > self.config.stall_threshold {
      tracing::warn!(
        worker_id = %self.worker_id,
        in_flight,
        idle_secs = idle.as_secs(),
        "consumer appears to be stalled"
      );
    }
    tracing::debug!(
      worker_id = %self.worker_id,
      handled = self.stats.handled.load(Ordering::Relaxed),
      in_flight,
      "consumer heartbeat"
    );
    if tracing::enabled!(tracing::Level::DEBUG) {
      match self.executor.manager().datastore().status_counts().await {
        Ok(counts) => tracing::debug!(worker_id = %self.worker_id, ?counts, "job counts"),
        Err(e) => tracing::debug!(error = %e, "could not count jobs"),
      }
    }

    if self.started.elapsed() >= self.pulse_time && !self.is_done() {
      tracing::info!(worker_id = %self.worker_id, "pulse time reached, recycling consumer");
      self.stop().await;
    }
  }

  /// 停止消费，正在处理的消息会先完成
  /// Stop consuming, messages in progress finish first
  pub async fn stop(&self) {
    self.done.store(true, Ordering::SeqCst);
    if let Err(e) = self.broker.stop_consuming().await {
      tracing::warn!(error = %e, "could not stop broker consumption");
    }
  }

  fn handlers(self: &Arc<Self>) -> (MessageHandler, HeartbeatHandler) {
    let this = Arc::clone(self);
    let on_message: MessageHandler = Arc::new(move |delivery: Delivery| -> BoxFuture<Acknowledgement> {
      let this = Arc::clone(&this);
      Box::pin(async move { this.handle(delivery).await })
    });
    let this = Arc::clone(self);
    let on_heartbeat: HeartbeatHandler = Arc::new(move || -> BoxFuture<()> {
      let this = Arc::clone(&this);
      Box::pin(async move { this.heartbeat().await })
    });
    (on_message, on_heartbeat)
  }
}

/// 存储错误对应的确认决定：暂时性错误重投，其余丢弃
/// Settlement for a storage error: transient errors are redelivered, the rest dropped
fn settle_error(e: &Error) -> Acknowledgement {
  if e.is_retriable() {
    Acknowledgement::Requeue
  } else {
    Acknowledgement::Reject
  }
}

impl ComponentLifecycle for Consumer {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let (on_message, on_heartbeat) = self.handlers();
      let quiet: HeartbeatHandler = Arc::new(|| -> BoxFuture<()> { Box::pin(async {}) });

      match self.recover_abandoned().await {
        Ok(0) => {}
        Ok(released) => tracing::info!(worker_id = %self.worker_id, released, "released abandoned jobs"),
        Err(e) => tracing::warn!(worker_id = %self.worker_id, error = %e, "could not release abandoned jobs"),
      }

      tracing::info!(
        worker_id = %self.worker_id,
        concurrency = self.config.concurrency,
        "consumer started"
      );

      let mut loops = Vec::with_capacity(self.config.concurrency);
      for index in 0..self.config.concurrency {
        let broker = Arc::clone(&self.broker);
        let on_message = Arc::clone(&on_message);
        let on_heartbeat = if index == 0 {
          Arc::clone(&on_heartbeat)
        } else {
          Arc::clone(&quiet)
        };
        loops.push(tokio::spawn(async move {
          broker.consume(on_message, on_heartbeat).await
        }));
      }

      for handle in loops {
        match handle.await {
          Ok(Ok(())) => {}
          Ok(Err(e)) => tracing::error!(error = %e, "consume loop failed"),
          Err(e) => tracing::error!(error = %e, "consume loop panicked"),
        }
      }

      self.done.store(true, Ordering::SeqCst);
      tracing::info!(worker_id = %self.worker_id, "consumer stopped");
    })
  }

  fn shutdown(&self) {
    self.done.store(true, Ordering::SeqCst);
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
      let broker = Arc::clone(&self.broker);
      runtime.spawn(async move {
        if let Err(e) = broker.stop_consuming().await {
          tracing::warn!(error = %e, "could not stop broker consumption");
        }
      });
    }
  }

  fn is_done(&self) -> bool {
    self.done.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_settle_error() {
    assert_eq!(
      settle_error(&Error::persistence("connection refused")),
      Acknowledgement::Requeue
    );
    assert_eq!(
      settle_error(&Error::JobNotFound { id: 9 }),
      Acknowledgement::Reject
    );
    let corrupt = serde_json::from_str::<u32>("{").unwrap_err();
    assert_eq!(settle_error(&Error::from(corrupt)), Acknowledgement::Reject);
  }
}
