//! 内存消息 broker
//! Memory message broker
//!
//! 进程内的可靠队列：延迟消息在到期前保留，未确认的消息可以重新入队
//! In-process reliable queue: delayed messages are held until due, unacknowledged messages can be requeued

use crate::base::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL};
use crate::base::{Delivery, HeartbeatHandler, MessageBroker, MessageHandler};
use crate::error::{Error, Result};
use crate::job::JobMessage;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct BrokerState {
  /// 已到期，等待投递
  /// Due, waiting for delivery
  ready: VecDeque<(JobMessage, bool)>,
  /// 尚未到期
  /// Not yet due
  delayed: Vec<JobMessage>,
  /// 已投递未确认
  /// Delivered but not settled
  unacked: HashMap<String, JobMessage>,
  batch: Vec<JobMessage>,
  /// 所有发布过的消息，按发布顺序
  /// Every published message, in publish order
  published: Vec<JobMessage>,
}

impl BrokerState {
  fn push(&mut self, message: JobMessage) {
    self.published.push(message.clone());
    if message.run_at > Utc::now() {
      self.delayed.push(message);
    } else {
      self.ready.push_back((message, false));
    }
  }

  /// 把到期的延迟消息移入就绪队列
  /// Move due delayed messages into the ready queue
  fn promote_due(&mut self) {
    let now = Utc::now();
    let (mut due, pending): (Vec<_>, Vec<_>) =
      self.delayed.drain(..).partition(|message| message.run_at <= now);
    self.delayed = pending;
    due.sort_by_key(|message| (message.run_at, message.priority, message.id));
    self
      .ready
      .extend(due.into_iter().map(|message| (message, false)));
  }

  fn next_due_in(&self) -> Option<Duration> {
    let now = Utc::now();
    self
      .delayed
      .iter()
      .map(|message| (message.run_at - now).to_std().unwrap_or(Duration::ZERO))
      .min()
  }
}

/// 内存消息 broker
/// Memory message broker
pub struct MemoryBroker {
  state: Arc<Mutex<BrokerState>>,
  notify: Arc<Notify>,
  stop: std::sync::Mutex<CancellationToken>,
  poll_interval: Duration,
  heartbeat_interval: Duration,
  unavailable: AtomicBool,
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBroker {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(BrokerState::default())),
      notify: Arc::new(Notify::new()),
      stop: std::sync::Mutex::new(CancellationToken::new()),
      poll_interval: DEFAULT_POLL_INTERVAL,
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      unavailable: AtomicBool::new(false),
    }
  }

  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  /// 模拟 broker 不可用，发布会失败
  /// Simulate an outage, publishing fails while it is set
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::Relaxed);
  }

  /// 发布过的所有消息
  /// Every message published so far
  pub async fn published(&self) -> Vec<JobMessage> {
    self.state.lock().await.published.clone()
  }

  /// 等待投递的消息数（含延迟消息）
  /// Messages waiting for delivery, delayed ones included
  pub async fn pending_len(&self) -> usize {
    let state = self.state.lock().await;
    state.ready.len() + state.delayed.len()
  }

  pub async fn unacked_len(&self) -> usize {
    self.state.lock().await.unacked.len()
  }

  fn check_available(&self) -> Result<()> {
    if self.unavailable.load(Ordering::Relaxed) {
      return Err(Error::broker("memory broker is unavailable"));
    }
    Ok(())
  }

  fn stop_token(&self) -> CancellationToken {
    match self.stop.lock() {
      Ok(token) => token.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  async fn next_delivery(&self) -> Option<Delivery> {
    let mut state = self.state.lock().await;
    state.promote_due();
    let (message, redelivered) = state.ready.pop_front()?;
    let tag = Uuid::new_v4().to_string();
    state.unacked.insert(tag.clone(), message.clone());
    Some(Delivery {
      message,
      tag,
      redelivered,
    })
  }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
  async fn publish_job(&self, message: &JobMessage, batch: bool) -> Result<()> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    if batch {
      state.batch.push(message.clone());
    } else {
      state.push(message.clone());
      self.notify.notify_one();
    }
    Ok(())
  }

  async fn finish_batch(&self) -> Result<()> {
    self.check_available()?;
    let mut state = self.state.lock().await;
    let batch = std::mem::take(&mut state.batch);
    for message in batch {
      state.push(message);
    }
    self.notify.notify_one();
    Ok(())
  }

  async fn consume(&self, on_message: MessageHandler, on_heartbeat: HeartbeatHandler) -> Result<()> {
    let stop = self.stop_token();
    let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      if stop.is_cancelled() {
        break;
      }

      if let Some(delivery) = self.next_delivery().await {
        let decision = on_message(delivery.clone()).await;
        self.settle(&delivery, decision).await?;
        continue;
      }

      let wait = {
        let state = self.state.lock().await;
        state
          .next_due_in()
          .map_or(self.poll_interval, |due| due.min(self.poll_interval))
      };

      tokio::select! {
        _ = stop.cancelled() => break,
        _ = heartbeat.tick() => on_heartbeat().await,
        _ = self.notify.notified() => {}
        _ = tokio::time::sleep(wait) => {}
      }
    }

    tracing::debug!("memory broker consumer stopped");
    Ok(())
  }

  async fn stop_consuming(&self) -> Result<()> {
    let mut token = match self.stop.lock() {
      Ok(token) => token,
      Err(poisoned) => poisoned.into_inner(),
    };
    token.cancel();
    *token = CancellationToken::new();
    Ok(())
  }

  async fn ack(&self, delivery: &Delivery) -> Result<()> {
    self.state.lock().await.unacked.remove(&delivery.tag);
    Ok(())
  }

  async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
    let mut state = self.state.lock().await;
    if let Some(message) = state.unacked.remove(&delivery.tag) {
      if requeue {
        state.ready.push_back((message, true));
        self.notify.notify_one();
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::base::{Acknowledgement, BoxFuture};
  use std::sync::atomic::AtomicUsize;

  fn message(id: u64, delay_secs: i64) -> JobMessage {
    JobMessage {
      id,
      worker: "Test".to_string(),
      priority: 100,
      sequence: None,
      run_at: Utc::now() + chrono::Duration::seconds(delay_secs),
    }
  }

  #[tokio::test]
  async fn test_publish_and_batch() {
    let broker = MemoryBroker::new();
    broker.publish_job(&message(1, 0), false).await.unwrap();
    broker.publish_job(&message(2, 0), true).await.unwrap();
    assert_eq!(broker.pending_len().await, 1);

    broker.finish_batch().await.unwrap();
    assert_eq!(broker.pending_len().await, 2);
    assert_eq!(broker.published().await.len(), 2);
  }

  #[tokio::test]
  async fn test_delayed_messages_wait() {
    let broker = MemoryBroker::new();
    broker.publish_job(&message(1, 3600), false).await.unwrap();
    broker.publish_job(&message(2, 0), false).await.unwrap();

    let delivery = broker.next_delivery().await.unwrap();
    assert_eq!(delivery.message.id, 2);
    assert!(broker.next_delivery().await.is_none());
    assert_eq!(broker.pending_len().await, 1);
  }

  #[tokio::test]
  async fn test_nack_requeues() {
    let broker = MemoryBroker::new();
    broker.publish_job(&message(1, 0), false).await.unwrap();

    let delivery = broker.next_delivery().await.unwrap();
    assert!(!delivery.redelivered);
    assert_eq!(broker.unacked_len().await, 1);
    broker.nack(&delivery, true).await.unwrap();

    let again = broker.next_delivery().await.unwrap();
    assert!(again.redelivered);
    broker.ack(&again).await.unwrap();
    assert_eq!(broker.unacked_len().await, 0);
    assert_eq!(broker.pending_len().await, 0);
  }

  #[tokio::test]
  async fn test_unavailable() {
    let broker = MemoryBroker::new();
    broker.set_unavailable(true);
    assert!(matches!(
      broker.publish_job(&message(1, 0), false).await,
      Err(Error::Broker(_))
    ));
  }

  #[tokio::test]
  async fn test_consume_until_stopped() {
    let broker = Arc::new(MemoryBroker::new().with_heartbeat_interval(Duration::from_millis(10)));
    broker.publish_job(&message(1, 0), false).await.unwrap();
    broker.publish_job(&message(2, 0), false).await.unwrap();

    let handled = Arc::new(AtomicUsize::new(0));
    let beats = Arc::new(AtomicUsize::new(0));
    let on_message: MessageHandler = {
      let handled = handled.clone();
      Arc::new(move |_delivery: Delivery| -> BoxFuture<Acknowledgement> {
        handled.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Acknowledgement::Ack })
      })
    };
    let on_heartbeat: HeartbeatHandler = {
      let beats = beats.clone();
      Arc::new(move || -> BoxFuture<()> {
        beats.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
      })
    };

    let consumer = {
      let broker = broker.clone();
      tokio::spawn(async move { broker.consume(on_message, on_heartbeat).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.stop_consuming().await.unwrap();
    consumer.await.unwrap().unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert!(beats.load(Ordering::SeqCst) >= 1);
    assert_eq!(broker.unacked_len().await, 0);
  }
}
