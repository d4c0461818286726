//! Redis 消息 broker
//! Redis message broker
//!
//! 延迟消息保存在有序集合中，到期后由 `forward` 脚本移入就绪列表。
//! 消费者用 `LMOVE` 把消息原子地转移到自己的处理中列表，确认时再删除，
//! 进程重启后处理中列表里剩下的消息会被放回就绪列表。
//! Delayed messages wait in a sorted set and are moved to the ready list by the `forward` script
//! once due. Consumers atomically move a message into their own processing list with `LMOVE` and
//! remove it when settling; whatever a crashed consumer left there is returned on restart.

use crate::base::constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL};
use crate::base::{Delivery, HeartbeatHandler, MessageBroker, MessageHandler};
use crate::error::{Error, Result};
use crate::job::JobMessage;
use crate::rdb::scripts::{RedisArg, ScriptManager};
use crate::rdb::{Keys, RedisConnectionConfig};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 队列中的消息
/// A queued message
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
  #[serde(flatten)]
  message: JobMessage,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  redelivered: bool,
}

impl Envelope {
  fn encode(message: &JobMessage, redelivered: bool) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
      message: message.clone(),
      redelivered,
    })?)
  }
}

/// Redis broker 配置
/// Redis broker configuration
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
  /// 处理中列表的标识，每个消费进程唯一
  /// Identifies the processing list, unique per consuming process
  pub consumer_tag: String,
  pub poll_interval: Duration,
  pub heartbeat_interval: Duration,
  /// 每次最多转发的到期消息数
  /// Max due messages forwarded per round
  pub forward_batch: usize,
}

impl Default for RedisBrokerConfig {
  fn default() -> Self {
    let host_name = hostname::get()
      .map(|name| name.to_string_lossy().to_string())
      .unwrap_or_else(|_| "localhost".to_string());
    Self {
      consumer_tag: format!("{host_name}:{}", std::process::id()),
      poll_interval: DEFAULT_POLL_INTERVAL,
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      forward_batch: 100,
    }
  }
}

impl RedisBrokerConfig {
  pub fn consumer_tag<S: Into<String>>(mut self, tag: S) -> Self {
    self.consumer_tag = tag.into();
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.consumer_tag.trim().is_empty() {
      return Err(Error::config("consumer_tag cannot be empty"));
    }
    if self.poll_interval.is_zero() {
      return Err(Error::config("poll_interval must be greater than zero"));
    }
    if self.forward_batch == 0 {
      return Err(Error::config("forward_batch must be greater than zero"));
    }
    Ok(())
  }
}

/// Redis 消息 broker
/// Redis message broker
pub struct RedisBroker {
  conn: MultiplexedConnection,
  keys: Keys,
  config: RedisBrokerConfig,
  script_manager: ScriptManager,
  batch: Mutex<Vec<(String, i64)>>,
  stop: std::sync::Mutex<CancellationToken>,
}

impl RedisBroker {
  /// 连接 Redis，并把上次运行遗留在处理中列表里的消息放回队列
  /// Connect, returning messages left in the processing list by a previous run
  pub async fn new(connection: RedisConnectionConfig, config: RedisBrokerConfig) -> Result<Self> {
    config.validate()?;
    let mut conn = connection.connect().await?;
    let mut script_manager = ScriptManager::default();
    script_manager.load_scripts(&mut conn).await?;
    let broker = Self {
      conn,
      keys: Keys::new(connection.prefix()),
      config,
      script_manager,
      batch: Mutex::new(Vec::new()),
      stop: std::sync::Mutex::new(CancellationToken::new()),
    };
    let recovered = broker.recover().await?;
    if recovered > 0 {
      tracing::info!(
        consumer_tag = %broker.config.consumer_tag,
        recovered,
        "returned unacknowledged messages to the queue"
      );
    }
    Ok(broker)
  }

  pub fn config(&self) -> &RedisBrokerConfig {
    &self.config
  }

  fn connection(&self) -> MultiplexedConnection {
    self.conn.clone()
  }

  fn processing_key(&self) -> String {
    self.keys.processing(&self.config.consumer_tag)
  }

  async fn recover(&self) -> Result<u64> {
    let mut conn = self.connection();
    self
      .script_manager
      .eval_script(
        &mut conn,
        "recover",
        &[self.processing_key(), self.keys.queue()],
        &[],
      )
      .await
  }

  /// 把到期的延迟消息移入就绪队列
  /// Move due delayed messages into the ready queue
  pub async fn forward_due(&self) -> Result<u64> {
    let mut conn = self.connection();
    let batch = i64::try_from(self.config.forward_batch).unwrap_or(i64::MAX);
    self
      .script_manager
      .eval_script(
        &mut conn,
        "forward",
        &[self.keys.scheduled(), self.keys.queue()],
        &[
          RedisArg::Int(Utc::now().timestamp_millis()),
          RedisArg::Int(batch),
        ],
      )
      .await
  }

  /// 就绪与延迟消息总数
  /// Ready plus delayed messages
  pub async fn pending_len(&self) -> Result<u64> {
    let mut conn = self.connection();
    let (ready, delayed): (u64, u64) = redis::pipe()
      .cmd("LLEN")
      .arg(self.keys.queue())
      .cmd("ZCARD")
      .arg(self.keys.scheduled())
      .query_async(&mut conn)
      .await?;
    Ok(ready + delayed)
  }

  fn push(pipe: &mut redis::Pipeline, keys: &Keys, raw: &str, run_at_ms: i64) {
    if run_at_ms > Utc::now().timestamp_millis() {
      pipe.cmd("ZADD").arg(keys.scheduled()).arg(run_at_ms).arg(raw);
    } else {
      pipe.cmd("LPUSH").arg(keys.queue()).arg(raw);
    }
  }

  async fn next_delivery(&self, conn: &mut MultiplexedConnection) -> Result<Option<Delivery>> {
    let processing = self.processing_key();
    let raw: Option<String> = redis::cmd("LMOVE")
      .arg(self.keys.queue())
      .arg(&processing)
      .arg("RIGHT")
      .arg("LEFT")
      .query_async(&mut *conn)
      .await?;
    let Some(raw) = raw else {
      return Ok(None);
    };
    match serde_json::from_str::<Envelope>(&raw) {
      Ok(envelope) => Ok(Some(Delivery {
        message: envelope.message,
        tag: raw,
        redelivered: envelope.redelivered,
      })),
      Err(e) => {
        tracing::warn!(error = %e, message = %raw, "dropping undecodable broker message");
        redis::cmd("LREM")
          .arg(&processing)
          .arg(1)
          .arg(&raw)
          .query_async::<()>(&mut *conn)
          .await?;
        Ok(None)
      }
    }
  }

  fn stop_token(&self) -> CancellationToken {
    match self.stop.lock() {
      Ok(token) => token.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }
}

#[async_trait]
impl MessageBroker for RedisBroker {
  async fn publish_job(&self, message: &JobMessage, batch: bool) -> Result<()> {
    let raw = Envelope::encode(message, false)?;
    let run_at_ms = message.run_at.timestamp_millis();
    if batch {
      self.batch.lock().await.push((raw, run_at_ms));
      return Ok(());
    }
    let mut pipe = redis::pipe();
    Self::push(&mut pipe, &self.keys, &raw, run_at_ms);
    let mut conn = self.connection();
    pipe
      .query_async::<()>(&mut conn)
      .await
      .map_err(|e| Error::broker(format!("publish failed: {e}")))
  }

  async fn finish_batch(&self) -> Result<()> {
    let batch = std::mem::take(&mut *self.batch.lock().await);
    if batch.is_empty() {
      return Ok(());
    }
    let mut pipe = redis::pipe();
    pipe.atomic();
    for (raw, run_at_ms) in &batch {
      Self::push(&mut pipe, &self.keys, raw, *run_at_ms);
    }
    let mut conn = self.connection();
    pipe
      .query_async::<()>(&mut conn)
      .await
      .map_err(|e| Error::broker(format!("batch publish failed: {e}")))
  }

  async fn consume(&self, on_message: MessageHandler, on_heartbeat: HeartbeatHandler) -> Result<()> {
    let stop = self.stop_token();
    let mut conn = self.connection();
    let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      if stop.is_cancelled() {
        break;
      }

      if let Err(e) = self.forward_due().await {
        tracing::warn!(error = %e, "could not forward due messages");
      }

      match self.next_delivery(&mut conn).await {
        Ok(Some(delivery)) => {
          let decision = on_message(delivery.clone()).await;
          if let Err(e) = self.settle(&delivery, decision).await {
            tracing::error!(job_id = delivery.message.id, error = %e, "could not settle delivery");
          }
          continue;
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "could not fetch from the broker queue"),
      }

      tokio::select! {
        _ = stop.cancelled() => break,
        _ = heartbeat.tick() => on_heartbeat().await,
        _ = tokio::time::sleep(self.config.poll_interval) => {}
      }
    }

    tracing::debug!(consumer_tag = %self.config.consumer_tag, "redis broker consumer stopped");
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
    let mut conn = self.connection();
    redis::cmd("LREM")
      .arg(self.processing_key())
      .arg(1)
      .arg(&delivery.tag)
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }

  async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
    if !requeue {
      return self.ack(delivery).await;
    }
    let raw = Envelope::encode(&delivery.message, true)?;
    let mut conn = self.connection();
    redis::pipe()
      .atomic()
      .cmd("LREM")
      .arg(self.processing_key())
      .arg(1)
      .arg(&delivery.tag)
      .ignore()
      .cmd("RPUSH")
      .arg(self.keys.queue())
      .arg(raw)
      .ignore()
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn message() -> JobMessage {
    JobMessage {
      id: 9,
      worker: "Mailer.Send".into(),
      priority: 100,
      sequence: Some("user-1".into()),
      run_at: Utc::now(),
    }
  }

  #[test]
  fn test_envelope_keeps_message_fields() {
    let raw = Envelope::encode(&message(), false).unwrap();
    assert!(!raw.contains("redelivered"));
    let decoded: Envelope = serde_json::from_str(&raw).unwrap();
    assert_eq!(decoded.message.id, 9);
    assert_eq!(decoded.message.worker, "Mailer.Send");
    assert!(!decoded.redelivered);

    let raw = Envelope::encode(&message(), true).unwrap();
    let decoded: Envelope = serde_json::from_str(&raw).unwrap();
    assert!(decoded.redelivered);
    assert_eq!(decoded.message.sequence.as_deref(), Some("user-1"));
  }

  #[test]
  fn test_config_validation() {
    assert!(RedisBrokerConfig::default().validate().is_ok());
    assert!(RedisBrokerConfig::default()
      .consumer_tag(" ")
      .validate()
      .is_err());
    assert!(RedisBrokerConfig::default()
      .poll_interval(Duration::ZERO)
      .validate()
      .is_err());
  }
}
