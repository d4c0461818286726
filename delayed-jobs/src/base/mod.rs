//! 基础模块
//! Base module
//!
//! 定义编排器依赖的存储与消息契约，以及主机记录
//! Defines the storage and messaging contracts the orchestrator depends on, plus the host record

pub mod constants;

use crate::error::Result;
use crate::job::{Job, JobId, JobMessage, JobStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// 持久化契约
/// Persistence contract
///
/// 数据存储独占任务的持久状态；编排器只在一次操作期间持有任务副本
/// The datastore exclusively owns durable job state; the orchestrator only holds a copy during one operation
#[async_trait]
pub trait Datastore: Send + Sync {
  /// 写入任务，首次持久化时分配 id 和 created_at
  /// Write a job, assigning id and created_at on first persistence
  async fn persist_job(&self, job: &Job) -> Result<Job>;

  /// 批量写入
  /// Batch write
  async fn persist_jobs(&self, jobs: &[Job]) -> Result<Vec<Job>>;

  /// 读取任务，不存在时返回 `Error::JobNotFound`
  /// Read a job, `Error::JobNotFound` when missing
  async fn fetch_job(&self, id: JobId) -> Result<Job>;

  /// 同一序列中是否存在 id 更小且未结束的任务
  /// Whether the sequence holds an unfinished job with a lower id
  async fn currently_sequenced(&self, job: &Job) -> Result<bool>;

  /// 同一序列中 id 最小的未结束任务（不含自身）
  /// The lowest-id unfinished job of the same sequence, excluding the job itself
  async fn fetch_next_sequence(&self, job: &Job) -> Result<Option<Job>>;

  /// 是否已有同一 worker 的待处理任务
  /// Whether a waiting job for the same worker already exists
  async fn is_similar_job(&self, job: &Job) -> Result<bool>;

  /// 下一个可认领的任务：按优先级、id 排序，且是其序列的队首
  /// Next claimable job: ordered by priority then id, and at the head of its sequence
  async fn next_open_job(
    &self,
    exclude_ids: &[JobId],
    exclude_sequences: &[String],
  ) -> Result<Option<Job>>;

  /// 原子地认领任务，只有仍可认领时才成功
  /// Atomically claim a job, succeeding only while it is still claimable
  async fn claim_job(&self, id: JobId, locked_by: &str) -> Result<Option<Job>>;

  /// 某个 worker 池名下的 BUSY 任务
  /// BUSY jobs owned by a worker pool identity
  async fn running_by_host(&self, locked_by: &str) -> Result<Vec<Job>>;

  /// 各状态的任务数
  /// Job counts per status
  async fn status_counts(&self) -> Result<HashMap<JobStatus, u64>>;
}

/// 主机记录存储
/// Host record store
#[async_trait]
pub trait HostStore: Send + Sync {
  async fn register_host(&self, host: &Host) -> Result<()>;
  async fn fetch_host(&self, host_name: &str, pid: u32) -> Result<Option<Host>>;
  async fn update_host(&self, host: &Host) -> Result<()>;
  async fn delete_host(&self, host_name: &str, pid: u32) -> Result<()>;
}

/// 消息确认决定
/// Acknowledgement decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
  /// 处理完毕，移除消息
  /// Handled, remove the message
  Ack,
  /// 放回队列稍后重投
  /// Put back for redelivery
  Requeue,
  /// 丢弃
  /// Drop
  Reject,
}

/// 一次消息投递
/// One message delivery
#[derive(Debug, Clone)]
pub struct Delivery {
  pub message: JobMessage,
  /// broker 内部用来确认这次投递的标签
  /// Tag the broker uses to settle this delivery
  pub tag: String,
  pub redelivered: bool,
}

pub type MessageHandler = Arc<dyn Fn(Delivery) -> BoxFuture<Acknowledgement> + Send + Sync>;
pub type HeartbeatHandler = Arc<dyn Fn() -> BoxFuture<()> + Send + Sync>;

/// 消息 broker 契约
/// Message broker contract
///
/// 至少一次投递：重复投递已结束任务的消息在认领步骤被安全忽略
/// At-least-once delivery: duplicates of finished jobs are ignored at the claim step
#[async_trait]
pub trait MessageBroker: Send + Sync {
  /// 发布任务消息，`batch` 为 true 时缓存到 `finish_batch`
  /// Publish a job message, buffered until `finish_batch` when `batch` is true
  async fn publish_job(&self, message: &JobMessage, batch: bool) -> Result<()>;

  async fn finish_batch(&self) -> Result<()>;

  /// 拉取循环，直到 `stop_consuming`；按处理器的决定确认消息
  /// Pull loop until `stop_consuming`; settles each message by the handler's decision
  async fn consume(&self, on_message: MessageHandler, on_heartbeat: HeartbeatHandler) -> Result<()>;

  async fn stop_consuming(&self) -> Result<()>;

  async fn ack(&self, delivery: &Delivery) -> Result<()>;

  async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

  /// 按决定确认一次投递
  /// Settle a delivery according to a decision
  async fn settle(&self, delivery: &Delivery, decision: Acknowledgement) -> Result<()> {
    match decision {
      Acknowledgement::Ack => self.ack(delivery).await,
      Acknowledgement::Requeue => self.nack(delivery, true).await,
      Acknowledgement::Reject => self.nack(delivery, false).await,
    }
  }
}

/// 主机状态
/// Host status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
  /// 活跃状态
  /// Active
  Active,
  /// 排空后退出
  /// Drain then exit
  Shutdown,
  /// 停止认领，等待外部终止
  /// Stop claiming, awaiting external termination
  ToKill,
}

impl HostStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Active => "ACTIVE",
      Self::Shutdown => "SHUTDOWN",
      Self::ToKill => "TO_KILL",
    }
  }
}

impl fmt::Display for HostStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for HostStatus {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s {
      "ACTIVE" => Ok(Self::Active),
      "SHUTDOWN" => Ok(Self::Shutdown),
      "TO_KILL" => Ok(Self::ToKill),
      _ => Err(()),
    }
  }
}

/// 主机记录，supervisor 启动时创建，正常退出时删除
/// Host record, created when a supervisor boots and deleted when it exits cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
  pub host_name: String,
  pub pid: u32,
  pub worker_name: String,
  pub status: HostStatus,
  pub worker_count: usize,
}

impl Host {
  pub fn new<H: Into<String>, W: Into<String>>(host_name: H, pid: u32, worker_name: W) -> Self {
    Self {
      host_name: host_name.into(),
      pid,
      worker_name: worker_name.into(),
      status: HostStatus::Active,
      worker_count: 1,
    }
  }

  /// worker 池标识 `"{host_name}.{worker_name}"`
  /// Worker pool identity `"{host_name}.{worker_name}"`
  pub fn worker_id(&self) -> String {
    format!("{}.{}", self.host_name, self.worker_name)
  }

  /// 是否应停止认领新任务
  /// Whether new claims should stop
  pub fn is_draining(&self) -> bool {
    self.status != HostStatus::Active
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_host_status_conversion() {
    assert_eq!(HostStatus::ToKill.as_str(), "TO_KILL");
    assert_eq!("SHUTDOWN".parse::<HostStatus>(), Ok(HostStatus::Shutdown));
    assert!("invalid".parse::<HostStatus>().is_err());
  }

  #[test]
  fn test_host_identity() {
    let mut host = Host::new("web-1", 4242, "default");
    assert_eq!(host.worker_id(), "web-1.default");
    assert!(!host.is_draining());
    host.status = HostStatus::ToKill;
    assert!(host.is_draining());
  }
}
