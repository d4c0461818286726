//! Redis 后端
//! Redis backend
//!
//! 基于 Redis 的数据存储与消息 broker。任务的权威状态保存在哈希中，
//! 各种索引（可认领、序列、worker、BUSY、状态计数）由 Lua 脚本原子地维护。
//! Redis-backed datastore and message broker. A job's authoritative state lives in a hash,
//! the indexes (claimable, sequence, worker, busy, status counts) are kept in step by Lua scripts.
//!
//! ## 键布局 / Key layout
//!
//! - `<prefix>:id` - 任务 id 计数器 / job id counter
//! - `<prefix>:job:<id>` - 任务哈希 / job hash (`json`, `status`, `sequence`, `worker`, `locked_by`, `run_at`)
//! - `<prefix>:open` - 可认领任务，分数为优先级与 id / claimable jobs scored by priority then id
//! - `<prefix>:seq:<sequence>` - 序列中未结束的任务 / unfinished jobs of a sequence
//! - `<prefix>:worker:<worker>` - 某个 worker 的可认领任务 / claimable jobs of a worker
//! - `<prefix>:busy:<locked_by>` - 某个 worker 池名下的 BUSY 任务 / BUSY jobs of a worker pool
//! - `<prefix>:status:<code>` - 各状态的任务 / jobs per status
//! - `<prefix>:host:<host>:<pid>` - 主机记录 / host records
//! - `<prefix>:broker:scheduled`, `<prefix>:broker:queue`, `<prefix>:broker:processing:<tag>` - broker

use crate::base::constants::DEFAULT_KEY_PREFIX;
use crate::error::Result;
use crate::job::JobId;
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionInfo, IntoConnectionInfo};

pub mod broker;
pub mod datastore;
pub mod scripts;

pub use broker::{RedisBroker, RedisBrokerConfig};
pub use datastore::RedisDatastore;

/// Redis 连接配置
/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConnectionConfig {
  connection_info: ConnectionInfo,
  prefix: String,
}

impl RedisConnectionConfig {
  /// 创建单机连接配置
  /// Create a standalone connection configuration
  pub fn single<T: IntoConnectionInfo>(connection_info: T) -> Result<Self> {
    Ok(Self {
      connection_info: connection_info.into_connection_info()?,
      prefix: DEFAULT_KEY_PREFIX.to_string(),
    })
  }

  /// 设置键前缀，用于在同一个 Redis 中隔离多个部署
  /// Set the key prefix, isolating deployments that share one Redis
  pub fn with_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub(crate) async fn connect(&self) -> Result<MultiplexedConnection> {
    let client = Client::open(self.connection_info.clone())?;
    Ok(client.get_multiplexed_async_connection().await?)
  }
}

/// 键名构造
/// Key names
#[derive(Debug, Clone)]
pub(crate) struct Keys {
  prefix: String,
}

impl Keys {
  pub(crate) fn new(prefix: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
    }
  }

  pub(crate) fn prefix(&self) -> &str {
    &self.prefix
  }

  pub(crate) fn id_counter(&self) -> String {
    format!("{}:id", self.prefix)
  }

  pub(crate) fn job(&self, id: JobId) -> String {
    format!("{}:job:{id}", self.prefix)
  }

  pub(crate) fn open(&self) -> String {
    format!("{}:open", self.prefix)
  }

  pub(crate) fn sequence(&self, sequence: &str) -> String {
    format!("{}:seq:{sequence}", self.prefix)
  }

  pub(crate) fn worker(&self, worker: &str) -> String {
    format!("{}:worker:{worker}", self.prefix)
  }

  pub(crate) fn busy(&self, locked_by: &str) -> String {
    format!("{}:busy:{locked_by}", self.prefix)
  }

  pub(crate) fn status(&self, code: u8) -> String {
    format!("{}:status:{code}", self.prefix)
  }

  pub(crate) fn host(&self, host_name: &str, pid: u32) -> String {
    format!("{}:host:{host_name}:{pid}", self.prefix)
  }

  pub(crate) fn scheduled(&self) -> String {
    format!("{}:broker:scheduled", self.prefix)
  }

  pub(crate) fn queue(&self) -> String {
    format!("{}:broker:queue", self.prefix)
  }

  pub(crate) fn processing(&self, consumer_tag: &str) -> String {
    format!("{}:broker:processing:{consumer_tag}", self.prefix)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_layout() {
    let keys = Keys::new("dj");
    assert_eq!(keys.job(7), "dj:job:7");
    assert_eq!(keys.sequence("import"), "dj:seq:import");
    assert_eq!(keys.status(2), "dj:status:2");
    assert_eq!(keys.host("box", 42), "dj:host:box:42");
    assert_eq!(keys.processing("box:42"), "dj:broker:processing:box:42");
  }

  #[test]
  fn test_connection_config_prefix() {
    let config = RedisConnectionConfig::single("redis://127.0.0.1:6379")
      .unwrap()
      .with_prefix("staging");
    assert_eq!(config.prefix(), "staging");
    assert!(RedisConnectionConfig::single("not a url").is_err());
  }
}
