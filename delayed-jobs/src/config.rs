//! 配置模块
//! Configuration module
//!
//! 编排器、主机 supervisor 与 broker 消费者的配置
//! Configuration for the orchestrator, the host supervisor and the broker consumer

use crate::base::constants::{
  DEFAULT_ARCHIVE_RECURRING, DEFAULT_ARCHIVE_TABLE, DEFAULT_ARCHIVE_TIME_LIMIT, DEFAULT_CLAIM_GRACE,
  DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_EXECUTION_TIME, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL,
  DEFAULT_PRIORITY, DEFAULT_PULSE_TIME, DEFAULT_UPDATE_INTERVAL, MAXIMUM_MAX_RETRIES,
  MAXIMUM_PRIORITY,
};
use crate::error::{Error, Result};
use crate::job::Job;
use chrono::{DateTime, Days, NaiveTime, Utc};
use std::time::Duration;

/// 编排器配置
/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
  /// 任务未指定时的最大重试次数
  /// Max retries for jobs that do not set their own
  pub default_max_retries: u32,
  /// 任何任务允许的最大重试次数
  /// Upper bound on any job's max retries
  pub maximum_max_retries: u32,
  pub default_priority: i32,
  /// 优先级上限，入队时超出部分被截断
  /// Priority ceiling, higher values are clamped on enqueue
  pub maximum_priority: i32,
  /// 消费者运行多久后自我回收
  /// How long a consumer runs before recycling itself
  pub pulse_time: Duration,
  /// 为 true 时不发布到 broker，主机只靠轮询发现任务
  /// When true nothing is published, hosts discover work by polling only
  pub broker_disabled: bool,
  pub archive: ArchiveConfig,
}

impl Default for ManagerConfig {
  fn default() -> Self {
    Self {
      default_max_retries: DEFAULT_MAX_RETRIES,
      maximum_max_retries: MAXIMUM_MAX_RETRIES,
      default_priority: DEFAULT_PRIORITY,
      maximum_priority: MAXIMUM_PRIORITY,
      pulse_time: DEFAULT_PULSE_TIME,
      broker_disabled: false,
      archive: ArchiveConfig::default(),
    }
  }
}

impl ManagerConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn default_max_retries(mut self, retries: u32) -> Self {
    self.default_max_retries = retries;
    self
  }

  pub fn maximum_max_retries(mut self, retries: u32) -> Self {
    self.maximum_max_retries = retries;
    self
  }

  pub fn default_priority(mut self, priority: i32) -> Self {
    self.default_priority = priority;
    self
  }

  pub fn maximum_priority(mut self, priority: i32) -> Self {
    self.maximum_priority = priority;
    self
  }

  pub fn pulse_time(mut self, pulse_time: Duration) -> Self {
    self.pulse_time = pulse_time;
    self
  }

  pub fn broker_disabled(mut self, disabled: bool) -> Self {
    self.broker_disabled = disabled;
    self
  }

  pub fn archive(mut self, archive: ArchiveConfig) -> Self {
    self.archive = archive;
    self
  }

  /// 任务实际生效的最大重试次数
  /// Effective max retries of a job
  pub fn max_retries_for(&self, job: &Job) -> u32 {
    job
      .options
      .max_retries
      .unwrap_or(self.default_max_retries)
      .min(self.maximum_max_retries)
  }

  pub fn validate(&self) -> Result<()> {
    if self.default_max_retries > self.maximum_max_retries {
      return Err(Error::config(
        "Default max retries cannot exceed the maximum max retries",
      ));
    }

    if self.default_priority > self.maximum_priority {
      return Err(Error::config(
        "Default priority cannot exceed the maximum priority",
      ));
    }

    if self.pulse_time.is_zero() {
      return Err(Error::config("Pulse time must be greater than 0"));
    }

    self.archive.validate()
  }
}

/// 归档配置
/// Archive configuration
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
  pub enabled: bool,
  pub table_name: String,
  /// 超过该时长的终态任务可以归档
  /// Finished jobs older than this may be archived
  pub time_limit: Duration,
  /// 每日运行时间（UTC）
  /// Daily run time (UTC)
  pub recurring: NaiveTime,
}

impl Default for ArchiveConfig {
  fn default() -> Self {
    Self {
      enabled: false,
      table_name: DEFAULT_ARCHIVE_TABLE.to_string(),
      time_limit: DEFAULT_ARCHIVE_TIME_LIMIT,
      recurring: NaiveTime::parse_from_str(DEFAULT_ARCHIVE_RECURRING, "%H:%M")
        .unwrap_or(NaiveTime::MIN),
    }
  }
}

impl ArchiveConfig {
  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn table_name<S: Into<String>>(mut self, table_name: S) -> Self {
    self.table_name = table_name.into();
    self
  }

  pub fn time_limit(mut self, time_limit: Duration) -> Self {
    self.time_limit = time_limit;
    self
  }

  pub fn recurring(mut self, recurring: NaiveTime) -> Self {
    self.recurring = recurring;
    self
  }

  /// 截止时间：早于它结束的任务可归档
  /// Cutoff: jobs finished before it may be archived
  pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let limit = chrono::Duration::from_std(self.time_limit).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(limit).unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  /// 下一次运行时间：明天的 `recurring` 时刻
  /// Next run: tomorrow at `recurring`
  pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().checked_add_days(Days::new(1)).unwrap_or(now.date_naive());
    tomorrow.and_time(self.recurring).and_utc()
  }

  pub fn validate(&self) -> Result<()> {
    if self.enabled && self.table_name.trim().is_empty() {
      return Err(Error::config("Archive table name cannot be empty"));
    }
    Ok(())
  }
}

/// 主机 supervisor 配置
/// Host supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
  /// worker 池名称，池标识为 `"{host_name}.{worker_name}"`
  /// Worker pool name, the pool identity is `"{host_name}.{worker_name}"`
  pub worker_name: String,
  /// 覆盖主机记录中的 worker 数
  /// Overrides the worker count stored in the host record
  pub worker_count: Option<usize>,
  pub update_interval: Duration,
  pub poll_interval: Duration,
  pub claim_grace: Duration,
  pub default_max_execution_time: Duration,
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self {
      worker_name: "default".to_string(),
      worker_count: None,
      update_interval: DEFAULT_UPDATE_INTERVAL,
      poll_interval: DEFAULT_POLL_INTERVAL,
      claim_grace: DEFAULT_CLAIM_GRACE,
      default_max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
    }
  }
}

impl SupervisorConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn worker_name<S: Into<String>>(mut self, worker_name: S) -> Self {
    self.worker_name = worker_name.into();
    self
  }

  pub fn worker_count(mut self, worker_count: usize) -> Self {
    self.worker_count = Some(worker_count);
    self
  }

  pub fn update_interval(mut self, interval: Duration) -> Self {
    self.update_interval = interval;
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn claim_grace(mut self, grace: Duration) -> Self {
    self.claim_grace = grace;
    self
  }

  pub fn default_max_execution_time(mut self, max_execution_time: Duration) -> Self {
    self.default_max_execution_time = max_execution_time;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.worker_name.trim().is_empty() {
      return Err(Error::config("Worker name cannot be empty"));
    }

    if self.worker_count == Some(0) {
      return Err(Error::config("Worker count must be greater than 0"));
    }

    if self.poll_interval.is_zero() {
      return Err(Error::config("Poll interval must be greater than 0"));
    }

    if self.default_max_execution_time < Duration::from_secs(1) {
      return Err(Error::config(
        "Max execution time cannot be less than 1 second",
      ));
    }

    Ok(())
  }
}

/// broker 消费者配置
/// Broker consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
  pub worker_name: String,
  /// 并行的消费循环数
  /// Number of parallel consume loops
  pub concurrency: usize,
  pub claim_grace: Duration,
  /// 心跳间隔超过该值视为卡住
  /// A heartbeat gap beyond this is reported as a stall
  pub stall_threshold: Duration,
}

impl Default for ConsumerConfig {
  fn default() -> Self {
    Self {
      worker_name: "consumer".to_string(),
      concurrency: num_cpus::get(),
      claim_grace: DEFAULT_CLAIM_GRACE,
      stall_threshold: DEFAULT_HEARTBEAT_INTERVAL * 6,
    }
  }
}

impl ConsumerConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn worker_name<S: Into<String>>(mut self, worker_name: S) -> Self {
    self.worker_name = worker_name.into();
    self
  }

  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency;
    self
  }

  pub fn claim_grace(mut self, grace: Duration) -> Self {
    self.claim_grace = grace;
    self
  }

  pub fn stall_threshold(mut self, threshold: Duration) -> Self {
    self.stall_threshold = threshold;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.concurrency == 0 {
      return Err(Error::config("Concurrency must be greater than 0"));
    }
    if self.worker_name.trim().is_empty() {
      return Err(Error::config("Worker name cannot be empty"));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::Payload;
  use chrono::TimeZone;

  #[test]
  fn test_manager_defaults() {
    let config = ManagerConfig::default();
    assert_eq!(config.default_max_retries, 5);
    assert_eq!(config.maximum_max_retries, 5);
    assert_eq!(config.default_priority, 100);
    assert_eq!(config.pulse_time, Duration::from_secs(6 * 3600));
    assert!(!config.broker_disabled);
    assert!(!config.archive.enabled);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_max_retries_resolution() {
    let config = ManagerConfig::default();
    let job = Job::new("Report.Build", Payload::new()).unwrap();
    assert_eq!(config.max_retries_for(&job), 5);
    assert_eq!(config.max_retries_for(&job.clone().with_max_retries(2)), 2);
    assert_eq!(config.max_retries_for(&job.with_max_retries(50)), 5);
  }

  #[test]
  fn test_manager_validation() {
    assert!(ManagerConfig::new()
      .default_max_retries(9)
      .validate()
      .is_err());
    assert!(ManagerConfig::new()
      .pulse_time(Duration::ZERO)
      .validate()
      .is_err());
    assert!(ManagerConfig::new()
      .archive(ArchiveConfig::default().enabled(true).table_name(""))
      .validate()
      .is_err());
  }

  #[test]
  fn test_archive_schedule() {
    let archive = ArchiveConfig::default();
    let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
    assert_eq!(
      archive.next_run(now),
      Utc.with_ymd_and_hms(2024, 3, 11, 0, 30, 0).unwrap()
    );
    assert_eq!(
      archive.cutoff(now),
      Utc.with_ymd_and_hms(2023, 12, 11, 15, 0, 0).unwrap()
    );
  }

  #[test]
  fn test_supervisor_config() {
    let config = SupervisorConfig::new()
      .worker_name("reports")
      .worker_count(4);
    assert_eq!(config.worker_count, Some(4));
    assert_eq!(config.claim_grace, Duration::from_millis(250));
    assert!(config.validate().is_ok());

    assert!(SupervisorConfig::new().worker_count(0).validate().is_err());
    assert!(SupervisorConfig::new().worker_name(" ").validate().is_err());
  }

  #[test]
  fn test_consumer_config() {
    assert!(ConsumerConfig::default().validate().is_ok());
    assert!(ConsumerConfig::new().concurrency(0).validate().is_err());
    assert_ne!(
      ConsumerConfig::default().worker_name,
      SupervisorConfig::default().worker_name
    );
  }
}
