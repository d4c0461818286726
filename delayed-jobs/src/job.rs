//! 任务模块
//! Job module
//!
//! 定义了任务实体、任务状态机以及发布到 broker 的消息结构
//! Defines the job entity, the job state machine and the message published to the broker

use crate::base::constants::{DEFAULT_MAX_EXECUTION_TIME, DEFAULT_PRIORITY};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 任务标识
/// Job identifier
pub type JobId = u64;

/// 任务负载，交给 worker 的不透明结构化数据
/// Job payload, opaque structured data handed to the worker
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// 任务状态
/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
  /// 新建，可被认领
  /// New, eligible for claim
  New,
  /// 已认领或正在执行
  /// Claimed or executing
  Busy,
  /// 已埋葬（终态）
  /// Buried (terminal)
  Buried,
  /// 成功（终态）
  /// Succeeded (terminal)
  Success,
  /// 运维人员从 BURIED 重新排队
  /// Re-queued by an operator from BURIED
  Kick,
  /// 失败，到达 run_at 后重试
  /// Failed, retried once run_at is reached
  Failed,
  /// 查询结果：没有记录
  /// Query result: no record
  Unknown,
  /// 暂停（终态，不重试）
  /// Paused (terminal, not retried)
  Paused,
  /// 诊断任务，不会被认领
  /// Diagnostic job, never claimed
  TestJob,
}

impl JobStatus {
  /// 所有状态，按存储编码排序
  /// Every status, ordered by storage code
  pub const ALL: [JobStatus; 9] = [
    JobStatus::New,
    JobStatus::Busy,
    JobStatus::Buried,
    JobStatus::Success,
    JobStatus::Kick,
    JobStatus::Failed,
    JobStatus::Unknown,
    JobStatus::TestJob,
    JobStatus::Paused,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::New => "NEW",
      JobStatus::Busy => "BUSY",
      JobStatus::Buried => "BURIED",
      JobStatus::Success => "SUCCESS",
      JobStatus::Kick => "KICK",
      JobStatus::Failed => "FAILED",
      JobStatus::Unknown => "UNKNOWN",
      JobStatus::Paused => "PAUSED",
      JobStatus::TestJob => "TEST_JOB",
    }
  }

  /// 稳定的存储编码
  /// Stable storage code
  pub fn code(&self) -> u8 {
    match self {
      JobStatus::New => 1,
      JobStatus::Busy => 2,
      JobStatus::Buried => 3,
      JobStatus::Success => 4,
      JobStatus::Kick => 5,
      JobStatus::Failed => 6,
      JobStatus::Unknown => 7,
      JobStatus::TestJob => 8,
      JobStatus::Paused => 9,
    }
  }

  pub fn from_code(code: u8) -> Option<Self> {
    Self::ALL.into_iter().find(|status| status.code() == code)
  }

  /// 终态：SUCCESS、BURIED、PAUSED
  /// Terminal states: SUCCESS, BURIED, PAUSED
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      JobStatus::Success | JobStatus::Buried | JobStatus::Paused
    )
  }

  /// 可被宿主认领的状态
  /// States a host may claim
  pub fn is_claimable(&self) -> bool {
    matches!(
      self,
      JobStatus::New | JobStatus::Failed | JobStatus::Unknown | JobStatus::Kick
    )
  }

  /// 仍在序列中占位的状态（未结束的任务）
  /// States that still hold a place in a sequence (unfinished jobs)
  pub fn is_outstanding(&self) -> bool {
    self.is_claimable() || *self == JobStatus::Busy
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|status| status.as_str().eq_ignore_ascii_case(s))
      .ok_or(())
  }
}

/// 任务执行选项
/// Job execution options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
  /// 最大重试次数，缺省时使用全局配置
  /// Maximum retries, the process-wide config applies when absent
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_retries: Option<u32>,
  /// 最大执行时间（秒）
  /// Maximum execution time in seconds
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_execution_time: Option<u64>,
  /// 其他由 worker 自行解释的选项
  /// Further options interpreted by the worker itself
  #[serde(flatten)]
  pub extra: Payload,
}

/// 任务实体
/// Job entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: Option<JobId>,
  pub group: Option<String>,
  pub worker: String,
  #[serde(default)]
  pub payload: Payload,
  #[serde(default)]
  pub options: JobOptions,
  pub status: JobStatus,
  pub priority: i32,
  pub retries: u32,
  pub sequence: Option<String>,
  pub run_at: DateTime<Utc>,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  /// 执行耗时（毫秒）
  /// Execution duration in milliseconds
  pub duration: Option<u64>,
  pub last_message: Option<String>,
  pub time_failed: Option<DateTime<Utc>>,
  pub host_name: Option<String>,
  pub pid: Option<u32>,
  pub locked_by: Option<String>,
  pub created_at: Option<DateTime<Utc>>,
}

impl Job {
  /// 创建新任务，worker 标识不能为空
  /// Create a new job, the worker identifier must not be blank
  pub fn new<S: Into<String>>(worker: S, payload: Payload) -> Result<Self> {
    let worker = worker.into();
    if worker.trim().is_empty() {
      return Err(Error::InvalidWorker { worker });
    }
    Ok(Self {
      id: None,
      group: None,
      worker,
      payload,
      options: JobOptions::default(),
      status: JobStatus::New,
      priority: DEFAULT_PRIORITY,
      retries: 0,
      sequence: None,
      run_at: Utc::now(),
      start_time: None,
      end_time: None,
      duration: None,
      last_message: None,
      time_failed: None,
      host_name: None,
      pid: None,
      locked_by: None,
      created_at: None,
    })
  }

  /// 使用可序列化的负载创建任务
  /// Create a job from any serializable payload
  pub fn new_with_json<S, T>(worker: S, payload: &T) -> Result<Self>
  where
    S: Into<String>,
    T: Serialize,
  {
    match serde_json::to_value(payload)? {
      serde_json::Value::Object(map) => Self::new(worker, map),
      serde_json::Value::Null => Self::new(worker, Payload::new()),
      other => Err(Error::other(format!(
        "Job payload must serialize to an object, got {other}"
      ))),
    }
  }

  pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
    self.group = Some(group.into());
    self
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_sequence<S: Into<String>>(mut self, sequence: S) -> Self {
    self.sequence = Some(sequence.into());
    self
  }

  pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
    self.run_at = run_at;
    self
  }

  /// 设置延迟执行
  /// Delay execution by the given duration
  pub fn with_delay(mut self, delay: Duration) -> Self {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    self.run_at = Utc::now()
      .checked_add_signed(delay)
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.options.max_retries = Some(max_retries);
    self
  }

  pub fn with_max_execution_time(mut self, max_execution_time: Duration) -> Self {
    self.options.max_execution_time = Some(max_execution_time.as_secs());
    self
  }

  pub fn with_option<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
    self.options.extra.insert(key.into(), value);
    self
  }

  /// 最大执行时间，未设置时为 25 分钟
  /// Maximum execution time, 25 minutes when unset
  pub fn max_execution_time(&self) -> Duration {
    Duration::from_secs(
      self
        .options
        .max_execution_time
        .unwrap_or(DEFAULT_MAX_EXECUTION_TIME.as_secs()),
    )
  }

  /// 读取负载中的字段
  /// Read a field of the payload
  pub fn payload_value(&self, key: &str) -> Option<&serde_json::Value> {
    self.payload.get(key)
  }

  /// 将负载反序列化为具体类型
  /// Deserialize the payload into a concrete type
  pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(
      self.payload.clone(),
    ))?)
  }

  /// 构造发布到 broker 的消息，未持久化的任务没有消息
  /// Build the broker message, jobs that were never persisted have none
  pub fn message(&self) -> Option<JobMessage> {
    Some(JobMessage {
      id: self.id?,
      worker: self.worker.clone(),
      priority: self.priority,
      sequence: self.sequence.clone(),
      run_at: self.run_at,
    })
  }
}

/// 发布到 broker 的任务消息
/// Job message published to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
  pub id: JobId,
  pub worker: String,
  pub priority: i32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sequence: Option<String>,
  pub run_at: DateTime<Utc>,
}

impl JobMessage {
  pub fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn decode(data: &str) -> Result<Self> {
    Ok(serde_json::from_str(data)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn payload(value: serde_json::Value) -> Payload {
    match value {
      serde_json::Value::Object(map) => map,
      _ => Payload::new(),
    }
  }

  #[test]
  fn test_job_builder() {
    let job = Job::new("Mailer.Send", payload(json!({"to": "ops@example.com"})))
      .unwrap()
      .with_group("mail")
      .with_priority(10)
      .with_sequence("user-42")
      .with_max_retries(2)
      .with_max_execution_time(Duration::from_secs(60));

    assert_eq!(job.id, None);
    assert_eq!(job.status, JobStatus::New);
    assert_eq!(job.priority, 10);
    assert_eq!(job.group.as_deref(), Some("mail"));
    assert_eq!(job.sequence.as_deref(), Some("user-42"));
    assert_eq!(job.options.max_retries, Some(2));
    assert_eq!(job.max_execution_time(), Duration::from_secs(60));
    assert_eq!(
      job.payload_value("to"),
      Some(&json!("ops@example.com"))
    );
  }

  #[test]
  fn test_blank_worker_rejected() {
    assert!(matches!(
      Job::new("  ", Payload::new()),
      Err(Error::InvalidWorker { .. })
    ));
  }

  #[test]
  fn test_defaults() {
    let job = Job::new("Report.Build", Payload::new()).unwrap();
    assert_eq!(job.priority, DEFAULT_PRIORITY);
    assert_eq!(job.max_execution_time(), Duration::from_secs(25 * 60));
    assert!(job.message().is_none());
  }

  #[test]
  fn test_payload_as() {
    #[derive(Deserialize)]
    struct Report {
      year: i32,
    }
    let job = Job::new_with_json("Report.Build", &json!({"year": 2024})).unwrap();
    let report: Report = job.payload_as().unwrap();
    assert_eq!(report.year, 2024);

    assert!(Job::new_with_json("Report.Build", &json!([1, 2])).is_err());
  }

  #[test]
  fn test_status_codes() {
    assert_eq!(JobStatus::New.code(), 1);
    assert_eq!(JobStatus::Failed.code(), 6);
    assert_eq!(JobStatus::from_code(3), Some(JobStatus::Buried));
    assert_eq!(JobStatus::from_code(9), Some(JobStatus::Paused));
    assert_eq!(JobStatus::from_code(0), None);
    for status in JobStatus::ALL {
      assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
    }
    assert!("invalid".parse::<JobStatus>().is_err());
  }

  #[test]
  fn test_status_classes() {
    assert!(JobStatus::Success.is_terminal());
    assert!(JobStatus::Buried.is_terminal());
    assert!(JobStatus::Paused.is_terminal());
    assert!(!JobStatus::Failed.is_terminal());

    assert!(JobStatus::Kick.is_claimable());
    assert!(JobStatus::Unknown.is_claimable());
    assert!(!JobStatus::Busy.is_claimable());
    assert!(!JobStatus::TestJob.is_claimable());

    assert!(JobStatus::Busy.is_outstanding());
    assert!(!JobStatus::TestJob.is_outstanding());
  }

  #[test]
  fn test_message_serde() {
    let mut job = Job::new("Report.Build", Payload::new())
      .unwrap()
      .with_sequence("s");
    job.id = Some(12);
    let message = job.message().unwrap();
    let decoded = JobMessage::decode(&message.encode().unwrap()).unwrap();
    assert_eq!(decoded, message);
    assert_eq!(decoded.sequence.as_deref(), Some("s"));
  }

  #[test]
  fn test_status_serializes_upper_case() {
    assert_eq!(
      serde_json::to_string(&JobStatus::TestJob).unwrap(),
      "\"TEST_JOB\""
    );
  }
}
