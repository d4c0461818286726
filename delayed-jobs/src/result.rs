//! 执行结果模块
//! Execution result module
//!
//! worker 一次调用的结果：成功、失败或暂停
//! The outcome of one worker invocation: success, failure or pause

use crate::job::JobStatus;
use chrono::{DateTime, Utc};
use std::fmt;

/// worker 调用结果
/// Worker invocation result
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
  /// 成功，可附带一个再次执行的时间
  /// Success, optionally carrying a time to run again
  Success {
    message: String,
    recur: Option<DateTime<Utc>>,
  },
  /// 失败，`retry` 为 false 时直接埋葬
  /// Failure, buried immediately when `retry` is false
  Failed { message: String, retry: bool },
  /// 暂停，不重试
  /// Paused, never retried
  Pause { message: String },
}

impl JobResult {
  pub fn success<S: Into<String>>(message: S) -> Self {
    Self::Success {
      message: message.into(),
      recur: None,
    }
  }

  pub fn failed<S: Into<String>>(message: S) -> Self {
    Self::Failed {
      message: message.into(),
      retry: true,
    }
  }

  pub fn pause<S: Into<String>>(message: S) -> Self {
    Self::Pause {
      message: message.into(),
    }
  }

  /// 设置再次执行的时间，仅对成功结果生效
  /// Schedule a recurrence, only meaningful for a success
  pub fn with_recur(self, at: DateTime<Utc>) -> Self {
    match self {
      Self::Success { message, .. } => Self::Success {
        message,
        recur: Some(at),
      },
      other => other,
    }
  }

  /// 设置失败后是否重试
  /// Set whether a failure should be retried
  pub fn will_retry(self, retry: bool) -> Self {
    match self {
      Self::Failed { message, .. } => Self::Failed { message, retry },
      other => other,
    }
  }

  pub fn message(&self) -> &str {
    match self {
      Self::Success { message, .. } | Self::Failed { message, .. } | Self::Pause { message } => {
        message
      }
    }
  }

  pub fn retry(&self) -> bool {
    matches!(self, Self::Failed { retry: true, .. })
  }

  pub fn recur(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::Success { recur, .. } => *recur,
      _ => None,
    }
  }

  /// 结果对应的任务状态
  /// The job status this result leads to
  pub fn status(&self) -> JobStatus {
    match self {
      Self::Success { .. } => JobStatus::Success,
      Self::Failed { retry: true, .. } => JobStatus::Failed,
      Self::Failed { retry: false, .. } => JobStatus::Buried,
      Self::Pause { .. } => JobStatus::Paused,
    }
  }
}

impl From<String> for JobResult {
  fn from(message: String) -> Self {
    Self::success(message)
  }
}

impl From<&str> for JobResult {
  fn from(message: &str) -> Self {
    Self::success(message)
  }
}

impl fmt::Display for JobResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.status(), self.message())
  }
}
