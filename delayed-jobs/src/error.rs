//! 错误处理模块
//! Error handling module
//!
//! 定义了 delayed-jobs 库中使用的各种错误类型
//! Defines the error types used across the delayed-jobs library

use crate::job::{JobId, JobStatus};
use thiserror::Error;

/// delayed-jobs 库的结果类型
/// Result type for the delayed-jobs library
pub type Result<T> = std::result::Result<T, Error>;

/// delayed-jobs 错误类型
/// delayed-jobs error type
#[derive(Error, Debug)]
pub enum Error {
  /// Redis connection error
  #[error("Redis connection error: {0}")]
  Redis(#[from] redis::RedisError),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// IO 错误
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// 持久化错误
  /// Persistence error
  #[error("Persistence error: {message}")]
  Persistence { message: String },

  /// 任务未找到错误
  /// Job not found error
  #[error("Job not found: {id}")]
  JobNotFound { id: JobId },

  /// 主机记录未找到
  /// Host record not found
  #[error("Host not found: {host_name} ({pid})")]
  HostNotFound { host_name: String, pid: u32 },

  /// 入队错误（持久化或发布失败）
  /// Enqueue error (persisting or publishing failed)
  #[error("Enqueue error: {message}")]
  Enqueue { message: String },

  /// 执行错误（例如 worker 未注册）
  /// Execution error (for example an unregistered worker)
  #[error("Job execute error: {message}")]
  JobExecute { message: String },

  /// worker 抛出的不可重试错误，按成功处理
  /// Non-retryable error raised by a worker, reported as a success
  #[error("Non-retryable: {message}")]
  NonRetryable { message: String },

  /// 无效的 worker 标识
  /// Invalid worker identifier
  #[error("Invalid worker identifier: {worker:?}")]
  InvalidWorker { worker: String },

  /// 当前状态不允许该操作
  /// The job's current status does not allow the operation
  #[error("Job {id} is {status}, operation not allowed")]
  InvalidState { id: JobId, status: JobStatus },

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// Broker 错误
  /// Broker error
  #[error("Broker error: {0}")]
  Broker(String),

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建持久化错误
  /// Create a persistence error
  pub fn persistence<S: Into<String>>(message: S) -> Self {
    Self::Persistence {
      message: message.into(),
    }
  }

  /// 创建入队错误
  /// Create an enqueue error
  pub fn enqueue<S: Into<String>>(message: S) -> Self {
    Self::Enqueue {
      message: message.into(),
    }
  }

  /// 创建执行错误
  /// Create a job execute error
  pub fn job_execute<S: Into<String>>(message: S) -> Self {
    Self::JobExecute {
      message: message.into(),
    }
  }

  /// 创建不可重试错误，worker 用它表示"放弃但视为成功"
  /// Create a non-retryable error, used by workers to give up while reporting success
  pub fn non_retryable<S: Into<String>>(message: S) -> Self {
    Self::NonRetryable {
      message: message.into(),
    }
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 创建 Broker 错误
  /// Create a broker error
  pub fn broker<S: Into<String>>(message: S) -> Self {
    Self::Broker(message.into())
  }

  /// 检查是否为重试错误
  /// Check if the error is retriable
  pub fn is_retriable(&self) -> bool {
    match self {
      Error::Redis(_) | Error::Io(_) | Error::Broker(_) => true,
      Error::Persistence { .. } => true,
      Error::Serialization(_)
      | Error::JobNotFound { .. }
      | Error::HostNotFound { .. }
      | Error::Enqueue { .. }
      | Error::JobExecute { .. }
      | Error::NonRetryable { .. }
      | Error::InvalidWorker { .. }
      | Error::InvalidState { .. }
      | Error::Config { .. }
      | Error::Other { .. } => false,
    }
  }
}
