//! Worker 注册表
//! Worker registry
//!
//! 把任务的 worker 标识解析为已注册的 worker，启动时构建一次
//! Resolves a job's worker identifier to a registered worker, built once at startup
//!
//! ## Pattern Matching / 模式匹配
//!
//! - Exact match / 精确匹配: `"Mailer.Send"` matches only "Mailer.Send"
//! - Prefix wildcard / 前缀通配符: `"Mailer.*"` matches every worker starting with "Mailer."
//! - Catch-all / 捕获所有: `"*"` matches any worker
//!
//! ```rust,no_run
//! use delayed_jobs::registry::WorkerRegistry;
//! use delayed_jobs::result::JobResult;
//! use delayed_jobs::job::Job;
//!
//! let mut registry = WorkerRegistry::new();
//! registry.register_fn("Mailer.Send", |job: &Job| {
//!     Ok(JobResult::success(format!("sent job {:?}", job.id)))
//! });
//! registry.register_async_fn("Reports.*", |job: Job| async move {
//!     Ok(format!("built {}", job.worker))
//! });
//! ```

use crate::base::BoxFuture;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::result::JobResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// worker 能力：执行一个任务
/// Worker capability: perform one job
#[async_trait]
pub trait Worker: Send + Sync {
  /// 执行任务，返回结果或普通值；`Error::NonRetryable` 视为成功
  /// Perform the job, returning a result or a plain value; `Error::NonRetryable` counts as success
  async fn perform(&self, job: &Job) -> Result<WorkerOutput>;
}

/// worker 的返回值
/// What a worker returns
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
  Result(JobResult),
  /// 普通值，按成功处理并作为消息
  /// Plain value, treated as a success carrying it as the message
  Value(String),
}

impl WorkerOutput {
  pub fn into_result(self) -> JobResult {
    match self {
      WorkerOutput::Result(result) => result,
      WorkerOutput::Value(value) => JobResult::success(value),
    }
  }
}

impl From<JobResult> for WorkerOutput {
  fn from(result: JobResult) -> Self {
    WorkerOutput::Result(result)
  }
}

impl From<String> for WorkerOutput {
  fn from(value: String) -> Self {
    WorkerOutput::Value(value)
  }
}

impl From<&str> for WorkerOutput {
  fn from(value: &str) -> Self {
    WorkerOutput::Value(value.to_string())
  }
}

impl From<()> for WorkerOutput {
  fn from(_: ()) -> Self {
    WorkerOutput::Value(String::new())
  }
}

/// worker 包装器，用于存储不同类型的 worker
/// Worker wrapper for storing different kinds of workers
#[derive(Clone)]
enum WorkerEntry {
  Shared(Arc<dyn Worker>),
  Sync(Arc<dyn Fn(&Job) -> Result<WorkerOutput> + Send + Sync>),
  Async(Arc<dyn Fn(Job) -> BoxFuture<Result<WorkerOutput>> + Send + Sync>),
}

impl WorkerEntry {
  async fn perform(&self, job: &Job) -> Result<WorkerOutput> {
    match self {
      WorkerEntry::Shared(worker) => worker.perform(job).await,
      WorkerEntry::Sync(func) => func(job),
      WorkerEntry::Async(func) => func(job.clone()).await,
    }
  }
}

/// 检查 worker 标识是否匹配模式
/// Check whether a worker identifier matches a pattern
fn pattern_matches(pattern: &str, worker: &str) -> bool {
  if pattern == "*" {
    return true;
  }

  match pattern.strip_suffix('*') {
    Some(prefix) if !prefix.contains('*') => worker.starts_with(prefix),
    _ => pattern == worker,
  }
}

/// Worker 注册表
/// Worker registry
#[derive(Default, Clone)]
pub struct WorkerRegistry {
  workers: HashMap<String, WorkerEntry>,
}

impl WorkerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// 注册实现了 [`Worker`] 的类型
  /// Register a type implementing [`Worker`]
  pub fn register<W>(&mut self, identifier: &str, worker: W)
  where
    W: Worker + 'static,
  {
    self
      .workers
      .insert(identifier.to_string(), WorkerEntry::Shared(Arc::new(worker)));
  }

  /// 注册同步函数
  /// Register a synchronous function
  pub fn register_fn<F, O>(&mut self, identifier: &str, func: F)
  where
    F: Fn(&Job) -> Result<O> + Send + Sync + 'static,
    O: Into<WorkerOutput>,
  {
    self.workers.insert(
      identifier.to_string(),
      WorkerEntry::Sync(Arc::new(move |job: &Job| func(job).map(Into::into))),
    );
  }

  /// 注册异步函数
  /// Register an asynchronous function
  pub fn register_async_fn<F, Fut, O>(&mut self, identifier: &str, func: F)
  where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
    O: Into<WorkerOutput>,
  {
    let func = Arc::new(func);
    self.workers.insert(
      identifier.to_string(),
      WorkerEntry::Async(Arc::new(move |job: Job| {
        let func = Arc::clone(&func);
        Box::pin(async move { func(job).await.map(Into::into) })
      })),
    );
  }

  /// 精确匹配优先，其次是最长的前缀模式
  /// Exact match first, then the longest prefix pattern
  fn find(&self, worker: &str) -> Option<&WorkerEntry> {
    if let Some(entry) = self.workers.get(worker) {
      return Some(entry);
    }

    self
      .workers
      .iter()
      .filter(|(pattern, _)| pattern_matches(pattern, worker))
      .max_by_key(|(pattern, _)| pattern.len())
      .map(|(_, entry)| entry)
  }

  pub fn contains(&self, worker: &str) -> bool {
    self.find(worker).is_some()
  }

  pub fn identifiers(&self) -> Vec<&str> {
    let mut identifiers: Vec<&str> = self.workers.keys().map(String::as_str).collect();
    identifiers.sort_unstable();
    identifiers
  }

  pub fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  /// 调用任务对应的 worker，未注册时返回 `Error::JobExecute`
  /// Invoke the job's worker, `Error::JobExecute` when it is not registered
  pub async fn perform(&self, job: &Job) -> Result<WorkerOutput> {
    match self.find(&job.worker) {
      Some(entry) => entry.perform(job).await,
      None => Err(Error::job_execute(format!(
        "Worker {} could not be resolved",
        job.worker
      ))),
    }
  }
}
