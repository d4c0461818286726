//! 生命周期观察者
//! Lifecycle observers
//!
//! 编排器在构造时接收一个有序的观察者列表，在执行、持久化和发布前后通知它们
//! The manager receives an ordered list of observers at construction and notifies them
//! around execution, persistence and publishing

use crate::job::Job;
use crate::result::JobResult;
use async_trait::async_trait;

/// 任务生命周期观察者，所有方法都有空实现
/// Job lifecycle observer, every method has a no-op default
#[async_trait]
pub trait JobObserver: Send + Sync {
  /// 执行前调用，返回 `Some` 时跳过 worker 并使用该结果
  /// Called before execution, returning `Some` skips the worker and uses that result
  async fn before_execute(&self, _job: &Job) -> Option<JobResult> {
    None
  }

  /// 执行后调用，返回 `Some` 时覆盖结果
  /// Called after execution, returning `Some` overrides the result
  async fn after_execute(&self, _job: &Job, _result: &JobResult) -> Option<JobResult> {
    None
  }

  async fn before_persist(&self, _job: &Job) {}

  async fn after_persist(&self, _job: &Job) {}

  /// 发布前调用，返回 false 时不发布
  /// Called before publishing, returning false suppresses the publish
  async fn before_queue(&self, _job: &Job) -> bool {
    true
  }

  async fn after_queue(&self, _job: &Job) {}
}

/// 把生命周期事件写入 tracing 的观察者
/// Observer that writes lifecycle events to tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

#[async_trait]
impl JobObserver for TracingObserver {
  async fn before_execute(&self, job: &Job) -> Option<JobResult> {
    tracing::debug!(job_id = ?job.id, worker = %job.worker, "executing job");
    None
  }

  async fn after_execute(&self, job: &Job, result: &JobResult) -> Option<JobResult> {
    tracing::debug!(job_id = ?job.id, worker = %job.worker, result = %result, "job executed");
    None
  }

  async fn after_queue(&self, job: &Job) {
    tracing::debug!(job_id = ?job.id, run_at = %job.run_at, "job queued");
  }
}
