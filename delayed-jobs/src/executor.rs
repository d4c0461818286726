//! Worker 执行器
//! Worker executor
//!
//! 单个任务的调用包装：读取任务、防止重复执行、调用 worker 并上报结果
//! Per-job invocation wrapper: load the job, guard against re-execution, invoke the worker,
//! report the outcome

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobStatus};
use crate::manager::Manager;
use crate::result::JobResult;
use std::sync::Arc;
use std::time::Instant;

/// 一次执行的结果
/// Outcome of one execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
  /// 任务不存在
  /// The job does not exist
  NotFound(JobId),
  /// 已成功或已埋葬且未强制执行
  /// Already succeeded or buried and not forced
  Refused { id: JobId, status: JobStatus },
  Completed(Job),
  Failed(Job),
  Paused(Job),
}

impl ExecutionOutcome {
  /// 进程退出码：0 已执行，1 不存在，2 之前已成功，3 已埋葬
  /// Process exit code: 0 executed, 1 missing, 2 previously succeeded, 3 buried
  pub fn exit_code(&self) -> i32 {
    match self {
      ExecutionOutcome::NotFound(_) => 1,
      ExecutionOutcome::Refused {
        status: JobStatus::Success,
        ..
      } => 2,
      ExecutionOutcome::Refused { .. } => 3,
      _ => 0,
    }
  }

  pub fn job(&self) -> Option<&Job> {
    match self {
      ExecutionOutcome::Completed(job)
      | ExecutionOutcome::Failed(job)
      | ExecutionOutcome::Paused(job) => Some(job),
      _ => None,
    }
  }
}

/// Worker 执行器
/// Worker executor
pub struct WorkerExecutor {
  manager: Arc<Manager>,
  host_name: Option<String>,
}

impl WorkerExecutor {
  pub fn new(manager: Arc<Manager>) -> Self {
    let host_name = hostname::get()
      .ok()
      .map(|name| name.to_string_lossy().to_string());
    Self { manager, host_name }
  }

  pub fn with_host_name<S: Into<String>>(mut self, host_name: S) -> Self {
    self.host_name = Some(host_name.into());
    self
  }

  pub fn manager(&self) -> &Arc<Manager> {
    &self.manager
  }

  pub fn host_name(&self) -> Option<&str> {
    self.host_name.as_deref()
  }

  /// 按 id 执行任务
  /// Execute a job by id
  pub async fn run(&self, id: JobId, force: bool) -> Result<ExecutionOutcome> {
    let job = match self.manager.fetch_job(id).await {
      Ok(job) => job,
      Err(Error::JobNotFound { .. }) => {
        tracing::warn!(job_id = id, "job not found");
        return Ok(ExecutionOutcome::NotFound(id));
      }
      Err(e) => return Err(e),
    };
    self.run_job(job, force).await
  }

  /// 执行已读取的任务
  /// Execute an already loaded job
  pub async fn run_job(&self, mut job: Job, force: bool) -> Result<ExecutionOutcome> {
    let id = job
      .id
      .ok_or_else(|| Error::job_execute("Job has not been persisted"))?;

    if !force && matches!(job.status, JobStatus::Success | JobStatus::Buried) {
      tracing::warn!(job_id = id, status = %job.status, "job already finished, use force to run it again");
      return Ok(ExecutionOutcome::Refused {
        id,
        status: job.status,
      });
    }

    self.manager.lock(&mut job, self.host_name.as_deref()).await?;
    tracing::info!(job_id = id, worker = %job.worker, "job started");

    let started = Instant::now();
    let manager = Arc::clone(&self.manager);
    let snapshot = job.clone();
    let result = tokio::spawn(async move { manager.execute(&snapshot).await }).await;
    let duration = started.elapsed();

    let result = match result {
      Ok(result) => result,
      Err(join_error) => Err(Error::job_execute(format!("worker panicked: {join_error}"))),
    };

    match result {
      Ok(JobResult::Success { message, recur }) => {
        self
          .manager
          .completed(&mut job, Some(&message), duration)
          .await?;
        tracing::info!(job_id = id, duration_ms = duration.as_millis() as u64, "job completed");
        if let Some(at) = recur {
          let next = self.manager.recur(&job, at).await?;
          tracing::info!(job_id = id, next_id = ?next.id, run_at = %at, "job scheduled to recur");
        }
        Ok(ExecutionOutcome::Completed(job))
      }
      Ok(JobResult::Failed { message, retry }) => {
        self.manager.failed(&mut job, &message, !retry).await?;
        Ok(ExecutionOutcome::Failed(job))
      }
      Ok(JobResult::Pause { message }) => {
        self.manager.pause(&mut job, &message).await?;
        tracing::info!(job_id = id, "job paused");
        Ok(ExecutionOutcome::Paused(job))
      }
      Err(e) => {
        self.manager.failed(&mut job, &e.to_string(), false).await?;
        Ok(ExecutionOutcome::Failed(job))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exit_codes() {
    assert_eq!(ExecutionOutcome::NotFound(1).exit_code(), 1);
    assert_eq!(
      ExecutionOutcome::Refused {
        id: 1,
        status: JobStatus::Success
      }
      .exit_code(),
      2
    );
    assert_eq!(
      ExecutionOutcome::Refused {
        id: 1,
        status: JobStatus::Buried
      }
      .exit_code(),
      3
    );
  }
}
