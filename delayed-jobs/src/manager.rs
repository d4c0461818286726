//! 任务编排器
//! Job manager (orchestrator)
//!
//! 负责入队、加锁、执行、完成、失败与序列推进。编排器不缓存任何状态，
//! 每次操作都通过数据存储读写。
//! Owns enqueue, lock, execute, completion, failure and sequence advancement. The manager
//! caches nothing: every operation reads and writes through the datastore.

use crate::base::constants::MINIMUM_PRIORITY;
use crate::base::{Datastore, MessageBroker};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobStatus};
use crate::observer::JobObserver;
use crate::registry::WorkerRegistry;
use crate::result::JobResult;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// 一次入队的结果
/// Outcome of one enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
  /// 已发布到 broker
  /// Published to the broker
  Published,
  /// 序列中还有更早的任务，等待推进
  /// An earlier job of the sequence is still outstanding, waiting to advance
  Deferred,
  /// broker 被禁用或观察者否决，仅持久化
  /// Broker disabled or vetoed by an observer, persisted only
  Suppressed,
}

/// 重试退避（秒）：`base = 5 + r^4`，抖动为 `ceil(ln(base + rand(0, base)))`，随机正负
/// Retry backoff in seconds: `base = 5 + r^4`, jitter `ceil(ln(base + rand(0, base)))` with a random sign
pub fn backoff_delay<R: Rng + ?Sized>(retries: u32, rng: &mut R) -> i64 {
  let base = i64::from(retries).saturating_pow(4).saturating_add(5);
  let spread = rng.random_range(0..=base);
  let jitter = (base.saturating_add(spread) as f64).ln().ceil() as i64;
  if rng.random_bool(0.5) {
    base.saturating_add(jitter)
  } else {
    base - jitter
  }
}

/// 任务编排器
/// Job manager
pub struct Manager {
  datastore: Arc<dyn Datastore>,
  broker: Arc<dyn MessageBroker>,
  registry: Arc<WorkerRegistry>,
  observers: Vec<Arc<dyn JobObserver>>,
  config: ManagerConfig,
}

impl Manager {
  pub fn new(
    datastore: Arc<dyn Datastore>,
    broker: Arc<dyn MessageBroker>,
    registry: WorkerRegistry,
    config: ManagerConfig,
  ) -> Self {
    Self {
      datastore,
      broker,
      registry: Arc::new(registry),
      observers: Vec::new(),
      config,
    }
  }

  /// 追加观察者，按添加顺序通知
  /// Append an observer, notified in insertion order
  pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
    self.observers.push(observer);
    self
  }

  pub fn datastore(&self) -> &Arc<dyn Datastore> {
    &self.datastore
  }

  pub fn broker(&self) -> &Arc<dyn MessageBroker> {
    &self.broker
  }

  pub fn registry(&self) -> &WorkerRegistry {
    &self.registry
  }

  pub fn config(&self) -> &ManagerConfig {
    &self.config
  }

  /// 使用配置的默认优先级创建任务
  /// Create a job with the configured default priority
  pub fn new_job<S: Into<String>>(&self, worker: S, payload: crate::job::Payload) -> Result<Job> {
    Ok(Job::new(worker, payload)?.with_priority(self.config.default_priority))
  }

  fn clamp_priority(&self, priority: i32) -> i32 {
    priority
      .min(self.config.maximum_priority)
      .max(MINIMUM_PRIORITY)
  }

  /// 持久化任务并在未被序列阻塞时发布
  /// Persist the job and publish it unless its sequence blocks it
  pub async fn enqueue(&self, job: &mut Job) -> Result<EnqueueOutcome> {
    job.priority = self.clamp_priority(job.priority);
    self.persist(job).await.map_err(Self::persist_failed)?;

    if job.sequence.is_some() && self.datastore.currently_sequenced(job).await? {
      tracing::debug!(job_id = ?job.id, sequence = ?job.sequence, "job waits for its sequence");
      return Ok(EnqueueOutcome::Deferred);
    }

    self.push_to_broker(job, false).await
  }

  /// 批量入队
  /// Batch enqueue
  pub async fn enqueue_all(&self, jobs: &mut [Job]) -> Result<Vec<EnqueueOutcome>> {
    for job in jobs.iter_mut() {
      job.priority = self.clamp_priority(job.priority);
      for observer in &self.observers {
        observer.before_persist(job).await;
      }
    }

    let persisted = self
      .datastore
      .persist_jobs(jobs)
      .await
      .map_err(Self::persist_failed)?;
    for (job, stored) in jobs.iter_mut().zip(persisted) {
      *job = stored;
      for observer in &self.observers {
        observer.after_persist(job).await;
      }
    }

    let mut outcomes = Vec::with_capacity(jobs.len());
    for job in jobs.iter() {
      if job.sequence.is_some() && self.datastore.currently_sequenced(job).await? {
        outcomes.push(EnqueueOutcome::Deferred);
        continue;
      }
      outcomes.push(self.push_to_broker(job, true).await?);
    }

    if outcomes.contains(&EnqueueOutcome::Published) {
      self.broker.finish_batch().await.map_err(|e| {
        tracing::error!(error = %e, "broker is unavailable, batch has not been flushed");
        Error::enqueue(format!("Could not flush job batch: {e}"))
      })?;
    }
    Ok(outcomes)
  }

  /// 标记任务开始执行
  /// Mark a job as executing
  pub async fn lock(&self, job: &mut Job, host_name: Option<&str>) -> Result<()> {
    job.status = JobStatus::Busy;
    job.start_time = Some(Utc::now());
    job.host_name = host_name.map(str::to_string);
    job.pid = Some(std::process::id());
    self.persist(job).await
  }

  /// 执行任务对应的 worker
  /// Run the job's worker
  pub async fn execute(&self, job: &Job) -> Result<JobResult> {
    if !self.registry.contains(&job.worker) {
      return Err(Error::job_execute(format!(
        "Worker {} could not be resolved",
        job.worker
      )));
    }

    let mut result = None;
    for observer in &self.observers {
      if let Some(early) = observer.before_execute(job).await {
        result = Some(early);
        break;
      }
    }

    let mut result = match result {
      Some(result) => result,
      None => match self.registry.perform(job).await {
        Ok(output) => output.into_result(),
        Err(Error::NonRetryable { message }) => JobResult::success(message),
        Err(e) => return Err(e),
      },
    };

    for observer in &self.observers {
      if let Some(replacement) = observer.after_execute(job, &result).await {
        result = replacement;
      }
    }
    Ok(result)
  }

  /// 标记任务成功
  /// Mark a job as succeeded
  pub async fn completed(
    &self,
    job: &mut Job,
    message: Option<&str>,
    duration: Duration,
  ) -> Result<()> {
    if let Some(message) = message.filter(|m| !m.is_empty()) {
      job.last_message = Some(message.to_string());
    }
    job.status = JobStatus::Success;
    job.end_time = Some(Utc::now());
    job.duration = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    job.pid = None;

    if job.sequence.is_some() {
      self.enqueue_next_sequence(job).await.map(|_| ())
    } else {
      self.persist(job).await
    }
  }

  /// 记录失败：重试或埋葬
  /// Record a failure: retry or bury
  pub async fn failed(&self, job: &mut Job, message: &str, bury: bool) -> Result<()> {
    let max_retries = self.config.max_retries_for(job);
    job.retries = job.retries.saturating_add(1);
    job.status = if bury || job.retries >= max_retries {
      JobStatus::Buried
    } else {
      JobStatus::Failed
    };

    let now = Utc::now();
    let delay = backoff_delay(job.retries, &mut rand::rng());
    job.run_at = chrono::Duration::try_seconds(delay)
      .and_then(|delay| now.checked_add_signed(delay))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    job.last_message = Some(message.to_string());
    job.time_failed = Some(now);
    job.pid = None;

    tracing::warn!(
      job_id = ?job.id,
      retries = job.retries,
      max_retries,
      status = %job.status,
      "job failed: {message}"
    );

    match job.status {
      JobStatus::Failed => self.enqueue(job).await.map(|_| ()),
      _ if job.sequence.is_some() => self.enqueue_next_sequence(job).await.map(|_| ()),
      _ => self.persist(job).await,
    }
  }

  /// 暂停任务，不再重试
  /// Pause a job, it is not retried
  pub async fn pause(&self, job: &mut Job, message: &str) -> Result<()> {
    job.status = JobStatus::Paused;
    job.last_message = Some(message.to_string());
    job.end_time = Some(Utc::now());
    job.pid = None;

    if job.sequence.is_some() {
      self.enqueue_next_sequence(job).await.map(|_| ())
    } else {
      self.persist(job).await
    }
  }

  /// 重新排队已埋葬或暂停的任务
  /// Re-queue a buried or paused job
  pub async fn kick(&self, id: JobId) -> Result<Job> {
    let mut job = self.fetch_job(id).await?;
    if !matches!(job.status, JobStatus::Buried | JobStatus::Paused) {
      return Err(Error::InvalidState {
        id,
        status: job.status,
      });
    }
    job.status = JobStatus::Kick;
    job.retries = 0;
    job.run_at = Utc::now();
    job.locked_by = None;
    self.enqueue(&mut job).await?;
    tracing::info!(job_id = id, "job kicked");
    Ok(job)
  }

  /// 以新任务的形式在 `run_at` 再次执行
  /// Run the job again at `run_at` as a fresh job
  pub async fn recur(&self, job: &Job, run_at: DateTime<Utc>) -> Result<Job> {
    let mut next = job.clone();
    next.id = None;
    next.status = JobStatus::New;
    next.retries = 0;
    next.run_at = run_at;
    next.start_time = None;
    next.end_time = None;
    next.duration = None;
    next.last_message = None;
    next.time_failed = None;
    next.host_name = None;
    next.pid = None;
    next.locked_by = None;
    next.created_at = None;
    self.enqueue(&mut next).await?;
    Ok(next)
  }

  /// 持久化当前任务并发布序列中的下一个任务
  /// Persist the current job and publish the next job of its sequence
  pub async fn enqueue_next_sequence(&self, job: &mut Job) -> Result<Option<Job>> {
    self.persist(job).await?;
    match self.datastore.fetch_next_sequence(job).await? {
      Some(next) => {
        tracing::debug!(job_id = ?job.id, next_id = ?next.id, "advancing sequence");
        self.push_to_broker(&next, false).await?;
        Ok(Some(next))
      }
      None => Ok(None),
    }
  }

  pub async fn fetch_job(&self, id: JobId) -> Result<Job> {
    self.datastore.fetch_job(id).await
  }

  /// 查询状态，没有记录时为 UNKNOWN
  /// Query the status, UNKNOWN when there is no record
  pub async fn get_status(&self, id: JobId) -> Result<JobStatus> {
    match self.datastore.fetch_job(id).await {
      Ok(job) => Ok(job.status),
      Err(Error::JobNotFound { .. }) => Ok(JobStatus::Unknown),
      Err(e) => Err(e),
    }
  }

  pub async fn is_similar_job(&self, job: &Job) -> Result<bool> {
    self.datastore.is_similar_job(job).await
  }

  async fn persist(&self, job: &mut Job) -> Result<()> {
    for observer in &self.observers {
      observer.before_persist(job).await;
    }
    *job = self.datastore.persist_job(job).await?;
    for observer in &self.observers {
      observer.after_persist(job).await;
    }
    Ok(())
  }

  async fn push_to_broker(&self, job: &Job, batch: bool) -> Result<EnqueueOutcome> {
    let Some(message) = job.message() else {
      return Err(Error::enqueue("Job has not been persisted"));
    };

    if self.config.broker_disabled {
      return Ok(EnqueueOutcome::Suppressed);
    }

    for observer in &self.observers {
      if !observer.before_queue(job).await {
        tracing::debug!(job_id = message.id, "publish vetoed by observer");
        return Ok(EnqueueOutcome::Suppressed);
      }
    }

    if let Err(e) = self.broker.publish_job(&message, batch).await {
      tracing::error!(job_id = message.id, error = %e, "broker is unavailable, job has not been queued");
      return Err(Error::enqueue(format!(
        "Could not push job {} to the broker: {e}",
        message.id
      )));
    }

    for observer in &self.observers {
      observer.after_queue(job).await;
    }
    Ok(EnqueueOutcome::Published)
  }

  fn persist_failed(err: Error) -> Error {
    match err {
      Error::Enqueue { .. } => err,
      other => Error::enqueue(format!("Job could not be persisted: {other}")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::rngs::StdRng;
  use rand::SeedableRng;

  #[test]
  fn test_backoff_bounds() {
    let mut rng = StdRng::seed_from_u64(7);
    for retries in 1..=5u32 {
      let base = 5 + i64::from(retries).pow(4);
      let max_jitter = ((2 * base) as f64).ln().ceil() as i64;
      for _ in 0..200 {
        let delay = backoff_delay(retries, &mut rng);
        assert!(delay >= base - max_jitter, "r={retries} delay={delay}");
        assert!(delay <= base + max_jitter, "r={retries} delay={delay}");
        assert!(delay > 0);
      }
    }
  }

  #[test]
  fn test_backoff_jitter_is_never_zero() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..200 {
      let delay = backoff_delay(1, &mut rng);
      assert_ne!(delay, 6);
    }
  }

  #[test]
  fn test_backoff_saturates() {
    let mut rng = StdRng::seed_from_u64(3);
    assert!(backoff_delay(u32::MAX, &mut rng) > 0);
  }
}
