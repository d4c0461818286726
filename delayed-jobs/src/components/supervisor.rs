//! 主机 supervisor
//! Host supervisor
//!
//! 每台主机一个的进程池控制循环：认领任务、启动 worker 进程、检查存活、强制超时、
//! 与存储对账，并在关闭时排空。
//! Per-host process-pool control loop: claims jobs, spawns worker processes, polls liveness,
//! enforces timeouts, reconciles with storage and drains on shutdown.
//!
//! 每一轮 (`tick`)：
//! Every iteration (`tick`):
//!
//! 1. 在未满且主机仍为 ACTIVE 时认领任务 / claim jobs while below capacity and the host is ACTIVE
//! 2. 检查在途任务 / check in-flight jobs
//! 3. 按间隔刷新主机记录 / refresh the host record on its interval
//! 4. 排空完成后退出 / exit once drained

use crate::base::constants::{CRASHED_MESSAGE, TIMEOUT_MESSAGE};
use crate::base::{Host, HostStatus, HostStore};
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use crate::manager::Manager;
use crate::process::{ProcessHandle, ProcessSpawner};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 循环控制
/// Loop control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
  Continue,
  Exit,
}

/// 在途任务
/// In-flight job
pub struct RunningJob {
  pub job_id: JobId,
  pub pid: Option<u32>,
  pub started: Instant,
  pub max_execution_time: Duration,
  pub sequence: Option<String>,
  handle: Box<dyn ProcessHandle>,
}

impl std::fmt::Debug for RunningJob {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RunningJob")
      .field("job_id", &self.job_id)
      .field("pid", &self.pid)
      .field("started", &self.started)
      .field("max_execution_time", &self.max_execution_time)
      .field("sequence", &self.sequence)
      .finish()
  }
}

/// 主机 supervisor
/// Host supervisor
pub struct HostSupervisor {
  manager: Arc<Manager>,
  hosts: Arc<dyn HostStore>,
  spawner: Arc<dyn ProcessSpawner>,
  config: SupervisorConfig,
  host: Host,
  worker_id: String,
  worker_count: usize,
  running: HashMap<JobId, RunningJob>,
  last_refresh: Option<Instant>,
  cancel: CancellationToken,
}

impl HostSupervisor {
  pub fn new(
    manager: Arc<Manager>,
    hosts: Arc<dyn HostStore>,
    spawner: Arc<dyn ProcessSpawner>,
    config: SupervisorConfig,
  ) -> Self {
    let host_name = hostname::get()
      .map(|name| name.to_string_lossy().to_string())
      .unwrap_or_else(|_| "localhost".to_string());
    let mut host = Host::new(host_name, std::process::id(), config.worker_name.clone());
    host.worker_count = config.worker_count.unwrap_or(1);
    let worker_id = host.worker_id();
    let worker_count = host.worker_count;
    Self {
      manager,
      hosts,
      spawner,
      config,
      host,
      worker_id,
      worker_count,
      running: HashMap::new(),
      last_refresh: None,
      cancel: CancellationToken::new(),
    }
  }

  /// 覆盖主机名与 pid
  /// Override the host name and pid
  pub fn with_identity<S: Into<String>>(mut self, host_name: S, pid: u32) -> Self {
    self.host.host_name = host_name.into();
    self.host.pid = pid;
    self.worker_id = self.host.worker_id();
    self
  }

  /// 取消令牌，取消后按 SHUTDOWN 排空
  /// Cancellation token, cancelling drains like SHUTDOWN
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  pub fn host(&self) -> &Host {
    &self.host
  }

  pub fn running(&self) -> impl Iterator<Item = &RunningJob> {
    self.running.values()
  }

  pub fn running_len(&self) -> usize {
    self.running.len()
  }

  pub fn is_running(&self, id: JobId) -> bool {
    self.running.contains_key(&id)
  }

  fn is_draining(&self) -> bool {
    self.host.is_draining() || self.cancel.is_cancelled()
  }

  /// 注册主机记录并接管本池名下遗留的 BUSY 任务
  /// Register the host record and adopt BUSY jobs left under this pool
  pub async fn boot(&mut self) -> Result<()> {
    match self
      .hosts
      .fetch_host(&self.host.host_name, self.host.pid)
      .await?
    {
      Some(existing) => {
        self.host = existing;
        self.update_worker_count();
      }
      None => self.hosts.register_host(&self.host).await?,
    }
    self.last_refresh = Some(Instant::now());

    let adopted = self
      .manager
      .datastore()
      .running_by_host(&self.worker_id)
      .await?;
    for mut job in adopted {
      let Some(id) = job.id else {
        continue;
      };
      match job.pid {
        Some(pid) => {
          tracing::info!(job_id = id, pid, "adopting running job");
          let handle = self.spawner.attach(pid);
          self.track(&job, handle);
        }
        None => {
          // claimed before the previous supervisor exited, never started
          tracing::warn!(job_id = id, "releasing job claimed without a worker process");
          self.manager.failed(&mut job, CRASHED_MESSAGE, false).await?;
        }
      }
    }

    tracing::info!(
      worker_id = %self.worker_id,
      workers = self.worker_count,
      adopted = self.running.len(),
      "host supervisor started"
    );
    Ok(())
  }

  /// 运行循环直到排空，然后删除主机记录
  /// Run the loop until drained, then delete the host record
  pub async fn run(mut self) -> Result<()> {
    self.boot().await?;
    loop {
      match self.tick().await {
        Ok(LoopControl::Exit) => break,
        Ok(LoopControl::Continue) => {}
        Err(e) => tracing::error!(error = %e, "supervisor iteration failed"),
      }
      tokio::select! {
        _ = tokio::time::sleep(self.config.poll_interval) => {}
        _ = self.cancel.cancelled(), if !self.cancel.is_cancelled() => {}
      }
    }
    self
      .hosts
      .delete_host(&self.host.host_name, self.host.pid)
      .await?;
    tracing::info!(worker_id = %self.worker_id, "host supervisor stopped");
    Ok(())
  }

  /// 执行一轮循环
  /// Run one iteration
  pub async fn tick(&mut self) -> Result<LoopControl> {
    let mut attempts = 0;
    while self.running.len() < self.worker_count
      && !self.is_draining()
      && attempts < self.worker_count
    {
      attempts += 1;
      match self.start_worker().await {
        Ok(true) => {}
        Ok(false) => break,
        Err(e) => {
          tracing::warn!(error = %e, "could not start a worker");
          break;
        }
      }
    }

    self.check_running().await;

    let refresh_due = self
      .last_refresh
      .map_or(true, |at| at.elapsed() >= self.config.update_interval);
    if refresh_due {
      if let Err(e) = self.refresh_host().await {
        tracing::warn!(error = %e, "could not refresh host record");
      }
    }

    let shutting_down = self.host.status == HostStatus::Shutdown || self.cancel.is_cancelled();
    if shutting_down && self.running.is_empty() {
      return Ok(LoopControl::Exit);
    }
    Ok(LoopControl::Continue)
  }

  /// 认领并启动一个任务，没有可认领的任务时返回 false
  /// Claim and start one job, false when nothing could be claimed
  async fn start_worker(&mut self) -> Result<bool> {
    let Some(job) = self.claim().await? else {
      return Ok(false);
    };
    let Some(id) = job.id else {
      return Ok(false);
    };

    match self.spawner.spawn(id).await {
      Ok(handle) => {
        tracing::info!(job_id = id, pid = ?handle.pid(), worker = %job.worker, "worker process started");
        self.track(&job, handle);
        Ok(true)
      }
      Err(e) => {
        tracing::error!(job_id = id, error = %e, "could not spawn worker process");
        let mut job = job;
        self
          .manager
          .failed(&mut job, &format!("Could not start worker process: {e}"), false)
          .await?;
        Ok(false)
      }
    }
  }

  /// 条件更新 + 等待 + 校验；校验失败时静默放弃
  /// Conditional update + grace + verification; abandons silently on mismatch
  async fn claim(&mut self) -> Result<Option<Job>> {
    let datastore = self.manager.datastore();
    let exclude_ids: Vec<JobId> = self.running.keys().copied().collect();
    let exclude_sequences: Vec<String> = self
      .running
      .values()
      .filter_map(|running| running.sequence.clone())
      .collect();

    let Some(candidate) = datastore
      .next_open_job(&exclude_ids, &exclude_sequences)
      .await?
    else {
      return Ok(None);
    };
    let Some(id) = candidate.id else {
      return Ok(None);
    };

    if datastore.claim_job(id, &self.worker_id).await?.is_none() {
      tracing::debug!(job_id = id, "job was claimed elsewhere");
      return Ok(None);
    }

    tokio::time::sleep(self.config.claim_grace).await;

    let job = datastore.fetch_job(id).await?;
    if job.status != JobStatus::Busy || job.locked_by.as_deref() != Some(self.worker_id.as_str()) {
      tracing::debug!(job_id = id, locked_by = ?job.locked_by, "claim lost during grace period");
      return Ok(None);
    }
    Ok(Some(job))
  }

  fn track(&mut self, job: &Job, handle: Box<dyn ProcessHandle>) {
    let Some(id) = job.id else {
      return;
    };
    let max_execution_time = job
      .options
      .max_execution_time
      .map(Duration::from_secs)
      .unwrap_or(self.config.default_max_execution_time);
    self.running.insert(
      id,
      RunningJob {
        job_id: id,
        pid: handle.pid().or(job.pid),
        started: Instant::now(),
        max_execution_time,
        sequence: job.sequence.clone(),
        handle,
      },
    );
  }

  /// 检查在途任务：超时强杀，进程退出后与存储对账
  /// Check in-flight jobs: kill on timeout, reconcile with storage once the process is gone
  async fn check_running(&mut self) {
    let ids: Vec<JobId> = self.running.keys().copied().collect();
    for id in ids {
      if let Err(e) = self.check_job(id).await {
        tracing::warn!(job_id = id, error = %e, "could not check running job");
      }
    }
  }

  async fn check_job(&mut self, id: JobId) -> Result<()> {
    let Some(running) = self.running.get_mut(&id) else {
      return Ok(());
    };

    if running.handle.is_running() {
      if running.started.elapsed() <= running.max_execution_time {
        return Ok(());
      }
      tracing::warn!(job_id = id, pid = ?running.pid, "job ran too long, killing it");
      running.handle.kill().await?;
      let mut job = self.manager.fetch_job(id).await?;
      self.manager.failed(&mut job, TIMEOUT_MESSAGE, false).await?;
      self.running.remove(&id);
      return Ok(());
    }

    let job = self.manager.fetch_job(id).await?;
    let owned = job.locked_by.as_deref() == Some(self.worker_id.as_str());
    match (job.pid, job.status) {
      (None, JobStatus::Busy) if owned => {
        // exited before locking, nothing else will release it
        tracing::warn!(job_id = id, "worker process exited before locking the job");
        let mut job = job;
        self.manager.failed(&mut job, CRASHED_MESSAGE, false).await?;
      }
      (None, _) => {
        tracing::debug!(job_id = id, status = %job.status, "worker process finished");
      }
      (Some(_), JobStatus::Busy) => {
        tracing::warn!(job_id = id, "worker process died while the job was busy");
        let mut job = job;
        self.manager.failed(&mut job, CRASHED_MESSAGE, false).await?;
      }
      (Some(_), status) => {
        tracing::debug!(job_id = id, %status, "worker process gone");
      }
    }
    self.running.remove(&id);
    Ok(())
  }

  /// 刷新主机记录并重新计算 worker 数
  /// Refresh the host record and re-derive the worker count
  async fn refresh_host(&mut self) -> Result<()> {
    self.last_refresh = Some(Instant::now());
    match self
      .hosts
      .fetch_host(&self.host.host_name, self.host.pid)
      .await?
    {
      Some(host) => {
        if host.status != self.host.status {
          tracing::info!(worker_id = %self.worker_id, status = %host.status, "host status changed");
        }
        self.host = host;
      }
      None => {
        tracing::warn!(worker_id = %self.worker_id, "host record missing, registering again");
        self.hosts.register_host(&self.host).await?;
      }
    }
    self.update_worker_count();
    Ok(())
  }

  fn update_worker_count(&mut self) {
    self.worker_count = self
      .config
      .worker_count
      .unwrap_or(self.host.worker_count)
      .max(1);
  }
}
