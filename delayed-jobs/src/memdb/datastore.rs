//! 内存数据存储实现
//! Memory datastore implementation
//!
//! 使用内存数据结构实现任务与主机记录的存储，不依赖任何外部服务
//! Stores jobs and host records in memory without any external service dependencies

use crate::base::{Datastore, Host, HostStore};
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 内存存储状态
/// In-memory storage state
#[derive(Default)]
struct MemoryStorage {
  /// 任务，按 id 排序
  /// Jobs ordered by id
  jobs: BTreeMap<JobId, Job>,
  last_id: JobId,
  hosts: HashMap<(String, u32), Host>,
  /// 模拟存储不可用
  /// Simulated outage
  unavailable: bool,
}

impl MemoryStorage {
  fn check_available(&self) -> Result<()> {
    if self.unavailable {
      return Err(Error::persistence("memory datastore is unavailable"));
    }
    Ok(())
  }

  fn store(&mut self, job: &Job) -> Job {
    let mut stored = job.clone();
    let id = match stored.id {
      Some(id) => id,
      None => {
        self.last_id += 1;
        self.last_id
      }
    };
    stored.id = Some(id);
    if stored.created_at.is_none() {
      stored.created_at = Some(Utc::now());
    }
    self.jobs.insert(id, stored.clone());
    stored
  }

  /// 同序列中 id 更小的未结束任务
  /// Unfinished job of the same sequence with a lower id
  fn has_earlier_sibling(&self, sequence: &str, id: Option<JobId>) -> bool {
    self.jobs.values().any(|other| {
      other.sequence.as_deref() == Some(sequence)
        && other.status.is_outstanding()
        && match (other.id, id) {
          (Some(other_id), Some(id)) => other_id < id,
          _ => true,
        }
    })
  }
}

/// 内存数据存储
/// Memory datastore
#[derive(Clone, Default)]
pub struct MemoryDatastore {
  storage: Arc<RwLock<MemoryStorage>>,
}

impl MemoryDatastore {
  pub fn new() -> Self {
    Self::default()
  }

  /// 切换模拟的不可用状态，所有写入都会失败
  /// Toggle the simulated outage, every write fails while it is set
  pub async fn set_unavailable(&self, unavailable: bool) {
    self.storage.write().await.unavailable = unavailable;
  }

  /// 直接修改一条任务记录
  /// Modify a job record in place
  pub async fn update<F>(&self, id: JobId, update: F) -> Result<Job>
  where
    F: FnOnce(&mut Job),
  {
    let mut storage = self.storage.write().await;
    let job = storage.jobs.get_mut(&id).ok_or(Error::JobNotFound { id })?;
    update(job);
    Ok(job.clone())
  }

  pub async fn jobs(&self) -> Vec<Job> {
    self.storage.read().await.jobs.values().cloned().collect()
  }

  pub async fn len(&self) -> usize {
    self.storage.read().await.jobs.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.storage.read().await.jobs.is_empty()
  }
}

#[async_trait]
impl Datastore for MemoryDatastore {
  async fn persist_job(&self, job: &Job) -> Result<Job> {
    let mut storage = self.storage.write().await;
    storage.check_available()?;
    Ok(storage.store(job))
  }

  async fn persist_jobs(&self, jobs: &[Job]) -> Result<Vec<Job>> {
    let mut storage = self.storage.write().await;
    storage.check_available()?;
    Ok(jobs.iter().map(|job| storage.store(job)).collect())
  }

  async fn fetch_job(&self, id: JobId) -> Result<Job> {
    let storage = self.storage.read().await;
    storage
      .jobs
      .get(&id)
      .cloned()
      .ok_or(Error::JobNotFound { id })
  }

  async fn currently_sequenced(&self, job: &Job) -> Result<bool> {
    let Some(sequence) = job.sequence.as_deref() else {
      return Ok(false);
    };
    let storage = self.storage.read().await;
    Ok(storage.has_earlier_sibling(sequence, job.id))
  }

  async fn fetch_next_sequence(&self, job: &Job) -> Result<Option<Job>> {
    let Some(sequence) = job.sequence.as_deref() else {
      return Ok(None);
    };
    let storage = self.storage.read().await;
    Ok(
      storage
        .jobs
        .values()
        .find(|other| {
          other.id != job.id
            && other.sequence.as_deref() == Some(sequence)
            && other.status.is_outstanding()
        })
        .cloned(),
    )
  }

  async fn is_similar_job(&self, job: &Job) -> Result<bool> {
    let storage = self.storage.read().await;
    Ok(storage.jobs.values().any(|other| {
      other.id != job.id && other.worker == job.worker && other.status.is_claimable()
    }))
  }

  async fn next_open_job(
    &self,
    exclude_ids: &[JobId],
    exclude_sequences: &[String],
  ) -> Result<Option<Job>> {
    let now = Utc::now();
    let storage = self.storage.read().await;
    let mut candidates: Vec<&Job> = storage
      .jobs
      .values()
      .filter(|job| job.status.is_claimable() && job.run_at <= now)
      .filter(|job| job.id.is_some_and(|id| !exclude_ids.contains(&id)))
      .filter(|job| match job.sequence.as_deref() {
        Some(sequence) => {
          !exclude_sequences.iter().any(|s| s == sequence)
            && !storage.has_earlier_sibling(sequence, job.id)
        }
        None => true,
      })
      .collect();
    candidates.sort_by_key(|job| (job.priority, job.id));
    Ok(candidates.first().map(|job| (*job).clone()))
  }

  async fn claim_job(&self, id: JobId, locked_by: &str) -> Result<Option<Job>> {
    let mut storage = self.storage.write().await;
    storage.check_available()?;
    match storage.jobs.get_mut(&id) {
      Some(job) if job.status.is_claimable() => {
        job.status = JobStatus::Busy;
        job.locked_by = Some(locked_by.to_string());
        Ok(Some(job.clone()))
      }
      _ => Ok(None),
    }
  }

  async fn running_by_host(&self, locked_by: &str) -> Result<Vec<Job>> {
    let storage = self.storage.read().await;
    Ok(
      storage
        .jobs
        .values()
        .filter(|job| job.status == JobStatus::Busy && job.locked_by.as_deref() == Some(locked_by))
        .cloned()
        .collect(),
    )
  }

  async fn status_counts(&self) -> Result<HashMap<JobStatus, u64>> {
    let storage = self.storage.read().await;
    let mut counts = HashMap::new();
    for job in storage.jobs.values() {
      *counts.entry(job.status).or_insert(0) += 1;
    }
    Ok(counts)
  }
}

#[async_trait]
impl HostStore for MemoryDatastore {
  async fn register_host(&self, host: &Host) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.check_available()?;
    storage
      .hosts
      .insert((host.host_name.clone(), host.pid), host.clone());
    Ok(())
  }

  async fn fetch_host(&self, host_name: &str, pid: u32) -> Result<Option<Host>> {
    let storage = self.storage.read().await;
    Ok(storage.hosts.get(&(host_name.to_string(), pid)).cloned())
  }

  async fn update_host(&self, host: &Host) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.check_available()?;
    let key = (host.host_name.clone(), host.pid);
    match storage.hosts.get_mut(&key) {
      Some(existing) => {
        *existing = host.clone();
        Ok(())
      }
      None => Err(Error::HostNotFound {
        host_name: host.host_name.clone(),
        pid: host.pid,
      }),
    }
  }

  async fn delete_host(&self, host_name: &str, pid: u32) -> Result<()> {
    let mut storage = self.storage.write().await;
    storage.check_available()?;
    storage.hosts.remove(&(host_name.to_string(), pid));
    Ok(())
  }
}
