//! Redis 数据存储实现
//! Redis datastore implementation

use crate::base::constants::MINIMUM_PRIORITY;
use crate::base::{Datastore, Host, HostStore};
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobStatus};
use crate::rdb::scripts::{RedisArg, ScriptManager};
use crate::rdb::{Keys, RedisConnectionConfig};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;

/// 可认领集合的分数：优先级在高位，id 在低位。
/// 优先级限制在 ±2^20、id 低于 2^32 时分数在 f64 中是精确的
/// Claimable set score: priority in the high part, id in the low part.
/// Exact in an f64 while the priority stays within ±2^20 and the id below 2^32
fn open_score(priority: i32, id: JobId) -> f64 {
  let priority = priority.clamp(MINIMUM_PRIORITY, -MINIMUM_PRIORITY);
  f64::from(priority) * 4_294_967_296.0 + id as f64
}

/// 每次脚本调用扫描的可认领任务数
/// Claimable jobs scanned per script call
const OPEN_SCAN_PAGE: i64 = 200;

fn flag(value: bool) -> RedisArg {
  RedisArg::Bool(value)
}

/// Redis 数据存储
/// Redis datastore
#[derive(Clone)]
pub struct RedisDatastore {
  conn: MultiplexedConnection,
  keys: Keys,
  script_manager: ScriptManager,
}

impl RedisDatastore {
  pub async fn new(config: RedisConnectionConfig) -> Result<Self> {
    let mut conn = config.connect().await?;
    let mut script_manager = ScriptManager::default();
    script_manager.load_scripts(&mut conn).await?;
    Ok(Self {
      conn,
      keys: Keys::new(config.prefix()),
      script_manager,
    })
  }

  fn connection(&self) -> MultiplexedConnection {
    self.conn.clone()
  }

  async fn store(&self, conn: &mut MultiplexedConnection, job: &Job) -> Result<Job> {
    let mut stored = job.clone();
    let id = match stored.id {
      Some(id) => id,
      None => {
        redis::cmd("INCR")
          .arg(self.keys.id_counter())
          .query_async::<JobId>(&mut *conn)
          .await?
      }
    };
    stored.id = Some(id);
    if stored.created_at.is_none() {
      stored.created_at = Some(Utc::now());
    }

    let json = serde_json::to_string(&stored)?;
    let args = [
      RedisArg::Str(id.to_string()),
      RedisArg::Str(json),
      RedisArg::Int(i64::from(stored.status.code())),
      RedisArg::Float(open_score(stored.priority, id)),
      RedisArg::Str(stored.sequence.clone().unwrap_or_default()),
      RedisArg::Str(stored.worker.clone()),
      RedisArg::Str(stored.locked_by.clone().unwrap_or_default()),
      RedisArg::Int(stored.run_at.timestamp_millis()),
      flag(stored.status.is_claimable()),
      flag(stored.status.is_outstanding()),
      flag(stored.status == JobStatus::Busy),
      RedisArg::Str(self.keys.prefix().to_string()),
    ];
    self
      .script_manager
      .eval_script::<i64>(conn, "persist", &[self.keys.job(id)], &args)
      .await?;
    Ok(stored)
  }

  async fn load(&self, conn: &mut MultiplexedConnection, id: JobId) -> Result<Job> {
    let (json, status, locked_by): (Option<String>, Option<u8>, Option<String>) =
      redis::cmd("HMGET")
        .arg(self.keys.job(id))
        .arg("json")
        .arg("status")
        .arg("locked_by")
        .query_async(conn)
        .await?;
    let json = json.ok_or(Error::JobNotFound { id })?;
    let mut job: Job = serde_json::from_str(&json)?;
    // 认领只更新哈希字段，JSON 中的状态可能已过时
    if let Some(status) = status.and_then(JobStatus::from_code) {
      job.status = status;
    }
    job.locked_by = locked_by.filter(|locked_by| !locked_by.is_empty());
    Ok(job)
  }

  async fn sequence_head(
    &self,
    conn: &mut MultiplexedConnection,
    sequence: &str,
    count: isize,
  ) -> Result<Vec<JobId>> {
    let ids: Vec<JobId> = redis::cmd("ZRANGE")
      .arg(self.keys.sequence(sequence))
      .arg(0)
      .arg(count - 1)
      .query_async(conn)
      .await?;
    Ok(ids)
  }
}

#[async_trait]
impl Datastore for RedisDatastore {
  async fn persist_job(&self, job: &Job) -> Result<Job> {
    let mut conn = self.connection();
    self.store(&mut conn, job).await
  }

  async fn persist_jobs(&self, jobs: &[Job]) -> Result<Vec<Job>> {
    let mut conn = self.connection();
    let mut stored = Vec::with_capacity(jobs.len());
    for job in jobs {
      stored.push(self.store(&mut conn, job).await?);
    }
    Ok(stored)
  }

  async fn fetch_job(&self, id: JobId) -> Result<Job> {
    let mut conn = self.connection();
    self.load(&mut conn, id).await
  }

  async fn currently_sequenced(&self, job: &Job) -> Result<bool> {
    let Some(sequence) = job.sequence.as_deref() else {
      return Ok(false);
    };
    let mut conn = self.connection();
    let head = self.sequence_head(&mut conn, sequence, 1).await?;
    Ok(match (head.first(), job.id) {
      (Some(head), Some(id)) => *head < id,
      (Some(_), None) => true,
      (None, _) => false,
    })
  }

  async fn fetch_next_sequence(&self, job: &Job) -> Result<Option<Job>> {
    let Some(sequence) = job.sequence.as_deref() else {
      return Ok(None);
    };
    let mut conn = self.connection();
    let head = self.sequence_head(&mut conn, sequence, 2).await?;
    match head.into_iter().find(|id| Some(*id) != job.id) {
      Some(id) => Ok(Some(self.load(&mut conn, id).await?)),
      None => Ok(None),
    }
  }

  async fn is_similar_job(&self, job: &Job) -> Result<bool> {
    let mut conn = self.connection();
    let key = self.keys.worker(&job.worker);
    let (count, is_member): (u64, bool) = redis::pipe()
      .cmd("SCARD")
      .arg(&key)
      .cmd("SISMEMBER")
      .arg(&key)
      .arg(job.id.unwrap_or_default())
      .query_async(&mut conn)
      .await?;
    Ok(count > u64::from(is_member))
  }

  async fn next_open_job(
    &self,
    exclude_ids: &[JobId],
    exclude_sequences: &[String],
  ) -> Result<Option<Job>> {
    let mut conn = self.connection();
    let exclude_ids: Vec<String> = exclude_ids.iter().map(ToString::to_string).collect();
    let exclude_ids = serde_json::to_string(&exclude_ids)?;
    let exclude_sequences = serde_json::to_string(exclude_sequences)?;
    let now = Utc::now().timestamp_millis();

    let mut offset: i64 = 0;
    let id = loop {
      let args = [
        RedisArg::Str(self.keys.prefix().to_string()),
        RedisArg::Int(now),
        RedisArg::Str(exclude_ids.clone()),
        RedisArg::Str(exclude_sequences.clone()),
        RedisArg::Int(offset),
        RedisArg::Int(OPEN_SCAN_PAGE),
      ];
      let (id, scanned): (String, i64) = self
        .script_manager
        .eval_script(&mut conn, "next_open", &[self.keys.open()], &args)
        .await?;
      if !id.is_empty() {
        break Some(id.parse::<JobId>().map_err(|e| Error::persistence(e.to_string()))?);
      }
      if scanned < OPEN_SCAN_PAGE {
        break None;
      }
      offset += scanned;
    };
    match id {
      Some(id) => match self.load(&mut conn, id).await {
        Ok(job) => Ok(Some(job)),
        Err(Error::JobNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
      },
      None => Ok(None),
    }
  }

  async fn claim_job(&self, id: JobId, locked_by: &str) -> Result<Option<Job>> {
    let mut conn = self.connection();
    let mut args = vec![
      RedisArg::Str(id.to_string()),
      RedisArg::Str(locked_by.to_string()),
      RedisArg::Str(self.keys.prefix().to_string()),
      RedisArg::Int(i64::from(JobStatus::Busy.code())),
    ];
    args.extend(
      JobStatus::ALL
        .iter()
        .filter(|status| status.is_claimable())
        .map(|status| RedisArg::Int(i64::from(status.code()))),
    );
    let claimed: i64 = self
      .script_manager
      .eval_script(&mut conn, "claim", &[self.keys.job(id)], &args)
      .await?;
    if claimed != 1 {
      return Ok(None);
    }
    Ok(Some(self.load(&mut conn, id).await?))
  }

  async fn running_by_host(&self, locked_by: &str) -> Result<Vec<Job>> {
    let mut conn = self.connection();
    let ids: Vec<JobId> = redis::cmd("SMEMBERS")
      .arg(self.keys.busy(locked_by))
      .query_async(&mut conn)
      .await?;
    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
      match self.load(&mut conn, id).await {
        Ok(job) if job.status == JobStatus::Busy => jobs.push(job),
        Ok(_) | Err(Error::JobNotFound { .. }) => {}
        Err(e) => return Err(e),
      }
    }
    jobs.sort_by_key(|job| job.id);
    Ok(jobs)
  }

  async fn status_counts(&self) -> Result<HashMap<JobStatus, u64>> {
    let mut conn = self.connection();
    let mut pipe = redis::pipe();
    for status in JobStatus::ALL {
      pipe.cmd("SCARD").arg(self.keys.status(status.code()));
    }
    let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
    Ok(
      JobStatus::ALL
        .iter()
        .copied()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .collect(),
    )
  }
}

#[async_trait]
impl HostStore for RedisDatastore {
  async fn register_host(&self, host: &Host) -> Result<()> {
    let mut conn = self.connection();
    redis::cmd("SET")
      .arg(self.keys.host(&host.host_name, host.pid))
      .arg(serde_json::to_string(host)?)
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }

  async fn fetch_host(&self, host_name: &str, pid: u32) -> Result<Option<Host>> {
    let mut conn = self.connection();
    let json: Option<String> = redis::cmd("GET")
      .arg(self.keys.host(host_name, pid))
      .query_async(&mut conn)
      .await?;
    json
      .map(|json| serde_json::from_str(&json).map_err(Error::from))
      .transpose()
  }

  async fn update_host(&self, host: &Host) -> Result<()> {
    let mut conn = self.connection();
    let updated: Option<String> = redis::cmd("SET")
      .arg(self.keys.host(&host.host_name, host.pid))
      .arg(serde_json::to_string(host)?)
      .arg("XX")
      .query_async(&mut conn)
      .await?;
    match updated {
      Some(_) => Ok(()),
      None => Err(Error::HostNotFound {
        host_name: host.host_name.clone(),
        pid: host.pid,
      }),
    }
  }

  async fn delete_host(&self, host_name: &str, pid: u32) -> Result<()> {
    let mut conn = self.connection();
    redis::cmd("DEL")
      .arg(self.keys.host(host_name, pid))
      .query_async::<()>(&mut conn)
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_score_orders_by_priority_then_id() {
    assert!(open_score(1, 500) < open_score(2, 1));
    assert!(open_score(10, 1) < open_score(10, 2));
    assert!(open_score(-5, 9) < open_score(0, 1));

    let floor = open_score(i32::MIN, 7);
    assert_eq!(floor, open_score(MINIMUM_PRIORITY, 7));
    assert!(floor < open_score(MINIMUM_PRIORITY, 8));
    assert!(open_score(MINIMUM_PRIORITY, 4_294_967_295) < open_score(MINIMUM_PRIORITY + 1, 0));
  }
}
