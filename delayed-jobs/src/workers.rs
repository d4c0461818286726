//! 内置 worker
//! Built-in workers

use crate::error::Result;
use crate::job::Job;
use crate::registry::{Worker, WorkerOutput, WorkerRegistry};
use crate::result::JobResult;
use async_trait::async_trait;
use std::time::Duration;

/// 诊断用 worker：等待一段时间，payload `type` 为 `"success"` 时成功，否则失败
/// Diagnostic worker: waits, then succeeds when the payload `type` is `"success"`, otherwise fails
#[derive(Debug, Clone)]
pub struct TestWorker {
  delay: Duration,
}

impl TestWorker {
  pub const IDENTIFIER: &'static str = "DelayedJobs.Test";

  pub fn new() -> Self {
    Self {
      delay: Duration::from_secs(2),
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }
}

impl Default for TestWorker {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Worker for TestWorker {
  async fn perform(&self, job: &Job) -> Result<WorkerOutput> {
    tokio::time::sleep(self.delay).await;
    let kind = job
      .payload_value("type")
      .and_then(|value| value.as_str())
      .unwrap_or_default();
    let result = if kind == "success" {
      JobResult::success("Test job succeeded")
    } else {
      JobResult::failed(format!("Test job failed, type was {kind:?}"))
    };
    Ok(result.into())
  }
}

/// 注册所有内置 worker
/// Register every built-in worker
pub fn register_builtin(registry: &mut WorkerRegistry) {
  registry.register(TestWorker::IDENTIFIER, TestWorker::new());
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::Payload;
  use serde_json::json;

  fn job(kind: &str) -> Job {
    let mut payload = Payload::new();
    payload.insert("type".into(), json!(kind));
    Job::new(TestWorker::IDENTIFIER, payload).unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_payload() {
    let output = TestWorker::new().perform(&job("success")).await.unwrap();
    assert!(matches!(output.into_result(), JobResult::Success { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_other_payload_fails_and_retries() {
    let result = TestWorker::new()
      .perform(&job("explode"))
      .await
      .unwrap()
      .into_result();
    assert!(matches!(result, JobResult::Failed { retry: true, .. }));
  }

  #[test]
  fn test_register_builtin() {
    let mut registry = WorkerRegistry::new();
    register_builtin(&mut registry);
    assert!(registry.contains(TestWorker::IDENTIFIER));
  }
}
