//! 主机 supervisor 集成测试，使用伪造的进程启动器
//! Host supervisor integration tests, driven by a fake process spawner

use async_trait::async_trait;
use delayed_jobs::base::constants::{CRASHED_MESSAGE, TIMEOUT_MESSAGE};
use delayed_jobs::base::{Datastore, Host, HostStatus, HostStore};
use delayed_jobs::components::supervisor::{HostSupervisor, LoopControl};
use delayed_jobs::config::{ManagerConfig, SupervisorConfig};
use delayed_jobs::job::Payload;
use delayed_jobs::memdb::{MemoryBroker, MemoryDatastore};
use delayed_jobs::process::{ProcessHandle, ProcessSpawner};
use delayed_jobs::{Error, Job, JobId, JobStatus, Manager, WorkerRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeProcess {
  alive: AtomicBool,
  killed: AtomicBool,
}

struct FakeHandle {
  pid: u32,
  process: Arc<FakeProcess>,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
  fn pid(&self) -> Option<u32> {
    Some(self.pid)
  }

  fn is_running(&mut self) -> bool {
    self.process.alive.load(Ordering::SeqCst)
  }

  async fn kill(&mut self) -> delayed_jobs::Result<()> {
    self.process.alive.store(false, Ordering::SeqCst);
    self.process.killed.store(true, Ordering::SeqCst);
    Ok(())
  }
}

#[derive(Default)]
struct SpawnerState {
  next_pid: u32,
  by_job: HashMap<JobId, Arc<FakeProcess>>,
  spawned: Vec<JobId>,
  attached: Vec<u32>,
  fail: bool,
}

#[derive(Clone, Default)]
struct FakeSpawner {
  state: Arc<Mutex<SpawnerState>>,
}

impl FakeSpawner {
  fn spawned(&self) -> Vec<JobId> {
    self.state.lock().unwrap().spawned.clone()
  }

  fn attached(&self) -> Vec<u32> {
    self.state.lock().unwrap().attached.clone()
  }

  fn exit(&self, id: JobId) {
    let state = self.state.lock().unwrap();
    state.by_job[&id].alive.store(false, Ordering::SeqCst);
  }

  fn was_killed(&self, id: JobId) -> bool {
    let state = self.state.lock().unwrap();
    state.by_job[&id].killed.load(Ordering::SeqCst)
  }

  fn fail_spawns(&self) {
    self.state.lock().unwrap().fail = true;
  }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
  async fn spawn(&self, job_id: JobId) -> delayed_jobs::Result<Box<dyn ProcessHandle>> {
    let mut state = self.state.lock().unwrap();
    if state.fail {
      return Err(Error::other("no such file"));
    }
    state.next_pid += 1;
    let pid = 1000 + state.next_pid;
    let process = Arc::new(FakeProcess::default());
    process.alive.store(true, Ordering::SeqCst);
    state.by_job.insert(job_id, process.clone());
    state.spawned.push(job_id);
    Ok(Box::new(FakeHandle { pid, process }))
  }

  fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
    let mut state = self.state.lock().unwrap();
    state.attached.push(pid);
    let process = Arc::new(FakeProcess::default());
    process.alive.store(true, Ordering::SeqCst);
    Box::new(FakeHandle { pid, process })
  }
}

struct Fixture {
  datastore: Arc<MemoryDatastore>,
  manager: Arc<Manager>,
  spawner: FakeSpawner,
}

impl Fixture {
  fn new() -> Self {
    let datastore = Arc::new(MemoryDatastore::new());
    let manager = Arc::new(Manager::new(
      datastore.clone(),
      Arc::new(MemoryBroker::new()),
      WorkerRegistry::new(),
      ManagerConfig::default(),
    ));
    Self {
      datastore,
      manager,
      spawner: FakeSpawner::default(),
    }
  }

  fn supervisor(&self, host_name: &str, config: SupervisorConfig) -> HostSupervisor {
    HostSupervisor::new(
      self.manager.clone(),
      self.datastore.clone(),
      Arc::new(self.spawner.clone()),
      config,
    )
    .with_identity(host_name, 100)
  }

  async fn enqueue(&self, job: Job) -> JobId {
    let mut job = job;
    self.manager.enqueue(&mut job).await.unwrap();
    job.id.unwrap()
  }

  async fn job(&self, id: JobId) -> Job {
    self.datastore.fetch_job(id).await.unwrap()
  }

  /// 模拟 worker 进程执行成功后退出
  /// Simulate a worker process that succeeded and exited
  async fn finish(&self, id: JobId) {
    self
      .datastore
      .update(id, |job| {
        job.status = JobStatus::Success;
        job.pid = None;
      })
      .await
      .unwrap();
    self.spawner.exit(id);
  }
}

fn job(worker: &str) -> Job {
  Job::new(worker, Payload::new()).unwrap()
}

fn config(workers: usize) -> SupervisorConfig {
  SupervisorConfig::new().worker_count(workers)
}

#[tokio::test(start_paused = true)]
async fn test_claims_and_spawns_up_to_capacity() {
  let fixture = Fixture::new();
  let a = fixture.enqueue(job("Report.Build")).await;
  let b = fixture.enqueue(job("Report.Build")).await;
  let c = fixture.enqueue(job("Report.Build")).await;

  let mut supervisor = fixture.supervisor("host-a", config(2));
  supervisor.boot().await.unwrap();
  assert_eq!(supervisor.worker_id(), "host-a.default");
  assert!(fixture
    .datastore
    .fetch_host("host-a", 100)
    .await
    .unwrap()
    .is_some());

  assert_eq!(supervisor.tick().await.unwrap(), LoopControl::Continue);
  assert_eq!(supervisor.running_len(), 2);
  assert_eq!(fixture.spawner.spawned(), vec![a, b]);

  let claimed = fixture.job(a).await;
  assert_eq!(claimed.status, JobStatus::Busy);
  assert_eq!(claimed.locked_by.as_deref(), Some("host-a.default"));
  assert_eq!(fixture.job(c).await.status, JobStatus::New);
}

#[tokio::test(start_paused = true)]
async fn test_lower_priority_value_runs_first() {
  let fixture = Fixture::new();
  let _late = fixture.enqueue(job("Report.Build").with_priority(50)).await;
  let urgent = fixture.enqueue(job("Report.Build").with_priority(10)).await;

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();
  assert_eq!(fixture.spawner.spawned(), vec![urgent]);
}

#[tokio::test(start_paused = true)]
async fn test_normal_completion_is_removed() {
  let fixture = Fixture::new();
  let id = fixture.enqueue(job("Report.Build")).await;

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();
  assert!(supervisor.is_running(id));

  fixture.finish(id).await;
  supervisor.tick().await.unwrap();
  assert!(!supervisor.is_running(id));

  let finished = fixture.job(id).await;
  assert_eq!(finished.status, JobStatus::Success);
  assert_eq!(finished.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_kills_and_fails_the_job() {
  let fixture = Fixture::new();
  let id = fixture
    .enqueue(job("Report.Build").with_max_execution_time(Duration::from_secs(1)))
    .await;

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();
  assert!(supervisor.is_running(id));

  tokio::time::advance(Duration::from_secs(2)).await;
  supervisor.tick().await.unwrap();

  assert!(!supervisor.is_running(id));
  assert!(fixture.spawner.was_killed(id));
  let failed = fixture.job(id).await;
  assert_eq!(failed.status, JobStatus::Failed);
  assert_eq!(failed.last_message.as_deref(), Some(TIMEOUT_MESSAGE));
  assert_eq!(failed.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_job_within_its_limit_keeps_running() {
  let fixture = Fixture::new();
  let id = fixture
    .enqueue(job("Report.Build").with_max_execution_time(Duration::from_secs(60)))
    .await;

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();
  tokio::time::advance(Duration::from_secs(30)).await;
  supervisor.tick().await.unwrap();

  assert!(supervisor.is_running(id));
  assert!(!fixture.spawner.was_killed(id));
}

#[tokio::test(start_paused = true)]
async fn test_dead_process_with_busy_job_is_a_crash() {
  let fixture = Fixture::new();
  let id = fixture.enqueue(job("Report.Build")).await;

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();

  // the worker locked the job, then died
  fixture
    .datastore
    .update(id, |job| job.pid = Some(4242))
    .await
    .unwrap();
  fixture.spawner.exit(id);
  supervisor.tick().await.unwrap();

  assert!(!supervisor.is_running(id));
  let crashed = fixture.job(id).await;
  assert_eq!(crashed.status, JobStatus::Failed);
  assert_eq!(crashed.last_message.as_deref(), Some(CRASHED_MESSAGE));
}

#[tokio::test(start_paused = true)]
async fn test_process_exiting_before_lock_releases_the_job() {
  let fixture = Fixture::new();
  let id = fixture.enqueue(job("Report.Build")).await;

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();
  assert!(supervisor.is_running(id));

  // the worker never reached the datastore
  fixture.spawner.exit(id);
  supervisor.tick().await.unwrap();

  assert!(!supervisor.is_running(id));
  let released = fixture.job(id).await;
  assert_eq!(released.status, JobStatus::Failed);
  assert_eq!(released.pid, None);
  assert_eq!(released.retries, 1);
  assert_eq!(released.last_message.as_deref(), Some(CRASHED_MESSAGE));
}

#[tokio::test(start_paused = true)]
async fn test_only_one_supervisor_wins_a_claim() {
  let fixture = Fixture::new();
  let id = fixture.enqueue(job("Report.Build")).await;

  let mut first = fixture.supervisor("host-a", config(1));
  let mut second = fixture.supervisor("host-b", config(1));
  first.boot().await.unwrap();
  second.boot().await.unwrap();

  let (a, b) = tokio::join!(first.tick(), second.tick());
  a.unwrap();
  b.unwrap();

  assert_eq!(first.running_len() + second.running_len(), 1);
  assert_eq!(fixture.spawner.spawned(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn test_sequence_runs_one_at_a_time() {
  let fixture = Fixture::new();
  let head = fixture
    .enqueue(job("Import.Row").with_sequence("import-7"))
    .await;
  let tail = fixture
    .enqueue(job("Import.Row").with_sequence("import-7"))
    .await;

  let mut supervisor = fixture.supervisor("host-a", config(2));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();
  assert_eq!(fixture.spawner.spawned(), vec![head]);
  assert_eq!(fixture.job(tail).await.status, JobStatus::New);
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_fails_the_job() {
  let fixture = Fixture::new();
  let id = fixture.enqueue(job("Report.Build")).await;
  fixture.spawner.fail_spawns();

  let mut supervisor = fixture.supervisor("host-a", config(1));
  supervisor.boot().await.unwrap();
  assert_eq!(supervisor.tick().await.unwrap(), LoopControl::Continue);

  assert_eq!(supervisor.running_len(), 0);
  let failed = fixture.job(id).await;
  assert_eq!(failed.status, JobStatus::Failed);
  assert!(failed
    .last_message
    .as_deref()
    .unwrap()
    .starts_with("Could not start worker process"));
}

#[tokio::test(start_paused = true)]
async fn test_to_kill_stops_claiming() {
  let fixture = Fixture::new();
  let mut supervisor = fixture.supervisor(
    "host-a",
    config(1).update_interval(Duration::from_secs(1)),
  );
  supervisor.boot().await.unwrap();

  let mut host = supervisor.host().clone();
  host.status = HostStatus::ToKill;
  fixture.datastore.update_host(&host).await.unwrap();
  tokio::time::advance(Duration::from_secs(2)).await;
  supervisor.tick().await.unwrap();
  assert_eq!(supervisor.host().status, HostStatus::ToKill);

  let id = fixture.enqueue(job("Report.Build")).await;
  assert_eq!(supervisor.tick().await.unwrap(), LoopControl::Continue);
  assert_eq!(supervisor.running_len(), 0);
  assert_eq!(fixture.job(id).await.status, JobStatus::New);
}

#[tokio::test(start_paused = true)]
async fn test_host_record_sets_worker_count() {
  let fixture = Fixture::new();
  let mut host = Host::new("host-a", 100, "default");
  host.worker_count = 3;
  fixture.datastore.register_host(&host).await.unwrap();

  let mut supervisor = fixture.supervisor("host-a", SupervisorConfig::new());
  supervisor.boot().await.unwrap();
  assert_eq!(supervisor.worker_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_boot_adopts_jobs_left_busy() {
  let fixture = Fixture::new();
  let running = fixture.enqueue(job("Report.Build")).await;
  let never_started = fixture.enqueue(job("Report.Build")).await;
  for id in [running, never_started] {
    fixture
      .datastore
      .claim_job(id, "host-a.default")
      .await
      .unwrap()
      .unwrap();
  }
  fixture
    .datastore
    .update(running, |job| job.pid = Some(777))
    .await
    .unwrap();

  let mut supervisor = fixture.supervisor("host-a", config(2));
  supervisor.boot().await.unwrap();

  assert!(supervisor.is_running(running));
  assert!(!supervisor.is_running(never_started));
  assert_eq!(fixture.spawner.attached(), vec![777]);

  let released = fixture.job(never_started).await;
  assert_eq!(released.status, JobStatus::Failed);
  assert_eq!(released.last_message.as_deref(), Some(CRASHED_MESSAGE));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_drains_before_exit() {
  let fixture = Fixture::new();
  let id = fixture.enqueue(job("Report.Build")).await;

  let mut supervisor = fixture.supervisor("host-a", config(2));
  supervisor.boot().await.unwrap();
  supervisor.tick().await.unwrap();

  supervisor.cancellation_token().cancel();
  let other = fixture.enqueue(job("Report.Build")).await;
  assert_eq!(supervisor.tick().await.unwrap(), LoopControl::Continue);
  assert_eq!(fixture.job(other).await.status, JobStatus::New);

  fixture.finish(id).await;
  assert_eq!(supervisor.tick().await.unwrap(), LoopControl::Exit);
}

#[tokio::test(start_paused = true)]
async fn test_run_deletes_host_record_on_exit() {
  let fixture = Fixture::new();
  let supervisor = fixture.supervisor("host-a", config(1));
  supervisor.cancellation_token().cancel();

  supervisor.run().await.unwrap();
  assert!(fixture
    .datastore
    .fetch_host("host-a", 100)
    .await
    .unwrap()
    .is_none());
}
