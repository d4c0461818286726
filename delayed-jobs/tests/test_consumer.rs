//! Broker 消费者集成测试
//! Broker consumer integration tests

use delayed_jobs::base::constants::CRASHED_MESSAGE;
use delayed_jobs::base::{Acknowledgement, Datastore, Delivery};
use delayed_jobs::components::consumer::Consumer;
use delayed_jobs::components::ComponentLifecycle;
use delayed_jobs::config::{ConsumerConfig, ManagerConfig};
use delayed_jobs::job::Payload;
use delayed_jobs::memdb::{MemoryBroker, MemoryDatastore};
use delayed_jobs::{Job, JobId, JobStatus, Manager, WorkerExecutor, WorkerRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
  datastore: Arc<MemoryDatastore>,
  broker: Arc<MemoryBroker>,
  manager: Arc<Manager>,
  consumer: Arc<Consumer>,
  calls: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
  let calls = Arc::new(AtomicUsize::new(0));
  let mut registry = WorkerRegistry::new();
  let counter = calls.clone();
  registry.register_fn("Counter.Bump", move |_job: &Job| {
    counter.fetch_add(1, Ordering::SeqCst);
    Ok("bumped")
  });

  let datastore = Arc::new(MemoryDatastore::new());
  let broker = Arc::new(MemoryBroker::new().with_poll_interval(Duration::from_millis(20)));
  let manager = Arc::new(Manager::new(
    datastore.clone(),
    broker.clone(),
    registry,
    ManagerConfig::default(),
  ));
  let executor = Arc::new(WorkerExecutor::new(manager.clone()).with_host_name("test-host"));
  let consumer = Arc::new(Consumer::new(
    executor,
    ConsumerConfig::new()
      .worker_name("consumer")
      .concurrency(1)
      .claim_grace(Duration::from_millis(5)),
  ));
  Fixture {
    datastore,
    broker,
    manager,
    consumer,
    calls,
  }
}

fn job() -> Job {
  Job::new("Counter.Bump", Payload::new()).unwrap()
}

async fn enqueue(fixture: &Fixture, job: Job) -> Job {
  let mut job = job;
  fixture.manager.enqueue(&mut job).await.unwrap();
  job
}

fn delivery(job: &Job) -> Delivery {
  Delivery {
    message: job.message().unwrap(),
    tag: format!("tag-{}", job.id.unwrap()),
    redelivered: false,
  }
}

async fn wait_for_status(datastore: &MemoryDatastore, ids: &[JobId], status: JobStatus) {
  tokio::time::timeout(Duration::from_secs(5), async {
    loop {
      let mut done = true;
      for id in ids {
        if datastore.fetch_job(*id).await.unwrap().status != status {
          done = false;
        }
      }
      if done {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  })
  .await
  .unwrap();
}

#[tokio::test]
async fn test_worker_id_uses_host_and_pool() {
  let fixture = fixture();
  assert_eq!(fixture.consumer.worker_id(), "test-host.consumer");
}

#[tokio::test]
async fn test_handle_runs_the_job() {
  let fixture = fixture();
  let job = enqueue(&fixture, job()).await;

  let decision = fixture.consumer.handle(delivery(&job)).await;
  assert_eq!(decision, Acknowledgement::Ack);
  assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);

  let stored = fixture.datastore.fetch_job(job.id.unwrap()).await.unwrap();
  assert_eq!(stored.status, JobStatus::Success);
  assert_eq!(stored.locked_by.as_deref(), Some("test-host.consumer"));
  assert_eq!(fixture.consumer.stats().handled.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_duplicate_delivery_of_finished_job_is_acked_without_running() {
  let fixture = fixture();
  let job = enqueue(&fixture, job()).await;

  fixture.consumer.handle(delivery(&job)).await;
  let again = fixture.consumer.handle(delivery(&job)).await;

  assert_eq!(again, Acknowledgement::Ack);
  assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_job_claimed_elsewhere_is_dropped() {
  let fixture = fixture();
  let job = enqueue(&fixture, job()).await;
  fixture
    .datastore
    .claim_job(job.id.unwrap(), "other-host.default")
    .await
    .unwrap();

  let decision = fixture.consumer.handle(delivery(&job)).await;
  assert_eq!(decision, Acknowledgement::Ack);
  assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_outage_requeues() {
  let fixture = fixture();
  let job = enqueue(&fixture, job()).await;
  fixture.datastore.set_unavailable(true).await;

  let decision = fixture.consumer.handle(delivery(&job)).await;
  assert_eq!(decision, Acknowledgement::Requeue);
  assert_eq!(fixture.consumer.stats().requeued.load(Ordering::Relaxed), 1);
  assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_consumes_until_stopped() {
  let fixture = fixture();
  let handle = fixture.consumer.clone().start();

  let first = enqueue(&fixture, job()).await.id.unwrap();
  let second = enqueue(&fixture, job()).await.id.unwrap();
  wait_for_status(&fixture.datastore, &[first, second], JobStatus::Success).await;

  fixture.consumer.stop().await;
  tokio::time::timeout(Duration::from_secs(5), handle)
    .await
    .unwrap()
    .unwrap();

  assert!(fixture.consumer.is_done());
  assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
  assert_eq!(fixture.broker.unacked_len().await, 0);
  assert_eq!(fixture.broker.pending_len().await, 0);
}

#[tokio::test]
async fn test_sequence_is_released_through_the_broker() {
  let fixture = fixture();
  let head = enqueue(&fixture, job().with_sequence("ledger")).await;
  let tail = enqueue(&fixture, job().with_sequence("ledger")).await;
  assert_eq!(fixture.broker.published().await.len(), 1);

  let handle = fixture.consumer.clone().start();
  wait_for_status(
    &fixture.datastore,
    &[head.id.unwrap(), tail.id.unwrap()],
    JobStatus::Success,
  )
  .await;
  fixture.consumer.stop().await;
  tokio::time::timeout(Duration::from_secs(5), handle)
    .await
    .unwrap()
    .unwrap();

  let published: Vec<JobId> = fixture
    .broker
    .published()
    .await
    .into_iter()
    .map(|message| message.id)
    .collect();
  assert_eq!(published, vec![head.id.unwrap(), tail.id.unwrap()]);
}

#[tokio::test]
async fn test_jobs_abandoned_under_the_consumer_pool_are_released() {
  let fixture = fixture();
  let abandoned = enqueue(&fixture, job()).await.id.unwrap();
  let in_this_process = enqueue(&fixture, job()).await.id.unwrap();
  let elsewhere = enqueue(&fixture, job()).await.id.unwrap();
  for id in [abandoned, in_this_process] {
    fixture
      .datastore
      .claim_job(id, "test-host.consumer")
      .await
      .unwrap()
      .unwrap();
  }
  fixture
    .datastore
    .update(in_this_process, |job| job.pid = Some(std::process::id()))
    .await
    .unwrap();
  fixture
    .datastore
    .claim_job(elsewhere, "test-host.default")
    .await
    .unwrap()
    .unwrap();

  assert_eq!(fixture.consumer.recover_abandoned().await.unwrap(), 1);

  let released = fixture.datastore.fetch_job(abandoned).await.unwrap();
  assert_eq!(released.status, JobStatus::Failed);
  assert_eq!(released.last_message.as_deref(), Some(CRASHED_MESSAGE));
  for id in [in_this_process, elsewhere] {
    assert_eq!(
      fixture.datastore.fetch_job(id).await.unwrap().status,
      JobStatus::Busy
    );
  }
}
