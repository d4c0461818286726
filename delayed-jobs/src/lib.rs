//! # Delayed Jobs
//!
//! 分布式延迟任务调度：持久化任务、经由 broker 分发、失败退避重试、有序序列以及主机监管
//! Distributed delayed-job scheduling: persistent jobs, broker fan-out, retry back-off,
//! ordered sequences and host supervision.
//!
//! ## 特性
//! ## Features
//!
//! - 任务持久化后才发布，broker 丢失消息时由轮询补救
//!   - Jobs are persisted before they are published, polling recovers lost messages
//! - 失败后按重试次数指数退避并加入随机抖动
//!   - Failures back off with the retry count plus random jitter
//! - 同一序列的任务严格按 id 顺序执行，任何时刻最多一个在运行
//!   - Jobs of one sequence run strictly in id order, at most one at a time
//! - 每台主机一个 supervisor，为每个任务启动独立的 worker 进程并强制执行超时
//!   - One supervisor per host starts an isolated worker process per job and enforces timeouts
//! - 也可以由 broker 推动，在进程内执行
//!   - Jobs can also be driven by the broker and executed in-process
//! - 内存与 Redis 两种后端
//!   - Memory and Redis backends
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use delayed_jobs::config::ManagerConfig;
//! use delayed_jobs::job::Job;
//! use delayed_jobs::manager::Manager;
//! use delayed_jobs::rdb::{RedisBroker, RedisBrokerConfig, RedisConnectionConfig, RedisDatastore};
//! use delayed_jobs::registry::WorkerRegistry;
//! use delayed_jobs::result::JobResult;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = RedisConnectionConfig::single("redis://127.0.0.1:6379")?;
//!     let datastore = Arc::new(RedisDatastore::new(connection.clone()).await?);
//!     let broker = Arc::new(RedisBroker::new(connection, RedisBrokerConfig::default()).await?);
//!
//!     let mut registry = WorkerRegistry::new();
//!     registry.register_fn("Mailer.Send", |job: &Job| {
//!         Ok(JobResult::success(format!("sent {:?}", job.payload_value("to"))))
//!     });
//!
//!     let manager = Manager::new(datastore, broker, registry, ManagerConfig::default());
//!
//!     // 十分钟后发送
//!     // Send in ten minutes
//!     let mut job = Job::new_with_json("Mailer.Send", &serde_json::json!({"to": "ops@example.com"}))?
//!         .with_delay(Duration::from_secs(600));
//!     manager.enqueue(&mut job).await?;
//!     Ok(())
//! }
//! ```

pub mod base;
pub mod components;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod manager;
pub mod memdb;
pub mod observer;
pub mod process;
pub mod rdb;
pub mod registry;
pub mod result;
pub mod workers;

pub use error::{Error, Result};
pub use executor::{ExecutionOutcome, WorkerExecutor};
pub use job::{Job, JobId, JobMessage, JobStatus};
pub use manager::{EnqueueOutcome, Manager};
pub use registry::{Worker, WorkerOutput, WorkerRegistry};
pub use result::JobResult;
