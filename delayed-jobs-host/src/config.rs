//! 命令行模式与环境变量配置
//! Command-line mode and environment configuration
//!
//! | Variable | Default |
//! |---|---|
//! | `DJ_REDIS_URL` | `redis://127.0.0.1:6379` |
//! | `DJ_PREFIX` | `dj` |
//! | `DJ_WORKER_NAME` | `default` |
//! | `DJ_CONSUMER_NAME` | `consumer` |
//! | `DJ_WORKERS` | host record value |
//! | `DJ_CONCURRENCY` | number of CPUs |
//! | `DJ_WORKER_COMMAND` | `<this executable> worker` |
//! | `DJ_BROKER_DISABLED` | `false` |

use anyhow::{anyhow, bail, Context};
use delayed_jobs::JobId;

/// 运行模式
/// Run mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
  /// 主机 supervisor
  /// Host supervisor
  Host,
  /// 执行单个任务后退出
  /// Execute one job and exit
  Worker { job_id: JobId, force: bool },
  /// broker 消费者
  /// Broker consumer
  Consume,
}

impl Mode {
  pub const USAGE: &'static str = "usage: delayed-jobs-host [host | worker <job-id> [--force] | consume]";

  pub fn parse<I, S>(args: I) -> anyhow::Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    match args.first().map(String::as_str) {
      None | Some("host") => Ok(Mode::Host),
      Some("consume") => Ok(Mode::Consume),
      Some("worker") => {
        let id = args
          .get(1)
          .ok_or_else(|| anyhow!("missing job id\n{}", Self::USAGE))?;
        let job_id = id
          .parse::<JobId>()
          .with_context(|| format!("invalid job id {id:?}"))?;
        let force = match args.get(2).map(String::as_str) {
          None => false,
          Some("--force") => true,
          Some(other) => bail!("unexpected argument {other:?}\n{}", Self::USAGE),
        };
        Ok(Mode::Worker { job_id, force })
      }
      Some(other) => bail!("unknown mode {other:?}\n{}", Self::USAGE),
    }
  }
}

/// 进程配置
/// Process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
  pub redis_url: String,
  pub prefix: String,
  pub worker_name: String,
  /// `consume` 模式的池名称，必须与 supervisor 的不同
  /// Pool name of `consume` mode, must differ from the supervisor's
  pub consumer_name: String,
  pub workers: Option<usize>,
  pub concurrency: Option<usize>,
  pub worker_command: Option<Vec<String>>,
  pub broker_disabled: bool,
}

impl HostConfig {
  pub fn from_env() -> anyhow::Result<Self> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let number = |name: &str| -> anyhow::Result<Option<usize>> {
      lookup(name)
        .map(|value| {
          value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("{name} must be a positive integer, got {value:?}"))
        })
        .transpose()
    };

    let config = Self {
      redis_url: lookup("DJ_REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
      prefix: lookup("DJ_PREFIX").unwrap_or_else(|| "dj".to_string()),
      worker_name: lookup("DJ_WORKER_NAME").unwrap_or_else(|| "default".to_string()),
      consumer_name: lookup("DJ_CONSUMER_NAME").unwrap_or_else(|| "consumer".to_string()),
      workers: number("DJ_WORKERS")?,
      concurrency: number("DJ_CONCURRENCY")?,
      worker_command: lookup("DJ_WORKER_COMMAND")
        .map(|command| command.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .filter(|command| !command.is_empty()),
      broker_disabled: lookup("DJ_BROKER_DISABLED")
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false),
    };
    if config.consumer_name == config.worker_name {
      bail!(
        "DJ_CONSUMER_NAME and DJ_WORKER_NAME must differ, both are {:?}",
        config.worker_name
      );
    }
    Ok(config)
  }
}
