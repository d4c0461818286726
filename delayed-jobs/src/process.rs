//! 进程管理
//! Process management
//!
//! supervisor 通过注入的 [`ProcessSpawner`] 启动 worker 进程并检查其存活状态
//! The supervisor starts worker processes and checks their liveness through an injected [`ProcessSpawner`]

use crate::error::{Error, Result};
use crate::job::JobId;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// 一个正在运行（或已退出）的 worker 进程
/// A running (or exited) worker process
#[async_trait]
pub trait ProcessHandle: Send {
  fn pid(&self) -> Option<u32>;

  /// 进程是否仍在运行
  /// Whether the process is still running
  fn is_running(&mut self) -> bool;

  /// 强制终止进程
  /// Forcefully terminate the process
  async fn kill(&mut self) -> Result<()>;
}

/// 启动 worker 进程的能力
/// Capability to start worker processes
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
  /// 为任务启动一个 worker 进程
  /// Start a worker process for the job
  async fn spawn(&self, job_id: JobId) -> Result<Box<dyn ProcessHandle>>;

  /// 接管一个已存在的进程（supervisor 重启后）
  /// Adopt an existing process (after a supervisor restart)
  fn attach(&self, pid: u32) -> Box<dyn ProcessHandle>;
}

/// 以子进程方式运行 worker 命令
/// Runs the worker command as a child process
#[derive(Debug, Clone)]
pub struct OsProcessSpawner {
  program: PathBuf,
  args: Vec<String>,
}

impl OsProcessSpawner {
  pub fn new<P: Into<PathBuf>>(program: P) -> Self {
    Self {
      program: program.into(),
      args: Vec::new(),
    }
  }

  pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
    self.args.push(arg.into());
    self
  }

  /// 由命令行构造，第一个元素为程序
  /// Build from a command line whose first element is the program
  pub fn from_command(command: &[String]) -> Result<Self> {
    let (program, args) = command
      .split_first()
      .ok_or_else(|| Error::config("Worker command cannot be empty"))?;
    Ok(Self {
      program: PathBuf::from(program),
      args: args.to_vec(),
    })
  }
}

#[async_trait]
impl ProcessSpawner for OsProcessSpawner {
  async fn spawn(&self, job_id: JobId) -> Result<Box<dyn ProcessHandle>> {
    let child = Command::new(&self.program)
      .args(&self.args)
      .arg(job_id.to_string())
      .stdin(Stdio::null())
      .kill_on_drop(false)
      .spawn()?;
    tracing::debug!(job_id, pid = ?child.id(), program = %self.program.display(), "worker process spawned");
    Ok(Box::new(ChildHandle { child }))
  }

  fn attach(&self, pid: u32) -> Box<dyn ProcessHandle> {
    Box::new(PidHandle { pid })
  }
}

/// 自己启动的子进程，通过 `try_wait` 回收
/// A child we started ourselves, reaped through `try_wait`
struct ChildHandle {
  child: Child,
}

#[async_trait]
impl ProcessHandle for ChildHandle {
  fn pid(&self) -> Option<u32> {
    self.child.id()
  }

  fn is_running(&mut self) -> bool {
    matches!(self.child.try_wait(), Ok(None))
  }

  async fn kill(&mut self) -> Result<()> {
    self.child.kill().await?;
    Ok(())
  }
}

/// 只知道 pid 的进程
/// A process known only by its pid
struct PidHandle {
  pid: u32,
}

#[async_trait]
impl ProcessHandle for PidHandle {
  fn pid(&self) -> Option<u32> {
    Some(self.pid)
  }

  fn is_running(&mut self) -> bool {
    pid_is_alive(self.pid)
  }

  async fn kill(&mut self) -> Result<()> {
    kill_pid(self.pid)
  }
}

/// 进程是否存在
/// Whether a process with this pid exists
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
  use nix::errno::Errno;
  use nix::sys::signal::kill;
  use nix::unistd::Pid;

  let Ok(raw) = i32::try_from(pid) else {
    return false;
  };
  match kill(Pid::from_raw(raw), None) {
    Ok(()) => true,
    Err(Errno::EPERM) => true,
    Err(_) => false,
  }
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
  false
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
  use nix::errno::Errno;
  use nix::sys::signal::{kill, Signal};
  use nix::unistd::Pid;

  let raw = i32::try_from(pid).map_err(|_| Error::other(format!("invalid pid {pid}")))?;
  match kill(Pid::from_raw(raw), Signal::SIGKILL) {
    Ok(()) | Err(Errno::ESRCH) => Ok(()),
    Err(errno) => Err(Error::Io(std::io::Error::from(errno))),
  }
}

#[cfg(not(unix))]
fn kill_pid(pid: u32) -> Result<()> {
  Err(Error::other(format!(
    "cannot kill adopted process {pid} on this platform"
  )))
}
