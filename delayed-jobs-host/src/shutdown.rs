use tokio_util::sync::CancellationToken;

/// 监听 SIGTERM 与 SIGINT，收到任一信号时取消返回的令牌
/// Listen for SIGTERM and SIGINT, cancelling the returned token on either
#[cfg(unix)]
pub fn install_shutdown_handler() -> anyhow::Result<CancellationToken> {
  use tokio::signal::unix::{signal, SignalKind};

  let token = CancellationToken::new();
  let mut sigterm = signal(SignalKind::terminate())?;
  let mut sigint = signal(SignalKind::interrupt())?;

  let cancel = token.clone();
  tokio::spawn(async move {
    tokio::select! {
      _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
      _ = sigint.recv() => tracing::info!("received SIGINT, draining"),
    }
    cancel.cancel();
  });

  Ok(token)
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() -> anyhow::Result<CancellationToken> {
  let token = CancellationToken::new();
  let cancel = token.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("received Ctrl-C, draining");
    }
    cancel.cancel();
  });
  Ok(token)
}
