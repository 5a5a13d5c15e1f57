use std::io;

use tracing::info;

/// Resolves once the process is asked to stop.
///
/// It will exit when received `SIGTERM` or `SIGINT`.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<()> {
    use futures_util::future::{self, Either, FutureExt};
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let signal_name = match future::select(sigterm.recv().boxed(), sigint.recv().boxed()).await {
        Either::Left(..) => "SIGTERM",
        Either::Right(..) => "SIGINT",
    };

    info!("received {signal_name}, exiting");

    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, exiting");
    Ok(())
}
