use std::{
    path::{Path, PathBuf},
    process::Stdio,
    thread,
    time::Duration,
};

use serde::Deserialize;
use tokio::{process::Command, task::JoinSet, time};
use tracing::{error, info, warn};

use crate::{signal, utils};

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of worker processes. Defaults to the available parallelism.
    pub workers: Option<usize>,
    #[serde(with = "utils::serde_millis")]
    pub restart_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: None,
            restart_delay: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }
}

/// Keeps a fixed number of worker processes alive.
///
/// Workers are copies of the current executable started with the `worker`
/// subcommand. They share nothing but the listening port and the
/// configuration channel.
pub struct Supervisor {
    config: Config,
    executable: PathBuf,
    config_path: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(config: Config, config_path: Option<&Path>) -> crate::Result<Self> {
        Ok(Self {
            config,
            executable: std::env::current_exe()?,
            config_path: config_path.map(Path::to_path_buf),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.executable);
        if let Some(config_path) = &self.config_path {
            cmd.arg("-c").arg(config_path);
        }
        cmd.arg("worker").stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Runs until SIGTERM or Ctrl-C; dropping the worker tasks kills the
    /// children.
    pub async fn run(self) -> crate::Result<()> {
        let count = self.config.worker_count();
        info!("forking {count} workers");

        let mut workers = JoinSet::new();
        for slot in 0..count {
            workers.spawn(keep_alive(
                slot,
                self.command(),
                self.config.restart_delay,
            ));
        }

        tokio::select! {
            result = signal::shutdown_signal() => {
                result?;
                info!("shutting down workers");
            }
            Some(result) = workers.join_next() => {
                if let Err(e) = result {
                    error!("worker supervision task failed: {e}");
                }
            }
        }

        workers.shutdown().await;
        Ok(())
    }
}

async fn keep_alive(slot: usize, mut cmd: Command, restart_delay: Duration) {
    loop {
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("failed to start worker {slot}: {e}");
                time::sleep(restart_delay).await;
                continue;
            }
        };
        let pid = child.id().unwrap_or_default();
        info!("worker {slot} started with pid {pid}");

        match child.wait().await {
            Ok(status) => warn!("worker {pid} died ({status}), starting a new one"),
            Err(e) => error!("failed to wait for worker {pid}: {e}, starting a new one"),
        }

        time::sleep(restart_delay).await;
    }
}
