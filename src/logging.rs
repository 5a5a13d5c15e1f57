use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE: &str = "app.log";

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Also write every event to a daily rotated file under `dir`.
    pub file: bool,
    pub dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: true,
            dir: PathBuf::from("logs"),
        }
    }
}

/// Installs the global subscriber. The returned guard flushes the log file
/// when dropped, so keep it until the process exits.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    // If you want to see only application logs you can set env variable like this:
    // RUST_LOG=load_balancer=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard, file_error) = match config.file.then(|| file_writer(&config.dir)) {
        Some(Ok((writer, guard))) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
            None,
        ),
        Some(Err(e)) => (None, None, Some(e)),
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .init();

    if let Some(e) = file_error {
        warn!("not logging to {}: {e}", config.dir.display());
    }

    guard
}

fn file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE)
        .build(dir)?;

    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write};

    use super::*;

    #[test]
    fn test_file_writer() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");

        let (mut writer, guard) = file_writer(&logs).unwrap();
        writer.write_all(b"request processed\n").unwrap();
        // flushes the background writer
        drop(guard);

        let files = fs::read_dir(&logs)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("app.log."), "{}", files[0]);
        assert_eq!(
            fs::read_to_string(logs.join(&files[0])).unwrap(),
            "request processed\n"
        );
    }
}
