use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "letterbox.log";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. With a log directory configured,
/// output goes to a daily-rotated file and the returned guard must be held
/// until exit so buffered lines are written; otherwise logs go to stderr.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?;

  let (fmt_layer, guard) = match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .boxed();
      (layer, Some(guard))
    }
    None => (
      fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .boxed(),
      None,
    ),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

