//! Logging setup shared by the netbench binaries.
//!
//! Benchmark runs log to the console by default. A log directory turns on a
//! rolling file sink next to it, so long sweeps keep a record of every
//! connection recovery without cluttering the result output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files; no file sink when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// "hourly", "daily" or "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,

    #[serde(default)]
    pub json_format: bool,

    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "netbench".into()
}

fn default_rotation() -> String {
    "never".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: default_rotation(),
            json_format: false,
            console_output: true,
        }
    }
}

impl LogConfig {
    fn rotation(&self) -> rolling::Rotation {
        match self.rotation.as_str() {
            "hourly" => rolling::Rotation::HOURLY,
            "daily" => rolling::Rotation::DAILY,
            _ => rolling::Rotation::NEVER,
        }
    }
}

type BoxedLayer<S> = Box<dyn tracing_subscriber::Layer<S> + Send + Sync>;

/// Install the global subscriber described by `config`.
///
/// Call once at startup. The returned guard flushes the file sink when
/// dropped and must live as long as the program logs.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, InitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<BoxedLayer<_>> = match (config.console_output, config.json_format) {
        (false, _) => None,
        (true, true) => Some(Box::new(fmt::layer().json())),
        (true, false) => Some(Box::new(fmt::layer().with_target(false))),
    };

    let (file_layer, guard): (Option<BoxedLayer<_>>, Option<WorkerGuard>) =
        match config.log_dir {
            Some(ref log_dir) => {
                let appender = rolling::RollingFileAppender::builder()
                    .rotation(config.rotation())
                    .filename_prefix(&config.file_prefix)
                    .filename_suffix("log")
                    .build(log_dir)?;
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer: BoxedLayer<_> = if config.json_format {
                    Box::new(fmt::layer().json().with_writer(writer))
                } else {
                    Box::new(fmt::layer().with_ansi(false).with_writer(writer))
                };
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

    registry.with(console_layer).with(file_layer).init();

    Ok(guard)
}
