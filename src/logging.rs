//! Diagnostics setup.
//!
//! The crate only emits `tracing` events and works under whatever
//! subscriber the host application installs. [`init_logging`] is an opt-in
//! helper for applications that do not bring their own: console output,
//! optional daily log files, and a default filter that keeps this crate
//! audible while silencing the HTTP stack's per-request chatter.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Daily log files are named `audiopipe.log.YYYY-MM-DD` by the rolling
/// appender.
const LOG_FILE_PREFIX: &str = "audiopipe.log";

/// How the crate's diagnostics are emitted.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directives used when `RUST_LOG` is unset
    pub directives: String,
    /// Emit human-readable output to the console
    pub console: bool,
    /// Directory for daily log files; `None` disables file logging
    pub file_dir: Option<PathBuf>,
    /// Daily files kept before the oldest are pruned
    pub keep_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directives: "audiopipe=info,hyper=warn,reqwest=warn".to_string(),
            console: true,
            file_dir: None,
            keep_files: 5,
        }
    }
}

impl LogConfig {
    /// Enable file logging under the user's config directory
    /// (`~/.config/audiopipe/logs`), next to the persisted stream settings.
    pub fn with_default_file_dir(mut self) -> Self {
        self.file_dir = dirs::home_dir()
            .map(|home| home.join(".config").join("audiopipe").join("logs"));
        self
    }
}

/// Install a global subscriber.
///
/// Returns a guard that flushes the file writer; keep it alive for the
/// duration of the program when file logging is enabled.
pub fn init_logging(config: LogConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.directives))?;

    let (file_layer, guard) = match &config.file_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            prune_daily_logs(dir, config.keep_files)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::info!(directives = %config.directives, "logging initialized");
    Ok(guard)
}

/// Delete the oldest daily log files, keeping `keep` of them.
///
/// The date suffix makes lexicographic order chronological, so pruning
/// needs no metadata reads. Files without the log prefix are untouched.
fn prune_daily_logs(dir: &Path, keep: usize) -> io::Result<()> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(LOG_FILE_PREFIX))
        .collect();
    names.sort_unstable();
    names.reverse();

    for stale in names.into_iter().skip(keep) {
        fs::remove_file(dir.join(stale))?;
    }
    Ok(())
}
