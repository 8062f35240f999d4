use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::Deserialize;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Full filter override, e.g. `huddle_peer=trace,webrtc_ice=debug`.
pub const FILTER_ENV: &str = "HUDDLE_LOG_FILTER";
/// Lets the webrtc/network crates log at trace alongside ours.
pub const DEPENDENCY_TRACE_ENV: &str = "HUDDLE_TRACE_DEPS";

/// Crates that drown out peer logs at trace.
const NOISY_TARGETS: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "rustls",
    "tungstenite",
    "tokio_tungstenite",
    "webrtc_dtls",
    "webrtc_ice",
    "webrtc_mdns",
    "webrtc_sctp",
    "webrtc_srtp",
];

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Directives for this level; debug and trace only raise our own crates.
    fn directives(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "info,huddle_peer=debug",
            LogLevel::Trace => "info,huddle_peer=trace,webrtc=debug",
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown log level {0:?}")]
pub struct ParseLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ParseLevelError(raw.to_string())),
        }
    }
}

/// What [`install`] puts in place. Built by `PeerConfig::log_settings`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LogLevel,
    /// Append to this file instead of stderr.
    pub file: Option<PathBuf>,
    /// Replaces the level-derived directives entirely.
    pub filter: Option<String>,
    pub dependency_traces: bool,
}

impl LogSettings {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }

    /// Pick up [`FILTER_ENV`] and [`DEPENDENCY_TRACE_ENV`].
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = std::env::var(FILTER_ENV) {
            if !filter.trim().is_empty() {
                self.filter = Some(filter);
            }
        }
        if let Ok(raw) = std::env::var(DEPENDENCY_TRACE_ENV) {
            self.dependency_traces = !raw.is_empty() && raw != "0";
        }
        self
    }

    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let mut directives = self.level.directives().to_string();
        if self.throttles_dependencies() {
            for target in NOISY_TARGETS {
                let _ = write!(directives, ",{target}=info");
            }
        }
        directives
    }

    fn throttles_dependencies(&self) -> bool {
        self.filter.is_none() && self.level == LogLevel::Trace && !self.dependency_traces
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Installed {
    /// Our subscriber now receives the process's events.
    Subscriber,
    /// A subscriber was already in place (ours or the host application's).
    Existing,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

static INSTALLED: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global fmt subscriber once per process. An application that
/// set up its own subscriber keeps it.
pub fn install(settings: &LogSettings) -> Result<Installed, InitError> {
    if INSTALLED.get().is_some() {
        return Ok(Installed::Existing);
    }
    let to_file = settings.file.is_some();
    let (writer, guard) = open_writer(settings)?;

    let installed = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(settings.directives()))
        .with_target(settings.level >= LogLevel::Debug)
        .with_ansi(!to_file)
        .with_writer(writer)
        .try_init();
    if let Err(err) = installed {
        tracing::debug!(target = "peer", error = %err, "keeping existing subscriber");
        return Ok(Installed::Existing);
    }
    if INSTALLED.set(guard).is_err() {
        return Ok(Installed::Existing);
    }
    if settings.throttles_dependencies() {
        tracing::info!(
            target = "peer",
            "dependency traces capped at info; set {DEPENDENCY_TRACE_ENV}=1 or {FILTER_ENV} to lift"
        );
    }
    Ok(Installed::Subscriber)
}

fn open_writer(settings: &LogSettings) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = &settings.file else {
        return Ok(tracing_appender::non_blocking(std::io::stderr()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::LogFile {
            path: path.clone(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

/// Offset, hex and printable columns, sixteen bytes per line.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 16);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", row * 16);
        for slot in 0..16 {
            match chunk.get(slot) {
                Some(byte) => {
                    let _ = write!(out, " {byte:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
