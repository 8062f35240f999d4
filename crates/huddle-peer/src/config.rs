use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::telemetry::{self, InitError, Installed, LogLevel, LogSettings};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(5000);
/// Largest JSON payload a data connection will put on the wire.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16_300;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Peer configuration: where the signaling server lives and how sessions are set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    /// `None` picks TLS for anything that is not a loopback host.
    pub secure: Option<bool>,
    /// Group to join; doubles as the signaling identity.
    pub group_id: Option<String>,
    pub pin: Option<String>,
    pub ping_interval: Duration,
    pub ice_servers: Vec<String>,
    pub max_message_size: usize,
    pub log_level: LogLevel,
    /// Log to this file instead of stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            secure: None,
            group_id: None,
            pin: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            log_level: LogLevel::default(),
            log_file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
}

/// On-disk shape; every field is optional and falls back to the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    secure: Option<bool>,
    group_id: Option<String>,
    pin: Option<String>,
    ping_interval_ms: Option<u64>,
    ice_servers: Option<Vec<String>>,
    max_message_size: Option<usize>,
    log_level: Option<LogLevel>,
    log_file: Option<PathBuf>,
}

impl PeerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }

    /// Load configuration from `HUDDLE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(host) = env_value("HUDDLE_HOST") {
            // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
            config.host = if host == "localhost" {
                "127.0.0.1".to_string()
            } else {
                host
            };
        }
        if let Some(port) = env_value("HUDDLE_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::Env {
                var: "HUDDLE_PORT",
                value: port,
            })?;
        }
        if let Some(secure) = env_value("HUDDLE_SECURE") {
            config.secure = Some(secure != "0" && secure != "false");
        }
        config.group_id = env_value("HUDDLE_GROUP");
        config.pin = env_value("HUDDLE_PIN");
        if let Some(raw) = env_value("HUDDLE_PING_INTERVAL_MS") {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::Env {
                var: "HUDDLE_PING_INTERVAL_MS",
                value: raw,
            })?;
            config.ping_interval = Duration::from_millis(millis);
        }
        if let Some(raw) = env_value("HUDDLE_MAX_MESSAGE_SIZE") {
            config.max_message_size = raw.parse().map_err(|_| ConfigError::Env {
                var: "HUDDLE_MAX_MESSAGE_SIZE",
                value: raw,
            })?;
        }
        if let Some(servers) = env_value("HUDDLE_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if env::var("HUDDLE_LOCALHOST_ONLY").is_ok() {
            config.ice_servers.clear();
        }
        if let Some(level) = env_value("HUDDLE_LOG") {
            config.log_level = level.parse().map_err(|_| ConfigError::Env {
                var: "HUDDLE_LOG",
                value: level,
            })?;
        }
        config.log_file = env_value("HUDDLE_LOG_FILE").map(PathBuf::from);
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw)?;
        let defaults = Self::default();
        Ok(Self {
            host: file.host.unwrap_or(defaults.host),
            port: file.port.unwrap_or(defaults.port),
            secure: file.secure,
            group_id: file.group_id,
            pin: file.pin,
            ping_interval: file
                .ping_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ping_interval),
            ice_servers: file.ice_servers.unwrap_or(defaults.ice_servers),
            max_message_size: file.max_message_size.unwrap_or(defaults.max_message_size),
            log_level: file.log_level.unwrap_or(defaults.log_level),
            log_file: file.log_file,
        })
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(pin.into());
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings::new(self.log_level)
            .with_file(self.log_file.clone())
            .with_env_overrides()
    }

    /// Install the process-wide subscriber from `log_level` / `log_file`.
    pub fn init_logging(&self) -> Result<Installed, InitError> {
        telemetry::install(&self.log_settings())
    }

    pub fn is_secure(&self) -> bool {
        self.secure.unwrap_or_else(|| !is_loopback(&self.host))
    }

    /// Base for the HTTP signaling endpoints, e.g. `https://host:443`.
    pub fn api_base_url(&self) -> Result<Url, url::ParseError> {
        let scheme = if self.is_secure() { "https" } else { "http" };
        Url::parse(&format!("{scheme}://{}:{}", self.host, self.port))
    }

    /// Socket endpoint for a signaling identity: `{ws|wss}://host:port/ws/{identity}/server`.
    pub fn socket_url(&self, identity: &str) -> Result<Url, url::ParseError> {
        let scheme = if self.is_secure() { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}", self.host, self.port))?;
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .extend(["ws", identity, "server"]);
        Ok(url)
    }
}

fn env_value(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn is_loopback(host: &str) -> bool {
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "HUDDLE_HOST",
        "HUDDLE_PORT",
        "HUDDLE_SECURE",
        "HUDDLE_GROUP",
        "HUDDLE_PIN",
        "HUDDLE_PING_INTERVAL_MS",
        "HUDDLE_MAX_MESSAGE_SIZE",
        "HUDDLE_ICE_SERVERS",
        "HUDDLE_LOCALHOST_ONLY",
        "HUDDLE_LOG",
        "HUDDLE_LOG_FILE",
        telemetry::FILTER_ENV,
        telemetry::DEPENDENCY_TRACE_ENV,
    ];

    fn clear_env() {
        for var in VARS {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn default_config_targets_loopback_without_tls() {
        let config = PeerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.is_secure());
        assert_eq!(config.ping_interval, Duration::from_millis(5000));
        assert_eq!(config.max_message_size, 16_300);
    }

    #[test]
    fn socket_url_embeds_identity() {
        let config = PeerConfig::default().with_host("signal.example.com", 443);
        let url = config.socket_url("group-7").unwrap();
        assert_eq!(url.as_str(), "wss://signal.example.com/ws/group-7/server");
        let insecure = config.with_secure(false).socket_url("g").unwrap();
        assert_eq!(insecure.as_str(), "ws://signal.example.com:443/ws/g/server");
    }

    #[test]
    fn api_base_url_uses_port() {
        let config = PeerConfig::default();
        assert_eq!(
            config.api_base_url().unwrap().as_str(),
            "http://127.0.0.1:8080/"
        );
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("HUDDLE_HOST", "localhost");
            env::set_var("HUDDLE_PORT", "9000");
            env::set_var("HUDDLE_GROUP", "standup");
            env::set_var("HUDDLE_PING_INTERVAL_MS", "250");
            env::set_var("HUDDLE_ICE_SERVERS", "stun:a:1, stun:b:2");
        }
        let config = PeerConfig::from_env().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.group_id.as_deref(), Some("standup"));
        assert_eq!(config.ping_interval, Duration::from_millis(250));
        assert_eq!(config.ice_servers, vec!["stun:a:1", "stun:b:2"]);
        clear_env();
    }

    #[test]
    fn from_env_rejects_bad_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("HUDDLE_PORT", "not-a-port") };
        let err = PeerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "HUDDLE_PORT", .. }));
        clear_env();
    }

    #[test]
    fn localhost_only_drops_stun() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("HUDDLE_LOCALHOST_ONLY", "1") };
        let config = PeerConfig::from_env().unwrap();
        assert!(config.ice_servers.is_empty());
        clear_env();
    }

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = PeerConfig::from_toml_str(
            r#"
            host = "rtc.internal"
            group_id = "design-review"
            ping_interval_ms = 1000
            log_level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "rtc.internal");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.group_id.as_deref(), Some("design-review"));
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn log_settings_follow_level_and_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("HUDDLE_LOG", "trace") };
        unsafe { env::set_var("HUDDLE_LOG_FILE", "/tmp/huddle.log") };
        let config = PeerConfig::from_env().unwrap();
        let settings = config.log_settings();
        assert_eq!(settings.level, LogLevel::Trace);
        assert_eq!(settings.file, Some(PathBuf::from("/tmp/huddle.log")));
        assert!(settings.directives().contains("tungstenite=info"));

        unsafe { env::set_var(telemetry::DEPENDENCY_TRACE_ENV, "1") };
        assert!(!config.log_settings().directives().contains("tungstenite=info"));

        unsafe { env::set_var(telemetry::FILTER_ENV, "huddle_peer=info") };
        assert_eq!(config.log_settings().directives(), "huddle_peer=info");
        clear_env();
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        assert!(PeerConfig::from_toml_str("colour = \"blue\"").is_err());
    }
}
