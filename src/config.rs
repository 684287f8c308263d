//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Layering order is defaults, then the YAML file, then environment, then flags.

use crate::storage_types::StorageConfig;
use crate::{GatewayError, Result};
use clap::{Arg, ArgAction, Command};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "250ms"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let secs = match unit {
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            "s" | "sec" | "secs" | "second" | "seconds" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "" => value, // bare numbers are seconds
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Duration out of range '{}': {}", s, e))
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Upper bound on the whole shutdown sequence
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub shutdown_timeout: Duration,
    /// How long open connections may keep streaming after shutdown begins
    #[serde(
        default = "default_drain_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub drain_timeout: Duration,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            shutdown_timeout: default_shutdown_timeout(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Reset on every chunk; fires only when a transfer stalls
    #[serde(
        default = "default_idle_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub idle_timeout: Duration,
    /// Hard cap enforced by the janitor regardless of activity
    #[serde(
        default = "default_max_stream_age",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub max_stream_age: Duration,
    /// Chunks buffered between the backend pump and the client body
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_stream_age() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_channel_capacity() -> usize {
    16
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            max_stream_age: default_max_stream_age(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Per-file admission control configuration
///
/// Burst delay is `min(burst_window, burst_base_delay_cap)
/// + min((counter - burst_threshold) * per_excess_penalty, excess_penalty_cap)
/// + jitter(0..max_jitter)`.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(
        default = "default_burst_window",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub burst_window: Duration,
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,
    #[serde(
        default = "default_burst_base_delay_cap",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub burst_base_delay_cap: Duration,
    #[serde(
        default = "default_per_excess_penalty",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub per_excess_penalty: Duration,
    #[serde(
        default = "default_excess_penalty_cap",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub excess_penalty_cap: Duration,
    #[serde(
        default = "default_max_jitter",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub max_jitter: Duration,
    /// Idle time after which the janitor forgets a key's burst state
    #[serde(
        default = "default_state_idle_ttl",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub state_idle_ttl: Duration,
    /// Unset means queued requests wait indefinitely
    #[serde(default, deserialize_with = "duration_serde::deserialize_option")]
    pub queue_timeout: Option<Duration>,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_burst_window() -> Duration {
    Duration::from_secs(2)
}

fn default_burst_threshold() -> u32 {
    3
}

fn default_burst_base_delay_cap() -> Duration {
    Duration::from_secs(2)
}

fn default_per_excess_penalty() -> Duration {
    Duration::from_millis(500)
}

fn default_excess_penalty_cap() -> Duration {
    Duration::from_secs(3)
}

fn default_max_jitter() -> Duration {
    Duration::from_millis(250)
}

fn default_state_idle_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            burst_window: default_burst_window(),
            burst_threshold: default_burst_threshold(),
            burst_base_delay_cap: default_burst_base_delay_cap(),
            per_excess_penalty: default_per_excess_penalty(),
            excess_penalty_cap: default_excess_penalty_cap(),
            max_jitter: default_max_jitter(),
            state_idle_ttl: default_state_idle_ttl(),
            queue_timeout: None,
        }
    }
}

/// Metadata resolver configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(
        default = "default_metadata_ttl",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub ttl: Duration,
    #[serde(default = "default_metadata_max_entries")]
    pub max_entries: usize,
    /// How long a completed single-flight result is reused by trailing callers
    #[serde(
        default = "default_lock_grace",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub lock_grace: Duration,
}

fn default_metadata_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_metadata_max_entries() -> usize {
    10_000
}

fn default_lock_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            ttl: default_metadata_ttl(),
            max_entries: default_metadata_max_entries(),
            lock_grace: default_lock_grace(),
        }
    }
}

/// Background sweeper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    #[serde(
        default = "default_janitor_interval",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub interval: Duration,
}

fn default_janitor_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: default_janitor_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, application logs are also written to a daily rolling file here
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize")]
    pub app_log_dir: Option<PathBuf>,
    #[serde(default = "default_access_log_enabled")]
    pub access_log_enabled: bool,
    /// Raises per-stream lifecycle events from debug to info
    #[serde(default)]
    pub debug_streaming: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_access_log_enabled() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
            access_log_enabled: default_access_log_enabled(),
            debug_streaming: false,
        }
    }
}

/// Static record store contents
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub storages: Vec<CatalogStorage>,
    #[serde(default)]
    pub files: Vec<CatalogFile>,
}

/// One storage account, addressed by id from file records
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogStorage {
    pub id: String,
    #[serde(flatten)]
    pub config: StorageConfig,
}

/// One logical file name mapped to an object in a storage account
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogFile {
    pub name: String,
    pub storage_location_id: String,
    pub file_path: String,
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        Self::load_from_args(std::env::args_os())
    }

    /// Same as [`Config::load`] with an explicit argument list
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| GatewayError::ConfigError(e.to_string()))?;

        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&matches);
        config.validate()?;

        info!(
            "Admission: max_concurrent={}, burst_window={}ms, burst_threshold={}, queue_timeout={:?}",
            config.admission.max_concurrent,
            config.admission.burst_window.as_millis(),
            config.admission.burst_threshold,
            config.admission.queue_timeout
        );
        info!(
            "Streaming: idle_timeout={}s, max_stream_age={}s; metadata ttl={}s",
            config.streaming.idle_timeout.as_secs(),
            config.streaming.max_stream_age.as_secs(),
            config.metadata.ttl.as_secs()
        );
        info!(
            "Catalog: {} storages, {} files",
            config.catalog.storages.len(),
            config.catalog.files.len()
        );
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("s3-stream-gateway")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Range-aware HTTP streaming gateway for S3-compatible storage")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("bind-address")
                    .long("bind-address")
                    .value_name("ADDR")
                    .help("Listen address (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level: trace, debug, info, warn, error"),
            )
            .arg(
                Arg::new("max-concurrent-per-file")
                    .long("max-concurrent-per-file")
                    .value_name("N")
                    .help("Concurrent backend downloads allowed per file (default: 3)"),
            )
            .arg(
                Arg::new("idle-timeout")
                    .long("idle-timeout")
                    .value_name("DURATION")
                    .help("Stalled stream timeout, e.g. 5m (default: 5m)"),
            )
            .arg(
                Arg::new("queue-timeout")
                    .long("queue-timeout")
                    .value_name("DURATION")
                    .help("Give up on queued requests after this long (default: unbounded)"),
            )
            .arg(
                Arg::new("debug-streaming")
                    .long("debug-streaming")
                    .action(ArgAction::SetTrue)
                    .help("Log per-stream lifecycle events at info level"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            GatewayError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any variable source; unparsable values are ignored
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.server.http_port = port;
        }

        if let Some(addr) = lookup("BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Some(dir) = lookup("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(pathbuf_serde::expand_tilde(&dir));
        }

        if let Some(n) = lookup("MAX_CONCURRENT_PER_FILE").and_then(|v| v.parse().ok()) {
            self.admission.max_concurrent = n;
        }

        if let Some(d) = lookup("STREAM_IDLE_TIMEOUT")
            .and_then(|v| duration_serde::parse_duration(&v).ok())
        {
            self.streaming.idle_timeout = d;
        }

        if let Some(d) =
            lookup("METADATA_TTL").and_then(|v| duration_serde::parse_duration(&v).ok())
        {
            self.metadata.ttl = d;
        }

        if let Some(d) = lookup("ADMISSION_QUEUE_TIMEOUT")
            .and_then(|v| duration_serde::parse_duration(&v).ok())
        {
            self.admission.queue_timeout = Some(d);
        }

        if let Some(flag) = lookup("DEBUG_FILE_STREAMING") {
            self.logging.debug_streaming = flag.eq_ignore_ascii_case("true") || flag == "1";
        }
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) {
        if let Some(port) = matches
            .get_one::<String>("http-port")
            .and_then(|p| p.parse().ok())
        {
            self.server.http_port = port;
        }

        if let Some(addr) = matches.get_one::<String>("bind-address") {
            self.server.bind_address = addr.clone();
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if let Some(n) = matches
            .get_one::<String>("max-concurrent-per-file")
            .and_then(|n| n.parse().ok())
        {
            self.admission.max_concurrent = n;
        }

        if let Some(d) = matches
            .get_one::<String>("idle-timeout")
            .and_then(|d| duration_serde::parse_duration(d).ok())
        {
            self.streaming.idle_timeout = d;
        }

        if let Some(d) = matches
            .get_one::<String>("queue-timeout")
            .and_then(|d| duration_serde::parse_duration(d).ok())
        {
            self.admission.queue_timeout = Some(d);
        }

        if matches.get_flag("debug-streaming") {
            self.logging.debug_streaming = true;
        }
    }

    /// Reject configurations the runtime cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.admission.max_concurrent == 0 {
            return Err(GatewayError::ConfigError(
                "admission.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.admission.burst_threshold == 0 {
            return Err(GatewayError::ConfigError(
                "admission.burst_threshold must be at least 1".to_string(),
            ));
        }
        if self.admission.queue_timeout == Some(Duration::ZERO) {
            return Err(GatewayError::ConfigError(
                "admission.queue_timeout must be positive when set".to_string(),
            ));
        }
        if self.streaming.idle_timeout.is_zero() {
            return Err(GatewayError::ConfigError(
                "streaming.idle_timeout must be positive".to_string(),
            ));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(GatewayError::ConfigError(
                "streaming.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.metadata.ttl.is_zero() {
            return Err(GatewayError::ConfigError(
                "metadata.ttl must be positive".to_string(),
            ));
        }
        if self.janitor.interval.is_zero() {
            return Err(GatewayError::ConfigError(
                "janitor.interval must be positive".to_string(),
            ));
        }

        for file in &self.catalog.files {
            if !self
                .catalog
                .storages
                .iter()
                .any(|s| s.id == file.storage_location_id)
            {
                return Err(GatewayError::ConfigError(format!(
                    "catalog file '{}' references unknown storage '{}'",
                    file.name, file.storage_location_id
                )));
            }
        }

        Ok(())
    }
}
