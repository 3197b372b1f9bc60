use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::core::model::SourceTransport;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub poll: PollConfig,
    pub fetch: FetchConfig,
    pub enrichment: EnrichmentConfig,
    pub grouping: GroupingConfig,
    pub fanout: FanoutConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// One configured Upstream endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
    #[serde(default = "default_transport")]
    pub transport: SourceTransport,
}

fn default_transport() -> SourceTransport {
    SourceTransport::DirectHttp
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub interval_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub backoff_initial_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub timeout_secs: u64,
    pub max_alerts_per_source: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub verify_first_n: u32,
}

/// One configured delivery destination.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    pub kind: DestinationKind,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Chat,
    Relay,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub max_attempts: u32,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub backoff_initial_secs: u64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub backoff_max_secs: u64,
    pub queue_capacity: usize,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides.
#[derive(Parser, Debug, Clone)]
#[command(name = "stellar-alertd")]
#[command(version, about = "Alert proxy: ingest, enrich, group, and forward firing alerts")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Logging level (overrides config file, e.g., "info,stellar_alertd=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Poll interval (overrides config file, e.g., "30s", "5m")
    #[arg(long, value_name = "DURATION")]
    pub poll_interval: Option<String>,

    /// Number of enrichment workers (overrides config file)
    #[arg(long, value_name = "N")]
    pub enrich_workers: Option<usize>,

    /// Perform a single poll-enrich-group-fanout pass against every
    /// configured Source and then exit, instead of starting the server.
    #[arg(long)]
    pub once: bool,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<(Self, CommandLineArgs), anyhow::Error> {
        dotenvy::dotenv().ok();

        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok((config, cli_args))
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST, APP_SERVER_PORT
    /// - APP_LOG_LEVEL
    /// - APP_POLL_INTERVAL_SECS (accepts "30s", "5m", "1h")
    /// - APP_ENRICHMENT_WORKERS
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(interval) = std::env::var("APP_POLL_INTERVAL_SECS") {
            match parse_duration_to_secs(&interval) {
                Ok(val) => {
                    self.poll.interval_secs = val;
                    tracing::info!("Override poll.interval_secs from env: {}", self.poll.interval_secs);
                },
                Err(e) => {
                    tracing::warn!(
                        "Invalid APP_POLL_INTERVAL_SECS '{}': {} (keep {})",
                        interval,
                        e,
                        self.poll.interval_secs
                    )
                },
            }
        }

        if let Ok(workers) = std::env::var("APP_ENRICHMENT_WORKERS")
            && let Ok(val) = workers.parse()
        {
            self.enrichment.workers = val;
            tracing::info!("Override enrichment.workers from env: {}", self.enrichment.workers);
        }
    }

    /// Apply command line argument overrides (highest priority).
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(interval) = &args.poll_interval {
            match parse_duration_to_secs(interval) {
                Ok(val) => {
                    self.poll.interval_secs = val;
                    tracing::info!("Override poll.interval_secs from CLI: {}", self.poll.interval_secs);
                },
                Err(e) => {
                    tracing::warn!(
                        "Invalid --poll-interval '{}': {} (keep {})",
                        interval,
                        e,
                        self.poll.interval_secs
                    )
                },
            }
        }

        if let Some(workers) = args.enrich_workers {
            self.enrichment.workers = workers;
            tracing::info!("Override enrichment.workers from CLI: {}", self.enrichment.workers);
        }
    }

    /// Validate configuration.
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server.port cannot be 0");
        }
        if self.enrichment.workers == 0 {
            anyhow::bail!("enrichment.workers must be > 0");
        }
        if self.enrichment.queue_capacity == 0 {
            anyhow::bail!("enrichment.queue_capacity must be > 0");
        }
        if self.fanout.queue_capacity == 0 {
            anyhow::bail!("fanout.queue_capacity must be > 0");
        }
        if self.fanout.max_attempts == 0 {
            anyhow::bail!("fanout.max_attempts must be > 0");
        }
        if self.grouping.verify_first_n == 0 {
            anyhow::bail!("grouping.verify_first_n must be > 0");
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.id) {
                anyhow::bail!("duplicate source id: {}", source.id);
            }
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_secs: 30, backoff_initial_secs: 1, backoff_max_secs: 300 }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_secs: 10, max_alerts_per_source: 500 }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self { workers: 4, queue_capacity: 1024, timeout_secs: 90 }
    }
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self { verify_first_n: 5 }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_initial_secs: 1,
            backoff_max_secs: 60,
            queue_capacity: 256,
            destinations: Vec::new(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 10 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,stellar_alertd=debug".to_string(), file: Some("logs/stellar-alertd.log".to_string()) }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        "d" | "day" | "days" => Ok(n * 60 * 60 * 24),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

// Custom serde deserializer to support numeric or human-friendly string values.
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}
