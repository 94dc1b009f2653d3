// Worker configuration
//
// Design Decision: Every flag has an environment fallback so the same
// binary runs unchanged from a shell, a .env file or a container environment.
// Design Decision: Broker and result backend are selected by URL scheme.

use std::time::Duration;

use clap::Parser;
use taskward_engine::WorkerConfig;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported {role} URL scheme: {url} (expected memory:// or postgres://)")]
    UnsupportedScheme { role: &'static str, url: String },

    #[error("invalid log level: {0} (expected trace, debug, info, warning, error or critical)")]
    InvalidLogLevel(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("at least one queue name is required")]
    NoQueues,
}

#[derive(Parser, Debug)]
#[command(name = "taskward-worker")]
#[command(about = "Taskward worker - consume and execute queued tasks")]
#[command(version)]
pub struct Cli {
    /// Number of tasks executed at once
    #[arg(long, short = 'c', env = "TASKWARD_CONCURRENCY", default_value_t = 4)]
    pub concurrency: usize,

    /// Log level (trace, debug, info, warning, error, critical); RUST_LOG takes precedence
    #[arg(long, short = 'l', env = "LOG_LEVEL", default_value = "info")]
    pub loglevel: String,

    /// Broker URL
    #[arg(long, env = "TASKWARD_BROKER_URL", default_value = "memory://")]
    pub broker_url: String,

    /// Result backend URL (defaults to the broker URL)
    #[arg(long, env = "TASKWARD_RESULT_BACKEND")]
    pub result_backend: Option<String>,

    /// Queues to consume, in priority order
    #[arg(
        long,
        short = 'Q',
        env = "TASKWARD_QUEUES",
        value_delimiter = ',',
        default_value = "default"
    )]
    pub queues: Vec<String>,

    /// Seconds in-flight tasks get to finish after a shutdown signal
    #[arg(long, env = "TASKWARD_DRAIN_TIMEOUT", default_value_t = 30)]
    pub drain_timeout: u64,

    /// Seconds a fetched message stays invisible before the broker redelivers it
    #[arg(long, env = "TASKWARD_VISIBILITY_TIMEOUT", default_value_t = 3600)]
    pub visibility_timeout: u64,

    /// Worker ID (generated if omitted)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,
}

/// Where messages or results live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// In-process; nothing survives a restart
    Memory,
    /// PostgreSQL at the given URL
    Postgres(String),
}

impl Transport {
    fn parse(role: &'static str, url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        let scheme = url.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("memory") => Ok(Self::Memory),
            // Result backends also accept the cache-style spelling
            Some("cache+memory") if role == "result backend" => Ok(Self::Memory),
            Some("postgres") | Some("postgresql") => Ok(Self::Postgres(url.to_string())),
            _ => Err(ConfigError::UnsupportedScheme {
                role,
                url: url.to_string(),
            }),
        }
    }
}

/// Validated worker settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker: WorkerConfig,
    pub queues: Vec<String>,
    pub log_level: &'static str,
    pub broker: Transport,
    pub backend: Transport,
    pub visibility_timeout: Duration,
}

impl WorkerSettings {
    /// Validate parsed command-line arguments
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let log_level = parse_log_level(&cli.loglevel)?;

        if cli.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        let queues: Vec<String> = cli
            .queues
            .iter()
            .map(|q| q.trim())
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();
        if queues.is_empty() {
            return Err(ConfigError::NoQueues);
        }

        let broker = Transport::parse("broker", &cli.broker_url)?;
        let backend = Transport::parse(
            "result backend",
            cli.result_backend.as_deref().unwrap_or(&cli.broker_url),
        )?;

        let mut worker = WorkerConfig::new()
            .with_concurrency(cli.concurrency)
            .with_drain_timeout(Duration::from_secs(cli.drain_timeout));
        if let Some(id) = cli.worker_id {
            worker = worker.with_worker_id(id);
        }

        Ok(Self {
            worker,
            queues,
            log_level,
            broker,
            backend,
            visibility_timeout: Duration::from_secs(cli.visibility_timeout),
        })
    }
}

/// Map a log level name to a tracing filter directive
///
/// Accepts the usual tracing names plus `warning`, `critical` and `fatal`.
pub fn parse_log_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "critical" | "fatal" => Ok("error"),
        _ => Err(ConfigError::InvalidLogLevel(level.to_string())),
    }
}
