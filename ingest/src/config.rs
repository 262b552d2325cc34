//! Ingestion configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};

/// Wire protocol used to reach the rate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Kafka topic consumed from every partition.
    Kafka,
    /// Newline-delimited JSON over a plain TCP subscription.
    Tcp,
}

impl FromStr for Transport {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(Transport::Kafka),
            "tcp" => Ok(Transport::Tcp),
            other => Err(IngestError::Configuration(format!(
                "Unknown transport {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Kafka => f.write_str("kafka"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// Where a fresh Kafka subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Only messages produced after the subscription.
    Latest,
    /// The oldest retained message of each partition.
    Earliest,
}

impl FromStr for StartFrom {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(StartFrom::Latest),
            "earliest" => Ok(StartFrom::Earliest),
            other => Err(IngestError::Configuration(format!(
                "Unknown start offset {:?}",
                other
            ))),
        }
    }
}

/// Configuration for the rate stream subscription and its supervisor.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Wire protocol of the stream.
    pub transport: Transport,
    /// Stream host (the Kafka bootstrap broker for [`Transport::Kafka`]).
    pub host: String,
    /// Stream port.
    pub port: u16,
    /// Topic carrying rate snapshot messages.
    pub topic: String,
    /// Starting offset of a new Kafka subscription.
    pub start_from: StartFrom,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Largest accepted message, in bytes.
    pub max_message_bytes: usize,
    /// Restart the pipeline after a fatal stream failure.
    pub restart_on_failure: bool,
    /// Delay before a restart.
    pub restart_delay: Duration,
    /// Maximum number of restarts before the process gives up.
    pub max_restarts: usize,
    /// Table age after which the watchdog reports it as stale.
    pub stale_after: Duration,
    /// Log level.
    pub log_level: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Kafka,
            host: "127.0.0.1".to_string(),
            port: 9092,
            topic: "currency-rates".to_string(),
            start_from: StartFrom::Latest,
            connect_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            restart_on_failure: true,
            restart_delay: Duration::from_secs(1),
            max_restarts: 10,
            stale_after: Duration::from_secs(60),
            log_level: "info".to_string(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(transport) = parse_env("RATE_FEED_TRANSPORT") {
            config.transport = transport;
        }

        if let Ok(host) = std::env::var("RATE_FEED_HOST") {
            config.host = host;
        }

        if let Some(port) = parse_env("RATE_FEED_PORT") {
            config.port = port;
        }

        if let Ok(topic) = std::env::var("RATE_FEED_TOPIC") {
            config.topic = topic;
        }

        if let Some(start_from) = parse_env("RATE_FEED_START_FROM") {
            config.start_from = start_from;
        }

        if let Some(ms) = parse_env("RATE_FEED_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(bytes) = parse_env("RATE_FEED_MAX_MESSAGE_BYTES") {
            config.max_message_bytes = bytes;
        }

        if let Some(restart) = parse_env("RATE_FEED_RESTART") {
            config.restart_on_failure = restart;
        }

        if let Some(ms) = parse_env("RATE_FEED_RESTART_DELAY_MS") {
            config.restart_delay = Duration::from_millis(ms);
        }

        if let Some(max) = parse_env("RATE_FEED_MAX_RESTARTS") {
            config.max_restarts = max;
        }

        if let Some(ms) = parse_env("RATE_FEED_STALE_AFTER_MS") {
            config.stale_after = Duration::from_millis(ms);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// `host:port` address of the stream.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate configuration.
    pub fn validate(&self) -> IngestResult<()> {
        if self.host.is_empty() {
            return Err(IngestError::Configuration("Stream host cannot be empty".to_string()));
        }

        if self.port == 0 {
            return Err(IngestError::Configuration("Stream port cannot be 0".to_string()));
        }

        if self.topic.is_empty() {
            return Err(IngestError::Configuration("Stream topic cannot be empty".to_string()));
        }

        if self.connect_timeout.is_zero() {
            return Err(IngestError::Configuration(
                "Connect timeout cannot be zero".to_string(),
            ));
        }

        if self.max_message_bytes == 0 {
            return Err(IngestError::Configuration(
                "Maximum message size cannot be zero".to_string(),
            ));
        }

        if self.stale_after.is_zero() {
            return Err(IngestError::Configuration(
                "Staleness threshold cannot be zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}
