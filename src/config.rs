//! Configuration consumed by the connection, task client, runner and mediator.
//!
//! All structs implement `Default` and `Deserialize`; durations are plain
//! millisecond fields so a JSON document maps onto them directly. Locating and
//! reading configuration files is left to the embedding binary.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TaskwireError};
use crate::mediator::RunnerFilter;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::writer::WriterConfig;

/// Per-connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest payload of a single frame. Larger writes are fragmented.
    pub max_frame_size: u32,
    /// How often a heartbeat frame is sent. 0 disables sending.
    pub heartbeat_interval_ms: u64,
    /// Close the connection when nothing arrives for this long. 0 disables.
    pub heartbeat_timeout_ms: u64,
    /// Pending frames before channel writes wait. `None` = unbounded.
    pub max_pending_frames: Option<usize>,
    /// How long a write waits under backpressure.
    pub backpressure_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            max_pending_frames: None,
            backpressure_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }

    pub fn with_heartbeat(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self.heartbeat_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }

    /// Reject settings the connection cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(TaskwireError::Config("max_frame_size must be > 0".into()));
        }
        if let (Some(interval), Some(timeout)) = (self.heartbeat_interval(), self.heartbeat_timeout()) {
            if interval >= timeout {
                return Err(TaskwireError::Config(format!(
                    "heartbeat interval {:?} must be shorter than timeout {:?}",
                    interval, timeout
                )));
            }
        }
        Ok(())
    }
}

/// How a client decides to trust the server certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Verify against the operating system's root store.
    #[default]
    SystemRoots,
    /// Accept exactly the leaf certificate with this SHA-256 hex thumbprint.
    Thumbprint(String),
    /// Accept any certificate. Diagnostic use only.
    Unchecked,
}

/// Client-side TLS settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    pub trust: TrustMode,
    /// Name to verify and send as SNI. Defaults to the endpoint host.
    pub server_name: Option<String>,
}

/// Server-side TLS settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsServerConfig {
    /// PEM certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
}

/// Where the task client sends work.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// A runner at `host:port`.
    Runner(String),
    /// A mediator at `host:port` that picks the runner.
    Mediator(String),
}

/// Task client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Attempts before giving up. `<= 0` means unlimited.
    pub max_tries: i32,
    /// Deadline measured from submission. `None` waits forever.
    pub timeout_ms: Option<u64>,
    /// Pause before a retry.
    pub retry_delay_ms: u64,
    pub target: Target,
    pub filter: RunnerFilter,
    pub connection: ConnectionConfig,
    pub tls: TlsClientConfig,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            timeout_ms: None,
            retry_delay_ms: 100,
            target: Target::Runner("127.0.0.1:7420".to_string()),
            filter: RunnerFilter::default(),
            connection: ConnectionConfig::default(),
            tls: TlsClientConfig::default(),
        }
    }
}

impl TaskConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn with_max_tries(mut self, max_tries: i32) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_filter(mut self, filter: RunnerFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_tries <= 0 || attempts < self.max_tries as u32
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Runner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Stable identity reported to the mediator.
    pub runner_id: String,
    /// Address applications should dial, as reported to the mediator.
    pub advertise_endpoint: String,
    pub platform: String,
    pub os_version: String,
    pub label: Option<String>,
    pub tags: Vec<String>,
    /// Tasks executed concurrently.
    pub slots: usize,
    /// Mediator to report status to, if any.
    pub mediator: Option<String>,
    pub status_interval_ms: u64,
    /// Delay before reconnecting to the mediator after a failure.
    pub reconnect_delay_ms: u64,
    /// Evict cached resources older than this. `None` keeps them forever.
    pub cache_max_age_ms: Option<u64>,
    pub cache_sweep_interval_ms: u64,
    pub connection: ConnectionConfig,
    pub tls: TlsClientConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: uuid::Uuid::new_v4().to_string(),
            advertise_endpoint: "127.0.0.1:7420".to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            os_version: std::env::consts::OS.to_string(),
            label: None,
            tags: Vec::new(),
            slots: 4,
            mediator: None,
            status_interval_ms: 5_000,
            reconnect_delay_ms: 1_000,
            cache_max_age_ms: Some(3_600_000),
            cache_sweep_interval_ms: 60_000,
            connection: ConnectionConfig::default(),
            tls: TlsClientConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn cache_max_age(&self) -> Option<Duration> {
        self.cache_max_age_ms.map(Duration::from_millis)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Mediator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediatorConfig {
    /// Forget a runner that has not reported for this long.
    pub staleness_ms: u64,
    pub sweep_interval_ms: u64,
    pub connection: ConnectionConfig,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            staleness_ms: 15_000,
            sweep_interval_ms: 5_000,
            connection: ConnectionConfig::default(),
        }
    }
}

impl MediatorConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
