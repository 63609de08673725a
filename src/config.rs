//! Configuration for single-process runs and federations.
//!
//! Configurations load from YAML or JSON. All times are nanoseconds except
//! `grant_timeout_ms`, which bounds a physical wait.
//!
//! # Configuration File Structure
//!
//! ```yaml
//! runtime:
//!   fast: true
//!   timeout: 100000000        # 100 ms of logical time
//!   workers: 4
//!   log_level: info
//!
//! federation:
//!   coordination: centralized
//!   coordinator_addr: 127.0.0.1:15045
//!   grant_timeout_ms: 5000
//!   grant_timeout_policy: warn
//!
//! federates:
//!   - id: 0
//!     name: sender
//!   - id: 1
//!     name: receiver
//!
//! connections:
//!   - src: 0
//!     src_port: source.out
//!     dst: 1
//!     dst_port: sink.in
//!     delay: 10000000         # after 10 ms
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::federated::federate::FederateOptions;
use crate::federated::topology::Topology;
use crate::scheduler::SchedulerOptions;
use crate::types::{FederateId, Interval};

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Execution parameters shared by every scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeParams {
    /// Run as fast as possible instead of pacing logical time against
    /// physical time
    #[serde(default)]
    pub fast: bool,

    /// Logical time at which to stop, in nanoseconds
    #[serde(default)]
    pub timeout: Option<Interval>,

    /// Worker threads per scheduler (0 or 1 runs reactions inline)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Keep running with an empty event queue, waiting for physical actions
    #[serde(default)]
    pub keepalive: bool,

    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Record the port values of every processed tag
    #[serde(default)]
    pub trace: bool,
}

fn default_workers() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RuntimeParams {
    fn default() -> Self {
        Self {
            fast: false,
            timeout: None,
            workers: default_workers(),
            keepalive: false,
            log_level: default_log_level(),
            trace: false,
        }
    }
}

/// How federates decide that a tag is safe to process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationMode {
    /// The coordinator grants every advance.
    #[default]
    Centralized,
    /// Each federate waits out a safe-to-advance offset on its own.
    Decentralized,
}

/// What a federate does when a grant takes longer than `grant_timeout_ms`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantTimeoutPolicy {
    /// Log a warning and keep waiting.
    #[default]
    Warn,
    /// Fail the federate with a grant timeout.
    Escalate,
}

/// Federation-wide parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FederationParams {
    #[serde(default)]
    pub coordination: CoordinationMode,

    /// Address the coordinator listens on
    #[serde(default = "default_coordinator_addr")]
    pub coordinator_addr: String,

    /// Bound on a single grant wait, in milliseconds
    #[serde(default = "default_grant_timeout_ms")]
    pub grant_timeout_ms: u64,

    #[serde(default)]
    pub grant_timeout_policy: GrantTimeoutPolicy,

    /// Safe-to-advance offset for decentralized coordination, in nanoseconds
    #[serde(default)]
    pub sta_offset: Interval,
}

fn default_coordinator_addr() -> String {
    "127.0.0.1:15045".to_string()
}

fn default_grant_timeout_ms() -> u64 {
    5000
}

impl Default for FederationParams {
    fn default() -> Self {
        Self {
            coordination: CoordinationMode::default(),
            coordinator_addr: default_coordinator_addr(),
            grant_timeout_ms: default_grant_timeout_ms(),
            grant_timeout_policy: GrantTimeoutPolicy::default(),
            sta_offset: 0,
        }
    }
}

/// One federate of a federation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FederateConfig {
    pub id: FederateId,

    #[serde(default)]
    pub name: String,
}

/// A connection between ports of two federates.
///
/// Ports are named `"reactor.port"` inside the owning federate's program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub src: FederateId,
    pub src_port: String,
    #[serde(default)]
    pub src_channel: usize,

    pub dst: FederateId,
    pub dst_port: String,
    #[serde(default)]
    pub dst_channel: usize,

    /// `None` for same-tag delivery, `Some(0)` for one microstep
    #[serde(default)]
    pub delay: Option<Interval>,
}

/// Complete configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeParams,

    #[serde(default)]
    pub federation: FederationParams,

    #[serde(default)]
    pub federates: Vec<FederateConfig>,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates the entire configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(timeout) = self.runtime.timeout {
            if timeout < 0 {
                return Err(ConfigError::Validation(format!(
                    "Negative timeout: {timeout}"
                )));
            }
        }
        if self.federation.grant_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "grant_timeout_ms must be positive".to_string(),
            ));
        }
        if self.federation.sta_offset < 0 {
            return Err(ConfigError::Validation(format!(
                "Negative sta_offset: {}",
                self.federation.sta_offset
            )));
        }

        let mut ids = HashSet::new();
        for fed in &self.federates {
            if !ids.insert(fed.id) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate federate ID: {}",
                    fed.id
                )));
            }
        }

        for (index, conn) in self.connections.iter().enumerate() {
            for end in [conn.src, conn.dst] {
                if !ids.contains(&end) {
                    return Err(ConfigError::Validation(format!(
                        "Connection {index} references non-existent federate: {end}"
                    )));
                }
            }
            if conn.src == conn.dst {
                return Err(ConfigError::Validation(format!(
                    "Connection {index} connects federate {} to itself",
                    conn.src
                )));
            }
            if let Some(delay) = conn.delay {
                if delay < 0 {
                    return Err(ConfigError::Validation(format!(
                        "Connection {index} has negative delay {delay}"
                    )));
                }
            }
            for port in [&conn.src_port, &conn.dst_port] {
                if !port.contains('.') {
                    return Err(ConfigError::Validation(format!(
                        "Connection {index}: port '{port}' is not of the form reactor.port"
                    )));
                }
            }
        }

        // without grants nothing resolves a same-tag loop between federates
        if self.federation.coordination == CoordinationMode::Decentralized {
            let topology = Topology::from_config(self);
            if let Some(fed) = self
                .federates
                .iter()
                .find(|f| topology.in_zero_delay_cycle(f.id))
            {
                return Err(ConfigError::Validation(format!(
                    "Federate {} is on a zero-delay cycle, which decentralized coordination cannot run",
                    fed.id
                )));
            }
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    /// Saves configuration to a JSON file.
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Converts to YAML string.
    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Converts to JSON string.
    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn federate_count(&self) -> usize {
        self.federates.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn find_federate(&self, id: FederateId) -> Option<&FederateConfig> {
        self.federates.iter().find(|f| f.id == id)
    }

    /// Bound on a single grant wait.
    pub fn grant_timeout(&self) -> Duration {
        Duration::from_millis(self.federation.grant_timeout_ms)
    }

    /// Scheduler options derived from the runtime section.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            fast: self.runtime.fast,
            timeout: self.runtime.timeout,
            workers: self.runtime.workers,
            keepalive: self.runtime.keepalive,
            trace: self.runtime.trace,
        }
    }

    /// Options for federate `id`.
    pub fn federate_options(&self, id: FederateId) -> ConfigResult<FederateOptions> {
        let fed = self.find_federate(id).ok_or_else(|| {
            ConfigError::Validation(format!("Unknown federate ID: {id}"))
        })?;
        Ok(FederateOptions {
            id,
            name: if fed.name.is_empty() {
                format!("federate{id}")
            } else {
                fed.name.clone()
            },
            coordination: self.federation.coordination,
            grant_timeout: self.grant_timeout(),
            grant_timeout_policy: self.federation.grant_timeout_policy,
            sta_offset: self.federation.sta_offset,
            scheduler: self.scheduler_options(),
        })
    }
}

/// Builder for creating a [`RuntimeConfig`] programmatically.
#[derive(Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fast(mut self, fast: bool) -> Self {
        self.config.runtime.fast = fast;
        self
    }

    /// Sets the logical stop time.
    pub fn timeout(mut self, timeout: Interval) -> Self {
        self.config.runtime.timeout = Some(timeout);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.runtime.workers = workers;
        self
    }

    pub fn keepalive(mut self, keepalive: bool) -> Self {
        self.config.runtime.keepalive = keepalive;
        self
    }

    pub fn trace(mut self, trace: bool) -> Self {
        self.config.runtime.trace = trace;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.runtime.log_level = level.into();
        self
    }

    pub fn coordination(mut self, mode: CoordinationMode) -> Self {
        self.config.federation.coordination = mode;
        self
    }

    pub fn coordinator_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.federation.coordinator_addr = addr.into();
        self
    }

    pub fn grant_timeout_ms(mut self, ms: u64) -> Self {
        self.config.federation.grant_timeout_ms = ms;
        self
    }

    pub fn grant_timeout_policy(mut self, policy: GrantTimeoutPolicy) -> Self {
        self.config.federation.grant_timeout_policy = policy;
        self
    }

    pub fn sta_offset(mut self, offset: Interval) -> Self {
        self.config.federation.sta_offset = offset;
        self
    }

    pub fn add_federate(mut self, id: FederateId, name: impl Into<String>) -> Self {
        self.config.federates.push(FederateConfig {
            id,
            name: name.into(),
        });
        self
    }

    /// Connects `src_port` of federate `src` to `dst_port` of `dst`.
    pub fn connect(
        mut self,
        src: FederateId,
        src_port: impl Into<String>,
        dst: FederateId,
        dst_port: impl Into<String>,
        delay: Option<Interval>,
    ) -> Self {
        self.config.connections.push(ConnectionConfig {
            src,
            src_port: src_port.into(),
            src_channel: 0,
            dst,
            dst_port: dst_port.into(),
            dst_channel: 0,
            delay,
        });
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
