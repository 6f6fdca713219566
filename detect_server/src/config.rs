use detect_types::settings::deserialize_log_level;
pub use detect_types::settings::{Environment, LogLevel};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How to launch the detection worker and how many may run at once.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_max_queued() -> usize {
    16
}

fn default_queue_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_run_timeout_ms() -> u64 {
    30_000
}

impl WorkerConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.program.as_os_str().is_empty() {
            return Err("worker.program must not be empty".into());
        }
        if self.max_concurrent == 0 {
            return Err("worker.max_concurrent must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Upper bound on the base64 payload handed to a worker.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_max_payload_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

impl LimitsConfig {
    /// Raw bodies are at most 3/4 of their base64 size, but JSON bodies carry
    /// the base64 text itself plus framing, so leave some headroom.
    pub fn max_body_bytes(&self) -> usize {
        self.max_payload_bytes.saturating_add(64 * 1024)
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {e}")))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("DETECT")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.worker.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_defaults_apply() {
        let raw = r#"{ "program": "python3", "args": ["scripts/detect.py"] }"#;
        let worker: WorkerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(worker.max_queued, 16);
        assert_eq!(worker.run_timeout(), Duration::from_secs(30));
        assert!(worker.max_concurrent >= 1);
        assert!(worker.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let raw = r#"{ "program": "detect_worker", "max_concurrent": 0 }"#;
        let worker: WorkerConfig = serde_json::from_str(raw).unwrap();
        assert!(worker.validate().is_err());
    }
}
