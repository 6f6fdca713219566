use detect_types::settings::deserialize_log_level;
pub use detect_types::settings::{Environment, LogLevel};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    /// Full URL of the detection endpoint, e.g. `http://127.0.0.1:8000/detect`.
    pub endpoint: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    pub camera: CameraConfig,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Deserialize, Debug)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: i32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_start_retries")]
    pub start_retries: u32,
    #[serde(default = "default_start_backoff_ms")]
    pub start_backoff_ms: u64,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_start_retries() -> u32 {
    3
}

fn default_start_backoff_ms() -> u64 {
    500
}

impl CameraConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn start_backoff(&self) -> Duration {
        Duration::from_millis(self.start_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval_ms == 0 {
            return Err("camera.interval_ms must be at least 1".into());
        }
        if self.device_index < 0 {
            return Err("camera.device_index must not be negative".into());
        }
        Ok(())
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
            config::Environment::with_prefix("CAPTURE")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    config
        .camera
        .validate()
        .map_err(config::ConfigError::Message)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_defaults_apply() {
        let camera: CameraConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(camera.device_index, 0);
        assert_eq!(camera.interval(), Duration::from_secs(1));
        assert_eq!(camera.start_retries, 3);
        assert_eq!(camera.start_backoff(), Duration::from_millis(500));
        assert!(camera.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let camera: CameraConfig = serde_json::from_str(r#"{ "interval_ms": 0 }"#).unwrap();
        assert!(camera.validate().is_err());
    }
}
