//! Settings shared by the binaries' configuration layers.

use serde::Deserialize;

/// Selects `configuration/<env>.yaml` on top of `base.yaml`.
#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// For `#[serde(deserialize_with = "...")]` on a case-insensitive level.
pub fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Logging {
        #[serde(deserialize_with = "deserialize_log_level")]
        log_level: LogLevel,
    }

    #[test]
    fn test_log_level_parsing_is_case_insensitive() {
        assert!(matches!(LogLevel::try_from("DEBUG".to_string()), Ok(LogLevel::Debug)));
        assert!(LogLevel::try_from("trace".to_string()).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn test_log_level_field_deserializes() {
        let logging: Logging = serde_json::from_str(r#"{ "log_level": "Info" }"#).unwrap();
        assert!(matches!(logging.log_level, LogLevel::Info));

        let error = serde_json::from_str::<Logging>(r#"{ "log_level": "warn" }"#)
            .err()
            .unwrap();
        assert!(error.to_string().contains("not a supported minimum log level"));
    }
}
