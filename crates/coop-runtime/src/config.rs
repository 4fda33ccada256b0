//! Node configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use coop_core::{CoopNaming, DEFAULT_APP, DEFAULT_SCHEME};

use crate::LogFormat;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Coop node configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoopConfig {
    /// Scheme of peer-addressed URIs
    pub scheme: String,
    /// `<app>` segment of the well-known path
    pub app: String,
    /// Fallback TTL of cached key fetches
    #[serde(with = "duration_str")]
    pub key_cache_max_age: Duration,
    pub key_cache_capacity: usize,
    /// Per-watch buffer; slow watchers lose the oldest events
    pub watch_capacity: usize,
    /// Events kept for `Last-Event-ID` resumption
    pub event_history: usize,
    /// Seen `(key, time)` pairs remembered per source
    pub key_added_cache: usize,
    pub log_format: LogFormat,
}

impl Default for CoopConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            app: DEFAULT_APP.to_string(),
            key_cache_max_age: Duration::from_secs(60),
            key_cache_capacity: 256,
            watch_capacity: 256,
            event_history: 1024,
            key_added_cache: 32,
            log_format: LogFormat::Text,
        }
    }
}

impl CoopConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CoopConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheme.is_empty() || self.scheme.contains([':', '/']) {
            return Err(ConfigError::Invalid(format!("scheme {:?}", self.scheme)));
        }
        if self.app.is_empty() || self.app.contains('/') {
            return Err(ConfigError::Invalid(format!("app {:?}", self.app)));
        }
        if self.watch_capacity == 0 || self.event_history == 0 {
            return Err(ConfigError::Invalid(
                "watch_capacity and event_history must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn naming(&self) -> CoopNaming {
        CoopNaming::new(&self.scheme, &self.app)
    }

    pub fn with_naming(mut self, scheme: impl Into<String>, app: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self.app = app.into();
        self
    }

    pub fn with_key_cache_max_age(mut self, max_age: Duration) -> Self {
        self.key_cache_max_age = max_age;
        self
    }

    pub fn with_watch_capacity(mut self, capacity: usize) -> Self {
        self.watch_capacity = capacity;
        self
    }

    pub fn with_event_history(mut self, history: usize) -> Self {
        self.event_history = history;
        self
    }

    pub fn with_key_added_cache(mut self, entries: usize) -> Self {
        self.key_added_cache = entries;
        self
    }
}

/// Durations as humantime strings (`"60s"`, `"2m 30s"`)
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoopConfig::default();
        assert_eq!(config.naming(), CoopNaming::default());
        assert_eq!(config.key_cache_max_age, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_fills_missing_fields() {
        let config =
            CoopConfig::from_json(r#"{"app": "wiki", "key_cache_max_age": "2m 30s"}"#).unwrap();
        assert_eq!(config.app, "wiki");
        assert_eq!(config.scheme, DEFAULT_SCHEME);
        assert_eq!(config.key_cache_max_age, Duration::from_secs(150));
        assert_eq!(config.event_history, 1024);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            CoopConfig::from_json(r#"{"key_cache_max_age": "soon"}"#),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            CoopConfig::from_json(r#"{"scheme": "a:b"}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(CoopConfig::from_json(r#"{"watch_capacity": 0}"#).is_err());
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = CoopConfig::default().with_key_cache_max_age(Duration::from_secs(5));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(CoopConfig::from_json(&json).unwrap(), config);
    }
}
