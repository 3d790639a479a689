use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::backoff::RetryPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    /// Address for the Prometheus `/metrics` endpoint, e.g. 127.0.0.1:9184.
    /// Absent means no metrics server.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub retry: RetryDefaults,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Retry policy applied to tasks submitted without an explicit policy.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryDefaults {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_base_ms")]
    pub base_ms: i64,
    #[serde(default)]
    pub jitter_max_ms: i64,
    #[serde(default = "RetryPolicy::default_max_exponent")]
    pub max_exponent: u32,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: RetryPolicy::default_max_attempts(),
            base_ms: RetryPolicy::default_base_ms(),
            jitter_max_ms: 0,
            max_exponent: RetryPolicy::default_max_exponent(),
        }
    }
}

impl RetryDefaults {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_ms: self.base_ms,
            jitter_max_ms: self.jitter_max_ms,
            max_exponent: self.max_exponent,
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
