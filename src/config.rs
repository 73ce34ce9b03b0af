//! Process configuration from `CLAIMD_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{BackoffPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both CLAIMD_TLS_CERT and CLAIMD_TLS_KEY must be set, or neither")]
    PartialTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Log appends between compactions.
    pub compact_threshold: u64,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
    pub backoff: BackoffPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "claimd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls: None,
            metrics_port: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let parsed = |var: &'static str| -> Result<Option<String>, ConfigError> {
            Ok(lookup(var).filter(|v| !v.trim().is_empty()))
        };

        let tls = match (parsed("CLAIMD_TLS_CERT")?, parsed("CLAIMD_TLS_KEY")?) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        let base_ms = parse_var(&lookup, "CLAIMD_RETRY_BASE_MS")?
            .unwrap_or(DEFAULT_BASE_DELAY.as_millis() as u64);
        let max_ms = parse_var(&lookup, "CLAIMD_RETRY_MAX_MS")?
            .unwrap_or(DEFAULT_MAX_DELAY.as_millis() as u64);
        let attempts =
            parse_var(&lookup, "CLAIMD_MAX_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            bind: parsed("CLAIMD_BIND")?.unwrap_or(defaults.bind),
            port: parse_var(&lookup, "CLAIMD_PORT")?.unwrap_or(defaults.port),
            data_dir: parsed("CLAIMD_DATA_DIR")?
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("CLAIMD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&lookup, "CLAIMD_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&lookup, "CLAIMD_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            tls,
            metrics_port: parse_var(&lookup, "CLAIMD_METRICS_PORT")?,
            backoff: BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                attempts,
            ),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}
