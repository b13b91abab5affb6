use std::env;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Server settings loaded from `SESSIOND_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    /// Prometheus exporter port; metrics are off when unset.
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    /// # Environment Variables
    /// - `SESSIOND_PORT` (default 5433)
    /// - `SESSIOND_BIND` (default 0.0.0.0)
    /// - `SESSIOND_DATA_DIR` (default ./data)
    /// - `SESSIOND_PASSWORD` (default sessiond)
    /// - `SESSIOND_MAX_CONNECTIONS` (default 256)
    /// - `SESSIOND_COMPACT_THRESHOLD` (default 1000)
    /// - `SESSIOND_METRICS_PORT` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            bind: lookup("SESSIOND_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "SESSIOND_PORT", "port number", 5433)?,
            data_dir: lookup("SESSIOND_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            password: lookup("SESSIOND_PASSWORD").unwrap_or_else(|| "sessiond".into()),
            max_connections: parse_or(
                &lookup,
                "SESSIOND_MAX_CONNECTIONS",
                "connection count",
                256,
            )?,
            compact_threshold: parse_or(
                &lookup,
                "SESSIOND_COMPACT_THRESHOLD",
                "append count",
                1000,
            )?,
            metrics_port: match lookup("SESSIOND_METRICS_PORT") {
                Some(value) => Some(parse_value("SESSIOND_METRICS_PORT", "port number", value)?),
                None => None,
            },
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("sessiond.wal")
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => parse_value(var, expected, value),
        None => Ok(default),
    }
}

fn parse_value<T: std::str::FromStr>(
    var: &'static str,
    expected: &'static str,
    value: String,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        expected,
        value,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/sessiond.wal"));
        assert_eq!(cfg.password, "sessiond");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("SESSIOND_PORT", "6543"),
            ("SESSIOND_BIND", "127.0.0.1"),
            ("SESSIOND_DATA_DIR", "/var/lib/sessiond"),
            ("SESSIOND_METRICS_PORT", "9100"),
            ("SESSIOND_COMPACT_THRESHOLD", " 50 "),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6543");
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/sessiond/sessiond.wal"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.compact_threshold, 50);
    }

    #[test]
    fn unparseable_numbers_are_errors() {
        let err = config(&[("SESSIOND_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "SESSIOND_MAX_CONNECTIONS",
                expected: "connection count",
                value: "lots".into(),
            }
        );
        assert!(config(&[("SESSIOND_PORT", "70000")]).is_err());
    }
}
