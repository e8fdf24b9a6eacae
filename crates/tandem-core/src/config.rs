//! Engine tuning: defaults, `TANDEM_*` environment overrides and YAML files.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

pub const ENV_MAX_FRAME_LEN: &str = "TANDEM_MAX_FRAME_LEN";
pub const ENV_FRAME_BUFFER: &str = "TANDEM_FRAME_BUFFER";
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "TANDEM_SHUTDOWN_TIMEOUT_MS";

/// Tuning knobs shared by both engine roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Largest accepted inbound frame, in bytes (after unescaping).
    pub max_frame_len: usize,
    /// Capacity of the inbound frame channel between the read loop and the engine.
    pub frame_buffer: usize,
    /// How long disposal waits for the peer to finish its side of the stream.
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 16 * 1024 * 1024,
            frame_buffer: 1024,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Defaults overridden by `TANDEM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = lookup(ENV_MAX_FRAME_LEN) {
            cfg.max_frame_len = parse_positive(ENV_MAX_FRAME_LEN, &v)?;
        }
        if let Some(v) = lookup(ENV_FRAME_BUFFER) {
            cfg.frame_buffer = parse_positive(ENV_FRAME_BUFFER, &v)?;
        }
        if let Some(v) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            cfg.shutdown_timeout_ms = parse_positive(ENV_SHUTDOWN_TIMEOUT_MS, &v)?;
        }

        Ok(cfg)
    }

    /// Load from a YAML file; missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Parse a non-zero integer that must also fit the target type.
fn parse_positive<T: TryFrom<u64>>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|&n| n > 0)
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| ConfigError::InvalidEnv {
            key,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            (ENV_MAX_FRAME_LEN, "4096"),
            (ENV_SHUTDOWN_TIMEOUT_MS, " 250 "),
        ]
        .into_iter()
        .collect();

        let cfg = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.max_frame_len, 4096);
        assert_eq!(cfg.frame_buffer, EngineConfig::default().frame_buffer);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_lookup_rejects_zero_and_garbage() {
        let err = EngineConfig::from_lookup(|k| (k == ENV_FRAME_BUFFER).then(|| "0".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_FRAME_BUFFER));

        let err = EngineConfig::from_lookup(|k| {
            (k == ENV_SHUTDOWN_TIMEOUT_MS).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { value, .. } if value == "soon"));
    }

    #[test]
    fn test_values_that_do_not_fit_are_rejected() {
        assert_eq!(parse_positive::<u16>(ENV_FRAME_BUFFER, "65535").unwrap(), 65535);

        let err = parse_positive::<u16>(ENV_FRAME_BUFFER, "65536").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for TANDEM_FRAME_BUFFER: 65536"
        );
        assert!(parse_positive::<usize>(ENV_MAX_FRAME_LEN, "18446744073709551616").is_err());
    }

    #[test]
    fn test_yaml_partial_file_keeps_defaults() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "frame_buffer: 8").unwrap();

        let cfg = EngineConfig::from_yaml_file(tmp.path()).unwrap();

        assert_eq!(cfg.frame_buffer, 8);
        assert_eq!(cfg.max_frame_len, 16 * 1024 * 1024);
    }

    #[test]
    fn test_yaml_missing_file() {
        let err = EngineConfig::from_yaml_file(Path::new("/nonexistent/tandem.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
