#![forbid(unsafe_code)]

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tk_core::{BackoffPolicy, ConflictPolicy};

pub const CONFIG_ENV: &str = "TASKIN_SYNC_CONFIG";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// API root; collections live at `{base_url}/tasks` and `{base_url}/categories`.
    pub base_url: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_in_flight: usize,
    pub periodic_interval_ms: u64,
    pub connectivity_cooldown_ms: u64,
    pub request_timeout_ms: u64,
    /// Conflicts one entity may hit within a single cycle before it waits for the next one.
    pub max_conflict_rounds: u32,
    pub backoff: BackoffPolicy,
    pub conflict: ConflictPolicy,
    pub remote: RemoteConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            periodic_interval_ms: 30_000,
            connectivity_cooldown_ms: 2_000,
            request_timeout_ms: 10_000,
            max_conflict_rounds: 2,
            backoff: BackoffPolicy::default(),
            conflict: ConflictPolicy::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Explicit path, then `TASKIN_SYNC_CONFIG`, then defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid("max_in_flight must be at least 1"));
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid("backoff.max_attempts must be at least 1"));
        }
        if self.backoff.factor == 0 {
            return Err(ConfigError::Invalid("backoff.factor must be at least 1"));
        }
        if self.periodic_interval_ms == 0 {
            return Err(ConfigError::Invalid("periodic_interval_ms must be positive"));
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("remote.base_url must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tk_core::FieldRule;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.periodic_interval_ms, 30_000);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.backoff.max_attempts, 3);
        assert_eq!(config.conflict.on_delete, FieldRule::Manual);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = SyncConfig::from_yaml_str(
            "max_in_flight: 2\nbackoff:\n  max_attempts: 5\nconflict:\n  text: client_wins\n",
        )
        .expect("parse");
        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(config.backoff.base_ms, 1_000);
        assert_eq!(config.conflict.text, FieldRule::ClientWins);
        assert_eq!(config.conflict.status, FieldRule::ServerWins);
        assert_eq!(config.connectivity_cooldown_ms, 2_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for raw in [
            "max_in_flight: 0",
            "backoff: { max_attempts: 0 }",
            "backoff: { factor: 0 }",
            "remote: { base_url: '' }",
        ] {
            match SyncConfig::from_yaml_str(raw) {
                Err(ConfigError::Invalid(_)) => {}
                other => panic!("expected invalid config for {raw:?}, got {other:?}"),
            }
        }
        assert!(matches!(
            SyncConfig::from_yaml_str("conflict: { text: coin_flip }"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn explicit_path_is_read() {
        let dir = std::env::temp_dir().join(format!("tk_sync_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("sync.yaml");
        std::fs::write(&path, "periodic_interval_ms: 5000\n").expect("write config");
        let config = SyncConfig::load(Some(path.as_path())).expect("load");
        assert_eq!(config.periodic_interval_ms, 5_000);

        let missing = dir.join("missing.yaml");
        assert!(matches!(
            SyncConfig::load(Some(missing.as_path())),
            Err(ConfigError::Io { .. })
        ));
    }
}
