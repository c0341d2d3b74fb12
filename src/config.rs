//! Operator-facing configuration, loaded from TOML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::PolicyTable;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub policies: PolicyTable,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Where durable state lives. Both backends unset means memory-only
/// (single-process deployments and tests).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
}

impl TollgateConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyLimits;

    #[test]
    fn empty_config_uses_seeded_policy_defaults() {
        let config = TollgateConfig::from_toml_str("").unwrap();
        assert_eq!(config.policies.free, PolicyLimits::free_defaults());
        assert_eq!(config.policies.premium, PolicyLimits::premium_defaults());
        assert!(config.store.sqlite_path.is_none());
    }

    #[test]
    fn toml_overrides_one_tier_without_losing_the_other() {
        let raw = r#"
            [policies.free]
            chat_per_day = 10
            web_search_per_day = 4
            max_request_chars = 1500

            [store]
            sqlite_path = "/var/lib/tollgate/state.sqlite"
        "#;
        let config = TollgateConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.policies.free.chat_per_day, 10);
        assert_eq!(config.policies.free.max_request_chars, 1500);
        assert_eq!(config.policies.premium, PolicyLimits::premium_defaults());
        assert_eq!(
            config.store.sqlite_path.as_deref(),
            Some(Path::new("/var/lib/tollgate/state.sqlite"))
        );
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = TollgateConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed = TollgateConfig::from_toml_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }
}
