//! # Treadmill Configuration
//!
//! Runtime knobs of a [`Treadmill`](crate::Treadmill), plus named chain declarations that a
//! [`HandlerRegistry`](crate::HandlerRegistry) turns into [`Chain`](crate::Chain)s.
//!
//! Configuration can be built in code, parsed from JSON, or read from the environment:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `TREADMILL_YIELD_BETWEEN_STEPS` | `yield_between_steps` | `true` |
//! | `TREADMILL_DEFERRAL_TIMEOUT_MS` | `deferral_timeout_ms` | unset (wait forever) |
//!
//! ```rust
//! use treadmill::TreadmillConfig;
//!
//! let config = TreadmillConfig::from_json_str(r#"{
//!     "deferral_timeout_ms": 250,
//!     "chains": { "api": ["auth", "load", "render"] }
//! }"#).unwrap();
//!
//! assert!(config.yield_between_steps);
//! assert_eq!(config.deferral_timeout().map(|d| d.as_millis()), Some(250));
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const ENV_YIELD_BETWEEN_STEPS: &str = "TREADMILL_YIELD_BETWEEN_STEPS";
pub const ENV_DEFERRAL_TIMEOUT_MS: &str = "TREADMILL_DEFERRAL_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreadmillConfig {
    /// Submit each step as a new executor task instead of looping on the current one, so a
    /// long chain cannot monopolize a worker thread.
    pub yield_between_steps: bool,

    /// How long a deferred run may stay parked. `None` waits until resumed or abandoned.
    pub deferral_timeout_ms: Option<u64>,

    /// Named chains, each an ordered list of registered handler names.
    pub chains: BTreeMap<String, Vec<String>>,
}

impl Default for TreadmillConfig {
    fn default() -> Self {
        Self {
            yield_between_steps: true,
            deferral_timeout_ms: None,
            chains: BTreeMap::new(),
        }
    }
}

impl TreadmillConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by any `TREADMILL_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_YIELD_BETWEEN_STEPS) {
            config.yield_between_steps = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_YIELD_BETWEEN_STEPS,
                        value,
                    })
                }
            };
        }

        if let Some(value) = lookup(ENV_DEFERRAL_TIMEOUT_MS) {
            let millis = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    key: ENV_DEFERRAL_TIMEOUT_MS,
                    value: value.clone(),
                })?;
            config.deferral_timeout_ms = Some(millis);
        }

        Ok(config)
    }

    pub fn deferral_timeout(&self) -> Option<Duration> {
        self.deferral_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_deferral_timeout(mut self, timeout: Duration) -> Self {
        self.deferral_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_yield_between_steps(mut self, yield_between_steps: bool) -> Self {
        self.yield_between_steps = yield_between_steps;
        self
    }

    /// Declares a named chain.
    pub fn with_chain<I, S>(mut self, name: impl Into<String>, handlers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.chains
            .insert(name.into(), handlers.into_iter().map(Into::into).collect());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TreadmillConfig::default();
        assert!(config.yield_between_steps);
        assert_eq!(config.deferral_timeout(), None);
        assert!(config.chains.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let config = TreadmillConfig::from_lookup(lookup(&[
            (ENV_YIELD_BETWEEN_STEPS, "off"),
            (ENV_DEFERRAL_TIMEOUT_MS, "1500"),
        ]))
        .unwrap();
        assert!(!config.yield_between_steps);
        assert_eq!(config.deferral_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let err = TreadmillConfig::from_lookup(lookup(&[(ENV_DEFERRAL_TIMEOUT_MS, "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: ENV_DEFERRAL_TIMEOUT_MS, .. }
        ));
    }

    #[test]
    fn test_json_partial_uses_defaults() {
        let config =
            TreadmillConfig::from_json_str(r#"{ "yield_between_steps": false }"#).unwrap();
        assert!(!config.yield_between_steps);
        assert_eq!(config.deferral_timeout_ms, None);
    }

    #[test]
    fn test_json_malformed() {
        assert!(matches!(
            TreadmillConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_with_chain() {
        let config = TreadmillConfig::default().with_chain("api", ["auth", "render"]);
        assert_eq!(config.chains["api"], vec!["auth", "render"]);
    }
}
