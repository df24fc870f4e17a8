use anyhow::{bail, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;

/// Registry key of the command bus to observe when none is configured.
pub const DEFAULT_DISPATCHER_SERVICE_KEY: &str = "command_bus";

/// Environment variable overriding [`CausationConfig::dispatcher_service_key`].
pub const DISPATCHER_SERVICE_KEY_VAR: &str = "CAUSATION_DISPATCHER_SERVICE_KEY";

/// Causation tracking configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CausationConfig {
    /// Key of the command bus in the [`CommandBusRegistry`](crate::CommandBusRegistry).
    pub dispatcher_service_key: String,
}

impl Default for CausationConfig {
    fn default() -> Self {
        Self {
            dispatcher_service_key: DEFAULT_DISPATCHER_SERVICE_KEY.to_string(),
        }
    }
}

impl CausationConfig {
    pub fn new(dispatcher_service_key: impl Into<String>) -> Self {
        Self {
            dispatcher_service_key: dispatcher_service_key.into(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dispatcher_service_key = lookup(DISPATCHER_SERVICE_KEY_VAR)
            .unwrap_or_else(|| DEFAULT_DISPATCHER_SERVICE_KEY.to_string());

        if dispatcher_service_key.trim().is_empty() {
            bail!("{DISPATCHER_SERVICE_KEY_VAR} must not be empty");
        }

        Ok(Self { dispatcher_service_key })
    }
}
