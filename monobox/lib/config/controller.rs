//! Runtime settings for the controller and its consumer-facing operations.

use std::{env, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::defaults::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings shared by the reconcilers, the claim coordinator and the exec gateway.
///
/// Every field has a default; `from_env` layers `MONOBOX_*` environment overrides
/// on top, and the CLI can override individual fields again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct ControllerConfig {
    /// The namespace this controller reconciles.
    #[builder(default = DEFAULT_NAMESPACE.to_string())]
    namespace: String,

    /// Interval between reconcile sweeps; the staleness bound of the controller.
    #[builder(default = DEFAULT_SYNC_INTERVAL)]
    sync_interval: Duration,

    /// Total budget for wait-until-running calls.
    #[builder(default = DEFAULT_READY_WAIT_TIMEOUT)]
    ready_wait_timeout: Duration,

    /// Poll interval inside wait-until-running calls.
    #[builder(default = DEFAULT_READY_POLL_INTERVAL)]
    ready_poll_interval: Duration,

    /// Total budget for a single remote command execution.
    #[builder(default = DEFAULT_EXEC_TIMEOUT)]
    exec_timeout: Duration,

    /// How long in-flight reconciliations get to drain on shutdown.
    #[builder(default = DEFAULT_SHUTDOWN_GRACE)]
    shutdown_grace: Duration,

    /// Attempts a claim makes before surfacing a conflict.
    #[builder(default = DEFAULT_CLAIM_ATTEMPTS)]
    claim_attempts: u32,

    /// Attempts for transient store failures under bounded backoff.
    #[builder(default = DEFAULT_RETRY_ATTEMPTS)]
    retry_attempts: u32,

    /// Base delay for bounded-backoff retries; doubles per attempt.
    #[builder(default = DEFAULT_RETRY_BASE_DELAY)]
    retry_base_delay: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControllerConfig {
    /// Builds a config from defaults plus `MONOBOX_*` environment overrides.
    ///
    /// Unparseable values are logged and ignored rather than failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(namespace) = env::var("MONOBOX_NAMESPACE") {
            if !namespace.is_empty() {
                config.namespace = namespace;
            }
        }
        if let Some(secs) = env_secs("MONOBOX_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("MONOBOX_READY_WAIT_SECS") {
            config.ready_wait_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("MONOBOX_EXEC_TIMEOUT_SECS") {
            config.exec_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_secs("MONOBOX_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        config
    }

    /// Returns the config with the namespace replaced.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Returns the config with the sync interval replaced.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn env_secs(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable duration override");
            None
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
