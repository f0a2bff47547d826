//! Orchestrator settings and the single-writer handle that publishes them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracegate_trace::DisclosureLevel;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_AUTHENTICATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("{0} timeout MUST be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("grace window MUST be greater than zero")]
    ZeroGraceWindow,
    #[error("debug disclosure level is only allowed in development deployments")]
    DebugOutsideDevelopment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Most detailed level ever serialized to a client.
    pub disclosure_level: DisclosureLevel,
    pub default_timeout: Duration,
    /// Timeout for authentication-sensitive routes.
    pub authentication_timeout: Duration,
    /// How long to wait after deadline expiry for a more specific failure.
    pub grace_window: Duration,
    pub development: bool,
    /// Value for `Access-Control-Allow-Origin` on every response.
    pub allowed_origin: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            disclosure_level: DisclosureLevel::Plain,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            authentication_timeout: DEFAULT_AUTHENTICATION_TIMEOUT,
            grace_window: DEFAULT_GRACE_WINDOW,
            development: false,
            allowed_origin: None,
        }
    }
}

impl OrchestratorConfig {
    /// # Errors
    /// Returns [`ConfigError`] when a duration is zero or `Debug` disclosure
    /// is requested outside a development deployment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("default"));
        }
        if self.authentication_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("authentication"));
        }
        if self.grace_window.is_zero() {
            return Err(ConfigError::ZeroGraceWindow);
        }
        if self.disclosure_level == DisclosureLevel::Debug && !self.development {
            return Err(ConfigError::DebugOutsideDevelopment);
        }
        Ok(())
    }
}

/// Shared, replaceable configuration.
///
/// Readers take an `Arc` snapshot; writers swap the whole object under the
/// write lock, so a request never observes a half-updated config.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<OrchestratorConfig>>>,
}

impl ConfigHandle {
    /// # Errors
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn new(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { current: Arc::new(RwLock::new(Arc::new(config))) })
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<OrchestratorConfig> {
        Arc::clone(&self.current.read())
    }

    /// Publishes `config` and returns the one it replaced.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if `config` fails validation; the active
    /// config is left untouched.
    pub fn replace(&self, config: OrchestratorConfig) -> Result<Arc<OrchestratorConfig>, ConfigError> {
        config.validate()?;
        let next = Arc::new(config);
        let previous = std::mem::replace(&mut *self.current.write(), next);
        tracing::info!(
            disclosure_level = %self.snapshot().disclosure_level,
            "orchestrator configuration replaced"
        );
        Ok(previous)
    }
}
