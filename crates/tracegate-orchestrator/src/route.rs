use std::time::Duration;

use crate::config::OrchestratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTimeout {
    Default,
    /// Authentication-sensitive routes get their own, separately tuned budget.
    Authentication,
    Custom(Duration),
}

impl RouteTimeout {
    #[must_use]
    pub fn resolve(self, config: &OrchestratorConfig) -> Duration {
        match self {
            Self::Default => config.default_timeout,
            Self::Authentication => config.authentication_timeout,
            Self::Custom(timeout) => timeout,
        }
    }
}

/// What the orchestrator needs to know about a route before running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub name: &'static str,
    pub timeout: RouteTimeout,
    pub needs_storage: bool,
}

impl RouteSpec {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name, timeout: RouteTimeout::Default, needs_storage: false }
    }

    #[must_use]
    pub const fn with_storage(mut self) -> Self {
        self.needs_storage = true;
        self
    }

    #[must_use]
    pub const fn authentication(mut self) -> Self {
        self.timeout = RouteTimeout::Authentication;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = RouteTimeout::Custom(timeout);
        self
    }
}
