//! Registry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use session_registry_core::SessionType;

/// Window for committing a pending session build.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration of one registry instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Slug identifying the registry; it publishes as
    /// `xyz.openbmc_project.Session.<slug>`.
    pub slug: String,

    /// Type of every session created by this registry.
    pub session_type: SessionType,

    /// Milliseconds a pending session build may stay uncommitted.
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,
}

fn default_build_timeout_ms() -> u64 {
    duration_ms(DEFAULT_BUILD_TIMEOUT)
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl RegistryConfig {
    /// Create a configuration with the default build timeout.
    #[must_use]
    pub fn new(slug: impl Into<String>, session_type: SessionType) -> Self {
        Self {
            slug: slug.into(),
            session_type,
            build_timeout_ms: default_build_timeout_ms(),
        }
    }

    /// Override the build timeout.
    #[must_use]
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout_ms = duration_ms(timeout);
        self
    }

    /// Window for committing a pending session build.
    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }
}
