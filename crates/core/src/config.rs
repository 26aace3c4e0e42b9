//! Polling configuration, validation, and the provisioning collaborator.
//!
//! Values arrive from a carrier provisioning source and can be nonsense;
//! [`PollingConfig::validate`] rejects the outright-broken combinations and
//! [`PollingConfig::profile`] flags lab configurations running below the
//! documented production floors. A sub-floor value is legal — test benches
//! need short intervals — but the scheduler logs the profile switch once so
//! a misprovisioned device is visible in the field.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from loading or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The provisioning source could not be read.
    #[error("configuration source unavailable: {detail}")]
    Source { detail: String },
    /// A loaded value (or combination) is unusable.
    #[error("invalid configuration: {detail}")]
    Validation { detail: String },
}

impl ConfigError {
    pub fn source(detail: impl Into<String>) -> Self {
        Self::Source {
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation {
            detail: detail.into(),
        }
    }
}

/// Production floors. A configuration below any of these is a lab profile.
pub mod floor {
    use std::time::Duration;

    /// 7 days between periodic discovery passes.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(604_800);
    /// 90 days before a cached capability entry expires locally.
    pub const CACHE_EXPIRATION: Duration = Duration::from_secs(7_776_000);
    /// 100 entries per batch request.
    pub const MAX_ENTRIES_PER_REQUEST: usize = 100;
    /// 20 minutes publish refresh.
    pub const PUBLISH_TIMER: Duration = Duration::from_secs(1_200);
    /// 30 minutes extended publish refresh.
    pub const PUBLISH_TIMER_EXTENDED: Duration = Duration::from_secs(1_800);
}

/// Which set of assumptions the scheduler runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigProfile {
    /// All knobs at or above the production floors.
    Production,
    /// At least one knob below its floor — a lab or test-bench profile.
    Test,
}

/// Provisioning state of presence services for the current subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Not yet reported.
    #[default]
    Unknown,
    NotProvisioned,
    Provisioned,
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::NotProvisioned => write!(f, "not-provisioned"),
            Self::Provisioned => write!(f, "provisioned"),
        }
    }
}

/// Scheduler configuration.
///
/// Serializes with human-readable durations (`"7d"`, `"30s"`), matching how
/// carrier provisioning files carry these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Master switch; off cancels all scheduling and clears the queue.
    pub polling_enabled: bool,
    /// Base interval between periodic discovery passes.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Slack subtracted from `poll_interval` when deciding whether a record
    /// is due, so a record is not missed by a hair and parked for a whole
    /// further interval.
    #[serde(with = "humantime_serde")]
    pub min_poll_interval: Duration,
    /// Age beyond which a cached capability entry expires locally.
    #[serde(with = "humantime_serde")]
    pub cache_expiration: Duration,
    /// Age beyond which a cached availability answer is stale.
    #[serde(with = "humantime_serde")]
    pub availability_cache_expiration: Duration,
    /// Batch size cap; larger discovery batches split into multiple tasks.
    pub max_entries_per_request: usize,
    /// Lifetime of one capability-list subscription; bounds the executor's
    /// wait for a terminal signal.
    #[serde(with = "humantime_serde")]
    pub list_subscription_expiry: Duration,
    /// Publish refresh interval (profile detection only).
    #[serde(with = "humantime_serde")]
    pub publish_timer: Duration,
    /// Extended publish refresh interval (profile detection only).
    #[serde(with = "humantime_serde")]
    pub publish_timer_extended: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            polling_enabled: true,
            poll_interval: floor::POLL_INTERVAL,
            min_poll_interval: Duration::from_secs(60),
            cache_expiration: floor::CACHE_EXPIRATION,
            availability_cache_expiration: Duration::from_secs(60),
            max_entries_per_request: floor::MAX_ENTRIES_PER_REQUEST,
            list_subscription_expiry: Duration::from_secs(30),
            publish_timer: floor::PUBLISH_TIMER,
            publish_timer_extended: floor::PUBLISH_TIMER_EXTENDED,
        }
    }
}

impl PollingConfig {
    /// Reject configurations the scheduler cannot run under at all.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::validation("poll_interval must be non-zero"));
        }
        if self.max_entries_per_request == 0 {
            return Err(ConfigError::validation(
                "max_entries_per_request must be non-zero",
            ));
        }
        if self.min_poll_interval >= self.poll_interval {
            return Err(ConfigError::validation(
                "min_poll_interval must be shorter than poll_interval",
            ));
        }
        if self.list_subscription_expiry.is_zero() {
            return Err(ConfigError::validation(
                "list_subscription_expiry must be non-zero",
            ));
        }
        Ok(())
    }

    /// Detect whether any knob sits below its production floor.
    #[must_use]
    pub fn profile(&self) -> ConfigProfile {
        let below_floor = self.poll_interval < floor::POLL_INTERVAL
            || self.cache_expiration < floor::CACHE_EXPIRATION
            || self.max_entries_per_request < floor::MAX_ENTRIES_PER_REQUEST
            || self.publish_timer < floor::PUBLISH_TIMER
            || self.publish_timer_extended < floor::PUBLISH_TIMER_EXTENDED;
        if below_floor {
            ConfigProfile::Test
        } else {
            ConfigProfile::Production
        }
    }

    /// Elapsed age at which a record becomes due for a poll.
    #[must_use]
    pub fn due_threshold(&self) -> Duration {
        self.poll_interval.saturating_sub(self.min_poll_interval)
    }
}

/// Carrier provisioning collaborator.
#[async_trait]
pub trait ConfigProvider: Send + Sync + 'static {
    /// Load the current configuration. Callers fall back to
    /// [`PollingConfig::default`] when this fails; a load error never stops
    /// the scheduler.
    async fn load(&self) -> ConfigResult<PollingConfig>;

    /// Provisioning state of presence services for the active subscription.
    async fn provisioning_state(&self) -> ProvisioningState;
}
