//! Driver configuration models.
//!
//! Every tunable used by routing, addressing, and the quorum protocol lives
//! here with its default. `DriverConfig::from_env` overlays `MERIDIAN_*`
//! environment variables on top of the defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;

use super::request::ConsistencyLevel;
use crate::error::ConfigError;

// ============================================================================
// Enums
// ============================================================================

/// What a global-strong write does when the global-commit barrier never converges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GlobalStrongWritePolicy {
    /// Surface `GlobalStrongWriteBarrierNotMet`
    #[default]
    Fail,
    /// Return the locally committed response and log the lag
    AcceptLocalCommit,
}

impl fmt::Display for GlobalStrongWritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalStrongWritePolicy::Fail => write!(f, "fail"),
            GlobalStrongWritePolicy::AcceptLocalCommit => write!(f, "accept_local_commit"),
        }
    }
}

impl GlobalStrongWritePolicy {
    /// Parse from string.
    pub fn from_string(s: &str) -> Self {
        match s {
            "accept_local_commit" => GlobalStrongWritePolicy::AcceptLocalCommit,
            _ => GlobalStrongWritePolicy::Fail,
        }
    }
}

// ============================================================================
// Replica address cache
// ============================================================================

/// Replica address cache configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct AddressCacheConfig {
    /// Replica count a healthy partition reports (default: 4)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_target_replica_set_size")]
    pub target_replica_set_size: u32,
    /// Age after which an under-replicated entry is force-refreshed (default: 600s)
    #[validate(range(min = 1_u64))]
    #[serde(default = "default_suboptimal_partition_refresh_secs")]
    pub suboptimal_partition_refresh_secs: u64,
    /// Partition ranges per address fetch during warm-up (default: 50)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_open_connections_batch_size")]
    pub open_connections_batch_size: u32,
}

impl Default for AddressCacheConfig {
    fn default() -> Self {
        Self {
            target_replica_set_size: default_target_replica_set_size(),
            suboptimal_partition_refresh_secs: default_suboptimal_partition_refresh_secs(),
            open_connections_batch_size: default_open_connections_batch_size(),
        }
    }
}

impl AddressCacheConfig {
    pub fn suboptimal_partition_refresh(&self) -> Duration {
        Duration::from_secs(self.suboptimal_partition_refresh_secs)
    }
}

// ============================================================================
// Quorum protocol
// ============================================================================

/// Barrier cadence and retry bounds for quorum reads and strong writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct QuorumConfig {
    /// Local read-barrier attempts (default: 6)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_six")]
    pub max_read_barrier_retries: u32,
    /// Delay between local read-barrier attempts (default: 5ms)
    #[serde(default = "default_read_barrier_delay_ms")]
    pub read_barrier_delay_ms: u64,
    /// Attempts waiting for the primary to reach its quorum-acked LSN (default: 6)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_six")]
    pub max_primary_read_retries: u32,
    /// Full quorum-read attempts when falling back from the primary (default: 6)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_six")]
    pub max_read_quorum_retries: u32,
    /// Extra barrier attempts waiting for global commit (default: 30)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_thirty")]
    pub max_multi_region_barrier_retries: u32,
    /// Delay between global-commit barrier attempts (default: 30ms)
    #[serde(default = "default_thirty_u64")]
    pub multi_region_barrier_delay_ms: u64,
    /// Leading global-commit attempts that use the short delay (default: 4)
    #[serde(default = "default_short_barrier_retries")]
    pub short_barrier_retries: u32,
    /// Short delay for the leading global-commit attempts (default: 10ms)
    #[serde(default = "default_short_barrier_delay_ms")]
    pub short_barrier_delay_ms: u64,
    /// Write-barrier attempts for global-strong writes (default: 30)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_thirty")]
    pub max_write_barrier_retries: u32,
    /// Behavior when the write barrier never converges
    #[serde(default)]
    pub global_strong_write_policy: GlobalStrongWritePolicy,
    /// Overall deadline for one logical operation (default: 60s)
    #[validate(range(min = 1_u64))]
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Replica-set size used to derive the read quorum (default: 4)
    #[validate(range(min = 1_u32))]
    #[serde(default = "default_target_replica_set_size")]
    pub max_replica_set_size: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            max_read_barrier_retries: default_six(),
            read_barrier_delay_ms: default_read_barrier_delay_ms(),
            max_primary_read_retries: default_six(),
            max_read_quorum_retries: default_six(),
            max_multi_region_barrier_retries: default_thirty(),
            multi_region_barrier_delay_ms: default_thirty_u64(),
            short_barrier_retries: default_short_barrier_retries(),
            short_barrier_delay_ms: default_short_barrier_delay_ms(),
            max_write_barrier_retries: default_thirty(),
            global_strong_write_policy: GlobalStrongWritePolicy::default(),
            request_timeout_secs: default_request_timeout_secs(),
            max_replica_set_size: default_target_replica_set_size(),
        }
    }
}

impl QuorumConfig {
    pub fn read_barrier_delay(&self) -> Duration {
        Duration::from_millis(self.read_barrier_delay_ms)
    }

    /// Delay before global-commit barrier attempt `attempt` (1-based).
    pub fn multi_region_barrier_delay(&self, attempt: u32) -> Duration {
        if attempt > self.short_barrier_retries {
            Duration::from_millis(self.multi_region_barrier_delay_ms)
        } else {
            Duration::from_millis(self.short_barrier_delay_ms)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Read quorum `R = N - N/2` for the configured replica-set size.
    pub fn read_quorum(&self) -> usize {
        let n = self.max_replica_set_size as usize;
        n - n / 2
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Top-level routing and consistency configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[validate(schema(function = "validate_region_options"))]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Configuration struct - bools are intentional feature flags"
)]
pub struct DriverConfig {
    /// Account endpoint supplied by the caller (global or regional)
    #[validate(url)]
    pub default_endpoint: String,
    /// Explicit region preference, most preferred first
    #[serde(default)]
    pub preferred_regions: Vec<String>,
    /// Single region the application runs in; mutually exclusive with `preferred_regions`
    #[serde(default)]
    pub application_region: Option<String>,
    /// Discover regional endpoints from the account topology (default: true)
    #[serde(default = "default_true")]
    pub enable_endpoint_discovery: bool,
    /// Client opt-in to multi-region writes (default: false)
    #[serde(default)]
    pub use_multiple_write_locations: bool,
    /// Periodically poll the account topology (default: true)
    #[serde(default = "default_true")]
    pub enable_background_refresh: bool,
    /// How long an endpoint stays marked unavailable (default: 30s)
    #[validate(range(min = 1_u64))]
    #[serde(default = "default_unavailable_endpoint_ttl_secs")]
    pub unavailable_endpoint_ttl_secs: u64,
    /// Background topology refresh period (default: 300s)
    #[validate(range(min = 1_u64))]
    #[serde(default = "default_background_refresh_interval_secs")]
    pub background_refresh_interval_secs: u64,
    /// Endpoint-failover retries before giving up (default: 120)
    #[serde(default = "default_max_client_retries")]
    pub max_client_retries: u32,
    /// Delay before retrying after a gateway connectivity failure (default: 1000ms)
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Session-not-available retries; `None` means one per region
    #[serde(default)]
    pub max_session_retries: Option<u32>,
    /// Account default consistency; `Strong` enables global-strong checks
    #[serde(default)]
    pub default_consistency: ConsistencyLevel,
    #[serde(default)]
    #[validate(nested)]
    pub address_cache: AddressCacheConfig,
    #[serde(default)]
    #[validate(nested)]
    pub quorum: QuorumConfig,
}

impl DriverConfig {
    pub fn new(default_endpoint: impl Into<String>) -> Self {
        Self {
            default_endpoint: default_endpoint.into(),
            preferred_regions: Vec::new(),
            application_region: None,
            enable_endpoint_discovery: true,
            use_multiple_write_locations: false,
            enable_background_refresh: true,
            unavailable_endpoint_ttl_secs: default_unavailable_endpoint_ttl_secs(),
            background_refresh_interval_secs: default_background_refresh_interval_secs(),
            max_client_retries: default_max_client_retries(),
            retry_interval_ms: default_retry_interval_ms(),
            max_session_retries: None,
            default_consistency: ConsistencyLevel::default(),
            address_cache: AddressCacheConfig::default(),
            quorum: QuorumConfig::default(),
        }
    }

    /// Defaults overlaid with `MERIDIAN_*` environment variables.
    pub fn from_env(default_endpoint: impl Into<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new(default_endpoint);
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay overrides from `lookup` (an environment accessor).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("MERIDIAN_ENDPOINT") {
            self.default_endpoint = endpoint;
        }
        if let Some(regions) = lookup("MERIDIAN_PREFERRED_REGIONS") {
            self.preferred_regions = regions
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(region) = lookup("MERIDIAN_APPLICATION_REGION") {
            self.application_region = Some(region);
        }
        if let Some(v) = lookup("MERIDIAN_ENABLE_ENDPOINT_DISCOVERY") {
            self.enable_endpoint_discovery = parse_env("MERIDIAN_ENABLE_ENDPOINT_DISCOVERY", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_USE_MULTIPLE_WRITE_LOCATIONS") {
            self.use_multiple_write_locations =
                parse_env("MERIDIAN_USE_MULTIPLE_WRITE_LOCATIONS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_UNAVAILABLE_ENDPOINT_TTL_SECS") {
            self.unavailable_endpoint_ttl_secs =
                parse_env("MERIDIAN_UNAVAILABLE_ENDPOINT_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_BACKGROUND_REFRESH_INTERVAL_SECS") {
            self.background_refresh_interval_secs =
                parse_env("MERIDIAN_BACKGROUND_REFRESH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_SUBOPTIMAL_PARTITION_REFRESH_SECS") {
            self.address_cache.suboptimal_partition_refresh_secs =
                parse_env("MERIDIAN_SUBOPTIMAL_PARTITION_REFRESH_SECS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_REQUEST_TIMEOUT_SECS") {
            self.quorum.request_timeout_secs = parse_env("MERIDIAN_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("MERIDIAN_GLOBAL_STRONG_WRITE_POLICY") {
            self.quorum.global_strong_write_policy = GlobalStrongWritePolicy::from_string(&v);
        }
        Ok(())
    }

    /// Run field validation and map the first failure to a [`ConfigError`].
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.application_region.is_some() && !self.preferred_regions.is_empty() {
            return Err(ConfigError::ConflictingRegionOptions);
        }
        self.validate().map_err(|e| ConfigError::from_validation_errors(&e))
    }

    pub fn unavailable_endpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.unavailable_endpoint_ttl_secs)
    }

    pub fn background_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.background_refresh_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn validate_region_options(config: &DriverConfig) -> Result<(), validator::ValidationError> {
    if config.application_region.is_some() && !config.preferred_regions.is_empty() {
        return Err(validator::ValidationError::new("conflicting_region_options"));
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::ParseError {
        message: format!("{key}: cannot parse '{value}'"),
    })
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_six() -> u32 {
    6
}

fn default_thirty() -> u32 {
    30
}

fn default_thirty_u64() -> u64 {
    30
}

fn default_read_barrier_delay_ms() -> u64 {
    5
}

fn default_short_barrier_retries() -> u32 {
    4
}

fn default_short_barrier_delay_ms() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_target_replica_set_size() -> u32 {
    4
}

fn default_suboptimal_partition_refresh_secs() -> u64 {
    600
}

fn default_open_connections_batch_size() -> u32 {
    50
}

fn default_unavailable_endpoint_ttl_secs() -> u64 {
    30
}

fn default_background_refresh_interval_secs() -> u64 {
    300
}

fn default_max_client_retries() -> u32 {
    120
}

fn default_retry_interval_ms() -> u64 {
    1000
}
