//! Lease agent configuration: durations, retry policy, and maintenance
//! cadence. All defaults follow the classic lease-layer constants.

use crate::utils::VigilError;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// Which configured duration a lease establish call uses.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum DurationType {
    /// Peers within the same fault domain.
    Regular,
    /// Peers across fault domains (typically longer).
    AcrossFaultDomain,
}

/// The dynamically updatable duration pair (see `update_lease_duration`).
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub struct LeaseDurations {
    pub lease_duration_ms: u64,
    pub lease_duration_across_fd_ms: u64,
}

/// Agent-wide lease configuration parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Regular lease duration in milliseconds.
    pub lease_duration_ms: u64,

    /// Lease duration used across fault domains.
    pub lease_duration_across_fd_ms: u64,

    /// A peer nothing has been received from for this long counts as
    /// unresponsive and is not eligible as an indirect-renewal relay.
    pub unresponsive_duration_ms: u64,

    /// Upper bound on how long consecutive indirect (forwarded) renewals may
    /// keep a relationship alive.
    pub max_indirect_lease_ms: u64,

    /// Window between subject-side Expired and Failed.
    pub suspend_duration_ms: u64,

    /// How long an arbitration may stay unanswered before failing closed.
    pub arbitration_duration_ms: u64,

    /// Renew attempts without a response before going indirect.
    pub renew_retry_count: u32,

    /// Renewing begins duration/ratio before the subject expiration.
    pub renew_begin_ratio: u32,

    /// Renew retries are spaced duration * pct / 100 apart.
    pub renew_retry_interval_pct: u32,

    /// Ping round-trip window before arbitration is invoked.
    pub pre_arbitration_ms: u64,

    /// Spacing of repeated pre-arbitration pings.
    pub ping_retry_interval_ms: u64,

    /// Cadence of the maintenance/GC sweep.
    pub maintenance_interval_ms: u64,

    /// Bounded wait for an application's callbacks to drain on unregister;
    /// exceeding it is a fatal assertion.
    pub app_drain_timeout_ms: u64,

    /// Capacity of each application's event FIFO.
    pub event_queue_cap: usize,

    /// How long a retired remote lease agent lingers before the maintenance
    /// sweep may reclaim it.
    pub retired_gc_delay_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            lease_duration_ms: 30_000,
            lease_duration_across_fd_ms: 30_000,
            unresponsive_duration_ms: 60_000,
            max_indirect_lease_ms: 15_000,
            suspend_duration_ms: 5_000,
            arbitration_duration_ms: 30_000,
            renew_retry_count: 3,
            renew_begin_ratio: 4,
            renew_retry_interval_pct: 5,
            pre_arbitration_ms: 2_000,
            ping_retry_interval_ms: 10_000,
            maintenance_interval_ms: 15_000,
            app_drain_timeout_ms: 5_000,
            event_queue_cap: 256,
            retired_gc_delay_ms: 1_000,
        }
    }
}

impl LeaseConfig {
    /// Composes a config from defaults overwritten by an optional TOML
    /// string, then validates it.
    pub fn from_toml(config_str: Option<&str>) -> Result<Self, VigilError> {
        let config = parsed_config!(config_str => LeaseConfig;
                                    lease_duration_ms,
                                    lease_duration_across_fd_ms,
                                    unresponsive_duration_ms,
                                    max_indirect_lease_ms,
                                    suspend_duration_ms,
                                    arbitration_duration_ms,
                                    renew_retry_count,
                                    renew_begin_ratio,
                                    renew_retry_interval_pct,
                                    pre_arbitration_ms,
                                    ping_retry_interval_ms,
                                    maintenance_interval_ms,
                                    app_drain_timeout_ms,
                                    event_queue_cap,
                                    retired_gc_delay_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects non-positive or inconsistent values at the boundary, before
    /// anything enters the state machine.
    pub fn validate(&self) -> Result<(), VigilError> {
        if self.lease_duration_ms == 0 || self.lease_duration_across_fd_ms == 0 {
            return logged_err!("lease durations must be positive");
        }
        if self.suspend_duration_ms == 0 {
            return logged_err!("suspend duration must be positive");
        }
        if self.arbitration_duration_ms == 0 {
            return logged_err!("arbitration duration must be positive");
        }
        if self.renew_begin_ratio == 0 || self.renew_retry_interval_pct == 0 {
            return logged_err!("renew ratios must be positive");
        }
        if self.event_queue_cap == 0 {
            return logged_err!("event queue capacity must be positive");
        }
        if self.maintenance_interval_ms == 0 {
            return logged_err!("maintenance interval must be positive");
        }
        Ok(())
    }

    /// The configured duration for a given duration type.
    pub fn duration_for(&self, kind: DurationType) -> Duration {
        match kind {
            DurationType::Regular => {
                Duration::from_millis(self.lease_duration_ms)
            }
            DurationType::AcrossFaultDomain => {
                Duration::from_millis(self.lease_duration_across_fd_ms)
            }
        }
    }

    pub fn suspend_duration(&self) -> Duration {
        Duration::from_millis(self.suspend_duration_ms)
    }

    pub fn arbitration_duration(&self) -> Duration {
        Duration::from_millis(self.arbitration_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::VigilError;

    #[test]
    fn defaults_valid() -> Result<(), VigilError> {
        LeaseConfig::default().validate()
    }

    #[test]
    fn parse_overrides() -> Result<(), VigilError> {
        let config = LeaseConfig::from_toml(Some(
            "lease_duration_ms = 5000\nrenew_retry_count = 5",
        ))?;
        assert_eq!(config.lease_duration_ms, 5000);
        assert_eq!(config.renew_retry_count, 5);
        assert_eq!(
            config.lease_duration_across_fd_ms,
            LeaseConfig::default().lease_duration_across_fd_ms
        );
        Ok(())
    }

    #[test]
    fn reject_zero_duration() {
        assert!(LeaseConfig::from_toml(Some("lease_duration_ms = 0")).is_err());
    }

    #[test]
    fn reject_unknown_field() {
        assert!(LeaseConfig::from_toml(Some("bogus_field = 1")).is_err());
    }
}
