use std::time::Duration;

use crate::{Error, Result};

/// Retry attempts are capped here; anything beyond is almost certainly a
/// misconfigured environment value rather than an intentional policy.
pub const MAX_RETRIES_CEILING: u32 = 20;

/// Tuning knobs for the sync core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Safety margin before credential expiry at which proactive refresh
    /// fires. Must be wide enough that the credential is still valid when the
    /// refresh is attempted.
    pub guard_window_secs: u64,

    /// Per-organisation ceiling on concurrently executing pages.
    pub per_org_concurrency: usize,

    /// Retry budget for a page of a first-time sync.
    pub max_retries_first_sync: u32,
    /// Retry budget for a page of a routine resync.
    pub max_retries_resync: u32,

    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,

    /// Fallback wait when a vendor rate-limits without a usable reset header.
    pub rate_limit_default_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            guard_window_secs: 30 * 60,
            per_org_concurrency: 1,
            max_retries_first_sync: 5,
            max_retries_resync: 5,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            rate_limit_default_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.guard_window_secs == 0 {
            return Err(Error::InvalidInput("guard_window_secs must be > 0".into()));
        }
        if self.per_org_concurrency == 0 {
            return Err(Error::InvalidInput(
                "per_org_concurrency must be > 0".into(),
            ));
        }
        if self.max_retries_first_sync > MAX_RETRIES_CEILING
            || self.max_retries_resync > MAX_RETRIES_CEILING
        {
            return Err(Error::InvalidInput(format!(
                "max_retries must be <= {MAX_RETRIES_CEILING}"
            )));
        }
        if self.retry_backoff_base_ms == 0 {
            return Err(Error::InvalidInput(
                "retry_backoff_base_ms must be > 0".into(),
            ));
        }
        if self.retry_backoff_max_ms < self.retry_backoff_base_ms {
            return Err(Error::InvalidInput(
                "retry_backoff_max_ms must be >= retry_backoff_base_ms".into(),
            ));
        }
        if self.rate_limit_default_secs == 0 {
            return Err(Error::InvalidInput(
                "rate_limit_default_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Retry budget for one page, by run kind.
    pub fn max_retries(&self, is_first_sync: bool) -> u32 {
        if is_first_sync {
            self.max_retries_first_sync
        } else {
            self.max_retries_resync
        }
    }

    /// Exponential backoff: base * 2^attempt, capped.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(63);
        let exp = 1u128 << shift;
        let ms = (self.retry_backoff_base_ms as u128).saturating_mul(exp);
        Duration::from_millis(ms.min(self.retry_backoff_max_ms as u128) as u64)
    }

    pub fn guard_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.guard_window_secs as i64)
    }

    pub fn rate_limit_default(&self) -> Duration {
        Duration::from_secs(self.rate_limit_default_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_retries() {
        let cfg = SyncConfig {
            max_retries_resync: MAX_RETRIES_CEILING + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let cfg = SyncConfig {
            per_org_concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = SyncConfig {
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(cfg.retry_backoff(0), Duration::from_millis(1_000));
        assert_eq!(cfg.retry_backoff(1), Duration::from_millis(2_000));
        assert_eq!(cfg.retry_backoff(2), Duration::from_millis(4_000));
        assert_eq!(cfg.retry_backoff(10), Duration::from_millis(10_000));
    }

    #[test]
    fn per_run_kind_retry_budget() {
        let cfg = SyncConfig {
            max_retries_first_sync: 8,
            max_retries_resync: 3,
            ..Default::default()
        };
        assert_eq!(cfg.max_retries(true), 8);
        assert_eq!(cfg.max_retries(false), 3);
    }
}
