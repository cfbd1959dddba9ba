//! Proactive credential refresh.
//!
//! A perpetual, per-organisation state machine:
//! `Scheduled(wake_at = expires_at - guard_window) -> Awake -> Refreshing ->
//! Scheduled(new wake_at)`, looping until the organisation is uninstalled.
//! The cycle state is an explicit [`RefreshCycle`] value so a single step can
//! be driven (and tested) without sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapter::AdapterError;
use crate::classify::classify;
use crate::config::SyncConfig;
use crate::credentials::CredentialVault;
use crate::events::{Event, EventBus};
use crate::models::OrgId;
use crate::store::OrganisationStore;
use crate::Result;

/// A refreshed vendor credential and its validity window.
#[derive(Debug, Clone)]
pub struct RefreshedCredential {
    pub credential: serde_json::Value,
    pub expires_in: Duration,
}

/// Vendor refresh-token endpoint, abstracted per connector.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_token(
        &self,
        credential: &serde_json::Value,
    ) -> std::result::Result<RefreshedCredential, AdapterError>;
}

/// One scheduled wake of the refresh loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshCycle {
    pub organisation_id: OrgId,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenRefreshScheduler {
    store: Arc<dyn OrganisationStore>,
    vault: CredentialVault,
    refresher: Arc<dyn TokenRefresher>,
    bus: Arc<dyn EventBus>,
    config: SyncConfig,
}

impl TokenRefreshScheduler {
    pub fn new(
        store: Arc<dyn OrganisationStore>,
        vault: CredentialVault,
        refresher: Arc<dyn TokenRefresher>,
        bus: Arc<dyn EventBus>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            vault,
            refresher,
            bus,
            config,
        })
    }

    /// Execute one `Awake -> Refreshing` step: load the organisation, call
    /// the vendor refresh endpoint, persist the re-encrypted credential, and
    /// return the next cycle. `None` means the organisation no longer exists
    /// and the loop should terminate (not an error).
    #[tracing::instrument(level = "info", skip(self), fields(organisation_id = %cycle.organisation_id))]
    pub async fn run_cycle(&self, cycle: &RefreshCycle) -> Result<Option<RefreshCycle>> {
        let Some(mut organisation) = self.store.get(cycle.organisation_id).await? else {
            tracing::info!("organisation gone, ending refresh loop");
            return Ok(None);
        };

        let credential = self.vault.decrypt(&organisation.encrypted_credential)?;
        let refreshed = self
            .refresher
            .refresh_token(&credential)
            .await
            .map_err(|e| classify(&e, self.config.rate_limit_default()).into_error(&e))?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(refreshed.expires_in)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        organisation.encrypted_credential = self.vault.encrypt(&refreshed.credential)?;
        organisation.credential_expiry = Some(expires_at);
        self.store.put(&organisation).await?;

        self.bus
            .publish(Event::token_refresh_requested(
                cycle.organisation_id,
                expires_at,
            )?)
            .await?;

        tracing::info!(%expires_at, "credential refreshed");
        Ok(Some(RefreshCycle {
            organisation_id: cycle.organisation_id,
            expires_at,
        }))
    }

    /// Run the perpetual loop: sleep until `expires_at - guard_window`, then
    /// refresh and reschedule. Stops when `cancel` fires (uninstall), when
    /// the organisation row disappears, or when a cycle fails past its retry
    /// budget.
    #[tracing::instrument(level = "info", skip(self, cancel), fields(organisation_id = %cycle.organisation_id))]
    pub async fn run_loop(&self, cycle: RefreshCycle, cancel: CancellationToken) -> Result<()> {
        let mut cycle = cycle;
        loop {
            let wake_at = cycle.expires_at - self.config.guard_window();
            let sleep_for = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("refresh loop cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            match self.attempt_cycle(&cycle, &cancel).await? {
                Some(next) => cycle = next,
                None => return Ok(()),
            }
        }
    }

    /// One wake's worth of attempts: transient and rate-limited failures are
    /// retried in place, bounded by the resync retry budget.
    async fn attempt_cycle(
        &self,
        cycle: &RefreshCycle,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshCycle>> {
        let mut attempt: u32 = 0;
        loop {
            match self.run_cycle(cycle).await {
                Ok(next) => return Ok(next),
                Err(e) => {
                    let delay = match &e {
                        crate::Error::RateLimited { retry_after } => Some(*retry_after),
                        _ if e.is_retriable() => Some(self.config.retry_backoff(attempt)),
                        _ => None,
                    };
                    let Some(delay) = delay else {
                        return Err(e);
                    };
                    if attempt >= self.config.max_retries(false) {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "refresh attempt failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
