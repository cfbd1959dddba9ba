use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::models::OrgId;

/// Per-organisation cancellation fanout.
///
/// Any in-flight or queued run observes the token current at the moment it
/// checks. Cancellation is cooperative at page boundaries: a run in the
/// middle of a page completes that page, then checks before enqueuing the
/// next one.
#[derive(Default)]
pub struct CancellationCoordinator {
    tokens: DashMap<OrgId, CancellationToken>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current token for an organisation, created fresh on first use.
    pub fn token(&self, organisation_id: OrgId) -> CancellationToken {
        self.tokens
            .entry(organisation_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    /// `app.installed`: abort stale runs, then hand out a fresh token so the
    /// reinstall's own sync can proceed.
    pub fn signal_installed(&self, organisation_id: OrgId) {
        if let Some((_, old)) = self.tokens.remove(&organisation_id) {
            old.cancel();
        }
        self.tokens
            .insert(organisation_id, CancellationToken::new());
        tracing::info!(%organisation_id, "cancelled in-flight runs for reinstall");
    }

    /// `app.uninstalled`: abort everything. The cancelled token stays in
    /// place so queued runs observing it later still stop; only a subsequent
    /// install replaces it.
    pub fn signal_uninstalled(&self, organisation_id: OrgId) {
        let token = self
            .tokens
            .entry(organisation_id)
            .or_insert_with(CancellationToken::new)
            .clone();
        token.cancel();
        tracing::info!(%organisation_id, "cancelled in-flight runs for uninstall");
    }
}
