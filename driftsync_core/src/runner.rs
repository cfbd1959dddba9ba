//! Work-queue driver for sync pages.
//!
//! Stands in for the durable step executor: every page is an explicit
//! [`SyncRun`] value threaded through the queue (never in-process recursion),
//! so a restart resumes from the last completed page. The runner wraps each
//! page in the concurrency governor, the cancellation check, and the
//! classified retry policy.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationCoordinator;
use crate::config::SyncConfig;
use crate::events::{
    AppLifecycle, Event, EventBus, TOPIC_APP_INSTALLED, TOPIC_APP_UNINSTALLED,
    TOPIC_SYNC_REQUESTED,
};
use crate::governor::ConcurrencyGovernor;
use crate::models::{OrgId, RunOutcome, SyncRun};
use crate::orchestrator::SyncOrchestrator;
use crate::refresh::{RefreshCycle, TokenRefreshScheduler};
use crate::store::OrganisationStore;
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct QueuedPage {
    run: SyncRun,
    /// Transient-retry attempts already spent on this page.
    attempt: u32,
}

/// Two-lane queue: first-time syncs are dispatched ahead of routine resyncs
/// so a newly installed tenant sees data quickly.
#[derive(Default)]
struct RunQueue {
    first_sync: Mutex<VecDeque<QueuedPage>>,
    resync: Mutex<VecDeque<QueuedPage>>,
    notify: Notify,
}

impl RunQueue {
    async fn push(&self, page: QueuedPage) {
        if page.run.is_first_sync {
            self.first_sync.lock().await.push_back(page);
        } else {
            self.resync.lock().await.push_back(page);
        }
        self.notify.notify_one();
    }

    async fn try_pop(&self) -> Option<QueuedPage> {
        if let Some(page) = self.first_sync.lock().await.pop_front() {
            return Some(page);
        }
        self.resync.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.first_sync.lock().await.len() + self.resync.lock().await.len()
    }
}

pub struct SyncRunner {
    orchestrator: Arc<SyncOrchestrator>,
    governor: Arc<ConcurrencyGovernor>,
    cancel: Arc<CancellationCoordinator>,
    store: Arc<dyn OrganisationStore>,
    bus: Arc<dyn EventBus>,
    config: SyncConfig,
    queue: Arc<RunQueue>,
}

impl SyncRunner {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<dyn OrganisationStore>,
        bus: Arc<dyn EventBus>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            orchestrator,
            governor: Arc::new(ConcurrencyGovernor::new(config.per_org_concurrency)?),
            cancel: Arc::new(CancellationCoordinator::new()),
            store,
            bus,
            config,
            queue: Arc::new(RunQueue::default()),
        })
    }

    pub fn cancellation(&self) -> Arc<CancellationCoordinator> {
        self.cancel.clone()
    }

    /// Start a new sync run at the first page, fixing its watermark to now.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn request_sync(&self, organisation_id: OrgId, is_first_sync: bool) -> Result<()> {
        let run = SyncRun::starting(organisation_id, is_first_sync, Utc::now());
        self.bus.publish(Event::sync_requested(&run)?).await?;
        self.enqueue(run).await;
        Ok(())
    }

    /// Queue one page of work. Fresh pages start with a zeroed retry budget.
    pub async fn enqueue(&self, run: SyncRun) {
        self.queue.push(QueuedPage { run, attempt: 0 }).await;
    }

    /// Pages currently waiting for a worker (primarily for tests).
    pub async fn queued_pages(&self) -> usize {
        self.queue.len().await
    }

    /// Route an inbound event to the right handler. Unknown topics are
    /// ignored so new producers can roll out ahead of this consumer.
    #[tracing::instrument(level = "debug", skip(self, event), fields(topic = %event.topic))]
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        match event.topic.as_str() {
            TOPIC_SYNC_REQUESTED => {
                let run: SyncRun = serde_json::from_value(event.payload.clone())
                    .map_err(|e| Error::backend("decode sync.requested payload", e))?;
                self.enqueue(run).await;
                Ok(())
            }
            TOPIC_APP_INSTALLED => {
                let payload: AppLifecycle = serde_json::from_value(event.payload.clone())
                    .map_err(|e| Error::backend("decode app.installed payload", e))?;
                self.handle_installed(payload.organisation_id);
                Ok(())
            }
            TOPIC_APP_UNINSTALLED => {
                let payload: AppLifecycle = serde_json::from_value(event.payload.clone())
                    .map_err(|e| Error::backend("decode app.uninstalled payload", e))?;
                self.handle_uninstalled(payload.organisation_id).await
            }
            other => {
                tracing::debug!(topic = other, "ignoring unhandled event topic");
                Ok(())
            }
        }
    }

    /// A reinstall aborts stale runs; the install flow then requests the
    /// tenant's first sync under a fresh token.
    pub fn handle_installed(&self, organisation_id: OrgId) {
        self.cancel.signal_installed(organisation_id);
    }

    /// An uninstall aborts all runs and purges the tenant record.
    pub async fn handle_uninstalled(&self, organisation_id: OrgId) -> Result<()> {
        self.cancel.signal_uninstalled(organisation_id);
        self.store.delete(organisation_id).await
    }

    /// Spawn `count` page workers that drain the queue until `shutdown`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let runner = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "sync worker started");
                    runner.run_worker(shutdown).await;
                    tracing::debug!(worker, "sync worker stopped");
                })
            })
            .collect()
    }

    async fn run_worker(&self, shutdown: CancellationToken) {
        loop {
            if let Some(page) = self.queue.try_pop().await {
                self.process(page).await;
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.queue.notify.notified() => {}
            }
        }
    }

    /// Execute one queued page end to end: governor permit, cancellation
    /// checks on both sides of the page, classified error handling.
    #[tracing::instrument(
        level = "debug",
        skip(self, page),
        fields(organisation_id = %page.run.organisation_id, cursor = ?page.run.cursor, attempt = page.attempt)
    )]
    async fn process(&self, page: QueuedPage) {
        let organisation_id = page.run.organisation_id;
        let token = self.cancel.token(organisation_id);
        if token.is_cancelled() {
            tracing::debug!("dropping queued page for cancelled organisation");
            return;
        }

        let permit = match self.governor.acquire(organisation_id).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(error = %e, "failed to acquire page slot");
                return;
            }
        };
        // Cancellation may have landed while we queued behind the permit.
        if token.is_cancelled() {
            tracing::debug!("dropping page cancelled while waiting for slot");
            return;
        }

        let outcome = self.orchestrator.run_page(&page.run).await;
        drop(permit);

        match outcome {
            Ok(RunOutcome::Ongoing(next)) => {
                if token.is_cancelled() {
                    tracing::info!("run cancelled; not enqueuing next page");
                    return;
                }
                self.queue.push(QueuedPage { run: next, attempt: 0 }).await;
            }
            Ok(RunOutcome::Completed) => {
                tracing::info!("sync run completed");
            }
            Err(e) => self.handle_page_error(page, e).await,
        }
    }

    async fn handle_page_error(&self, page: QueuedPage, error: Error) {
        let organisation_id = page.run.organisation_id;
        match error {
            // Respect vendor throttling: the retry is scheduled, never
            // immediate, and does not consume the transient budget.
            Error::RateLimited { retry_after } => {
                tracing::warn!(
                    %organisation_id,
                    retry_after_s = retry_after.as_secs(),
                    "rate limited; rescheduling page"
                );
                self.requeue_after(page, retry_after);
            }
            e if e.is_retriable() => {
                let budget = self.config.max_retries(page.run.is_first_sync);
                if page.attempt >= budget {
                    tracing::error!(
                        %organisation_id,
                        error = %e,
                        attempts = page.attempt,
                        "retry budget exhausted; abandoning run"
                    );
                    return;
                }
                let delay = self.config.retry_backoff(page.attempt);
                tracing::warn!(
                    %organisation_id,
                    error = %e,
                    attempt = page.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient page failure; retrying"
                );
                self.requeue_after(
                    QueuedPage {
                        run: page.run,
                        attempt: page.attempt + 1,
                    },
                    delay,
                );
            }
            Error::Unauthorized(reason) => {
                tracing::warn!(%organisation_id, %reason, "vendor access revoked");
                if let Err(e) = self.escalate_unauthorized(organisation_id).await {
                    tracing::error!(%organisation_id, error = %e, "uninstall escalation failed");
                }
            }
            Error::OrganisationNotFound(_) => {
                tracing::info!(%organisation_id, "organisation removed mid-run; dropping run");
            }
            e => {
                tracing::error!(%organisation_id, error = %e, "non-retriable page failure; dropping run");
            }
        }
    }

    fn requeue_after(&self, page: QueuedPage, delay: Duration) {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(page).await;
        });
    }

    /// Revoked access is conflated with "app uninstalled" by business rule:
    /// cancel the tenant's runs, purge its credential, and emit the signal so
    /// dependent loops (refresh, siblings) stop too.
    pub async fn escalate_unauthorized(&self, organisation_id: OrgId) -> Result<()> {
        self.cancel.signal_uninstalled(organisation_id);
        self.store.delete(organisation_id).await?;
        self.bus
            .publish(Event::app_uninstalled(organisation_id)?)
            .await?;
        Ok(())
    }

    /// Run an organisation's perpetual refresh loop under its cancellation
    /// token, escalating if the vendor reports the grant revoked.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        scheduler: Arc<TokenRefreshScheduler>,
        cycle: RefreshCycle,
    ) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let organisation_id = cycle.organisation_id;
            let token = runner.cancel.token(organisation_id);
            match scheduler.run_loop(cycle, token).await {
                Ok(()) => {}
                Err(Error::Unauthorized(reason)) => {
                    tracing::warn!(%organisation_id, %reason, "refresh revoked; escalating");
                    if let Err(e) = runner.escalate_unauthorized(organisation_id).await {
                        tracing::error!(%organisation_id, error = %e, "uninstall escalation failed");
                    }
                }
                Err(e) => {
                    tracing::error!(%organisation_id, error = %e, "refresh loop failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StaticConnector;
    use crate::credentials::CredentialVault;
    use crate::events::{MemoryEventBus, TOPIC_APP_UNINSTALLED};
    use crate::models::Organisation;
    use crate::sink::MemorySink;
    use crate::store::MemoryOrganisationStore;
    use uuid::Uuid;

    struct Fixture {
        runner: Arc<SyncRunner>,
        store: Arc<MemoryOrganisationStore>,
        bus: MemoryEventBus,
        org: OrgId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryOrganisationStore::new());
        let bus = MemoryEventBus::new();
        let vault = CredentialVault::new(&[9u8; 32]);
        let org = OrgId(Uuid::new_v4());

        store
            .put(&Organisation {
                id: org,
                region: "us".to_string(),
                encrypted_credential: vault
                    .encrypt(&serde_json::json!({"access_token": "tok"}))
                    .unwrap(),
                credential_expiry: None,
                auth_user_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                store.clone(),
                vault,
                Arc::new(StaticConnector::new()),
                Arc::new(MemorySink::new()),
                SyncConfig::default(),
            )
            .unwrap(),
        );
        let runner = Arc::new(
            SyncRunner::new(
                orchestrator,
                store.clone(),
                Arc::new(bus.clone()),
                SyncConfig::default(),
            )
            .unwrap(),
        );

        Fixture {
            runner,
            store,
            bus,
            org,
        }
    }

    #[tokio::test]
    async fn first_syncs_dispatch_ahead_of_resyncs() {
        let queue = RunQueue::default();
        let org = OrgId(Uuid::new_v4());
        let resync = SyncRun::starting(org, false, Utc::now());
        let first = SyncRun::starting(org, true, Utc::now());

        queue
            .push(QueuedPage {
                run: resync.clone(),
                attempt: 0,
            })
            .await;
        queue
            .push(QueuedPage {
                run: first.clone(),
                attempt: 0,
            })
            .await;

        assert_eq!(queue.try_pop().await.unwrap().run, first);
        assert_eq!(queue.try_pop().await.unwrap().run, resync);
        assert!(queue.try_pop().await.is_none());
    }

    #[tokio::test]
    async fn handle_event_routes_sync_requested() {
        let f = fixture().await;
        let run = SyncRun::starting(f.org, true, Utc::now());
        f.runner
            .handle_event(&Event::sync_requested(&run).unwrap())
            .await
            .unwrap();
        assert_eq!(f.runner.queued_pages().await, 1);
    }

    #[tokio::test]
    async fn handle_event_ignores_unknown_topics() {
        let f = fixture().await;
        let event = Event::new(f.org, "billing.invoice.paid", serde_json::json!({}), "x").unwrap();
        f.runner.handle_event(&event).await.unwrap();
        assert_eq!(f.runner.queued_pages().await, 0);
    }

    #[tokio::test]
    async fn uninstall_event_purges_tenant_and_cancels() {
        let f = fixture().await;
        let token = f.runner.cancellation().token(f.org);

        f.runner
            .handle_event(&Event::app_uninstalled(f.org).unwrap())
            .await
            .unwrap();

        assert!(token.is_cancelled());
        assert!(f.store.get(f.org).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn escalation_purges_credential_and_emits_uninstalled() {
        let f = fixture().await;
        f.runner.escalate_unauthorized(f.org).await.unwrap();

        assert!(f.store.get(f.org).await.unwrap().is_none());
        assert!(f.runner.cancellation().token(f.org).is_cancelled());
        let events = f.bus.events_for_topic(TOPIC_APP_UNINSTALLED).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].organisation_id, f.org);
    }

    #[tokio::test]
    async fn request_sync_publishes_and_enqueues() {
        let f = fixture().await;
        f.runner.request_sync(f.org, true).await.unwrap();

        assert_eq!(f.runner.queued_pages().await, 1);
        assert_eq!(f.bus.events_for_topic(TOPIC_SYNC_REQUESTED).await.len(), 1);
    }
}
