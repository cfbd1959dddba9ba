//! The pagination state machine.
//!
//! One call executes exactly one page. The caller owns durability: an
//! [`RunOutcome::Ongoing`] value must be enqueued as a fresh unit of work,
//! which is what makes each page independently retriable and resumable after
//! a crash.

use std::sync::Arc;

use crate::adapter::Connector;
use crate::classify::classify;
use crate::config::SyncConfig;
use crate::credentials::CredentialVault;
use crate::models::{RunOutcome, SyncRun};
use crate::sink::Sink;
use crate::store::OrganisationStore;
use crate::watermark::WatermarkFinalizer;
use crate::{Error, Result};

pub struct SyncOrchestrator {
    store: Arc<dyn OrganisationStore>,
    vault: CredentialVault,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn Sink>,
    finalizer: WatermarkFinalizer,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn OrganisationStore>,
        vault: CredentialVault,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn Sink>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            vault,
            connector,
            sink: sink.clone(),
            finalizer: WatermarkFinalizer::new(sink),
            config,
        })
    }

    /// Execute one page of `run`. Idempotent for identical input: upserts are
    /// set-semantics and the watermark delete uses the run's fixed timestamp.
    #[tracing::instrument(
        level = "info",
        skip(self, run),
        fields(organisation_id = %run.organisation_id, cursor = ?run.cursor)
    )]
    pub async fn run_page(&self, run: &SyncRun) -> Result<RunOutcome> {
        // The organisation was removed mid-flight: fatal, never rescheduled.
        let organisation = self
            .store
            .get(run.organisation_id)
            .await?
            .ok_or(Error::OrganisationNotFound(run.organisation_id))?;

        let credential = self.vault.decrypt(&organisation.encrypted_credential)?;

        let page = self
            .connector
            .fetch_page(&credential, run.cursor.as_deref())
            .await
            .map_err(|e| classify(&e, self.config.rate_limit_default()).into_error(&e))?;

        // Malformed vendor records must never block synchronization of valid ones.
        if !page.invalid.is_empty() {
            tracing::warn!(
                organisation_id = %run.organisation_id,
                connector = self.connector.id(),
                invalid = page.invalid.len(),
                "skipping malformed vendor records"
            );
        }

        if !page.valid.is_empty() {
            self.sink.upsert(organisation.id, &page.valid).await?;
        }

        match page.next_cursor {
            Some(cursor) => Ok(RunOutcome::Ongoing(run.next_page(cursor))),
            None => {
                self.finalizer
                    .delete_stale(organisation.id, run.sync_started_at)
                    .await?;
                Ok(RunOutcome::Completed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, FetchPage, StaticConnector};
    use crate::models::{OrgId, Organisation, SyncItem};
    use crate::sink::MemorySink;
    use crate::store::MemoryOrganisationStore;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        orchestrator: SyncOrchestrator,
        connector: StaticConnector,
        sink: Arc<MemorySink>,
        store: Arc<MemoryOrganisationStore>,
        org: OrgId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryOrganisationStore::new());
        let sink = Arc::new(MemorySink::new());
        let connector = StaticConnector::new();
        let vault = CredentialVault::new(&[3u8; 32]);
        let org = OrgId(Uuid::new_v4());

        let encrypted = vault
            .encrypt(&serde_json::json!({"access_token": "tok"}))
            .unwrap();
        store
            .put(&Organisation {
                id: org,
                region: "us".to_string(),
                encrypted_credential: encrypted,
                credential_expiry: None,
                auth_user_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            vault,
            Arc::new(connector.clone()),
            sink.clone(),
            SyncConfig::default(),
        )
        .unwrap();

        Fixture {
            orchestrator,
            connector,
            sink,
            store,
            org,
        }
    }

    fn page(items: &[&str], next: Option<&str>) -> FetchPage {
        FetchPage {
            valid: items
                .iter()
                .map(|id| SyncItem::new(*id, serde_json::json!({"id": id})))
                .collect(),
            invalid: Vec::new(),
            next_cursor: next.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn ongoing_page_carries_watermark_forward() {
        let f = fixture().await;
        f.connector
            .set_page(None, page(&["a", "b"], Some("p2")))
            .await;

        let run = SyncRun::starting(f.org, false, Utc::now());
        let outcome = f.orchestrator.run_page(&run).await.unwrap();

        match outcome {
            RunOutcome::Ongoing(next) => {
                assert_eq!(next.cursor.as_deref(), Some("p2"));
                assert_eq!(next.sync_started_at, run.sync_started_at);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(f.sink.vendor_ids(f.org).await, vec!["a", "b"]);
        // No watermark delete until the cursor is exhausted.
        assert!(f.sink.stale_deletes().await.is_empty());
    }

    #[tokio::test]
    async fn last_page_finalizes_with_run_watermark() {
        let f = fixture().await;
        f.connector.set_page(None, page(&["a"], None)).await;

        let run = SyncRun::starting(f.org, false, Utc::now());
        let outcome = f.orchestrator.run_page(&run).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(
            f.sink.stale_deletes().await,
            vec![(f.org, run.sync_started_at)]
        );
    }

    #[tokio::test]
    async fn termination_on_finite_cursor_sequence() {
        let f = fixture().await;
        f.connector.set_page(None, page(&["1"], Some("p2"))).await;
        f.connector
            .set_page(Some("p2".into()), page(&["2"], Some("p3")))
            .await;
        f.connector
            .set_page(Some("p3".into()), page(&["3"], None))
            .await;

        let mut run = SyncRun::starting(f.org, true, Utc::now());
        let mut pages = 0;
        loop {
            pages += 1;
            match f.orchestrator.run_page(&run).await.unwrap() {
                RunOutcome::Ongoing(next) => run = next,
                RunOutcome::Completed => break,
            }
            assert!(pages < 10, "cursor loop did not terminate");
        }
        assert_eq!(pages, 3);
        assert_eq!(f.sink.vendor_ids(f.org).await, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn invalid_records_are_skipped_not_fatal() {
        let f = fixture().await;
        f.connector
            .set_page(
                None,
                FetchPage {
                    valid: vec![SyncItem::new("good", serde_json::json!({}))],
                    invalid: vec![serde_json::json!({"broken": true})],
                    next_cursor: None,
                },
            )
            .await;

        let run = SyncRun::starting(f.org, false, Utc::now());
        assert_eq!(
            f.orchestrator.run_page(&run).await.unwrap(),
            RunOutcome::Completed
        );
        assert_eq!(f.sink.vendor_ids(f.org).await, vec!["good"]);
    }

    #[tokio::test]
    async fn empty_page_skips_upsert_but_still_finalizes() {
        let f = fixture().await;
        f.connector.set_page(None, page(&[], None)).await;

        let run = SyncRun::starting(f.org, false, Utc::now());
        f.orchestrator.run_page(&run).await.unwrap();

        assert!(f.sink.upsert_batches().await.is_empty());
        assert_eq!(f.sink.stale_deletes().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_organisation_is_fatal() {
        let f = fixture().await;
        f.store.delete(f.org).await.unwrap();

        let run = SyncRun::starting(f.org, false, Utc::now());
        let err = f.orchestrator.run_page(&run).await.unwrap_err();
        assert!(matches!(err, Error::OrganisationNotFound(id) if id == f.org));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn adapter_errors_surface_classified() {
        let f = fixture().await;
        f.connector
            .fail_with(vec![AdapterError::Http {
                status: 429,
                retry_after: Some(42),
                permission_denied: false,
                message: "slow down".to_string(),
            }])
            .await;

        let run = SyncRun::starting(f.org, false, Utc::now());
        let err = f.orchestrator.run_page(&run).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited { retry_after } if retry_after.as_secs() == 42
        ));
    }

    #[tokio::test]
    async fn rerunning_identical_page_is_idempotent() {
        let f = fixture().await;
        f.connector.set_page(None, page(&["a", "b"], None)).await;

        let run = SyncRun::starting(f.org, false, Utc::now());
        f.orchestrator.run_page(&run).await.unwrap();
        let after_first = f.sink.vendor_ids(f.org).await;
        f.orchestrator.run_page(&run).await.unwrap();

        assert_eq!(f.sink.vendor_ids(f.org).await, after_first);
    }
}
