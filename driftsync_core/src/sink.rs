use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{OrgId, SyncItem};
use crate::Result;

/// Downstream sink for synced entities.
///
/// Upserts must be set-semantics (idempotent): re-running a page with
/// identical items leaves the sink in the same state as running it once.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn upsert(&self, organisation_id: OrgId, items: &[SyncItem]) -> Result<()>;

    /// Remove every entity for the organisation whose last-touched timestamp
    /// precedes `synced_before`. Absence across a full pagination sweep is
    /// the delete signal for upstream removals.
    async fn delete_stale_before(
        &self,
        organisation_id: OrgId,
        synced_before: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
struct SinkRow {
    payload: serde_json::Value,
    last_touched: DateTime<Utc>,
}

/// In-memory sink for local development and unit tests. Tracks last-touched
/// timestamps and records call shapes for assertions.
#[derive(Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<HashMap<(OrgId, String), SinkRow>>>,
    upsert_batches: Arc<Mutex<Vec<(OrgId, usize)>>>,
    stale_deletes: Arc<Mutex<Vec<(OrgId, DateTime<Utc>)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn vendor_ids(&self, organisation_id: OrgId) -> Vec<String> {
        let rows = self.rows.lock().await;
        let mut ids: Vec<String> = rows
            .keys()
            .filter(|(org, _)| *org == organisation_id)
            .map(|(_, vendor_id)| vendor_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn last_touched(
        &self,
        organisation_id: OrgId,
        vendor_id: &str,
    ) -> Option<DateTime<Utc>> {
        self.rows
            .lock()
            .await
            .get(&(organisation_id, vendor_id.to_string()))
            .map(|r| r.last_touched)
    }

    /// Each recorded upsert call as `(org, batch_len)`.
    pub async fn upsert_batches(&self) -> Vec<(OrgId, usize)> {
        self.upsert_batches.lock().await.clone()
    }

    pub async fn stale_deletes(&self) -> Vec<(OrgId, DateTime<Utc>)> {
        self.stale_deletes.lock().await.clone()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert(&self, organisation_id: OrgId, items: &[SyncItem]) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        for item in items {
            rows.insert(
                (organisation_id, item.vendor_id.clone()),
                SinkRow {
                    payload: item.payload.clone(),
                    last_touched: now,
                },
            );
        }
        drop(rows);
        self.upsert_batches
            .lock()
            .await
            .push((organisation_id, items.len()));
        Ok(())
    }

    async fn delete_stale_before(
        &self,
        organisation_id: OrgId,
        synced_before: DateTime<Utc>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().await;
        rows.retain(|(org, _), row| *org != organisation_id || row.last_touched >= synced_before);
        drop(rows);
        self.stale_deletes
            .lock()
            .await
            .push((organisation_id, synced_before));
        Ok(())
    }
}
