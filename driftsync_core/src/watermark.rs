use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::models::OrgId;
use crate::sink::Sink;
use crate::Result;

/// Issues the end-of-run watermark delete: entities not touched since the
/// run's fixed `sync_started_at` were absent from the full pagination sweep
/// and are treated as removed upstream.
#[derive(Clone)]
pub struct WatermarkFinalizer {
    sink: Arc<dyn Sink>,
}

impl WatermarkFinalizer {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete_stale(
        &self,
        organisation_id: OrgId,
        synced_before: DateTime<Utc>,
    ) -> Result<()> {
        self.sink
            .delete_stale_before(organisation_id, synced_before)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SyncItem;
    use crate::sink::MemorySink;
    use uuid::Uuid;

    #[tokio::test]
    async fn forwards_watermark_to_sink() {
        let sink = Arc::new(MemorySink::new());
        let finalizer = WatermarkFinalizer::new(sink.clone());
        let org = OrgId(Uuid::new_v4());

        sink.upsert(org, &[SyncItem::new("gone", serde_json::json!({}))])
            .await
            .unwrap();
        let cutoff = Utc::now();
        finalizer.delete_stale(org, cutoff).await.unwrap();

        assert!(sink.vendor_ids(org).await.is_empty());
        assert_eq!(sink.stale_deletes().await, vec![(org, cutoff)]);
    }
}
