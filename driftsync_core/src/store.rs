use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::models::{OrgId, Organisation};
use crate::Result;

/// Per-tenant organisation storage. Exactly one record per tenant; the
/// encrypted credential is the only mutable field outside install/uninstall.
#[async_trait]
pub trait OrganisationStore: Send + Sync {
    async fn get(&self, organisation_id: OrgId) -> Result<Option<Organisation>>;

    /// Insert or replace the record for `organisation.id`.
    async fn put(&self, organisation: &Organisation) -> Result<()>;

    /// Remove the record. Deleting an absent record is not an error.
    async fn delete(&self, organisation_id: OrgId) -> Result<()>;
}

/// In-memory store for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryOrganisationStore {
    rows: Arc<Mutex<HashMap<OrgId, Organisation>>>,
}

impl MemoryOrganisationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows (primarily for tests).
    pub async fn all(&self) -> Vec<Organisation> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl OrganisationStore for MemoryOrganisationStore {
    async fn get(&self, organisation_id: OrgId) -> Result<Option<Organisation>> {
        Ok(self.rows.lock().await.get(&organisation_id).cloned())
    }

    async fn put(&self, organisation: &Organisation) -> Result<()> {
        self.rows
            .lock()
            .await
            .insert(organisation.id, organisation.clone());
        Ok(())
    }

    async fn delete(&self, organisation_id: OrgId) -> Result<()> {
        self.rows.lock().await.remove(&organisation_id);
        Ok(())
    }
}
