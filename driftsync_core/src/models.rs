use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Tenant identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub Uuid);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for OrgId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for OrgId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// The one row per tenant. Created on install, credential fields mutated by
/// the refresh scheduler, deleted on uninstall (or the unauthorized cascade).
/// All sync state is derived from the credential, never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organisation {
    pub id: OrgId,
    pub region: String,
    pub encrypted_credential: Vec<u8>,
    pub credential_expiry: Option<DateTime<Utc>>,
    pub auth_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One page's worth of sync work, carried as an event payload.
///
/// `sync_started_at` is fixed at run start and propagated unchanged across
/// every page so the final watermark delete is consistent even though pages
/// execute at different wall-clock times. A `None` cursor means "first page"
/// on input and "no more pages" on output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub organisation_id: OrgId,
    pub sync_started_at: DateTime<Utc>,
    pub is_first_sync: bool,
    pub cursor: Option<String>,
}

impl SyncRun {
    /// Start a run at the first page, fixing the watermark to `started_at`.
    pub fn starting(organisation_id: OrgId, is_first_sync: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            organisation_id,
            sync_started_at: started_at,
            is_first_sync,
            cursor: None,
        }
    }

    /// The follow-up run for the next page. Watermark and first-sync flag are
    /// carried unchanged; only the cursor advances.
    pub fn next_page(&self, cursor: String) -> Self {
        Self {
            organisation_id: self.organisation_id,
            sync_started_at: self.sync_started_at,
            is_first_sync: self.is_first_sync,
            cursor: Some(cursor),
        }
    }
}

/// Outcome of executing one page.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// More pages remain; the caller must enqueue `next` as a fresh unit of
    /// work (a new durable step boundary), never loop in-process.
    Ongoing(SyncRun),
    /// The cursor is exhausted and the watermark delete has been issued.
    Completed,
}

/// A synced entity as handed to the sink, identified downstream by
/// `(organisation_id, vendor_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Stable identifier in the vendor's system.
    pub vendor_id: String,
    /// Vendor-shaped payload; this core never inspects it.
    pub payload: serde_json::Value,
}

impl SyncItem {
    pub fn new(vendor_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            payload,
        }
    }
}
