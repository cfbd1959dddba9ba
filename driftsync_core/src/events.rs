//! Event contracts the core consumes and emits.
//!
//! Payload shapes are the binding contract; topic names follow the
//! `noun.verb` convention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{OrgId, SyncRun};
use crate::{Error, Result};

/// Triggers one orchestrator page. Payload is a [`SyncRun`].
pub const TOPIC_SYNC_REQUESTED: &str = "sync.requested";
/// A tenant (re)installed the application.
pub const TOPIC_APP_INSTALLED: &str = "app.installed";
/// A tenant uninstalled the application, or its grant was revoked.
pub const TOPIC_APP_UNINSTALLED: &str = "app.uninstalled";
/// Self-re-emitted by the refresh scheduler each cycle.
pub const TOPIC_TOKEN_REFRESH_REQUESTED: &str = "token.refresh.requested";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppLifecycle {
    pub organisation_id: OrgId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRefreshRequested {
    pub organisation_id: OrgId,
    pub expires_at: DateTime<Utc>,
}

/// A durable event routed through the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// ULID (sortable by time).
    pub id: String,
    pub organisation_id: OrgId,
    pub topic: String,
    pub payload: serde_json::Value,
    /// Idempotency key for consumer-side dedupe.
    pub dedupe_key: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        organisation_id: OrgId,
        topic: impl Into<String>,
        payload: serde_json::Value,
        dedupe_key: impl Into<String>,
    ) -> Result<Self> {
        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(Error::InvalidInput("event topic is empty".to_string()));
        }
        let dedupe_key = dedupe_key.into();
        if dedupe_key.trim().is_empty() {
            return Err(Error::InvalidInput("event dedupe_key is empty".to_string()));
        }
        Ok(Self {
            id: ulid::Ulid::new().to_string(),
            organisation_id,
            topic,
            payload,
            dedupe_key,
            occurred_at: Utc::now(),
        })
    }

    /// Build a `sync.requested` event carrying one page of work.
    pub fn sync_requested(run: &SyncRun) -> Result<Self> {
        let payload = serde_json::to_value(run)
            .map_err(|e| Error::backend("serialize sync.requested payload", e))?;
        let dedupe_key = format!(
            "sync:{}:{}:{}",
            run.organisation_id,
            run.sync_started_at.timestamp_millis(),
            run.cursor.as_deref().unwrap_or("start"),
        );
        Self::new(run.organisation_id, TOPIC_SYNC_REQUESTED, payload, dedupe_key)
    }

    pub fn app_installed(organisation_id: OrgId) -> Result<Self> {
        let payload = serde_json::to_value(AppLifecycle { organisation_id })
            .map_err(|e| Error::backend("serialize app.installed payload", e))?;
        Self::new(
            organisation_id,
            TOPIC_APP_INSTALLED,
            payload,
            format!("installed:{organisation_id}"),
        )
    }

    pub fn app_uninstalled(organisation_id: OrgId) -> Result<Self> {
        let payload = serde_json::to_value(AppLifecycle { organisation_id })
            .map_err(|e| Error::backend("serialize app.uninstalled payload", e))?;
        Self::new(
            organisation_id,
            TOPIC_APP_UNINSTALLED,
            payload,
            format!("uninstalled:{organisation_id}"),
        )
    }

    pub fn token_refresh_requested(
        organisation_id: OrgId,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        let payload = serde_json::to_value(TokenRefreshRequested {
            organisation_id,
            expires_at,
        })
        .map_err(|e| Error::backend("serialize token.refresh.requested payload", e))?;
        Self::new(
            organisation_id,
            TOPIC_TOKEN_REFRESH_REQUESTED,
            payload,
            format!("refresh:{organisation_id}:{}", expires_at.timestamp()),
        )
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Implementations must provide at-least-once delivery.
    async fn publish(&self, event: Event) -> Result<String>; // event id
}

/// In-memory EventBus for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryEventBus {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all published events (primarily for tests).
    pub async fn all_events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Snapshot filtered by topic.
    pub async fn events_for_topic(&self, topic: &str) -> Vec<Event> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> Result<String> {
        let id = event.id.clone();
        self.events.lock().await.push(event);
        Ok(id)
    }
}
