//! Durable sync orchestration core.
//!
//! The machinery every connector shares: pulling paginated records from a
//! vendor API one durable page at a time, reconciling them against a
//! downstream sink with a watermark delete, refreshing expiring credentials
//! ahead of their expiry, and doing all of it per-tenant with bounded
//! concurrency, classified retry, and cooperative cancellation.
//!
//! Vendor adapters, the downstream sink, and tenant storage are trait
//! boundaries; in-memory implementations are provided for local development
//! and tests.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod governor;
pub mod models;
pub mod orchestrator;
pub mod refresh;
pub mod runner;
pub mod sink;
pub mod store;
pub mod watermark;

pub use adapter::{AdapterError, Connector, FetchPage, StaticConnector};
pub use cancel::CancellationCoordinator;
pub use classify::{classify, Classification};
pub use config::SyncConfig;
pub use credentials::CredentialVault;
pub use error::{Error, Result};
pub use events::{Event, EventBus, MemoryEventBus};
pub use governor::ConcurrencyGovernor;
pub use models::{OrgId, Organisation, RunOutcome, SyncItem, SyncRun};
pub use orchestrator::SyncOrchestrator;
pub use refresh::{RefreshCycle, RefreshedCredential, TokenRefreshScheduler, TokenRefresher};
pub use runner::SyncRunner;
pub use sink::{MemorySink, Sink};
pub use store::{MemoryOrganisationStore, OrganisationStore};
pub use watermark::WatermarkFinalizer;
