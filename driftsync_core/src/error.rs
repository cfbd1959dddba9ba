use std::error::Error as StdError;
use std::time::Duration;

use crate::models::OrgId;

/// Common error type for `driftsync_core`.
///
/// Adapter and sink failures are classified once at the orchestration
/// boundary; everything above that boundary only ever sees these variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The tenant record vanished mid-flight. Fatal for the run, never retried.
    #[error("organisation not found: {0}")]
    OrganisationNotFound(OrgId),

    /// Vendor access revoked. Fatal for the run; triggers the uninstall cascade.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Vendor throttling. The run is re-scheduled `retry_after` in the future.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Eligible for the default backoff retry policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Vendor resource missing (distinct from the tenant record vanishing).
    #[error("not found: {0}")]
    NotFound(String),

    /// Undecodable vendor page. Individually malformed records are logged and
    /// skipped instead of surfacing here.
    #[error("malformed vendor data: {0}")]
    Malformed(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Whether the default backoff retry policy applies to this error.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Backend { .. } | Self::BackendMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
