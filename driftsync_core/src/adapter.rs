//! Connector adapter boundary.
//!
//! A connector is a pure fetch function over `(credential, cursor)`. It must
//! never fail on individually malformed records; those come back in
//! `FetchPage::invalid` and are logged by the orchestrator. Failures are
//! reported as tagged [`AdapterError`] variants so the classifier never has
//! to inspect vendor-specific error types.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::SyncItem;

/// One page of vendor data.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub valid: Vec<SyncItem>,
    /// Records the connector could not decode; never abort the run over these.
    pub invalid: Vec<serde_json::Value>,
    /// `None` means the pagination sweep is finished.
    pub next_cursor: Option<String>,
}

/// Transport- and auth-level adapter failure.
#[derive(thiserror::Error, Debug, Clone)]
pub enum AdapterError {
    #[error("vendor returned http {status}: {message}")]
    Http {
        status: u16,
        /// Vendor-supplied reset delay, already parsed to seconds.
        retry_after: Option<u64>,
        /// Set by the adapter when a 403 body spells out a revoked grant.
        /// Only the adapter can read the vendor body, so it owns this call.
        permission_denied: bool,
        message: String,
    },

    #[error("network failure: {message}")]
    Network { message: String },

    /// The stored credential is structurally unusable (missing token fields).
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The whole response body was undecodable.
    #[error("undecodable vendor response: {0}")]
    Protocol(String),
}

/// Per-vendor connector adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stable connector identifier (e.g. `"hubspot"`).
    fn id(&self) -> &'static str;

    /// Fetch one page. A `None` cursor requests the first page.
    async fn fetch_page(
        &self,
        credential: &serde_json::Value,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError>;
}

pub mod http {
    //! Helpers for connectors built on `reqwest`: translate HTTP failures
    //! into tagged [`AdapterError`] variants.

    use reqwest::header::{HeaderMap, RETRY_AFTER};
    use reqwest::StatusCode;

    use super::AdapterError;

    /// Parse a vendor rate-limit reset to whole seconds. Checks the standard
    /// `Retry-After` header first, then `X-RateLimit-Reset` as a delta.
    pub fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
        let direct = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        if direct.is_some() {
            return direct;
        }
        headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    }

    /// Build an [`AdapterError::Http`] from a non-success response's status
    /// line and headers. `permission_denied` is the adapter's own reading of
    /// the body (vendor-specific 403 semantics).
    pub fn error_from_status(
        status: StatusCode,
        headers: &HeaderMap,
        permission_denied: bool,
        message: impl Into<String>,
    ) -> AdapterError {
        AdapterError::Http {
            status: status.as_u16(),
            retry_after: retry_after_seconds(headers),
            permission_denied,
            message: message.into(),
        }
    }

    impl From<reqwest::Error> for AdapterError {
        fn from(err: reqwest::Error) -> Self {
            match err.status() {
                Some(status) => AdapterError::Http {
                    status: status.as_u16(),
                    retry_after: None,
                    permission_denied: false,
                    message: err.to_string(),
                },
                None if err.is_decode() => AdapterError::Protocol(err.to_string()),
                None => AdapterError::Network {
                    message: err.to_string(),
                },
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use reqwest::header::HeaderValue;

        #[test]
        fn parses_retry_after_header() {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
            assert_eq!(retry_after_seconds(&headers), Some(42));
        }

        #[test]
        fn falls_back_to_ratelimit_reset() {
            let mut headers = HeaderMap::new();
            headers.insert("x-ratelimit-reset", HeaderValue::from_static("17"));
            assert_eq!(retry_after_seconds(&headers), Some(17));
        }

        #[test]
        fn missing_headers_yield_none() {
            assert_eq!(retry_after_seconds(&HeaderMap::new()), None);
        }

        #[test]
        fn http_date_retry_after_is_ignored() {
            // Date-form Retry-After is rare among vendor APIs; treat as absent
            // so the conservative default applies.
            let mut headers = HeaderMap::new();
            headers.insert(
                RETRY_AFTER,
                HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
            );
            assert_eq!(retry_after_seconds(&headers), None);
        }

        #[test]
        fn builds_http_error_with_reset() {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_static("9"));
            let err = error_from_status(
                StatusCode::TOO_MANY_REQUESTS,
                &headers,
                false,
                "throttled",
            );
            match err {
                AdapterError::Http {
                    status,
                    retry_after,
                    ..
                } => {
                    assert_eq!(status, 429);
                    assert_eq!(retry_after, Some(9));
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }
}

/// Scripted connector for local development and tests: serves a fixed page
/// per cursor and can fail a bounded number of times before succeeding.
#[derive(Clone, Default)]
pub struct StaticConnector {
    pages: Arc<Mutex<HashMap<Option<String>, FetchPage>>>,
    failures: Arc<Mutex<Vec<AdapterError>>>,
    calls: Arc<Mutex<u64>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the page served for `cursor`.
    pub async fn set_page(&self, cursor: Option<String>, page: FetchPage) {
        self.pages.lock().await.insert(cursor, page);
    }

    /// Queue errors returned (in order) before any page is served.
    pub async fn fail_with(&self, errors: Vec<AdapterError>) {
        *self.failures.lock().await = errors;
    }

    pub async fn call_count(&self) -> u64 {
        *self.calls.lock().await
    }
}

#[async_trait]
impl Connector for StaticConnector {
    fn id(&self) -> &'static str {
        "static"
    }

    async fn fetch_page(
        &self,
        _credential: &serde_json::Value,
        cursor: Option<&str>,
    ) -> Result<FetchPage, AdapterError> {
        *self.calls.lock().await += 1;

        let mut failures = self.failures.lock().await;
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        drop(failures);

        let pages = self.pages.lock().await;
        pages
            .get(&cursor.map(str::to_string))
            .cloned()
            .ok_or_else(|| AdapterError::Protocol(format!("no page scripted for cursor {cursor:?}")))
    }
}
