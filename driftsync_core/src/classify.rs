//! The single classifier switch over adapter failures.
//!
//! Every adapter error is classified exactly once, at the orchestration
//! boundary. Nothing above it sees vendor-specific failure shapes.

use std::time::Duration;

use crate::adapter::AdapterError;
use crate::Error;

/// Classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Eligible for the default backoff retry policy.
    Transient,
    /// Vendor throttling; the next attempt is scheduled, never immediate.
    RateLimited { retry_after: Duration },
    /// Access revoked. Conflated with "app uninstalled" by business rule so
    /// the system self-heals from revoked grants without manual intervention.
    Unauthorized,
    /// Undecodable vendor data.
    Malformed,
    /// Vendor resource missing.
    NotFound,
}

/// Classify an adapter failure.
///
/// `rate_limit_default` is the conservative wait applied when the vendor
/// rate-limits without a usable reset header.
pub fn classify(error: &AdapterError, rate_limit_default: Duration) -> Classification {
    match error {
        AdapterError::Http {
            status: 401, ..
        } => Classification::Unauthorized,
        AdapterError::Http {
            status: 403,
            permission_denied: true,
            ..
        } => Classification::Unauthorized,
        AdapterError::Http {
            status: 429,
            retry_after,
            ..
        } => Classification::RateLimited {
            retry_after: retry_after
                .map(Duration::from_secs)
                .unwrap_or(rate_limit_default),
        },
        AdapterError::Http { status: 404, .. } => Classification::NotFound,
        AdapterError::Http { .. } | AdapterError::Network { .. } => Classification::Transient,
        AdapterError::InvalidCredential(_) => Classification::Unauthorized,
        AdapterError::Protocol(_) => Classification::Malformed,
    }
}

impl Classification {
    /// Surface a classified adapter failure through the crate taxonomy.
    pub fn into_error(self, source: &AdapterError) -> Error {
        match self {
            Classification::Transient => Error::Transient(source.to_string()),
            Classification::RateLimited { retry_after } => Error::RateLimited { retry_after },
            Classification::Unauthorized => Error::Unauthorized(source.to_string()),
            Classification::Malformed => Error::Malformed(source.to_string()),
            Classification::NotFound => Error::NotFound(source.to_string()),
        }
    }
}
