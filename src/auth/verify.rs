use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::BrokerError;

/// Header carrying the shared internal secret.
pub const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

/// Constant-time check of a caller-supplied secret. An empty configured
/// secret never matches.
pub fn verify_internal(provided: &str, expected: &str) -> Result<(), BrokerError> {
    if expected.is_empty() || !bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(BrokerError::Forbidden);
    }
    Ok(())
}

/// Require `x-internal-secret` to match the configured secret.
pub fn require_internal(headers: &HeaderMap, expected: &str) -> Result<(), BrokerError> {
    let provided = headers
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(BrokerError::Forbidden)?;

    verify_internal(provided, expected)
}
