//! Service-to-service authorization for privileged endpoints.

pub mod verify;

pub use verify::{require_internal, verify_internal, INTERNAL_SECRET_HEADER};
