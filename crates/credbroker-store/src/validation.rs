//! Pre-write validation shared by the repository operations.
//!
//! Only rules that can be decided from the request alone live here. Rules
//! that depend on stored state (scoped name uniqueness, the method/body
//! pairing after a partial update, parent existence) are enforced by the
//! schema and surface through the SQLite constraint classification in
//! [`crate::error`].

use crate::error::{StoreError, StoreResult};

/// Fail with `InvalidParameter` when a required string is empty.
pub fn require(op: &'static str, what: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::invalid_parameter(op, format!("missing {what}")));
    }
    Ok(())
}

/// Public ids are minted by the repository; callers may not supply one.
pub fn reject_public_id(op: &'static str, public_id: &str) -> StoreResult<()> {
    if !public_id.is_empty() {
        return Err(StoreError::invalid_parameter(
            op,
            "public id is set by the repository",
        ));
    }
    Ok(())
}

/// Updates must name the version they were computed from.
pub fn require_version(op: &'static str, version: u32) -> StoreResult<()> {
    if version == 0 {
        return Err(StoreError::invalid_parameter(op, "missing version"));
    }
    Ok(())
}

/// A client certificate key is meaningless without its certificate.
pub fn client_key_needs_certificate(
    op: &'static str,
    certificate: Option<&str>,
    has_key: bool,
) -> StoreResult<()> {
    if has_key && certificate.is_none_or(str::is_empty) {
        return Err(StoreError::invalid_parameter(
            op,
            "client certificate key requires a client certificate",
        ));
    }
    Ok(())
}
