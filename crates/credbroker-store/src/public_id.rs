//! Prefixed public identifiers.
//!
//! Every resource is addressed by `<prefix>_<random>` where the prefix names
//! the resource type and the random part is ten alphanumeric characters drawn
//! from the operating system RNG.

use std::sync::LazyLock;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;

use crate::error::{StoreError, StoreResult};

/// Prefix of credential store ids.
pub const CREDENTIAL_STORE_PREFIX: &str = "csvlt";

/// Prefix of credential library ids.
pub const CREDENTIAL_LIBRARY_PREFIX: &str = "clvlt";

const RANDOM_LEN: usize = 10;

static PUBLIC_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+_[A-Za-z0-9]{10}$").expect("valid public id pattern"));

/// Mint a new id with the given prefix.
pub fn new_public_id(prefix: &str) -> String {
    let random: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}_{random}")
}

/// Whether `id` has the `<prefix>_<random>` shape, for any prefix.
pub fn is_valid(id: &str) -> bool {
    PUBLIC_ID.is_match(id)
}

/// Whether `id` is valid and carries `prefix`.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    is_valid(id)
        && id
            .split_once('_')
            .is_some_and(|(p, _)| p == prefix)
}

/// Fail with [`StoreError::InvalidPublicId`] unless `id` is well formed.
pub fn check(op: &'static str, id: &str) -> StoreResult<()> {
    if id.is_empty() {
        return Err(StoreError::InvalidPublicId {
            op,
            msg: "missing public id".into(),
        });
    }
    if !is_valid(id) {
        return Err(StoreError::InvalidPublicId {
            op,
            msg: format!("malformed public id {id:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_ids_are_valid_and_prefixed() {
        for _ in 0..100 {
            let id = new_public_id(CREDENTIAL_LIBRARY_PREFIX);
            assert!(has_prefix(&id, CREDENTIAL_LIBRARY_PREFIX), "{id}");
            assert!(!has_prefix(&id, CREDENTIAL_STORE_PREFIX));
        }
    }

    #[test]
    fn minted_ids_differ() {
        let a = new_public_id(CREDENTIAL_STORE_PREFIX);
        let b = new_public_id(CREDENTIAL_STORE_PREFIX);
        assert_ne!(a, b);
    }

    #[test]
    fn syntax_is_enforced() {
        assert!(is_valid("clvlt_AbC123xYz0"));
        assert!(is_valid("p_1234567890"));
        assert!(!is_valid(""));
        assert!(!is_valid("clvlt"));
        assert!(!is_valid("_1234567890"));
        assert!(!is_valid("CLVLT_1234567890"));
        assert!(!is_valid("clvlt_12345"));
        assert!(!is_valid("clvlt_12345-7890"));
        assert!(!is_valid("clvlt_12345678901"));
        assert!(!is_valid("clvlt_1234567890\n"));
    }

    #[test]
    fn check_reports_invalid_public_id() {
        use crate::error::ErrorKind;
        assert_eq!(check("op", "").unwrap_err().kind(), ErrorKind::InvalidPublicId);
        assert_eq!(check("op", "bogus").unwrap_err().kind(), ErrorKind::InvalidPublicId);
        assert!(check("op", "clvlt_1234567890").is_ok());
    }
}
