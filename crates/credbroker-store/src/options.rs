//! Per-call and per-repository configuration.
//!
//! Options are plain structs with documented defaults, resolved once before
//! an operation starts.

use std::time::Duration;

use credbroker_kms::SecretString;

use crate::models::CredentialStore;

/// Literal that requests resetting an option to its default.
pub const NULL_SENTINEL: &str = "null";

/// Repository-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Row limit for list calls that do not pass their own. Zero or
    /// negative means unlimited. Default: unlimited.
    pub default_limit: i32,
    /// How often stored ciphertext is re-sealed under the current key.
    /// Default: one hour.
    pub rewrap_interval: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            default_limit: 0,
            rewrap_interval: Duration::from_secs(3600),
        }
    }
}

/// Options for list calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Zero uses the repository default, negative is unlimited, anything
    /// else wins over the repository default.
    pub limit: i32,
}

impl ListOptions {
    pub fn with_limit(limit: i32) -> Self {
        Self { limit }
    }
}

/// Effective SQL limit for a list call; `-1` means no limit in SQLite.
pub(crate) fn resolve_limit(default_limit: i32, opts: &ListOptions) -> i64 {
    let limit = match opts.limit {
        0 => default_limit,
        n => n,
    };
    if limit > 0 { i64::from(limit) } else { -1 }
}

// ---------------------------------------------------------------------------
// Option sentinels
// ---------------------------------------------------------------------------

/// A caller-supplied option: absent, explicitly reset, or a value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OptionValue<T> {
    /// Not supplied: leave the field alone.
    #[default]
    Unset,
    /// Reset to the default (clears nullable fields).
    Default,
    Set(T),
}

impl OptionValue<String> {
    /// `""` is unset, `"null"` requests the default, anything else is a value.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" => Self::Unset,
            NULL_SENTINEL => Self::Default,
            value => Self::Set(value.to_string()),
        }
    }
}

impl OptionValue<bool> {
    /// Like [`OptionValue::parse`], for boolean flags. Returns `None` for a
    /// value that is not a boolean.
    pub fn parse_bool(raw: &str) -> Option<Self> {
        match raw {
            "" => Some(Self::Unset),
            NULL_SENTINEL => Some(Self::Default),
            value => value.parse().ok().map(Self::Set),
        }
    }
}

impl<T> OptionValue<T> {
    /// Write the option into `slot` and report whether it was supplied;
    /// `Default` writes `T::default()`.
    fn apply_to(self, slot: &mut T) -> bool
    where
        T: Default,
    {
        match self {
            Self::Unset => false,
            Self::Default => {
                *slot = T::default();
                true
            }
            Self::Set(value) => {
                *slot = value;
                true
            }
        }
    }
}

/// Connection options for a credential store, one per settable attribute.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    pub name: OptionValue<String>,
    pub description: OptionValue<String>,
    pub address: OptionValue<String>,
    pub namespace: OptionValue<String>,
    pub ca_cert: OptionValue<String>,
    pub tls_server_name: OptionValue<String>,
    pub tls_skip_verify: OptionValue<bool>,
    pub token: OptionValue<SecretString>,
    pub client_certificate: OptionValue<String>,
    pub client_certificate_key: OptionValue<SecretString>,
}

impl StoreSettings {
    /// Apply the settings onto `candidate` and return the field mask for an
    /// update carrying them.
    pub fn apply(self, candidate: &mut CredentialStore) -> Vec<&'static str> {
        let mut mask = Vec::new();
        let mut optional = |value: OptionValue<String>, slot: &mut Option<String>, field| {
            let mut inner = slot.take().unwrap_or_default();
            if value.apply_to(&mut inner) {
                mask.push(field);
            }
            *slot = Some(inner).filter(|s| !s.is_empty());
        };
        optional(self.name, &mut candidate.name, "Name");
        optional(self.description, &mut candidate.description, "Description");
        optional(self.namespace, &mut candidate.namespace, "Namespace");
        optional(self.ca_cert, &mut candidate.ca_cert, "CaCert");
        optional(self.tls_server_name, &mut candidate.tls_server_name, "TlsServerName");
        optional(
            self.client_certificate,
            &mut candidate.client_certificate,
            "ClientCertificate",
        );

        if self.address.apply_to(&mut candidate.address) {
            mask.push("Address");
        }
        if self.tls_skip_verify.apply_to(&mut candidate.tls_skip_verify) {
            mask.push("TlsSkipVerify");
        }

        let mut secret = |value: OptionValue<SecretString>, slot: &mut Option<SecretString>, field| {
            let mut inner = slot.take().unwrap_or_default();
            if value.apply_to(&mut inner) {
                mask.push(field);
            }
            *slot = Some(inner).filter(|s| !s.is_empty());
        };
        secret(self.token, &mut candidate.token, "Token");
        secret(
            self.client_certificate_key,
            &mut candidate.client_certificate_key,
            "ClientCertificateKey",
        );
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_limit_wins_over_default() {
        assert_eq!(resolve_limit(2, &ListOptions::with_limit(6)), 6);
        assert_eq!(resolve_limit(6, &ListOptions::with_limit(2)), 2);
        assert_eq!(resolve_limit(6, &ListOptions::default()), 6);
        assert_eq!(resolve_limit(6, &ListOptions::with_limit(-1)), -1);
        assert_eq!(resolve_limit(0, &ListOptions::default()), -1);
        assert_eq!(resolve_limit(-5, &ListOptions::default()), -1);
    }

    #[test]
    fn sentinel_parsing() {
        assert_eq!(OptionValue::parse(""), OptionValue::Unset);
        assert_eq!(OptionValue::parse("null"), OptionValue::Default);
        assert_eq!(
            OptionValue::parse("vault.internal"),
            OptionValue::Set("vault.internal".to_string())
        );
        assert_eq!(OptionValue::parse_bool("true"), Some(OptionValue::Set(true)));
        assert_eq!(OptionValue::parse_bool("null"), Some(OptionValue::Default));
        assert_eq!(OptionValue::parse_bool("maybe"), None);
    }

    #[test]
    fn settings_build_candidate_and_mask() {
        let mut candidate = CredentialStore {
            namespace: Some("team-a".into()),
            tls_skip_verify: true,
            ..CredentialStore::default()
        };
        let settings = StoreSettings {
            namespace: OptionValue::Default,
            tls_server_name: OptionValue::parse("vault.internal"),
            tls_skip_verify: OptionValue::Default,
            token: OptionValue::Set(SecretString::new("s.new")),
            ..StoreSettings::default()
        };

        let mask = settings.apply(&mut candidate);
        assert_eq!(mask, vec!["Namespace", "TlsServerName", "TlsSkipVerify", "Token"]);
        assert_eq!(candidate.namespace, None);
        assert_eq!(candidate.tls_server_name.as_deref(), Some("vault.internal"));
        assert!(!candidate.tls_skip_verify);
        assert_eq!(
            candidate.token.as_ref().map(SecretString::expose_secret),
            Some("s.new")
        );
    }

    #[test]
    fn unset_settings_leave_candidate_alone() {
        let mut candidate = CredentialStore {
            name: Some("prod".into()),
            ..CredentialStore::default()
        };
        let mask = StoreSettings::default().apply(&mut candidate);
        assert!(mask.is_empty());
        assert_eq!(candidate.name.as_deref(), Some("prod"));
    }
}
