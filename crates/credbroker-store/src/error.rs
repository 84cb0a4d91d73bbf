//! Error types for the credbroker-store crate.
//!
//! All repository operations return [`StoreError`] via [`StoreResult`].
//! Callers match on [`StoreError::kind`], never on the message: the kind set
//! is stable while messages are for humans. Every variant that can arise in a
//! repository call records the operation name it came from.

use std::fmt;

use credbroker_jobs::JobError;
use credbroker_kms::KmsError;
use rusqlite::ffi;
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Stable, matchable classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    InvalidPublicId,
    RecordNotFound,
    EmptyFieldMask,
    InvalidFieldMask,
    NotUnique,
    NotNull,
    CheckConstraint,
    KeyUnavailable,
    Canceled,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidParameter => "invalid parameter",
            Self::InvalidPublicId => "invalid public id",
            Self::RecordNotFound => "record not found",
            Self::EmptyFieldMask => "empty field mask",
            Self::InvalidFieldMask => "invalid field mask",
            Self::NotUnique => "not unique",
            Self::NotNull => "not null",
            Self::CheckConstraint => "check constraint",
            Self::KeyUnavailable => "key unavailable",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the repository and its storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op}: invalid parameter: {msg}")]
    InvalidParameter { op: &'static str, msg: String },

    #[error("{op}: invalid public id: {msg}")]
    InvalidPublicId { op: &'static str, msg: String },

    /// No row matched; covers both an unknown id and a stale version.
    #[error("{op}: record not found: {msg}")]
    RecordNotFound { op: &'static str, msg: String },

    #[error("{op}: empty field mask")]
    EmptyFieldMask { op: &'static str },

    #[error("{op}: invalid field mask: {msg}")]
    InvalidFieldMask { op: &'static str, msg: String },

    #[error("{op}: unique constraint violation: {msg}")]
    NotUnique { op: &'static str, msg: String },

    #[error("{op}: not null constraint violation: {msg}")]
    NotNull { op: &'static str, msg: String },

    #[error("{op}: check constraint violation: {msg}")]
    CheckConstraint { op: &'static str, msg: String },

    /// The scope's data key could not be resolved.
    #[error("{op}: key unavailable: {source}")]
    KeyUnavailable {
        op: &'static str,
        #[source]
        source: KmsError,
    },

    /// The caller canceled the operation or its deadline passed.
    #[error("{op}: canceled: {msg}")]
    Canceled { op: &'static str, msg: String },

    /// SQLite operation failed for a reason that is not a business rule.
    #[error("{op}: sqlite error: {source}")]
    Sqlite {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// JSON serialization or deserialization failed.
    #[error("{op}: json error: {source}")]
    Json {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Key management failed for a reason other than a missing key.
    #[error("{op}: kms error: {source}")]
    Kms {
        op: &'static str,
        #[source]
        source: KmsError,
    },

    /// Job registration failed.
    #[error("{op}: job error: {source}")]
    Jobs {
        op: &'static str,
        #[source]
        source: JobError,
    },

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    #[error("{op}: internal error: {msg}")]
    Internal { op: &'static str, msg: String },
}

impl StoreError {
    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Self::InvalidPublicId { .. } => ErrorKind::InvalidPublicId,
            Self::RecordNotFound { .. } => ErrorKind::RecordNotFound,
            Self::EmptyFieldMask { .. } => ErrorKind::EmptyFieldMask,
            Self::InvalidFieldMask { .. } => ErrorKind::InvalidFieldMask,
            Self::NotUnique { .. } => ErrorKind::NotUnique,
            Self::NotNull { .. } => ErrorKind::NotNull,
            Self::CheckConstraint { .. } => ErrorKind::CheckConstraint,
            Self::KeyUnavailable { .. } => ErrorKind::KeyUnavailable,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Sqlite { .. }
            | Self::Json { .. }
            | Self::Kms { .. }
            | Self::Jobs { .. }
            | Self::Migration { .. }
            | Self::TaskJoin(_)
            | Self::Internal { .. } => ErrorKind::Unknown,
        }
    }

    /// The operation the error arose in, when one was recorded.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Self::InvalidParameter { op, .. }
            | Self::InvalidPublicId { op, .. }
            | Self::RecordNotFound { op, .. }
            | Self::EmptyFieldMask { op }
            | Self::InvalidFieldMask { op, .. }
            | Self::NotUnique { op, .. }
            | Self::NotNull { op, .. }
            | Self::CheckConstraint { op, .. }
            | Self::KeyUnavailable { op, .. }
            | Self::Canceled { op, .. }
            | Self::Sqlite { op, .. }
            | Self::Json { op, .. }
            | Self::Kms { op, .. }
            | Self::Jobs { op, .. }
            | Self::Internal { op, .. } => Some(*op),
            Self::Migration { .. } | Self::TaskJoin(_) => None,
        }
    }

    pub(crate) fn invalid_parameter(op: &'static str, msg: impl Into<String>) -> Self {
        Self::InvalidParameter {
            op,
            msg: msg.into(),
        }
    }

    pub(crate) fn not_found(op: &'static str, msg: impl Into<String>) -> Self {
        Self::RecordNotFound {
            op,
            msg: msg.into(),
        }
    }

    /// Classify a SQLite error by its extended result code.
    pub(crate) fn sqlite(op: &'static str, err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                let msg = message.clone().unwrap_or_else(|| err.to_string());
                match failure.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        return Self::NotUnique { op, msg };
                    }
                    ffi::SQLITE_CONSTRAINT_NOTNULL => return Self::NotNull { op, msg },
                    ffi::SQLITE_CONSTRAINT_CHECK => return Self::CheckConstraint { op, msg },
                    ffi::SQLITE_CONSTRAINT_FOREIGNKEY | ffi::SQLITE_CONSTRAINT_TRIGGER => {
                        return Self::InvalidParameter { op, msg };
                    }
                    _ => {}
                }
            }
        }
        Self::Sqlite { op, source: err }
    }

    /// Map a key management failure, keeping missing keys distinguishable.
    pub(crate) fn kms(op: &'static str, err: KmsError) -> Self {
        if err.is_key_unavailable() {
            Self::KeyUnavailable { op, source: err }
        } else {
            Self::Kms { op, source: err }
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::sqlite("database", err)
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Attach an operation name to a backend result.
pub(crate) trait OpContext<T> {
    fn op_err(self, op: &'static str) -> StoreResult<T>;
}

impl<T> OpContext<T> for Result<T, rusqlite::Error> {
    fn op_err(self, op: &'static str) -> StoreResult<T> {
        self.map_err(|e| StoreError::sqlite(op, e))
    }
}

impl<T> OpContext<T> for Result<T, serde_json::Error> {
    fn op_err(self, op: &'static str) -> StoreResult<T> {
        self.map_err(|source| StoreError::Json { op, source })
    }
}

impl<T> OpContext<T> for Result<T, KmsError> {
    fn op_err(self, op: &'static str) -> StoreResult<T> {
        self.map_err(|e| StoreError::kms(op, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn constraint_error(sql: &str) -> StoreError {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (
                 id   INTEGER PRIMARY KEY,
                 name TEXT NOT NULL UNIQUE,
                 n    INTEGER CHECK(n > 0)
             );
             INSERT INTO t (id, name, n) VALUES (1, 'a', 1);",
        )
        .unwrap();
        let err = conn.execute_batch(sql).unwrap_err();
        StoreError::sqlite("test", err)
    }

    #[test]
    fn constraint_codes_are_classified() {
        assert_eq!(
            constraint_error("INSERT INTO t (name, n) VALUES ('a', 1)").kind(),
            ErrorKind::NotUnique
        );
        assert_eq!(
            constraint_error("INSERT INTO t (name, n) VALUES (NULL, 1)").kind(),
            ErrorKind::NotNull
        );
        assert_eq!(
            constraint_error("INSERT INTO t (name, n) VALUES ('b', 0)").kind(),
            ErrorKind::CheckConstraint
        );
        assert_eq!(
            constraint_error("SELECT * FROM missing").kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn errors_carry_their_operation() {
        let err = StoreError::invalid_parameter("create_credential_library", "missing path");
        assert_eq!(err.op(), Some("create_credential_library"));
        assert!(err.to_string().starts_with("create_credential_library: "));
    }

    #[test]
    fn kms_errors_split_on_availability() {
        let missing = KmsError::KeyUnavailable {
            scope_id: "p_1".into(),
            reason: "no keys".into(),
        };
        assert_eq!(StoreError::kms("op", missing).kind(), ErrorKind::KeyUnavailable);

        let broken = KmsError::Internal("boom".into());
        assert_eq!(StoreError::kms("op", broken).kind(), ErrorKind::Unknown);
    }
}
