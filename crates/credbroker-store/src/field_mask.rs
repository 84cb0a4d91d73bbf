//! Field mask processing for partial updates.
//!
//! A mask names the fields an update may change. Each resource type has a
//! fixed allow-list of mutable fields; identity, timestamps and the parent
//! reference are never on it. Given the candidate's column values, the mask
//! partitions the allow-list into:
//!
//! - **set**: masked fields holding a value, written as-is;
//! - **null**: masked fields holding their zero value, written as `NULL`
//!   (a `NOT NULL` column then rejects the write);
//! - **untouched**: fields not in the mask, whatever the candidate holds.
//!
//! Names match case-insensitively, so `vaultpath` and `VaultPath` agree.

use rusqlite::types::Value;

use crate::error::{StoreError, StoreResult};

/// A mutable field and the column that backs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub column: &'static str,
}

/// A validated, non-empty set of fields drawn from an allow-list.
#[derive(Debug, Clone)]
pub struct FieldMask {
    allowed: &'static [FieldSpec],
    fields: Vec<&'static FieldSpec>,
}

/// The column assignments an update will perform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePlan {
    pub set: Vec<(&'static str, Value)>,
    pub null: Vec<&'static str>,
    pub untouched: Vec<&'static str>,
}

impl FieldMask {
    /// Validate `paths` against `allowed`.
    ///
    /// Empty (or all-blank) masks fail with [`StoreError::EmptyFieldMask`];
    /// any unknown or read-only name fails with
    /// [`StoreError::InvalidFieldMask`].
    pub fn parse<S: AsRef<str>>(
        op: &'static str,
        paths: &[S],
        allowed: &'static [FieldSpec],
    ) -> StoreResult<Self> {
        let mut fields: Vec<&'static FieldSpec> = Vec::new();
        for path in paths.iter().map(|p| p.as_ref().trim()).filter(|p| !p.is_empty()) {
            let spec = allowed
                .iter()
                .find(|spec| spec.name.eq_ignore_ascii_case(path))
                .ok_or_else(|| StoreError::InvalidFieldMask {
                    op,
                    msg: format!("field {path:?} cannot be updated"),
                })?;
            if !fields.iter().any(|f| f.name == spec.name) {
                fields.push(spec);
            }
        }

        if fields.is_empty() {
            return Err(StoreError::EmptyFieldMask { op });
        }
        Ok(Self { allowed, fields })
    }

    /// Whether the mask includes `name` (case-insensitive).
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Canonical names of the masked fields, in mask order.
    pub fn names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// Partition the allow-list using the candidate's column `values`.
    ///
    /// `values` is keyed by field name; a masked field missing from it is
    /// treated as its zero value.
    pub fn plan(&self, values: &[(&'static str, Value)]) -> UpdatePlan {
        let mut plan = UpdatePlan::default();
        for spec in self.allowed {
            if !self.fields.iter().any(|f| f.name == spec.name) {
                plan.untouched.push(spec.column);
                continue;
            }
            let value = values
                .iter()
                .find(|(name, _)| *name == spec.name)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            if is_zero(&value) {
                plan.null.push(spec.column);
            } else {
                plan.set.push((spec.column, value));
            }
        }
        plan
    }
}

impl UpdatePlan {
    /// Render the `SET` assignments with anonymous placeholders, returning
    /// the SQL fragment and the values bound to it, in order.
    pub fn assignments(&self) -> (String, Vec<Value>) {
        let mut parts: Vec<String> = Vec::with_capacity(self.set.len() + self.null.len());
        let mut params = Vec::with_capacity(self.set.len());
        for (column, value) in &self.set {
            parts.push(format!("{column} = ?"));
            params.push(value.clone());
        }
        for column in &self.null {
            parts.push(format!("{column} = NULL"));
        }
        (parts.join(", "), params)
    }
}

/// Zero values clear the column: `NULL`, the empty string and the empty
/// blob. Integers (booleans, enums) are never zero here.
fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Text(s) => s.is_empty(),
        Value::Blob(b) => b.is_empty(),
        Value::Integer(_) | Value::Real(_) => false,
    }
}

/// Column value helpers used when flattening candidates.
pub(crate) fn text(value: Option<&str>) -> Value {
    match value {
        Some(s) if !s.is_empty() => Value::Text(s.to_string()),
        _ => Value::Null,
    }
}

pub(crate) fn blob(value: Option<&[u8]>) -> Value {
    match value {
        Some(b) if !b.is_empty() => Value::Blob(b.to_vec()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    static FIELDS: &[FieldSpec] = &[
        FieldSpec { name: "Name", column: "name" },
        FieldSpec { name: "Description", column: "description" },
        FieldSpec { name: "VaultPath", column: "vault_path" },
        FieldSpec { name: "Enabled", column: "enabled" },
    ];

    #[test]
    fn empty_mask_rejected() {
        let empty: [&str; 0] = [];
        let err = FieldMask::parse("op", &empty, FIELDS).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyFieldMask);

        let err = FieldMask::parse("op", &["", "  "], FIELDS).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyFieldMask);
    }

    #[test]
    fn unknown_and_read_only_fields_rejected() {
        for bad in ["PublicId", "CreateTime", "UpdateTime", "StoreId", "Version", "bogus"] {
            let err = FieldMask::parse("op", &["Name", bad], FIELDS).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidFieldMask, "{bad}");
        }
    }

    #[test]
    fn names_match_case_insensitively() {
        let mask = FieldMask::parse("op", &["name", "VAULTPATH", "Name"], FIELDS).unwrap();
        assert_eq!(mask.names(), vec!["Name", "VaultPath"]);
        assert!(mask.contains("vaultpath"));
        assert!(!mask.contains("Description"));
    }

    #[test]
    fn plan_partitions_fields() {
        let mask = FieldMask::parse("op", &["Name", "Description", "Enabled"], FIELDS).unwrap();
        let plan = mask.plan(&[
            ("Name", text(Some("prod"))),
            ("Description", text(Some(""))),
            ("VaultPath", text(Some("ignored/because/unmasked"))),
            ("Enabled", Value::Integer(0)),
        ]);

        assert_eq!(
            plan.set,
            vec![
                ("name", Value::Text("prod".into())),
                ("enabled", Value::Integer(0)),
            ]
        );
        assert_eq!(plan.null, vec!["description"]);
        assert_eq!(plan.untouched, vec!["vault_path"]);

        let (sql, params) = plan.assignments();
        assert_eq!(sql, "name = ?, enabled = ?, description = NULL");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn missing_value_is_zero() {
        let mask = FieldMask::parse("op", &["VaultPath"], FIELDS).unwrap();
        let plan = mask.plan(&[]);
        assert!(plan.set.is_empty());
        assert_eq!(plan.null, vec!["vault_path"]);
    }
}
