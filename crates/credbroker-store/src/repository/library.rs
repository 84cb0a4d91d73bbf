//! Credential library operations.

use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};
use tracing::{debug, info, instrument};

use super::{LIBRARY_COLUMNS, LibraryRow, Repository, non_empty};
use crate::context::Context;
use crate::error::{OpContext, StoreError, StoreResult};
use crate::field_mask::{FieldMask, FieldSpec, blob, text};
use crate::models::{CredentialLibrary, LibraryFields, now, to_micros};
use crate::oplog::{OpKind, Oplog, ResourceRef, ResourceType};
use crate::options::ListOptions;
use crate::public_id::{self, CREDENTIAL_LIBRARY_PREFIX};
use crate::validation;

/// Fields an update may change on a credential library. The parent store is
/// deliberately absent.
pub static LIBRARY_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "Name", column: "name" },
    FieldSpec { name: "Description", column: "description" },
    FieldSpec { name: "VaultPath", column: "vault_path" },
    FieldSpec { name: "HttpMethod", column: "http_method" },
    FieldSpec { name: "HttpRequestBody", column: "http_request_body" },
];

impl Repository {
    /// Create a library under `candidate.store_id`, which must belong to
    /// `scope_id`.
    ///
    /// The candidate is left untouched; the returned snapshot carries the
    /// minted id, version 1 and equal create and update times.
    #[instrument(skip(self, ctx, candidate), fields(store_id = %candidate.store_id))]
    pub async fn create_credential_library(
        &self,
        ctx: &Context,
        scope_id: &str,
        candidate: &CredentialLibrary,
    ) -> StoreResult<CredentialLibrary> {
        const OP: &str = "create_credential_library";
        ctx.check(OP)?;
        validation::require(OP, "scope id", scope_id)?;
        validation::require(OP, "store id", &candidate.store_id)?;
        validation::reject_public_id(OP, &candidate.public_id)?;
        validation::require(OP, "vault path", &candidate.fields.vault_path)?;

        let created = now();
        let library = CredentialLibrary {
            public_id: public_id::new_public_id(CREDENTIAL_LIBRARY_PREFIX),
            store_id: candidate.store_id.clone(),
            version: 1,
            create_time: Some(created),
            update_time: Some(created),
            fields: LibraryFields {
                name: non_empty(&candidate.fields.name),
                description: non_empty(&candidate.fields.description),
                vault_path: candidate.fields.vault_path.clone(),
                http_method: candidate.fields.http_method,
                http_request_body: candidate
                    .fields
                    .http_request_body
                    .clone()
                    .filter(|b| !b.is_empty()),
            },
        };

        let row = library.clone();
        let scope = scope_id.to_string();
        self.db
            .transaction(ctx, OP, move |tx| {
                let owner: Option<String> = tx
                    .query_row(
                        "SELECT scope_id FROM credential_stores WHERE public_id = ?1",
                        params![row.store_id],
                        |r| r.get(0),
                    )
                    .optional()
                    .op_err(OP)?;
                match owner {
                    None => {
                        return Err(StoreError::invalid_parameter(
                            OP,
                            format!("credential store {} not found", row.store_id),
                        ));
                    }
                    Some(owner) if owner != scope => {
                        return Err(StoreError::invalid_parameter(
                            OP,
                            format!("credential store {} is not in scope {scope}", row.store_id),
                        ));
                    }
                    Some(_) => {}
                }

                let ts = to_micros(&created);
                tx.execute(
                    "INSERT INTO credential_libraries (public_id, store_id, name, description, vault_path, \
                     http_method, http_request_body, version, create_time, update_time) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        row.public_id,
                        row.store_id,
                        row.fields.name,
                        row.fields.description,
                        row.fields.vault_path,
                        row.fields.http_method.as_str(),
                        row.fields.http_request_body,
                        row.version,
                        ts,
                    ],
                )
                .op_err(OP)?;
                Oplog::append(
                    tx,
                    OP,
                    OpKind::Create,
                    library_ref(&row.public_id, &scope),
                    &row.oplog_payload(),
                )?;
                Ok(())
            })
            .await?;

        info!(library_id = %library.public_id, "credential library created");
        Ok(library)
    }

    /// Apply the fields named in `field_mask` from `candidate` to the
    /// library `candidate.public_id`, provided it is still at `version` and
    /// its store belongs to `scope_id`.
    ///
    /// `candidate.store_id` is ignored. Returns the new snapshot and the
    /// number of rows updated (always 1 on success); any error means nothing
    /// was written.
    #[instrument(skip(self, ctx, candidate, field_mask), fields(library_id = %candidate.public_id))]
    pub async fn update_credential_library<S: AsRef<str>>(
        &self,
        ctx: &Context,
        scope_id: &str,
        candidate: &CredentialLibrary,
        version: u32,
        field_mask: &[S],
    ) -> StoreResult<(CredentialLibrary, usize)> {
        const OP: &str = "update_credential_library";
        ctx.check(OP)?;
        public_id::check(OP, &candidate.public_id)?;
        validation::require(OP, "scope id", scope_id)?;
        validation::require_version(OP, version)?;
        let mask = FieldMask::parse(OP, field_mask, LIBRARY_FIELDS)?;

        let fields = &candidate.fields;
        let plan = mask.plan(&[
            ("Name", text(fields.name.as_deref())),
            ("Description", text(fields.description.as_deref())),
            ("VaultPath", text(Some(fields.vault_path.as_str()))),
            ("HttpMethod", Value::Text(fields.http_method.as_str().to_string())),
            ("HttpRequestBody", blob(fields.http_request_body.as_deref())),
        ]);
        debug!(
            fields = ?mask.names(),
            null = ?plan.null,
            "planned library update"
        );

        let (assignments, mut values) = plan.assignments();
        let sql = format!(
            "UPDATE credential_libraries SET {assignments}, version = version + 1, update_time = ? \
             WHERE public_id = ? AND version = ? \
             AND store_id IN (SELECT public_id FROM credential_stores WHERE scope_id = ?)"
        );
        let id = candidate.public_id.clone();
        let scope = scope_id.to_string();
        values.push(Value::Integer(to_micros(&now())));
        values.push(Value::Text(id.clone()));
        values.push(Value::Integer(i64::from(version)));
        values.push(Value::Text(scope.clone()));

        let updated = self
            .db
            .transaction(ctx, OP, move |tx| {
                let rows = tx.execute(&sql, params_from_iter(values)).op_err(OP)?;
                if rows == 0 {
                    return Err(StoreError::not_found(
                        OP,
                        format!("credential library {id} at version {version}"),
                    ));
                }
                let library = tx
                    .query_row(
                        &format!(
                            "SELECT {LIBRARY_COLUMNS} FROM credential_libraries WHERE public_id = ?1"
                        ),
                        params![id],
                        LibraryRow::from_row,
                    )
                    .op_err(OP)?
                    .into_library(OP)?;
                Oplog::append(
                    tx,
                    OP,
                    OpKind::Update,
                    library_ref(&library.public_id, &scope),
                    &library.oplog_payload(),
                )?;
                Ok(library)
            })
            .await?;

        info!(version = updated.version, "credential library updated");
        Ok((updated, 1))
    }

    /// Fetch a library by id. Absence is `Ok(None)`.
    #[instrument(skip(self, ctx))]
    pub async fn lookup_credential_library(
        &self,
        ctx: &Context,
        public_id: &str,
    ) -> StoreResult<Option<CredentialLibrary>> {
        const OP: &str = "lookup_credential_library";
        ctx.check(OP)?;
        validation::require(OP, "public id", public_id)?;

        let id = public_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {LIBRARY_COLUMNS} FROM credential_libraries WHERE public_id = ?1"),
                    params![id],
                    LibraryRow::from_row,
                )
                .optional()
                .op_err(OP)?
                .map(|row| row.into_library(OP))
                .transpose()
            })
            .await
    }

    /// Delete a library whose store belongs to `scope_id`.
    ///
    /// Returns 1 with a `delete` oplog entry, or 0 when there was nothing to
    /// delete.
    #[instrument(skip(self, ctx))]
    pub async fn delete_credential_library(
        &self,
        ctx: &Context,
        scope_id: &str,
        public_id: &str,
    ) -> StoreResult<usize> {
        const OP: &str = "delete_credential_library";
        ctx.check(OP)?;
        validation::require(OP, "public id", public_id)?;
        validation::require(OP, "scope id", scope_id)?;

        let id = public_id.to_string();
        let scope = scope_id.to_string();
        let deleted = self
            .db
            .transaction(ctx, OP, move |tx| {
                let store_id: Option<String> = tx
                    .query_row(
                        "SELECT l.store_id FROM credential_libraries l \
                         JOIN credential_stores s ON s.public_id = l.store_id \
                         WHERE l.public_id = ?1 AND s.scope_id = ?2",
                        params![id, scope],
                        |r| r.get(0),
                    )
                    .optional()
                    .op_err(OP)?;
                let Some(store_id) = store_id else {
                    return Ok(0);
                };

                let deleted = tx
                    .execute(
                        "DELETE FROM credential_libraries WHERE public_id = ?1",
                        params![id],
                    )
                    .op_err(OP)?;
                if deleted > 0 {
                    Oplog::append(
                        tx,
                        OP,
                        OpKind::Delete,
                        library_ref(&id, &scope),
                        &serde_json::json!({ "public_id": id, "store_id": store_id }),
                    )?;
                }
                Ok(deleted)
            })
            .await?;

        if deleted > 0 {
            info!("credential library deleted");
        }
        Ok(deleted)
    }

    /// List the libraries of `store_id`, oldest first. No matches is an
    /// empty list.
    #[instrument(skip(self, ctx))]
    pub async fn list_credential_libraries(
        &self,
        ctx: &Context,
        store_id: &str,
        opts: ListOptions,
    ) -> StoreResult<Vec<CredentialLibrary>> {
        const OP: &str = "list_credential_libraries";
        ctx.check(OP)?;
        validation::require(OP, "store id", store_id)?;

        let limit = self.limit(&opts);
        let store_id = store_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {LIBRARY_COLUMNS} FROM credential_libraries WHERE store_id = ?1 \
                         ORDER BY create_time, public_id LIMIT ?2"
                    ))
                    .op_err(OP)?;
                let rows = stmt
                    .query_map(params![store_id, limit], LibraryRow::from_row)
                    .op_err(OP)?
                    .collect::<Result<Vec<_>, _>>()
                    .op_err(OP)?;
                rows.into_iter().map(|row| row.into_library(OP)).collect()
            })
            .await
    }
}

fn library_ref<'a>(id: &'a str, scope_id: &'a str) -> ResourceRef<'a> {
    ResourceRef {
        id,
        resource_type: ResourceType::CredentialLibrary,
        scope_id,
    }
}
