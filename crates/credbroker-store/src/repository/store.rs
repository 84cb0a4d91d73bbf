//! Credential store operations.

use std::sync::Arc;

use credbroker_kms::SecretString;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, params, params_from_iter};
use tracing::{debug, info, instrument};

use super::{Repository, STORE_COLUMNS, StoreRow, non_empty};
use crate::context::Context;
use crate::error::{OpContext, StoreError, StoreResult};
use crate::field_mask::{FieldMask, FieldSpec, blob, text};
use crate::models::{CredentialStore, VaultClientConfig, now, to_micros};
use crate::oplog::{OpKind, Oplog, ResourceRef, ResourceType};
use crate::options::ListOptions;
use crate::public_id::{self, CREDENTIAL_STORE_PREFIX};
use crate::validation;

/// Fields an update may change on a credential store.
pub static STORE_FIELDS: &[FieldSpec] = &[
    FieldSpec { name: "Name", column: "name" },
    FieldSpec { name: "Description", column: "description" },
    FieldSpec { name: "Address", column: "vault_address" },
    FieldSpec { name: "Namespace", column: "namespace" },
    FieldSpec { name: "CaCert", column: "ca_cert" },
    FieldSpec { name: "TlsServerName", column: "tls_server_name" },
    FieldSpec { name: "TlsSkipVerify", column: "tls_skip_verify" },
    FieldSpec { name: "Token", column: "ct_token" },
    FieldSpec { name: "ClientCertificate", column: "client_certificate" },
    FieldSpec { name: "ClientCertificateKey", column: "ct_client_certificate_key" },
];

/// A store whose ciphertext was re-sealed, with the values it replaces.
struct Rewrapped {
    public_id: String,
    old_token: Vec<u8>,
    old_key: Option<Vec<u8>>,
    token: Vec<u8>,
    key: Option<Vec<u8>>,
}

impl Repository {
    /// Create a credential store in `candidate.scope_id`.
    ///
    /// The token and the optional client certificate key are encrypted under
    /// the scope's key before the write transaction opens. The returned
    /// snapshot carries key versions in place of the secrets.
    #[instrument(skip(self, ctx, candidate), fields(scope_id = %candidate.scope_id))]
    pub async fn create_credential_store(
        &self,
        ctx: &Context,
        candidate: &CredentialStore,
    ) -> StoreResult<CredentialStore> {
        const OP: &str = "create_credential_store";
        ctx.check(OP)?;
        validation::require(OP, "scope id", &candidate.scope_id)?;
        validation::reject_public_id(OP, &candidate.public_id)?;
        validation::require(OP, "address", &candidate.address)?;
        let token = candidate
            .token
            .as_ref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StoreError::invalid_parameter(OP, "missing token"))?;
        let client_key = candidate
            .client_certificate_key
            .as_ref()
            .filter(|k| !k.is_empty());
        validation::client_key_needs_certificate(
            OP,
            candidate.client_certificate.as_deref(),
            client_key.is_some(),
        )?;

        let scope_id = candidate.scope_id.clone();
        let ct_token = self.seal(OP, &scope_id, token).await?;
        let ct_key = match client_key {
            Some(key) => Some(self.seal(OP, &scope_id, key).await?),
            None => None,
        };

        let created = now();
        let store = CredentialStore {
            public_id: public_id::new_public_id(CREDENTIAL_STORE_PREFIX),
            scope_id: scope_id.clone(),
            name: non_empty(&candidate.name),
            description: non_empty(&candidate.description),
            address: candidate.address.clone(),
            namespace: non_empty(&candidate.namespace),
            ca_cert: non_empty(&candidate.ca_cert),
            tls_server_name: non_empty(&candidate.tls_server_name),
            tls_skip_verify: candidate.tls_skip_verify,
            client_certificate: non_empty(&candidate.client_certificate),
            token: None,
            client_certificate_key: None,
            token_key_version: Some(self.kms.key_version_of(&ct_token).op_err(OP)?),
            client_certificate_key_version: ct_key
                .as_deref()
                .map(|ct| self.kms.key_version_of(ct))
                .transpose()
                .op_err(OP)?,
            version: 1,
            create_time: Some(created),
            update_time: Some(created),
        };

        let row = store.clone();
        self.db
            .transaction(ctx, OP, move |tx| {
                let ts = to_micros(&created);
                tx.execute(
                    "INSERT INTO credential_stores (public_id, scope_id, name, description, vault_address, \
                     namespace, ca_cert, tls_server_name, tls_skip_verify, ct_token, client_certificate, \
                     ct_client_certificate_key, version, create_time, update_time) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                    params![
                        row.public_id,
                        row.scope_id,
                        row.name,
                        row.description,
                        row.address,
                        row.namespace,
                        row.ca_cert,
                        row.tls_server_name,
                        row.tls_skip_verify,
                        ct_token,
                        row.client_certificate,
                        ct_key,
                        row.version,
                        ts,
                    ],
                )
                .op_err(OP)?;
                Oplog::append(
                    tx,
                    OP,
                    OpKind::Create,
                    store_ref(&row),
                    &row.oplog_payload(),
                )?;
                Ok(())
            })
            .await?;

        info!(store_id = %store.public_id, "credential store created");
        Ok(store)
    }

    /// Apply the fields named in `field_mask` from `candidate` to the store
    /// `candidate.public_id`, provided it is still at `version`.
    ///
    /// Returns the new snapshot and the number of rows updated (always 1 on
    /// success). Any error means nothing was written.
    #[instrument(skip(self, ctx, candidate, field_mask), fields(store_id = %candidate.public_id))]
    pub async fn update_credential_store<S: AsRef<str>>(
        &self,
        ctx: &Context,
        candidate: &CredentialStore,
        version: u32,
        field_mask: &[S],
    ) -> StoreResult<(CredentialStore, usize)> {
        const OP: &str = "update_credential_store";
        ctx.check(OP)?;
        public_id::check(OP, &candidate.public_id)?;
        validation::require_version(OP, version)?;
        let mask = FieldMask::parse(OP, field_mask, STORE_FIELDS)?;

        let id = candidate.public_id.clone();
        let touches_secrets = mask.contains("Token") || mask.contains("ClientCertificateKey");
        let (ct_token, ct_key) = if touches_secrets {
            let scope_id = self
                .store_scope(OP, &id)
                .await?
                .ok_or_else(|| StoreError::not_found(OP, format!("credential store {id}")))?;
            let token = match candidate.token.as_ref().filter(|t| !t.is_empty()) {
                Some(t) if mask.contains("Token") => Some(self.seal(OP, &scope_id, t).await?),
                _ => None,
            };
            let key = match candidate.client_certificate_key.as_ref().filter(|k| !k.is_empty()) {
                Some(k) if mask.contains("ClientCertificateKey") => {
                    Some(self.seal(OP, &scope_id, k).await?)
                }
                _ => None,
            };
            (token, key)
        } else {
            (None, None)
        };

        let plan = mask.plan(&[
            ("Name", text(candidate.name.as_deref())),
            ("Description", text(candidate.description.as_deref())),
            ("Address", text(Some(candidate.address.as_str()))),
            ("Namespace", text(candidate.namespace.as_deref())),
            ("CaCert", text(candidate.ca_cert.as_deref())),
            ("TlsServerName", text(candidate.tls_server_name.as_deref())),
            ("TlsSkipVerify", Value::Integer(i64::from(candidate.tls_skip_verify))),
            ("Token", blob(ct_token.as_deref())),
            ("ClientCertificate", text(candidate.client_certificate.as_deref())),
            ("ClientCertificateKey", blob(ct_key.as_deref())),
        ]);
        debug!(
            fields = ?mask.names(),
            null = ?plan.null,
            "planned store update"
        );

        let (assignments, mut values) = plan.assignments();
        let sql = format!(
            "UPDATE credential_stores SET {assignments}, version = version + 1, update_time = ? \
             WHERE public_id = ? AND version = ?"
        );
        values.push(Value::Integer(to_micros(&now())));
        values.push(Value::Text(id.clone()));
        values.push(Value::Integer(i64::from(version)));

        let kms = Arc::clone(&self.kms);
        let updated = self
            .db
            .transaction(ctx, OP, move |tx| {
                let rows = tx.execute(&sql, params_from_iter(values)).op_err(OP)?;
                if rows == 0 {
                    return Err(StoreError::not_found(
                        OP,
                        format!("credential store {id} at version {version}"),
                    ));
                }
                let row = tx
                    .query_row(
                        &format!("SELECT {STORE_COLUMNS} FROM credential_stores WHERE public_id = ?1"),
                        params![id],
                        StoreRow::from_row,
                    )
                    .op_err(OP)?;
                let store = row.to_store(kms.as_ref(), OP)?;
                Oplog::append(
                    tx,
                    OP,
                    OpKind::Update,
                    store_ref(&store),
                    &store.oplog_payload(),
                )?;
                Ok(store)
            })
            .await?;

        info!(version = updated.version, "credential store updated");
        Ok((updated, 1))
    }

    /// Fetch a store by id. Absence is `Ok(None)`.
    #[instrument(skip(self, ctx))]
    pub async fn lookup_credential_store(
        &self,
        ctx: &Context,
        public_id: &str,
    ) -> StoreResult<Option<CredentialStore>> {
        const OP: &str = "lookup_credential_store";
        ctx.check(OP)?;
        validation::require(OP, "public id", public_id)?;
        self.read_store(OP, public_id)
            .await?
            .map(|row| row.to_store(self.kms.as_ref(), OP))
            .transpose()
    }

    /// Delete a store in `scope_id` together with its libraries.
    ///
    /// Returns the number of stores deleted: 1, or 0 when no such store
    /// exists in the scope. Every deleted library gets its own `delete`
    /// oplog entry alongside the store's.
    #[instrument(skip(self, ctx))]
    pub async fn delete_credential_store(
        &self,
        ctx: &Context,
        scope_id: &str,
        public_id: &str,
    ) -> StoreResult<usize> {
        const OP: &str = "delete_credential_store";
        ctx.check(OP)?;
        validation::require(OP, "scope id", scope_id)?;
        validation::require(OP, "public id", public_id)?;

        let scope_id = scope_id.to_string();
        let id = public_id.to_string();
        let (deleted, libraries) = self
            .db
            .transaction(ctx, OP, move |tx| {
                let libraries = {
                    let mut stmt = tx
                        .prepare(
                            "SELECT l.public_id FROM credential_libraries l \
                             JOIN credential_stores s ON s.public_id = l.store_id \
                             WHERE s.public_id = ?1 AND s.scope_id = ?2 ORDER BY l.public_id",
                        )
                        .op_err(OP)?;
                    stmt.query_map(params![id, scope_id], |row| row.get::<_, String>(0))
                        .op_err(OP)?
                        .collect::<Result<Vec<_>, _>>()
                        .op_err(OP)?
                };

                let deleted = tx
                    .execute(
                        "DELETE FROM credential_stores WHERE public_id = ?1 AND scope_id = ?2",
                        params![id, scope_id],
                    )
                    .op_err(OP)?;
                if deleted == 0 {
                    return Ok((0, 0));
                }

                for library_id in &libraries {
                    Oplog::append(
                        tx,
                        OP,
                        OpKind::Delete,
                        ResourceRef {
                            id: library_id,
                            resource_type: ResourceType::CredentialLibrary,
                            scope_id: &scope_id,
                        },
                        &serde_json::json!({ "public_id": library_id, "store_id": id }),
                    )?;
                }
                Oplog::append(
                    tx,
                    OP,
                    OpKind::Delete,
                    ResourceRef {
                        id: &id,
                        resource_type: ResourceType::CredentialStore,
                        scope_id: &scope_id,
                    },
                    &serde_json::json!({ "public_id": id, "scope_id": scope_id }),
                )?;
                Ok((deleted, libraries.len()))
            })
            .await?;

        if deleted > 0 {
            info!(libraries, "credential store deleted");
        }
        Ok(deleted)
    }

    /// List stores in any of `scope_ids`, oldest first.
    #[instrument(skip(self, ctx, scope_ids))]
    pub async fn list_credential_stores<S: AsRef<str>>(
        &self,
        ctx: &Context,
        scope_ids: &[S],
        opts: ListOptions,
    ) -> StoreResult<Vec<CredentialStore>> {
        const OP: &str = "list_credential_stores";
        ctx.check(OP)?;
        let scopes: Vec<String> = scope_ids
            .iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if scopes.is_empty() {
            return Err(StoreError::invalid_parameter(OP, "missing scope ids"));
        }

        let limit = self.limit(&opts);
        let placeholders = vec!["?"; scopes.len()].join(", ");
        let sql = format!(
            "SELECT {STORE_COLUMNS} FROM credential_stores WHERE scope_id IN ({placeholders}) \
             ORDER BY create_time, public_id LIMIT ?"
        );
        let mut values: Vec<Value> = scopes.into_iter().map(Value::Text).collect();
        values.push(Value::Integer(limit));

        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql).op_err(OP)?;
                let rows = stmt
                    .query_map(params_from_iter(values), StoreRow::from_row)
                    .op_err(OP)?
                    .collect::<Result<Vec<_>, _>>()
                    .op_err(OP)?;
                Ok(rows)
            })
            .await?;

        rows.iter()
            .map(|row| row.to_store(self.kms.as_ref(), OP))
            .collect()
    }

    /// Connection settings for a store with its secrets decrypted.
    ///
    /// The only operation that yields plaintext; nothing it decrypts is
    /// written anywhere.
    #[instrument(skip(self, ctx))]
    pub async fn client_config(
        &self,
        ctx: &Context,
        store_id: &str,
    ) -> StoreResult<Option<VaultClientConfig>> {
        const OP: &str = "client_config";
        ctx.check(OP)?;
        validation::require(OP, "store id", store_id)?;
        let Some(row) = self.read_store(OP, store_id).await? else {
            return Ok(None);
        };

        let token = self.open(OP, &row.scope_id, &row.ct_token).await?;
        let client_certificate_key = match &row.ct_client_certificate_key {
            Some(ct) => Some(self.open(OP, &row.scope_id, ct).await?),
            None => None,
        };
        ctx.check(OP)?;

        Ok(Some(VaultClientConfig {
            store_id: row.public_id,
            address: row.vault_address,
            namespace: row.namespace,
            ca_cert: row.ca_cert,
            tls_server_name: row.tls_server_name,
            tls_skip_verify: row.tls_skip_verify,
            token,
            client_certificate: row.client_certificate,
            client_certificate_key,
        }))
    }

    /// Re-seal every secret in `scope_id` that is not under the scope's
    /// current key version.
    ///
    /// Each store is swapped only if its ciphertext is still what was read,
    /// so a concurrent update wins. This is key maintenance, not a user
    /// mutation: versions and the oplog are left alone. Returns the number
    /// of stores rewritten.
    #[instrument(skip(self, ctx))]
    pub async fn rewrap_credential_stores(
        &self,
        ctx: &Context,
        scope_id: &str,
    ) -> StoreResult<usize> {
        const OP: &str = "rewrap_credential_stores";
        ctx.check(OP)?;
        validation::require(OP, "scope id", scope_id)?;
        let Some(current) = self.kms.current_version(scope_id).await.op_err(OP)? else {
            return Ok(0);
        };

        let scope = scope_id.to_string();
        let rows = self
            .db
            .execute(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT public_id, ct_token, ct_client_certificate_key \
                         FROM credential_stores WHERE scope_id = ?1",
                    )
                    .op_err(OP)?;
                let rows = stmt
                    .query_map(params![scope], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                        ))
                    })
                    .op_err(OP)?
                    .collect::<Result<Vec<_>, _>>()
                    .op_err(OP)?;
                Ok(rows)
            })
            .await?;

        let mut pending = Vec::new();
        for (public_id, old_token, old_key) in rows {
            ctx.check(OP)?;
            let token = self.rewrap_stale(OP, scope_id, current, &old_token).await?;
            let key = match &old_key {
                Some(ct) => self.rewrap_stale(OP, scope_id, current, ct).await?,
                None => None,
            };
            if token.is_none() && key.is_none() {
                continue;
            }
            pending.push(Rewrapped {
                public_id,
                token: token.unwrap_or_else(|| old_token.clone()),
                key: key.or_else(|| old_key.clone()),
                old_token,
                old_key,
            });
        }
        if pending.is_empty() {
            debug!(current, "all credential store secrets current");
            return Ok(0);
        }

        let rewritten = self
            .db
            .transaction(ctx, OP, move |tx| {
                let mut rewritten = 0;
                for store in &pending {
                    rewritten += tx
                        .execute(
                            "UPDATE credential_stores SET ct_token = ?1, ct_client_certificate_key = ?2 \
                             WHERE public_id = ?3 AND ct_token = ?4 AND ct_client_certificate_key IS ?5",
                            params![
                                store.token,
                                store.key,
                                store.public_id,
                                store.old_token,
                                store.old_key,
                            ],
                        )
                        .op_err(OP)?;
                }
                Ok(rewritten)
            })
            .await?;

        info!(current, rewritten, "rewrapped credential store secrets");
        Ok(rewritten)
    }

    /// Run [`rewrap_credential_stores`](Self::rewrap_credential_stores) for
    /// every scope that owns a store.
    #[instrument(skip(self, ctx))]
    pub async fn rewrap_all_scopes(&self, ctx: &Context) -> StoreResult<usize> {
        const OP: &str = "rewrap_all_scopes";
        ctx.check(OP)?;
        let scopes = self
            .db
            .execute(|conn| {
                let mut stmt = conn
                    .prepare("SELECT DISTINCT scope_id FROM credential_stores ORDER BY scope_id")
                    .op_err(OP)?;
                let scopes = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .op_err(OP)?
                    .collect::<Result<Vec<_>, _>>()
                    .op_err(OP)?;
                Ok(scopes)
            })
            .await?;

        let mut total = 0;
        for scope_id in &scopes {
            total += self.rewrap_credential_stores(ctx, scope_id).await?;
        }
        Ok(total)
    }

    // ── helpers ──────────────────────────────────────────────────────

    async fn read_store(&self, op: &'static str, public_id: &str) -> StoreResult<Option<StoreRow>> {
        let id = public_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {STORE_COLUMNS} FROM credential_stores WHERE public_id = ?1"),
                    params![id],
                    StoreRow::from_row,
                )
                .optional()
                .op_err(op)
            })
            .await
    }

    async fn store_scope(&self, op: &'static str, public_id: &str) -> StoreResult<Option<String>> {
        let id = public_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT scope_id FROM credential_stores WHERE public_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .op_err(op)
            })
            .await
    }

    async fn seal(
        &self,
        op: &'static str,
        scope_id: &str,
        secret: &SecretString,
    ) -> StoreResult<Vec<u8>> {
        self.kms
            .encrypt(scope_id, secret.expose_secret().as_bytes())
            .await
            .op_err(op)
    }

    async fn open(&self, op: &'static str, scope_id: &str, ct: &[u8]) -> StoreResult<SecretString> {
        let plaintext = self.kms.decrypt(scope_id, ct).await.op_err(op)?;
        SecretString::from_utf8(&plaintext).ok_or_else(|| StoreError::Internal {
            op,
            msg: "decrypted secret is not valid UTF-8".into(),
        })
    }

    /// Rewrapped ciphertext, or `None` when `ct` is already current.
    async fn rewrap_stale(
        &self,
        op: &'static str,
        scope_id: &str,
        current: u32,
        ct: &[u8],
    ) -> StoreResult<Option<Vec<u8>>> {
        if self.kms.key_version_of(ct).op_err(op)? == current {
            return Ok(None);
        }
        self.kms.rewrap(scope_id, ct).await.op_err(op).map(Some)
    }
}

fn store_ref(store: &CredentialStore) -> ResourceRef<'_> {
    ResourceRef {
        id: &store.public_id,
        resource_type: ResourceType::CredentialStore,
        scope_id: &store.scope_id,
    }
}
