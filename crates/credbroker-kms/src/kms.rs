//! The envelope encryption service.
//!
//! Data is sealed with a per-scope data key (DEK). Each DEK is itself sealed
//! with the root key and kept in the [`Keyring`]. Unwrapped DEKs are cached
//! in memory for a short time so hot scopes do not pay an unwrap per call.
//!
//! # Ciphertext format
//!
//! ```text
//! [format: u8 = 1][key version: u32 BE][nonce: 12 bytes][ciphertext + tag]
//! ```
//!
//! The scope id and key version are bound as additional authenticated data,
//! so a ciphertext copied into another scope fails to decrypt.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use zeroize::Zeroizing;

use crate::crypto::{self, KEY_LEN, NONCE_LEN_BYTES, TAG_LEN};
use crate::error::{KmsError, Result};
use crate::keyring::{KeyState, KeyVersionInfo, Keyring, missing_version};
use crate::root::RootKeyProvider;

const FORMAT_V1: u8 = 1;
const HEADER_LEN: usize = 1 + 4 + NONCE_LEN_BYTES;

const DEFAULT_CACHE_CAPACITY: u64 = 1_024;
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

type DataKey = Arc<Zeroizing<Vec<u8>>>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Key management contract consumed by the repository.
///
/// Every method that needs a scope's key fails with
/// [`KmsError::KeyUnavailable`] when the scope has no keys, the referenced
/// version was destroyed, or the root key cannot unwrap it.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Provision the first key version for a scope. Idempotent: returns the
    /// current version if the scope already has keys.
    async fn create_scope_keys(&self, scope_id: &str) -> Result<u32>;

    /// Seal `plaintext` under the scope's current key version.
    async fn encrypt(&self, scope_id: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Open a ciphertext produced by [`encrypt`](Self::encrypt) for this scope.
    async fn decrypt(&self, scope_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;

    /// Re-seal a ciphertext under the scope's current key version without
    /// exposing the plaintext to the caller.
    async fn rewrap(&self, scope_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Create a new key version for the scope and make it current.
    async fn rotate(&self, scope_id: &str) -> Result<u32>;

    /// The scope's current key version, or `None` if it has no keys.
    async fn current_version(&self, scope_id: &str) -> Result<Option<u32>>;

    /// The key version a ciphertext was sealed under.
    fn key_version_of(&self, ciphertext: &[u8]) -> Result<u32>;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

struct Envelope<'a> {
    version: u32,
    nonce: [u8; NONCE_LEN_BYTES],
    sealed: &'a [u8],
}

impl<'a> Envelope<'a> {
    fn decode(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + TAG_LEN {
            return Err(KmsError::MalformedCiphertext {
                reason: format!("{} bytes is shorter than the envelope header", bytes.len()),
            });
        }
        if bytes[0] != FORMAT_V1 {
            return Err(KmsError::MalformedCiphertext {
                reason: format!("unknown envelope format {}", bytes[0]),
            });
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[1..5]);
        let mut nonce = [0u8; NONCE_LEN_BYTES];
        nonce.copy_from_slice(&bytes[5..HEADER_LEN]);

        Ok(Self {
            version: u32::from_be_bytes(version),
            nonce,
            sealed: &bytes[HEADER_LEN..],
        })
    }

    fn encode(version: u32, nonce: &[u8; NONCE_LEN_BYTES], sealed: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.push(FORMAT_V1);
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(nonce);
        out.extend_from_slice(sealed);
        out
    }
}

fn data_aad(scope_id: &str, version: u32) -> Vec<u8> {
    format!("data:{scope_id}:{version}").into_bytes()
}

fn dek_aad(scope_id: &str, version: u32) -> Vec<u8> {
    format!("dek:{scope_id}:{version}").into_bytes()
}

// ---------------------------------------------------------------------------
// Kms
// ---------------------------------------------------------------------------

struct KmsInner {
    keyring: Mutex<Keyring>,
    root: Arc<dyn RootKeyProvider>,
    cache: Cache<(String, u32), DataKey>,
}

/// SQLite-backed [`KeyManager`].
///
/// Cheap to clone; clones share the keyring and the data key cache.
#[derive(Clone)]
pub struct Kms {
    inner: Arc<KmsInner>,
}

impl Kms {
    /// Build a service over an opened keyring.
    pub fn new(keyring: Keyring, root: Arc<dyn RootKeyProvider>) -> Self {
        let cache = Cache::builder()
            .max_capacity(DEFAULT_CACHE_CAPACITY)
            .time_to_live(DEFAULT_CACHE_TTL)
            .build();
        Self {
            inner: Arc::new(KmsInner {
                keyring: Mutex::new(keyring),
                root,
                cache,
            }),
        }
    }

    /// Open (or create) the keyring database at `path`.
    pub fn open(path: impl AsRef<Path>, root: Arc<dyn RootKeyProvider>) -> Result<Self> {
        Ok(Self::new(Keyring::open(path)?, root))
    }

    /// In-memory keyring, for tests.
    pub fn open_in_memory(root: Arc<dyn RootKeyProvider>) -> Result<Self> {
        Ok(Self::new(Keyring::open_in_memory()?, root))
    }

    /// Permanently destroy a non-current key version of a scope.
    ///
    /// Data sealed under that version can no longer be decrypted; rewrap it
    /// first.
    pub async fn destroy_key_version(&self, scope_id: &str, version: u32) -> Result<()> {
        let scope = scope_id.to_string();
        self.with_keyring(move |ring| {
            if ring.current_version(&scope)? == Some(version) {
                return Err(KmsError::KeyVersionInUse {
                    scope_id: scope,
                    version,
                });
            }
            if !ring.mark_destroyed(&scope, version)? {
                return Err(missing_version(&scope, version));
            }
            Ok(())
        })
        .await?;

        self.inner
            .cache
            .invalidate(&(scope_id.to_string(), version))
            .await;
        tracing::info!(scope_id, version, "destroyed data key version");
        Ok(())
    }

    /// Every key version of a scope, oldest first.
    pub async fn key_versions(&self, scope_id: &str) -> Result<Vec<KeyVersionInfo>> {
        let scope = scope_id.to_string();
        self.with_keyring(move |ring| ring.versions(&scope)).await
    }

    // -- Internals ----------------------------------------------------------

    async fn with_keyring<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Keyring) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut ring = inner
                .keyring
                .lock()
                .map_err(|e| KmsError::Internal(format!("keyring mutex poisoned: {e}")))?;
            f(&mut ring)
        })
        .await?
    }

    /// Generate a DEK, seal it under the root key and store it as the next
    /// version.
    async fn add_version(&self, scope_id: &str) -> Result<u32> {
        let inner = Arc::clone(&self.inner);
        let scope = scope_id.to_string();
        self.with_keyring(move |ring| {
            let root = resolve_root(inner.root.as_ref())?;
            let next = ring.versions(&scope)?.last().map_or(1, |v| v.version + 1);
            let dek = crypto::random_bytes(KEY_LEN)?;
            let (nonce, wrapped) = crypto::seal(&dek, &root, &dek_aad(&scope, next))?;
            ring.insert_version(&scope, &wrapped, &nonce)
        })
        .await
    }

    async fn data_key(&self, scope_id: &str, version: u32) -> Result<DataKey> {
        let cache_key = (scope_id.to_string(), version);
        if let Some(key) = self.inner.cache.get(&cache_key).await {
            tracing::trace!(scope_id, version, "data key cache hit");
            return Ok(key);
        }

        let inner = Arc::clone(&self.inner);
        let scope = scope_id.to_string();
        let key = self
            .with_keyring(move |ring| {
                let row = ring
                    .get(&scope, version)?
                    .ok_or_else(|| missing_version(&scope, version))?;
                if row.state == KeyState::Destroyed {
                    return Err(KmsError::unavailable(
                        &scope,
                        format!("key version {version} has been destroyed"),
                    ));
                }
                let nonce: [u8; NONCE_LEN_BYTES] = row
                    .nonce
                    .as_slice()
                    .try_into()
                    .map_err(|_| KmsError::unavailable(&scope, "wrapped key nonce is corrupt"))?;
                let root = resolve_root(inner.root.as_ref())?;
                crypto::open(&nonce, &row.wrapped_key, &root, &dek_aad(&scope, version))
                    .map_err(|_| KmsError::unavailable(&scope, "failed to unwrap data key"))
            })
            .await?;

        let key = Arc::new(key);
        self.inner
            .cache
            .insert(cache_key.clone(), Arc::clone(&key))
            .await;

        // A destroy racing the unwrap may have invalidated before the insert.
        let scope = scope_id.to_string();
        let active = self
            .with_keyring(move |ring| {
                Ok(ring
                    .get(&scope, version)?
                    .is_some_and(|row| row.state == KeyState::Active))
            })
            .await;
        if !matches!(active, Ok(true)) {
            self.inner.cache.invalidate(&cache_key).await;
            active?;
            return Err(KmsError::unavailable(
                scope_id,
                format!("key version {version} has been destroyed"),
            ));
        }

        tracing::trace!(scope_id, version, "data key cache miss");
        Ok(key)
    }

    async fn require_current(&self, scope_id: &str) -> Result<u32> {
        self.current_version(scope_id)
            .await?
            .ok_or_else(|| KmsError::unavailable(scope_id, "scope has no data keys"))
    }

    async fn seal_current(&self, scope_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let version = self.require_current(scope_id).await?;
        let key = self.data_key(scope_id, version).await?;
        let (nonce, sealed) = crypto::seal(plaintext, &key, &data_aad(scope_id, version))?;
        Ok(Envelope::encode(version, &nonce, &sealed))
    }
}

fn resolve_root(provider: &dyn RootKeyProvider) -> Result<Zeroizing<Vec<u8>>> {
    provider.root_key().map_err(|e| match e {
        KmsError::RootKeyUnavailable { .. } => e,
        other => KmsError::RootKeyUnavailable {
            reason: other.to_string(),
        },
    })
}

#[async_trait]
impl KeyManager for Kms {
    async fn create_scope_keys(&self, scope_id: &str) -> Result<u32> {
        if let Some(version) = self.current_version(scope_id).await? {
            return Ok(version);
        }
        let version = self.add_version(scope_id).await?;
        tracing::info!(scope_id, version, "created scope data key");
        Ok(version)
    }

    async fn encrypt(&self, scope_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.seal_current(scope_id, plaintext).await
    }

    async fn decrypt(&self, scope_id: &str, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = Envelope::decode(ciphertext)?;
        let key = self.data_key(scope_id, envelope.version).await?;
        crypto::open(
            &envelope.nonce,
            envelope.sealed,
            &key,
            &data_aad(scope_id, envelope.version),
        )
    }

    async fn rewrap(&self, scope_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let from = self.key_version_of(ciphertext)?;
        let plaintext = self.decrypt(scope_id, ciphertext).await?;
        let rewrapped = self.seal_current(scope_id, &plaintext).await?;
        tracing::debug!(
            scope_id,
            from,
            to = self.key_version_of(&rewrapped)?,
            "rewrapped ciphertext"
        );
        Ok(rewrapped)
    }

    async fn rotate(&self, scope_id: &str) -> Result<u32> {
        self.require_current(scope_id).await?;
        let version = self.add_version(scope_id).await?;
        tracing::info!(scope_id, version, "rotated scope data key");
        Ok(version)
    }

    async fn current_version(&self, scope_id: &str) -> Result<Option<u32>> {
        let scope = scope_id.to_string();
        self.with_keyring(move |ring| ring.current_version(&scope))
            .await
    }

    fn key_version_of(&self, ciphertext: &[u8]) -> Result<u32> {
        Ok(Envelope::decode(ciphertext)?.version)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
