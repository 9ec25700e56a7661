use super::key::{EncryptionKey, MasterKey};
use crate::db::{self, params, Database, Row, Session};
use crate::envelope::{self, Payload};
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::key_provider::MasterKeyProvider;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use secrecy::SecretVec;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

/// Label mixed into the master key to derive the blind index namespace.
const INDEX_LABEL: &[u8] = b"Indexing Key";

const SELECT_KEY: &str = "
    SELECT uuid, encrypted_key, created_at, deleted_at
      FROM encryption_keys
     WHERE uuid = ?1";

const SELECT_ALL_KEYS: &str = "
    SELECT uuid, encrypted_key, created_at, deleted_at
      FROM encryption_keys";

/// Key manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyManagerConfig {
    cache_ttl_ms: u64,
}

impl KeyManagerConfig {
    /// Sets how long cached keys are trusted before a refresh.
    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the cache time-to-live.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self { cache_ttl_ms: 30_000 }
    }
}

/// Snapshot of the key cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStats {
    /// Cached keys usable for new encryption
    pub valid: usize,
    /// Cached deleted keys, kept for decryption
    pub deleted: usize,
    /// Completed full refreshes since construction
    pub refreshes: u64,
}

#[derive(Default)]
struct KeyCache {
    valid: HashMap<Identifier, Arc<EncryptionKey>>,
    deleted: HashMap<Identifier, Arc<EncryptionKey>>,
    refreshed_at: Option<Instant>,
}

impl KeyCache {
    fn file(&mut self, key: Arc<EncryptionKey>) {
        let id = key.id();
        if key.is_deleted() {
            self.valid.remove(&id);
            self.deleted.insert(id, key);
        } else {
            self.deleted.remove(&id);
            self.valid.insert(id, key);
        }
    }

    fn lookup(&self, id: &Identifier) -> Option<Arc<EncryptionKey>> {
        self.valid.get(id).or_else(|| self.deleted.get(id)).cloned()
    }

    fn random_valid(&self) -> Option<Arc<EncryptionKey>> {
        self.valid.values().choose(&mut rand::thread_rng()).cloned()
    }

    fn absorb(&mut self, previous: &Self) {
        for (id, key) in &previous.deleted {
            if !self.deleted.contains_key(id) {
                self.file(Arc::clone(key));
            }
        }
        for (id, key) in &previous.valid {
            if self.lookup(id).is_none() {
                self.file(Arc::clone(key));
            }
        }
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        self.refreshed_at.map_or(true, |at| at.elapsed() >= ttl)
    }

    fn is_empty(&self) -> bool {
        self.valid.is_empty() && self.deleted.is_empty()
    }
}

struct KeyRow {
    id: Identifier,
    encrypted_key: Vec<u8>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

fn map_key_row(row: &Row<'_>) -> rusqlite::Result<KeyRow> {
    Ok(KeyRow {
        id: row.get(0)?,
        encrypted_key: row.get(1)?,
        created_at: db::timestamp(row, 2)?,
        deleted_at: db::optional_timestamp(row, 3)?,
    })
}

struct Inner {
    master: MasterKey,
    index_base: Identifier,
    db: Database,
    config: KeyManagerConfig,
    cache: RwLock<KeyCache>,
    refresh_gate: AsyncMutex<()>,
    refreshes: AtomicU64,
}

/// Creates, caches and retires data-encryption keys.
///
/// Keys are stored wrapped (encrypted under the master key) in the
/// `encryption_keys` table. Clones share one cache.
#[derive(Clone)]
pub struct KeyManager {
    inner: Arc<Inner>,
}

impl KeyManager {
    /// Creates a key manager. The cache starts cold.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidMasterKey` if the index namespace cannot be
    /// derived from the master key.
    pub fn new(master: MasterKey, db: Database, config: KeyManagerConfig) -> Result<Self> {
        let index_base = derive_index_base(&master)?;
        let inner = Inner {
            master,
            index_base,
            db,
            config,
            cache: RwLock::new(KeyCache::default()),
            refresh_gate: AsyncMutex::new(()),
            refreshes: AtomicU64::new(0),
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Creates a key manager with the master key of `provider`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyProvider` if the provider cannot supply the key.
    pub fn from_provider<P>(provider: &P, db: Database, config: KeyManagerConfig) -> Result<Self>
    where
        P: MasterKeyProvider + ?Sized,
    {
        Self::new(provider.master_key()?, db, config)
    }

    /// Generates, wraps and persists a new key.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the key cannot be persisted.
    pub async fn generate(&self) -> Result<Arc<EncryptionKey>> {
        let key = {
            let session = self.inner.db.write().await?;
            self.generate_in(&session)?
        };
        self.inner.cache.write().file(Arc::clone(&key));
        info!(key = %key.id(), "generated encryption key");
        Ok(key)
    }

    /// Generates a key through an already open write session.
    ///
    /// The key is not cached. Hand it to [`adopt`](Self::adopt) once the
    /// session's transaction has committed.
    pub(crate) fn generate_in(&self, session: &Session) -> Result<Arc<EncryptionKey>> {
        let key = EncryptionKey::generate(Identifier::new_v4(), db::now());

        let mut material = Payload::Binary(key.expose().to_vec());
        let wrapped = envelope::encrypt(self.inner.master.expose(), &material);
        if let Payload::Binary(bytes) = &mut material {
            bytes.zeroize();
        }
        let wrapped = wrapped?;

        session.execute(
            "INSERT INTO encryption_keys (uuid, encrypted_key, created_at) VALUES (?1, ?2, ?3)",
            params![key.id(), wrapped, key.created_at().timestamp_millis()],
        )?;
        Ok(Arc::new(key))
    }

    /// Caches a key produced by [`generate_in`](Self::generate_in) after its
    /// row committed. A cached entry, deleted or not, is left alone.
    pub(crate) fn adopt(&self, key: Arc<EncryptionKey>) {
        let mut cache = self.inner.cache.write();
        if cache.lookup(&key.id()).is_none() {
            info!(key = %key.id(), "generated encryption key");
            cache.file(key);
        }
    }

    /// Reads one key from the backing store, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the key cannot be unwrapped.
    pub async fn load(&self, id: &Identifier) -> Result<Option<Arc<EncryptionKey>>> {
        let row = {
            let session = self.inner.db.read().await?;
            session.query_row(SELECT_KEY, params![id], map_key_row)?
        };
        let Some(row) = row else {
            return Ok(None);
        };

        let key = Arc::new(self.unwrap_row(row)?);
        self.inner.cache.write().file(Arc::clone(&key));
        Ok(Some(key))
    }

    /// Soft-deletes a key.
    ///
    /// Returns the key in its deleted state, or `None` if it does not exist
    /// or was already deleted.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` or `Error::DecryptionFailed`.
    pub async fn delete(&self, id: &Identifier) -> Result<Option<Arc<EncryptionKey>>> {
        let deleted_at = db::now();
        let row = {
            let session = self.inner.db.write().await?;
            let changed = session.execute(
                "UPDATE encryption_keys SET deleted_at = ?1 WHERE uuid = ?2 AND deleted_at IS NULL",
                params![deleted_at.timestamp_millis(), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            if self.inner.cache.read().lookup(id).is_some() {
                None
            } else {
                session.query_row(SELECT_KEY, params![id], map_key_row)?
            }
        };

        let cached = self.inner.cache.read().lookup(id);
        let key = match (cached, row) {
            (Some(key), _) => Arc::new(key.deleted(deleted_at)),
            (None, Some(row)) => Arc::new(self.unwrap_row(row)?),
            (None, None) => return Ok(None),
        };
        self.inner.cache.write().file(Arc::clone(&key));
        info!(key = %id, "encryption key deleted");
        Ok(Some(key))
    }

    /// Reloads every key and rebuilds the cache.
    ///
    /// Keys that fail to unwrap are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the keys cannot be read.
    pub async fn load_all(&self) -> Result<HashMap<Identifier, Arc<EncryptionKey>>> {
        let rows = {
            let session = self.inner.db.read().await?;
            session.query(SELECT_ALL_KEYS, params![], map_key_row)?
        };

        let mut cache = KeyCache::default();
        for row in rows {
            let id = row.id;
            match self.unwrap_row(row) {
                Ok(key) => cache.file(Arc::new(key)),
                Err(err) => warn!(key = %id, error = %err, "skipping key that failed to unwrap"),
            }
        }
        cache.refreshed_at = Some(Instant::now());

        let mut current = self.inner.cache.write();
        // Rows are never removed and deletion is one-way, so anything filed
        // while the snapshot was read is newer than the snapshot.
        cache.absorb(&current);
        let all: HashMap<_, _> = cache
            .valid
            .iter()
            .chain(cache.deleted.iter())
            .map(|(id, key)| (*id, Arc::clone(key)))
            .collect();
        let (valid, deleted) = (cache.valid.len(), cache.deleted.len());
        *current = cache;
        drop(current);

        let refreshes = self.inner.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(valid, deleted, refreshes, "key cache refreshed");
        Ok(all)
    }

    /// Returns the key with `id`, deleted or not.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if no such key exists.
    pub async fn get(&self, id: &Identifier) -> Result<Arc<EncryptionKey>> {
        self.refresh_if_stale().await?;

        let cached = self.inner.cache.read().lookup(id);
        if let Some(key) = cached {
            return Ok(key);
        }
        self.load(id).await?.ok_or(Error::KeyUnavailable(*id))
    }

    /// Returns a random non-deleted key, generating one if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be filled or a key cannot be
    /// generated.
    pub async fn active(&self) -> Result<Arc<EncryptionKey>> {
        self.refresh_if_stale().await?;

        let picked = self.inner.cache.read().random_valid();
        match picked {
            Some(key) => Ok(key),
            None => self.generate().await,
        }
    }

    /// Returns a random non-deleted key without generating one.
    pub(crate) async fn cached_active(&self) -> Result<Option<Arc<EncryptionKey>>> {
        self.refresh_if_stale().await?;
        Ok(self.inner.cache.read().random_valid())
    }

    /// Encrypts with an active key, returning the key id and the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if no key is available or encryption fails.
    pub async fn encrypt(&self, payload: &Payload) -> Result<(Identifier, Vec<u8>)> {
        let key = self.active().await?;
        Ok((key.id(), key.encrypt(payload)?))
    }

    /// Decrypts an envelope produced under key `id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` or `Error::DecryptionFailed`.
    pub async fn decrypt(&self, id: &Identifier, data: &[u8]) -> Result<Payload> {
        self.get(id).await?.decrypt(data)
    }

    /// Returns the blind index namespace for `scope`.
    ///
    /// Without a scope this is the base namespace derived from the master key.
    #[must_use]
    pub fn namespace(&self, scope: Option<&Identifier>) -> Identifier {
        match scope {
            Some(scope) => Identifier::new_v5(&self.inner.index_base, scope.as_bytes()),
            None => self.inner.index_base,
        }
    }

    /// Returns cache counters.
    #[must_use]
    pub fn stats(&self) -> KeyStats {
        let cache = self.inner.cache.read();
        KeyStats {
            valid: cache.valid.len(),
            deleted: cache.deleted.len(),
            refreshes: self.inner.refreshes.load(Ordering::Relaxed),
        }
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        let ttl = self.inner.config.cache_ttl();
        if !self.inner.cache.read().is_stale(ttl) {
            return Ok(());
        }

        let _gate = self.inner.refresh_gate.lock().await;
        if !self.inner.cache.read().is_stale(ttl) {
            return Ok(());
        }

        match self.load_all().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let mut cache = self.inner.cache.write();
                if cache.is_empty() {
                    return Err(err);
                }
                warn!(error = %err, "key refresh failed, serving cached keys");
                cache.refreshed_at = Some(Instant::now());
                Ok(())
            }
        }
    }

    fn unwrap_row(&self, row: KeyRow) -> Result<EncryptionKey> {
        match envelope::decrypt(self.inner.master.expose(), &row.encrypted_key)? {
            Payload::Binary(bytes) => {
                EncryptionKey::from_secret(row.id, SecretVec::new(bytes), row.created_at, row.deleted_at)
            }
            _ => Err(Error::DecryptionFailed(format!("key {} is not binary", row.id))),
        }
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("master", &self.inner.master)
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn derive_index_base(master: &MasterKey) -> Result<Identifier> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master.expose())
        .map_err(|_| Error::InvalidMasterKey(master.expose().len()))?;
    mac.update(INDEX_LABEL);
    let digest = mac.finalize().into_bytes();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ok(Identifier::from_bytes(bytes))
}
