//! Hierarchical store of encrypted entities.
//!
//! Every entity carries a `kind`, a `parent` (equal to its own uuid for a
//! hierarchy root) and an attribute map that is only ever persisted as an
//! envelope. Writes run inside one backing-store transaction together with
//! the validation and indexing hooks, so a failing hook leaves no trace.

use crate::attributes::{self, Attributes};
use crate::db::{self, params, Database, Row, Transaction};
use crate::envelope::Payload;
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::keys::{EncryptionKey, KeyManager};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

const ENTITY_COLUMNS: &str =
    "uuid, kind, parent, encryption_key, encrypted_data, created_at, updated_at, deleted_at";

/// A stored entity. Attributes are decrypted on first access and memoized.
#[derive(Clone)]
pub struct Entity {
    uuid: Identifier,
    kind: String,
    parent: Identifier,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    encryption_key_id: Identifier,
    encrypted_data: Vec<u8>,
    keys: KeyManager,
    attributes: OnceCell<Attributes>,
}

impl Entity {
    /// Returns the entity identifier.
    #[must_use]
    pub const fn uuid(&self) -> Identifier {
        self.uuid
    }

    /// Returns the entity kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the parent identifier.
    #[must_use]
    pub const fn parent(&self) -> Identifier {
        self.parent
    }

    /// Whether this entity is the root of its hierarchy.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent == self.uuid
    }

    /// Returns when the entity was inserted.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the attributes were last written.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns when the entity was soft-deleted, if it was.
    #[must_use]
    pub const fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Whether the entity has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Returns the key the attributes are encrypted under.
    #[must_use]
    pub const fn encryption_key_id(&self) -> Identifier {
        self.encryption_key_id
    }

    /// Returns the attribute envelope as stored.
    #[must_use]
    pub fn encrypted_data(&self) -> &[u8] {
        &self.encrypted_data
    }

    /// Decrypts the attributes, once per instance.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` or `Error::DecryptionFailed`.
    pub async fn attributes(&self) -> Result<&Attributes> {
        self.attributes
            .get_or_try_init(|| async {
                let payload = self.keys.decrypt(&self.encryption_key_id, &self.encrypted_data).await?;
                attribute_map(&self.uuid, payload)
            })
            .await
    }
}

fn attribute_map(uuid: &Identifier, payload: Payload) -> Result<Attributes> {
    match payload {
        Payload::Json(Value::Object(attributes)) => Ok(attributes),
        _ => Err(Error::DecryptionFailed(format!("entity {uuid} does not hold an attribute map"))),
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("uuid", &self.uuid)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("deleted_at", &self.deleted_at)
            .field("encryption_key_id", &self.encryption_key_id)
            .field("encrypted_len", &self.encrypted_data.len())
            .finish_non_exhaustive()
    }
}

struct EntityRow {
    uuid: Identifier,
    kind: String,
    parent: Identifier,
    encryption_key_id: Identifier,
    encrypted_data: Vec<u8>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl EntityRow {
    fn map(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uuid: row.get(0)?,
            kind: row.get(1)?,
            parent: row.get(2)?,
            encryption_key_id: row.get(3)?,
            encrypted_data: row.get(4)?,
            created_at: db::timestamp(row, 5)?,
            updated_at: db::timestamp(row, 6)?,
            deleted_at: db::optional_timestamp(row, 7)?,
        })
    }

    fn into_entity(self, keys: &KeyManager) -> Entity {
        Entity {
            uuid: self.uuid,
            kind: self.kind,
            parent: self.parent,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            encryption_key_id: self.encryption_key_id,
            encrypted_data: self.encrypted_data,
            keys: keys.clone(),
            attributes: OnceCell::new(),
        }
    }
}

/// What a validator is told about the write it is checking.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Entity kind
    pub kind: &'a str,
    /// Parent identifier
    pub parent: Identifier,
    /// Set when an existing entity is being updated
    pub uuid: Option<Identifier>,
}

/// Checks (and may rewrite) attributes before they are encrypted.
///
/// Runs inside the write transaction, so reads through `tx` see the
/// in-flight state. Plain functions taking `(&ValidationContext, Attributes)`
/// implement this trait.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Returns the attributes to persist.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the write; `Error::ValidationFailed` is the
    /// conventional rejection.
    async fn validate(
        &self,
        tx: &Transaction,
        ctx: &ValidationContext<'_>,
        attributes: Attributes,
    ) -> Result<Attributes>;
}

#[async_trait]
impl<F> Validator for F
where
    F: Fn(&ValidationContext<'_>, Attributes) -> Result<Attributes> + Send + Sync,
{
    async fn validate(
        &self,
        _tx: &Transaction,
        ctx: &ValidationContext<'_>,
        attributes: Attributes,
    ) -> Result<Attributes> {
        self(ctx, attributes)
    }
}

/// Pass-through validator.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoValidation;

#[async_trait]
impl Validator for NoValidation {
    async fn validate(
        &self,
        _tx: &Transaction,
        _ctx: &ValidationContext<'_>,
        attributes: Attributes,
    ) -> Result<Attributes> {
        Ok(attributes)
    }
}

/// Hook invoked with the decrypted attributes after every insert and update.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Indexes `entity`.
    ///
    /// # Errors
    ///
    /// Returning an error rolls the write back.
    async fn index(&self, tx: &Transaction, entity: &Entity, attributes: &Attributes) -> Result<()>;

    /// Called when `entity` is soft-deleted.
    ///
    /// # Errors
    ///
    /// Returning an error rolls the delete back.
    async fn remove(&self, tx: &Transaction, entity: &Entity) -> Result<()> {
        let _ = (tx, entity);
        Ok(())
    }
}

/// Indexer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndex;

#[async_trait]
impl Indexer for NoIndex {
    async fn index(&self, _tx: &Transaction, _entity: &Entity, _attributes: &Attributes) -> Result<()> {
        Ok(())
    }
}

/// The object store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    keys: KeyManager,
    db: Database,
    validator: Arc<dyn Validator>,
    indexer: Arc<dyn Indexer>,
}

impl Store {
    /// Creates a store without validation or indexing.
    #[must_use]
    pub fn new(keys: KeyManager, db: Database) -> Self {
        Self { keys, db, validator: Arc::new(NoValidation), indexer: Arc::new(NoIndex) }
    }

    /// Sets the validator.
    #[must_use]
    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Sets the indexer.
    #[must_use]
    pub fn with_indexer(mut self, indexer: impl Indexer + 'static) -> Self {
        self.indexer = Arc::new(indexer);
        self
    }

    /// Returns the key manager.
    #[must_use]
    pub const fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Looks up one entity. A malformed uuid yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the query fails.
    pub async fn select(&self, uuid: &str, include_deleted: bool) -> Result<Option<Entity>> {
        let Ok(uuid) = Identifier::parse(uuid) else {
            return Ok(None);
        };
        let session = self.db.read().await?;
        let row = select_row(&session, &uuid, include_deleted)?;
        Ok(row.map(|row| row.into_entity(&self.keys)))
    }

    /// Lists the children of `parent`, optionally of one kind.
    ///
    /// A malformed parent yields an empty map. A root is listed under its
    /// own uuid.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the query fails.
    pub async fn by_parent(
        &self,
        parent: &str,
        kind: Option<&str>,
        include_deleted: bool,
    ) -> Result<BTreeMap<Identifier, Entity>> {
        let Ok(parent) = Identifier::parse(parent) else {
            return Ok(BTreeMap::new());
        };

        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities
              WHERE parent = ?1
                AND (?2 IS NULL OR kind = ?2)
                AND (?3 OR deleted_at IS NULL)"
        );
        let session = self.db.read().await?;
        let rows = session.query(&sql, params![parent, kind, include_deleted], EntityRow::map)?;

        Ok(rows.into_iter().map(|row| (row.uuid, row.into_entity(&self.keys))).collect())
    }

    /// Opens a write transaction.
    ///
    /// The encryption key is picked on the first write that encrypts, so a
    /// transaction that only deletes never touches the key manager.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the transaction cannot begin.
    pub async fn begin(&self) -> Result<StoreTransaction<'_>> {
        let tx = self.db.transaction().await?;
        Ok(StoreTransaction { store: self, tx, key: OnceCell::new() })
    }

    /// Inserts a new entity with a fresh uuid.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParent` for a malformed parent, or whatever the
    /// validator, indexer or backing store fails with. Nothing is written on
    /// failure.
    pub async fn insert(&self, kind: &str, parent: &str, attributes: Attributes) -> Result<Entity> {
        let tx = self.begin().await?;
        let entity = tx.insert_in(kind, parent, attributes).await?;
        tx.commit()?;
        Ok(entity)
    }

    /// Inserts a new entity under a caller-chosen uuid.
    ///
    /// Writing the root of a hierarchy means passing `parent == uuid`.
    ///
    /// # Errors
    ///
    /// Same as [`insert`](Self::insert).
    pub async fn insert_with_uuid(
        &self,
        uuid: Identifier,
        kind: &str,
        parent: &str,
        attributes: Attributes,
    ) -> Result<Entity> {
        let tx = self.begin().await?;
        let entity = tx.insert_with_uuid_in(uuid, kind, parent, attributes).await?;
        tx.commit()?;
        Ok(entity)
    }

    /// Merges `attributes` into a live entity.
    ///
    /// Returns `None` if the uuid is malformed, unknown, or deleted.
    ///
    /// # Errors
    ///
    /// Returns whatever the validator, indexer or backing store fails with.
    pub async fn update(&self, uuid: &str, attributes: Attributes) -> Result<Option<Entity>> {
        let tx = self.begin().await?;
        let entity = tx.update_in(uuid, attributes).await?;
        tx.commit()?;
        Ok(entity)
    }

    /// Soft-deletes an entity and returns its post-delete state.
    ///
    /// Deleting twice is harmless: the second call returns the entity with
    /// its original `deleted_at`.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` or the indexer's error.
    pub async fn delete(&self, uuid: &str) -> Result<Option<Entity>> {
        let tx = self.begin().await?;
        let entity = tx.delete_in(uuid).await?;
        tx.commit()?;
        Ok(entity)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("keys", &self.keys).finish_non_exhaustive()
    }
}

/// A caller-managed write transaction.
///
/// Dropping it without [`commit`](Self::commit) rolls back every write,
/// index entries included.
pub struct StoreTransaction<'s> {
    store: &'s Store,
    tx: Transaction,
    /// Key in use, and whether this transaction created it
    key: OnceCell<(Arc<EncryptionKey>, bool)>,
}

impl StoreTransaction<'_> {
    /// Returns the underlying backing-store transaction.
    #[must_use]
    pub const fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Inserts a new entity with a fresh uuid.
    ///
    /// # Errors
    ///
    /// See [`Store::insert`].
    pub async fn insert_in(&self, kind: &str, parent: &str, attributes: Attributes) -> Result<Entity> {
        self.insert_with_uuid_in(Identifier::new_v4(), kind, parent, attributes).await
    }

    /// Inserts a new entity under `uuid`.
    ///
    /// # Errors
    ///
    /// See [`Store::insert`].
    pub async fn insert_with_uuid_in(
        &self,
        uuid: Identifier,
        kind: &str,
        parent: &str,
        attributes: Attributes,
    ) -> Result<Entity> {
        let parent = Identifier::parse(parent).map_err(|_| Error::InvalidParent)?;
        let attributes = attributes::normalize(attributes);

        let ctx = ValidationContext { kind, parent, uuid: None };
        let attributes = self.store.validator.validate(&self.tx, &ctx, attributes).await?;
        let key = self.key().await?;
        let encrypted_data = key.encrypt(&Payload::from(attributes))?;

        let now = db::now();
        self.tx.execute(
            "INSERT INTO entities (uuid, kind, parent, encryption_key, encrypted_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![uuid, kind, parent, key.id(), encrypted_data, now.timestamp_millis()],
        )?;

        let mut entity = EntityRow {
            uuid,
            kind: kind.to_string(),
            parent,
            encryption_key_id: key.id(),
            encrypted_data,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
        .into_entity(&self.store.keys);
        entity.attributes = OnceCell::from(attribute_map(&uuid, key.decrypt(&entity.encrypted_data)?)?);

        self.reindex(&entity).await?;
        debug!(entity = %uuid, kind, "entity inserted");
        Ok(entity)
    }

    /// Merges `attributes` into a live entity.
    ///
    /// # Errors
    ///
    /// See [`Store::update`].
    pub async fn update_in(&self, uuid: &str, attributes: Attributes) -> Result<Option<Entity>> {
        let Ok(uuid) = Identifier::parse(uuid) else {
            return Ok(None);
        };
        let Some(existing) = select_row(&self.tx, &uuid, false)? else {
            return Ok(None);
        };
        let mut existing = existing.into_entity(&self.store.keys);
        // A key created by this transaction is not visible to the key manager yet.
        if let Some((key, true)) = self.key.get() {
            if key.id() == existing.encryption_key_id {
                existing.attributes = OnceCell::from(attribute_map(&uuid, key.decrypt(&existing.encrypted_data)?)?);
            }
        }

        let merged = attributes::merge(existing.attributes().await?.clone(), attributes);
        let ctx = ValidationContext { kind: &existing.kind, parent: existing.parent, uuid: Some(uuid) };
        let attributes = self.store.validator.validate(&self.tx, &ctx, merged).await?;
        let key = self.key().await?;
        let encrypted_data = key.encrypt(&Payload::from(attributes))?;

        let now = db::now().max(existing.updated_at);
        self.tx.execute(
            "UPDATE entities SET encryption_key = ?1, encrypted_data = ?2, updated_at = ?3 WHERE uuid = ?4",
            params![key.id(), encrypted_data, now.timestamp_millis(), uuid],
        )?;

        let attributes = attribute_map(&uuid, key.decrypt(&encrypted_data)?)?;
        let entity = Entity {
            updated_at: now,
            encryption_key_id: key.id(),
            encrypted_data,
            attributes: OnceCell::from(attributes),
            ..existing
        };

        self.reindex(&entity).await?;
        debug!(entity = %uuid, "entity updated");
        Ok(Some(entity))
    }

    /// Soft-deletes an entity.
    ///
    /// # Errors
    ///
    /// See [`Store::delete`].
    pub async fn delete_in(&self, uuid: &str) -> Result<Option<Entity>> {
        let Ok(uuid) = Identifier::parse(uuid) else {
            return Ok(None);
        };

        let changed = self.tx.execute(
            "UPDATE entities SET deleted_at = ?1 WHERE uuid = ?2 AND deleted_at IS NULL",
            params![db::now().timestamp_millis(), uuid],
        )?;
        let Some(row) = select_row(&self.tx, &uuid, true)? else {
            return Ok(None);
        };
        let entity = row.into_entity(&self.store.keys);

        if changed > 0 {
            self.store.indexer.remove(&self.tx, &entity).await?;
            debug!(entity = %uuid, "entity deleted");
        }
        Ok(Some(entity))
    }

    /// Commits every write made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if `COMMIT` fails.
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        if let Some((key, true)) = self.key.get() {
            self.store.keys.adopt(Arc::clone(key));
        }
        Ok(())
    }

    /// Picks the key for this transaction on first use.
    ///
    /// A missing key is generated through this transaction, since a separate
    /// write would wait on the writer lock held here.
    async fn key(&self) -> Result<&Arc<EncryptionKey>> {
        let (key, _) = self
            .key
            .get_or_try_init(|| async {
                match self.store.keys.cached_active().await? {
                    Some(key) => Ok::<_, Error>((key, false)),
                    None => Ok((self.store.keys.generate_in(&self.tx)?, true)),
                }
            })
            .await?;
        Ok(key)
    }

    async fn reindex(&self, entity: &Entity) -> Result<()> {
        let attributes = entity.attributes().await?;
        self.store.indexer.index(&self.tx, entity, attributes).await
    }
}

fn select_row(session: &db::Session, uuid: &Identifier, include_deleted: bool) -> Result<Option<EntityRow>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE uuid = ?1 AND (?2 OR deleted_at IS NULL)"
    );
    session.query_row(&sql, params![uuid, include_deleted], EntityRow::map)
}
