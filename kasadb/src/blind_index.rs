//! Blind index for uniqueness checks and exact-match lookups.
//!
//! Attribute values are never stored. Each `(name, value)` pair is reduced to
//! a deterministic token:
//!
//! ```text
//! keyid = v5(namespace(scope), name)
//! value = v5(namespace(scope), name ":" value)
//! ```
//!
//! where `namespace` is keyed by the master key, so tokens cannot be
//! recomputed without it. A missing scope means "global" and is stored as
//! SQL `NULL`.

use crate::attributes::Attributes;
use crate::db::{params, Database, Transaction};
use crate::error::{Error, Result};
use crate::identifier::Identifier;
use crate::keys::KeyManager;
use crate::store::{Entity, Indexer};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Computes blind index tokens and maintains the `blind_index` table.
#[derive(Clone, Debug)]
pub struct BlindIndex {
    keys: KeyManager,
    db: Database,
}

impl BlindIndex {
    /// Creates a blind index over `db`, keyed by the master key of `keys`.
    #[must_use]
    pub const fn new(keys: KeyManager, db: Database) -> Self {
        Self { keys, db }
    }

    /// Returns the `(keyid, value)` tokens for one attribute.
    #[must_use]
    pub fn tokens(&self, scope: Option<&Identifier>, name: &str, value: &Value) -> (Identifier, Identifier) {
        let namespace = self.keys.namespace(scope);
        let text = match value {
            Value::String(s) => format!("{name}:{s}"),
            other => format!("{name}:{other}"),
        };
        (
            Identifier::new_v5(&namespace, name.as_bytes()),
            Identifier::new_v5(&namespace, text.as_bytes()),
        )
    }

    /// Replaces the entries of `owner` in `scope` in a transaction of its own.
    ///
    /// # Errors
    ///
    /// See [`index_in`](Self::index_in).
    pub async fn index(
        &self,
        scope: Option<Identifier>,
        owner: Identifier,
        attributes: &Attributes,
    ) -> Result<BTreeMap<String, Identifier>> {
        let tx = self.db.transaction().await?;
        let tokens = self.index_in(&tx, scope, owner, attributes)?;
        tx.commit()?;
        Ok(tokens)
    }

    /// Replaces the entries of `owner` in `scope` and returns the value token
    /// of every indexed attribute. Null attributes are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::IndexConflict` if another owner already holds any of
    /// the values in `scope`; nothing is written in that case.
    pub fn index_in(
        &self,
        tx: &Transaction,
        scope: Option<Identifier>,
        owner: Identifier,
        attributes: &Attributes,
    ) -> Result<BTreeMap<String, Identifier>> {
        let entries: Vec<(&String, Identifier, Identifier)> = attributes
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| {
                let (keyid, token) = self.tokens(scope.as_ref(), name, value);
                (name, keyid, token)
            })
            .collect();

        // `IS` compares NULL scopes as equal.
        let mut conflicts = BTreeMap::new();
        for (name, _, token) in &entries {
            let holder: Option<Identifier> = tx.query_row(
                "SELECT owner FROM blind_index WHERE scope IS ?1 AND value = ?2 AND owner != ?3 LIMIT 1",
                params![scope, token, owner],
                |row| row.get(0),
            )?;
            if let Some(holder) = holder {
                conflicts.insert((*name).clone(), holder);
            }
        }
        if !conflicts.is_empty() {
            debug!(%owner, conflicts = conflicts.len(), "blind index conflict");
            return Err(Error::IndexConflict { scope, owner, conflicts });
        }

        self.clear_in(tx, scope, owner)?;
        let mut tokens = BTreeMap::new();
        for (name, keyid, token) in entries {
            tx.execute(
                "INSERT INTO blind_index (scope, owner, keyid, value) VALUES (?1, ?2, ?3, ?4)",
                params![scope, owner, keyid, token],
            )?;
            tokens.insert(name.clone(), token);
        }
        debug!(%owner, entries = tokens.len(), "blind index updated");
        Ok(tokens)
    }

    /// Returns the owner of `name = value` in `scope`.
    ///
    /// A malformed scope yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the lookup fails.
    pub async fn find(&self, scope: Option<&str>, name: &str, value: &Value) -> Result<Option<Identifier>> {
        let scope = match scope.map(Identifier::parse).transpose() {
            Ok(scope) => scope,
            Err(_) => return Ok(None),
        };
        let (_, token) = self.tokens(scope.as_ref(), name, value);

        let session = self.db.read().await?;
        session.query_row(
            "SELECT owner FROM blind_index WHERE scope IS ?1 AND value = ?2 LIMIT 1",
            params![scope, token],
            |row| row.get(0),
        )
    }

    /// Removes every entry of `owner` in `scope`, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the delete fails.
    pub async fn clear(&self, scope: Option<Identifier>, owner: Identifier) -> Result<usize> {
        let session = self.db.write().await?;
        session.execute("DELETE FROM blind_index WHERE scope IS ?1 AND owner = ?2", params![scope, owner])
    }

    /// Transactional [`clear`](Self::clear).
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the delete fails.
    pub fn clear_in(&self, tx: &Transaction, scope: Option<Identifier>, owner: Identifier) -> Result<usize> {
        tx.execute("DELETE FROM blind_index WHERE scope IS ?1 AND owner = ?2", params![scope, owner])
    }
}

/// Where a unique field is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexScope {
    /// Across the whole store.
    Global,
    /// Among siblings sharing a parent.
    Parent,
}

impl IndexScope {
    fn resolve(self, entity: &Entity) -> Option<Identifier> {
        match self {
            Self::Global => None,
            Self::Parent => Some(entity.parent()),
        }
    }
}

#[derive(Debug, Clone)]
struct UniqueFields {
    scope: IndexScope,
    fields: Vec<String>,
}

/// [`Indexer`] enforcing unique attributes per entity kind.
///
/// # Example
///
/// ```rust,ignore
/// let indexer = FieldIndexer::new(BlindIndex::new(keys.clone(), db.clone()))
///     .unique("domain", IndexScope::Global, &["name"])
///     .unique("user", IndexScope::Parent, &["email"]);
/// let store = Store::new(keys, db).with_indexer(indexer);
/// ```
#[derive(Debug, Clone)]
pub struct FieldIndexer {
    index: BlindIndex,
    kinds: HashMap<String, UniqueFields>,
}

impl FieldIndexer {
    /// Creates an indexer with no unique fields.
    #[must_use]
    pub fn new(index: BlindIndex) -> Self {
        Self { index, kinds: HashMap::new() }
    }

    /// Declares `fields` of `kind` unique within `scope`.
    #[must_use]
    pub fn unique(mut self, kind: impl Into<String>, scope: IndexScope, fields: &[&str]) -> Self {
        let fields = fields.iter().map(ToString::to_string).collect();
        self.kinds.insert(kind.into(), UniqueFields { scope, fields });
        self
    }
}

#[async_trait]
impl Indexer for FieldIndexer {
    async fn index(&self, tx: &Transaction, entity: &Entity, attributes: &Attributes) -> Result<()> {
        let Some(unique) = self.kinds.get(entity.kind()) else {
            return Ok(());
        };
        let selected: Attributes = unique
            .fields
            .iter()
            .filter_map(|field| attributes.get(field).map(|value| (field.clone(), value.clone())))
            .collect();

        self.index.index_in(tx, unique.scope.resolve(entity), entity.uuid(), &selected)?;
        Ok(())
    }

    async fn remove(&self, tx: &Transaction, entity: &Entity) -> Result<()> {
        if let Some(unique) = self.kinds.get(entity.kind()) {
            self.index.clear_in(tx, unique.scope.resolve(entity), entity.uuid())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::temp_database;
    use crate::keys::{KeyManagerConfig, MasterKey};
    use crate::store::Store;
    use serde_json::json;
    use tempfile::TempDir;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test helper expects an object"),
        }
    }

    fn setup() -> (TempDir, KeyManager, BlindIndex) {
        let (dir, db) = temp_database();
        let keys = KeyManager::new(MasterKey::generate(), db.clone(), KeyManagerConfig::default()).unwrap();
        let index = BlindIndex::new(keys.clone(), db);
        (dir, keys, index)
    }

    async fn rows(index: &BlindIndex) -> Vec<(Option<Identifier>, Identifier)> {
        index
            .db
            .read()
            .await
            .unwrap()
            .query("SELECT scope, owner FROM blind_index ORDER BY rowid", params![], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap()
    }

    #[test]
    fn test_token_construction() {
        let (_dir, keys, index) = setup();
        let scope = Identifier::new_v4();
        let namespace = keys.namespace(Some(&scope));

        let (keyid, value) = index.tokens(Some(&scope), "email", &json!("alice@example.org"));
        assert_eq!(keyid, Identifier::new_v5(&namespace, b"email"));
        assert_eq!(value, Identifier::new_v5(&namespace, b"email:alice@example.org"));

        let (_, number) = index.tokens(None, "age", &json!(42));
        assert_eq!(number, Identifier::new_v5(&keys.namespace(None), b"age:42"));
    }

    #[tokio::test]
    async fn test_conflict_then_distinct_value() {
        let (_dir, _keys, index) = setup();
        let (alice, bob) = (Identifier::new_v4(), Identifier::new_v4());

        index.index(None, alice, &attrs(json!({"email": "shared@example.org"}))).await.unwrap();

        let err = index.index(None, bob, &attrs(json!({"email": "shared@example.org"}))).await.unwrap_err();
        match err {
            Error::IndexConflict { scope, owner, conflicts } => {
                assert_eq!(scope, None);
                assert_eq!(owner, bob);
                assert_eq!(conflicts.get("email"), Some(&alice));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rows(&index).await, vec![(None, alice)]);

        let tokens = index.index(None, bob, &attrs(json!({"email": "bob@example.org"}))).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(rows(&index).await, vec![(None, alice), (None, bob)]);
    }

    #[tokio::test]
    async fn test_reindex_replaces_stale_tokens() {
        let (_dir, _keys, index) = setup();
        let owner = Identifier::new_v4();

        index.index(None, owner, &attrs(json!({"a": "1", "b": "2"}))).await.unwrap();
        index.index(None, owner, &attrs(json!({"c": "3"}))).await.unwrap();

        assert_eq!(rows(&index).await.len(), 1);
        assert_eq!(index.find(None, "a", &json!("1")).await.unwrap(), None);
        assert_eq!(index.find(None, "c", &json!("3")).await.unwrap(), Some(owner));
    }

    #[tokio::test]
    async fn test_same_owner_is_not_a_conflict() {
        let (_dir, _keys, index) = setup();
        let owner = Identifier::new_v4();
        let attributes = attrs(json!({"email": "a@example.org"}));

        index.index(None, owner, &attributes).await.unwrap();
        index.index(None, owner, &attributes).await.unwrap();
        assert_eq!(rows(&index).await.len(), 1);
    }

    #[tokio::test]
    async fn test_null_scope_is_distinct_from_scoped() {
        let (_dir, _keys, index) = setup();
        let (global, scoped, scope) = (Identifier::new_v4(), Identifier::new_v4(), Identifier::new_v4());
        let attributes = attrs(json!({"email": "x@example.org"}));

        let global_tokens = index.index(None, global, &attributes).await.unwrap();
        let scoped_tokens = index.index(Some(scope), scoped, &attributes).await.unwrap();
        assert_ne!(global_tokens["email"], scoped_tokens["email"]);

        let value = json!("x@example.org");
        assert_eq!(index.find(None, "email", &value).await.unwrap(), Some(global));
        assert_eq!(index.find(Some(&scope.to_string()), "email", &value).await.unwrap(), Some(scoped));
        assert_eq!(index.find(Some("not-a-scope"), "email", &value).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_null_attributes_skipped() {
        let (_dir, _keys, index) = setup();
        let tokens =
            index.index(None, Identifier::new_v4(), &attrs(json!({"a": null, "b": "x"}))).await.unwrap();
        assert_eq!(tokens.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_clear_only_touches_scope() {
        let (_dir, _keys, index) = setup();
        let (owner, scope) = (Identifier::new_v4(), Identifier::new_v4());
        let attributes = attrs(json!({"name": "n"}));

        index.index(None, owner, &attributes).await.unwrap();
        index.index(Some(scope), owner, &attributes).await.unwrap();

        assert_eq!(index.clear(Some(scope), owner).await.unwrap(), 1);
        assert_eq!(rows(&index).await, vec![(None, owner)]);
        assert_eq!(index.clear(Some(scope), owner).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_field_indexer_with_store() {
        let (_dir, keys, index) = setup();
        let db = index.db.clone();
        let indexer = FieldIndexer::new(index.clone())
            .unique("domain", IndexScope::Global, &["name"])
            .unique("user", IndexScope::Parent, &["email"]);
        let store = Store::new(keys, db).with_indexer(indexer);

        let first = Identifier::new_v4();
        let first = store
            .insert_with_uuid(first, "domain", &first.to_string(), attrs(json!({"name": "one"})))
            .await
            .unwrap();
        let second = Identifier::new_v4();
        let second = store
            .insert_with_uuid(second, "domain", &second.to_string(), attrs(json!({"name": "two"})))
            .await
            .unwrap();

        let duplicate = Identifier::new_v4();
        let result = store
            .insert_with_uuid(duplicate, "domain", &duplicate.to_string(), attrs(json!({"name": "one"})))
            .await;
        assert!(matches!(result, Err(Error::IndexConflict { .. })));
        assert!(store.select(&duplicate.to_string(), true).await.unwrap().is_none());

        let email = json!({"email": "alice@example.org", "display": "Alice"});
        let alice = store.insert("user", &first.uuid().to_string(), attrs(email.clone())).await.unwrap();
        store.insert("user", &second.uuid().to_string(), attrs(email.clone())).await.unwrap();
        let clash = store.insert("user", &first.uuid().to_string(), attrs(email.clone())).await;
        assert!(matches!(clash, Err(Error::IndexConflict { .. })));

        let scope = first.uuid().to_string();
        let value = json!("alice@example.org");
        assert_eq!(index.find(Some(&scope), "email", &value).await.unwrap(), Some(alice.uuid()));
        assert_eq!(index.find(Some(&scope), "display", &json!("Alice")).await.unwrap(), None);

        store.delete(&alice.uuid().to_string()).await.unwrap();
        assert_eq!(index.find(Some(&scope), "email", &value).await.unwrap(), None);
        store.insert("user", &scope, attrs(email)).await.unwrap();
    }
}
