//! # `KasaDB`
//!
//! Encrypted hierarchical object store on top of SQLite.
//!
//! ## Features
//!
//! - Attribute maps encrypted with AES-256-GCM under rotating data keys
//! - Data keys wrapped by a single master key, cached with single-flight refresh
//! - Blind index for uniqueness checks and exact-match lookups
//! - SCRAM-style credential derivation (PBKDF2 + HMAC)
//! - Soft deletes for entities and keys
//!
//! ## Example
//!
//! ```rust,ignore
//! use kasadb::prelude::*;
//!
//! let provider = FileKeyProvider::new("./master.key")?;
//! let db = Database::open(DatabaseConfig::new("./kasadb.sqlite3"))?;
//! let keys = KeyManager::from_provider(&provider, db.clone(), KeyManagerConfig::default())?;
//! let store = Store::new(keys, db);
//!
//! let root = Identifier::new_v4();
//! let domain = store.insert_with_uuid(root, "domain", &root.to_string(), attributes).await?;
//! let loaded = store.select(&root.to_string(), false).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod attributes;
pub mod blind_index;
pub mod credentials;
pub mod db;
pub mod envelope;
pub mod error;
pub mod identifier;
pub mod key_provider;
pub mod keys;
pub mod store;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::attributes::{merge, normalize, Attributes};
    pub use crate::blind_index::{BlindIndex, FieldIndexer, IndexScope};
    pub use crate::credentials::{CredentialPolicy, CredentialRecord, CredentialsValidator, HashAlgorithm};
    pub use crate::db::{Database, DatabaseConfig, Transaction};
    pub use crate::envelope::Payload;
    pub use crate::error::{Error, KeyProviderError, Result};
    pub use crate::identifier::Identifier;
    pub use crate::key_provider::{MasterKeyProvider, StaticKeyProvider};
    pub use crate::keys::{EncryptionKey, KeyManager, KeyManagerConfig, MasterKey};
    pub use crate::store::{Entity, Indexer, Store, StoreTransaction, ValidationContext, Validator};
}
