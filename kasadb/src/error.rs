//! Error types for `KasaDB` operations.

use crate::identifier::Identifier;
use std::collections::BTreeMap;
use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per-field validation messages.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Main error type for `KasaDB` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed identifier input
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The parent of a new entity is not a well-formed identifier
    #[error("invalid parent identifier")]
    InvalidParent,

    /// Attributes were rejected by the configured validator
    #[error("validation failed for {} field(s)", .0.len())]
    ValidationFailed(FieldErrors),

    /// A blind index value is already owned by another entity
    #[error("index conflict for owner {owner} on {} attribute(s)", conflicts.len())]
    IndexConflict {
        /// Scope the conflict was detected in (`None` is global)
        scope: Option<Identifier>,
        /// Owner that attempted the write
        owner: Identifier,
        /// Attribute name to the entity already holding the value
        conflicts: BTreeMap<String, Identifier>,
    },

    /// Requested key does not exist
    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(Identifier),

    /// Password shorter than the policy allows
    #[error("secret too weak: at least {minimum} bytes required")]
    WeakSecret {
        /// Minimum accepted length in bytes
        minimum: usize,
    },

    /// KDF iteration count under the policy floor
    #[error("KDF too weak: {iterations} iterations (minimum: {minimum})")]
    WeakKdf {
        /// Requested iteration count
        iterations: u32,
        /// Policy floor
        minimum: u32,
    },

    /// Backing store statement failed
    #[error("backing store error in `{statement}` ({params} params): {source}")]
    BackingStore {
        /// Collapsed and truncated statement text
        statement: String,
        /// Number of bound parameters
        params: usize,
        /// Underlying driver error
        #[source]
        source: rusqlite::Error,
    },

    /// Connection pool was shut down
    #[error("connection pool closed")]
    PoolClosed,

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Envelope malformed or authentication tag verification failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Master key is not 256 bits
    #[error("invalid master key: expected 32 bytes, got {0}")]
    InvalidMasterKey(usize),

    /// Key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[from] KeyProviderError),

    /// Attribute (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a `ValidationFailed` carrying a single message.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(field.into(), vec![message.into()]);
        Self::ValidationFailed(fields)
    }

    pub(crate) fn backing_store(sql: &str, params: usize, source: rusqlite::Error) -> Self {
        Self::BackingStore { statement: statement_shape(sql), params, source }
    }
}

/// Longest statement excerpt kept in error messages.
const STATEMENT_EXCERPT: usize = 80;

fn statement_shape(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(STATEMENT_EXCERPT) {
        Some((cut, _)) => format!("{}...", &collapsed[..cut]),
        None => collapsed,
    }
}

/// Errors specific to master key providers.
#[derive(Debug)]
pub enum KeyProviderError {
    /// Key material not found
    NotFound(String),

    /// Key material present but unusable
    InvalidKey(String),

    /// Key creation failed
    CreationFailed(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(location) => write!(f, "master key not found: {location}"),
            Self::InvalidKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::CreationFailed(msg) => write!(f, "master key creation failed: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
