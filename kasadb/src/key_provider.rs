//! Master key provider abstraction.

use crate::error::KeyProviderError;
use crate::keys::MasterKey;

/// Supplies the master key that wraps every data-encryption key.
///
/// Implementations must be thread-safe (`Send + Sync`) so a provider can be
/// shared with whatever builds the [`KeyManager`](crate::keys::KeyManager).
///
/// # Example
///
/// ```rust,ignore
/// use kasadb::key_provider::MasterKeyProvider;
///
/// struct VaultProvider;
///
/// impl MasterKeyProvider for VaultProvider {
///     fn master_key(&self) -> Result<MasterKey, KeyProviderError> {
///         // Fetch from the secret manager
///     }
/// }
/// ```
pub trait MasterKeyProvider: Send + Sync {
    /// Returns the master key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::NotFound` if no key is configured and
    /// `KeyProviderError::InvalidKey` if the stored material is unusable.
    fn master_key(&self) -> Result<MasterKey, KeyProviderError>;
}

/// Provider over a key already held in memory.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: MasterKey,
}

impl StaticKeyProvider {
    /// Wraps an existing master key.
    #[must_use]
    pub const fn new(key: MasterKey) -> Self {
        Self { key }
    }
}

impl MasterKeyProvider for StaticKeyProvider {
    fn master_key(&self) -> Result<MasterKey, KeyProviderError> {
        Ok(self.key.clone())
    }
}
