use crate::envelope::{self, Payload};
use crate::error::Error;
use crate::identifier::Identifier;
use aes_gcm::aead::{rand_core::RngCore, OsRng};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;
use subtle::ConstantTimeEq;

/// Key size in bytes (256 bits), for both master and data keys.
pub const KEY_SIZE: usize = 32;

fn random_secret() -> SecretVec<u8> {
    let mut bytes = vec![0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut bytes);
    SecretVec::new(bytes)
}

/// The master key wrapping every data-encryption key.
///
/// Established once at startup and never rotated at runtime.
pub struct MasterKey(SecretVec<u8>);

impl MasterKey {
    /// Creates a master key from exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidMasterKey` for any other length.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        if bytes.len() != KEY_SIZE {
            return Err(Error::InvalidMasterKey(bytes.len()));
        }
        Ok(Self(SecretVec::new(bytes)))
    }

    /// Generates a random master key.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_secret())
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl Clone for MasterKey {
    fn clone(&self) -> Self {
        Self(SecretVec::new(self.0.expose_secret().clone()))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// A data-encryption key (DEK).
///
/// Immutable once constructed: deleting a key produces a new instance with
/// `deleted_at` set. Deleted keys still decrypt historical data but are never
/// chosen for new encryption.
pub struct EncryptionKey {
    id: Identifier,
    secret: SecretVec<u8>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl EncryptionKey {
    /// Builds a key from existing secret material.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the material is not 32 bytes,
    /// which is how a wrongly unwrapped key shows up.
    pub fn from_secret(
        id: Identifier,
        secret: SecretVec<u8>,
        created_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Result<Self, Error> {
        if secret.expose_secret().len() != KEY_SIZE {
            return Err(Error::DecryptionFailed(format!("key {id} has invalid size")));
        }
        Ok(Self { id, secret, created_at, deleted_at })
    }

    pub(crate) fn generate(id: Identifier, created_at: DateTime<Utc>) -> Self {
        Self { id, secret: random_secret(), created_at, deleted_at: None }
    }

    /// Returns the key identifier.
    #[must_use]
    pub const fn id(&self) -> Identifier {
        self.id
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the soft-delete time, if any.
    #[must_use]
    pub const fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    /// Whether the key has been soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Encrypts a payload into an envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::EncryptionFailed` if encryption fails.
    pub fn encrypt(&self, payload: &Payload) -> Result<Vec<u8>, Error> {
        envelope::encrypt(self.secret.expose_secret(), payload)
    }

    /// Decrypts an envelope.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the envelope is malformed or was
    /// not produced by this key.
    pub fn decrypt(&self, data: &[u8]) -> Result<Payload, Error> {
        envelope::decrypt(self.secret.expose_secret(), data)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.secret.expose_secret()
    }

    pub(crate) fn deleted(&self, at: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            secret: SecretVec::new(self.secret.expose_secret().clone()),
            created_at: self.created_at,
            deleted_at: Some(at),
        }
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.secret.expose_secret().as_slice().ct_eq(other.secret.expose_secret().as_slice()).into()
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("deleted_at", &self.deleted_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_key_size() {
        assert!(MasterKey::from_bytes(vec![0u8; 32]).is_ok());
        assert!(matches!(MasterKey::from_bytes(vec![0u8; 16]), Err(Error::InvalidMasterKey(16))));
    }

    #[test]
    fn test_equality_compares_secret_not_id() {
        let now = Utc::now();
        let a = EncryptionKey::from_secret(Identifier::new_v4(), SecretVec::new(vec![1u8; 32]), now, None)
            .unwrap();
        let b = EncryptionKey::from_secret(Identifier::new_v4(), SecretVec::new(vec![1u8; 32]), now, None)
            .unwrap();
        let c = EncryptionKey::generate(a.id(), now);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_deleted_copy_keeps_material() {
        let key = EncryptionKey::generate(Identifier::new_v4(), Utc::now());
        let envelope = key.encrypt(&Payload::from("history")).unwrap();

        let deleted = key.deleted(Utc::now());
        assert!(deleted.is_deleted());
        assert!(!key.is_deleted());
        assert_eq!(deleted, key);
        assert_eq!(deleted.decrypt(&envelope).unwrap(), Payload::from("history"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = EncryptionKey::from_secret(
            Identifier::nil(),
            SecretVec::new(vec![0xab; 32]),
            Utc::now(),
            None,
        )
        .unwrap();
        let debug = format!("{key:?} {:?}", MasterKey::generate());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn test_invalid_secret_size() {
        let result =
            EncryptionKey::from_secret(Identifier::nil(), SecretVec::new(vec![0u8; 31]), Utc::now(), None);
        assert!(matches!(result, Err(Error::DecryptionFailed(_))));
    }
}
