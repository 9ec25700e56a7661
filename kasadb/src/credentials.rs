//! SCRAM-style password credentials.
//!
//! A password is stretched with PBKDF2 and reduced to the two values a SCRAM
//! server keeps:
//!
//! ```text
//! key        = PBKDF2(kdf_hash, password, salt, iterations)
//! server_key = HMAC(scram_hash, key, "Server Key")
//! stored_key = H(scram_hash, HMAC(scram_hash, key, "Client Key"))
//! ```
//!
//! Neither `key` nor the client key leave this module.

use crate::attributes::Attributes;
use crate::db::Transaction;
use crate::error::{Error, Result};
use crate::store::{ValidationContext, Validator};
use aes_gcm::aead::{rand_core::RngCore, OsRng};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// Entity kind whose `password` attribute is turned into a record.
pub const CREDENTIALS_KIND: &str = "credentials";

const SERVER_KEY_LABEL: &[u8] = b"Server Key";
const CLIENT_KEY_LABEL: &[u8] = b"Client Key";

/// Runs `$body` with `$digest` bound to the hash type of `$alg`.
macro_rules! with_digest {
    ($alg:expr, $digest:ident => $body:expr) => {
        match $alg {
            HashAlgorithm::Sha1 => {
                type $digest = sha1::Sha1;
                $body
            }
            HashAlgorithm::Sha256 => {
                type $digest = sha2::Sha256;
                $body
            }
            HashAlgorithm::Sha384 => {
                type $digest = sha2::Sha384;
                $body
            }
            HashAlgorithm::Sha512 => {
                type $digest = sha2::Sha512;
                $body
            }
        }
    };
}

/// Hash functions usable for the KDF and for SCRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[serde(rename = "SHA-1")]
    Sha1,
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-384")]
    Sha384,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl HashAlgorithm {
    /// Digest size in bytes.
    #[must_use]
    pub const fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Canonical name, as serialized.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    fn hmac(self, key: &[u8], message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        with_digest!(self, D => {
            let mut mac = <Hmac<D> as Mac>::new_from_slice(key)
                .map_err(|e| Error::EncryptionFailed(format!("HMAC key rejected: {e}")))?;
            mac.update(message);
            Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
        })
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        with_digest!(self, D => D::digest(data).to_vec())
    }

    fn pbkdf2(self, password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
        with_digest!(self, D => pbkdf2::pbkdf2_hmac::<D>(password, salt, iterations, out));
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key derivation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "PBKDF2")]
    Pbkdf2,
}

/// Parameters the derived key was produced with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfSpec {
    pub algorithm: KdfAlgorithm,
    pub hash: HashAlgorithm,
    pub iterations: u32,
    pub derived_key_length: usize,
}

impl KdfSpec {
    /// PBKDF2 over `hash`, deriving one digest worth of key material.
    #[must_use]
    pub const fn pbkdf2(hash: HashAlgorithm, iterations: u32) -> Self {
        Self { algorithm: KdfAlgorithm::Pbkdf2, hash, iterations, derived_key_length: hash.output_len() }
    }

    /// Rejects a derived key length other than one digest of `hash`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ValidationFailed` naming `derivedKeyLength`.
    pub fn check(&self) -> Result<()> {
        let expected = self.hash.output_len();
        if self.derived_key_length != expected {
            return Err(Error::validation(
                "derivedKeyLength",
                format!("must be {expected} for {}", self.hash),
            ));
        }
        Ok(())
    }
}

impl Default for KdfSpec {
    fn default() -> Self {
        Self::pbkdf2(HashAlgorithm::Sha1, DEFAULT_ITERATIONS)
    }
}

/// What a server stores to verify a password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub kdf_spec: KdfSpec,
    /// SCRAM hash used for the server and stored keys
    pub hash: HashAlgorithm,
    #[serde(with = "base64_bytes")]
    pub server_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stored_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

impl CredentialRecord {
    /// Reads a record out of an attribute map holding its fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if a field is missing or malformed, and
    /// `Error::ValidationFailed` for an inconsistent KDF spec.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self> {
        let record: Self = serde_json::from_value(Value::Object(attributes.clone()))?;
        record.kdf_spec.check()?;
        Ok(record)
    }

    /// Checks `password` against the stored key in constant time.
    ///
    /// # Errors
    ///
    /// Returns `Error::ValidationFailed` if the KDF spec asks for a derived
    /// key of the wrong length, or an error if the HMAC cannot be computed.
    pub fn verify(&self, password: &str) -> Result<bool> {
        self.kdf_spec.check()?;
        if self.kdf_spec.iterations == 0 {
            return Ok(false);
        }
        let (_, stored_key) = scram_keys(password, &self.kdf_spec, self.hash, &self.salt)?;
        Ok(stored_key.as_slice().ct_eq(self.stored_key.as_slice()).into())
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("kdf_spec", &self.kdf_spec)
            .field("hash", &self.hash)
            .field("server_key", &"[REDACTED]")
            .field("stored_key", &"[REDACTED]")
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Strength floors applied when deriving credentials.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CredentialPolicy {
    min_password_bytes: usize,
    min_iterations: u32,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self { min_password_bytes: 6, min_iterations: 5_000 }
    }
}

impl CredentialPolicy {
    /// Sets the minimum password length in UTF-8 bytes.
    #[must_use]
    pub const fn with_min_password_bytes(mut self, bytes: usize) -> Self {
        self.min_password_bytes = bytes;
        self
    }

    /// Sets the iteration floor. Values below 1 are raised to 1.
    #[must_use]
    pub fn with_min_iterations(mut self, iterations: u32) -> Self {
        self.min_iterations = iterations.max(1);
        self
    }

    /// Derives a record with a fresh random salt.
    ///
    /// # Errors
    ///
    /// Returns `Error::WeakSecret` for a short password and `Error::WeakKdf`
    /// for too few iterations.
    pub fn derive(
        &self,
        password: &str,
        kdf_hash: HashAlgorithm,
        iterations: u32,
        scram_hash: HashAlgorithm,
    ) -> Result<CredentialRecord> {
        let kdf_spec = KdfSpec::pbkdf2(kdf_hash, iterations);
        let mut salt = vec![0u8; kdf_hash.output_len()];
        OsRng.fill_bytes(&mut salt);
        self.derive_with_salt(password, &kdf_spec, scram_hash, salt)
    }

    /// Derives a record from a known salt, e.g. to re-check a stored one.
    ///
    /// # Errors
    ///
    /// Same as [`derive`](Self::derive), plus `Error::ValidationFailed` for a
    /// KDF spec that fails [`KdfSpec::check`].
    pub fn derive_with_salt(
        &self,
        password: &str,
        kdf_spec: &KdfSpec,
        scram_hash: HashAlgorithm,
        salt: Vec<u8>,
    ) -> Result<CredentialRecord> {
        kdf_spec.check()?;
        if password.len() < self.min_password_bytes {
            return Err(Error::WeakSecret { minimum: self.min_password_bytes });
        }
        if kdf_spec.iterations < self.min_iterations {
            return Err(Error::WeakKdf { iterations: kdf_spec.iterations, minimum: self.min_iterations });
        }

        let (server_key, stored_key) = scram_keys(password, kdf_spec, scram_hash, &salt)?;
        Ok(CredentialRecord {
            kdf_spec: kdf_spec.clone(),
            hash: scram_hash,
            server_key: server_key.to_vec(),
            stored_key,
            salt,
        })
    }
}

/// Derives a record with the default policy and parameters
/// (PBKDF2-SHA-1, 100 000 iterations, SCRAM over SHA-256).
///
/// # Errors
///
/// Returns `Error::WeakSecret` if the password is shorter than 6 bytes.
///
/// # Example
///
/// ```
/// let record = kasadb::credentials::derive("correct horse").unwrap();
/// assert_eq!(record.salt.len(), 20);
/// assert!(record.verify("correct horse").unwrap());
/// ```
pub fn derive(password: &str) -> Result<CredentialRecord> {
    CredentialPolicy::default().derive(password, HashAlgorithm::Sha1, DEFAULT_ITERATIONS, HashAlgorithm::Sha256)
}

fn scram_keys(
    password: &str,
    kdf_spec: &KdfSpec,
    scram_hash: HashAlgorithm,
    salt: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>)> {
    let mut key = Zeroizing::new(vec![0u8; kdf_spec.derived_key_length]);
    kdf_spec.hash.pbkdf2(password.as_bytes(), salt, kdf_spec.iterations, &mut key);

    let server_key = scram_hash.hmac(&key, SERVER_KEY_LABEL)?;
    let client_key = scram_hash.hmac(&key, CLIENT_KEY_LABEL)?;
    Ok((server_key, scram_hash.digest(&client_key)))
}

/// Validator replacing the `password` attribute of credentials entities with
/// the fields of a [`CredentialRecord`].
///
/// Inserts must carry a `password`. An update without one must still hold a
/// well-formed record. Other kinds pass through untouched.
#[derive(Debug, Clone)]
pub struct CredentialsValidator {
    policy: CredentialPolicy,
    kdf_hash: HashAlgorithm,
    iterations: u32,
    scram_hash: HashAlgorithm,
}

impl Default for CredentialsValidator {
    fn default() -> Self {
        Self {
            policy: CredentialPolicy::default(),
            kdf_hash: HashAlgorithm::Sha1,
            iterations: DEFAULT_ITERATIONS,
            scram_hash: HashAlgorithm::Sha256,
        }
    }
}

impl CredentialsValidator {
    /// Sets the strength floors checked before deriving.
    #[must_use]
    pub const fn with_policy(mut self, policy: CredentialPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the PBKDF2 hash and iteration count for new records.
    #[must_use]
    pub const fn with_kdf(mut self, hash: HashAlgorithm, iterations: u32) -> Self {
        self.kdf_hash = hash;
        self.iterations = iterations;
        self
    }

    /// Sets the hash used for the server and stored keys.
    #[must_use]
    pub const fn with_scram_hash(mut self, hash: HashAlgorithm) -> Self {
        self.scram_hash = hash;
        self
    }
}

#[async_trait]
impl Validator for CredentialsValidator {
    async fn validate(
        &self,
        _tx: &Transaction,
        ctx: &ValidationContext<'_>,
        mut attributes: Attributes,
    ) -> Result<Attributes> {
        if ctx.kind != CREDENTIALS_KIND {
            return Ok(attributes);
        }

        match attributes.remove("password") {
            Some(Value::String(password)) => {
                let password = Zeroizing::new(password);
                let record =
                    self.policy.derive(&password, self.kdf_hash, self.iterations, self.scram_hash)?;
                if let Value::Object(fields) = serde_json::to_value(record)? {
                    attributes.extend(fields);
                }
                Ok(attributes)
            }
            Some(_) => Err(Error::validation("password", "must be a string")),
            // An update may leave the stored record as it is.
            None if ctx.uuid.is_some() => match CredentialRecord::from_attributes(&attributes) {
                Ok(_) => Ok(attributes),
                Err(_) => Err(Error::validation("password", "is required")),
            },
            None => Err(Error::validation("password", "is required")),
        }
    }
}
