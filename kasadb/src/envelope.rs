//! Self-describing AEAD envelopes.
//!
//! Format:
//! ```text
//! [format:1][iv:12][tag:16][ciphertext:N]
//! ```
//!
//! The format byte tells the decryptor how to reinterpret the plaintext and is
//! also bound to the ciphertext as associated data, so flipping it fails
//! authentication.

use crate::attributes::Attributes;
use crate::error::Error;
use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use serde_json::Value;

/// IV size for AES-GCM (96 bits).
pub const IV_SIZE: usize = 12;

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

/// Size of everything but the ciphertext.
pub const OVERHEAD: usize = 1 + IV_SIZE + TAG_SIZE;

/// Smallest well-formed envelope: overhead plus one ciphertext byte.
pub const MIN_ENVELOPE_SIZE: usize = OVERHEAD + 1;

/// How decrypted bytes are reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Format {
    /// Raw bytes, returned as-is.
    Binary = 1,
    /// UTF-8 text.
    Text = 2,
    /// JSON document.
    Json = 3,
}

impl Format {
    /// Returns the wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Format {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Binary),
            2 => Ok(Self::Text),
            3 => Ok(Self::Json),
            other => Err(Error::DecryptionFailed(format!("unknown envelope format {other:#04x}"))),
        }
    }
}

/// Plaintext accepted by [`encrypt`] and produced by [`decrypt`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes.
    Binary(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// Structured value, serialized as JSON.
    Json(Value),
}

impl Payload {
    /// Returns the envelope format for this payload.
    #[must_use]
    pub const fn format(&self) -> Format {
        match self {
            Self::Binary(_) => Format::Binary,
            Self::Text(_) => Format::Text,
            Self::Json(_) => Format::Json,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Binary(bytes) => Ok(bytes.clone()),
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    fn from_bytes(format: Format, bytes: Vec<u8>) -> Result<Self, Error> {
        match format {
            Format::Binary => Ok(Self::Binary(bytes)),
            Format::Text => String::from_utf8(bytes)
                .map(Self::Text)
                .map_err(|_| Error::DecryptionFailed("text payload is not UTF-8".to_string())),
            Format::Json => serde_json::from_slice(&bytes)
                .map(Self::Json)
                .map_err(|_| Error::DecryptionFailed("JSON payload is malformed".to_string())),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Attributes> for Payload {
    fn from(attributes: Attributes) -> Self {
        Self::Json(Value::Object(attributes))
    }
}

/// Encrypts a payload under a 256-bit key.
///
/// A fresh random IV is drawn for every call.
///
/// # Errors
///
/// Returns `Error::EncryptionFailed` if the key is not 32 bytes, the
/// serialized payload is empty, or the cipher fails.
pub fn encrypt(key: &[u8], payload: &Payload) -> Result<Vec<u8>, Error> {
    let format = payload.format();
    let mut buffer = payload.to_bytes()?;
    if buffer.is_empty() {
        return Err(Error::EncryptionFailed("empty payload".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::EncryptionFailed(format!("invalid key: {e}")))?;

    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), &[format.as_u8()], &mut buffer)
        .map_err(|e| Error::EncryptionFailed(format!("AES-256-GCM encryption failed: {e}")))?;

    let mut envelope = Vec::with_capacity(OVERHEAD + buffer.len());
    envelope.push(format.as_u8());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&tag);
    envelope.extend_from_slice(&buffer);
    Ok(envelope)
}

/// Decrypts an envelope produced by [`encrypt`].
///
/// # Errors
///
/// Returns `Error::DecryptionFailed` if the envelope is too short, carries an
/// unknown format, fails authentication, or does not decode as its format.
pub fn decrypt(key: &[u8], envelope: &[u8]) -> Result<Payload, Error> {
    if envelope.len() < MIN_ENVELOPE_SIZE {
        return Err(Error::DecryptionFailed(format!(
            "envelope too short: {} bytes (min: {MIN_ENVELOPE_SIZE})",
            envelope.len()
        )));
    }

    let format = Format::try_from(envelope[0])?;
    let iv = &envelope[1..=IV_SIZE];
    let tag = &envelope[1 + IV_SIZE..OVERHEAD];
    let mut buffer = envelope[OVERHEAD..].to_vec();

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::DecryptionFailed(format!("invalid key: {e}")))?;

    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            &[format.as_u8()],
            &mut buffer,
            Tag::from_slice(tag),
        )
        .map_err(|_| Error::DecryptionFailed("authentication failed".to_string()))?;

    Payload::from_bytes(format, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const KEY: [u8; 32] = [42u8; 32];

    #[test]
    fn test_round_trip_all_formats() {
        let payloads = [
            Payload::Binary(vec![0, 1, 2, 255]),
            Payload::Text("alice@example.com".to_string()),
            Payload::Json(json!({"hello": "world", "nested": {"n": 1}})),
        ];

        for payload in payloads {
            let envelope = encrypt(&KEY, &payload).unwrap();
            assert_eq!(envelope[0], payload.format().as_u8());
            assert_eq!(decrypt(&KEY, &envelope).unwrap(), payload);
        }
    }

    #[test]
    fn test_layout() {
        let envelope = encrypt(&KEY, &Payload::from("abc")).unwrap();
        assert_eq!(envelope.len(), OVERHEAD + 3);
        assert_eq!(Format::try_from(envelope[0]).unwrap(), Format::Text);
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let payload = Payload::from("same plaintext");
        let a = encrypt(&KEY, &payload).unwrap();
        let b = encrypt(&KEY, &payload).unwrap();

        assert_ne!(a[1..=IV_SIZE], b[1..=IV_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(encrypt(&KEY, &Payload::Binary(vec![])), Err(Error::EncryptionFailed(_))));
        assert!(matches!(encrypt(&KEY, &Payload::from("")), Err(Error::EncryptionFailed(_))));
    }

    #[test]
    fn test_short_envelope_rejected() {
        let result = decrypt(&KEY, &[Format::Binary.as_u8(); MIN_ENVELOPE_SIZE - 1]);
        assert!(matches!(result, Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut envelope = encrypt(&KEY, &Payload::from("abc")).unwrap();
        envelope[0] = 0x7f;
        assert!(matches!(decrypt(&KEY, &envelope), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_format_bound_as_aad() {
        let mut envelope = encrypt(&KEY, &Payload::from("abc")).unwrap();
        envelope[0] = Format::Binary.as_u8();
        assert!(matches!(decrypt(&KEY, &envelope), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = encrypt(&KEY, &Payload::from("abc")).unwrap();
        assert!(matches!(decrypt(&[7u8; 32], &envelope), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_invalid_key_size() {
        assert!(matches!(encrypt(&[1u8; 16], &Payload::from("abc")), Err(Error::EncryptionFailed(_))));
    }

    proptest! {
        #[test]
        fn prop_tampering_detected(
            data in proptest::collection::vec(any::<u8>(), 1..256),
            position in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut envelope = encrypt(&KEY, &Payload::Binary(data)).unwrap();
            let index = 1 + position.index(envelope.len() - 1);
            envelope[index] ^= flip;
            prop_assert!(matches!(decrypt(&KEY, &envelope), Err(Error::DecryptionFailed(_))));
        }

        #[test]
        fn prop_text_round_trip(text in ".{1,64}") {
            let payload = Payload::Text(text);
            let envelope = encrypt(&KEY, &payload).unwrap();
            prop_assert_eq!(decrypt(&KEY, &envelope).unwrap(), payload);
        }
    }
}
