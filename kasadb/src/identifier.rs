//! 128-bit identifiers with RFC 4122 semantics.
//!
//! Every entity, key and blind index token is an [`Identifier`]. Besides the
//! random v4 form used for new entities, the deterministic namespace-hash
//! constructors (v3/v5) are what make blind index tokens stable across
//! processes.

use crate::error::Error;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};
use std::str::FromStr;
use uuid::Uuid;

/// Length of the canonical hyphenated form.
const CANONICAL_LEN: usize = 36;

/// Variant field of an identifier (RFC 4122 section 4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// `0xx`: reserved for NCS backward compatibility.
    NcsReserved,
    /// `10x`: the RFC 4122 layout.
    Rfc4122,
    /// `110`: reserved for Microsoft backward compatibility.
    MicrosoftReserved,
    /// `111`: reserved for future definition.
    Reserved,
}

/// An immutable 128-bit identifier.
///
/// Equality is byte-exact. The string form is always lower-case and
/// hyphenated at byte offsets 4-2-2-2-6.
///
/// # Example
///
/// ```
/// use kasadb::identifier::Identifier;
///
/// let ns = Identifier::new_v4();
/// let a = Identifier::new_v5(&ns, b"alice");
/// let b = Identifier::new_v5(&ns, b"alice");
/// assert_eq!(a, b);
/// assert_eq!(a.version(), Some(5));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(Uuid);

impl Identifier {
    /// The all-zero identifier.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Creates an identifier from its 16 raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Creates an identifier from a slice that must be exactly 16 bytes long.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentifier` for any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidIdentifier(format!("expected 16 bytes, got {}", bytes.len())))
    }

    /// Parses the canonical hyphenated form.
    ///
    /// Braced, URN and unhyphenated spellings are rejected.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentifier` if the input is not canonical.
    pub fn parse(input: &str) -> Result<Self, Error> {
        if input.len() != CANONICAL_LEN {
            return Err(Error::InvalidIdentifier(format!(
                "expected {CANONICAL_LEN} characters, got {}",
                input.len()
            )));
        }
        Uuid::try_parse(input)
            .map(Self)
            .map_err(|e| Error::InvalidIdentifier(e.to_string()))
    }

    /// Random (version 4) identifier.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name-based identifier using MD5 (version 3).
    #[must_use]
    pub fn new_v3(namespace: &Self, name: &[u8]) -> Self {
        Self(Uuid::new_v3(&namespace.0, name))
    }

    /// Name-based identifier using SHA-1 truncated to 16 bytes (version 5).
    #[must_use]
    pub fn new_v5(namespace: &Self, name: &[u8]) -> Self {
        Self(Uuid::new_v5(&namespace.0, name))
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Returns the variant encoded in the top bits of byte 8.
    #[must_use]
    pub const fn variant(&self) -> Variant {
        let byte = self.0.as_bytes()[8];
        if byte & 0x80 == 0 {
            Variant::NcsReserved
        } else if byte & 0xc0 == 0x80 {
            Variant::Rfc4122
        } else if byte & 0xe0 == 0xc0 {
            Variant::MicrosoftReserved
        } else {
            Variant::Reserved
        }
    }

    /// Returns the version nibble, defined only for the RFC 4122 variant.
    #[must_use]
    pub const fn version(&self) -> Option<u8> {
        match self.variant() {
            Variant::Rfc4122 => Some(self.0.as_bytes()[6] >> 4),
            _ => None,
        }
    }

    fn zip_with(self, other: Self, op: impl Fn(u8, u8) -> u8) -> Self {
        let mut out = [0u8; 16];
        for ((o, a), b) in out.iter_mut().zip(self.as_bytes()).zip(other.as_bytes()) {
            *o = op(*a, *b);
        }
        Self::from_bytes(out)
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.0.hyphenated())
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<[u8; 16]> for Identifier {
    fn from(bytes: [u8; 16]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Uuid> for Identifier {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl BitAnd for Identifier {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a & b)
    }
}

impl BitOr for Identifier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a | b)
    }
}

impl BitXor for Identifier {
    type Output = Self;

    fn bitxor(self, rhs: Self) -> Self {
        self.zip_with(rhs, |a, b| a ^ b)
    }
}

impl Not for Identifier {
    type Output = Self;

    fn not(self) -> Self {
        let mut out = *self.as_bytes();
        for byte in &mut out {
            *byte = !*byte;
        }
        Self::from_bytes(out)
    }
}

impl ToSql for Identifier {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Blob(&self.as_bytes()[..])))
    }
}

impl FromSql for Identifier {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        Uuid::from_slice(blob)
            .map(Self)
            .map_err(|_| FromSqlError::InvalidBlobSize { expected_size: 16, blob_size: blob.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // RFC 4122 appendix C namespace for DNS names
    const NAMESPACE_DNS: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";

    #[test]
    fn test_v3_known_vector() {
        let ns = Identifier::parse(NAMESPACE_DNS).unwrap();
        let id = Identifier::new_v3(&ns, b"python.org");
        assert_eq!(id.to_string(), "6fa459ea-ee8a-3ca4-894e-db77e160355e");
        assert_eq!(id.version(), Some(3));
        assert_eq!(id.variant(), Variant::Rfc4122);
    }

    #[test]
    fn test_v5_known_vector() {
        let ns = Identifier::parse(NAMESPACE_DNS).unwrap();
        let id = Identifier::new_v5(&ns, b"python.org");
        assert_eq!(id.to_string(), "886313e1-3b8a-5372-9b90-0c9aee199e5d");
        assert_eq!(id.version(), Some(5));
    }

    #[test]
    fn test_v5_deterministic_and_sensitive() {
        let ns = Identifier::new_v4();
        let other_ns = Identifier::new_v4();
        let a = Identifier::new_v5(&ns, b"email:alice@example.com");

        assert_eq!(a, Identifier::new_v5(&ns, b"email:alice@example.com"));
        assert_ne!(a, Identifier::new_v5(&ns, b"email:bob@example.com"));
        assert_ne!(a, Identifier::new_v5(&other_ns, b"email:alice@example.com"));
    }

    #[test]
    fn test_v4_bits() {
        let id = Identifier::new_v4();
        assert_eq!(id.variant(), Variant::Rfc4122);
        assert_eq!(id.version(), Some(4));
        assert_ne!(id, Identifier::new_v4());
    }

    #[test]
    fn test_variants() {
        let mut bytes = [0u8; 16];
        assert_eq!(Identifier::from_bytes(bytes).variant(), Variant::NcsReserved);
        assert_eq!(Identifier::from_bytes(bytes).version(), None);

        bytes[8] = 0xc0;
        assert_eq!(Identifier::from_bytes(bytes).variant(), Variant::MicrosoftReserved);

        bytes[8] = 0xe0;
        assert_eq!(Identifier::from_bytes(bytes).variant(), Variant::Reserved);

        bytes[8] = 0x80;
        bytes[6] = 0xf0;
        assert_eq!(Identifier::from_bytes(bytes).version(), Some(15));
    }

    #[test]
    fn test_canonical_string() {
        let bytes = hex::decode("00112233445566778899AABBCCDDEEFF").unwrap();
        let id = Identifier::from_slice(&bytes).unwrap();
        assert_eq!(id.to_string(), "00112233-4455-6677-8899-aabbccddeeff");
    }

    #[test]
    fn test_parse_rejects_non_canonical() {
        assert!(Identifier::parse("not-a-uuid").is_err());
        assert!(Identifier::parse("00112233445566778899aabbccddeeff").is_err());
        assert!(Identifier::parse("{00112233-4455-6677-8899-aabbccddeeff}").is_err());
        assert!(Identifier::parse("0011223x-4455-6677-8899-aabbccddeeff").is_err());
        assert!(Identifier::parse("00112233-4455-6677-8899-AABBCCDDEEFF").is_ok());
    }

    #[test]
    fn test_from_slice_length() {
        assert!(matches!(Identifier::from_slice(&[0u8; 15]), Err(Error::InvalidIdentifier(_))));
    }

    #[test]
    fn test_bitwise_operators() {
        let a = Identifier::from_bytes([0b1100; 16]);
        let b = Identifier::from_bytes([0b1010; 16]);

        assert_eq!((a & b).as_bytes(), &[0b1000; 16]);
        assert_eq!((a | b).as_bytes(), &[0b1110; 16]);
        assert_eq!((a ^ b).as_bytes(), &[0b0110; 16]);
        assert_eq!((!a).as_bytes(), &[!0b1100u8; 16]);
        assert_eq!(a ^ a, Identifier::nil());
    }

    #[test]
    fn test_serde_as_string() {
        let id = Identifier::parse(NAMESPACE_DNS).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{NAMESPACE_DNS}\""));
        assert_eq!(serde_json::from_str::<Identifier>(&json).unwrap(), id);
    }

    proptest! {
        #[test]
        fn prop_string_round_trip(bytes in any::<[u8; 16]>()) {
            let id = Identifier::from_bytes(bytes);
            let parsed = Identifier::parse(&id.to_string()).unwrap();
            prop_assert_eq!(parsed, id);
            prop_assert_eq!(id.to_string().len(), CANONICAL_LEN);
        }
    }
}
