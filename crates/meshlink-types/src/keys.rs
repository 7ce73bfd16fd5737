//! Curve25519 Node Identity Keys
//!
//! Every node is identified by a Curve25519 public key. The coordinator and
//! relay treat public keys as opaque 32-byte values with a base64 text form;
//! the raw byte form doubles as the relay frame address header.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{TypesError, TypesResult};

/// Length of raw public and private keys in bytes
pub const KEY_LEN: usize = 32;

/// A Curve25519 public key identifying a node
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey {
    bytes: [u8; KEY_LEN],
}

/// A Curve25519 private key; zeroized on drop, never compared
#[derive(Clone, ZeroizeOnDrop)]
pub struct PrivateKey {
    bytes: [u8; KEY_LEN],
}

impl PrivateKey {
    /// Generate a new random private key (clamped)
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        // Curve25519 scalar clamp
        bytes[0] &= 248;
        bytes[31] = (bytes[31] & 127) | 64;
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Derive the corresponding public key via scalar base multiplication
    pub fn public(&self) -> PublicKey {
        let secret = StaticSecret::from(self.bytes);
        PublicKey {
            bytes: X25519Public::from(&secret).to_bytes(),
        }
    }

    /// Export raw bytes (use with caution!)
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.bytes
    }

    /// True iff all key bytes are zero
    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; KEY_LEN]
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Try to create from a raw byte slice
    pub fn try_from_slice(slice: &[u8]) -> TypesResult<Self> {
        if slice.len() != KEY_LEN {
            return Err(TypesError::InvalidKeyLength(slice.len()));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Cloned raw byte form, used as the relay frame address header
    pub fn raw(&self) -> [u8; KEY_LEN] {
        self.bytes
    }

    /// True iff all key bytes are zero
    pub fn is_zero(&self) -> bool {
        self.bytes == [0u8; KEY_LEN]
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.bytes))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", &BASE64.encode(&self.bytes[..4]))
    }
}

impl FromStr for PublicKey {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = BASE64.decode(s)?;
        Self::try_from_slice(&decoded)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.bytes))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.bytes))
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let decoded = BASE64.decode(text.as_bytes()).map_err(serde::de::Error::custom)?;
        if decoded.len() != KEY_LEN {
            return Err(serde::de::Error::custom(TypesError::InvalidKeyLength(
                decoded.len(),
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }
}
