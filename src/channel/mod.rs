//! # Channel Keys
//!
//! A channel is a named pre-shared key (PSK) that one slice of the mesh encrypts with.
//! The dashboard can hold any number of them; each packet is tried against the
//! enabled keys in priority order until one decrypts it.
//!
//! ## PSK formats
//!
//! Keys arrive from the store as raw bytes. When they are entered by an operator they
//! are usually in the base64 form shown by the Meshtastic apps:
//!
//! - 16 bytes → AES-128
//! - 32 bytes → AES-256
//! - 1 byte → shorthand index into the well-known default key (`AQ==` is the stock
//!   `LongFast` key); index `n` replaces the last key byte with `0x01 + n - 1`
//!
//! Anything else is rejected by [`parse_psk`].

pub mod cache;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::DecryptError;

pub use cache::{KeyCache, RefreshOutcome, DEFAULT_KEY_CACHE_TTL_MS};

/// Store-assigned channel identifier.
pub type ChannelId = u64;

/// Meshtastic's published default channel key, used by the one-byte PSK shorthand.
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69,
    0x01,
];

/// Declared key size of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyLength {
    Aes128,
    Aes256,
}

impl KeyLength {
    pub fn bits(self) -> u16 {
        match self {
            KeyLength::Aes128 => 128,
            KeyLength::Aes256 => 256,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// Length class matching a raw key size, if any.
    pub fn for_key_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(KeyLength::Aes128),
            32 => Some(KeyLength::Aes256),
            _ => None,
        }
    }
}

/// A configured decryption candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKey {
    pub id: ChannelId,
    pub name: String,
    pub key: Vec<u8>,
    pub key_length: KeyLength,
    pub enabled: bool,
    /// Lower values are tried first; ties fall back to `id`.
    pub sort_order: i32,
    #[serde(default)]
    pub decrypted_packet_count: u64,
    #[serde(default)]
    pub last_decrypted_at: Option<DateTime<Utc>>,
}

impl ChannelKey {
    /// Build an enabled key, deriving the length class from the key bytes.
    pub fn new(
        id: ChannelId,
        name: impl Into<String>,
        key: Vec<u8>,
        sort_order: i32,
    ) -> Result<Self, ChannelKeyError> {
        let key_length =
            KeyLength::for_key_len(key.len()).ok_or(ChannelKeyError::BadLength(key.len()))?;
        Ok(Self {
            id,
            name: name.into(),
            key,
            key_length,
            enabled: true,
            sort_order,
            decrypted_packet_count: 0,
            last_decrypted_at: None,
        })
    }

    /// Check that the key bytes agree with the declared length class.
    pub fn validate(&self) -> Result<(), DecryptError> {
        if self.key.len() != self.key_length.bytes() {
            return Err(DecryptError::MalformedKeyConfiguration {
                channel_id: self.id,
                declared_bits: self.key_length.bits(),
                actual: self.key.len(),
            });
        }
        Ok(())
    }

    /// Short, non-reversible identifier safe to put in logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.key);
        hex::encode(&digest[..4])
    }

    /// Meshtastic channel hash: XOR of the name bytes XOR the key bytes.
    ///
    /// Radios put this in the clear `channel` field of an encrypted packet.
    pub fn channel_hash(&self) -> u8 {
        let xor = |bytes: &[u8]| bytes.iter().fold(0u8, |acc, b| acc ^ b);
        xor(self.name.as_bytes()) ^ xor(&self.key)
    }
}

/// PSK parsing failures.
#[derive(Debug, thiserror::Error)]
pub enum ChannelKeyError {
    #[error("PSK is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PSK must be 16 or 32 bytes (or a 1-byte default-key index), got {0}")]
    BadLength(usize),

    #[error("PSK index 0 means no encryption and cannot be used as a channel key")]
    Unencrypted,
}

/// Decode an operator-supplied base64 PSK into raw AES key bytes.
pub fn parse_psk(encoded: &str) -> Result<Vec<u8>, ChannelKeyError> {
    let raw = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
    match raw.len() {
        16 | 32 => Ok(raw),
        1 => expand_psk_index(raw[0]),
        n => Err(ChannelKeyError::BadLength(n)),
    }
}

fn expand_psk_index(index: u8) -> Result<Vec<u8>, ChannelKeyError> {
    if index == 0 {
        return Err(ChannelKeyError::Unencrypted);
    }
    let mut key = DEFAULT_PSK.to_vec();
    key[15] = DEFAULT_PSK[15].wrapping_add(index - 1);
    Ok(key)
}
