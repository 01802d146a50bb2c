//! AES-CTR channel cipher and structural validation of the plaintext.
//!
//! Meshtastic channel encryption has no MAC. The only evidence that a key is right is
//! that the output decodes as a `Data` frame naming a known application port, so
//! [`validate_plaintext`] is deliberately strict.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use prost::Message;

use crate::protobuf::{Data, PortNum};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Shortest ciphertext that could hold a `Data` frame (portnum tag + value).
pub const MIN_FRAME_LEN: usize = 2;

/// Counter block: packet id as little-endian u64, sender node as little-endian u32,
/// then four zero bytes for the block counter.
pub fn build_nonce(packet_id: u32, from_node: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    nonce[8..12].copy_from_slice(&from_node.to_le_bytes());
    nonce
}

/// Run the channel keystream over `data`. CTR mode is symmetric, so this both
/// encrypts and decrypts. Returns `None` for key sizes other than 16 or 32 bytes.
pub fn apply_channel_cipher(
    key: &[u8],
    packet_id: u32,
    from_node: u32,
    data: &[u8],
) -> Option<Vec<u8>> {
    let nonce = build_nonce(packet_id, from_node);
    let mut out = data.to_vec();
    match key.len() {
        16 => Aes128Ctr::new_from_slices(key, &nonce)
            .ok()?
            .apply_keystream(&mut out),
        32 => Aes256Ctr::new_from_slices(key, &nonce)
            .ok()?
            .apply_keystream(&mut out),
        _ => return None,
    }
    Some(out)
}

/// A plaintext that passed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedFrame {
    pub portnum: PortNum,
    pub data: Data,
}

/// Accept only plaintext that decodes as `Data` with a known, real application port.
pub fn validate_plaintext(plain: &[u8]) -> Option<ValidatedFrame> {
    if plain.len() < MIN_FRAME_LEN {
        return None;
    }
    let data = Data::decode(plain).ok()?;
    let portnum = PortNum::try_from(data.portnum).ok()?;
    if !portnum.is_application() {
        return None;
    }
    Some(ValidatedFrame { portnum, data })
}

/// Decrypt with one key and validate. `None` when the key does not fit this packet.
pub fn decrypt_with_key(
    key: &[u8],
    packet_id: u32,
    from_node: u32,
    ciphertext: &[u8],
) -> Option<ValidatedFrame> {
    if ciphertext.len() < MIN_FRAME_LEN {
        return None;
    }
    let plain = apply_channel_cipher(key, packet_id, from_node, ciphertext)?;
    validate_plaintext(&plain)
}
