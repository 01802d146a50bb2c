//! # Storage Module - Packet & Channel Store Contract
//!
//! The decryption engine does not own persistence. It talks to whatever holds packets
//! and channel configuration through the [`PacketStore`] trait, which covers exactly
//! the four operations the engine needs:
//!
//! - [`PacketStore::fetch_enabled_channel_keys`] - key material for the key cache
//! - [`PacketStore::fetch_encrypted_undecrypted_packets`] - reprocessing candidates
//! - [`PacketStore::mark_packet_decrypted`] - terminal write for a solved packet
//! - [`PacketStore::increment_channel_decrypt_stats`] - per-channel counters
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`] - in-process maps, used by tests and embedders
//! - [`SledStore`] - embedded sled database, used by the `meshdecrypt` binary
//!
//! ## Idempotency
//!
//! Implementations must only return records whose `decrypted_by` marker is unset, in
//! ascending record id order, and must set the marker in the same write that replaces
//! the metadata. That write is conditional: a record whose marker is already set is
//! left alone and the call reports `Ok(false)`, so a record fetched into a batch and
//! solved elsewhere before the batch reaches it is never rewritten or counted twice.

pub mod memory;
pub mod sled_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelId, ChannelKey};
use crate::errors::StoreError;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// Store-assigned packet record identifier.
pub type RecordId = u64;

/// Metadata key holding the hex-encoded ciphertext of an unsolved packet.
pub const META_ENCRYPTED_PAYLOAD: &str = "encrypted_payload";
/// Metadata key written once a packet has been decrypted.
pub const META_DECRYPTED: &str = "decrypted";

/// Who decrypted a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecryptedBy {
    /// The receiving radio decrypted it before handing it over.
    Node,
    /// This engine decrypted it, live or during reprocessing.
    Server,
}

impl DecryptedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            DecryptedBy::Node => "node",
            DecryptedBy::Server => "server",
        }
    }
}

/// A stored packet whose payload could not be decoded at receipt time.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedPacketRecord {
    pub id: RecordId,
    /// Mesh packet id; forms the low 8 bytes of the AES-CTR counter block.
    pub packet_id: u32,
    pub from_node: u32,
    pub encrypted_payload: Vec<u8>,
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub decrypted_by: Option<DecryptedBy>,
    pub decrypted_channel_id: Option<ChannelId>,
    pub portnum: Option<i32>,
}

impl EncryptedPacketRecord {
    /// A freshly received, undecryptable packet. The ciphertext is also copied into the
    /// metadata blob, which is how the dashboard keeps it alongside receipt context.
    pub fn new(id: RecordId, packet_id: u32, from_node: u32, encrypted_payload: Vec<u8>) -> Self {
        let metadata = serde_json::json!({
            META_ENCRYPTED_PAYLOAD: hex::encode(&encrypted_payload),
        });
        Self {
            id,
            packet_id,
            from_node,
            encrypted_payload,
            metadata,
            received_at: Utc::now(),
            decrypted_by: None,
            decrypted_channel_id: None,
            portnum: None,
        }
    }

    pub fn is_decrypted(&self) -> bool {
        self.decrypted_by.is_some()
    }
}

/// Access to the external packet & channel store.
#[async_trait]
pub trait PacketStore: Send + Sync {
    /// All enabled channel keys, in any order.
    async fn fetch_enabled_channel_keys(&self) -> Result<Vec<ChannelKey>, StoreError>;

    /// Up to `limit` records with no `decrypted_by` marker, ascending by record id.
    async fn fetch_encrypted_undecrypted_packets(
        &self,
        limit: usize,
    ) -> Result<Vec<EncryptedPacketRecord>, StoreError>;

    /// Set the decrypted markers and replace the metadata blob in one write, only if the
    /// record is still undecrypted. Returns whether the write happened.
    async fn mark_packet_decrypted(
        &self,
        record_id: RecordId,
        decrypted_by: DecryptedBy,
        channel_id: ChannelId,
        portnum: i32,
        updated_metadata: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Bump the channel's decrypted-packet counter and last-decrypted timestamp.
    async fn increment_channel_decrypt_stats(
        &self,
        channel_id: ChannelId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
