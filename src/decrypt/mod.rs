//! # Decryption Core
//!
//! Figures out which configured channel key, if any, decrypts a packet.
//!
//! ## Live decryption
//!
//! [`Decryptor::try_decrypt`] walks the key cache in priority order and stops at the
//! first key whose plaintext passes structural validation. A match bumps that
//! channel's counters in the store; callers must therefore call it once per packet.
//!
//! ## Targeted decryption
//!
//! [`Decryptor::try_decrypt_with_channel`] tests a single named key and has no store
//! side effects. The reprocessing orchestrator uses it when replaying history against
//! a newly added key.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshdecrypt::channel::KeyCache;
//! use meshdecrypt::decrypt::Decryptor;
//! use meshdecrypt::storage::MemoryStore;
//!
//! # async fn demo(ciphertext: &[u8]) {
//! let store = Arc::new(MemoryStore::new());
//! let cache = Arc::new(KeyCache::with_default_ttl(store.clone()));
//! let decryptor = Decryptor::new(cache, store);
//! match decryptor.try_decrypt(ciphertext, 0x1a2b3c4d, 0xdeadbeef).await {
//!     Ok(packet) => println!("channel {} port {:?}", packet.channel_name, packet.portnum),
//!     Err(e) => println!("{}", e),
//! }
//! # }
//! ```

pub mod cipher;

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};

use crate::channel::{ChannelId, ChannelKey, KeyCache};
use crate::errors::{DecryptError, StoreError};
use crate::logutil::{hex_snippet, node_label};
use crate::metrics;
use crate::protobuf::PortNum;
use crate::storage::{
    DecryptedBy, EncryptedPacketRecord, PacketStore, META_DECRYPTED, META_ENCRYPTED_PAYLOAD,
};

pub use cipher::{apply_channel_cipher, build_nonce, validate_plaintext, ValidatedFrame};

/// Result of a successful live decryption.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedPacket {
    pub channel_id: ChannelId,
    pub channel_name: String,
    pub portnum: PortNum,
    pub payload: Bytes,
}

/// Result of a successful single-channel decryption.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMatch {
    pub portnum: PortNum,
    pub payload: Bytes,
}

pub struct Decryptor {
    cache: Arc<KeyCache>,
    store: Arc<dyn PacketStore>,
}

impl Decryptor {
    pub fn new(cache: Arc<KeyCache>, store: Arc<dyn PacketStore>) -> Self {
        Self { cache, store }
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn PacketStore> {
        &self.store
    }

    /// Try every enabled key in priority order.
    pub async fn try_decrypt(
        &self,
        encrypted_payload: &[u8],
        packet_id: u32,
        from_node: u32,
    ) -> Result<DecryptedPacket, DecryptError> {
        let (key, frame) = self
            .find_key(encrypted_payload, packet_id, from_node)
            .await
            .ok_or(DecryptError::NoMatch)?;
        self.bump_stats(&key).await;
        Ok(DecryptedPacket {
            channel_id: key.id,
            channel_name: key.name,
            portnum: frame.portnum,
            payload: frame.data.payload,
        })
    }

    /// First key in priority order whose plaintext validates.
    async fn find_key(
        &self,
        encrypted_payload: &[u8],
        packet_id: u32,
        from_node: u32,
    ) -> Option<(ChannelKey, ValidatedFrame)> {
        metrics::inc_decrypt_attempt();
        if encrypted_payload.len() < cipher::MIN_FRAME_LEN {
            metrics::inc_decrypt_no_match();
            return None;
        }

        let keys = self.cache.get_ordered_keys().await;
        let found = keys.iter().find_map(|key| {
            try_key(key, encrypted_payload, packet_id, from_node).map(|frame| (key, frame))
        });

        let Some((key, frame)) = found else {
            trace!(
                "No channel key matched packet 0x{:08x} from {} ({} key(s) tried, ct={})",
                packet_id,
                node_label(from_node),
                keys.len(),
                hex_snippet(encrypted_payload, 16)
            );
            metrics::inc_decrypt_no_match();
            return None;
        };

        metrics::inc_decrypt_match();
        debug!(
            "Decrypted packet 0x{:08x} from {} with channel '{}' (#{}, key {}) port={}",
            packet_id,
            node_label(from_node),
            key.name,
            key.id,
            key.fingerprint(),
            frame.portnum.label()
        );
        Some((key.clone(), frame))
    }

    async fn bump_stats(&self, key: &ChannelKey) {
        if let Err(e) = self
            .store
            .increment_channel_decrypt_stats(key.id, Utc::now())
            .await
        {
            warn!(
                "Could not update decrypt stats for channel '{}' (#{}): {}",
                key.name, key.id, e
            );
        }
    }

    /// Try a single enabled key.
    pub async fn try_decrypt_with_channel(
        &self,
        encrypted_payload: &[u8],
        packet_id: u32,
        from_node: u32,
        channel_id: ChannelId,
    ) -> Result<ChannelMatch, DecryptError> {
        let key = self
            .cache
            .get_key(channel_id)
            .await
            .ok_or(DecryptError::UnknownChannel(channel_id))?;
        decrypt_for_channel(&key, encrypted_payload, packet_id, from_node)
    }

    /// Live path for a stored record: decrypt with any key and, on success, write the
    /// terminal markers. Returns `Ok(None)` when no key matches or the record was
    /// already decrypted, including when it was marked by someone else after `record`
    /// was read. Channel stats move only when this call wrote the markers.
    pub async fn decrypt_record(
        &self,
        record: &EncryptedPacketRecord,
    ) -> Result<Option<DecryptedPacket>, StoreError> {
        if record.is_decrypted() {
            return Ok(None);
        }
        let Some((key, frame)) = self
            .find_key(&record.encrypted_payload, record.packet_id, record.from_node)
            .await
        else {
            return Ok(None);
        };
        let metadata = metadata_after_decrypt(
            &record.metadata,
            key.id,
            &key.name,
            frame.portnum,
            &frame.data.payload,
            Utc::now(),
        );
        let written = self
            .store
            .mark_packet_decrypted(
                record.id,
                DecryptedBy::Server,
                key.id,
                frame.portnum as i32,
                metadata,
            )
            .await?;
        if !written {
            debug!("Record {} was already decrypted; leaving it as is", record.id);
            return Ok(None);
        }
        self.bump_stats(&key).await;
        Ok(Some(DecryptedPacket {
            channel_id: key.id,
            channel_name: key.name,
            portnum: frame.portnum,
            payload: frame.data.payload,
        }))
    }
}

fn try_key(
    key: &ChannelKey,
    encrypted_payload: &[u8],
    packet_id: u32,
    from_node: u32,
) -> Option<ValidatedFrame> {
    metrics::inc_key_trial();
    cipher::decrypt_with_key(&key.key, packet_id, from_node, encrypted_payload)
}

/// Synchronous single-key attempt shared by the decryptor and the orchestrator.
pub fn decrypt_for_channel(
    key: &ChannelKey,
    encrypted_payload: &[u8],
    packet_id: u32,
    from_node: u32,
) -> Result<ChannelMatch, DecryptError> {
    try_key(key, encrypted_payload, packet_id, from_node)
        .map(|frame| ChannelMatch {
            portnum: frame.portnum,
            payload: frame.data.payload,
        })
        .ok_or(DecryptError::NoMatch)
}

/// Metadata blob to persist once a packet is solved: the stored ciphertext is dropped
/// and a `decrypted` section records how it was solved.
pub fn metadata_after_decrypt(
    original: &serde_json::Value,
    channel_id: ChannelId,
    channel_name: &str,
    portnum: PortNum,
    payload: &[u8],
    decrypted_at: DateTime<Utc>,
) -> serde_json::Value {
    let mut meta = match original {
        serde_json::Value::Object(map) => map.clone(),
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("original".to_string(), other.clone());
            map
        }
    };
    meta.remove(META_ENCRYPTED_PAYLOAD);
    meta.insert(
        META_DECRYPTED.to_string(),
        serde_json::json!({
            "channel_id": channel_id,
            "channel_name": channel_name,
            "portnum": portnum as i32,
            "port": portnum.label(),
            "payload": hex::encode(payload),
            "decrypted_at": decrypted_at.to_rfc3339(),
        }),
    );
    serde_json::Value::Object(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_drops_ciphertext_and_keeps_context() {
        let original = serde_json::json!({
            "encrypted_payload": "deadbeef",
            "rx_rssi": -97,
        });
        let now = Utc::now();
        let meta = metadata_after_decrypt(&original, 3, "Ops", PortNum::TextMessageApp, b"hi", now);
        assert!(meta.get("encrypted_payload").is_none());
        assert_eq!(meta["rx_rssi"], -97);
        assert_eq!(meta["decrypted"]["channel_id"], 3);
        assert_eq!(meta["decrypted"]["port"], "TEXT_MESSAGE_APP");
        assert_eq!(meta["decrypted"]["payload"], "6869");
    }

    #[test]
    fn non_object_metadata_is_wrapped() {
        let meta = metadata_after_decrypt(
            &serde_json::json!("legacy"),
            1,
            "A",
            PortNum::PositionApp,
            &[],
            Utc::now(),
        );
        assert_eq!(meta["original"], "legacy");
        assert_eq!(meta["decrypted"]["portnum"], 3);
    }
}
