//! In-memory implementation of [`PacketStore`].
//!
//! Same semantics as the sled store but nothing survives a drop. Also carries a few
//! fault-injection switches so callers can exercise store outages.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DecryptedBy, EncryptedPacketRecord, PacketStore, RecordId};
use crate::channel::{ChannelId, ChannelKey};
use crate::errors::StoreError;

#[derive(Default)]
struct MemoryStoreInner {
    channels: BTreeMap<ChannelId, ChannelKey>,
    packets: BTreeMap<RecordId, EncryptedPacketRecord>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
    unavailable: AtomicBool,
    /// Remaining successful `mark_packet_decrypted` calls before writes start failing.
    writes_before_failure: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: impl IntoIterator<Item = ChannelKey>) -> Self {
        let store = Self::new();
        for channel in channels {
            store.upsert_channel(channel);
        }
        store
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    pub fn upsert_channel(&self, channel: ChannelKey) {
        self.write().channels.insert(channel.id, channel);
    }

    pub fn insert_packet(&self, record: EncryptedPacketRecord) {
        self.write().packets.insert(record.id, record);
    }

    pub fn channel(&self, id: ChannelId) -> Option<ChannelKey> {
        self.read().channels.get(&id).cloned()
    }

    pub fn packet(&self, id: RecordId) -> Option<EncryptedPacketRecord> {
        self.read().packets.get(&id).cloned()
    }

    /// Simulate the store going away (every call fails) or coming back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Let `n` more packet writes succeed, then fail every following one.
    pub fn fail_writes_after(&self, n: usize) {
        if let Ok(mut guard) = self.writes_before_failure.lock() {
            *guard = Some(n);
        }
    }
}

#[async_trait]
impl PacketStore for MemoryStore {
    async fn fetch_enabled_channel_keys(&self) -> Result<Vec<ChannelKey>, StoreError> {
        self.check_available()?;
        Ok(self
            .read()
            .channels
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn fetch_encrypted_undecrypted_packets(
        &self,
        limit: usize,
    ) -> Result<Vec<EncryptedPacketRecord>, StoreError> {
        self.check_available()?;
        // BTreeMap iteration is already ascending by record id
        Ok(self
            .read()
            .packets
            .values()
            .filter(|p| !p.is_decrypted() && !p.encrypted_payload.is_empty())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_packet_decrypted(
        &self,
        record_id: RecordId,
        decrypted_by: DecryptedBy,
        channel_id: ChannelId,
        portnum: i32,
        updated_metadata: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        if let Ok(mut remaining) = self.writes_before_failure.lock() {
            match remaining.as_mut() {
                Some(0) => {
                    return Err(StoreError::Unavailable(
                        "injected write failure".to_string(),
                    ))
                }
                Some(n) => *n -= 1,
                None => {}
            }
        }
        let mut inner = self.write();
        let record = inner
            .packets
            .get_mut(&record_id)
            .ok_or_else(|| StoreError::NotFound(format!("packet {}", record_id)))?;
        if record.is_decrypted() {
            return Ok(false);
        }
        record.decrypted_by = Some(decrypted_by);
        record.decrypted_channel_id = Some(channel_id);
        record.portnum = Some(portnum);
        record.metadata = updated_metadata;
        Ok(true)
    }

    async fn increment_channel_decrypt_stats(
        &self,
        channel_id: ChannelId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.write();
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| StoreError::NotFound(format!("channel {}", channel_id)))?;
        channel.decrypted_packet_count = channel.decrypted_packet_count.saturating_add(1);
        channel.last_decrypted_at = Some(timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_skips_decrypted_and_respects_limit() {
        let store = MemoryStore::new();
        for id in [3u64, 1, 2] {
            store.insert_packet(EncryptedPacketRecord::new(id, id as u32, 0xabc, vec![1, 2, 3]));
        }
        assert!(store
            .mark_packet_decrypted(2, DecryptedBy::Node, 9, 1, serde_json::json!({}))
            .await
            .unwrap());

        let batch = store.fetch_encrypted_undecrypted_packets(10).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);

        let limited = store.fetch_encrypted_undecrypted_packets(1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, 1);
    }

    #[tokio::test]
    async fn mark_leaves_terminal_record_alone() {
        let store = MemoryStore::new();
        store.insert_packet(EncryptedPacketRecord::new(1, 1, 1, vec![0; 4]));
        assert!(store
            .mark_packet_decrypted(1, DecryptedBy::Node, 4, 1, serde_json::json!({"by": "node"}))
            .await
            .unwrap());
        assert!(!store
            .mark_packet_decrypted(1, DecryptedBy::Server, 5, 3, serde_json::json!({}))
            .await
            .unwrap());
        let rec = store.packet(1).unwrap();
        assert_eq!(rec.decrypted_by, Some(DecryptedBy::Node));
        assert_eq!(rec.decrypted_channel_id, Some(4));
        assert_eq!(rec.metadata["by"], "node");
    }

    #[tokio::test]
    async fn injected_write_failure() {
        let store = MemoryStore::new();
        store.insert_packet(EncryptedPacketRecord::new(1, 1, 1, vec![0; 4]));
        store.insert_packet(EncryptedPacketRecord::new(2, 2, 1, vec![0; 4]));
        store.fail_writes_after(1);
        assert!(store
            .mark_packet_decrypted(1, DecryptedBy::Server, 1, 1, serde_json::json!({}))
            .await
            .is_ok());
        assert!(matches!(
            store
                .mark_packet_decrypted(2, DecryptedBy::Server, 1, 1, serde_json::json!({}))
                .await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
