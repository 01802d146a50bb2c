//! Test utilities & fixtures shared by the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message;

use meshdecrypt::channel::{ChannelId, ChannelKey};
use meshdecrypt::decrypt::apply_channel_cipher;
use meshdecrypt::errors::StoreError;
use meshdecrypt::protobuf::{Data, PortNum};
use meshdecrypt::storage::{
    DecryptedBy, EncryptedPacketRecord, MemoryStore, PacketStore, RecordId,
};

/// Enabled 128-bit key filled with `fill`.
#[allow(dead_code)]
pub fn key(id: ChannelId, name: &str, fill: u8, sort_order: i32) -> ChannelKey {
    ChannelKey::new(id, name, vec![fill; 16], sort_order).expect("valid key")
}

/// Encrypt a text message `Data` frame the way a radio on that channel would.
#[allow(dead_code)]
pub fn encrypt_text(key: &ChannelKey, packet_id: u32, from_node: u32, text: &str) -> Vec<u8> {
    let frame = Data {
        portnum: PortNum::TextMessageApp as i32,
        payload: bytes::Bytes::from(text.as_bytes().to_vec()),
        ..Default::default()
    }
    .encode_to_vec();
    apply_channel_cipher(&key.key, packet_id, from_node, &frame).expect("16/32 byte key")
}

/// Store record `id` holding a text frame encrypted under `key`.
#[allow(dead_code)]
pub fn seed_packet(store: &MemoryStore, id: RecordId, key: &ChannelKey, text: &str) {
    let packet_id = 0x1000 + id as u32;
    let from_node = 0xdead_0000 + id as u32;
    let ct = encrypt_text(key, packet_id, from_node, text);
    store.insert_packet(EncryptedPacketRecord::new(id, packet_id, from_node, ct));
}

/// Wraps a [`MemoryStore`], fails the first `fetch_failures` reprocessing fetches and
/// counts channel key loads.
#[allow(dead_code)]
pub struct FlakyFetchStore {
    pub inner: Arc<MemoryStore>,
    fetch_failures: AtomicUsize,
    key_loads: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyFetchStore {
    pub fn new(inner: Arc<MemoryStore>, fetch_failures: usize) -> Self {
        Self {
            inner,
            fetch_failures: AtomicUsize::new(fetch_failures),
            key_loads: AtomicUsize::new(0),
        }
    }

    pub fn key_loads(&self) -> usize {
        self.key_loads.load(Ordering::SeqCst)
    }
}

/// Open a sled store, waiting out the lock a just-closed handle may still hold.
#[allow(dead_code)]
pub async fn reopen_sled(path: &std::path::Path) -> meshdecrypt::storage::SledStore {
    let mut last = None;
    for _ in 0..50 {
        match meshdecrypt::storage::SledStore::open(path) {
            Ok(store) => return store,
            Err(e) => last = Some(e),
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("sled store did not reopen: {:?}", last);
}

#[async_trait]
impl PacketStore for FlakyFetchStore {
    async fn fetch_enabled_channel_keys(&self) -> Result<Vec<ChannelKey>, StoreError> {
        self.key_loads.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_enabled_channel_keys().await
    }

    async fn fetch_encrypted_undecrypted_packets(
        &self,
        limit: usize,
    ) -> Result<Vec<EncryptedPacketRecord>, StoreError> {
        let remaining = self.fetch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fetch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("fetch timed out".to_string()));
        }
        self.inner.fetch_encrypted_undecrypted_packets(limit).await
    }

    async fn mark_packet_decrypted(
        &self,
        record_id: RecordId,
        decrypted_by: DecryptedBy,
        channel_id: ChannelId,
        portnum: i32,
        updated_metadata: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.inner
            .mark_packet_decrypted(record_id, decrypted_by, channel_id, portnum, updated_metadata)
            .await
    }

    async fn increment_channel_decrypt_stats(
        &self,
        channel_id: ChannelId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner
            .increment_channel_decrypt_stats(channel_id, timestamp)
            .await
    }
}
