//! Sled-backed [`PacketStore`] used by the `meshdecrypt` binary.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::IVec;

use super::{DecryptedBy, EncryptedPacketRecord, PacketStore, RecordId, META_ENCRYPTED_PAYLOAD};
use crate::channel::{ChannelId, ChannelKey};
use crate::errors::StoreError;

const TREE_CHANNELS: &str = "channels";
const TREE_PACKETS: &str = "encrypted_packets";

const CHANNEL_SCHEMA_VERSION: u8 = 1;
const PACKET_SCHEMA_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct StoredChannel {
    schema_version: u8,
    channel: ChannelKey,
}

/// On-disk packet row. Metadata is kept as JSON text since bincode cannot carry an
/// arbitrary `serde_json::Value`.
#[derive(Serialize, Deserialize)]
struct StoredPacket {
    schema_version: u8,
    packet_id: u32,
    from_node: u32,
    encrypted_payload: Vec<u8>,
    metadata_json: String,
    received_at: DateTime<Utc>,
    decrypted_by: Option<DecryptedBy>,
    decrypted_channel_id: Option<ChannelId>,
    portnum: Option<i32>,
}

impl StoredPacket {
    fn into_record(self, id: RecordId) -> Result<EncryptedPacketRecord, StoreError> {
        if self.schema_version != PACKET_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                entity: "packet",
                expected: PACKET_SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        Ok(EncryptedPacketRecord {
            id,
            packet_id: self.packet_id,
            from_node: self.from_node,
            encrypted_payload: self.encrypted_payload,
            metadata: serde_json::from_str(&self.metadata_json)?,
            received_at: self.received_at,
            decrypted_by: self.decrypted_by,
            decrypted_channel_id: self.decrypted_channel_id,
            portnum: self.portnum,
        })
    }
}

/// Counts reported by `meshdecrypt status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounts {
    pub total: usize,
    pub undecrypted: usize,
}

/// Sled-backed persistence for channel keys and encrypted packets.
///
/// Keys are big-endian ids so tree iteration order is ascending id order, which is the
/// order reprocessing sweeps walk in.
pub struct SledStore {
    db: sled::Db,
    channels: sled::Tree,
    packets: sled::Tree,
}

impl SledStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let channels = db.open_tree(TREE_CHANNELS)?;
        let packets = db.open_tree(TREE_PACKETS)?;
        Ok(Self {
            db,
            channels,
            packets,
        })
    }

    /// Flush outstanding writes and release the database.
    pub fn close(self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn id_key(id: u64) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn id_from_key(key: &[u8]) -> Option<u64> {
        let bytes: [u8; 8] = key.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: IVec) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(&bytes)?)
    }

    fn decode_channel(bytes: IVec) -> Result<ChannelKey, StoreError> {
        let stored: StoredChannel = Self::deserialize(bytes)?;
        if stored.schema_version != CHANNEL_SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                entity: "channel",
                expected: CHANNEL_SCHEMA_VERSION,
                found: stored.schema_version,
            });
        }
        Ok(stored.channel)
    }

    /// Allocate a fresh, monotonically increasing id (never 0).
    pub fn next_id(&self) -> Result<u64, StoreError> {
        Ok(self.db.generate_id()? + 1)
    }

    /// Insert or replace a channel key.
    pub fn upsert_channel(&self, channel: ChannelKey) -> Result<(), StoreError> {
        let key = Self::id_key(channel.id);
        let bytes = Self::serialize(&StoredChannel {
            schema_version: CHANNEL_SCHEMA_VERSION,
            channel,
        })?;
        self.channels.insert(key, bytes)?;
        self.channels.flush()?;
        Ok(())
    }

    pub fn get_channel(&self, id: ChannelId) -> Result<ChannelKey, StoreError> {
        let Some(bytes) = self.channels.get(Self::id_key(id))? else {
            return Err(StoreError::NotFound(format!("channel {}", id)));
        };
        Self::decode_channel(bytes)
    }

    /// Every channel, enabled or not, ascending by id.
    pub fn list_channels(&self) -> Result<Vec<ChannelKey>, StoreError> {
        let mut out = Vec::new();
        for entry in self.channels.iter() {
            let (_, bytes) = entry?;
            out.push(Self::decode_channel(bytes)?);
        }
        Ok(out)
    }

    /// Store a packet that could not be decrypted on receipt. `context` is merged into
    /// the metadata blob next to the hex ciphertext.
    pub fn insert_encrypted_packet(
        &self,
        packet_id: u32,
        from_node: u32,
        encrypted_payload: Vec<u8>,
        context: serde_json::Map<String, serde_json::Value>,
    ) -> Result<RecordId, StoreError> {
        let id = self.next_id()?;
        let mut record = EncryptedPacketRecord::new(id, packet_id, from_node, encrypted_payload);
        if let Some(meta) = record.metadata.as_object_mut() {
            for (k, v) in context {
                if k != META_ENCRYPTED_PAYLOAD {
                    meta.insert(k, v);
                }
            }
        }
        self.put_packet(&record)?;
        Ok(id)
    }

    fn put_packet(&self, record: &EncryptedPacketRecord) -> Result<(), StoreError> {
        self.packets
            .insert(Self::id_key(record.id), Self::encode_packet(record)?)?;
        self.packets.flush()?;
        Ok(())
    }

    fn encode_packet(record: &EncryptedPacketRecord) -> Result<Vec<u8>, StoreError> {
        let stored = StoredPacket {
            schema_version: PACKET_SCHEMA_VERSION,
            packet_id: record.packet_id,
            from_node: record.from_node,
            encrypted_payload: record.encrypted_payload.clone(),
            metadata_json: serde_json::to_string(&record.metadata)?,
            received_at: record.received_at,
            decrypted_by: record.decrypted_by,
            decrypted_channel_id: record.decrypted_channel_id,
            portnum: record.portnum,
        };
        Self::serialize(&stored)
    }

    pub fn get_packet(&self, id: RecordId) -> Result<EncryptedPacketRecord, StoreError> {
        let Some(bytes) = self.packets.get(Self::id_key(id))? else {
            return Err(StoreError::NotFound(format!("packet {}", id)));
        };
        let stored: StoredPacket = Self::deserialize(bytes)?;
        stored.into_record(id)
    }

    pub fn packet_counts(&self) -> Result<PacketCounts, StoreError> {
        let mut counts = PacketCounts::default();
        for entry in self.packets.iter() {
            let (_, bytes) = entry?;
            let stored: StoredPacket = Self::deserialize(bytes)?;
            counts.total += 1;
            if stored.decrypted_by.is_none() {
                counts.undecrypted += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl PacketStore for SledStore {
    async fn fetch_enabled_channel_keys(&self) -> Result<Vec<ChannelKey>, StoreError> {
        Ok(self
            .list_channels()?
            .into_iter()
            .filter(|c| c.enabled)
            .collect())
    }

    async fn fetch_encrypted_undecrypted_packets(
        &self,
        limit: usize,
    ) -> Result<Vec<EncryptedPacketRecord>, StoreError> {
        let mut out = Vec::new();
        for entry in self.packets.iter() {
            if out.len() >= limit {
                break;
            }
            let (key, bytes) = entry?;
            let Some(id) = Self::id_from_key(&key) else {
                continue;
            };
            let stored: StoredPacket = Self::deserialize(bytes)?;
            if stored.decrypted_by.is_some() || stored.encrypted_payload.is_empty() {
                continue;
            }
            out.push(stored.into_record(id)?);
        }
        Ok(out)
    }

    async fn mark_packet_decrypted(
        &self,
        record_id: RecordId,
        decrypted_by: DecryptedBy,
        channel_id: ChannelId,
        portnum: i32,
        updated_metadata: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let key = Self::id_key(record_id);
        loop {
            let Some(current) = self.packets.get(key)? else {
                return Err(StoreError::NotFound(format!("packet {}", record_id)));
            };
            let stored: StoredPacket = Self::deserialize(current.clone())?;
            if stored.decrypted_by.is_some() {
                return Ok(false);
            }
            let mut record = stored.into_record(record_id)?;
            record.decrypted_by = Some(decrypted_by);
            record.decrypted_channel_id = Some(channel_id);
            record.portnum = Some(portnum);
            record.metadata = updated_metadata.clone();
            let updated = Self::encode_packet(&record)?;
            // lost a race with another writer: re-read and re-check the marker
            if self
                .packets
                .compare_and_swap(key, Some(current), Some(updated))?
                .is_ok()
            {
                self.packets.flush()?;
                return Ok(true);
            }
        }
    }

    async fn increment_channel_decrypt_stats(
        &self,
        channel_id: ChannelId,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut channel = self.get_channel(channel_id)?;
        channel.decrypted_packet_count = channel.decrypted_packet_count.saturating_add(1);
        channel.last_decrypted_at = Some(timestamp);
        self.upsert_channel(channel)
    }
}
