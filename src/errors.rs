use thiserror::Error;

use crate::channel::ChannelId;

/// Outcomes of a decryption attempt that did not yield a validated packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// Decryption ran but no candidate key produced a valid `Data` frame.
    /// Expected for packets on channels we hold no key for.
    #[error("no configured channel key decrypts this packet")]
    NoMatch,

    /// The requested channel is absent from the key cache or disabled.
    #[error("unknown or disabled channel: {0}")]
    UnknownChannel(ChannelId),

    /// A stored key's byte length disagrees with its declared length class.
    #[error("channel {channel_id} key is {actual} bytes but declared {declared_bits}-bit")]
    MalformedKeyConfiguration {
        channel_id: ChannelId,
        declared_bits: u16,
        actual: usize,
    },
}

/// Any failure talking to the packet & channel store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend reachable state is lost (connection refused, closed pool, test outage).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Metadata blob could not be encoded or decoded.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when updating a record that is not present.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Returned when deserializing a record with an unexpected schema version.
    #[error("schema mismatch for {entity}: expected {expected}, got {found}")]
    SchemaMismatch {
        entity: &'static str,
        expected: u8,
        found: u8,
    },
}

/// Reasons a reprocessing sweep could not be started.
///
/// Failures after a sweep has started are reported through the `failed` status of the
/// returned progress instead.
#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error("a reprocessing sweep is already running")]
    AlreadyProcessing,

    #[error("unknown or disabled channel: {0}")]
    UnknownChannel(ChannelId),

    #[error(transparent)]
    Store(#[from] StoreError),
}
