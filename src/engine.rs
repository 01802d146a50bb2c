//! Wiring of key cache, decryptor and orchestrator over one store.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::channel::KeyCache;
use crate::config::DecryptionConfig;
use crate::decrypt::Decryptor;
use crate::events::{BroadcastSink, FanoutSink, ProgressSink};
use crate::reprocess::{ProcessingProgress, Reprocessor};
use crate::storage::PacketStore;

/// Live decryption and reprocessing sharing a single key cache.
pub struct DecryptionEngine {
    pub cache: Arc<KeyCache>,
    pub decryptor: Arc<Decryptor>,
    pub reprocessor: Arc<Reprocessor>,
    events: BroadcastSink,
}

impl DecryptionEngine {
    pub fn new(store: Arc<dyn PacketStore>, config: &DecryptionConfig) -> Self {
        Self::with_extra_sink(store, config, None)
    }

    /// Progress goes to the engine's broadcast stream and, if given, to `extra` too.
    pub fn with_extra_sink(
        store: Arc<dyn PacketStore>,
        config: &DecryptionConfig,
        extra: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        let events = BroadcastSink::new(config.event_buffer);
        let mut sink = FanoutSink::new().with(Arc::new(events.clone()));
        if let Some(extra) = extra {
            sink = sink.with(extra);
        }

        let cache = Arc::new(KeyCache::new(store.clone(), config.key_cache_ttl()));
        let decryptor = Arc::new(Decryptor::new(cache.clone(), store));
        let reprocessor = Arc::new(Reprocessor::new(
            decryptor.clone(),
            Arc::new(sink),
            config.reprocess(),
        ));
        Self {
            cache,
            decryptor,
            reprocessor,
            events,
        }
    }

    /// Progress snapshots from sweeps, starting with the next one emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingProgress> {
        self.events.subscribe()
    }

    /// Call after a channel key is added, edited, enabled or disabled.
    pub fn channels_changed(&self) {
        self.cache.invalidate();
    }
}
