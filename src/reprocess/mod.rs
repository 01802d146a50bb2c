//! # Reprocessing Orchestrator
//!
//! When a channel key is added or re-enabled, packets stored earlier as undecryptable
//! may now be readable. A sweep replays those packets against that one key:
//!
//! 1. Resolve the channel (must exist and be enabled).
//! 2. Fetch up to `batch_size` undecrypted records, ascending by record id.
//! 3. Try each record with the resolved key; on a match write the decrypted markers and
//!    scrubbed metadata in a single conditional store update, then bump the channel
//!    counters. A record solved elsewhere since the fetch is skipped, not recounted.
//! 4. Emit a snapshot every `progress_interval` records and yield to the runtime every
//!    `yield_interval` records.
//!
//! Only one sweep runs at a time per [`Reprocessor`]; a second request while one is in
//! flight gets [`ReprocessError::AlreadyProcessing`] immediately. Each record is
//! committed on its own, so a sweep that dies halfway leaves solved records marked and
//! the rest eligible for the next sweep.

mod progress;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::channel::{ChannelId, ChannelKey, RefreshOutcome};
use crate::decrypt::{decrypt_for_channel, metadata_after_decrypt, ChannelMatch, Decryptor};
use crate::errors::{ReprocessError, StoreError};
use crate::events::ProgressSink;
use crate::logutil::node_label;
use crate::metrics;
use crate::storage::{DecryptedBy, EncryptedPacketRecord};

pub use progress::{ProcessingProgress, ProcessingStatus};

pub const DEFAULT_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_PROGRESS_INTERVAL: usize = 10;
pub const DEFAULT_YIELD_INTERVAL: usize = 100;

/// Sweep tuning, normally taken from the `[decryption]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprocessConfig {
    /// Maximum records examined per sweep.
    pub batch_size: usize,
    /// Emit a progress snapshot every N processed records.
    pub progress_interval: usize,
    /// Yield to the scheduler every N processed records.
    pub yield_interval: usize,
}

impl Default for ReprocessConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            yield_interval: DEFAULT_YIELD_INTERVAL,
        }
    }
}

/// Holds the single-flight flag for the lifetime of a sweep and clears it on drop,
/// whichever way the sweep ends.
struct SweepGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct Reprocessor {
    decryptor: Arc<Decryptor>,
    sink: Arc<dyn ProgressSink>,
    config: ReprocessConfig,
    running: AtomicBool,
    last: Mutex<Option<ProcessingProgress>>,
}

impl Reprocessor {
    pub fn new(
        decryptor: Arc<Decryptor>,
        sink: Arc<dyn ProgressSink>,
        config: ReprocessConfig,
    ) -> Self {
        Self {
            decryptor,
            sink,
            config: ReprocessConfig {
                batch_size: config.batch_size,
                progress_interval: config.progress_interval.max(1),
                yield_interval: config.yield_interval.max(1),
            },
            running: AtomicBool::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn config(&self) -> ReprocessConfig {
        self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The in-flight sweep's progress, or the last finished sweep's final snapshot.
    pub fn get_progress(&self) -> Option<ProcessingProgress> {
        self.last.lock().ok().and_then(|guard| guard.clone())
    }

    fn publish(&self, progress: &ProcessingProgress, emit: bool) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(progress.clone());
        }
        if emit {
            self.sink.emit(progress);
        }
    }

    /// The enabled key for `channel_id`, reloading once when the cache does not hold it
    /// (the key may have been added after the cache was last loaded). A reload that
    /// cannot reach the store is a store error, not an unknown channel.
    async fn resolve_channel(&self, channel_id: ChannelId) -> Result<ChannelKey, ReprocessError> {
        let cache = self.decryptor.cache();
        if let Some(key) = cache.get_key(channel_id).await {
            return Ok(key);
        }
        match cache.refresh().await {
            RefreshOutcome::Stale => Err(ReprocessError::Store(StoreError::Unavailable(
                "channel keys could not be loaded".to_string(),
            ))),
            RefreshOutcome::Refreshed { .. } => cache
                .get_key(channel_id)
                .await
                .ok_or(ReprocessError::UnknownChannel(channel_id)),
        }
    }

    /// Replay every undecrypted record in the batch against one channel key.
    pub async fn process_for_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<ProcessingProgress, ReprocessError> {
        let Some(_guard) = SweepGuard::acquire(&self.running) else {
            metrics::inc_sweep_rejected();
            debug!(
                "Reprocess request for channel #{} rejected: sweep in progress",
                channel_id
            );
            return Err(ReprocessError::AlreadyProcessing);
        };

        let key = self.resolve_channel(channel_id).await?;

        metrics::inc_sweep_started();
        let mut progress = ProcessingProgress::new(key.id, key.name.clone());
        self.publish(&progress, false);

        let store = self.decryptor.store();
        let records = match store
            .fetch_encrypted_undecrypted_packets(self.config.batch_size)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                progress.start(0);
                return Ok(self.finish_failed(progress, &e));
            }
        };

        progress.start(records.len());
        info!(
            "Reprocessing {} undecrypted packet(s) against channel '{}' (#{})",
            progress.total, key.name, key.id
        );
        self.publish(&progress, true);

        for record in &records {
            let decrypted = match decrypt_for_channel(
                &key,
                &record.encrypted_payload,
                record.packet_id,
                record.from_node,
            ) {
                Ok(found) => match self.persist_match(&key, record, &found).await {
                    Ok(written) => written,
                    Err(e) => return Ok(self.finish_failed(progress, &e)),
                },
                Err(_) => false,
            };
            progress.record(decrypted);

            if progress.processed % self.config.progress_interval == 0 {
                self.publish(&progress, true);
            }
            if progress.processed % self.config.yield_interval == 0 {
                tokio::task::yield_now().await;
            }
        }

        progress.complete();
        metrics::inc_sweep_completed();
        info!(
            "Reprocess of channel '{}' complete: {}/{} decrypted",
            key.name, progress.decrypted, progress.total
        );
        self.publish(&progress, true);
        if progress.decrypted > 0 {
            self.decryptor.cache().invalidate();
        }
        Ok(progress)
    }

    async fn persist_match(
        &self,
        key: &ChannelKey,
        record: &EncryptedPacketRecord,
        found: &ChannelMatch,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let metadata = metadata_after_decrypt(
            &record.metadata,
            key.id,
            &key.name,
            found.portnum,
            &found.payload,
            now,
        );
        let store = self.decryptor.store();
        let written = store
            .mark_packet_decrypted(
                record.id,
                DecryptedBy::Server,
                key.id,
                found.portnum as i32,
                metadata,
            )
            .await?;
        if !written {
            debug!(
                "Record {} was decrypted elsewhere after the batch was fetched; skipping",
                record.id
            );
            return Ok(false);
        }
        debug!(
            "Record {} (packet 0x{:08x} from {}) decrypted with '{}' port={}",
            record.id,
            record.packet_id,
            node_label(record.from_node),
            key.name,
            found.portnum.label()
        );
        if let Err(e) = store.increment_channel_decrypt_stats(key.id, now).await {
            warn!(
                "Could not update decrypt stats for channel '{}' (#{}): {}",
                key.name, key.id, e
            );
        }
        Ok(true)
    }

    fn finish_failed(
        &self,
        mut progress: ProcessingProgress,
        e: &StoreError,
    ) -> ProcessingProgress {
        progress.fail(e.to_string());
        metrics::inc_sweep_failed();
        error!(
            "Reprocess of channel '{}' failed after {}/{} record(s): {}",
            progress.channel_name, progress.processed, progress.total, e
        );
        self.publish(&progress, true);
        progress
    }

    /// Sweep each enabled channel in turn. A channel that cannot be swept is reported
    /// as a failed entry and the remaining channels are still attempted.
    pub async fn process_for_all_channels(&self) -> Vec<ProcessingProgress> {
        let cache = self.decryptor.cache();
        cache.invalidate();
        let keys = cache.get_ordered_keys().await;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys.iter() {
            match self.process_for_channel(key.id).await {
                Ok(progress) => results.push(progress),
                Err(e) => {
                    warn!("Skipping reprocess of channel '{}' (#{}): {}", key.name, key.id, e);
                    results.push(ProcessingProgress::rejected(
                        key.id,
                        key.name.clone(),
                        e.to_string(),
                    ));
                }
            }
        }
        results
    }
}
