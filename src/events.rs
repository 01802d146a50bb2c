//! Progress event sinks.
//!
//! The orchestrator pushes [`ProcessingProgress`] snapshots into a [`ProgressSink`];
//! getting them to a browser or any other observer is the embedder's job.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::broadcast;

use crate::reprocess::{ProcessingProgress, ProcessingStatus};

pub trait ProgressSink: Send + Sync {
    fn emit(&self, progress: &ProcessingProgress);
}

/// Discards every snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _progress: &ProcessingProgress) {}
}

/// Logs terminal snapshots at info level and in-flight ones at debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, p: &ProcessingProgress) {
        if !p.is_terminal() {
            debug!(
                "Reprocess '{}' {}: {}/{} processed ({}%), {} decrypted",
                p.channel_name,
                p.status.as_str(),
                p.processed,
                p.total,
                p.percent(),
                p.decrypted
            );
            return;
        }
        match p.status {
            ProcessingStatus::Failed => info!(
                "Reprocess '{}' failed after {}/{} ({} decrypted): {}",
                p.channel_name,
                p.processed,
                p.total,
                p.decrypted,
                p.error.as_deref().unwrap_or("unknown error")
            ),
            _ => info!(
                "Reprocess '{}' {}: {}/{} processed, {} decrypted",
                p.channel_name,
                p.status.as_str(),
                p.processed,
                p.total,
                p.decrypted
            ),
        }
    }
}

/// Fans snapshots out to any number of subscribers. Slow subscribers lose the oldest
/// snapshots rather than stalling the sweep.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProcessingProgress>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingProgress> {
        self.tx.subscribe()
    }
}

impl ProgressSink for BroadcastSink {
    fn emit(&self, progress: &ProcessingProgress) {
        // no subscribers is fine
        let _ = self.tx.send(progress.clone());
    }
}

/// Forwards each snapshot to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressSink for FanoutSink {
    fn emit(&self, progress: &ProcessingProgress) {
        for sink in &self.sinks {
            sink.emit(progress);
        }
    }
}
