//! Reprocessing sweeps against an in-memory store.

mod common;

use std::sync::Arc;

use common::{key, seed_packet, FlakyFetchStore};
use meshdecrypt::config::DecryptionConfig;
use meshdecrypt::engine::DecryptionEngine;
use meshdecrypt::errors::{ReprocessError, StoreError};
use meshdecrypt::events::ProgressSink;
use meshdecrypt::reprocess::{ProcessingProgress, ProcessingStatus};
use meshdecrypt::storage::{DecryptedBy, MemoryStore};
use tokio::sync::broadcast::error::TryRecvError;

fn engine(store: Arc<MemoryStore>) -> DecryptionEngine {
    DecryptionEngine::new(store, &DecryptionConfig::default())
}

#[tokio::test]
async fn sweep_decrypts_matching_records_only() {
    let ops = key(1, "Ops", 0x11, 0);
    let other = key(2, "Other", 0x22, 0);
    let store = Arc::new(MemoryStore::new());
    seed_packet(&store, 1, &ops, "first");
    seed_packet(&store, 2, &other, "someone else's");
    seed_packet(&store, 3, &ops, "third");
    // the key arrives after the packets did
    store.upsert_channel(ops.clone());
    let engine = engine(store.clone());

    let progress = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(progress.status, ProcessingStatus::Completed);
    assert_eq!(
        (progress.total, progress.processed, progress.decrypted),
        (3, 3, 2)
    );
    assert!(progress.started_at.is_some());
    assert!(progress.completed_at.is_some());
    assert!(progress.error.is_none());

    for id in [1, 3] {
        let rec = store.packet(id).unwrap();
        assert_eq!(rec.decrypted_by, Some(DecryptedBy::Server));
        assert_eq!(rec.decrypted_channel_id, Some(1));
        assert!(rec.metadata.get("encrypted_payload").is_none());
        assert!(rec.metadata.get("decrypted").is_some());
    }
    let untouched = store.packet(2).unwrap();
    assert_eq!(untouched.decrypted_by, None);
    assert!(untouched.metadata.get("encrypted_payload").is_some());

    let ch = store.channel(1).unwrap();
    assert_eq!(ch.decrypted_packet_count, 2);
    assert!(ch.last_decrypted_at.is_some());
    assert_eq!(engine.reprocessor.get_progress(), Some(progress));
}

#[tokio::test]
async fn second_sweep_finds_nothing_new() {
    let ops = key(1, "Ops", 0x11, 0);
    let store = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=4 {
        seed_packet(&store, id, &ops, "again");
    }
    let engine = engine(store.clone());

    let first = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(first.decrypted, 4);

    let second = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(second.status, ProcessingStatus::Completed);
    assert_eq!((second.total, second.processed, second.decrypted), (0, 0, 0));
    assert_eq!(store.channel(1).unwrap().decrypted_packet_count, 4);
}

#[tokio::test]
async fn empty_store_completes_with_zero_totals() {
    let store = Arc::new(MemoryStore::with_channels([key(1, "Ops", 0x11, 0)]));
    let engine = engine(store);
    let progress = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(progress.status, ProcessingStatus::Completed);
    assert_eq!(progress.total, 0);
    assert_eq!(progress.percent(), 100);
}

#[tokio::test]
async fn unknown_or_disabled_channel_is_rejected_without_state_change() {
    let mut off = key(5, "Off", 0x55, 0);
    off.enabled = false;
    let store = Arc::new(MemoryStore::with_channels([off.clone()]));
    seed_packet(&store, 1, &off, "archived");
    let engine = engine(store.clone());

    assert!(matches!(
        engine.reprocessor.process_for_channel(5).await,
        Err(ReprocessError::UnknownChannel(5))
    ));
    assert!(matches!(
        engine.reprocessor.process_for_channel(77).await,
        Err(ReprocessError::UnknownChannel(77))
    ));
    assert!(!engine.reprocessor.is_running());
    assert!(engine.reprocessor.get_progress().is_none());
    assert_eq!(store.packet(1).unwrap().decrypted_by, None);
}

#[tokio::test]
async fn key_added_after_cache_load_is_found() {
    let store = Arc::new(MemoryStore::with_channels([key(1, "Ops", 0x11, 0)]));
    let engine = engine(store.clone());
    // warm the cache without the new key
    assert_eq!(engine.cache.get_ordered_keys().await.len(), 1);

    let late = key(2, "Late", 0x22, 0);
    seed_packet(&store, 1, &late, "now readable");
    store.upsert_channel(late);

    let progress = engine.reprocessor.process_for_channel(2).await.unwrap();
    assert_eq!(progress.decrypted, 1);
}

#[tokio::test]
async fn snapshots_are_monotonic_and_end_terminal() {
    let ops = key(1, "Ops", 0x11, 0);
    let other = key(2, "Other", 0x22, 0);
    let store = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=35 {
        let k = if id % 3 == 0 { &other } else { &ops };
        seed_packet(&store, id, k, "bulk");
    }
    let engine = engine(store);
    let mut rx = engine.subscribe();

    let done = engine.reprocessor.process_for_channel(1).await.unwrap();

    let mut seen: Vec<ProcessingProgress> = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(p) => seen.push(p),
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("unexpected receive error: {:?}", e),
        }
    }
    // running(0), every 10 records, then the terminal snapshot
    let processed: Vec<usize> = seen.iter().map(|p| p.processed).collect();
    assert_eq!(processed, vec![0, 10, 20, 30, 35]);
    for pair in seen.windows(2) {
        assert!(pair[0].processed <= pair[1].processed);
        assert!(pair[0].decrypted <= pair[1].decrypted);
    }
    for p in &seen {
        assert!(p.decrypted <= p.processed && p.processed <= p.total);
        assert_eq!(p.total, 35);
    }
    assert_eq!(seen.last(), Some(&done));
    assert_eq!(done.status, ProcessingStatus::Completed);
    assert_eq!(done.decrypted, 24);
}

#[tokio::test]
async fn write_failure_fails_sweep_and_keeps_partial_progress() {
    let ops = key(1, "Ops", 0x11, 0);
    let store = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=5 {
        seed_packet(&store, id, &ops, "partial");
    }
    store.fail_writes_after(2);
    let engine = engine(store.clone());

    let failed = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(failed.status, ProcessingStatus::Failed);
    assert_eq!((failed.total, failed.processed, failed.decrypted), (5, 2, 2));
    assert!(failed.error.as_deref().unwrap_or("").contains("injected"));
    assert!(!engine.reprocessor.is_running());

    let marked: Vec<bool> = (1..=5)
        .map(|id| store.packet(id).unwrap().is_decrypted())
        .collect();
    assert_eq!(marked, vec![true, true, false, false, false]);

    // store recovers; the next sweep picks up exactly the remainder
    store.fail_writes_after(usize::MAX);
    let retry = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(retry.status, ProcessingStatus::Completed);
    assert_eq!((retry.total, retry.decrypted), (3, 3));
}

#[tokio::test]
async fn fetch_failure_reports_failed_progress() {
    let ops = key(1, "Ops", 0x11, 0);
    let mem = Arc::new(MemoryStore::with_channels([ops.clone()]));
    seed_packet(&mem, 1, &ops, "unreached");
    let store = Arc::new(FlakyFetchStore::new(mem.clone(), 1));
    let engine = DecryptionEngine::new(store, &DecryptionConfig::default());

    let failed = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(failed.status, ProcessingStatus::Failed);
    assert_eq!((failed.total, failed.processed), (0, 0));
    assert!(failed.error.is_some());
    assert_eq!(mem.packet(1).unwrap().decrypted_by, None);

    let ok = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(ok.decrypted, 1);
}

#[tokio::test]
async fn all_channels_continue_past_a_failed_channel() {
    let first = key(1, "First", 0x11, 0);
    let second = key(2, "Second", 0x22, 1);
    let mem = Arc::new(MemoryStore::with_channels([first.clone(), second.clone()]));
    seed_packet(&mem, 1, &second, "for second");
    seed_packet(&mem, 2, &first, "for first");
    // only the first channel's fetch fails
    let store = Arc::new(FlakyFetchStore::new(mem.clone(), 1));
    let engine = DecryptionEngine::new(store, &DecryptionConfig::default());

    let results = engine.reprocessor.process_for_all_channels().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].channel_id, 1);
    assert_eq!(results[0].status, ProcessingStatus::Failed);
    assert_eq!(results[1].channel_id, 2);
    assert_eq!(results[1].status, ProcessingStatus::Completed);
    assert_eq!(results[1].decrypted, 1);

    assert!(mem.packet(1).unwrap().is_decrypted());
    assert!(!mem.packet(2).unwrap().is_decrypted());
}

#[tokio::test]
async fn batch_size_caps_one_sweep() {
    let ops = key(1, "Ops", 0x11, 0);
    let store = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=7 {
        seed_packet(&store, id, &ops, "batched");
    }
    let config = DecryptionConfig {
        reprocess_batch_size: 3,
        ..DecryptionConfig::default()
    };
    let engine = DecryptionEngine::new(store.clone(), &config);

    let first = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(first.total, 3);
    assert!(store.packet(3).unwrap().is_decrypted());
    assert!(!store.packet(4).unwrap().is_decrypted());

    let second = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(second.total, 3);
    let third = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(third.total, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn concurrent_request_is_rejected_while_sweep_runs() {
    let ops = key(1, "Ops", 0x11, 0);
    let store = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=250 {
        seed_packet(&store, id, &ops, "busy");
    }
    let engine = engine(store);
    let reprocessor = engine.reprocessor.clone();

    let sweep = tokio::spawn({
        let r = reprocessor.clone();
        async move { r.process_for_channel(1).await }
    });
    // the sweep runs until its first cooperative yield
    while !reprocessor.is_running() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        reprocessor.process_for_channel(1).await,
        Err(ReprocessError::AlreadyProcessing)
    ));
    let mid = reprocessor.get_progress().expect("in-flight progress");
    assert_eq!(mid.status, ProcessingStatus::Running);
    assert_eq!(mid.processed, 100);

    let done = sweep.await.unwrap().unwrap();
    assert_eq!(done.status, ProcessingStatus::Completed);
    assert_eq!(done.decrypted, 250);
    assert!(!reprocessor.is_running());

    // the flag is free again
    let again = reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(again.total, 0);
}

/// Marks one record as decrypted by the radio as soon as the sweep reports it is
/// running, i.e. after the batch has been fetched.
struct NodeSolvesMidSweep {
    store: Arc<MemoryStore>,
    record_id: u64,
}

impl ProgressSink for NodeSolvesMidSweep {
    fn emit(&self, progress: &ProcessingProgress) {
        if progress.status != ProcessingStatus::Running || progress.processed != 0 {
            return;
        }
        if let Some(mut rec) = self.store.packet(self.record_id) {
            rec.decrypted_by = Some(DecryptedBy::Node);
            rec.decrypted_channel_id = Some(77);
            self.store.insert_packet(rec);
        }
    }
}

#[tokio::test]
async fn record_solved_after_fetch_is_not_rewritten_or_recounted() {
    let ops = key(1, "Ops", 0x11, 0);
    let store = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=3 {
        seed_packet(&store, id, &ops, "raced");
    }
    let engine = DecryptionEngine::with_extra_sink(
        store.clone(),
        &DecryptionConfig::default(),
        Some(Arc::new(NodeSolvesMidSweep {
            store: store.clone(),
            record_id: 2,
        })),
    );

    let progress = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(progress.status, ProcessingStatus::Completed);
    assert_eq!(
        (progress.total, progress.processed, progress.decrypted),
        (3, 3, 2)
    );

    let rec2 = store.packet(2).unwrap();
    assert_eq!(rec2.decrypted_by, Some(DecryptedBy::Node));
    assert_eq!(rec2.decrypted_channel_id, Some(77));
    assert!(rec2.metadata.get("decrypted").is_none());
    for id in [1, 3] {
        assert_eq!(store.packet(id).unwrap().decrypted_by, Some(DecryptedBy::Server));
    }
    assert_eq!(store.channel(1).unwrap().decrypted_packet_count, 2);
}

#[tokio::test]
async fn unreachable_store_on_cold_cache_is_a_store_error() {
    let store = Arc::new(MemoryStore::with_channels([key(1, "Ops", 0x11, 0)]));
    store.set_unavailable(true);
    let engine = engine(store.clone());

    assert!(matches!(
        engine.reprocessor.process_for_channel(1).await,
        Err(ReprocessError::Store(StoreError::Unavailable(_)))
    ));
    assert!(!engine.reprocessor.is_running());
    assert!(engine.reprocessor.get_progress().is_none());

    store.set_unavailable(false);
    let progress = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(progress.status, ProcessingStatus::Completed);
}

#[tokio::test]
async fn sweep_loads_channel_keys_once_even_with_expired_cache() {
    let ops = key(1, "Ops", 0x11, 0);
    let mem = Arc::new(MemoryStore::with_channels([ops.clone()]));
    for id in 1..=20 {
        seed_packet(&mem, id, &ops, "ttl zero");
    }
    let store = Arc::new(FlakyFetchStore::new(mem, 0));
    // a zero TTL makes every cache read go back to the store
    let config = DecryptionConfig {
        key_cache_ttl_ms: 0,
        ..DecryptionConfig::default()
    };
    let engine = DecryptionEngine::new(store.clone(), &config);

    let progress = engine.reprocessor.process_for_channel(1).await.unwrap();
    assert_eq!(progress.decrypted, 20);
    assert_eq!(store.key_loads(), 1);
}
