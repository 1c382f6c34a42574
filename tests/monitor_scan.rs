//! Chain monitor behaviour across restarts, forced starts and forks
//!
//! Run with: cargo test --test monitor_scan

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::*;
use relayer::error::ConsistencyError;
use relayer::monitor::{ChainMonitor, MonitorConfig, ScanError, ScanState};
use relayer::store::CheckpointStore;
use relayer::types::CommitStatus;

fn from_genesis() -> MonitorConfig {
    let mut config = monitor_config();
    config.start_height = Some(0);
    config
}

async fn started(
    reader: Arc<MockReader>,
    store: &CheckpointStore,
    config: MonitorConfig,
) -> ChainMonitor<MockReader> {
    let mut monitor = ChainMonitor::new(reader, store.clone(), RELAY, config);
    assert!(monitor
        .initialize(&CancellationToken::new())
        .await
        .unwrap());
    monitor
}

#[tokio::test]
async fn test_events_persist_with_checkpoint() {
    let store = CheckpointStore::open_in_memory().await.unwrap();
    let reader = Arc::new(MockReader::with_chain(SIDE, 10));
    reader.put_block(
        3,
        vec![event(SIDE, 3, "0x01", 1), event(SIDE, 3, "0x01", 0)],
        vec![],
    );
    reader.put_block(7, vec![event(SIDE, 7, "0x02", 0)], vec![]);

    let mut config = from_genesis();
    config.confirmation_depth = 2;
    let mut monitor = started(reader.clone(), &store, config).await;

    let scanned = monitor
        .scan_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(scanned, 8);
    assert_eq!(monitor.checkpoint(), 8);
    assert_eq!(monitor.state(), ScanState::Idle);

    let checkpoint = store.get_checkpoint(SIDE).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_scanned_height, 8);
    assert_eq!(checkpoint.block_hash, Some(block_hash(8)));

    let queued = store.list_pending(CommitStatus::Queued).await.unwrap();
    assert_eq!(queued.len(), 3);
    assert!(queued.iter().all(|c| c.destination_chain_id == RELAY));

    // Blocks inside the confirmation depth are left alone
    assert_eq!(*reader.fetched.lock().unwrap(), (1..=8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relayer.db");
    let path = path.to_str().unwrap();

    let reader = Arc::new(MockReader::with_chain(SIDE, 5));
    reader.put_block(4, vec![event(SIDE, 4, "0x03", 0)], vec![]);

    {
        let store = CheckpointStore::open(path).await.unwrap();
        let mut monitor = started(reader.clone(), &store, from_genesis()).await;
        monitor
            .scan_cycle(&CancellationToken::new())
            .await
            .unwrap();
        store.close().await;
    }

    for height in 6..=8 {
        reader.put_block(height, vec![], vec![]);
    }
    reader.put_block(7, vec![event(SIDE, 7, "0x04", 0)], vec![]);
    reader.set_head(8);
    reader.fetched.lock().unwrap().clear();

    let store = CheckpointStore::open(path).await.unwrap();
    // The persisted checkpoint wins over the configured start height
    let mut monitor = started(reader.clone(), &store, from_genesis()).await;
    assert_eq!(monitor.checkpoint(), 5);
    monitor
        .scan_cycle(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*reader.fetched.lock().unwrap(), vec![6, 7, 8]);
    let queued = store.list_pending(CommitStatus::Queued).await.unwrap();
    assert_eq!(queued.len(), 2);
}

#[tokio::test]
async fn test_forced_start_rescans_without_duplicates() {
    let store = CheckpointStore::open_in_memory().await.unwrap();
    let reader = Arc::new(MockReader::with_chain(SIDE, 6));
    reader.put_block(3, vec![event(SIDE, 3, "0x05", 0)], vec![]);

    let mut monitor = started(reader.clone(), &store, from_genesis()).await;
    monitor
        .scan_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(monitor.checkpoint(), 6);

    let mut config = from_genesis();
    config.start_force_height = Some(2);
    let mut monitor = started(reader.clone(), &store, config).await;
    assert_eq!(monitor.checkpoint(), 2);
    assert_eq!(
        store.get_checkpoint(SIDE).await.unwrap().unwrap().last_scanned_height,
        2
    );

    monitor
        .scan_cycle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(monitor.checkpoint(), 6);
    assert_eq!(store.list_pending(CommitStatus::Queued).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_fork_below_checkpoint_is_fatal() {
    let store = CheckpointStore::open_in_memory().await.unwrap();
    let reader = Arc::new(MockReader::with_chain(SIDE, 5));
    let mut monitor = started(reader.clone(), &store, from_genesis()).await;
    monitor
        .scan_cycle(&CancellationToken::new())
        .await
        .unwrap();

    reader.fork_at(5);
    reader.put_block(6, vec![], vec![]);
    reader.set_head(6);

    match monitor.scan_cycle(&CancellationToken::new()).await {
        Err(ScanError::Fatal(report)) => {
            let err = ConsistencyError::find(&report).expect("consistency error");
            assert!(matches!(err, ConsistencyError::Reorg { height: 5, .. }));
            assert_eq!(err.chain_id(), SIDE);
        }
        other => panic!("expected a fatal reorg, got {:?}", other),
    }
    assert_eq!(
        store.get_checkpoint(SIDE).await.unwrap().unwrap().last_scanned_height,
        5
    );
}

#[tokio::test]
async fn test_malformed_event_stops_before_persisting() {
    let store = CheckpointStore::open_in_memory().await.unwrap();
    let reader = Arc::new(MockReader::with_chain(SIDE, 4));
    // Reported at the wrong height
    reader.put_block(2, vec![event(SIDE, 9, "0x06", 0)], vec![]);

    let mut monitor = started(reader.clone(), &store, from_genesis()).await;
    let result = monitor.scan_cycle(&CancellationToken::new()).await;
    let Err(ScanError::Fatal(report)) = result else {
        panic!("expected a fatal error");
    };
    assert!(matches!(
        ConsistencyError::find(&report),
        Some(ConsistencyError::Malformed { height: 2, .. })
    ));
    assert_eq!(monitor.checkpoint(), 1);
    assert!(store.list_pending(CommitStatus::Queued).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_retries_transient_fetch_failures() {
    let store = CheckpointStore::open_in_memory().await.unwrap();
    let reader = Arc::new(MockReader::with_chain(SIDE, 5));
    reader.put_block(3, vec![event(SIDE, 3, "0x07", 0)], vec![]);
    reader.flaky.lock().unwrap().insert(3);

    let monitor = ChainMonitor::new(reader.clone(), store.clone(), RELAY, from_genesis());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(monitor.run(cancel.clone()));

    let mut reached = false;
    for _ in 0..200 {
        if let Some(checkpoint) = store.get_checkpoint(SIDE).await.unwrap() {
            if checkpoint.last_scanned_height == 5 {
                reached = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(reached);
    assert_eq!(store.list_pending(CommitStatus::Queued).await.unwrap().len(), 1);
    let fetched = reader.fetched.lock().unwrap();
    assert_eq!(fetched.iter().filter(|h| **h == 3).count(), 1);
}

#[tokio::test]
async fn test_run_returns_fatal_error() {
    let store = CheckpointStore::open_in_memory().await.unwrap();
    let reader = Arc::new(MockReader::with_chain(SIDE, 3));
    reader.put_block(2, vec![event(RELAY, 2, "0x08", 0)], vec![]);

    let monitor = ChainMonitor::new(reader, store, RELAY, from_genesis());
    let report = monitor
        .run(CancellationToken::new())
        .await
        .expect_err("monitor must halt");
    assert!(ConsistencyError::find(&report).is_some());
}
