// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests: pollers, buffers, writer and SQLite store together.

use async_trait::async_trait;
use plantlog::spill::read_spill;
use plantlog::{
    AcquisitionService, ConnectError, ConnectionState, Credentials, MockClient, MockRead,
    ProtocolClient, ReadingStore, ReconnectConfig, ServiceConfig, Session, ShutdownConfig,
    SourceConfig, SqliteStore, UnackedPolicy, WriterConfig,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn source(name: &str) -> SourceConfig {
    SourceConfig::new(name, format!("opc.tcp://{}:4840", name.to_lowercase()))
        .tag("ns=2;s=|var|App.udiONo")
        .tag("ns=2;s=|var|App.rSpeed")
        .poll_interval_ms(10)
}

fn config(dir: &Path, sources: Vec<SourceConfig>) -> ServiceConfig {
    let mut config = ServiceConfig {
        sources,
        ..Default::default()
    };
    config.service.stats_interval_secs = 0;
    config.reconnect = ReconnectConfig {
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        jitter: 0.0,
        degraded_after: 3,
        connect_timeout_ms: 50,
        read_timeout_ms: 5_000,
    };
    config.writer = WriterConfig {
        flush_interval_ms: 20,
        max_batch: 100,
        retry_base_ms: 5,
        retry_max_ms: 50,
        alert_after_attempts: 5,
    };
    config.shutdown = ShutdownConfig {
        grace_ms: 1_000,
        unacked: UnackedPolicy::Spill,
        spill_path: dir.join("spill.jsonl"),
    };
    config
}

fn stored_sequences(store: &impl ReadingStore, source: &str) -> Vec<u64> {
    store
        .load(source)
        .unwrap()
        .iter()
        .map(|r| r.sequence)
        .collect()
}

/// Routes each endpoint to its own scripted client.
struct RoutedClient {
    routes: HashMap<String, MockClient>,
}

#[async_trait]
impl ProtocolClient for RoutedClient {
    async fn open(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ConnectError> {
        match self.routes.get(endpoint) {
            Some(client) => client.open(endpoint, credentials).await,
            None => Err(ConnectError::Unreachable(endpoint.to_string())),
        }
    }
}

#[tokio::test]
async fn test_end_to_end_no_duplicates_no_loss() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::new();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let service = AcquisitionService::new(
        config(dir.path(), vec![source("Press"), source("Drill")]),
        Arc::new(client.clone()),
        Arc::clone(&store),
    );
    let running = service.start(CancellationToken::new()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    running.shutdown();
    let report = running.join().await.unwrap();

    assert_eq!(report.aborted_tasks, 0);
    assert_eq!(report.health.writer.duplicates_skipped, 0);

    let mut acquired = 0;
    for name in ["Press", "Drill"] {
        let seqs = stored_sequences(store.as_ref(), name);
        assert!(!seqs.is_empty(), "{} stored nothing", name);
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
        acquired += report.health.source(name).unwrap().readings_acquired;
    }

    assert_eq!(store.count().unwrap() + report.unacked, acquired as usize);
    assert_eq!(report.spilled, report.unacked);
    assert_eq!(client.open_sessions(), 0);
}

#[tokio::test]
async fn test_recovers_after_connect_failures() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::new();
    client.fail_connects(3, ConnectError::Unreachable("switch rebooting".into()));
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let running = AcquisitionService::new(
        config(dir.path(), vec![source("Press")]),
        Arc::new(client.clone()),
        Arc::clone(&store),
    )
    .start(CancellationToken::new())
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let health = running.health();
    let press = health.source("Press").unwrap();
    assert_eq!(press.connect_failures, 3);
    assert_eq!(press.state, ConnectionState::Connected);

    running.shutdown();
    running.join().await.unwrap();

    assert_eq!(client.connect_attempts(), 4);
    assert!(store.count().unwrap() > 0);
}

#[tokio::test]
async fn test_dead_source_does_not_stall_others() {
    let dir = tempfile::tempdir().unwrap();
    let alive = MockClient::new();
    let dead = MockClient::new();
    dead.hang_connects(10_000);

    let routes = HashMap::from([
        ("opc.tcp://alive:4840".to_string(), alive),
        ("opc.tcp://dead:4840".to_string(), dead.clone()),
    ]);
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let running = AcquisitionService::new(
        config(dir.path(), vec![source("Alive"), source("Dead")]),
        Arc::new(RoutedClient { routes }),
        Arc::clone(&store),
    )
    .start(CancellationToken::new())
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = running.health();
    assert_eq!(
        health.source("Dead").unwrap().state,
        ConnectionState::Connecting
    );
    assert!(health.source("Alive").unwrap().readings_committed > 0);

    running.shutdown();
    running.join().await.unwrap();

    assert!(dead.connect_attempts() > 1);
    assert!(stored_sequences(store.as_ref(), "Dead").is_empty());
    assert!(!stored_sequences(store.as_ref(), "Alive").is_empty());
}

#[tokio::test]
async fn test_shutdown_mid_read_completes_within_grace() {
    let dir = tempfile::tempdir().unwrap();
    let client = MockClient::new();
    client.push_read(MockRead::Hang);
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let running = AcquisitionService::new(
        config(dir.path(), vec![source("Press")]),
        Arc::new(client.clone()),
        store,
    )
    .start(CancellationToken::new())
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.successful_reads(), 0);

    running.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(2), running.join())
        .await
        .expect("shutdown exceeded grace period")
        .unwrap();

    assert_eq!(report.aborted_tasks, 0);
    assert_eq!(client.open_sessions(), 0);
}

#[tokio::test]
async fn test_restart_resumes_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("plant.db");

    let first = {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let running = AcquisitionService::new(
            config(dir.path(), vec![source("Press")]),
            Arc::new(MockClient::new()),
            Arc::clone(&store),
        )
        .start(CancellationToken::new())
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        running.shutdown();
        running.join().await.unwrap();
        store.max_sequence("Press").unwrap().unwrap()
    };

    {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let running = AcquisitionService::new(
            config(dir.path(), vec![source("Press")]),
            Arc::new(MockClient::new()),
            store,
        )
        .start(CancellationToken::new())
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        running.shutdown();
        running.join().await.unwrap();
    }

    let store = SqliteStore::open(&db).unwrap();
    let seqs = stored_sequences(&store, "Press");
    assert!(*seqs.last().unwrap() > first);
    // Spilled tail of the first run was replayed, so nothing is missing
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());

    let tail = read_spill(&dir.path().join("spill.jsonl")).unwrap();
    if let Some(reading) = tail.first() {
        assert_eq!(reading.sequence, seqs.len() as u64 + 1);
    }
}

#[tokio::test]
async fn test_spilled_readings_are_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let spill_path = dir.path().join("spill.jsonl");

    // Writer flushes only on its first (immediate) tick
    let mut stalled = config(dir.path(), vec![source("Press")]);
    stalled.writer.flush_interval_ms = 60_000;

    let running = AcquisitionService::new(stalled, Arc::new(MockClient::new()), Arc::clone(&store))
        .start(CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    running.shutdown();
    let report = running.join().await.unwrap();

    assert!(report.unacked > 0);
    assert_eq!(report.spilled, report.unacked);
    assert_eq!(read_spill(&spill_path).unwrap().len(), report.unacked);
    let committed_before = store.count().unwrap();

    let running = AcquisitionService::new(
        config(dir.path(), vec![source("Press")]),
        Arc::new(MockClient::new()),
        Arc::clone(&store),
    )
    .start(CancellationToken::new())
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.shutdown();
    running.join().await.unwrap();

    let seqs = stored_sequences(store.as_ref(), "Press");
    assert!(seqs.len() >= committed_before + report.spilled);
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_discard_policy_drops_unacked() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let mut discarding = config(dir.path(), vec![source("Press")]);
    discarding.writer.flush_interval_ms = 60_000;
    discarding.shutdown.unacked = UnackedPolicy::Discard;

    let running = AcquisitionService::new(
        discarding,
        Arc::new(MockClient::new()),
        Arc::clone(&store),
    )
    .start(CancellationToken::new())
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    running.shutdown();
    let report = running.join().await.unwrap();

    assert!(report.unacked > 0);
    assert_eq!(report.discarded, report.unacked);
    assert_eq!(report.spilled, 0);
    assert!(!dir.path().join("spill.jsonl").exists());
}

#[tokio::test]
async fn test_restart_after_discard_does_not_reuse_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());

    let mut discarding = config(dir.path(), vec![source("Press")]);
    discarding.writer.flush_interval_ms = 60_000;
    discarding.shutdown.unacked = UnackedPolicy::Discard;

    let running = AcquisitionService::new(
        discarding,
        Arc::new(MockClient::new()),
        Arc::clone(&store),
    )
    .start(CancellationToken::new())
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    running.shutdown();
    let first = running.join().await.unwrap();
    assert!(first.discarded > 0);

    let next = first.health.source("Press").unwrap().next_sequence;
    let committed = store.max_sequence("Press").unwrap().unwrap_or(0);
    assert!(next > committed + 1);
    assert_eq!(store.sequence_cursor("Press").unwrap(), Some(next));

    let running = AcquisitionService::new(
        config(dir.path(), vec![source("Press")]),
        Arc::new(MockClient::new()),
        Arc::clone(&store),
    )
    .start(CancellationToken::new())
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.shutdown();
    let second = running.join().await.unwrap();

    let resumed: Vec<u64> = stored_sequences(store.as_ref(), "Press")
        .into_iter()
        .filter(|seq| *seq > committed)
        .collect();
    assert_eq!(resumed.first().copied(), Some(next));
    assert_eq!(second.health.source("Press").unwrap().sequence_gaps, 1);
}
