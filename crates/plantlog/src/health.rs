// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Health counters and snapshots.
//!
//! Counters are lock-free atomics updated by the owning task and read by the
//! reporter; nothing here feeds back into the pipeline.

use crate::buffer::ReadingBuffer;
use crate::reading::unix_now_ns;
use crate::supervisor::ConnectionState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Live counters of one source.
#[derive(Debug)]
pub struct SourceHealth {
    name: String,
    state: AtomicU8,
    pub readings_acquired: AtomicU64,
    pub read_failures: AtomicU64,
    pub connect_failures: AtomicU64,
    pub connects: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub readings_committed: AtomicU64,
    last_read_ns: AtomicU64,
    last_write_ns: AtomicU64,
    next_sequence: AtomicU64,
}

impl SourceHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            readings_acquired: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            sequence_gaps: AtomicU64::new(0),
            readings_committed: AtomicU64::new(0),
            last_read_ns: AtomicU64::new(0),
            last_write_ns: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, readings: u64) {
        self.readings_acquired.fetch_add(readings, Ordering::Relaxed);
        self.last_read_ns.store(unix_now_ns(), Ordering::Relaxed);
    }

    pub(crate) fn record_write(&self, readings: u64) {
        self.readings_committed
            .fetch_add(readings, Ordering::Relaxed);
        self.last_write_ns.store(unix_now_ns(), Ordering::Relaxed);
    }

    /// Next sequence the poller will assign.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next_sequence(&self, sequence: u64) {
        self.next_sequence.store(sequence, Ordering::Relaxed);
    }

    /// Reconnections after the first successful connect.
    pub fn reconnects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Last successful write for this source (Unix ns), if any.
    pub fn last_write_ns(&self) -> Option<u64> {
        match self.last_write_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(ns),
        }
    }

    /// Last successful read (Unix ns), if any.
    pub fn last_read_ns(&self) -> Option<u64> {
        match self.last_read_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(ns),
        }
    }
}

/// Live counters of the writer.
#[derive(Debug, Default)]
pub struct WriterHealth {
    pub batches_committed: AtomicU64,
    pub readings_committed: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub write_failures: AtomicU64,
    alert: AtomicBool,
}

impl WriterHealth {
    /// True while a batch has exceeded the retry ceiling without committing.
    pub fn alert(&self) -> bool {
        self.alert.load(Ordering::Relaxed)
    }

    pub(crate) fn set_alert(&self, raised: bool) -> bool {
        self.alert.swap(raised, Ordering::Relaxed)
    }
}

/// Point-in-time view of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub name: String,
    pub state: ConnectionState,
    pub buffered: usize,
    pub dropped: u64,
    pub readings_acquired: u64,
    pub readings_committed: u64,
    pub read_failures: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub sequence_gaps: u64,
    pub next_sequence: u64,
    pub last_read_ns: Option<u64>,
    pub last_write_ns: Option<u64>,
}

/// Point-in-time view of the writer.
#[derive(Debug, Clone, Serialize)]
pub struct WriterSnapshot {
    pub batches_committed: u64,
    pub readings_committed: u64,
    pub duplicates_skipped: u64,
    pub write_failures: u64,
    pub alert: bool,
}

/// Point-in-time view of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub sources: Vec<SourceSnapshot>,
    pub writer: WriterSnapshot,
}

impl HealthSnapshot {
    /// Source entry by name.
    pub fn source(&self, name: &str) -> Option<&SourceSnapshot> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// All health handles of a running service.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    sources: Vec<(Arc<SourceHealth>, Arc<ReadingBuffer>)>,
    writer: Arc<WriterHealth>,
}

impl HealthRegistry {
    pub fn new(writer: Arc<WriterHealth>) -> Self {
        Self {
            sources: Vec::new(),
            writer,
        }
    }

    pub fn register(&mut self, health: Arc<SourceHealth>, buffer: Arc<ReadingBuffer>) {
        self.sources.push((health, buffer));
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let sources = self
            .sources
            .iter()
            .map(|(health, buffer)| SourceSnapshot {
                name: health.name().to_string(),
                state: health.state(),
                buffered: buffer.len(),
                dropped: buffer.dropped(),
                readings_acquired: health.readings_acquired.load(Ordering::Relaxed),
                readings_committed: health.readings_committed.load(Ordering::Relaxed),
                read_failures: health.read_failures.load(Ordering::Relaxed),
                connect_failures: health.connect_failures.load(Ordering::Relaxed),
                reconnects: health.reconnects(),
                sequence_gaps: health.sequence_gaps.load(Ordering::Relaxed),
                next_sequence: health.next_sequence(),
                last_read_ns: health.last_read_ns(),
                last_write_ns: health.last_write_ns(),
            })
            .collect();

        HealthSnapshot {
            sources,
            writer: WriterSnapshot {
                batches_committed: self.writer.batches_committed.load(Ordering::Relaxed),
                readings_committed: self.writer.readings_committed.load(Ordering::Relaxed),
                duplicates_skipped: self.writer.duplicates_skipped.load(Ordering::Relaxed),
                write_failures: self.writer.write_failures.load(Ordering::Relaxed),
                alert: self.writer.alert(),
            },
        }
    }
}

/// Log a snapshot, one line per source.
pub fn log_snapshot(snapshot: &HealthSnapshot) {
    for source in &snapshot.sources {
        tracing::info!(
            source = %source.name,
            state = %source.state,
            buffered = source.buffered,
            dropped = source.dropped,
            acquired = source.readings_acquired,
            committed = source.readings_committed,
            reconnects = source.reconnects,
            gaps = source.sequence_gaps,
            "source health"
        );
    }

    let writer = &snapshot.writer;
    if writer.alert {
        tracing::error!(
            failures = writer.write_failures,
            "store alert: batch held, retries exceeded ceiling"
        );
    }
    tracing::info!(
        batches = writer.batches_committed,
        committed = writer.readings_committed,
        duplicates = writer.duplicates_skipped,
        failures = writer.write_failures,
        "writer health"
    );
}

/// Periodically log health until cancelled.
pub async fn run_reporter(registry: HealthRegistry, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => log_snapshot(&registry.snapshot()),
        }
    }
}
