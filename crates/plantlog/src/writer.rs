// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch writer
//!
//! Single consumer of every source buffer and sole owner of the store.
//!
//! Readings are peeked from the buffers, committed as one batch, and only
//! then acknowledged. A batch that fails to commit is held and retried with
//! backoff; it is never discarded.

use crate::buffer::ReadingBuffer;
use crate::config::WriterConfig;
use crate::error::WriteError;
use crate::health::{SourceHealth, WriterHealth};
use crate::reading::unix_now_ns;
use crate::store::{CommitOutcome, ReadingStore, WriteBatch};
use crate::supervisor::Backoff;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct SourceSlot {
    buffer: Arc<ReadingBuffer>,
    health: Arc<SourceHealth>,
    last_committed: Option<u64>,
}

/// Drains buffers into the store.
pub struct Writer<S: ReadingStore> {
    store: Arc<S>,
    config: WriterConfig,
    wake: Arc<Notify>,
    health: Arc<WriterHealth>,
    slots: Vec<SourceSlot>,
    index: HashMap<String, usize>,
    cursor: usize,
    next_batch_id: u64,
}

impl<S: ReadingStore> Writer<S> {
    /// Create a writer.
    ///
    /// `wake` must be the notifier shared with the buffers.
    pub fn new(
        store: Arc<S>,
        config: &WriterConfig,
        wake: Arc<Notify>,
        health: Arc<WriterHealth>,
    ) -> Self {
        Self {
            store,
            config: config.clone(),
            wake,
            health,
            slots: Vec::new(),
            index: HashMap::new(),
            cursor: 0,
            // Start-time based so ids do not repeat across runs
            next_batch_id: unix_now_ns(),
        }
    }

    /// Register a source buffer.
    ///
    /// `last_committed` is the highest sequence already in the store, used
    /// as the baseline for gap detection.
    pub fn add_source(
        &mut self,
        buffer: Arc<ReadingBuffer>,
        health: Arc<SourceHealth>,
        last_committed: Option<u64>,
    ) {
        self.index
            .insert(buffer.source().to_string(), self.slots.len());
        self.slots.push(SourceSlot {
            buffer,
            health,
            last_committed,
        });
    }

    /// Run until cancelled.
    ///
    /// Cancellation interrupts retry waits; readings of a batch that has not
    /// committed stay in their buffers.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            sources = self.slots.len(),
            max_batch = self.config.max_batch,
            flush_ms = self.config.flush_interval_ms,
            "Writer started"
        );

        let mut ticker = interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        'run: loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {
                    tracing::trace!("Writer woken by watermark");
                }
            }

            while let Some(batch) = self.next_batch() {
                let full = batch.len() >= self.config.max_batch;
                let batch = Arc::new(batch);

                match self.commit_with_retry(&batch, &cancel).await {
                    Some(outcome) => self.acknowledge(&batch, outcome),
                    None => break 'run,
                }

                if !full {
                    break;
                }
            }
        }

        tracing::info!("Writer stopped");
    }

    /// Build the next batch, round-robin over sources.
    ///
    /// Each source contributes a contiguous oldest-first run of readings.
    /// The starting source rotates between batches.
    pub fn next_batch(&mut self) -> Option<WriteBatch> {
        let count = self.slots.len();
        if count == 0 || self.config.max_batch == 0 {
            return None;
        }

        let available: Vec<usize> = self.slots.iter().map(|s| s.buffer.len()).collect();
        let share = (self.config.max_batch / count).max(1);
        let mut takes = vec![0usize; count];
        let mut remaining = self.config.max_batch;

        while remaining > 0 {
            let mut progressed = false;
            for offset in 0..count {
                let idx = (self.cursor + offset) % count;
                let step = share.min(available[idx] - takes[idx]).min(remaining);
                if step > 0 {
                    takes[idx] += step;
                    remaining -= step;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let mut readings = Vec::with_capacity(self.config.max_batch - remaining);
        for offset in 0..count {
            let idx = (self.cursor + offset) % count;
            if takes[idx] > 0 {
                readings.extend(self.slots[idx].buffer.drain(takes[idx]));
            }
        }
        self.cursor = (self.cursor + 1) % count;

        if readings.is_empty() {
            return None;
        }

        let id = self.next_batch_id;
        self.next_batch_id = self.next_batch_id.wrapping_add(1);
        Some(WriteBatch::new(id, readings))
    }

    /// Commit, retrying until success. Returns `None` if cancelled first.
    async fn commit_with_retry(
        &self,
        batch: &Arc<WriteBatch>,
        cancel: &CancellationToken,
    ) -> Option<CommitOutcome> {
        let mut backoff = Backoff::new(self.config.retry_base(), self.config.retry_max(), 0.0);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let store = Arc::clone(&self.store);
            let owned = Arc::clone(batch);
            let result = match tokio::task::spawn_blocking(move || store.commit_batch(&owned)).await
            {
                Ok(result) => result,
                Err(e) => Err(WriteError::Aborted(format!("commit task failed: {}", e))),
            };

            match result {
                Ok(outcome) => {
                    if self.health.set_alert(false) {
                        tracing::info!(
                            batch = batch.id,
                            attempts,
                            "Store recovered, alert cleared"
                        );
                    }
                    return Some(outcome);
                }
                Err(e) => {
                    self.health.write_failures.fetch_add(1, Ordering::Relaxed);

                    if attempts >= self.config.alert_after_attempts
                        && !self.health.set_alert(true)
                    {
                        tracing::error!(
                            batch = batch.id,
                            readings = batch.len(),
                            attempts,
                            "Store alert: batch still not committed: {}",
                            e
                        );
                    } else {
                        tracing::warn!(
                            batch = batch.id,
                            attempts,
                            "Commit failed: {}",
                            e
                        );
                    }

                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Release committed readings from their buffers and update counters.
    fn acknowledge(&mut self, batch: &WriteBatch, outcome: CommitOutcome) {
        let mut per_source: HashMap<&str, u64> = HashMap::new();

        for reading in &batch.readings {
            let Some(&idx) = self.index.get(&reading.source) else {
                continue;
            };
            let slot = &mut self.slots[idx];
            *per_source.entry(reading.source.as_str()).or_default() += 1;

            match slot.last_committed {
                Some(last) if reading.sequence <= last => {}
                Some(last) => {
                    if reading.sequence > last + 1 {
                        slot.health.sequence_gaps.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            source = %reading.source,
                            after = last,
                            next = reading.sequence,
                            missing = reading.sequence - last - 1,
                            "Sequence gap"
                        );
                    }
                    slot.last_committed = Some(reading.sequence);
                }
                None => slot.last_committed = Some(reading.sequence),
            }
        }

        for (source, up_to) in batch.high_water() {
            if let Some(&idx) = self.index.get(&source) {
                let slot = &self.slots[idx];
                slot.buffer.ack(up_to);
                slot.health
                    .record_write(per_source.get(source.as_str()).copied().unwrap_or(0));
            }
        }

        self.health.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.health
            .readings_committed
            .fetch_add(outcome.inserted as u64, Ordering::Relaxed);
        self.health
            .duplicates_skipped
            .fetch_add(outcome.duplicates as u64, Ordering::Relaxed);

        tracing::debug!(
            batch = batch.id,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "Batch committed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, OverflowPolicy};
    use crate::reading::{Reading, TagValue};
    use crate::sqlite::SqliteStore;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// SQLite store that fails a configurable number of commits first.
    struct FlakyStore {
        inner: SqliteStore,
        failures_left: AtomicU32,
        commits: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: SqliteStore::new_in_memory().unwrap(),
                failures_left: AtomicU32::new(failures),
                commits: AtomicU32::new(0),
            }
        }
    }

    impl ReadingStore for FlakyStore {
        fn commit_batch(&self, batch: &WriteBatch) -> Result<CommitOutcome, WriteError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(WriteError::Unavailable("database is locked".into()));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            self.inner.commit_batch(batch)
        }

        fn max_sequence(&self, source: &str) -> Result<Option<u64>, WriteError> {
            self.inner.max_sequence(source)
        }

        fn load(&self, source: &str) -> Result<Vec<Reading>, WriteError> {
            self.inner.load(source)
        }

        fn sources(&self) -> Result<Vec<(String, usize)>, WriteError> {
            self.inner.sources()
        }

        fn count(&self) -> Result<usize, WriteError> {
            self.inner.count()
        }

        fn latest_values(&self, source: &str) -> Result<Vec<Reading>, WriteError> {
            self.inner.latest_values(source)
        }

        fn sequence_cursor(&self, source: &str) -> Result<Option<u64>, WriteError> {
            self.inner.sequence_cursor(source)
        }

        fn save_sequence_cursor(&self, source: &str, next: u64) -> Result<(), WriteError> {
            self.inner.save_sequence_cursor(source, next)
        }
    }

    fn reading(source: &str, sequence: u64) -> Reading {
        Reading {
            source: source.to_string(),
            tag: "ns=2;s=rSpeed".to_string(),
            value: TagValue::Float(sequence as f64),
            timestamp_ns: 1_000 + sequence,
            monotonic_ns: sequence,
            sequence,
        }
    }

    fn config() -> WriterConfig {
        WriterConfig {
            flush_interval_ms: 20,
            max_batch: 100,
            retry_base_ms: 5,
            retry_max_ms: 20,
            alert_after_attempts: 3,
        }
    }

    struct Rig<S: ReadingStore> {
        store: Arc<S>,
        buffers: Vec<Arc<ReadingBuffer>>,
        sources: Vec<Arc<SourceHealth>>,
        health: Arc<WriterHealth>,
        writer: Writer<S>,
    }

    fn rig<S: ReadingStore>(store: S, config: &WriterConfig, names: &[&str]) -> Rig<S> {
        let store = Arc::new(store);
        let wake = Arc::new(Notify::new());
        let health = Arc::new(WriterHealth::default());
        let mut writer = Writer::new(
            Arc::clone(&store),
            config,
            Arc::clone(&wake),
            Arc::clone(&health),
        );

        let buffer_config = BufferConfig {
            capacity: 1_000,
            watermark: 1_000,
            overflow: OverflowPolicy::RejectNewest,
        };
        let mut buffers = Vec::new();
        let mut sources = Vec::new();
        for name in names {
            let buffer = Arc::new(ReadingBuffer::new(*name, &buffer_config, Arc::clone(&wake)));
            let source = Arc::new(SourceHealth::new(*name));
            writer.add_source(Arc::clone(&buffer), Arc::clone(&source), None);
            buffers.push(buffer);
            sources.push(source);
        }

        Rig {
            store,
            buffers,
            sources,
            health,
            writer,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_transient_failures_commit_exactly_once() {
        let rig = rig(FlakyStore::new(2), &config(), &["Press"]);
        for seq in 1..=10 {
            rig.buffers[0].push(reading("Press", seq)).unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(rig.writer.run(cancel.clone()));

        let buffer = Arc::clone(&rig.buffers[0]);
        wait_until(|| buffer.is_empty()).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(rig.store.count().unwrap(), 10);
        assert_eq!(rig.store.commits.load(Ordering::SeqCst), 1);
        assert_eq!(rig.health.write_failures.load(Ordering::Relaxed), 2);
        assert_eq!(rig.health.readings_committed.load(Ordering::Relaxed), 10);
        assert_eq!(rig.health.duplicates_skipped.load(Ordering::Relaxed), 0);
        assert!(!rig.health.alert());
        assert!(rig.sources[0].last_write_ns().is_some());
    }

    #[tokio::test]
    async fn test_alert_raised_while_batch_is_held() {
        let rig = rig(FlakyStore::new(u32::MAX), &config(), &["Press"]);
        for seq in 1..=10 {
            rig.buffers[0].push(reading("Press", seq)).unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(rig.writer.run(cancel.clone()));

        let health = Arc::clone(&rig.health);
        wait_until(|| health.alert()).await;
        assert_eq!(rig.buffers[0].len(), 10);

        // Store comes back: the held batch commits and the alert clears
        rig.store.failures_left.store(0, Ordering::SeqCst);
        let buffer = Arc::clone(&rig.buffers[0]);
        wait_until(|| buffer.is_empty()).await;
        assert!(!rig.health.alert());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(rig.store.count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_leaves_readings_buffered() {
        let rig = rig(FlakyStore::new(u32::MAX), &config(), &["Press"]);
        for seq in 1..=10 {
            rig.buffers[0].push(reading("Press", seq)).unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(rig.writer.run(cancel.clone()));

        let health = Arc::clone(&rig.health);
        wait_until(|| health.write_failures.load(Ordering::Relaxed) > 0).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(rig.buffers[0].len(), 10);
        assert_eq!(rig.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watermark_wakes_writer_early() {
        let config = WriterConfig {
            flush_interval_ms: 60_000,
            ..config()
        };
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let wake = Arc::new(Notify::new());
        let health = Arc::new(WriterHealth::default());
        let mut writer = Writer::new(Arc::clone(&store), &config, Arc::clone(&wake), health);

        let buffer_config = BufferConfig {
            capacity: 100,
            watermark: 5,
            overflow: OverflowPolicy::RejectNewest,
        };
        let buffer = Arc::new(ReadingBuffer::new("Press", &buffer_config, Arc::clone(&wake)));
        writer.add_source(Arc::clone(&buffer), Arc::new(SourceHealth::new("Press")), None);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(cancel.clone()));
        // Let the immediate first tick pass
        tokio::time::sleep(Duration::from_millis(50)).await;

        for seq in 1..=5 {
            buffer.push(reading("Press", seq)).unwrap();
        }
        let watched = Arc::clone(&buffer);
        wait_until(|| watched.is_empty()).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_gaps_counted_against_last_commit() {
        let rig = rig(FlakyStore::new(0), &config(), &["Press"]);
        for seq in [1, 2, 5, 6, 9] {
            rig.buffers[0].push(reading("Press", seq)).unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(rig.writer.run(cancel.clone()));
        let buffer = Arc::clone(&rig.buffers[0]);
        wait_until(|| buffer.is_empty()).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(rig.sources[0].sequence_gaps.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_round_robin_batch_is_fair_and_ordered() {
        let config = WriterConfig {
            max_batch: 20,
            ..config()
        };
        let mut rig = rig(FlakyStore::new(0), &config, &["Busy", "Quiet"]);
        for seq in 1..=100 {
            rig.buffers[0].push(reading("Busy", seq)).unwrap();
        }
        for seq in 1..=5 {
            rig.buffers[1].push(reading("Quiet", seq)).unwrap();
        }

        let batch = rig.writer.next_batch().unwrap();
        assert_eq!(batch.len(), 20);

        let busy: Vec<u64> = batch
            .readings
            .iter()
            .filter(|r| r.source == "Busy")
            .map(|r| r.sequence)
            .collect();
        let quiet: Vec<u64> = batch
            .readings
            .iter()
            .filter(|r| r.source == "Quiet")
            .map(|r| r.sequence)
            .collect();
        assert_eq!(busy, (1..=15).collect::<Vec<_>>());
        assert_eq!(quiet, (1..=5).collect::<Vec<_>>());

        // Peeking does not consume; the next batch starts from the other source
        let again = rig.writer.next_batch().unwrap();
        assert_eq!(again.readings[0].source, "Quiet");
        assert_ne!(again.id, batch.id);
    }

    #[test]
    fn test_empty_buffers_yield_no_batch() {
        let mut rig = rig(FlakyStore::new(0), &config(), &["Press", "Drill"]);
        assert!(rig.writer.next_batch().is_none());
    }
}
