// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acquisition service
//!
//! Wires pollers, buffers and the writer together and owns the shutdown
//! sequence.
//!
//! ```text
//! AcquisitionService
//! +-- Poller (one task per source) --> ReadingBuffer --+
//! +-- Poller                       --> ReadingBuffer --+--> Writer --> ReadingStore
//! +-- health reporter
//! ```

use crate::buffer::ReadingBuffer;
use crate::config::{ServiceConfig, UnackedPolicy};
use crate::connection::ProtocolClient;
use crate::error::ServiceError;
use crate::health::{run_reporter, HealthRegistry, HealthSnapshot, SourceHealth, WriterHealth};
use crate::poller::Poller;
use crate::reading::{Clock, Reading};
use crate::spill::{read_spill, remove_spill, write_spill};
use crate::store::ReadingStore;
use crate::writer::Writer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Outcome of a completed shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Readings still unacknowledged when the tasks stopped
    pub unacked: usize,

    /// Readings written to the spill file
    pub spilled: usize,

    /// Readings dropped under the discard policy
    pub discarded: usize,

    /// Tasks that missed the grace period and were aborted
    pub aborted_tasks: usize,

    /// Final health counters
    pub health: HealthSnapshot,
}

/// The acquisition pipeline, ready to start.
pub struct AcquisitionService<S: ReadingStore> {
    config: ServiceConfig,
    client: Arc<dyn ProtocolClient>,
    store: Arc<S>,
    clock: Clock,
}

impl<S: ReadingStore> AcquisitionService<S> {
    /// Create a service from a validated configuration.
    pub fn new(config: ServiceConfig, client: Arc<dyn ProtocolClient>, store: Arc<S>) -> Self {
        Self {
            config,
            client,
            store,
            clock: Clock::new(),
        }
    }

    /// Run until `cancel` fires, then shut down.
    pub async fn run(self, cancel: CancellationToken) -> Result<ShutdownReport, ServiceError> {
        self.start(cancel).await?.join().await
    }

    /// Start all tasks.
    ///
    /// Sequences resume at the saved cursor or above the highest value found
    /// in the store or the spill file, whichever is larger. Spilled readings not yet stored are put back into
    /// their buffers before any poller runs.
    pub async fn start(self, cancel: CancellationToken) -> Result<RunningService, ServiceError> {
        self.config.validate()?;

        tracing::info!("Starting {}", self.config.service.name);
        tracing::info!("  Sources: {}", self.config.sources.len());
        tracing::info!("  Overflow policy: {:?}", self.config.buffer.overflow);
        tracing::info!("  Unacked policy: {:?}", self.config.shutdown.unacked);

        let spill_path = self.config.shutdown.spill_path.clone();
        let mut spilled_by_source: HashMap<String, Vec<Reading>> = HashMap::new();
        for reading in read_spill(&spill_path)? {
            spilled_by_source
                .entry(reading.source.clone())
                .or_default()
                .push(reading);
        }

        let wake = Arc::new(Notify::new());
        let writer_health = Arc::new(WriterHealth::default());
        let mut registry = HealthRegistry::new(Arc::clone(&writer_health));
        let mut writer = Writer::new(
            Arc::clone(&self.store),
            &self.config.writer,
            Arc::clone(&wake),
            writer_health,
        );

        let mut tasks = JoinSet::new();
        let mut sources = Vec::with_capacity(self.config.sources.len());

        for source in &self.config.sources {
            let stored_max = self.store.max_sequence(&source.name)?;
            let cursor = self.store.sequence_cursor(&source.name)?;

            let mut replay = spilled_by_source.remove(&source.name).unwrap_or_default();
            replay.retain(|r| stored_max.map_or(true, |max| r.sequence > max));
            replay.sort_by_key(|r| r.sequence);

            let resume_from = replay
                .last()
                .map(|r| r.sequence)
                .max(stored_max)
                .map_or(1, |max| max + 1)
                .max(cursor.unwrap_or(1));

            let buffer = Arc::new(ReadingBuffer::new(
                &source.name,
                &self.config.buffer,
                Arc::clone(&wake),
            ));
            let replayed = replay.len();
            let mut rejected = 0usize;
            for reading in replay {
                if buffer.push(reading).is_err() {
                    rejected += 1;
                }
            }
            if replayed > 0 {
                tracing::info!(
                    source = %source.name,
                    replayed = replayed - rejected,
                    rejected,
                    "Replayed spilled readings"
                );
            }

            let health = Arc::new(SourceHealth::new(&source.name));
            registry.register(Arc::clone(&health), Arc::clone(&buffer));
            // An empty store still anchors gap detection at zero
            writer.add_source(
                Arc::clone(&buffer),
                Arc::clone(&health),
                Some(stored_max.unwrap_or(0)),
            );

            let poller = Poller::new(
                source,
                Arc::clone(&self.client),
                &self.config.reconnect,
                Arc::clone(&buffer),
                Arc::clone(&health),
            )
            .with_clock(self.clock)
            .starting_at(resume_from);
            tasks.spawn(poller.run(cancel.child_token()));

            sources.push((health, buffer));
        }

        let orphans: Vec<Reading> = spilled_by_source.into_values().flatten().collect();
        if !orphans.is_empty() {
            tracing::warn!(
                readings = orphans.len(),
                "Spilled readings belong to unconfigured sources; keeping them in the spill file"
            );
        }

        tasks.spawn(writer.run(cancel.child_token()));

        if self.config.service.stats_interval_secs > 0 {
            tasks.spawn(run_reporter(
                registry.clone(),
                Duration::from_secs(self.config.service.stats_interval_secs),
                cancel.child_token(),
            ));
        }

        let store: Arc<dyn ReadingStore> = self.store;
        Ok(RunningService {
            cancel,
            tasks,
            sources,
            store,
            registry,
            orphans,
            grace: self.config.shutdown.grace(),
            unacked_policy: self.config.shutdown.unacked,
            spill_path,
        })
    }
}

/// Handle to a started service.
pub struct RunningService {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    sources: Vec<(Arc<SourceHealth>, Arc<ReadingBuffer>)>,
    store: Arc<dyn ReadingStore>,
    registry: HealthRegistry,
    orphans: Vec<Reading>,
    grace: Duration,
    unacked_policy: UnackedPolicy,
    spill_path: std::path::PathBuf,
}

impl RunningService {
    /// Current health counters.
    pub fn health(&self) -> HealthSnapshot {
        self.registry.snapshot()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for cancellation, stop every task within the grace period, then
    /// apply the unacknowledged-readings policy.
    pub async fn join(mut self) -> Result<ShutdownReport, ServiceError> {
        self.cancel.cancelled().await;
        tracing::info!(grace_ms = self.grace.as_millis() as u64, "Shutting down");

        let tasks = &mut self.tasks;
        let stopped = tokio::time::timeout(self.grace, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!("Task panicked: {}", e);
                    }
                }
            }
        })
        .await;

        let mut aborted_tasks = 0;
        if stopped.is_err() {
            aborted_tasks = self.tasks.len();
            tracing::warn!(tasks = aborted_tasks, "Grace period elapsed, aborting tasks");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        self.save_cursors().await;

        let mut unacked_readings: Vec<Reading> = Vec::new();
        for (_, buffer) in &self.sources {
            unacked_readings.extend(buffer.take_all());
        }
        let unacked = unacked_readings.len();
        let health = self.registry.snapshot();

        let (spilled, discarded) = match self.unacked_policy {
            UnackedPolicy::Spill => {
                unacked_readings.append(&mut self.orphans);
                if unacked_readings.is_empty() {
                    remove_spill(&self.spill_path)?;
                    (0, 0)
                } else {
                    (write_spill(&self.spill_path, &unacked_readings)?, 0)
                }
            }
            UnackedPolicy::Discard => {
                if unacked > 0 {
                    tracing::warn!(readings = unacked, "Discarding unacknowledged readings");
                }
                remove_spill(&self.spill_path)?;
                (0, unacked + self.orphans.len())
            }
        };

        tracing::info!(unacked, spilled, discarded, aborted_tasks, "Stopped");

        Ok(ShutdownReport {
            unacked,
            spilled,
            discarded,
            aborted_tasks,
            health,
        })
    }

    /// Persist every source's next sequence so numbers consumed by readings
    /// that never reached the store are not reused after a restart.
    async fn save_cursors(&self) {
        let cursors: Vec<(String, u64)> = self
            .sources
            .iter()
            .map(|(health, _)| (health.name().to_string(), health.next_sequence()))
            .collect();
        let store = Arc::clone(&self.store);

        let saved = tokio::task::spawn_blocking(move || {
            for (source, next) in &cursors {
                store.save_sequence_cursor(source, *next)?;
            }
            Ok::<_, crate::error::WriteError>(())
        })
        .await;

        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Cannot save sequence cursors: {}", e),
            Err(e) => tracing::warn!("Cursor save task failed: {}", e),
        }
    }
}
