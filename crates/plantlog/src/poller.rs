// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Source poller
//!
//! One task per source. Drives the connection through its supervisor and
//! turns every successful read into sequenced readings.
//!
//! # Operation
//!
//! 1. Connect, backing off between failed attempts
//! 2. On each interval tick read all tags
//! 3. Stamp, sequence and push readings into the source buffer
//! 4. On degradation close the session and go back to 1

use crate::buffer::ReadingBuffer;
use crate::config::{ReconnectConfig, SourceConfig};
use crate::connection::{ProtocolClient, SourceConnection};
use crate::health::SourceHealth;
use crate::reading::{Clock, Reading, TagValue};
use crate::supervisor::{ConnectionState, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Per-source acquisition loop.
pub struct Poller {
    source: String,
    tags: Vec<String>,
    on_change: Vec<bool>,
    last_emitted: Vec<Option<TagValue>>,
    connection: SourceConnection,
    supervisor: Supervisor,
    buffer: Arc<ReadingBuffer>,
    health: Arc<SourceHealth>,
    clock: Clock,
    poll_interval: Duration,
    next_sequence: u64,
    overflowing: bool,
}

impl Poller {
    /// Create a poller for a source. Sequences start at 1 unless
    /// [`starting_at`](Self::starting_at) says otherwise.
    pub fn new(
        source: &SourceConfig,
        client: Arc<dyn ProtocolClient>,
        reconnect: &ReconnectConfig,
        buffer: Arc<ReadingBuffer>,
        health: Arc<SourceHealth>,
    ) -> Self {
        let connection = SourceConnection::new(
            source,
            client,
            reconnect.connect_timeout(),
            reconnect.read_timeout(),
        );
        let supervisor = Supervisor::new(&source.name, reconnect, Arc::clone(&health));

        Self {
            source: source.name.clone(),
            tags: source.addresses(),
            on_change: source.tags.iter().map(|t| t.on_change).collect(),
            last_emitted: vec![None; source.tags.len()],
            connection,
            supervisor,
            buffer,
            health,
            clock: Clock::new(),
            poll_interval: source.poll_interval(),
            next_sequence: 1,
            overflowing: false,
        }
    }

    /// Share the service clock so monotonic offsets are comparable.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// First sequence number to assign.
    pub fn starting_at(mut self, sequence: u64) -> Self {
        self.next_sequence = sequence;
        self.health.set_next_sequence(sequence);
        self
    }

    /// Next sequence number that will be assigned.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Run until cancelled. The session is closed before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            source = %self.source,
            tags = self.tags.len(),
            interval_ms = self.poll_interval.as_millis() as u64,
            first_sequence = self.next_sequence,
            "Poller started"
        );

        // One schedule for the whole run; reconnects do not shift it.
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if !self.connection.is_connected() && !self.connect(&cancel).await {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connection.read_all() => result,
            };

            match result {
                Ok(values) => {
                    self.supervisor.on_read_ok();
                    self.emit(values);
                }
                Err(e) => {
                    if self.supervisor.on_read_failed(&e) {
                        self.connection.close().await;
                    }
                }
            }
        }

        self.connection.close().await;
        self.supervisor.on_stopped();
        tracing::info!(
            source = %self.source,
            next_sequence = self.next_sequence,
            "Poller stopped"
        );
    }

    /// Connect with backoff. Returns false if cancelled first.
    async fn connect(&mut self, cancel: &CancellationToken) -> bool {
        self.supervisor.begin_connecting();

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.connection.connect() => result,
            };

            match result {
                Ok(()) => {
                    self.supervisor.on_connected();
                    return true;
                }
                Err(e) => {
                    let delay = self.supervisor.on_connect_failed(&e);
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Turn one read into readings.
    ///
    /// Every reading consumes a sequence number, including those rejected by
    /// a full buffer, so losses show up as gaps downstream.
    fn emit(&mut self, values: Vec<TagValue>) {
        let (timestamp_ns, monotonic_ns) = self.clock.now();
        let mut accepted = 0u64;

        for (index, value) in values.into_iter().enumerate() {
            let unchanged = self.last_emitted[index]
                .as_ref()
                .is_some_and(|last| last.same_as(&value));
            if self.on_change[index] && unchanged {
                continue;
            }

            let sequence = self.next_sequence;
            self.next_sequence += 1;

            let reading = Reading {
                source: self.source.clone(),
                tag: self.tags[index].clone(),
                value: value.clone(),
                timestamp_ns,
                monotonic_ns,
                sequence,
            };

            match self.buffer.push(reading) {
                Ok(()) => {
                    accepted += 1;
                    if self.on_change[index] {
                        self.last_emitted[index] = Some(value);
                    }
                    if self.overflowing {
                        self.overflowing = false;
                        tracing::info!(source = %self.source, "Buffer accepting readings again");
                    }
                    tracing::trace!(source = %self.source, sequence, "Buffered reading");
                }
                Err(overflow) => {
                    if !self.overflowing {
                        self.overflowing = true;
                        tracing::warn!(source = %self.source, "Dropping readings: {}", overflow);
                    }
                }
            }
        }

        self.health.record_read(accepted);
        self.health.set_next_sequence(self.next_sequence);
    }
}
