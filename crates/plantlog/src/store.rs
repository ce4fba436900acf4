// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reading store abstraction
//!
//! Defines the batch unit handed to the store and the trait storage backends
//! implement.

use crate::error::WriteError;
use crate::reading::Reading;
use std::collections::BTreeMap;

/// Readings committed together in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    /// Batch id, unique within one process run
    pub id: u64,

    /// Readings in drain order (acquisition order within each source)
    pub readings: Vec<Reading>,
}

impl WriteBatch {
    pub fn new(id: u64, readings: Vec<Reading>) -> Self {
        Self { id, readings }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Highest sequence per source contained in the batch.
    pub fn high_water(&self) -> BTreeMap<String, u64> {
        let mut marks: BTreeMap<String, u64> = BTreeMap::new();
        for reading in &self.readings {
            marks
                .entry(reading.source.clone())
                .and_modify(|seq| *seq = (*seq).max(reading.sequence))
                .or_insert(reading.sequence);
        }
        marks
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Rows newly written
    pub inserted: usize,

    /// Readings already present (same source, tag and sequence)
    pub duplicates: usize,
}

/// Reading store trait
///
/// Backend-agnostic interface used by the writer and the inspection CLI.
/// Calls are blocking; async callers go through `spawn_blocking`.
///
/// # Implementations
///
/// - `SqliteStore` -- file or in-memory SQLite
pub trait ReadingStore: Send + Sync + 'static {
    /// Commit a batch atomically.
    ///
    /// Re-committing readings that are already stored is a no-op for those
    /// readings, so a batch retried after an ambiguous failure never
    /// duplicates rows.
    fn commit_batch(&self, batch: &WriteBatch) -> Result<CommitOutcome, WriteError>;

    /// Highest stored sequence for a source
    fn max_sequence(&self, source: &str) -> Result<Option<u64>, WriteError>;

    /// All stored readings of a source in sequence order
    fn load(&self, source: &str) -> Result<Vec<Reading>, WriteError>;

    /// Stored sources with their reading counts
    fn sources(&self) -> Result<Vec<(String, usize)>, WriteError>;

    /// Total number of stored readings
    fn count(&self) -> Result<usize, WriteError>;

    /// Most recent reading of every tag of a source
    fn latest_values(&self, source: &str) -> Result<Vec<Reading>, WriteError>;

    /// Next sequence a source would have assigned when it last stopped
    fn sequence_cursor(&self, source: &str) -> Result<Option<u64>, WriteError>;

    /// Record the next sequence of a source. A cursor never moves backwards.
    fn save_sequence_cursor(&self, source: &str, next_sequence: u64) -> Result<(), WriteError>;
}
