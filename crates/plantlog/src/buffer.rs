// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-source reading buffer.
//!
//! Bounded, ordered holding area between a poller (single producer) and the
//! writer (single consumer). Readings leave the buffer only when the writer
//! acknowledges them after a confirmed commit, so a batch that fails to
//! commit is simply drained again.

use crate::config::{BufferConfig, OverflowPolicy};
use crate::error::Overflow;
use crate::reading::Reading;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Slots {
    queue: VecDeque<Reading>,
    /// Highest sequence handed to the writer and not yet acknowledged
    drained_through: Option<u64>,
    /// Evicted readings that were already handed to the writer
    evicted_in_flight: Vec<u64>,
}

/// Bounded FIFO of readings with ack-based removal.
#[derive(Debug)]
pub struct ReadingBuffer {
    source: String,
    capacity: usize,
    watermark: usize,
    policy: OverflowPolicy,
    slots: Mutex<Slots>,
    dropped: AtomicU64,
    wake: Arc<Notify>,
}

impl ReadingBuffer {
    /// Create a buffer for a source.
    ///
    /// `wake` is notified whenever the fill level reaches the watermark.
    pub fn new(source: impl Into<String>, config: &BufferConfig, wake: Arc<Notify>) -> Self {
        Self {
            source: source.into(),
            capacity: config.capacity,
            watermark: config.watermark.min(config.capacity),
            policy: config.overflow,
            slots: Mutex::new(Slots {
                queue: VecDeque::with_capacity(config.capacity.min(4096)),
                ..Default::default()
            }),
            dropped: AtomicU64::new(0),
            wake,
        }
    }

    /// Source name
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Append a reading.
    ///
    /// On a full buffer the configured overflow policy applies and the
    /// dropped-sample counter is incremented. A reading evicted while the
    /// writer holds it is only counted if that batch is never acknowledged.
    pub fn push(&self, reading: Reading) -> Result<(), Overflow> {
        let len = {
            let mut slots = self.slots.lock();
            if slots.queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::RejectNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(Overflow {
                            capacity: self.capacity,
                            sequence: reading.sequence,
                        });
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(evicted) = slots.queue.pop_front() {
                            let in_flight = slots
                                .drained_through
                                .is_some_and(|through| evicted.sequence <= through);
                            if in_flight {
                                slots.evicted_in_flight.push(evicted.sequence);
                            } else {
                                self.dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            }
            slots.queue.push_back(reading);
            slots.queue.len()
        };

        if len >= self.watermark {
            self.wake.notify_one();
        }

        Ok(())
    }

    /// Oldest `max` readings in acquisition order, without removing them.
    pub fn drain(&self, max: usize) -> Vec<Reading> {
        let mut slots = self.slots.lock();
        let readings: Vec<Reading> = slots.queue.iter().take(max).cloned().collect();
        if let Some(last) = readings.last() {
            let through = slots
                .drained_through
                .map_or(last.sequence, |s| s.max(last.sequence));
            slots.drained_through = Some(through);
        }
        readings
    }

    /// Remove every front reading with `sequence <= up_to`.
    ///
    /// Returns the number of readings removed.
    pub fn ack(&self, up_to: u64) -> usize {
        let mut slots = self.slots.lock();
        let mut removed = 0;
        while slots.queue.front().is_some_and(|r| r.sequence <= up_to) {
            slots.queue.pop_front();
            removed += 1;
        }

        // Evicted readings covered by the ack were committed after all
        slots.evicted_in_flight.retain(|seq| *seq > up_to);
        if slots.drained_through.is_some_and(|through| through <= up_to) {
            slots.drained_through = None;
        }
        removed
    }

    /// Remove and return everything (shutdown path).
    ///
    /// Evicted readings whose batch was never acknowledged are counted as
    /// dropped here.
    pub fn take_all(&self) -> Vec<Reading> {
        let mut slots = self.slots.lock();
        let lost = slots.evicted_in_flight.len() as u64;
        if lost > 0 {
            self.dropped.fetch_add(lost, Ordering::Relaxed);
        }
        slots.evicted_in_flight.clear();
        slots.drained_through = None;
        slots.queue.drain(..).collect()
    }

    /// Unacknowledged readings.
    pub fn len(&self) -> usize {
        self.slots.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().queue.is_empty()
    }

    /// True when the fill level is at or above the watermark.
    pub fn above_watermark(&self) -> bool {
        self.len() >= self.watermark
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Readings lost to overflow since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::TagValue;

    fn reading(sequence: u64) -> Reading {
        Reading {
            source: "Press".to_string(),
            tag: "ns=2;s=a".to_string(),
            value: TagValue::Int(sequence as i64),
            timestamp_ns: 1_000 + sequence,
            monotonic_ns: sequence,
            sequence,
        }
    }

    fn buffer(capacity: usize, watermark: usize, overflow: OverflowPolicy) -> ReadingBuffer {
        let config = BufferConfig {
            capacity,
            watermark,
            overflow,
        };
        ReadingBuffer::new("Press", &config, Arc::new(Notify::new()))
    }

    #[test]
    fn test_drain_preserves_push_order() {
        let buf = buffer(100, 100, OverflowPolicy::RejectNewest);
        for seq in 0..20 {
            buf.push(reading(seq)).unwrap();
        }

        let drained: Vec<u64> = buf.drain(50).iter().map(|r| r.sequence).collect();
        assert_eq!(drained, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_is_non_destructive() {
        let buf = buffer(10, 10, OverflowPolicy::RejectNewest);
        for seq in 0..5 {
            buf.push(reading(seq)).unwrap();
        }

        assert_eq!(buf.drain(3).len(), 3);
        assert_eq!(buf.drain(3)[0].sequence, 0);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_ack_removes_prefix() {
        let buf = buffer(10, 10, OverflowPolicy::RejectNewest);
        for seq in 0..5 {
            buf.push(reading(seq)).unwrap();
        }

        assert_eq!(buf.ack(2), 3);
        assert_eq!(buf.drain(10)[0].sequence, 3);
        assert_eq!(buf.ack(2), 0);
        assert_eq!(buf.ack(100), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_full_buffer_rejects_newest() {
        let buf = buffer(3, 3, OverflowPolicy::RejectNewest);
        for seq in 0..3 {
            buf.push(reading(seq)).unwrap();
        }

        let err = buf.push(reading(3)).unwrap_err();
        assert_eq!(
            err,
            Overflow {
                capacity: 3,
                sequence: 3
            }
        );
        assert_eq!(buf.dropped(), 1);

        let kept: Vec<u64> = buf.drain(10).iter().map(|r| r.sequence).collect();
        assert_eq!(kept, vec![0, 1, 2]);
    }

    #[test]
    fn test_drop_oldest_policy() {
        let buf = buffer(3, 3, OverflowPolicy::DropOldest);
        for seq in 0..5 {
            buf.push(reading(seq)).unwrap();
        }

        let kept: Vec<u64> = buf.drain(10).iter().map(|r| r.sequence).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(buf.dropped(), 2);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_evicting_drained_reading_counts_only_if_never_acked() {
        let buf = buffer(3, 3, OverflowPolicy::DropOldest);
        for seq in 0..3 {
            buf.push(reading(seq)).unwrap();
        }

        // Writer holds 0 and 1 while the poller overruns the buffer
        assert_eq!(buf.drain(2).len(), 2);
        buf.push(reading(3)).unwrap();
        buf.push(reading(4)).unwrap();
        buf.push(reading(5)).unwrap();
        assert_eq!(buf.dropped(), 1);

        // The held batch commits, so only sequence 2 was lost
        assert_eq!(buf.ack(1), 0);
        assert_eq!(buf.dropped(), 1);
        let kept: Vec<u64> = buf.drain(10).iter().map(|r| r.sequence).collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    #[test]
    fn test_unacked_evictions_count_at_shutdown() {
        let buf = buffer(2, 2, OverflowPolicy::DropOldest);
        buf.push(reading(0)).unwrap();
        buf.push(reading(1)).unwrap();
        buf.drain(2);
        buf.push(reading(2)).unwrap();
        assert_eq!(buf.dropped(), 0);

        let left: Vec<u64> = buf.take_all().iter().map(|r| r.sequence).collect();
        assert_eq!(left, vec![1, 2]);
        assert_eq!(buf.dropped(), 1);
    }

    #[tokio::test]
    async fn test_watermark_wakes_consumer() {
        let wake = Arc::new(Notify::new());
        let config = BufferConfig {
            capacity: 10,
            watermark: 2,
            overflow: OverflowPolicy::RejectNewest,
        };
        let buf = ReadingBuffer::new("Press", &config, Arc::clone(&wake));

        buf.push(reading(0)).unwrap();
        assert!(!buf.above_watermark());
        buf.push(reading(1)).unwrap();
        assert!(buf.above_watermark());

        // Permit stored by notify_one
        tokio::time::timeout(std::time::Duration::from_millis(100), wake.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_take_all_empties_buffer() {
        let buf = buffer(10, 10, OverflowPolicy::RejectNewest);
        for seq in 0..4 {
            buf.push(reading(seq)).unwrap();
        }

        assert_eq!(buf.take_all().len(), 4);
        assert!(buf.is_empty());
    }
}
