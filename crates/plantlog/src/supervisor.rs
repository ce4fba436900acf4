// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reconnection supervisor.
//!
//! Per-source state machine:
//!
//! ```text
//!  Disconnected --> Connecting --connect ok--> Connected
//!                    ^    |                      |
//!                    |    +--connect err         | N read failures
//!                    |       (backoff, retry)    | or broken session
//!                    |                           v
//!                    +------- close session --- Degraded
//! ```
//!
//! There is no terminal state; the owning task stops on cancellation.

use crate::config::ReconnectConfig;
use crate::error::{ConnectError, ReadError};
use crate::health::SourceHealth;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Connection state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Degraded,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capped exponential backoff with additive jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff; `jitter` is clamped to 0.0 - 1.0.
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt: `min(cap, base * 2^attempt)` plus up to
    /// `jitter` of that again.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);

        let delay = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.cap);

        if self.jitter > 0.0 {
            delay + delay.mul_f64(self.jitter * fastrand::f64())
        } else {
            delay
        }
    }

    /// Attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Failure detection and backoff for one source.
#[derive(Debug)]
pub struct Supervisor {
    source: String,
    state: ConnectionState,
    backoff: Backoff,
    consecutive_failures: u32,
    degraded_after: u32,
    health: Arc<SourceHealth>,
}

impl Supervisor {
    pub fn new(source: impl Into<String>, config: &ReconnectConfig, health: Arc<SourceHealth>) -> Self {
        Self {
            source: source.into(),
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(config.backoff_base(), config.backoff_max(), config.jitter),
            consecutive_failures: 0,
            degraded_after: config.degraded_after.max(1),
            health,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive read failures in the current session.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Backoff attempts since entering `Connecting`.
    pub fn backoff_attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            tracing::info!(
                source = %self.source,
                from = %self.state,
                to = %next,
                "Connection state changed"
            );
            self.state = next;
            self.health.set_state(next);
        }
    }

    /// Enter `Connecting`. The backoff restarts only when coming from
    /// `Disconnected` or `Degraded`.
    pub fn begin_connecting(&mut self) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Degraded => {
                self.backoff.reset();
                self.transition(ConnectionState::Connecting);
            }
            ConnectionState::Connecting => {}
            ConnectionState::Connected => self.transition(ConnectionState::Connecting),
        }
    }

    /// A connect attempt succeeded.
    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.consecutive_failures = 0;
        self.health.connects.fetch_add(1, Ordering::Relaxed);
        self.transition(ConnectionState::Connected);
    }

    /// A connect attempt failed. Returns the delay before the next attempt.
    pub fn on_connect_failed(&mut self, error: &ConnectError) -> Duration {
        self.health.connect_failures.fetch_add(1, Ordering::Relaxed);
        let delay = self.backoff.next_delay();
        tracing::warn!(
            source = %self.source,
            attempt = self.backoff.attempt(),
            retry_in_ms = delay.as_millis() as u64,
            "Connect failed: {}",
            error
        );
        delay
    }

    pub fn on_read_ok(&mut self) {
        self.consecutive_failures = 0;
    }

    /// A read failed. Returns true if the session is now degraded.
    pub fn on_read_failed(&mut self, error: &ReadError) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.health.read_failures.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            source = %self.source,
            consecutive = self.consecutive_failures,
            "Read failed: {}",
            error
        );

        if error.is_session_broken() || self.consecutive_failures >= self.degraded_after {
            self.transition(ConnectionState::Degraded);
            true
        } else {
            false
        }
    }

    /// The task stopped.
    pub fn on_stopped(&mut self) {
        self.transition(ConnectionState::Disconnected);
    }
}
