// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulated protocol backend.
//!
//! Produces plausible values for IEC 61131-3 style addresses so the service
//! can run end-to-end without plant hardware. The value type follows the
//! variable name prefix of the last address segment:
//!
//! | Prefix | Type | Behavior |
//! |---|---|---|
//! | `x` | bool | toggles every few seconds |
//! | `udi`, `di`, `i`, `n` | int | slowly increasing counter |
//! | `s` | text | rotating order labels |
//! | anything else | float | sine wave |
//!
//! An optional fault rate injects connect and read failures.

use crate::config::Credentials;
use crate::connection::{ProtocolClient, Session};
use crate::error::{ConnectError, ReadError};
use crate::reading::TagValue;
use async_trait::async_trait;
use std::time::Instant;

/// Simulated client with optional fault injection.
pub struct SimulatedClient {
    fault_rate: f64,
    started: Instant,
}

impl SimulatedClient {
    /// Create a simulated client. `fault_rate` is clamped to 0.0 - 1.0.
    pub fn new(fault_rate: f64) -> Self {
        Self {
            fault_rate: fault_rate.clamp(0.0, 1.0),
            started: Instant::now(),
        }
    }

    fn should_fail(&self) -> bool {
        self.fault_rate > 0.0 && fastrand::f64() < self.fault_rate
    }
}

#[async_trait]
impl ProtocolClient for SimulatedClient {
    async fn open(
        &self,
        endpoint: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ConnectError> {
        if self.should_fail() {
            return Err(ConnectError::Unreachable(format!(
                "{} (simulated fault)",
                endpoint
            )));
        }

        Ok(Box::new(SimulatedSession {
            fault_rate: self.fault_rate,
            started: self.started,
        }))
    }
}

struct SimulatedSession {
    fault_rate: f64,
    started: Instant,
}

#[async_trait]
impl Session for SimulatedSession {
    async fn read(&mut self, addresses: &[String]) -> Result<Vec<TagValue>, ReadError> {
        if self.fault_rate > 0.0 && fastrand::f64() < self.fault_rate {
            return Err(ReadError::SessionBroken("simulated fault".into()));
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        addresses
            .iter()
            .map(|address| simulate(address, elapsed))
            .collect()
    }

    async fn close(&mut self) {}
}

fn simulate(address: &str, elapsed: f64) -> Result<TagValue, ReadError> {
    let name = address
        .rsplit(['.', '|', '='])
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ReadError::BadAddress(address.to_string()))?;

    let phase = (name.bytes().map(u64::from).sum::<u64>() % 7) as f64;

    let value = if name.starts_with('x') {
        TagValue::Bool(((elapsed + phase) / 5.0) as u64 % 2 == 0)
    } else if ["udi", "di", "i", "n"].iter().any(|p| name.starts_with(p)) {
        TagValue::Int(((elapsed + phase) / 10.0) as i64 + 1000)
    } else if name.starts_with('s') {
        TagValue::Text(format!("ORDER-{}", ((elapsed + phase) / 30.0) as u64))
    } else {
        TagValue::Float(50.0 + 10.0 * ((elapsed + phase) / 10.0).sin())
    };

    Ok(value)
}
