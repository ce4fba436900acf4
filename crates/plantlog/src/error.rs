// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy of the acquisition pipeline.
//!
//! Connect and read errors stay inside a source task, overflow is counted by
//! the buffer, write errors are retried by the writer. Only configuration and
//! startup store errors surface as [`ServiceError`].

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure to establish a session with an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to read the configured tags from an open session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad tag address: {0}")]
    BadAddress(String),

    #[error("session broken: {0}")]
    SessionBroken(String),

    #[error("truncated read: expected {expected} values, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("not connected")]
    NotConnected,
}

impl ReadError {
    /// Errors after which the session cannot be reused.
    pub fn is_session_broken(&self) -> bool {
        matches!(self, Self::SessionBroken(_) | Self::NotConnected)
    }
}

/// Buffer full: the reading was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("buffer full ({capacity} readings), sequence {sequence} rejected")]
pub struct Overflow {
    pub capacity: usize,
    pub sequence: u64,
}

/// Failure to commit a batch to the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl From<rusqlite::Error> for WriteError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::ConstraintViolation => Self::Constraint(e.to_string()),
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull => Self::Unavailable(e.to_string()),
                _ => Self::Aborted(e.to_string()),
            },
            _ => Self::Aborted(e.to_string()),
        }
    }
}

/// Fatal service errors (startup only).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] WriteError),

    #[error("Spill file error: {0}")]
    Spill(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
