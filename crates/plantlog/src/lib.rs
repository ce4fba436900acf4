// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plantlog Acquisition Service
//!
//! Polls industrial automation endpoints (one per production module) on a
//! fixed interval and persists every reading exactly once.
//!
//! # Features
//!
//! - **Independent sources** -- One task per endpoint; an outage in one never stalls another
//! - **Reconnection supervisor** -- Capped exponential backoff with jitter, degraded-session detection
//! - **Bounded buffers** -- Per-source, ack-based, configurable overflow policy
//! - **Idempotent batches** -- Readings keyed by (source, tag, sequence); retries never duplicate
//! - **Graceful shutdown** -- Bounded grace period, unacknowledged readings spilled and replayed
//!
//! # Architecture
//!
//! ```text
//! AcquisitionService
//! +-- Poller + Supervisor  (per source, drives SourceConnection)
//! +-- ReadingBuffer        (per source, single producer / single consumer)
//! +-- Writer               (round-robin batches, retry, ack)
//! +-- ReadingStore         (SQLite backend)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use plantlog::{AcquisitionService, ServiceConfig, SimulatedClient, SqliteStore};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ServiceConfig::from_file("plantlog.toml")?;
//! let store = Arc::new(SqliteStore::open(&config.store.path)?);
//! let service = AcquisitionService::new(config, Arc::new(SimulatedClient::new(0.0)), store);
//!
//! let cancel = CancellationToken::new();
//! let report = service.run(cancel).await?;
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod mock;
pub mod poller;
pub mod reading;
pub mod service;
pub mod sim;
pub mod spill;
pub mod sqlite;
pub mod store;
pub mod supervisor;
#[cfg(feature = "opcua-backend")]
pub mod ua;
pub mod writer;

pub use buffer::ReadingBuffer;
pub use config::{
    BufferConfig, ConfigError, Credentials, OverflowPolicy, ReconnectConfig, ServiceConfig,
    ShutdownConfig, SourceConfig, TagConfig, UnackedPolicy, WriterConfig,
};
pub use connection::{ProtocolClient, Session, SourceConnection};
pub use error::{ConnectError, Overflow, ReadError, ServiceError, WriteError};
pub use health::{HealthRegistry, HealthSnapshot, SourceHealth, SourceSnapshot, WriterHealth};
pub use mock::{MockClient, MockRead};
pub use poller::Poller;
pub use reading::{Clock, Reading, TagValue};
pub use service::{AcquisitionService, RunningService, ShutdownReport};
pub use sim::SimulatedClient;
pub use sqlite::SqliteStore;
pub use store::{CommitOutcome, ReadingStore, WriteBatch};
pub use supervisor::{Backoff, ConnectionState, Supervisor};
pub use writer::Writer;
