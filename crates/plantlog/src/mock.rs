// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Scripted protocol client for tests.
//!
//! Connects and reads succeed by default. Failures are queued explicitly and
//! consumed in order, so a test can describe an exact outage:
//!
//! ```ignore
//! let client = MockClient::new();
//! client.fail_connects(2, ConnectError::Unreachable("down".into()));
//! client.fail_reads(3, ReadError::Timeout(Duration::from_secs(1)));
//! ```

use crate::config::Credentials;
use crate::connection::{ProtocolClient, Session};
use crate::error::{ConnectError, ReadError};
use crate::reading::TagValue;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Scripted outcome of one read.
#[derive(Debug, Clone)]
pub enum MockRead {
    /// Return one value per address.
    Values,
    /// Fail with the given error.
    Fail(ReadError),
    /// Return the previous values again.
    Repeat,
    /// Return this value for every address.
    Value(TagValue),
    /// Return one value fewer than requested.
    Short,
    /// Never complete.
    Hang,
}

#[derive(Debug, Clone)]
enum MockConnect {
    Fail(ConnectError),
    Hang,
}

#[derive(Default)]
struct MockState {
    connect_script: VecDeque<MockConnect>,
    read_script: VecDeque<MockRead>,
    connect_attempts: u64,
    reads: u64,
    successful_reads: u64,
    open_sessions: i64,
    counter: i64,
}

/// Mock protocol client; clones share state.
#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    /// Create a new mock client
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_connects(&self, count: usize, error: ConnectError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.connect_script.push_back(MockConnect::Fail(error.clone()));
        }
    }

    /// Make the next `count` connect attempts hang.
    pub fn hang_connects(&self, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.connect_script.push_back(MockConnect::Hang);
        }
    }

    /// Fail the next `count` reads.
    pub fn fail_reads(&self, count: usize, error: ReadError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.read_script.push_back(MockRead::Fail(error.clone()));
        }
    }

    /// Queue one scripted read.
    pub fn push_read(&self, read: MockRead) {
        self.state.lock().read_script.push_back(read);
    }

    /// Connect attempts so far.
    pub fn connect_attempts(&self) -> u64 {
        self.state.lock().connect_attempts
    }

    /// Reads attempted so far.
    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }

    /// Reads that returned values.
    pub fn successful_reads(&self) -> u64 {
        self.state.lock().successful_reads
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> i64 {
        self.state.lock().open_sessions
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn open(
        &self,
        _endpoint: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let scripted = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.connect_script.pop_front()
        };

        match scripted {
            Some(MockConnect::Fail(e)) => Err(e),
            Some(MockConnect::Hang) => std::future::pending().await,
            None => {
                self.state.lock().open_sessions += 1;
                Ok(Box::new(MockSession {
                    state: Arc::clone(&self.state),
                    open: true,
                }))
            }
        }
    }
}

struct MockSession {
    state: Arc<Mutex<MockState>>,
    open: bool,
}

#[async_trait]
impl Session for MockSession {
    async fn read(&mut self, addresses: &[String]) -> Result<Vec<TagValue>, ReadError> {
        let scripted = {
            let mut state = self.state.lock();
            state.reads += 1;
            state.read_script.pop_front().unwrap_or(MockRead::Values)
        };

        let short = matches!(scripted, MockRead::Short);
        let repeat = matches!(scripted, MockRead::Repeat);
        match scripted {
            MockRead::Fail(e) => Err(e),
            MockRead::Hang => std::future::pending().await,
            MockRead::Value(value) => {
                self.state.lock().successful_reads += 1;
                Ok(addresses.iter().map(|_| value.clone()).collect())
            }
            MockRead::Values | MockRead::Repeat | MockRead::Short => {
                let mut state = self.state.lock();
                state.successful_reads += 1;
                if !repeat {
                    state.counter += 1;
                }
                let counter = state.counter;
                let mut values: Vec<TagValue> =
                    addresses.iter().map(|_| TagValue::Int(counter)).collect();
                if short {
                    values.pop();
                }
                Ok(values)
            }
        }
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.lock().open_sessions -= 1;
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if self.open {
            self.state.lock().open_sessions -= 1;
        }
    }
}
