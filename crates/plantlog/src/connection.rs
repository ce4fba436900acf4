// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol client abstraction and the per-source connection.
//!
//! The industrial protocol itself is supplied by an external client library.
//! The service only needs three capabilities from it: open a session,
//! read a list of addresses, close the session. Backends implement
//! [`ProtocolClient`] and [`Session`]:
//!
//! ```ignore
//! #[async_trait]
//! impl ProtocolClient for UaClient {
//!     async fn open(&self, endpoint: &str, credentials: Option<&Credentials>)
//!         -> Result<Box<dyn Session>, ConnectError> {
//!         // Establish a secure channel and activate a session...
//!     }
//! }
//! ```

use crate::config::{Credentials, SourceConfig};
use crate::error::{ConnectError, ReadError};
use crate::reading::TagValue;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Factory for protocol sessions.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open a session to an endpoint.
    ///
    /// Implementations must release any partially-established session
    /// before returning an error.
    async fn open(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ConnectError>;
}

/// An open protocol session.
#[async_trait]
pub trait Session: Send {
    /// Read the given addresses, one value per address, in order.
    async fn read(&mut self, addresses: &[String]) -> Result<Vec<TagValue>, ReadError>;

    /// Close the session. Errors are swallowed by the backend.
    async fn close(&mut self);
}

/// Owns the lifecycle of one session to one endpoint.
pub struct SourceConnection {
    name: String,
    endpoint: String,
    credentials: Option<Credentials>,
    addresses: Vec<String>,
    client: Arc<dyn ProtocolClient>,
    session: Option<Box<dyn Session>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl SourceConnection {
    /// Create a disconnected connection for a source.
    pub fn new(
        source: &SourceConfig,
        client: Arc<dyn ProtocolClient>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            name: source.name.clone(),
            endpoint: source.endpoint.clone(),
            credentials: source.credentials.clone(),
            addresses: source.addresses(),
            client,
            session: None,
            connect_timeout,
            read_timeout,
        }
    }

    /// Source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while a session is held.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open a fresh session, closing any previous one first.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        self.close().await;

        let open = self
            .client
            .open(&self.endpoint, self.credentials.as_ref());
        match tokio::time::timeout(self.connect_timeout, open).await {
            Ok(Ok(session)) => {
                tracing::info!(source = %self.name, endpoint = %self.endpoint, "Connected");
                self.session = Some(session);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            // Dropping the pending open releases whatever it had acquired.
            Err(_) => Err(ConnectError::Timeout(self.connect_timeout)),
        }
    }

    /// Read all configured tags.
    ///
    /// Either one value per tag is returned or an error; a short or long
    /// response is reported as [`ReadError::Truncated`].
    pub async fn read_all(&mut self) -> Result<Vec<TagValue>, ReadError> {
        let session = self.session.as_mut().ok_or(ReadError::NotConnected)?;

        let values = match tokio::time::timeout(self.read_timeout, session.read(&self.addresses))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ReadError::Timeout(self.read_timeout)),
        };

        if values.len() != self.addresses.len() {
            return Err(ReadError::Truncated {
                expected: self.addresses.len(),
                got: values.len(),
            });
        }

        Ok(values)
    }

    /// Close the session if one is open.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            tracing::debug!(source = %self.name, "Session closed");
        }
    }
}
