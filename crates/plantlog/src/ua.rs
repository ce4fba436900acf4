// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OPC UA backend
//!
//! Adapts the `async-opcua` client to [`ProtocolClient`]. Each
//! [`open`](ProtocolClient::open) builds its own client and session so a
//! stalled endpoint never blocks the others. Reconnection is left to the
//! supervisor; the library's own session retry is disabled.
//!
//! Enabled with the `opcua-backend` feature:
//!
//! ```bash
//! cargo run --features opcua-backend -- --config plantlog.toml --backend opcua
//! ```

use crate::config::Credentials;
use crate::connection::{ProtocolClient, Session};
use crate::error::{ConnectError, ReadError};
use crate::reading::TagValue;
use async_trait::async_trait;
use opcua::client::{ClientBuilder, IdentityToken, Session as UaSessionHandle};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    DataValue, MessageSecurityMode, NodeId, ReadValueId, TimestampsToReturn, UserTokenPolicy,
    Variant,
};
use std::sync::Arc;
use tokio::task::AbortHandle;

/// OPC UA protocol client (security policy `None`).
#[derive(Debug, Clone)]
pub struct OpcUaClient {
    application_name: String,
}

impl OpcUaClient {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
        }
    }

    fn identity(credentials: Option<&Credentials>) -> IdentityToken {
        match credentials {
            Some(c) => IdentityToken::UserName(
                c.username.clone(),
                c.password.clone().unwrap_or_default().into(),
            ),
            None => IdentityToken::Anonymous,
        }
    }
}

#[async_trait]
impl ProtocolClient for OpcUaClient {
    async fn open(
        &self,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let mut client = ClientBuilder::new()
            .application_name(self.application_name.clone())
            .application_uri(format!("urn:{}", self.application_name))
            .product_uri("urn:plantlog")
            .trust_server_certs(true)
            .create_sample_keypair(true)
            .session_retry_limit(0)
            .client()
            .map_err(|e| ConnectError::Negotiation(format!("client setup failed: {:?}", e)))?;

        let (session, event_loop) = client
            .connect_to_matching_endpoint(
                (
                    endpoint,
                    SecurityPolicy::None.to_str(),
                    MessageSecurityMode::None,
                    UserTokenPolicy::anonymous(),
                ),
                Self::identity(credentials),
            )
            .await
            .map_err(|e| ConnectError::Unreachable(format!("{}: {}", endpoint, e)))?;

        // Owned from here on, so a dropped or failed open stops the event loop
        let ua = UaSession {
            session,
            event_loop: event_loop.spawn().abort_handle(),
        };
        if !ua.session.wait_for_connection().await {
            return Err(ConnectError::Unreachable(format!(
                "{}: session not established",
                endpoint
            )));
        }

        Ok(Box::new(ua))
    }
}

struct UaSession {
    session: Arc<UaSessionHandle>,
    event_loop: AbortHandle,
}

#[async_trait]
impl Session for UaSession {
    async fn read(&mut self, addresses: &[String]) -> Result<Vec<TagValue>, ReadError> {
        let nodes = addresses
            .iter()
            .map(|address| {
                address
                    .parse::<NodeId>()
                    .map(ReadValueId::from)
                    .map_err(|_| ReadError::BadAddress(address.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let values = self
            .session
            .read(&nodes, TimestampsToReturn::Neither, 0.0)
            .await
            .map_err(|status| ReadError::SessionBroken(status.to_string()))?;

        addresses
            .iter()
            .zip(values)
            .map(|(address, value)| tag_value(address, value))
            .collect()
    }

    async fn close(&mut self) {
        if let Err(status) = self.session.disconnect().await {
            tracing::debug!("OPC UA disconnect: {}", status);
        }
        self.event_loop.abort();
    }
}

impl Drop for UaSession {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// A value with a bad status fails the whole read.
fn tag_value(address: &str, value: DataValue) -> Result<TagValue, ReadError> {
    if let Some(status) = value.status {
        if !status.is_good() {
            return Err(ReadError::BadAddress(format!("{}: {}", address, status)));
        }
    }

    let variant = value
        .value
        .ok_or_else(|| ReadError::BadAddress(format!("{}: no value", address)))?;
    from_variant(variant)
        .ok_or_else(|| ReadError::BadAddress(format!("{}: unsupported value type", address)))
}

fn from_variant(variant: Variant) -> Option<TagValue> {
    let value = match variant {
        Variant::Boolean(v) => TagValue::Bool(v),
        Variant::SByte(v) => TagValue::Int(v.into()),
        Variant::Byte(v) => TagValue::Int(v.into()),
        Variant::Int16(v) => TagValue::Int(v.into()),
        Variant::UInt16(v) => TagValue::Int(v.into()),
        Variant::Int32(v) => TagValue::Int(v.into()),
        Variant::UInt32(v) => TagValue::Int(v.into()),
        Variant::Int64(v) => TagValue::Int(v),
        Variant::UInt64(v) => match i64::try_from(v) {
            Ok(v) => TagValue::Int(v),
            Err(_) => TagValue::Float(v as f64),
        },
        Variant::Float(v) => TagValue::Float(v.into()),
        Variant::Double(v) => TagValue::Float(v),
        Variant::String(v) => TagValue::Text(v.as_ref().to_string()),
        _ => return None,
    };
    Some(value)
}
