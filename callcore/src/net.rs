//! Runtime-agnostic network seams. Signaling channels only ever see these
//! traits; the WebSocket and HTTP implementations live in their own crates.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a signaling connection reports to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    /// One whole text or binary frame.
    DataReceived(Bytes),
    Disconnected,
}

/// One open signaling connection. Frames are opaque to it; the channel on
/// top decides what they mean.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error>;

    async fn disconnect(&self);
}

/// Opens signaling connections. Every reconnect asks for a fresh transport.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Events arrive on the returned receiver until the connection drops.
    async fn create_transport(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// A coordinator API request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    /// Upper-case verb: `GET`, `POST` or `DELETE`.
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// JSON body with the matching content type.
    pub fn with_json<T: serde::Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(value)?);
        Ok(self.with_header("Content-Type", "application/json"))
    }
}

/// A fully read response. Coordinator payloads are small JSON documents.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn empty(status_code: u16) -> Self {
        Self {
            status_code,
            body: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.body.clone())?)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Executes coordinator requests. Non-2xx statuses are returned as
/// responses, not errors, so their bodies can be decoded.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
