//! Event logging: typed honeypot events collected in an in-memory buffer
//! that the reporter drains.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Recognized event kinds, rendered into the `<protocol>.<KIND>` event key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A new peer was accepted.
    Connection,
    /// Raw bytes arrived and were not otherwise handled.
    Data,
    /// Protocol-specific structured context (e.g. a decoded DNS query).
    Extra,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "CONNECTION",
            EventKind::Data => "DATA",
            EventKind::Extra => "EXTRA",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogEvent {
    pub timestamp: String,
    /// Event key, e.g. "ftp.CONNECTION" or "dns_udp.EXTRA".
    pub event: String,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    /// Raw payload bytes, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl LogEvent {
    pub fn new(protocol: &str, kind: EventKind, peer: SocketAddr, dst_port: u16) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event: format!("{}.{}", protocol, kind.as_str()),
            src_ip: peer.ip().to_string(),
            src_port: peer.port(),
            dst_port,
            data: None,
            extra: None,
        }
    }

    pub fn with_data(mut self, bytes: &[u8]) -> Self {
        self.data = Some(general_purpose::STANDARD.encode(bytes));
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Sink for honeypot events. Shared by every server and handler; `record`
/// must be safe to call from any number of concurrent tasks.
#[async_trait]
pub trait EventLogger: Send + Sync {
    async fn record(&self, event: LogEvent);
}

/// Buffers events in memory. The shared buffer handle is handed to the
/// reporter, which drains it on its own schedule.
pub struct JsonLogger {
    buffer: Arc<RwLock<Vec<LogEvent>>>,
}

impl JsonLogger {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn buffer(&self) -> Arc<RwLock<Vec<LogEvent>>> {
        self.buffer.clone()
    }
}

impl Default for JsonLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventLogger for JsonLogger {
    async fn record(&self, event: LogEvent) {
        debug!(event = %event.event, src_ip = %event.src_ip, "recorded");
        let mut w = self.buffer.write().await;
        w.push(event);
    }
}
