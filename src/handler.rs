//! Protocol handler capability: stream handlers instantiated per accepted
//! connection, datagram handlers as long-lived singletons. The provided
//! defaults log the contact and close without sending a byte.

use crate::logger::{EventKind, EventLogger, LogEvent};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// An accepted TCP connection. Close is idempotent and swallows shutdown
/// errors; read and send become no-ops once the transport is gone.
pub struct Connection {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    local_port: u16,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local_port: u16) -> Self {
        Self {
            stream: Some(stream),
            peer,
            local_port,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self.stream.as_mut() {
            Some(s) => s.write_all(bytes).await,
            None => Ok(()),
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stream.as_mut() {
            Some(s) => s.read(buf).await,
            None => Ok(0),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut s) = self.stream.take() {
            let _ = s.shutdown().await;
        }
    }
}

/// Stream-oriented protocol handler; one fresh instance per accepted
/// connection.
///
/// The provided methods are the base behavior every emulator inherits: log
/// the contact, close the transport immediately, never complete a handshake.
/// An emulator overrides what it needs and may call back into the default
/// for input it does not handle. None of these methods raise to the caller.
#[async_trait]
pub trait StreamHandler: Send {
    fn protocol_name(&self) -> &str;
    fn logger(&self) -> &Arc<dyn EventLogger>;

    async fn on_connection_established(&mut self, conn: &mut Connection) {
        self.logger()
            .record(LogEvent::new(
                self.protocol_name(),
                EventKind::Connection,
                conn.peer(),
                conn.local_port(),
            ))
            .await;
        conn.close().await;
    }

    async fn on_data_received(&mut self, conn: &mut Connection, data: &[u8]) {
        self.logger()
            .record(
                LogEvent::new(
                    self.protocol_name(),
                    EventKind::Data,
                    conn.peer(),
                    conn.local_port(),
                )
                .with_data(data),
            )
            .await;
        conn.close().await;
    }

    async fn on_connection_closed(&mut self, _conn: &mut Connection, _error: Option<std::io::Error>) {}
}

/// Creates a fresh handler for each accepted connection.
pub type StreamFactory = Arc<dyn Fn() -> Box<dyn StreamHandler> + Send + Sync>;

/// Handler with no behavior beyond the base contract: registers the contact
/// under its protocol name and hangs up.
pub struct BaseHandler {
    protocol: &'static str,
    logger: Arc<dyn EventLogger>,
}

impl BaseHandler {
    pub fn new(protocol: &'static str, logger: Arc<dyn EventLogger>) -> Self {
        Self { protocol, logger }
    }

    pub fn factory(protocol: &'static str, logger: Arc<dyn EventLogger>) -> StreamFactory {
        Arc::new(move || Box::new(BaseHandler::new(protocol, logger.clone())) as Box<dyn StreamHandler>)
    }
}

#[async_trait]
impl StreamHandler for BaseHandler {
    fn protocol_name(&self) -> &str {
        self.protocol
    }

    fn logger(&self) -> &Arc<dyn EventLogger> {
        &self.logger
    }
}

/// Datagram-oriented protocol handler: a long-lived singleton that receives
/// one callback per datagram. Replies must go back through `socket`, the
/// server's own listening endpoint, because the inbound transport has no
/// fixed peer.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    fn protocol_name(&self) -> &str;

    async fn on_datagram(&self, socket: Arc<UdpSocket>, peer: SocketAddr, data: Vec<u8>);
}
