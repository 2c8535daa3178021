//! Per-service honeypot server: owns one bound (address, port), the serve
//! loop task, and the handler it dispatches accepted connections and
//! datagrams to.

use crate::handler::{Connection, DatagramHandler, StreamFactory, StreamHandler};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("address {addr} already in use")]
    BindConflict { addr: SocketAddr },
    #[error("cannot {op} while {state:?}")]
    InvalidState {
        state: ServerState,
        op: &'static str,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("serve task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct HoneypotServer {
    service: &'static str,
    bindaddr: IpAddr,
    port: u16,
    stream: Option<StreamFactory>,
    datagram: Option<Arc<dyn DatagramHandler>>,
    state: Arc<RwLock<ServerState>>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    tcp_addr: RwLock<Option<SocketAddr>>,
    udp_addr: RwLock<Option<SocketAddr>>,
}

impl HoneypotServer {
    /// A server serves a TCP side, a UDP side, or both (DNS binds both on
    /// the same port).
    pub fn new(
        service: &'static str,
        bindaddr: IpAddr,
        port: u16,
        stream: Option<StreamFactory>,
        datagram: Option<Arc<dyn DatagramHandler>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            service,
            bindaddr,
            port,
            stream,
            datagram,
            state: Arc::new(RwLock::new(ServerState::NotStarted)),
            shutdown,
            task: Mutex::new(None),
            tcp_addr: RwLock::new(None),
            udp_addr: RwLock::new(None),
        }
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Actual bound TCP address, available once Running (port 0 binds get
    /// their assigned port here).
    pub async fn local_tcp_addr(&self) -> Option<SocketAddr> {
        *self.tcp_addr.read().await
    }

    pub async fn local_udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.read().await
    }

    /// Binds the configured transports and launches the serve loop as an
    /// independent task, returning without blocking on it. A bind failure
    /// moves this server to Failed and is reported to the caller; it never
    /// aborts sibling servers.
    pub async fn start(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::NotStarted {
                return Err(ServerError::InvalidState {
                    state: *state,
                    op: "start",
                });
            }
            *state = ServerState::Starting;
        }

        let addr = SocketAddr::new(self.bindaddr, self.port);

        // Bind before spawning so a conflict surfaces to the caller instead
        // of dying inside a detached task.
        let udp = match self.datagram.clone() {
            Some(handler) => match UdpSocket::bind(addr).await {
                Ok(socket) => Some((Arc::new(socket), handler)),
                Err(e) => return Err(self.bind_failed(addr, e).await),
            },
            None => None,
        };
        let tcp = match self.stream.clone() {
            Some(factory) => match TcpListener::bind(addr).await {
                Ok(listener) => Some((listener, factory)),
                Err(e) => return Err(self.bind_failed(addr, e).await),
            },
            None => None,
        };

        let mut loops: Vec<JoinHandle<()>> = Vec::new();

        if let Some((socket, handler)) = udp {
            *self.udp_addr.write().await = socket.local_addr().ok();
            let mut shutdown = self.shutdown.subscribe();
            let service = self.service;
            loops.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        res = socket.recv_from(&mut buf) => match res {
                            Ok((n, peer)) => {
                                let handler = handler.clone();
                                let socket = socket.clone();
                                let data = buf[..n].to_vec();
                                tokio::spawn(async move {
                                    handler.on_datagram(socket, peer, data).await;
                                });
                            }
                            Err(e) => {
                                error!(service, error = ?e, "recv error");
                                break;
                            }
                        }
                    }
                }
            }));
        }

        if let Some((listener, factory)) = tcp {
            let local = listener.local_addr().ok();
            *self.tcp_addr.write().await = local;
            let local_port = local.map(|a| a.port()).unwrap_or(self.port);
            let mut shutdown = self.shutdown.subscribe();
            let service = self.service;
            loops.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        res = listener.accept() => match res {
                            Ok((stream, peer)) => {
                                let handler = (factory)();
                                tokio::spawn(drive_connection(handler, stream, peer, local_port));
                            }
                            Err(e) => {
                                error!(service, error = ?e, "accept error");
                                break;
                            }
                        }
                    }
                }
            }));
        }

        let state = self.state.clone();
        let service = self.service;
        let supervisor = tokio::spawn(async move {
            for task in loops {
                let _ = task.await;
            }
            let mut s = state.write().await;
            if *s != ServerState::Failed {
                *s = ServerState::Stopped;
            }
            info!(service, "serve loop terminated");
        });

        *self.task.lock().await = Some(supervisor);
        *self.state.write().await = ServerState::Running;
        info!(service = self.service, %addr, "service listening");
        Ok(())
    }

    /// Requests cooperative cancellation of the serve loop and waits for its
    /// acknowledged termination. Stopping a server that is not running is a
    /// no-op. Per-connection tasks already in flight are not tracked; they
    /// finish (or time out) on their own.
    pub async fn stop(&self) -> Result<(), ServerError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServerState::Running => *state = ServerState::Stopping,
                _ => return Ok(()),
            }
        }

        // The serve loops observe this in their select! and exit promptly.
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.lock().await.take() {
            task.await?;
        }
        *self.state.write().await = ServerState::Stopped;
        info!(service = self.service, port = self.port, "server stopped");
        Ok(())
    }

    async fn bind_failed(&self, addr: SocketAddr, e: std::io::Error) -> ServerError {
        *self.state.write().await = ServerState::Failed;
        warn!(service = self.service, %addr, error = %e, "bind failed");
        if e.kind() == std::io::ErrorKind::AddrInUse {
            ServerError::BindConflict { addr }
        } else {
            ServerError::Io(e)
        }
    }
}

/// Drives one accepted connection through the handler lifecycle. Events for
/// a connection are emitted in transport-delivery order; `on_connection_closed`
/// fires exactly once.
async fn drive_connection(
    mut handler: Box<dyn StreamHandler>,
    stream: TcpStream,
    peer: SocketAddr,
    local_port: u16,
) {
    let mut conn = Connection::new(stream, peer, local_port);
    handler.on_connection_established(&mut conn).await;

    let mut buf = [0u8; 2048];
    while !conn.is_closed() {
        match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => handler.on_data_received(&mut conn, &buf[..n]).await,
            Err(e) => {
                handler.on_connection_closed(&mut conn, Some(e)).await;
                conn.close().await;
                return;
            }
        }
    }
    handler.on_connection_closed(&mut conn, None).await;
    conn.close().await;
}
