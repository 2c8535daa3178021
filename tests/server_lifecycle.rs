use nettrap::handler::BaseHandler;
use nettrap::logger::{EventLogger, JsonLogger};
use nettrap::server::{HoneypotServer, ServerError, ServerState};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn telnet_server(logger: &Arc<JsonLogger>, port: u16) -> HoneypotServer {
    let logger: Arc<dyn EventLogger> = logger.clone();
    HoneypotServer::new(
        "telnet",
        LOCALHOST,
        port,
        Some(BaseHandler::factory("telnet", logger)),
        None,
    )
}

#[tokio::test]
async fn base_handler_logs_one_connection_and_closes() {
    let logger = Arc::new(JsonLogger::new());
    let server = telnet_server(&logger, 0);
    server.start().await.unwrap();
    assert_eq!(server.state().await, ServerState::Running);
    let addr = server.local_tcp_addr().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let local = stream.local_addr().unwrap();

    // No banner: the very first read is EOF.
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("close before timeout")
        .unwrap();
    assert_eq!(n, 0);

    // Give the handler task a beat to record the event.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = logger.buffer();
    let events = events.read().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "telnet.CONNECTION");
    assert_eq!(events[0].src_port, local.port());
    assert_eq!(events[0].dst_port, addr.port());
    assert!(events[0].data.is_none());
    drop(events);

    server.stop().await.unwrap();
    assert_eq!(server.state().await, ServerState::Stopped);
}

#[tokio::test]
async fn bind_conflict_is_local_to_the_second_server() {
    let logger = Arc::new(JsonLogger::new());
    let first = telnet_server(&logger, 0);
    first.start().await.unwrap();
    let port = first.local_tcp_addr().await.unwrap().port();

    let second = telnet_server(&logger, port);
    let err = second.start().await.unwrap_err();
    assert!(matches!(err, ServerError::BindConflict { .. }));
    assert_eq!(second.state().await, ServerState::Failed);

    // The first server is unaffected and still accepts connections.
    assert_eq!(first.state().await, ServerState::Running);
    let mut stream = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    first.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_port_can_be_rebound() {
    let logger = Arc::new(JsonLogger::new());
    let first = telnet_server(&logger, 0);
    first.start().await.unwrap();
    let port = first.local_tcp_addr().await.unwrap().port();

    first.stop().await.unwrap();
    assert_eq!(first.state().await, ServerState::Stopped);

    let second = telnet_server(&logger, port);
    second.start().await.unwrap();
    assert_eq!(second.state().await, ServerState::Running);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn lifecycle_calls_never_crash() {
    let logger = Arc::new(JsonLogger::new());
    let server = telnet_server(&logger, 0);

    // stop before start: no-op
    server.stop().await.unwrap();
    assert_eq!(server.state().await, ServerState::NotStarted);

    server.start().await.unwrap();

    // double start: explicit invalid-state failure
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidState { .. }));
    assert_eq!(server.state().await, ServerState::Running);

    // double stop: second is a no-op
    server.stop().await.unwrap();
    server.stop().await.unwrap();
    assert_eq!(server.state().await, ServerState::Stopped);

    // start after stop: spent servers stay spent
    let err = server.start().await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidState { .. }));
}
