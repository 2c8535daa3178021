use nettrap::dns::{encode_query, DnsProxy, DnsQuery, DnsQuestion, RelayError, RelaySession};
use nettrap::handler::DatagramHandler;
use nettrap::logger::JsonLogger;
use nettrap::server::HoneypotServer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn query(id: u16, name: &str) -> Vec<u8> {
    encode_query(&DnsQuery {
        id,
        opcode: 0,
        recursion_desired: true,
        questions: vec![DnsQuestion {
            name: name.to_string(),
            qtype: 1,
            qclass: 1,
        }],
    })
}

/// Upstream that answers every query with the same fixed payload.
async fn fixed_reply_upstream(reply: Vec<u8>) -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((_, peer)) = sock.recv_from(&mut buf).await {
            let _ = sock.send_to(&reply, peer).await;
        }
    });
    addr
}

/// Upstream that echoes each query back, so every requester has a distinct
/// expected reply.
async fn echo_upstream() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
            let _ = sock.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

async fn dns_server(logger: &Arc<JsonLogger>, upstream: SocketAddr, wait: Duration) -> HoneypotServer {
    let proxy: Arc<dyn DatagramHandler> =
        Arc::new(DnsProxy::new(logger.clone(), upstream).with_reply_wait(wait));
    let server = HoneypotServer::new("dns", LOCALHOST, 0, None, Some(proxy));
    server.start().await.expect("dns server starts");
    server
}

#[tokio::test]
async fn proxy_relays_reply_from_its_own_listening_address() {
    let reply = b"\xab\xcd\x81\x80fixed-reply".to_vec();
    let upstream = fixed_reply_upstream(reply.clone()).await;

    let logger = Arc::new(JsonLogger::new());
    let server = dns_server(&logger, upstream, Duration::from_secs(5)).await;
    let listen = server.local_udp_addr().await.expect("bound udp address");

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query(0xabcd, "example.com"), listen).await.unwrap();

    let mut buf = [0u8; 4096];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("reply before timeout")
        .unwrap();
    // The answer must come from the honeypot's bound address, not the upstream's.
    assert_eq!(from, listen);
    assert_eq!(&buf[..n], &reply[..]);

    // One EXTRA event carrying the decoded query.
    let events = logger.buffer();
    let events = events.read().await;
    let extras: Vec<_> = events.iter().filter(|e| e.event == "dns_udp.EXTRA").collect();
    assert_eq!(extras.len(), 1);
    let extra = extras[0].extra.as_ref().unwrap();
    assert_eq!(extra["query"]["questions"][0]["name"], "example.com");
    assert_eq!(extra["query"]["questions"][0]["type"], "A");
    drop(events);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_query_is_logged_and_still_relayed() {
    let upstream = echo_upstream().await;
    let logger = Arc::new(JsonLogger::new());
    let server = dns_server(&logger, upstream, Duration::from_secs(5)).await;
    let listen = server.local_udp_addr().await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"nonsense", listen).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("reply before timeout")
        .unwrap();
    assert_eq!(&buf[..n], b"nonsense");

    let events = logger.buffer();
    let events = events.read().await;
    let extra = events
        .iter()
        .find(|e| e.event == "dns_udp.EXTRA")
        .and_then(|e| e.extra.as_ref())
        .expect("decode failure still produces an EXTRA event");
    assert!(extra["query"].is_null());
    assert!(extra["decode_error"].is_string());
    drop(events);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_upstream_means_no_reply_to_the_requester() {
    // Bound but mute upstream.
    let upstream_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream = upstream_sock.local_addr().unwrap();

    let logger = Arc::new(JsonLogger::new());
    let server = dns_server(&logger, upstream, Duration::from_millis(100)).await;
    let listen = server.local_udp_addr().await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query(1, "no.reply.test"), listen).await.unwrap();

    let mut buf = [0u8; 64];
    let res = tokio::time::timeout(Duration::from_millis(400), client.recv_from(&mut buf)).await;
    assert!(res.is_err(), "requester must not receive a reply");

    // The query itself was still recorded.
    let events = logger.buffer();
    let count = events.read().await.len();
    assert_eq!(count, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_queries_each_get_their_own_reply() {
    let upstream = echo_upstream().await;
    let logger = Arc::new(JsonLogger::new());
    let server = dns_server(&logger, upstream, Duration::from_secs(10)).await;
    let listen = server.local_udp_addr().await.unwrap();

    let mut clients = Vec::new();
    for i in 0..100u16 {
        clients.push(tokio::spawn(async move {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let wire = query(i, &format!("host{}.example.com", i));
            sock.send_to(&wire, listen).await.unwrap();
            let mut buf = [0u8; 4096];
            let (n, from) = tokio::time::timeout(Duration::from_secs(10), sock.recv_from(&mut buf))
                .await
                .expect("every requester gets an answer")
                .unwrap();
            assert_eq!(from, listen);
            // Each requester must see exactly its own query echoed back.
            assert_eq!(&buf[..n], &wire[..]);
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn relay_session_is_single_use_and_bounded() {
    let upstream = echo_upstream().await;
    let session = RelaySession::open(upstream).await.unwrap();
    let reply = session
        .relay(b"ping", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, b"ping");

    let mute = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = RelaySession::open(mute.local_addr().unwrap()).await.unwrap();
    let err = session
        .relay(b"ping", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::NoReply(_)));
}
