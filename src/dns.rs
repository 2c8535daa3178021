//! DNS subsystem: a defensive wire decode of the header and question
//! section, the single-use upstream relay session, and the UDP proxy
//! handler that stitches them together.

use crate::handler::{BaseHandler, DatagramHandler, StreamFactory};
use crate::logger::{EventKind, EventLogger, LogEvent};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Resolver queried when a service config does not name one.
pub const DEFAULT_UPSTREAM: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53);

/// Bounded wait for the upstream reply; a flood of unanswered queries must
/// not pin sockets indefinitely.
pub const DEFAULT_REPLY_WAIT: Duration = Duration::from_secs(5);

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated: need {need} more byte(s) at offset {offset}")]
    Truncated { offset: usize, need: usize },
    #[error("reserved label type {0:#04x}")]
    BadLabel(u8),
    #[error("name exceeds 255 octets")]
    NameTooLong,
    #[error("compression pointer loop")]
    PointerLoop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Structured decode of one inbound message, the subset worth logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub opcode: u8,
    pub recursion_desired: bool,
    pub questions: Vec<DnsQuestion>,
}

impl DnsQuery {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "opcode": self.opcode,
            "rd": self.recursion_desired,
            "questions": self.questions.iter().map(|q| serde_json::json!({
                "name": q.name,
                "type": qtype_name(q.qtype),
                "class": q.qclass,
            })).collect::<Vec<_>>(),
        })
    }
}

pub fn qtype_name(qtype: u16) -> String {
    let known = match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        35 => "NAPTR",
        43 => "DS",
        46 => "RRSIG",
        48 => "DNSKEY",
        65 => "HTTPS",
        252 => "AXFR",
        255 => "ANY",
        other => return format!("TYPE{}", other),
    };
    known.to_string()
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, DecodeError> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or(DecodeError::Truncated { offset, need: 2 })?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Reads one (possibly compressed) name starting at `start`. Returns the
/// dotted name and the offset just past it in the original read sequence.
/// Every read is bounds-checked; length fields are never trusted.
fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), DecodeError> {
    let mut name = String::new();
    let mut offset = start;
    // Offset to resume at after following the first pointer.
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *buf
            .get(offset)
            .ok_or(DecodeError::Truncated { offset, need: 1 })? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        match len & 0xC0 {
            0xC0 => {
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DecodeError::PointerLoop);
                }
                let ptr = (read_u16(buf, offset)? & 0x3FFF) as usize;
                if ptr >= offset {
                    return Err(DecodeError::PointerLoop);
                }
                if resume.is_none() {
                    resume = Some(offset + 2);
                }
                offset = ptr;
            }
            0x00 => {
                let label = buf
                    .get(offset + 1..offset + 1 + len)
                    .ok_or(DecodeError::Truncated {
                        offset: offset + 1,
                        need: len,
                    })?;
                if name.len() + label.len() + 1 > MAX_NAME_LEN {
                    return Err(DecodeError::NameTooLong);
                }
                if !name.is_empty() {
                    name.push('.');
                }
                // DNS names are bytes, not UTF-8; decode lossily per label.
                name.push_str(&String::from_utf8_lossy(label));
                offset += 1 + len;
            }
            _ => return Err(DecodeError::BadLabel(len as u8)),
        }
    }
    Ok((name, resume.unwrap_or(offset)))
}

/// Decodes the header and question section of a raw DNS message. This is the
/// one parser facing fully untrusted input; malformed bytes yield an error,
/// never a panic.
pub fn decode_message(buf: &[u8]) -> Result<DnsQuery, DecodeError> {
    if buf.len() < 12 {
        return Err(DecodeError::Truncated {
            offset: 0,
            need: 12 - buf.len(),
        });
    }
    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let qdcount = read_u16(buf, 4)? as usize;

    let mut questions = Vec::new();
    let mut offset = 12;
    for _ in 0..qdcount {
        let (name, next) = read_name(buf, offset)?;
        let qtype = read_u16(buf, next)?;
        let qclass = read_u16(buf, next + 2)?;
        questions.push(DnsQuestion { name, qtype, qclass });
        offset = next + 4;
    }

    Ok(DnsQuery {
        id,
        opcode: ((flags >> 11) & 0x0F) as u8,
        recursion_desired: flags & 0x0100 != 0,
        questions,
    })
}

/// Re-encodes the logged subset of a query, uncompressed. Round-trips with
/// `decode_message` on the name and type; also serves as a fixture builder.
pub fn encode_query(query: &DnsQuery) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&query.id.to_be_bytes());
    let mut flags = (query.opcode as u16 & 0x0F) << 11;
    if query.recursion_desired {
        flags |= 0x0100;
    }
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&(query.questions.len() as u16).to_be_bytes());
    out.extend_from_slice(&[0u8; 6]); // ANCOUNT, NSCOUNT, ARCOUNT
    for q in &query.questions {
        for label in q.name.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&q.qtype.to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());
    }
    out
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no reply from upstream within {0:?}")]
    NoReply(Duration),
}

/// Single-use outbound session to the real resolver. One session per query;
/// the dedicated socket is the only correlation between query and reply.
/// There is deliberately no transaction-id matching.
pub struct RelaySession {
    socket: UdpSocket,
    upstream: SocketAddr,
}

impl RelaySession {
    pub async fn open(upstream: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(upstream).await?;
        Ok(Self { socket, upstream })
    }

    /// Forwards the raw query unmodified and awaits exactly one reply,
    /// bounded by `wait`. Consumes the session; the socket is released on
    /// every path.
    pub async fn relay(self, query: &[u8], wait: Duration) -> Result<Vec<u8>, RelayError> {
        self.socket.send(query).await?;
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(wait, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                debug!(upstream = %self.upstream, bytes = n, "upstream reply");
                Ok(buf)
            }
            Ok(Err(e)) => Err(RelayError::Io(e)),
            Err(_) => Err(RelayError::NoReply(wait)),
        }
    }
}

/// Connectionless DNS proxy: one relay per inbound query, answered through
/// the honeypot's own listening socket.
pub struct DnsProxy {
    logger: Arc<dyn EventLogger>,
    upstream: SocketAddr,
    reply_wait: Duration,
}

impl DnsProxy {
    pub fn new(logger: Arc<dyn EventLogger>, upstream: SocketAddr) -> Self {
        Self {
            logger,
            upstream,
            reply_wait: DEFAULT_REPLY_WAIT,
        }
    }

    pub fn with_reply_wait(mut self, wait: Duration) -> Self {
        self.reply_wait = wait;
        self
    }
}

#[async_trait]
impl DatagramHandler for DnsProxy {
    fn protocol_name(&self) -> &str {
        "dns_udp"
    }

    async fn on_datagram(&self, socket: Arc<UdpSocket>, peer: SocketAddr, data: Vec<u8>) {
        // Log first, relay second: a decode failure still leaves a record of
        // who sent what.
        let decoded = decode_message(&data);
        let query_json = match &decoded {
            Ok(query) => query.to_json(),
            Err(_) => serde_json::Value::Null,
        };
        let mut extra = serde_json::json!({
            "src_ip": peer.ip().to_string(),
            "src_port": peer.port(),
            "query": query_json,
        });
        if let Err(e) = &decoded {
            extra["decode_error"] = serde_json::Value::String(e.to_string());
        }
        let dst_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        self.logger
            .record(
                LogEvent::new(self.protocol_name(), EventKind::Extra, peer, dst_port)
                    .with_data(&data)
                    .with_extra(extra),
            )
            .await;

        let session = match RelaySession::open(self.upstream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(upstream = %self.upstream, error = %e, "relay session open failed");
                return;
            }
        };
        match session.relay(&data, self.reply_wait).await {
            Ok(reply) => {
                // The requester must see the answer come from the address it
                // queried, so the reply goes out the listening socket.
                if let Err(e) = socket.send_to(&reply, peer).await {
                    debug!(error = %e, "reply send failed");
                }
            }
            Err(e) => debug!(upstream = %self.upstream, error = %e, "relay failed"),
        }
    }
}

/// TCP on the DNS port only registers presence for scanners: base behavior,
/// no payload, no real TCP DNS support.
pub fn dns_tcp_factory(logger: Arc<dyn EventLogger>) -> StreamFactory {
    BaseHandler::factory("dns_tcp", logger)
}
