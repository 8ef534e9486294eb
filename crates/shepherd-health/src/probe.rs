//! Liveness probes.
//!
//! A probe answers one question: is anything serving at this address right
//! now? Every probe runs under a hard timeout and makes exactly one attempt;
//! a refusal, a malformed reply, or silence all mean "not alive".

use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use shepherd_core::{PoolRole, ProbeConfig};
use shepherd_state::BoxFuture;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::error::{MonitorError, MonitorResult};

/// Transport used to probe a pool's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeProtocol {
    /// Connection-oriented: a TCP handshake must complete.
    Stream,
    /// Connectionless: a DNS query must get a matching response.
    Datagram,
}

impl From<PoolRole> for ProbeProtocol {
    fn from(role: PoolRole) -> Self {
        match role {
            PoolRole::Resolver => ProbeProtocol::Datagram,
            PoolRole::Standard | PoolRole::AppHosting => ProbeProtocol::Stream,
        }
    }
}

/// Bounded-time reachability check.
pub trait LivenessProbe: Send + Sync {
    fn probe<'a>(&'a self, address: &'a str, protocol: ProbeProtocol) -> BoxFuture<'a, bool>;
}

/// Probes over the real network.
#[derive(Debug, Clone)]
pub struct NetProbe {
    timeout: Duration,
    query_name: Name,
}

impl NetProbe {
    pub fn new(timeout: Duration, dns_query: &str) -> MonitorResult<Self> {
        let query_name = Name::from_ascii(dns_query)
            .map_err(|e| MonitorError::InvalidQueryName(format!("{dns_query}: {e}")))?;
        Ok(Self {
            timeout,
            query_name,
        })
    }

    pub fn from_config(config: &ProbeConfig) -> MonitorResult<Self> {
        Self::new(config.timeout, &config.dns_query)
    }

    async fn stream_probe(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%address, error = %e, "stream probe refused");
                false
            }
            Err(_) => {
                debug!(%address, "stream probe timed out");
                false
            }
        }
    }

    async fn datagram_probe(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.dns_exchange(address)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(%address, error = %e, "datagram probe failed");
                false
            }
            Err(_) => {
                debug!(%address, "datagram probe timed out");
                false
            }
        }
    }

    /// One query, one reply. Any response code counts: the resolver answered.
    async fn dns_exchange(&self, address: &str) -> std::io::Result<()> {
        let id: u16 = rand::random();
        let request = self.build_query(id).to_vec().map_err(std::io::Error::other)?;

        let bind = if address.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(address).await?;
        socket.send(&request).await?;

        let mut buf = [0u8; 512];
        loop {
            let n = socket.recv(&mut buf).await?;
            match Message::from_vec(&buf[..n]) {
                Ok(reply) if reply.id() == id && reply.message_type() == MessageType::Response => {
                    return Ok(());
                }
                // Stray or mismatched datagram; keep waiting until the deadline.
                Ok(_) => continue,
                Err(e) => {
                    debug!(%address, error = %e, "undecodable datagram");
                    continue;
                }
            }
        }
    }

    fn build_query(&self, id: u16) -> Message {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(self.query_name.clone(), RecordType::A));
        message
    }
}

impl LivenessProbe for NetProbe {
    fn probe<'a>(&'a self, address: &'a str, protocol: ProbeProtocol) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match protocol {
                ProbeProtocol::Stream => self.stream_probe(address).await,
                ProbeProtocol::Datagram => self.datagram_probe(address).await,
            }
        })
    }
}
