//! Four-socket NAT discovery server
//!
//! The server listens on every combination of a primary and secondary address
//! with a primary and secondary port, and answers each binding request from
//! the socket selected by its CHANGE-REQUEST attribute.

mod dispatcher;
mod stats;

pub use dispatcher::{Dispatcher, Reply, SOCKET_COUNT};
pub use stats::{Stats, StatsSnapshot};

use crate::dns;
use crate::event::{EventSink, LogRecord};
use crate::message::DEFAULT_PORT;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Receive buffer size
const RECV_BUFFER_SIZE: usize = 1500;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Primary or secondary host not configured
    #[error("missing {0} address")]
    MissingAddress(&'static str),

    /// Host did not resolve to an IPv4 address
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Configured host
        host: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that failed
        addr: SocketAddrV4,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `listen` was already called
    #[error("server is already listening")]
    AlreadyListening,
}

/// Host and port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Host name or dotted-decimal address
    pub host: String,
    /// Port, 0 for an ephemeral port
    pub port: u16,
}

impl HostPort {
    /// Create a host/port pair
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Primary address and port
    pub primary: HostPort,
    /// Secondary address and port
    pub secondary: HostPort,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            primary: HostPort::new("127.0.0.1", DEFAULT_PORT),
            secondary: HostPort::new("127.0.0.2", DEFAULT_PORT + 1),
        }
    }
}

/// NAT discovery server
#[derive(Debug)]
pub struct StunServer {
    config: ServerConfig,
    dispatcher: Option<Arc<Dispatcher>>,
    tasks: Vec<JoinHandle<()>>,
    events: EventSink,
}

impl StunServer {
    /// Create a server; nothing is bound until [`listen`](Self::listen)
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            dispatcher: None,
            tasks: Vec::new(),
            events: EventSink::new(),
        }
    }

    /// Receive log records
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        self.events.subscribe()
    }

    /// Bind the four sockets and start serving
    ///
    /// # Errors
    ///
    /// Fails if a host is missing or does not resolve, if any socket cannot be
    /// bound, or if the server was already started.
    pub async fn listen(&mut self) -> Result<(), ServerError> {
        if self.dispatcher.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let primary_ip = resolve(&self.config.primary.host, "primary").await?;
        let secondary_ip = resolve(&self.config.secondary.host, "secondary").await?;

        // Index bit 1 selects the address, bit 0 the port
        let socket0 = bind(SocketAddrV4::new(primary_ip, self.config.primary.port)).await?;
        let primary_port = local_v4(&socket0)?.port();
        let socket1 = bind(SocketAddrV4::new(primary_ip, self.config.secondary.port)).await?;
        let secondary_port = local_v4(&socket1)?.port();
        let socket2 = bind(SocketAddrV4::new(secondary_ip, primary_port)).await?;
        let socket3 = bind(SocketAddrV4::new(secondary_ip, secondary_port)).await?;

        let sockets: Arc<[UdpSocket]> = Arc::new([socket0, socket1, socket2, socket3]);

        let mut addrs = [None; SOCKET_COUNT];
        for (slot, socket) in addrs.iter_mut().zip(sockets.iter()) {
            let addr = local_v4(socket)?;
            self.events.info(format!("Listening on {addr}"));
            *slot = Some(addr);
        }

        let dispatcher = Arc::new(Dispatcher::new(addrs));
        for sid in 0..SOCKET_COUNT {
            let dispatcher = Arc::clone(&dispatcher);
            let sockets = Arc::clone(&sockets);
            let events = self.events.clone();
            self.tasks.push(tokio::spawn(async move {
                serve_socket(sid, dispatcher, sockets, events).await;
            }));
        }
        self.dispatcher = Some(dispatcher);

        Ok(())
    }

    /// Stop all receive tasks and release the sockets; idempotent
    ///
    /// Counters stay readable after close.
    pub async fn close(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks.drain(..) {
            // Aborted tasks resolve with a cancellation error
            let _ = task.await;
        }
        self.events.info("All sockets closed");
    }

    /// Whether the receive tasks are running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Bound socket addresses, indexed by socket id
    #[must_use]
    pub fn local_addrs(&self) -> Option<[SocketAddrV4; SOCKET_COUNT]> {
        let dispatcher = self.dispatcher.as_ref()?;
        let mut addrs = [SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0); SOCKET_COUNT];
        for (sid, addr) in addrs.iter_mut().enumerate() {
            *addr = dispatcher.socket_addr(sid)?;
        }
        Some(addrs)
    }

    /// Counter snapshot; zero before `listen`
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher
            .as_ref()
            .map(|d| d.stats().snapshot())
            .unwrap_or_default()
    }
}

impl Drop for StunServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn resolve(host: &str, role: &'static str) -> Result<Ipv4Addr, ServerError> {
    if host.is_empty() {
        return Err(ServerError::MissingAddress(role));
    }
    dns::resolve_ipv4(host)
        .await
        .map_err(|source| ServerError::Resolve {
            host: host.to_string(),
            source,
        })
}

async fn bind(addr: SocketAddrV4) -> Result<UdpSocket, ServerError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

fn local_v4(socket: &UdpSocket) -> Result<SocketAddrV4, ServerError> {
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(addr) => Err(ServerError::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("socket bound to IPv6 address {addr}"),
        ))),
    }
}

/// Receive loop for one socket; replies before receiving the next datagram
async fn serve_socket(
    sid: usize,
    dispatcher: Arc<Dispatcher>,
    sockets: Arc<[UdpSocket]>,
    events: EventSink,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        let (len, from) = match sockets[sid].recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                if !matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) {
                    events.warn(format!("Receive error on socket {sid}: {e}"));
                }
                continue;
            }
        };
        let received_at = Instant::now();

        let Some(reply) = dispatcher.handle(sid, from, &buf[..len], received_at) else {
            continue;
        };

        match sockets[reply.socket].send_to(&reply.payload, reply.dst).await {
            Ok(_) => dispatcher.record_sent(),
            Err(e) => events.warn(format!(
                "Failed to send to {} from socket {}: {e}",
                reply.dst, reply.socket
            )),
        }
    }
}
