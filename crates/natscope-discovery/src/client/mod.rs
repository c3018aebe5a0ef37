//! NAT discovery client
//!
//! [`StunClient`] owns the UDP sockets and drives a [`Discovery`] state
//! machine with real time until it reports completion.
//!
//! ```rust,no_run
//! use natscope_discovery::client::{DiscoveryOptions, StunClient};
//!
//! # async fn example() -> Result<(), natscope_discovery::ClientError> {
//! let mut client = StunClient::new();
//! client.set_server_addr("stun.example.org", None);
//! let result = client.discover(DiscoveryOptions::default()).await?;
//! println!("{result}: {}", client.nat_type_name());
//! # Ok(())
//! # }
//! ```

mod discovery;

pub use discovery::{
    Command, Discovery, DiscoveryReport, DiscoveryState, InterfaceCheck, SocketId,
    SystemInterfaces, Transmit,
};

use crate::dns;
use crate::event::{EventSink, LogRecord};
use crate::message::{DEFAULT_PORT, EncodeError};
use crate::types::{DependencyType, NatType, ResultCode};
use std::fmt;
use std::future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Receive buffer size
const RECV_BUFFER_SIZE: usize = 1500;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// A discovery run already happened on this instance
    #[error("invalid state: discovery already started on this client")]
    InvalidState,

    /// No server was configured
    #[error("no STUN server address configured")]
    NoServerAddress,

    /// Local socket could not be bound
    #[error("failed to bind local socket: {0}")]
    Bind(#[source] io::Error),

    /// Socket failure while running
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A request could not be encoded
    #[error("failed to encode request: {0}")]
    Encode(#[from] EncodeError),

    /// The client was closed before the run completed
    #[error("client closed")]
    Closed,
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server host name or dotted-decimal address
    pub server: Option<String>,
    /// Server port
    pub port: u16,
    /// Local address to bind
    pub local_addr: Ipv4Addr,
    /// Attach TIMESTAMP attributes for RTT measurement
    pub timestamps: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            port: DEFAULT_PORT,
            local_addr: Ipv4Addr::UNSPECIFIED,
            timestamps: true,
        }
    }
}

/// Per-run options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Stop after binding discovery
    pub binding_only: bool,
}

/// Handle that cancels a running discovery from another task
#[derive(Debug, Clone)]
pub struct ClientCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl ClientCloser {
    /// Close the client; idempotent
    pub fn close(&self) {
        self.tx.send_replace(true);
    }
}

/// NAT discovery client
pub struct StunClient {
    config: ClientConfig,
    discovery: Option<Discovery>,
    interfaces: Option<Box<dyn InterfaceCheck>>,
    close_tx: Arc<watch::Sender<bool>>,
    events: EventSink,
}

impl fmt::Debug for StunClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StunClient")
            .field("config", &self.config)
            .field("discovery", &self.discovery)
            .finish_non_exhaustive()
    }
}

impl Default for StunClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StunClient {
    /// Create a client with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client from an explicit configuration
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            config,
            discovery: None,
            interfaces: None,
            close_tx: Arc::new(close_tx),
            events: EventSink::new(),
        }
    }

    /// Decide NAT presence with `check` instead of the system interfaces
    ///
    /// Only consulted when the local address is the wildcard.
    #[must_use]
    pub fn with_interface_check(mut self, check: impl InterfaceCheck + 'static) -> Self {
        self.interfaces = Some(Box::new(check));
        self
    }

    /// Set the server host and optionally its port
    pub fn set_server_addr(&mut self, host: impl Into<String>, port: Option<u16>) {
        self.config.server = Some(host.into());
        if let Some(port) = port {
            self.config.port = port;
        }
    }

    /// Set the local address to bind
    pub fn set_local_addr(&mut self, ip: Ipv4Addr) {
        self.config.local_addr = ip;
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Receive progress records
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogRecord> {
        self.events.subscribe()
    }

    /// Handle that can close this client from another task
    #[must_use]
    pub fn closer(&self) -> ClientCloser {
        ClientCloser {
            tx: Arc::clone(&self.close_tx),
        }
    }

    /// Close the client; idempotent and safe before any run
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Run NAT discovery to completion
    ///
    /// # Errors
    ///
    /// Fails before any I/O with [`ClientError::InvalidState`] on a second run
    /// and [`ClientError::NoServerAddress`] without a server. Returns
    /// [`ClientError::Closed`] if the client is closed mid-run.
    pub async fn discover(&mut self, options: DiscoveryOptions) -> Result<ResultCode, ClientError> {
        if self.discovery.is_some() {
            return Err(ClientError::InvalidState);
        }

        let mut discovery =
            Discovery::new(&self.config, options)?.with_event_sink(self.events.clone());
        if let Some(check) = self.interfaces.take() {
            discovery.set_interface_check(check);
        }
        let discovery = self.discovery.insert(discovery);

        let closed = self.close_tx.subscribe();
        if *closed.borrow() {
            return Err(ClientError::Closed);
        }

        drive(discovery, self.config.local_addr, closed, &self.events).await
    }

    /// State of the current run
    #[must_use]
    pub fn state(&self) -> DiscoveryState {
        self.discovery
            .as_ref()
            .map_or(DiscoveryState::Idle, Discovery::state)
    }

    /// Whether a NAT was detected
    #[must_use]
    pub fn is_natted(&self) -> bool {
        self.discovery.as_ref().is_some_and(Discovery::is_natted)
    }

    /// NAT binding behavior
    #[must_use]
    pub fn binding_type(&self) -> DependencyType {
        self.discovery
            .as_ref()
            .map_or(DependencyType::Undetermined, Discovery::binding_type)
    }

    /// NAT filtering behavior
    #[must_use]
    pub fn filter_type(&self) -> DependencyType {
        self.discovery
            .as_ref()
            .map_or(DependencyType::Undetermined, Discovery::filter_type)
    }

    /// Human readable NAT category
    #[must_use]
    pub fn nat_type_name(&self) -> &'static str {
        self.discovery.as_ref().map_or_else(
            || NatType::UdpBlocked.name(),
            Discovery::nat_type_name,
        )
    }

    /// Address observed by the server
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddrV4> {
        self.discovery.as_ref().and_then(Discovery::mapped_address)
    }

    /// Mean round-trip time in milliseconds
    #[must_use]
    pub fn round_trip_time_ms(&self) -> f64 {
        self.discovery
            .as_ref()
            .map_or(0.0, Discovery::round_trip_time_ms)
    }

    /// Summary of the run, if one was started
    #[must_use]
    pub fn report(&self) -> Option<DiscoveryReport> {
        self.discovery.as_ref().map(Discovery::report)
    }
}

/// Execute commands and feed events until the machine completes
async fn drive(
    discovery: &mut Discovery,
    local_addr: Ipv4Addr,
    mut closed: watch::Receiver<bool>,
    events: &EventSink,
) -> Result<ResultCode, ClientError> {
    let mut primary: Option<UdpSocket> = None;
    let mut filter: Option<UdpSocket> = None;
    let mut primary_buf = [0u8; RECV_BUFFER_SIZE];
    let mut filter_buf = [0u8; RECV_BUFFER_SIZE];
    let mut last_state = discovery.state();

    discovery.start(Instant::now())?;

    loop {
        while let Some(command) = discovery.poll_command() {
            match command {
                Command::Resolve(host) => {
                    events.info(format!("Resolving {host}"));
                    let resolved = tokio::select! {
                        _ = closed.changed() => return Err(ClientError::Closed),
                        resolved = dns::resolve_ipv4(&host) => resolved,
                    };
                    discovery.handle_resolved(resolved, Instant::now())?;
                }
                Command::Bind(id) => {
                    let socket = UdpSocket::bind((local_addr, 0))
                        .await
                        .map_err(ClientError::Bind)?;
                    if let Ok(addr) = socket.local_addr() {
                        tracing::debug!("Bound {:?} socket on {}", id, addr);
                    }
                    match id {
                        SocketId::Primary => primary = Some(socket),
                        SocketId::Filter => filter = Some(socket),
                    }
                }
                Command::Send(transmit) => {
                    let socket = match transmit.socket {
                        SocketId::Primary => primary.as_ref(),
                        SocketId::Filter => filter.as_ref(),
                    };
                    let Some(socket) = socket else {
                        tracing::warn!("Send on unbound {:?} socket", transmit.socket);
                        continue;
                    };
                    if let Err(e) = socket.send_to(&transmit.payload, transmit.dst).await {
                        tracing::warn!("Failed to send to {}: {}", transmit.dst, e);
                    }
                }
                Command::Complete(code) => {
                    events.info(format!("Complete({code}): {}", discovery.nat_type_name()));
                    return Ok(code);
                }
            }
        }

        if discovery.state() != last_state {
            last_state = discovery.state();
            events.debug(format!("Discovery state {last_state:?}"));
        }

        let deadline = discovery.poll_timeout();
        tokio::select! {
            _ = closed.changed() => {
                events.info("Client closed");
                return Err(ClientError::Closed);
            }
            received = recv_from(primary.as_ref(), &mut primary_buf) => {
                if let Some((len, from)) = check_recv(received, events)? {
                    discovery.handle_input(SocketId::Primary, from, &primary_buf[..len], Instant::now())?;
                }
            }
            received = recv_from(filter.as_ref(), &mut filter_buf) => {
                if let Some((len, from)) = check_recv(received, events)? {
                    discovery.handle_input(SocketId::Filter, from, &filter_buf[..len], Instant::now())?;
                }
            }
            () = sleep_until(deadline) => {
                discovery.handle_timeout(Instant::now())?;
            }
        }
    }
}

async fn recv_from(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}

/// ICMP errors surface as refused/reset on the next receive and are treated as loss
fn check_recv(
    received: io::Result<(usize, SocketAddr)>,
    events: &EventSink,
) -> Result<Option<(usize, SocketAddr)>, ClientError> {
    match received {
        Ok(datagram) => Ok(Some(datagram)),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            ) =>
        {
            tracing::debug!("Ignoring receive error: {}", e);
            Ok(None)
        }
        Err(e) => {
            events.error(format!("Receive failed: {e}"));
            Err(ClientError::Io(e))
        }
    }
}
