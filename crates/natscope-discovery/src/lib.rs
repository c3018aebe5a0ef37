//! # natscope discovery
//!
//! Classic (RFC 3489 style) NAT behavior discovery over UDP.
//!
//! This crate provides:
//! - A codec for the binding request/response wire format
//! - A sans-IO discovery state machine with exponential-backoff retransmission
//! - A tokio client that drives the state machine over real sockets
//! - A four-socket server that answers from the address/port a request asks for
//!
//! ## Classification
//!
//! Four binding probes against the server's primary and alternate endpoints
//! classify how the NAT allocates mappings; two filtering probes with
//! CHANGE-REQUEST classify which remote endpoints may send back through a
//! mapping. Together they yield the familiar cone/symmetric names.
//!
//! ## Example
//!
//! ```rust,no_run
//! use natscope_discovery::{DiscoveryOptions, ServerConfig, StunClient, StunServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = StunServer::new(ServerConfig::default());
//! server.listen().await?;
//!
//! let mut client = StunClient::new();
//! client.set_server_addr("127.0.0.1", Some(3478));
//! let result = client.discover(DiscoveryOptions::default()).await?;
//! println!("Complete({result}): {}", client.nat_type_name());
//!
//! server.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod dns;
pub mod event;
pub mod message;
pub mod server;
pub mod timer;
pub mod types;

// Re-export commonly used types
pub use client::{ClientCloser, ClientConfig, ClientError, DiscoveryOptions, StunClient};
pub use event::{EventSink, LogRecord};
pub use message::{Attribute, DecodeError, EncodeError, Message, MessageType};
pub use server::{HostPort, ServerConfig, ServerError, StatsSnapshot, StunServer};
pub use types::{DependencyType, FilterState, NatType, ResultCode};
