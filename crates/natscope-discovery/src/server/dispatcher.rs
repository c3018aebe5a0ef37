//! Reply-socket selection
//!
//! The four server sockets are indexed so that bit 1 selects the address and
//! bit 0 the port:
//!
//! | Index | Address | Port |
//! |---|---|---|
//! | 0 | primary | primary |
//! | 1 | primary | secondary |
//! | 2 | secondary | primary |
//! | 3 | secondary | secondary |
//!
//! A CHANGE-REQUEST flips the corresponding bits of the receiving socket's
//! index to pick the socket the response leaves from.

use super::stats::Stats;
use crate::message::{Attribute, Message, MessageType};
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Number of server sockets
pub const SOCKET_COUNT: usize = 4;

const ADDRESS_BIT: usize = 0b10;
const PORT_BIT: usize = 0b01;

/// Response ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Index of the socket to send from
    pub socket: usize,
    /// Destination
    pub dst: SocketAddr,
    /// Encoded response
    pub payload: Vec<u8>,
}

/// Decodes requests and composes responses for the four-socket server
#[derive(Debug)]
pub struct Dispatcher {
    addrs: [Option<SocketAddrV4>; SOCKET_COUNT],
    stats: Stats,
}

impl Dispatcher {
    /// Create a dispatcher for the given bound socket addresses
    #[must_use]
    pub fn new(addrs: [Option<SocketAddrV4>; SOCKET_COUNT]) -> Self {
        Self {
            addrs,
            stats: Stats::new(),
        }
    }

    /// Bound address of socket `index`
    #[must_use]
    pub fn socket_addr(&self, index: usize) -> Option<SocketAddrV4> {
        self.addrs.get(index).copied().flatten()
    }

    /// Shared counters
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Record a successful send
    pub fn record_sent(&self) {
        self.stats.record_sent();
    }

    /// Handle a datagram received on socket `sid` at `received_at`
    ///
    /// Returns the reply to send, or `None` if the datagram is dropped.
    pub fn handle(
        &self,
        sid: usize,
        from: SocketAddr,
        bytes: &[u8],
        received_at: Instant,
    ) -> Option<Reply> {
        self.stats.record_received();

        let request = match Message::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("Malformed datagram from {} on socket {}: {}", from, sid, e);
                self.stats.record_malformed();
                return None;
            }
        };

        if request.message_type() != MessageType::BindingRequest {
            tracing::debug!(
                "Unsupported message type 0x{:04X} from {}",
                request.message_type().code(),
                from
            );
            self.stats.record_unsupported();
            return None;
        }

        let SocketAddr::V4(mapped) = from else {
            tracing::debug!("Dropping request from non-IPv4 source {}", from);
            self.stats.record_malformed();
            return None;
        };

        let change = request.change_request().unwrap_or_default();
        let mut fid = sid;
        if change.change_ip {
            fid ^= ADDRESS_BIT;
        }
        if change.change_port {
            fid ^= PORT_BIT;
        }

        let Some(source) = self.socket_addr(fid) else {
            tracing::debug!("No socket {} to answer {} from", fid, from);
            self.stats.record_malformed();
            return None;
        };

        let mut response = Message::response_to(&request);
        response.add_attribute(Attribute::MappedAddress(mapped));
        if let Some(changed) = self.socket_addr(sid ^ (ADDRESS_BIT | PORT_BIT)) {
            response.add_attribute(Attribute::ChangedAddress(changed));
        }
        response.add_attribute(Attribute::SourceAddress(source));
        if let Some(ts) = request.timestamp() {
            response.add_attribute(Attribute::Timestamp(ts.echoed(received_at.elapsed())));
        }

        match response.encode() {
            Ok(payload) => {
                tracing::trace!("Answering {} from socket {} via socket {}", from, sid, fid);
                Some(Reply {
                    socket: fid,
                    dst: from,
                    payload,
                })
            }
            Err(e) => {
                tracing::warn!("Failed to encode response for {}: {}", from, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ChangeRequest, Timestamp};
    use std::net::Ipv4Addr;

    fn addrs() -> [Option<SocketAddrV4>; SOCKET_COUNT] {
        [
            Some("192.0.2.1:3478".parse().unwrap()),
            Some("192.0.2.1:3479".parse().unwrap()),
            Some("192.0.2.2:3478".parse().unwrap()),
            Some("192.0.2.2:3479".parse().unwrap()),
        ]
    }

    fn client() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 40000))
    }

    fn request(change: Option<ChangeRequest>) -> Message {
        let mut msg = Message::binding_request();
        if let Some(change) = change {
            msg.add_attribute(Attribute::ChangeRequest(change));
        }
        msg
    }

    #[test]
    fn test_plain_request_answered_from_same_socket() {
        let dispatcher = Dispatcher::new(addrs());
        let req = request(None);
        let reply = dispatcher
            .handle(0, client(), &req.encode().unwrap(), Instant::now())
            .unwrap();

        assert_eq!(reply.socket, 0);
        assert_eq!(reply.dst, client());

        let response = Message::decode(&reply.payload).unwrap();
        assert_eq!(response.message_type(), MessageType::BindingResponse);
        assert_eq!(response.transaction_id(), req.transaction_id());
        assert_eq!(
            response.mapped_address(),
            Some("203.0.113.7:40000".parse().unwrap())
        );
        assert_eq!(response.source_address(), addrs()[0]);
        assert_eq!(response.changed_address(), addrs()[3]);
        assert!(response.timestamp().is_none());
    }

    #[test]
    fn test_change_ip_selects_other_address() {
        let dispatcher = Dispatcher::new(addrs());
        let req = request(Some(ChangeRequest {
            change_ip: true,
            change_port: false,
        }));
        let reply = dispatcher
            .handle(0, client(), &req.encode().unwrap(), Instant::now())
            .unwrap();

        assert_eq!(reply.socket, 2);
        let response = Message::decode(&reply.payload).unwrap();
        assert_eq!(response.source_address(), addrs()[2]);
        assert_eq!(response.changed_address(), addrs()[3]);
    }

    #[test]
    fn test_reply_socket_selection_table() {
        let dispatcher = Dispatcher::new(addrs());
        for sid in 0..SOCKET_COUNT {
            for (change_ip, change_port) in [(false, false), (true, false), (false, true), (true, true)] {
                let req = request(Some(ChangeRequest {
                    change_ip,
                    change_port,
                }));
                let reply = dispatcher
                    .handle(sid, client(), &req.encode().unwrap(), Instant::now())
                    .unwrap();
                let ip_bit = if change_ip { 0b10 } else { 0 };
                let port_bit = if change_port { 0b01 } else { 0 };
                assert_eq!(reply.socket, sid ^ ip_bit ^ port_bit);
            }
        }
        assert_eq!(dispatcher.stats().snapshot().received, 16);
    }

    #[test]
    fn test_unbound_target_counts_malformed() {
        let dispatcher = Dispatcher::new([addrs()[0], None, None, None]);
        let req = request(Some(ChangeRequest {
            change_ip: false,
            change_port: true,
        }));

        let reply = dispatcher.handle(0, client(), &req.encode().unwrap(), Instant::now());
        assert!(reply.is_none());
        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[test]
    fn test_changed_address_omitted_without_secondary() {
        let dispatcher = Dispatcher::new([addrs()[0], None, None, None]);
        let req = request(None);
        let reply = dispatcher
            .handle(0, client(), &req.encode().unwrap(), Instant::now())
            .unwrap();
        let response = Message::decode(&reply.payload).unwrap();
        assert!(response.changed_address().is_none());
    }

    #[test]
    fn test_timestamp_echoed() {
        let dispatcher = Dispatcher::new(addrs());
        let mut req = request(None);
        req.add_attribute(Attribute::Timestamp(Timestamp {
            resp_delay: 0,
            timestamp: 1234,
        }));

        let reply = dispatcher
            .handle(0, client(), &req.encode().unwrap(), Instant::now())
            .unwrap();
        let ts = Message::decode(&reply.payload).unwrap().timestamp().unwrap();
        assert_eq!(ts.timestamp, 1234);
        assert!(ts.resp_delay < 1000);
    }

    #[test]
    fn test_malformed_and_unsupported() {
        let dispatcher = Dispatcher::new(addrs());
        assert!(dispatcher.handle(0, client(), &[0u8; 10], Instant::now()).is_none());

        let mut response = Message::new(MessageType::BindingResponse);
        response.set_transaction_id(crate::message::TransactionId::random());
        assert!(
            dispatcher
                .handle(0, client(), &response.encode().unwrap(), Instant::now())
                .is_none()
        );

        let stats = dispatcher.stats().snapshot();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.sent, 0);
    }
}
