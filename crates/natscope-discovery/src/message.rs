//! STUN Message Codec (RFC 3489 dialect)
//!
//! Encodes and decodes the classic NAT-discovery wire format: a fixed 20-byte
//! header followed by type-length-value attributes.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      STUN Message Type        |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                 Transaction ID (128 bits)                     |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Unlike RFC 5389 there is no magic cookie, no padding and no
//! MESSAGE-INTEGRITY/FINGERPRINT. Only the attributes needed for binding and
//! filtering discovery are understood; every other attribute is skipped by
//! length on decode.

use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;

/// Message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Transaction ID size (128 bits)
pub const TRANSACTION_ID_SIZE: usize = 16;

/// Default STUN server port
pub const DEFAULT_PORT: u16 = 3478;

/// Attribute header size (type + length)
const ATTR_HEADER_SIZE: usize = 4;

/// Address family code for IPv4
const FAMILY_IPV4: u8 = 0x01;

const CHANGE_IP_FLAG: u8 = 0x04;
const CHANGE_PORT_FLAG: u8 = 0x02;

/// Message types that are recognised on the wire but not supported
const UNSUPPORTED_TYPES: [u16; 4] = [
    0x0111, // binding error response
    0x0002, // shared secret request
    0x0102, // shared secret response
    0x0112, // shared secret error response
];

/// Errors raised while decoding a datagram
///
/// A decode error always discards the whole datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the fixed header
    #[error("malformed data: {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    TooShort {
        /// Size of the received buffer
        len: usize,
    },

    /// Header length field disagrees with the bytes that follow it
    #[error("malformed data: header declares {declared} body bytes, {actual} present")]
    LengthMismatch {
        /// Body length declared in the header
        declared: usize,
        /// Body bytes actually present
        actual: usize,
    },

    /// Attribute header or value runs past the end of the buffer
    #[error("malformed data: attribute at offset {offset} is truncated")]
    TruncatedAttribute {
        /// Offset of the attribute header
        offset: usize,
    },

    /// A known attribute carries a length other than its fixed size
    #[error("malformed data: attribute 0x{code:04X} has length {len}")]
    InvalidAttributeLength {
        /// Attribute code
        code: u16,
        /// Declared value length
        len: usize,
    },

    /// Address attribute with a family other than IPv4
    #[error("unsupported address family: 0x{0:02X}")]
    UnsupportedFamily(u8),

    /// Message type code that is not part of the protocol
    #[error("unknown message type: 0x{0:04X}")]
    UnknownMessageType(u16),
}

/// Errors raised while encoding a message
///
/// Encoding happens before anything is sent, so an encode error never leaves
/// partial bytes on the network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The transaction ID was never set
    #[error("incorrect transaction ID: not set")]
    MissingTransactionId,

    /// The message type has no encoder
    #[error("unsupported message type: 0x{0:04X}")]
    UnsupportedMessageType(u16),

    /// Output buffer cannot hold the encoded message
    #[error("insufficient buffer: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },
}

/// 128-bit transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// Generate a random transaction ID
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; TRANSACTION_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes of the identifier
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TRANSACTION_ID_SIZE] {
        &self.0
    }
}

impl From<[u8; TRANSACTION_ID_SIZE]> for TransactionId {
    fn from(bytes: [u8; TRANSACTION_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

/// STUN message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Binding request (0x0001)
    BindingRequest,
    /// Binding response (0x0101)
    BindingResponse,
    /// Known message type this implementation does not handle
    Unsupported(u16),
}

impl MessageType {
    /// Wire code of the message type
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::BindingRequest => 0x0001,
            Self::BindingResponse => 0x0101,
            Self::Unsupported(code) => code,
        }
    }

    fn from_code(code: u16) -> Result<Self, DecodeError> {
        match code {
            0x0001 => Ok(Self::BindingRequest),
            0x0101 => Ok(Self::BindingResponse),
            c if UNSUPPORTED_TYPES.contains(&c) => Ok(Self::Unsupported(c)),
            c => Err(DecodeError::UnknownMessageType(c)),
        }
    }
}

/// Attribute kinds understood by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// MAPPED-ADDRESS (0x0001)
    MappedAddress,
    /// CHANGE-REQUEST (0x0003)
    ChangeRequest,
    /// SOURCE-ADDRESS (0x0004)
    SourceAddress,
    /// CHANGED-ADDRESS (0x0005)
    ChangedAddress,
    /// Proprietary TIMESTAMP (0x0032)
    Timestamp,
}

impl AttributeKind {
    /// Wire code of the attribute
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::MappedAddress => 0x0001,
            Self::ChangeRequest => 0x0003,
            Self::SourceAddress => 0x0004,
            Self::ChangedAddress => 0x0005,
            Self::Timestamp => 0x0032,
        }
    }

    /// Fixed value length of the attribute (excluding the 4-byte header)
    #[must_use]
    pub const fn value_len(self) -> usize {
        match self {
            Self::MappedAddress | Self::SourceAddress | Self::ChangedAddress => 8,
            Self::ChangeRequest | Self::Timestamp => 4,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(Self::MappedAddress),
            0x0003 => Some(Self::ChangeRequest),
            0x0004 => Some(Self::SourceAddress),
            0x0005 => Some(Self::ChangedAddress),
            0x0032 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// CHANGE-REQUEST flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeRequest {
    /// Ask the server to reply from its alternate address
    pub change_ip: bool,
    /// Ask the server to reply from its alternate port
    pub change_port: bool,
}

/// Proprietary TIMESTAMP attribute used for RTT measurement
///
/// `timestamp` is the sender's 16-bit millisecond clock, `resp_delay` the time
/// the server held the request before answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Server processing delay in milliseconds
    pub resp_delay: u16,
    /// Sender clock value in milliseconds
    pub timestamp: u16,
}

impl Timestamp {
    /// Server echo of this timestamp after holding the request for `held`
    ///
    /// The delay wraps modulo 2^16 ms like the client clock.
    #[must_use]
    pub fn echoed(self, held: Duration) -> Self {
        Self {
            resp_delay: (held.as_millis() & 0xFFFF) as u16,
            timestamp: self.timestamp,
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Address the request was observed from
    MappedAddress(SocketAddrV4),
    /// Reply-socket selection flags
    ChangeRequest(ChangeRequest),
    /// Address the response was sent from
    SourceAddress(SocketAddrV4),
    /// Server's alternate address and port
    ChangedAddress(SocketAddrV4),
    /// RTT timestamp
    Timestamp(Timestamp),
}

impl Attribute {
    /// Kind of this attribute
    #[must_use]
    pub fn kind(&self) -> AttributeKind {
        match self {
            Self::MappedAddress(_) => AttributeKind::MappedAddress,
            Self::ChangeRequest(_) => AttributeKind::ChangeRequest,
            Self::SourceAddress(_) => AttributeKind::SourceAddress,
            Self::ChangedAddress(_) => AttributeKind::ChangedAddress,
            Self::Timestamp(_) => AttributeKind::Timestamp,
        }
    }

    /// Encoded size including the attribute header
    fn encoded_len(&self) -> usize {
        ATTR_HEADER_SIZE + self.kind().value_len()
    }

    /// Write header and value into `out`, which must hold `encoded_len()` bytes
    fn write(&self, out: &mut [u8]) {
        let kind = self.kind();
        out[0..2].copy_from_slice(&kind.code().to_be_bytes());
        out[2..4].copy_from_slice(&(kind.value_len() as u16).to_be_bytes());

        let value = &mut out[ATTR_HEADER_SIZE..];
        match self {
            Self::MappedAddress(addr) | Self::SourceAddress(addr) | Self::ChangedAddress(addr) => {
                value[0] = 0; // Reserved
                value[1] = FAMILY_IPV4;
                value[2..4].copy_from_slice(&addr.port().to_be_bytes());
                value[4..8].copy_from_slice(&addr.ip().octets());
            }
            Self::ChangeRequest(req) => {
                value[0..3].fill(0);
                let mut flags = 0;
                if req.change_ip {
                    flags |= CHANGE_IP_FLAG;
                }
                if req.change_port {
                    flags |= CHANGE_PORT_FLAG;
                }
                value[3] = flags;
            }
            Self::Timestamp(ts) => {
                value[0..2].copy_from_slice(&ts.resp_delay.to_be_bytes());
                value[2..4].copy_from_slice(&ts.timestamp.to_be_bytes());
            }
        }
    }

    /// Decode an attribute value whose length has already been checked
    fn decode(kind: AttributeKind, value: &[u8]) -> Result<Self, DecodeError> {
        match kind {
            AttributeKind::MappedAddress => Ok(Self::MappedAddress(read_address(value)?)),
            AttributeKind::SourceAddress => Ok(Self::SourceAddress(read_address(value)?)),
            AttributeKind::ChangedAddress => Ok(Self::ChangedAddress(read_address(value)?)),
            AttributeKind::ChangeRequest => Ok(Self::ChangeRequest(ChangeRequest {
                change_ip: value[3] & CHANGE_IP_FLAG != 0,
                change_port: value[3] & CHANGE_PORT_FLAG != 0,
            })),
            AttributeKind::Timestamp => Ok(Self::Timestamp(Timestamp {
                resp_delay: u16::from_be_bytes([value[0], value[1]]),
                timestamp: u16::from_be_bytes([value[2], value[3]]),
            })),
        }
    }
}

fn read_address(value: &[u8]) -> Result<SocketAddrV4, DecodeError> {
    let family = value[1];
    if family != FAMILY_IPV4 {
        return Err(DecodeError::UnsupportedFamily(family));
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
    Ok(SocketAddrV4::new(ip, port))
}

/// STUN message
///
/// Attributes are unique by kind and keep their insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    message_type: MessageType,
    transaction_id: Option<TransactionId>,
    attributes: Vec<Attribute>,
}

impl Message {
    /// Create an empty message without a transaction ID
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            transaction_id: None,
            attributes: Vec::new(),
        }
    }

    /// Create a binding request with a fresh random transaction ID
    #[must_use]
    pub fn binding_request() -> Self {
        let mut msg = Self::new(MessageType::BindingRequest);
        msg.transaction_id = Some(TransactionId::random());
        msg
    }

    /// Create an empty binding response carrying the request's transaction ID
    #[must_use]
    pub fn response_to(request: &Self) -> Self {
        Self {
            message_type: MessageType::BindingResponse,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Message type
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Transaction ID, if set
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    /// Set the transaction ID
    pub fn set_transaction_id(&mut self, id: TransactionId) {
        self.transaction_id = Some(id);
    }

    /// Add an attribute, replacing any attribute of the same kind in place
    pub fn add_attribute(&mut self, attr: Attribute) {
        let kind = attr.kind();
        match self.attributes.iter_mut().find(|a| a.kind() == kind) {
            Some(existing) => *existing = attr,
            None => self.attributes.push(attr),
        }
    }

    /// All attributes in insertion order
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Look up an attribute by kind
    #[must_use]
    pub fn attribute(&self, kind: AttributeKind) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.kind() == kind)
    }

    /// MAPPED-ADDRESS value
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddrV4> {
        match self.attribute(AttributeKind::MappedAddress) {
            Some(Attribute::MappedAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// CHANGED-ADDRESS value
    #[must_use]
    pub fn changed_address(&self) -> Option<SocketAddrV4> {
        match self.attribute(AttributeKind::ChangedAddress) {
            Some(Attribute::ChangedAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// SOURCE-ADDRESS value
    #[must_use]
    pub fn source_address(&self) -> Option<SocketAddrV4> {
        match self.attribute(AttributeKind::SourceAddress) {
            Some(Attribute::SourceAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// CHANGE-REQUEST value
    #[must_use]
    pub fn change_request(&self) -> Option<ChangeRequest> {
        match self.attribute(AttributeKind::ChangeRequest) {
            Some(Attribute::ChangeRequest(req)) => Some(*req),
            _ => None,
        }
    }

    /// TIMESTAMP value
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self.attribute(AttributeKind::Timestamp) {
            Some(Attribute::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Size of the serialized message, computed from the live attribute list
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.attributes.iter().map(Attribute::encoded_len).sum::<usize>()
    }

    /// Encode the message into a new buffer
    ///
    /// # Errors
    ///
    /// Returns `EncodeError` if the transaction ID is unset or the message
    /// type cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Encode the message into `buf`, returning the number of bytes written
    ///
    /// # Errors
    ///
    /// Returns `EncodeError` if the transaction ID is unset, the message type
    /// cannot be encoded or `buf` is too small. Nothing meaningful is written
    /// to `buf` on error.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        if let MessageType::Unsupported(code) = self.message_type {
            return Err(EncodeError::UnsupportedMessageType(code));
        }
        let transaction_id = self
            .transaction_id
            .ok_or(EncodeError::MissingTransactionId)?;

        let len = self.encoded_len();
        if buf.len() < len {
            return Err(EncodeError::BufferTooSmall {
                needed: len,
                available: buf.len(),
            });
        }

        buf[0..2].copy_from_slice(&self.message_type.code().to_be_bytes());
        buf[2..4].copy_from_slice(&((len - HEADER_SIZE) as u16).to_be_bytes());
        buf[4..HEADER_SIZE].copy_from_slice(transaction_id.as_bytes());

        let mut offset = HEADER_SIZE;
        for attr in &self.attributes {
            let attr_len = attr.encoded_len();
            attr.write(&mut buf[offset..offset + attr_len]);
            offset += attr_len;
        }

        Ok(len)
    }

    /// Decode a message from a datagram
    ///
    /// Unknown attributes are skipped by length so that later attributes are
    /// still decoded.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if the header or any known attribute is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort { len: bytes.len() });
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let declared = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let actual = bytes.len() - HEADER_SIZE;
        if declared != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }

        let message_type = MessageType::from_code(msg_type)?;

        let mut transaction_id = [0u8; TRANSACTION_ID_SIZE];
        transaction_id.copy_from_slice(&bytes[4..HEADER_SIZE]);

        let mut msg = Self {
            message_type,
            transaction_id: Some(TransactionId(transaction_id)),
            attributes: Vec::new(),
        };

        let mut offset = HEADER_SIZE;
        while offset < bytes.len() {
            if bytes.len() - offset < ATTR_HEADER_SIZE {
                return Err(DecodeError::TruncatedAttribute { offset });
            }

            let code = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_len = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
            let value_start = offset + ATTR_HEADER_SIZE;

            if bytes.len() - value_start < attr_len {
                return Err(DecodeError::TruncatedAttribute { offset });
            }

            let value = &bytes[value_start..value_start + attr_len];
            offset = value_start + attr_len;

            let Some(kind) = AttributeKind::from_code(code) else {
                continue;
            };
            if attr_len != kind.value_len() {
                return Err(DecodeError::InvalidAttributeLength {
                    code,
                    len: attr_len,
                });
            }

            msg.add_attribute(Attribute::decode(kind, value)?);
        }

        Ok(msg)
    }
}
