/**
 * nat_traversal/codec.rs
 *
 * STUN message codec (RFC 5389 binding subset). No I/O.
 */

use super::error::DecodeError;
use super::types::{Endpoint, TransactionId};
use std::net::Ipv4Addr;

/// STUN message types
pub const BINDING_REQUEST: u16 = 0x0001;
pub const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;
pub const BINDING_ERROR_RESPONSE: u16 = 0x0111;

/// STUN magic cookie
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

pub const HEADER_LEN: usize = 20;

const FAMILY_IPV4: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    SuccessResponse,
    ErrorResponse,
}

impl MessageType {
    pub fn code(self) -> u16 {
        match self {
            Self::Request => BINDING_REQUEST,
            Self::SuccessResponse => BINDING_SUCCESS_RESPONSE,
            Self::ErrorResponse => BINDING_ERROR_RESPONSE,
        }
    }

    pub fn from_code(code: u16) -> Result<Self, DecodeError> {
        match code {
            BINDING_REQUEST => Ok(Self::Request),
            BINDING_SUCCESS_RESPONSE => Ok(Self::SuccessResponse),
            BINDING_ERROR_RESPONSE => Ok(Self::ErrorResponse),
            other => Err(DecodeError::UnexpectedMessageType(other)),
        }
    }
}

/// How a mapped endpoint is carried in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEncoding {
    Mapped,
    XorMapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u16,
    pub value: Vec<u8>,
}

/// Decoded STUN message. Encoded length is always a multiple of 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attr_type: u16, value: Vec<u8>) -> Self {
        self.attributes.push(Attribute { attr_type, value });
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len: usize = self
            .attributes
            .iter()
            .map(|attr| 4 + padded(attr.value.len()))
            .sum();

        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.extend_from_slice(&self.message_type.code().to_be_bytes());
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            out.extend_from_slice(&attr.attr_type.to_be_bytes());
            out.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&attr.value);
            out.resize(out.len() + padded(attr.value.len()) - attr.value.len(), 0);
        }

        out
    }

    /// Strict decode: every attribute must fit in the datagram
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(data);
        let (message_type, transaction_id) = read_header(&mut reader)?;

        let mut attributes = Vec::new();
        while !reader.is_empty() {
            let (attr_type, value) = read_attribute(&mut reader)?;
            attributes.push(Attribute {
                attr_type,
                value: value.to_vec(),
            });
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// First IPv4 MAPPED-ADDRESS or XOR-MAPPED-ADDRESS, in attribute order
    pub fn mapped_endpoint(&self) -> Result<Endpoint, DecodeError> {
        let mut walk = AddressWalk::default();
        for attr in &self.attributes {
            if let Some(endpoint) = walk.offer(attr.attr_type, &attr.value)? {
                return Ok(endpoint);
            }
        }
        Err(walk.exhausted())
    }
}

/// Bounds-checked cursor over a received buffer
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Skip the padding after a value of `len` bytes. A missing pad on the
    /// final attribute is tolerated.
    pub fn skip_padding(&mut self, len: usize) -> Result<(), DecodeError> {
        let pad = padded(len) - len;
        let pad = pad.min(self.remaining());
        self.read_bytes(pad).map(|_| ())
    }
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Fixed 20-byte header. The declared body length is not trusted; attributes
/// are walked to the end of the datagram.
fn read_header(reader: &mut Reader<'_>) -> Result<(MessageType, TransactionId), DecodeError> {
    let message_type = MessageType::from_code(reader.read_u16()?)?;
    let _body_len = reader.read_u16()?;
    let cookie = reader.read_u32()?;
    if cookie != MAGIC_COOKIE {
        return Err(DecodeError::BadMagicCookie(cookie));
    }
    Ok((message_type, TransactionId(reader.read_array::<12>()?)))
}

fn read_attribute<'a>(reader: &mut Reader<'a>) -> Result<(u16, &'a [u8]), DecodeError> {
    let attr_type = reader.read_u16()?;
    let len = reader.read_u16()? as usize;
    let value = reader.read_bytes(len)?;
    reader.skip_padding(len)?;
    Ok((attr_type, value))
}

/// Tracks the search for the first usable address attribute
#[derive(Default)]
struct AddressWalk {
    unsupported_family: Option<u8>,
}

impl AddressWalk {
    /// `Some` once an IPv4 address attribute is seen. Non-IPv4 families are
    /// remembered and skipped.
    fn offer(&mut self, attr_type: u16, value: &[u8]) -> Result<Option<Endpoint>, DecodeError> {
        let xor = match attr_type {
            ATTR_MAPPED_ADDRESS => false,
            ATTR_XOR_MAPPED_ADDRESS => true,
            _ => return Ok(None),
        };
        match parse_address(value, xor) {
            Ok(endpoint) => Ok(Some(endpoint)),
            Err(DecodeError::UnsupportedFamily(family)) => {
                self.unsupported_family = Some(family);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn exhausted(&self) -> DecodeError {
        self.unsupported_family
            .map_or(DecodeError::NoAddressAttribute, DecodeError::UnsupportedFamily)
    }
}

fn parse_address(value: &[u8], xor: bool) -> Result<Endpoint, DecodeError> {
    let mut reader = Reader::new(value);
    let _reserved = reader.read_u8()?;
    let family = reader.read_u8()?;
    if family != FAMILY_IPV4 {
        return Err(DecodeError::UnsupportedFamily(family));
    }

    let mut port = reader.read_u16()?;
    let mut ip = reader.read_array::<4>()?;

    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        for (byte, key) in ip.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
            *byte ^= key;
        }
    }

    Ok(Endpoint::new(Ipv4Addr::from(ip), port))
}

fn address_value(endpoint: &Endpoint, encoding: AddressEncoding) -> Vec<u8> {
    let mut port = endpoint.port();
    let mut ip = endpoint.ip().octets();

    if encoding == AddressEncoding::XorMapped {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        for (byte, key) in ip.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
            *byte ^= key;
        }
    }

    let mut value = vec![0, FAMILY_IPV4];
    value.extend_from_slice(&port.to_be_bytes());
    value.extend_from_slice(&ip);
    value
}

/// Build a 20-byte Binding Request with no attributes
pub fn encode_binding_request(transaction_id: &TransactionId) -> Vec<u8> {
    StunMessage::new(MessageType::Request, *transaction_id).encode()
}

/// Build a Binding Success Response carrying `endpoint`
pub fn encode_binding_response(
    transaction_id: &TransactionId,
    endpoint: &Endpoint,
    encoding: AddressEncoding,
) -> Vec<u8> {
    let attr_type = match encoding {
        AddressEncoding::Mapped => ATTR_MAPPED_ADDRESS,
        AddressEncoding::XorMapped => ATTR_XOR_MAPPED_ADDRESS,
    };
    StunMessage::new(MessageType::SuccessResponse, *transaction_id)
        .with_attribute(attr_type, address_value(endpoint, encoding))
        .encode()
}

/// Extract the mapped endpoint from a Binding Success Response
pub fn decode_binding_response(data: &[u8]) -> Result<Endpoint, DecodeError> {
    decode_response(data).map(|(_, endpoint)| endpoint)
}

/// As `decode_binding_response`, but only for the outstanding `expected` transaction
pub fn decode_binding_response_for(
    data: &[u8],
    expected: &TransactionId,
) -> Result<Endpoint, DecodeError> {
    let (transaction_id, endpoint) = decode_response(data)?;
    if transaction_id != *expected {
        return Err(DecodeError::TransactionMismatch);
    }
    Ok(endpoint)
}

/// Whether `data` carries a STUN header: top type bits clear and the magic cookie in place
pub fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= HEADER_LEN
        && data[0] & 0xC0 == 0
        && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// Transaction id of a Binding Request, as a reflector sees it
#[cfg(test)]
pub(crate) fn is_binding_request(data: &[u8]) -> Option<TransactionId> {
    let mut reader = Reader::new(data);
    let msg_type = reader.read_u16().ok()?;
    let _len = reader.read_u16().ok()?;
    let cookie = reader.read_u32().ok()?;
    if msg_type != BINDING_REQUEST || cookie != MAGIC_COOKIE {
        return None;
    }
    reader.read_array::<12>().ok().map(TransactionId)
}

fn decode_response(data: &[u8]) -> Result<(TransactionId, Endpoint), DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            offset: 0,
            needed: HEADER_LEN,
            available: data.len(),
        });
    }

    let mut reader = Reader::new(data);
    let (message_type, transaction_id) = read_header(&mut reader)?;
    if message_type != MessageType::SuccessResponse {
        return Err(DecodeError::UnexpectedMessageType(message_type.code()));
    }

    // Stop at the first address; whatever trails it is not looked at
    let mut walk = AddressWalk::default();
    while !reader.is_empty() {
        let (attr_type, value) = read_attribute(&mut reader)?;
        if let Some(endpoint) = walk.offer(attr_type, value)? {
            return Ok((transaction_id, endpoint));
        }
    }
    Err(walk.exhausted())
}
