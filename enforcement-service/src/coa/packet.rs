//! RADIUS Dynamic Authorization packets (RFC 5176).

use md5::{Digest, Md5};
use std::net::Ipv4Addr;
use thiserror::Error;

const HEADER_LEN: usize = 20;
const MAX_PACKET_LEN: usize = 4096;
const MAX_ATTR_VALUE_LEN: usize = 253;

pub const ATTR_USER_NAME: u8 = 1;
pub const ATTR_FRAMED_IP_ADDRESS: u8 = 8;
pub const ATTR_VENDOR_SPECIFIC: u8 = 26;
pub const ATTR_ACCT_SESSION_ID: u8 = 44;
pub const ATTR_ERROR_CAUSE: u8 = 101;

pub const VENDOR_MIKROTIK: u32 = 14988;
pub const MIKROTIK_RATE_LIMIT: u8 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,
    #[error("declared length {0} does not match datagram")]
    BadLength(usize),
    #[error("packet exceeds 4096 bytes")]
    TooLong,
    #[error("attribute {0} value too long")]
    AttributeTooLong(u8),
    #[error("unknown packet code {0}")]
    UnknownCode(u8),
    #[error("authenticator mismatch")]
    BadAuthenticator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCode {
    DisconnectRequest,
    DisconnectAck,
    DisconnectNak,
    CoaRequest,
    CoaAck,
    CoaNak,
}

impl PacketCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            PacketCode::DisconnectRequest => 40,
            PacketCode::DisconnectAck => 41,
            PacketCode::DisconnectNak => 42,
            PacketCode::CoaRequest => 43,
            PacketCode::CoaAck => 44,
            PacketCode::CoaNak => 45,
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            40 => Some(PacketCode::DisconnectRequest),
            41 => Some(PacketCode::DisconnectAck),
            42 => Some(PacketCode::DisconnectNak),
            43 => Some(PacketCode::CoaRequest),
            44 => Some(PacketCode::CoaAck),
            45 => Some(PacketCode::CoaNak),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, PacketCode::DisconnectRequest | PacketCode::CoaRequest)
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, PacketCode::DisconnectAck | PacketCode::CoaAck)
    }

    /// The ACK a device sends back for this request code.
    pub fn ack(&self) -> Self {
        match self {
            PacketCode::DisconnectRequest => PacketCode::DisconnectAck,
            PacketCode::CoaRequest => PacketCode::CoaAck,
            other => *other,
        }
    }

    pub fn nak(&self) -> Self {
        match self {
            PacketCode::DisconnectRequest => PacketCode::DisconnectNak,
            PacketCode::CoaRequest => PacketCode::CoaNak,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    UserName(String),
    FramedIpAddress(Ipv4Addr),
    AcctSessionId(String),
    ErrorCause(u32),
    MikrotikRateLimit(String),
    Other { kind: u8, value: Vec<u8> },
}

impl Attribute {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        match self {
            Attribute::UserName(name) => push_attr(out, ATTR_USER_NAME, name.as_bytes()),
            Attribute::FramedIpAddress(ip) => push_attr(out, ATTR_FRAMED_IP_ADDRESS, &ip.octets()),
            Attribute::AcctSessionId(id) => push_attr(out, ATTR_ACCT_SESSION_ID, id.as_bytes()),
            Attribute::ErrorCause(cause) => push_attr(out, ATTR_ERROR_CAUSE, &cause.to_be_bytes()),
            Attribute::MikrotikRateLimit(rate) => {
                let rate = rate.as_bytes();
                // vendor id (4) + vendor type (1) + vendor length (1)
                if rate.len() + 6 > MAX_ATTR_VALUE_LEN {
                    return Err(PacketError::AttributeTooLong(ATTR_VENDOR_SPECIFIC));
                }
                let mut value = Vec::with_capacity(rate.len() + 6);
                value.extend_from_slice(&VENDOR_MIKROTIK.to_be_bytes());
                value.push(MIKROTIK_RATE_LIMIT);
                value.push((rate.len() + 2) as u8);
                value.extend_from_slice(rate);
                push_attr(out, ATTR_VENDOR_SPECIFIC, &value)
            }
            Attribute::Other { kind, value } => push_attr(out, *kind, value),
        }
    }

    fn decode(kind: u8, value: &[u8]) -> Attribute {
        let text = || String::from_utf8_lossy(value).into_owned();
        match kind {
            ATTR_USER_NAME => Attribute::UserName(text()),
            ATTR_ACCT_SESSION_ID => Attribute::AcctSessionId(text()),
            ATTR_FRAMED_IP_ADDRESS if value.len() == 4 => {
                Attribute::FramedIpAddress(Ipv4Addr::new(value[0], value[1], value[2], value[3]))
            }
            ATTR_ERROR_CAUSE if value.len() == 4 => {
                Attribute::ErrorCause(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            }
            ATTR_VENDOR_SPECIFIC
                if value.len() >= 6
                    && value[..4] == VENDOR_MIKROTIK.to_be_bytes()
                    && value[4] == MIKROTIK_RATE_LIMIT
                    && value[5] as usize == value.len() - 4 =>
            {
                Attribute::MikrotikRateLimit(String::from_utf8_lossy(&value[6..]).into_owned())
            }
            _ => Attribute::Other {
                kind,
                value: value.to_vec(),
            },
        }
    }
}

fn push_attr(out: &mut Vec<u8>, kind: u8, value: &[u8]) -> Result<(), PacketError> {
    if value.len() > MAX_ATTR_VALUE_LEN {
        return Err(PacketError::AttributeTooLong(kind));
    }
    out.push(kind);
    out.push((value.len() + 2) as u8);
    out.extend_from_slice(value);
    Ok(())
}

fn digest(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// A decoded or to-be-encoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: PacketCode,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    pub fn new(code: PacketCode, identifier: u8) -> Self {
        Self {
            code,
            identifier,
            authenticator: [0u8; 16],
            attributes: Vec::new(),
        }
    }

    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn error_cause(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCause(cause) => Some(*cause),
            _ => None,
        })
    }

    fn encode_attributes(&self) -> Result<Vec<u8>, PacketError> {
        let mut attrs = Vec::new();
        for attribute in &self.attributes {
            attribute.encode(&mut attrs)?;
        }
        if attrs.len() + HEADER_LEN > MAX_PACKET_LEN {
            return Err(PacketError::TooLong);
        }
        Ok(attrs)
    }

    fn header(&self, length: u16) -> [u8; 4] {
        let len = length.to_be_bytes();
        [self.code.as_u8(), self.identifier, len[0], len[1]]
    }

    fn assemble(&self, authenticator: &[u8; 16], attrs: &[u8]) -> Vec<u8> {
        let length = (HEADER_LEN + attrs.len()) as u16;
        let mut out = Vec::with_capacity(length as usize);
        out.extend_from_slice(&self.header(length));
        out.extend_from_slice(authenticator);
        out.extend_from_slice(attrs);
        out
    }

    /// Encode a request, computing its authenticator.
    ///
    /// Returns the datagram and the authenticator needed to verify the reply.
    pub fn encode_request(&self, secret: &[u8]) -> Result<(Vec<u8>, [u8; 16]), PacketError> {
        let attrs = self.encode_attributes()?;
        let length = (HEADER_LEN + attrs.len()) as u16;
        let authenticator = digest(&[
            &self.header(length)[..],
            &[0u8; 16][..],
            &attrs[..],
            secret,
        ]);
        Ok((self.assemble(&authenticator, &attrs), authenticator))
    }

    /// Encode a response to the request carrying `request_authenticator`.
    pub fn encode_response(
        &self,
        request_authenticator: &[u8; 16],
        secret: &[u8],
    ) -> Result<Vec<u8>, PacketError> {
        let attrs = self.encode_attributes()?;
        let length = (HEADER_LEN + attrs.len()) as u16;
        let authenticator = digest(&[
            &self.header(length)[..],
            &request_authenticator[..],
            &attrs[..],
            secret,
        ]);
        Ok(self.assemble(&authenticator, &attrs))
    }

    fn parse(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        if buf.len() > MAX_PACKET_LEN {
            return Err(PacketError::TooLong);
        }
        let code = PacketCode::from_u8(buf[0]).ok_or(PacketError::UnknownCode(buf[0]))?;
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length < HEADER_LEN || length > buf.len() {
            return Err(PacketError::BadLength(length));
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&buf[4..HEADER_LEN]);

        let mut attributes = Vec::new();
        let mut rest = &buf[HEADER_LEN..length];
        while !rest.is_empty() {
            if rest.len() < 2 {
                return Err(PacketError::Truncated);
            }
            let attr_len = rest[1] as usize;
            if attr_len < 2 || attr_len > rest.len() {
                return Err(PacketError::BadLength(attr_len));
            }
            attributes.push(Attribute::decode(rest[0], &rest[2..attr_len]));
            rest = &rest[attr_len..];
        }

        Ok(Packet {
            code,
            identifier: buf[1],
            authenticator,
            attributes,
        })
    }

    /// Decode a reply and check its authenticator against the request's.
    pub fn decode_response(
        buf: &[u8],
        request_authenticator: &[u8; 16],
        secret: &[u8],
    ) -> Result<Packet, PacketError> {
        let packet = Packet::parse(buf)?;
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let expected = digest(&[
            &buf[..4],
            &request_authenticator[..],
            &buf[HEADER_LEN..length],
            secret,
        ]);
        if expected != packet.authenticator {
            return Err(PacketError::BadAuthenticator);
        }
        Ok(packet)
    }

    /// Decode a request and check its authenticator, as a device would.
    pub fn decode_request(buf: &[u8], secret: &[u8]) -> Result<Packet, PacketError> {
        let packet = Packet::parse(buf)?;
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let expected = digest(&[&buf[..4], &[0u8; 16][..], &buf[HEADER_LEN..length], secret]);
        if expected != packet.authenticator {
            return Err(PacketError::BadAuthenticator);
        }
        Ok(packet)
    }
}
