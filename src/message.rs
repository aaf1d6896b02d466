//! STUN message header and wire codec (RFC 5389 framing, RFC 3489 attributes).
//!
//! Framing, padding and FINGERPRINT come from `stun::message::Message`;
//! `StunMessage` is the typed view the server and client work with.

use std::fmt;
use std::net::SocketAddr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use stun::fingerprint::FINGERPRINT;
use stun::message::{Message, MessageType, Setter};

use crate::attributes::{Attribute, ChangeRequest, ATTR_FINGERPRINT};
use crate::error::{DecodeError, EncodeError};

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_SIZE: usize = 20;

const METHOD_BINDING: u16 = 0x001;
const METHOD_MAX: u16 = 0x0FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Binding,
    Other(u16),
}

impl Method {
    /// The 12-bit method number. `Other` must not alias Binding or overflow
    /// 12 bits, otherwise it would not survive a decode.
    pub fn code(self) -> Result<u16, EncodeError> {
        match self {
            Method::Binding => Ok(METHOD_BINDING),
            Method::Other(code) if code == METHOD_BINDING || code > METHOD_MAX => {
                Err(EncodeError::InvalidMethod(code))
            }
            Method::Other(code) => Ok(code),
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            METHOD_BINDING => Method::Binding,
            other => Method::Other(other),
        }
    }
}

fn message_type(class: Class, method: Method) -> Result<u16, EncodeError> {
    let m = method.code()?;
    let c = class.bits();
    Ok((m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7))
}

fn split_message_type(typ: u16) -> (Class, Method) {
    let method = (typ & 0x000F) | ((typ >> 1) & 0x0070) | ((typ >> 2) & 0x0F80);
    let class = ((typ >> 4) & 0b01) | ((typ >> 7) & 0b10);
    (Class::from_bits(class), Method::from_code(method))
}

/// 96-bit transaction id, opaque and copied verbatim into replies.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn random() -> Self {
        let mut raw = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut raw);
        TransactionId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl From<[u8; 12]> for TransactionId {
    fn from(raw: [u8; 12]) -> Self {
        TransactionId(raw)
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StunMessage {
    pub class: Class,
    pub method: Method,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn new(class: Class, method: Method, transaction_id: TransactionId) -> Self {
        StunMessage {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// A Binding Request with a fresh transaction id.
    pub fn binding_request() -> Self {
        StunMessage::new(Class::Request, Method::Binding, TransactionId::random())
    }

    pub fn with(mut self, attr: Attribute) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Requests a FINGERPRINT; its value is computed by `encode`.
    pub fn with_fingerprint(self) -> Self {
        self.with(Attribute::Fingerprint(0))
    }

    pub fn is_binding_request(&self) -> bool {
        self.class == Class::Request && self.method == Method::Binding
    }

    pub fn change_request(&self) -> Option<ChangeRequest> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ChangeRequest(req) => Some(*req),
            _ => None,
        })
    }

    /// XOR-MAPPED-ADDRESS, falling back to the legacy MAPPED-ADDRESS.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let xor = self.attributes.iter().find_map(|attr| match attr {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        });
        xor.or_else(|| {
            self.attributes.iter().find_map(|attr| match attr {
                Attribute::MappedAddress(addr) => Some(*addr),
                _ => None,
            })
        })
    }

    /// CHANGED-ADDRESS or its RFC 5780 successor OTHER-ADDRESS.
    pub fn changed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            Attribute::ChangedAddress(addr) | Attribute::OtherAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn has_fingerprint(&self) -> bool {
        self.attributes
            .iter()
            .any(|attr| matches!(attr, Attribute::Fingerprint(_)))
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut m = Message::new();
        let mut typ = MessageType::default();
        typ.read_value(message_type(self.class, self.method)?);
        m.typ = typ;
        m.transaction_id = stun::agent::TransactionId(*self.transaction_id.as_bytes());
        m.write_header();

        for attr in &self.attributes {
            if matches!(attr, Attribute::Fingerprint(_)) {
                continue;
            }
            attr.add_to(&mut m)?;
        }
        if self.has_fingerprint() {
            FINGERPRINT
                .add_to(&mut m)
                .map_err(|e| EncodeError::Wire(e.to_string()))?;
        }
        // Message::add keeps a u32 running length but writes it as u16.
        if m.length > u16::MAX as u32 {
            return Err(EncodeError::MessageTooLong(m.length as usize));
        }
        Ok(m.raw)
    }

    /// Parses a datagram. FINGERPRINT is kept but not verified.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let typ = check_header(raw)?;
        let mut m = Message::new();
        m.unmarshal_binary(raw)
            .map_err(|e| DecodeError::Framing(e.to_string()))?;

        let transaction_id = TransactionId(m.transaction_id.0);
        let (class, method) = split_message_type(typ);
        let attributes = m
            .attributes
            .0
            .iter()
            .map(|a| Attribute::decode(a.typ.value(), &a.value, &transaction_id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StunMessage {
            class,
            method,
            transaction_id,
            attributes,
        })
    }
}

/// Header checks the `stun` decoder leaves out: the two leading zero bits and
/// an exact body length. Returns the raw message type.
fn check_header(raw: &[u8]) -> Result<u16, DecodeError> {
    if raw.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort { len: raw.len() });
    }
    let typ = u16::from_be_bytes([raw[0], raw[1]]);
    if typ & 0xC000 != 0 {
        return Err(DecodeError::NotStun(typ));
    }
    let cookie = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(DecodeError::BadMagicCookie(cookie));
    }
    let declared = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let actual = raw.len() - HEADER_SIZE;
    if declared != actual {
        return Err(DecodeError::LengthMismatch { declared, actual });
    }
    Ok(typ)
}

/// Checks a raw message's trailing FINGERPRINT. False when absent or wrong.
pub fn verify_fingerprint(raw: &[u8]) -> bool {
    if check_header(raw).is_err() {
        return false;
    }
    let mut m = Message::new();
    if m.unmarshal_binary(raw).is_err() {
        return false;
    }
    let last = m.attributes.0.last().map(|a| a.typ.value());
    last == Some(ATTR_FINGERPRINT) && FINGERPRINT.check(&m).is_ok()
}
