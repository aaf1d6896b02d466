//! STUN attributes understood by the server and the classifier.
//!
//! The typed `Attribute` enum sits on top of `stun::message::Message`. Address
//! and XOR-address bodies go through `stun::addr` and `stun::xoraddr`, so the
//! byte layout is the one the `stun` crate produces.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use stun::addr::MappedAddress as WireAddress;
use stun::attributes::AttrType;
use stun::message::Message;
use stun::xoraddr::XorMappedAddress as WireXorAddress;

use crate::error::{DecodeError, EncodeError};
use crate::message::TransactionId;

pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_CHANGE_REQUEST: u16 = 0x0003;
pub const ATTR_CHANGED_ADDRESS: u16 = 0x0005;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_SOFTWARE: u16 = 0x8022;
pub const ATTR_FINGERPRINT: u16 = 0x8028;
pub const ATTR_OTHER_ADDRESS: u16 = 0x802C;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

const CHANGE_IP: u32 = 0x04;
const CHANGE_PORT: u32 = 0x02;

/// Body of a CHANGE-REQUEST attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub change_ip: bool,
    pub change_port: bool,
}

impl ChangeRequest {
    pub fn new(change_ip: bool, change_port: bool) -> Self {
        ChangeRequest {
            change_ip,
            change_port,
        }
    }

    fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.change_ip {
            bits |= CHANGE_IP;
        }
        if self.change_port {
            bits |= CHANGE_PORT;
        }
        bits
    }

    fn from_bits(bits: u32) -> Self {
        ChangeRequest {
            change_ip: bits & CHANGE_IP != 0,
            change_port: bits & CHANGE_PORT != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    ChangedAddress(SocketAddr),
    OtherAddress(SocketAddr),
    ChangeRequest(ChangeRequest),
    Software(String),
    /// Always recomputed on encode, so the stored value only matters after decode.
    Fingerprint(u32),
    Unknown { typ: u16, value: Vec<u8> },
}

impl Attribute {
    pub fn typ(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Attribute::ChangedAddress(_) => ATTR_CHANGED_ADDRESS,
            Attribute::OtherAddress(_) => ATTR_OTHER_ADDRESS,
            Attribute::ChangeRequest(_) => ATTR_CHANGE_REQUEST,
            Attribute::Software(_) => ATTR_SOFTWARE,
            Attribute::Fingerprint(_) => ATTR_FINGERPRINT,
            Attribute::Unknown { typ, .. } => *typ,
        }
    }

    /// Appends the attribute to `m`. The XOR mask uses `m.transaction_id`, so
    /// the header must be written first. FINGERPRINT is the caller's job.
    pub(crate) fn add_to(&self, m: &mut Message) -> Result<(), EncodeError> {
        let typ = AttrType(self.typ());
        let added = match self {
            Attribute::MappedAddress(addr)
            | Attribute::ChangedAddress(addr)
            | Attribute::OtherAddress(addr) => WireAddress {
                ip: addr.ip(),
                port: addr.port(),
            }
            .add_to_as(m, typ),
            Attribute::XorMappedAddress(addr) => WireXorAddress {
                ip: addr.ip(),
                port: addr.port(),
            }
            .add_to_as(m, typ),
            Attribute::ChangeRequest(req) => {
                m.add(typ, &req.to_bits().to_be_bytes());
                Ok(())
            }
            Attribute::Software(text) => {
                m.add(typ, checked_len(typ, text.as_bytes())?);
                Ok(())
            }
            Attribute::Fingerprint(crc) => {
                m.add(typ, &crc.to_be_bytes());
                Ok(())
            }
            Attribute::Unknown { value, .. } => {
                m.add(typ, checked_len(typ, value)?);
                Ok(())
            }
        };
        added.map_err(|e| EncodeError::Wire(e.to_string()))
    }

    pub(crate) fn decode(typ: u16, value: &[u8], tid: &TransactionId) -> Result<Self, DecodeError> {
        let attr = match typ {
            ATTR_MAPPED_ADDRESS => Attribute::MappedAddress(plain_address(typ, value)?),
            ATTR_CHANGED_ADDRESS => Attribute::ChangedAddress(plain_address(typ, value)?),
            ATTR_OTHER_ADDRESS => Attribute::OtherAddress(plain_address(typ, value)?),
            ATTR_XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(xor_address(typ, value, tid)?),
            ATTR_CHANGE_REQUEST => Attribute::ChangeRequest(ChangeRequest::from_bits(
                read_u32(typ, value)?,
            )),
            ATTR_SOFTWARE => Attribute::Software(String::from_utf8(value.to_vec()).map_err(
                |_| DecodeError::MalformedAttribute {
                    typ,
                    reason: "SOFTWARE is not UTF-8",
                },
            )?),
            ATTR_FINGERPRINT => Attribute::Fingerprint(read_u32(typ, value)?),
            _ => Attribute::Unknown {
                typ,
                value: value.to_vec(),
            },
        };
        Ok(attr)
    }
}

fn checked_len(typ: AttrType, value: &[u8]) -> Result<&[u8], EncodeError> {
    if value.len() > u16::MAX as usize {
        return Err(EncodeError::AttributeTooLong {
            typ: typ.value(),
            len: value.len(),
        });
    }
    Ok(value)
}

/// Checks family and length, then returns the value with the reserved byte
/// cleared so the `stun` getters read the family as a plain u16.
fn address_value(typ: u16, value: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if value.len() < 4 {
        return Err(DecodeError::MalformedAttribute {
            typ,
            reason: "address shorter than 4 bytes",
        });
    }
    let want = match value[1] {
        FAMILY_IPV4 => 4,
        FAMILY_IPV6 => 16,
        _ => {
            return Err(DecodeError::MalformedAttribute {
                typ,
                reason: "unsupported address family",
            })
        }
    };
    if value.len() != 4 + want {
        return Err(DecodeError::MalformedAttribute {
            typ,
            reason: "address length does not match family",
        });
    }
    let mut cleared = value.to_vec();
    cleared[0] = 0;
    Ok(cleared)
}

/// A one-attribute message carrying `value`, for the `stun` getters.
fn single(typ: u16, value: &[u8], tid: &TransactionId) -> Message {
    let mut m = Message::new();
    m.transaction_id = stun::agent::TransactionId(*tid.as_bytes());
    m.write_header();
    m.add(AttrType(typ), value);
    m
}

fn plain_address(typ: u16, value: &[u8]) -> Result<SocketAddr, DecodeError> {
    let value = address_value(typ, value)?;
    let m = single(typ, &value, &TransactionId::from([0; 12]));
    let mut addr = WireAddress {
        ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 0,
    };
    addr.get_from_as(&m, AttrType(typ))
        .map_err(|_| DecodeError::MalformedAttribute {
            typ,
            reason: "unreadable address",
        })?;
    Ok(SocketAddr::new(addr.ip, addr.port))
}

fn xor_address(typ: u16, value: &[u8], tid: &TransactionId) -> Result<SocketAddr, DecodeError> {
    let value = address_value(typ, value)?;
    let m = single(typ, &value, tid);
    let mut addr = WireXorAddress {
        ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 0,
    };
    addr.get_from_as(&m, AttrType(typ))
        .map_err(|_| DecodeError::MalformedAttribute {
            typ,
            reason: "unreadable XOR address",
        })?;
    Ok(SocketAddr::new(addr.ip, addr.port))
}

fn read_u32(typ: u16, value: &[u8]) -> Result<u32, DecodeError> {
    let raw: [u8; 4] = value
        .try_into()
        .map_err(|_| DecodeError::MalformedAttribute {
            typ,
            reason: "expected 4 bytes",
        })?;
    Ok(u32::from_be_bytes(raw))
}
