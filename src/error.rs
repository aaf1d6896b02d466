use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Reasons a datagram is not a well-formed STUN message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message too short: {len} bytes, header needs 20")]
    TooShort { len: usize },
    #[error("not a STUN message: leading type bits set (0x{0:04x})")]
    NotStun(u16),
    #[error("declared length {declared} does not match {actual} attribute bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("bad magic cookie 0x{0:08x}")]
    BadMagicCookie(u32),
    #[error("bad attribute framing: {0}")]
    Framing(String),
    #[error("malformed attribute 0x{typ:04x}: {reason}")]
    MalformedAttribute { typ: u16, reason: &'static str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("attribute 0x{typ:04x} value is {len} bytes, max 65535")]
    AttributeTooLong { typ: u16, len: usize },
    #[error("message body is {0} bytes, max 65535")]
    MessageTooLong(usize),
    #[error("method 0x{0:04x} is not a 12-bit non-Binding method")]
    InvalidMethod(u16),
    #[error("stun encoder: {0}")]
    Wire(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("cannot resolve {host:?}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} resolved to no address")]
    NoAddress(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown role {0:?}, expected primary, secondary or both")]
    UnknownRole(String),
    #[error("{0} address is empty")]
    MissingAddress(&'static str),
    #[error("role {0} needs a relay address")]
    MissingRelay(&'static str),
    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
    #[error("endpoints {first} and {second} both resolve to {addr}")]
    DuplicateEndpoint {
        first: usize,
        second: usize,
        addr: SocketAddr,
    },
    #[error("cannot read config file {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot parse config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("cannot bind {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("cannot start relay listener on {addr}")]
    RelayListener {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("relay listener setup failed")]
    Http(#[from] hyper::Error),
    #[error("cannot spawn thread")]
    Spawn(#[source] io::Error),
}

/// Failure of one relay hand-off to the peer host.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay transport failed: {0}")]
    Transport(String),
    #[error("relay peer answered HTTP {0}")]
    Status(u16),
    #[error("no relay peer configured")]
    NoPeer,
}

impl From<ureq::Error> for RelayError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => RelayError::Status(code),
            ureq::Error::Transport(t) => RelayError::Transport(t.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("cannot encode reply")]
    Encode(#[from] EncodeError),
    #[error("cannot send reply from endpoint {index} to {to}")]
    Send {
        index: usize,
        to: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("endpoint {0} is not owned by this process")]
    NotOwned(usize),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("socket error")]
    Io(#[from] io::Error),
    #[error("cannot encode request")]
    Encode(#[from] EncodeError),
    #[error("discovery interrupted")]
    Interrupted,
}
