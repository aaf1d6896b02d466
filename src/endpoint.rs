//! The four server endpoints: {primary IP, secondary IP} x {primary port, secondary port}.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ResolveError};

pub const DEFAULT_PORT: u16 = 3478;

/// Bit 0 of an endpoint index selects the port.
pub const PORT_BIT: usize = 0b01;
/// Bit 1 of an endpoint index selects the IP.
pub const IP_BIT: usize = 0b10;

/// Which half of the endpoint grid this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    Primary,
    Secondary,
    Both,
}

impl Role {
    pub fn owned(self) -> Range<usize> {
        match self {
            Role::Primary => 0..2,
            Role::Secondary => 2..4,
            Role::Both => 0..4,
        }
    }

    pub fn owns(self, index: usize) -> bool {
        self.owned().contains(&index)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Secondary => "secondary",
            Role::Both => "both",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "pri" => Ok(Role::Primary),
            "secondary" | "sec" => Ok(Role::Secondary),
            "both" => Ok(Role::Both),
            other => Err(ConfigError::UnknownRole(other.to_string())),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSet([SocketAddr; 4]);

impl EndpointSet {
    pub fn new(addrs: [SocketAddr; 4]) -> Self {
        EndpointSet(addrs)
    }

    pub fn get(&self, index: usize) -> Option<SocketAddr> {
        self.0.get(index).copied()
    }

    /// Primary IP, secondary port: advertised as CHANGED-ADDRESS.
    pub fn alternate(&self) -> SocketAddr {
        self.0[PORT_BIT]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, SocketAddr)> + '_ {
        self.0.iter().copied().enumerate()
    }

    /// First pair of entries naming the same address. Port 0 entries are
    /// skipped because each one binds its own ephemeral port.
    pub fn duplicate(&self) -> Option<(usize, usize, SocketAddr)> {
        for (i, a) in self.iter() {
            if a.port() == 0 {
                continue;
            }
            if let Some((j, _)) = self.iter().skip(i + 1).find(|(_, b)| *b == a) {
                return Some((i, j, a));
            }
        }
        None
    }

    /// Replaces an entry with the address a socket actually bound to.
    pub(crate) fn set_bound(&mut self, index: usize, addr: SocketAddr) {
        self.0[index] = addr;
    }
}

/// Splits `host[:port]` into its host and port, defaulting the port to 3478.
pub fn split_host_port(s: &str) -> Result<(String, u16), ResolveError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ResolveError::InvalidAddress(s.to_string()));
    }
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ResolveError::InvalidAddress(s.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(s, p)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(ResolveError::InvalidAddress(s.to_string())),
        };
        return Ok((host.to_string(), port));
    }
    match s.rsplit_once(':') {
        // More than one colon without brackets: a bare IPv6 address.
        Some((host, _)) if host.contains(':') => Ok((s.to_string(), DEFAULT_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(s, port)?)),
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(whole: &str, port: &str) -> Result<u16, ResolveError> {
    port.parse()
        .map_err(|_| ResolveError::InvalidAddress(whole.to_string()))
}

/// Resolves `host:port` to the first address the resolver returns.
pub fn resolve_addr(s: &str) -> Result<SocketAddr, ResolveError> {
    let (host, port) = split_host_port(s)?;
    lookup(&host, port)
}

fn lookup(host: &str, port: u16) -> Result<SocketAddr, ResolveError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ResolveError::NoAddress(host.to_string()))
}

/// Builds the endpoint grid from the primary and secondary `host[:port]` pairs.
pub fn resolve(primary: &str, secondary: &str) -> Result<EndpointSet, ResolveError> {
    let (pri_host, pri_port) = split_host_port(primary)?;
    let (sec_host, sec_port) = split_host_port(secondary)?;
    let pri_ip = lookup(&pri_host, pri_port)?.ip();
    let sec_ip = lookup(&sec_host, sec_port)?.ip();
    Ok(EndpointSet([
        SocketAddr::new(pri_ip, pri_port),
        SocketAddr::new(pri_ip, sec_port),
        SocketAddr::new(sec_ip, pri_port),
        SocketAddr::new(sec_ip, sec_port),
    ]))
}
