use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::socket::{self, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag, SockType};
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::endpoint::{self, EndpointSet, Role};
use crate::error::{ConfigError, ServerError};
use crate::handler::{BindingHandler, SocketTable};
use crate::relay::{RelayClient, RelayListener};

/// How often a receive loop wakes up to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const RECV_BUFFER: usize = 1500;

/// Binds a UDP socket. With `reuse_port` set, SO_REUSEPORT lets several
/// workers share one endpoint; without it a second bind to `addr` fails.
pub fn bind_udp(addr: SocketAddr, reuse_port: bool) -> Result<UdpSocket, ServerError> {
    let bind_err = |e: nix::Error| ServerError::Bind {
        addr,
        source: std::io::Error::from_raw_os_error(e as i32),
    };
    let family = if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket::socket(family, SockType::Datagram, SockFlag::empty(), None).map_err(bind_err)?;
    // Owned from here on, so every early return closes the descriptor.
    let skt = unsafe { UdpSocket::from_raw_fd(fd) };
    if reuse_port {
        socket::setsockopt(skt.as_raw_fd(), sockopt::ReusePort, &true).map_err(bind_err)?;
    }
    let sock_addr = SockAddr::new_inet(InetAddr::from_std(&addr));
    socket::bind(skt.as_raw_fd(), &sock_addr).map_err(bind_err)?;
    Ok(skt)
}

pub struct StunServer {
    config: ServerConfig,
    endpoints: EndpointSet,
}

impl StunServer {
    /// Validates the configuration and resolves the endpoint grid. Nothing is
    /// bound yet.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let endpoints = endpoint::resolve(&config.primary_addr, &config.secondary_addr)?;
        if let Some((first, second, addr)) = endpoints.duplicate() {
            return Err(ConfigError::DuplicateEndpoint {
                first,
                second,
                addr,
            }
            .into());
        }
        Ok(StunServer { config, endpoints })
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// Binds every owned endpoint and starts serving. Fails without leaving
    /// anything running if any socket cannot be bound.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let role = self.config.role;
        let workers = self.config.worker_count();
        let reuse_port = workers > 1;
        let mut endpoints = self.endpoints;
        let mut sockets: SocketTable = Default::default();
        let mut receivers: Vec<(usize, Arc<UdpSocket>)> = Vec::new();

        for index in role.owned() {
            let Some(addr) = endpoints.get(index) else {
                continue;
            };
            let primary = Arc::new(bind_udp(addr, reuse_port)?);
            let bound = primary
                .local_addr()
                .map_err(|source| ServerError::Bind { addr, source })?;
            for _ in 1..workers {
                receivers.push((index, Arc::new(bind_udp(bound, reuse_port)?)));
            }
            info!(index, addr = %bound, workers, "listening");
            endpoints.set_bound(index, bound);
            receivers.push((index, Arc::clone(&primary)));
            sockets[index] = Some(primary);
        }

        let relay_client = match (role, self.config.relay_addr.as_deref()) {
            (Role::Primary, Some(peer)) => Some(RelayClient::new(peer, self.config.relay_timeout())),
            _ => None,
        };
        let handler = Arc::new(BindingHandler::new(
            endpoints,
            role,
            sockets,
            relay_client,
            self.config.software.clone(),
        ));

        let relay_listener = match (role, self.config.relay_addr.as_deref()) {
            (Role::Secondary, Some(listen)) => {
                let addr = endpoint::resolve_addr(listen)?;
                Some(RelayListener::start(addr, Arc::clone(&handler))?)
            }
            _ => None,
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(receivers.len());
        for (worker, (index, skt)) in receivers.into_iter().enumerate() {
            let handler = Arc::clone(&handler);
            let stop = Arc::clone(&shutdown);
            let spawned = thread::Builder::new()
                .name(format!("stun-{index}-{worker}"))
                .spawn(move || run(index, skt, handler, stop));
            match spawned {
                Ok(t) => threads.push(t),
                Err(e) => {
                    shutdown.store(true, Ordering::SeqCst);
                    return Err(ServerError::Spawn(e));
                }
            }
        }

        Ok(ServerHandle {
            handler,
            shutdown,
            threads,
            relay_listener,
        })
    }
}

/// Receive loop of one socket. Ends on shutdown or on a read error.
fn run(index: usize, skt: Arc<UdpSocket>, handler: Arc<BindingHandler>, shutdown: Arc<AtomicBool>) {
    if let Err(e) = skt.set_read_timeout(Some(POLL_INTERVAL)) {
        error!(index, error = %e, "cannot set read timeout");
        return;
    }
    let mut buf = [0u8; RECV_BUFFER];
    while !shutdown.load(Ordering::Relaxed) {
        match skt.recv_from(&mut buf) {
            Ok((len, from)) => {
                debug!(index, %from, len, "received");
                handler.process_stun_request(index, from, &buf[..len]);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                error!(index, error = %e, "read failed, endpoint stops serving");
                return;
            }
        }
    }
    debug!(index, "receive loop stopped");
}

pub struct ServerHandle {
    handler: Arc<BindingHandler>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    relay_listener: Option<RelayListener>,
}

impl ServerHandle {
    /// Endpoint grid with owned entries set to their bound addresses.
    pub fn endpoints(&self) -> &EndpointSet {
        self.handler.endpoints()
    }

    pub fn role(&self) -> Role {
        self.handler.role()
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_listener.as_ref().map(RelayListener::addr)
    }

    /// Blocks until every receive loop has ended.
    pub fn wait(mut self) {
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        if let Some(listener) = self.relay_listener.take() {
            listener.shutdown();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_port_allows_shared_endpoint() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_udp(addr, true).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn exclusive_bind_conflicts() {
        let first = bind_udp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(matches!(
            bind_udp(addr, false),
            Err(ServerError::Bind { addr: a, .. }) if a == addr
        ));
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        assert!(matches!(
            bind_udp(addr, true),
            Err(ServerError::Bind { addr: a, .. }) if a == addr
        ));
    }

    #[test]
    fn colliding_endpoints_are_refused() {
        let config = ServerConfig {
            primary_addr: "127.0.0.1:3478".into(),
            secondary_addr: "127.0.0.2:3478".into(),
            ..Default::default()
        };
        assert!(matches!(
            StunServer::new(config),
            Err(ServerError::Config(ConfigError::DuplicateEndpoint {
                first: 0,
                second: 1,
                ..
            }))
        ));
    }
}
