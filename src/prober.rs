//! Sending one Binding Request and waiting for its answer.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::attributes::{Attribute, ChangeRequest};
use crate::error::ClientError;
use crate::message::{verify_fingerprint, Class, StunMessage, TransactionId};

/// Longest single blocking read, so cancellation is noticed quickly.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// What a successful probe learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingResponse {
    /// Our address as the server saw it.
    pub mapped: SocketAddr,
    /// CHANGED-ADDRESS / OTHER-ADDRESS, if the server sent one.
    pub changed: Option<SocketAddr>,
    /// Source address of the response datagram.
    pub responder: SocketAddr,
}

/// Issues binding probes. `Ok(None)` means no answer after every retry.
pub trait Prober {
    fn local_addr(&self) -> Result<SocketAddr, ClientError>;

    fn probe(
        &mut self,
        target: SocketAddr,
        change: Option<ChangeRequest>,
    ) -> Result<Option<BindingResponse>, ClientError>;
}

/// Shared flag a caller sets to abort a running discovery.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct UdpProber {
    socket: UdpSocket,
    timeout: Duration,
    retries: u32,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl UdpProber {
    pub fn bind(local: &str, timeout: Duration, retries: u32) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(local)?;
        debug!(local = %socket.local_addr()?, "probe socket bound");
        Ok(UdpProber {
            socket,
            timeout,
            retries,
            cancel: CancelToken::new(),
            deadline: None,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn check(&self) -> Result<(), ClientError> {
        let expired = self.deadline.map_or(false, |d| Instant::now() >= d);
        if expired || self.cancel.is_cancelled() {
            return Err(ClientError::Interrupted);
        }
        Ok(())
    }

    /// Waits for the success response to transaction `tid` until `until`.
    fn wait_for(
        &self,
        tid: TransactionId,
        until: Instant,
    ) -> Result<Option<BindingResponse>, ClientError> {
        let mut buf = [0u8; 1500];
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(None);
            }
            self.socket
                .set_read_timeout(Some((until - now).min(POLL_SLICE)))?;
            let (len, responder) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock
                            | ErrorKind::TimedOut
                            | ErrorKind::Interrupted
                            | ErrorKind::ConnectionRefused
                            | ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            let raw = &buf[..len];
            let response = match StunMessage::decode(raw) {
                Ok(m) => m,
                Err(e) => {
                    trace!(%responder, error = %e, "ignoring undecodable datagram");
                    continue;
                }
            };
            if response.transaction_id != tid {
                trace!(%responder, "ignoring response to another transaction");
                continue;
            }
            if response.class != Class::Success {
                debug!(%responder, class = ?response.class, "non-success response");
                continue;
            }
            if response.has_fingerprint() && !verify_fingerprint(raw) {
                debug!(%responder, "response fingerprint does not verify");
            }
            let Some(mapped) = response.mapped_address() else {
                debug!(%responder, "response carries no mapped address");
                continue;
            };
            return Ok(Some(BindingResponse {
                mapped,
                changed: response.changed_address(),
                responder,
            }));
        }
    }
}

impl Prober for UdpProber {
    fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    fn probe(
        &mut self,
        target: SocketAddr,
        change: Option<ChangeRequest>,
    ) -> Result<Option<BindingResponse>, ClientError> {
        let mut request = StunMessage::binding_request();
        if let Some(req) = change {
            request = request.with(Attribute::ChangeRequest(req));
        }
        let tid = request.transaction_id;
        let raw = request.with_fingerprint().encode()?;

        for attempt in 0..=self.retries {
            self.check()?;
            debug!(%target, ?change, attempt, %tid, "sending binding request");
            self.socket.send_to(&raw, target)?;
            if let Some(resp) = self.wait_for(tid, Instant::now() + self.timeout)? {
                debug!(%target, mapped = %resp.mapped, responder = %resp.responder, "binding response");
                return Ok(Some(resp));
            }
        }
        debug!(%target, ?change, "no response");
        Ok(None)
    }
}

/// IP the kernel would use to reach `remote`; fills in an unspecified bind IP.
pub fn routed_local_ip(remote: SocketAddr) -> Option<IpAddr> {
    let bind = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(remote).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::build_binding_success;
    use std::thread;

    #[test]
    fn silent_target_yields_none() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut prober = UdpProber::bind("127.0.0.1:0", Duration::from_millis(30), 2).unwrap();
        let started = Instant::now();
        let resp = prober.probe(silent.local_addr().unwrap(), None).unwrap();
        assert!(resp.is_none());
        assert!(started.elapsed() >= Duration::from_millis(90));

        // Every attempt reuses the same transaction id.
        let mut buf = [0u8; 1500];
        silent.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (n, _) = silent.recv_from(&mut buf).unwrap();
            ids.push(StunMessage::decode(&buf[..n]).unwrap().transaction_id);
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn answer_from_other_socket_is_accepted() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let other = UdpSocket::bind("127.0.0.1:0").unwrap();
        let other_addr = other.local_addr().unwrap();
        let target = server.local_addr().unwrap();
        let responder = thread::spawn(move || {
            let mut buf = [0u8; 1500];
            let (n, from) = server.recv_from(&mut buf).unwrap();
            let req = StunMessage::decode(&buf[..n]).unwrap();
            let reply = build_binding_success(&req, from, other_addr, None);
            other.send_to(&reply.encode().unwrap(), from).unwrap();
        });

        let mut prober = UdpProber::bind("127.0.0.1:0", Duration::from_millis(500), 1).unwrap();
        let resp = prober.probe(target, None).unwrap().unwrap();
        responder.join().unwrap();
        assert_eq!(resp.responder, other_addr);
        assert_eq!(resp.mapped, prober.local_addr().unwrap());
        assert_eq!(resp.changed, Some(other_addr));
    }

    #[test]
    fn cancelled_probe_is_interrupted() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let cancel = CancelToken::new();
        let mut prober = UdpProber::bind("127.0.0.1:0", Duration::from_secs(5), 3)
            .unwrap()
            .with_cancel(cancel.clone());
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let started = Instant::now();
        let err = prober.probe(silent.local_addr().unwrap(), None).unwrap_err();
        trigger.join().unwrap();
        assert!(matches!(err, ClientError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn expired_deadline_is_interrupted() {
        let mut prober = UdpProber::bind("127.0.0.1:0", Duration::from_millis(50), 0)
            .unwrap()
            .with_deadline(Instant::now());
        let err = prober.probe("127.0.0.1:9".parse().unwrap(), None).unwrap_err();
        assert!(matches!(err, ClientError::Interrupted));
    }

    #[test]
    fn routed_ip_for_loopback() {
        assert_eq!(
            routed_local_ip("127.0.0.1:3478".parse().unwrap()),
            Some("127.0.0.1".parse().unwrap())
        );
    }
}
