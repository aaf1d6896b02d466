//! Binding request processing: endpoint selection and reply construction.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::attributes::{Attribute, ChangeRequest};
use crate::endpoint::{EndpointSet, Role, IP_BIT, PORT_BIT};
use crate::error::{HandlerError, RelayError};
use crate::message::{Class, Method, StunMessage};
use crate::relay::{RelayClient, RelayEnvelope};

/// One reply socket per endpoint index, `None` where another host owns it.
pub type SocketTable = [Option<Arc<UdpSocket>>; 4];

/// Index of the endpoint that must answer a request received on `received`.
pub fn target_index(received: usize, change: Option<ChangeRequest>) -> usize {
    match change {
        None => received,
        Some(req) => {
            let mut index = received;
            if req.change_ip {
                index ^= IP_BIT;
            }
            if req.change_port {
                index ^= PORT_BIT;
            }
            index
        }
    }
}

/// Builds the Binding success response for a client seen at `from`.
pub fn build_binding_success(
    request: &StunMessage,
    from: SocketAddr,
    alternate: SocketAddr,
    software: Option<&str>,
) -> StunMessage {
    let mut reply = StunMessage::new(Class::Success, Method::Binding, request.transaction_id)
        .with(Attribute::XorMappedAddress(from))
        .with(Attribute::XorMappedAddress(from))
        .with(Attribute::ChangedAddress(alternate));
    if let Some(name) = software {
        reply = reply.with(Attribute::Software(name.to_string()));
    }
    reply.with_fingerprint()
}

/// What happened to one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Replied { index: usize },
    Relayed { index: usize },
    Dropped,
}

/// Shared, read-only state of every receive loop and the relay listener.
pub struct BindingHandler {
    endpoints: EndpointSet,
    role: Role,
    sockets: SocketTable,
    relay: Option<RelayClient>,
    software: Option<String>,
}

impl BindingHandler {
    pub fn new(
        endpoints: EndpointSet,
        role: Role,
        sockets: SocketTable,
        relay: Option<RelayClient>,
        software: Option<String>,
    ) -> Self {
        BindingHandler {
            endpoints,
            role,
            sockets,
            relay,
            software,
        }
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn owns(&self, index: usize) -> bool {
        self.role.owns(index) && self.socket(index).is_some()
    }

    fn socket(&self, index: usize) -> Option<&Arc<UdpSocket>> {
        self.sockets.get(index).and_then(Option::as_ref)
    }

    /// Handles one datagram received on endpoint `index`. Never fails: every
    /// problem is logged and the datagram dropped.
    pub fn process_stun_request(&self, index: usize, from: SocketAddr, buf: &[u8]) -> Disposition {
        let request = match StunMessage::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(index, %from, error = %e, "failed to decode, dropping");
                return Disposition::Dropped;
            }
        };
        if request.class != Class::Request {
            warn!(index, %from, class = ?request.class, "not a request, dropping");
            return Disposition::Dropped;
        }
        if request.method != Method::Binding {
            warn!(index, %from, method = ?request.method, "not a binding request, dropping");
            return Disposition::Dropped;
        }

        let change = request.change_request();
        let target = target_index(index, change);
        debug!(index, target, %from, tid = %request.transaction_id, ?change, "binding request");

        let result = if self.owns(target) {
            self.reply_from(target, from, &request)
                .map(|()| Disposition::Replied { index: target })
        } else if self.role == Role::Primary {
            self.relay(target, from, request)
                .map(|()| Disposition::Relayed { index: target })
        } else {
            Err(HandlerError::NotOwned(target))
        };

        match result {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(index, target, %from, role = %self.role, error = %e, "binding request not answered");
                Disposition::Dropped
            }
        }
    }

    /// Sends the Binding success response from the local socket `index`.
    pub fn reply_from(
        &self,
        index: usize,
        from: SocketAddr,
        request: &StunMessage,
    ) -> Result<(), HandlerError> {
        let socket = self.socket(index).ok_or(HandlerError::NotOwned(index))?;
        let reply = build_binding_success(
            request,
            from,
            self.endpoints.alternate(),
            self.software.as_deref(),
        );
        let raw = reply.encode()?;
        socket
            .send_to(&raw, from)
            .map_err(|source| HandlerError::Send {
                index,
                to: from,
                source,
            })?;
        trace!(index, to = %from, len = raw.len(), "sent binding success");
        Ok(())
    }

    fn relay(&self, index: usize, from: SocketAddr, message: StunMessage) -> Result<(), HandlerError> {
        let client = self.relay.as_ref().ok_or(RelayError::NoPeer)?;
        client.forward(&RelayEnvelope {
            from,
            message,
            index,
        })?;
        debug!(index, %from, "relayed to peer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransactionId;
    use std::time::Duration;

    #[test]
    fn target_index_table() {
        for base in 0..4 {
            let mut targets = Vec::new();
            for (ip, port) in [(false, false), (true, false), (false, true), (true, true)] {
                let expected = base ^ (if ip { 2 } else { 0 }) ^ (if port { 1 } else { 0 });
                let got = target_index(base, Some(ChangeRequest::new(ip, port)));
                assert_eq!(got, expected, "base {base} ip {ip} port {port}");
                targets.push(got);
            }
            targets.sort_unstable();
            assert_eq!(targets, vec![0, 1, 2, 3], "base {base} targets collide");
            assert_eq!(target_index(base, None), base);
        }
    }

    #[test]
    fn success_attributes() {
        let req = StunMessage::new(
            Class::Request,
            Method::Binding,
            TransactionId::from([7; 12]),
        );
        let from: SocketAddr = "203.0.113.9:5000".parse().unwrap();
        let alt: SocketAddr = "198.51.100.1:3479".parse().unwrap();
        let reply = build_binding_success(&req, from, alt, Some("natstun"));
        assert_eq!(reply.class, Class::Success);
        assert_eq!(reply.transaction_id, req.transaction_id);
        assert_eq!(
            reply.attributes[..4],
            [
                Attribute::XorMappedAddress(from),
                Attribute::XorMappedAddress(from),
                Attribute::ChangedAddress(alt),
                Attribute::Software("natstun".into()),
            ]
        );
        assert!(matches!(reply.attributes.last(), Some(Attribute::Fingerprint(_))));
    }

    fn loopback_handler(role: Role, relay: Option<RelayClient>) -> (BindingHandler, Vec<SocketAddr>) {
        let mut sockets: SocketTable = Default::default();
        let mut addrs: [SocketAddr; 4] = ["127.0.0.1:0".parse().unwrap(); 4];
        for index in role.owned() {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            addrs[index] = socket.local_addr().unwrap();
            sockets[index] = Some(Arc::new(socket));
        }
        let handler = BindingHandler::new(EndpointSet::new(addrs), role, sockets, relay, None);
        (handler, addrs.to_vec())
    }

    #[test]
    fn drops_garbage_and_non_requests() {
        let (handler, _) = loopback_handler(Role::Both, None);
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(handler.process_stun_request(0, from, b"hello"), Disposition::Dropped);

        let indication = StunMessage::new(Class::Indication, Method::Binding, TransactionId::random())
            .encode()
            .unwrap();
        assert_eq!(handler.process_stun_request(0, from, &indication), Disposition::Dropped);

        let allocate = StunMessage::new(Class::Request, Method::Other(0x003), TransactionId::random())
            .encode()
            .unwrap();
        assert_eq!(handler.process_stun_request(0, from, &allocate), Disposition::Dropped);
    }

    #[test]
    fn replies_from_changed_endpoint() {
        let (handler, addrs) = loopback_handler(Role::Both, None);
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let request = StunMessage::binding_request()
            .with(Attribute::ChangeRequest(ChangeRequest::new(false, true)));
        let raw = request.encode().unwrap();

        let disposition = handler.process_stun_request(2, client.local_addr().unwrap(), &raw);
        assert_eq!(disposition, Disposition::Replied { index: 3 });

        let mut buf = [0u8; 1500];
        let (n, src) = client.recv_from(&mut buf).unwrap();
        assert_eq!(src, addrs[3]);
        let reply = StunMessage::decode(&buf[..n]).unwrap();
        assert_eq!(reply.transaction_id, request.transaction_id);
        assert_eq!(reply.mapped_address(), Some(client.local_addr().unwrap()));
        assert_eq!(reply.changed_address(), Some(addrs[1]));
    }

    #[test]
    fn secondary_drops_unowned_target() {
        let (handler, _) = loopback_handler(Role::Secondary, None);
        let raw = StunMessage::binding_request()
            .with(Attribute::ChangeRequest(ChangeRequest::new(true, false)))
            .encode()
            .unwrap();
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(handler.process_stun_request(2, from, &raw), Disposition::Dropped);
    }

    #[test]
    fn failed_relay_drops_without_reply() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = dead.local_addr().unwrap().to_string();
        drop(dead);

        let relay = RelayClient::new(&peer, Duration::from_millis(300));
        let (handler, _) = loopback_handler(Role::Primary, Some(relay));

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let raw = StunMessage::binding_request()
            .with(Attribute::ChangeRequest(ChangeRequest::new(true, false)))
            .encode()
            .unwrap();
        let disposition = handler.process_stun_request(0, client.local_addr().unwrap(), &raw);
        assert_eq!(disposition, Disposition::Dropped);

        let mut buf = [0u8; 1500];
        assert!(client.recv_from(&mut buf).is_err());
    }
}
