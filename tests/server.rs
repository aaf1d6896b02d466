use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use natstun::{Attribute, ChangeRequest, Role, ServerConfig, ServerHandle, StunMessage, StunServer};

fn start_both() -> ServerHandle {
    let config = ServerConfig {
        primary_addr: "127.0.0.1:0".into(),
        secondary_addr: "127.0.0.1:0".into(),
        role: Role::Both,
        software: Some("natstun-test".into()),
        ..Default::default()
    };
    StunServer::new(config).unwrap().start().unwrap()
}

fn client() -> UdpSocket {
    let skt = UdpSocket::bind("127.0.0.1:0").unwrap();
    skt.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    skt
}

fn exchange(skt: &UdpSocket, to: SocketAddr, request: &StunMessage) -> (StunMessage, SocketAddr) {
    skt.send_to(&request.encode().unwrap(), to).unwrap();
    let mut buf = [0u8; 1500];
    let (n, src) = skt.recv_from(&mut buf).unwrap();
    assert!(natstun::message::verify_fingerprint(&buf[..n]));
    (StunMessage::decode(&buf[..n]).unwrap(), src)
}

#[test]
fn every_change_request_is_answered_from_the_right_endpoint() {
    let server = start_both();
    let endpoints = *server.endpoints();
    let skt = client();
    let me = skt.local_addr().unwrap();

    for received in 0..4 {
        let to = endpoints.get(received).unwrap();
        for (ip, port) in [(false, false), (true, false), (false, true), (true, true)] {
            let request = StunMessage::binding_request()
                .with(Attribute::ChangeRequest(ChangeRequest::new(ip, port)));
            let (reply, src) = exchange(&skt, to, &request);
            let want = natstun::target_index(received, Some(ChangeRequest::new(ip, port)));
            assert_eq!(src, endpoints.get(want).unwrap(), "sent to {received}, ip {ip} port {port}");
            assert_eq!(reply.transaction_id, request.transaction_id);
            assert_eq!(reply.mapped_address(), Some(me));
            assert_eq!(reply.changed_address(), Some(endpoints.alternate()));
        }
    }
    server.shutdown();
}

#[test]
fn garbage_does_not_stop_the_endpoint() {
    let server = start_both();
    let to = server.endpoints().get(0).unwrap();
    let skt = client();
    skt.send_to(b"definitely not stun", to).unwrap();
    skt.send_to(&[0u8; 20], to).unwrap();

    let (reply, src) = exchange(&skt, to, &StunMessage::binding_request());
    assert_eq!(src, to);
    assert_eq!(reply.mapped_address(), Some(skt.local_addr().unwrap()));
    server.shutdown();
}

#[test]
fn concurrent_clients_on_all_endpoints() {
    let server = start_both();
    let endpoints = *server.endpoints();
    let workers: Vec<_> = (0..4)
        .map(|index| {
            let to = endpoints.get(index).unwrap();
            thread::spawn(move || {
                let skt = client();
                for _ in 0..20 {
                    let (reply, src) = exchange(&skt, to, &StunMessage::binding_request());
                    assert_eq!(src, to);
                    assert_eq!(reply.mapped_address(), Some(skt.local_addr().unwrap()));
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    server.shutdown();
}

#[test]
fn extra_workers_share_each_endpoint() {
    let config = ServerConfig {
        primary_addr: "127.0.0.1:0".into(),
        secondary_addr: "127.0.0.1:0".into(),
        workers: 3,
        ..Default::default()
    };
    let server = StunServer::new(config).unwrap().start().unwrap();
    let to = server.endpoints().get(3).unwrap();
    let skt = client();
    for _ in 0..10 {
        let (_, src) = exchange(&skt, to, &StunMessage::binding_request());
        assert_eq!(src, to);
    }
    server.shutdown();
}

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

#[test]
fn second_server_on_same_ports_fails_to_bind() {
    let (p1, p2) = (free_port(), free_port());
    let config = ServerConfig {
        primary_addr: format!("127.0.0.1:{p1}"),
        secondary_addr: format!("127.0.0.2:{p2}"),
        ..Default::default()
    };
    let first = StunServer::new(config.clone()).unwrap().start().unwrap();
    let second = StunServer::new(config).unwrap().start();
    assert!(matches!(second, Err(natstun::error::ServerError::Bind { .. })));

    // The first server keeps answering on its own sockets.
    let to = first.endpoints().get(0).unwrap();
    let skt = client();
    let (_, src) = exchange(&skt, to, &StunMessage::binding_request());
    assert_eq!(src, to);
    first.shutdown();
}
