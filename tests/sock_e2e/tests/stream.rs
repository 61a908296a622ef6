// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-stack TCP scenarios: handshake, data round trip, EOF signaling,
//! backlog policy, reuse-port spreading.

use shunt_net::{CtlOp, Domain, Interest, PacketPool, Readiness, SockError, SockType};
use sock_e2e::{at, linked_pair, pump, IP_A, IP_B};

const ET_IN: Interest = Interest::READABLE.union(Interest::EDGE);
const ET_OUT: Interest = Interest::WRITABLE.union(Interest::EDGE);

#[test]
fn listen_accept_ping_and_peer_observes_close() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    let lfd = server.socket(Domain::Inet, SockType::Stream).unwrap();
    server.bind(lfd, at(IP_A, 9000)).unwrap();
    server.listen(lfd, 128).unwrap();

    let cfd = client.socket(Domain::Inet, SockType::Stream).unwrap();
    let cep = client.epoll_create(8).unwrap();
    client.epoll_ctl(cep, CtlOp::Add, cfd, ET_OUT).unwrap();
    assert_eq!(client.connect(cfd, at(IP_A, 9000)), Err(SockError::InProgress));

    pump(&a, &b, 8);

    // Connect completion arrives as a writability edge, never by blocking.
    let events = client.epoll_wait(cep, 8, 0).unwrap();
    assert!(events.iter().any(|e| e.fd == cfd && e.events.contains(Readiness::WRITABLE)));

    let (afd, peer) = server.accept(lfd).unwrap();
    assert_ne!(afd, lfd);
    assert_eq!(peer.ip.0, IP_B);
    assert_eq!(server.getpeername(afd).unwrap(), peer);
    assert_eq!(client.getpeername(cfd).unwrap(), at(IP_A, 9000));

    // Client sends 4 bytes; the accepted socket reads exactly those bytes.
    assert_eq!(client.send(cfd, b"ping", 0).unwrap(), 4);
    pump(&a, &b, 4);
    let mut buf = [0u8; 16];
    let (n, from) = server.recvfrom(afd, &mut buf, 0).unwrap();
    assert_eq!((n, from), (4, peer));
    assert_eq!(&buf[..4], b"ping");

    // Server closes; the client observes a readable edge and a zero-length
    // read before closing its own side.
    client.epoll_ctl(cep, CtlOp::Mod, cfd, ET_IN | Interest::WRITABLE).unwrap();
    server.close(afd).unwrap();
    pump(&a, &b, 4);
    let events = client.epoll_wait(cep, 8, 0).unwrap();
    assert!(events.iter().any(|e| e.fd == cfd && e.events.contains(Readiness::READABLE)));
    assert_eq!(client.recv(cfd, &mut buf, 0).unwrap(), 0);

    client.close(cfd).unwrap();
    server.close(lfd).unwrap();
    client.close(cep).unwrap();
    pump(&a, &b, 4);
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}

#[test]
fn backlog_overflow_refuses_the_extra_connection() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    let lfd = server.socket(Domain::Inet, SockType::Stream).unwrap();
    server.bind(lfd, at(IP_A, 9100)).unwrap();
    server.listen(lfd, 1).unwrap();

    // First connection fills the backlog of one.
    let c1 = client.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(client.connect(c1, at(IP_A, 9100)), Err(SockError::InProgress));
    pump(&a, &b, 8);

    // The second is refused with a reset, not queued.
    let c2 = client.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(client.connect(c2, at(IP_A, 9100)), Err(SockError::InProgress));
    pump(&a, &b, 8);
    assert_eq!(client.send(c2, b"x", 0), Err(SockError::ConnRefused));

    // The first is intact and acceptable.
    let (afd, _) = server.accept(lfd).unwrap();
    assert_eq!(server.accept(lfd), Err(SockError::WouldBlock));

    for fd in [c1, c2] {
        client.close(fd).unwrap();
    }
    server.close(afd).unwrap();
    server.close(lfd).unwrap();
    pump(&a, &b, 4);
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}

#[test]
fn reuse_port_group_lands_each_connection_on_one_listener() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    use shunt_sock::socket::sockopt::{SOL_SOCKET, SO_REUSEPORT};
    let l1 = server.socket(Domain::Inet, SockType::Stream).unwrap();
    let l2 = server.socket(Domain::Inet, SockType::Stream).unwrap();
    for fd in [l1, l2] {
        server.setsockopt(fd, SOL_SOCKET, SO_REUSEPORT, 1).unwrap();
        server.bind(fd, at(IP_A, 9200)).unwrap();
        server.listen(fd, 16).unwrap();
    }

    let cfd = client.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(client.connect(cfd, at(IP_A, 9200)), Err(SockError::InProgress));
    pump(&a, &b, 8);

    let one = server.accept(l1);
    let two = server.accept(l2);
    // Exactly one listener got it.
    assert_eq!(one.is_ok() as u8 + two.is_ok() as u8, 1);

    let afd = one.or(two).unwrap().0;
    for fd in [l1, l2, afd] {
        server.close(fd).unwrap();
    }
    client.close(cfd).unwrap();
    pump(&a, &b, 4);
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}

#[test]
fn without_a_listener_the_second_bind_fails() {
    let (a, _b) = linked_pair();
    let server = a.stack.attach().unwrap();

    let l1 = server.socket(Domain::Inet, SockType::Stream).unwrap();
    let l2 = server.socket(Domain::Inet, SockType::Stream).unwrap();
    server.bind(l1, at(IP_A, 9300)).unwrap();
    assert_eq!(server.bind(l2, at(IP_A, 9300)), Err(SockError::AddrInUse));
    // Binding someone else's address is a different failure.
    assert_eq!(server.bind(l2, at(IP_B, 9300)), Err(SockError::AddrNotAvail));

    server.close(l1).unwrap();
    server.close(l2).unwrap();
}
