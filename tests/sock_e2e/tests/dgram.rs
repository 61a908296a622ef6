// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Cross-stack UDP scenarios: datagram round trips, source reporting,
//! connected-socket filtering, scatter/gather.

use shunt_net::{Domain, PacketPool, SockError, SockType, MSG_PEEK};
use sock_e2e::{at, linked_pair, pump, IP_A, IP_B};

#[test]
fn datagram_round_trip_reproduces_bytes_and_source() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    let rx = server.socket(Domain::Inet, SockType::Dgram).unwrap();
    server.bind(rx, at(IP_A, 4000)).unwrap();
    let tx = client.socket(Domain::Inet, SockType::Dgram).unwrap();
    client.bind(tx, at(IP_B, 4001)).unwrap();

    let payload = b"exact bytes, exact length";
    assert_eq!(client.sendto(tx, payload, 0, at(IP_A, 4000)).unwrap(), payload.len());
    pump(&a, &b, 4);

    let mut buf = [0u8; 64];
    let (n, from) = server.recvfrom(rx, &mut buf, 0).unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(&buf[..n], payload);
    assert_eq!(from, at(IP_B, 4001));

    // Empty again: repeatedly would-block, never spurious data.
    for _ in 0..3 {
        assert_eq!(server.recvfrom(rx, &mut buf, 0), Err(SockError::WouldBlock));
    }

    server.close(rx).unwrap();
    client.close(tx).unwrap();
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}

#[test]
fn connected_datagram_socket_pins_the_peer() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    let rx = server.socket(Domain::Inet, SockType::Dgram).unwrap();
    server.bind(rx, at(IP_A, 4100)).unwrap();

    let cfd = client.socket(Domain::Inet, SockType::Dgram).unwrap();
    client.connect(cfd, at(IP_A, 4100)).unwrap();
    assert_eq!(client.getpeername(cfd).unwrap(), at(IP_A, 4100));

    // Plain send works once connected; sendto elsewhere is rejected.
    assert_eq!(client.send(cfd, b"pinned", 0).unwrap(), 6);
    assert_eq!(
        client.sendto(cfd, b"nope", 0, at(IP_A, 4999)),
        Err(SockError::AlreadyConnected)
    );
    pump(&a, &b, 4);

    let mut buf = [0u8; 16];
    let (n, from) = server.recvfrom(rx, &mut buf, 0).unwrap();
    assert_eq!(&buf[..n], b"pinned");
    assert_eq!(from.ip.0, IP_B);

    // Reply flows back through the connected socket.
    assert_eq!(server.sendto(rx, b"reply", 0, from).unwrap(), 5);
    pump(&a, &b, 4);
    let (n, _) = client.recvfrom(cfd, &mut buf, MSG_PEEK).unwrap();
    assert_eq!(&buf[..n], b"reply");
    assert_eq!(client.recv(cfd, &mut buf, 0).unwrap(), 5);

    server.close(rx).unwrap();
    client.close(cfd).unwrap();
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}

#[test]
fn gather_send_scatter_receive_one_datagram() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    let rx = server.socket(Domain::Inet, SockType::Dgram).unwrap();
    server.bind(rx, at(IP_A, 4200)).unwrap();
    let tx = client.socket(Domain::Inet, SockType::Dgram).unwrap();
    client.connect(tx, at(IP_A, 4200)).unwrap();

    let n = client.writev(tx, &[b"scatter ", b"gather"]).unwrap();
    assert_eq!(n, 14);
    pump(&a, &b, 4);

    let mut first = [0u8; 5];
    let mut second = [0u8; 16];
    let mut iovs: [&mut [u8]; 2] = [&mut first, &mut second];
    let n = server.readv(rx, &mut iovs).unwrap();
    assert_eq!(n, 14);
    assert_eq!(&first, b"scatt");
    assert_eq!(&second[..9], b"er gather");

    server.close(rx).unwrap();
    client.close(tx).unwrap();
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}
