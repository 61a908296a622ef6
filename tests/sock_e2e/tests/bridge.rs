// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-bridge fallback: traffic the fast path does not understand is
//! forwarded exactly once and never reaches an unrelated socket.

use shunt_net::{Domain, PacketPool, SockError, SockType};
use sock_e2e::{at, linked_pair, pump, IP_A, IP_B};

#[test]
fn unmatched_datagram_goes_to_the_bridge_exactly_once() {
    let (a, b) = linked_pair();
    let server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    // An unrelated socket is bound, but on a different port.
    let unrelated = server.socket(Domain::Inet, SockType::Dgram).unwrap();
    server.bind(unrelated, at(IP_A, 4300)).unwrap();

    let tx = client.socket(Domain::Inet, SockType::Dgram).unwrap();
    client.bind(tx, at(IP_B, 4301)).unwrap();
    client.sendto(tx, b"for the kernel", 0, at(IP_A, 60000)).unwrap();
    pump(&a, &b, 4);

    let forwarded = a.bridge.forwarded();
    assert_eq!(forwarded.len(), 1);
    // The unrelated socket never saw it.
    let mut buf = [0u8; 32];
    assert_eq!(server.recvfrom(unrelated, &mut buf, 0), Err(SockError::WouldBlock));
    // Nothing on the sending side's bridge either.
    assert!(b.bridge.forwarded().is_empty());

    server.close(unrelated).unwrap();
    client.close(tx).unwrap();
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}

#[test]
fn non_ip_frames_are_bridge_traffic() {
    let (mut a, _b) = linked_pair();

    // A hand-built ARP request (ethertype 0x0806).
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xff; 6]); // broadcast dst
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x42]);
    frame.extend_from_slice(&[0x08, 0x06]);
    frame.extend_from_slice(&[0u8; 28]);

    a.inject(&frame);
    a.poll();

    let forwarded = a.bridge.forwarded();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].1, frame);
    assert_eq!(a.pool.outstanding(), 0);
}

#[test]
fn stray_tcp_segment_without_listener_is_bridged() {
    let (a, b) = linked_pair();
    let _server = a.stack.attach().unwrap();
    let client = b.stack.attach().unwrap();

    // SYN to a port nobody listens on. The server stack forwards it to the
    // kernel path rather than answering.
    let cfd = client.socket(Domain::Inet, SockType::Stream).unwrap();
    assert_eq!(client.connect(cfd, at(IP_A, 61000)), Err(SockError::InProgress));
    pump(&a, &b, 2);

    assert_eq!(a.bridge.forwarded().len(), 1);
    client.close(cfd).unwrap();
    pump(&a, &b, 2);
    assert_eq!(a.pool.outstanding(), 0);
    assert_eq!(b.pool.outstanding(), 0);
}
