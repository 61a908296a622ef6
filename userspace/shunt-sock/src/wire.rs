// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ethernet/IPv4/TCP/UDP header views and frame builders.
//!
//! Parsing returns byte ranges into the original frame so the dispatcher can
//! strip headers in place (`PktBuf::adj`) instead of copying payloads.
//! Receive-side L4 checksum validation is assumed offloaded to the NIC, as
//! poll-mode drivers configure it; egress checksums are computed here.

use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

use shunt_net::{Ip4Addr, PktBuf, SockAddr4};

pub const ETH_HDR_LEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPV4_HDR_LEN: usize = 20;
pub const TCP_HDR_LEN: usize = 20;
pub const UDP_HDR_LEN: usize = 8;

pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// Maximum TCP payload per segment (Ethernet MTU minus IPv4 + TCP headers).
pub const TCP_MSS: usize = 1460;

static IP_ID: AtomicU16 = AtomicU16::new(1);

/// Egress addressing knobs, resolved once from `StackConfig`.
#[derive(Clone, Copy, Debug)]
pub struct WireCfg {
    pub local_mac: [u8; 6],
    pub gateway_mac: [u8; 6],
}

#[derive(Clone, Copy, Debug)]
pub struct EthView {
    pub ethertype: u16,
}

/// Parses the Ethernet header; the IPv4 payload starts at `ETH_HDR_LEN`.
pub fn parse_eth(frame: &[u8]) -> Option<EthView> {
    if frame.len() < ETH_HDR_LEN {
        return None;
    }
    Some(EthView { ethertype: u16::from_be_bytes([frame[12], frame[13]]) })
}

#[derive(Clone, Debug)]
pub struct Ipv4View {
    pub src: Ip4Addr,
    pub dst: Ip4Addr,
    pub proto: u8,
    /// L4 bytes, absolute into the frame.
    pub payload: Range<usize>,
}

pub fn parse_ipv4(frame: &[u8], off: usize) -> Option<Ipv4View> {
    let b = frame.get(off..)?;
    if b.len() < IPV4_HDR_LEN || b[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((b[0] & 0x0f) as usize) * 4;
    let total_len = u16::from_be_bytes([b[2], b[3]]) as usize;
    if ihl < IPV4_HDR_LEN || total_len < ihl || off + total_len > frame.len() {
        return None;
    }
    // Fragments carry only a slice of the L4 payload; reassembly is not a
    // fast-path concern, so they classify as bridge traffic.
    let frag = u16::from_be_bytes([b[6], b[7]]);
    if frag & 0x3fff != 0 {
        return None;
    }
    Some(Ipv4View {
        src: Ip4Addr([b[12], b[13], b[14], b[15]]),
        dst: Ip4Addr([b[16], b[17], b[18], b[19]]),
        proto: b[9],
        payload: off + ihl..off + total_len,
    })
}

#[derive(Clone, Debug)]
pub struct TcpView {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Segment payload, absolute into the frame.
    pub payload: Range<usize>,
}

pub fn parse_tcp(frame: &[u8], ip: &Ipv4View) -> Option<TcpView> {
    let b = frame.get(ip.payload.clone())?;
    if b.len() < TCP_HDR_LEN {
        return None;
    }
    let data_off = ((b[12] >> 4) as usize) * 4;
    if data_off < TCP_HDR_LEN || data_off > b.len() {
        return None;
    }
    Some(TcpView {
        src_port: u16::from_be_bytes([b[0], b[1]]),
        dst_port: u16::from_be_bytes([b[2], b[3]]),
        seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
        ack: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
        flags: b[13],
        window: u16::from_be_bytes([b[14], b[15]]),
        payload: ip.payload.start + data_off..ip.payload.end,
    })
}

#[derive(Clone, Debug)]
pub struct UdpView {
    pub src_port: u16,
    pub dst_port: u16,
    /// Datagram payload, absolute into the frame.
    pub payload: Range<usize>,
}

pub fn parse_udp(frame: &[u8], ip: &Ipv4View) -> Option<UdpView> {
    let b = frame.get(ip.payload.clone())?;
    if b.len() < UDP_HDR_LEN {
        return None;
    }
    let udp_len = u16::from_be_bytes([b[4], b[5]]) as usize;
    if udp_len < UDP_HDR_LEN || udp_len > b.len() {
        return None;
    }
    Some(UdpView {
        src_port: u16::from_be_bytes([b[0], b[1]]),
        dst_port: u16::from_be_bytes([b[2], b[3]]),
        payload: ip.payload.start + UDP_HDR_LEN..ip.payload.start + udp_len,
    })
}

fn sum_bytes(mut sum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_header_sum(src: Ip4Addr, dst: Ip4Addr, proto: u8, l4_len: usize) -> u32 {
    let mut sum = sum_bytes(0, &src.0);
    sum = sum_bytes(sum, &dst.0);
    sum + proto as u32 + l4_len as u32
}

fn push_eth_ipv4(
    cfg: &WireCfg,
    src: Ip4Addr,
    dst: Ip4Addr,
    proto: u8,
    l4_len: usize,
    buf: &mut PktBuf,
) -> bool {
    let mut eth = [0u8; ETH_HDR_LEN];
    eth[..6].copy_from_slice(&cfg.gateway_mac);
    eth[6..12].copy_from_slice(&cfg.local_mac);
    eth[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let mut ip = [0u8; IPV4_HDR_LEN];
    ip[0] = 0x45;
    let total = (IPV4_HDR_LEN + l4_len) as u16;
    ip[2..4].copy_from_slice(&total.to_be_bytes());
    let id = IP_ID.fetch_add(1, Ordering::Relaxed);
    ip[4..6].copy_from_slice(&id.to_be_bytes());
    ip[6] = 0x40; // don't fragment
    ip[8] = 64; // ttl
    ip[9] = proto;
    ip[12..16].copy_from_slice(&src.0);
    ip[16..20].copy_from_slice(&dst.0);
    let cksum = fold_checksum(sum_bytes(0, &ip));
    ip[10..12].copy_from_slice(&cksum.to_be_bytes());

    buf.append(&eth) && buf.append(&ip)
}

/// Builds a complete Ethernet+IPv4+TCP frame into `buf`. Returns false when
/// the buffer cannot hold it (the buffer is left in an unusable, partially
/// written state and must go back to the pool).
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_frame(
    cfg: &WireCfg,
    src: SockAddr4,
    dst: SockAddr4,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
    buf: &mut PktBuf,
) -> bool {
    buf.reset(0);
    let l4_len = TCP_HDR_LEN + payload.len();
    if !push_eth_ipv4(cfg, src.ip, dst.ip, IP_PROTO_TCP, l4_len, buf) {
        return false;
    }

    let mut tcp = [0u8; TCP_HDR_LEN];
    tcp[0..2].copy_from_slice(&src.port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 0x50; // data offset: 5 words, no options
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&window.to_be_bytes());

    let mut sum = pseudo_header_sum(src.ip, dst.ip, IP_PROTO_TCP, l4_len);
    sum = sum_bytes(sum, &tcp);
    sum = sum_bytes(sum, payload);
    let cksum = fold_checksum(sum);
    // all-zero checksum is transmitted as 0xffff by convention
    let cksum = if cksum == 0 { 0xffff } else { cksum };
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    buf.append(&tcp) && buf.append(payload)
}

/// Builds a complete Ethernet+IPv4+UDP frame into `buf`.
pub fn build_udp_frame(
    cfg: &WireCfg,
    src: SockAddr4,
    dst: SockAddr4,
    payload: &[u8],
    buf: &mut PktBuf,
) -> bool {
    buf.reset(0);
    let l4_len = UDP_HDR_LEN + payload.len();
    if l4_len > u16::MAX as usize || !push_eth_ipv4(cfg, src.ip, dst.ip, IP_PROTO_UDP, l4_len, buf)
    {
        return false;
    }

    let mut udp = [0u8; UDP_HDR_LEN];
    udp[0..2].copy_from_slice(&src.port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port.to_be_bytes());
    udp[4..6].copy_from_slice(&(l4_len as u16).to_be_bytes());
    let mut sum = pseudo_header_sum(src.ip, dst.ip, IP_PROTO_UDP, l4_len);
    sum = sum_bytes(sum, &udp);
    sum = sum_bytes(sum, payload);
    let cksum = fold_checksum(sum);
    let cksum = if cksum == 0 { 0xffff } else { cksum };
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    buf.append(&udp) && buf.append(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_cfg() -> WireCfg {
        WireCfg { local_mac: [2, 0, 0, 0, 0, 1], gateway_mac: [2, 0, 0, 0, 0, 2] }
    }

    fn verify_l4_checksum(frame: &[u8], ip: &Ipv4View) -> bool {
        let l4 = &frame[ip.payload.clone()];
        let sum = sum_bytes(pseudo_header_sum(ip.src, ip.dst, ip.proto, l4.len()), l4);
        fold_checksum(sum) == 0
    }

    #[test]
    fn tcp_frame_round_trips() {
        let mut buf = PktBuf::with_capacity(2048);
        let src = SockAddr4::new([10, 0, 0, 1], 9000);
        let dst = SockAddr4::new([10, 0, 0, 2], 40001);
        assert!(build_tcp_frame(
            &wire_cfg(),
            src,
            dst,
            1000,
            2000,
            TCP_ACK | TCP_PSH,
            4096,
            b"ping",
            &mut buf,
        ));

        let frame = buf.bytes();
        let eth = parse_eth(frame).expect("eth");
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
        let ip = parse_ipv4(frame, ETH_HDR_LEN).expect("ipv4");
        assert_eq!(ip.src.0, [10, 0, 0, 1]);
        assert_eq!(ip.dst.0, [10, 0, 0, 2]);
        assert_eq!(ip.proto, IP_PROTO_TCP);
        let tcp = parse_tcp(frame, &ip).expect("tcp");
        assert_eq!(tcp.src_port, 9000);
        assert_eq!(tcp.dst_port, 40001);
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.ack, 2000);
        assert_eq!(tcp.flags, TCP_ACK | TCP_PSH);
        assert_eq!(&frame[tcp.payload.clone()], b"ping");
        assert!(verify_l4_checksum(frame, &ip));
    }

    #[test]
    fn udp_frame_round_trips() {
        let mut buf = PktBuf::with_capacity(2048);
        let src = SockAddr4::new([10, 0, 0, 1], 5353);
        let dst = SockAddr4::new([10, 0, 0, 2], 53);
        assert!(build_udp_frame(&wire_cfg(), src, dst, b"query", &mut buf));

        let frame = buf.bytes();
        let ip = parse_ipv4(frame, ETH_HDR_LEN).expect("ipv4");
        assert_eq!(ip.proto, IP_PROTO_UDP);
        let udp = parse_udp(frame, &ip).expect("udp");
        assert_eq!(udp.src_port, 5353);
        assert_eq!(udp.dst_port, 53);
        assert_eq!(&frame[udp.payload.clone()], b"query");
        assert!(verify_l4_checksum(frame, &ip));
    }

    #[test]
    fn truncated_headers_are_rejected() {
        assert!(parse_eth(&[0u8; 10]).is_none());
        let mut buf = PktBuf::with_capacity(2048);
        assert!(build_udp_frame(
            &wire_cfg(),
            SockAddr4::new([1, 1, 1, 1], 1),
            SockAddr4::new([2, 2, 2, 2], 2),
            b"x",
            &mut buf,
        ));
        let frame = buf.bytes();
        // Claiming a total length past the end of the frame must fail.
        let mut bad = frame.to_vec();
        bad[ETH_HDR_LEN + 2] = 0xff;
        bad[ETH_HDR_LEN + 3] = 0xff;
        assert!(parse_ipv4(&bad, ETH_HDR_LEN).is_none());
    }

    #[test]
    fn fragmented_packets_are_not_fast_path() {
        let mut buf = PktBuf::with_capacity(2048);
        assert!(build_udp_frame(
            &wire_cfg(),
            SockAddr4::new([1, 1, 1, 1], 1),
            SockAddr4::new([2, 2, 2, 2], 2),
            b"frag",
            &mut buf,
        ));
        let mut frame = buf.bytes().to_vec();
        // set more-fragments
        frame[ETH_HDR_LEN + 6] = 0x20;
        frame[ETH_HDR_LEN + 7] = 0x01;
        assert!(parse_ipv4(&frame, ETH_HDR_LEN).is_none());
    }
}
