// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! UDP association handling: a bound socket keeps a datagram queue; a
//! connected one additionally pins the default destination. Everything else
//! is the dispatcher's classification doing the work.

use log::trace;

use shunt_net::{PktBuf, SockAddr4, SockError, SockResult};

use crate::egress::TxSink;
use crate::socket::{RxSeg, SocketEntry};
use crate::wire::{UdpView, IPV4_HDR_LEN, UDP_HDR_LEN};

/// Largest datagram that fits one Ethernet frame; fragmentation is not a
/// fast-path feature.
pub const MAX_DGRAM: usize = 1500 - IPV4_HDR_LEN - UDP_HDR_LEN;

/// Queues one inbound datagram, or drops it (filtered source, shut read
/// side, or full queue). The frame is consumed either way.
pub fn on_datagram(
    entry: &mut SocketEntry,
    from: SockAddr4,
    view: &UdpView,
    mut frame: PktBuf,
    tx: &TxSink<'_>,
) {
    if entry.shutdown_rd {
        tx.free(frame);
        return;
    }
    if let Some(remote) = entry.remote {
        // Connected sockets only accept their peer. Exact-tuple
        // classification normally guarantees this; a wildcard-bound socket
        // that later connected still needs the filter.
        if remote != from {
            tx.free(frame);
            return;
        }
    }
    let ok = frame.adj(view.payload.start) && frame.trim_to(view.payload.len());
    debug_assert!(ok);
    match entry.rx.push(RxSeg { buf: frame, off: 0, from }) {
        Ok(()) => {}
        Err(rejected) => {
            trace!("udp queue full, dropping datagram from {from}");
            tx.free(rejected.buf);
        }
    }
}

/// Transmits one datagram. Pool exhaustion is `WouldBlock`, per the
/// non-blocking send contract.
pub fn send_dgram(
    local: SockAddr4,
    dst: SockAddr4,
    payload: &[u8],
    tx: &mut TxSink<'_>,
) -> SockResult<usize> {
    if payload.len() > MAX_DGRAM {
        return Err(SockError::InvalidInput("datagram exceeds mtu"));
    }
    if dst.ip.is_unspecified() || dst.port == 0 {
        return Err(SockError::InvalidInput("destination unspecified"));
    }
    if !tx.send_udp(local, dst, payload) {
        return Err(SockError::WouldBlock);
    }
    Ok(payload.len())
}
