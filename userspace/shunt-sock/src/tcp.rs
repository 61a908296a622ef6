// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! TCP connection records and the state machine driving them.
//!
//! The socket-level states (`Connecting`, `Established`, `Closing`) are the
//! contract; this module keeps the wire-level detail (handshake phase, FIN
//! bookkeeping, TIME-WAIT) inside the connection record. Receive is strictly
//! in-order: out-of-window and out-of-order segments are answered with a
//! duplicate ACK and dropped, which keeps the hot path free of reassembly
//! buffers. Anomalies below the connection record are absorbed silently;
//! only peer resets and timeouts surface, and only through the owning
//! socket's next call or readiness event.

use std::collections::VecDeque;

use log::{debug, trace};

use shunt_net::{SockAddr4, SockError, Ticks};

use crate::classify::{AddrTuple, ConnRef, IndexOps};
use crate::config::StackConfig;
use crate::egress::TxSink;
use crate::socket::{PendingConn, RxQueue, RxSeg, SockState, SocketEntry};
use crate::wire::{TcpView, TCP_ACK, TCP_FIN, TCP_MSS, TCP_PSH, TCP_RST, TCP_SYN};

/// Timer constants resolved once from `StackConfig`.
#[derive(Clone, Copy, Debug)]
pub struct TcpTimers {
    pub rto_initial_ms: u64,
    pub rto_max_ms: u64,
    pub max_retx: u32,
    pub time_wait_ms: u64,
}

impl From<&StackConfig> for TcpTimers {
    fn from(cfg: &StackConfig) -> Self {
        Self {
            rto_initial_ms: cfg.rto_initial_ms,
            rto_max_ms: cfg.rto_max_ms,
            max_retx: cfg.max_retx,
            time_wait_ms: cfg.time_wait_ms,
        }
    }
}

/// Handshake phase of a connection record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    SynSent,
    SynRcvd,
    Done,
}

/// Per-connection sequencing, send ring, and timer bookkeeping. Exists iff
/// the owning socket is in a connected-ish state.
#[derive(Debug)]
pub struct TcpConn {
    pub hs: Handshake,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub rcv_nxt: u32,
    /// Unacked + unsent bytes; the front always corresponds to `snd_una`.
    ring: VecDeque<u8>,
    ring_cap: usize,
    pub fin_sent: bool,
    pub fin_acked: bool,
    pub fin_rcvd: bool,
    /// Shutdown requested but FIN not yet on the wire (data still draining).
    pub pending_fin: bool,
    pub time_wait_until: Option<Ticks>,
    pub rto_ms: u64,
    pub retx_count: u32,
    pub retx_deadline: Option<Ticks>,
    pub last_rx_ms: Ticks,
    pub ka_probes: u32,
    pub ka_deadline: Option<Ticks>,
}

impl TcpConn {
    pub fn new(hs: Handshake, iss: u32, ring_cap: usize, now: Ticks, timers: &TcpTimers) -> Self {
        Self {
            hs,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1), // SYN consumes one sequence number
            snd_wnd: 0,
            rcv_nxt: 0,
            ring: VecDeque::new(),
            ring_cap,
            fin_sent: false,
            fin_acked: false,
            fin_rcvd: false,
            pending_fin: false,
            time_wait_until: None,
            rto_ms: timers.rto_initial_ms,
            retx_count: 0,
            retx_deadline: Some(now + timers.rto_initial_ms),
            last_rx_ms: now,
            ka_probes: 0,
            ka_deadline: None,
        }
    }

    pub fn send_space(&self) -> usize {
        self.ring_cap - self.ring.len()
    }

    /// Appends application bytes to the send ring, bounded by capacity.
    pub fn enqueue(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.send_space());
        self.ring.extend(&bytes[..n]);
        n
    }

    /// Bytes on the wire but not yet acknowledged (data only; the FIN
    /// phantom byte is tracked separately via `fin_sent`/`fin_acked`).
    fn data_in_flight(&self) -> usize {
        let flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
        if self.fin_sent && !self.fin_acked {
            flight - 1
        } else {
            flight
        }
    }
}

fn advertised_window(rx: &RxQueue) -> u16 {
    rx.space().min(u16::MAX as usize) as u16
}

/// Strips `frame` down to the segment payload described by `seg`.
fn payload_only(mut frame: shunt_net::PktBuf, seg: &TcpView) -> shunt_net::PktBuf {
    let ok = frame.adj(seg.payload.start) && frame.trim_to(seg.payload.len());
    debug_assert!(ok);
    frame
}

fn acks_cover(conn: &TcpConn, ack: u32) -> bool {
    let in_flight = conn.snd_nxt.wrapping_sub(conn.snd_una);
    let acked = ack.wrapping_sub(conn.snd_una);
    acked != 0 && acked <= in_flight
}

fn process_ack(conn: &mut TcpConn, ack: u32, now: Ticks, timers: &TcpTimers) {
    if !acks_cover(conn, ack) {
        return;
    }
    let acked = ack.wrapping_sub(conn.snd_una) as usize;
    let data_acked = acked.min(conn.ring.len());
    conn.ring.drain(..data_acked);
    if acked > data_acked && conn.fin_sent {
        conn.fin_acked = true;
    }
    conn.snd_una = ack;
    conn.retx_count = 0;
    conn.rto_ms = timers.rto_initial_ms;
    conn.retx_deadline =
        if conn.snd_una == conn.snd_nxt { None } else { Some(now + conn.rto_ms) };
}

/// Sets up an outgoing connection: SYN on the wire, socket `Connecting`.
pub fn start_connect(
    entry: &mut SocketEntry,
    local: SockAddr4,
    remote: SockAddr4,
    iss: u32,
    now: Ticks,
    timers: &TcpTimers,
    send_buf: usize,
    tx: &mut TxSink<'_>,
) {
    let conn = TcpConn::new(Handshake::SynSent, iss, send_buf, now, timers);
    // A lost SYN is retransmitted off the fresh retx deadline.
    tx.send_tcp(local, remote, iss, 0, TCP_SYN, advertised_window(&entry.rx), &[]);
    entry.local = Some(local);
    entry.remote = Some(remote);
    entry.conn = Some(conn);
    entry.state = SockState::Connecting;
}

/// Pushes queued data (and a pending FIN once the ring drains) to the wire.
pub fn transmit(entry: &mut SocketEntry, now: Ticks, tx: &mut TxSink<'_>) {
    let (Some(local), Some(remote)) = (entry.local, entry.remote) else {
        return;
    };
    let window = advertised_window(&entry.rx);
    let nodelay = entry.opts.nodelay;
    let Some(conn) = entry.conn.as_mut() else {
        return;
    };
    if conn.hs != Handshake::Done {
        return;
    }

    if !conn.fin_sent {
        loop {
            let sent = conn.data_in_flight();
            let unsent = conn.ring.len() - sent;
            if unsent == 0 {
                break;
            }
            let avail = (conn.snd_wnd as usize).saturating_sub(sent);
            let n = unsent.min(avail).min(TCP_MSS);
            if n == 0 {
                break;
            }
            // Nagle: hold a runt while earlier data is still unacked.
            if !nodelay && n < TCP_MSS && sent > 0 {
                break;
            }
            let ring = conn.ring.make_contiguous();
            let sent_ok = tx.send_tcp(
                local,
                remote,
                conn.snd_nxt,
                conn.rcv_nxt,
                TCP_ACK | TCP_PSH,
                window,
                &ring[sent..sent + n],
            );
            if !sent_ok {
                break; // pool exhausted; timer pass retries
            }
            conn.snd_nxt = conn.snd_nxt.wrapping_add(n as u32);
            if conn.retx_deadline.is_none() {
                conn.retx_deadline = Some(now + conn.rto_ms);
            }
        }
    }

    if conn.pending_fin && !conn.fin_sent && conn.data_in_flight() == conn.ring.len() {
        let sent_ok =
            tx.send_tcp(local, remote, conn.snd_nxt, conn.rcv_nxt, TCP_FIN | TCP_ACK, window, &[]);
        if sent_ok {
            conn.fin_sent = true;
            conn.snd_nxt = conn.snd_nxt.wrapping_add(1);
            if conn.retx_deadline.is_none() {
                conn.retx_deadline = Some(now + conn.rto_ms);
            }
        }
    }
}

/// Terminal transition shared by reset, timeout, and TIME-WAIT expiry.
/// Graceful teardown keeps EOF semantics; error teardown records the error.
fn teardown(entry: &mut SocketEntry, err: Option<SockError>, tuple: AddrTuple, index: &mut IndexOps, tx: &TxSink<'_>) {
    if let Some(err) = err {
        entry.err = entry.err.or(Some(err));
        entry.rx.drain_to_pool(tx.pool());
    } else {
        entry.shutdown_rd = true;
        entry.shutdown_wr = true;
    }
    entry.conn = None;
    entry.state = SockState::Closed;
    index.del.push(tuple);
}

/// Shared ingest of data + FIN for a connection record feeding `rx`.
/// Always takes the frame: it either moves into `rx` or returns to the pool.
#[allow(clippy::too_many_arguments)]
fn ingest_data_fin(
    conn: &mut TcpConn,
    rx: &mut RxQueue,
    discard_data: bool,
    local: SockAddr4,
    remote: SockAddr4,
    seg: &TcpView,
    frame: shunt_net::PktBuf,
    tx: &mut TxSink<'_>,
) {
    let payload_len = seg.payload.len();
    let mut frame = Some(frame);
    let mut need_ack = false;

    if payload_len > 0 {
        if seg.seq == conn.rcv_nxt {
            if discard_data {
                // Read side is shut; data is acknowledged and discarded.
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload_len as u32);
                need_ack = true;
            } else {
                let buf = payload_only(frame.take().expect("frame present"), seg);
                match rx.push(RxSeg { buf, off: 0, from: remote }) {
                    Ok(()) => {
                        conn.rcv_nxt = conn.rcv_nxt.wrapping_add(payload_len as u32);
                        need_ack = true;
                    }
                    Err(rejected) => {
                        // Receive queue full: drop without advancing rcv_nxt;
                        // the shrunken window tells the peer to back off.
                        trace!("rx queue full, dropping segment from {remote}");
                        tx.free(rejected.buf);
                        need_ack = true;
                    }
                }
            }
        } else {
            // Out-of-order or duplicate: dup-ACK and drop.
            trace!("out-of-order seq {} (expected {})", seg.seq, conn.rcv_nxt);
            need_ack = true;
        }
    }

    if seg.flags & TCP_FIN != 0 {
        let fin_seq = seg.seq.wrapping_add(payload_len as u32);
        if fin_seq == conn.rcv_nxt {
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
            conn.fin_rcvd = true;
            need_ack = true;
        } else if conn.fin_rcvd && fin_seq == conn.rcv_nxt.wrapping_sub(1) {
            // FIN retransmission: re-ACK so the peer stops resending.
            need_ack = true;
        }
    }

    if let Some(unused) = frame.take() {
        tx.free(unused);
    }
    if need_ack {
        let window = advertised_window(rx);
        tx.send_tcp(local, remote, conn.snd_nxt, conn.rcv_nxt, TCP_ACK, window, &[]);
    }
}

/// Drives an established-side connection record with one inbound segment.
#[allow(clippy::too_many_arguments)]
pub fn on_segment(
    entry: &mut SocketEntry,
    tuple: AddrTuple,
    seg: &TcpView,
    frame: shunt_net::PktBuf,
    now: Ticks,
    timers: &TcpTimers,
    index: &mut IndexOps,
    tx: &mut TxSink<'_>,
) {
    let (Some(local), Some(remote)) = (entry.local, entry.remote) else {
        tx.free(frame);
        return;
    };
    if entry.conn.is_none() {
        tx.free(frame);
        return;
    }

    if seg.flags & TCP_RST != 0 {
        let refused = entry.conn.as_ref().is_some_and(|c| c.hs == Handshake::SynSent);
        let err = if refused { SockError::ConnRefused } else { SockError::ConnReset };
        debug!("{tuple:?}: peer reset ({err})");
        teardown(entry, Some(err), tuple, index, tx);
        tx.free(frame);
        return;
    }

    {
        let conn = entry.conn.as_mut().expect("checked above");
        conn.last_rx_ms = now;
        conn.ka_probes = 0;
        conn.ka_deadline = None;

        match conn.hs {
            Handshake::SynSent => {
                let syn_ack = TCP_SYN | TCP_ACK;
                if seg.flags & syn_ack == syn_ack && seg.ack == conn.snd_nxt {
                    conn.snd_una = seg.ack;
                    conn.rcv_nxt = seg.seq.wrapping_add(1);
                    conn.snd_wnd = seg.window;
                    conn.hs = Handshake::Done;
                    conn.retx_deadline = None;
                    conn.retx_count = 0;
                    conn.rto_ms = timers.rto_initial_ms;
                    entry.state = SockState::Established;
                    let window = advertised_window(&entry.rx);
                    let conn = entry.conn.as_ref().expect("still present");
                    tx.send_tcp(local, remote, conn.snd_nxt, conn.rcv_nxt, TCP_ACK, window, &[]);
                    transmit(entry, now, tx);
                } else {
                    trace!("{tuple:?}: stray segment in SYN-SENT dropped");
                }
                tx.free(frame);
                return;
            }
            Handshake::SynRcvd => {
                // Passive handshakes complete inside the listener's pending
                // queue; a promoted record is always `Done`.
                tx.free(frame);
                return;
            }
            Handshake::Done => {
                if seg.flags & TCP_ACK != 0 {
                    process_ack(conn, seg.ack, now, timers);
                }
                conn.snd_wnd = seg.window;
            }
        }
    }

    let discard = entry.shutdown_rd;
    {
        let conn = entry.conn.as_mut().expect("established");
        ingest_data_fin(conn, &mut entry.rx, discard, local, remote, seg, frame, tx);
    }

    let conn = entry.conn.as_mut().expect("established");
    if conn.fin_rcvd && entry.state == SockState::Established {
        entry.state = SockState::Closing;
    }
    if conn.fin_rcvd && conn.fin_sent && conn.fin_acked && conn.time_wait_until.is_none() {
        conn.time_wait_until = Some(now + timers.time_wait_ms);
    }

    transmit(entry, now, tx);
}

/// Handles a SYN arriving on a listening socket.
#[allow(clippy::too_many_arguments)]
pub fn on_listener_syn(
    entry: &mut SocketEntry,
    tuple: AddrTuple,
    seg: &TcpView,
    now: Ticks,
    timers: &TcpTimers,
    self_ref: ConnRef,
    iss: u32,
    recv_buf: usize,
    send_buf: usize,
    index: &mut IndexOps,
    tx: &mut TxSink<'_>,
) {
    let Some(listen) = entry.listen.as_mut() else {
        return;
    };
    if seg.flags & TCP_SYN == 0 || seg.flags & TCP_ACK != 0 {
        // Stray non-SYN for an unknown tuple: answer with RST.
        if seg.flags & TCP_RST == 0 {
            tx.send_tcp(
                tuple.local,
                tuple.remote,
                seg.ack,
                seg.seq.wrapping_add(1),
                TCP_RST | TCP_ACK,
                0,
                &[],
            );
        }
        return;
    }
    if listen.is_full() {
        // Overflow policy: drop-new. The (B+1)-th connection is refused.
        debug!("backlog full on {}, refusing {}", tuple.local, tuple.remote);
        tx.send_tcp(tuple.local, tuple.remote, 0, seg.seq.wrapping_add(1), TCP_RST | TCP_ACK, 0, &[]);
        return;
    }

    let mut conn = TcpConn::new(Handshake::SynRcvd, iss, send_buf, now, timers);
    conn.rcv_nxt = seg.seq.wrapping_add(1);
    conn.snd_wnd = seg.window;
    let pending = PendingConn {
        local: tuple.local,
        remote: tuple.remote,
        conn,
        rx: RxQueue::new(recv_buf),
    };
    let window = advertised_window(&pending.rx);
    tx.send_tcp(tuple.local, tuple.remote, iss, pending.conn.rcv_nxt, TCP_SYN | TCP_ACK, window, &[]);
    listen.syn.push(pending);
    index.add.push((tuple, self_ref));
    trace!("{tuple:?}: handshake started");
}

/// Drives a pending (not yet accepted) connection owned by a listener.
/// Returns true when the listener's ready queue grew.
#[allow(clippy::too_many_arguments)]
pub fn on_listener_tuple_segment(
    entry: &mut SocketEntry,
    tuple: AddrTuple,
    seg: &TcpView,
    frame: shunt_net::PktBuf,
    now: Ticks,
    timers: &TcpTimers,
    index: &mut IndexOps,
    tx: &mut TxSink<'_>,
) -> bool {
    let Some(listen) = entry.listen.as_mut() else {
        tx.free(frame);
        return false;
    };

    // Handshaking entries first.
    if let Some(pos) = listen
        .syn
        .iter()
        .position(|p| p.local == tuple.local && p.remote == tuple.remote)
    {
        if seg.flags & TCP_RST != 0 {
            let mut dropped = listen.syn.swap_remove(pos);
            dropped.rx.drain_to_pool(tx.pool());
            index.del.push(tuple);
            tx.free(frame);
            return false;
        }
        let pending = &mut listen.syn[pos];
        if seg.flags & TCP_SYN != 0 && seg.flags & TCP_ACK == 0 {
            // SYN retransmit: repeat the SYN-ACK.
            let window = advertised_window(&pending.rx);
            let iss = pending.conn.snd_nxt.wrapping_sub(1);
            tx.send_tcp(tuple.local, tuple.remote, iss, pending.conn.rcv_nxt, TCP_SYN | TCP_ACK, window, &[]);
            tx.free(frame);
            return false;
        }
        if seg.flags & TCP_ACK != 0 && seg.ack == pending.conn.snd_nxt {
            pending.conn.snd_una = seg.ack;
            pending.conn.snd_wnd = seg.window;
            pending.conn.hs = Handshake::Done;
            pending.conn.retx_deadline = None;
            pending.conn.retx_count = 0;
            pending.conn.rto_ms = timers.rto_initial_ms;
            pending.conn.last_rx_ms = now;
            // The handshake ACK may already carry data.
            let (local, remote) = (pending.local, pending.remote);
            ingest_data_fin(&mut pending.conn, &mut pending.rx, false, local, remote, seg, frame, tx);
            let done = listen.syn.swap_remove(pos);
            listen.ready.push_back(done);
            trace!("{tuple:?}: handshake complete, awaiting accept");
            return true;
        }
        tx.free(frame);
        return false;
    }

    // Completed entries still waiting for accept.
    if let Some(pos) = listen
        .ready
        .iter()
        .position(|p| p.local == tuple.local && p.remote == tuple.remote)
    {
        if seg.flags & TCP_RST != 0 {
            let mut dropped = listen.ready.remove(pos).expect("position valid");
            dropped.rx.drain_to_pool(tx.pool());
            index.del.push(tuple);
            tx.free(frame);
            return false;
        }
        let pending = &mut listen.ready[pos];
        if seg.flags & TCP_ACK != 0 {
            process_ack(&mut pending.conn, seg.ack, now, timers);
            pending.conn.snd_wnd = seg.window;
        }
        pending.conn.last_rx_ms = now;
        let (local, remote) = (pending.local, pending.remote);
        ingest_data_fin(&mut pending.conn, &mut pending.rx, false, local, remote, seg, frame, tx);
        return false;
    }

    tx.free(frame);
    false
}

/// What the timer pass decided for one socket.
enum TimerVerdict {
    Continue,
    Teardown(Option<SockError>),
}

/// Per-socket timer work: TIME-WAIT reaping, retransmission with exponential
/// backoff, keepalive probes. Runs once per poll pass per socket.
pub fn on_timer(
    entry: &mut SocketEntry,
    tuple: Option<AddrTuple>,
    now: Ticks,
    timers: &TcpTimers,
    index: &mut IndexOps,
    tx: &mut TxSink<'_>,
) {
    if entry.listen.is_some() {
        listener_timer(entry, now, timers, index, tx);
        return;
    }
    let (Some(local), Some(remote)) = (entry.local, entry.remote) else {
        return;
    };
    let window = advertised_window(&entry.rx);
    let keepalive = entry.opts.keepalive;
    let keep_idle_ms = entry.opts.keep_idle_s as u64 * 1000;
    let keep_intvl_ms = entry.opts.keep_intvl_s as u64 * 1000;
    let keep_cnt = entry.opts.keep_cnt;
    let established = entry.state == SockState::Established;

    let verdict = {
        let Some(conn) = entry.conn.as_mut() else {
            return;
        };

        if conn.time_wait_until.is_some_and(|tw| now >= tw) {
            TimerVerdict::Teardown(None)
        } else if conn.retx_deadline.is_some_and(|dl| now >= dl) {
            conn.retx_count += 1;
            if conn.retx_count > timers.max_retx {
                TimerVerdict::Teardown(Some(SockError::TimedOut))
            } else {
                conn.rto_ms = (conn.rto_ms * 2).min(timers.rto_max_ms);
                conn.retx_deadline = Some(now + conn.rto_ms);
                match conn.hs {
                    Handshake::SynSent => {
                        let iss = conn.snd_nxt.wrapping_sub(1);
                        tx.send_tcp(local, remote, iss, 0, TCP_SYN, window, &[]);
                    }
                    Handshake::SynRcvd => {}
                    Handshake::Done => {
                        let unacked = conn.ring.len().min(TCP_MSS);
                        if unacked > 0 {
                            let ring = conn.ring.make_contiguous();
                            tx.send_tcp(
                                local,
                                remote,
                                conn.snd_una,
                                conn.rcv_nxt,
                                TCP_ACK | TCP_PSH,
                                window,
                                &ring[..unacked],
                            );
                        } else if conn.fin_sent && !conn.fin_acked {
                            tx.send_tcp(
                                local,
                                remote,
                                conn.snd_nxt.wrapping_sub(1),
                                conn.rcv_nxt,
                                TCP_FIN | TCP_ACK,
                                window,
                                &[],
                            );
                        }
                    }
                }
                TimerVerdict::Continue
            }
        } else if keepalive && established && conn.hs == Handshake::Done {
            match conn.ka_deadline {
                None => {
                    conn.ka_deadline = Some(conn.last_rx_ms + keep_idle_ms);
                    TimerVerdict::Continue
                }
                Some(dl) if now >= dl => {
                    if conn.ka_probes >= keep_cnt {
                        TimerVerdict::Teardown(Some(SockError::TimedOut))
                    } else {
                        // Probe: an ACK one byte below snd_una elicits a
                        // window update from a live peer.
                        tx.send_tcp(
                            local,
                            remote,
                            conn.snd_una.wrapping_sub(1),
                            conn.rcv_nxt,
                            TCP_ACK,
                            window,
                            &[],
                        );
                        conn.ka_probes += 1;
                        conn.ka_deadline = Some(now + keep_intvl_ms);
                        TimerVerdict::Continue
                    }
                }
                Some(_) => TimerVerdict::Continue,
            }
        } else {
            TimerVerdict::Continue
        }
    };

    match verdict {
        TimerVerdict::Continue => transmit(entry, now, tx),
        TimerVerdict::Teardown(err) => {
            if let Some(tuple) = tuple {
                if err.is_some() {
                    debug!("{tuple:?}: timer teardown ({err:?})");
                }
                teardown(entry, err, tuple, index, tx);
            }
        }
    }
}

/// SYN-ACK retransmission and pending-entry expiry for listeners.
fn listener_timer(
    entry: &mut SocketEntry,
    now: Ticks,
    timers: &TcpTimers,
    index: &mut IndexOps,
    tx: &mut TxSink<'_>,
) {
    let proto = entry.proto;
    let Some(listen) = entry.listen.as_mut() else {
        return;
    };
    let mut expired: Vec<usize> = Vec::new();
    for (i, pending) in listen.syn.iter_mut().enumerate() {
        let Some(dl) = pending.conn.retx_deadline else {
            continue;
        };
        if now < dl {
            continue;
        }
        pending.conn.retx_count += 1;
        if pending.conn.retx_count > timers.max_retx {
            expired.push(i);
            continue;
        }
        pending.conn.rto_ms = (pending.conn.rto_ms * 2).min(timers.rto_max_ms);
        pending.conn.retx_deadline = Some(now + pending.conn.rto_ms);
        let iss = pending.conn.snd_nxt.wrapping_sub(1);
        let window = advertised_window(&pending.rx);
        tx.send_tcp(
            pending.local,
            pending.remote,
            iss,
            pending.conn.rcv_nxt,
            TCP_SYN | TCP_ACK,
            window,
            &[],
        );
    }
    for i in expired.into_iter().rev() {
        let mut dropped = listen.syn.swap_remove(i);
        dropped.rx.drain_to_pool(tx.pool());
        index.del.push(AddrTuple { proto, local: dropped.local, remote: dropped.remote });
        debug!("handshake with {} timed out", dropped.remote);
    }
}

/// Local shutdown of the write direction: FIN after the ring drains.
pub fn shutdown_write(entry: &mut SocketEntry, now: Ticks, tx: &mut TxSink<'_>) {
    if let Some(conn) = entry.conn.as_mut() {
        conn.pending_fin = true;
    }
    entry.shutdown_wr = true;
    if matches!(entry.state, SockState::Established | SockState::Closing) {
        entry.state = SockState::Closing;
        transmit(entry, now, tx);
    }
}

/// Best-effort FIN on close of a connected socket. The descriptor dies
/// immediately; the peer observes EOF from the FIN.
pub fn close_connection(entry: &mut SocketEntry, now: Ticks, tx: &mut TxSink<'_>) {
    if matches!(entry.state, SockState::Established | SockState::Closing)
        && entry.conn.as_ref().is_some_and(|c| !c.fin_sent)
    {
        shutdown_write(entry, now, tx);
    }
}
