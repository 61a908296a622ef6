// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Socket entries: per-descriptor protocol state, the buffered receive
//! queue, and readiness recomputation.
//!
//! Readiness is a pure function of socket state (`compute_readiness`);
//! `sync_readiness` diffs it against the last published value and returns
//! only the rising edges. That diff is the entire edge-triggered contract:
//! a condition that persists produces no further events.

use std::collections::VecDeque;

use shunt_net::{
    PacketPool, PktBuf, Protocol, RawFd, Readiness, SockAddr4, SockError, SockResult, SockType,
};

use crate::config::StackConfig;
use crate::tcp::TcpConn;

/// Socket-level lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockState {
    Closed,
    Bound,
    Listening,
    Connecting,
    Established,
    /// Half-closed: a FIN has passed in at least one direction.
    Closing,
}

/// Allow-listed socket options. Anything outside this set is rejected at the
/// API boundary without touching socket state.
#[derive(Clone, Copy, Debug)]
pub struct SockOpts {
    pub reuse_port: bool,
    pub keepalive: bool,
    pub nodelay: bool,
    pub keep_idle_s: u32,
    pub keep_intvl_s: u32,
    pub keep_cnt: u32,
}

/// Option name constants, kept value-compatible with the Linux surface the
/// original callers were written against.
pub mod sockopt {
    pub const SOL_SOCKET: i32 = 1;
    pub const IPPROTO_TCP: i32 = 6;

    pub const SO_KEEPALIVE: i32 = 9;
    pub const SO_REUSEPORT: i32 = 15;

    pub const TCP_NODELAY: i32 = 1;
    pub const TCP_KEEPIDLE: i32 = 4;
    pub const TCP_KEEPINTVL: i32 = 5;
    pub const TCP_KEEPCNT: i32 = 6;
}

/// One received segment/datagram: a borrowed buffer already adjusted to its
/// payload, plus a read cursor for partial stream reads.
#[derive(Debug)]
pub struct RxSeg {
    pub buf: PktBuf,
    pub off: usize,
    pub from: SockAddr4,
}

impl RxSeg {
    pub fn remaining(&self) -> &[u8] {
        &self.buf.bytes()[self.off..]
    }
}

/// Bounded receive queue of borrowed buffers.
#[derive(Debug)]
pub struct RxQueue {
    segs: VecDeque<RxSeg>,
    bytes: usize,
    cap: usize,
}

impl RxQueue {
    pub fn new(cap: usize) -> Self {
        Self { segs: VecDeque::new(), bytes: 0, cap }
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Remaining capacity; advertised as the receive window.
    pub fn space(&self) -> usize {
        self.cap.saturating_sub(self.bytes)
    }

    /// Enqueues a segment, or hands it back when the queue bound is hit so
    /// the caller can drop it (the peer retransmits; we never grow unbounded).
    pub fn push(&mut self, seg: RxSeg) -> Result<(), RxSeg> {
        let len = seg.remaining().len();
        if self.bytes + len > self.cap {
            return Err(seg);
        }
        self.bytes += len;
        self.segs.push_back(seg);
        Ok(())
    }

    /// Stream read: copies across segment boundaries, consuming unless
    /// `peek`. Drained buffers go back to the pool.
    pub fn read_stream(&mut self, out: &mut [u8], peek: bool, pool: &dyn PacketPool) -> usize {
        let mut n = 0;
        if peek {
            for seg in &self.segs {
                if n == out.len() {
                    break;
                }
                let rest = seg.remaining();
                let take = rest.len().min(out.len() - n);
                out[n..n + take].copy_from_slice(&rest[..take]);
                n += take;
            }
            return n;
        }
        while n < out.len() {
            let Some(seg) = self.segs.front_mut() else {
                break;
            };
            let rest = seg.remaining();
            let take = rest.len().min(out.len() - n);
            out[n..n + take].copy_from_slice(&rest[..take]);
            seg.off += take;
            self.bytes -= take;
            n += take;
            if seg.remaining().is_empty() {
                let drained = self.segs.pop_front().expect("front exists");
                pool.free(drained.buf);
            }
        }
        n
    }

    /// Datagram read: one queue entry per call, excess bytes discarded.
    pub fn read_dgram(
        &mut self,
        out: &mut [u8],
        peek: bool,
        pool: &dyn PacketPool,
    ) -> Option<(usize, SockAddr4)> {
        if peek {
            let seg = self.segs.front()?;
            let rest = seg.remaining();
            let take = rest.len().min(out.len());
            out[..take].copy_from_slice(&rest[..take]);
            return Some((take, seg.from));
        }
        let seg = self.segs.pop_front()?;
        let rest = seg.remaining();
        let take = rest.len().min(out.len());
        out[..take].copy_from_slice(&rest[..take]);
        self.bytes -= rest.len();
        let from = seg.from;
        pool.free(seg.buf);
        Some((take, from))
    }

    /// Returns every queued buffer to the pool.
    pub fn drain_to_pool(&mut self, pool: &dyn PacketPool) {
        for seg in self.segs.drain(..) {
            pool.free(seg.buf);
        }
        self.bytes = 0;
    }
}

/// A not-yet-accepted inbound connection parked on a listener. Handshake
/// state lives here until `accept` promotes it onto a fresh descriptor;
/// no descriptor is consumed before that.
#[derive(Debug)]
pub struct PendingConn {
    pub local: SockAddr4,
    pub remote: SockAddr4,
    pub conn: TcpConn,
    /// Data that raced ahead of `accept`.
    pub rx: RxQueue,
}

/// Listener bookkeeping: handshaking entries plus completed ones awaiting
/// accept. `backlog` bounds the sum.
#[derive(Debug)]
pub struct ListenQueue {
    pub backlog: usize,
    pub syn: Vec<PendingConn>,
    pub ready: VecDeque<PendingConn>,
}

impl ListenQueue {
    pub fn new(backlog: usize) -> Self {
        Self { backlog, syn: Vec::new(), ready: VecDeque::new() }
    }

    pub fn is_full(&self) -> bool {
        self.syn.len() + self.ready.len() >= self.backlog
    }
}

pub struct SocketEntry {
    pub stype: SockType,
    pub proto: Protocol,
    pub state: SockState,
    pub local: Option<SockAddr4>,
    /// The (possibly wildcard) key this socket holds in the listener table;
    /// `local` may be concretized later by connect, this never is.
    pub bound_key: Option<SockAddr4>,
    pub remote: Option<SockAddr4>,
    pub rx: RxQueue,
    pub conn: Option<TcpConn>,
    pub listen: Option<ListenQueue>,
    pub opts: SockOpts,
    /// Terminal connection failure, surfaced on the next API call.
    pub err: Option<SockError>,
    pub shutdown_rd: bool,
    pub shutdown_wr: bool,
    pub readiness: Readiness,
    /// Epoll descriptors watching this socket.
    pub watchers: Vec<RawFd>,
    /// Poll-loop core whose timer pass owns this socket.
    pub core: usize,
}

impl SocketEntry {
    pub fn new(stype: SockType, cfg: &StackConfig, core: usize) -> Self {
        let proto = match stype {
            SockType::Stream => Protocol::Tcp,
            SockType::Dgram => Protocol::Udp,
        };
        Self {
            stype,
            proto,
            state: SockState::Closed,
            local: None,
            bound_key: None,
            remote: None,
            rx: RxQueue::new(cfg.recv_buf),
            conn: None,
            listen: None,
            opts: SockOpts {
                reuse_port: false,
                keepalive: false,
                nodelay: false,
                keep_idle_s: cfg.keepalive_idle_s,
                keep_intvl_s: cfg.keepalive_intvl_s,
                keep_cnt: cfg.keepalive_cnt,
            },
            err: None,
            shutdown_rd: false,
            shutdown_wr: false,
            readiness: Readiness::empty(),
            watchers: Vec::new(),
            core,
        }
    }

    /// Current readiness as a pure function of state.
    pub fn compute_readiness(&self) -> Readiness {
        let mut r = Readiness::empty();
        if self.err.is_some() {
            r |= Readiness::ERROR | Readiness::HUP;
        }

        let readable = if let Some(listen) = &self.listen {
            !listen.ready.is_empty()
        } else {
            !self.rx.is_empty()
                || self.shutdown_rd
                || self.conn.as_ref().is_some_and(|c| c.fin_rcvd)
        };
        if readable {
            r |= Readiness::READABLE;
        }

        let writable = match self.proto {
            Protocol::Udp => !self.shutdown_wr,
            Protocol::Tcp => {
                matches!(self.state, SockState::Established | SockState::Closing)
                    && !self.shutdown_wr
                    && self.conn.as_ref().is_some_and(|c| c.send_space() > 0)
            }
        };
        if writable {
            r |= Readiness::WRITABLE;
        }
        r
    }

    /// Publishes the current readiness; returns only the rising edges.
    pub fn sync_readiness(&mut self) -> Readiness {
        let now = self.compute_readiness();
        let edges = now & !self.readiness;
        self.readiness = now;
        edges
    }

    /// Applies an allow-listed option. Unknown (level, optname) pairs fail
    /// with `InvalidInput` and change nothing.
    pub fn apply_sockopt(&mut self, level: i32, optname: i32, value: i32) -> SockResult<()> {
        use sockopt::*;
        match (level, optname) {
            (SOL_SOCKET, SO_REUSEPORT) => self.opts.reuse_port = value != 0,
            (SOL_SOCKET, SO_KEEPALIVE) => self.opts.keepalive = value != 0,
            (IPPROTO_TCP, TCP_NODELAY) => self.opts.nodelay = value != 0,
            (IPPROTO_TCP, TCP_KEEPIDLE) => {
                self.opts.keep_idle_s =
                    u32::try_from(value).ok().filter(|v| *v > 0).ok_or(SockError::InvalidInput(
                        "keepalive idle must be positive",
                    ))?;
            }
            (IPPROTO_TCP, TCP_KEEPINTVL) => {
                self.opts.keep_intvl_s =
                    u32::try_from(value).ok().filter(|v| *v > 0).ok_or(SockError::InvalidInput(
                        "keepalive interval must be positive",
                    ))?;
            }
            (IPPROTO_TCP, TCP_KEEPCNT) => {
                self.opts.keep_cnt =
                    u32::try_from(value).ok().filter(|v| *v > 0).ok_or(SockError::InvalidInput(
                        "keepalive count must be positive",
                    ))?;
            }
            _ => return Err(SockError::InvalidInput("option not in allow-list")),
        }
        Ok(())
    }

    /// Stream receive with POSIX drain-then-EOF ordering.
    pub fn recv_stream(
        &mut self,
        out: &mut [u8],
        peek: bool,
        pool: &dyn PacketPool,
    ) -> SockResult<usize> {
        if self.rx.is_empty() {
            if let Some(err) = self.err {
                return Err(err);
            }
            if self.shutdown_rd || self.conn.as_ref().is_some_and(|c| c.fin_rcvd) {
                return Ok(0);
            }
            return match self.state {
                SockState::Established | SockState::Closing => Err(SockError::WouldBlock),
                _ => Err(SockError::NotConnected),
            };
        }
        Ok(self.rx.read_stream(out, peek, pool))
    }

    /// Datagram receive; reports the datagram's source address.
    pub fn recv_dgram(
        &mut self,
        out: &mut [u8],
        peek: bool,
        pool: &dyn PacketPool,
    ) -> SockResult<(usize, SockAddr4)> {
        if let Some(err) = self.err {
            return Err(err);
        }
        if self.shutdown_rd && self.rx.is_empty() {
            return Ok((0, self.remote.unwrap_or(SockAddr4::UNSPECIFIED)));
        }
        self.rx.read_dgram(out, peek, pool).ok_or(SockError::WouldBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shunt_net::HeapPool;

    fn dgram_entry() -> SocketEntry {
        SocketEntry::new(SockType::Dgram, &StackConfig::default(), 0)
    }

    fn seg(pool: &HeapPool, payload: &[u8], from: SockAddr4) -> RxSeg {
        let mut buf = pool.alloc().expect("pool");
        assert!(buf.append(payload));
        RxSeg { buf, off: 0, from }
    }

    #[test]
    fn readiness_edges_fire_once_per_transition() {
        let pool = HeapPool::new(4, 256);
        let mut entry = dgram_entry();
        entry.state = SockState::Bound;

        // fresh dgram socket: writable edge, nothing readable
        let edges = entry.sync_readiness();
        assert_eq!(edges, Readiness::WRITABLE);
        assert_eq!(entry.sync_readiness(), Readiness::empty());

        let from = SockAddr4::new([10, 0, 0, 2], 777);
        entry.rx.push(seg(&pool, b"hi", from)).unwrap();
        assert_eq!(entry.sync_readiness(), Readiness::READABLE);
        // unchanged condition: no second edge
        assert_eq!(entry.sync_readiness(), Readiness::empty());

        let mut out = [0u8; 8];
        let (n, src) = entry.recv_dgram(&mut out, false, &pool).unwrap();
        assert_eq!((n, src), (2, from));
        assert_eq!(entry.sync_readiness(), Readiness::empty());

        // new arrival after a drain is a fresh transition
        entry.rx.push(seg(&pool, b"again", from)).unwrap();
        assert_eq!(entry.sync_readiness(), Readiness::READABLE);
        entry.rx.drain_to_pool(&pool);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn empty_dgram_recv_would_block_repeatedly() {
        let pool = HeapPool::new(1, 256);
        let mut entry = dgram_entry();
        entry.state = SockState::Bound;
        let mut out = [0u8; 4];
        for _ in 0..3 {
            assert_eq!(
                entry.recv_dgram(&mut out, false, &pool).unwrap_err(),
                SockError::WouldBlock
            );
        }
    }

    #[test]
    fn dgram_read_truncates_and_reports_source() {
        let pool = HeapPool::new(2, 256);
        let mut entry = dgram_entry();
        entry.state = SockState::Bound;
        let from = SockAddr4::new([192, 168, 1, 9], 1234);
        entry.rx.push(seg(&pool, b"truncated-datagram", from)).unwrap();

        let mut out = [0u8; 9];
        let (n, src) = entry.recv_dgram(&mut out, false, &pool).unwrap();
        assert_eq!(n, 9);
        assert_eq!(&out, b"truncated");
        assert_eq!(src, from);
        // remainder was discarded with the datagram
        assert!(entry.rx.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let pool = HeapPool::new(1, 256);
        let mut entry = dgram_entry();
        entry.state = SockState::Bound;
        let from = SockAddr4::new([1, 2, 3, 4], 5);
        entry.rx.push(seg(&pool, b"keep", from)).unwrap();

        let mut out = [0u8; 8];
        let (n, _) = entry.recv_dgram(&mut out, true, &pool).unwrap();
        assert_eq!(&out[..n], b"keep");
        let (n, _) = entry.recv_dgram(&mut out, false, &pool).unwrap();
        assert_eq!(&out[..n], b"keep");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn stream_read_crosses_segment_boundaries() {
        let pool = HeapPool::new(4, 256);
        let mut q = RxQueue::new(1024);
        let from = SockAddr4::new([1, 1, 1, 1], 1);
        q.push(seg(&pool, b"hello ", from)).unwrap();
        q.push(seg(&pool, b"world", from)).unwrap();

        let mut out = [0u8; 8];
        assert_eq!(q.read_stream(&mut out, false, &pool), 8);
        assert_eq!(&out, b"hello wo");
        let mut rest = [0u8; 8];
        assert_eq!(q.read_stream(&mut rest, false, &pool), 3);
        assert_eq!(&rest[..3], b"rld");
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn rx_queue_bound_rejects_overflow() {
        let pool = HeapPool::new(2, 256);
        let mut q = RxQueue::new(4);
        let from = SockAddr4::new([1, 1, 1, 1], 1);
        q.push(seg(&pool, b"1234", from)).unwrap();
        let rejected = q.push(seg(&pool, b"x", from)).unwrap_err();
        pool.free(rejected.buf);
        q.drain_to_pool(&pool);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn sockopt_outside_allow_list_leaves_state_unchanged() {
        let mut entry = dgram_entry();
        let before_keepalive = entry.opts.keepalive;
        // SO_RCVBUF (8) is not allow-listed
        assert_eq!(
            entry.apply_sockopt(sockopt::SOL_SOCKET, 8, 1),
            Err(SockError::InvalidInput("option not in allow-list"))
        );
        assert_eq!(entry.opts.keepalive, before_keepalive);

        entry.apply_sockopt(sockopt::SOL_SOCKET, sockopt::SO_KEEPALIVE, 1).unwrap();
        assert!(entry.opts.keepalive);
        entry.apply_sockopt(sockopt::IPPROTO_TCP, sockopt::TCP_KEEPCNT, 3).unwrap();
        assert_eq!(entry.opts.keep_cnt, 3);
        assert!(entry.apply_sockopt(sockopt::IPPROTO_TCP, sockopt::TCP_KEEPCNT, 0).is_err());
    }
}
