// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! The process-wide stack: descriptor table, tuple index, per-core
//! run-to-completion poll pass, and the inbound dispatcher.
//!
//! Locking discipline (one-way, never nested in reverse):
//!   socket slot -> epoll slot        (event fan-out, epoll_ctl)
//!   socket slot -> index shard       (handlers return IndexOps; the caller
//!                                     applies them after the slot unlocks)
//!   port and bridge locks are taken with no slot lock held.
//! Readiness events are pushed only after the owning socket slot is
//! released, so a wait on another core never deadlocks against a dispatch.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, trace};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use shunt_net::{
    validate_maxevents, EpollEvent, KernelBridge, NetPort, PacketPool, PktBuf, Protocol, RawFd,
    Readiness, SockAddr4, SockError, SockResult, TickSource, Ticks,
};

use crate::classify::{AddrTuple, Classify, ConnRef, IndexOps, TupleIndex};
use crate::config::StackConfig;
use crate::egress::TxSink;
use crate::fd::{DescObj, FdTable};
use crate::socket::{SockState, SocketEntry};
use crate::tcp::{self, TcpTimers};
use crate::udp;
use crate::wire::{self, WireCfg, ETHERTYPE_IPV4, ETH_HDR_LEN, IP_PROTO_TCP, IP_PROTO_UDP};

/// Process-default stack, for the classic init-then-attach usage where one
/// stack serves the whole application.
static DEFAULT_STACK: OnceCell<Arc<Stack>> = OnceCell::new();

pub struct Stack {
    pub(crate) cfg: StackConfig,
    pub(crate) wire: WireCfg,
    pub(crate) timers: TcpTimers,
    pub(crate) fd: FdTable,
    pub(crate) index: TupleIndex,
    pub(crate) pool: Arc<dyn PacketPool>,
    ports: Vec<Mutex<Box<dyn NetPort>>>,
    port_ids: Vec<u16>,
    bridge: Mutex<Box<dyn KernelBridge>>,
    ticks: Arc<dyn TickSource>,
    /// Per-core socket lists driving the timer pass.
    core_socks: Vec<Mutex<Vec<RawFd>>>,
    pid: u32,
    verbose: AtomicBool,
    eph_next: AtomicU32,
    iss_next: AtomicU32,
    attach_rr: AtomicUsize,
}

impl Stack {
    /// Builds and wires the stack. One call per process; application
    /// threads then `attach` individually.
    pub fn init(
        cfg: StackConfig,
        pool: Arc<dyn PacketPool>,
        ports: Vec<Box<dyn NetPort>>,
        mut bridge: Box<dyn KernelBridge>,
        ticks: Arc<dyn TickSource>,
    ) -> SockResult<Arc<Stack>> {
        if let Err(err) = cfg.validate() {
            debug!("stack config rejected: {err}");
            return Err(SockError::InvalidInput("invalid stack configuration"));
        }
        if ports.is_empty() {
            return Err(SockError::InvalidInput("at least one port required"));
        }
        let port_ids: Vec<u16> = ports.iter().map(|p| p.port_id()).collect();
        bridge.configure(&port_ids)?;

        let wire = WireCfg { local_mac: cfg.local_mac, gateway_mac: cfg.gateway_mac };
        let stack = Arc::new(Stack {
            timers: TcpTimers::from(&cfg),
            wire,
            fd: FdTable::new(cfg.max_descriptors),
            index: TupleIndex::new(cfg.cores),
            pool,
            ports: ports.into_iter().map(Mutex::new).collect(),
            port_ids,
            bridge: Mutex::new(bridge),
            ticks,
            core_socks: (0..cfg.cores).map(|_| Mutex::new(Vec::new())).collect(),
            pid: std::process::id(),
            verbose: AtomicBool::new(false),
            eph_next: AtomicU32::new(0),
            iss_next: AtomicU32::new(0x1000),
            attach_rr: AtomicUsize::new(0),
            cfg,
        });
        info!("stack '{}' up: {} core(s), {} port(s)", stack.cfg.file_prefix, stack.cfg.cores, stack.ports.len());
        Ok(stack)
    }

    /// Per-thread attach, required before any other call. Handles are
    /// `!Send` and pinned to the creating process image: a handle carried
    /// across `fork` fails every operation instead of corrupting shared
    /// state.
    pub fn attach(self: &Arc<Self>) -> SockResult<crate::api::SockHandle> {
        self.check_pid()?;
        let core = self.attach_rr.fetch_add(1, Ordering::Relaxed) % self.cfg.cores;
        Ok(crate::api::SockHandle::new(Arc::clone(self), core))
    }

    /// Installs this stack as the process default so later threads can
    /// `Stack::attach_default()` without plumbing the `Arc` around.
    pub fn install_default(self: &Arc<Self>) -> SockResult<()> {
        DEFAULT_STACK
            .set(Arc::clone(self))
            .map_err(|_| SockError::InvalidInput("default stack already installed"))
    }

    /// Per-thread attach against the installed process default.
    pub fn attach_default() -> SockResult<crate::api::SockHandle> {
        let stack = DEFAULT_STACK
            .get()
            .ok_or(SockError::InvalidInput("no default stack installed"))?;
        stack.attach()
    }

    pub(crate) fn check_pid(&self) -> SockResult<()> {
        if std::process::id() != self.pid {
            return Err(SockError::StaleContext);
        }
        Ok(())
    }

    pub(crate) fn now(&self) -> Ticks {
        self.ticks.now_ms()
    }

    pub(crate) fn set_verbose(&self, on: bool) {
        self.verbose.store(on, Ordering::Relaxed);
        info!("debug log {}", if on { "enabled" } else { "disabled" });
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub(crate) fn next_iss(&self) -> u32 {
        self.iss_next.fetch_add(0x10007, Ordering::Relaxed)
    }

    /// Picks an unclaimed ephemeral port. Tuple uniqueness still applies at
    /// connect time, so a rare clash surfaces there as `AddrInUse`.
    pub(crate) fn ephemeral_port(&self, proto: Protocol) -> SockResult<u16> {
        let span = (self.cfg.ephemeral_max - self.cfg.ephemeral_min) as u32 + 1;
        let ip = shunt_net::Ip4Addr(self.cfg.local_ip);
        for _ in 0..span {
            let n = self.eph_next.fetch_add(1, Ordering::Relaxed) % span;
            let port = self.cfg.ephemeral_min + n as u16;
            if !self.index.port_claimed(proto, ip, port) {
                return Ok(port);
            }
        }
        Err(SockError::NoBufs)
    }

    pub(crate) fn local_ip(&self) -> shunt_net::Ip4Addr {
        shunt_net::Ip4Addr(self.cfg.local_ip)
    }

    pub(crate) fn register_core_socket(&self, core: usize, fd: RawFd) {
        self.core_socks[core].lock().push(fd);
    }

    /// Egress routing is out of scope; frames leave on the core's uplink.
    fn egress_port(&self, core: usize) -> usize {
        core % self.ports.len()
    }

    pub(crate) fn flush_tx(&self, core: usize, tx: TxSink<'_>) {
        let mut frames = tx.frames;
        if frames.is_empty() {
            return;
        }
        let idx = self.egress_port(core);
        let sent = self.ports[idx].lock().tx_burst(&mut frames);
        if self.verbose() {
            trace!("core {core}: flushed {sent} frame(s) to port {}", self.port_ids[idx]);
        }
    }

    /// Fan a socket's rising readiness edges out to its watchers. Called
    /// with no slot lock held; watchers that closed concurrently are pruned
    /// by their own close path and simply miss here.
    pub(crate) fn deliver_edges(&self, fd: RawFd, edges: Readiness, watchers: &[RawFd]) {
        if edges.is_empty() {
            return;
        }
        for &epfd in watchers {
            let _ = self.fd.with_epoll(epfd, |ep| {
                ep.push(fd, edges);
                Ok(())
            });
        }
    }

    pub(crate) fn apply_index_ops(&self, ops: IndexOps) {
        for (tuple, re) in ops.add {
            if self.index.insert_conn(tuple, re).is_err() {
                // Lost a race against an identical tuple; the pending entry
                // will expire off its handshake timer.
                debug!("{tuple:?}: tuple already indexed, dropping registration");
            }
        }
        for tuple in ops.del {
            self.index.remove_conn(&tuple);
        }
    }

    /// One run-to-completion pass for `core`: drain ports, drive timers,
    /// let the bridge push its backlog into the kernel. Never blocks.
    pub fn poll_core(&self, core: usize) {
        let now = self.now();
        let mut rx: Vec<PktBuf> = Vec::with_capacity(self.cfg.rx_burst);
        for (idx, port) in self.ports.iter().enumerate() {
            if idx % self.cfg.cores != core % self.cfg.cores {
                continue;
            }
            port.lock().rx_burst(&mut rx, self.cfg.rx_burst);
            for frame in rx.drain(..) {
                self.dispatch(core, idx, frame, now);
            }
        }

        let socks = self.core_socks[core % self.cfg.cores].lock().clone();
        for fd in socks {
            self.run_socket_timer(core, fd, now);
        }

        self.bridge.lock().run(core);
    }

    fn run_socket_timer(&self, core: usize, fd: RawFd, now: Ticks) {
        let mut tx = TxSink::new(self.wire, &*self.pool);
        let mut ops = IndexOps::default();
        let res = self.fd.with_socket(fd, |entry| {
            let tuple = conn_tuple(entry);
            tcp::on_timer(entry, tuple, now, &self.timers, &mut ops, &mut tx);
            Ok((entry.sync_readiness(), entry.watchers.clone()))
        });
        self.flush_tx(core, tx);
        self.apply_index_ops(ops);
        if let Ok((edges, watchers)) = res {
            self.deliver_edges(fd, edges, &watchers);
        }
    }

    /// Classifies one inbound frame and drives the owning socket, or hands
    /// the frame to the kernel-bridge exactly once.
    fn dispatch(&self, core: usize, port_idx: usize, frame: PktBuf, now: Ticks) {
        let (tuple, l4) = {
            let bytes = frame.bytes();
            let Some(eth) = wire::parse_eth(bytes) else {
                return self.to_bridge(port_idx, frame);
            };
            if eth.ethertype != ETHERTYPE_IPV4 {
                // ARP and friends belong to the kernel.
                return self.to_bridge(port_idx, frame);
            }
            let Some(ip) = wire::parse_ipv4(bytes, ETH_HDR_LEN) else {
                return self.to_bridge(port_idx, frame);
            };
            match ip.proto {
                IP_PROTO_TCP => {
                    let Some(seg) = wire::parse_tcp(bytes, &ip) else {
                        return self.to_bridge(port_idx, frame);
                    };
                    let tuple = AddrTuple {
                        proto: Protocol::Tcp,
                        local: SockAddr4 { ip: ip.dst, port: seg.dst_port },
                        remote: SockAddr4 { ip: ip.src, port: seg.src_port },
                    };
                    (tuple, L4::Tcp(seg))
                }
                IP_PROTO_UDP => {
                    let Some(dgram) = wire::parse_udp(bytes, &ip) else {
                        return self.to_bridge(port_idx, frame);
                    };
                    let tuple = AddrTuple {
                        proto: Protocol::Udp,
                        local: SockAddr4 { ip: ip.dst, port: dgram.dst_port },
                        remote: SockAddr4 { ip: ip.src, port: dgram.src_port },
                    };
                    (tuple, L4::Udp(dgram))
                }
                // ICMP and anything else the fast path does not speak.
                _ => return self.to_bridge(port_idx, frame),
            }
        };

        match self.index.classify(&tuple) {
            Classify::Matched(re) => match l4 {
                L4::Tcp(seg) => self.tcp_deliver(core, re, tuple, &seg, frame, now),
                L4::Udp(dgram) => self.udp_deliver(re, tuple, &dgram, frame),
            },
            Classify::MatchedListener(re) => match l4 {
                L4::Tcp(seg) => self.tcp_listener_syn(core, re, tuple, &seg, frame, now),
                L4::Udp(dgram) => self.udp_deliver(re, tuple, &dgram, frame),
            },
            Classify::Unclassified => {
                if self.verbose() {
                    trace!("{tuple:?}: unclassified, forwarding to bridge");
                }
                self.to_bridge(port_idx, frame)
            }
        }
    }

    fn to_bridge(&self, port_idx: usize, frame: PktBuf) {
        self.bridge.lock().send_burst(self.port_ids[port_idx], vec![frame]);
    }

    /// Matched TCP segment: connected socket, or a listener whose pending
    /// queue owns the tuple.
    fn tcp_deliver(
        &self,
        core: usize,
        re: ConnRef,
        tuple: AddrTuple,
        seg: &wire::TcpView,
        frame: PktBuf,
        now: Ticks,
    ) {
        let mut tx = TxSink::new(self.wire, &*self.pool);
        let mut ops = IndexOps::default();
        let mut frame_in = Some(frame);
        let res = self.fd.with_socket_checked(re.fd, re.gen, |entry| {
            let frame = frame_in.take().expect("frame present");
            if entry.state == SockState::Listening {
                tcp::on_listener_tuple_segment(
                    entry, tuple, seg, frame, now, &self.timers, &mut ops, &mut tx,
                );
            } else {
                tcp::on_segment(entry, tuple, seg, frame, now, &self.timers, &mut ops, &mut tx);
            }
            Ok((entry.sync_readiness(), entry.watchers.clone()))
        });
        if let Some(unrouted) = frame_in.take() {
            // Stale generation: the descriptor closed under the index entry.
            self.pool.free(unrouted);
            self.index.remove_conn(&tuple);
        }
        self.flush_tx(core, tx);
        self.apply_index_ops(ops);
        if let Ok((edges, watchers)) = res {
            self.deliver_edges(re.fd, edges, &watchers);
        }
    }

    /// Wildcard listener match: only a SYN can start something here.
    fn tcp_listener_syn(
        &self,
        core: usize,
        re: ConnRef,
        tuple: AddrTuple,
        seg: &wire::TcpView,
        frame: PktBuf,
        now: Ticks,
    ) {
        let mut tx = TxSink::new(self.wire, &*self.pool);
        let mut ops = IndexOps::default();
        let iss = self.next_iss();
        let _ = self.fd.with_socket_checked(re.fd, re.gen, |entry| {
            tcp::on_listener_syn(
                entry,
                tuple,
                seg,
                now,
                &self.timers,
                re,
                iss,
                self.cfg.recv_buf,
                self.cfg.send_buf,
                &mut ops,
                &mut tx,
            );
            Ok(())
        });
        self.pool.free(frame);
        self.flush_tx(core, tx);
        self.apply_index_ops(ops);
    }

    fn udp_deliver(&self, re: ConnRef, tuple: AddrTuple, dgram: &wire::UdpView, frame: PktBuf) {
        let tx = TxSink::new(self.wire, &*self.pool);
        let mut frame_in = Some(frame);
        let res = self.fd.with_socket_checked(re.fd, re.gen, |entry| {
            let frame = frame_in.take().expect("frame present");
            udp::on_datagram(entry, tuple.remote, dgram, frame, &tx);
            Ok((entry.sync_readiness(), entry.watchers.clone()))
        });
        if let Some(unrouted) = frame_in.take() {
            self.pool.free(unrouted);
        }
        if let Ok((edges, watchers)) = res {
            self.deliver_edges(re.fd, edges, &watchers);
        }
    }

    /// Full teardown of a descriptor: buffers drained back to the pool,
    /// index entries removed, every watching epoll instance scrubbed.
    pub(crate) fn close_fd(&self, core: usize, fd: RawFd) -> SockResult<()> {
        let obj = self.fd.begin_close(fd)?;
        match obj {
            DescObj::Epoll(ep) => {
                // Scrub this epoll from the watcher lists of its sockets.
                let watched: Vec<RawFd> = (0..self.cfg.max_descriptors as RawFd)
                    .filter(|sfd| ep.watched(*sfd))
                    .collect();
                for sfd in watched {
                    let _ = self.fd.with_socket(sfd, |entry| {
                        entry.watchers.retain(|w| *w != fd);
                        Ok(())
                    });
                }
            }
            DescObj::Socket(mut entry) => {
                let now = self.now();
                let mut tx = TxSink::new(self.wire, &*self.pool);
                tcp::close_connection(&mut entry, now, &mut tx);

                if let (Some(local), Some(remote)) = (entry.local, entry.remote) {
                    self.index.remove_conn(&AddrTuple { proto: entry.proto, local, remote });
                }
                if let Some(key) = entry.bound_key {
                    self.index.unbind_listener(entry.proto, key, fd);
                }
                if let Some(listen) = entry.listen.as_mut() {
                    for mut pending in listen.syn.drain(..).chain(listen.ready.drain(..)) {
                        self.index.remove_conn(&AddrTuple {
                            proto: Protocol::Tcp,
                            local: pending.local,
                            remote: pending.remote,
                        });
                        pending.rx.drain_to_pool(&*self.pool);
                    }
                }
                entry.rx.drain_to_pool(&*self.pool);
                for epfd in entry.watchers.drain(..) {
                    let _ = self.fd.with_epoll(epfd, |ep| {
                        ep.forget(fd);
                        Ok(())
                    });
                }
                self.core_socks[entry.core % self.cfg.cores].lock().retain(|f| *f != fd);
                self.flush_tx(core, tx);
            }
        }
        self.fd.finish_close(fd);
        Ok(())
    }

    /// Cooperative wait: drains the ready queue, pumping the caller's poll
    /// pass between drains. `timeout_ms < 0` waits until an event arrives,
    /// `0` polls exactly once, positive values bound the wait by deadline.
    pub(crate) fn epoll_wait(
        &self,
        core: usize,
        epfd: RawFd,
        maxevents: usize,
        timeout_ms: i64,
    ) -> SockResult<Vec<EpollEvent>> {
        validate_maxevents(maxevents)?;
        let start = self.now();
        let deadline: Option<Ticks> = match timeout_ms {
            t if t < 0 => None,
            t => Some(start + t as u64),
        };
        let mut out = Vec::new();
        loop {
            self.fd.with_epoll(epfd, |ep| {
                ep.drain(maxevents, &mut out);
                Ok(())
            })?;
            if !out.is_empty() {
                return Ok(out);
            }

            self.poll_core(core);

            self.fd.with_epoll(epfd, |ep| {
                ep.drain(maxevents, &mut out);
                Ok(())
            })?;
            if !out.is_empty() {
                return Ok(out);
            }
            if let Some(deadline) = deadline {
                if self.now() >= deadline {
                    return Ok(out);
                }
            }
            std::hint::spin_loop();
        }
    }
}

enum L4 {
    Tcp(wire::TcpView),
    Udp(wire::UdpView),
}

/// Tuple of a connected socket, if it has one.
fn conn_tuple(entry: &SocketEntry) -> Option<AddrTuple> {
    match (entry.local, entry.remote, entry.conn.is_some()) {
        (Some(local), Some(remote), true) => {
            Some(AddrTuple { proto: entry.proto, local, remote })
        }
        _ => None,
    }
}
