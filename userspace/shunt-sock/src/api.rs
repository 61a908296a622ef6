// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! The BSD-shaped call surface.
//!
//! Every operation is non-blocking by construction: flow control comes back
//! as `Err(WouldBlock)` / `Err(InProgress)` and callers re-poll through the
//! epoll engine. Errors carry errno-compatible codes via
//! [`SockError::errno`], matching the C surface applications were written
//! against.
//!
//! A `SockHandle` is one thread's attachment to the stack. It is `!Send` on
//! purpose: each thread attaches for itself, and a handle inherited across
//! `fork` is rejected at every call instead of touching the parent's tables.

use std::marker::PhantomData;
use std::sync::Arc;

use shunt_net::{
    CtlOp, Domain, EpollEvent, Interest, Protocol, RawFd, ShutdownHow, SockAddr4, SockError,
    SockResult, SockType, MSG_PEEK,
};

use crate::classify::{AddrTuple, ConnRef};
use crate::egress::TxSink;
use crate::epoll::EpollInstance;
use crate::fd::DescObj;
use crate::socket::{ListenQueue, PendingConn, SockState, SocketEntry};
use crate::stack::Stack;
use crate::tcp;

pub struct SockHandle {
    stack: Arc<Stack>,
    core: usize,
    _not_send: PhantomData<*const ()>,
}

impl SockHandle {
    pub(crate) fn new(stack: Arc<Stack>, core: usize) -> Self {
        Self { stack, core, _not_send: PhantomData }
    }

    /// The poll-loop core this handle drives while waiting.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Runs one poll pass on this handle's core. Applications embedding
    /// their own loop call this; `epoll_wait` pumps it internally.
    pub fn poll(&self) {
        self.stack.poll_core(self.core);
    }

    /// Toggles verbose per-packet logging at runtime.
    pub fn set_debug_log(&self, on: bool) {
        self.stack.set_verbose(on);
    }

    fn guard(&self) -> SockResult<()> {
        self.stack.check_pid()
    }

    /// Socket op wrapper: runs `f` under the slot lock, then flushes staged
    /// frames, publishes readiness, and fans rising edges out to watchers.
    fn with_sock_io<R>(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut SocketEntry, u32, &mut TxSink<'_>) -> SockResult<R>,
    ) -> SockResult<R> {
        self.guard()?;
        let stack = &self.stack;
        let mut tx = TxSink::new(stack.wire, &*stack.pool);
        let mut sync = None;
        let res = stack.fd.with_socket_meta(fd, |entry, gen| {
            let r = f(entry, gen, &mut tx);
            sync = Some((entry.sync_readiness(), entry.watchers.clone()));
            r
        });
        stack.flush_tx(self.core, tx);
        if let Some((edges, watchers)) = sync {
            stack.deliver_edges(fd, edges, &watchers);
        }
        res
    }

    /// Creates an endpoint and returns its descriptor.
    pub fn socket(&self, _domain: Domain, stype: SockType) -> SockResult<RawFd> {
        self.guard()?;
        let mut entry = SocketEntry::new(stype, &self.stack.cfg, self.core);
        entry.sync_readiness();
        let (fd, _gen) = self
            .stack
            .fd
            .alloc(DescObj::Socket(entry))
            .map_err(|_| SockError::NoDescriptors)?;
        self.stack.register_core_socket(self.core, fd);
        Ok(fd)
    }

    /// Binds a local address. Port 0 picks an ephemeral port.
    pub fn bind(&self, fd: RawFd, addr: SockAddr4) -> SockResult<()> {
        self.guard()?;
        let stack = &self.stack;
        stack.fd.with_socket_meta(fd, |entry, gen| {
            if entry.local.is_some() || entry.state != SockState::Closed {
                return Err(SockError::InvalidInput("socket already bound"));
            }
            if !addr.ip.is_unspecified() && addr.ip != stack.local_ip() {
                return Err(SockError::AddrNotAvail);
            }
            let port =
                if addr.port == 0 { stack.ephemeral_port(entry.proto)? } else { addr.port };
            let local = SockAddr4 { ip: addr.ip, port };
            stack.index.bind_listener(
                entry.proto,
                local,
                ConnRef { fd, gen },
                entry.opts.reuse_port,
                entry.proto == Protocol::Udp,
            )?;
            entry.local = Some(local);
            entry.bound_key = Some(local);
            entry.state = SockState::Bound;
            Ok(())
        })
    }

    /// Starts accepting on a bound stream socket. `backlog` 0 selects the
    /// configured default.
    pub fn listen(&self, fd: RawFd, backlog: usize) -> SockResult<()> {
        self.guard()?;
        let stack = &self.stack;
        stack.fd.with_socket(fd, |entry| {
            if entry.proto != Protocol::Tcp {
                return Err(SockError::NotSupported("listen on datagram socket"));
            }
            match entry.state {
                SockState::Bound => {}
                SockState::Listening => return Ok(()), // idempotent
                _ => return Err(SockError::InvalidInput("socket not bound")),
            }
            let backlog = if backlog == 0 { stack.cfg.default_backlog } else { backlog };
            entry.listen = Some(ListenQueue::new(backlog));
            entry.state = SockState::Listening;
            let local = entry.local.expect("bound socket has an address");
            stack.index.set_listener_ready(Protocol::Tcp, local, fd);
            Ok(())
        })
    }

    /// Non-blocking connect. Stream sockets return `Err(InProgress)`;
    /// completion is observed as a writability (or error) readiness edge.
    /// Datagram sockets pin the peer and succeed immediately.
    pub fn connect(&self, fd: RawFd, addr: SockAddr4) -> SockResult<()> {
        if addr.ip.is_unspecified() || addr.port == 0 {
            return Err(SockError::InvalidInput("peer address unspecified"));
        }
        let now = self.stack.now();
        let iss = self.stack.next_iss();
        self.with_sock_io(fd, |entry, gen, tx| {
            let stack = &self.stack;
            if let Some(err) = entry.err {
                return Err(err);
            }
            match entry.state {
                SockState::Closed | SockState::Bound => {}
                SockState::Connecting => return Err(SockError::InProgress),
                SockState::Established | SockState::Closing => {
                    return Err(SockError::AlreadyConnected)
                }
                SockState::Listening => {
                    return Err(SockError::InvalidInput("connect on listening socket"))
                }
            }
            // Concretize the local address: wildcard ip becomes the stack's,
            // missing port becomes ephemeral.
            let local = match entry.local {
                Some(l) => SockAddr4 {
                    ip: if l.ip.is_unspecified() { stack.local_ip() } else { l.ip },
                    port: l.port,
                },
                None => {
                    let port = stack.ephemeral_port(entry.proto)?;
                    let local = SockAddr4 { ip: stack.local_ip(), port };
                    if entry.proto == Protocol::Udp {
                        stack.index.bind_listener(
                            Protocol::Udp,
                            local,
                            ConnRef { fd, gen },
                            entry.opts.reuse_port,
                            true,
                        )?;
                        entry.bound_key = Some(local);
                    }
                    local
                }
            };
            let tuple = AddrTuple { proto: entry.proto, local, remote: addr };
            stack.index.insert_conn(tuple, ConnRef { fd, gen })?;
            match entry.proto {
                Protocol::Tcp => {
                    tcp::start_connect(
                        entry,
                        local,
                        addr,
                        iss,
                        now,
                        &stack.timers,
                        stack.cfg.send_buf,
                        tx,
                    );
                    Err(SockError::InProgress)
                }
                Protocol::Udp => {
                    entry.local = Some(local);
                    entry.remote = Some(addr);
                    entry.state = SockState::Established;
                    Ok(())
                }
            }
        })
    }

    /// Pops one completed handshake off the listener. Returns the new
    /// descriptor and the peer address. `WouldBlock` when none are pending;
    /// `NoDescriptors` when the table cannot hold the promotion.
    pub fn accept(&self, fd: RawFd) -> SockResult<(RawFd, SockAddr4)> {
        let pending = self.with_sock_io(fd, |entry, _gen, _tx| {
            let Some(listen) = entry.listen.as_mut() else {
                return Err(SockError::InvalidInput("socket is not listening"));
            };
            listen.ready.pop_front().ok_or(SockError::WouldBlock)
        })?;

        let stack = &self.stack;
        let tuple =
            AddrTuple { proto: Protocol::Tcp, local: pending.local, remote: pending.remote };
        let mut entry = SocketEntry::new(SockType::Stream, &stack.cfg, self.core);
        entry.state = SockState::Established;
        entry.local = Some(pending.local);
        entry.remote = Some(pending.remote);
        entry.rx = pending.rx;
        entry.conn = Some(pending.conn);
        entry.sync_readiness();

        match stack.fd.alloc(DescObj::Socket(entry)) {
            Ok((newfd, gen)) => {
                stack.index.repoint_conn(tuple, ConnRef { fd: newfd, gen });
                stack.register_core_socket(self.core, newfd);
                Ok((newfd, tuple.remote))
            }
            Err(DescObj::Socket(mut entry)) => {
                // Table full: park the handshake back at the head of the
                // queue; the caller sees a distinct error from WouldBlock.
                let restored = PendingConn {
                    local: tuple.local,
                    remote: tuple.remote,
                    conn: entry.conn.take().expect("promotion carried the record"),
                    rx: std::mem::replace(
                        &mut entry.rx,
                        crate::socket::RxQueue::new(0),
                    ),
                };
                let _ = stack.fd.with_socket(fd, |listener| {
                    if let Some(listen) = listener.listen.as_mut() {
                        listen.ready.push_front(restored);
                        Ok(())
                    } else {
                        Err(SockError::InvalidInput("listener vanished"))
                    }
                });
                Err(SockError::NoDescriptors)
            }
            Err(DescObj::Epoll(_)) => unreachable!("allocated object is a socket"),
        }
    }

    /// Stream/connected-datagram send. Only flag value 0 is accepted.
    pub fn send(&self, fd: RawFd, buf: &[u8], flags: u32) -> SockResult<usize> {
        if flags != 0 {
            return Err(SockError::InvalidInput("unsupported send flags"));
        }
        let now = self.stack.now();
        let stack_ip = self.stack.local_ip();
        self.with_sock_io(fd, |entry, _gen, tx| send_inner(entry, buf, None, stack_ip, now, tx))
    }

    pub fn write(&self, fd: RawFd, buf: &[u8]) -> SockResult<usize> {
        self.send(fd, buf, 0)
    }

    /// Gather send. Returns the byte count actually accepted, which may
    /// cover only a prefix of the iovecs.
    pub fn writev(&self, fd: RawFd, iovs: &[&[u8]]) -> SockResult<usize> {
        let now = self.stack.now();
        let stack_ip = self.stack.local_ip();
        self.with_sock_io(fd, |entry, _gen, tx| match entry.proto {
            Protocol::Tcp => {
                let mut total = 0;
                for iov in iovs {
                    match send_inner(entry, iov, None, stack_ip, now, tx) {
                        Ok(n) => {
                            total += n;
                            if n < iov.len() {
                                break;
                            }
                        }
                        Err(SockError::WouldBlock) if total > 0 => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(total)
            }
            Protocol::Udp => {
                // One datagram from the gathered iovecs.
                let flat: Vec<u8> = iovs.iter().flat_map(|s| s.iter().copied()).collect();
                send_inner(entry, &flat, None, stack_ip, now, tx)
            }
        })
    }

    /// Datagram send to an explicit destination; also usable on connected
    /// sockets when the destination matches the pinned peer.
    pub fn sendto(&self, fd: RawFd, buf: &[u8], flags: u32, dst: SockAddr4) -> SockResult<usize> {
        if flags != 0 {
            return Err(SockError::InvalidInput("unsupported send flags"));
        }
        let now = self.stack.now();
        self.with_sock_io(fd, |entry, gen, tx| {
            if entry.proto == Protocol::Udp && entry.local.is_none() {
                // Auto-bind, the way sendto on a fresh datagram socket does.
                let stack = &self.stack;
                let port = stack.ephemeral_port(Protocol::Udp)?;
                let local = SockAddr4 { ip: stack.local_ip(), port };
                stack.index.bind_listener(
                    Protocol::Udp,
                    local,
                    ConnRef { fd, gen },
                    entry.opts.reuse_port,
                    true,
                )?;
                entry.local = Some(local);
                entry.bound_key = Some(local);
                entry.state = SockState::Bound;
            }
            let stack_ip = self.stack.local_ip();
            send_inner(entry, buf, Some(dst), stack_ip, now, tx)
        })
    }

    /// Stream/datagram receive. Only `MSG_PEEK` is supported as a flag.
    pub fn recv(&self, fd: RawFd, buf: &mut [u8], flags: u32) -> SockResult<usize> {
        let peek = recv_flags(flags)?;
        self.with_sock_io(fd, |entry, _gen, tx| match entry.proto {
            Protocol::Tcp => entry.recv_stream(buf, peek, tx.pool()),
            Protocol::Udp => entry.recv_dgram(buf, peek, tx.pool()).map(|(n, _)| n),
        })
    }

    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> SockResult<usize> {
        self.recv(fd, buf, 0)
    }

    /// Scatter receive.
    pub fn readv(&self, fd: RawFd, iovs: &mut [&mut [u8]]) -> SockResult<usize> {
        self.with_sock_io(fd, |entry, _gen, tx| match entry.proto {
            Protocol::Tcp => {
                let mut total = 0;
                for iov in iovs.iter_mut() {
                    match entry.recv_stream(iov, false, tx.pool()) {
                        Ok(0) => break, // EOF or empty iov
                        Ok(n) => {
                            total += n;
                            if n < iov.len() {
                                break;
                            }
                        }
                        Err(SockError::WouldBlock) if total > 0 => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(total)
            }
            Protocol::Udp => {
                // One datagram scattered across the iovecs.
                let cap: usize = iovs.iter().map(|s| s.len()).sum();
                let mut flat = vec![0u8; cap];
                let (n, _) = entry.recv_dgram(&mut flat, false, tx.pool())?;
                let mut off = 0;
                for iov in iovs.iter_mut() {
                    if off >= n {
                        break;
                    }
                    let take = iov.len().min(n - off);
                    iov[..take].copy_from_slice(&flat[off..off + take]);
                    off += take;
                }
                Ok(n)
            }
        })
    }

    /// Datagram receive reporting the source address (for streams, the
    /// connected peer).
    pub fn recvfrom(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        flags: u32,
    ) -> SockResult<(usize, SockAddr4)> {
        let peek = recv_flags(flags)?;
        self.with_sock_io(fd, |entry, _gen, tx| match entry.proto {
            Protocol::Tcp => {
                let peer = entry.remote.unwrap_or(SockAddr4::UNSPECIFIED);
                entry.recv_stream(buf, peek, tx.pool()).map(|n| (n, peer))
            }
            Protocol::Udp => entry.recv_dgram(buf, peek, tx.pool()),
        })
    }

    /// Closes one or both directions without releasing the descriptor.
    pub fn shutdown(&self, fd: RawFd, how: ShutdownHow) -> SockResult<()> {
        let now = self.stack.now();
        self.with_sock_io(fd, |entry, _gen, tx| {
            let connected = match entry.proto {
                Protocol::Tcp => {
                    matches!(entry.state, SockState::Established | SockState::Closing)
                }
                Protocol::Udp => entry.remote.is_some(),
            };
            if !connected {
                return Err(SockError::NotConnected);
            }
            if matches!(how, ShutdownHow::Read | ShutdownHow::Both) {
                entry.shutdown_rd = true;
                entry.rx.drain_to_pool(tx.pool());
                if entry.state == SockState::Established {
                    entry.state = SockState::Closing;
                }
            }
            if matches!(how, ShutdownHow::Write | ShutdownHow::Both) {
                match entry.proto {
                    Protocol::Tcp => tcp::shutdown_write(entry, now, tx),
                    Protocol::Udp => entry.shutdown_wr = true,
                }
            }
            Ok(())
        })
    }

    /// Releases the descriptor: queued buffers return to the pool, every
    /// epoll registration is scrubbed, and the handle is invalid afterwards
    /// (a second close fails).
    pub fn close(&self, fd: RawFd) -> SockResult<()> {
        self.guard()?;
        self.stack.close_fd(self.core, fd)
    }

    /// Creates an epoll instance. `size` is a hint, as in the kernel API;
    /// zero is rejected.
    pub fn epoll_create(&self, size: usize) -> SockResult<RawFd> {
        self.guard()?;
        if size == 0 {
            return Err(SockError::InvalidInput("size must be positive"));
        }
        let (fd, _gen) = self
            .stack
            .fd
            .alloc(DescObj::Epoll(EpollInstance::new()))
            .map_err(|_| SockError::NoDescriptors)?;
        Ok(fd)
    }

    /// Registers, re-arms, or removes a socket on an epoll instance.
    /// Edge-triggered only: masks lacking `Interest::EDGE` are rejected.
    pub fn epoll_ctl(
        &self,
        epfd: RawFd,
        op: CtlOp,
        fd: RawFd,
        interest: Interest,
    ) -> SockResult<()> {
        self.guard()?;
        if epfd == fd {
            return Err(SockError::InvalidInput("epoll cannot watch itself"));
        }
        let stack = &self.stack;
        match op {
            CtlOp::Add => {
                let current = stack.fd.with_socket(fd, |entry| {
                    if entry.watchers.contains(&epfd) {
                        return Err(SockError::InvalidInput("fd already registered"));
                    }
                    entry.watchers.push(epfd);
                    Ok(entry.readiness)
                })?;
                let res = stack.fd.with_epoll(epfd, |ep| ep.add(fd, interest, current));
                if res.is_err() {
                    let _ = stack.fd.with_socket(fd, |entry| {
                        entry.watchers.retain(|w| *w != epfd);
                        Ok(())
                    });
                }
                res
            }
            CtlOp::Mod => {
                let current = stack.fd.with_socket(fd, |entry| {
                    if !entry.watchers.contains(&epfd) {
                        return Err(SockError::InvalidInput("fd not registered"));
                    }
                    Ok(entry.readiness)
                })?;
                stack.fd.with_epoll(epfd, |ep| ep.modify(fd, interest, current))
            }
            CtlOp::Del => {
                stack.fd.with_socket(fd, |entry| {
                    entry.watchers.retain(|w| *w != epfd);
                    Ok(())
                })?;
                stack.fd.with_epoll(epfd, |ep| ep.remove(fd))
            }
        }
    }

    /// Waits for edge-triggered events, cooperatively pumping this handle's
    /// poll pass. `timeout_ms`: -1 waits for an event, 0 polls once,
    /// positive bounds the wait. `maxevents` must be 1..=2048.
    pub fn epoll_wait(
        &self,
        epfd: RawFd,
        maxevents: usize,
        timeout_ms: i64,
    ) -> SockResult<Vec<EpollEvent>> {
        self.guard()?;
        self.stack.epoll_wait(self.core, epfd, maxevents, timeout_ms)
    }

    /// Sets an allow-listed option; anything else is `InvalidInput` and
    /// leaves the socket untouched.
    pub fn setsockopt(&self, fd: RawFd, level: i32, optname: i32, value: i32) -> SockResult<()> {
        self.guard()?;
        self.stack.fd.with_socket(fd, |entry| entry.apply_sockopt(level, optname, value))
    }

    /// Local address of a socket (wildcard until bound).
    pub fn getsockname(&self, fd: RawFd) -> SockResult<SockAddr4> {
        self.guard()?;
        self.stack
            .fd
            .with_socket(fd, |entry| Ok(entry.local.unwrap_or(SockAddr4::UNSPECIFIED)))
    }

    /// Peer address of a connected socket.
    pub fn getpeername(&self, fd: RawFd) -> SockResult<SockAddr4> {
        self.guard()?;
        self.stack.fd.with_socket(fd, |entry| {
            if !matches!(entry.state, SockState::Established | SockState::Closing) {
                return Err(SockError::NotConnected);
            }
            entry.remote.ok_or(SockError::NotConnected)
        })
    }
}

fn recv_flags(flags: u32) -> SockResult<bool> {
    match flags {
        0 => Ok(false),
        MSG_PEEK => Ok(true),
        _ => Err(SockError::InvalidInput("unsupported receive flags")),
    }
}

/// Send core shared by `send`/`sendto`/`writev`.
fn send_inner(
    entry: &mut SocketEntry,
    buf: &[u8],
    dst: Option<SockAddr4>,
    stack_ip: shunt_net::Ip4Addr,
    now: shunt_net::Ticks,
    tx: &mut TxSink<'_>,
) -> SockResult<usize> {
    match entry.proto {
        Protocol::Udp => {
            if entry.shutdown_wr {
                return Err(SockError::InvalidInput("write direction shut down"));
            }
            let dst = match (dst, entry.remote) {
                (Some(d), Some(peer)) if d != peer => {
                    return Err(SockError::AlreadyConnected);
                }
                (Some(d), _) => d,
                (None, Some(peer)) => peer,
                (None, None) => return Err(SockError::NotConnected),
            };
            let local = entry.local.ok_or(SockError::InvalidInput("socket not bound"))?;
            let local = SockAddr4 {
                // Wildcard binds transmit from the stack's address.
                ip: if local.ip.is_unspecified() { stack_ip } else { local.ip },
                port: local.port,
            };
            crate::udp::send_dgram(local, dst, buf, tx)
        }
        Protocol::Tcp => {
            if let Some(err) = entry.err {
                return Err(err);
            }
            if let Some(d) = dst {
                if entry.remote != Some(d) {
                    return Err(SockError::AlreadyConnected);
                }
            }
            match entry.state {
                SockState::Established | SockState::Closing => {}
                SockState::Connecting => return Err(SockError::WouldBlock),
                _ => return Err(SockError::NotConnected),
            }
            if entry.shutdown_wr {
                return Err(SockError::InvalidInput("write direction shut down"));
            }
            let conn = entry.conn.as_mut().expect("connected socket has a record");
            let n = conn.enqueue(buf);
            if n == 0 && !buf.is_empty() {
                return Err(SockError::WouldBlock);
            }
            tcp::transmit(entry, now, tx);
            Ok(n)
        }
    }
}
