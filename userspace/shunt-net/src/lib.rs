// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-bypass sockets contract crate (types, errors, collaborator traits)
//! OWNERS: @fastpath
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - SockError: cross-crate error model with errno-compatible codes
//!   - Ip4Addr/SockAddr4: IPv4 address types used on the fast path
//!   - Interest/Readiness/EpollEvent: edge-triggered notification contract
//!   - Collaborator traits: PacketPool, NetPort, KernelBridge, TickSource
//!   - pool::{PktBuf, HeapPool}: packet buffer handle + host pool backend
//!   - fake::{FakeNic, FakeBridge, ManualTicks}: deterministic host backends
//!
//! The engine crate (`shunt-sock`) owns all socket semantics; everything here
//! is the boundary it shares with applications, drivers, and tests.

#![forbid(unsafe_code)]

use core::fmt;

use thiserror::Error;

pub mod fake;
pub mod pool;

pub use pool::{HeapPool, PktBuf};

/// Monotonic milliseconds used for every deadline in the stack.
pub type Ticks = u64;

/// Raw descriptor handle as seen by applications.
pub type RawFd = i32;

/// Hard cap on `epoll_wait` maxevents, matching the public API contract.
pub const MAX_EPOLL_EVENTS: usize = 2048;

/// Default listen backlog when the caller passes 0.
pub const DEFAULT_BACKLOG: usize = 2048;

/// Receive flag: peek at queued data without consuming it. The only
/// supported receive flag.
pub const MSG_PEEK: u32 = 0x2;

/// IPv4 address in network byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ip4Addr(pub [u8; 4]);

impl Ip4Addr {
    /// The wildcard address `0.0.0.0`.
    pub const UNSPECIFIED: Ip4Addr = Ip4Addr([0; 4]);

    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Display for Ip4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// IPv4 socket address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SockAddr4 {
    pub ip: Ip4Addr,
    pub port: u16,
}

impl SockAddr4 {
    /// The wildcard address `0.0.0.0:0`.
    pub const UNSPECIFIED: SockAddr4 = SockAddr4 { ip: Ip4Addr::UNSPECIFIED, port: 0 };

    pub fn new(ip: [u8; 4], port: u16) -> Self {
        Self { ip: Ip4Addr(ip), port }
    }
}

impl fmt::Display for SockAddr4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Transport protocol carried by a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Address domain. Only IPv4 is supported by the fast path today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Domain {
    Inet,
}

/// Socket type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
}

/// Shutdown direction selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

/// `epoll_ctl` operation selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtlOp {
    Add,
    Mod,
    Del,
}

bitflags::bitflags! {
    /// Interest flags for epoll registrations. Bit layout matches the POSIX
    /// epoll constants so callers ported from the C surface keep their masks.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u32 {
        /// EPOLLIN
        const READABLE = 0x001;
        /// EPOLLOUT
        const WRITABLE = 0x004;
        /// EPOLLERR (always reported, never required in the mask)
        const ERROR = 0x008;
        /// EPOLLHUP (always reported, never required in the mask)
        const HUP = 0x010;
        /// EPOLLET. Mandatory: only edge-triggered registrations exist.
        const EDGE = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Readiness condition of a socket, delivered through epoll events.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READABLE = 0x001;
        const WRITABLE = 0x004;
        const ERROR = 0x008;
        const HUP = 0x010;
    }
}

impl Readiness {
    /// Restricts a readiness set to what an interest mask asked for.
    /// ERROR and HUP are always delivered, matching epoll semantics.
    pub fn masked_by(self, interest: Interest) -> Readiness {
        let wanted = Readiness::from_bits_truncate(interest.bits())
            | Readiness::ERROR
            | Readiness::HUP;
        self & wanted
    }
}

/// One delivered readiness event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EpollEvent {
    pub fd: RawFd,
    pub events: Readiness,
}

/// Error model shared by every public operation.
///
/// `WouldBlock` and `InProgress` are flow-control signals, not failures;
/// callers re-poll via the epoll engine. Everything else is a hard error for
/// the operation (and for `ConnReset`/`TimedOut`, for the connection).
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SockError {
    /// Operation cannot complete without waiting; retry after readiness.
    #[error("operation would block")]
    WouldBlock,
    /// Asynchronous connect accepted; completion arrives via readiness.
    #[error("operation now in progress")]
    InProgress,
    /// Descriptor is not live in the calling context's table.
    #[error("bad descriptor")]
    BadDescriptor,
    /// Caller misuse (address, length, flag, or state).
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// Local address/port already bound without reuse.
    #[error("address in use")]
    AddrInUse,
    /// Requested local address is not owned by this stack.
    #[error("address not available")]
    AddrNotAvail,
    /// Operation requires an established connection.
    #[error("not connected")]
    NotConnected,
    /// Socket is already connected or connecting.
    #[error("already connected")]
    AlreadyConnected,
    /// Peer refused the connection (RST during handshake).
    #[error("connection refused")]
    ConnRefused,
    /// Peer reset an established connection.
    #[error("connection reset by peer")]
    ConnReset,
    /// Retransmission or keepalive gave up on the peer.
    #[error("connection timed out")]
    TimedOut,
    /// Packet-buffer pool exhausted.
    #[error("no buffer space available")]
    NoBufs,
    /// Descriptor table full.
    #[error("descriptor table exhausted")]
    NoDescriptors,
    /// Operation not supported by this socket layer.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// Handle belongs to another process image (inherited across fork) or
    /// to a torn-down stack.
    #[error("stale stack context")]
    StaleContext,
}

impl SockError {
    /// errno-compatible code for the C-shaped surface.
    pub fn errno(&self) -> i32 {
        match self {
            SockError::WouldBlock => 11,        // EAGAIN
            SockError::InProgress => 115,       // EINPROGRESS
            SockError::BadDescriptor => 9,      // EBADF
            SockError::InvalidInput(_) => 22,   // EINVAL
            SockError::AddrInUse => 98,         // EADDRINUSE
            SockError::AddrNotAvail => 99,      // EADDRNOTAVAIL
            SockError::NotConnected => 107,     // ENOTCONN
            SockError::AlreadyConnected => 106, // EISCONN
            SockError::ConnRefused => 111,      // ECONNREFUSED
            SockError::ConnReset => 104,        // ECONNRESET
            SockError::TimedOut => 110,         // ETIMEDOUT
            SockError::NoBufs => 105,           // ENOBUFS
            SockError::NoDescriptors => 24,     // EMFILE
            SockError::NotSupported(_) => 95,   // EOPNOTSUPP
            SockError::StaleContext => 1,       // EPERM
        }
    }
}

/// Result alias used across the workspace.
pub type SockResult<T> = Result<T, SockError>;

/// Validates an `epoll_wait` maxevents argument against the contract.
pub fn validate_maxevents(maxevents: usize) -> SockResult<()> {
    if maxevents == 0 || maxevents > MAX_EPOLL_EVENTS {
        return Err(SockError::InvalidInput("maxevents out of range"));
    }
    Ok(())
}

/// Monotonic clock the stack reads for every timer and deadline. Passing the
/// clock in (instead of reading wall time inline) keeps every timer path
/// deterministic under test.
pub trait TickSource: Send + Sync {
    fn now_ms(&self) -> Ticks;
}

/// Host clock: milliseconds since stack creation.
pub struct SystemTicks {
    origin: std::time::Instant,
}

impl SystemTicks {
    pub fn new() -> Self {
        Self { origin: std::time::Instant::now() }
    }
}

impl Default for SystemTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for SystemTicks {
    fn now_ms(&self) -> Ticks {
        self.origin.elapsed().as_millis() as Ticks
    }
}

/// Fixed-size packet-buffer pool. The provisioning side (hugepages, shared
/// memory) lives outside this workspace; the engine only borrows and returns
/// handles, and must return every handle exactly once.
pub trait PacketPool: Send + Sync {
    /// Borrows a buffer, or `None` when the pool is exhausted (the engine
    /// surfaces that as `WouldBlock`/`NoBufs`, never by blocking).
    fn alloc(&self) -> Option<PktBuf>;
    /// Returns a borrowed buffer.
    fn free(&self, buf: PktBuf);
    /// Number of buffers currently borrowed. Test harnesses assert this
    /// returns to zero after teardown.
    fn outstanding(&self) -> usize;
}

/// Poll-mode network port boundary. The real driver polls hardware queues;
/// the contract is a burst interface with no blocking and no interrupts.
pub trait NetPort: Send {
    fn port_id(&self) -> u16;
    /// Moves up to `max` received frames into `out`; returns how many.
    fn rx_burst(&mut self, out: &mut Vec<PktBuf>, max: usize) -> usize;
    /// Transmits the queued frames, draining `frames`; returns how many were
    /// accepted by the port (the rest are dropped by the port, which owns
    /// returning them to the pool).
    fn tx_burst(&mut self, frames: &mut Vec<PktBuf>) -> usize;
}

/// Kernel-bridge boundary: the slow path that hands frames the fast path
/// does not understand to the host kernel through a virtual device.
pub trait KernelBridge: Send {
    /// Wires the bridge to the set of physical ports at stack init.
    fn configure(&mut self, ports: &[u16]) -> SockResult<()>;
    /// Per-core drain, invoked once per poll pass.
    fn run(&mut self, core: usize);
    /// Hands a burst of unclassified frames to the bridge for `port`.
    /// The bridge takes ownership; returns how many it accepted.
    fn send_burst(&mut self, port: u16, frames: Vec<PktBuf>) -> usize;
    /// Bridge identifier for a physical port, if one is configured.
    fn bridge_id(&self, port: u16) -> Option<u16>;
}
