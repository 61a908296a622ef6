// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic in-memory backends for host tests.
//!
//! Scope: contract validation and engine tests. None of this is a
//! performance model; queues are unbounded mailboxes and the clock only
//! moves when a test moves it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::PktBuf;
use crate::{KernelBridge, NetPort, PacketPool, SockResult, TickSource, Ticks};

type FrameQueue = Arc<Mutex<Vec<PktBuf>>>;

/// In-memory poll-mode port. `pair` wires two ports back to back (A's tx is
/// B's rx); `loopback` wires a port to itself.
pub struct FakeNic {
    id: u16,
    rx: FrameQueue,
    tx: FrameQueue,
}

impl FakeNic {
    /// Two ports connected like a cable: frames sent on one arrive on the
    /// other in order.
    pub fn pair(id_a: u16, id_b: u16) -> (FakeNic, FakeNic) {
        let a_to_b: FrameQueue = Arc::new(Mutex::new(Vec::new()));
        let b_to_a: FrameQueue = Arc::new(Mutex::new(Vec::new()));
        (
            FakeNic { id: id_a, rx: Arc::clone(&b_to_a), tx: Arc::clone(&a_to_b) },
            FakeNic { id: id_b, rx: a_to_b, tx: b_to_a },
        )
    }

    /// A port whose transmissions come straight back as receptions.
    pub fn loopback(id: u16) -> FakeNic {
        let q: FrameQueue = Arc::new(Mutex::new(Vec::new()));
        FakeNic { id, rx: Arc::clone(&q), tx: q }
    }

    /// Frames waiting on the receive side (test visibility).
    pub fn rx_pending(&self) -> usize {
        self.rx.lock().len()
    }
}

impl NetPort for FakeNic {
    fn port_id(&self) -> u16 {
        self.id
    }

    fn rx_burst(&mut self, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let mut rx = self.rx.lock();
        let n = rx.len().min(max);
        out.extend(rx.drain(..n));
        n
    }

    fn tx_burst(&mut self, frames: &mut Vec<PktBuf>) -> usize {
        let mut tx = self.tx.lock();
        let n = frames.len();
        tx.append(frames);
        n
    }
}

/// Kernel-bridge fake: records every forwarded frame's payload and returns
/// the buffer to the pool immediately, so buffer accounting stays balanced
/// in tests. Clones share state, so a test can keep one handle while the
/// stack owns the other.
#[derive(Clone)]
pub struct FakeBridge {
    pool: Arc<dyn PacketPool>,
    ports: Arc<Mutex<Vec<u16>>>,
    forwarded: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    runs: Arc<AtomicUsize>,
}

impl FakeBridge {
    pub fn new(pool: Arc<dyn PacketPool>) -> Self {
        Self {
            pool,
            ports: Arc::new(Mutex::new(Vec::new())),
            forwarded: Arc::new(Mutex::new(Vec::new())),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every frame handed over so far, as `(port, payload)` copies.
    pub fn forwarded(&self) -> Vec<(u16, Vec<u8>)> {
        self.forwarded.lock().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl KernelBridge for FakeBridge {
    fn configure(&mut self, ports: &[u16]) -> SockResult<()> {
        *self.ports.lock() = ports.to_vec();
        Ok(())
    }

    fn run(&mut self, _core: usize) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn send_burst(&mut self, port: u16, frames: Vec<PktBuf>) -> usize {
        let n = frames.len();
        let mut log = self.forwarded.lock();
        for frame in frames {
            log.push((port, frame.bytes().to_vec()));
            self.pool.free(frame);
        }
        n
    }

    fn bridge_id(&self, port: u16) -> Option<u16> {
        self.ports.lock().iter().position(|p| *p == port).map(|i| i as u16)
    }
}

/// Manual clock. `advance` moves time; an optional `autostep` advances it on
/// every read, which keeps deadline-driven waits finite in single-threaded
/// tests.
pub struct ManualTicks {
    now: AtomicU64,
    autostep: u64,
}

impl ManualTicks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { now: AtomicU64::new(0), autostep: 0 })
    }

    pub fn with_autostep(step_ms: u64) -> Arc<Self> {
        Arc::new(Self { now: AtomicU64::new(0), autostep: step_ms })
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    fn now_ms(&self) -> Ticks {
        self.now.fetch_add(self.autostep, Ordering::SeqCst)
    }
}
