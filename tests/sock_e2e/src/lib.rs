// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end harness: two full stacks cabled back to back through fake
//! poll-mode ports, each with its own pool, bridge, and manual clock. Every
//! scenario runs deterministically on the host; no driver, no kernel.

use std::sync::Arc;

use shunt_net::fake::{FakeBridge, FakeNic, ManualTicks};
use shunt_net::{HeapPool, PacketPool, SockAddr4};
use shunt_sock::{Stack, StackConfig};

pub const IP_A: [u8; 4] = [10, 0, 0, 1];
pub const IP_B: [u8; 4] = [10, 0, 0, 2];

pub struct Lane {
    pub stack: Arc<Stack>,
    /// Shared with the peer lane: frames cross stacks, so borrow accounting
    /// only balances on a pool both ends return into (exactly how a shared
    /// hugepage mbuf pool behaves).
    pub pool: Arc<HeapPool>,
    pub bridge: FakeBridge,
    /// Outside end of a second port on this lane; tests inject raw frames
    /// here to exercise the bridge fallback.
    tap: FakeNic,
}

impl Lane {
    fn new(ip: [u8; 4], pool: Arc<HeapPool>, nic: FakeNic, tap_port_id: u16) -> Self {
        let bridge = FakeBridge::new(pool.clone() as Arc<dyn PacketPool>);
        let (tap_outside, tap_inside) = FakeNic::pair(tap_port_id, tap_port_id + 1);
        let cfg = StackConfig {
            local_ip: ip,
            rto_initial_ms: 100,
            ..StackConfig::default()
        };
        let stack = Stack::init(
            cfg,
            pool.clone() as Arc<dyn PacketPool>,
            vec![Box::new(nic), Box::new(tap_inside)],
            Box::new(bridge.clone()),
            ManualTicks::with_autostep(1),
        )
        .expect("stack init");
        Self { stack, pool, bridge, tap: tap_outside }
    }

    pub fn poll(&self) {
        self.stack.poll_core(0);
    }

    /// Pushes a raw frame into this lane's second port.
    pub fn inject(&mut self, bytes: &[u8]) {
        use shunt_net::NetPort;
        let mut buf = self.pool.alloc().expect("pool");
        assert!(buf.append(bytes));
        self.tap.tx_burst(&mut vec![buf]);
    }
}

/// Two stacks joined by a cable: `a` owns `IP_A`, `b` owns `IP_B`.
pub fn linked_pair() -> (Lane, Lane) {
    let pool = Arc::new(HeapPool::new(1024, 2048));
    let (nic_a, nic_b) = FakeNic::pair(0, 1);
    (
        Lane::new(IP_A, pool.clone(), nic_a, 10),
        Lane::new(IP_B, pool, nic_b, 20),
    )
}

/// Alternates poll passes so traffic progresses in both directions.
pub fn pump(a: &Lane, b: &Lane, passes: usize) {
    for _ in 0..passes {
        a.poll();
        b.poll();
    }
}

pub fn at(ip: [u8; 4], port: u16) -> SockAddr4 {
    SockAddr4::new(ip, port)
}
