// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Egress staging: protocol handlers build frames into a `TxSink` while the
//! socket slot is locked; the poll loop flushes the staged frames to the
//! port after the lock is released. Keeps port locks out of the FSM and
//! makes every handler testable without a driver.

use shunt_net::{PacketPool, PktBuf, SockAddr4};

use crate::wire::{self, WireCfg};

pub struct TxSink<'a> {
    cfg: WireCfg,
    pool: &'a dyn PacketPool,
    pub frames: Vec<PktBuf>,
}

impl<'a> TxSink<'a> {
    pub fn new(cfg: WireCfg, pool: &'a dyn PacketPool) -> Self {
        Self { cfg, pool, frames: Vec::new() }
    }

    pub fn pool(&self) -> &'a dyn PacketPool {
        self.pool
    }

    /// Stages a TCP segment. Returns false when no buffer is available or
    /// the segment does not fit; the caller treats that as deferred work,
    /// never as an error.
    #[allow(clippy::too_many_arguments)]
    pub fn send_tcp(
        &mut self,
        src: SockAddr4,
        dst: SockAddr4,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload: &[u8],
    ) -> bool {
        let Some(mut buf) = self.pool.alloc() else {
            return false;
        };
        if !wire::build_tcp_frame(&self.cfg, src, dst, seq, ack, flags, window, payload, &mut buf)
        {
            self.pool.free(buf);
            return false;
        }
        self.frames.push(buf);
        true
    }

    /// Stages a UDP datagram; same deferred-on-false contract as `send_tcp`.
    pub fn send_udp(&mut self, src: SockAddr4, dst: SockAddr4, payload: &[u8]) -> bool {
        let Some(mut buf) = self.pool.alloc() else {
            return false;
        };
        if !wire::build_udp_frame(&self.cfg, src, dst, payload, &mut buf) {
            self.pool.free(buf);
            return false;
        }
        self.frames.push(buf);
        true
    }

    /// Returns a consumed inbound frame to the pool.
    pub fn free(&self, buf: PktBuf) {
        self.pool.free(buf);
    }
}
