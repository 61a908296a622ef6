// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inbound packet classification.
//!
//! The tuple index is sharded by tuple hash; a dispatcher core touches one
//! shard lock per packet and, in the steady state, only the shard its RSS
//! slice hashes into. Listener lookups are a second, read-mostly table.
//! Values are generation-counted `ConnRef`s, so the index never dangles: a
//! closed descriptor's entries fail the generation check at resolve time.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use shunt_net::{Ip4Addr, Protocol, RawFd, SockAddr4, SockError, SockResult};

/// The classification key: one active connection per tuple per protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AddrTuple {
    pub proto: Protocol,
    pub local: SockAddr4,
    pub remote: SockAddr4,
}

/// Generation-counted descriptor reference held by the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnRef {
    pub fd: RawFd,
    pub gen: u32,
}

/// Result of classifying one inbound packet. Consumed exhaustively by the
/// dispatcher; there is no fourth case.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classify {
    /// Exact tuple match: an active connection (or a listener currently
    /// holding this tuple in its pending queue).
    Matched(ConnRef),
    /// No exact match, but a bound/listening socket covers the local side.
    MatchedListener(ConnRef),
    /// Nobody here wants it: kernel-bridge traffic.
    Unclassified,
}

/// Index mutations produced by protocol handlers while a socket slot is
/// locked; the caller applies them after releasing the slot, keeping the
/// lock order (socket slot before index shard) one-way.
#[derive(Debug, Default)]
pub struct IndexOps {
    pub add: Vec<(AddrTuple, ConnRef)>,
    pub del: Vec<AddrTuple>,
}

impl IndexOps {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.del.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ListenKey {
    proto: Protocol,
    ip: Ip4Addr,
    port: u16,
}

#[derive(Clone, Copy, Debug)]
struct ListenSlot {
    re: ConnRef,
    reuse: bool,
    /// UDP binds receive immediately; TCP binds only after `listen`.
    ready: bool,
}

pub struct TupleIndex {
    shards: Box<[Mutex<HashMap<AddrTuple, ConnRef>>]>,
    listeners: Mutex<HashMap<ListenKey, Vec<ListenSlot>>>,
}

fn hash_tuple(tuple: &AddrTuple) -> u64 {
    let mut h = DefaultHasher::new();
    tuple.hash(&mut h);
    h.finish()
}

impl TupleIndex {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, tuple: &AddrTuple) -> &Mutex<HashMap<AddrTuple, ConnRef>> {
        let idx = (hash_tuple(tuple) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Registers an exact tuple. Fails when another live connection owns it.
    pub fn insert_conn(&self, tuple: AddrTuple, re: ConnRef) -> SockResult<()> {
        let mut shard = self.shard(&tuple).lock();
        if shard.contains_key(&tuple) {
            return Err(SockError::AddrInUse);
        }
        shard.insert(tuple, re);
        Ok(())
    }

    /// Repoints an exact tuple (pending-connection promotion at accept).
    pub fn repoint_conn(&self, tuple: AddrTuple, re: ConnRef) {
        self.shard(&tuple).lock().insert(tuple, re);
    }

    pub fn remove_conn(&self, tuple: &AddrTuple) {
        self.shard(tuple).lock().remove(tuple);
    }

    /// Claims a listen key. All claimants must opt into reuse-port for the
    /// key to be shared.
    pub fn bind_listener(
        &self,
        proto: Protocol,
        local: SockAddr4,
        re: ConnRef,
        reuse: bool,
        ready: bool,
    ) -> SockResult<()> {
        let key = ListenKey { proto, ip: local.ip, port: local.port };
        let mut listeners = self.listeners.lock();
        let slots = listeners.entry(key).or_default();
        if !slots.is_empty() && !(reuse && slots.iter().all(|s| s.reuse)) {
            return Err(SockError::AddrInUse);
        }
        slots.push(ListenSlot { re, reuse, ready });
        Ok(())
    }

    /// Marks a bound TCP socket as accepting (post-`listen`).
    pub fn set_listener_ready(&self, proto: Protocol, local: SockAddr4, fd: RawFd) {
        let key = ListenKey { proto, ip: local.ip, port: local.port };
        if let Some(slots) = self.listeners.lock().get_mut(&key) {
            for slot in slots.iter_mut().filter(|s| s.re.fd == fd) {
                slot.ready = true;
            }
        }
    }

    pub fn unbind_listener(&self, proto: Protocol, local: SockAddr4, fd: RawFd) {
        let key = ListenKey { proto, ip: local.ip, port: local.port };
        let mut listeners = self.listeners.lock();
        if let Some(slots) = listeners.get_mut(&key) {
            slots.retain(|s| s.re.fd != fd);
            if slots.is_empty() {
                listeners.remove(&key);
            }
        }
    }

    /// True when any socket has claimed the (proto, ip, port) key; used for
    /// ephemeral-port allocation.
    pub fn port_claimed(&self, proto: Protocol, ip: Ip4Addr, port: u16) -> bool {
        let listeners = self.listeners.lock();
        listeners.contains_key(&ListenKey { proto, ip, port })
            || listeners.contains_key(&ListenKey { proto, ip: Ip4Addr::UNSPECIFIED, port })
    }

    /// Classifies one inbound tuple. Exact connection match beats a
    /// listener; an exact-ip listener beats a wildcard one; reuse-port
    /// groups spread by tuple hash.
    pub fn classify(&self, tuple: &AddrTuple) -> Classify {
        if let Some(re) = self.shard(tuple).lock().get(tuple) {
            return Classify::Matched(*re);
        }
        let listeners = self.listeners.lock();
        for ip in [tuple.local.ip, Ip4Addr::UNSPECIFIED] {
            let key = ListenKey { proto: tuple.proto, ip, port: tuple.local.port };
            if let Some(slots) = listeners.get(&key) {
                let ready: Vec<&ListenSlot> = slots.iter().filter(|s| s.ready).collect();
                if !ready.is_empty() {
                    let pick = (hash_tuple(tuple) as usize) % ready.len();
                    return Classify::MatchedListener(ready[pick].re);
                }
            }
        }
        Classify::Unclassified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(lport: u16, rport: u16) -> AddrTuple {
        AddrTuple {
            proto: Protocol::Tcp,
            local: SockAddr4::new([10, 0, 0, 1], lport),
            remote: SockAddr4::new([10, 0, 0, 2], rport),
        }
    }

    #[test]
    fn exact_match_beats_wildcard_listener() {
        let index = TupleIndex::new(4);
        let listener = ConnRef { fd: 1, gen: 0 };
        let conn = ConnRef { fd: 2, gen: 0 };
        index
            .bind_listener(
                Protocol::Tcp,
                SockAddr4::new([0, 0, 0, 0], 9000),
                listener,
                false,
                true,
            )
            .unwrap();
        index.insert_conn(tuple(9000, 5555), conn).unwrap();

        assert_eq!(index.classify(&tuple(9000, 5555)), Classify::Matched(conn));
        assert_eq!(
            index.classify(&tuple(9000, 6666)),
            Classify::MatchedListener(listener)
        );
    }

    #[test]
    fn no_match_is_unclassified() {
        let index = TupleIndex::new(2);
        assert_eq!(index.classify(&tuple(80, 1024)), Classify::Unclassified);
    }

    #[test]
    fn duplicate_tuple_rejected() {
        let index = TupleIndex::new(2);
        let re = ConnRef { fd: 3, gen: 1 };
        index.insert_conn(tuple(80, 1000), re).unwrap();
        assert_eq!(
            index.insert_conn(tuple(80, 1000), ConnRef { fd: 4, gen: 0 }),
            Err(SockError::AddrInUse)
        );
    }

    #[test]
    fn listen_key_requires_mutual_reuse() {
        let index = TupleIndex::new(2);
        let local = SockAddr4::new([10, 0, 0, 1], 7000);
        index
            .bind_listener(Protocol::Udp, local, ConnRef { fd: 1, gen: 0 }, false, true)
            .unwrap();
        assert_eq!(
            index.bind_listener(Protocol::Udp, local, ConnRef { fd: 2, gen: 0 }, true, true),
            Err(SockError::AddrInUse)
        );

        let shared = SockAddr4::new([10, 0, 0, 1], 7001);
        index
            .bind_listener(Protocol::Udp, shared, ConnRef { fd: 3, gen: 0 }, true, true)
            .unwrap();
        index
            .bind_listener(Protocol::Udp, shared, ConnRef { fd: 4, gen: 0 }, true, true)
            .unwrap();
    }

    #[test]
    fn tcp_bind_is_invisible_until_listen() {
        let index = TupleIndex::new(2);
        let local = SockAddr4::new([10, 0, 0, 1], 8080);
        let re = ConnRef { fd: 5, gen: 0 };
        index.bind_listener(Protocol::Tcp, local, re, false, false).unwrap();
        assert_eq!(index.classify(&tuple(8080, 4444)), Classify::Unclassified);

        index.set_listener_ready(Protocol::Tcp, local, 5);
        assert_eq!(
            index.classify(&tuple(8080, 4444)),
            Classify::MatchedListener(re)
        );
    }

    #[test]
    fn unbind_clears_the_key() {
        let index = TupleIndex::new(2);
        let local = SockAddr4::new([10, 0, 0, 1], 6000);
        index
            .bind_listener(Protocol::Udp, local, ConnRef { fd: 9, gen: 2 }, false, true)
            .unwrap();
        assert!(index.port_claimed(Protocol::Udp, local.ip, 6000));
        index.unbind_listener(Protocol::Udp, local, 9);
        assert!(!index.port_claimed(Protocol::Udp, local.ip, 6000));
    }
}
