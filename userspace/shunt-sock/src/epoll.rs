// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Epoll emulation: interest registrations plus a collapsing, edge-triggered
//! ready queue. No kernel primitive is involved anywhere; "blocking" waits
//! are realized by the caller re-running the poll pass until the queue fills
//! or the deadline passes (see `stack.rs`).
//!
//! Only edge-triggered registrations are accepted. Events enter the queue
//! exclusively through `push`, which the stack calls with *rising* readiness
//! edges; a condition that persists unchanged is never re-queued.

use std::collections::{HashMap, VecDeque};

use shunt_net::{EpollEvent, Interest, RawFd, Readiness, SockError, SockResult};

pub struct EpollInstance {
    interests: HashMap<RawFd, Interest>,
    /// Collapsed pending flags per fd; `order` preserves first-edge order
    /// and holds each fd at most once.
    pending: HashMap<RawFd, Readiness>,
    order: VecDeque<RawFd>,
}

impl EpollInstance {
    pub fn new() -> Self {
        Self { interests: HashMap::new(), pending: HashMap::new(), order: VecDeque::new() }
    }

    pub fn watched(&self, fd: RawFd) -> bool {
        self.interests.contains_key(&fd)
    }

    fn require_edge(interest: Interest) -> SockResult<()> {
        if !interest.contains(Interest::EDGE) {
            return Err(SockError::InvalidInput("only edge-triggered registrations supported"));
        }
        Ok(())
    }

    /// Registers a socket. `current` is the socket's readiness at
    /// registration time: a condition that is already true seeds one event,
    /// otherwise a socket that became ready before registration would never
    /// produce an edge.
    pub fn add(&mut self, fd: RawFd, interest: Interest, current: Readiness) -> SockResult<()> {
        Self::require_edge(interest)?;
        if self.interests.contains_key(&fd) {
            return Err(SockError::InvalidInput("fd already registered"));
        }
        self.interests.insert(fd, interest);
        let seed = current.masked_by(interest);
        if !seed.is_empty() {
            self.enqueue(fd, seed);
        }
        Ok(())
    }

    /// Replaces the interest mask; re-seeds from current readiness so a
    /// newly requested condition that already holds is reported once.
    pub fn modify(&mut self, fd: RawFd, interest: Interest, current: Readiness) -> SockResult<()> {
        Self::require_edge(interest)?;
        let slot = self
            .interests
            .get_mut(&fd)
            .ok_or(SockError::InvalidInput("fd not registered"))?;
        let previous = *slot;
        *slot = interest;
        let newly_wanted = interest.difference(previous);
        let seed = current.masked_by(newly_wanted);
        if !seed.is_empty() {
            self.enqueue(fd, seed);
        }
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> SockResult<()> {
        self.interests
            .remove(&fd)
            .ok_or(SockError::InvalidInput("fd not registered"))?;
        self.discard(fd);
        Ok(())
    }

    /// Drops every trace of a closing socket (no stale events may surface
    /// after close).
    pub fn forget(&mut self, fd: RawFd) {
        self.interests.remove(&fd);
        self.discard(fd);
    }

    fn discard(&mut self, fd: RawFd) {
        if self.pending.remove(&fd).is_some() {
            self.order.retain(|f| *f != fd);
        }
    }

    fn enqueue(&mut self, fd: RawFd, flags: Readiness) {
        match self.pending.get_mut(&fd) {
            Some(merged) => *merged |= flags,
            None => {
                self.pending.insert(fd, flags);
                self.order.push_back(fd);
            }
        }
    }

    /// Accepts rising readiness edges for a watched socket. Unwatched fds
    /// and masked-out flags are ignored.
    pub fn push(&mut self, fd: RawFd, edges: Readiness) {
        let Some(interest) = self.interests.get(&fd) else {
            return;
        };
        let flags = edges.masked_by(*interest);
        if !flags.is_empty() {
            self.enqueue(fd, flags);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.order.is_empty()
    }

    /// Moves up to `max` collapsed events out. One event per socket per
    /// drain, flags merged.
    pub fn drain(&mut self, max: usize, out: &mut Vec<EpollEvent>) -> usize {
        let n = self.order.len().min(max);
        for _ in 0..n {
            let fd = self.order.pop_front().expect("order non-empty");
            let events = self.pending.remove(&fd).expect("pending entry exists");
            out.push(EpollEvent { fd, events });
        }
        n
    }
}

impl Default for EpollInstance {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ET_IN: Interest = Interest::READABLE.union(Interest::EDGE);

    #[test]
    fn level_triggered_registration_is_rejected() {
        let mut ep = EpollInstance::new();
        assert_eq!(
            ep.add(3, Interest::READABLE, Readiness::empty()),
            Err(SockError::InvalidInput("only edge-triggered registrations supported"))
        );
    }

    #[test]
    fn edge_is_delivered_once_and_collapsed() {
        let mut ep = EpollInstance::new();
        ep.add(3, ET_IN | Interest::WRITABLE, Readiness::empty()).unwrap();

        ep.push(3, Readiness::READABLE);
        ep.push(3, Readiness::WRITABLE);

        let mut out = Vec::new();
        assert_eq!(ep.drain(16, &mut out), 1);
        assert_eq!(out[0].fd, 3);
        assert_eq!(out[0].events, Readiness::READABLE | Readiness::WRITABLE);

        // queue is now empty; nothing is re-emitted for a persisting state
        out.clear();
        assert_eq!(ep.drain(16, &mut out), 0);
    }

    #[test]
    fn add_seeds_from_already_ready_socket() {
        let mut ep = EpollInstance::new();
        ep.add(7, ET_IN, Readiness::READABLE).unwrap();
        let mut out = Vec::new();
        assert_eq!(ep.drain(4, &mut out), 1);
        assert_eq!(out[0].events, Readiness::READABLE);
    }

    #[test]
    fn interest_mask_filters_but_error_passes() {
        let mut ep = EpollInstance::new();
        ep.add(1, ET_IN, Readiness::empty()).unwrap();
        ep.push(1, Readiness::WRITABLE);
        assert!(!ep.has_pending());
        ep.push(1, Readiness::ERROR);
        assert!(ep.has_pending());
    }

    #[test]
    fn modify_reseeds_only_newly_wanted_bits() {
        let mut ep = EpollInstance::new();
        ep.add(5, ET_IN, Readiness::READABLE | Readiness::WRITABLE).unwrap();
        let mut out = Vec::new();
        ep.drain(4, &mut out); // consume the READABLE seed

        ep.modify(5, ET_IN | Interest::WRITABLE, Readiness::READABLE | Readiness::WRITABLE)
            .unwrap();
        out.clear();
        assert_eq!(ep.drain(4, &mut out), 1);
        assert_eq!(out[0].events, Readiness::WRITABLE);
    }

    #[test]
    fn forget_drops_pending_events() {
        let mut ep = EpollInstance::new();
        ep.add(9, ET_IN, Readiness::empty()).unwrap();
        ep.push(9, Readiness::READABLE);
        ep.forget(9);
        assert!(!ep.has_pending());
        assert!(!ep.watched(9));
    }

    #[test]
    fn drain_respects_max_and_order() {
        let mut ep = EpollInstance::new();
        for fd in 0..4 {
            ep.add(fd, ET_IN, Readiness::empty()).unwrap();
            ep.push(fd, Readiness::READABLE);
        }
        let mut out = Vec::new();
        assert_eq!(ep.drain(2, &mut out), 2);
        assert_eq!(out.iter().map(|e| e.fd).collect::<Vec<_>>(), vec![0, 1]);
        out.clear();
        assert_eq!(ep.drain(16, &mut out), 2);
        assert_eq!(out.iter().map(|e| e.fd).collect::<Vec<_>>(), vec![2, 3]);
    }
}
