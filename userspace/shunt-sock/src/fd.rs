// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Descriptor table: an arena of generation-counted slots.
//!
//! Handles resolve in O(1) by index. The freelist reuses indices, and every
//! free bumps the slot generation, so a `ConnRef { fd, gen }` held by a
//! dispatcher on another core goes stale the instant the descriptor closes.
//! That generation check is the cross-core close synchronization: a stale
//! reference fails to resolve instead of touching a recycled socket.

use parking_lot::Mutex;

use shunt_net::{RawFd, SockError, SockResult};

use crate::epoll::EpollInstance;
use crate::socket::SocketEntry;

pub enum DescObj {
    Socket(SocketEntry),
    Epoll(EpollInstance),
}

struct Slot {
    gen: u32,
    obj: Option<DescObj>,
}

pub struct FdTable {
    slots: Box<[Mutex<Slot>]>,
    // Stored descending so low fds hand out first, like a fresh fd space.
    free: Mutex<Vec<RawFd>>,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Mutex::new(Slot { gen: 0, obj: None })).collect();
        let free = (0..capacity as RawFd).rev().collect();
        Self { slots, free: Mutex::new(free) }
    }

    fn slot(&self, fd: RawFd) -> SockResult<&Mutex<Slot>> {
        if fd < 0 {
            return Err(SockError::BadDescriptor);
        }
        self.slots.get(fd as usize).ok_or(SockError::BadDescriptor)
    }

    /// Allocates a fresh descriptor for `obj`. Never aliases a live handle.
    /// On a full table the object is handed back so the caller can restore
    /// whatever it was about to promote.
    pub fn alloc(&self, obj: DescObj) -> Result<(RawFd, u32), DescObj> {
        let Some(fd) = self.free.lock().pop() else {
            return Err(obj);
        };
        let mut slot = self.slots[fd as usize].lock();
        debug_assert!(slot.obj.is_none());
        slot.obj = Some(obj);
        Ok((fd, slot.gen))
    }

    pub fn gen_of(&self, fd: RawFd) -> SockResult<u32> {
        let slot = self.slot(fd)?.lock();
        if slot.obj.is_none() {
            return Err(SockError::BadDescriptor);
        }
        Ok(slot.gen)
    }

    /// Runs `f` on the live socket behind `fd`.
    pub fn with_socket<R>(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut SocketEntry) -> SockResult<R>,
    ) -> SockResult<R> {
        self.with_socket_meta(fd, |entry, _gen| f(entry))
    }

    /// Like `with_socket`, additionally handing the closure the slot
    /// generation (needed when the closure registers `ConnRef`s).
    pub fn with_socket_meta<R>(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut SocketEntry, u32) -> SockResult<R>,
    ) -> SockResult<R> {
        let mut slot = self.slot(fd)?.lock();
        let gen = slot.gen;
        match slot.obj.as_mut() {
            Some(DescObj::Socket(entry)) => f(entry, gen),
            Some(DescObj::Epoll(_)) => Err(SockError::InvalidInput("descriptor is not a socket")),
            None => Err(SockError::BadDescriptor),
        }
    }

    /// Like `with_socket`, but only when the slot generation still matches.
    /// Dispatchers use this with `ConnRef`s taken from the tuple index.
    pub fn with_socket_checked<R>(
        &self,
        fd: RawFd,
        gen: u32,
        f: impl FnOnce(&mut SocketEntry) -> SockResult<R>,
    ) -> SockResult<R> {
        let mut slot = self.slot(fd)?.lock();
        if slot.gen != gen {
            return Err(SockError::BadDescriptor);
        }
        match slot.obj.as_mut() {
            Some(DescObj::Socket(entry)) => f(entry),
            _ => Err(SockError::BadDescriptor),
        }
    }

    /// Runs `f` on the live epoll instance behind `fd`.
    pub fn with_epoll<R>(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut EpollInstance) -> SockResult<R>,
    ) -> SockResult<R> {
        let mut slot = self.slot(fd)?.lock();
        match slot.obj.as_mut() {
            Some(DescObj::Epoll(ep)) => f(ep),
            Some(DescObj::Socket(_)) => {
                Err(SockError::InvalidInput("descriptor is not an epoll instance"))
            }
            None => Err(SockError::BadDescriptor),
        }
    }

    /// First half of close: detaches the object and bumps the generation.
    /// The fd stays out of the freelist until `finish_close`, so it cannot
    /// be re-issued while teardown is releasing buffers and registrations.
    /// A second close of the same fd fails here with `BadDescriptor`.
    pub fn begin_close(&self, fd: RawFd) -> SockResult<DescObj> {
        let mut slot = self.slot(fd)?.lock();
        let obj = slot.obj.take().ok_or(SockError::BadDescriptor)?;
        slot.gen = slot.gen.wrapping_add(1);
        Ok(obj)
    }

    /// Second half of close: returns the index to the freelist.
    pub fn finish_close(&self, fd: RawFd) {
        self.free.lock().push(fd);
    }
}
