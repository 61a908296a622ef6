// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! Packet buffer handle and the host pool backend.
//!
//! `PktBuf` is a fixed-capacity buffer with adjustable headroom so header
//! layers can be stripped (`adj`) or reserved (`reset`) without copying the
//! payload. Real deployments provision these from hugepage-backed pools; the
//! `HeapPool` here is the deterministic host backend used by tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::PacketPool;

/// Borrowed packet buffer. Data lives in `storage[head..head + len]`.
#[derive(Debug)]
pub struct PktBuf {
    storage: Box<[u8]>,
    head: usize,
    len: usize,
}

impl PktBuf {
    /// Creates a standalone buffer (pool backends call this at provisioning).
    pub fn with_capacity(capacity: usize) -> Self {
        Self { storage: vec![0u8; capacity].into_boxed_slice(), head: 0, len: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current payload.
    pub fn bytes(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    /// Clears the buffer, reserving `headroom` bytes in front of the payload.
    pub fn reset(&mut self, headroom: usize) {
        debug_assert!(headroom <= self.storage.len());
        self.head = headroom.min(self.storage.len());
        self.len = 0;
    }

    /// Appends bytes after the payload. Returns false if tailroom is short,
    /// leaving the buffer unchanged.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let end = self.head + self.len;
        if bytes.len() > self.storage.len() - end {
            return false;
        }
        self.storage[end..end + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Strips `n` bytes from the front (consumes a header layer in place).
    /// Returns false if the payload is shorter than `n`.
    pub fn adj(&mut self, n: usize) -> bool {
        if n > self.len {
            return false;
        }
        self.head += n;
        self.len -= n;
        true
    }

    /// Writes `n` bytes of header in front of the payload, consuming
    /// headroom. Returns false when headroom is short.
    pub fn prepend(&mut self, header: &[u8]) -> bool {
        if header.len() > self.head {
            return false;
        }
        self.head -= header.len();
        self.len += header.len();
        self.storage[self.head..self.head + header.len()].copy_from_slice(header);
        true
    }

    /// Truncates the payload to `n` bytes. Returns false if it is shorter.
    pub fn trim_to(&mut self, n: usize) -> bool {
        if n > self.len {
            return false;
        }
        self.len = n;
        true
    }
}

/// Bounded host pool: a freelist of same-sized buffers plus an
/// outstanding-borrow counter. Exhaustion is a normal condition (`alloc`
/// returns `None`), never a panic.
pub struct HeapPool {
    free: Mutex<Vec<PktBuf>>,
    buf_capacity: usize,
    outstanding: AtomicUsize,
}

impl HeapPool {
    pub fn new(count: usize, buf_capacity: usize) -> Self {
        let free = (0..count).map(|_| PktBuf::with_capacity(buf_capacity)).collect();
        Self { free: Mutex::new(free), buf_capacity, outstanding: AtomicUsize::new(0) }
    }

    pub fn buf_capacity(&self) -> usize {
        self.buf_capacity
    }

    /// Buffers currently sitting in the freelist.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl PacketPool for HeapPool {
    fn alloc(&self) -> Option<PktBuf> {
        let mut buf = self.free.lock().pop()?;
        buf.reset(0);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Some(buf)
    }

    fn free(&self, buf: PktBuf) {
        debug_assert_eq!(buf.capacity(), self.buf_capacity);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.free.lock().push(buf);
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headroom_adjust_and_prepend_round_trip() {
        let mut buf = PktBuf::with_capacity(64);
        buf.reset(16);
        assert!(buf.append(b"payload"));
        assert!(buf.prepend(b"hdr:"));
        assert_eq!(buf.bytes(), b"hdr:payload");
        assert!(buf.adj(4));
        assert_eq!(buf.bytes(), b"payload");
    }

    #[test]
    fn append_refuses_overflow_without_mutation() {
        let mut buf = PktBuf::with_capacity(8);
        buf.reset(0);
        assert!(buf.append(b"12345678"));
        assert!(!buf.append(b"x"));
        assert_eq!(buf.bytes(), b"12345678");
    }

    #[test]
    fn pool_tracks_outstanding_borrows() {
        let pool = HeapPool::new(2, 128);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        assert_eq!(pool.outstanding(), 2);
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 2);
    }
}
