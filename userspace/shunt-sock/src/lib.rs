// Copyright 2026 Shunt Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-bypass socket engine (descriptor table, TCP/UDP state
//! machine, dispatcher, edge-triggered epoll emulation)
//! OWNERS: @fastpath
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - Stack: process-wide engine; `Stack::init` wires pool/ports/bridge
//!   - SockHandle: per-thread attachment carrying the BSD-shaped calls
//!   - StackConfig: TOML-loadable configuration with validated defaults
//!
//! Applications link this instead of the OS socket API and get the familiar
//! calls (`socket`, `bind`, `connect`, `send`/`recv`, `listen`/`accept`,
//! `epoll_*`, `setsockopt`, `shutdown`, `close`) running over a poll-mode
//! port, with everything the fast path does not understand forwarded to the
//! kernel through the bridge boundary. No call ever blocks on a kernel
//! primitive: flow control is `WouldBlock`/`InProgress` plus edge-triggered
//! readiness, and "blocking" epoll waits cooperatively pump the per-core
//! poll pass.

#![forbid(unsafe_code)]

pub mod api;
pub mod classify;
pub mod config;
pub mod egress;
pub mod epoll;
pub mod fd;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod udp;
pub mod wire;

pub use api::SockHandle;
pub use classify::{AddrTuple, Classify, ConnRef};
pub use config::{ConfigError, StackConfig};
pub use stack::Stack;
