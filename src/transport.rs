// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability traits injected into the engine (§6, §9): `Transport`, `Clock`, `Idle`,
//! `EventSink`. A host port implements these over its concrete sockets/serial devices/UART;
//! the engine is generic over them and never reaches for an opaque context pointer.

use crate::diagnostics::Event;

/// Result of a non-blocking transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// The operation made progress; `n` bytes were accepted (send) or received (receive).
    Progress(usize),
    /// The operation could not make progress right now; the caller must poll again later.
    WouldBlock,
    /// The underlying transport failed. The engine never retries this internally; it is
    /// surfaced to the transaction/connection as [`crate::error::Error::IoError`].
    IoError,
}

/// Non-blocking byte transport. Implemented by each port over its concrete I/O.
///
/// Every method must return promptly: `send`/`receive` never block, and may accept/return
/// fewer bytes than requested.
pub trait Transport {
    /// Offers `bytes` to the transport; returns how many were accepted.
    fn send(&mut self, bytes: &[u8]) -> IoOutcome;

    /// Fills as much of `buffer` as is currently available.
    fn receive(&mut self, buffer: &mut [u8]) -> IoOutcome;

    /// Monotonic time in milliseconds, used for deadlines and backoff.
    fn now_ms(&self) -> u64;

    /// Optional hint to the host scheduler between micro-steps. Defaults to a no-op.
    fn yield_now(&mut self) {}
}

/// A time source, separable from [`Transport`] so tests can inject a deterministic clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Lets the engine request a sleep when it has no work and the next event is far away (§5,
/// "Power/idle").
pub trait Idle {
    /// Called with the proposed sleep duration; returns the duration actually slept (which may
    /// be shorter, e.g. if a transport event woke the host early).
    fn idle(&mut self, proposed_ms: u64) -> u64;
}

/// A no-op [`Idle`] for hosts that never sleep (e.g. a busy-polling loop).
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverIdle;

impl Idle for NeverIdle {
    fn idle(&mut self, _proposed_ms: u64) -> u64 {
        0
    }
}

/// Synchronous, non-blocking diagnostic event sink (§4.6, §6). May drop events internally but
/// must never panic.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

/// An [`EventSink`] that drops every event, for builds with diagnostics disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: Event) {}
}
