// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transaction state owned by the [`crate::pool::TransactionPool`] (§3, §4.3, §4.4). The
//! application only ever holds a [`TransactionHandle`] — an index plus a generation counter to
//! detect stale handles after a slot is recycled.

use crate::error::Error;
use crate::pdu::{Pdu, Request};

/// Scheduling priority (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

/// A transaction's position in its FSM (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Enqueued,
    Sending,
    AwaitingResponse,
    Completing,
    Terminal,
}

/// How a terminated transaction concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Timeout,
    Exception,
    Cancelled,
    Aborted,
    IoError,
}

/// A lightweight reference to a pool slot. Carries a generation so a handle from a completed
/// and recycled transaction is never mistaken for the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// The unique identifier of an in-flight transaction at the framing layer: the unit id for
/// RTU/ASCII, or the MBAP transaction id for TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireId {
    Unit(u8),
    Transaction(u16),
}

/// A single client-side transaction, from submission through completion (§3).
#[derive(Debug, Clone)]
pub struct Transaction {
    pub wire_id: WireId,
    /// The target device's unit id. Equal to `wire_id`'s payload for RTU/ASCII (where
    /// `WireId::Unit` already *is* the unit id); a separate value for TCP, where `wire_id`
    /// carries the MBAP transaction id instead and this field addresses the downstream device
    /// a gateway would forward to.
    pub unit_id: u8,
    pub request: Request,
    pub request_pdu: Pdu,
    pub response_pdu: Option<Pdu>,
    pub priority: Priority,
    pub state: TxnState,
    pub outcome: Option<Outcome>,
    pub error: Option<Error>,
    pub submitted_at_ms: u64,
    pub deadline_ms: u64,
    pub sub_state_entered_at_ms: u64,
    pub attempts_remaining: u8,
    pub cancel_requested: bool,
    pub generation: u32,
    /// Earliest time this transaction may be dequeued again after a retry backoff (§4.3).
    /// Zero until the first retry; the scheduler skips an otherwise-eligible transaction while
    /// `now_ms < retry_not_before_ms`.
    pub retry_not_before_ms: u64,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        wire_id: WireId,
        unit_id: u8,
        request: Request,
        request_pdu: Pdu,
        priority: Priority,
        now_ms: u64,
        timeout_ms: u64,
        max_retries: u8,
        generation: u32,
    ) -> Self {
        Self {
            wire_id,
            unit_id,
            request,
            request_pdu,
            response_pdu: None,
            priority,
            state: TxnState::Enqueued,
            outcome: None,
            error: None,
            submitted_at_ms: now_ms,
            deadline_ms: now_ms + timeout_ms,
            sub_state_entered_at_ms: now_ms,
            attempts_remaining: max_retries,
            cancel_requested: false,
            generation,
            retry_not_before_ms: 0,
        }
    }

    #[must_use]
    pub fn function_code(&self) -> u8 {
        self.request.function_code()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TxnState::Terminal)
    }
}
