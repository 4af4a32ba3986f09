// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The client transaction manager and FSM (§4.3, §4.4), fused into a single
//! [`ClientEngine`]: submission, priority/deadline scheduling, retry with exponential backoff,
//! a per-transaction watchdog, and the cooperative `poll()` micro-step loop that drives frames
//! across an injected [`Transport`].
//!
//! `POOL` bounds how many transactions may be in flight (submitted but not yet collected via
//! [`ClientEngine::take_result`]) at once; `RX` is the receive ring's byte capacity; `TRACE` is
//! the diagnostics trace ring depth. All three are fixed at construction, so the engine never
//! allocates after `new()`.

use heapless::Vec;

use crate::config::{Config, Framing, QosPolicy};
use crate::diagnostics::{CountersSnapshot, Diagnostics, Event, EventKind, Role};
use crate::error::{Error, OutcomeSlot, Result};
use crate::frame::{self, Decoder, DecodedFrame, MAX_ADU_BUF};
use crate::pdu::{Request, Response};
use crate::pool::TransactionPool;
use crate::ring::RingBuffer;
use crate::transaction::{Outcome, Priority, Transaction, TransactionHandle, TxnState, WireId};
use crate::transport::{EventSink, Idle, IoOutcome, Transport};

/// Number of bytes drained from the transport into the RX ring per micro-step. Deliberately
/// small and independent of `RX`: a single `receive()` filling less than the ring's capacity
/// is fine, the next micro-step just drains more.
const RX_CHUNK: usize = 128;

/// An outcome-bearing transaction, handed back by [`ClientEngine::take_result`]. The
/// application already held the [`TransactionHandle`]; this is the payload it was waiting on.
#[derive(Debug, Clone)]
pub struct CompletedTransaction {
    pub outcome: Outcome,
    pub request: Request,
    pub response: Option<Response>,
    pub error: Option<Error>,
}

struct SendingFrame {
    handle: TransactionHandle,
    buf: Vec<u8, MAX_ADU_BUF>,
    offset: usize,
}

/// The client-side transaction manager and FSM (§4.3, §4.4).
pub struct ClientEngine<const POOL: usize, const RX: usize, const TRACE: usize> {
    config: Config,
    pool: TransactionPool<POOL>,
    high_queue: Vec<TransactionHandle, POOL>,
    normal_queue: Vec<TransactionHandle, POOL>,
    inflight: Vec<TransactionHandle, POOL>,
    sending: Option<SendingFrame>,
    rx_ring: RingBuffer<RX>,
    decoder: Decoder,
    next_transaction_id: u16,
    diagnostics: Diagnostics<TRACE>,
}

impl<const POOL: usize, const RX: usize, const TRACE: usize> ClientEngine<POOL, RX, TRACE> {
    /// Builds an engine from `config`, which is validated first (§6).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let silence_ms = frame::rtu_silence_ms(&config);
        Ok(Self {
            decoder: Decoder::new(config.framing, silence_ms),
            diagnostics: Diagnostics::new(
                config.diagnostics.counters_enabled,
                config.diagnostics.trace_enabled,
            ),
            config,
            pool: TransactionPool::new(),
            high_queue: Vec::new(),
            normal_queue: Vec::new(),
            inflight: Vec::new(),
            sending: None,
            rx_ring: RingBuffer::new(),
            next_transaction_id: 0,
        })
    }

    /// Submits `request` for `unit_id` at `priority`; returns a handle the application polls
    /// with [`Self::status`]/[`Self::take_result`]. Fails with [`Error::Busy`] if the
    /// transaction pool or the target priority queue is already at capacity (§4.3).
    pub fn submit(
        &mut self,
        unit_id: u8,
        request: Request,
        priority: Priority,
        now_ms: u64,
    ) -> Result<TransactionHandle> {
        let queue_capacity = match priority {
            Priority::High => self.config.qos.queue_capacity_high,
            Priority::Normal => self.config.qos.queue_capacity_normal,
        };
        let queue_len = match priority {
            Priority::High => self.high_queue.len(),
            Priority::Normal => self.normal_queue.len(),
        };
        if queue_len >= queue_capacity {
            return Err(Error::Busy);
        }

        let request_pdu = request.encode()?;
        let function_code = request.function_code();
        let wire_id = match self.config.framing {
            Framing::Tcp => {
                let id = self.next_transaction_id;
                self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
                WireId::Transaction(id)
            }
            #[allow(unreachable_patterns)]
            _ => WireId::Unit(unit_id),
        };
        let timeout_ms = self.config.timeouts.timeout_for(function_code);
        let txn = Transaction::new(
            wire_id,
            unit_id,
            request,
            request_pdu,
            priority,
            now_ms,
            timeout_ms,
            self.config.retry.max_retries,
            0,
        );
        let handle = self.pool.acquire(txn)?;
        let pushed = match priority {
            Priority::High => self.high_queue.push(handle),
            Priority::Normal => self.normal_queue.push(handle),
        };
        if pushed.is_err() {
            self.pool.release(handle);
            return Err(Error::Busy);
        }
        Ok(handle)
    }

    /// Requests cancellation of `handle`. A still-queued transaction terminates immediately;
    /// one that is sending or awaiting a response terminates at the next `poll()` (§4.4).
    pub fn cancel(&mut self, handle: TransactionHandle, sink: &mut impl EventSink, now_ms: u64) {
        let Some(txn) = self.pool.get_mut(handle) else {
            return;
        };
        if txn.is_terminal() {
            return;
        }
        txn.cancel_requested = true;
        if txn.state == TxnState::Enqueued {
            self.remove_from_queues(handle);
            self.finalize_simple(handle, Outcome::Cancelled, Error::Cancelled, sink, now_ms);
        }
    }

    /// Cancels every queued and in-flight transaction (§4.4, shutdown path).
    pub fn flush(&mut self, sink: &mut impl EventSink, now_ms: u64) {
        while let Some(handle) = self.high_queue.pop() {
            self.finalize_simple(handle, Outcome::Cancelled, Error::Cancelled, sink, now_ms);
        }
        while let Some(handle) = self.normal_queue.pop() {
            self.finalize_simple(handle, Outcome::Cancelled, Error::Cancelled, sink, now_ms);
        }
        while let Some(handle) = self.inflight.pop() {
            self.finalize_simple(handle, Outcome::Cancelled, Error::Cancelled, sink, now_ms);
        }
        if let Some(sending) = self.sending.take() {
            self.finalize_simple(sending.handle, Outcome::Cancelled, Error::Cancelled, sink, now_ms);
        }
    }

    /// The transaction's current FSM state, or `None` if the handle is unknown/stale.
    #[must_use]
    pub fn status(&self, handle: TransactionHandle) -> Option<TxnState> {
        self.pool.get(handle).map(|t| t.state)
    }

    /// Removes and returns a terminated transaction's outcome; `None` if the handle is
    /// unknown/stale or the transaction has not reached a terminal state yet. Re-parses the
    /// stored response PDU against the original request rather than caching a typed
    /// [`Response`] redundantly on [`Transaction`].
    pub fn take_result(&mut self, handle: TransactionHandle) -> Option<CompletedTransaction> {
        let terminal = self.pool.get(handle).map(|t| t.is_terminal())?;
        if !terminal {
            return None;
        }
        let txn = self.pool.release(handle)?;
        let response = match (txn.outcome, &txn.response_pdu) {
            (Some(Outcome::Done), Some(pdu)) => Response::parse(&txn.request, pdu).ok(),
            _ => None,
        };
        Some(CompletedTransaction {
            outcome: txn.outcome.unwrap_or(Outcome::Aborted),
            request: txn.request,
            response,
            error: txn.error,
        })
    }

    /// Number of transactions currently occupying the pool (queued, in flight, or terminated
    /// but not yet collected).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pool.len()
    }

    #[must_use]
    pub fn diagnostics_snapshot(&self) -> CountersSnapshot {
        self.diagnostics.snapshot()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics<TRACE> {
        &self.diagnostics
    }

    /// The earliest time (in transport clock terms) at which this engine next has useful work:
    /// a deadline, a watchdog trip, or a retry backoff elapsing. A host loop may use this to
    /// size an [`crate::transport::Idle::idle`] call between `poll()`s (§5 "Power/idle"); the
    /// engine never calls `Idle` itself.
    #[must_use]
    pub fn next_wakeup_ms(&self, now_ms: u64) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        let mut consider = |ms: u64| {
            earliest = Some(earliest.map_or(ms, |e| e.min(ms)));
        };
        if let Some(sending) = &self.sending {
            if let Some(t) = self.pool.get(sending.handle) {
                consider(t.deadline_ms);
            }
        }
        for &handle in &self.inflight {
            if let Some(t) = self.pool.get(handle) {
                consider(t.deadline_ms);
            }
        }
        for &handle in self.high_queue.iter().chain(self.normal_queue.iter()) {
            if let Some(t) = self.pool.get(handle) {
                consider(t.retry_not_before_ms.max(now_ms));
            }
        }
        earliest
    }

    /// Invokes `idle.idle(proposed)` when the engine is not mid-send and the next scheduled
    /// event (a deadline, watchdog trip, or retry backoff) is farther off than
    /// `config.idle.idle_threshold_ms` (§5 "Power/idle"). Returns the duration `idle` reports
    /// having actually slept, or `None` if no call was made — either because there is work due
    /// sooner than the threshold, or because nothing is pending at all.
    pub fn idle_if_due(&self, idle: &mut impl Idle, now_ms: u64) -> Option<u64> {
        if self.sending.is_some() {
            return None;
        }
        let wakeup = self.next_wakeup_ms(now_ms)?;
        let proposed = wakeup.saturating_sub(now_ms);
        if proposed > self.config.idle.idle_threshold_ms {
            Some(idle.idle(proposed))
        } else {
            None
        }
    }

    /// Runs up to `budget_steps` micro-steps (`0` means unbounded: run until no step makes
    /// progress). Never blocks; a micro-step that cannot progress right now (transport
    /// `WouldBlock`, nothing queued, no data to decode) stops the loop (§4.4, §5).
    pub fn poll(
        &mut self,
        transport: &mut impl Transport,
        sink: &mut impl EventSink,
        budget_steps: u32,
        now_ms: u64,
    ) {
        let mut steps = 0u32;
        loop {
            if budget_steps != 0 && steps >= budget_steps {
                break;
            }
            steps += 1;
            if !self.micro_step(transport, sink, now_ms) {
                break;
            }
        }
    }

    fn micro_step(
        &mut self,
        transport: &mut impl Transport,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) -> bool {
        if self.sweep_deadlines(sink, now_ms) {
            return true;
        }

        if let Some(sending) = &mut self.sending {
            let remaining = &sending.buf[sending.offset..];
            match transport.send(remaining) {
                IoOutcome::Progress(n) if n > 0 => {
                    sending.offset += n;
                    if sending.offset >= sending.buf.len() {
                        self.finish_send(sink, now_ms);
                    }
                    return true;
                }
                IoOutcome::IoError => {
                    let handle = sending.handle;
                    self.sending = None;
                    self.terminate_or_retry(handle, Outcome::IoError, sink, now_ms);
                    return true;
                }
                _ => return false,
            }
        }

        if self.start_next(sink, now_ms) {
            return true;
        }

        let mut chunk = [0u8; RX_CHUNK];
        match transport.receive(&mut chunk) {
            IoOutcome::Progress(n) if n > 0 => {
                self.rx_ring.write(&chunk[..n]);
                return true;
            }
            IoOutcome::IoError => {
                self.emit(sink, Event::new(now_ms, Role::Client, 0, EventKind::Drop, OutcomeSlot::IoError));
                return false;
            }
            _ => {}
        }

        match self.decoder.poll(&mut self.rx_ring, now_ms) {
            Ok(Some(decoded)) => {
                self.on_frame(decoded, sink, now_ms);
                true
            }
            Ok(None) => false,
            Err(err) => {
                self.emit(
                    sink,
                    Event::new(now_ms, Role::Client, 0, EventKind::Drop, err.outcome_slot()),
                );
                true
            }
        }
    }

    fn sweep_deadlines(&mut self, sink: &mut impl EventSink, now_ms: u64) -> bool {
        if let Some(handle) = self.sending.as_ref().map(|s| s.handle) {
            if let Some(outcome) = self.check_deadline(handle, now_ms) {
                self.sending = None;
                self.terminate_or_retry(handle, outcome, sink, now_ms);
                return true;
            }
        }
        for i in 0..self.inflight.len() {
            let handle = self.inflight[i];
            if let Some(outcome) = self.check_deadline(handle, now_ms) {
                self.inflight.remove(i);
                self.terminate_or_retry(handle, outcome, sink, now_ms);
                return true;
            }
        }
        false
    }

    fn check_deadline(&self, handle: TransactionHandle, now_ms: u64) -> Option<Outcome> {
        let txn = self.pool.get(handle)?;
        if txn.cancel_requested {
            return Some(Outcome::Cancelled);
        }
        // The deadline is the primary, tighter signal and takes priority; the watchdog is a
        // backstop for a sub-state that somehow outlives even a generous multiple of the
        // timeout without the deadline check having already resolved it.
        if now_ms >= txn.deadline_ms {
            return Some(Outcome::Timeout);
        }
        let watchdog_limit_ms =
            u64::from(self.config.watchdog.multiplier) * self.config.timeouts.timeout_for(txn.function_code());
        if now_ms.saturating_sub(txn.sub_state_entered_at_ms) > watchdog_limit_ms {
            return Some(Outcome::Aborted);
        }
        None
    }

    /// Dispatches a deadline/IO-error termination: retried (with backoff) when retryable
    /// attempts remain, otherwise finalized terminally (§4.3).
    fn terminate_or_retry(
        &mut self,
        handle: TransactionHandle,
        outcome: Outcome,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let retryable = matches!(outcome, Outcome::Timeout | Outcome::IoError);
        if retryable {
            let requeued = self.requeue_for_retry(handle, now_ms);
            if requeued {
                let fc = self.pool.get(handle).map(|t| t.function_code()).unwrap_or(0);
                self.emit(
                    sink,
                    Event::new(now_ms, Role::Client, fc, EventKind::Retry, OutcomeSlot::Timeout),
                );
                return;
            }
        }
        let error = match outcome {
            Outcome::Timeout => Error::Timeout,
            Outcome::Cancelled => Error::Cancelled,
            Outcome::Aborted => Error::Aborted,
            Outcome::IoError => Error::IoError,
            Outcome::Done | Outcome::Exception => Error::Aborted,
        };
        self.finalize_simple(handle, outcome, error, sink, now_ms);
    }

    /// Re-enqueues `handle` for another attempt if it has any left, applying exponential
    /// backoff with jitter (§4.3). Returns whether a retry was scheduled.
    fn requeue_for_retry(&mut self, handle: TransactionHandle, now_ms: u64) -> bool {
        let Some(txn) = self.pool.get_mut(handle) else {
            return false;
        };
        if txn.attempts_remaining == 0 {
            return false;
        }
        txn.attempts_remaining -= 1;
        let attempt_number = self.config.retry.max_retries - txn.attempts_remaining;
        let backoff_ms = compute_backoff_ms(&self.config, attempt_number, now_ms, handle.index);
        let timeout_ms = self.config.timeouts.timeout_for(txn.function_code());
        txn.retry_not_before_ms = now_ms + backoff_ms;
        txn.deadline_ms = now_ms + backoff_ms + timeout_ms;
        txn.sub_state_entered_at_ms = now_ms;
        txn.state = TxnState::Enqueued;
        let priority = txn.priority;
        let pushed = match priority {
            Priority::High => self.high_queue.push(handle),
            Priority::Normal => self.normal_queue.push(handle),
        };
        pushed.is_ok()
    }

    fn finalize_simple(
        &mut self,
        handle: TransactionHandle,
        outcome: Outcome,
        error: Error,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let fc = self.pool.get(handle).map(|t| t.function_code()).unwrap_or(0);
        if let Some(txn) = self.pool.get_mut(handle) {
            txn.state = TxnState::Terminal;
            txn.outcome = Some(outcome);
            txn.error = Some(error);
        }
        let kind = match outcome {
            Outcome::Timeout => EventKind::Timeout,
            Outcome::IoError => EventKind::Drop,
            _ => EventKind::StateChange,
        };
        self.emit(sink, Event::new(now_ms, Role::Client, fc, kind, error.outcome_slot()));
    }

    fn start_next(&mut self, sink: &mut impl EventSink, now_ms: u64) -> bool {
        if self.sending.is_some() {
            return false;
        }
        let Some(handle) = self.pick_next(now_ms) else {
            return false;
        };
        let Some(txn) = self.pool.get_mut(handle) else {
            return false;
        };
        txn.state = TxnState::Sending;
        txn.sub_state_entered_at_ms = now_ms;
        let wire_id = txn.wire_id;
        let unit_id = txn.unit_id;
        let request_pdu = txn.request_pdu.clone();
        let fc = txn.function_code();

        let mut buf: Vec<u8, MAX_ADU_BUF> = Vec::new();
        if frame::encode(self.config.framing, wire_id, unit_id, &request_pdu, &mut buf).is_err() {
            self.finalize_simple(handle, Outcome::Aborted, Error::InvalidArgument, sink, now_ms);
            return true;
        }
        self.emit(sink, Event::new(now_ms, Role::Client, fc, EventKind::StateChange, OutcomeSlot::Ok));
        self.sending = Some(SendingFrame { handle, buf, offset: 0 });
        true
    }

    fn finish_send(&mut self, sink: &mut impl EventSink, now_ms: u64) {
        let Some(sending) = self.sending.take() else {
            return;
        };
        let handle = sending.handle;
        if let Some(txn) = self.pool.get_mut(handle) {
            txn.state = TxnState::AwaitingResponse;
            txn.sub_state_entered_at_ms = now_ms;
        }
        let fc = self.pool.get(handle).map(|t| t.function_code()).unwrap_or(0);
        self.emit(sink, Event::new(now_ms, Role::Client, fc, EventKind::TxSent, OutcomeSlot::Ok));
        // Capacity is `POOL`; at most `POOL` transactions are ever live at once, so this cannot fail.
        let _ = self.inflight.push(handle);
    }

    fn on_frame(&mut self, frame: DecodedFrame, sink: &mut impl EventSink, now_ms: u64) {
        let Some(idx) = self
            .inflight
            .iter()
            .position(|&h| self.pool.get(h).map(|t| t.wire_id) == Some(frame.wire_id))
        else {
            self.emit(
                sink,
                Event::new(now_ms, Role::Client, frame.pdu.function_code, EventKind::Drop, OutcomeSlot::Ok),
            );
            return;
        };
        let handle = self.inflight.remove(idx);
        self.emit(
            sink,
            Event::new(now_ms, Role::Client, frame.pdu.function_code, EventKind::RxReady, OutcomeSlot::Ok),
        );

        let Some(txn) = self.pool.get(handle) else {
            return;
        };
        match Response::parse(&txn.request, &frame.pdu) {
            Ok(_response) => {
                if let Some(txn) = self.pool.get_mut(handle) {
                    txn.response_pdu = Some(frame.pdu.clone());
                    txn.state = TxnState::Terminal;
                    txn.outcome = Some(Outcome::Done);
                }
                self.emit(
                    sink,
                    Event::new(now_ms, Role::Client, frame.pdu.function_code, EventKind::TxComplete, OutcomeSlot::Ok),
                );
            }
            Err(Error::Exception(exception)) => {
                if let Some(txn) = self.pool.get_mut(handle) {
                    txn.state = TxnState::Terminal;
                    txn.outcome = Some(Outcome::Exception);
                    txn.error = Some(Error::Exception(exception));
                }
                self.emit(
                    sink,
                    Event::new(now_ms, Role::Client, frame.pdu.function_code, EventKind::Exception, exception.outcome_slot()),
                );
            }
            Err(err) => {
                // A frame matched by wire id but failed to parse against the request it was
                // supposedly answering. Rather than guess, drop it: the deadline sweep retries
                // or times out the transaction on its own schedule (§8, Scenario D).
                let _ = self.inflight.push(handle);
                self.emit(
                    sink,
                    Event::new(now_ms, Role::Client, frame.pdu.function_code, EventKind::Drop, err.outcome_slot()),
                );
            }
        }
    }

    fn pick_next(&mut self, now_ms: u64) -> Option<TransactionHandle> {
        self.pick_from(true, now_ms).or_else(|| self.pick_from(false, now_ms))
    }

    fn pick_from(&mut self, high: bool, now_ms: u64) -> Option<TransactionHandle> {
        let policy = self.config.qos.policy;
        let mut best: Option<(usize, u64)> = None;
        {
            let queue = if high { &self.high_queue } else { &self.normal_queue };
            for (i, &handle) in queue.iter().enumerate() {
                let Some(txn) = self.pool.get(handle) else { continue };
                if now_ms < txn.retry_not_before_ms {
                    continue;
                }
                if self.is_blocked(txn.wire_id) {
                    continue;
                }
                match policy {
                    QosPolicy::StrictPriority => {
                        best = Some((i, txn.deadline_ms));
                        break;
                    }
                    QosPolicy::DeadlineAware => {
                        if best.map_or(true, |(_, deadline)| txn.deadline_ms < deadline) {
                            best = Some((i, txn.deadline_ms));
                        }
                    }
                }
            }
        }
        let (idx, _) = best?;
        let queue = if high { &mut self.high_queue } else { &mut self.normal_queue };
        Some(queue.remove(idx))
    }

    /// RTU/ASCII allow only one outstanding transaction per unit id on the shared line; TCP's
    /// MBAP transaction id makes every in-flight request independently addressable (§4.3).
    fn is_blocked(&self, wire_id: WireId) -> bool {
        if self.config.framing == Framing::Tcp {
            return false;
        }
        if let Some(sending) = &self.sending {
            if self.pool.get(sending.handle).map(|t| t.wire_id) == Some(wire_id) {
                return true;
            }
        }
        self.inflight
            .iter()
            .any(|&h| self.pool.get(h).map(|t| t.wire_id) == Some(wire_id))
    }

    fn remove_from_queues(&mut self, handle: TransactionHandle) {
        if let Some(pos) = self.high_queue.iter().position(|&h| h == handle) {
            self.high_queue.remove(pos);
        }
        if let Some(pos) = self.normal_queue.iter().position(|&h| h == handle) {
            self.normal_queue.remove(pos);
        }
    }

    fn emit(&mut self, sink: &mut impl EventSink, event: Event) {
        self.diagnostics.record(event);
        sink.emit(event);
    }
}

/// `base * 2^(attempt_number - 1)`, capped at `backoff_max_ms`, plus up to `jitter_pct` percent
/// of jitter. `now_ms`/`pool_index` seed a cheap deterministic hash rather than pulling in a
/// `rand` dependency this crate has no other use for (§4.3).
fn compute_backoff_ms(config: &Config, attempt_number: u8, now_ms: u64, pool_index: usize) -> u64 {
    let exponent = attempt_number.saturating_sub(1).min(16);
    let base = u64::from(config.retry.backoff_base_ms);
    let scaled = base.saturating_mul(1u64 << exponent);
    let capped = scaled.min(u64::from(config.retry.backoff_max_ms));
    let jitter_range = capped * u64::from(config.retry.jitter_pct) / 100;
    if jitter_range == 0 {
        return capped;
    }
    let seed = now_ms
        .wrapping_mul(2_654_435_761)
        .wrapping_add(pool_index as u64)
        .wrapping_add(u64::from(attempt_number));
    capped + seed % (jitter_range + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::transport::NullSink;
    use std::collections::VecDeque;

    /// An in-memory loopback transport: bytes written with `push_inbound` are handed back by
    /// `receive`, and everything sent is captured in `sent` for inspection.
    struct LoopbackTransport {
        inbound: VecDeque<u8>,
        sent: std::vec::Vec<u8>,
        now_ms: u64,
        fail_send: bool,
    }

    impl LoopbackTransport {
        fn new() -> Self {
            Self {
                inbound: VecDeque::new(),
                sent: std::vec::Vec::new(),
                now_ms: 0,
                fail_send: false,
            }
        }

        fn push_inbound(&mut self, bytes: &[u8]) {
            self.inbound.extend(bytes.iter().copied());
        }
    }

    impl Transport for LoopbackTransport {
        fn send(&mut self, bytes: &[u8]) -> IoOutcome {
            if self.fail_send {
                return IoOutcome::IoError;
            }
            self.sent.extend_from_slice(bytes);
            IoOutcome::Progress(bytes.len())
        }

        fn receive(&mut self, buffer: &mut [u8]) -> IoOutcome {
            if self.inbound.is_empty() {
                return IoOutcome::WouldBlock;
            }
            let mut n = 0;
            while n < buffer.len() {
                let Some(byte) = self.inbound.pop_front() else {
                    break;
                };
                buffer[n] = byte;
                n += 1;
            }
            IoOutcome::Progress(n)
        }

        fn now_ms(&self) -> u64 {
            self.now_ms
        }
    }

    fn rtu_config() -> Config {
        let mut config = Config::new(Framing::Rtu);
        config.timeouts = crate::config::TimeoutConfig::new(100);
        config
    }

    #[test]
    fn scenario_a_rtu_read_holding_registers_round_trip() {
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(rtu_config()).unwrap();
        let mut transport = LoopbackTransport::new();
        let mut sink = NullSink;

        let handle = engine
            .submit(1, Request::ReadHoldingRegisters(0, 2), Priority::Normal, 0)
            .unwrap();

        engine.poll(&mut transport, &mut sink, 0, 0);
        let mut expected_request = std::vec![0x01u8, 0x03, 0x00, 0x00, 0x00, 0x02];
        let request_crc = crate::crc::crc16(&expected_request);
        expected_request.extend_from_slice(&request_crc.to_be_bytes());
        assert_eq!(transport.sent, expected_request);

        // Server answers with registers [0x1234, 0x5678].
        let response = [0x01u8, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        let crc = crate::crc::crc16(&response);
        let mut wire = response.to_vec();
        wire.extend_from_slice(&crc.to_be_bytes());
        transport.push_inbound(&wire);

        engine.poll(&mut transport, &mut sink, 0, 5);
        assert_eq!(engine.status(handle), Some(TxnState::Terminal));
        let completed = engine.take_result(handle).unwrap();
        assert_eq!(completed.outcome, Outcome::Done);
        match completed.response {
            Some(Response::ReadHoldingRegisters(regs)) => {
                assert_eq!(regs.as_slice(), &[0x1234, 0x5678]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn timeout_without_retries_finalizes_as_timeout() {
        let mut config = rtu_config();
        config.retry.max_retries = 0;
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(config).unwrap();
        let mut transport = LoopbackTransport::new();
        let mut sink = NullSink;

        let handle = engine
            .submit(1, Request::ReadHoldingRegisters(0, 2), Priority::Normal, 0)
            .unwrap();
        engine.poll(&mut transport, &mut sink, 0, 0);
        engine.poll(&mut transport, &mut sink, 0, 1_000);

        assert_eq!(engine.status(handle), Some(TxnState::Terminal));
        let completed = engine.take_result(handle).unwrap();
        assert_eq!(completed.outcome, Outcome::Timeout);
        assert_eq!(completed.error, Some(Error::Timeout));
    }

    #[test]
    fn timeout_with_retries_is_resent_before_finally_succeeding() {
        let mut config = rtu_config();
        config.retry.max_retries = 2;
        config.retry.backoff_base_ms = 10;
        config.retry.jitter_pct = 0;
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(config).unwrap();
        let mut transport = LoopbackTransport::new();
        let mut sink = NullSink;

        let handle = engine
            .submit(1, Request::ReadHoldingRegisters(0, 1), Priority::Normal, 0)
            .unwrap();
        engine.poll(&mut transport, &mut sink, 0, 0);
        let first_send_len = transport.sent.len();
        assert!(first_send_len > 0);

        // Deadline elapses with no response: the transaction must be retried, not finalized.
        engine.poll(&mut transport, &mut sink, 0, 500);
        assert_eq!(engine.status(handle), Some(TxnState::Enqueued));

        // Drive the engine past the backoff so the retry is actually sent.
        engine.poll(&mut transport, &mut sink, 0, 600);
        assert!(transport.sent.len() > first_send_len);

        let response = [0x01u8, 0x03, 0x02, 0x00, 0x2A];
        let crc = crate::crc::crc16(&response);
        let mut wire = response.to_vec();
        wire.extend_from_slice(&crc.to_be_bytes());
        transport.push_inbound(&wire);
        engine.poll(&mut transport, &mut sink, 0, 601);

        let completed = engine.take_result(handle).unwrap();
        assert_eq!(completed.outcome, Outcome::Done);
    }

    #[test]
    fn cancel_of_queued_transaction_is_immediate() {
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(rtu_config()).unwrap();
        let mut sink = NullSink;
        let handle = engine
            .submit(1, Request::ReadHoldingRegisters(0, 1), Priority::High, 0)
            .unwrap();
        engine.cancel(handle, &mut sink, 0);
        assert_eq!(engine.status(handle), Some(TxnState::Terminal));
        assert_eq!(engine.take_result(handle).unwrap().outcome, Outcome::Cancelled);
    }

    #[test]
    fn busy_queue_rejects_submission_over_capacity() {
        let mut config = rtu_config();
        config.qos.queue_capacity_normal = 1;
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(config).unwrap();
        engine
            .submit(1, Request::ReadHoldingRegisters(0, 1), Priority::Normal, 0)
            .unwrap();
        let second = engine.submit(1, Request::ReadHoldingRegisters(0, 1), Priority::Normal, 0);
        assert_eq!(second, Err(Error::Busy));
    }

    #[test]
    fn high_priority_is_sent_before_normal_under_strict_priority() {
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(rtu_config()).unwrap();
        let mut transport = LoopbackTransport::new();
        let mut sink = NullSink;

        let normal = engine
            .submit(1, Request::ReadHoldingRegisters(0, 1), Priority::Normal, 0)
            .unwrap();
        let high = engine
            .submit(2, Request::ReadHoldingRegisters(0, 1), Priority::High, 0)
            .unwrap();

        engine.poll(&mut transport, &mut sink, 1, 0);
        // Only the StateChange for the first transaction started should have fired; it must be
        // the high-priority one even though it was submitted second.
        assert_eq!(engine.status(high), Some(TxnState::Sending));
        assert_eq!(engine.status(normal), Some(TxnState::Enqueued));
    }

    #[derive(Default)]
    struct RecordingIdle {
        last_proposed_ms: Option<u64>,
    }

    impl Idle for RecordingIdle {
        fn idle(&mut self, proposed_ms: u64) -> u64 {
            self.last_proposed_ms = Some(proposed_ms);
            proposed_ms
        }
    }

    #[test]
    fn idle_is_not_invoked_with_nothing_pending() {
        let engine: ClientEngine<4, 256, 16> = ClientEngine::new(rtu_config()).unwrap();
        let mut idle = RecordingIdle::default();
        assert_eq!(engine.idle_if_due(&mut idle, 0), None);
        assert_eq!(idle.last_proposed_ms, None);
    }

    #[test]
    fn idle_is_invoked_once_the_deadline_clears_the_threshold() {
        let mut config = rtu_config();
        config.timeouts = crate::config::TimeoutConfig::new(1_000);
        config.idle.idle_threshold_ms = 50;
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(config).unwrap();
        let mut transport = LoopbackTransport::new();
        let mut sink = NullSink;

        engine
            .submit(1, Request::ReadHoldingRegisters(0, 1), Priority::Normal, 0)
            .unwrap();
        engine.poll(&mut transport, &mut sink, 0, 0);

        let mut idle = RecordingIdle::default();
        let slept = engine.idle_if_due(&mut idle, 0);
        assert_eq!(slept, Some(1_000));
        assert_eq!(idle.last_proposed_ms, Some(1_000));
    }

    #[test]
    fn idle_is_skipped_when_the_deadline_is_within_the_threshold() {
        let mut config = rtu_config();
        config.timeouts = crate::config::TimeoutConfig::new(1_000);
        config.idle.idle_threshold_ms = 5_000;
        let mut engine: ClientEngine<4, 256, 16> = ClientEngine::new(config).unwrap();
        let mut transport = LoopbackTransport::new();
        let mut sink = NullSink;

        engine
            .submit(1, Request::ReadHoldingRegisters(0, 1), Priority::Normal, 0)
            .unwrap();
        engine.poll(&mut transport, &mut sink, 0, 0);

        let mut idle = RecordingIdle::default();
        assert_eq!(engine.idle_if_due(&mut idle, 0), None);
        assert_eq!(idle.last_proposed_ms, None);
    }
}
