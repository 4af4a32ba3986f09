// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured diagnostic events, function-code/outcome counters, and a bounded trace ring
//! (§4.6).

use heapless::Deque;

use crate::error::OutcomeSlot;

/// Which side of the engine emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The kind of a diagnostic event. Carries no payload beyond what [`Event`] already does; the
/// tag alone is enough to drive counters and logging severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventKind {
    StateChange,
    RxReady,
    TxSent,
    Timeout,
    Retry,
    TxComplete,
    Exception,
    Drop,
}

/// A single structured diagnostic event (§4.6): at most 16 bytes, cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub timestamp_ms: u64,
    pub role: Role,
    pub function_code: u8,
    pub kind: EventKind,
    pub outcome: OutcomeSlot,
}

impl Event {
    #[must_use]
    pub const fn new(
        timestamp_ms: u64,
        role: Role,
        function_code: u8,
        kind: EventKind,
        outcome: OutcomeSlot,
    ) -> Self {
        Self {
            timestamp_ms,
            role,
            function_code,
            kind,
            outcome,
        }
    }

    /// Mirrors this event to the `log` facade, at a severity keyed off the outcome slot:
    /// `Ok`/in-flight progress at `trace`, retryable outcomes at `debug`, terminal failures at
    /// `warn`. No-op unless the `std` feature (which pulls in `log`) is enabled.
    #[allow(unused_variables)]
    pub fn mirror_to_log(&self) {
        #[cfg(feature = "std")]
        {
            match self.outcome {
                OutcomeSlot::Ok => log::trace!(
                    "fc={:#04x} kind={:?} outcome={}",
                    self.function_code,
                    self.kind,
                    self.outcome
                ),
                OutcomeSlot::Timeout
                | OutcomeSlot::Crc
                | OutcomeSlot::Checksum
                | OutcomeSlot::Busy => log::debug!(
                    "fc={:#04x} kind={:?} outcome={}",
                    self.function_code,
                    self.kind,
                    self.outcome
                ),
                _ => log::warn!(
                    "fc={:#04x} kind={:?} outcome={}",
                    self.function_code,
                    self.kind,
                    self.outcome
                ),
            }
        }
    }
}

/// Per-function-code and per-outcome-slot counters, plus a bounded trace ring of recent
/// events. `TRACE_DEPTH` is the compile-time trace ring capacity (typical 64-256, §3).
pub struct Diagnostics<const TRACE_DEPTH: usize> {
    function_code_counts: [u32; 256],
    outcome_counts: [u32; OutcomeSlot::COUNT],
    trace: Deque<Event, TRACE_DEPTH>,
    counters_enabled: bool,
    trace_enabled: bool,
}

/// A consistent point-in-time copy of the counters (§4.6: "`snapshot()` returns a consistent
/// copy").
#[derive(Debug, Clone)]
pub struct CountersSnapshot {
    pub function_code_counts: [u32; 256],
    pub outcome_counts: [u32; OutcomeSlot::COUNT],
}

impl CountersSnapshot {
    #[must_use]
    pub fn is_all_zero(&self) -> bool {
        self.function_code_counts.iter().all(|&c| c == 0)
            && self.outcome_counts.iter().all(|&c| c == 0)
    }
}

impl<const TRACE_DEPTH: usize> Diagnostics<TRACE_DEPTH> {
    #[must_use]
    pub fn new(counters_enabled: bool, trace_enabled: bool) -> Self {
        Self {
            function_code_counts: [0; 256],
            outcome_counts: [0; OutcomeSlot::COUNT],
            trace: Deque::new(),
            counters_enabled,
            trace_enabled,
        }
    }

    /// Records `event`: increments counters (if enabled), pushes it onto the trace ring
    /// (evicting the oldest entry if full, if enabled), and mirrors it to `log`.
    pub fn record(&mut self, event: Event) {
        if self.counters_enabled {
            self.function_code_counts[usize::from(event.function_code)] =
                self.function_code_counts[usize::from(event.function_code)].saturating_add(1);
            let idx = event.outcome.index();
            self.outcome_counts[idx] = self.outcome_counts[idx].saturating_add(1);
        }
        if self.trace_enabled {
            if self.trace.is_full() {
                self.trace.pop_front();
            }
            // Deque::push_back only fails when full, which we just guaranteed isn't the case.
            let _ = self.trace.push_back(event);
        }
        event.mirror_to_log();
    }

    /// A consistent copy of the counters (word-sized reads; see §5's relaxed-ordering note —
    /// single-threaded here, so "consistent" is trivially true).
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            function_code_counts: self.function_code_counts,
            outcome_counts: self.outcome_counts,
        }
    }

    /// Zeroes every counter (does not touch the trace ring).
    pub fn reset_counters(&mut self) {
        self.function_code_counts = [0; 256];
        self.outcome_counts = [0; OutcomeSlot::COUNT];
    }

    /// Iterates the trace ring, oldest first.
    pub fn trace(&self) -> impl Iterator<Item = &Event> {
        self.trace.iter()
    }

    #[must_use]
    pub fn outcome_count(&self, slot: OutcomeSlot) -> u32 {
        self.outcome_counts[slot.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: OutcomeSlot) -> Event {
        Event::new(0, Role::Client, 0x03, EventKind::TxComplete, outcome)
    }

    #[test]
    fn reset_counters_is_idempotent_with_snapshot() {
        let mut diag: Diagnostics<8> = Diagnostics::new(true, true);
        diag.record(event(OutcomeSlot::Ok));
        diag.record(event(OutcomeSlot::Timeout));
        diag.reset_counters();
        assert!(diag.snapshot().is_all_zero());
    }

    #[test]
    fn trace_ring_is_bounded() {
        let mut diag: Diagnostics<2> = Diagnostics::new(true, true);
        for _ in 0..5 {
            diag.record(event(OutcomeSlot::Ok));
        }
        assert_eq!(diag.trace().count(), 2);
    }

    #[test]
    fn counters_disabled_keeps_everything_zero() {
        let mut diag: Diagnostics<4> = Diagnostics::new(false, false);
        diag.record(event(OutcomeSlot::Timeout));
        assert!(diag.snapshot().is_all_zero());
        assert_eq!(diag.trace().count(), 0);
    }
}
