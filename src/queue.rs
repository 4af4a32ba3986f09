// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed-capacity SPSC slot queues carrying frame spans, used by the ISR-safe path (§4.8) to
//! hand complete RX frames to the cooperative task and TX frames the other way.

use heapless::spsc::{Consumer, Producer, Queue};

/// A span describing a frame buffered elsewhere (typically in a [`crate::ring::RingBuffer`]):
/// a byte offset, a length, and the unit/transaction id the ISR already extracted while
/// validating minimal framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    pub offset: usize,
    pub len: usize,
    pub id: u16,
}

impl FrameSpan {
    #[must_use]
    pub const fn new(offset: usize, len: usize, id: u16) -> Self {
        Self { offset, len, id }
    }
}

/// A fixed-capacity single-producer/single-consumer queue of [`FrameSpan`]s.
pub struct SlotQueue<const N: usize> {
    inner: Queue<FrameSpan, N>,
}

impl<const N: usize> SlotQueue<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Queue::new(),
        }
    }

    /// Splits the queue into its producer/consumer halves, the same way the ISR side and the
    /// cooperative task side each get their own handle without shared mutable access.
    pub fn split(&mut self) -> (Producer<'_, FrameSpan, N>, Consumer<'_, FrameSpan, N>) {
        self.inner.split()
    }
}

impl<const N: usize> Default for SlotQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produced_spans_are_consumed_in_order() {
        let mut queue: SlotQueue<4> = SlotQueue::new();
        let (mut producer, mut consumer) = queue.split();
        producer.enqueue(FrameSpan::new(0, 8, 1)).unwrap();
        producer.enqueue(FrameSpan::new(8, 4, 2)).unwrap();
        assert_eq!(consumer.dequeue(), Some(FrameSpan::new(0, 8, 1)));
        assert_eq!(consumer.dequeue(), Some(FrameSpan::new(8, 4, 2)));
        assert_eq!(consumer.dequeue(), None);
    }

    #[test]
    fn full_queue_reports_busy_to_the_isr() {
        // heapless::spsc::Queue<T, N> holds at most N - 1 elements.
        let mut queue: SlotQueue<3> = SlotQueue::new();
        let (mut producer, _consumer) = queue.split();
        assert!(producer.enqueue(FrameSpan::new(0, 1, 0)).is_ok());
        assert!(producer.enqueue(FrameSpan::new(1, 1, 0)).is_ok());
        assert!(producer.enqueue(FrameSpan::new(2, 1, 0)).is_err());
    }
}
