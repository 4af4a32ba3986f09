// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Platform-agnostic ISR shim (§4.8): an "am I in an interrupt?" predicate plus the lock-free
//! RX/TX handoff primitives a port wires to real interrupt vectors. Attaching these to an
//! actual interrupt controller, DMA engine, or UART peripheral is the port's job, not this
//! crate's — it only exposes primitives that are safe to call from interrupt context.

use heapless::spsc::{Consumer, Producer};

use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::queue::FrameSpan;
use crate::ring::RingBuffer;

/// Manual interrupt-context flag, the third probe tier `in_isr` falls back to when a port has
/// neither an architecture-specific interrupt-status register nor an RTOS-provided predicate to
/// check first (§4.8). A port's ISR entry/exit shim calls [`set_in_isr`] around the handler body
/// on platforms with no better way to answer the question.
static MANUAL_IN_ISR: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Returns true when called from an interrupt context.
///
/// This crate only offers the manual-flag tier of the probe order described in §4.8; a port
/// that can read an architecture-specific interrupt-status register or an RTOS-provided
/// predicate should prefer that and only fall back to [`set_in_isr`]/`in_isr` when neither is
/// available.
#[must_use]
pub fn in_isr() -> bool {
    MANUAL_IN_ISR.load(core::sync::atomic::Ordering::Acquire)
}

/// Sets the manual interrupt-context flag that [`in_isr`] reports.
pub fn set_in_isr(value: bool) {
    MANUAL_IN_ISR.store(value, core::sync::atomic::Ordering::Release);
}

/// The minimum byte count a chunk must reach before [`on_rx_chunk_from_isr`] will consider it:
/// a unit/slave id plus a function code.
pub const MIN_FRAME_LEN: usize = 2;

/// Appends `bytes` to `rx_ring` and, if they clear the length floor (and, when `check_crc` is
/// set, carry a valid trailing CRC-16), pushes the resulting [`FrameSpan`] onto `rx_slots` for
/// the cooperative task to pick up later. Never allocates and never blocks.
///
/// `bytes` is expected to be one hardware-delivered chunk that already amounts to a complete
/// frame — the common case on MCUs with idle-line-triggered DMA delivery. `check_crc` should be
/// `true` for RTU framing; ASCII and TCP framing defer checksum/structural validation to their
/// task-side decoders once the span is dequeued, so pass `false` for them. A chunk that clears
/// the ring write but fails the length floor or CRC check is silently dropped rather than
/// queued; the task-side decoder will simply see no new frame.
///
/// Returns [`Error::Busy`] if `rx_slots` is already full; the caller is expected to bump an
/// overrun counter and move on rather than retry from interrupt context.
pub fn on_rx_chunk_from_isr<const RX: usize, const SLOTS: usize>(
    rx_ring: &mut RingBuffer<RX>,
    rx_slots: &mut Producer<'_, FrameSpan, SLOTS>,
    bytes: &[u8],
    check_crc: bool,
) -> Result<()> {
    let offset = rx_ring.len();
    rx_ring.write(bytes);

    if bytes.len() < MIN_FRAME_LEN {
        return Ok(());
    }
    if check_crc {
        if bytes.len() < MIN_FRAME_LEN + 2 {
            return Ok(());
        }
        let (payload, trailing_crc) = bytes.split_at(bytes.len() - 2);
        if trailing_crc != crc16(payload).to_be_bytes() {
            return Ok(());
        }
    }

    let id = u16::from(bytes[0]);
    let span = FrameSpan::new(offset, bytes.len(), id);
    rx_slots.enqueue(span).map_err(|_| Error::Busy)
}

/// Returns the next TX [`FrameSpan`] ready to hand to a DMA engine, if one is queued (§4.8).
pub fn try_tx_from_isr<const SLOTS: usize>(
    tx_slots: &mut Consumer<'_, FrameSpan, SLOTS>,
) -> Option<FrameSpan> {
    tx_slots.dequeue()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SlotQueue;

    #[test]
    fn in_isr_reflects_the_manual_flag() {
        set_in_isr(true);
        assert!(in_isr());
        set_in_isr(false);
        assert!(!in_isr());
    }

    #[test]
    fn well_formed_rtu_chunk_is_enqueued() {
        let mut ring: RingBuffer<64> = RingBuffer::new();
        let mut queue: SlotQueue<4> = SlotQueue::new();
        let (mut producer, mut consumer) = queue.split();

        // `01 03 00 00 00 0A` with its CRC-16 appended (`C5 CD`, matching the crc16 reference
        // vector), as the hardware would deliver one idle-line-delimited chunk.
        let chunk = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD];
        on_rx_chunk_from_isr(&mut ring, &mut producer, &chunk, true).unwrap();

        let span = consumer.dequeue().expect("frame span enqueued");
        assert_eq!(span, FrameSpan::new(0, chunk.len(), 0x01));
        assert_eq!(ring.len(), chunk.len());
    }

    #[test]
    fn crc_mismatch_is_dropped_without_enqueueing() {
        let mut ring: RingBuffer<64> = RingBuffer::new();
        let mut queue: SlotQueue<4> = SlotQueue::new();
        let (mut producer, mut consumer) = queue.split();

        let chunk = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00];
        on_rx_chunk_from_isr(&mut ring, &mut producer, &chunk, true).unwrap();

        assert_eq!(consumer.dequeue(), None);
        // Bytes still land in the ring; only the frame handoff was refused.
        assert_eq!(ring.len(), chunk.len());
    }

    #[test]
    fn chunk_below_the_length_floor_is_dropped() {
        let mut ring: RingBuffer<16> = RingBuffer::new();
        let mut queue: SlotQueue<4> = SlotQueue::new();
        let (mut producer, mut consumer) = queue.split();

        on_rx_chunk_from_isr(&mut ring, &mut producer, &[0x01], false).unwrap();

        assert_eq!(consumer.dequeue(), None);
    }

    #[test]
    fn full_slot_queue_reports_busy() {
        let mut ring: RingBuffer<64> = RingBuffer::new();
        let mut queue: SlotQueue<3> = SlotQueue::new();
        let (mut producer, _consumer) = queue.split();

        let chunk = [0x01, 0x03];
        assert!(on_rx_chunk_from_isr(&mut ring, &mut producer, &chunk, false).is_ok());
        assert!(on_rx_chunk_from_isr(&mut ring, &mut producer, &chunk, false).is_ok());
        assert_eq!(
            on_rx_chunk_from_isr(&mut ring, &mut producer, &chunk, false),
            Err(Error::Busy)
        );
    }

    #[test]
    fn tx_spans_are_handed_to_the_isr_in_order() {
        let mut queue: SlotQueue<4> = SlotQueue::new();
        let (mut producer, mut consumer) = queue.split();
        producer.enqueue(FrameSpan::new(0, 8, 7)).unwrap();

        assert_eq!(try_tx_from_isr(&mut consumer), Some(FrameSpan::new(0, 8, 7)));
        assert_eq!(try_tx_from_isr(&mut consumer), None);
    }
}
