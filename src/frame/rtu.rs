// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU framing: `[unit_id][pdu][crc16_le]`, frame boundaries detected by inter-frame silence
//! (§4.2). The CRC itself is [`crate::crc::crc16`], carried over unchanged from the codec this
//! crate's RTU support is grounded on.

use heapless::Vec;

use crate::crc::crc16;
use crate::error::{Error, Result};
use crate::frame::DecodedFrame;
use crate::pdu::Pdu;
use crate::ring::RingBuffer;
use crate::transaction::WireId;

/// Largest possible RTU ADU: 1 (unit id) + 253 (PDU) + 2 (CRC).
pub const MAX_ADU_LEN: usize = 1 + crate::pdu::MAX_PDU_SIZE + 2;

/// Computes the inter-frame silence threshold (3.5 character-times) for `baud_rate`, with the
/// 1.75 ms floor for baud rates above 19200 (§4.2). Rounds up to whole milliseconds so the
/// engine never mistakes an in-progress frame for silence.
#[must_use]
pub fn silence_threshold_ms(baud_rate: u32) -> u64 {
    if baud_rate > 19200 {
        return 2;
    }
    // 11 bit-times per character: start + 8 data + parity + stop.
    let char_time_us = 11_000_000u64 / u64::from(baud_rate.max(1));
    let threshold_us = char_time_us * 35 / 10;
    (threshold_us + 999) / 1000
}

/// Encodes `(unit_id, pdu)` into `out` as `[unit_id][pdu][crc_lo][crc_hi]`.
pub fn encode(unit_id: u8, pdu: &Pdu, out: &mut Vec<u8, MAX_ADU_LEN>) -> Result<()> {
    out.clear();
    out.push(unit_id).map_err(|_| Error::InvalidArgument)?;
    out.push(pdu.function_code)
        .map_err(|_| Error::InvalidArgument)?;
    out.extend_from_slice(&pdu.payload)
        .map_err(|_| Error::InvalidArgument)?;
    let crc = crc16(out);
    out.extend_from_slice(&crc.to_be_bytes())
        .map_err(|_| Error::InvalidArgument)
}

/// RTU decoder state machine: `Idle -> Receiving -> (silence) -> FrameReady -> Delivered |
/// Error`. Re-entrant across `poll()` calls; carries only a length watermark (to detect new
/// bytes arriving) and a last-activity timestamp, per §4.2.
pub struct RtuDecoder {
    silence_threshold_ms: u64,
    last_activity_ms: Option<u64>,
    last_observed_len: usize,
}

impl RtuDecoder {
    #[must_use]
    pub const fn new(silence_threshold_ms: u64) -> Self {
        Self {
            silence_threshold_ms,
            last_activity_ms: None,
            last_observed_len: 0,
        }
    }

    /// Attempts to extract one complete, CRC-validated frame from `ring`. Returns `Ok(None)`
    /// when more bytes or more silence are needed. On a CRC or length failure the offending
    /// bytes are still consumed (the decoder resynchronizes by discarding the whole span
    /// delimited by silence) and `Err` is returned so the caller can count the failure.
    pub fn poll<const N: usize>(
        &mut self,
        ring: &mut RingBuffer<N>,
        now_ms: u64,
    ) -> Result<Option<DecodedFrame>> {
        let len = ring.len();
        if len == 0 {
            self.last_activity_ms = None;
            self.last_observed_len = 0;
            return Ok(None);
        }
        if len != self.last_observed_len {
            self.last_observed_len = len;
            self.last_activity_ms = Some(now_ms);
            return Ok(None);
        }
        let last_activity = match self.last_activity_ms {
            Some(t) => t,
            None => {
                self.last_activity_ms = Some(now_ms);
                return Ok(None);
            }
        };
        if now_ms.saturating_sub(last_activity) < self.silence_threshold_ms {
            return Ok(None);
        }

        self.last_observed_len = 0;
        self.last_activity_ms = None;

        if len > MAX_ADU_LEN {
            // Oversized span: discard everything delimited by this silence window rather than
            // leaving a remainder to be misread as the start of the next frame.
            ring.consume(len);
            return Err(Error::MalformedFrame);
        }

        let mut buf = [0u8; MAX_ADU_LEN];
        let n = ring.peek(&mut buf[..len]);
        ring.consume(n);

        if n < 4 {
            return Err(Error::MalformedFrame);
        }
        let (data, crc_bytes) = buf[..n].split_at(n - 2);
        let computed = crc16(data);
        let received = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        if computed != received {
            return Err(Error::Crc);
        }
        let unit_id = data[0];
        let mut payload = Vec::new();
        payload
            .extend_from_slice(&data[2..])
            .map_err(|_| Error::MalformedFrame)?;
        let pdu = Pdu {
            function_code: data[1],
            payload,
        };
        Ok(Some(DecodedFrame::new(WireId::Unit(unit_id), unit_id, pdu)))
    }
}
