// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MBAP (TCP) framing: `[transaction_id:2][protocol_id:2][length:2][unit_id:1][pdu]` (§4.2).
//! No silence timing and no checksum — TCP already guarantees byte-accurate, ordered delivery;
//! the only job here is pulling a self-delimited ADU out of the stream once the `length` field
//! says enough bytes have arrived.

use heapless::Vec;

use crate::error::{Error, Result};
use crate::frame::DecodedFrame;
use crate::pdu::Pdu;
use crate::ring::RingBuffer;
use crate::transaction::WireId;

/// Bytes preceding the unit id: transaction id (2) + protocol id (2) + length (2).
pub const HEADER_LEN: usize = 6;
/// The fixed MBAP protocol identifier; any other value is a malformed frame.
pub const PROTOCOL_ID: u16 = 0x0000;
/// Largest possible MBAP ADU: header + unit id + PDU.
pub const MAX_ADU_LEN: usize = HEADER_LEN + 1 + crate::pdu::MAX_PDU_SIZE;

/// Encodes `(transaction_id, unit_id, pdu)` as an MBAP ADU into `out`.
pub fn encode(
    transaction_id: u16,
    unit_id: u8,
    pdu: &Pdu,
    out: &mut Vec<u8, MAX_ADU_LEN>,
) -> Result<()> {
    let length = u16::try_from(1 + pdu.len()).map_err(|_| Error::InvalidArgument)?;
    out.clear();
    out.extend_from_slice(&transaction_id.to_be_bytes())
        .map_err(|_| Error::InvalidArgument)?;
    out.extend_from_slice(&PROTOCOL_ID.to_be_bytes())
        .map_err(|_| Error::InvalidArgument)?;
    out.extend_from_slice(&length.to_be_bytes())
        .map_err(|_| Error::InvalidArgument)?;
    out.push(unit_id).map_err(|_| Error::InvalidArgument)?;
    out.push(pdu.function_code)
        .map_err(|_| Error::InvalidArgument)?;
    out.extend_from_slice(&pdu.payload)
        .map_err(|_| Error::InvalidArgument)
}

/// Computes the total ADU length implied by a partially or fully received MBAP header, so a
/// port can size an incremental read instead of guessing a buffer length up front. Returns
/// `None` until at least [`HEADER_LEN`] bytes of `partial` are available; once they are, returns
/// `HEADER_LEN + length` regardless of whether `length` itself turns out to be valid (the caller
/// still has to check `protocol_id`/`length` before trusting the frame).
#[must_use]
pub fn expected_length(partial: &[u8]) -> Option<usize> {
    if partial.len() < HEADER_LEN {
        return None;
    }
    let length = u16::from_be_bytes([partial[4], partial[5]]) as usize;
    Some(HEADER_LEN + length)
}

/// MBAP decoder: reads the fixed 6-byte header to learn `length`, then waits for `length` more
/// bytes (unit id + PDU) before yielding a frame. Carries no state across `poll()` calls beyond
/// the ring itself, since the `length` field makes framing self-delimiting.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDecoder;

impl TcpDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Attempts to extract one complete ADU from `ring`. Returns `Ok(None)` when the header or
    /// body hasn't fully arrived yet.
    pub fn poll<const N: usize>(&mut self, ring: &mut RingBuffer<N>) -> Result<Option<DecodedFrame>> {
        let mut header = [0u8; HEADER_LEN];
        let peeked = ring.peek(&mut header);
        let Some(adu_len) = expected_length(&header[..peeked]) else {
            return Ok(None);
        };
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;

        if protocol_id != PROTOCOL_ID || length == 0 {
            ring.consume(ring.len());
            return Err(Error::DecodingError);
        }
        if adu_len > MAX_ADU_LEN {
            ring.consume(ring.len());
            return Err(Error::DecodingError);
        }
        if ring.len() < adu_len {
            // Body not fully arrived yet; leave the bytes in the ring.
            return Ok(None);
        }

        let mut buf = [0u8; MAX_ADU_LEN];
        let n = ring.peek(&mut buf[..adu_len]);
        ring.consume(n);

        let unit_id = buf[HEADER_LEN];
        let mut payload = Vec::new();
        payload
            .extend_from_slice(&buf[HEADER_LEN + 2..n])
            .map_err(|_| Error::MalformedFrame)?;
        let pdu = Pdu {
            function_code: buf[HEADER_LEN + 1],
            payload,
        };
        Ok(Some(DecodedFrame::new(
            WireId::Transaction(transaction_id),
            unit_id,
            pdu,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Request;

    #[test]
    fn scenario_b_header_and_pdu_match_wire_bytes() {
        let pdu = Request::ReadHoldingRegisters(0x0000, 10).encode().unwrap();
        let mut out = Vec::new();
        encode(0x0007, 0x01, &pdu, &mut out).unwrap();
        assert_eq!(
            out.as_slice(),
            &[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn decode_round_trip() {
        let pdu = Request::ReadHoldingRegisters(0x0000, 10).encode().unwrap();
        let mut wire = Vec::new();
        encode(0x0007, 0x01, &pdu, &mut wire).unwrap();

        let mut ring: RingBuffer<256> = RingBuffer::new();
        ring.write(&wire);
        let mut decoder = TcpDecoder::new();
        let frame = decoder.poll(&mut ring).unwrap().unwrap();
        assert_eq!(frame.wire_id, WireId::Transaction(0x0007));
        assert_eq!(frame.unit_id, 0x01);
        assert_eq!(frame.pdu, pdu);
        assert!(ring.is_empty());
    }

    #[test]
    fn waits_for_full_header_then_full_body() {
        let pdu = Request::ReadHoldingRegisters(0x0000, 10).encode().unwrap();
        let mut wire = Vec::new();
        encode(0x0007, 0x01, &pdu, &mut wire).unwrap();

        let mut ring: RingBuffer<256> = RingBuffer::new();
        ring.write(&wire[..4]); // partial header
        let mut decoder = TcpDecoder::new();
        assert_eq!(decoder.poll(&mut ring).unwrap(), None);

        ring.write(&wire[4..8]); // full header, partial body
        assert_eq!(decoder.poll(&mut ring).unwrap(), None);

        ring.write(&wire[8..]); // rest of body
        assert!(decoder.poll(&mut ring).unwrap().is_some());
    }

    #[test]
    fn wrong_protocol_id_is_a_decoding_error() {
        let mut ring: RingBuffer<32> = RingBuffer::new();
        ring.write(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03]);
        let mut decoder = TcpDecoder::new();
        assert_eq!(decoder.poll(&mut ring), Err(Error::DecodingError));
    }

    #[test]
    fn zero_length_is_a_decoding_error() {
        let mut ring: RingBuffer<32> = RingBuffer::new();
        ring.write(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        let mut decoder = TcpDecoder::new();
        assert_eq!(decoder.poll(&mut ring), Err(Error::DecodingError));
    }

    #[test]
    fn expected_length_is_none_until_the_header_is_complete() {
        assert_eq!(expected_length(&[0x00, 0x07, 0x00, 0x00, 0x00]), None);
        assert_eq!(
            expected_length(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06]),
            Some(HEADER_LEN + 6)
        );
    }
}
