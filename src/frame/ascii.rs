// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! ASCII framing: `':'` + hex(unit_id) + hex(pdu) + hex(lrc) + `CR LF` (§4.2). Structured as
//! the RTU decoder's closest relative — a re-entrant state machine over the RX ring — but
//! delimiter-based (`':'`/`CR LF`) rather than silence-based, since ASCII framing carries its
//! own explicit start/end markers.

use heapless::Vec;

use crate::crc::lrc;
use crate::error::{Error, Result};
use crate::frame::DecodedFrame;
use crate::pdu::Pdu;
use crate::ring::RingBuffer;
use crate::transaction::WireId;

const COLON: u8 = b':';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Largest possible decoded ASCII payload: unit id + PDU + LRC.
const MAX_BINARY_LEN: usize = 1 + crate::pdu::MAX_PDU_SIZE + 1;
/// Largest possible ASCII frame on the wire: `:` + 2 hex chars per binary byte + CR LF.
pub const MAX_FRAME_LEN: usize = 1 + MAX_BINARY_LEN * 2 + 2;

fn hex_digit(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(Error::MalformedFrame),
    }
}

fn hex_byte(byte: u8) -> [u8; 2] {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    [DIGITS[usize::from(byte >> 4)], DIGITS[usize::from(byte & 0x0F)]]
}

/// Encodes `(unit_id, pdu)` as an ASCII frame into `out`.
pub fn encode(unit_id: u8, pdu: &Pdu, out: &mut Vec<u8, MAX_FRAME_LEN>) -> Result<()> {
    out.clear();
    out.push(COLON).map_err(|_| Error::InvalidArgument)?;
    let mut binary: Vec<u8, MAX_BINARY_LEN> = Vec::new();
    binary.push(unit_id).map_err(|_| Error::InvalidArgument)?;
    binary
        .push(pdu.function_code)
        .map_err(|_| Error::InvalidArgument)?;
    binary
        .extend_from_slice(&pdu.payload)
        .map_err(|_| Error::InvalidArgument)?;
    let checksum = lrc(&binary);
    for &byte in &binary {
        out.extend_from_slice(&hex_byte(byte))
            .map_err(|_| Error::InvalidArgument)?;
    }
    out.extend_from_slice(&hex_byte(checksum))
        .map_err(|_| Error::InvalidArgument)?;
    out.push(CR).map_err(|_| Error::InvalidArgument)?;
    out.push(LF).map_err(|_| Error::InvalidArgument)
}

/// ASCII decoder: stateless across calls beyond the ring itself, since `':'`/`CR LF` mark
/// frame boundaries unambiguously (no silence timing needed, unlike RTU).
#[derive(Debug, Default, Clone, Copy)]
pub struct AsciiDecoder;

impl AsciiDecoder {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Attempts to extract one complete, LRC-validated frame from `ring`.
    pub fn poll<const N: usize>(&mut self, ring: &mut RingBuffer<N>) -> Result<Option<DecodedFrame>> {
        let len = ring.len();
        let mut start = None;
        for i in 0..len {
            if ring.peek_at(i) == Some(COLON) {
                start = Some(i);
                break;
            }
        }
        let Some(start) = start else {
            // No frame start in the buffer at all: drop the garbage, nothing to resynchronize to.
            ring.consume(len);
            return Ok(None);
        };
        if start > 0 {
            ring.consume(start);
        }
        let len = ring.len();

        let mut end = None;
        let mut i = 1;
        while i + 1 < len {
            if ring.peek_at(i) == Some(CR) && ring.peek_at(i + 1) == Some(LF) {
                end = Some(i);
                break;
            }
            i += 1;
        }
        let Some(end) = end else {
            // Frame not complete yet; wait for more bytes.
            return Ok(None);
        };

        let hex_len = end - 1;
        let mut hex_buf = [0u8; MAX_BINARY_LEN * 2];
        if hex_len > hex_buf.len() {
            ring.consume(end + 2);
            return Err(Error::MalformedFrame);
        }
        for (j, slot) in hex_buf.iter_mut().enumerate().take(hex_len) {
            // Position 1 is right after the leading colon.
            *slot = ring.peek_at(1 + j).unwrap_or(0);
        }
        ring.consume(end + 2);

        if hex_len % 2 != 0 {
            return Err(Error::MalformedFrame);
        }
        let byte_len = hex_len / 2;
        if byte_len < 3 {
            return Err(Error::MalformedFrame);
        }
        let mut bytes = [0u8; MAX_BINARY_LEN];
        for k in 0..byte_len {
            let hi = hex_digit(hex_buf[2 * k])?;
            let lo = hex_digit(hex_buf[2 * k + 1])?;
            bytes[k] = (hi << 4) | lo;
        }
        let data = &bytes[..byte_len - 1];
        let received_checksum = bytes[byte_len - 1];
        if lrc(data) != received_checksum {
            return Err(Error::Checksum);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::Request;

    #[test]
    fn encode_decode_round_trip() {
        let pdu = Request::ReadHoldingRegisters(0x0000, 10).encode().unwrap();
        let mut wire: Vec<u8, MAX_FRAME_LEN> = Vec::new();
        encode(0x01, &pdu, &mut wire).unwrap();
        assert_eq!(wire[0], COLON);
        assert_eq!(&wire[wire.len() - 2..], &[CR, LF]);

        let mut ring: RingBuffer<1024> = RingBuffer::new();
        ring.write(&wire);
        let mut decoder = AsciiDecoder::new();
        let frame = decoder.poll(&mut ring).unwrap().unwrap();
        assert_eq!(frame.wire_id, WireId::Unit(0x01));
        assert_eq!(frame.pdu, pdu);
    }

    #[test]
    fn bad_lrc_is_rejected() {
        let pdu = Request::ReadHoldingRegisters(0x0000, 10).encode().unwrap();
        let mut wire: Vec<u8, MAX_FRAME_LEN> = Vec::new();
        encode(0x01, &pdu, &mut wire).unwrap();
        let checksum_hi_index = wire.len() - 4;
        wire[checksum_hi_index] = b'F'; // corrupt one LRC hex digit

        let mut ring: RingBuffer<1024> = RingBuffer::new();
        ring.write(&wire);
        let mut decoder = AsciiDecoder::new();
        assert_eq!(decoder.poll(&mut ring), Err(Error::Checksum));
    }

    #[test]
    fn non_hex_character_is_malformed() {
        let mut ring: RingBuffer<32> = RingBuffer::new();
        ring.write(b":01GG\r\n");
        let mut decoder = AsciiDecoder::new();
        assert_eq!(decoder.poll(&mut ring), Err(Error::MalformedFrame));
    }

    #[test]
    fn incomplete_frame_waits_for_more_bytes() {
        let mut ring: RingBuffer<32> = RingBuffer::new();
        ring.write(b":0103");
        let mut decoder = AsciiDecoder::new();
        assert_eq!(decoder.poll(&mut ring).unwrap(), None);
    }
}
