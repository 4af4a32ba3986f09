// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire framing: RTU, ASCII, and MBAP (TCP) (§4.2). Each framing owns an encoder (produces
//! bytes ready for `transport.send`) and a decoder (a small re-entrant state machine that
//! consumes bytes from a [`crate::ring::RingBuffer`] across `poll()` calls and yields complete,
//! validated frames).

#[cfg(feature = "ascii")]
pub mod ascii;
#[cfg(feature = "rtu")]
pub mod rtu;
#[cfg(feature = "tcp")]
pub mod tcp;

use heapless::Vec;

use crate::config::{Config, Framing};
use crate::error::{Error, Result};
use crate::pdu::Pdu;
use crate::ring::RingBuffer;
use crate::transaction::WireId;

/// A fully decoded, checksum-validated frame: the framing-level identifier, the unit id the
/// frame addressed (meaningful on its own for RTU/ASCII; carried alongside the MBAP
/// transaction id for TCP, which routes on `wire_id` but still needs `unit_id` to target a
/// downstream serial gateway device), and the PDU it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub wire_id: WireId,
    pub unit_id: u8,
    pub pdu: Pdu,
}

impl DecodedFrame {
    #[must_use]
    pub const fn new(wire_id: WireId, unit_id: u8, pdu: Pdu) -> Self {
        Self {
            wire_id,
            unit_id,
            pdu,
        }
    }
}

/// Largest ADU any enabled framing can produce, sized off ASCII's hex expansion (the largest
/// of the three by a wide margin): `:` + 2 hex chars per binary byte (unit id + PDU + LRC) +
/// `CR LF`. Used as a single shared buffer capacity so the client/server engines don't need a
/// const generic per framing.
pub const MAX_ADU_BUF: usize = 1 + (1 + crate::pdu::MAX_PDU_SIZE + 1) * 2 + 2;

/// A framing-agnostic decoder, dispatching to whichever wire framing the engine was
/// constructed with (§4.2). Carries the one framing's own re-entrant state.
pub enum Decoder {
    #[cfg(feature = "rtu")]
    Rtu(rtu::RtuDecoder),
    #[cfg(feature = "ascii")]
    Ascii(ascii::AsciiDecoder),
    #[cfg(feature = "tcp")]
    Tcp(tcp::TcpDecoder),
}

impl Decoder {
    /// Builds the decoder matching `framing`, given the serial silence threshold computed by
    /// the caller for RTU (ignored by ASCII/TCP).
    #[must_use]
    pub fn new(framing: Framing, rtu_silence_threshold_ms: u64) -> Self {
        match framing {
            #[cfg(feature = "rtu")]
            Framing::Rtu => Self::Rtu(rtu::RtuDecoder::new(rtu_silence_threshold_ms)),
            #[cfg(feature = "ascii")]
            Framing::Ascii => Self::Ascii(ascii::AsciiDecoder::new()),
            #[cfg(feature = "tcp")]
            Framing::Tcp => Self::Tcp(tcp::TcpDecoder::new()),
            #[allow(unreachable_patterns)]
            _ => unreachable!("framing variant not enabled by the crate's feature set"),
        }
    }

    /// Attempts to extract one complete frame from `ring`; `now_ms` is only consulted by the
    /// RTU silence timer.
    pub fn poll<const N: usize>(
        &mut self,
        ring: &mut RingBuffer<N>,
        now_ms: u64,
    ) -> Result<Option<DecodedFrame>> {
        match self {
            #[cfg(feature = "rtu")]
            Self::Rtu(d) => d.poll(ring, now_ms),
            #[cfg(feature = "ascii")]
            Self::Ascii(d) => d.poll(ring),
            #[cfg(feature = "tcp")]
            Self::Tcp(d) => d.poll(ring),
        }
    }
}

/// The RTU silence threshold implied by `config`'s serial parameters, or `0` when the `rtu`
/// feature is disabled (the value is then never consulted). Shared by the client and server
/// engines so [`Decoder::new`] always receives a meaningful threshold regardless of framing.
#[must_use]
pub(crate) fn rtu_silence_ms(config: &Config) -> u64 {
    #[cfg(feature = "rtu")]
    {
        rtu::silence_threshold_ms(config.serial.baud_rate)
    }
    #[cfg(not(feature = "rtu"))]
    {
        let _ = config;
        0
    }
}

/// Encodes `(wire_id, unit_id, pdu)` for `framing` into `out`. `wire_id` only matters for TCP,
/// where it supplies the MBAP transaction id; RTU/ASCII address purely by `unit_id`.
pub fn encode(
    framing: Framing,
    wire_id: WireId,
    unit_id: u8,
    pdu: &Pdu,
    out: &mut Vec<u8, MAX_ADU_BUF>,
) -> Result<()> {
    out.clear();
    match framing {
        #[cfg(feature = "rtu")]
        Framing::Rtu => {
            let mut local: Vec<u8, { rtu::MAX_ADU_LEN }> = Vec::new();
            rtu::encode(unit_id, pdu, &mut local)?;
            out.extend_from_slice(&local).map_err(|_| Error::InvalidArgument)
        }
        #[cfg(feature = "ascii")]
        Framing::Ascii => {
            let mut local: Vec<u8, { ascii::MAX_FRAME_LEN }> = Vec::new();
            ascii::encode(unit_id, pdu, &mut local)?;
            out.extend_from_slice(&local).map_err(|_| Error::InvalidArgument)
        }
        #[cfg(feature = "tcp")]
        Framing::Tcp => {
            let transaction_id = match wire_id {
                WireId::Transaction(tid) => tid,
                WireId::Unit(_) => 0,
            };
            let mut local: Vec<u8, { tcp::MAX_ADU_LEN }> = Vec::new();
            tcp::encode(transaction_id, unit_id, pdu, &mut local)?;
            out.extend_from_slice(&local).map_err(|_| Error::InvalidArgument)
        }
        #[allow(unreachable_patterns)]
        _ => Err(Error::Unsupported),
    }
}
