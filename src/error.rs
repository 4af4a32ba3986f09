// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Library error type and the outcome-slot taxonomy used by diagnostics.

use core::fmt;

use crate::pdu::Exception;

/// A specialized [`Result`](core::result::Result) for Modbus operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Every outcome a transaction, a framing attempt, or a PDU operation can terminate in.
///
/// Counters and the trace ring are keyed on this enum rather than on [`Error`] directly so
/// that diagnostics never need to match on error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum OutcomeSlot {
    Ok,
    InvalidArgument,
    Timeout,
    Crc,
    Checksum,
    MalformedFrame,
    DecodingError,
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    ServerDeviceBusy,
    Busy,
    Cancelled,
    Aborted,
    IoError,
    Unsupported,
}

impl OutcomeSlot {
    /// Number of distinct slots, for fixed-size counter arrays.
    pub const COUNT: usize = 17;

    /// Dense index into a `[Counter; Self::COUNT]` array.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Ok => 0,
            Self::InvalidArgument => 1,
            Self::Timeout => 2,
            Self::Crc => 3,
            Self::Checksum => 4,
            Self::MalformedFrame => 5,
            Self::DecodingError => 6,
            Self::IllegalFunction => 7,
            Self::IllegalDataAddress => 8,
            Self::IllegalDataValue => 9,
            Self::ServerDeviceFailure => 10,
            Self::ServerDeviceBusy => 11,
            Self::Busy => 12,
            Self::Cancelled => 13,
            Self::Aborted => 14,
            Self::IoError => 15,
            Self::Unsupported => 16,
        }
    }
}

impl fmt::Display for OutcomeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::InvalidArgument => "invalid argument",
            Self::Timeout => "timeout",
            Self::Crc => "crc error",
            Self::Checksum => "checksum error",
            Self::MalformedFrame => "malformed frame",
            Self::DecodingError => "decoding error",
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::ServerDeviceBusy => "server device busy",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
            Self::IoError => "i/o error",
            Self::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// Modbus engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[non_exhaustive]
pub enum Error {
    /// A request argument is out of range (bad quantity, address overflow, oversized PDU).
    #[cfg_attr(feature = "std", error("invalid argument"))]
    InvalidArgument,
    /// The response deadline elapsed before a matching frame was delivered.
    #[cfg_attr(feature = "std", error("timeout"))]
    Timeout,
    /// RTU CRC-16 mismatch.
    #[cfg_attr(feature = "std", error("crc error"))]
    Crc,
    /// ASCII LRC mismatch.
    #[cfg_attr(feature = "std", error("checksum error"))]
    Checksum,
    /// A frame was too short, had a non-hex character, or otherwise failed structural
    /// validation before checksums were even considered.
    #[cfg_attr(feature = "std", error("malformed frame"))]
    MalformedFrame,
    /// A frame's structure was valid but its header fields were inconsistent (e.g. MBAP
    /// `protocol_id != 0`, a declared byte count that disagrees with the payload).
    #[cfg_attr(feature = "std", error("decoding error"))]
    DecodingError,
    /// The peer returned a Modbus exception response.
    #[cfg_attr(feature = "std", error("exception: {0}"))]
    Exception(Exception),
    /// The transaction pool or a priority queue is at capacity.
    #[cfg_attr(feature = "std", error("busy"))]
    Busy,
    /// The transaction was cancelled by the application.
    #[cfg_attr(feature = "std", error("cancelled"))]
    Cancelled,
    /// The watchdog forced the transaction to terminate.
    #[cfg_attr(feature = "std", error("aborted"))]
    Aborted,
    /// The transport reported a non-recoverable I/O failure.
    #[cfg_attr(feature = "std", error("i/o error"))]
    IoError,
    /// The requested function code or framing is not enabled in this build.
    #[cfg_attr(feature = "std", error("unsupported"))]
    Unsupported,
}

#[cfg(not(feature = "std"))]
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::Timeout => f.write_str("timeout"),
            Self::Crc => f.write_str("crc error"),
            Self::Checksum => f.write_str("checksum error"),
            Self::MalformedFrame => f.write_str("malformed frame"),
            Self::DecodingError => f.write_str("decoding error"),
            Self::Exception(exception) => write!(f, "exception: {exception}"),
            Self::Busy => f.write_str("busy"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Aborted => f.write_str("aborted"),
            Self::IoError => f.write_str("i/o error"),
            Self::Unsupported => f.write_str("unsupported"),
        }
    }
}

impl Error {
    /// The [`OutcomeSlot`] this error is recorded under in counters and the trace ring.
    #[must_use]
    pub const fn outcome_slot(&self) -> OutcomeSlot {
        match self {
            Self::InvalidArgument => OutcomeSlot::InvalidArgument,
            Self::Timeout => OutcomeSlot::Timeout,
            Self::Crc => OutcomeSlot::Crc,
            Self::Checksum => OutcomeSlot::Checksum,
            Self::MalformedFrame => OutcomeSlot::MalformedFrame,
            Self::DecodingError => OutcomeSlot::DecodingError,
            Self::Exception(exception) => exception.outcome_slot(),
            Self::Busy => OutcomeSlot::Busy,
            Self::Cancelled => OutcomeSlot::Cancelled,
            Self::Aborted => OutcomeSlot::Aborted,
            Self::IoError => OutcomeSlot::IoError,
            Self::Unsupported => OutcomeSlot::Unsupported,
        }
    }
}

impl From<Exception> for Error {
    fn from(exception: Exception) -> Self {
        Self::Exception(exception)
    }
}
