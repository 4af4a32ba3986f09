// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol Data Units: function codes, typed requests/responses, exceptions, and the
//! encode/decode codec between them.

use byteorder::{BigEndian, ByteOrder};
use heapless::Vec;

use crate::error::{Error, OutcomeSlot, Result};

/// A Modbus register/coil address (`0..=65535`).
pub type Address = u16;

/// Number of items to process in one request (`0..=65535`).
pub type Quantity = u16;

/// A single bit.
pub type Coil = bool;

/// A 16-bit data item, big-endian on the wire.
pub type Word = u16;

/// Maximum size of a whole PDU (function code + payload), per the Modbus specification.
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum size of a PDU's payload (`MAX_PDU_SIZE` minus the one function-code byte).
pub const MAX_PAYLOAD_SIZE: usize = MAX_PDU_SIZE - 1;

/// Per-function-code quantity ceilings (§3).
pub const MAX_READ_COILS: usize = 2000;
pub const MAX_WRITE_COILS: usize = 1968;
pub const MAX_READ_REGISTERS: usize = 125;
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum size of a Report Server ID payload (vendor-specific identifier + run status byte).
pub const MAX_SERVER_ID_LEN: usize = MAX_PAYLOAD_SIZE - 1;

pub mod function {
    //! Raw function-code byte values (§3).
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const READ_EXCEPTION_STATUS: u8 = 0x07;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
    pub const REPORT_SERVER_ID: u8 = 0x11;
    pub const MASK_WRITE_REGISTER: u8 = 0x16;
    pub const READ_WRITE_MULTIPLE_REGISTERS: u8 = 0x17;
    /// Bit set in the function-code byte of an exception response.
    pub const EXCEPTION_BIT: u8 = 0x80;
}

/// A Modbus exception code, as returned in the payload of an exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Exception {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl Exception {
    /// The [`OutcomeSlot`] a transaction terminates in when the peer returns this exception.
    ///
    /// `Acknowledge`, `MemoryParityError`, `GatewayPathUnavailable` and `GatewayTargetDevice`
    /// have no dedicated slot in the outcome taxonomy (§7); they are folded into
    /// `ServerDeviceFailure`, the closest "something went wrong on the peer" bucket.
    #[must_use]
    pub const fn outcome_slot(self) -> OutcomeSlot {
        match self {
            Self::IllegalFunction => OutcomeSlot::IllegalFunction,
            Self::IllegalDataAddress => OutcomeSlot::IllegalDataAddress,
            Self::IllegalDataValue => OutcomeSlot::IllegalDataValue,
            Self::ServerDeviceBusy => OutcomeSlot::ServerDeviceBusy,
            Self::ServerDeviceFailure
            | Self::Acknowledge
            | Self::MemoryParityError
            | Self::GatewayPathUnavailable
            | Self::GatewayTargetDevice => OutcomeSlot::ServerDeviceFailure,
        }
    }
}

impl core::fmt::Display for Exception {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Self::IllegalFunction => "illegal function",
            Self::IllegalDataAddress => "illegal data address",
            Self::IllegalDataValue => "illegal data value",
            Self::ServerDeviceFailure => "server device failure",
            Self::Acknowledge => "acknowledge",
            Self::ServerDeviceBusy => "server device busy",
            Self::MemoryParityError => "memory parity error",
            Self::GatewayPathUnavailable => "gateway path unavailable",
            Self::GatewayTargetDevice => "gateway target device failed to respond",
        };
        f.write_str(text)
    }
}

impl TryFrom<u8> for Exception {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x01 => Ok(Self::IllegalFunction),
            0x02 => Ok(Self::IllegalDataAddress),
            0x03 => Ok(Self::IllegalDataValue),
            0x04 => Ok(Self::ServerDeviceFailure),
            0x05 => Ok(Self::Acknowledge),
            0x06 => Ok(Self::ServerDeviceBusy),
            0x08 => Ok(Self::MemoryParityError),
            0x0A => Ok(Self::GatewayPathUnavailable),
            0x0B => Ok(Self::GatewayTargetDevice),
            _ => Err(Error::DecodingError),
        }
    }
}

/// A Protocol Data Unit: a function code plus a fixed-capacity payload, never heap-allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub function_code: u8,
    pub payload: Vec<u8, MAX_PAYLOAD_SIZE>,
}

impl Pdu {
    /// Total size on the wire (function code byte included).
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Whether bit 7 of the function code is set, i.e. this PDU is an exception response.
    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.function_code & function::EXCEPTION_BIT != 0
    }

    fn new(function_code: u8) -> Self {
        Self {
            function_code,
            payload: Vec::new(),
        }
    }

    fn push_u8(&mut self, value: u8) -> Result<()> {
        self.payload.push(value).map_err(|_| Error::InvalidArgument)
    }

    fn push_u16(&mut self, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.payload
            .extend_from_slice(&buf)
            .map_err(|_| Error::InvalidArgument)
    }
}

/// A request from the client (master) to the server (slave).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Vec<Coil, MAX_WRITE_COILS>),
    WriteMultipleRegisters(Address, Vec<Word, MAX_WRITE_REGISTERS>),
    ReadWriteMultipleRegisters(Address, Quantity, Address, Vec<Word, MAX_WRITE_REGISTERS>),
    ReadExceptionStatus,
    ReportServerId,
    MaskWriteRegister(Address, Word, Word),
}

impl Request {
    #[must_use]
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils(..) => function::READ_COILS,
            Self::ReadDiscreteInputs(..) => function::READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters(..) => function::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters(..) => function::READ_INPUT_REGISTERS,
            Self::WriteSingleCoil(..) => function::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister(..) => function::WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils(..) => function::WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters(..) => function::WRITE_MULTIPLE_REGISTERS,
            Self::ReadWriteMultipleRegisters(..) => function::READ_WRITE_MULTIPLE_REGISTERS,
            Self::ReadExceptionStatus => function::READ_EXCEPTION_STATUS,
            Self::ReportServerId => function::REPORT_SERVER_ID,
            Self::MaskWriteRegister(..) => function::MASK_WRITE_REGISTER,
        }
    }

    /// Encodes this request into a [`Pdu`], validating quantities and byte-count invariants
    /// (§4.1). Never mutates any engine state; failures are reported synchronously.
    pub fn encode(&self) -> Result<Pdu> {
        let mut pdu = Pdu::new(self.function_code());
        match self {
            Self::ReadCoils(addr, qty) | Self::ReadDiscreteInputs(addr, qty) => {
                check_read_quantity(*qty, MAX_READ_COILS)?;
                pdu.push_u16(*addr)?;
                pdu.push_u16(*qty)?;
            }
            Self::ReadHoldingRegisters(addr, qty) | Self::ReadInputRegisters(addr, qty) => {
                check_read_quantity(*qty, MAX_READ_REGISTERS)?;
                pdu.push_u16(*addr)?;
                pdu.push_u16(*qty)?;
            }
            Self::WriteSingleCoil(addr, value) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(bool_to_coil_word(*value))?;
            }
            Self::WriteSingleRegister(addr, value) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(*value)?;
            }
            Self::WriteMultipleCoils(addr, coils) => {
                check_write_quantity(coils.len(), MAX_WRITE_COILS)?;
                pdu.push_u16(*addr)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u16(coils.len() as u16)?;
                let packed = pack_coils(coils)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u8(packed.len() as u8)?;
                pdu.payload
                    .extend_from_slice(&packed)
                    .map_err(|_| Error::InvalidArgument)?;
            }
            Self::WriteMultipleRegisters(addr, regs) => {
                check_write_quantity(regs.len(), MAX_WRITE_REGISTERS)?;
                pdu.push_u16(*addr)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u16(regs.len() as u16)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u8((regs.len() * 2) as u8)?;
                for &word in regs {
                    pdu.push_u16(word)?;
                }
            }
            Self::ReadWriteMultipleRegisters(read_addr, read_qty, write_addr, write_regs) => {
                check_read_quantity(*read_qty, MAX_READ_REGISTERS)?;
                check_write_quantity(write_regs.len(), MAX_WRITE_REGISTERS)?;
                pdu.push_u16(*read_addr)?;
                pdu.push_u16(*read_qty)?;
                pdu.push_u16(*write_addr)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u16(write_regs.len() as u16)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u8((write_regs.len() * 2) as u8)?;
                for &word in write_regs {
                    pdu.push_u16(word)?;
                }
            }
            Self::ReadExceptionStatus | Self::ReportServerId => {}
            Self::MaskWriteRegister(addr, and_mask, or_mask) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(*and_mask)?;
                pdu.push_u16(*or_mask)?;
            }
        }
        if pdu.len() > MAX_PDU_SIZE {
            return Err(Error::InvalidArgument);
        }
        Ok(pdu)
    }

    /// Parses an incoming request PDU (server side).
    pub fn parse(pdu: &Pdu) -> Result<Self> {
        let payload = pdu.payload.as_slice();
        match pdu.function_code {
            function::READ_COILS => {
                let (addr, qty) = read_addr_qty(payload)?;
                check_read_quantity(qty, MAX_READ_COILS)?;
                Ok(Self::ReadCoils(addr, qty))
            }
            function::READ_DISCRETE_INPUTS => {
                let (addr, qty) = read_addr_qty(payload)?;
                check_read_quantity(qty, MAX_READ_COILS)?;
                Ok(Self::ReadDiscreteInputs(addr, qty))
            }
            function::READ_HOLDING_REGISTERS => {
                let (addr, qty) = read_addr_qty(payload)?;
                check_read_quantity(qty, MAX_READ_REGISTERS)?;
                Ok(Self::ReadHoldingRegisters(addr, qty))
            }
            function::READ_INPUT_REGISTERS => {
                let (addr, qty) = read_addr_qty(payload)?;
                check_read_quantity(qty, MAX_READ_REGISTERS)?;
                Ok(Self::ReadInputRegisters(addr, qty))
            }
            function::WRITE_SINGLE_COIL => {
                if payload.len() != 4 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let raw = BigEndian::read_u16(&payload[2..4]);
                Ok(Self::WriteSingleCoil(addr, coil_word_to_bool(raw)?))
            }
            function::WRITE_SINGLE_REGISTER => {
                if payload.len() != 4 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let value = BigEndian::read_u16(&payload[2..4]);
                Ok(Self::WriteSingleRegister(addr, value))
            }
            function::WRITE_MULTIPLE_COILS => {
                if payload.len() < 5 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let qty = BigEndian::read_u16(&payload[2..4]);
                check_write_quantity(qty as usize, MAX_WRITE_COILS)?;
                let byte_count = payload[4] as usize;
                let packed = &payload[5..];
                if byte_count != packed.len() || byte_count != packed_coils_len(qty as usize) {
                    return Err(Error::DecodingError);
                }
                Ok(Self::WriteMultipleCoils(addr, unpack_coils(packed, qty)?))
            }
            function::WRITE_MULTIPLE_REGISTERS => {
                if payload.len() < 5 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let qty = BigEndian::read_u16(&payload[2..4]);
                check_write_quantity(qty as usize, MAX_WRITE_REGISTERS)?;
                let byte_count = payload[4] as usize;
                let words = &payload[5..];
                if byte_count != words.len() || byte_count != qty as usize * 2 {
                    return Err(Error::DecodingError);
                }
                Ok(Self::WriteMultipleRegisters(addr, read_words(words, qty)?))
            }
            function::READ_WRITE_MULTIPLE_REGISTERS => {
                if payload.len() < 9 {
                    return Err(Error::DecodingError);
                }
                let read_addr = BigEndian::read_u16(&payload[0..2]);
                let read_qty = BigEndian::read_u16(&payload[2..4]);
                let write_addr = BigEndian::read_u16(&payload[4..6]);
                let write_qty = BigEndian::read_u16(&payload[6..8]);
                check_read_quantity(read_qty, MAX_READ_REGISTERS)?;
                check_write_quantity(write_qty as usize, MAX_WRITE_REGISTERS)?;
                let byte_count = payload[8] as usize;
                let words = &payload[9..];
                if byte_count != words.len() || byte_count != write_qty as usize * 2 {
                    return Err(Error::DecodingError);
                }
                Ok(Self::ReadWriteMultipleRegisters(
                    read_addr,
                    read_qty,
                    write_addr,
                    read_words(words, write_qty)?,
                ))
            }
            function::READ_EXCEPTION_STATUS => Ok(Self::ReadExceptionStatus),
            function::REPORT_SERVER_ID => Ok(Self::ReportServerId),
            function::MASK_WRITE_REGISTER => {
                if payload.len() != 6 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let and_mask = BigEndian::read_u16(&payload[2..4]);
                let or_mask = BigEndian::read_u16(&payload[4..6]);
                Ok(Self::MaskWriteRegister(addr, and_mask, or_mask))
            }
            _ => Err(Error::Unsupported),
        }
    }
}

/// A successful response from the server (slave) to the client (master).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Response {
    ReadCoils(Vec<Coil, MAX_READ_COILS>),
    ReadDiscreteInputs(Vec<Coil, MAX_READ_COILS>),
    ReadHoldingRegisters(Vec<Word, MAX_READ_REGISTERS>),
    ReadInputRegisters(Vec<Word, MAX_READ_REGISTERS>),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Quantity),
    WriteMultipleRegisters(Address, Quantity),
    ReadWriteMultipleRegisters(Vec<Word, MAX_READ_REGISTERS>),
    ReadExceptionStatus(u8),
    ReportServerId(Vec<u8, MAX_SERVER_ID_LEN>),
    MaskWriteRegister(Address, Word, Word),
}

impl Response {
    #[must_use]
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils(_) => function::READ_COILS,
            Self::ReadDiscreteInputs(_) => function::READ_DISCRETE_INPUTS,
            Self::ReadHoldingRegisters(_) => function::READ_HOLDING_REGISTERS,
            Self::ReadInputRegisters(_) => function::READ_INPUT_REGISTERS,
            Self::WriteSingleCoil(..) => function::WRITE_SINGLE_COIL,
            Self::WriteSingleRegister(..) => function::WRITE_SINGLE_REGISTER,
            Self::WriteMultipleCoils(..) => function::WRITE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters(..) => function::WRITE_MULTIPLE_REGISTERS,
            Self::ReadWriteMultipleRegisters(_) => function::READ_WRITE_MULTIPLE_REGISTERS,
            Self::ReadExceptionStatus(_) => function::READ_EXCEPTION_STATUS,
            Self::ReportServerId(_) => function::REPORT_SERVER_ID,
            Self::MaskWriteRegister(..) => function::MASK_WRITE_REGISTER,
        }
    }

    /// Encodes this response into a [`Pdu`] (server side).
    pub fn encode(&self) -> Result<Pdu> {
        let mut pdu = Pdu::new(self.function_code());
        match self {
            Self::ReadCoils(bits) | Self::ReadDiscreteInputs(bits) => {
                let packed = pack_coils(bits)?;
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u8(packed.len() as u8)?;
                pdu.payload
                    .extend_from_slice(&packed)
                    .map_err(|_| Error::InvalidArgument)?;
            }
            Self::ReadHoldingRegisters(regs)
            | Self::ReadInputRegisters(regs)
            | Self::ReadWriteMultipleRegisters(regs) => {
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u8((regs.len() * 2) as u8)?;
                for &word in regs {
                    pdu.push_u16(word)?;
                }
            }
            Self::WriteSingleCoil(addr, value) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(bool_to_coil_word(*value))?;
            }
            Self::WriteSingleRegister(addr, value) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(*value)?;
            }
            Self::WriteMultipleCoils(addr, qty) | Self::WriteMultipleRegisters(addr, qty) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(*qty)?;
            }
            Self::ReadExceptionStatus(status) => {
                pdu.push_u8(*status)?;
            }
            Self::ReportServerId(data) => {
                #[allow(clippy::cast_possible_truncation)]
                pdu.push_u8(data.len() as u8)?;
                pdu.payload
                    .extend_from_slice(data)
                    .map_err(|_| Error::InvalidArgument)?;
            }
            Self::MaskWriteRegister(addr, and_mask, or_mask) => {
                pdu.push_u16(*addr)?;
                pdu.push_u16(*and_mask)?;
                pdu.push_u16(*or_mask)?;
            }
        }
        Ok(pdu)
    }

    /// Parses a response PDU against the `request` that produced it (client side). The
    /// original request is needed to know the expected quantity/length of read results.
    pub fn parse(request: &Request, pdu: &Pdu) -> Result<Self> {
        if pdu.is_exception() {
            let exception = parse_exception(pdu)?.1;
            return Err(Error::Exception(exception));
        }
        if pdu.function_code != request.function_code() {
            return Err(Error::DecodingError);
        }
        let payload = pdu.payload.as_slice();
        match request {
            Request::ReadCoils(_, qty) => Ok(Self::ReadCoils(parse_packed_coils(payload, *qty)?)),
            Request::ReadDiscreteInputs(_, qty) => {
                Ok(Self::ReadDiscreteInputs(parse_packed_coils(payload, *qty)?))
            }
            Request::ReadHoldingRegisters(_, qty) => Ok(Self::ReadHoldingRegisters(
                parse_register_block(payload, *qty)?,
            )),
            Request::ReadInputRegisters(_, qty) => Ok(Self::ReadInputRegisters(
                parse_register_block(payload, *qty)?,
            )),
            Request::WriteSingleCoil(..) => {
                if payload.len() != 4 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let raw = BigEndian::read_u16(&payload[2..4]);
                Ok(Self::WriteSingleCoil(addr, coil_word_to_bool(raw)?))
            }
            Request::WriteSingleRegister(..) => {
                if payload.len() != 4 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let value = BigEndian::read_u16(&payload[2..4]);
                Ok(Self::WriteSingleRegister(addr, value))
            }
            Request::WriteMultipleCoils(..) => {
                if payload.len() != 4 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let qty = BigEndian::read_u16(&payload[2..4]);
                Ok(Self::WriteMultipleCoils(addr, qty))
            }
            Request::WriteMultipleRegisters(..) => {
                if payload.len() != 4 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let qty = BigEndian::read_u16(&payload[2..4]);
                Ok(Self::WriteMultipleRegisters(addr, qty))
            }
            Request::ReadWriteMultipleRegisters(_, read_qty, ..) => Ok(
                Self::ReadWriteMultipleRegisters(parse_register_block(payload, *read_qty)?),
            ),
            Request::ReadExceptionStatus => {
                if payload.len() != 1 {
                    return Err(Error::DecodingError);
                }
                Ok(Self::ReadExceptionStatus(payload[0]))
            }
            Request::ReportServerId => {
                if payload.is_empty() {
                    return Err(Error::DecodingError);
                }
                let byte_count = payload[0] as usize;
                let data = &payload[1..];
                if byte_count != data.len() {
                    return Err(Error::DecodingError);
                }
                let mut out = Vec::new();
                out.extend_from_slice(data).map_err(|_| Error::DecodingError)?;
                Ok(Self::ReportServerId(out))
            }
            Request::MaskWriteRegister(..) => {
                if payload.len() != 6 {
                    return Err(Error::DecodingError);
                }
                let addr = BigEndian::read_u16(&payload[0..2]);
                let and_mask = BigEndian::read_u16(&payload[2..4]);
                let or_mask = BigEndian::read_u16(&payload[4..6]);
                Ok(Self::MaskWriteRegister(addr, and_mask, or_mask))
            }
        }
    }
}

/// Encodes a two-byte exception PDU: `[original_fc | 0x80, exception_code]`.
#[must_use]
pub fn encode_exception(function_code: u8, exception: Exception) -> Pdu {
    let mut pdu = Pdu::new(function_code | function::EXCEPTION_BIT);
    // Infallible: a single byte always fits MAX_PAYLOAD_SIZE.
    let _ = pdu.push_u8(exception as u8);
    pdu
}

/// Parses an exception PDU into `(original_function_code, exception)`.
pub fn parse_exception(pdu: &Pdu) -> Result<(u8, Exception)> {
    if !pdu.is_exception() || pdu.payload.len() != 1 {
        return Err(Error::DecodingError);
    }
    let original_fc = pdu.function_code & !function::EXCEPTION_BIT;
    let exception = Exception::try_from(pdu.payload[0])?;
    Ok((original_fc, exception))
}

fn check_read_quantity(qty: Quantity, max: usize) -> Result<()> {
    if qty == 0 || usize::from(qty) > max {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn check_write_quantity(qty: usize, max: usize) -> Result<()> {
    if qty == 0 || qty > max {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn read_addr_qty(payload: &[u8]) -> Result<(Address, Quantity)> {
    if payload.len() != 4 {
        return Err(Error::DecodingError);
    }
    Ok((
        BigEndian::read_u16(&payload[0..2]),
        BigEndian::read_u16(&payload[2..4]),
    ))
}

fn read_words<const N: usize>(data: &[u8], qty: Quantity) -> Result<Vec<Word, N>> {
    if data.len() != usize::from(qty) * 2 {
        return Err(Error::DecodingError);
    }
    let mut out = Vec::new();
    for chunk in data.chunks_exact(2) {
        out.push(BigEndian::read_u16(chunk))
            .map_err(|_| Error::DecodingError)?;
    }
    Ok(out)
}

fn parse_register_block<const N: usize>(payload: &[u8], qty: Quantity) -> Result<Vec<Word, N>> {
    if payload.is_empty() {
        return Err(Error::DecodingError);
    }
    let byte_count = payload[0] as usize;
    let data = &payload[1..];
    if byte_count != data.len() || byte_count != usize::from(qty) * 2 {
        return Err(Error::DecodingError);
    }
    read_words(data, qty)
}

fn parse_packed_coils<const N: usize>(payload: &[u8], qty: Quantity) -> Result<Vec<Coil, N>> {
    if payload.is_empty() {
        return Err(Error::DecodingError);
    }
    let byte_count = payload[0] as usize;
    let packed = &payload[1..];
    if byte_count != packed.len() || byte_count != packed_coils_len(usize::from(qty)) {
        return Err(Error::DecodingError);
    }
    unpack_coils(packed, qty)
}

/// Number of bytes needed to pack `qty` coils, bits LSB-first.
#[must_use]
pub fn packed_coils_len(qty: usize) -> usize {
    (qty + 7) / 8
}

/// Packs a coil slice into bytes, LSB-first, matching §4.1's bit-packing invariant.
fn pack_coils<const IN: usize>(coils: &Vec<Coil, IN>) -> Result<Vec<u8, MAX_PAYLOAD_SIZE>> {
    let mut out: Vec<u8, MAX_PAYLOAD_SIZE> = Vec::new();
    for chunk in coils.chunks(8) {
        let mut byte = 0u8;
        for (bit_index, &coil) in chunk.iter().enumerate() {
            if coil {
                byte |= 1 << bit_index;
            }
        }
        out.push(byte).map_err(|_| Error::InvalidArgument)?;
    }
    Ok(out)
}

/// Unpacks `qty` LSB-first bits out of `packed`.
fn unpack_coils<const N: usize>(packed: &[u8], qty: Quantity) -> Result<Vec<Coil, N>> {
    let mut out = Vec::new();
    for i in 0..usize::from(qty) {
        let byte = packed[i / 8];
        let bit = (byte >> (i % 8)) & 0x01 != 0;
        out.push(bit).map_err(|_| Error::DecodingError)?;
    }
    Ok(out)
}

fn bool_to_coil_word(value: bool) -> u16 {
    if value {
        0xFF00
    } else {
        0x0000
    }
}

fn coil_word_to_bool(raw: u16) -> Result<bool> {
    match raw {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        _ => Err(Error::DecodingError),
    }
}

/// Word order used to reassemble a 32-bit quantity out of two 16-bit Modbus registers.
///
/// Modbus itself only defines 16-bit registers; pairing two of them into a 32-bit int or float
/// is a widespread but non-standardized convention, and different vendors disagree on which
/// register carries the high-order 16 bits and on whether each register's own bytes are
/// swapped. `AbcdBigEndian` is the most common convention (and libmodbus's default); the other
/// three cover the field-observed alternatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    /// `[reg0_hi, reg0_lo, reg1_hi, reg1_lo]` — big-endian registers, high register first.
    AbcdBigEndian,
    /// `[reg0_lo, reg0_hi, reg1_lo, reg1_hi]` — byte-swapped registers, high register first.
    BadcByteSwapped,
    /// `[reg1_hi, reg1_lo, reg0_hi, reg0_lo]` — big-endian registers, low register first.
    CdabWordSwapped,
    /// `[reg1_lo, reg1_hi, reg0_lo, reg0_hi]` — byte- and word-swapped, low register first.
    DcbaLittleEndian,
}

/// Packs a `u32` into two registers per `order`, the inverse of [`u32_from_registers`].
#[must_use]
pub fn u32_to_registers(value: u32, order: WordOrder) -> [u16; 2] {
    let bytes = value.to_be_bytes(); // [A, B, C, D]
    let (a, b, c, d) = (bytes[0], bytes[1], bytes[2], bytes[3]);
    match order {
        WordOrder::AbcdBigEndian => [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])],
        WordOrder::BadcByteSwapped => [u16::from_be_bytes([b, a]), u16::from_be_bytes([d, c])],
        WordOrder::CdabWordSwapped => [u16::from_be_bytes([c, d]), u16::from_be_bytes([a, b])],
        WordOrder::DcbaLittleEndian => [u16::from_be_bytes([d, c]), u16::from_be_bytes([b, a])],
    }
}

/// Reassembles a `u32` out of two registers, given the vendor word order `order` (§4.1:
/// "libmodbus parity helpers must read/write 32-bit ints and floats in the four documented
/// orders"). `registers` must hold exactly the two 16-bit words involved, in the order they
/// appear on the wire (i.e. `registers[0]` is whichever register the protocol put first).
#[must_use]
pub fn u32_from_registers(registers: [u16; 2], order: WordOrder) -> u32 {
    let r0 = registers[0].to_be_bytes();
    let r1 = registers[1].to_be_bytes();
    let bytes = match order {
        WordOrder::AbcdBigEndian => [r0[0], r0[1], r1[0], r1[1]],
        WordOrder::BadcByteSwapped => [r0[1], r0[0], r1[1], r1[0]],
        WordOrder::CdabWordSwapped => [r1[0], r1[1], r0[0], r0[1]],
        WordOrder::DcbaLittleEndian => [r1[1], r1[0], r0[1], r0[0]],
    };
    u32::from_be_bytes(bytes)
}

/// Reassembles an IEEE-754 `f32` out of two registers, given `order`. A thin reinterpretation
/// of [`u32_from_registers`]; no validation is possible or needed since every bit pattern is a
/// valid (if possibly NaN) `f32`.
#[must_use]
pub fn f32_from_registers(registers: [u16; 2], order: WordOrder) -> f32 {
    f32::from_bits(u32_from_registers(registers, order))
}

/// Packs an `f32` into two registers per `order`, the inverse of [`f32_from_registers`].
#[must_use]
pub fn f32_to_registers(value: f32, order: WordOrder) -> [u16; 2] {
    u32_to_registers(value.to_bits(), order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_read_holding_registers_matches_scenario_a() {
        let pdu = Request::ReadHoldingRegisters(0x0000, 10).encode().unwrap();
        assert_eq!(pdu.function_code, function::READ_HOLDING_REGISTERS);
        assert_eq!(pdu.payload.as_slice(), &[0x00, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn round_trip_read_holding_registers() {
        let request = Request::ReadHoldingRegisters(0x0000, 10);
        let mut regs: Vec<Word, MAX_READ_REGISTERS> = Vec::new();
        for i in 0u16..10 {
            regs.push(i).unwrap();
        }
        let response = Response::ReadHoldingRegisters(regs.clone());
        let pdu = response.encode().unwrap();
        let parsed = Response::parse(&request, &pdu).unwrap();
        assert_eq!(parsed, Response::ReadHoldingRegisters(regs));
    }

    #[test]
    fn round_trip_write_multiple_coils() {
        let mut coils: Vec<Coil, MAX_WRITE_COILS> = Vec::new();
        for i in 0..12 {
            coils.push(i % 2 == 0).unwrap();
        }
        let request = Request::WriteMultipleCoils(0x0013, coils);
        let pdu = request.encode().unwrap();
        let parsed = Request::parse(&pdu).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn zero_quantity_reads_are_rejected() {
        assert_eq!(
            Request::ReadHoldingRegisters(0, 0).encode(),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn oversized_quantity_is_rejected() {
        assert_eq!(
            Request::ReadHoldingRegisters(0, 126).encode(),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn mismatched_byte_count_is_rejected() {
        let mut pdu = Pdu::new(function::WRITE_MULTIPLE_REGISTERS);
        pdu.push_u16(0).unwrap();
        pdu.push_u16(2).unwrap();
        pdu.push_u8(3).unwrap(); // wrong byte count for 2 registers (should be 4)
        pdu.push_u16(0x1234).unwrap();
        pdu.push_u16(0x5678).unwrap();
        assert_eq!(Request::parse(&pdu), Err(Error::DecodingError));
    }

    #[test]
    fn exception_round_trip() {
        let pdu = encode_exception(function::READ_HOLDING_REGISTERS, Exception::IllegalDataAddress);
        let (fc, exception) = parse_exception(&pdu).unwrap();
        assert_eq!(fc, function::READ_HOLDING_REGISTERS);
        assert_eq!(exception, Exception::IllegalDataAddress);
    }

    #[test]
    fn scenario_c_server_illegal_address_response_bytes() {
        let pdu = encode_exception(function::READ_HOLDING_REGISTERS, Exception::IllegalDataAddress);
        assert_eq!(pdu.function_code, 0x83);
        assert_eq!(pdu.payload.as_slice(), &[0x02]);
    }

    #[test]
    fn abcd_round_trip_matches_plain_big_endian() {
        let regs = u32_to_registers(0x1234_5678, WordOrder::AbcdBigEndian);
        assert_eq!(regs, [0x1234, 0x5678]);
        assert_eq!(u32_from_registers(regs, WordOrder::AbcdBigEndian), 0x1234_5678);
    }

    #[test]
    fn all_four_word_orders_round_trip() {
        for order in [
            WordOrder::AbcdBigEndian,
            WordOrder::BadcByteSwapped,
            WordOrder::CdabWordSwapped,
            WordOrder::DcbaLittleEndian,
        ] {
            let regs = u32_to_registers(0xDEAD_BEEF, order);
            assert_eq!(u32_from_registers(regs, order), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn badc_byte_swaps_each_register() {
        let regs = u32_to_registers(0x1234_5678, WordOrder::BadcByteSwapped);
        assert_eq!(regs, [0x3412, 0x7856]);
    }

    #[test]
    fn cdab_swaps_register_order_only() {
        let regs = u32_to_registers(0x1234_5678, WordOrder::CdabWordSwapped);
        assert_eq!(regs, [0x5678, 0x1234]);
    }

    #[test]
    fn f32_round_trip() {
        let value = -12.5_f32;
        let regs = f32_to_registers(value, WordOrder::AbcdBigEndian);
        assert_eq!(f32_from_registers(regs, WordOrder::AbcdBigEndian), value);
    }
}
