// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus checksums: the RTU CRC-16 and the ASCII LRC.

/// Computes the Modbus RTU CRC-16 (polynomial `0xA001`, initial value `0xFFFF`) over `data`.
///
/// The returned value is already byte-swapped so that `crc.to_be_bytes()` yields the
/// low-byte-first wire order RTU framing expects.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            let crc_odd = (crc & 0x0001) != 0;
            crc >>= 1;
            if crc_odd {
                crc ^= 0xA001;
            }
        }
    }
    crc << 8 | crc >> 8
}

/// Computes the Modbus ASCII LRC: the two's complement of the sum of `data`'s bytes.
#[must_use]
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}
