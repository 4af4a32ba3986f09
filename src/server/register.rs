// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The register map capability ([`RegisterMap`]) the server FSM dispatches against, plus a
//! concrete reference implementation ([`RegionTable`]) over a sparse set of caller-owned
//! storage regions, looked up by binary search on start address (§3, §4.5, §6).

use heapless::Vec;

/// Errors a register-map callback may report; mapped onto a Modbus [`crate::pdu::Exception`]
/// by the dispatching server FSM (§6, §9 open question: `Busy` maps to `ServerDeviceBusy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Busy,
}

/// The capability a [`crate::server::ServerEngine`] is generic over (§6 "Register map
/// callbacks"). A host implements this directly for a custom backing store, or uses
/// [`RegionTable`] when a sparse-region reference implementation is enough.
pub trait RegisterMap {
    fn read_coils(
        &mut self,
        address: u16,
        quantity: u16,
        out_bits: &mut [bool],
    ) -> Result<(), RegisterError>;

    fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
        out_bits: &mut [bool],
    ) -> Result<(), RegisterError>;

    fn read_holding(
        &mut self,
        address: u16,
        quantity: u16,
        out_regs: &mut [u16],
    ) -> Result<(), RegisterError>;

    fn read_input(
        &mut self,
        address: u16,
        quantity: u16,
        out_regs: &mut [u16],
    ) -> Result<(), RegisterError>;

    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), RegisterError>;

    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), RegisterError>;

    fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), RegisterError>;

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<(), RegisterError>;
}

/// A contiguous, caller-owned storage region starting at `start_address`. Generic over the
/// cell type (`bool` for coil regions, `u16` for register regions).
pub struct Region<'a, T> {
    start_address: u16,
    storage: &'a mut [T],
}

impl<'a, T> Region<'a, T> {
    /// `storage.len()` must fit in a `u16` (a region can span at most 65536 items).
    #[must_use]
    pub fn new(start_address: u16, storage: &'a mut [T]) -> Self {
        debug_assert!(storage.len() <= usize::from(u16::MAX) + 1);
        Self { start_address, storage }
    }

    #[must_use]
    fn end_address(&self) -> u32 {
        u32::from(self.start_address) + self.storage.len() as u32
    }

    #[must_use]
    fn contains(&self, address: u16, quantity: u16) -> bool {
        let start = u32::from(address);
        let end = start + u32::from(quantity);
        start >= u32::from(self.start_address) && end <= self.end_address()
    }

    #[must_use]
    fn local_offset(&self, address: u16) -> usize {
        usize::from(address - self.start_address)
    }
}

/// Finds the region covering `[address, address + quantity)` in `regions`, sorted ascending
/// by `start_address`. Binary search via `partition_point` (O(log n), §3's stated data model).
fn find_region<'r, 'a, T>(
    regions: &'r mut [Region<'a, T>],
    address: u16,
    quantity: u16,
) -> Result<&'r mut Region<'a, T>, RegisterError> {
    if quantity == 0 {
        return Err(RegisterError::IllegalDataValue);
    }
    let split = regions.partition_point(|region| region.start_address <= address);
    let index = split.checked_sub(1).ok_or(RegisterError::IllegalDataAddress)?;
    let region = &mut regions[index];
    if region.contains(address, quantity) {
        Ok(region)
    } else {
        Err(RegisterError::IllegalDataAddress)
    }
}

/// Inserts `region` into `regions`, kept sorted by `start_address`, rejecting overlaps with an
/// already-registered region of the same type. Returns `Err` (and drops `region`) on overlap or
/// if `regions` is already at its `MAX_REGIONS` capacity.
fn insert_region<'a, T, const MAX_REGIONS: usize>(
    regions: &mut Vec<Region<'a, T>, MAX_REGIONS>,
    region: Region<'a, T>,
) -> Result<(), ()> {
    let pos = regions.partition_point(|existing| existing.start_address < region.start_address);
    let overlaps_before = pos > 0 && regions[pos - 1].end_address() > u32::from(region.start_address);
    let overlaps_after = pos < regions.len() && region.end_address() > u32::from(regions[pos].start_address);
    if overlaps_before || overlaps_after {
        return Err(());
    }
    regions.insert(pos, region).map_err(|_| ())
}

/// A reference [`RegisterMap`] over four sparse sets of caller-owned regions (one set per
/// Modbus data type), each looked up by binary search. `MAX_REGIONS` bounds how many disjoint
/// regions any one data type may have.
pub struct RegionTable<'a, const MAX_REGIONS: usize> {
    coils: Vec<Region<'a, bool>, MAX_REGIONS>,
    discrete_inputs: Vec<Region<'a, bool>, MAX_REGIONS>,
    holding: Vec<Region<'a, u16>, MAX_REGIONS>,
    input: Vec<Region<'a, u16>, MAX_REGIONS>,
}

impl<'a, const MAX_REGIONS: usize> RegionTable<'a, MAX_REGIONS> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            coils: Vec::new(),
            discrete_inputs: Vec::new(),
            holding: Vec::new(),
            input: Vec::new(),
        }
    }

    /// Registers a coil-backed region. `Err` if it overlaps an existing coil region or the
    /// table is already full.
    pub fn add_coils(&mut self, start_address: u16, storage: &'a mut [bool]) -> Result<(), ()> {
        insert_region(&mut self.coils, Region::new(start_address, storage))
    }

    pub fn add_discrete_inputs(&mut self, start_address: u16, storage: &'a mut [bool]) -> Result<(), ()> {
        insert_region(&mut self.discrete_inputs, Region::new(start_address, storage))
    }

    pub fn add_holding(&mut self, start_address: u16, storage: &'a mut [u16]) -> Result<(), ()> {
        insert_region(&mut self.holding, Region::new(start_address, storage))
    }

    pub fn add_input(&mut self, start_address: u16, storage: &'a mut [u16]) -> Result<(), ()> {
        insert_region(&mut self.input, Region::new(start_address, storage))
    }
}

impl<'a, const MAX_REGIONS: usize> RegisterMap for RegionTable<'a, MAX_REGIONS> {
    fn read_coils(&mut self, address: u16, quantity: u16, out_bits: &mut [bool]) -> Result<(), RegisterError> {
        let region = find_region(&mut self.coils, address, quantity)?;
        let offset = region.local_offset(address);
        out_bits[..usize::from(quantity)].copy_from_slice(&region.storage[offset..offset + usize::from(quantity)]);
        Ok(())
    }

    fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
        out_bits: &mut [bool],
    ) -> Result<(), RegisterError> {
        let region = find_region(&mut self.discrete_inputs, address, quantity)?;
        let offset = region.local_offset(address);
        out_bits[..usize::from(quantity)].copy_from_slice(&region.storage[offset..offset + usize::from(quantity)]);
        Ok(())
    }

    fn read_holding(&mut self, address: u16, quantity: u16, out_regs: &mut [u16]) -> Result<(), RegisterError> {
        let region = find_region(&mut self.holding, address, quantity)?;
        let offset = region.local_offset(address);
        out_regs[..usize::from(quantity)].copy_from_slice(&region.storage[offset..offset + usize::from(quantity)]);
        Ok(())
    }

    fn read_input(&mut self, address: u16, quantity: u16, out_regs: &mut [u16]) -> Result<(), RegisterError> {
        let region = find_region(&mut self.input, address, quantity)?;
        let offset = region.local_offset(address);
        out_regs[..usize::from(quantity)].copy_from_slice(&region.storage[offset..offset + usize::from(quantity)]);
        Ok(())
    }

    fn write_single_coil(&mut self, address: u16, value: bool) -> Result<(), RegisterError> {
        let region = find_region(&mut self.coils, address, 1)?;
        let offset = region.local_offset(address);
        region.storage[offset] = value;
        Ok(())
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> Result<(), RegisterError> {
        let region = find_region(&mut self.holding, address, 1)?;
        let offset = region.local_offset(address);
        region.storage[offset] = value;
        Ok(())
    }

    fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<(), RegisterError> {
        #[allow(clippy::cast_possible_truncation)]
        let region = find_region(&mut self.coils, address, values.len() as u16)?;
        let offset = region.local_offset(address);
        region.storage[offset..offset + values.len()].copy_from_slice(values);
        Ok(())
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> Result<(), RegisterError> {
        #[allow(clippy::cast_possible_truncation)]
        let region = find_region(&mut self.holding, address, values.len() as u16)?;
        let offset = region.local_offset(address);
        region.storage[offset..offset + values.len()].copy_from_slice(values);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_round_trips_through_a_single_region() {
        let mut storage = [0u16; 10];
        let mut table: RegionTable<4> = RegionTable::new();
        table.add_holding(100, &mut storage).unwrap();
        table.write_multiple_registers(102, &[7, 8]).unwrap();
        let mut out = [0u16; 2];
        table.read_holding(102, 2, &mut out).unwrap();
        assert_eq!(out, [7, 8]);
    }

    #[test]
    fn address_outside_every_region_is_illegal_data_address() {
        let mut storage = [0u16; 4];
        let mut table: RegionTable<4> = RegionTable::new();
        table.add_holding(100, &mut storage).unwrap();
        let mut out = [0u16; 1];
        assert_eq!(
            table.read_holding(50, 1, &mut out),
            Err(RegisterError::IllegalDataAddress)
        );
        assert_eq!(
            table.read_holding(103, 2, &mut out),
            Err(RegisterError::IllegalDataAddress)
        );
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let mut a = [0u16; 10];
        let mut b = [0u16; 10];
        let mut table: RegionTable<4> = RegionTable::new();
        table.add_holding(100, &mut a).unwrap();
        assert_eq!(table.add_holding(105, &mut b), Err(()));
    }

    #[test]
    fn two_disjoint_regions_are_both_reachable() {
        let mut a = [0u16; 4];
        let mut b = [0u16; 4];
        let mut table: RegionTable<4> = RegionTable::new();
        table.add_holding(0, &mut a).unwrap();
        table.add_holding(1000, &mut b).unwrap();
        table.write_single_register(1000, 42).unwrap();
        let mut out = [0u16; 1];
        table.read_holding(1000, 1, &mut out).unwrap();
        assert_eq!(out[0], 42);
        assert_eq!(
            table.read_holding(4, 1, &mut out),
            Err(RegisterError::IllegalDataAddress)
        );
    }

    #[test]
    fn zero_quantity_is_illegal_data_value() {
        let mut storage = [0u16; 4];
        let mut table: RegionTable<4> = RegionTable::new();
        table.add_holding(0, &mut storage).unwrap();
        let mut out: [u16; 0] = [];
        assert_eq!(table.read_holding(0, 0, &mut out), Err(RegisterError::IllegalDataValue));
    }
}
