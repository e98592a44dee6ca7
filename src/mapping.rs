//! Register banks backing one gateway session
//!
//! A mapping holds the four Modbus data regions, each a fixed-size zero-based
//! array sized from the current address layout. Every access is bounds-checked
//! against the bank it targets. Mappings are never resized: when the layout
//! changes the session allocates a new one and hands it out in place of the old.

use std::sync::RwLock;

use log::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::field::Region;

/// Modbus register banks for coils, discrete inputs, holding registers and input registers
#[derive(Debug)]
pub struct ModbusMapping {
    /// Coils (read/write) - 1 bit each
    coils: RwLock<Vec<bool>>,
    /// Discrete inputs (read-only) - 1 bit each
    discrete_inputs: RwLock<Vec<bool>>,
    /// Holding registers (read/write) - 16 bits each
    holding_registers: RwLock<Vec<u16>>,
    /// Input registers (read-only) - 16 bits each
    input_registers: RwLock<Vec<u16>>,
}

fn check_range(address: usize, quantity: usize, size: usize) -> ModbusResult<()> {
    if address + quantity > size {
        return Err(ModbusError::invalid_address(address as u32, quantity as u32, size as u32));
    }
    Ok(())
}

impl ModbusMapping {
    /// Create a mapping with independently sized banks, all zeroed
    pub fn new(coils: usize, discrete_inputs: usize, holding_registers: usize, input_registers: usize) -> Self {
        debug!(
            "Allocating mapping: coils={}, discrete inputs={}, holding registers={}, input registers={}",
            coils, discrete_inputs, holding_registers, input_registers
        );
        Self {
            coils: RwLock::new(vec![false; coils]),
            discrete_inputs: RwLock::new(vec![false; discrete_inputs]),
            holding_registers: RwLock::new(vec![0; holding_registers]),
            input_registers: RwLock::new(vec![0; input_registers]),
        }
    }

    /// Create a mapping whose four banks all span the same address space
    pub fn with_size(size: usize) -> Self {
        Self::new(size, size, size, size)
    }

    fn bits(&self, region: Region) -> ModbusResult<&RwLock<Vec<bool>>> {
        match region {
            Region::Coils => Ok(&self.coils),
            Region::DiscreteInputs => Ok(&self.discrete_inputs),
            _ => Err(ModbusError::internal(format!("{} is not a bit region", region))),
        }
    }

    fn registers(&self, region: Region) -> ModbusResult<&RwLock<Vec<u16>>> {
        match region {
            Region::HoldingRegisters => Ok(&self.holding_registers),
            Region::InputRegisters => Ok(&self.input_registers),
            _ => Err(ModbusError::internal(format!("{} is not a register region", region))),
        }
    }

    /// Number of address units in a bank
    pub fn size(&self, region: Region) -> ModbusResult<usize> {
        let len = if region.is_bit_region() {
            self.bits(region)?
                .read()
                .map_err(|_| ModbusError::internal(format!("Failed to lock {}", region)))?
                .len()
        } else {
            self.registers(region)?
                .read()
                .map_err(|_| ModbusError::internal(format!("Failed to lock {}", region)))?
                .len()
        };
        Ok(len)
    }

    /// Run `f` against the whole bit bank
    pub fn inspect_bits<R>(&self, region: Region, f: impl FnOnce(&[bool]) -> ModbusResult<R>) -> ModbusResult<R> {
        let bank = self.bits(region)?
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", region)))?;
        f(&bank)
    }

    /// Run `f` against the whole bit bank with write access
    pub fn update_bits<R>(&self, region: Region, f: impl FnOnce(&mut [bool]) -> ModbusResult<R>) -> ModbusResult<R> {
        let mut bank = self.bits(region)?
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", region)))?;
        f(&mut bank)
    }

    /// Run `f` against the whole register bank
    pub fn inspect_registers<R>(&self, region: Region, f: impl FnOnce(&[u16]) -> ModbusResult<R>) -> ModbusResult<R> {
        let bank = self.registers(region)?
            .read()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", region)))?;
        f(&bank)
    }

    /// Run `f` against the whole register bank with write access
    pub fn update_registers<R>(&self, region: Region, f: impl FnOnce(&mut [u16]) -> ModbusResult<R>) -> ModbusResult<R> {
        let mut bank = self.registers(region)?
            .write()
            .map_err(|_| ModbusError::internal(format!("Failed to lock {}", region)))?;
        f(&mut bank)
    }

    /// Read `quantity` bits of a bit region
    pub fn read_bits(&self, region: Region, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.inspect_bits(region, |bank| {
            let start = address as usize;
            check_range(start, quantity as usize, bank.len())?;
            Ok(bank[start..start + quantity as usize].to_vec())
        })
    }

    /// Store bits of a bit region
    pub fn write_bits(&self, region: Region, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.update_bits(region, |bank| {
            let start = address as usize;
            check_range(start, values.len(), bank.len())?;
            bank[start..start + values.len()].copy_from_slice(values);
            Ok(())
        })
    }

    /// Read `quantity` words of a register region
    pub fn read_registers(&self, region: Region, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.inspect_registers(region, |bank| {
            let start = address as usize;
            check_range(start, quantity as usize, bank.len())?;
            Ok(bank[start..start + quantity as usize].to_vec())
        })
    }

    /// Store words of a register region
    pub fn write_registers(&self, region: Region, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.update_registers(region, |bank| {
            let start = address as usize;
            check_range(start, values.len(), bank.len())?;
            bank[start..start + values.len()].copy_from_slice(values);
            Ok(())
        })
    }

    /// Read coils starting at address (function code 0x01)
    pub fn read_01(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(Region::Coils, address, quantity)
    }

    /// Read discrete inputs starting at address (function code 0x02)
    pub fn read_02(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_bits(Region::DiscreteInputs, address, quantity)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_03(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_registers(Region::HoldingRegisters, address, quantity)
    }

    /// Read input registers starting at address (function code 0x04)
    pub fn read_04(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.read_registers(Region::InputRegisters, address, quantity)
    }

    /// Write single coil (function code 0x05)
    pub fn write_05(&self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_bits(Region::Coils, address, &[value])
    }

    /// Write single register (function code 0x06)
    pub fn write_06(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_registers(Region::HoldingRegisters, address, &[value])
    }

    /// Write multiple coils (function code 0x0F)
    pub fn write_0f(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.write_bits(Region::Coils, address, values)
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_10(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.write_registers(Region::HoldingRegisters, address, values)
    }

    /// Get bank sizes
    pub fn get_stats(&self) -> ModbusResult<MappingStats> {
        Ok(MappingStats {
            coils_count: self.size(Region::Coils)?,
            discrete_inputs_count: self.size(Region::DiscreteInputs)?,
            holding_registers_count: self.size(Region::HoldingRegisters)?,
            input_registers_count: self.size(Region::InputRegisters)?,
        })
    }
}

/// Mapping bank sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
}
