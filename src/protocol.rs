//! Modbus protocol definitions and data structures
//!
//! This module contains the Modbus function codes the gateway serves, the
//! exception codes it replies with, and request/response PDU structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};
use crate::field::Region;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier carried in the MBAP header
pub type UnitId = u8;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(self,
            ModbusFunction::ReadCoils |
            ModbusFunction::ReadDiscreteInputs |
            ModbusFunction::ReadHoldingRegisters |
            ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(self,
            ModbusFunction::WriteSingleCoil |
            ModbusFunction::WriteSingleRegister |
            ModbusFunction::WriteMultipleCoils |
            ModbusFunction::WriteMultipleRegisters
        )
    }

    /// Register bank the function operates on
    pub fn region(self) -> Region {
        match self {
            ModbusFunction::ReadCoils
            | ModbusFunction::WriteSingleCoil
            | ModbusFunction::WriteMultipleCoils => Region::Coils,
            ModbusFunction::ReadDiscreteInputs => Region::DiscreteInputs,
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::WriteSingleRegister
            | ModbusFunction::WriteMultipleRegisters => Region::HoldingRegisters,
            ModbusFunction::ReadInputRegisters => Region::InputRegisters,
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Decoded Modbus request PDU
///
/// `data` holds the raw write payload: the coil/register bytes of a write
/// request, already stripped of the byte count.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Parse a request PDU (function code followed by its payload)
    pub fn parse_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.len() < 5 {
            return Err(ModbusError::frame(format!("PDU too short: {} bytes", pdu.len())));
        }
        let function = ModbusFunction::from_u8(pdu[0])?;
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);

        let request = match function {
            ModbusFunction::WriteSingleCoil => {
                let bit = match word {
                    0xFF00 => 1u8,
                    0x0000 => 0u8,
                    _ => return Err(ModbusError::invalid_data(format!("Invalid coil value: 0x{:04X}", word))),
                };
                Self { unit_id, function, address, quantity: 1, data: vec![bit] }
            }
            ModbusFunction::WriteSingleRegister => {
                Self { unit_id, function, address, quantity: 1, data: pdu[3..5].to_vec() }
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => {
                if pdu.len() < 6 {
                    return Err(ModbusError::frame("Missing byte count"));
                }
                let byte_count = pdu[5] as usize;
                if pdu.len() < 6 + byte_count {
                    return Err(ModbusError::frame(format!(
                        "Incomplete write data: expected {} bytes, got {}", byte_count, pdu.len() - 6
                    )));
                }
                let expected = if function == ModbusFunction::WriteMultipleCoils {
                    (word as usize + 7) / 8
                } else {
                    word as usize * 2
                };
                if expected != byte_count {
                    return Err(ModbusError::invalid_data(format!(
                        "Byte count {} does not match quantity {}", byte_count, word
                    )));
                }
                Self { unit_id, function, address, quantity: word, data: pdu[6..6 + byte_count].to_vec() }
            }
            _ => Self::new_read(unit_id, function, address, word),
        };
        request.validate()?;
        Ok(request)
    }

    /// Validate the request quantity against the protocol limits
    pub fn validate(&self) -> ModbusResult<()> {
        if self.quantity == 0 {
            return Err(ModbusError::invalid_data("Quantity cannot be zero".to_string()));
        }

        let limit = match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => crate::MAX_COILS_PER_REQUEST,
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => crate::MAX_REGISTERS_PER_REQUEST,
            ModbusFunction::WriteMultipleCoils => crate::MAX_WRITE_COILS_PER_REQUEST,
            ModbusFunction::WriteMultipleRegisters => crate::MAX_WRITE_REGISTERS_PER_REQUEST,
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => 1,
        };
        if self.quantity > limit {
            return Err(ModbusError::invalid_data(
                format!("Too many values requested for {}: {}", self.function, self.quantity)
            ));
        }
        if self.address as u32 + self.quantity as u32 > 0x1_0000 {
            return Err(ModbusError::invalid_address(self.address as u32, self.quantity as u32, 0x1_0000));
        }

        Ok(())
    }
}

/// Modbus response PDU
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            function,
            data,
            exception: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(function: ModbusFunction, exception: ModbusException) -> Self {
        Self {
            function,
            data: Vec::new(),
            exception: Some(exception),
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception.map(|exc| ModbusError::exception(self.function.to_u8(), exc.to_u8()))
    }

    /// Encode the response PDU (function code plus payload)
    pub fn to_pdu(&self) -> Vec<u8> {
        match self.exception {
            Some(exc) => vec![self.function.to_u8() | 0x80, exc.to_u8()],
            None => {
                let mut pdu = Vec::with_capacity(1 + self.data.len());
                pdu.push(self.function.to_u8());
                pdu.extend_from_slice(&self.data);
                pdu
            }
        }
    }

    /// Parse a response PDU received from a server
    pub fn parse_pdu(pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.is_empty() {
            return Err(ModbusError::frame("Empty response PDU"));
        }
        if pdu[0] & 0x80 != 0 {
            let function = ModbusFunction::from_u8(pdu[0] & 0x7F)?;
            let code = *pdu.get(1).ok_or_else(|| ModbusError::frame("Missing exception code"))?;
            let exception = ModbusException::from_u8(code)
                .ok_or_else(|| ModbusError::exception(function.to_u8(), code))?;
            return Ok(Self::new_exception(function, exception));
        }
        Ok(Self::new_success(ModbusFunction::from_u8(pdu[0])?, pdu[1..].to_vec()))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }

        let byte_count = *self.data.first().ok_or_else(|| ModbusError::frame("Empty response data"))? as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("Incomplete register data"));
        }
        data_utils::bytes_to_registers(&self.data[1..1 + byte_count])
    }

    /// Parse response data as bits (bool values)
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }

        let byte_count = *self.data.first().ok_or_else(|| ModbusError::frame("Empty response data"))? as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("Incomplete bit data"));
        }
        Ok(data_utils::unpack_bits(&self.data[1..1 + byte_count], byte_count * 8))
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even".to_string()));
        }

        Ok(bytes
            .chunks(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes (LSB first)
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).map_or(false, |byte| byte & (1 << (i % 8)) != 0))
            .collect()
    }

    /// Convert u32 to two u16 registers (big-endian)
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Convert two u16 registers to u32 (big-endian)
    pub fn registers_to_u32(registers: &[u16]) -> ModbusResult<u32> {
        if registers.len() < 2 {
            return Err(ModbusError::invalid_data("Need at least 2 registers for u32".to_string()));
        }
        Ok(((registers[0] as u32) << 16) | (registers[1] as u32))
    }

    /// Convert f32 to two u16 registers (IEEE 754, high word first)
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        u32_to_registers(value.to_bits())
    }

    /// Convert two u16 registers to f32 (IEEE 754, high word first)
    pub fn registers_to_f32(registers: &[u16]) -> ModbusResult<f32> {
        let u32_value = registers_to_u32(registers)?;
        Ok(f32::from_bits(u32_value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert_eq!(ModbusFunction::WriteMultipleCoils.region(), Region::Coils);
        assert_eq!(ModbusFunction::ReadInputRegisters.region(), Region::InputRegisters);

        assert!(ModbusFunction::from_u8(0xFF).is_err());
    }

    #[test]
    fn test_parse_read_request() {
        let request = ModbusRequest::parse_pdu(1, &[0x03, 0x00, 0x64, 0x00, 0x0A]).unwrap();
        assert_eq!(request.function, ModbusFunction::ReadHoldingRegisters);
        assert_eq!(request.address, 100);
        assert_eq!(request.quantity, 10);

        assert!(ModbusRequest::parse_pdu(1, &[0x03, 0x00, 0x64, 0x00, 0xC8]).is_err());
        assert!(ModbusRequest::parse_pdu(1, &[0x03, 0x00, 0x64, 0x00, 0x00]).is_err());
        assert!(ModbusRequest::parse_pdu(1, &[0x03, 0x00]).is_err());
    }

    #[test]
    fn test_parse_write_requests() {
        let request = ModbusRequest::parse_pdu(1, &[0x05, 0x00, 0x02, 0xFF, 0x00]).unwrap();
        assert_eq!(request.data, vec![1]);
        assert!(ModbusRequest::parse_pdu(1, &[0x05, 0x00, 0x02, 0x12, 0x34]).is_err());

        let request = ModbusRequest::parse_pdu(1, &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(request.quantity, 2);
        assert_eq!(request.data, vec![0x12, 0x34, 0x56, 0x78]);

        // byte count disagrees with quantity
        assert!(ModbusRequest::parse_pdu(1, &[0x10, 0x00, 0x01, 0x00, 0x02, 0x02, 0x12, 0x34]).is_err());
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data_utils::bytes_to_registers(&bytes).unwrap(), registers);

        let bits = vec![true, false, true, true, false, false, false, false];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);

        assert_eq!(data_utils::f32_to_registers(1.0), [0x3F80, 0x0000]);
        assert_eq!(data_utils::registers_to_f32(&[0x3F80, 0x0000]).unwrap(), 1.0);
    }

    #[test]
    fn test_response_encoding() {
        let response = ModbusResponse::new_exception(ModbusFunction::ReadHoldingRegisters, ModbusException::ServerDeviceFailure);
        assert_eq!(response.to_pdu(), vec![0x83, 0x04]);

        let parsed = ModbusResponse::parse_pdu(&[0x03, 4, 0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(parsed.parse_registers().unwrap(), vec![0x1234, 0x5678]);

        let parsed = ModbusResponse::parse_pdu(&[0x01, 1, 0b10101010]).unwrap();
        let bits = parsed.parse_bits().unwrap();
        assert!(!bits[0]); // LSB first
        assert!(bits[1]);

        let parsed = ModbusResponse::parse_pdu(&[0x84, 0x02]).unwrap();
        assert!(parsed.is_exception());
        assert!(parsed.parse_registers().is_err());
    }
}
