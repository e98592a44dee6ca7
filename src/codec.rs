//! Conversion between field values and register bank contents
//!
//! Bit regions hold one boolean per address. Register regions pack bytes and
//! UTF-8 strings two per register (high byte first), shorts one per register
//! and floats two registers per element. A missing value encodes as zeros.
//! Every access is checked against the bank size before anything is touched.

use log::trace;

use crate::error::{ModbusError, ModbusResult};
use crate::field::{DataType, FieldProperties, FieldValue};
use crate::mapping::ModbusMapping;
use crate::protocol::data_utils;

/// How register-backed strings are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringDecoding {
    /// The full field length verbatim, trailing NUL bytes included
    Full,
    /// Up to the first NUL byte
    UntilNul,
}

fn check_range(address: usize, quantity: usize, size: usize) -> ModbusResult<()> {
    if address + quantity > size {
        return Err(ModbusError::invalid_address(address as u32, quantity as u32, size as u32));
    }
    Ok(())
}

fn pack_bytes(dest: &mut [u16], bytes: &[u8]) {
    for (i, register) in dest.iter_mut().enumerate() {
        let high = bytes.get(i * 2).copied().unwrap_or(0);
        let low = bytes.get(i * 2 + 1).copied().unwrap_or(0);
        *register = u16::from_be_bytes([high, low]);
    }
}

/// Encode a value into a bit bank
pub fn encode_bits(dest: &mut [bool], address: usize, quantity: usize, value: Option<&FieldValue>) -> ModbusResult<()> {
    check_range(address, quantity, dest.len())?;
    let values: &[bool] = match value {
        None => &[],
        Some(FieldValue::Boolean(values)) => values,
        Some(other) => {
            return Err(ModbusError::invalid_data(format!(
                "Unknown data type for bits at address {}: {} (supported: BOOLEAN)",
                address, other.data_type()
            )))
        }
    };
    for (i, bit) in dest[address..address + quantity].iter_mut().enumerate() {
        *bit = values.get(i).copied().unwrap_or(false);
    }
    trace!("Wrote {} bits at {}", quantity, address);
    Ok(())
}

/// Decode a value from a bit bank
pub fn decode_bits(src: &[bool], address: usize, quantity: usize, data_type: DataType) -> ModbusResult<FieldValue> {
    check_range(address, quantity, src.len())?;
    match data_type {
        DataType::Boolean => Ok(FieldValue::Boolean(src[address..address + quantity].to_vec())),
        other => Err(ModbusError::invalid_data(format!(
            "Unknown data type for bits at address {}: {} (supported: BOOLEAN)",
            address, other
        ))),
    }
}

/// Encode a value into a register bank
pub fn encode_registers(dest: &mut [u16], address: usize, quantity: usize, value: Option<&FieldValue>) -> ModbusResult<()> {
    check_range(address, quantity, dest.len())?;
    let dest = &mut dest[address..address + quantity];
    match value {
        None => dest.fill(0),
        Some(FieldValue::Byte(bytes)) => pack_bytes(dest, bytes),
        Some(FieldValue::Short(values)) => {
            for (i, register) in dest.iter_mut().enumerate() {
                *register = values.get(i).map_or(0, |v| *v as u16);
            }
        }
        Some(FieldValue::UShort(values)) => {
            for (i, register) in dest.iter_mut().enumerate() {
                *register = values.get(i).copied().unwrap_or(0);
            }
        }
        Some(FieldValue::Float(values)) => {
            dest.fill(0);
            for (i, pair) in dest.chunks_exact_mut(2).enumerate() {
                let words = data_utils::f32_to_registers(values.get(i).copied().unwrap_or(0.0));
                pair.copy_from_slice(&words);
            }
        }
        Some(FieldValue::String(values)) => {
            let text: String = values.iter().flatten().map(String::as_str).collect();
            pack_bytes(dest, text.as_bytes());
        }
        Some(other) => {
            return Err(ModbusError::invalid_data(format!(
                "Unknown data type for registers at address {}: {} (supported: BYTE, SHORT, USHORT, FLOAT, STRING)",
                address, other.data_type()
            )))
        }
    }
    trace!("Wrote registers {}: {:04X?}", address, dest);
    Ok(())
}

/// Decode a value from a register bank
pub fn decode_registers(
    src: &[u16],
    address: usize,
    quantity: usize,
    data_type: DataType,
    strings: StringDecoding,
) -> ModbusResult<FieldValue> {
    check_range(address, quantity, src.len())?;
    let src = &src[address..address + quantity];
    let value = match data_type {
        DataType::Byte => FieldValue::Byte(data_utils::registers_to_bytes(src)),
        DataType::Short => FieldValue::Short(src.iter().map(|r| *r as i16).collect()),
        DataType::UShort => FieldValue::UShort(src.to_vec()),
        DataType::Float => FieldValue::Float(
            src.chunks_exact(2)
                .map(data_utils::registers_to_f32)
                .collect::<ModbusResult<Vec<f32>>>()?,
        ),
        DataType::String => {
            let mut bytes = data_utils::registers_to_bytes(src);
            if strings == StringDecoding::UntilNul {
                if let Some(end) = bytes.iter().position(|b| *b == 0) {
                    bytes.truncate(end);
                }
            }
            FieldValue::String(vec![Some(String::from_utf8_lossy(&bytes).into_owned())])
        }
        DataType::Boolean => {
            return Err(ModbusError::invalid_data(format!(
                "Unknown data type for registers at address {}: {} (supported: BYTE, SHORT, USHORT, FLOAT, STRING)",
                address, data_type
            )))
        }
    };
    Ok(value)
}

fn field_region(props: &FieldProperties) -> ModbusResult<(crate::field::Region, DataType)> {
    match (props.region, props.data_type) {
        (Some(region), Some(data_type)) => Ok((region, data_type)),
        _ => Err(ModbusError::internal(format!("No field at address {}", props.address))),
    }
}

/// Encode a field value into the bank its field lives in
pub fn encode_field(mapping: &ModbusMapping, props: &FieldProperties, value: Option<&FieldValue>) -> ModbusResult<()> {
    let (region, _) = field_region(props)?;
    let address = props.address as usize;
    let quantity = props.address_quantity as usize;
    if region.is_bit_region() {
        mapping.update_bits(region, |bank| encode_bits(bank, address, quantity, value))
    } else {
        mapping.update_registers(region, |bank| encode_registers(bank, address, quantity, value))
    }
}

/// Decode a field value from the bank its field lives in
pub fn decode_field(mapping: &ModbusMapping, props: &FieldProperties, strings: StringDecoding) -> ModbusResult<FieldValue> {
    let (region, data_type) = field_region(props)?;
    let address = props.address as usize;
    let quantity = props.address_quantity as usize;
    if region.is_bit_region() {
        mapping.inspect_bits(region, |bank| decode_bits(bank, address, quantity, data_type))
    } else {
        mapping.inspect_registers(region, |bank| decode_registers(bank, address, quantity, data_type, strings))
    }
}
