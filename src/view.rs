//! Typed views over the gateway fields
//!
//! Each view runs a short session of its own: connect, acquire the mapping,
//! move the fields through it exactly like a Modbus master would, release and
//! disconnect.

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::codec::{self, StringDecoding};
use crate::error::{ModbusError, ModbusResult};
use crate::field::{FieldProperties, FieldValue};
use crate::mapping::ModbusMapping;
use crate::processor::{MappingLease, SlaveProcessor};
use crate::protocol::ModbusFunction;
use crate::rf::constants::RfFieldType;

const DEVICE_INFO_FIELDS: [RfFieldType; 6] = [
    RfFieldType::VendorName,
    RfFieldType::ProductCode,
    RfFieldType::MajorMinorRevision,
    RfFieldType::SerialNumber,
    RfFieldType::HardwareRevision,
    RfFieldType::BaseFirmware,
];

const RUNTIME_CONFIG_FIELDS: [RfFieldType; 8] = [
    RfFieldType::TagsInField,
    RfFieldType::MemorySelector,
    RfFieldType::EpcLength,
    RfFieldType::TidLength,
    RfFieldType::UserLength,
    RfFieldType::SelectionMaskCount,
    RfFieldType::SelectionMaskMaxLength,
    RfFieldType::CustomCommandMaxLength,
];

/// Identity of the reader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub vendor_name: String,
    pub product_code: String,
    pub major_minor_revision: String,
    pub serial_number: String,
    pub hardware_revision: String,
    pub base_firmware: String,
}

/// Values of the fields sizing the address space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfiguration {
    pub tags_in_field: u16,
    pub memory_selector: i16,
    pub epc_length: u16,
    pub tid_length: u16,
    pub user_length: u16,
    pub selection_mask_count: u16,
    pub selection_mask_max_length: u16,
    pub custom_command_max_length: u16,
}

/// Run `f` inside a session holding the mapping
fn with_session<R>(
    processor: &SlaveProcessor,
    f: impl FnOnce(&mut MappingLease<'_>) -> ModbusResult<R>,
) -> ModbusResult<R> {
    processor.connect()?;
    let result = processor.acquire_mapping().and_then(|mut lease| f(&mut lease));
    let disconnected = processor.disconnect();
    let value = result?;
    disconnected?;
    Ok(value)
}

fn field_properties(processor: &SlaveProcessor, fields: &[RfFieldType]) -> ModbusResult<Vec<FieldProperties>> {
    let mut result: Vec<FieldProperties> = Vec::with_capacity(fields.len());
    for kind in fields {
        let props = processor.get_field_properties(result.last(), None, Some(&kind.field()))?;
        if props.is_empty() {
            return Err(ModbusError::internal(format!("Field {} is not laid out", kind)));
        }
        result.push(props);
    }
    Ok(result)
}

fn read_input(processor: &SlaveProcessor, mapping: &ModbusMapping, props: &FieldProperties) -> ModbusResult<FieldValue> {
    let function = ModbusFunction::ReadInputRegisters.to_u8();
    processor.read(function, props.address as u16, props.address_quantity, mapping)?;
    codec::decode_field(mapping, props, StringDecoding::UntilNul)
}

fn read_string(processor: &SlaveProcessor, mapping: &ModbusMapping, props: &FieldProperties) -> ModbusResult<String> {
    let value = read_input(processor, mapping, props)?;
    Ok(value
        .as_strings()
        .and_then(|strings| strings.first().cloned().flatten())
        .unwrap_or_default())
}

fn read_serial_number(processor: &SlaveProcessor, mapping: &ModbusMapping, props: &FieldProperties) -> ModbusResult<String> {
    let value = read_input(processor, mapping, props)?;
    let shorts = value.as_shorts().unwrap_or_default();
    let mut bytes = [0u8; 8];
    for (chunk, short) in bytes.chunks_exact_mut(2).zip(shorts) {
        chunk.copy_from_slice(&short.to_be_bytes());
    }
    Ok(i64::from_be_bytes(bytes).to_string())
}

fn read_register(processor: &SlaveProcessor, mapping: &ModbusMapping, props: &FieldProperties) -> ModbusResult<u16> {
    let address = props.address as u16;
    processor.read(ModbusFunction::ReadHoldingRegisters.to_u8(), address, props.address_quantity, mapping)?;
    Ok(mapping.read_03(address, 1)?[0])
}

fn write_register(
    processor: &SlaveProcessor,
    lease: &mut MappingLease<'_>,
    props: &FieldProperties,
    value: u16,
) -> ModbusResult<()> {
    let mut registers = vec![0; props.address_quantity as usize];
    if let Some(first) = registers.first_mut() {
        *first = value;
    }
    lease.mapping().write_10(props.address as u16, &registers)?;
    let mapping = processor.write(
        ModbusFunction::WriteMultipleRegisters.to_u8(),
        props.address as u16,
        props.address_quantity,
        Utc::now(),
        lease.mapping().clone(),
    )?;
    lease.replace(mapping);
    Ok(())
}

impl DeviceInfo {
    /// Read the identity fields
    pub fn read(processor: &SlaveProcessor) -> ModbusResult<Self> {
        debug!("Reading device info");
        with_session(processor, |lease| {
            let props = field_properties(processor, &DEVICE_INFO_FIELDS)?;
            let mapping = lease.mapping();
            Ok(DeviceInfo {
                vendor_name: read_string(processor, mapping, &props[0])?,
                product_code: read_string(processor, mapping, &props[1])?,
                major_minor_revision: read_string(processor, mapping, &props[2])?,
                serial_number: read_serial_number(processor, mapping, &props[3])?,
                hardware_revision: read_string(processor, mapping, &props[4])?,
                base_firmware: read_string(processor, mapping, &props[5])?,
            })
        })
    }
}

impl RuntimeConfiguration {
    /// Read the current sizes
    pub fn read(processor: &SlaveProcessor) -> ModbusResult<Self> {
        debug!("Reading runtime configuration");
        with_session(processor, |lease| {
            let props = field_properties(processor, &RUNTIME_CONFIG_FIELDS)?;
            let mapping = lease.mapping().clone();
            let mut values = [0u16; 8];
            for (value, props) in values.iter_mut().zip(&props) {
                *value = read_register(processor, &mapping, props)?;
            }
            Ok(RuntimeConfiguration {
                tags_in_field: values[0],
                memory_selector: values[1] as i16,
                epc_length: values[2],
                tid_length: values[3],
                user_length: values[4],
                selection_mask_count: values[5],
                selection_mask_max_length: values[6],
                custom_command_max_length: values[7],
            })
        })
    }

    /// Apply new sizes; the layout is recomputed after every field
    pub fn write(&self, processor: &SlaveProcessor) -> ModbusResult<()> {
        debug!("Writing runtime configuration: {:?}", self);
        let values = [
            self.tags_in_field,
            self.memory_selector as u16,
            self.epc_length,
            self.tid_length,
            self.user_length,
            self.selection_mask_count,
            self.selection_mask_max_length,
            self.custom_command_max_length,
        ];
        with_session(processor, |lease| {
            let props = field_properties(processor, &RUNTIME_CONFIG_FIELDS)?;
            for (props, value) in props.iter().zip(values) {
                write_register(processor, lease, props, value)?;
            }
            Ok(())
        })
    }
}
