//! Backend adapter between reader fields and the RF device
//!
//! Holds the state a Modbus master configures at runtime (selection masks,
//! antenna mask, access password) together with the tag population of the last
//! inventory, and translates field reads and writes into device calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::DeviceIdentity;
use crate::error::{ModbusError, ModbusResult};
use crate::field::{DataType, Field, FieldValue};
use crate::rf::constants::{RfErrorCode, RfFieldType};
use crate::rf::device::{
    AntennaConfiguration, AntennaProperties, Capabilities, CapabilityType, Configuration,
    ConfigurationType, DeviceCapabilities, DeviceError, Filter, OperationResult,
    RegulatoryCapabilities, ResultCode, RfDevice, RfDeviceFactory, TagData, TagOperation,
    BANK_EPC, BANK_RESERVED, BANK_TID, BANK_USER,
};
use crate::utils::DeviceCallTimer;

/// Most words the reader reads in one operation
pub const MAX_WORDS_READ: u16 = 255;
/// Most words the reader writes in one operation
pub const MAX_WORDS_WRITE: usize = 122;

const OPERATION_ID: &str = "g01";

/// Per-tag scratch state, valid until the next inventory
#[derive(Debug, Clone, Default)]
struct ExTagData {
    custom_command_length: u16,
    custom_command: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
struct MaskSlot {
    bank: u16,
    bit_length: u16,
    bit_offset: u16,
    data: Vec<u8>,
}

impl MaskSlot {
    /// Inventory filter of the mask, `None` for an unused slot
    fn to_filter(&self) -> Option<Filter> {
        if self.bit_length == 0 {
            return None;
        }
        let mut data = self.data.clone();
        let byte_length = (self.bit_length as usize + 7) / 8;
        if data.len() < byte_length {
            data.resize(byte_length, 0);
        }
        Some(Filter {
            bank: self.bank,
            bit_offset: self.bit_offset,
            bit_length: self.bit_length,
            mask: vec![0xFF; data.len()],
            data,
            matching: true,
        })
    }
}

fn epc_filter(epc: &[u8]) -> Filter {
    Filter {
        bank: BANK_EPC,
        // behind CRC and PC
        bit_offset: 32,
        bit_length: (epc.len() * 8) as u16,
        mask: vec![0xFF; epc.len()],
        data: epc.to_vec(),
        matching: true,
    }
}

/// Antennas selected by the antenna mask, 0 meaning all
fn antenna_ids(antenna_mask: i16) -> Vec<u16> {
    if antenna_mask == 0 {
        return vec![0];
    }
    let mut ids = Vec::new();
    if antenna_mask & 1 == 1 {
        ids.push(1);
    }
    if antenna_mask & 2 == 2 {
        ids.push(2);
    }
    ids
}

fn masked(password: u32) -> &'static str {
    if password == 0 {
        "0"
    } else {
        "***"
    }
}

/// Decimal serial number as big-endian words
fn serial_to_shorts(serial: &str, count: usize) -> ModbusResult<Vec<i16>> {
    let value: u64 = serial.trim().parse().map_err(|_| {
        ModbusError::module(
            format!("Serial number '{}' cannot be stored in {} short values", serial, count),
            RfErrorCode::NonSpecificReaderError,
        )
    })?;
    let mut words = vec![0i16; count];
    for (i, word) in words.iter_mut().rev().enumerate() {
        *word = value.checked_shr(16 * i as u32).unwrap_or(0) as u16 as i16;
    }
    Ok(words)
}

/// Move bank data to its register position
///
/// A positive word offset prepends zeros, a negative one cuts leading bytes.
/// A word count of 0 keeps the natural length.
pub(crate) fn shift_data(data: &[u8], word_offset: i32, word_count: u16) -> Vec<u8> {
    if data.is_empty() || word_offset == 0 {
        return data.to_vec();
    }
    let byte_offset = word_offset.unsigned_abs() as usize * 2;
    if word_offset > 0 {
        let length = if word_count > 0 { word_count as usize * 2 } else { data.len() + byte_offset };
        let mut result = vec![0; length];
        if byte_offset < length {
            let n = data.len().min(length - byte_offset);
            result[byte_offset..byte_offset + n].copy_from_slice(&data[..n]);
        }
        result
    } else {
        let available = data.len().saturating_sub(byte_offset);
        let length = if word_count > 0 { word_count as usize * 2 } else { available };
        let mut result = vec![0; length];
        let n = available.min(length);
        result[..n].copy_from_slice(&data[byte_offset..byte_offset + n]);
        result
    }
}

fn device_error(action: &str, err: DeviceError) -> ModbusError {
    ModbusError::module(format!("Cannot {}: {}", action, err), RfErrorCode::NonSpecificReaderError)
}

fn missing_result(action: &str) -> ModbusError {
    ModbusError::module(format!("Cannot {}: Missing result", action), RfErrorCode::NonSpecificReaderError)
}

fn check_result(result: OperationResult, action: &str) -> ModbusResult<OperationResult> {
    match result.result() {
        ResultCode::Success => Ok(result),
        code => Err(ModbusError::module(
            format!("Cannot {}: {:?}", action, code),
            RfErrorCode::from_result(code),
        )),
    }
}

fn mismatch(kind: RfFieldType, expected: DataType, value: &FieldValue) -> ModbusError {
    ModbusError::data_type_mismatch(kind.id(), expected.name(), value.data_type().name())
}

fn ushorts(kind: RfFieldType, value: &FieldValue) -> ModbusResult<&[u16]> {
    value.as_ushorts().ok_or_else(|| mismatch(kind, DataType::UShort, value))
}

fn shorts(kind: RfFieldType, value: &FieldValue) -> ModbusResult<&[i16]> {
    value.as_shorts().ok_or_else(|| mismatch(kind, DataType::Short, value))
}

fn bytes(kind: RfFieldType, value: &FieldValue) -> ModbusResult<&[u8]> {
    value.as_bytes().ok_or_else(|| mismatch(kind, DataType::Byte, value))
}

fn first_string(kind: RfFieldType, value: &FieldValue) -> ModbusResult<Option<String>> {
    let strings = value.as_strings().ok_or_else(|| mismatch(kind, DataType::String, value))?;
    Ok(strings.first().map(|s| s.clone().unwrap_or_default()))
}

fn string_value(s: &str) -> FieldValue {
    FieldValue::String(vec![Some(s.to_string())])
}

/// Connection to one RF device and the runtime state around it
pub struct RfConnector {
    factory: Arc<dyn RfDeviceFactory>,
    identity: DeviceIdentity,
    device: Option<Box<dyn RfDevice>>,
    vendor_name: String,
    product_code: String,
    major_minor_revision: String,
    tags_in_field: u16,
    tid_length: u16,
    selection_masks: Vec<MaskSlot>,
    antenna_mask: i16,
    access_password: u32,
    last_error: RfErrorCode,
    tags: Vec<TagData>,
    // tag index -> extended tag data
    ex_tag_data: HashMap<usize, ExTagData>,
}

impl RfConnector {
    pub fn new(factory: Arc<dyn RfDeviceFactory>, identity: DeviceIdentity) -> Self {
        Self {
            factory,
            identity,
            device: None,
            vendor_name: String::new(),
            product_code: String::new(),
            major_minor_revision: String::new(),
            tags_in_field: 0,
            tid_length: 0,
            selection_masks: Vec::new(),
            antenna_mask: 0,
            access_password: 0,
            last_error: RfErrorCode::None,
            tags: Vec::new(),
            ex_tag_data: HashMap::new(),
        }
    }

    /// Obtain a device from the factory and open it
    ///
    /// `timeout` covers both steps. All runtime state is reset.
    pub fn open(&mut self, timeout: Duration) -> ModbusResult<()> {
        let start = Instant::now();
        let mut device = self.factory.create(timeout).map_err(|e| {
            ModbusError::module(
                format!("Cannot get RF device within {}ms: {}", timeout.as_millis(), e),
                RfErrorCode::NonSpecificReaderError,
            )
        })?;
        let remaining = timeout.saturating_sub(start.elapsed());
        info!("Opening connection to RF device");
        device.open_connection(remaining).map_err(|e| {
            ModbusError::module(
                format!("Cannot open connection to RF device within {}ms: {}", remaining.as_millis(), e),
                RfErrorCode::NonSpecificReaderError,
            )
        })?;
        self.device = Some(device);
        self.vendor_name.clear();
        self.product_code.clear();
        self.major_minor_revision.clear();
        self.tags_in_field = 0;
        self.tid_length = 0;
        self.selection_masks.clear();
        self.antenna_mask = 0;
        self.access_password = 0;
        self.last_error = RfErrorCode::None;
        self.tags.clear();
        self.ex_tag_data.clear();
        Ok(())
    }

    pub fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut device) = self.device.take() {
            info!("Closing connection to RF device");
            device.close_connection().map_err(|e| device_error("close connection to RF device", e))?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Code of the last failed field access, `None` after a successful one
    pub fn last_error(&self) -> RfErrorCode {
        self.last_error
    }

    /// Tags found by the last inventory, sorted by EPC
    pub fn tags(&self) -> &[TagData] {
        &self.tags
    }

    /// Current value of a field
    ///
    /// Returns `None` for fields whose value is kept by the caller (layout
    /// sizes) and for unsupported fields.
    pub fn get_field_value(&mut self, field: &Field, group_index: u16) -> ModbusResult<Option<FieldValue>> {
        let result = self.read_field(field, group_index);
        self.last_error = match &result {
            Ok(_) => RfErrorCode::None,
            Err(e) => e.error_code(),
        };
        result
    }

    /// Apply a field value; `None` leaves the field untouched
    pub fn set_field_value(&mut self, field: &Field, group_index: u16, value: Option<&FieldValue>) -> ModbusResult<()> {
        let value = match value {
            Some(value) => value,
            None => return Ok(()),
        };
        let result = self.write_field(field, group_index, value);
        self.last_error = match &result {
            Ok(_) => RfErrorCode::None,
            Err(e) => e.error_code(),
        };
        result
    }

    fn device(&mut self) -> ModbusResult<&mut Box<dyn RfDevice>> {
        self.device
            .as_mut()
            .ok_or_else(|| ModbusError::not_connected("No connection to RF device"))
    }

    fn field_type(field: &Field) -> ModbusResult<RfFieldType> {
        RfFieldType::from_field(field).ok_or_else(|| {
            ModbusError::module(format!("Unknown field {}", field), RfErrorCode::NonSpecificReaderError)
        })
    }

    fn read_field(&mut self, field: &Field, group_index: u16) -> ModbusResult<Option<FieldValue>> {
        use RfFieldType::*;

        let kind = Self::field_type(field)?;
        let value = match kind {
            VendorName => string_value(&self.vendor_name),
            ProductCode => string_value(&self.product_code),
            MajorMinorRevision => string_value(&self.major_minor_revision),
            SerialNumber => FieldValue::Short(serial_to_shorts(&self.identity.serial_number(), 4)?),
            HardwareRevision => string_value(&self.identity.hardware_revision()),
            BaseFirmware => string_value(&self.identity.base_firmware()),

            CommunicationStandard => {
                let caps = self.regulatory_capabilities()?;
                debug!("  communicationStandard={}", caps.communication_standard);
                FieldValue::UShort(vec![caps.communication_standard])
            }
            NumberOfAntennas => {
                let caps = self.device_capabilities()?;
                debug!("  numberOfAntennas={}", caps.number_of_antennas);
                FieldValue::UShort(vec![caps.number_of_antennas])
            }
            AntennaOneConnected => FieldValue::UShort(vec![self.antenna_properties(1)?.connected as u16]),
            AntennaTwoConnected => FieldValue::UShort(vec![self.antenna_properties(2)?.connected as u16]),
            AntennaOneTransmitPower => return Ok(self.transmit_power(1)?.map(|p| FieldValue::Short(vec![p]))),
            AntennaTwoTransmitPower => return Ok(self.transmit_power(2)?.map(|p| FieldValue::Short(vec![p]))),

            TagsInField => FieldValue::UShort(vec![self.tags_in_field]),
            TidLength => FieldValue::UShort(vec![self.tid_length]),
            SelectionMaskCount => FieldValue::UShort(vec![self.selection_masks.len() as u16]),
            // layout sizes live in the module
            MemorySelector | EpcLength | UserLength | SelectionMaskMaxLength | CustomCommandMaxLength => {
                return Ok(None)
            }

            TagCount => {
                self.tags = self.inventory()?;
                self.ex_tag_data.clear();
                FieldValue::UShort(vec![self.tags.len() as u16])
            }
            LastError => FieldValue::UShort(vec![self.last_error.value()]),
            AccessPassword => FieldValue::Short(vec![
                (self.access_password >> 16) as u16 as i16,
                self.access_password as u16 as i16,
            ]),
            AntennaMask => FieldValue::Short(vec![self.antenna_mask]),

            SelectionMaskBank | SelectionMaskLength | SelectionMaskOffset | SelectionMask => {
                let mask = self.selection_mask(kind, group_index, "Reading")?;
                match kind {
                    SelectionMaskBank => FieldValue::UShort(vec![mask.bank]),
                    SelectionMaskLength => FieldValue::UShort(vec![mask.bit_length]),
                    SelectionMaskOffset => FieldValue::UShort(vec![mask.bit_offset]),
                    _ => FieldValue::Byte(mask.data.clone()),
                }
            }

            LockOperation | KillOperation | KillPwd | AccessPwd | Crc | Pc | Epc | Xpc | TidBank
            | UserBank | CustomCommandLength | CustomCommandData => {
                return self.read_tag_field(kind, field, group_index)
            }
        };
        Ok(Some(value))
    }

    fn write_field(&mut self, field: &Field, group_index: u16, value: &FieldValue) -> ModbusResult<()> {
        use RfFieldType::*;

        let kind = Self::field_type(field)?;
        match kind {
            VendorName => {
                if let Some(s) = first_string(kind, value)? {
                    self.vendor_name = s;
                }
            }
            ProductCode => {
                if let Some(s) = first_string(kind, value)? {
                    self.product_code = s;
                }
            }
            MajorMinorRevision => {
                if let Some(s) = first_string(kind, value)? {
                    self.major_minor_revision = s;
                }
            }
            // read only
            SerialNumber | HardwareRevision | BaseFirmware | CommunicationStandard | NumberOfAntennas
            | TagCount | LastError => {}

            AntennaOneConnected | AntennaTwoConnected => {
                if let Some(v) = ushorts(kind, value)?.first() {
                    let antenna_id = if kind == AntennaOneConnected { 1 } else { 2 };
                    self.set_antenna_connected(antenna_id, *v == 1)?;
                }
            }
            AntennaOneTransmitPower | AntennaTwoTransmitPower => {
                if let Some(v) = shorts(kind, value)?.first() {
                    let antenna_id = if kind == AntennaOneTransmitPower { 1 } else { 2 };
                    self.set_transmit_power(antenna_id, *v)?;
                }
            }

            TagsInField => {
                if let Some(v) = ushorts(kind, value)?.first() {
                    self.tags_in_field = *v;
                }
            }
            TidLength => {
                if let Some(v) = ushorts(kind, value)?.first() {
                    self.tid_length = *v;
                }
            }
            SelectionMaskCount => {
                if let Some(v) = ushorts(kind, value)?.first() {
                    self.selection_masks = vec![MaskSlot::default(); *v as usize];
                }
            }
            MemorySelector | EpcLength | UserLength | SelectionMaskMaxLength | CustomCommandMaxLength => {}

            AccessPassword => {
                let words = shorts(kind, value)?;
                if words.len() > 1 {
                    self.access_password = (words[0] as u16 as u32) << 16 | words[1] as u16 as u32;
                }
            }
            AntennaMask => {
                if let Some(v) = shorts(kind, value)?.first() {
                    self.antenna_mask = *v;
                }
            }

            SelectionMaskBank | SelectionMaskLength | SelectionMaskOffset => {
                self.selection_mask(kind, group_index, "Writing")?;
                if let Some(v) = ushorts(kind, value)?.first().copied() {
                    let mask = &mut self.selection_masks[group_index as usize];
                    match kind {
                        SelectionMaskBank => mask.bank = v,
                        SelectionMaskLength => mask.bit_length = v,
                        _ => mask.bit_offset = v,
                    }
                }
            }
            SelectionMask => {
                self.selection_mask(kind, group_index, "Writing")?;
                let data = bytes(kind, value)?;
                if !data.is_empty() {
                    self.selection_masks[group_index as usize].data = data.to_vec();
                }
            }

            LockOperation | KillOperation | KillPwd | AccessPwd | Crc | Pc | Epc | Xpc | TidBank
            | UserBank | CustomCommandLength | CustomCommandData => {
                self.write_tag_field(kind, field, group_index, value)?
            }
        }
        Ok(())
    }

    fn read_tag_field(&mut self, kind: RfFieldType, field: &Field, group_index: u16) -> ModbusResult<Option<FieldValue>> {
        use RfFieldType::*;

        let index = self.tag_index(kind, group_index, "Reading")?;
        let value = match kind {
            // unsupported
            LockOperation | KillOperation => return Ok(None),
            KillPwd => FieldValue::Byte(self.read_words(index, BANK_RESERVED, 0, 2)?),
            AccessPwd => FieldValue::Byte(self.read_words(index, BANK_RESERVED, 2, 2)?),
            Crc => FieldValue::UShort(vec![self.tags[index].crc]),
            Pc => FieldValue::UShort(vec![self.tags[index].pc]),
            Epc => FieldValue::Byte(self.tags[index].epc.clone()),
            Xpc => {
                let xpc = self.tags[index].xpc;
                FieldValue::UShort(vec![(xpc >> 16) as u16, xpc as u16])
            }
            TidBank => {
                let count = self.tid_length;
                FieldValue::Byte(self.read_words(index, BANK_TID, 0, count)?)
            }
            UserBank => {
                let data = self.read_words(index, BANK_USER, field.offset(), field.length())?;
                FieldValue::Byte(shift_data(&data, field.offset() as i32, 0))
            }
            CustomCommandLength => FieldValue::UShort(vec![self.ex_tag_data(index).custom_command_length]),
            CustomCommandData => return Ok(self.ex_tag_data(index).custom_command.clone().map(FieldValue::Byte)),
            other => return Err(ModbusError::internal(format!("{} is not a tag field", other))),
        };
        Ok(Some(value))
    }

    fn write_tag_field(&mut self, kind: RfFieldType, field: &Field, group_index: u16, value: &FieldValue) -> ModbusResult<()> {
        use RfFieldType::*;

        let index = self.tag_index(kind, group_index, "Writing")?;
        match kind {
            LockOperation | KillOperation => {}
            KillPwd => {
                self.write_words(index, BANK_RESERVED, 0, bytes(kind, value)?)?;
            }
            AccessPwd => {
                self.write_words(index, BANK_RESERVED, 2, bytes(kind, value)?)?;
            }
            Crc => {
                if let Some(v) = ushorts(kind, value)?.first().copied() {
                    if self.tags[index].crc != v {
                        self.write_words(index, BANK_EPC, 0, &v.to_be_bytes())?;
                        self.tags[index].crc = v;
                    }
                }
            }
            Pc => {
                if let Some(v) = ushorts(kind, value)?.first().copied() {
                    if self.tags[index].pc != v {
                        self.write_words(index, BANK_EPC, 1, &v.to_be_bytes())?;
                        self.tags[index].pc = v;
                    }
                }
            }
            Epc => {
                let epc = bytes(kind, value)?;
                if self.tags[index].epc != epc {
                    self.write_words(index, BANK_EPC, 2, epc)?;
                    self.tags[index].epc = epc.to_vec();
                }
            }
            Xpc => {
                let words = ushorts(kind, value)?;
                if words.len() > 1 {
                    let xpc = (words[0] as u32) << 16 | words[1] as u32;
                    let tag = &self.tags[index];
                    if tag.xpc != xpc {
                        let offset = 2 + (tag.pc >> 11);
                        self.write_words(index, BANK_EPC, offset, &xpc.to_be_bytes())?;
                        self.tags[index].xpc = xpc;
                    }
                }
            }
            TidBank => {
                self.write_words(index, BANK_TID, 0, bytes(kind, value)?)?;
            }
            UserBank => {
                let data = shift_data(bytes(kind, value)?, -(field.offset() as i32), field.length());
                self.write_words(index, BANK_USER, field.offset(), &data)?;
            }
            CustomCommandLength => {
                if let Some(v) = ushorts(kind, value)?.first() {
                    self.ex_tag_data(index).custom_command_length = *v;
                }
            }
            CustomCommandData => {
                let data = bytes(kind, value)?.to_vec();
                let ex = self.ex_tag_data(index);
                let bit_count = ex.custom_command_length;
                ex.custom_command_length = 0;
                ex.custom_command = None;
                let result = self.exec_custom_command(index, data, bit_count)?;
                let ex = self.ex_tag_data(index);
                ex.custom_command_length = (result.len() * 8) as u16;
                ex.custom_command = Some(result);
            }
            other => return Err(ModbusError::internal(format!("{} is not a tag field", other))),
        }
        Ok(())
    }

    fn ex_tag_data(&mut self, index: usize) -> &mut ExTagData {
        self.ex_tag_data.entry(index).or_default()
    }

    fn selection_mask(&self, kind: RfFieldType, group_index: u16, action: &str) -> ModbusResult<&MaskSlot> {
        self.selection_masks.get(group_index as usize).ok_or_else(|| {
            ModbusError::module(
                format!(
                    "{} field {}: Max. selection mask count exceeded: {}/{}",
                    action,
                    kind,
                    group_index as usize + 1,
                    self.selection_masks.len()
                ),
                RfErrorCode::NonSpecificReaderError,
            )
        })
    }

    fn tag_index(&self, kind: RfFieldType, group_index: u16, action: &str) -> ModbusResult<usize> {
        let index = group_index as usize;
        if index >= self.tags.len() {
            return Err(ModbusError::module(
                format!(
                    "{} field {}: Max. tag count exceeded: {}/{}",
                    action,
                    kind,
                    index + 1,
                    self.tags.len()
                ),
                RfErrorCode::NonSpecificReaderError,
            ));
        }
        Ok(index)
    }

    fn inventory(&mut self) -> ModbusResult<Vec<TagData>> {
        let antennas = antenna_ids(self.antenna_mask);
        let filters: Vec<Filter> = self.selection_masks.iter().filter_map(MaskSlot::to_filter).collect();
        let mut operations = Vec::new();
        // whole TID bank for tags carrying extended data
        if self.tid_length > 0 {
            operations.push(TagOperation::Read {
                id: OPERATION_ID.to_string(),
                bank: BANK_TID,
                offset: 0,
                length: 0,
                password: self.access_password,
            });
        }
        debug!(
            "Executing inventory: antennas={:?}, filters={}, accessPassword={}",
            antennas,
            filters.len(),
            masked(self.access_password)
        );
        let timer = DeviceCallTimer::start("inventory");
        let result = self.device()?.execute(&antennas, &filters, &operations);
        timer.finish();
        let mut tags = result.map_err(|e| device_error("execute RF service", e))?;

        if tags.len() > self.tags_in_field as usize {
            return Err(ModbusError::module(
                format!("Inventory failed: Max. tag count exceeded: {}/{}", tags.len(), self.tags_in_field),
                RfErrorCode::TagsInFieldExceeded,
            ));
        }
        tags.sort_by(|a, b| a.epc.cmp(&b.epc));
        info!("Inventory found {} tags", tags.len());
        Ok(tags)
    }

    /// Run operations on one tag, identified by its EPC
    fn execute_on_tag(&mut self, index: usize, operations: Vec<TagOperation>, action: &str) -> ModbusResult<OperationResult> {
        let tag = &self.tags[index];
        let antenna_id = tag.antenna_id;
        let filter = epc_filter(&tag.epc);
        let timer = DeviceCallTimer::start(action);
        let result = self.device()?.execute(&[antenna_id], &[filter], &operations);
        timer.finish();
        let tags = result.map_err(|e| device_error(action, e))?;
        let result = tags
            .into_iter()
            .next()
            .and_then(|tag| tag.results.into_iter().next())
            .ok_or_else(|| missing_result(action))?;
        check_result(result, action)
    }

    fn read_words(&mut self, index: usize, bank: u16, offset: u16, count: u16) -> ModbusResult<Vec<u8>> {
        if count > MAX_WORDS_READ {
            return Err(ModbusError::module(
                format!("Reader is unable to read more than {} words at once", MAX_WORDS_READ),
                RfErrorCode::NonSpecificReaderError,
            ));
        }
        debug!(
            "Reading tag data: epc={}, bank={}, wordOffset={}, wordCount={}, accessPassword={}",
            hex::encode_upper(&self.tags[index].epc),
            bank,
            offset,
            count,
            masked(self.access_password)
        );
        let operation = TagOperation::Read {
            id: OPERATION_ID.to_string(),
            bank,
            offset,
            length: count,
            password: self.access_password,
        };
        match self.execute_on_tag(index, vec![operation], "read data")? {
            OperationResult::Read { data, .. } => Ok(data),
            _ => Err(missing_result("read data")),
        }
    }

    fn write_words(&mut self, index: usize, bank: u16, offset: u16, data: &[u8]) -> ModbusResult<u16> {
        if data.len() / 2 > MAX_WORDS_WRITE {
            return Err(ModbusError::module(
                format!("Reader is unable to write more than {} words at once", MAX_WORDS_WRITE),
                RfErrorCode::NonSpecificReaderError,
            ));
        }
        debug!(
            "Writing tag data: epc={}, bank={}, wordOffset={}, data={}, accessPassword={}",
            hex::encode_upper(&self.tags[index].epc),
            bank,
            offset,
            hex::encode_upper(data),
            masked(self.access_password)
        );
        let operation = TagOperation::Write {
            id: OPERATION_ID.to_string(),
            bank,
            offset,
            data: data.to_vec(),
            password: self.access_password,
        };
        match self.execute_on_tag(index, vec![operation], "write data")? {
            OperationResult::Write { words_written, .. } => Ok(words_written),
            _ => Err(missing_result("write data")),
        }
    }

    fn exec_custom_command(&mut self, index: usize, data: Vec<u8>, bit_count: u16) -> ModbusResult<Vec<u8>> {
        debug!(
            "Executing custom command: epc={}, data={}, bitCount={}, accessPassword={}",
            hex::encode_upper(&self.tags[index].epc),
            hex::encode_upper(&data),
            bit_count,
            masked(self.access_password)
        );
        let operation = TagOperation::Custom {
            id: OPERATION_ID.to_string(),
            data,
            length: bit_count,
            password: self.access_password,
        };
        match self.execute_on_tag(index, vec![operation], "execute custom command")? {
            OperationResult::Custom { data, .. } => Ok(data),
            _ => Err(missing_result("execute custom command")),
        }
    }

    fn capabilities(&mut self, kind: CapabilityType) -> ModbusResult<Capabilities> {
        let action = format!("get capabilities of type {:?}", kind);
        let caps = self.device()?.get_capabilities(kind).map_err(|e| device_error(&action, e))?;
        info!("Received {:?}", kind);
        caps.into_iter().next().ok_or_else(|| missing_result(&action))
    }

    fn regulatory_capabilities(&mut self) -> ModbusResult<RegulatoryCapabilities> {
        match self.capabilities(CapabilityType::RegulatoryCapabilities)? {
            Capabilities::Regulatory(caps) => Ok(caps),
            _ => Err(missing_result("get regulatory capabilities")),
        }
    }

    fn device_capabilities(&mut self) -> ModbusResult<DeviceCapabilities> {
        match self.capabilities(CapabilityType::DeviceCapabilities)? {
            Capabilities::Device(caps) => Ok(caps),
            _ => Err(missing_result("get device capabilities")),
        }
    }

    fn configuration(&mut self, kind: ConfigurationType, antenna_id: u16) -> ModbusResult<Configuration> {
        let action = format!("get configuration of type {:?} for antenna {}", kind, antenna_id);
        let confs = self
            .device()?
            .get_configuration(kind, antenna_id)
            .map_err(|e| device_error(&action, e))?;
        info!("Received {:?}", kind);
        confs.into_iter().next().ok_or_else(|| missing_result(&action))
    }

    fn antenna_properties(&mut self, antenna_id: u16) -> ModbusResult<AntennaProperties> {
        match self.configuration(ConfigurationType::AntennaProperties, antenna_id)? {
            Configuration::AntennaProperties(props) => {
                debug!("  antenna {} isConnected={}", antenna_id, props.connected);
                Ok(props)
            }
            _ => Err(missing_result("get antenna properties")),
        }
    }

    fn set_antenna_connected(&mut self, antenna_id: u16, connected: bool) -> ModbusResult<()> {
        let props = self.antenna_properties(antenna_id)?;
        if props.connected != connected {
            let action = format!("set connection state to {} for antenna {}", connected, antenna_id);
            self.device()?
                .set_configuration(&[Configuration::AntennaProperties(AntennaProperties { connected, ..props })])
                .map_err(|e| device_error(&action, e))?;
        }
        Ok(())
    }

    /// Transmit power of an antenna in dBm
    fn transmit_power(&mut self, antenna_id: u16) -> ModbusResult<Option<i16>> {
        let conf = match self.configuration(ConfigurationType::AntennaConfiguration, antenna_id)? {
            Configuration::AntennaConfiguration(conf) => conf,
            _ => return Err(missing_result("get antenna configuration")),
        };
        let index = match conf.transmit_power {
            Some(index) => index,
            None => return Ok(None),
        };
        let caps = self.regulatory_capabilities()?;
        let entry = caps.transmit_power_table.iter().find(|e| e.index == index).ok_or_else(|| {
            ModbusError::module(
                format!("Cannot get transmit power for index {} and antenna {}", index, antenna_id),
                RfErrorCode::NonSpecificReaderError,
            )
        })?;
        debug!("  transmitPowerIndex={}, transmitPower={}", entry.index, entry.transmit_power);
        Ok(Some(entry.transmit_power))
    }

    fn set_transmit_power(&mut self, antenna_id: u16, power: i16) -> ModbusResult<()> {
        let caps = self.regulatory_capabilities()?;
        let entry = caps.transmit_power_table.iter().find(|e| e.transmit_power == power).ok_or_else(|| {
            ModbusError::module(
                format!("Cannot get index for transmit power {} and antenna {}", power, antenna_id),
                RfErrorCode::NonSpecificReaderError,
            )
        })?;
        debug!("  transmitPowerIndex={}, transmitPower={}", entry.index, entry.transmit_power);
        let conf = AntennaConfiguration { id: antenna_id, transmit_power: Some(entry.index) };
        let action = format!("set transmit power for antenna {}", antenna_id);
        self.device()?
            .set_configuration(&[Configuration::AntennaConfiguration(conf)])
            .map_err(|e| device_error(&action, e))
    }
}
