//! In-memory RF device
//!
//! Serves the binary when no reader hardware is attached and plays the backend
//! in tests. Clones share their state, so a test can keep a handle and inspect
//! what the gateway did to the device.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::rf::device::{
    AntennaConfiguration, AntennaProperties, CapabilityType, Capabilities, Configuration,
    ConfigurationType, DeviceCapabilities, DeviceError, Filter, OperationResult,
    RegulatoryCapabilities, ResultCode, RfDevice, TagData, TagOperation, TransmitPowerEntry,
    BANK_EPC, BANK_RESERVED, BANK_TID, BANK_USER,
};

/// Tag known to the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubTag {
    pub antenna_id: u16,
    pub crc: u16,
    pub pc: u16,
    pub epc: Vec<u8>,
    pub xpc: u32,
    /// Kill password followed by access password
    pub reserved_bank: Vec<u8>,
    pub tid_bank: Vec<u8>,
    pub user_bank: Vec<u8>,
}

impl StubTag {
    /// Tag with the given EPC and empty memory banks
    pub fn new(epc: Vec<u8>) -> Self {
        Self {
            antenna_id: 1,
            crc: 0,
            pc: ((epc.len() as u16 + 1) / 2) << 11,
            epc,
            xpc: 0,
            reserved_bank: vec![0; 8],
            tid_bank: Vec::new(),
            user_bank: Vec::new(),
        }
    }

    fn bank(&self, bank: u16) -> Vec<u8> {
        match bank {
            BANK_RESERVED => self.reserved_bank.clone(),
            BANK_EPC => {
                let mut bytes = Vec::with_capacity(4 + self.epc.len());
                bytes.extend_from_slice(&self.crc.to_be_bytes());
                bytes.extend_from_slice(&self.pc.to_be_bytes());
                bytes.extend_from_slice(&self.epc);
                bytes
            }
            BANK_TID => self.tid_bank.clone(),
            _ => self.user_bank.clone(),
        }
    }

    fn matches(&self, filter: &Filter) -> bool {
        let bank = self.bank(filter.bank);
        let matched = (0..filter.bit_length as usize).all(|i| {
            let mask_bit = filter.mask.get(i / 8).map_or(true, |m| m & (0x80 >> (i % 8)) != 0);
            if !mask_bit {
                return true;
            }
            let pos = filter.bit_offset as usize + i;
            let tag_bit = bank.get(pos / 8).map(|b| b & (0x80 >> (pos % 8)) != 0);
            let want_bit = filter.data.get(i / 8).map_or(false, |b| b & (0x80 >> (i % 8)) != 0);
            tag_bit == Some(want_bit)
        });
        matched == filter.matching
    }

    fn to_tag_data(&self, results: Vec<OperationResult>) -> TagData {
        TagData {
            antenna_id: self.antenna_id,
            crc: self.crc,
            pc: self.pc,
            epc: self.epc.clone(),
            xpc: self.xpc,
            rssi: -10,
            results,
        }
    }
}

impl Default for StubTag {
    fn default() -> Self {
        Self {
            antenna_id: 1,
            crc: 0x8000,
            pc: 0x3611,
            epc: vec![0x30, 0x0D, 0x96, 0x4A, 0x31, 0x20, 0x00, 0x40, 0x00, 0x00, 0x00, 0x01],
            xpc: 0x8765_4321,
            reserved_bank: vec![0xAF, 0xFE, 0x00, 0x01, 0x12, 0x34, 0x00, 0x01],
            tid_bank: vec![0xE2, 0x11, 0x10, 0x03],
            user_bank: vec![0x98, 0x76, 0x54, 0x00],
        }
    }
}

/// Counters of calls made against the stub
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StubStats {
    pub opens: usize,
    pub closes: usize,
    pub executes: usize,
    pub configuration_writes: usize,
}

#[derive(Debug)]
struct StubState {
    tags: Vec<StubTag>,
    antenna_properties: Vec<AntennaProperties>,
    antenna_configurations: Vec<AntennaConfiguration>,
    transmit_power_table: Vec<TransmitPowerEntry>,
    operation_result: ResultCode,
    fail_open: bool,
    connected: bool,
    stats: StubStats,
    last_operations: Vec<TagOperation>,
}

/// In-memory RF device with two antennas and a configurable tag population
#[derive(Debug, Clone)]
pub struct StubRfDevice {
    state: Arc<Mutex<StubState>>,
}

impl StubRfDevice {
    /// Device with the default tag in the field
    pub fn new() -> Self {
        Self::with_tags(vec![StubTag::default()])
    }

    /// Device with the given tags in the field
    pub fn with_tags(tags: Vec<StubTag>) -> Self {
        let state = StubState {
            tags,
            antenna_properties: vec![
                AntennaProperties { id: 1, connected: true, gain: 0 },
                AntennaProperties { id: 2, connected: false, gain: 0 },
            ],
            antenna_configurations: vec![
                AntennaConfiguration { id: 1, transmit_power: Some(9) },
                AntennaConfiguration { id: 2, transmit_power: Some(10) },
            ],
            transmit_power_table: vec![
                TransmitPowerEntry { index: 9, transmit_power: 18 },
                TransmitPowerEntry { index: 10, transmit_power: 20 },
            ],
            operation_result: ResultCode::Success,
            fail_open: false,
            connected: false,
            stats: StubStats::default(),
            last_operations: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StubState>, DeviceError> {
        self.state
            .lock()
            .map_err(|_| DeviceError::Implementation("Stub state lock poisoned".to_string()))
    }

    /// Make subsequent tag operations report `result`
    pub fn set_operation_result(&self, result: ResultCode) {
        if let Ok(mut state) = self.lock() {
            state.operation_result = result;
        }
    }

    /// Make subsequent connection attempts fail
    pub fn set_fail_open(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_open = fail;
        }
    }

    pub fn set_tags(&self, tags: Vec<StubTag>) {
        if let Ok(mut state) = self.lock() {
            state.tags = tags;
        }
    }

    pub fn tags(&self) -> Vec<StubTag> {
        self.lock().map(|state| state.tags.clone()).unwrap_or_default()
    }

    pub fn stats(&self) -> StubStats {
        self.lock().map(|state| state.stats).unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().map(|state| state.connected).unwrap_or(false)
    }

    /// Operations passed to the most recent `execute`
    pub fn last_operations(&self) -> Vec<TagOperation> {
        self.lock().map(|state| state.last_operations.clone()).unwrap_or_default()
    }

    pub fn antenna_configuration(&self, antenna_id: u16) -> Option<AntennaConfiguration> {
        self.lock()
            .ok()
            .and_then(|state| state.antenna_configurations.iter().find(|c| c.id == antenna_id).copied())
    }
}

impl Default for StubRfDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn words(bank: &[u8], offset: u16, length: u16) -> Option<Vec<u8>> {
    let start = offset as usize * 2;
    let end = if length == 0 { bank.len() } else { start + length as usize * 2 };
    if start > bank.len() || end > bank.len() {
        return None;
    }
    Some(bank[start..end].to_vec())
}

fn write_words(bank: &mut Vec<u8>, offset: u16, data: &[u8]) -> bool {
    let start = offset as usize * 2;
    if start + data.len() > bank.len() {
        return false;
    }
    bank[start..start + data.len()].copy_from_slice(data);
    true
}

fn apply(tag: &mut StubTag, operation: &TagOperation, forced: ResultCode) -> OperationResult {
    match operation {
        TagOperation::Read { id, bank, offset, length, .. } => {
            let data = if forced == ResultCode::Success { words(&tag.bank(*bank), *offset, *length) } else { None };
            let result = match (&data, forced) {
                (_, code) if code != ResultCode::Success => code,
                (Some(_), _) => ResultCode::Success,
                (None, _) => ResultCode::MemoryOverrunError,
            };
            OperationResult::Read { id: id.clone(), result, data: data.unwrap_or_default() }
        }
        TagOperation::Write { id, bank, offset, data, .. } => {
            if forced != ResultCode::Success {
                return OperationResult::Write { id: id.clone(), result: forced, words_written: 0 };
            }
            let word = |data: &[u8]| u16::from_be_bytes([data.first().copied().unwrap_or(0), data.get(1).copied().unwrap_or(0)]);
            let epc_words = (tag.pc >> 11) + 2;
            let ok = match *bank {
                BANK_RESERVED => write_words(&mut tag.reserved_bank, *offset, data),
                BANK_EPC if *offset == 0 => { tag.crc = word(data); true }
                BANK_EPC if *offset == 1 => { tag.pc = word(data); true }
                BANK_EPC if *offset == 2 => { tag.epc = data.clone(); true }
                BANK_EPC if *offset == epc_words => {
                    let high = word(data) as u32;
                    let low = word(data.get(2..).unwrap_or(&[])) as u32;
                    tag.xpc = high << 16 | low;
                    true
                }
                BANK_TID => write_words(&mut tag.tid_bank, *offset, data),
                BANK_USER => write_words(&mut tag.user_bank, *offset, data),
                _ => false,
            };
            let result = if ok { ResultCode::Success } else { ResultCode::MemoryOverrunError };
            let words_written = if ok { ((data.len() + 1) / 2) as u16 } else { 0 };
            OperationResult::Write { id: id.clone(), result, words_written }
        }
        TagOperation::Custom { id, data, length, .. } => {
            let byte_count = ((*length as usize + 7) / 8).min(data.len());
            let response = data[..byte_count].iter().map(|b| b.wrapping_add(1)).collect();
            OperationResult::Custom { id: id.clone(), result: forced, data: response }
        }
    }
}

impl RfDevice for StubRfDevice {
    fn open_connection(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        if state.fail_open {
            return Err(DeviceError::Connection(format!("Stub refused connection within {:?}", timeout)));
        }
        state.connected = true;
        state.stats.opens += 1;
        debug!("Stub device opened ({} opens)", state.stats.opens);
        Ok(())
    }

    fn close_connection(&mut self) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        state.connected = false;
        state.stats.closes += 1;
        debug!("Stub device closed ({} closes)", state.stats.closes);
        Ok(())
    }

    fn get_capabilities(&mut self, kind: CapabilityType) -> Result<Vec<Capabilities>, DeviceError> {
        let state = self.lock()?;
        let capabilities = match kind {
            CapabilityType::DeviceCapabilities => Capabilities::Device(DeviceCapabilities {
                manufacturer: "1".to_string(),
                model: "2".to_string(),
                firmware: "0.0.9".to_string(),
                number_of_antennas: 1,
            }),
            CapabilityType::RegulatoryCapabilities => Capabilities::Regulatory(RegulatoryCapabilities {
                communication_standard: 2,
                transmit_power_table: state.transmit_power_table.clone(),
            }),
        };
        Ok(vec![capabilities])
    }

    fn get_configuration(&mut self, kind: ConfigurationType, antenna_id: u16) -> Result<Vec<Configuration>, DeviceError> {
        let state = self.lock()?;
        let configurations = match kind {
            ConfigurationType::AntennaProperties => state
                .antenna_properties
                .iter()
                .filter(|p| antenna_id == 0 || p.id == antenna_id)
                .map(|p| Configuration::AntennaProperties(*p))
                .collect(),
            ConfigurationType::AntennaConfiguration => state
                .antenna_configurations
                .iter()
                .filter(|c| antenna_id == 0 || c.id == antenna_id)
                .map(|c| Configuration::AntennaConfiguration(*c))
                .collect(),
        };
        Ok(configurations)
    }

    fn set_configuration(&mut self, configuration: &[Configuration]) -> Result<(), DeviceError> {
        let mut state = self.lock()?;
        state.stats.configuration_writes += 1;
        for conf in configuration {
            match conf {
                Configuration::AntennaProperties(props) => {
                    for existing in state.antenna_properties.iter_mut() {
                        if props.id == 0 || existing.id == props.id {
                            *existing = AntennaProperties { id: existing.id, ..*props };
                        }
                    }
                }
                Configuration::AntennaConfiguration(antenna) => {
                    for existing in state.antenna_configurations.iter_mut() {
                        if antenna.id == 0 || existing.id == antenna.id {
                            *existing = AntennaConfiguration { id: existing.id, ..*antenna };
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn execute(
        &mut self,
        antennas: &[u16],
        filters: &[Filter],
        operations: &[TagOperation],
    ) -> Result<Vec<TagData>, DeviceError> {
        let mut state = self.lock()?;
        if !state.connected {
            return Err(DeviceError::Connection("Stub device is not connected".to_string()));
        }
        state.stats.executes += 1;
        state.last_operations = operations.to_vec();
        let forced = state.operation_result;

        let mut seen = Vec::new();
        for tag in state.tags.iter_mut() {
            let on_antenna = antennas.iter().any(|a| *a == 0 || *a == tag.antenna_id);
            if !on_antenna || !filters.iter().all(|f| tag.matches(f)) {
                continue;
            }
            let results = operations.iter().map(|op| apply(tag, op, forced)).collect();
            seen.push(tag.to_tag_data(results));
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epc_filter(epc: &[u8]) -> Filter {
        Filter {
            bank: BANK_EPC,
            bit_offset: 32,
            bit_length: epc.len() as u16 * 8,
            mask: vec![0xFF; epc.len()],
            data: epc.to_vec(),
            matching: true,
        }
    }

    #[test]
    fn test_inventory_filters_by_epc() {
        let mut device = StubRfDevice::with_tags(vec![StubTag::new(vec![0x01, 0x02]), StubTag::new(vec![0x03, 0x04])]);
        device.open_connection(Duration::from_millis(10)).unwrap();

        assert_eq!(device.execute(&[0], &[], &[]).unwrap().len(), 2);
        let tags = device.execute(&[1], &[epc_filter(&[0x03, 0x04])], &[]).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].epc, vec![0x03, 0x04]);
        assert!(device.execute(&[2], &[], &[]).unwrap().is_empty());
        assert_eq!(device.stats().executes, 3);
    }

    #[test]
    fn test_read_and_write_banks() {
        let mut device = StubRfDevice::new();
        device.open_connection(Duration::from_millis(10)).unwrap();

        let read = TagOperation::Read { id: "r".into(), bank: BANK_RESERVED, offset: 2, length: 2, password: 0 };
        let tags = device.execute(&[0], &[], &[read]).unwrap();
        assert_eq!(
            tags[0].results[0],
            OperationResult::Read { id: "r".into(), result: ResultCode::Success, data: vec![0x12, 0x34, 0x00, 0x01] }
        );

        let write = TagOperation::Write { id: "w".into(), bank: BANK_USER, offset: 1, data: vec![0xAB, 0xCD], password: 0 };
        device.execute(&[0], &[], &[write]).unwrap();
        assert_eq!(device.tags()[0].user_bank, vec![0x98, 0x76, 0xAB, 0xCD]);

        let overrun = TagOperation::Read { id: "r".into(), bank: BANK_TID, offset: 0, length: 8, password: 0 };
        let tags = device.execute(&[0], &[], &[overrun]).unwrap();
        assert_eq!(tags[0].results[0].result(), ResultCode::MemoryOverrunError);
    }

    #[test]
    fn test_clones_share_state() {
        let device = StubRfDevice::new();
        let mut handle = device.clone();
        handle.open_connection(Duration::from_millis(10)).unwrap();
        assert!(device.is_connected());

        device.set_fail_open(true);
        assert!(handle.open_connection(Duration::from_millis(10)).is_err());
        assert_eq!(device.stats().opens, 1);
    }

    #[test]
    fn test_transmit_power_configuration() {
        let mut device = StubRfDevice::new();
        device
            .set_configuration(&[Configuration::AntennaConfiguration(AntennaConfiguration { id: 1, transmit_power: Some(10) })])
            .unwrap();
        assert_eq!(device.antenna_configuration(1).and_then(|c| c.transmit_power), Some(10));
        assert_eq!(device.antenna_configuration(2).and_then(|c| c.transmit_power), Some(10));
    }
}
