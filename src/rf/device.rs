//! Backend RF device interface
//!
//! The gateway drives the reader through [`RfDevice`]: capability and
//! configuration queries plus tag operations executed during an inventory.
//! Devices are obtained from an injected [`RfDeviceFactory`].

use std::time::Duration;

use thiserror::Error;

/// Errors reported by an RF device
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Parameter error: {0}")]
    Parameter(String),
    #[error("Implementation error: {0}")]
    Implementation(String),
}

/// Capability sets of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityType {
    DeviceCapabilities,
    RegulatoryCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub number_of_antennas: u16,
}

/// Transmit power table entry, power in dBm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitPowerEntry {
    pub index: i16,
    pub transmit_power: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegulatoryCapabilities {
    pub communication_standard: u16,
    pub transmit_power_table: Vec<TransmitPowerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capabilities {
    Device(DeviceCapabilities),
    Regulatory(RegulatoryCapabilities),
}

/// Configuration sets of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationType {
    AntennaProperties,
    AntennaConfiguration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntennaProperties {
    pub id: u16,
    pub connected: bool,
    pub gain: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AntennaConfiguration {
    pub id: u16,
    /// Index into the transmit power table
    pub transmit_power: Option<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Configuration {
    AntennaProperties(AntennaProperties),
    AntennaConfiguration(AntennaConfiguration),
}

/// Tag selection filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub bank: u16,
    pub bit_offset: u16,
    pub bit_length: u16,
    pub mask: Vec<u8>,
    pub data: Vec<u8>,
    pub matching: bool,
}

/// Memory banks of a tag
pub const BANK_RESERVED: u16 = 0;
pub const BANK_EPC: u16 = 1;
pub const BANK_TID: u16 = 2;
pub const BANK_USER: u16 = 3;

/// Operation executed on every tag an inventory finds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOperation {
    /// Read `length` words from `offset` (0 reads the whole bank)
    Read { id: String, bank: u16, offset: u16, length: u16, password: u32 },
    Write { id: String, bank: u16, offset: u16, data: Vec<u8>, password: u32 },
    /// Raw command; `length` is the expected response length in bits
    Custom { id: String, data: Vec<u8>, length: u16, password: u32 },
}

/// Outcome classification of a tag operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    NoResponseFromTag,
    NonSpecificTagError,
    NonSpecificReaderError,
    IncorrectPasswordError,
    MemoryOverrunError,
    MemoryLockedError,
    InsufficientPower,
    OpNotPossibleError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Read { id: String, result: ResultCode, data: Vec<u8> },
    Write { id: String, result: ResultCode, words_written: u16 },
    Custom { id: String, result: ResultCode, data: Vec<u8> },
}

impl OperationResult {
    pub fn result(&self) -> ResultCode {
        match self {
            OperationResult::Read { result, .. }
            | OperationResult::Write { result, .. }
            | OperationResult::Custom { result, .. } => *result,
        }
    }
}

/// A tag seen by an inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagData {
    pub antenna_id: u16,
    pub crc: u16,
    pub pc: u16,
    pub epc: Vec<u8>,
    pub xpc: u32,
    pub rssi: i16,
    pub results: Vec<OperationResult>,
}

/// RF reader device
///
/// Calls are synchronous and may block for the device's latency.
pub trait RfDevice: Send {
    fn open_connection(&mut self, timeout: Duration) -> Result<(), DeviceError>;

    fn close_connection(&mut self) -> Result<(), DeviceError>;

    fn get_capabilities(&mut self, kind: CapabilityType) -> Result<Vec<Capabilities>, DeviceError>;

    fn get_configuration(&mut self, kind: ConfigurationType, antenna_id: u16) -> Result<Vec<Configuration>, DeviceError>;

    fn set_configuration(&mut self, configuration: &[Configuration]) -> Result<(), DeviceError>;

    /// Run an inventory on the given antennas (0 means all), executing
    /// `operations` on every tag that passes all `filters`
    fn execute(
        &mut self,
        antennas: &[u16],
        filters: &[Filter],
        operations: &[TagOperation],
    ) -> Result<Vec<TagData>, DeviceError>;
}

/// Source of RF device instances
///
/// Lookup, retries and backoff belong to the factory.
pub trait RfDeviceFactory: Send + Sync {
    fn create(&self, timeout: Duration) -> Result<Box<dyn RfDevice>, DeviceError>;
}

impl<F> RfDeviceFactory for F
where
    F: Fn(Duration) -> Result<Box<dyn RfDevice>, DeviceError> + Send + Sync,
{
    fn create(&self, timeout: Duration) -> Result<Box<dyn RfDevice>, DeviceError> {
        self(timeout)
    }
}
