//! RF reader field registry and error taxonomy
//!
//! The registry is a fixed table: every field of the reader with its region,
//! element type, address quantity and whether it is durable configuration.
//! Fields are grouped in blocks; the selection mask block repeats once per
//! configured selection mask and the tag block once per tag in the field.

use std::fmt;

use crate::field::{DataType, Field, Region};
use crate::rf::device::ResultCode;

/// Fields of the RF reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum RfFieldType {
    // device info
    VendorName = 0,
    ProductCode = 1,
    MajorMinorRevision = 2,
    SerialNumber = 3,
    HardwareRevision = 4,
    BaseFirmware = 5,
    // device config
    CommunicationStandard = 10,
    NumberOfAntennas = 11,
    AntennaOneConnected = 12,
    AntennaTwoConnected = 13,
    AntennaOneTransmitPower = 14,
    AntennaTwoTransmitPower = 15,
    // runtime config
    TagsInField = 20,
    MemorySelector = 21,
    EpcLength = 22,
    TidLength = 23,
    UserLength = 24,
    SelectionMaskCount = 25,
    SelectionMaskMaxLength = 26,
    CustomCommandMaxLength = 27,
    // runtime state
    TagCount = 28,
    LastError = 29,
    AccessPassword = 30,
    AntennaMask = 31,
    // selection mask
    SelectionMaskBank = 40,
    SelectionMaskLength = 41,
    SelectionMaskOffset = 42,
    SelectionMask = 43,
    // tag
    LockOperation = 50,
    KillOperation = 51,
    KillPwd = 52,
    AccessPwd = 53,
    Crc = 54,
    Pc = 55,
    Epc = 56,
    Xpc = 57,
    TidBank = 58,
    UserBank = 59,
    CustomCommandLength = 60,
    CustomCommandData = 61,
}

/// Memory selector bits enabling optional tag fields
pub const MEMORY_SELECTOR_KILL_PWD: i16 = 1;
pub const MEMORY_SELECTOR_ACCESS_PWD: i16 = 2;
pub const MEMORY_SELECTOR_CRC: i16 = 4;
pub const MEMORY_SELECTOR_PC: i16 = 8;
pub const MEMORY_SELECTOR_XPC: i16 = 16;

/// Runtime configuration fields whose values determine the address layout
pub const SIZE_FIELDS: [RfFieldType; 8] = [
    RfFieldType::TagsInField,
    RfFieldType::MemorySelector,
    RfFieldType::EpcLength,
    RfFieldType::TidLength,
    RfFieldType::UserLength,
    RfFieldType::SelectionMaskCount,
    RfFieldType::SelectionMaskMaxLength,
    RfFieldType::CustomCommandMaxLength,
];

/// Address quantity of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Fixed(u16),
    /// Taken from the current value of another field
    SizedBy(RfFieldType),
}

/// How often a block of fields is laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    Once,
    /// `SELECTION_MASK_COUNT` times
    PerSelectionMask,
    /// `TAGS_IN_FIELD` times
    PerTag,
}

/// Registry entry of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub region: Region,
    pub data_type: DataType,
    pub quantity: Quantity,
    pub durable: bool,
    /// Memory selector bit that must be set for the field to be laid out
    pub selector_bit: Option<i16>,
}

const fn fixed(region: Region, data_type: DataType, quantity: u16, durable: bool) -> FieldDescriptor {
    FieldDescriptor { region, data_type, quantity: Quantity::Fixed(quantity), durable, selector_bit: None }
}

const fn sized_by(data_type: DataType, size_field: RfFieldType) -> FieldDescriptor {
    FieldDescriptor {
        region: Region::HoldingRegisters,
        data_type,
        quantity: Quantity::SizedBy(size_field),
        durable: false,
        selector_bit: None,
    }
}

const fn selected(data_type: DataType, quantity: u16, bit: i16) -> FieldDescriptor {
    FieldDescriptor {
        region: Region::HoldingRegisters,
        data_type,
        quantity: Quantity::Fixed(quantity),
        durable: false,
        selector_bit: Some(bit),
    }
}

/// Consecutive fields laid out together
#[derive(Debug, Clone, Copy)]
pub struct FieldBlock {
    pub repeat: Repeat,
    pub fields: &'static [RfFieldType],
}

/// The registry in declaration order
pub const FIELD_BLOCKS: [FieldBlock; 3] = [
    FieldBlock {
        repeat: Repeat::Once,
        fields: &[
            RfFieldType::VendorName,
            RfFieldType::ProductCode,
            RfFieldType::MajorMinorRevision,
            RfFieldType::SerialNumber,
            RfFieldType::HardwareRevision,
            RfFieldType::BaseFirmware,
            RfFieldType::CommunicationStandard,
            RfFieldType::NumberOfAntennas,
            RfFieldType::AntennaOneConnected,
            RfFieldType::AntennaTwoConnected,
            RfFieldType::AntennaOneTransmitPower,
            RfFieldType::AntennaTwoTransmitPower,
            RfFieldType::TagsInField,
            RfFieldType::MemorySelector,
            RfFieldType::EpcLength,
            RfFieldType::TidLength,
            RfFieldType::UserLength,
            RfFieldType::SelectionMaskCount,
            RfFieldType::SelectionMaskMaxLength,
            RfFieldType::CustomCommandMaxLength,
            RfFieldType::TagCount,
            RfFieldType::LastError,
            RfFieldType::AccessPassword,
            RfFieldType::AntennaMask,
        ],
    },
    FieldBlock {
        repeat: Repeat::PerSelectionMask,
        fields: &[
            RfFieldType::SelectionMaskBank,
            RfFieldType::SelectionMaskLength,
            RfFieldType::SelectionMaskOffset,
            RfFieldType::SelectionMask,
        ],
    },
    FieldBlock {
        repeat: Repeat::PerTag,
        fields: &[
            RfFieldType::LockOperation,
            RfFieldType::KillOperation,
            RfFieldType::KillPwd,
            RfFieldType::AccessPwd,
            RfFieldType::Crc,
            RfFieldType::Pc,
            RfFieldType::Epc,
            RfFieldType::Xpc,
            RfFieldType::TidBank,
            RfFieldType::UserBank,
            RfFieldType::CustomCommandLength,
            RfFieldType::CustomCommandData,
        ],
    },
];

impl RfFieldType {
    /// All fields in declaration order
    pub fn all() -> impl Iterator<Item = RfFieldType> {
        FIELD_BLOCKS.iter().flat_map(|block| block.fields.iter().copied())
    }

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn field(self) -> Field {
        Field::new(self.id())
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::all().find(|f| f.id() == id)
    }

    pub fn from_field(field: &Field) -> Option<Self> {
        Self::from_id(field.id())
    }

    /// Registry entry of the field
    pub fn descriptor(self) -> FieldDescriptor {
        use DataType::*;
        use Region::*;
        use RfFieldType::*;

        match self {
            VendorName | ProductCode | MajorMinorRevision => fixed(InputRegisters, String, 128, true),
            SerialNumber => fixed(InputRegisters, Short, 4, false),
            HardwareRevision => fixed(InputRegisters, String, 1, false),
            BaseFirmware => fixed(InputRegisters, String, 3, false),

            CommunicationStandard | NumberOfAntennas => fixed(InputRegisters, UShort, 1, false),
            AntennaOneConnected | AntennaTwoConnected => fixed(HoldingRegisters, UShort, 1, false),
            AntennaOneTransmitPower | AntennaTwoTransmitPower => fixed(HoldingRegisters, Short, 1, false),

            MemorySelector => fixed(HoldingRegisters, Short, 1, true),
            TagsInField | EpcLength | TidLength | UserLength | SelectionMaskCount
            | SelectionMaskMaxLength | CustomCommandMaxLength => fixed(HoldingRegisters, UShort, 1, true),

            TagCount | LastError => fixed(InputRegisters, UShort, 1, false),
            AccessPassword => fixed(HoldingRegisters, Short, 2, false),
            AntennaMask => fixed(HoldingRegisters, Short, 1, false),

            SelectionMaskBank | SelectionMaskLength | SelectionMaskOffset => fixed(HoldingRegisters, UShort, 1, false),
            SelectionMask => sized_by(Byte, SelectionMaskMaxLength),

            LockOperation => fixed(HoldingRegisters, Short, 1, false),
            KillOperation => fixed(HoldingRegisters, Short, 2, false),
            KillPwd => selected(Byte, 2, MEMORY_SELECTOR_KILL_PWD),
            AccessPwd => selected(Byte, 2, MEMORY_SELECTOR_ACCESS_PWD),
            Crc => selected(UShort, 1, MEMORY_SELECTOR_CRC),
            Pc => selected(UShort, 1, MEMORY_SELECTOR_PC),
            Epc => sized_by(Byte, EpcLength),
            Xpc => selected(UShort, 2, MEMORY_SELECTOR_XPC),
            TidBank => sized_by(Byte, TidLength),
            UserBank => sized_by(Byte, UserLength),
            CustomCommandLength => fixed(HoldingRegisters, UShort, 1, false),
            CustomCommandData => sized_by(Byte, CustomCommandMaxLength),
        }
    }
}

impl fmt::Display for RfFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.id())
    }
}

/// Reader error taxonomy reported through `LAST_ERROR`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfErrorCode {
    None,
    TagsInFieldExceeded,
    TagMemoryOverrun,
    TagMemoryLocked,
    InsufficientPower,
    NonSpecificTagError,
    NoResponseFromTag,
    NonSpecificReaderError,
    IncorrectPassword,
    ZeroKillPassword,
}

impl RfErrorCode {
    /// Register value of the code
    pub fn value(self) -> u16 {
        match self {
            RfErrorCode::None => 0x0000,
            RfErrorCode::TagsInFieldExceeded => 0x0201,
            RfErrorCode::TagMemoryOverrun => 0x0301,
            RfErrorCode::TagMemoryLocked => 0x0302,
            RfErrorCode::InsufficientPower => 0x0303,
            RfErrorCode::NonSpecificTagError => 0x0304,
            RfErrorCode::NoResponseFromTag => 0x0305,
            RfErrorCode::NonSpecificReaderError => 0x0306,
            RfErrorCode::IncorrectPassword => 0x0307,
            RfErrorCode::ZeroKillPassword => 0x0308,
        }
    }

    /// Classify a tag operation result
    ///
    /// Results without an entry in the table are non-specific reader errors.
    pub fn from_result(result: ResultCode) -> Self {
        RESULT_CODES
            .iter()
            .find(|(code, _)| *code == result)
            .map_or(RfErrorCode::NonSpecificReaderError, |(_, error)| *error)
    }
}

impl fmt::Display for RfErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/0x{:04X}", self, self.value())
    }
}

const RESULT_CODES: [(ResultCode, RfErrorCode); 8] = [
    (ResultCode::Success, RfErrorCode::None),
    (ResultCode::IncorrectPasswordError, RfErrorCode::IncorrectPassword),
    (ResultCode::InsufficientPower, RfErrorCode::InsufficientPower),
    (ResultCode::MemoryLockedError, RfErrorCode::TagMemoryLocked),
    (ResultCode::MemoryOverrunError, RfErrorCode::TagMemoryOverrun),
    (ResultCode::NonSpecificReaderError, RfErrorCode::NonSpecificReaderError),
    (ResultCode::NonSpecificTagError, RfErrorCode::NonSpecificTagError),
    (ResultCode::NoResponseFromTag, RfErrorCode::NoResponseFromTag),
];
