//! Field model shared by the mapping engine, the session and the field store
//!
//! A [`Field`] is a logical quantity of the reader ("tag count", "user bank").
//! The address-space mapper binds fields to address ranges and reports the
//! binding as [`FieldProperties`]; values travel as [`FieldValue`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModbusError;

/// Modbus data region a field lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl Region {
    /// Bit regions are addressed in bits, register regions in 16-bit words
    pub fn is_bit_region(self) -> bool {
        matches!(self, Region::Coils | Region::DiscreteInputs)
    }

    /// Whether Modbus masters can write the region
    pub fn is_writable(self) -> bool {
        matches!(self, Region::Coils | Region::HoldingRegisters)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::Coils => "coils",
            Region::DiscreteInputs => "discrete inputs",
            Region::HoldingRegisters => "holding registers",
            Region::InputRegisters => "input registers",
        };
        f.write_str(name)
    }
}

/// Element data type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Byte,
    Short,
    UShort,
    Float,
    String,
}

impl DataType {
    /// Type tag used by the field store
    pub fn name(self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Byte => "BYTE",
            DataType::Short => "SHORT",
            DataType::UShort => "USHORT",
            DataType::Float => "FLOAT",
            DataType::String => "STRING",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BOOLEAN" => Ok(DataType::Boolean),
            "BYTE" => Ok(DataType::Byte),
            "SHORT" => Ok(DataType::Short),
            "USHORT" => Ok(DataType::UShort),
            "FLOAT" => Ok(DataType::Float),
            "STRING" => Ok(DataType::String),
            _ => Err(ModbusError::store(format!("Unknown data type: {}", s))),
        }
    }
}

/// Sub-range of a field addressed by a request, in address units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldSpan {
    pub offset: u16,
    /// 0 when the end of the range is unknown
    pub length: u16,
}

/// Logical field identifier
///
/// Equality, ordering and hashing only look at the identifier; the optional
/// span records which part of the field a request addressed.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    id: u16,
    span: Option<FieldSpan>,
}

impl Field {
    pub const fn new(id: u16) -> Self {
        Self { id, span: None }
    }

    pub fn with_span(self, offset: u16, length: u16) -> Self {
        Self {
            id: self.id,
            span: Some(FieldSpan { offset, length }),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn span(&self) -> Option<FieldSpan> {
        self.span
    }

    pub fn offset(&self) -> u16 {
        self.span.map_or(0, |span| span.offset)
    }

    pub fn length(&self) -> u16 {
        self.span.map_or(0, |span| span.length)
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Field {}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            Some(span) => write!(f, "{}[{}+{}]", self.id, span.offset, span.length),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Typed value of a field
///
/// Exactly one element type is carried. "No value" is expressed as
/// `Option<FieldValue>::None` by the APIs that accept or return values.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Boolean(Vec<bool>),
    Byte(Vec<u8>),
    Short(Vec<i16>),
    UShort(Vec<u16>),
    Float(Vec<f32>),
    String(Vec<Option<String>>),
}

impl FieldValue {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldValue::Boolean(_) => DataType::Boolean,
            FieldValue::Byte(_) => DataType::Byte,
            FieldValue::Short(_) => DataType::Short,
            FieldValue::UShort(_) => DataType::UShort,
            FieldValue::Float(_) => DataType::Float,
            FieldValue::String(_) => DataType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldValue::Boolean(v) => v.len(),
            FieldValue::Byte(v) => v.len(),
            FieldValue::Short(v) => v.len(),
            FieldValue::UShort(v) => v.len(),
            FieldValue::Float(v) => v.len(),
            FieldValue::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty value of the given type
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Boolean => FieldValue::Boolean(Vec::new()),
            DataType::Byte => FieldValue::Byte(Vec::new()),
            DataType::Short => FieldValue::Short(Vec::new()),
            DataType::UShort => FieldValue::UShort(Vec::new()),
            DataType::Float => FieldValue::Float(Vec::new()),
            DataType::String => FieldValue::String(Vec::new()),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Byte(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_shorts(&self) -> Option<&[i16]> {
        match self {
            FieldValue::Short(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ushorts(&self) -> Option<&[u16]> {
        match self {
            FieldValue::UShort(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[Option<String>]> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }

    /// First unsigned short, the common shape of count and length fields
    pub fn first_ushort(&self) -> Option<u16> {
        self.as_ushorts().and_then(|v| v.first().copied())
    }

    pub fn first_short(&self) -> Option<i16> {
        self.as_shorts().and_then(|v| v.first().copied())
    }
}

/// Position of a lookup within one address layout
///
/// Returned with every [`FieldProperties`] and passed back to continue a scan
/// from that entry. A cursor is only valid for the layout version it was taken
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeCursor {
    layout_version: u64,
    scan_index: usize,
}

impl ResumeCursor {
    pub(crate) fn new(layout_version: u64, scan_index: usize) -> Self {
        Self { layout_version, scan_index }
    }

    pub fn layout_version(&self) -> u64 {
        self.layout_version
    }

    pub fn scan_index(&self) -> usize {
        self.scan_index
    }
}

/// Result of one address-space lookup
///
/// When nothing matched, `field` is `None` and `address` is the first address
/// past the last entry, i.e. the size of the address space.
#[derive(Debug, Clone)]
pub struct FieldProperties {
    pub field: Option<Field>,
    pub address: u32,
    pub address_quantity: u16,
    pub region: Option<Region>,
    pub data_type: Option<DataType>,
    pub group_index: u16,
    pub durable: bool,
    /// Fields covered from the starting cursor up to and including this one
    pub scanned_fields: Vec<Field>,
    pub cursor: ResumeCursor,
}

impl FieldProperties {
    /// Whether the lookup found no field
    pub fn is_empty(&self) -> bool {
        self.field.is_none()
    }

    /// First address after the field
    pub fn end_address(&self) -> u32 {
        self.address + self.address_quantity as u32
    }
}

/// Field values keyed by field, one optional value per group index
pub type FieldValues = BTreeMap<Field, Vec<Option<FieldValue>>>;
