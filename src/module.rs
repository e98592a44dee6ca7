//! Boundary between the gateway session and a device module

use std::time::Duration;

use crate::error::ModbusResult;
use crate::field::{Field, FieldProperties, FieldValue};

/// Device exposed through the gateway
///
/// A module owns the address layout of its fields and the connection to the
/// device behind them. The session calls it under its own lock, so
/// implementations need not synchronize.
pub trait Module: Send {
    /// Connect to the device
    fn open(&mut self, timeout: Duration) -> ModbusResult<()>;

    /// Disconnect from the device
    fn close(&mut self, timeout: Duration) -> ModbusResult<()>;

    /// Recompute the address layout from the current field values
    ///
    /// Fails without touching the current layout when the values lay out more
    /// than a mapping can hold.
    fn expand_fields(&mut self) -> ModbusResult<()>;

    /// Look up a field by address or identifier
    ///
    /// `start` is a result of an earlier lookup in the same layout; scanning
    /// continues from its entry. With neither `address` nor `field` matching,
    /// the result is empty and its address is the address space size.
    fn get_field_properties(
        &self,
        start: Option<&FieldProperties>,
        address: Option<u32>,
        field: Option<&Field>,
    ) -> ModbusResult<FieldProperties>;

    /// Read the value of one occurrence of a field
    fn get_field_value(&mut self, field: &Field, group_index: u16) -> ModbusResult<Option<FieldValue>>;

    /// Write the value of one occurrence of a field; `None` writes nothing
    fn set_field_value(&mut self, field: &Field, group_index: u16, value: Option<&FieldValue>) -> ModbusResult<()>;
}
