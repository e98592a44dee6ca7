//! RF reader module
//!
//! Binds the reader field registry to an address layout and serves field
//! values through the [`connector::RfConnector`]. Values of the fields that
//! size the layout are cached here.

pub mod connector;
pub mod constants;
pub mod device;
pub mod layout;
pub mod stub;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::DeviceIdentity;
use crate::error::{ModbusError, ModbusResult};
use crate::field::{Field, FieldProperties, FieldValue};
use crate::module::Module;

use connector::RfConnector;
use constants::{RfFieldType, SIZE_FIELDS};
use device::RfDeviceFactory;
use layout::{FieldLayout, LayoutParams};

/// Module exposing an RF reader
pub struct RfModule {
    factory: Arc<dyn RfDeviceFactory>,
    identity: DeviceIdentity,
    connector: Option<RfConnector>,
    layout: FieldLayout,
    // last value pushed for each layout size field
    size_values: HashMap<RfFieldType, FieldValue>,
}

impl RfModule {
    pub fn new(factory: Arc<dyn RfDeviceFactory>, identity: DeviceIdentity) -> Self {
        Self {
            factory,
            identity,
            connector: None,
            layout: FieldLayout::new(),
            size_values: HashMap::new(),
        }
    }

    pub fn layout(&self) -> &FieldLayout {
        &self.layout
    }

    /// Layout sizes from the cached values, missing ones counting as 0
    pub fn layout_params(&self) -> LayoutParams {
        Self::params_of(&self.size_values)
    }

    fn params_of(size_values: &HashMap<RfFieldType, FieldValue>) -> LayoutParams {
        let ushort = |kind: RfFieldType| {
            size_values.get(&kind).and_then(FieldValue::first_ushort).unwrap_or(0)
        };
        LayoutParams {
            tags_in_field: ushort(RfFieldType::TagsInField),
            memory_selector: size_values
                .get(&RfFieldType::MemorySelector)
                .and_then(FieldValue::first_short)
                .unwrap_or(0),
            epc_length: ushort(RfFieldType::EpcLength),
            tid_length: ushort(RfFieldType::TidLength),
            user_length: ushort(RfFieldType::UserLength),
            selection_mask_count: ushort(RfFieldType::SelectionMaskCount),
            selection_mask_max_length: ushort(RfFieldType::SelectionMaskMaxLength),
            custom_command_max_length: ushort(RfFieldType::CustomCommandMaxLength),
        }
    }

    fn connector(&mut self) -> ModbusResult<&mut RfConnector> {
        self.connector
            .as_mut()
            .ok_or_else(|| ModbusError::not_connected("RF module is not open"))
    }
}

impl Module for RfModule {
    fn open(&mut self, timeout: Duration) -> ModbusResult<()> {
        let mut connector = RfConnector::new(self.factory.clone(), self.identity.clone());
        connector.open(timeout)?;
        self.connector = Some(connector);
        Ok(())
    }

    fn close(&mut self, _timeout: Duration) -> ModbusResult<()> {
        match self.connector.take() {
            Some(mut connector) => connector.close(),
            None => Ok(()),
        }
    }

    fn expand_fields(&mut self) -> ModbusResult<()> {
        let params = self.layout_params();
        info!("Expanding fields: {:?}", params);
        self.layout.expand(&params)
    }

    fn get_field_properties(
        &self,
        start: Option<&FieldProperties>,
        address: Option<u32>,
        field: Option<&Field>,
    ) -> ModbusResult<FieldProperties> {
        self.layout.resolve(start, address, field)
    }

    fn get_field_value(&mut self, field: &Field, group_index: u16) -> ModbusResult<Option<FieldValue>> {
        let value = self.connector()?.get_field_value(field, group_index)?;
        if value.is_some() {
            return Ok(value);
        }
        Ok(RfFieldType::from_field(field).and_then(|kind| self.size_values.get(&kind).cloned()))
    }

    fn set_field_value(&mut self, field: &Field, group_index: u16, value: Option<&FieldValue>) -> ModbusResult<()> {
        let size_value = match (RfFieldType::from_field(field), value) {
            (Some(kind), Some(value)) if SIZE_FIELDS.contains(&kind) => Some((kind, value)),
            _ => None,
        };
        // a size the mapping cannot hold is refused before anything changes
        if let Some((kind, value)) = size_value {
            let mut size_values = self.size_values.clone();
            size_values.insert(kind, value.clone());
            if let Err(e) = Self::params_of(&size_values).address_space_size() {
                warn!("Rejecting {} = {:?}: {}", kind, value, e);
                return Err(e);
            }
        }
        self.connector()?.set_field_value(field, group_index, value)?;
        if let Some((kind, value)) = size_value {
            self.size_values.insert(kind, value.clone());
        }
        Ok(())
    }
}
