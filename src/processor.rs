//! Gateway session
//!
//! [`SlaveProcessor`] shares one module connection between all connected
//! Modbus clients. The first `connect` opens the module and seeds it with the
//! durable field values, the last `disconnect` persists changed values and
//! closes it. In between, register requests are translated into field reads
//! and writes against the live [`ModbusMapping`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::codec::{self, StringDecoding};
use crate::error::{ModbusError, ModbusResult};
use crate::field::{Field, FieldProperties, FieldValues};
use crate::mapping::ModbusMapping;
use crate::module::Module;
use crate::store;

/// Largest address space a mapping can expose
pub const MAX_MAPPING_SIZE: u32 = 0x1_0000;

struct ProcessorState {
    module: Box<dyn Module>,
    connections: usize,
    mapping: Option<Arc<ModbusMapping>>,
    // durable values loaded at the first connect or persisted since
    initial_values: Option<FieldValues>,
}

/// Exclusive access to the live mapping
///
/// Held from before a request touches the mapping until its reply is built.
/// Dropping the lease releases the mapping.
pub struct MappingLease<'a> {
    _guard: MutexGuard<'a, ()>,
    mapping: Arc<ModbusMapping>,
}

impl MappingLease<'_> {
    pub fn mapping(&self) -> &Arc<ModbusMapping> {
        &self.mapping
    }

    /// Continue with the mapping returned by a write
    pub fn replace(&mut self, mapping: Arc<ModbusMapping>) {
        self.mapping = mapping;
    }
}

/// Session manager between the Modbus transport and a module
pub struct SlaveProcessor {
    state: Mutex<ProcessorState>,
    mapping_lock: Mutex<()>,
    default_fields_path: PathBuf,
    state_fields_path: PathBuf,
    open_close_timeout: Duration,
}

impl SlaveProcessor {
    /// Create a session for `module`
    ///
    /// Durable field values are read from `state_fields_path` when it exists
    /// and from `default_fields_path` otherwise; changes are written to
    /// `state_fields_path`.
    pub fn new(
        module: Box<dyn Module>,
        default_fields_path: PathBuf,
        state_fields_path: PathBuf,
        open_close_timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(ProcessorState {
                module,
                connections: 0,
                mapping: None,
                initial_values: None,
            }),
            mapping_lock: Mutex::new(()),
            default_fields_path,
            state_fields_path,
            open_close_timeout,
        }
    }

    fn lock_state(&self) -> ModbusResult<MutexGuard<'_, ProcessorState>> {
        self.state
            .lock()
            .map_err(|_| ModbusError::internal("Session state lock poisoned"))
    }

    /// Number of clients currently connected
    pub fn connection_count(&self) -> ModbusResult<usize> {
        Ok(self.lock_state()?.connections)
    }

    /// Register a client, opening the module for the first one
    pub fn connect(&self) -> ModbusResult<()> {
        let mut state = self.lock_state()?;
        if state.connections == 0 {
            state.module.open(self.open_close_timeout).map_err(|e| {
                error!("Cannot open module: {}", e);
                e
            })?;
            let initialized = self
                .apply_initial_values(&mut state)
                .and_then(|_| Self::create_mapping(&mut state));
            if let Err(e) = initialized {
                error!("Cannot initialize configuration fields: {}", e);
                if let Err(close_err) = state.module.close(self.open_close_timeout) {
                    error!("Cannot close module: {}", close_err);
                }
                return Err(e);
            }
        }
        state.connections += 1;
        debug!("Connected, {} connection(s)", state.connections);
        Ok(())
    }

    fn apply_initial_values(&self, state: &mut ProcessorState) -> ModbusResult<()> {
        if state.initial_values.is_none() {
            let path = if self.state_fields_path.is_file() {
                &self.state_fields_path
            } else {
                &self.default_fields_path
            };
            info!("Reading field values from {}", path.display());
            state.initial_values = Some(store::read(path)?);
        }
        if let Some(values) = &state.initial_values {
            for (field, field_values) in values {
                for (i, value) in field_values.iter().enumerate() {
                    state.module.set_field_value(field, i as u16, value.as_ref())?;
                }
            }
        }
        Ok(())
    }

    /// Unregister a client, persisting and closing for the last one
    ///
    /// The mapping is dropped and the module closed even when persisting
    /// fails; the first error is returned.
    pub fn disconnect(&self) -> ModbusResult<()> {
        let mut state = self.lock_state()?;
        let mut result = Ok(());
        match state.connections {
            0 => return Ok(()),
            1 => {
                if let Err(e) = self.store_durable_values(&mut state) {
                    error!("Cannot store configuration fields: {}", e);
                    result = Err(e);
                }
                state.mapping = None;
                if let Err(e) = state.module.close(self.open_close_timeout) {
                    error!("Cannot close module: {}", e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            _ => {}
        }
        state.connections -= 1;
        debug!("Disconnected, {} connection(s)", state.connections);
        result
    }

    fn store_durable_values(&self, state: &mut ProcessorState) -> ModbusResult<()> {
        let all = state.module.get_field_properties(None, None, None)?;
        let mut values = FieldValues::new();
        let mut props: Option<FieldProperties> = None;
        for field in &all.scanned_fields {
            let current = state.module.get_field_properties(props.as_ref(), None, Some(field))?;
            if current.durable {
                let group_index = values.get(field).map_or(0, Vec::len) as u16;
                let value = state.module.get_field_value(field, group_index)?;
                values.entry(*field).or_insert_with(Vec::new).push(value);
            }
            props = Some(current);
        }
        if state.initial_values.as_ref() != Some(&values) {
            info!("Writing field values to {}", self.state_fields_path.display());
            store::write(&values, &self.state_fields_path)?;
            state.initial_values = Some(values);
        }
        Ok(())
    }

    fn create_mapping(state: &mut ProcessorState) -> ModbusResult<Arc<ModbusMapping>> {
        state.module.expand_fields()?;
        let size = state.module.get_field_properties(None, None, None)?.address;
        if size > MAX_MAPPING_SIZE {
            return Err(ModbusError::invalid_data(format!(
                "Address space of {} exceeds {}",
                size, MAX_MAPPING_SIZE
            )));
        }
        let mapping = Arc::new(ModbusMapping::with_size(size as usize));
        state.mapping = Some(mapping.clone());
        Ok(mapping)
    }

    /// Look up a field in the current layout
    pub fn get_field_properties(
        &self,
        start: Option<&FieldProperties>,
        address: Option<u32>,
        field: Option<&Field>,
    ) -> ModbusResult<FieldProperties> {
        self.lock_state()?.module.get_field_properties(start, address, field)
    }

    /// Acquire the live mapping
    ///
    /// Blocks while another request holds it.
    pub fn acquire_mapping(&self) -> ModbusResult<MappingLease<'_>> {
        let guard = self
            .mapping_lock
            .lock()
            .map_err(|_| ModbusError::internal("Mapping lock poisoned"))?;
        let mapping = self
            .lock_state()?
            .mapping
            .clone()
            .ok_or_else(|| ModbusError::not_connected("No mapping, session is not connected"))?;
        Ok(MappingLease { _guard: guard, mapping })
    }

    /// Live mapping if the session is idle and connected
    pub fn try_mapping(&self) -> Option<Arc<ModbusMapping>> {
        self.state.try_lock().ok().and_then(|state| state.mapping.clone())
    }

    /// Resolve the fields covered by `[address, address + quantity)`
    fn covered_fields(module: &dyn Module, address: u16, quantity: u16) -> ModbusResult<Option<(FieldProperties, Vec<Field>)>> {
        let start = module.get_field_properties(None, Some(address as u32), None)?;
        let start_field = match start.field {
            Some(field) => field,
            None => return Ok(None),
        };
        let fields = if quantity > 1 {
            let end_address = address as u32 + quantity as u32 - 1;
            module.get_field_properties(Some(&start), Some(end_address), None)?.scanned_fields
        } else {
            vec![start_field]
        };
        Ok(Some((start, fields)))
    }

    /// Fill the mapping with the values of the fields covering the range
    pub fn read(&self, function: u8, address: u16, quantity: u16, mapping: &ModbusMapping) -> ModbusResult<()> {
        let mut state = self.lock_state()?;
        debug!("Read 0x{:02X}: address={}, quantity={}", function, address, quantity);
        let (start, fields) = match Self::covered_fields(state.module.as_ref(), address, quantity)? {
            Some(covered) => covered,
            None => {
                debug!("No field at address {}", address);
                return Ok(());
            }
        };

        let mut props = start;
        for field in &fields {
            props = state.module.get_field_properties(Some(&props), None, Some(field))?;
            let value = state.module.get_field_value(field, props.group_index)?;
            if let (Some(value), Some(expected)) = (&value, props.data_type) {
                if value.data_type() != expected {
                    return Err(ModbusError::data_type_mismatch(
                        field.id(),
                        expected.name(),
                        value.data_type().name(),
                    ));
                }
            }
            codec::encode_field(mapping, &props, value.as_ref())?;
        }
        Ok(())
    }

    /// Apply the range of the mapping to the fields covering it
    ///
    /// Returns the mapping to continue with: a new one when a durable field
    /// was written, `mapping` otherwise.
    pub fn write(
        &self,
        function: u8,
        address: u16,
        quantity: u16,
        timestamp: DateTime<Utc>,
        mapping: Arc<ModbusMapping>,
    ) -> ModbusResult<Arc<ModbusMapping>> {
        let mut state = self.lock_state()?;
        debug!(
            "Write 0x{:02X} at {}: address={}, quantity={}",
            function,
            timestamp.to_rfc3339(),
            address,
            quantity
        );
        let (start, fields) = match Self::covered_fields(state.module.as_ref(), address, quantity)? {
            Some(covered) => covered,
            None => {
                debug!("No field at address {}", address);
                return Ok(mapping);
            }
        };

        let mut props = start.clone();
        let mut durable = false;
        for field in &fields {
            props = state.module.get_field_properties(Some(&props), None, Some(field))?;
            let value = codec::decode_field(&mapping, &props, StringDecoding::Full)?;
            state.module.set_field_value(field, props.group_index, Some(&value))?;
            durable |= props.durable;
        }

        if durable {
            info!("Configuration changed, recreating mapping");
            return Self::create_mapping(&mut state).map_err(|e| {
                warn!("Keeping the current mapping: {}", e);
                e
            });
        }
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{DataType, FieldValue, Region, ResumeCursor};
    use std::collections::HashMap;

    // Two holding registers: a durable size field at 0 and a plain field at 1,
    // followed by `size` input registers of a sized field.
    #[derive(Default)]
    struct TestModule {
        open: bool,
        opens: usize,
        closes: usize,
        fail_set: bool,
        size: u16,
        version: u64,
        values: HashMap<(u16, u16), FieldValue>,
    }

    impl TestModule {
        fn entries(&self) -> Vec<(u16, u32, u16, Region, DataType, bool)> {
            let mut entries = vec![
                (1, 0, 1, Region::HoldingRegisters, DataType::UShort, true),
                (2, 1, 1, Region::HoldingRegisters, DataType::UShort, false),
            ];
            if self.size > 0 {
                entries.push((3, 2, self.size, Region::InputRegisters, DataType::Short, false));
            }
            entries
        }
    }

    impl Module for TestModule {
        fn open(&mut self, _timeout: Duration) -> ModbusResult<()> {
            self.open = true;
            self.opens += 1;
            Ok(())
        }

        fn close(&mut self, _timeout: Duration) -> ModbusResult<()> {
            self.open = false;
            self.closes += 1;
            Ok(())
        }

        fn expand_fields(&mut self) -> ModbusResult<()> {
            self.size = self.values.get(&(1, 0)).and_then(FieldValue::first_ushort).unwrap_or(0);
            self.version += 1;
            Ok(())
        }

        fn get_field_properties(
            &self,
            start: Option<&FieldProperties>,
            address: Option<u32>,
            field: Option<&Field>,
        ) -> ModbusResult<FieldProperties> {
            let entries = self.entries();
            let from = start.map_or(0, |s| s.cursor.scan_index());
            let total = entries.last().map_or(0, |e| e.1 + e.2 as u32);
            let scanned = |to: usize| entries[from..to].iter().map(|e| Field::new(e.0)).collect();
            for (i, e) in entries.iter().enumerate().skip(from) {
                let hit = field.map_or(false, |f| f.id() == e.0)
                    || address.map_or(false, |a| a >= e.1 && a - e.1 < e.2 as u32);
                if hit {
                    return Ok(FieldProperties {
                        field: Some(Field::new(e.0)),
                        address: e.1,
                        address_quantity: e.2,
                        region: Some(e.3),
                        data_type: Some(e.4),
                        group_index: 0,
                        durable: e.5,
                        scanned_fields: scanned(i + 1),
                        cursor: ResumeCursor::new(self.version, i),
                    });
                }
            }
            Ok(FieldProperties {
                field: None,
                address: total,
                address_quantity: 0,
                region: None,
                data_type: None,
                group_index: 0,
                durable: false,
                scanned_fields: scanned(entries.len()),
                cursor: ResumeCursor::new(self.version, entries.len()),
            })
        }

        fn get_field_value(&mut self, field: &Field, group_index: u16) -> ModbusResult<Option<FieldValue>> {
            if field.id() == 3 {
                return Ok(Some(FieldValue::Short(vec![-1; self.size as usize])));
            }
            Ok(self.values.get(&(field.id(), group_index)).cloned())
        }

        fn set_field_value(&mut self, field: &Field, group_index: u16, value: Option<&FieldValue>) -> ModbusResult<()> {
            if self.fail_set {
                return Err(ModbusError::internal("set failed"));
            }
            if let Some(value) = value {
                self.values.insert((field.id(), group_index), value.clone());
            }
            Ok(())
        }
    }

    fn processor(module: TestModule, dir: &tempfile::TempDir) -> SlaveProcessor {
        std::fs::write(dir.path().join("dflt.properties"), "1=USHORT 2\n").unwrap();
        SlaveProcessor::new(
            Box::new(module),
            dir.path().join("dflt.properties"),
            dir.path().join("fields.properties"),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_connect_seeds_and_sizes_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(TestModule::default(), &dir);
        assert!(processor.acquire_mapping().is_err());

        processor.connect().unwrap();
        let lease = processor.acquire_mapping().unwrap();
        assert_eq!(lease.mapping().size(Region::HoldingRegisters).unwrap(), 4);

        processor.read(0x03, 0, 2, lease.mapping()).unwrap();
        assert_eq!(lease.mapping().read_03(0, 2).unwrap(), vec![2, 0]);
        processor.read(0x04, 2, 2, lease.mapping()).unwrap();
        assert_eq!(lease.mapping().read_04(2, 2).unwrap(), vec![0xFFFF, 0xFFFF]);

        // past the last field
        processor.read(0x03, 4, 1, lease.mapping()).unwrap();
    }

    #[test]
    fn test_write_durable_field_replaces_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(TestModule::default(), &dir);
        processor.connect().unwrap();
        let mut lease = processor.acquire_mapping().unwrap();

        lease.mapping().write_06(1, 9).unwrap();
        let mapping = processor
            .write(0x06, 1, 1, Utc::now(), lease.mapping().clone())
            .unwrap();
        assert!(Arc::ptr_eq(&mapping, lease.mapping()));

        lease.mapping().write_06(0, 3).unwrap();
        let mapping = processor
            .write(0x06, 0, 1, Utc::now(), lease.mapping().clone())
            .unwrap();
        assert!(!Arc::ptr_eq(&mapping, lease.mapping()));
        assert_eq!(mapping.size(Region::InputRegisters).unwrap(), 5);
        lease.replace(mapping);
        drop(lease);

        let lease = processor.acquire_mapping().unwrap();
        assert_eq!(lease.mapping().size(Region::Coils).unwrap(), 5);
    }

    #[test]
    fn test_disconnect_persists_changes_once() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("fields.properties");
        let processor = processor(TestModule::default(), &dir);

        processor.connect().unwrap();
        processor.connect().unwrap();
        processor.disconnect().unwrap();
        assert_eq!(processor.connection_count().unwrap(), 1);
        processor.disconnect().unwrap();
        // unchanged values are not written
        assert!(!state_path.exists());

        processor.connect().unwrap();
        {
            let lease = processor.acquire_mapping().unwrap();
            lease.mapping().write_06(0, 7).unwrap();
            processor.write(0x06, 0, 1, Utc::now(), lease.mapping().clone()).unwrap();
        }
        processor.disconnect().unwrap();
        let stored = store::read(&state_path).unwrap();
        assert_eq!(stored[&Field::new(1)], vec![Some(FieldValue::UShort(vec![7]))]);
        assert!(!stored.contains_key(&Field::new(2)));

        // extra disconnects are ignored
        processor.disconnect().unwrap();
        assert_eq!(processor.connection_count().unwrap(), 0);
    }

    #[test]
    fn test_failed_connect_closes_module() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(TestModule { fail_set: true, ..TestModule::default() }, &dir);
        assert!(processor.connect().is_err());
        assert_eq!(processor.connection_count().unwrap(), 0);
        assert!(matches!(processor.acquire_mapping(), Err(ModbusError::NotConnected { .. })));
    }

    #[test]
    fn test_data_type_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(TestModule::default(), &dir);
        processor.connect().unwrap();
        // field 2 is USHORT, store a SHORT behind its back
        let mut state = processor.lock_state().unwrap();
        state.module.set_field_value(&Field::new(2), 0, Some(&FieldValue::Short(vec![1]))).unwrap();
        drop(state);

        let lease = processor.acquire_mapping().unwrap();
        match processor.read(0x03, 1, 1, lease.mapping()) {
            Err(ModbusError::DataTypeMismatch { field: 2, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_oversized_mapping_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(TestModule::default(), &dir);
        processor.connect().unwrap();
        let lease = processor.acquire_mapping().unwrap();

        // 2 holding registers followed by 0xFFFF input registers
        lease.mapping().write_06(0, 0xFFFF).unwrap();
        let err = processor
            .write(0x06, 0, 1, Utc::now(), lease.mapping().clone())
            .unwrap_err();
        assert_eq!(err.exception_code(), 0x03);
        drop(lease);

        // the session keeps serving the previous mapping
        let lease = processor.acquire_mapping().unwrap();
        assert_eq!(lease.mapping().size(Region::HoldingRegisters).unwrap(), 4);
        drop(lease);
        processor.connect().unwrap();
        assert_eq!(processor.connection_count().unwrap(), 2);
        processor.disconnect().unwrap();
        processor.disconnect().unwrap();
    }
}
