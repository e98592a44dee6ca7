//! Integration Tests for Voltage Modbus Reader
//!
//! This module contains integration tests that run the gateway
//! components together against the stub RF device.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;
use voltage_modbus_reader::*;

const DEFAULT_FIELDS: &str = "\
0=STRING \"HARTING\"
1=STRING \"Ha-VIS RF-R300\"
2=STRING \"1.0\"
20=USHORT 1
21=SHORT 0
22=USHORT 6
23=USHORT 0
24=USHORT 0
25=USHORT 0
26=USHORT 0
27=USHORT 0
";

/// Gateway session over a stub device, with its files in a scratch directory
struct Gateway {
    dir: TempDir,
    device: StubRfDevice,
    processor: Arc<SlaveProcessor>,
}

impl Gateway {
    fn new(device: StubRfDevice, fields: &str) -> Self {
        Self::with_identity(device, fields, DeviceIdentity::default())
    }

    fn with_identity(device: StubRfDevice, fields: &str, identity: DeviceIdentity) -> Self {
        utils::logging::init_test_logger();
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(config::DEFAULT_FIELDS_FILE), fields).unwrap();
        let processor = Arc::new(Self::processor(&dir, device.clone(), identity));
        Self { dir, device, processor }
    }

    /// Another session on the same files, as after a restart
    fn restart(&self) -> SlaveProcessor {
        Self::processor(&self.dir, self.device.clone(), DeviceIdentity::default())
    }

    fn processor(dir: &TempDir, device: StubRfDevice, identity: DeviceIdentity) -> SlaveProcessor {
        let factory = move |_timeout: Duration| -> Result<Box<dyn RfDevice>, DeviceError> {
            Ok(Box::new(device.clone()))
        };
        SlaveProcessor::new(
            Box::new(RfModule::new(Arc::new(factory), identity)),
            dir.path().join(config::DEFAULT_FIELDS_FILE),
            dir.path().join(config::STATE_FIELDS_FILE),
            Duration::from_millis(500),
        )
    }

    fn state_file(&self) -> PathBuf {
        self.dir.path().join(config::STATE_FIELDS_FILE)
    }

    fn props(&self, kind: RfFieldType) -> FieldProperties {
        self.processor.get_field_properties(None, None, Some(&kind.field())).unwrap()
    }
}

fn fields_with(overrides: &[(&str, &str)]) -> String {
    DEFAULT_FIELDS
        .lines()
        .map(|line| {
            overrides
                .iter()
                .find(|(id, _)| line.split('=').next() == Some(*id))
                .map_or_else(|| line.to_string(), |(id, value)| format!("{}={}", id, value))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Test that all clients share one device connection
#[test]
fn test_sessions_share_device_connection() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    let processor = &gateway.processor;

    processor.connect().unwrap();
    processor.connect().unwrap();
    assert_eq!(processor.connection_count().unwrap(), 2);
    assert_eq!(gateway.device.stats().opens, 1);
    assert!(gateway.device.is_connected());

    processor.disconnect().unwrap();
    assert_eq!(gateway.device.stats().closes, 0);
    assert!(processor.acquire_mapping().is_ok());

    processor.disconnect().unwrap();
    assert_eq!(gateway.device.stats().closes, 1);
    assert!(!gateway.device.is_connected());
    assert!(matches!(processor.acquire_mapping(), Err(ModbusError::NotConnected { .. })));

    // unbalanced disconnects are ignored
    processor.disconnect().unwrap();
    assert_eq!(processor.connection_count().unwrap(), 0);
}

/// Test reference counting with clients connecting from several threads
#[test]
fn test_concurrent_connects_open_once() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    let processor = &gateway.processor;

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| processor.connect().unwrap());
        }
    });
    assert_eq!(processor.connection_count().unwrap(), 4);
    assert_eq!(gateway.device.stats().opens, 1);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| processor.disconnect().unwrap());
        }
    });
    assert_eq!(processor.connection_count().unwrap(), 0);
    assert_eq!(gateway.device.stats().closes, 1);
    assert!(!gateway.state_file().exists());
}

/// Test that a refused device connection leaves the session closed
#[test]
fn test_failed_open_keeps_session_closed() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    gateway.device.set_fail_open(true);

    let err = gateway.processor.connect().unwrap_err();
    assert_eq!(err.error_code(), RfErrorCode::NonSpecificReaderError);
    assert_eq!(gateway.processor.connection_count().unwrap(), 0);

    gateway.device.set_fail_open(false);
    gateway.processor.connect().unwrap();
    assert_eq!(gateway.processor.connection_count().unwrap(), 1);
    gateway.processor.disconnect().unwrap();
}

/// Test that an untouched configuration is not written back
#[test]
fn test_unchanged_configuration_is_not_persisted() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    gateway.processor.connect().unwrap();
    gateway.processor.disconnect().unwrap();
    assert!(!gateway.state_file().exists());
}

/// Test that writing a durable field replaces the mapping and invalidates cursors
#[test]
fn test_durable_write_remaps() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    let processor = &gateway.processor;
    processor.connect().unwrap();

    let tags_in_field = gateway.props(RfFieldType::TagsInField);
    let antenna_mask = gateway.props(RfFieldType::AntennaMask);
    assert!(tags_in_field.durable);
    assert!(!antenna_mask.durable);

    let mut lease = processor.acquire_mapping().unwrap();
    let before = lease.mapping().clone();
    // device info, device and runtime config, runtime state and one tag
    assert_eq!(before.size(Region::HoldingRegisters).unwrap(), 421);

    before.write_06(tags_in_field.address as u16, 2).unwrap();
    let after = processor
        .write(0x06, tags_in_field.address as u16, 1, Utc::now(), before.clone())
        .unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.size(Region::HoldingRegisters).unwrap(), 431);
    assert_eq!(after.size(Region::InputRegisters).unwrap(), 431);
    lease.replace(after.clone());

    after.write_06(antenna_mask.address as u16, 1).unwrap();
    let same = processor
        .write(0x06, antenna_mask.address as u16, 1, Utc::now(), after.clone())
        .unwrap();
    assert!(Arc::ptr_eq(&after, &same));
    drop(lease);

    let stale = processor.get_field_properties(Some(&tags_in_field), None, Some(&RfFieldType::MemorySelector.field()));
    assert!(matches!(stale, Err(ModbusError::StaleCursor { .. })));

    processor.disconnect().unwrap();
    let stored = fs::read_to_string(gateway.state_file()).unwrap();
    assert!(stored.contains("20=USHORT 2\n"));
}

/// Test that the runtime configuration survives a restart
#[test]
fn test_runtime_configuration_persists() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);

    let initial = RuntimeConfiguration::read(&gateway.processor).unwrap();
    assert_eq!(
        initial,
        RuntimeConfiguration { tags_in_field: 1, epc_length: 6, ..RuntimeConfiguration::default() }
    );

    let configuration = RuntimeConfiguration {
        tags_in_field: 2,
        memory_selector: 12,
        epc_length: 6,
        tid_length: 2,
        user_length: 0,
        selection_mask_count: 1,
        selection_mask_max_length: 4,
        custom_command_max_length: 0,
    };
    configuration.write(&gateway.processor).unwrap();
    assert_eq!(RuntimeConfiguration::read(&gateway.processor).unwrap(), configuration);

    let stored = fs::read_to_string(gateway.state_file()).unwrap();
    assert!(stored.starts_with("#Field values\n"));
    assert!(stored.contains("21=SHORT 12\n"));
    assert!(stored.contains("0=STRING \"HARTING\"\n"));

    let restarted = gateway.restart();
    assert_eq!(RuntimeConfiguration::read(&restarted).unwrap(), configuration);
}

/// Test the device identity view
#[test]
fn test_device_info() {
    let identity = DeviceIdentity {
        serial_number: Some("12345".to_string()),
        hardware_revision: Some("C1".to_string()),
        base_firmware: Some("2.1".to_string()),
    };
    let gateway = Gateway::with_identity(StubRfDevice::new(), DEFAULT_FIELDS, identity);

    let info = DeviceInfo::read(&gateway.processor).unwrap();
    assert_eq!(info.vendor_name, "HARTING");
    assert_eq!(info.product_code, "Ha-VIS RF-R300");
    assert_eq!(info.major_minor_revision, "1.0");
    assert_eq!(info.serial_number, "12345");
    assert_eq!(info.hardware_revision, "C1");
    assert_eq!(info.base_firmware, "2.1");
    assert_eq!(gateway.processor.connection_count().unwrap(), 0);
}

/// Test the per-tag fields enabled by the memory selector
#[test]
fn test_memory_selector_gates_tag_fields() {
    let fields = fields_with(&[("20", "USHORT 2"), ("21", "SHORT 12")]);
    let gateway = Gateway::new(StubRfDevice::new(), &fields);
    gateway.processor.connect().unwrap();

    let all = gateway.processor.get_field_properties(None, None, None).unwrap();
    assert!(all.field.is_none());
    assert_eq!(all.address, 435);
    let gated: Vec<u16> = all
        .scanned_fields
        .iter()
        .map(Field::id)
        .filter(|id| *id == RfFieldType::Crc.id() || *id == RfFieldType::Pc.id())
        .collect();
    assert_eq!(gated, vec![54, 55, 54, 55]);
    assert!(!all.scanned_fields.iter().any(|f| f.id() == RfFieldType::Xpc.id()));

    let pc = gateway.props(RfFieldType::Pc);
    let epc = gateway.processor.get_field_properties(Some(&pc), None, Some(&RfFieldType::Epc.field())).unwrap();
    let next_pc = gateway.processor.get_field_properties(Some(&epc), None, Some(&RfFieldType::Pc.field())).unwrap();
    assert_eq!(pc.group_index, 0);
    assert_eq!(next_pc.group_index, 1);
    assert_eq!(next_pc.address, pc.address + 12);

    gateway.processor.disconnect().unwrap();
}

/// Test that inventory results are ordered by EPC
#[test]
fn test_inventory_sorted_by_epc() {
    let epc = |first: u8| {
        let mut epc = vec![0; 12];
        epc[0] = first;
        StubTag::new(epc)
    };
    let device = StubRfDevice::with_tags(vec![epc(0x80), epc(0x02), epc(0x01)]);
    let gateway = Gateway::new(device, &fields_with(&[("20", "USHORT 3")]));
    let processor = &gateway.processor;
    processor.connect().unwrap();

    let tag_count = gateway.props(RfFieldType::TagCount);
    let lease = processor.acquire_mapping().unwrap();
    let mapping = lease.mapping();
    processor.read(0x04, tag_count.address as u16, 1, mapping).unwrap();
    assert_eq!(mapping.read_04(tag_count.address as u16, 1).unwrap(), vec![3]);

    let mut props = processor.get_field_properties(Some(&tag_count), None, Some(&RfFieldType::Epc.field())).unwrap();
    let mut first_words = Vec::new();
    for _ in 0..3 {
        processor.read(0x03, props.address as u16, props.address_quantity, mapping).unwrap();
        first_words.push(mapping.read_03(props.address as u16, 1).unwrap()[0]);
        let length = processor
            .get_field_properties(Some(&props), None, Some(&RfFieldType::CustomCommandLength.field()))
            .unwrap();
        props = processor.get_field_properties(Some(&length), None, Some(&RfFieldType::Epc.field())).unwrap();
    }
    assert_eq!(first_words, vec![0x0100, 0x0200, 0x8000]);
    assert!(props.field.is_none());

    drop(lease);
    processor.disconnect().unwrap();
}

/// Test that too many tags are reported through the last error
#[test]
fn test_tags_in_field_exceeded() {
    let device = StubRfDevice::with_tags(vec![StubTag::default(), StubTag::new(vec![0x01; 12])]);
    let gateway = Gateway::new(device, DEFAULT_FIELDS);
    let processor = &gateway.processor;
    processor.connect().unwrap();

    let tag_count = gateway.props(RfFieldType::TagCount);
    let last_error = gateway.props(RfFieldType::LastError);
    let lease = processor.acquire_mapping().unwrap();
    let err = processor.read(0x04, tag_count.address as u16, 1, lease.mapping()).unwrap_err();
    assert_eq!(err.error_code(), RfErrorCode::TagsInFieldExceeded);
    assert_eq!(err.exception_code(), 0x04);

    processor.read(0x04, last_error.address as u16, 1, lease.mapping()).unwrap();
    assert_eq!(lease.mapping().read_04(last_error.address as u16, 1).unwrap(), vec![0x0201]);

    drop(lease);
    processor.disconnect().unwrap();
}

/// Test selection mask access against the configured count
#[test]
fn test_selection_mask_bounds() {
    let factory = |_timeout: Duration| -> Result<Box<dyn RfDevice>, DeviceError> {
        Ok(Box::new(StubRfDevice::new()))
    };
    let mut module = RfModule::new(Arc::new(factory), DeviceIdentity::default());
    module.open(Duration::from_millis(100)).unwrap();

    let count = RfFieldType::SelectionMaskCount.field();
    let bank = RfFieldType::SelectionMaskBank.field();
    module.set_field_value(&count, 0, Some(&FieldValue::UShort(vec![3]))).unwrap();
    module.set_field_value(&bank, 2, Some(&FieldValue::UShort(vec![1]))).unwrap();
    assert_eq!(module.get_field_value(&bank, 2).unwrap(), Some(FieldValue::UShort(vec![1])));

    let err = module.get_field_value(&bank, 3).unwrap_err();
    assert!(matches!(err, ModbusError::Module { code: RfErrorCode::NonSpecificReaderError, .. }));
    assert_eq!(
        module.get_field_value(&RfFieldType::LastError.field(), 0).unwrap(),
        Some(FieldValue::UShort(vec![0x0306]))
    );

    module.close(Duration::from_millis(100)).unwrap();
}

/// Test that resizing the selection masks resizes their block in the mapping
#[test]
fn test_selection_mask_count_resizes_mask_block() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    let processor = &gateway.processor;
    processor.connect().unwrap();
    let count = gateway.props(RfFieldType::SelectionMaskCount);

    let mut lease = processor.acquire_mapping().unwrap();
    lease.mapping().write_06(count.address as u16, 2).unwrap();
    let mapping = processor
        .write(0x06, count.address as u16, 1, Utc::now(), lease.mapping().clone())
        .unwrap();
    // bank, length and offset per mask, the mask data has no room
    assert_eq!(mapping.size(Region::HoldingRegisters).unwrap(), 427);
    lease.replace(mapping.clone());

    let first = gateway.props(RfFieldType::SelectionMaskBank);
    let offset = processor
        .get_field_properties(Some(&first), None, Some(&RfFieldType::SelectionMaskOffset.field()))
        .unwrap();
    let second = processor
        .get_field_properties(Some(&offset), None, Some(&RfFieldType::SelectionMaskBank.field()))
        .unwrap();
    assert_eq!((first.address, first.group_index), (411, 0));
    assert_eq!((second.address, second.group_index), (414, 1));

    mapping.write_06(second.address as u16, 3).unwrap();
    let same = processor
        .write(0x06, second.address as u16, 1, Utc::now(), mapping.clone())
        .unwrap();
    assert!(Arc::ptr_eq(&mapping, &same));
    mapping.write_06(second.address as u16, 0).unwrap();
    processor.read(0x03, first.address as u16, 6, &mapping).unwrap();
    assert_eq!(mapping.read_03(first.address as u16, 6).unwrap(), vec![0, 0, 0, 3, 0, 0]);

    mapping.write_06(count.address as u16, 1).unwrap();
    let shrunk = processor
        .write(0x06, count.address as u16, 1, Utc::now(), mapping.clone())
        .unwrap();
    assert_eq!(shrunk.size(Region::HoldingRegisters).unwrap(), 424);
    let moved = processor.get_field_properties(None, Some(second.address), None).unwrap();
    assert_eq!(moved.field.map(|f| f.id()), Some(RfFieldType::LockOperation.id()));
    lease.replace(shrunk);

    drop(lease);
    processor.disconnect().unwrap();
    let stored = fs::read_to_string(gateway.state_file()).unwrap();
    assert!(stored.contains("25=USHORT 1\n"));
}

/// Test that a configuration too large for the address space is refused
#[test]
fn test_oversized_configuration_is_refused() {
    let gateway = Gateway::new(StubRfDevice::new(), &fields_with(&[("20", "USHORT 0")]));
    let processor = &gateway.processor;
    processor.connect().unwrap();
    let epc_length = gateway.props(RfFieldType::EpcLength);
    let tags_in_field = gateway.props(RfFieldType::TagsInField);

    let mut lease = processor.acquire_mapping().unwrap();
    // no tags, the EPC length takes no room yet
    lease.mapping().write_06(epc_length.address as u16, 0xFFFF).unwrap();
    let mapping = processor
        .write(0x06, epc_length.address as u16, 1, Utc::now(), lease.mapping().clone())
        .unwrap();
    assert_eq!(mapping.size(Region::HoldingRegisters).unwrap(), 411);
    lease.replace(mapping.clone());

    mapping.write_06(tags_in_field.address as u16, 0xFFFF).unwrap();
    let err = processor
        .write(0x06, tags_in_field.address as u16, 1, Utc::now(), mapping.clone())
        .unwrap_err();
    assert_eq!(err.exception_code(), 0x03);
    assert_eq!(err.error_code(), RfErrorCode::NonSpecificReaderError);

    // the session keeps working on the previous layout
    processor.read(0x03, tags_in_field.address as u16, 1, &mapping).unwrap();
    assert_eq!(mapping.read_03(tags_in_field.address as u16, 1).unwrap(), vec![0]);
    drop(lease);
    let lease = processor.acquire_mapping().unwrap();
    assert!(Arc::ptr_eq(lease.mapping(), &mapping));
    drop(lease);

    processor.connect().unwrap();
    assert_eq!(processor.connection_count().unwrap(), 2);
    processor.disconnect().unwrap();
    processor.disconnect().unwrap();
    assert_eq!(gateway.device.stats().closes, 1);

    let stored = fs::read_to_string(gateway.state_file()).unwrap();
    assert!(stored.contains("20=USHORT 0\n"));
    assert!(stored.contains("22=USHORT 65535\n"));
    let restarted = gateway.restart();
    restarted.connect().unwrap();
    restarted.disconnect().unwrap();
}

async fn request(stream: &mut TcpStream, transaction_id: u16, pdu: &[u8]) -> ModbusResponse {
    let mut frame = transaction_id.to_be_bytes().to_vec();
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(0x01);
    frame.extend_from_slice(pdu);
    stream.write_all(&frame).await.unwrap();

    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(u16::from_be_bytes([header[0], header[1]]), transaction_id);
    assert_eq!(header[6], 0x01);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await.unwrap();
    ModbusResponse::parse_pdu(&pdu).unwrap()
}

/// Test a Modbus TCP client reading and writing fields through the gateway
#[tokio::test]
async fn test_tcp_gateway_round_trip() {
    let gateway = Gateway::new(StubRfDevice::new(), DEFAULT_FIELDS);
    gateway.processor.connect().unwrap();
    let address = (gateway.props(RfFieldType::TagsInField).address as u16).to_be_bytes();

    let config = ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        max_connections: 2,
        request_timeout: Duration::from_secs(5),
    };
    let mut server = ModbusTcpServer::with_config(config, gateway.processor.clone()).unwrap();
    server.start().await.unwrap();
    assert!(server.is_running());
    let mut stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();

    let response = request(&mut stream, 1, &[0x03, address[0], address[1], 0x00, 0x01]).await;
    assert_eq!(response.parse_registers().unwrap(), vec![1]);

    let response = request(&mut stream, 2, &[0x06, address[0], address[1], 0x00, 0x02]).await;
    assert!(!response.is_exception());
    assert_eq!(response.data, vec![address[0], address[1], 0x00, 0x02]);

    let response = request(&mut stream, 3, &[0x03, address[0], address[1], 0x00, 0x01]).await;
    assert_eq!(response.parse_registers().unwrap(), vec![2]);

    let response = request(&mut stream, 4, &[0x04, 0xFF, 0xF0, 0x00, 0x01]).await;
    assert_eq!(response.exception, Some(ModbusException::IllegalDataAddress));

    assert_eq!(gateway.device.stats().opens, 1);
    assert_eq!(gateway.processor.connection_count().unwrap(), 2);
    drop(stream);

    for _ in 0..50 {
        if gateway.processor.connection_count().unwrap() == 1 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(gateway.processor.connection_count().unwrap(), 1);

    let stats = server.get_stats();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.successful_requests, 3);
    assert_eq!(stats.failed_requests, 1);

    server.stop().await.unwrap();
    gateway.processor.disconnect().unwrap();
    assert_eq!(gateway.device.stats().closes, 1);
    let stored = fs::read_to_string(gateway.state_file()).unwrap();
    assert!(stored.contains("20=USHORT 2\n"));
}
