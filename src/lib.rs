//! # Voltage Modbus Reader - RFID Reader Gateway over Modbus
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! Exposes an RFID reader as a Modbus slave. Reader settings, inventory
//! results and tag memory are laid out as fields in one linear address space;
//! Modbus masters read and write those fields through the standard function
//! codes, and every request is turned into calls on the RF device.
//!
//! ## Features
//!
//! - **📐 Dynamic Layout**: The address space grows and shrinks with the configured tag and memory sizes
//! - **🔄 Shared Sessions**: Reference-counted device sessions for concurrent masters
//! - **💾 Durable Settings**: Configuration fields survive restarts
//! - **🏷️ Tag Operations**: Inventory, read, write, lock and kill through Modbus registers
//! - **🛡️ Memory Safe**: Pure Rust implementation with zero unsafe code
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Region |
//! |------|----------|--------|
//! | 0x01 | Read Coils | Coils |
//! | 0x02 | Read Discrete Inputs | Discrete inputs |
//! | 0x03 | Read Holding Registers | Holding registers |
//! | 0x04 | Read Input Registers | Input registers |
//! | 0x05 | Write Single Coil | Coils |
//! | 0x06 | Write Single Register | Holding registers |
//! | 0x0F | Write Multiple Coils | Coils |
//! | 0x10 | Write Multiple Registers | Holding registers |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use voltage_modbus_reader::{
//!     DeviceError, GatewayConfig, ModbusServer, ModbusTcpServer, RfDevice, RfModule, SlaveProcessor,
//!     StubRfDevice,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let factory = |_timeout: Duration| -> Result<Box<dyn RfDevice>, DeviceError> {
//!         Ok(Box::new(StubRfDevice::new()))
//!     };
//!     let module = RfModule::new(Arc::new(factory), config.device.clone());
//!     let processor = SlaveProcessor::new(
//!         Box::new(module),
//!         config.default_fields_path(),
//!         config.state_fields_path(),
//!         config.open_close_timeout(),
//!     );
//!
//!     let mut server = ModbusTcpServer::with_config((&config).into(), Arc::new(processor))?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Modbus Master  │
//! └─────────────────┘
//!          │ TCP
//! ┌─────────────────┐    ┌─────────────────┐
//! │  Modbus Server  │───►│ Modbus Mapping  │
//! └─────────────────┘    └─────────────────┘
//!          │                       ▲
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Slave Processor │───►│  Field Codec    │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   RF Module     │───►│  Field Layout   │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   RF Device     │
//! └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Field identities, types and properties
pub mod field;

/// Register and bit storage shared by the server and the processor
pub mod mapping;

/// Conversion between field values and the Modbus regions
pub mod codec;

/// Field store file format
pub mod store;

/// Module abstraction implemented by the RF module
pub mod module;

/// RF reader module
pub mod rf;

/// Session management between masters and the module
pub mod processor;

/// Typed views over the gateway fields
pub mod view;

/// Gateway configuration
pub mod config;

/// Modbus TCP server
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod server;

/// Request metrics, device call timing and test logging
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
pub mod utils;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusRequest, ModbusResponse, ModbusFunction, ModbusException};
pub use field::{DataType, Field, FieldProperties, FieldValue, FieldValues, Region, ResumeCursor};
pub use mapping::{ModbusMapping, MappingStats};
pub use module::Module;
pub use rf::RfModule;
pub use rf::constants::{RfErrorCode, RfFieldType};
pub use rf::device::{DeviceError, RfDevice, RfDeviceFactory};
pub use rf::stub::{StubRfDevice, StubTag};
pub use processor::{MappingLease, SlaveProcessor};
pub use view::{DeviceInfo, RuntimeConfiguration};
pub use config::{DeviceIdentity, GatewayConfig};
pub use server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use utils::{DeviceCallTimer, RequestMetrics};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils that can be written in a single request
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers that can be written in a single request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Reader v{} - RFID reader gateway over Modbus TCP by Evan Liu", VERSION)
}
