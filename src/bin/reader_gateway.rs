/// Voltage Modbus Reader Gateway
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Serves the RF reader fields to Modbus TCP masters until interrupted

use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;

use voltage_modbus_reader::{
    DeviceError, GatewayConfig, ModbusServer, ModbusTcpServer, RfDevice, RfModule, SlaveProcessor,
    StubRfDevice,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 {}", voltage_modbus_reader::info());

    let config = match env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(path)?,
        None => {
            info!("No configuration file given, using defaults");
            GatewayConfig::default()
        }
    };
    config.validate()?;

    // The stub stands in for the reader until a hardware factory is wired in
    let factory = |_timeout: Duration| -> Result<Box<dyn RfDevice>, DeviceError> {
        Ok(Box::new(StubRfDevice::new()))
    };
    let module = RfModule::new(Arc::new(factory), config.device.clone());
    let processor = SlaveProcessor::new(
        Box::new(module),
        config.default_fields_path(),
        config.state_fields_path(),
        config.open_close_timeout(),
    );

    let mut server = ModbusTcpServer::with_config((&config).into(), Arc::new(processor))?;
    server.start().await?;
    info!("✅ Gateway listening on {}", config.bind_address);

    match signal::ctrl_c().await {
        Ok(()) => info!("🛑 Received interrupt signal, stopping gateway..."),
        Err(err) => error!("❌ Failed to listen for interrupt signal: {}", err),
    }

    server.stop().await?;

    let stats = server.get_stats();
    info!("📊 Final gateway statistics:");
    info!("   Total connections: {}", stats.connections_count);
    info!("   Rejected connections: {}", stats.rejected_connections);
    info!("   Bytes received: {} bytes", stats.bytes_received);
    info!("   Bytes sent: {} bytes", stats.bytes_sent);
    info!("   Uptime: {} seconds", stats.uptime_seconds);
    info!("   Requests: {}", stats.request_metrics);

    Ok(())
}
