//! Modbus TCP gateway server
//!
//! Accepts Modbus TCP masters and serves their requests from a shared
//! [`SlaveProcessor`]. Every accepted client holds one session connection for
//! its lifetime. Requests are executed on the blocking pool since the session
//! talks to the RF device synchronously.

use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;
use log::{info, error, debug, warn};

use crate::config::GatewayConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::mapping::MappingStats;
use crate::processor::SlaveProcessor;
use crate::protocol::{data_utils, ModbusFunction, ModbusRequest, ModbusResponse, UnitId};
use crate::utils::RequestMetrics;
use crate::MAX_TCP_FRAME_SIZE;

/// MBAP header size without the unit identifier
const MBAP_HEADER_SIZE: usize = 6;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub rejected_connections: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub request_metrics: RequestMetrics,
    pub mapping_stats: Option<MappingStats>,
}

/// Modbus TCP server configuration
#[derive(Debug, Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    /// Idle time after which a client is dropped
    pub request_timeout: Duration,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_TCP_PORT)),
            max_connections: 1,
            request_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
        }
    }
}

impl From<&GatewayConfig> for ModbusTcpServerConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            bind_address: config.bind_address,
            max_connections: config.max_connections,
            request_timeout: config.request_timeout(),
        }
    }
}

/// MBAP header of a request
#[derive(Debug, Clone, Copy)]
struct MbapHeader {
    transaction_id: u16,
    length: u16,
    unit_id: UnitId,
}

fn update_stats(stats: &Mutex<ServerStats>, f: impl FnOnce(&mut ServerStats)) {
    if let Ok(mut stats) = stats.lock() {
        f(&mut stats);
    }
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    processor: Arc<SlaveProcessor>,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    is_running: Arc<AtomicBool>,
    start_time: Option<Instant>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    pub fn with_config(config: ModbusTcpServerConfig, processor: Arc<SlaveProcessor>) -> ModbusResult<Self> {
        if config.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }
        Ok(Self {
            config,
            processor,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            is_running: Arc::new(AtomicBool::new(false)),
            start_time: None,
            local_addr: None,
        })
    }

    /// Address the server listens on once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn processor(&self) -> Arc<SlaveProcessor> {
        self.processor.clone()
    }

    /// Read one request frame; `None` when the client closed the connection
    async fn read_frame(stream: &mut TcpStream) -> ModbusResult<Option<(MbapHeader, Vec<u8>)>> {
        let mut header = [0u8; MBAP_HEADER_SIZE + 1];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]);
        if protocol_id != 0 {
            return Err(ModbusError::frame(format!("Invalid protocol ID: {}", protocol_id)));
        }
        if length < 2 || MBAP_HEADER_SIZE + length as usize > MAX_TCP_FRAME_SIZE {
            return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
        }

        let mut pdu = vec![0u8; length as usize - 1];
        stream.read_exact(&mut pdu).await?;
        let header = MbapHeader {
            transaction_id: u16::from_be_bytes([header[0], header[1]]),
            length,
            unit_id: header[6],
        };
        Ok(Some((header, pdu)))
    }

    fn encode_frame(header: &MbapHeader, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + pdu.len());
        frame.extend_from_slice(&header.transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
        frame.push(header.unit_id);
        frame.extend_from_slice(pdu);
        frame
    }

    /// Serve a decoded request from the live mapping
    fn execute(processor: &SlaveProcessor, request: &ModbusRequest) -> ModbusResult<Vec<u8>> {
        let mut lease = processor.acquire_mapping()?;
        let function = request.function;
        let code = function.to_u8();
        let address = request.address;
        let quantity = request.quantity;

        let data = match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                processor.read(code, address, quantity, lease.mapping())?;
                let bits = lease.mapping().read_bits(function.region(), address, quantity)?;
                let packed = data_utils::pack_bits(&bits);
                let mut data = vec![packed.len() as u8];
                data.extend_from_slice(&packed);
                data
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                processor.read(code, address, quantity, lease.mapping())?;
                let registers = lease.mapping().read_registers(function.region(), address, quantity)?;
                let bytes = data_utils::registers_to_bytes(&registers);
                let mut data = vec![bytes.len() as u8];
                data.extend_from_slice(&bytes);
                data
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils => {
                let bits = data_utils::unpack_bits(&request.data, quantity as usize);
                lease.mapping().write_bits(function.region(), address, &bits)?;
                let mapping = processor.write(code, address, quantity, Utc::now(), lease.mapping().clone())?;
                lease.replace(mapping);
                let mut data = address.to_be_bytes().to_vec();
                if function == ModbusFunction::WriteSingleCoil {
                    let value: u16 = if bits.first().copied().unwrap_or(false) { 0xFF00 } else { 0x0000 };
                    data.extend_from_slice(&value.to_be_bytes());
                } else {
                    data.extend_from_slice(&quantity.to_be_bytes());
                }
                data
            }
            ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
                let registers = data_utils::bytes_to_registers(&request.data)?;
                lease.mapping().write_registers(function.region(), address, &registers)?;
                let mapping = processor.write(code, address, quantity, Utc::now(), lease.mapping().clone())?;
                lease.replace(mapping);
                let mut data = address.to_be_bytes().to_vec();
                if function == ModbusFunction::WriteSingleRegister {
                    data.extend_from_slice(&request.data);
                } else {
                    data.extend_from_slice(&quantity.to_be_bytes());
                }
                data
            }
        };
        Ok(ModbusResponse::new_success(function, data).to_pdu())
    }

    /// Process one request PDU into a response PDU
    async fn process_request(
        unit_id: UnitId,
        pdu: Vec<u8>,
        processor: &Arc<SlaveProcessor>,
        session: &Result<(), ModbusError>,
    ) -> Result<Vec<u8>, (u8, ModbusError)> {
        let function_code = pdu.first().copied().unwrap_or(0);
        let request = ModbusRequest::parse_pdu(unit_id, &pdu).map_err(|e| (function_code, e))?;
        debug!(
            "Processing request: Function={}, Unit={}, Address={}, Quantity={}",
            request.function, unit_id, request.address, request.quantity
        );
        if let Err(e) = session {
            debug!("Session is not connected ({}), replying with failure", e);
            return Err((function_code, ModbusError::exception(function_code, 0x04)));
        }

        let processor = processor.clone();
        tokio::task::spawn_blocking(move || Self::execute(&processor, &request))
            .await
            .map_err(|e| (function_code, ModbusError::internal(format!("Request task failed: {}", e))))?
            .map_err(|e| (function_code, e))
    }

    /// Run a session call on the blocking pool
    async fn run_session<F>(processor: &Arc<SlaveProcessor>, f: F) -> ModbusResult<()>
    where
        F: FnOnce(&SlaveProcessor) -> ModbusResult<()> + Send + 'static,
    {
        let processor = processor.clone();
        tokio::task::spawn_blocking(move || f(&processor))
            .await
            .map_err(|e| ModbusError::internal(format!("Session task failed: {}", e)))?
    }

    /// Handle client connection
    async fn handle_client(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        processor: Arc<SlaveProcessor>,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
    ) {
        info!("📡 New client connected: {}", peer_addr);
        update_stats(&stats, |s| s.connections_count += 1);

        let session = Self::run_session(&processor, |p| p.connect()).await;
        if let Err(e) = &session {
            error!("Cannot connect session for {}: {}", peer_addr, e);
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                result = timeout(request_timeout, Self::read_frame(&mut stream)) => {
                    let (header, pdu) = match result {
                        Ok(Ok(Some(frame))) => frame,
                        Ok(Ok(None)) => {
                            debug!("Client {} closed the connection", peer_addr);
                            break;
                        }
                        Ok(Err(e)) => {
                            error!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Read timeout from {}", peer_addr);
                            break;
                        }
                    };
                    update_stats(&stats, |s| {
                        s.total_requests += 1;
                        s.bytes_received += (MBAP_HEADER_SIZE + header.length as usize) as u64;
                    });

                    let started = Instant::now();
                    let response_pdu = match Self::process_request(header.unit_id, pdu, &processor, &session).await {
                        Ok(pdu) => {
                            update_stats(&stats, |s| {
                                s.successful_requests += 1;
                                s.request_metrics.record_success(started.elapsed());
                            });
                            pdu
                        }
                        Err((function_code, e)) => {
                            warn!("Error processing request from {}: {}", peer_addr, e);
                            update_stats(&stats, |s| {
                                s.failed_requests += 1;
                                s.request_metrics.record_failure(started.elapsed());
                            });
                            vec![function_code | 0x80, e.exception_code()]
                        }
                    };

                    let response = Self::encode_frame(&header, &response_pdu);
                    if let Err(e) = stream.write_all(&response).await {
                        error!("Failed to send response to {}: {}", peer_addr, e);
                        break;
                    }
                    update_stats(&stats, |s| s.bytes_sent += response.len() as u64);
                }
            }
        }

        if session.is_ok() {
            if let Err(e) = Self::run_session(&processor, |p| p.disconnect()).await {
                error!("Cannot disconnect session for {}: {}", peer_addr, e);
            }
        }
        info!("🔌 Client {} disconnected", peer_addr);
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(ModbusError::protocol("Server is already running"));
        }

        info!("🚀 Starting Modbus TCP gateway on {}", self.config.bind_address);

        let listener = TcpListener::bind(self.config.bind_address).await
            .map_err(|e| ModbusError::io(format!("Failed to bind to {}: {}", self.config.bind_address, e)))?;
        self.local_addr = Some(listener.local_addr()?);

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.start_time = Some(Instant::now());
        self.is_running.store(true, Ordering::SeqCst);

        info!("✅ Modbus TCP gateway started");
        info!("📊 Server configuration:");
        info!("   - Bind address: {:?}", self.local_addr);
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Request timeout: {:?}", self.config.request_timeout);

        let processor = self.processor.clone();
        let stats = self.stats.clone();
        let request_timeout = self.config.request_timeout;
        let is_running_flag = self.is_running.clone();
        let connections = Arc::new(Semaphore::new(self.config.max_connections));
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let permit = match connections.clone().try_acquire_owned() {
                                    Ok(permit) => permit,
                                    Err(_) => {
                                        warn!("Connection limit reached, rejecting {}", addr);
                                        update_stats(&stats, |s| s.rejected_connections += 1);
                                        continue;
                                    }
                                };
                                debug!("Accepted connection from {}", addr);

                                let processor = processor.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();

                                tokio::spawn(async move {
                                    Self::handle_client(stream, addr, processor, stats, shutdown_rx, request_timeout).await;
                                    drop(permit);
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping server");
                        break;
                    }
                }
            }

            is_running_flag.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.is_running.store(false, Ordering::SeqCst);

        info!("⏹️  Modbus TCP gateway stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats.mapping_stats = self
            .processor
            .try_mapping()
            .and_then(|mapping| mapping.get_stats().ok());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        let header = MbapHeader { transaction_id: 0x1234, length: 6, unit_id: 7 };
        let frame = ModbusTcpServer::encode_frame(&header, &[0x03, 0x02, 0x00, 0x2A]);
        assert_eq!(frame, vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x07, 0x03, 0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_config_from_gateway_config() {
        let gateway = GatewayConfig {
            max_connections: 3,
            request_timeout_ms: 250,
            ..GatewayConfig::default()
        };
        let config = ModbusTcpServerConfig::from(&gateway);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.bind_address.port(), 502);
    }
}
