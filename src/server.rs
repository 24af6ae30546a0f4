/// Reference Modbus TCP server
///
/// A small holding-register device used for development and tests. It speaks
/// function codes 0x03, 0x06 and 0x10 and answers everything else with
/// exception 0x01. Addresses outside the register bank get exception 0x02,
/// bad quantities get exception 0x03.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::time::{sleep, timeout};

use crate::codec::{self, RequestDecodeError};
use crate::error::IoError;
use crate::protocol::{Request, Response};
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};
use crate::DEFAULT_TEST_PORT;

/// Register contents the server starts with
pub const DEFAULT_INITIAL_VALUES: [u16; 10] = [0, 1234, 5678, 9999, 42, 65535, 100, 200, 300, 400];

/// Number of holding registers, starting at address 0
pub const DEFAULT_REGISTER_COUNT: usize = 100;

/// Server statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStats {
    pub connections_count: u64,
    pub rejected_connections: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Modbus TCP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on; port 0 picks a free port
    pub bind_address: String,
    pub max_connections: usize,
    /// Idle time after which a silent client is disconnected
    pub request_timeout: Duration,
    pub register_count: usize,
    pub initial_values: Vec<u16>,
    /// Pause before each response, to simulate a slow device
    pub response_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("127.0.0.1:{}", DEFAULT_TEST_PORT),
            max_connections: 16,
            request_timeout: Duration::from_secs(60),
            register_count: DEFAULT_REGISTER_COUNT,
            initial_values: DEFAULT_INITIAL_VALUES.to_vec(),
            response_delay: Duration::ZERO,
        }
    }
}

/// Modbus TCP server implementation
pub struct ModbusTcpServer {
    config: ServerConfig,
    register_bank: ModbusRegisterBank,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    is_running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    start_time: Option<std::time::Instant>,
}

impl ModbusTcpServer {
    /// Create a server with default settings on `bind_address`
    pub fn new(bind_address: &str) -> Self {
        Self::with_config(ServerConfig {
            bind_address: bind_address.to_string(),
            ..ServerConfig::default()
        })
    }

    /// Create a new TCP server with custom configuration
    pub fn with_config(config: ServerConfig) -> Self {
        let register_bank = ModbusRegisterBank::with_values(config.register_count, &config.initial_values);
        Self {
            config,
            register_bank,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx: None,
            is_running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            start_time: None,
        }
    }

    /// Shared handle to the server's registers
    pub fn register_bank(&self) -> ModbusRegisterBank {
        self.register_bank.clone()
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Bind and start accepting clients in the background
    ///
    /// Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, IoError> {
        if self.is_running() {
            if let Some(addr) = self.local_addr {
                return Ok(addr);
            }
        }

        info!("🚀 Starting Modbus TCP server on {}", self.config.bind_address);

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| IoError::bind_failed(&self.config.bind_address, e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| IoError::bind_failed(&self.config.bind_address, e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.start_time = Some(std::time::Instant::now());
        self.local_addr = Some(local_addr);
        self.is_running.store(true, Ordering::SeqCst);

        info!("✅ Modbus TCP server listening on {}", local_addr);
        info!("   - Holding registers: {} from address 0", self.config.register_count);
        info!("   - Max connections: {}", self.config.max_connections);
        info!("   - Request timeout: {:?}", self.config.request_timeout);

        let register_bank = self.register_bank.clone();
        let stats = self.stats.clone();
        let request_timeout = self.config.request_timeout;
        let response_delay = self.config.response_delay;
        let is_running = self.is_running.clone();
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
                                        stats.lock().await.rejected_connections += 1;
                                        continue;
                                    }
                                };
                                debug!("Accepted connection from {}", addr);

                                let register_bank = register_bank.clone();
                                let stats = stats.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    Self::handle_client(
                                        stream,
                                        addr,
                                        register_bank,
                                        stats,
                                        shutdown_rx,
                                        request_timeout,
                                        response_delay,
                                    )
                                    .await;
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
            is_running.store(false, Ordering::SeqCst);
        });

        Ok(local_addr)
    }

    /// Stop accepting clients and disconnect the connected ones
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.is_running.store(false, Ordering::SeqCst);
        info!("⏹️  Modbus TCP server stopped");
    }

    pub async fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().await.clone();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats.register_bank_stats = Some(self.register_bank.get_stats());
        stats
    }

    /// Handle client connection
    async fn handle_client(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        register_bank: ModbusRegisterBank,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
        response_delay: Duration,
    ) {
        info!("📡 New client connected: {}", peer_addr);
        stats.lock().await.connections_count += 1;

        let mut buffer = BytesMut::with_capacity(1024);

        'session: loop {
            // Serve every complete frame already buffered
            loop {
                let length = match codec::frame_length(&buffer) {
                    None => break,
                    Some(Err(e)) => {
                        warn!("Unframeable data from {}: {}", peer_addr, e);
                        break 'session;
                    }
                    Some(Ok(length)) if buffer.len() >= length => length,
                    Some(Ok(_)) => break,
                };
                let frame = buffer.split_to(length);

                let Some(response) = Self::process_frame(&frame, &register_bank, &stats).await else {
                    continue;
                };
                if !response_delay.is_zero() {
                    sleep(response_delay).await;
                }
                if let Err(e) = stream.write_all(&response).await {
                    error!("Failed to send response to {}: {}", peer_addr, e);
                    break 'session;
                }
                stats.lock().await.bytes_sent += response.len() as u64;
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }
                result = timeout(request_timeout, stream.read_buf(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(bytes_read)) => {
                            stats.lock().await.bytes_received += bytes_read as u64;
                        }
                        Ok(Err(e)) => {
                            error!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Read timeout from {}", peer_addr);
                            break;
                        }
                    }
                }
            }
        }

        info!("🔌 Client {} disconnected", peer_addr);
    }

    /// Decode one request frame and build the response frame
    ///
    /// `None` means the frame was unusable and gets no answer.
    async fn process_frame(
        frame: &[u8],
        register_bank: &ModbusRegisterBank,
        stats: &Arc<Mutex<ServerStats>>,
    ) -> Option<Bytes> {
        let (header, response) = match codec::decode_request(frame) {
            Ok((header, request)) => {
                debug!(
                    "Processing request: TID={}, Unit={}, {:?}",
                    header.transaction_id, header.unit_id, request
                );
                (header, Self::execute(&request, register_bank))
            }
            Err(RequestDecodeError::Rejected { header, function, code }) => {
                debug!("Rejecting function 0x{:02X} with {}", function, code);
                (header, Response::exception(function, code))
            }
            Err(RequestDecodeError::Malformed(e)) => {
                warn!("Dropping malformed request: {}", e);
                return None;
            }
        };

        let mut stats = stats.lock().await;
        stats.total_requests += 1;
        if response.is_exception() {
            stats.failed_requests += 1;
        } else {
            stats.successful_requests += 1;
        }
        Some(codec::encode_response(&header, &response))
    }

    fn execute(request: &Request, register_bank: &ModbusRegisterBank) -> Response {
        let result = match request {
            Request::ReadHoldingRegisters { address, quantity } => register_bank
                .read_holding_registers(*address, *quantity)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleRegister { address, value } => register_bank
                .write_single_register(*address, *value)
                .map(|_| Response::WriteSingleRegister { address: *address, value: *value }),
            Request::WriteMultipleRegisters { address, values } => register_bank
                .write_multiple_registers(*address, values)
                .map(|_| Response::WriteMultipleRegisters {
                    address: *address,
                    quantity: values.len() as u16,
                }),
        };
        result.unwrap_or_else(|code| Response::exception(request.function().to_u8(), code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExceptionCode, MbapHeader};

    fn stats() -> Arc<Mutex<ServerStats>> {
        Arc::new(Mutex::new(ServerStats::default()))
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "127.0.0.1:5020");
        assert_eq!(config.register_count, 100);
        assert_eq!(config.initial_values[1], 1234);
    }

    #[tokio::test]
    async fn test_process_read_frame() {
        let bank = ModbusRegisterBank::with_values(100, &DEFAULT_INITIAL_VALUES);
        let stats = stats();
        let request = Request::read(1, 3);
        let frame = codec::encode_request(9, 1, &request);

        let response = ModbusTcpServer::process_frame(&frame, &bank, &stats).await.unwrap();
        let (header, decoded) = codec::decode_response(&response, &request).unwrap();
        assert_eq!(header.transaction_id, 9);
        assert_eq!(decoded, Response::ReadHoldingRegisters(vec![1234, 5678, 9999]));
        assert_eq!(stats.lock().await.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_process_out_of_range_write() {
        let bank = ModbusRegisterBank::new(100);
        let stats = stats();
        let request = Request::write_single(100, 1);
        let frame = codec::encode_request(2, 1, &request);

        let response = ModbusTcpServer::process_frame(&frame, &bank, &stats).await.unwrap();
        let (_, decoded) = codec::decode_response(&response, &request).unwrap();
        assert_eq!(decoded, Response::exception(0x06, ExceptionCode::IllegalDataAddress));
        assert_eq!(stats.lock().await.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_process_unsupported_function() {
        let bank = ModbusRegisterBank::new(100);
        let frame = [0x00, 0x04, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x00, 0x00, 0x01];

        let response = ModbusTcpServer::process_frame(&frame, &bank, &stats()).await.unwrap();
        assert_eq!(
            response,
            codec::encode_response(
                &MbapHeader::new(4, 1, 0),
                &Response::exception(0x04, ExceptionCode::IllegalFunction)
            )
        );
    }

    #[tokio::test]
    async fn test_start_on_ephemeral_port() {
        let mut server = ModbusTcpServer::new("127.0.0.1:0");
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        server.stop().await;
        assert!(!server.is_running());
    }
}
