/// Register client API
///
/// Validated read/write operations on holding registers over a
/// [`TransactionEngine`], plus write-then-read-back verification.
///
/// Every argument check happens before a single byte is written: an
/// out-of-range quantity or an address range running past 65535 is an
/// `InvalidArgument` error, never a Modbus exception from the device.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::connection::{Connection, TransportStats};
use crate::engine::TransactionEngine;
use crate::error::{ClientError, ClientResult, CodecError, EngineError};
use crate::logging::CallbackLogger;
use crate::protocol::{ModbusAddress, ModbusValue, Request, Response, UnitId};
use crate::utils::{validation, OperationTimer};
use crate::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS, DEFAULT_VERIFY_DELAY_MS};

/// Connection settings for a [`ModbusTcpClient`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host name or IP address of the device
    pub host: String,
    pub port: u16,
    /// Unit id used by the worker and the CLI when none is given per call
    pub unit_id: UnitId,
    /// Connect timeout and per-request timeout
    pub timeout: Duration,
    /// Hex dump every frame through `tracing`
    pub packet_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            unit_id: 1,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            packet_logging: false,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_unit_id(mut self, unit_id: UnitId) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// `host:port` form used in logs and errors
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How a write is checked by reading it back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyPolicy {
    /// Pause between the write and the read-back
    pub delay: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self { delay: Duration::from_millis(DEFAULT_VERIFY_DELAY_MS) }
    }
}

impl VerifyPolicy {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    /// Read back right after the write completes
    pub fn immediate() -> Self {
        Self { delay: Duration::ZERO }
    }
}

/// Result of comparing written values with what was read back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
    /// Read-back equals the written values
    Match { values: Vec<u16> },
    /// Fewer values came back than were written
    Partial { expected: Vec<u16>, observed: Vec<u16> },
    /// Values came back but differ
    Mismatch { expected: Vec<u16>, observed: Vec<u16> },
}

impl VerificationOutcome {
    pub fn compare(expected: &[u16], observed: Vec<u16>) -> Self {
        if observed == expected {
            VerificationOutcome::Match { values: observed }
        } else if observed.len() < expected.len() {
            VerificationOutcome::Partial { expected: expected.to_vec(), observed }
        } else {
            VerificationOutcome::Mismatch { expected: expected.to_vec(), observed }
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, VerificationOutcome::Match { .. })
    }

    /// Turn a non-matching outcome into [`ClientError::VerificationMismatch`]
    pub fn into_result(self, address: ModbusAddress) -> ClientResult<Vec<u16>> {
        match self {
            VerificationOutcome::Match { values } => Ok(values),
            VerificationOutcome::Partial { expected, observed }
            | VerificationOutcome::Mismatch { expected, observed } => {
                Err(ClientError::VerificationMismatch { address, expected, observed })
            }
        }
    }
}

/// Holding register operations
///
/// The function code is in each method's doc; the `read_03` / `write_06` /
/// `write_10` aliases name the operation by it.
#[async_trait]
pub trait RegisterClient: Send + Sync {
    /// Read holding registers (function code 0x03)
    async fn read_holding_registers(
        &self,
        start: ModbusAddress,
        quantity: u16,
        unit_id: UnitId,
    ) -> ClientResult<Vec<ModbusValue>>;

    /// Write single register (function code 0x06)
    async fn write_single_register(
        &self,
        address: ModbusAddress,
        value: ModbusValue,
        unit_id: UnitId,
    ) -> ClientResult<()>;

    /// Write multiple registers (function code 0x10)
    async fn write_multiple_registers(
        &self,
        address: ModbusAddress,
        values: &[ModbusValue],
        unit_id: UnitId,
    ) -> ClientResult<()>;

    /// Check if client is connected
    fn is_connected(&self) -> bool;

    /// Close the client connection
    async fn close(&self);

    /// Get transport statistics
    async fn get_stats(&self) -> TransportStats;

    /// Write `values` at `address`, then read the same range back and compare
    ///
    /// One value is written with 0x06, more with 0x10. A comparison failure is
    /// reported in the outcome, not as an error.
    async fn write_and_verify(
        &self,
        address: ModbusAddress,
        values: &[ModbusValue],
        unit_id: UnitId,
        policy: &VerifyPolicy,
    ) -> ClientResult<VerificationOutcome> {
        validation::validate_write_values(address, values)?;

        if let [value] = values {
            self.write_single_register(address, *value, unit_id).await?;
        } else {
            self.write_multiple_registers(address, values, unit_id).await?;
        }

        if !policy.delay.is_zero() {
            tokio::time::sleep(policy.delay).await;
        }

        let observed = self
            .read_holding_registers(address, values.len() as u16, unit_id)
            .await?;
        Ok(VerificationOutcome::compare(values, observed))
    }

    async fn read_03(&self, unit_id: UnitId, address: ModbusAddress, quantity: u16) -> ClientResult<Vec<u16>> {
        self.read_holding_registers(address, quantity, unit_id).await
    }

    async fn write_06(&self, unit_id: UnitId, address: ModbusAddress, value: u16) -> ClientResult<()> {
        self.write_single_register(address, value, unit_id).await
    }

    async fn write_10(&self, unit_id: UnitId, address: ModbusAddress, values: &[u16]) -> ClientResult<()> {
        self.write_multiple_registers(address, values, unit_id).await
    }
}

/// Modbus TCP client over a [`TransactionEngine`]
pub struct ModbusTcpClient<S = TcpStream> {
    engine: TransactionEngine<S>,
    config: ClientConfig,
    logger: Option<CallbackLogger>,
}

impl ModbusTcpClient<TcpStream> {
    /// Connect using `config`
    pub async fn connect(config: ClientConfig) -> ClientResult<Self> {
        let engine = TransactionEngine::connect(&config.host, config.port, config.timeout).await?;
        if config.packet_logging {
            engine.set_packet_logging(true).await;
        }
        info!("Modbus TCP client connected to {}", config.address());
        Ok(Self { engine, config, logger: None })
    }

    /// Connect to a `host:port` address
    pub async fn from_address(address: &str, timeout: Duration) -> ClientResult<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| ClientError::invalid_argument(format!("Invalid address '{}': expected host:port", address)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| ClientError::invalid_argument(format!("Invalid port in '{}': {}", address, e)))?;
        Self::connect(ClientConfig::new(host, port).with_timeout(timeout)).await
    }
}

impl<S> ModbusTcpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Build a client over an established connection
    pub fn from_connection(connection: Connection<S>, config: ClientConfig) -> Self {
        Self {
            engine: TransactionEngine::new(connection),
            config,
            logger: None,
        }
    }

    /// Attach a callback logger for request/response lines
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn engine(&self) -> &TransactionEngine<S> {
        &self.engine
    }

    /// Validate and run one request
    pub async fn execute(&self, request: Request, unit_id: UnitId) -> ClientResult<Response> {
        request.validate()?;

        if let Some(logger) = &self.logger {
            logger.log_request(unit_id, &request);
        }

        let function = request.function();
        let timer = OperationTimer::start(function.name());
        let result = self.engine.request(request, unit_id, self.config.timeout).await;
        let elapsed = timer.stop_and_log(result.is_ok());

        if let Some(logger) = &self.logger {
            match &result {
                Ok(response) => logger.log_response(unit_id, response),
                Err(EngineError::Exception(code)) => {
                    logger.log_response(unit_id, &Response::exception(function.to_u8(), *code))
                }
                Err(e) => logger.error(&format!("{} failed: {}", function, e)),
            }
        }
        debug!("{} unit {} round trip {:?}", function, unit_id, elapsed);

        result.map_err(ClientError::from)
    }
}

fn unexpected_response(response: &Response) -> ClientError {
    ClientError::Engine(EngineError::Protocol(CodecError::malformed(format!(
        "unexpected response {:?}",
        response
    ))))
}

#[async_trait]
impl<S> RegisterClient for ModbusTcpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_holding_registers(
        &self,
        start: ModbusAddress,
        quantity: u16,
        unit_id: UnitId,
    ) -> ClientResult<Vec<ModbusValue>> {
        match self.execute(Request::read(start, quantity), unit_id).await? {
            Response::ReadHoldingRegisters(values) => Ok(values),
            other => Err(unexpected_response(&other)),
        }
    }

    async fn write_single_register(
        &self,
        address: ModbusAddress,
        value: ModbusValue,
        unit_id: UnitId,
    ) -> ClientResult<()> {
        match self.execute(Request::write_single(address, value), unit_id).await? {
            Response::WriteSingleRegister { .. } => Ok(()),
            other => Err(unexpected_response(&other)),
        }
    }

    async fn write_multiple_registers(
        &self,
        address: ModbusAddress,
        values: &[ModbusValue],
        unit_id: UnitId,
    ) -> ClientResult<()> {
        match self.execute(Request::write_multiple(address, values.to_vec()), unit_id).await? {
            Response::WriteMultipleRegisters { .. } => Ok(()),
            other => Err(unexpected_response(&other)),
        }
    }

    fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    async fn close(&self) {
        self.engine.close().await;
    }

    async fn get_stats(&self) -> TransportStats {
        self.engine.stats().await
    }
}
