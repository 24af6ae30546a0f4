//! # Modbus Master - Modbus TCP Holding Register Client
//!
//! An async Modbus TCP master for reading and writing holding registers, built
//! around a transaction engine that frames requests onto a TCP stream,
//! matches responses to outstanding requests and enforces per-request
//! timeouts. A command-line master and a reference test server ship with it.
//!
//! ## Features
//!
//! - **🔌 One Connection, One Transaction**: strict one-in-flight request engine; a concurrent caller gets `Busy`
//! - **⏱️ Request-Scoped Timeouts**: a timed-out request leaves the connection open and its late reply is discarded
//! - **🛡️ Validated Before I/O**: quantity and address-range errors never reach the wire
//! - **✅ Write Verification**: write, wait, read back and compare
//! - **🧵 Worker Front End**: run the client on its own task and receive results over channels
//! - **🧪 Reference Server**: 100 preloaded holding registers for development and tests
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Client Example
//!
//! ```rust,no_run
//! use modbus_master::{ClientConfig, ClientResult, ModbusTcpClient, RegisterClient, VerifyPolicy};
//!
//! #[tokio::main]
//! async fn main() -> ClientResult<()> {
//!     let client = ModbusTcpClient::connect(ClientConfig::new("127.0.0.1", 5020)).await?;
//!
//!     let values = client.read_holding_registers(0, 10, 1).await?;
//!     println!("Read registers: {:?}", values);
//!
//!     let outcome = client.write_and_verify(1, &[4321], 1, &VerifyPolicy::default()).await?;
//!     println!("Verification: {:?}", outcome);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Server Example
//!
//! ```rust,no_run
//! use modbus_master::{ModbusTcpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = ModbusTcpServer::with_config(ServerConfig::default());
//!     let addr = server.start().await?;
//!     println!("Listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  CLI / Worker   │    │   Test Server   │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Register Client │    │  Register Bank  │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐              │
//! │   Transaction   │              │
//! │ Engine/Tracker  │              │
//! └─────────────────┘              │
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │ Connection +    │◄──►│  Frame Codec    │
//! │ Frame Codec     │    │  (Async I/O)    │
//! └─────────────────┘    └─────────────────┘
//! ```

/// Error taxonomy and result aliases
pub mod error;

/// Function codes, exception codes, MBAP header and PDUs
pub mod protocol;

/// MBAP frame encoding and decoding
pub mod codec;

/// Transaction id allocation and response correlation
pub mod tracker;

/// Framed TCP byte stream
pub mod connection;

/// One-in-flight request/response engine
pub mod engine;

/// Register client API
pub mod client;

/// Background task front end for the client
pub mod worker;

/// Reference Modbus TCP server
pub mod server;

/// Holding register storage for the server
pub mod register_bank;

/// Validation, formatting and timing helpers
pub mod utils;

/// Callback logging for requests and responses
pub mod logging;

// Re-export main types for convenience
pub use error::{ClientError, ClientResult, CodecError, EngineError, EngineResult, IoError, TimeoutError};
pub use protocol::{ExceptionCode, FunctionCode, MbapHeader, Request, Response, UnitId};
pub use connection::{Connection, ConnectionState, TransportStats};
pub use engine::TransactionEngine;
pub use client::{ClientConfig, ModbusTcpClient, RegisterClient, VerificationOutcome, VerifyPolicy};
pub use worker::{ClientWorker, WorkerEvent};
pub use server::{ModbusTcpServer, ServerConfig, ServerStats};
pub use register_bank::{ModbusRegisterBank, RegisterBankStats};
pub use utils::OperationTimer;
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// Default connect and request timeout (3 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default pause between a write and its verification read
pub const DEFAULT_VERIFY_DELAY_MS: u64 = 200;

/// Maximum number of registers in a single read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers in a single write multiple request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Largest MBAP length field (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Port of the reference test server
pub const DEFAULT_TEST_PORT: u16 = 5020;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Master v{} - Modbus TCP holding register client", VERSION)
}
