use std::sync::Arc;

use crate::codec;
use crate::protocol::{MbapHeader, Request, Response, UnitId};
use crate::utils::format::{bytes_to_hex, registers_to_hex};

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

/// Logging mode for request/response display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Show the unit id and PDU bytes only
    Raw,
    /// Show decoded fields
    Interpreted,
    /// Show both, raw at debug level
    Both,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that hands rendered request/response lines to a callback
///
/// Used by front ends that show a transaction log (the CLI's console, a UI log
/// view fed by the worker).
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
    mode: LoggingMode,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode: LoggingMode::Interpreted,
        }
    }

    /// Create a new callback logger with specific mode
    pub fn with_mode(callback: Option<LogCallback>, min_level: LogLevel, mode: LoggingMode) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
            mode,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => eprintln!("[{}] {}: {}", timestamp, level.as_str(), message),
                LogLevel::Info | LogLevel::Debug => println!("[{}] {}: {}", timestamp, level.as_str(), message),
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    /// Set logging mode
    pub fn set_mode(&mut self, mode: LoggingMode) {
        self.mode = mode;
    }

    /// Get current logging mode
    pub fn get_mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.should_log(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    /// Log an error message
    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Log an info message
    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Log a debug message
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level as u8 <= self.min_level as u8
    }

    /// Log packet data as a compact hex dump
    pub fn log_packet(&self, level: LogLevel, direction: &str, data: &[u8]) {
        if !self.should_log(level) {
            return;
        }
        let message = format!("{} packet ({} bytes): {}", direction, data.len(), hex::encode(data));
        self.log(level, &message);
    }

    /// Log an outgoing request
    pub fn log_request(&self, unit_id: UnitId, request: &Request) {
        let frame = codec::encode_request(0, unit_id, request);
        self.log_rendered("Request ->", &frame[6..], || Self::interpret_request(unit_id, request));
    }

    /// Log a received response
    pub fn log_response(&self, unit_id: UnitId, response: &Response) {
        let frame = codec::encode_response(&MbapHeader::new(0, unit_id, 0), response);
        self.log_rendered("Response <-", &frame[6..], || Self::interpret_response(unit_id, response));
    }

    fn log_rendered<F: Fn() -> String>(&self, direction: &str, raw: &[u8], interpret: F) {
        match self.mode {
            LoggingMode::Raw => {
                self.info(&format!("Modbus {} Raw: {}", direction, bytes_to_hex(raw)));
            }
            LoggingMode::Interpreted => {
                self.info(&format!("Modbus {} {}", direction, interpret()));
            }
            LoggingMode::Both => {
                self.info(&format!("Modbus {} {}", direction, interpret()));
                self.debug(&format!("Modbus {} Raw: {}", direction, bytes_to_hex(raw)));
            }
        }
    }

    fn interpret_request(unit_id: UnitId, request: &Request) -> String {
        let function = request.function();
        match request {
            Request::ReadHoldingRegisters { address, quantity } => format!(
                "Unit: {}, Function: {}, Address: {}, Quantity: {}",
                unit_id, function, address, quantity
            ),
            Request::WriteSingleRegister { address, value } => format!(
                "Unit: {}, Function: {}, Address: {}, Value: {} (0x{:04X})",
                unit_id, function, address, value, value
            ),
            Request::WriteMultipleRegisters { address, values } => format!(
                "Unit: {}, Function: {}, Address: {}, Values: {:?}",
                unit_id, function, address, &values[..values.len().min(8)]
            ),
        }
    }

    fn interpret_response(unit_id: UnitId, response: &Response) -> String {
        match response {
            Response::ReadHoldingRegisters(values) => format!(
                "Unit: {}, Byte count: {}, Registers: {}",
                unit_id,
                values.len() * 2,
                registers_to_hex(&values[..values.len().min(8)])
            ),
            Response::WriteSingleRegister { address, value } => format!(
                "Unit: {}, Address: {}, Value: {} (0x{:04X})",
                unit_id, address, value, value
            ),
            Response::WriteMultipleRegisters { address, quantity } => format!(
                "Unit: {}, Address: {}, Quantity: {}",
                unit_id, address, quantity
            ),
            Response::Exception { function, code } => format!(
                "Unit: {}, Exception for function 0x{:02X}: {}",
                unit_id, function, code
            ),
        }
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
    ($callback:expr, $level:expr, $mode:expr) => {
        $crate::logging::CallbackLogger::with_mode(Some($callback), $level, $mode)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExceptionCode;
    use std::sync::Mutex;

    fn capture(mode: LoggingMode, level: LogLevel) -> (CallbackLogger, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let callback: LogCallback = Box::new(move |level, message| {
            sink.lock().unwrap().push(format!("{} {}", level.as_str(), message));
        });
        (custom_logger!(callback, level, mode), lines)
    }

    #[test]
    fn test_interpreted_request() {
        let (logger, lines) = capture(LoggingMode::Interpreted, LogLevel::Info);
        logger.log_request(1, &Request::read(0, 10));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Read Holding Registers (0x03)"));
        assert!(lines[0].contains("Quantity: 10"));
    }

    #[test]
    fn test_raw_request() {
        let (logger, lines) = capture(LoggingMode::Raw, LogLevel::Info);
        logger.log_request(1, &Request::write_single(5, 0x1234));

        assert_eq!(
            lines.lock().unwrap()[0],
            "INFO Modbus Request -> Raw: 01 06 00 05 12 34"
        );
    }

    #[test]
    fn test_both_modes_respect_level() {
        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Info);
        logger.log_response(1, &Response::exception(0x03, ExceptionCode::IllegalDataAddress));
        {
            let lines = lines.lock().unwrap();
            assert_eq!(lines.len(), 1);
            assert!(lines[0].contains("0x02 (Illegal Data Address)"));
        }

        let (logger, lines) = capture(LoggingMode::Both, LogLevel::Debug);
        logger.log_response(1, &Response::ReadHoldingRegisters(vec![1, 2]));
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "DEBUG Modbus Response <- Raw: 01 03 04 00 01 00 02");
    }

    #[test]
    fn test_packet_dump_and_disabled() {
        let (logger, lines) = capture(LoggingMode::Raw, LogLevel::Debug);
        logger.log_packet(LogLevel::Debug, "send", &[0x00, 0x01, 0xAB]);
        assert_eq!(lines.lock().unwrap()[0], "DEBUG send packet (3 bytes): 0001ab");

        let disabled = CallbackLogger::default();
        disabled.error("nothing happens");
        assert_eq!(disabled.get_mode(), LoggingMode::Interpreted);
    }
}
