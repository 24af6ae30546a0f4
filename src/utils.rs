/// Utility functions and helpers for register operations
///
/// Argument validation shared by the client and the protocol types,
/// formatting helpers for hex dumps and register tables, and a simple
/// operation timer.

use std::time::{Duration, Instant};
use log::{debug, warn};

use crate::error::{ClientError, ClientResult};

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("✅ Operation '{}' succeeded in {}", self.operation_name, format::format_duration(duration));
        } else {
            warn!("❌ Operation '{}' failed after {}", self.operation_name, format::format_duration(duration));
        }
        duration
    }
}

/// Argument validation, applied before any network I/O
pub mod validation {
    use super::*;
    use crate::{MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

    /// Validate that `count` registers starting at `start` stay within 0..=65535
    pub fn validate_address_range(start: u16, count: u16) -> ClientResult<()> {
        if count == 0 {
            return Err(ClientError::invalid_argument("register count must be at least 1"));
        }
        if start as u32 + count as u32 > 65536 {
            return Err(ClientError::invalid_argument(format!(
                "range {}..{} exceeds the address space (last address 65535)",
                start,
                start as u32 + count as u32
            )));
        }
        Ok(())
    }

    /// Validate a read of `quantity` holding registers (1-125)
    pub fn validate_read_range(start: u16, quantity: u16) -> ClientResult<()> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ClientError::invalid_argument(format!(
                "Invalid register count: {} (must be 1-{})",
                quantity, MAX_READ_REGISTERS
            )));
        }
        validate_address_range(start, quantity)
    }

    /// Validate the values of a multi-register write (1-123)
    pub fn validate_write_values(start: u16, values: &[u16]) -> ClientResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ClientError::invalid_argument(format!(
                "Invalid value count: {} (must be 1-{})",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }
        validate_address_range(start, values.len() as u16)
    }

    /// Narrow caller input to a register value (0-65535)
    pub fn register_value(value: i64) -> ClientResult<u16> {
        u16::try_from(value).map_err(|_| {
            ClientError::invalid_argument(format!(
                "Invalid register value: {} (must be 0-65535)",
                value
            ))
        })
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers.iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Render registers as an address / decimal / hex table
    pub fn format_register_table(start: u16, registers: &[u16]) -> String {
        let mut table = format!("{:<10}{:<15}{:<15}\n", "Address", "Value (dec)", "Value (hex)");
        table.push_str(&"-".repeat(40));
        for (offset, value) in registers.iter().enumerate() {
            let address = start as u32 + offset as u32;
            table.push_str(&format!("\n{:<10}{:<15}0x{:04X}", address, value, value));
        }
        table
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 6).is_ok());
        assert!(validation::validate_address_range(65530, 7).is_err());
        assert!(validation::validate_address_range(0, 0).is_err());

        assert!(validation::validate_read_range(0, 125).is_ok());
        assert!(validation::validate_read_range(0, 126).is_err());
        assert!(validation::validate_write_values(0, &[0; 123]).is_ok());
        assert!(validation::validate_write_values(0, &[0; 124]).is_err());
    }

    #[test]
    fn test_register_value() {
        assert_eq!(validation::register_value(0).unwrap(), 0);
        assert_eq!(validation::register_value(65535).unwrap(), 65535);
        assert!(matches!(
            validation::register_value(65536),
            Err(ClientError::InvalidArgument { .. })
        ));
        assert!(validation::register_value(-1).is_err());
    }

    #[test]
    fn test_formatting() {
        let bytes = vec![0x01, 0x03, 0x10, 0xFF];
        assert_eq!(format::bytes_to_hex(&bytes), "01 03 10 FF");

        let registers = vec![0x1234, 0x5678];
        assert_eq!(format::registers_to_hex(&registers), "1234 5678");

        let duration = Duration::from_millis(1500);
        assert_eq!(format::format_duration(duration), "1.50s");
    }

    #[test]
    fn test_register_table() {
        let table = format::format_register_table(4, &[42, 65535]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Address"));
        assert!(lines[2].starts_with("4 "));
        assert!(lines[2].ends_with("0x002A"));
        assert!(lines[3].contains("65535"));
        assert!(lines[3].ends_with("0xFFFF"));
    }
}
