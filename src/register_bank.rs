/// Holding register storage for the reference server
///
/// A fixed block of holding registers starting at address 0. Accesses that
/// fall outside the block are answered with the exception a device would
/// return, so the server can pass the result straight back to the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::protocol::{ExceptionCode, ModbusAddress, ModbusValue};

/// Thread-safe holding register bank
///
/// Clones share the same storage.
#[derive(Debug, Clone)]
pub struct ModbusRegisterBank {
    holding_registers: Arc<RwLock<Vec<u16>>>,
    reads: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
}

impl ModbusRegisterBank {
    /// Create a bank of `size` registers, all zero
    pub fn new(size: usize) -> Self {
        Self::with_values(size, &[])
    }

    /// Create a bank of `size` registers, the first ones preloaded from `initial`
    ///
    /// Values beyond `size` are ignored.
    pub fn with_values(size: usize, initial: &[u16]) -> Self {
        let mut registers = vec![0u16; size];
        let preload = initial.len().min(size);
        registers[..preload].copy_from_slice(&initial[..preload]);
        Self {
            holding_registers: Arc::new(RwLock::new(registers)),
            reads: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn range(len: usize, address: ModbusAddress, quantity: usize) -> Result<std::ops::Range<usize>, ExceptionCode> {
        let start = address as usize;
        let end = start + quantity;
        if quantity == 0 || end > len {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }

    /// Read holding registers starting at address (function code 0x03)
    pub fn read_holding_registers(&self, address: ModbusAddress, quantity: u16) -> Result<Vec<ModbusValue>, ExceptionCode> {
        let registers = self
            .holding_registers
            .read()
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        let range = Self::range(registers.len(), address, quantity as usize)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(registers[range].to_vec())
    }

    /// Alias for read_holding_registers using function code naming
    pub fn read_03(&self, address: ModbusAddress, quantity: u16) -> Result<Vec<ModbusValue>, ExceptionCode> {
        self.read_holding_registers(address, quantity)
    }

    /// Write single register (function code 0x06)
    pub fn write_single_register(&self, address: ModbusAddress, value: ModbusValue) -> Result<(), ExceptionCode> {
        self.write_multiple_registers(address, &[value])
    }

    /// Alias for write_single_register using function code naming
    pub fn write_06(&self, address: ModbusAddress, value: ModbusValue) -> Result<(), ExceptionCode> {
        self.write_single_register(address, value)
    }

    /// Write multiple registers (function code 0x10)
    pub fn write_multiple_registers(&self, address: ModbusAddress, values: &[ModbusValue]) -> Result<(), ExceptionCode> {
        let mut registers = self
            .holding_registers
            .write()
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        let range = Self::range(registers.len(), address, values.len())?;
        registers[range].copy_from_slice(values);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Alias for write_multiple_registers using function code naming
    pub fn write_10(&self, address: ModbusAddress, values: &[ModbusValue]) -> Result<(), ExceptionCode> {
        self.write_multiple_registers(address, values)
    }

    /// Number of registers in the bank
    pub fn len(&self) -> usize {
        self.holding_registers.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get register bank statistics
    pub fn get_stats(&self) -> RegisterBankStats {
        RegisterBankStats {
            holding_registers_count: self.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}

/// Register bank statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBankStats {
    pub holding_registers_count: usize,
    pub reads: u64,
    pub writes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_operations() {
        let bank = ModbusRegisterBank::new(100);

        bank.write_06(5, 42).unwrap();
        assert_eq!(bank.read_03(5, 1).unwrap(), vec![42]);

        bank.write_10(90, &[100, 200, 300]).unwrap();
        assert_eq!(bank.read_03(90, 3).unwrap(), vec![100, 200, 300]);

        let stats = bank.get_stats();
        assert_eq!(stats.holding_registers_count, 100);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.writes, 2);
    }

    #[test]
    fn test_preloaded_values() {
        let bank = ModbusRegisterBank::with_values(4, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(bank.len(), 4);
        assert_eq!(bank.read_03(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_range_is_illegal_address() {
        let bank = ModbusRegisterBank::new(100);
        assert_eq!(bank.read_03(99, 2), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(bank.read_03(100, 1), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(bank.write_06(100, 1), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(bank.write_10(98, &[1, 2, 3]), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(bank.read_03(99, 1), Ok(vec![0]));
    }
}
