/// Modbus protocol definitions and data structures
///
/// Function codes, exception codes, the MBAP header and the request/response
/// PDUs for holding register access.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ClientResult, CodecError};
use crate::utils::validation;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier carried in the MBAP header
pub type UnitId = u8;

/// MBAP header size including the unit identifier
pub const MBAP_HEADER_LEN: usize = 7;

/// Protocol identifier, always 0 for Modbus
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Convert from u8 to FunctionCode
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(CodecError::unsupported_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable function name
    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// Modbus exception codes
///
/// Codes outside the standard set are preserved in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledge,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    Unknown(u8),
}

impl ExceptionCode {
    /// Convert from u8 to ExceptionCode
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::ServerDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::ServerDeviceBusy,
            0x07 => ExceptionCode::NegativeAcknowledge,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetDeviceFailedToRespond,
            other => ExceptionCode::Unknown(other),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::ServerDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::ServerDeviceBusy => 0x06,
            ExceptionCode::NegativeAcknowledge => 0x07,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetDeviceFailedToRespond => 0x0B,
            ExceptionCode::Unknown(code) => code,
        }
    }

    /// Standard name of the exception
    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::ServerDeviceFailure => "Slave Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::ServerDeviceBusy => "Slave Device Busy",
            ExceptionCode::NegativeAcknowledge => "Negative Acknowledge",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetDeviceFailedToRespond => {
                "Gateway Target Device Failed to Respond"
            }
            ExceptionCode::Unknown(_) => "Unknown Exception",
        }
    }

    /// Acknowledge and busy mean the device may accept the request later
    pub fn is_transient(self) -> bool {
        matches!(self, ExceptionCode::Acknowledge | ExceptionCode::ServerDeviceBusy)
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.to_u8(), self.description())
    }
}

/// Modbus Application Protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: UnitId,
}

impl MbapHeader {
    /// Header for a frame carrying a PDU of `pdu_len` bytes
    pub fn new(transaction_id: u16, unit_id: UnitId, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }
}

/// Request PDU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    ReadHoldingRegisters {
        address: ModbusAddress,
        quantity: u16,
    },
    WriteSingleRegister {
        address: ModbusAddress,
        value: ModbusValue,
    },
    WriteMultipleRegisters {
        address: ModbusAddress,
        values: Vec<ModbusValue>,
    },
}

impl Request {
    pub fn read(address: ModbusAddress, quantity: u16) -> Self {
        Request::ReadHoldingRegisters { address, quantity }
    }

    pub fn write_single(address: ModbusAddress, value: ModbusValue) -> Self {
        Request::WriteSingleRegister { address, value }
    }

    pub fn write_multiple(address: ModbusAddress, values: Vec<ModbusValue>) -> Self {
        Request::WriteMultipleRegisters { address, values }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> ModbusAddress {
        match self {
            Request::ReadHoldingRegisters { address, .. }
            | Request::WriteSingleRegister { address, .. }
            | Request::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of registers addressed by the request
    pub fn quantity(&self) -> u16 {
        match self {
            Request::ReadHoldingRegisters { quantity, .. } => *quantity,
            Request::WriteSingleRegister { .. } => 1,
            Request::WriteMultipleRegisters { values, .. } => values.len() as u16,
        }
    }

    /// Validate quantity limits and the address range
    pub fn validate(&self) -> ClientResult<()> {
        match self {
            Request::ReadHoldingRegisters { address, quantity } => {
                validation::validate_read_range(*address, *quantity)
            }
            Request::WriteSingleRegister { .. } => Ok(()),
            Request::WriteMultipleRegisters { address, values } => {
                validation::validate_write_values(*address, values)
            }
        }
    }
}

/// Response PDU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Register values in address order
    ReadHoldingRegisters(Vec<ModbusValue>),
    /// Echoed address and value
    WriteSingleRegister {
        address: ModbusAddress,
        value: ModbusValue,
    },
    /// Echoed address and quantity
    WriteMultipleRegisters {
        address: ModbusAddress,
        quantity: u16,
    },
    /// Exception reply; `function` is the request's function code without the high bit
    Exception { function: u8, code: ExceptionCode },
}

impl Response {
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Response::Exception { function: function & !EXCEPTION_FLAG, code }
    }

    /// Function code as it appears on the wire
    pub fn function_byte(&self) -> u8 {
        match self {
            Response::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters.to_u8(),
            Response::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.to_u8(),
            Response::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters.to_u8(),
            Response::Exception { function, .. } => function | EXCEPTION_FLAG,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Response::Exception { .. })
    }

    /// Register values of a read response
    pub fn into_registers(self) -> Option<Vec<ModbusValue>> {
        match self {
            Response::ReadHoldingRegisters(values) => Some(values),
            _ => None,
        }
    }
}

/// Data conversion utilities
pub mod data_utils {
    use bytes::{Buf, BufMut};

    /// Append register values as big-endian bytes
    pub fn put_registers<B: BufMut>(buf: &mut B, registers: &[u16]) {
        for &register in registers {
            buf.put_u16(register);
        }
    }

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        put_registers(&mut bytes, registers);
        bytes
    }

    /// Read big-endian register pairs until the buffer is exhausted
    ///
    /// A trailing odd byte is ignored; callers check the byte count first.
    pub fn take_registers<B: Buf>(buf: &mut B) -> Vec<u16> {
        let mut registers = Vec::with_capacity(buf.remaining() / 2);
        while buf.remaining() >= 2 {
            registers.push(buf.get_u16());
        }
        registers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(FunctionCode::from_u8(0x03).unwrap(), FunctionCode::ReadHoldingRegisters);
        assert_eq!(FunctionCode::WriteMultipleRegisters.to_u8(), 0x10);
        assert_eq!(
            FunctionCode::from_u8(0x01),
            Err(CodecError::UnsupportedFunction { code: 0x01 })
        );
    }

    #[test]
    fn test_exception_conversion() {
        for code in [1u8, 2, 3, 4, 5, 6, 7, 8, 10, 11] {
            let exception = ExceptionCode::from_u8(code);
            assert!(!matches!(exception, ExceptionCode::Unknown(_)), "code {}", code);
            assert_eq!(exception.to_u8(), code);
        }
        assert_eq!(ExceptionCode::from_u8(0x09), ExceptionCode::Unknown(0x09));
        assert_eq!(
            ExceptionCode::GatewayPathUnavailable.to_string(),
            "0x0A (Gateway Path Unavailable)"
        );
    }

    #[test]
    fn test_request_validation() {
        assert!(Request::read(0, 125).validate().is_ok());
        assert!(Request::read(0, 126).validate().is_err());
        assert!(Request::read(0, 0).validate().is_err());
        assert!(Request::read(65535, 1).validate().is_ok());
        assert!(Request::read(65535, 2).validate().is_err());

        assert!(Request::write_multiple(0, vec![0; 123]).validate().is_ok());
        assert!(Request::write_multiple(0, vec![0; 124]).validate().is_err());
        assert!(Request::write_multiple(0, vec![]).validate().is_err());
        assert!(Request::write_single(65535, 1).validate().is_ok());
    }

    #[test]
    fn test_response_helpers() {
        let response = Response::exception(0x83, ExceptionCode::IllegalDataAddress);
        assert_eq!(response.function_byte(), 0x83);
        assert!(response.is_exception());

        let response = Response::ReadHoldingRegisters(vec![1, 2]);
        assert_eq!(response.into_registers(), Some(vec![1, 2]));
    }

    #[test]
    fn test_data_utils() {
        let bytes = data_utils::registers_to_bytes(&[0x1234, 0xFFFF]);
        assert_eq!(bytes, vec![0x12, 0x34, 0xFF, 0xFF]);

        let mut slice: &[u8] = &bytes;
        assert_eq!(data_utils::take_registers(&mut slice), vec![0x1234, 0xFFFF]);
    }
}
