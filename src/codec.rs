//! # Modbus TCP Frame Codec
//!
//! Pure functions translating between [`Request`]/[`Response`] values and MBAP
//! framed bytes. Nothing here touches a socket.
//!
//! ## Frame Layout
//!
//! ```text
//! +----------------+-------------+---------+---------+----------+---------+
//! | transaction id | protocol id | length  | unit id | function | payload |
//! |     2 bytes    |   2 bytes   | 2 bytes | 1 byte  |  1 byte  |   ...   |
//! +----------------+-------------+---------+---------+----------+---------+
//! ```
//!
//! `length` counts the unit id plus the PDU (function code and payload), so a
//! complete frame is always `6 + length` bytes.
//!
//! Both directions are provided: the master side (`encode_request` /
//! `decode_response`) and the device side (`decode_request` / `encode_response`)
//! used by the reference server.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::{
    data_utils, ExceptionCode, FunctionCode, MbapHeader, Request, Response, UnitId,
    EXCEPTION_FLAG, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID,
};
use crate::{MAX_MBAP_LENGTH, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

/// Bytes preceding the length-counted part of a frame
const LENGTH_PREFIX_LEN: usize = 6;

/// Smallest valid length field: unit id + function code
const MIN_MBAP_LENGTH: usize = 2;

/// Why a request frame could not be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDecodeError {
    /// The frame itself is broken; no response can be addressed
    Malformed(CodecError),
    /// The frame is sound but the request must be answered with an exception
    Rejected {
        header: MbapHeader,
        function: u8,
        code: ExceptionCode,
    },
}

/// Encode a request into a complete MBAP frame
pub fn encode_request(transaction_id: u16, unit_id: UnitId, request: &Request) -> Bytes {
    let mut pdu = BytesMut::with_capacity(6 + 2 * request.quantity() as usize);
    pdu.put_u8(request.function().to_u8());
    match request {
        Request::ReadHoldingRegisters { address, quantity } => {
            pdu.put_u16(*address);
            pdu.put_u16(*quantity);
        }
        Request::WriteSingleRegister { address, value } => {
            pdu.put_u16(*address);
            pdu.put_u16(*value);
        }
        Request::WriteMultipleRegisters { address, values } => {
            pdu.put_u16(*address);
            pdu.put_u16(values.len() as u16);
            pdu.put_u8((values.len() * 2) as u8);
            data_utils::put_registers(&mut pdu, values);
        }
    }
    frame(MbapHeader::new(transaction_id, unit_id, pdu.len()), &pdu)
}

/// Encode a response PDU under the given request header
///
/// Only the transaction and unit ids of `header` are used; the length is recomputed.
pub fn encode_response(header: &MbapHeader, response: &Response) -> Bytes {
    let mut pdu = BytesMut::with_capacity(4 + 2 * MAX_READ_REGISTERS as usize);
    pdu.put_u8(response.function_byte());
    match response {
        Response::ReadHoldingRegisters(values) => {
            pdu.put_u8((values.len() * 2) as u8);
            data_utils::put_registers(&mut pdu, values);
        }
        Response::WriteSingleRegister { address, value } => {
            pdu.put_u16(*address);
            pdu.put_u16(*value);
        }
        Response::WriteMultipleRegisters { address, quantity } => {
            pdu.put_u16(*address);
            pdu.put_u16(*quantity);
        }
        Response::Exception { code, .. } => {
            pdu.put_u8(code.to_u8());
        }
    }
    frame(MbapHeader::new(header.transaction_id, header.unit_id, pdu.len()), &pdu)
}

fn frame(header: MbapHeader, pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    buf.put_u16(header.transaction_id);
    buf.put_u16(header.protocol_id);
    buf.put_u16(header.length);
    buf.put_u8(header.unit_id);
    buf.put_slice(pdu);
    buf.freeze()
}

/// Parse the 7-byte MBAP header at the start of `buf`
pub fn decode_header(buf: &[u8]) -> Result<MbapHeader, CodecError> {
    if buf.len() < MBAP_HEADER_LEN {
        return Err(CodecError::malformed(format!(
            "header needs {} bytes, got {}",
            MBAP_HEADER_LEN,
            buf.len()
        )));
    }
    let mut cursor = &buf[..MBAP_HEADER_LEN];
    Ok(MbapHeader {
        transaction_id: cursor.get_u16(),
        protocol_id: cursor.get_u16(),
        length: cursor.get_u16(),
        unit_id: cursor.get_u8(),
    })
}

/// Total size of the frame starting at `buf`
///
/// `None` until the length field has arrived. A length field outside
/// `2..=254` cannot delimit a frame and is reported as malformed.
pub fn frame_length(buf: &[u8]) -> Option<Result<usize, CodecError>> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return None;
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
        return Some(Err(CodecError::malformed(format!(
            "length field {} outside {}..={}",
            length, MIN_MBAP_LENGTH, MAX_MBAP_LENGTH
        ))));
    }
    Some(Ok(LENGTH_PREFIX_LEN + length))
}

/// Validate the MBAP envelope and split a complete frame into header and PDU
pub fn split_frame(frame: &[u8]) -> Result<(MbapHeader, &[u8]), CodecError> {
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return Err(CodecError::malformed(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let header = decode_header(frame)?;
    if header.protocol_id != MODBUS_PROTOCOL_ID {
        return Err(CodecError::malformed(format!(
            "protocol id {} is not Modbus",
            header.protocol_id
        )));
    }
    if header.length as usize != frame.len() - LENGTH_PREFIX_LEN {
        return Err(CodecError::malformed(format!(
            "length field {} does not match {} bytes present",
            header.length,
            frame.len() - LENGTH_PREFIX_LEN
        )));
    }
    Ok((header, &frame[MBAP_HEADER_LEN..]))
}

/// Decode a response frame against the request it answers
///
/// An exception reply decodes successfully to [`Response::Exception`].
pub fn decode_response(frame: &[u8], request: &Request) -> Result<(MbapHeader, Response), CodecError> {
    let (header, pdu) = split_frame(frame)?;
    let expected = request.function();
    let function_byte = pdu[0];

    if function_byte & EXCEPTION_FLAG != 0 {
        let function = function_byte & !EXCEPTION_FLAG;
        if function != expected.to_u8() {
            return Err(CodecError::malformed(format!(
                "exception for function 0x{:02X} answers a {} request",
                function, expected
            )));
        }
        if pdu.len() != 2 {
            return Err(CodecError::malformed(format!(
                "exception PDU must be 2 bytes, got {}",
                pdu.len()
            )));
        }
        return Ok((header, Response::exception(function, ExceptionCode::from_u8(pdu[1]))));
    }

    let function = FunctionCode::from_u8(function_byte)?;
    if function != expected {
        return Err(CodecError::malformed(format!(
            "response function {} does not match request function {}",
            function, expected
        )));
    }

    let mut payload = &pdu[1..];
    let response = match request {
        Request::ReadHoldingRegisters { quantity, .. } => {
            if payload.is_empty() {
                return Err(CodecError::malformed("read response without byte count"));
            }
            let byte_count = payload.get_u8() as usize;
            let expected_bytes = 2 * *quantity as usize;
            if byte_count != expected_bytes {
                return Err(CodecError::malformed(format!(
                    "byte count {} does not match {} requested registers",
                    byte_count, quantity
                )));
            }
            if payload.len() != byte_count {
                return Err(CodecError::malformed(format!(
                    "byte count {} but {} data bytes present",
                    byte_count,
                    payload.len()
                )));
            }
            Response::ReadHoldingRegisters(data_utils::take_registers(&mut payload))
        }
        Request::WriteSingleRegister { address, value } => {
            let (echoed_address, echoed_value) = take_echo(&mut payload)?;
            check_echo("address", *address, echoed_address)?;
            check_echo("value", *value, echoed_value)?;
            Response::WriteSingleRegister { address: echoed_address, value: echoed_value }
        }
        Request::WriteMultipleRegisters { address, values } => {
            let (echoed_address, echoed_quantity) = take_echo(&mut payload)?;
            check_echo("address", *address, echoed_address)?;
            check_echo("quantity", values.len() as u16, echoed_quantity)?;
            Response::WriteMultipleRegisters { address: echoed_address, quantity: echoed_quantity }
        }
    };
    Ok((header, response))
}

fn take_echo(payload: &mut &[u8]) -> Result<(u16, u16), CodecError> {
    if payload.len() != 4 {
        return Err(CodecError::malformed(format!(
            "write response payload must be 4 bytes, got {}",
            payload.len()
        )));
    }
    Ok((payload.get_u16(), payload.get_u16()))
}

fn check_echo(field: &'static str, expected: u16, actual: u16) -> Result<(), CodecError> {
    if expected != actual {
        return Err(CodecError::echo_mismatch(field, expected, actual));
    }
    Ok(())
}

/// Decode a request frame on the device side
pub fn decode_request(frame: &[u8]) -> Result<(MbapHeader, Request), RequestDecodeError> {
    let (header, pdu) = split_frame(frame).map_err(RequestDecodeError::Malformed)?;
    decode_request_pdu(pdu)
        .map(|request| (header, request))
        .map_err(|code| RequestDecodeError::Rejected { header, function: pdu[0], code })
}

/// Decode a request PDU, yielding the exception a device would answer with on failure
pub fn decode_request_pdu(pdu: &[u8]) -> Result<Request, ExceptionCode> {
    let (&function_byte, mut payload) = pdu.split_first().ok_or(ExceptionCode::IllegalFunction)?;
    let function =
        FunctionCode::from_u8(function_byte).map_err(|_| ExceptionCode::IllegalFunction)?;

    match function {
        FunctionCode::ReadHoldingRegisters => {
            if payload.len() != 4 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let address = payload.get_u16();
            let quantity = payload.get_u16();
            if quantity == 0 || quantity > MAX_READ_REGISTERS {
                return Err(ExceptionCode::IllegalDataValue);
            }
            Ok(Request::ReadHoldingRegisters { address, quantity })
        }
        FunctionCode::WriteSingleRegister => {
            if payload.len() != 4 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            Ok(Request::WriteSingleRegister { address: payload.get_u16(), value: payload.get_u16() })
        }
        FunctionCode::WriteMultipleRegisters => {
            if payload.len() < 5 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            let address = payload.get_u16();
            let quantity = payload.get_u16();
            let byte_count = payload.get_u8() as usize;
            if quantity == 0
                || quantity > MAX_WRITE_REGISTERS
                || byte_count != 2 * quantity as usize
                || payload.len() != byte_count
            {
                return Err(ExceptionCode::IllegalDataValue);
            }
            Ok(Request::WriteMultipleRegisters {
                address,
                values: data_utils::take_registers(&mut payload),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(transaction_id: u16, unit_id: u8) -> MbapHeader {
        MbapHeader::new(transaction_id, unit_id, 0)
    }

    #[test]
    fn test_encode_read_request() {
        let frame = encode_request(1, 1, &Request::read(0, 10));
        assert_eq!(
            frame.as_ref(),
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_encode_write_multiple_request() {
        let frame = encode_request(0x1234, 7, &Request::write_multiple(5, vec![10, 20, 30]));
        assert_eq!(
            frame.as_ref(),
            &[
                0x12, 0x34, 0x00, 0x00, 0x00, 0x0D, 0x07, 0x10, 0x00, 0x05, 0x00, 0x03, 0x06,
                0x00, 0x0A, 0x00, 0x14, 0x00, 0x1E
            ]
        );
    }

    #[test]
    fn test_decode_read_response() {
        let request = Request::read(0, 2);
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x00, 0x00, 0x04, 0xD2];
        let (hdr, response) = decode_response(&frame, &request).unwrap();
        assert_eq!(hdr.transaction_id, 1);
        assert_eq!(hdr.unit_id, 1);
        assert_eq!(response, Response::ReadHoldingRegisters(vec![0, 1234]));
    }

    #[test]
    fn test_decode_exception_response() {
        let request = Request::read(200, 1);
        let frame = [0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let (_, response) = decode_response(&frame, &request).unwrap();
        assert_eq!(
            response,
            Response::Exception { function: 0x03, code: ExceptionCode::IllegalDataAddress }
        );
    }

    #[test]
    fn test_decode_rejects_bad_envelope() {
        let request = Request::read(0, 1);

        let short = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        assert!(matches!(decode_response(&short, &request), Err(CodecError::Malformed { .. })));

        let wrong_protocol = [0x00, 0x01, 0x00, 0x01, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x01];
        assert!(matches!(
            decode_response(&wrong_protocol, &request),
            Err(CodecError::Malformed { .. })
        ));

        let wrong_length = [0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x03, 0x02, 0x00, 0x01];
        assert!(matches!(
            decode_response(&wrong_length, &request),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_byte_count() {
        let request = Request::read(0, 2);
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x01];
        assert!(matches!(decode_response(&frame, &request), Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn test_decode_function_mismatch() {
        let request = Request::read(0, 1);
        let unsupported = [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x04, 0x02, 0x00];
        assert_eq!(
            decode_response(&unsupported, &request),
            Err(CodecError::UnsupportedFunction { code: 0x04 })
        );

        let other = encode_response(&header(1, 1), &Response::WriteSingleRegister { address: 0, value: 1 });
        assert!(matches!(decode_response(&other, &request), Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn test_decode_echo_mismatch() {
        let request = Request::write_single(10, 500);
        let frame = encode_response(&header(3, 1), &Response::WriteSingleRegister { address: 10, value: 501 });
        assert_eq!(
            decode_response(&frame, &request),
            Err(CodecError::echo_mismatch("value", 500, 501))
        );

        let request = Request::write_multiple(10, vec![1, 2, 3]);
        let frame = encode_response(
            &header(4, 1),
            &Response::WriteMultipleRegisters { address: 10, quantity: 2 },
        );
        assert_eq!(
            decode_response(&frame, &request),
            Err(CodecError::echo_mismatch("quantity", 3, 2))
        );
    }

    #[test]
    fn test_round_trip_law() {
        let cases = vec![
            (Request::read(0, 3), Response::ReadHoldingRegisters(vec![0, 1234, 65535])),
            (Request::write_single(7, 42), Response::WriteSingleRegister { address: 7, value: 42 }),
            (
                Request::write_multiple(100, vec![1, 2]),
                Response::WriteMultipleRegisters { address: 100, quantity: 2 },
            ),
            (Request::read(9000, 1), Response::exception(0x03, ExceptionCode::IllegalDataAddress)),
        ];

        for (tid, (request, response)) in cases.into_iter().enumerate() {
            let request_frame = encode_request(tid as u16, 9, &request);
            let (hdr, decoded_request) = decode_request(&request_frame).unwrap();
            assert_eq!(decoded_request, request);

            let response_frame = encode_response(&hdr, &response);
            let (response_header, decoded) = decode_response(&response_frame, &request).unwrap();
            assert_eq!(response_header.transaction_id, tid as u16);
            assert_eq!(response_header.unit_id, 9);
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn test_frame_length() {
        assert_eq!(frame_length(&[0x00, 0x01, 0x00, 0x00, 0x00]), None);
        assert_eq!(frame_length(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06]), Some(Ok(12)));
        assert!(matches!(frame_length(&[0, 1, 0, 0, 0, 1]), Some(Err(_))));
        assert!(matches!(frame_length(&[0, 1, 0, 0, 0x01, 0x00]), Some(Err(_))));
        assert_eq!(frame_length(&[0, 1, 0, 0, 0, 254]), Some(Ok(260)));
    }

    #[test]
    fn test_decode_request_rejections() {
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01];
        match decode_request(&frame) {
            Err(RequestDecodeError::Rejected { function, code, header }) => {
                assert_eq!(function, 0x01);
                assert_eq!(code, ExceptionCode::IllegalFunction);
                assert_eq!(header.transaction_id, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let too_many = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x7E];
        assert!(matches!(
            decode_request(&too_many),
            Err(RequestDecodeError::Rejected { code: ExceptionCode::IllegalDataValue, .. })
        ));

        let truncated = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01];
        assert!(matches!(decode_request(&truncated), Err(RequestDecodeError::Malformed(_))));
    }
}
