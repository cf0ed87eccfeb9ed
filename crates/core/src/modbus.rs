// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! Modbus TCP codec: MBAP framing and the PDU shapes for the supported
//! function codes. Shared between the client session and the test server.

use crate::slice::Slice;
use crate::{ErrorKind, Result, Status};

/// default Modbus TCP port
pub const DEFAULT_PORT: u16 = 502;

/// MBAP header size in bytes
pub const MBAP_LEN: usize = 7;

/// per-request count limits from the protocol spec
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGS: u16 = 123;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code
    IllegalFunction = 0x01,
    /// Illegal data address
    IllegalDataAddress = 0x02,
    /// Illegal data value
    IllegalDataValue = 0x03,
    /// Server device failure
    ServerDeviceFailure = 0x04,
}

impl ExceptionCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            _ => None,
        }
    }
}

/// MBAP header: transaction id, protocol id (always 0), length of the
/// bytes that follow the length field, unit id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, pdu_length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1, // +1 for the unit id
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_LEN] {
        let mut bytes = [0u8; MBAP_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    pub fn decode(input: &Slice<'_>) -> Result<Self> {
        let header = Self {
            transaction_id: input.u16_be(0),
            protocol_id: input.u16_be(2),
            length: input.u16_be(4),
            unit_id: input.u8(6),
        };
        if input.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        if header.protocol_id != 0 {
            warn!("MBAP protocol id {} is not zero", header.protocol_id);
            return Err(ErrorKind::BadReply.into());
        }
        if header.length == 0 {
            return Err(ErrorKind::BadReply.into());
        }
        Ok(header)
    }
}

/// total frame length once the MBAP length field is buffered
#[inline]
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 6 {
        return None;
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    Some(6 + length)
}

fn frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader::new(transaction_id, pdu.len() as u16, unit_id);
    let mut out = Vec::with_capacity(MBAP_LEN + pdu.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(pdu);
    out
}

/// read coils / discrete inputs / registers: start + count
pub fn encode_read(
    transaction_id: u16,
    unit_id: u8,
    function: FunctionCode,
    address: u16,
    count: u16,
) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function as u8);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    frame(transaction_id, unit_id, &pdu)
}

/// write single coil: value is 0xFF00 for on, 0x0000 for off
pub fn encode_write_single_coil(transaction_id: u16, unit_id: u8, address: u16, on: bool) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleCoil as u8);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(if on { 0xFF00u16 } else { 0 }).to_be_bytes());
    frame(transaction_id, unit_id, &pdu)
}

pub fn encode_write_single_register(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    value: u16,
) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleRegister as u8);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    frame(transaction_id, unit_id, &pdu)
}

/// write multiple coils: `bits` is already packed LSB-first
pub fn encode_write_coils(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    count: u16,
    bits: &[u8],
) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + bits.len());
    pdu.push(FunctionCode::WriteMultipleCoils as u8);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push(bits.len() as u8);
    pdu.extend_from_slice(bits);
    frame(transaction_id, unit_id, &pdu)
}

/// write multiple registers: `data` holds native little-endian u16s and
/// is swapped to wire order here
pub fn encode_write_registers(
    transaction_id: u16,
    unit_id: u8,
    address: u16,
    data: &[u8],
) -> Vec<u8> {
    debug_assert!(data.len() % 2 == 0);
    let count = (data.len() / 2) as u16;
    let mut pdu = Vec::with_capacity(6 + data.len());
    pdu.push(FunctionCode::WriteMultipleRegisters as u8);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    pdu.push(data.len() as u8);
    for pair in data.chunks_exact(2) {
        let v = u16::from_le_bytes([pair[0], pair[1]]);
        pdu.extend_from_slice(&v.to_be_bytes());
    }
    frame(transaction_id, unit_id, &pdu)
}

/// big-endian wire registers into a native little-endian buffer
pub fn wire_to_regs(wire: &[u8], out: &mut Vec<u8>) {
    for pair in wire.chunks_exact(2) {
        let v = u16::from_be_bytes([pair[0], pair[1]]);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// a decoded response PDU
#[derive(Debug)]
pub struct Response<'a> {
    pub function: FunctionCode,
    pub data: Slice<'a>,
}

/// parse the PDU that follows the unit id; an exception reply surfaces
/// as `ERR_REMOTE_ERR` with the code logged
pub fn decode_response<'a>(pdu: &Slice<'a>) -> Result<Response<'a>> {
    let fc_byte = pdu.u8(0);
    if pdu.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    if fc_byte & 0x80 != 0 {
        let code = pdu.u8(1);
        debug!(
            "modbus exception on function {:#04x}: {:?} ({code:#04x})",
            fc_byte & 0x7F,
            ExceptionCode::from_byte(code)
        );
        return Err(ErrorKind::RemoteErr.into());
    }
    let function = FunctionCode::from_byte(fc_byte).ok_or_else(|| {
        warn!("unknown modbus function {fc_byte:#04x} in response");
        Status::from(ErrorKind::BadReply)
    })?;
    let data = pdu.from(1);
    if data.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok(Response { function, data })
}

/// Modbus register spaces addressable from a tag name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterType {
    /// `co` - coils, read/write bits
    Coil,
    /// `di` - discrete inputs, read-only bits
    Discrete,
    /// `hr` - holding registers, read/write words
    Holding,
    /// `ir` - input registers, read-only words
    Input,
}

impl RegisterType {
    /// element size in the tag buffer: packed bits take a byte per
    /// element boundary handling, registers two bytes
    pub fn elem_size(&self) -> usize {
        match self {
            RegisterType::Coil | RegisterType::Discrete => 1,
            RegisterType::Holding | RegisterType::Input => 2,
        }
    }

    pub fn read_function(&self) -> FunctionCode {
        match self {
            RegisterType::Coil => FunctionCode::ReadCoils,
            RegisterType::Discrete => FunctionCode::ReadDiscreteInputs,
            RegisterType::Holding => FunctionCode::ReadHoldingRegisters,
            RegisterType::Input => FunctionCode::ReadInputRegisters,
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }

    pub fn max_read_count(&self) -> u16 {
        match self {
            RegisterType::Coil | RegisterType::Discrete => MAX_READ_BITS,
            RegisterType::Holding | RegisterType::Input => MAX_READ_REGS,
        }
    }
}

/// parse a Modbus tag name like `hr10` or `co42` into its register space
/// and first register number
pub fn parse_register(name: &str) -> Result<(RegisterType, u16)> {
    let lower = name.to_ascii_lowercase();
    let (prefix, number) = lower.split_at(lower.len().min(2));
    let register_type = match prefix {
        "co" => RegisterType::Coil,
        "di" => RegisterType::Discrete,
        "hr" => RegisterType::Holding,
        "ir" => RegisterType::Input,
        _ => {
            warn!("modbus tag name {name:?} must start with co/di/hr/ir");
            return Err(ErrorKind::BadParam.into());
        }
    };
    let number: u16 = number.parse().map_err(|_| {
        warn!("modbus tag name {name:?} has a bad register number");
        Status::from(ErrorKind::BadParam)
    })?;
    Ok((register_type, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_header_serialization() {
        let header = MbapHeader::new(0x1234, 5, 1);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01]);
    }

    #[test]
    fn test_mbap_header_parsing() {
        let bytes = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01];
        let header = MbapHeader::decode(&Slice::new(&bytes)).unwrap();
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 1);

        let bad = [0x12, 0x34, 0x00, 0x01, 0x00, 0x06, 0x01];
        assert!(MbapHeader::decode(&Slice::new(&bad)).is_err());
    }

    #[test]
    fn test_read_request_shape() {
        // the S3 request: tid 1, unit 1, FC 0x03, start 0, count 10
        let req = encode_read(1, 1, FunctionCode::ReadHoldingRegisters, 0, 10);
        assert_eq!(
            req,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
        assert_eq!(frame_len(&req), Some(req.len()));
    }

    #[test]
    fn test_write_single_coil_values() {
        let on = encode_write_single_coil(2, 1, 42, true);
        assert_eq!(&on[7..], &[0x05, 0x00, 0x2A, 0xFF, 0x00]);
        let off = encode_write_single_coil(2, 1, 42, false);
        assert_eq!(&off[7..], &[0x05, 0x00, 0x2A, 0x00, 0x00]);
    }

    #[test]
    fn test_write_registers_swaps_to_wire_order() {
        // buffer holds 0x0102, 0x0304 little-endian
        let req = encode_write_registers(3, 1, 5, &[0x02, 0x01, 0x04, 0x03]);
        assert_eq!(
            &req[7..],
            &[0x10, 0x00, 0x05, 0x00, 0x02, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[test]
    fn test_wire_to_regs() {
        let mut out = vec![];
        wire_to_regs(&[0x01, 0x02, 0x03, 0x04], &mut out);
        assert_eq!(out, vec![0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn test_decode_response() {
        let pdu = [0x03, 0x02, 0x00, 0x2A];
        let resp = decode_response(&Slice::new(&pdu)).unwrap();
        assert_eq!(resp.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(resp.data.bytes(), &[0x02, 0x00, 0x2A]);
    }

    #[test]
    fn test_decode_exception() {
        let pdu = [0x83, 0x02];
        let err = decode_response(&Slice::new(&pdu)).unwrap_err();
        assert_eq!(err, Status::Err(ErrorKind::RemoteErr));
    }

    #[test]
    fn test_parse_register_names() {
        assert_eq!(
            parse_register("hr10").unwrap(),
            (RegisterType::Holding, 10)
        );
        assert_eq!(parse_register("co42").unwrap(), (RegisterType::Coil, 42));
        assert_eq!(
            parse_register("IR64000").unwrap(),
            (RegisterType::Input, 64000)
        );
        assert!(parse_register("xx1").is_err());
        assert!(parse_register("hr").is_err());
        assert!(parse_register("hr99999").is_err());
    }

    #[test]
    fn test_register_type_properties() {
        assert!(RegisterType::Coil.writable());
        assert!(!RegisterType::Discrete.writable());
        assert_eq!(RegisterType::Holding.elem_size(), 2);
        assert_eq!(
            RegisterType::Discrete.read_function(),
            FunctionCode::ReadDiscreteInputs
        );
        assert_eq!(RegisterType::Coil.max_read_count(), MAX_READ_BITS);
    }
}
