// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! EtherNet/IP encapsulation codec.
//!
//! Every frame is a 24-byte header followed by a command-specific body.
//! The codec is a set of pure encode/decode functions; nothing in here
//! touches a socket. Unknown commands and short frames decode to
//! `ERR_BAD_REPLY`, never a panic.

use crate::slice::{Slice, SliceMut};
use crate::{ErrorKind, Result, Status};

/// default EtherNet/IP TCP port
pub const DEFAULT_PORT: u16 = 44818;

/// encapsulation header size in bytes
pub const HEADER_LEN: usize = 24;

pub const CMD_LIST_SERVICES: u16 = 0x0004;
pub const CMD_LIST_IDENTITY: u16 = 0x0063;
pub const CMD_REGISTER_SESSION: u16 = 0x0065;
pub const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub const CMD_SEND_RR_DATA: u16 = 0x006F;
pub const CMD_SEND_UNIT_DATA: u16 = 0x0070;

/// CPF item types
pub const CPF_ITEM_NULL_ADDR: u16 = 0x0000;
pub const CPF_ITEM_CONNECTED_ADDR: u16 = 0x00A1;
pub const CPF_ITEM_CONNECTED_DATA: u16 = 0x00B1;
pub const CPF_ITEM_UNCONNECTED_DATA: u16 = 0x00B2;

/// requested encapsulation protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// 24-byte encapsulation header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    /// bytes following the header
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: u64,
    pub options: u32,
}

impl Header {
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.session_handle.to_le_bytes());
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&self.sender_context.to_le_bytes());
        out.extend_from_slice(&self.options.to_le_bytes());
    }

    pub fn decode(input: &Slice<'_>) -> Result<Header> {
        let header = Header {
            command: input.u16_le(0),
            length: input.u16_le(2),
            session_handle: input.u32_le(4),
            status: input.u32_le(8),
            sender_context: input.u64_le(12),
            options: input.u32_le(20),
        };
        if input.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        Ok(header)
    }
}

/// total frame length once enough of the header is buffered
#[inline]
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let body_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    Some(HEADER_LEN + body_len)
}

fn frame(command: u16, session_handle: u32, sender_context: u64, body: &[u8]) -> Vec<u8> {
    let header = Header {
        command,
        length: body.len() as u16,
        session_handle,
        status: 0,
        sender_context,
        options: 0,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    header.encode_to(&mut out);
    out.extend_from_slice(body);
    out
}

/// RegisterSession request: protocol version + options, no session yet
pub fn encode_register_session() -> Vec<u8> {
    let mut body = [0u8; 4];
    let mut w = SliceMut::new(&mut body);
    w.set_u16_le(0, PROTOCOL_VERSION);
    w.set_u16_le(2, 0);
    frame(CMD_REGISTER_SESSION, 0, 0, &body)
}

/// the session handle the remote assigned in a RegisterSession reply
pub fn decode_register_session_reply(header: &Header, _body: &Slice<'_>) -> Result<u32> {
    if header.command != CMD_REGISTER_SESSION {
        return Err(ErrorKind::BadReply.into());
    }
    if header.status != 0 {
        warn!("RegisterSession rejected, encap status {:#x}", header.status);
        return Err(ErrorKind::RemoteErr.into());
    }
    Ok(header.session_handle)
}

pub fn encode_unregister_session(session_handle: u32) -> Vec<u8> {
    frame(CMD_UNREGISTER_SESSION, session_handle, 0, &[])
}

/// SendRRData: unconnected CIP carried in a Null Address + Unconnected Data
/// CPF pair
pub fn encode_send_rr_data(session_handle: u32, sender_context: u64, cip: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + 2 + 4 + 4 + cip.len());
    body.extend_from_slice(&0u32.to_le_bytes()); // interface handle
    body.extend_from_slice(&0u16.to_le_bytes()); // timeout
    body.extend_from_slice(&2u16.to_le_bytes()); // item count
    body.extend_from_slice(&CPF_ITEM_NULL_ADDR.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&CPF_ITEM_UNCONNECTED_DATA.to_le_bytes());
    body.extend_from_slice(&(cip.len() as u16).to_le_bytes());
    body.extend_from_slice(cip);
    frame(CMD_SEND_RR_DATA, session_handle, sender_context, &body)
}

/// SendUnitData: connected CIP with the connection id in the address item
/// and the sequence number prefixed to the data item
pub fn encode_send_unit_data(
    session_handle: u32,
    connection_id: u32,
    sequence: u16,
    cip: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(6 + 2 + 8 + 4 + 2 + cip.len());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.extend_from_slice(&CPF_ITEM_CONNECTED_ADDR.to_le_bytes());
    body.extend_from_slice(&4u16.to_le_bytes());
    body.extend_from_slice(&connection_id.to_le_bytes());
    body.extend_from_slice(&CPF_ITEM_CONNECTED_DATA.to_le_bytes());
    body.extend_from_slice(&((cip.len() + 2) as u16).to_le_bytes());
    body.extend_from_slice(&sequence.to_le_bytes());
    body.extend_from_slice(cip);
    frame(CMD_SEND_UNIT_DATA, session_handle, sender_context_noop(), &body)
}

// connected traffic correlates on the CIP sequence, the context is unused
#[inline(always)]
fn sender_context_noop() -> u64 {
    0
}

pub fn encode_list_services() -> Vec<u8> {
    frame(CMD_LIST_SERVICES, 0, 0, &[])
}

pub fn encode_list_identity() -> Vec<u8> {
    frame(CMD_LIST_IDENTITY, 0, 0, &[])
}

/// decoded common packet format payload of a SendRRData / SendUnitData body
#[derive(Debug)]
pub struct CpfPayload<'a> {
    /// connection id from a Connected Address item
    pub connection_id: Option<u32>,
    /// sequence number prefix of a Connected Data item
    pub sequence: Option<u16>,
    /// the CIP message bytes
    pub data: Slice<'a>,
}

/// parse the body of a SendRRData / SendUnitData frame.
///
/// The body is interface handle + timeout followed by a CPF frame; the
/// address item tells connected from unconnected apart.
pub fn decode_cpf<'a>(body: &Slice<'a>) -> Result<CpfPayload<'a>> {
    let item_count = body.u16_le(6) as usize;
    if body.has_error() || item_count < 2 {
        return Err(ErrorKind::BadReply.into());
    }

    let mut offset = 8usize;
    let mut connection_id = None;
    let mut sequence = None;
    let mut data = None;

    for _ in 0..item_count {
        let item_type = body.u16_le(offset);
        let item_len = body.u16_le(offset + 2) as usize;
        offset += 4;
        let item = body.sub(offset, item_len);
        if body.has_error() || item.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        match item_type {
            CPF_ITEM_NULL_ADDR => {}
            CPF_ITEM_CONNECTED_ADDR => {
                connection_id = Some(item.u32_le(0));
            }
            CPF_ITEM_UNCONNECTED_DATA => {
                data = Some(item);
            }
            CPF_ITEM_CONNECTED_DATA => {
                sequence = Some(item.u16_le(0));
                data = Some(item.from(2));
            }
            other => {
                debug!("skipping unknown CPF item type {other:#06x}");
            }
        }
        offset += item_len;
    }

    let data = data.ok_or_else(|| Status::from(ErrorKind::BadReply))?;
    if data.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok(CpfPayload {
        connection_id,
        sequence,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_session_shape() {
        let frame = encode_register_session();
        assert_eq!(frame.len(), HEADER_LEN + 4);
        let r = Slice::new(&frame);
        let header = Header::decode(&r).unwrap();
        assert_eq!(header.command, CMD_REGISTER_SESSION);
        assert_eq!(header.length, 4);
        assert_eq!(header.session_handle, 0);
        // version 1, options 0
        assert_eq!(r.u16_le(24), 1);
        assert_eq!(r.u16_le(26), 0);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            command: CMD_SEND_RR_DATA,
            length: 16,
            session_handle: 0x01020304,
            status: 0,
            sender_context: 0xAABBCCDD,
            options: 0,
        };
        let mut out = vec![];
        header.encode_to(&mut out);
        let parsed = Header::decode(&Slice::new(&out)).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_short_header_is_bad_reply() {
        let err = Header::decode(&Slice::new(&[0u8; 10])).unwrap_err();
        assert_eq!(err, Status::Err(ErrorKind::BadReply));
    }

    #[test]
    fn test_rr_data_cpf_roundtrip() {
        let cip = [0x4C, 0x02, 0x20, 0x6B, 0x24, 0x01];
        let frame = encode_send_rr_data(0x1111, 42, &cip);
        let r = Slice::new(&frame);
        let header = Header::decode(&r).unwrap();
        assert_eq!(header.sender_context, 42);
        let payload = decode_cpf(&r.sub(HEADER_LEN, header.length as usize)).unwrap();
        assert_eq!(payload.connection_id, None);
        assert_eq!(payload.sequence, None);
        assert_eq!(payload.data.bytes(), &cip);
    }

    #[test]
    fn test_unit_data_cpf_roundtrip() {
        let cip = [0x4D, 0x00];
        let frame = encode_send_unit_data(0x2222, 0xDEAD0001, 7, &cip);
        let r = Slice::new(&frame);
        let header = Header::decode(&r).unwrap();
        assert_eq!(header.command, CMD_SEND_UNIT_DATA);
        let payload = decode_cpf(&r.sub(HEADER_LEN, header.length as usize)).unwrap();
        assert_eq!(payload.connection_id, Some(0xDEAD0001));
        assert_eq!(payload.sequence, Some(7));
        assert_eq!(payload.data.bytes(), &cip);
    }

    #[test]
    fn test_frame_len() {
        let frame = encode_register_session();
        assert_eq!(frame_len(&frame), Some(frame.len()));
        assert_eq!(frame_len(&frame[..3]), None);
    }
}
