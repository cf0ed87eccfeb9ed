// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! CIP service codec and EPATH addressing.
//!
//! Requests are service code + EPATH + body; replies set the high bit of
//! the service code and carry a general status plus optional extended
//! status words. Builders here produce the exact byte layouts the
//! reference PLCs expect, including the Forward Close pad-byte quirk.

use crate::slice::Slice;
use crate::{ErrorKind, Result, Status};

/* tag services */
pub const SRV_MULTI: u8 = 0x0A;
pub const SRV_PCCC_EXECUTE: u8 = 0x4B;
pub const SRV_READ_TAG: u8 = 0x4C;
pub const SRV_WRITE_TAG: u8 = 0x4D;
pub const SRV_FORWARD_CLOSE: u8 = 0x4E;
pub const SRV_READ_TAG_FRAG: u8 = 0x52;
pub const SRV_UNCONNECTED_SEND: u8 = 0x52;
pub const SRV_WRITE_TAG_FRAG: u8 = 0x53;
pub const SRV_FORWARD_OPEN: u8 = 0x54;
pub const SRV_GET_INSTANCE_ATTRIB_LIST: u8 = 0x55;
pub const SRV_FORWARD_OPEN_EX: u8 = 0x5B;

/// reply bit ORed into the service code
pub const REPLY_BIT: u8 = 0x80;

/* general status codes */
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_CONN_FAILURE: u8 = 0x01;
pub const STATUS_INVALID_PARAM: u8 = 0x03;
pub const STATUS_PATH_SEGMENT: u8 = 0x04;
pub const STATUS_PATH_DEST_UNKNOWN: u8 = 0x05;
pub const STATUS_PARTIAL: u8 = 0x06;
pub const STATUS_UNSUPPORTED: u8 = 0x08;
pub const STATUS_INSUFFICIENT_DATA: u8 = 0x13;
pub const STATUS_TOO_MUCH_DATA: u8 = 0x15;
pub const STATUS_EXTENDED: u8 = 0xFF;

/* extended status codes */
pub const EX_DUPLICATE_CONN: u16 = 0x0100;
pub const EX_INVALID_CONN_SIZE: u16 = 0x0109;
pub const EX_TOO_LONG: u16 = 0x2105;

/// Connection Manager object, class 0x06 instance 0x01
pub const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];
/// Message Router, target of Multiple Service Packet groups
pub const MESSAGE_ROUTER_PATH: [u8; 4] = [0x20, 0x02, 0x24, 0x01];
/// PCCC object, target of Execute PCCC
pub const PCCC_OBJECT_PATH: [u8; 4] = [0x20, 0x67, 0x24, 0x01];
/// symbol object class, used for the tag directory listing
pub const SYMBOL_CLASS: u16 = 0x6B;

/// transport class/trigger for Forward Open: server, class 3, application
pub const TRANSPORT_CLASS: u8 = 0xA3;

/// connection parameter flag bits (owner/exclusive, point-to-point, low
/// priority, variable size); the bottom bits carry the packet size
pub const CONN_PARAM_BASE: u16 = 0x4200;
pub const CONN_PARAM_BASE_EX: u32 = 0x4200_0000;

/// legacy Forward Open packet limit
pub const MAX_PACKET_LEGACY: u16 = 508;
/// extended Forward Open packet limit
pub const MAX_PACKET_EX: u16 = 4002;

/* atomic tag type codes */
pub const TYPE_BOOL: u16 = 0xC1;
pub const TYPE_SINT: u16 = 0xC2;
pub const TYPE_INT: u16 = 0xC3;
pub const TYPE_DINT: u16 = 0xC4;
pub const TYPE_LINT: u16 = 0xC5;
pub const TYPE_USINT: u16 = 0xC6;
pub const TYPE_UINT: u16 = 0xC7;
pub const TYPE_UDINT: u16 = 0xC8;
pub const TYPE_ULINT: u16 = 0xC9;
pub const TYPE_REAL: u16 = 0xCA;
pub const TYPE_LREAL: u16 = 0xCB;
/// marker preceding a 16-bit structure template handle
pub const TYPE_STRUCT: u16 = 0x02A0;

/// element size in bytes of an atomic type code, if known
pub fn atomic_type_size(type_code: u16) -> Option<usize> {
    match type_code {
        TYPE_BOOL | TYPE_SINT | TYPE_USINT => Some(1),
        TYPE_INT | TYPE_UINT => Some(2),
        TYPE_DINT | TYPE_UDINT | TYPE_REAL => Some(4),
        TYPE_LINT | TYPE_ULINT | TYPE_LREAL => Some(8),
        _ => None,
    }
}

/// human-readable text for a CIP general status, for logging only
pub fn decode_general_status(status: u8) -> &'static str {
    match status {
        0x00 => "success",
        0x01 => "connection failure",
        0x02 => "resource unavailable",
        0x03 => "invalid parameter value",
        0x04 => "path segment error",
        0x05 => "path destination unknown",
        0x06 => "partial data transferred",
        0x07 => "connection lost",
        0x08 => "service not supported",
        0x09 => "invalid attribute value",
        0x0A => "attribute list error",
        0x0B => "already in requested state",
        0x0C => "object state conflict",
        0x0D => "object already exists",
        0x0E => "attribute not settable",
        0x0F => "privilege violation",
        0x10 => "device state conflict",
        0x11 => "reply data too large",
        0x13 => "not enough data",
        0x14 => "attribute not supported",
        0x15 => "too much data",
        0x16 => "object does not exist",
        0x1A => "bridging failure, routing data too large",
        0x1C => "missing attribute in list",
        0x20 => "invalid parameter",
        0x26 => "invalid path size",
        _ => "unknown CIP status",
    }
}

/// builder for CIP EPATHs.
///
/// Segments are appended in order; the encoded length is always padded to
/// an even byte count as the wire format counts in 16-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Epath {
    bytes: Vec<u8>,
}

impl Epath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// ANSI symbolic segment, padded to an even total
    pub fn symbolic(mut self, name: &str) -> Self {
        self.bytes.push(0x91);
        self.bytes.push(name.len() as u8);
        self.bytes.extend_from_slice(name.as_bytes());
        if name.len() % 2 != 0 {
            self.bytes.push(0);
        }
        self
    }

    /// numeric index segment, sized to the value
    pub fn index(mut self, value: u32) -> Self {
        if value <= u8::MAX as u32 {
            self.bytes.push(0x28);
            self.bytes.push(value as u8);
        } else if value <= u16::MAX as u32 {
            self.bytes.extend_from_slice(&[0x29, 0x00]);
            self.bytes.extend_from_slice(&(value as u16).to_le_bytes());
        } else {
            self.bytes.extend_from_slice(&[0x2A, 0x00]);
            self.bytes.extend_from_slice(&value.to_le_bytes());
        }
        self
    }

    /// 8-bit logical class + instance segments
    pub fn class_instance(mut self, class: u8, instance: u8) -> Self {
        self.bytes.extend_from_slice(&[0x20, class, 0x24, instance]);
        self
    }

    /// 16-bit logical class + instance segments
    pub fn class_instance16(mut self, class: u16, instance: u16) -> Self {
        self.bytes.extend_from_slice(&[0x21, 0x00]);
        self.bytes.extend_from_slice(&class.to_le_bytes());
        self.bytes.extend_from_slice(&[0x25, 0x00]);
        self.bytes.extend_from_slice(&instance.to_le_bytes());
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// parse a route path attribute like `"1,0"` into port/link bytes.
///
/// Each element must fit a byte; longer routes alternate port,link pairs
/// through chassis backplanes and DH+ bridges.
pub fn parse_route_path(path: &str) -> Result<Vec<u8>> {
    let mut out = vec![];
    for part in path.split(',') {
        let v: u8 = part.trim().parse().map_err(|_| {
            warn!("bad route path element {part:?} in {path:?}");
            Status::from(ErrorKind::BadParam)
        })?;
        out.push(v);
    }
    if out.is_empty() || out.len() % 2 != 0 {
        warn!("route path {path:?} must have an even number of elements");
        return Err(ErrorKind::BadParam.into());
    }
    Ok(out)
}

/// connection path for Forward Open: route bytes + Message Router
pub fn connection_path(route: &[u8]) -> Vec<u8> {
    let mut out = route.to_vec();
    out.extend_from_slice(&MESSAGE_ROUTER_PATH);
    out
}

/// encode a CIP request: service, path size in words, path, body
pub fn request(service: u8, path: &[u8], body: &[u8]) -> Vec<u8> {
    debug_assert!(path.len() % 2 == 0, "EPATH must be an even byte count");
    let mut out = Vec::with_capacity(2 + path.len() + body.len());
    out.push(service);
    out.push((path.len() / 2) as u8);
    out.extend_from_slice(path);
    out.extend_from_slice(body);
    out
}

/// a decoded CIP reply
#[derive(Debug)]
pub struct Reply<'a> {
    pub service: u8,
    pub status: u8,
    pub extended: Option<u16>,
    pub payload: Slice<'a>,
}

impl Reply<'_> {
    /// map the reply status onto the library taxonomy; partial data is not
    /// an error, it drives fragmentation
    pub fn check(&self) -> Status {
        match self.status {
            STATUS_OK | STATUS_PARTIAL => Status::Ok,
            other => {
                debug!(
                    "CIP service {:#04x} failed: {:#04x} ({}) extended {:?}",
                    self.service & !REPLY_BIT,
                    other,
                    decode_general_status(other),
                    self.extended
                );
                Status::Err(ErrorKind::RemoteErr)
            }
        }
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        self.status == STATUS_PARTIAL
    }
}

/// parse a reply header: service|0x80, reserved, status, extra words
pub fn decode_reply<'a>(input: &Slice<'a>) -> Result<Reply<'a>> {
    let service = input.u8(0);
    let status = input.u8(2);
    let extra_words = input.u8(3) as usize;
    if input.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    if service & REPLY_BIT == 0 {
        warn!("CIP reply service {service:#04x} is missing the reply bit");
        return Err(ErrorKind::BadReply.into());
    }
    let extended = if extra_words > 0 {
        let v = input.u16_le(4);
        if input.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        Some(v)
    } else {
        None
    };
    let payload = input.from(4 + extra_words * 2);
    if payload.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok(Reply {
        service,
        status,
        extended,
        payload,
    })
}

/* ---------------- Forward Open / Forward Close ---------------- */

/// everything that goes into a Forward Open request
#[derive(Debug, Clone)]
pub struct ForwardOpen {
    pub extended: bool,
    pub secs_per_tick: u8,
    pub timeout_ticks: u8,
    pub client_conn_id: u32,
    pub conn_serial: u16,
    pub vendor_id: u16,
    pub orig_serial: u32,
    pub timeout_multiplier: u8,
    /// requested packet interval, microseconds, both directions
    pub rpi_us: u32,
    /// requested max packet size, masked into the connection parameters
    pub max_packet: u16,
    pub conn_path: Vec<u8>,
}

impl ForwardOpen {
    pub fn service(&self) -> u8 {
        if self.extended {
            SRV_FORWARD_OPEN_EX
        } else {
            SRV_FORWARD_OPEN
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(36 + self.conn_path.len());
        body.push(self.secs_per_tick);
        body.push(self.timeout_ticks);
        body.extend_from_slice(&0u32.to_le_bytes()); // server conn id, filled by remote
        body.extend_from_slice(&self.client_conn_id.to_le_bytes());
        body.extend_from_slice(&self.conn_serial.to_le_bytes());
        body.extend_from_slice(&self.vendor_id.to_le_bytes());
        body.extend_from_slice(&self.orig_serial.to_le_bytes());
        body.push(self.timeout_multiplier);
        body.extend_from_slice(&[0u8; 3]); // reserved
        for _direction in 0..2 {
            body.extend_from_slice(&self.rpi_us.to_le_bytes());
            if self.extended {
                let params = CONN_PARAM_BASE_EX | (self.max_packet as u32 & 0x0FFF);
                body.extend_from_slice(&params.to_le_bytes());
            } else {
                let params = CONN_PARAM_BASE | (self.max_packet & 0x01FF);
                body.extend_from_slice(&params.to_le_bytes());
            }
        }
        body.push(TRANSPORT_CLASS);
        body.push((self.conn_path.len() / 2) as u8);
        body.extend_from_slice(&self.conn_path);
        request(self.service(), &CONNECTION_MANAGER_PATH, &body)
    }

    /// the Forward Close matching this open; same path, but the wire
    /// format wants a pad byte between the path length and the path
    pub fn encode_close(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(12 + self.conn_path.len());
        body.push(self.secs_per_tick);
        body.push(self.timeout_ticks);
        body.extend_from_slice(&self.conn_serial.to_le_bytes());
        body.extend_from_slice(&self.vendor_id.to_le_bytes());
        body.extend_from_slice(&self.orig_serial.to_le_bytes());
        body.push((self.conn_path.len() / 2) as u8);
        body.push(0); // pad required by the target
        body.extend_from_slice(&self.conn_path);
        request(SRV_FORWARD_CLOSE, &CONNECTION_MANAGER_PATH, &body)
    }
}

/// the useful parts of a successful Forward Open reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOpenReply {
    pub server_conn_id: u32,
    pub client_conn_id: u32,
    pub conn_serial: u16,
    pub client_to_server_rpi_us: u32,
    pub server_to_client_rpi_us: u32,
}

pub fn decode_forward_open_reply(payload: &Slice<'_>) -> Result<ForwardOpenReply> {
    // server conn id, client conn id, conn serial, vendor id, orig serial,
    // then the two accepted RPIs
    let reply = ForwardOpenReply {
        server_conn_id: payload.u32_le(0),
        client_conn_id: payload.u32_le(4),
        conn_serial: payload.u16_le(8),
        client_to_server_rpi_us: payload.u32_le(16),
        server_to_client_rpi_us: payload.u32_le(20),
    };
    if payload.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok(reply)
}

/* ---------------- tag services ---------------- */

pub fn encode_read(path: &[u8], elem_count: u16) -> Vec<u8> {
    request(SRV_READ_TAG, path, &elem_count.to_le_bytes())
}

pub fn encode_read_frag(path: &[u8], elem_count: u16, byte_offset: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(&elem_count.to_le_bytes());
    body.extend_from_slice(&byte_offset.to_le_bytes());
    request(SRV_READ_TAG_FRAG, path, &body)
}

fn push_type(body: &mut Vec<u8>, type_code: u16, struct_handle: Option<u16>) {
    match struct_handle {
        Some(handle) => {
            body.extend_from_slice(&TYPE_STRUCT.to_le_bytes());
            body.extend_from_slice(&handle.to_le_bytes());
        }
        None => body.extend_from_slice(&type_code.to_le_bytes()),
    }
}

pub fn encode_write(
    path: &[u8],
    type_code: u16,
    struct_handle: Option<u16>,
    elem_count: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + data.len());
    push_type(&mut body, type_code, struct_handle);
    body.extend_from_slice(&elem_count.to_le_bytes());
    body.extend_from_slice(data);
    request(SRV_WRITE_TAG, path, &body)
}

pub fn encode_write_frag(
    path: &[u8],
    type_code: u16,
    struct_handle: Option<u16>,
    elem_count: u16,
    byte_offset: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + data.len());
    push_type(&mut body, type_code, struct_handle);
    body.extend_from_slice(&elem_count.to_le_bytes());
    body.extend_from_slice(&byte_offset.to_le_bytes());
    body.extend_from_slice(data);
    request(SRV_WRITE_TAG_FRAG, path, &body)
}

/// type information + data of a read reply payload
#[derive(Debug)]
pub struct ReadPayload<'a> {
    pub type_code: u16,
    pub struct_handle: Option<u16>,
    pub data: Slice<'a>,
}

pub fn decode_read_payload<'a>(payload: &Slice<'a>) -> Result<ReadPayload<'a>> {
    let type_code = payload.u16_le(0);
    if payload.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    let (struct_handle, data_start) = if type_code == TYPE_STRUCT {
        let handle = payload.u16_le(2);
        if payload.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        (Some(handle), 4)
    } else {
        (None, 2)
    };
    let data = payload.from(data_start);
    if data.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok(ReadPayload {
        type_code,
        struct_handle,
        data,
    })
}

/* ---------------- Multiple Service Packet ---------------- */

/// pack sub-requests into one Multiple Service Packet; offsets are
/// relative to the count word
pub fn encode_multi(requests: &[Vec<u8>]) -> Vec<u8> {
    let count = requests.len();
    let mut body = Vec::new();
    body.extend_from_slice(&(count as u16).to_le_bytes());
    let mut offset = 2 + 2 * count;
    for req in requests {
        body.extend_from_slice(&(offset as u16).to_le_bytes());
        offset += req.len();
    }
    for req in requests {
        body.extend_from_slice(req);
    }
    request(SRV_MULTI, &MESSAGE_ROUTER_PATH, &body)
}

/// encoded size of a Multiple Service Packet wrapping `request_sizes`
pub fn multi_overhead(count: usize) -> usize {
    // service + path words + path + count word + one offset word each
    2 + MESSAGE_ROUTER_PATH.len() + 2 + 2 * count
}

/// split a packed reply payload back into the per-request replies, in
/// submission order
pub fn decode_multi_reply<'a>(payload: &Slice<'a>) -> Result<Vec<Slice<'a>>> {
    let count = payload.u16_le(0) as usize;
    if payload.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    let mut offsets = Vec::with_capacity(count);
    for i in 0..count {
        offsets.push(payload.u16_le(2 + 2 * i) as usize);
    }
    if payload.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = offsets[i];
        let end = if i + 1 < count {
            offsets[i + 1]
        } else {
            payload.len()
        };
        if end < start {
            return Err(ErrorKind::BadReply.into());
        }
        let sub = payload.sub(start, end - start);
        if sub.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        out.push(sub);
    }
    Ok(out)
}

/* ---------------- Unconnected Send ---------------- */

/// wrap an embedded request in a Connection Manager Unconnected Send so
/// it can be routed through a backplane to the target CPU
pub fn encode_unconnected_send(embedded: &[u8], route: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + embedded.len() + 4 + route.len());
    body.push(0x0A); // secs per tick
    body.push(0x05); // timeout ticks
    body.extend_from_slice(&(embedded.len() as u16).to_le_bytes());
    body.extend_from_slice(embedded);
    if embedded.len() % 2 != 0 {
        body.push(0);
    }
    body.push((route.len() / 2) as u8);
    body.push(0); // reserved
    body.extend_from_slice(route);
    request(SRV_UNCONNECTED_SEND, &CONNECTION_MANAGER_PATH, &body)
}

/* ---------------- tag directory listing ---------------- */

/// attributes requested per symbol instance: name, type, element length,
/// array dimensions
pub const SYMBOL_ATTRIBUTES: [u16; 4] = [0x01, 0x02, 0x07, 0x08];

/// Get Instance Attribute List against the symbol class, starting at
/// `start_instance`; partial replies continue from the last id + 1
pub fn encode_list_tags(start_instance: u16) -> Vec<u8> {
    let path = Epath::new()
        .class_instance16(SYMBOL_CLASS, start_instance)
        .into_bytes();
    let mut body = Vec::with_capacity(2 + 2 * SYMBOL_ATTRIBUTES.len());
    body.extend_from_slice(&(SYMBOL_ATTRIBUTES.len() as u16).to_le_bytes());
    for attr in SYMBOL_ATTRIBUTES {
        body.extend_from_slice(&attr.to_le_bytes());
    }
    request(SRV_GET_INSTANCE_ATTRIB_LIST, &path, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_path_padding() {
        let even = Epath::new().symbolic("Tag1").into_bytes();
        assert_eq!(even, vec![0x91, 4, b'T', b'a', b'g', b'1']);
        let odd = Epath::new().symbolic("Tag").into_bytes();
        assert_eq!(odd, vec![0x91, 3, b'T', b'a', b'g', 0]);
    }

    #[test]
    fn test_index_segments() {
        let path = Epath::new().index(5).index(300).index(70000).into_bytes();
        assert_eq!(
            path,
            vec![
                0x28, 5, //
                0x29, 0x00, 0x2C, 0x01, //
                0x2A, 0x00, 0x70, 0x11, 0x01, 0x00,
            ]
        );
    }

    #[test]
    fn test_route_path_parse() {
        assert_eq!(parse_route_path("1,0").unwrap(), vec![1, 0]);
        assert_eq!(parse_route_path(" 1 , 3 ").unwrap(), vec![1, 3]);
        assert!(parse_route_path("1").is_err());
        assert!(parse_route_path("1,x").is_err());
        assert!(parse_route_path("1,999").is_err());
    }

    #[test]
    fn test_read_request_shape() {
        let path = Epath::new().symbolic("TestBigArray").into_bytes();
        let req = encode_read(&path, 10);
        assert_eq!(req[0], SRV_READ_TAG);
        assert_eq!(req[1] as usize * 2, path.len());
        assert_eq!(&req[2..2 + path.len()], &path[..]);
        assert_eq!(&req[2 + path.len()..], &[10, 0]);
    }

    #[test]
    fn test_write_struct_type_encoding() {
        let path = Epath::new().symbolic("U").into_bytes();
        let req = encode_write(&path, 0, Some(0x1234), 1, &[0xFF]);
        let body = &req[2 + path.len()..];
        assert_eq!(&body[..4], &[0xA0, 0x02, 0x34, 0x12]);
        assert_eq!(&body[4..6], &[1, 0]);
    }

    #[test]
    fn test_forward_open_close_paths_match() {
        let fo = ForwardOpen {
            extended: false,
            secs_per_tick: 10,
            timeout_ticks: 5,
            client_conn_id: 0x11223344,
            conn_serial: 0x5566,
            vendor_id: 0xF33D,
            orig_serial: 0x99AA,
            timeout_multiplier: 1,
            rpi_us: 1_000_000,
            max_packet: MAX_PACKET_LEGACY,
            conn_path: connection_path(&[1, 0]),
        };
        let open = fo.encode();
        let close = fo.encode_close();

        // path words count sits right before the path in both requests
        let open_path_words = open[open.len() - fo.conn_path.len() - 1] as usize;
        assert_eq!(open_path_words * 2, fo.conn_path.len());
        let close_path = &close[close.len() - fo.conn_path.len()..];
        assert_eq!(close_path, &fo.conn_path[..]);
        // pad byte between length and path in the close only
        assert_eq!(close[close.len() - fo.conn_path.len() - 1], 0);
        assert_eq!(
            close[close.len() - fo.conn_path.len() - 2] as usize * 2,
            fo.conn_path.len()
        );
    }

    #[test]
    fn test_forward_open_param_masks() {
        let mut fo = ForwardOpen {
            extended: false,
            secs_per_tick: 10,
            timeout_ticks: 5,
            client_conn_id: 1,
            conn_serial: 2,
            vendor_id: 3,
            orig_serial: 4,
            timeout_multiplier: 0,
            rpi_us: 8000,
            max_packet: MAX_PACKET_LEGACY,
            conn_path: connection_path(&[1, 0]),
        };
        let legacy = fo.encode();
        // o->t params at body offset 26 (after 2-byte service/path header + CM path)
        let base = 2 + CONNECTION_MANAGER_PATH.len();
        let params = u16::from_le_bytes([legacy[base + 26], legacy[base + 27]]);
        assert_eq!(params, CONN_PARAM_BASE | MAX_PACKET_LEGACY);

        fo.extended = true;
        fo.max_packet = MAX_PACKET_EX;
        let ex = fo.encode();
        assert_eq!(ex[0], SRV_FORWARD_OPEN_EX);
        let params = u32::from_le_bytes([
            ex[base + 26],
            ex[base + 27],
            ex[base + 28],
            ex[base + 29],
        ]);
        assert_eq!(params, CONN_PARAM_BASE_EX | MAX_PACKET_EX as u32);
    }

    #[test]
    fn test_reply_decode() {
        // read reply: service|0x80, reserved, partial status, no extension,
        // type DINT, data
        let raw = [0xCC, 0x00, 0x06, 0x00, 0xC4, 0x00, 1, 0, 0, 0];
        let reply = decode_reply(&Slice::new(&raw)).unwrap();
        assert_eq!(reply.service, SRV_READ_TAG | REPLY_BIT);
        assert!(reply.is_partial());
        assert!(reply.check().is_ok());
        let payload = decode_read_payload(&reply.payload).unwrap();
        assert_eq!(payload.type_code, TYPE_DINT);
        assert_eq!(payload.data.bytes(), &[1, 0, 0, 0]);
    }

    #[test]
    fn test_reply_extended_error() {
        let raw = [0xD4, 0x00, 0x01, 0x01, 0x00, 0x01];
        let reply = decode_reply(&Slice::new(&raw)).unwrap();
        assert_eq!(reply.status, STATUS_CONN_FAILURE);
        assert_eq!(reply.extended, Some(EX_DUPLICATE_CONN));
        assert_eq!(reply.check(), Status::Err(ErrorKind::RemoteErr));
    }

    #[test]
    fn test_multi_roundtrip() {
        let path = Epath::new().symbolic("A").into_bytes();
        let reqs = vec![encode_read(&path, 1), encode_read(&path, 2)];
        let packed = encode_multi(&reqs);
        assert_eq!(packed[0], SRV_MULTI);

        // reply mirrors the request layout after the 4-byte reply header
        let mut reply_payload = Vec::new();
        let subs: Vec<Vec<u8>> = vec![vec![0xCC, 0, 0, 0, 0xC4, 0], vec![0xCC, 0, 0, 0, 0xC4, 0, 1]];
        reply_payload.extend_from_slice(&2u16.to_le_bytes());
        let mut off = 2 + 2 * subs.len();
        for sub in &subs {
            reply_payload.extend_from_slice(&(off as u16).to_le_bytes());
            off += sub.len();
        }
        for sub in &subs {
            reply_payload.extend_from_slice(sub);
        }
        let payload = Slice::new(&reply_payload);
        let parts = decode_multi_reply(&payload).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].bytes(), &subs[0][..]);
        assert_eq!(parts[1].bytes(), &subs[1][..]);
    }

    #[test]
    fn test_unconnected_send_pads_odd_embedded() {
        let embedded = vec![0x4C, 0x01, 0x91]; // odd length on purpose
        let wrapped = encode_unconnected_send(&embedded, &[1, 0]);
        assert_eq!(wrapped[0], SRV_UNCONNECTED_SEND);
        let body = &wrapped[2 + CONNECTION_MANAGER_PATH.len()..];
        let embedded_len = u16::from_le_bytes([body[2], body[3]]) as usize;
        assert_eq!(embedded_len, 3);
        // pad byte then path size + reserved + route
        assert_eq!(&body[4 + 3..], &[0x00, 0x01, 0x00, 1, 0]);
    }
}
