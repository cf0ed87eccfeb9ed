// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! PCCC logical addressing and command framing for PLC-5, SLC 500 and
//! MicroLogix.
//!
//! Data lives in typed data-table files; a logical address is
//! `<file letters><file #>:<element>[.<subfield>|/<bit>]`, e.g. `N7:10`,
//! `T4:0.ACC`, `B3:2/5`. Subfields may be numeric offsets or mnemonics
//! resolved from a fixed per-file-type table.

use crate::cip::{self, PCCC_OBJECT_PATH};
use crate::slice::Slice;
use crate::{ErrorKind, Result, Status};

/// PCCC data-table file types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Ascii,
    Bit,
    BlockTransfer,
    Counter,
    Bcd,
    Float,
    Input,
    LongInt,
    Message,
    Int,
    Output,
    Pid,
    Control,
    Sfc,
    Status,
    String,
    Timer,
}

impl FileType {
    /// bytes per element of this file type
    pub fn element_size(&self) -> usize {
        match self {
            FileType::Ascii => 1,
            FileType::Bit => 2,
            FileType::BlockTransfer => 12,
            FileType::Counter => 6,
            FileType::Bcd => 2,
            FileType::Float => 4,
            FileType::Input => 2,
            FileType::LongInt => 4,
            FileType::Message => 112,
            FileType::Int => 2,
            FileType::Output => 2,
            FileType::Pid => 164,
            FileType::Control => 6,
            FileType::Sfc => 6,
            FileType::Status => 2,
            FileType::String => 84,
            FileType::Timer => 6,
        }
    }

    /// the numeric file type code used by the SLC address encoding
    pub fn slc_type_code(&self) -> Option<u8> {
        match self {
            FileType::Status => Some(0x84),
            FileType::Bit => Some(0x85),
            FileType::Timer => Some(0x86),
            FileType::Counter => Some(0x87),
            FileType::Control => Some(0x88),
            FileType::Int => Some(0x89),
            FileType::Float => Some(0x8A),
            FileType::Output => Some(0x8B),
            FileType::Input => Some(0x8C),
            FileType::String => Some(0x8D),
            FileType::Ascii => Some(0x8E),
            FileType::Bcd => Some(0x8F),
            FileType::LongInt => Some(0x91),
            FileType::Message => Some(0x92),
            FileType::Pid => Some(0x93),
            FileType::BlockTransfer | FileType::Sfc => None,
        }
    }

    /// highest addressable bit for a `/n` suffix, if allowed
    fn max_bit(&self) -> Option<u8> {
        match self {
            FileType::Bit | FileType::Int => Some(15),
            FileType::LongInt => Some(31),
            FileType::Status => Some(16),
            _ => None,
        }
    }
}

/// a parsed PCCC logical address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub file_type: FileType,
    pub file: u16,
    pub element: u16,
    pub sub_element: Option<u16>,
    /// element size; a mnemonic may override the file default
    pub element_size: usize,
    pub is_bit: bool,
    pub bit: u8,
}

struct SubElem {
    file_type: FileType,
    name: &'static str,
    element_size: usize,
    sub_element: u16,
    is_bit: bool,
    bit: u8,
}

const fn sub(
    file_type: FileType,
    name: &'static str,
    element_size: usize,
    sub_element: u16,
    is_bit: bool,
    bit: u8,
) -> SubElem {
    SubElem {
        file_type,
        name,
        element_size,
        sub_element,
        is_bit,
        bit,
    }
}

#[rustfmt::skip]
static SUB_ELEMENTS: &[SubElem] = &[
    /* BT block transfer */
    sub(FileType::BlockTransfer, "con",  2, 0, false, 0),
    sub(FileType::BlockTransfer, "rlen", 2, 1, false, 0),
    sub(FileType::BlockTransfer, "dlen", 2, 2, false, 0),
    sub(FileType::BlockTransfer, "df",   2, 3, false, 0),
    sub(FileType::BlockTransfer, "elem", 2, 4, false, 0),
    sub(FileType::BlockTransfer, "rgs",  2, 5, false, 0),

    /* R control */
    sub(FileType::Control, "con", 2, 0, false, 0),
    sub(FileType::Control, "len", 2, 1, false, 0),
    sub(FileType::Control, "pos", 2, 2, false, 0),

    /* C counter */
    sub(FileType::Counter, "con", 2, 0, false, 0),
    sub(FileType::Counter, "cu",  2, 0, true, 15),
    sub(FileType::Counter, "cd",  2, 0, true, 14),
    sub(FileType::Counter, "dn",  2, 0, true, 13),
    sub(FileType::Counter, "ov",  2, 0, true, 12),
    sub(FileType::Counter, "un",  2, 0, true, 11),
    sub(FileType::Counter, "pre", 2, 1, false, 0),
    sub(FileType::Counter, "acc", 2, 2, false, 0),

    /* MG message */
    sub(FileType::Message, "con",  2, 0, false, 0),
    sub(FileType::Message, "nr",   2, 0, true, 9),
    sub(FileType::Message, "to",   2, 0, true, 8),
    sub(FileType::Message, "en",   2, 0, true, 7),
    sub(FileType::Message, "st",   2, 0, true, 6),
    sub(FileType::Message, "dn",   2, 0, true, 5),
    sub(FileType::Message, "er",   2, 0, true, 4),
    sub(FileType::Message, "co",   2, 0, true, 3),
    sub(FileType::Message, "ew",   2, 0, true, 2),
    sub(FileType::Message, "err",  2, 1, false, 0),
    sub(FileType::Message, "rlen", 2, 2, false, 0),
    sub(FileType::Message, "dlen", 2, 3, false, 0),
    sub(FileType::Message, "data", 104, 4, false, 0),

    /* PD first control word */
    sub(FileType::Pid, "con", 2, 0, false, 0),
    sub(FileType::Pid, "en",  2, 0, true, 15),
    sub(FileType::Pid, "ct",  2, 0, true, 9),
    sub(FileType::Pid, "cl",  2, 0, true, 8),
    sub(FileType::Pid, "pvt", 2, 0, true, 7),
    sub(FileType::Pid, "do",  2, 0, true, 6),
    sub(FileType::Pid, "swm", 2, 0, true, 4),
    sub(FileType::Pid, "mo",  2, 0, true, 1),
    sub(FileType::Pid, "pe",  2, 0, true, 0),

    /* PD second control word */
    sub(FileType::Pid, "ini",  2, 1, true, 12),
    sub(FileType::Pid, "spor", 2, 1, true, 11),
    sub(FileType::Pid, "oll",  2, 1, true, 10),
    sub(FileType::Pid, "olh",  2, 1, true, 9),
    sub(FileType::Pid, "ewd",  2, 1, true, 8),
    sub(FileType::Pid, "dvna", 2, 1, true, 3),
    sub(FileType::Pid, "dvpa", 2, 1, true, 2),
    sub(FileType::Pid, "pvla", 2, 1, true, 1),
    sub(FileType::Pid, "pvha", 2, 1, true, 0),

    /* PD main vars */
    sub(FileType::Pid, "sp",   4, 2, false, 0),
    sub(FileType::Pid, "kp",   4, 4, false, 0),
    sub(FileType::Pid, "ki",   4, 6, false, 0),
    sub(FileType::Pid, "kd",   4, 8, false, 0),
    sub(FileType::Pid, "bias", 4, 10, false, 0),
    sub(FileType::Pid, "maxs", 4, 12, false, 0),
    sub(FileType::Pid, "mins", 4, 14, false, 0),
    sub(FileType::Pid, "db",   4, 16, false, 0),
    sub(FileType::Pid, "so",   4, 18, false, 0),
    sub(FileType::Pid, "maxo", 4, 20, false, 0),
    sub(FileType::Pid, "mino", 4, 22, false, 0),
    sub(FileType::Pid, "upd",  4, 24, false, 0),
    sub(FileType::Pid, "pv",   4, 26, false, 0),
    sub(FileType::Pid, "err",  4, 28, false, 0),
    sub(FileType::Pid, "out",  4, 30, false, 0),
    sub(FileType::Pid, "pvh",  4, 32, false, 0),
    sub(FileType::Pid, "pvl",  4, 34, false, 0),
    sub(FileType::Pid, "dvp",  4, 36, false, 0),
    sub(FileType::Pid, "dvn",  4, 38, false, 0),
    sub(FileType::Pid, "pvdb", 4, 40, false, 0),
    sub(FileType::Pid, "dvdb", 4, 42, false, 0),
    sub(FileType::Pid, "maxi", 4, 44, false, 0),
    sub(FileType::Pid, "mini", 4, 46, false, 0),
    sub(FileType::Pid, "tie",  4, 48, false, 0),
    sub(FileType::Pid, "addr", 8, 48, false, 0),
    sub(FileType::Pid, "data", 56, 52, false, 0),

    /* ST string */
    sub(FileType::String, "len",  2, 0, false, 0),
    sub(FileType::String, "data", 82, 1, false, 0),

    /* SC SFC */
    sub(FileType::Sfc, "con", 2, 0, false, 0),
    sub(FileType::Sfc, "sa",  2, 0, true, 15),
    sub(FileType::Sfc, "fs",  2, 0, true, 14),
    sub(FileType::Sfc, "ls",  2, 0, true, 13),
    sub(FileType::Sfc, "ov",  2, 0, true, 12),
    sub(FileType::Sfc, "er",  2, 0, true, 11),
    sub(FileType::Sfc, "dn",  2, 0, true, 10),
    sub(FileType::Sfc, "pre", 2, 1, false, 0),
    sub(FileType::Sfc, "tim", 2, 2, false, 0),

    /* T timer */
    sub(FileType::Timer, "con", 2, 0, false, 0),
    sub(FileType::Timer, "en",  2, 0, true, 15),
    sub(FileType::Timer, "tt",  2, 0, true, 14),
    sub(FileType::Timer, "dn",  2, 0, true, 13),
    sub(FileType::Timer, "pre", 2, 1, false, 0),
    sub(FileType::Timer, "acc", 2, 2, false, 0),
];

fn take_number(chars: &mut std::str::Chars<'_>, first: Option<char>) -> (Option<u16>, Option<char>) {
    let mut value: u32 = 0;
    let mut seen = false;
    let mut next = first;
    loop {
        match next {
            Some(c) if c.is_ascii_digit() && value < 65535 => {
                value = value * 10 + (c as u32 - '0' as u32);
                seen = true;
                next = chars.next();
            }
            other => {
                let value = value.min(u16::MAX as u32) as u16;
                return (if seen { Some(value) } else { None }, other);
            }
        }
    }
}

impl Address {
    /// parse a logical address, checking validity in a PLC-neutral way
    pub fn parse(name: &str) -> Result<Address> {
        let lower = name.to_ascii_lowercase();
        let mut rest = lower.as_str();

        let (file_type, default_file) = match rest.as_bytes() {
            [b'a', d, ..] if d.is_ascii_digit() => (FileType::Ascii, None),
            [b'b', b't', ..] => (FileType::BlockTransfer, None),
            [b'b', d, ..] if d.is_ascii_digit() => (FileType::Bit, None),
            [b'c', d, ..] if d.is_ascii_digit() => (FileType::Counter, None),
            [b'd', d, ..] if d.is_ascii_digit() => (FileType::Bcd, None),
            [b'f', d, ..] if d.is_ascii_digit() => (FileType::Float, None),
            // file number may be omitted for inputs and outputs
            [b'i', ..] => (FileType::Input, Some(1)),
            [b'l', d, ..] if d.is_ascii_digit() => (FileType::LongInt, None),
            [b'm', b'g', ..] => (FileType::Message, None),
            [b'n', d, ..] if d.is_ascii_digit() => (FileType::Int, None),
            [b'o', ..] => (FileType::Output, Some(0)),
            [b'p', b'd', ..] => (FileType::Pid, None),
            [b'r', d, ..] if d.is_ascii_digit() => (FileType::Control, None),
            [b's', b'c', ..] => (FileType::Sfc, None),
            [b's', b't', ..] => (FileType::String, None),
            [b's', d, ..] if d.is_ascii_digit() => (FileType::Status, None),
            [b't', d, ..] if d.is_ascii_digit() => (FileType::Timer, None),
            _ => {
                warn!("bad or unsupported logical address {name:?}");
                return Err(ErrorKind::BadParam.into());
            }
        };
        let letters = match file_type {
            FileType::BlockTransfer
            | FileType::Message
            | FileType::Pid
            | FileType::Sfc
            | FileType::String => 2,
            _ => 1,
        };
        rest = &rest[letters..];

        let mut chars = rest.chars();
        let next = chars.next();
        let (file_num, next) = take_number(&mut chars, next);
        let file = match (file_num, default_file) {
            (Some(n), _) => n,
            (None, Some(default)) => default,
            (None, None) => {
                warn!("missing data-table file number in {name:?}");
                return Err(ErrorKind::BadParam.into());
            }
        };

        if next != Some(':') {
            warn!("expected ':' before element number in {name:?}");
            return Err(ErrorKind::BadParam.into());
        }
        let first = chars.next();
        let (element, next) = take_number(&mut chars, first);
        let element = element.ok_or_else(|| {
            warn!("missing element number in {name:?}");
            Status::from(ErrorKind::BadParam)
        })?;

        let mut addr = Address {
            file_type,
            file,
            element,
            sub_element: None,
            element_size: file_type.element_size(),
            is_bit: false,
            bit: 0,
        };

        let next = match next {
            None => return Ok(addr),
            Some('.') => {
                let next = chars.next();
                if next.map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    let (sub_num, next) = take_number(&mut chars, next);
                    addr.sub_element = sub_num;
                    next
                } else {
                    // mnemonic lookup against the remaining text
                    let tail: String = next.into_iter().chain(chars.by_ref()).collect();
                    let hit = SUB_ELEMENTS.iter().find(|s| {
                        s.file_type == addr.file_type && tail.starts_with(s.name)
                    });
                    let hit = match hit {
                        Some(hit) if tail.len() == hit.name.len() => hit,
                        _ => {
                            warn!("unsupported field mnemonic in {name:?}");
                            return Err(ErrorKind::BadParam.into());
                        }
                    };
                    addr.sub_element = Some(hit.sub_element);
                    addr.element_size = hit.element_size;
                    addr.is_bit = hit.is_bit;
                    addr.bit = hit.bit;
                    return Ok(addr);
                }
            }
            other => other,
        };

        match next {
            None => Ok(addr),
            Some('/') => {
                let max_bit = addr.file_type.max_bit().ok_or_else(|| {
                    warn!("bit access not supported for file type in {name:?}");
                    Status::from(ErrorKind::BadParam)
                })?;
                let first = chars.next();
                let (bit, next) = take_number(&mut chars, first);
                let bit = bit.ok_or_else(|| {
                    warn!("missing bit number in {name:?}");
                    Status::from(ErrorKind::BadParam)
                })?;
                if next.is_some() {
                    warn!("trailing characters after bit number in {name:?}");
                    return Err(ErrorKind::BadParam.into());
                }
                if bit > max_bit as u16 {
                    warn!("bit number {bit} out of range 0..={max_bit} in {name:?}");
                    return Err(ErrorKind::OutOfBounds.into());
                }
                addr.is_bit = true;
                addr.bit = bit as u8;
                Ok(addr)
            }
            Some(c) => {
                warn!("unexpected character {c:?} in logical address {name:?}");
                Err(ErrorKind::BadParam.into())
            }
        }
    }

    /// PLC/5 level encoding: level flags byte, then file, element and
    /// optional sub-element as variable-width values
    pub fn encode_plc5(&self) -> Vec<u8> {
        let mut out = vec![0x06u8]; // levels one and two
        encode_value(&mut out, self.file);
        encode_value(&mut out, self.element);
        if let Some(sub_element) = self.sub_element {
            out[0] |= 0x08;
            encode_value(&mut out, sub_element);
        }
        out
    }

    /// SLC/MicroLogix encoding: file, file type code, element, sub-element
    pub fn encode_slc(&self) -> Result<Vec<u8>> {
        let type_code = self.file_type.slc_type_code().ok_or_else(|| {
            warn!("file type {:?} cannot be encoded for SLC", self.file_type);
            Status::from(ErrorKind::BadParam)
        })?;
        let mut out = vec![];
        encode_value(&mut out, self.file);
        encode_value(&mut out, type_code as u16);
        encode_value(&mut out, self.element);
        encode_value(&mut out, self.sub_element.unwrap_or(0));
        Ok(out)
    }
}

/// values up to 254 are one byte; larger are an 0xFF marker plus LE16
fn encode_value(out: &mut Vec<u8>, value: u16) {
    if value <= 254 {
        out.push(value as u8);
    } else {
        out.push(0xFF);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/* ---------------- checksums ---------------- */

/// AB's CRC-16 lookup table
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0xC0C1, 0xC181, 0x0140, 0xC301, 0x03C0, 0x0280, 0xC241, 0xC601, 0x06C0, 0x0780, 0xC741, 0x0500, 0xC5C1, 0xC481,
    0x0440, 0xCC01, 0x0CC0, 0x0D80, 0xCD41, 0x0F00, 0xCFC1, 0xCE81, 0x0E40, 0x0A00, 0xCAC1, 0xCB81, 0x0B40, 0xC901, 0x09C0,
    0x0880, 0xC841, 0xD801, 0x18C0, 0x1980, 0xD941, 0x1B00, 0xDBC1, 0xDA81, 0x1A40, 0x1E00, 0xDEC1, 0xDF81, 0x1F40, 0xDD01,
    0x1DC0, 0x1C80, 0xDC41, 0x1400, 0xD4C1, 0xD581, 0x1540, 0xD701, 0x17C0, 0x1680, 0xD641, 0xD201, 0x12C0, 0x1380, 0xD341,
    0x1100, 0xD1C1, 0xD081, 0x1040, 0xF001, 0x30C0, 0x3180, 0xF141, 0x3300, 0xF3C1, 0xF281, 0x3240, 0x3600, 0xF6C1, 0xF781,
    0x3740, 0xF501, 0x35C0, 0x3480, 0xF441, 0x3C00, 0xFCC1, 0xFD81, 0x3D40, 0xFF01, 0x3FC0, 0x3E80, 0xFE41, 0xFA01, 0x3AC0,
    0x3B80, 0xFB41, 0x3900, 0xF9C1, 0xF881, 0x3840, 0x2800, 0xE8C1, 0xE981, 0x2940, 0xEB01, 0x2BC0, 0x2A80, 0xEA41, 0xEE01,
    0x2EC0, 0x2F80, 0xEF41, 0x2D00, 0xEDC1, 0xEC81, 0x2C40, 0xE401, 0x24C0, 0x2580, 0xE541, 0x2700, 0xE7C1, 0xE681, 0x2640,
    0x2200, 0xE2C1, 0xE381, 0x2340, 0xE101, 0x21C0, 0x2080, 0xE041, 0xA001, 0x60C0, 0x6180, 0xA141, 0x6300, 0xA3C1, 0xA281,
    0x6240, 0x6600, 0xA6C1, 0xA781, 0x6740, 0xA501, 0x65C0, 0x6480, 0xA441, 0x6C00, 0xACC1, 0xAD81, 0x6D40, 0xAF01, 0x6FC0,
    0x6E80, 0xAE41, 0xAA01, 0x6AC0, 0x6B80, 0xAB41, 0x6900, 0xA9C1, 0xA881, 0x6840, 0x7800, 0xB8C1, 0xB981, 0x7940, 0xBB01,
    0x7BC0, 0x7A80, 0xBA41, 0xBE01, 0x7EC0, 0x7F80, 0xBF41, 0x7D00, 0xBDC1, 0xBC81, 0x7C40, 0xB401, 0x74C0, 0x7580, 0xB541,
    0x7700, 0xB7C1, 0xB681, 0x7640, 0x7200, 0xB2C1, 0xB381, 0x7340, 0xB101, 0x71C0, 0x7080, 0xB041, 0x5000, 0x90C1, 0x9181,
    0x5140, 0x9301, 0x53C0, 0x5280, 0x9241, 0x9601, 0x56C0, 0x5780, 0x9741, 0x5500, 0x95C1, 0x9481, 0x5440, 0x9C01, 0x5CC0,
    0x5D80, 0x9D41, 0x5F00, 0x9FC1, 0x9E81, 0x5E40, 0x5A00, 0x9AC1, 0x9B81, 0x5B40, 0x9901, 0x59C0, 0x5880, 0x9841, 0x8801,
    0x48C0, 0x4980, 0x8941, 0x4B00, 0x8BC1, 0x8A81, 0x4A40, 0x4E00, 0x8EC1, 0x8F81, 0x4F40, 0x8D01, 0x4DC0, 0x4C80, 0x8C41,
    0x4400, 0x84C1, 0x8581, 0x4540, 0x8701, 0x47C0, 0x4680, 0x8641, 0x8201, 0x42C0, 0x4380, 0x8341, 0x4100, 0x81C1, 0x8081,
    0x4040,
];

/// AB's CRC-16: running value folded through the table byte by byte
pub fn crc16(data: &[u8]) -> u16 {
    let mut running: u16 = 0;
    for &b in data {
        let idx = (running as u8) ^ b;
        running = (running >> 8) ^ CRC16_TABLE[idx as usize];
    }
    running
}

/// BCC: two's complement of the byte sum, low 8 bits
pub fn bcc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    (sum.wrapping_neg() & 0xFF) as u8
}

/* ---------------- error decode ---------------- */

/// decode a PCCC STS byte to a fixed message. The extended form (0xF0)
/// carries the true code three bytes further on; longer extensions are
/// decoded best-effort with the raw bytes left to the caller's logs.
pub fn decode_error(error_bytes: &[u8]) -> &'static str {
    let mut code = error_bytes.first().copied().unwrap_or(0);
    if code == 0xF0 {
        code = error_bytes.get(3).copied().unwrap_or(0);
    }
    match code {
        1 => "Error converting block address.",
        2 => "Less levels specified in address than minimum for any address.",
        3 => "More levels specified in address than system supports",
        4 => "Symbol not found.",
        5 => "Symbol is of improper format.",
        6 => "Address doesn't point to something usable.",
        7 => "File is wrong size.",
        8 => "Cannot complete request, situation has changed since the start of the command.",
        9 => "File is too large.",
        0x0A => "Transaction size plus word address is too large.",
        0x0B => "Access denied, improper privilege.",
        0x0C => "Condition cannot be generated - resource is not available (some has upload active)",
        0x0D => "Condition already exists - resource is already available.",
        0x0E => "Command could not be executed PCCC decode error.",
        0x0F => "Requester does not have upload or download access - no privilege.",
        0x10 => "Illegal command or format.",
        0x20 => "Host has a problem and will not communicate.",
        0x30 => "Remote node host is missing, disconnected, or shut down.",
        0x40 => "Host could not complete function due to hardware fault.",
        0x50 => "Addressing problem or memory protect rungs.",
        0x60 => "Function not allowed due to command protection selection.",
        0x70 => "Processor is in Program mode.",
        0x80 => "Compatibility mode file missing or communication zone problem.",
        0x90 => "Remote node cannot buffer command.",
        0xA0 | 0xC0 => "Wait ACK (1775-KA buffer full).",
        0xB0 => "Remote node problem due to download.",
        _ => "Unknown error response.",
    }
}

/* ---------------- typed data (DT) byte ---------------- */

/// encode the type/size descriptor byte (plus extension bytes when a
/// value does not fit its nybble)
pub fn encode_dt_byte(data_type: u32, data_size: u32) -> Vec<u8> {
    let mut out = vec![0u8];
    let t_nybble = if data_type <= 0x07 {
        data_type as u8
    } else {
        let mut v = data_type;
        let mut n = 0u8;
        while v != 0 {
            out.push((v & 0xFF) as u8);
            v >>= 8;
            n += 1;
        }
        0x08 | n
    };
    let d_nybble = if data_size <= 0x07 {
        data_size as u8
    } else {
        let mut v = data_size;
        let mut n = 0u8;
        while v != 0 {
            out.push((v & 0xFF) as u8);
            v >>= 8;
            n += 1;
        }
        0x08 | n
    };
    out[0] = (t_nybble << 4) | d_nybble;
    out
}

/// decode a DT byte; returns (type, size, bytes consumed)
pub fn decode_dt_byte(data: &[u8]) -> Option<(u32, u32, usize)> {
    let first = *data.first()?;
    let mut offset = 1usize;
    let t_nybble = (first >> 4) as u32;
    let d_nybble = (first & 0x0F) as u32;

    let mut take = |nybble: u32| -> Option<u32> {
        if nybble & 0x08 == 0 {
            return Some(nybble);
        }
        let n = (nybble & 0x07) as usize;
        if n > 4 || offset + n > data.len() {
            return None;
        }
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 8) | data[offset] as u32;
            offset += 1;
        }
        Some(v)
    };

    let d_type = take(t_nybble)?;
    let d_size = take(d_nybble)?;
    Some((d_type, d_size, offset))
}

/* ---------------- command framing ---------------- */

pub const CMD_TYPED: u8 = 0x0F;
/// reply command: request command with the high bit set
pub const CMD_REPLY_BIT: u8 = 0x40;

pub const FNC_PLC5_TYPED_READ: u8 = 0x68;
pub const FNC_PLC5_TYPED_WRITE: u8 = 0x67;
pub const FNC_SLC_READ: u8 = 0xA2;
pub const FNC_SLC_WRITE: u8 = 0xAA;

fn command_header(out: &mut Vec<u8>, fnc: u8, tns: u16) {
    out.push(CMD_TYPED);
    out.push(0x00); // STS, zero in requests
    out.extend_from_slice(&tns.to_le_bytes());
    out.push(fnc);
}

/// PLC-5 typed read: offset and transfer size in elements, then the
/// level-encoded address
pub fn plc5_read(tns: u16, addr: &Address, offset: u16, elements: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    command_header(&mut out, FNC_PLC5_TYPED_READ, tns);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&elements.to_le_bytes());
    out.extend_from_slice(&addr.encode_plc5());
    out
}

/// PLC-5 typed write: header, offset, transfer size, address, data
pub fn plc5_write(tns: u16, addr: &Address, offset: u16, elements: u16, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + data.len());
    command_header(&mut out, FNC_PLC5_TYPED_WRITE, tns);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&elements.to_le_bytes());
    out.extend_from_slice(&addr.encode_plc5());
    out.extend_from_slice(data);
    out
}

/// SLC protected typed logical read: byte count then the address quad
pub fn slc_read(tns: u16, addr: &Address, byte_count: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(12);
    command_header(&mut out, FNC_SLC_READ, tns);
    out.push(byte_count);
    out.extend_from_slice(&addr.encode_slc()?);
    Ok(out)
}

/// SLC protected typed logical write
pub fn slc_write(tns: u16, addr: &Address, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(12 + data.len());
    command_header(&mut out, FNC_SLC_WRITE, tns);
    out.push(data.len() as u8);
    out.extend_from_slice(&addr.encode_slc()?);
    out.extend_from_slice(data);
    Ok(out)
}

/// wrap a PCCC command in a CIP Execute PCCC request; the 7-byte
/// requester id (vendor + serial) precedes the command
pub fn encode_execute(vendor_id: u16, vendor_serial: u32, pccc: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(7 + pccc.len());
    body.push(0x07); // requester id size, always 7
    body.extend_from_slice(&vendor_id.to_le_bytes());
    body.extend_from_slice(&vendor_serial.to_le_bytes());
    body.extend_from_slice(pccc);
    cip::request(cip::SRV_PCCC_EXECUTE, &PCCC_OBJECT_PATH, &body)
}

/// a decoded PCCC command reply
#[derive(Debug)]
pub struct PcccReply<'a> {
    pub cmd: u8,
    pub sts: u8,
    pub tns: u16,
    pub data: Slice<'a>,
}

impl PcccReply<'_> {
    pub fn check(&self) -> Status {
        if self.sts == 0 {
            Status::Ok
        } else {
            let mut raw = vec![self.sts];
            raw.extend_from_slice(self.data.bytes());
            debug!(
                "PCCC error STS {:#04x}: {} (raw {:02x?})",
                self.sts,
                decode_error(&raw),
                raw
            );
            Status::Err(ErrorKind::RemoteErr)
        }
    }
}

/// parse the payload of an Execute PCCC reply (after the CIP reply
/// header): requester id echo, then CMD/STS/TNS and data
pub fn decode_execute_reply<'a>(payload: &Slice<'a>) -> Result<PcccReply<'a>> {
    let id_size = payload.u8(0) as usize;
    let base = 1 + id_size.saturating_sub(1); // size byte counts itself
    let cmd = payload.u8(base);
    let sts = payload.u8(base + 1);
    let tns = payload.u16_le(base + 2);
    if payload.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    let data = payload.from(base + 4);
    if data.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok(PcccReply {
        cmd,
        sts,
        tns,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_int() {
        let addr = Address::parse("N7:10").unwrap();
        assert_eq!(addr.file_type, FileType::Int);
        assert_eq!(addr.file, 7);
        assert_eq!(addr.element, 10);
        assert_eq!(addr.sub_element, None);
        assert_eq!(addr.element_size, 2);
    }

    #[test]
    fn test_parse_roundtrip_identity() {
        // parse → encode → the parse result fully determines the encoding
        for name in ["N7:10", "F8:2", "T4:0.acc", "B3:2/5", "ST9:1", "L20:300"] {
            let a = Address::parse(name).unwrap();
            let b = Address::parse(&name.to_ascii_uppercase()).unwrap();
            assert_eq!(a, b, "case-insensitive parse of {name}");
        }
    }

    #[test]
    fn test_parse_mnemonics() {
        let acc = Address::parse("T4:0.ACC").unwrap();
        assert_eq!(acc.sub_element, Some(2));
        assert!(!acc.is_bit);

        let dn = Address::parse("T4:0.DN").unwrap();
        assert_eq!(dn.sub_element, Some(0));
        assert!(dn.is_bit);
        assert_eq!(dn.bit, 13);

        let pre = Address::parse("C5:1.PRE").unwrap();
        assert_eq!(pre.sub_element, Some(1));

        assert!(Address::parse("N7:0.ACC").is_err());
    }

    #[test]
    fn test_parse_bit_suffix() {
        let b = Address::parse("B3:2/5").unwrap();
        assert!(b.is_bit);
        assert_eq!(b.bit, 5);

        let l = Address::parse("L9:0/31").unwrap();
        assert_eq!(l.bit, 31);

        assert!(Address::parse("L9:0/32").is_err());
        assert!(Address::parse("F8:0/1").is_err());
    }

    #[test]
    fn test_parse_io_default_file() {
        let i = Address::parse("I:3").unwrap();
        assert_eq!(i.file, 1);
        let o = Address::parse("O:2").unwrap();
        assert_eq!(o.file, 0);
    }

    #[test]
    fn test_plc5_encoding() {
        // the N7:10 example: level byte 0x06, file 7, element 10
        let addr = Address::parse("N7:10").unwrap();
        assert_eq!(addr.encode_plc5(), vec![0x06, 0x07, 0x0A]);

        // sub-element sets the level-three flag
        let acc = Address::parse("T4:0.ACC").unwrap();
        assert_eq!(acc.encode_plc5(), vec![0x0E, 0x04, 0x00, 0x02]);

        // values above 254 expand to 0xFF + LE16
        let big = Address::parse("N500:300").unwrap();
        assert_eq!(
            big.encode_plc5(),
            vec![0x06, 0xFF, 0xF4, 0x01, 0xFF, 0x2C, 0x01]
        );
    }

    #[test]
    fn test_slc_encoding() {
        let addr = Address::parse("N7:0").unwrap();
        assert_eq!(addr.encode_slc().unwrap(), vec![0x07, 0x89, 0x00, 0x00]);

        let timer = Address::parse("T4:2.PRE").unwrap();
        assert_eq!(timer.encode_slc().unwrap(), vec![0x04, 0x86, 0x02, 0x01]);

        assert!(Address::parse("BT10:0").unwrap().encode_slc().is_err());
    }

    #[test]
    fn test_crc16_and_bcc() {
        assert_eq!(crc16(&[]), 0);
        assert_eq!(crc16(&[0x07]), CRC16_TABLE[0x07]);
        // folding property over two bytes
        let one = crc16(&[0xAB]);
        let idx = (one as u8) ^ 0xCD;
        assert_eq!(crc16(&[0xAB, 0xCD]), (one >> 8) ^ CRC16_TABLE[idx as usize]);

        assert_eq!(bcc(&[1, 2, 3]), 0xFA);
        assert_eq!(bcc(&[]), 0);
        assert_eq!(bcc(&[0xFF, 0x01]), 0);
    }

    #[test]
    fn test_error_decode() {
        assert_eq!(decode_error(&[0x04]), "Symbol not found.");
        assert_eq!(decode_error(&[0x70]), "Processor is in Program mode.");
        // extended: true code three bytes past the 0xF0 marker
        assert_eq!(decode_error(&[0xF0, 0, 0, 0x07]), "File is wrong size.");
        assert_eq!(decode_error(&[0xEE]), "Unknown error response.");
    }

    #[test]
    fn test_dt_byte_roundtrip() {
        // small values fit the nybbles
        let enc = encode_dt_byte(0x04, 0x02);
        assert_eq!(enc, vec![0x42]);
        assert_eq!(decode_dt_byte(&enc), Some((0x04, 0x02, 1)));

        // a file type code needs an extension byte
        let enc = encode_dt_byte(0x89, 2);
        assert_eq!(enc, vec![0x92, 0x89]);
        assert_eq!(decode_dt_byte(&enc), Some((0x89, 2, 2)));

        assert_eq!(decode_dt_byte(&[]), None);
        assert_eq!(decode_dt_byte(&[0x92]), None);
    }

    #[test]
    fn test_plc5_write_shape() {
        let addr = Address::parse("N7:10").unwrap();
        let msg = plc5_write(0x1234, &addr, 0, 1, &[0x2A, 0x00]);
        assert_eq!(
            msg,
            vec![
                0x0F, 0x00, 0x34, 0x12, 0x67, // CMD STS TNS FNC
                0x00, 0x00, 0x01, 0x00, // offset, elements
                0x06, 0x07, 0x0A, // address
                0x2A, 0x00, // data
            ]
        );
    }

    #[test]
    fn test_slc_read_shape() {
        let addr = Address::parse("N7:0").unwrap();
        let msg = slc_read(0x0001, &addr, 2).unwrap();
        assert_eq!(
            msg,
            vec![0x0F, 0x00, 0x01, 0x00, 0xA2, 0x02, 0x07, 0x89, 0x00, 0x00]
        );
    }

    #[test]
    fn test_execute_wrapper_roundtrip() {
        let addr = Address::parse("N7:10").unwrap();
        let pccc = plc5_read(0x42, &addr, 0, 1);
        let req = encode_execute(0xF33D, 0x002A, &pccc);
        assert_eq!(req[0], cip::SRV_PCCC_EXECUTE);
        assert_eq!(&req[2..6], &PCCC_OBJECT_PATH);
        assert_eq!(req[6], 0x07);

        // a matching reply: id echo + CMD|0x40, STS 0, TNS, data
        let mut reply = vec![0x07, 0x3D, 0xF3, 0x2A, 0x00, 0x00, 0x00];
        reply.extend_from_slice(&[0x4F, 0x00, 0x42, 0x00, 0x2A, 0x00]);
        let parsed = decode_execute_reply(&Slice::new(&reply)).unwrap();
        assert_eq!(parsed.cmd, 0x4F);
        assert_eq!(parsed.tns, 0x42);
        assert!(parsed.check().is_ok());
        assert_eq!(parsed.data.bytes(), &[0x2A, 0x00]);
    }
}
