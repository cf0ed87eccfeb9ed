// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! byte slice views used by all wire codecs.
//!
//! Every accessor clamps to the view's range. An out-of-range access
//! returns a zeroed value *and* latches an error flag on the view, so a
//! chain of reads over a truncated packet cannot silently produce a
//! plausible-looking result. Callers check [`Slice::has_error`] once at
//! the end of a parse.

use std::cell::Cell;
use std::fmt::Write as _;

/// non-owning read view of a byte region with a latched error flag
#[derive(Debug)]
pub struct Slice<'a> {
    data: &'a [u8],
    err: Cell<bool>,
}

impl<'a> Slice<'a> {
    #[inline(always)]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            err: Cell::new(false),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn has_error(&self) -> bool {
        self.err.get()
    }

    #[inline(always)]
    pub fn set_error(&self) {
        self.err.set(true);
    }

    #[inline(always)]
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// sub-view of `len` bytes starting at `start`.
    ///
    /// An existing error carries over to the child; a range past the end
    /// yields an empty, errored view.
    pub fn sub(&self, start: usize, len: usize) -> Slice<'a> {
        let end = start.checked_add(len);
        match end {
            Some(end) if end <= self.data.len() => Slice {
                data: &self.data[start..end],
                err: Cell::new(self.err.get()),
            },
            _ => {
                self.err.set(true);
                Slice {
                    data: &[],
                    err: Cell::new(true),
                }
            }
        }
    }

    /// remaining bytes from `start` to the end
    #[inline]
    pub fn from(&self, start: usize) -> Slice<'a> {
        if start > self.data.len() {
            self.err.set(true);
            return Slice {
                data: &[],
                err: Cell::new(true),
            };
        }
        self.sub(start, self.data.len() - start)
    }

    fn get(&self, offset: usize, n: usize) -> Option<&'a [u8]> {
        let end = offset.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        Some(&self.data[offset..end])
    }

    #[inline]
    pub fn u8(&self, offset: usize) -> u8 {
        match self.get(offset, 1) {
            Some(b) => b[0],
            None => {
                self.err.set(true);
                0
            }
        }
    }

    #[inline]
    pub fn u16_le(&self, offset: usize) -> u16 {
        match self.get(offset, 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => {
                self.err.set(true);
                0
            }
        }
    }

    #[inline]
    pub fn u16_be(&self, offset: usize) -> u16 {
        match self.get(offset, 2) {
            Some(b) => u16::from_be_bytes([b[0], b[1]]),
            None => {
                self.err.set(true);
                0
            }
        }
    }

    #[inline]
    pub fn u32_le(&self, offset: usize) -> u32 {
        match self.get(offset, 4) {
            Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            None => {
                self.err.set(true);
                0
            }
        }
    }

    #[inline]
    pub fn u32_be(&self, offset: usize) -> u32 {
        match self.get(offset, 4) {
            Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            None => {
                self.err.set(true);
                0
            }
        }
    }

    #[inline]
    pub fn u64_le(&self, offset: usize) -> u64 {
        match self.get(offset, 8) {
            Some(b) => u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
            None => {
                self.err.set(true);
                0
            }
        }
    }

    #[inline]
    pub fn f32_le(&self, offset: usize) -> f32 {
        f32::from_bits(self.u32_le(offset))
    }

    #[inline]
    pub fn f64_le(&self, offset: usize) -> f64 {
        f64::from_bits(self.u64_le(offset))
    }

    /// true if the view is byte-for-byte equal to `expected`
    #[inline]
    pub fn match_exact(&self, expected: &[u8]) -> bool {
        self.data == expected
    }

    /// true if the view equals the bytes of `expected` (no terminator)
    #[inline]
    pub fn match_str(&self, expected: &str) -> bool {
        self.data == expected.as_bytes()
    }

    /// copy up to `dst.len()` bytes out; returns false (and latches) on a
    /// short source
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) -> bool {
        match self.get(offset, dst.len()) {
            Some(src) => {
                dst.copy_from_slice(src);
                true
            }
            None => {
                self.err.set(true);
                false
            }
        }
    }
}

/// non-owning write view with the same clamp-and-latch discipline
#[derive(Debug)]
pub struct SliceMut<'a> {
    data: &'a mut [u8],
    err: bool,
}

impl<'a> SliceMut<'a> {
    #[inline(always)]
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, err: false }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline(always)]
    pub fn has_error(&self) -> bool {
        self.err
    }

    #[inline(always)]
    pub fn set_error(&mut self) {
        self.err = true;
    }

    fn put(&mut self, offset: usize, src: &[u8]) {
        let end = match offset.checked_add(src.len()) {
            Some(end) if end <= self.data.len() => end,
            _ => {
                self.err = true;
                return;
            }
        };
        self.data[offset..end].copy_from_slice(src);
    }

    #[inline]
    pub fn set_u8(&mut self, offset: usize, v: u8) {
        self.put(offset, &[v]);
    }

    #[inline]
    pub fn set_u16_le(&mut self, offset: usize, v: u16) {
        self.put(offset, &v.to_le_bytes());
    }

    #[inline]
    pub fn set_u16_be(&mut self, offset: usize, v: u16) {
        self.put(offset, &v.to_be_bytes());
    }

    #[inline]
    pub fn set_u32_le(&mut self, offset: usize, v: u32) {
        self.put(offset, &v.to_le_bytes());
    }

    #[inline]
    pub fn set_u32_be(&mut self, offset: usize, v: u32) {
        self.put(offset, &v.to_be_bytes());
    }

    #[inline]
    pub fn set_u64_le(&mut self, offset: usize, v: u64) {
        self.put(offset, &v.to_le_bytes());
    }

    #[inline]
    pub fn set_f32_le(&mut self, offset: usize, v: f32) {
        self.set_u32_le(offset, v.to_bits());
    }

    #[inline]
    pub fn set_f64_le(&mut self, offset: usize, v: f64) {
        self.set_u64_le(offset, v.to_bits());
    }

    /// copy `src` in at `offset`; false (and latched) if it does not fit
    pub fn copy_in(&mut self, offset: usize, src: &[u8]) -> bool {
        let fits = offset
            .checked_add(src.len())
            .map(|end| end <= self.data.len())
            .unwrap_or(false);
        if !fits {
            self.err = true;
            return false;
        }
        self.put(offset, src);
        true
    }
}

/// format bytes as an offset-prefixed hex dump for trace logs
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}:", i * 16);
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_accessors() {
        let mut buf = [0u8; 32];
        let mut w = SliceMut::new(&mut buf);
        w.set_u8(0, 0xAB);
        w.set_u16_le(1, 0x1234);
        w.set_u32_le(3, 0xDEADBEEF);
        w.set_u64_le(7, 0x0102030405060708);
        w.set_f32_le(15, 3.5);
        w.set_f64_le(19, -2.25);
        w.set_u16_be(27, 0x1234);
        assert!(!w.has_error());

        let r = Slice::new(&buf);
        assert_eq!(r.u8(0), 0xAB);
        assert_eq!(r.u16_le(1), 0x1234);
        assert_eq!(r.u32_le(3), 0xDEADBEEF);
        assert_eq!(r.u64_le(7), 0x0102030405060708);
        assert_eq!(r.f32_le(15), 3.5);
        assert_eq!(r.f64_le(19), -2.25);
        assert_eq!(r.u16_be(27), 0x1234);
        assert!(!r.has_error());
    }

    #[test]
    fn test_out_of_range_latches() {
        let buf = [1u8, 2, 3];
        let r = Slice::new(&buf);
        assert_eq!(r.u32_le(1), 0);
        assert!(r.has_error());
        // error stays latched through further valid reads
        assert_eq!(r.u8(0), 1);
        assert!(r.has_error());
    }

    #[test]
    fn test_write_out_of_range_latches() {
        let mut buf = [0u8; 2];
        let mut w = SliceMut::new(&mut buf);
        w.set_u32_le(1, 7);
        assert!(w.has_error());
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn test_sub_views() {
        let buf = [0u8, 1, 2, 3, 4, 5];
        let r = Slice::new(&buf);
        let s = r.sub(2, 3);
        assert_eq!(s.bytes(), &[2, 3, 4]);
        assert!(!s.has_error());

        let bad = r.sub(4, 10);
        assert!(bad.has_error());
        assert_eq!(bad.len(), 0);
        assert!(r.has_error());
    }

    #[test]
    fn test_match_and_copy() {
        let buf = [0x20u8, 0x06, 0x24, 0x01];
        let r = Slice::new(&buf);
        assert!(r.match_exact(&[0x20, 0x06, 0x24, 0x01]));
        assert!(!r.match_exact(&[0x20, 0x06]));

        let mut out = [0u8; 2];
        assert!(r.copy_out(1, &mut out));
        assert_eq!(out, [0x06, 0x24]);
        let mut big = [0u8; 8];
        assert!(!r.copy_out(0, &mut big));
        assert!(r.has_error());
    }

    #[test]
    fn test_hex_dump() {
        let dump = hex_dump(&[0xDE, 0xAD]);
        assert_eq!(dump, "0000: de ad\n");
    }
}
