//! Fixed-width, byte-order independent encoding shared by every message
//! that crosses the control connection.
//!
//! Integers are written least-significant byte first and occupy exactly the
//! width the caller asks for: wider values are truncated on encode and
//! narrower fields are zero-extended on decode. Strings are fixed-size
//! fields padded with NUL bytes, with no length prefix. Both peers must
//! agree on the layout, which version negotiation guarantees.

use crate::error::{Error, Result};

pub const U16: usize = 2;
pub const U32: usize = 4;
pub const U64: usize = 8;

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn encode_uint(&mut self, value: u64, width: usize) {
        debug_assert!(width <= U64, "integer fields are at most 8 bytes");
        self.buf.extend_from_slice(&value.to_le_bytes()[..width]);
    }

    /// Copies `data` into a field of exactly `n` bytes, truncating or
    /// padding with zeros.
    pub fn encode_bytes(&mut self, data: &[u8], n: usize) {
        let len = data.len().min(n);
        self.buf.extend_from_slice(&data[..len]);
        self.buf.resize(self.buf.len() + (n - len), 0);
    }

    pub fn encode_str(&mut self, s: &str, n: usize) {
        self.encode_bytes(s.as_bytes(), n);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn decode_uint(&mut self, width: usize) -> Result<u64> {
        debug_assert!(width <= U64, "integer fields are at most 8 bytes");
        let bytes = self.decode_bytes(width)?;
        let mut raw = [0u8; U64];
        raw[..width].copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn decode_u16(&mut self) -> Result<u16> {
        Ok(self.decode_uint(U16)? as u16)
    }

    pub fn decode_u32(&mut self) -> Result<u32> {
        Ok(self.decode_uint(U32)? as u32)
    }

    pub fn decode_u64(&mut self) -> Result<u64> {
        self.decode_uint(U64)
    }

    pub fn decode_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(Error::Internal(format!(
                "decoding {n} bytes at offset {} overruns a {} byte message",
                self.pos,
                self.buf.len()
            )));
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Reads a fixed-size string field, stopping at the first NUL.
    pub fn decode_str(&mut self, n: usize) -> Result<String> {
        let bytes = self.decode_bytes(n)?;
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(value: u64, width: usize) -> u64 {
        let mut enc = Encoder::default();
        enc.encode_uint(value, width);
        let buf = enc.finish();
        assert_eq!(buf.len(), width);
        Decoder::new(&buf).decode_uint(width).unwrap()
    }

    proptest! {
        #[test]
        fn representable_values_round_trip(value in any::<u64>(), width in prop::sample::select(vec![1usize, 2, 4, 8])) {
            let value = if width == U64 { value } else { value & ((1u64 << (width * 8)) - 1) };
            prop_assert_eq!(round_trip(value, width), value);
        }

        #[test]
        fn wide_values_keep_low_bytes(value in any::<u64>(), width in prop::sample::select(vec![1usize, 2, 4])) {
            let mask = (1u64 << (width * 8)) - 1;
            prop_assert_eq!(round_trip(value, width), value & mask);
        }
    }

    #[test]
    fn least_significant_byte_first() {
        let mut enc = Encoder::default();
        enc.encode_uint(0x0102_0304, U32);
        assert_eq!(enc.finish(), vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn truncates_to_width() {
        assert_eq!(round_trip(0x1_0000_00ff, U32), 0xff);
        assert_eq!(round_trip(0x1234, 1), 0x34);
    }

    #[test]
    fn strings_are_padded_and_truncated() {
        let mut enc = Encoder::default();
        enc.encode_str("mlx5_0:1", 16);
        enc.encode_str("a-much-longer-string", 4);
        let buf = enc.finish();
        assert_eq!(buf.len(), 20);

        let mut dec = Decoder::new(&buf);
        assert_eq!(dec.decode_str(16).unwrap(), "mlx5_0:1");
        assert_eq!(dec.decode_str(4).unwrap(), "a-mu");
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn overrun_is_reported() {
        let mut dec = Decoder::new(&[1, 2, 3]);
        assert_eq!(dec.decode_u16().unwrap(), 0x0201);
        assert!(dec.decode_u32().unwrap_err().is_internal());
    }
}
