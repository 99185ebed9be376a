//! Little-endian byte codec shared by every persisted record.
//!
//! Writers append to any [`BufMut`]; [`Reader`] wraps a byte slice and turns
//! short reads into [`EncodingError`] instead of panicking the way the raw
//! [`Buf`] getters do.
//!
//! # Varints
//! ```text
//! n < 0xfd          1 byte
//! n <= 0xffff       0xfd || u16
//! n <= 0xffff_ffff  0xfe || u32
//! otherwise         0xff || u64
//! ```

use bytes::{Buf, BufMut};

use crate::error::EncodingError;
use crate::types::Hash256;

/// Maximum length accepted for a length-prefixed field.
pub const MAX_VAR_LEN: u64 = 32 * 1024 * 1024;

/// Checked reader over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Unread bytes, without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    pub fn advance(&mut self, n: usize) -> Result<(), EncodingError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    fn need(&self, n: usize) -> Result<(), EncodingError> {
        if self.buf.remaining() < n {
            return Err(EncodingError::UnexpectedEof {
                needed: n,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodingError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, EncodingError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(EncodingError::Invalid(format!("bad flag byte {b}"))),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, EncodingError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, EncodingError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u32_be(&mut self) -> Result<u32, EncodingError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64, EncodingError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, EncodingError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_hash(&mut self) -> Result<Hash256, EncodingError> {
        Ok(Hash256(self.read_array::<32>()?))
    }

    pub fn read_varint(&mut self) -> Result<u64, EncodingError> {
        let n = match self.read_u8()? {
            0xff => self.read_u64()?,
            0xfe => u64::from(self.read_u32()?),
            0xfd => u64::from(self.read_u16()?),
            b => u64::from(b),
        };
        Ok(n)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, EncodingError> {
        let len = self.read_varint()?;
        if len > MAX_VAR_LEN {
            return Err(EncodingError::Invalid(format!("length {len} too large")));
        }
        Ok(self.read_bytes(len as usize)?.to_vec())
    }

    pub fn read_var_str(&mut self) -> Result<String, EncodingError> {
        String::from_utf8(self.read_var_bytes()?)
            .map_err(|e| EncodingError::Invalid(e.to_string()))
    }

    /// Fail if any bytes are left unread.
    pub fn finish(self) -> Result<(), EncodingError> {
        if !self.buf.is_empty() {
            return Err(EncodingError::TrailingBytes(self.buf.len()));
        }
        Ok(())
    }
}

pub fn varint_size(n: u64) -> usize {
    match n {
        0..0xfd => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn put_varint<B: BufMut>(out: &mut B, n: u64) {
    match n {
        0..0xfd => out.put_u8(n as u8),
        0xfd..=0xffff => {
            out.put_u8(0xfd);
            out.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            out.put_u8(0xfe);
            out.put_u32_le(n as u32);
        }
        _ => {
            out.put_u8(0xff);
            out.put_u64_le(n);
        }
    }
}

pub fn put_var_bytes<B: BufMut>(out: &mut B, data: &[u8]) {
    put_varint(out, data.len() as u64);
    out.put_slice(data);
}

pub fn put_var_str<B: BufMut>(out: &mut B, s: &str) {
    put_var_bytes(out, s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_boundaries() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, 0x1_0000_0000] {
            let mut out = Vec::new();
            put_varint(&mut out, n);
            assert_eq!(out.len(), varint_size(n), "size of {n}");
            let mut r = Reader::new(&out);
            assert_eq!(r.read_varint().unwrap(), n);
            r.finish().unwrap();
        }
    }

    #[test]
    fn short_read_is_error() {
        let mut r = Reader::new(&[1, 2, 3]);
        assert_eq!(
            r.read_u32(),
            Err(EncodingError::UnexpectedEof {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn var_str_roundtrip_and_trailing() {
        let mut out = Vec::new();
        put_var_str(&mut out, "default");
        out.push(0);
        let mut r = Reader::new(&out);
        assert_eq!(r.read_var_str().unwrap(), "default");
        assert_eq!(r.finish(), Err(EncodingError::TrailingBytes(1)));
    }

    #[test]
    fn bad_bool_rejected() {
        let mut r = Reader::new(&[2]);
        assert!(r.read_bool().is_err());
    }

    #[test]
    fn big_endian_u32() {
        let mut r = Reader::new(&[0, 0, 1, 0]);
        assert_eq!(r.read_u32_be().unwrap(), 256);
    }
}
