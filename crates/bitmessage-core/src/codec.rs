//! Wire codec: varint, varstring, varbytes, and a byte-counted reader.
//!
//! Encoding rules (Bitmessage wire protocol): a value below 0xFD is written
//! as a single byte; values up to 0xFFFF are written as `0xFD` followed by a
//! big-endian `u16`; values up to 0xFFFF_FFFF as `0xFE` followed by a
//! big-endian `u32`; larger values as `0xFF` followed by a big-endian `u64`.
//!
//! Reads accept non-minimal encodings (a `u16`-width value spelled out as a
//! `u64`, say); only writes are required to be minimal. This matches the
//! reference implementation and is recorded as a deliberate leniency rather
//! than an oversight.

use crate::error::{Error, Result};

/// A cursor over a byte slice that tracks how many bytes remain, so
/// length-prefixed substructures can be bounded without over-reading.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::MalformedWire(format!(
                "need {n} bytes, have {}",
                self.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a varint. Non-minimal encodings are accepted.
    pub fn read_varint(&mut self) -> Result<u64> {
        let tag = self.read_u8()?;
        match tag {
            0xFD => Ok(self.read_u16()? as u64),
            0xFE => Ok(self.read_u32()? as u64),
            0xFF => self.read_u64(),
            n => Ok(n as u64),
        }
    }

    /// Read a varint and require it to fit in `usize`, for use as a length.
    pub fn read_varint_usize(&mut self) -> Result<usize> {
        let v = self.read_varint()?;
        usize::try_from(v).map_err(|_| Error::MalformedWire("varint exceeds usize".into()))
    }

    pub fn read_varbytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint_usize()?;
        self.read_bytes(len)
    }

    pub fn read_varbytes_owned(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_varbytes()?.to_vec())
    }

    pub fn read_varstring(&mut self) -> Result<String> {
        let bytes = self.read_varbytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::MalformedWire(format!("invalid utf-8 varstring: {e}")))
    }

    /// Read a varint count followed by that many varints.
    pub fn read_var_int_list(&mut self) -> Result<Vec<u64>> {
        let count = self.read_varint_usize()?;
        let mut out = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            out.push(self.read_varint()?);
        }
        Ok(out)
    }
}

/// Write a varint using the minimal encoding.
pub fn write_varint(out: &mut Vec<u8>, v: u64) {
    if v < 0xFD {
        out.push(v as u8);
    } else if v <= 0xFFFF {
        out.push(0xFD);
        out.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= 0xFFFF_FFFF {
        out.push(0xFE);
        out.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

pub fn write_varbytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub fn write_varstring(out: &mut Vec<u8>, s: &str) {
    write_varbytes(out, s.as_bytes());
}

pub fn write_var_int_list(out: &mut Vec<u8>, values: &[u64]) {
    write_varint(out, values.len() as u64);
    for v in values {
        write_varint(out, *v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip_minimal() {
        for v in [0u64, 1, 0xFC, 0xFD, 0xFFFF, 0x10000, 0xFFFF_FFFF, 0x1_0000_0000, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let mut r = WireReader::new(&buf);
            assert_eq!(r.read_varint().unwrap(), v);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn varint_write_length_is_minimal() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 252);
        assert_eq!(buf.len(), 1);
        let mut buf = Vec::new();
        write_varint(&mut buf, 253);
        assert_eq!(buf.len(), 3);
        let mut buf = Vec::new();
        write_varint(&mut buf, 0x1_0000);
        assert_eq!(buf.len(), 5);
        let mut buf = Vec::new();
        write_varint(&mut buf, 0x1_0000_0000);
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn reader_accepts_non_minimal_encoding() {
        // 0xFF-tagged encoding of the value 5, which could have been a single byte.
        let mut buf = vec![0xFF];
        buf.extend_from_slice(&5u64.to_be_bytes());
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_varint().unwrap(), 5);
    }

    #[test]
    fn varbytes_roundtrip() {
        let mut buf = Vec::new();
        write_varbytes(&mut buf, b"hello bitmessage");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_varbytes().unwrap(), b"hello bitmessage");
    }

    #[test]
    fn varstring_roundtrip() {
        let mut buf = Vec::new();
        write_varstring(&mut buf, "/PyBitmessage:0.6.3/");
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_varstring().unwrap(), "/PyBitmessage:0.6.3/");
    }

    #[test]
    fn truncated_buffer_is_malformed() {
        let buf = [0xFDu8, 0x01]; // claims a u16 follows but only one byte given
        let mut r = WireReader::new(&buf);
        assert!(r.read_varint().is_err());
    }

    #[test]
    fn var_int_list_roundtrip() {
        let mut buf = Vec::new();
        write_var_int_list(&mut buf, &[1, 2, 3, 1_000_000]);
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_var_int_list().unwrap(), vec![1, 2, 3, 1_000_000]);
    }
}
