//! Bounds-checked binary codec for ATT PDUs.
//!
//! Every multi-byte field in ATT is little-endian. All PDU parsing and
//! serialization in this crate goes through [`Cursor`] and [`Writer`] so that
//! offset arithmetic lives in exactly one place.

use byteorder::{ByteOrder, LittleEndian};

use super::error::{AttError, AttResult};
use crate::uuid::Uuid;

/// A read cursor over a received PDU body. Every read is bounds-checked and
/// fails with [`AttError::Truncated`] instead of panicking.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, wanted: usize) -> AttResult<()> {
        if self.remaining() < wanted {
            Err(AttError::Truncated {
                wanted,
                remaining: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> AttResult<u8> {
        self.need(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> AttResult<u16> {
        self.need(2)?;
        let value = LittleEndian::read_u16(&self.buf[self.pos..]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> AttResult<u32> {
        self.need(4)?;
        let value = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(value)
    }

    /// Reads exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> AttResult<&'a [u8]> {
        self.need(len)?;
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Consumes whatever is left, possibly empty.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Reads a 16-bit UUID in wire form.
    pub fn read_uuid16(&mut self) -> AttResult<Uuid> {
        Ok(Uuid::from_u16(self.read_u16()?))
    }

    /// Reads a 128-bit UUID in wire form.
    pub fn read_uuid128(&mut self) -> AttResult<Uuid> {
        let bytes = self.read_bytes(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes_le(raw))
    }

    /// Reads a UUID whose width is inferred from the remaining length
    /// (2 or 16 bytes). Used by requests that end with a trailing type field.
    pub fn read_uuid_rest(&mut self) -> AttResult<Uuid> {
        match self.remaining() {
            2 => self.read_uuid16(),
            16 => self.read_uuid128(),
            _ => Err(AttError::Malformed("UUID field must be 2 or 16 bytes")),
        }
    }
}

/// A write cursor building an outbound PDU.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Writer {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_slice(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a UUID in its shortest wire form.
    pub fn write_uuid(&mut self, uuid: &Uuid) -> &mut Self {
        match uuid.as_u16() {
            Some(short) => self.write_u16(short),
            None => self.write_slice(uuid.as_bytes_le()),
        }
    }

    /// Writes a UUID widened to the full 128-bit wire form.
    pub fn write_uuid128(&mut self, uuid: &Uuid) -> &mut Self {
        self.write_slice(uuid.as_bytes_le())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_reads_in_order() {
        let data = [0x01, 0x34, 0x12, 0xAA, 0xBB, 0xCC];
        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.read_u8().unwrap(), 0x01);
        assert_eq!(cursor.read_u16().unwrap(), 0x1234);
        assert_eq!(cursor.read_bytes(2).unwrap(), &[0xAA, 0xBB]);
        assert_eq!(cursor.take_rest(), &[0xCC]);
        assert!(cursor.is_empty());
    }

    #[test]
    fn cursor_refuses_overrun() {
        let data = [0x01];
        let mut cursor = Cursor::new(&data);
        assert!(matches!(
            cursor.read_u16(),
            Err(AttError::Truncated {
                wanted: 2,
                remaining: 1
            })
        ));
        // The failed read must not consume anything.
        assert_eq!(cursor.read_u8().unwrap(), 0x01);
    }

    #[test]
    fn uuid_width_inference() {
        let short = [0x02, 0x29];
        let mut cursor = Cursor::new(&short);
        assert_eq!(cursor.read_uuid_rest().unwrap(), Uuid::from_u16(0x2902));

        let bad = [0x02, 0x29, 0x00];
        let mut cursor = Cursor::new(&bad);
        assert!(cursor.read_uuid_rest().is_err());
    }

    #[test]
    fn writer_round_trip() {
        let mut writer = Writer::new();
        writer
            .write_u8(0x0A)
            .write_u16(0x0005)
            .write_uuid(&Uuid::from_u16(0x2A00));
        let out = writer.into_inner();
        assert_eq!(out, vec![0x0A, 0x05, 0x00, 0x00, 0x2A]);
    }
}
