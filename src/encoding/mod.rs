// Portable fixed-width binary fields.
//
// Everything an index stores is an unsigned integer, an "offset" whose width
// (4 or 8 bytes) is declared once in the header, or a NUL-padded string of a
// fixed width. Integers are written in one canonical byte order (big-endian)
// regardless of host; a reader that detects a file written in the opposite
// order decodes it with `ByteOrder::Little` instead.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    /// The order every index is written in.
    pub const CANONICAL: ByteOrder = ByteOrder::Big;

    pub fn reversed(self) -> ByteOrder {
        match self {
            ByteOrder::Big => ByteOrder::Little,
            ByteOrder::Little => ByteOrder::Big,
        }
    }
}

/// Width of a stored file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetWidth {
    Four,
    Eight,
}

impl OffsetWidth {
    pub fn from_bytes(n: u32) -> Option<Self> {
        match n {
            4 => Some(OffsetWidth::Four),
            8 => Some(OffsetWidth::Eight),
            _ => None,
        }
    }

    pub fn bytes(self) -> u8 {
        match self {
            OffsetWidth::Four => 4,
            OffsetWidth::Eight => 8,
        }
    }

    pub fn max_value(self) -> u64 {
        match self {
            OffsetWidth::Four => u32::MAX as u64,
            OffsetWidth::Eight => u64::MAX,
        }
    }

    /// The narrowest width able to hold `value`.
    pub fn for_value(value: u64) -> Self {
        if value > u32::MAX as u64 {
            OffsetWidth::Eight
        } else {
            OffsetWidth::Four
        }
    }

    fn check(self, value: u64) -> Result<()> {
        if value > self.max_value() {
            return Err(Error::RangeUnsupported {
                value,
                width: self.bytes(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RecordWriter {
    pub(crate) buf: Vec<u8>,
    order: ByteOrder,
    offset_width: OffsetWidth,
}

impl RecordWriter {
    pub fn new(offset_width: OffsetWidth) -> Self {
        Self::with_order(ByteOrder::CANONICAL, offset_width)
    }

    pub fn with_order(order: ByteOrder, offset_width: OffsetWidth) -> Self {
        RecordWriter {
            buf: Vec::with_capacity(1024),
            order,
            offset_width,
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u16(&mut self, v: u16) {
        match self.order {
            ByteOrder::Big => self.buf.extend(v.to_be_bytes()),
            ByteOrder::Little => self.buf.extend(v.to_le_bytes()),
        }
    }

    pub fn write_u32(&mut self, v: u32) {
        match self.order {
            ByteOrder::Big => self.buf.extend(v.to_be_bytes()),
            ByteOrder::Little => self.buf.extend(v.to_le_bytes()),
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        match self.order {
            ByteOrder::Big => self.buf.extend(v.to_be_bytes()),
            ByteOrder::Little => self.buf.extend(v.to_le_bytes()),
        }
    }

    /// Writes `v` at the declared offset width. Fails rather than truncate.
    pub fn write_offset(&mut self, v: u64) -> Result<()> {
        self.offset_width.check(v)?;
        match self.offset_width {
            OffsetWidth::Four => self.write_u32(v as u32),
            OffsetWidth::Eight => self.write_u64(v),
        }
        Ok(())
    }

    /// Writes `s` NUL-padded to exactly `width` bytes. The string must leave
    /// room for at least one terminating NUL.
    pub fn write_padded(&mut self, s: &str, width: usize) -> Result<()> {
        if s.len() >= width {
            return Err(Error::Format(format!(
                "{:?} does not fit a {}-byte field",
                s, width
            )));
        }
        self.buf.extend(s.as_bytes());
        self.buf.resize(self.buf.len() + width - s.len(), 0);
        Ok(())
    }
}

/// A cursor over one fixed-size record's bytes.
pub struct RecordReader<'a> {
    data: &'a [u8],
    idx: usize,
    order: ByteOrder,
    stored: OffsetWidth,
    native: OffsetWidth,
}

impl<'a> RecordReader<'a> {
    pub fn new(data: &'a [u8], order: ByteOrder, stored: OffsetWidth, native: OffsetWidth) -> Self {
        RecordReader {
            data,
            idx: 0,
            order,
            stored,
            native,
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.idx < n {
            return Err(Error::Format(format!(
                "record truncated: wanted {} bytes at {}, have {}",
                n,
                self.idx,
                self.data.len()
            )));
        }
        self.idx += n;
        Ok(&self.data[(self.idx - n)..self.idx])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take::<2>()?;
        Ok(match self.order {
            ByteOrder::Big => u16::from_be_bytes(b),
            ByteOrder::Little => u16::from_le_bytes(b),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take::<4>()?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(b),
            ByteOrder::Little => u32::from_le_bytes(b),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take::<8>()?;
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(b),
            ByteOrder::Little => u64::from_le_bytes(b),
        })
    }

    /// Reads an offset stored at the file's width. A value the reader's
    /// native width cannot hold is an error, never a truncation.
    pub fn read_offset(&mut self) -> Result<u64> {
        let v = match self.stored {
            OffsetWidth::Four => self.read_u32()? as u64,
            OffsetWidth::Eight => self.read_u64()?,
        };
        self.native.check(v)?;
        Ok(v)
    }

    /// Reads a `width`-byte padded field, trimmed at the first NUL.
    pub fn read_padded(&mut self, width: usize) -> Result<&'a [u8]> {
        let raw = self.read_bytes(width)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(&raw[..end])
    }

    pub fn read_string(&mut self, width: usize) -> Result<String> {
        let raw = self.read_padded(width)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Format("stored string is not valid UTF-8".to_owned()))
    }

    pub fn at_end(&self) -> bool {
        self.idx >= self.data.len()
    }
}

#[cfg(test)]
mod test {
    use super::{ByteOrder, OffsetWidth, RecordReader, RecordWriter};
    use crate::error::Error;

    #[test]
    fn test_canonical_order_is_big_endian() {
        let mut w = RecordWriter::new(OffsetWidth::Four);
        w.write_u16(0x0102);
        w.write_u32(0x03040506);
        w.write_offset(0x0708090a).unwrap();
        assert_eq!(
            w.as_bytes(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a]
        );
    }

    #[test]
    fn test_reversed_order_reads_back() {
        let mut w = RecordWriter::with_order(ByteOrder::Little, OffsetWidth::Eight);
        w.write_u16(7);
        w.write_u32(0xdeadbeef);
        w.write_u64(1 << 40);
        w.write_offset(12345).unwrap();

        let mut r = RecordReader::new(
            w.as_bytes(),
            ByteOrder::Big.reversed(),
            OffsetWidth::Eight,
            OffsetWidth::Eight,
        );
        assert_eq!(r.read_u16().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(r.read_u64().unwrap(), 1 << 40);
        assert_eq!(r.read_offset().unwrap(), 12345);
        assert!(r.at_end());
    }

    #[test]
    fn test_narrow_reader_rejects_wide_offset() {
        let mut w = RecordWriter::new(OffsetWidth::Eight);
        w.write_offset(u32::MAX as u64).unwrap();
        w.write_offset(u32::MAX as u64 + 1).unwrap();

        let mut r = RecordReader::new(
            w.as_bytes(),
            ByteOrder::Big,
            OffsetWidth::Eight,
            OffsetWidth::Four,
        );
        assert_eq!(r.read_offset().unwrap(), u32::MAX as u64);
        match r.read_offset() {
            Err(Error::RangeUnsupported { value, width }) => {
                assert_eq!(value, u32::MAX as u64 + 1);
                assert_eq!(width, 4);
            }
            other => panic!("expected RangeUnsupported, got {:?}", other),
        }
    }

    #[test]
    fn test_width_for_value() {
        assert_eq!(OffsetWidth::for_value(0), OffsetWidth::Four);
        assert_eq!(OffsetWidth::for_value(u32::MAX as u64), OffsetWidth::Four);
        assert_eq!(OffsetWidth::for_value(u32::MAX as u64 + 1), OffsetWidth::Eight);
    }

    #[test]
    fn test_narrow_writer_refuses_to_truncate() {
        let mut w = RecordWriter::new(OffsetWidth::Four);
        assert!(matches!(
            w.write_offset(1 << 33),
            Err(Error::RangeUnsupported { width: 4, .. })
        ));
    }

    #[test]
    fn test_padded_strings() {
        let mut w = RecordWriter::new(OffsetWidth::Four);
        w.write_padded("abc", 6).unwrap();
        w.write_padded("", 1).unwrap();
        assert!(w.write_padded("abcdef", 6).is_err());
        assert_eq!(w.as_bytes(), b"abc\0\0\0\0");

        let mut r = RecordReader::new(
            w.as_bytes(),
            ByteOrder::Big,
            OffsetWidth::Four,
            OffsetWidth::Eight,
        );
        assert_eq!(r.read_string(6).unwrap(), "abc");
        assert_eq!(r.read_padded(1).unwrap(), b"");
        assert!(matches!(r.read_u16(), Err(Error::Format(_))));
    }
}
