pub mod reader;
pub mod writer;

#[cfg(test)]
mod lookup_test;

// This package provides facilities to both read and write SSI indexes.
//
// An SSI index maps names to locations of records in large flat files. It is
// built once, offline, and is immutable afterwards; readers answer lookups by
// binary search directly against the file, without loading the key tables.
//
// Physically, an index is a header followed by three flat arrays of
// fixed-size records:
//
//     [header]
//     [file record] * num_files
//     [primary key record] * num_primary      sorted by key bytes
//     [alias record] * num_secondary          sorted by alias bytes
//
// Every string field is NUL-padded to the longest string of its kind plus one,
// so record `i` of a section lives at `section_offset + record_size * i`.
// Integers are big-endian. File offsets are stored at one width, 4 or 8
// bytes, declared in the header; the builder picks 4 unless some value needs
// more.
//
// Header:
//     magic u32 | flags u32 | offset width u32 | num_files u16 |
//     num_primary u64 | num_secondary u64 |
//     filename width u32 | key width u32 | alias width u32 |
//     file record size u32 | primary record size u32 | alias record size u32 |
//     file offset | primary offset | alias offset
//
// File record:    name | format u32 | flags u32 | bytes/line u32 | elements/line u32
// Primary record: key | handle u16 | record offset | data offset | length u64
// Alias record:   alias | target primary key
//
// Record sizes are stored rather than derived so that a reader strides by
// what the file says, even if a later writer appends fields.

use std::io::Read;

use crate::{
    encoding::{ByteOrder, OffsetWidth, RecordReader, RecordWriter},
    error::{Error, Result},
};

/// "ssi3" with the high bit set on every byte.
pub const MAGIC: u32 = 0xd3d3c9b3;
/// `MAGIC` as seen by a reader of the opposite byte order.
pub const MAGIC_SWAPPED: u32 = 0xb3c9d3d3;

/// File flag: every non-terminal data line has the same byte and element
/// counts, so internal positions can be computed.
pub const FLAG_FAST_SUBRANGE: u32 = 1 << 0;

/// File handles are u16, and the top bit has always been left clear.
pub const MAX_FILES: u16 = 32767;
pub const MAX_KEYS: u64 = i32::MAX as u64;

const FIXED_HEADER_BYTES: u64 = 9 * 4 + 2 * 8 + 2;
// magic, flags and offset width: enough to know how to read the rest.
const HEADER_PREFIX_BYTES: usize = 12;

pub type FileHandle = u16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub flags: u32,
    pub offset_width: OffsetWidth,
    pub num_files: u16,
    pub num_primary: u64,
    pub num_secondary: u64,
    pub filename_width: u32,
    pub key_width: u32,
    pub alias_width: u32,
    pub file_record_size: u32,
    pub primary_record_size: u32,
    pub alias_record_size: u32,
    pub file_offset: u64,
    pub primary_offset: u64,
    pub alias_offset: u64,
}

pub fn header_size(offset_width: OffsetWidth) -> u64 {
    FIXED_HEADER_BYTES + 3 * offset_width.bytes() as u64
}

pub fn file_record_size(filename_width: u32) -> u32 {
    filename_width + 16
}

pub fn primary_record_size(key_width: u32, offset_width: OffsetWidth) -> u32 {
    key_width + 2 + 2 * offset_width.bytes() as u32 + 8
}

pub fn alias_record_size(alias_width: u32, key_width: u32) -> u32 {
    alias_width + key_width
}

impl IndexHeader {
    /// Lays out a new index: record sizes follow from the field widths, and
    /// sections are packed back to back after the header.
    pub fn new(
        offset_width: OffsetWidth,
        num_files: u16,
        num_primary: u64,
        num_secondary: u64,
        filename_width: u32,
        key_width: u32,
        alias_width: u32,
    ) -> Self {
        let file_record_size = file_record_size(filename_width);
        let primary_record_size = primary_record_size(key_width, offset_width);
        let alias_record_size = alias_record_size(alias_width, key_width);

        let file_offset = header_size(offset_width);
        let primary_offset = file_offset + file_record_size as u64 * num_files as u64;
        let alias_offset = primary_offset + primary_record_size as u64 * num_primary;

        IndexHeader {
            flags: 0,
            offset_width,
            num_files,
            num_primary,
            num_secondary,
            filename_width,
            key_width,
            alias_width,
            file_record_size,
            primary_record_size,
            alias_record_size,
            file_offset,
            primary_offset,
            alias_offset,
        }
    }

    /// Byte just past the last section.
    pub fn end_offset(&self) -> u64 {
        self.alias_offset + self.alias_record_size as u64 * self.num_secondary
    }

    pub fn write_to(&self, w: &mut RecordWriter) -> Result<()> {
        w.write_u32(MAGIC);
        w.write_u32(self.flags);
        w.write_u32(self.offset_width.bytes() as u32);
        w.write_u16(self.num_files);
        w.write_u64(self.num_primary);
        w.write_u64(self.num_secondary);
        w.write_u32(self.filename_width);
        w.write_u32(self.key_width);
        w.write_u32(self.alias_width);
        w.write_u32(self.file_record_size);
        w.write_u32(self.primary_record_size);
        w.write_u32(self.alias_record_size);
        w.write_offset(self.file_offset)?;
        w.write_offset(self.primary_offset)?;
        w.write_offset(self.alias_offset)?;
        Ok(())
    }

    /// Reads a header, returning it along with the byte order the rest of
    /// the file must be decoded in.
    pub fn read_from<R: Read>(r: &mut R, native: OffsetWidth) -> Result<(Self, ByteOrder)> {
        let mut prefix = [0_u8; HEADER_PREFIX_BYTES];
        r.read_exact(&mut prefix)
            .map_err(|e| Error::Format(format!("failed to read index header: {}", e)))?;

        let order = match u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) {
            MAGIC => ByteOrder::CANONICAL,
            MAGIC_SWAPPED => ByteOrder::CANONICAL.reversed(),
            other => {
                return Err(Error::Format(format!(
                    "not an SSI index: bad magic {:#010x}",
                    other
                )))
            }
        };

        // The width isn't known yet, so the prefix is decoded at either.
        let mut pr = RecordReader::new(&prefix, order, OffsetWidth::Eight, native);
        pr.read_u32()?;
        let flags = pr.read_u32()?;
        let width_bytes = pr.read_u32()?;
        let offset_width = OffsetWidth::from_bytes(width_bytes).ok_or_else(|| {
            Error::Format(format!("offset width must be 4 or 8, got {}", width_bytes))
        })?;
        if offset_width > native {
            // Legal as long as every stored value fits; checked per read.
            tracing::debug!(
                stored = offset_width.bytes(),
                native = native.bytes(),
                "index uses offsets wider than the reader's"
            );
        }

        let rest_len = (header_size(offset_width) as usize) - HEADER_PREFIX_BYTES;
        let mut rest = vec![0_u8; rest_len];
        r.read_exact(&mut rest)
            .map_err(|e| Error::Format(format!("failed to read index header: {}", e)))?;
        let mut rr = RecordReader::new(&rest, order, offset_width, native);

        let header = IndexHeader {
            flags,
            offset_width,
            num_files: rr.read_u16()?,
            num_primary: rr.read_u64()?,
            num_secondary: rr.read_u64()?,
            filename_width: rr.read_u32()?,
            key_width: rr.read_u32()?,
            alias_width: rr.read_u32()?,
            file_record_size: rr.read_u32()?,
            primary_record_size: rr.read_u32()?,
            alias_record_size: rr.read_u32()?,
            file_offset: rr.read_offset()?,
            primary_offset: rr.read_offset()?,
            alias_offset: rr.read_offset()?,
        };
        Ok((header, order))
    }

    /// Checks that the sections are ordered, don't overlap, hold records at
    /// least as large as their fields, and fit within `file_len` bytes.
    pub fn validate(&self, file_len: u64) -> Result<()> {
        let format = |msg: String| Err(Error::Format(msg));

        if self.num_primary > MAX_KEYS || self.num_secondary > MAX_KEYS {
            return format(format!(
                "key counts {}/{} exceed the format limit",
                self.num_primary, self.num_secondary
            ));
        }
        if self.num_files > MAX_FILES {
            return format(format!("{} files exceed the format limit", self.num_files));
        }
        if self.num_primary > 0 && self.num_files == 0 {
            return format("index has keys but no files".to_owned());
        }
        if self.num_secondary > 0 && self.alias_width == 0 {
            return format("index has aliases but a zero alias width".to_owned());
        }
        if self.num_primary > 0 && self.key_width == 0 {
            return format("index has keys but a zero key width".to_owned());
        }
        if (self.file_record_size as u64) < file_record_size(self.filename_width) as u64
            || (self.primary_record_size as u64)
                < primary_record_size(self.key_width, self.offset_width) as u64
            || (self.alias_record_size as u64)
                < alias_record_size(self.alias_width, self.key_width) as u64
        {
            return format("record size smaller than its fields".to_owned());
        }

        let section_end = |start: u64, size: u32, count: u64| {
            (size as u64)
                .checked_mul(count)
                .and_then(|len| start.checked_add(len))
        };
        let files_end = section_end(self.file_offset, self.file_record_size, self.num_files as u64);
        let primary_end =
            section_end(self.primary_offset, self.primary_record_size, self.num_primary);
        let alias_end = section_end(self.alias_offset, self.alias_record_size, self.num_secondary);

        match (files_end, primary_end, alias_end) {
            (Some(files_end), Some(primary_end), Some(alias_end))
                if self.file_offset >= header_size(self.offset_width)
                    && self.primary_offset >= files_end
                    && self.alias_offset >= primary_end =>
            {
                if alias_end > file_len {
                    return format(format!(
                        "index truncated: sections end at {}, file is {} bytes",
                        alias_end, file_len
                    ));
                }
                Ok(())
            }
            _ => format("sections overlap or are out of order".to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub format: u32,
    pub flags: u32,
    pub bytes_per_line: u32,
    pub elements_per_line: u32,
}

impl FileEntry {
    pub fn fast_subrange(&self) -> bool {
        self.flags & FLAG_FAST_SUBRANGE != 0
    }

    pub fn write_to(&self, w: &mut RecordWriter, filename_width: u32) -> Result<()> {
        w.write_padded(&self.name, filename_width as usize)?;
        w.write_u32(self.format);
        w.write_u32(self.flags);
        w.write_u32(self.bytes_per_line);
        w.write_u32(self.elements_per_line);
        Ok(())
    }

    pub fn read_from(r: &mut RecordReader, filename_width: u32) -> Result<Self> {
        Ok(FileEntry {
            name: r.read_string(filename_width as usize)?,
            format: r.read_u32()?,
            flags: r.read_u32()?,
            bytes_per_line: r.read_u32()?,
            elements_per_line: r.read_u32()?,
        })
    }
}

/// Where a primary key's record lives. `data_offset` and `length` are 0 when
/// the builder's caller didn't know them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyRecord {
    pub key: String,
    pub handle: FileHandle,
    pub record_offset: u64,
    pub data_offset: u64,
    pub length: u64,
}

impl PrimaryKeyRecord {
    pub fn write_to(&self, w: &mut RecordWriter, key_width: u32) -> Result<()> {
        w.write_padded(&self.key, key_width as usize)?;
        w.write_u16(self.handle);
        w.write_offset(self.record_offset)?;
        w.write_offset(self.data_offset)?;
        w.write_u64(self.length);
        Ok(())
    }

    pub fn read_from(r: &mut RecordReader, key_width: u32) -> Result<Self> {
        Ok(PrimaryKeyRecord {
            key: r.read_string(key_width as usize)?,
            handle: r.read_u16()?,
            record_offset: r.read_offset()?,
            data_offset: r.read_offset()?,
            length: r.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryKeyRecord {
    pub alias: String,
    pub target: String,
}

impl SecondaryKeyRecord {
    pub fn write_to(&self, w: &mut RecordWriter, alias_width: u32, key_width: u32) -> Result<()> {
        w.write_padded(&self.alias, alias_width as usize)?;
        w.write_padded(&self.target, key_width as usize)?;
        Ok(())
    }

    pub fn read_from(r: &mut RecordReader, alias_width: u32, key_width: u32) -> Result<Self> {
        Ok(SecondaryKeyRecord {
            alias: r.read_string(alias_width as usize)?,
            target: r.read_string(key_width as usize)?,
        })
    }
}
