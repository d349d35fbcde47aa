use std::{
    cmp::Ordering,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use super::{FileEntry, FileHandle, IndexHeader, PrimaryKeyRecord, SecondaryKeyRecord};
use crate::{
    encoding::{ByteOrder, OffsetWidth, RecordReader},
    error::{Error, Result},
};

/// Where to start reading to reach a position inside a record's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubrangeOffset {
    pub handle: FileHandle,
    pub record_offset: u64,
    /// `None` when the index has no data offset for the record; the caller
    /// has to parse from `record_offset`.
    pub data_offset: Option<u64>,
    pub length: u64,
    /// The position `data_offset` actually lands on, which may be earlier
    /// than the one asked for. Never later.
    pub actual_position: u64,
}

// A sorted key section: where it starts and how its records are laid out.
#[derive(Debug, Clone, Copy)]
struct Section {
    offset: u64,
    record_size: u32,
    count: u64,
    key_width: u32,
}

impl Section {
    fn record(&self, i: u64) -> u64 {
        self.offset + self.record_size as u64 * i
    }
}

/// Answers lookups against an open index. Key sections are never loaded;
/// every lookup seeks straight to the records it compares.
#[derive(Debug)]
pub struct IndexReader<R: Read + Seek> {
    r: R,
    header: IndexHeader,
    order: ByteOrder,
    native: OffsetWidth,
    files: Vec<FileEntry>,
    buf: Vec<u8>,
}

impl IndexReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_width(path, OffsetWidth::Eight)
    }

    /// Opens as a reader whose offsets are `native` bytes wide. Stored values
    /// that don't fit are reported as `RangeUnsupported` when read.
    pub fn open_with_width<P: AsRef<Path>>(path: P, native: OffsetWidth) -> Result<Self> {
        Self::from_reader_with_width(File::open(path)?, native)
    }
}

impl<R: Read + Seek> IndexReader<R> {
    pub fn from_reader(r: R) -> Result<Self> {
        Self::from_reader_with_width(r, OffsetWidth::Eight)
    }

    pub fn from_reader_with_width(mut r: R, native: OffsetWidth) -> Result<Self> {
        let file_len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(0))?;

        let (header, order) = IndexHeader::read_from(&mut r, native)?;
        header.validate(file_len)?;

        let mut reader = IndexReader {
            r,
            header,
            order,
            native,
            files: Vec::new(),
            buf: Vec::with_capacity(1024),
        };
        reader.load_files()?;
        Ok(reader)
    }

    fn load_files(&mut self) -> Result<()> {
        let size = self.header.file_record_size as usize;
        let count = self.header.num_files as usize;
        self.read_at(self.header.file_offset, size * count)?;

        let mut files = Vec::with_capacity(count);
        for chunk in self.buf.chunks_exact(size.max(1)).take(count) {
            let mut r = RecordReader::new(chunk, self.order, self.header.offset_width, self.native);
            files.push(FileEntry::read_from(&mut r, self.header.filename_width)?);
        }
        self.files = files;
        Ok(())
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// The byte order the file was found to be written in.
    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    pub fn num_files(&self) -> u16 {
        self.header.num_files
    }

    pub fn num_primary(&self) -> u64 {
        self.header.num_primary
    }

    pub fn num_secondary(&self) -> u64 {
        self.header.num_secondary
    }

    pub fn file_info(&self, handle: FileHandle) -> Result<&FileEntry> {
        self.files
            .get(handle as usize)
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Looks `key` up as a primary key, then as an alias. An alias resolves
    /// to the record of its target.
    pub fn find_by_name(&mut self, key: &str) -> Result<PrimaryKeyRecord> {
        let primary = self.primary_section();
        if let Some(i) = self.search(primary, key.as_bytes())? {
            return self.primary_at(i);
        }

        if let Some(i) = self.search(self.alias_section(), key.as_bytes())? {
            let alias = self.alias_at(i)?;
            return match self.search(primary, alias.target.as_bytes())? {
                Some(j) => self.primary_at(j),
                None => Err(Error::Format(format!(
                    "alias {:?} points at missing primary key {:?}",
                    alias.alias, alias.target
                ))),
            };
        }

        Err(Error::NotFound(key.to_owned()))
    }

    /// The `i`th primary key in sorted order.
    pub fn find_by_ordinal(&mut self, i: u64) -> Result<PrimaryKeyRecord> {
        if i >= self.header.num_primary {
            return Err(Error::NotFound(format!("primary key #{}", i)));
        }
        self.primary_at(i)
    }

    pub fn alias_by_ordinal(&mut self, i: u64) -> Result<SecondaryKeyRecord> {
        if i >= self.header.num_secondary {
            return Err(Error::NotFound(format!("alias #{}", i)));
        }
        self.alias_at(i)
    }

    /// Finds the furthest point at or before 1-based `position` in `key`'s
    /// data that can be seeked to directly.
    pub fn find_subrange_offset(&mut self, key: &str, position: u64) -> Result<SubrangeOffset> {
        let rec = self.find_by_name(key)?;
        if position == 0 || position > rec.length {
            return Err(Error::PositionOutOfRange {
                requested: position,
                length: rec.length,
            });
        }
        let file = self.files.get(rec.handle as usize).ok_or_else(|| {
            Error::Format(format!("key {:?} has unknown file handle {}", key, rec.handle))
        })?;

        let (data_offset, actual_position) = if rec.data_offset == 0 {
            (None, 1)
        } else if !file.fast_subrange() {
            (Some(rec.data_offset), 1)
        } else {
            let bpl = file.bytes_per_line as u64;
            let epl = file.elements_per_line as u64;
            if bpl == 0 || epl == 0 {
                return Err(Error::Format(format!(
                    "file {:?} allows fast subranges but has line geometry {}/{}",
                    file.name, bpl, epl
                )));
            }
            let line = (position - 1) / epl;
            let line_start = line
                .checked_mul(bpl)
                .and_then(|n| n.checked_add(rec.data_offset))
                .ok_or_else(|| Error::Format(format!("subrange offset of {:?} overflows", key)))?;

            if bpl != epl + 1 {
                // Lines carry more than one byte of terminator; only line
                // starts are addressable.
                (Some(line_start), 1 + line * epl)
            } else {
                let exact = line_start
                    .checked_add((position - 1) % epl)
                    .ok_or_else(|| Error::Format(format!("subrange offset of {:?} overflows", key)))?;
                (Some(exact), position)
            }
        };

        Ok(SubrangeOffset {
            handle: rec.handle,
            record_offset: rec.record_offset,
            data_offset,
            length: rec.length,
            actual_position,
        })
    }

    /// Whether `key` is a primary key. Aliases are not consulted.
    pub fn contains_primary(&mut self, key: &str) -> Result<bool> {
        Ok(self.search(self.primary_section(), key.as_bytes())?.is_some())
    }

    /// Iterates over all primary keys in sorted order.
    pub fn keys(&mut self) -> Keys<'_, R> {
        Keys {
            reader: self,
            next: 0,
        }
    }

    fn primary_section(&self) -> Section {
        Section {
            offset: self.header.primary_offset,
            record_size: self.header.primary_record_size,
            count: self.header.num_primary,
            key_width: self.header.key_width,
        }
    }

    fn alias_section(&self) -> Section {
        Section {
            offset: self.header.alias_offset,
            record_size: self.header.alias_record_size,
            count: self.header.num_secondary,
            key_width: self.header.alias_width,
        }
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<()> {
        self.buf.resize(len, 0);
        self.r.seek(SeekFrom::Start(offset))?;
        self.r.read_exact(&mut self.buf)?;
        Ok(())
    }

    fn record_reader(&self) -> RecordReader<'_> {
        RecordReader::new(&self.buf, self.order, self.header.offset_width, self.native)
    }

    fn primary_at(&mut self, i: u64) -> Result<PrimaryKeyRecord> {
        let section = self.primary_section();
        self.read_at(section.record(i), section.record_size as usize)?;
        PrimaryKeyRecord::read_from(&mut self.record_reader(), self.header.key_width)
    }

    fn alias_at(&mut self, i: u64) -> Result<SecondaryKeyRecord> {
        let section = self.alias_section();
        self.read_at(section.record(i), section.record_size as usize)?;
        SecondaryKeyRecord::read_from(
            &mut self.record_reader(),
            self.header.alias_width,
            self.header.key_width,
        )
    }

    // Binary search over raw key bytes, reading only the key field of each
    // probed record.
    fn search(&mut self, section: Section, key: &[u8]) -> Result<Option<u64>> {
        if key.is_empty() || key.len() >= section.key_width as usize {
            return Ok(None);
        }

        let (mut lo, mut hi) = (0, section.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.read_at(section.record(mid), section.key_width as usize)?;
            let stored = self.record_reader().read_padded(section.key_width as usize)?;
            match stored.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Some(mid)),
            }
        }
        Ok(None)
    }
}

pub struct Keys<'a, R: Read + Seek> {
    reader: &'a mut IndexReader<R>,
    next: u64,
}

impl<'a, R: Read + Seek> Iterator for Keys<'a, R> {
    type Item = Result<PrimaryKeyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.reader.num_primary() {
            return None;
        }
        self.next += 1;
        Some(self.reader.primary_at(self.next - 1))
    }
}
