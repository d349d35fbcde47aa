use std::{
    ffi::OsStr,
    io::SeekFrom,
    path::Path,
};

use super::{
    reader::IndexReader, FileEntry, FileHandle, IndexHeader, PrimaryKeyRecord, SecondaryKeyRecord,
    FLAG_FAST_SUBRANGE,
};
use crate::{
    accumulator::{sorted_name, KeyAccumulator, MemoryAccumulator, SpillAccumulator},
    config::BuildConfig,
    encoding::{OffsetWidth, RecordWriter},
    error::{Error, Result},
    fs::{DbDir, DbFile},
    sort::{InProcessSorter, ProcessSorter, Sorter},
};

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// What a finished build wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub num_files: u16,
    pub num_primary: u64,
    pub num_secondary: u64,
    pub offset_width: OffsetWidth,
    /// Whether keys were spilled to disk and sorted externally.
    pub external_sort: bool,
    pub bytes: u64,
}

// Keys collected so far. Starts in memory and moves to disk at most once.
#[derive(Debug)]
enum Pending<D: DbDir> {
    Memory(MemoryAccumulator),
    Spill(SpillAccumulator<D>),
}

fn key_spill_name(name: &str) -> String {
    format!("{}.1", name)
}

fn alias_spill_name(name: &str) -> String {
    format!("{}.2", name)
}

/// Every file a build of `name` may leave behind, besides `name` itself.
pub fn spill_names(name: &str) -> Vec<String> {
    let keys = key_spill_name(name);
    let aliases = alias_spill_name(name);
    vec![
        sorted_name(&keys),
        sorted_name(&aliases),
        keys,
        aliases,
    ]
}

fn check_name(name: &str, max_len: usize) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > max_len {
        "too long"
    } else if name.bytes().any(|b| b < 0x20) {
        "contains a control character"
    } else {
        return Ok(());
    };
    Err(Error::InvalidKey {
        key: name.to_owned(),
        reason,
    })
}

// Widths of padded fields: the longest string plus its NUL, or 0 if there
// are no strings at all.
fn field_width(max_len: usize) -> u32 {
    if max_len == 0 {
        0
    } else {
        max_len as u32 + 1
    }
}

/// Builds an index file in one pass: register files and keys in any order,
/// then `write` sorts and lays everything out.
#[derive(Debug)]
pub struct IndexBuilder<D: DbDir> {
    dir: D,
    name: String,
    config: BuildConfig,
    sorter: Box<dyn Sorter>,
    output: D::DbFile,

    files: Vec<FileEntry>,
    pending: Pending<D>,
    num_primary: u64,
    num_secondary: u64,
    max_filename_len: usize,
    max_key_len: usize,
    max_alias_len: usize,
    max_offset: u64,
}

impl<D: DbDir> IndexBuilder<D> {
    /// Starts a build of `name` in `dir`, creating the output file now.
    pub fn create(mut dir: D, name: &str, config: BuildConfig) -> Result<Self> {
        config.validate()?;

        let mut existing = vec![name.to_owned()];
        existing.extend(spill_names(name));
        for fname in existing {
            if dir.exists(&fname) {
                if !config.allow_overwrite {
                    return Err(Error::Overwrite(fname));
                }
                dir.unlink(&fname)?;
            }
        }

        let output = dir
            .create(&name)?
            .ok_or_else(|| Error::Overwrite(name.to_owned()))?;

        let sorter: Box<dyn Sorter> = match &config.sort_program {
            Some(program) => Box::new(ProcessSorter::new(program.clone())),
            None => Box::new(InProcessSorter::new(config.sort_run_bytes)),
        };

        Ok(IndexBuilder {
            dir,
            name: name.to_owned(),
            config,
            sorter,
            output,
            files: Vec::new(),
            pending: Pending::Memory(MemoryAccumulator::default()),
            num_primary: 0,
            num_secondary: 0,
            max_filename_len: 0,
            max_key_len: 0,
            max_alias_len: 0,
            max_offset: 0,
        })
    }

    /// Replaces the sorter used for spilled keys.
    pub fn with_sorter(mut self, sorter: Box<dyn Sorter>) -> Self {
        self.sorter = sorter;
        self
    }

    pub fn is_external(&self) -> bool {
        matches!(self.pending, Pending::Spill(_))
    }

    /// Registers a data file. Only its final path component is stored.
    pub fn add_file(&mut self, path: &str, format: u32) -> Result<FileHandle> {
        let name = Path::new(path)
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| Error::InvalidKey {
                key: path.to_owned(),
                reason: "has no file name",
            })?;
        check_name(name, self.config.max_filename_len)?;
        if self.files.len() >= self.config.max_files as usize {
            return Err(Error::CapacityExceeded(format!(
                "at most {} files per index",
                self.config.max_files
            )));
        }

        let handle = self.files.len() as FileHandle;
        self.files.push(FileEntry {
            name: name.to_owned(),
            format,
            flags: 0,
            bytes_per_line: 0,
            elements_per_line: 0,
        });
        self.max_filename_len = self.max_filename_len.max(name.len());
        Ok(handle)
    }

    /// Declares that every data line in the file except the last holds
    /// `elements_per_line` elements in `bytes_per_line` bytes.
    pub fn set_fast_subrange(
        &mut self,
        handle: FileHandle,
        bytes_per_line: u32,
        elements_per_line: u32,
    ) -> Result<()> {
        if bytes_per_line == 0 || elements_per_line == 0 {
            return Err(Error::InvalidArgument(format!(
                "line geometry must be positive, got {}/{}",
                bytes_per_line, elements_per_line
            )));
        }
        let file = self
            .files
            .get_mut(handle as usize)
            .ok_or(Error::InvalidHandle(handle))?;
        file.bytes_per_line = bytes_per_line;
        file.elements_per_line = elements_per_line;
        file.flags |= FLAG_FAST_SUBRANGE;
        Ok(())
    }

    pub fn add_key(
        &mut self,
        key: &str,
        handle: FileHandle,
        record_offset: u64,
        data_offset: u64,
        length: u64,
    ) -> Result<()> {
        check_name(key, self.config.max_key_len)?;
        if handle as usize >= self.files.len() {
            return Err(Error::InvalidHandle(handle));
        }
        if self.num_primary >= self.config.max_keys {
            return Err(Error::CapacityExceeded(format!(
                "at most {} primary keys per index",
                self.config.max_keys
            )));
        }

        let key_len = self.max_key_len.max(key.len());
        self.reserve(self.num_primary + 1, self.num_secondary, key_len, self.max_alias_len)?;

        let record = PrimaryKeyRecord {
            key: key.to_owned(),
            handle,
            record_offset,
            data_offset,
            length,
        };
        match &mut self.pending {
            Pending::Memory(m) => m.add_key(record)?,
            Pending::Spill(s) => s.add_key(record)?,
        }
        self.num_primary += 1;
        self.max_key_len = key_len;
        self.max_offset = self.max_offset.max(record_offset).max(data_offset);
        Ok(())
    }

    /// Registers `alias` as another name for the primary key `target`.
    /// Whether `target` exists is only known, and checked, at `write`.
    pub fn add_alias(&mut self, alias: &str, target: &str) -> Result<()> {
        check_name(alias, self.config.max_key_len)?;
        check_name(target, self.config.max_key_len)?;
        if self.num_secondary >= self.config.max_keys {
            return Err(Error::CapacityExceeded(format!(
                "at most {} aliases per index",
                self.config.max_keys
            )));
        }

        let alias_len = self.max_alias_len.max(alias.len());
        self.reserve(self.num_primary, self.num_secondary + 1, self.max_key_len, alias_len)?;

        let record = SecondaryKeyRecord {
            alias: alias.to_owned(),
            target: target.to_owned(),
        };
        match &mut self.pending {
            Pending::Memory(m) => m.add_alias(record)?,
            Pending::Spill(s) => s.add_alias(record)?,
        }
        self.num_secondary += 1;
        self.max_alias_len = alias_len;
        Ok(())
    }

    // Switches to spill files if an index of this shape would no longer fit
    // the memory budget. Sizes are estimated at 8-byte offsets.
    fn reserve(
        &mut self,
        num_primary: u64,
        num_secondary: u64,
        key_len: usize,
        alias_len: usize,
    ) -> Result<()> {
        let estimate = IndexHeader::new(
            OffsetWidth::Eight,
            self.files.len() as u16,
            num_primary,
            num_secondary,
            field_width(self.max_filename_len),
            field_width(key_len),
            field_width(alias_len),
        )
        .end_offset();

        if estimate > self.config.max_ram_bytes {
            if let Pending::Memory(m) = &mut self.pending {
                let m = std::mem::take(m);
                tracing::debug!(
                    index = %self.name,
                    estimate,
                    budget = self.config.max_ram_bytes,
                    "index exceeds memory budget, spilling keys to disk"
                );
                let spill = SpillAccumulator::create(
                    self.dir.clone(),
                    &key_spill_name(&self.name),
                    &alias_spill_name(&self.name),
                    m,
                )?;
                self.pending = Pending::Spill(spill);
            }
        }
        Ok(())
    }

    /// Sorts the keys and writes the index. On failure the partial output is
    /// removed.
    pub fn write(self) -> Result<IndexSummary> {
        let mut dir = self.dir.clone();
        let name = self.name.clone();

        let result = self.emit();
        if result.is_err() {
            remove_quietly(&mut dir, &name);
        }
        for spill in spill_names(&name) {
            remove_quietly(&mut dir, &spill);
        }

        let summary = result?;
        tracing::info!(
            index = %name,
            files = summary.num_files,
            primary = summary.num_primary,
            secondary = summary.num_secondary,
            offset_width = summary.offset_width.bytes(),
            external_sort = summary.external_sort,
            bytes = summary.bytes,
            "wrote index"
        );
        Ok(summary)
    }

    fn emit(self) -> Result<IndexSummary> {
        let IndexBuilder {
            config,
            sorter,
            mut output,
            files,
            pending,
            num_primary,
            num_secondary,
            max_filename_len,
            max_key_len,
            max_alias_len,
            max_offset,
            ..
        } = self;

        let fw = field_width(max_filename_len);
        let pw = field_width(max_key_len);
        let sw = field_width(max_alias_len);
        let layout = |width| {
            IndexHeader::new(
                width,
                files.len() as u16,
                num_primary,
                num_secondary,
                fw,
                pw,
                sw,
            )
        };

        let narrow = layout(OffsetWidth::Four);
        let offset_width = if config.force_wide_offsets {
            OffsetWidth::Eight
        } else {
            OffsetWidth::for_value(max_offset.max(narrow.end_offset()))
        };
        let header = layout(offset_width);

        let mut w = RecordWriter::new(offset_width);
        header.write_to(&mut w)?;
        for file in &files {
            file.write_to(&mut w, fw)?;
        }

        let mut sections = SectionWriter {
            out: &mut output,
            w,
        };
        let external_sort = match pending {
            Pending::Memory(m) => {
                let (keys, aliases) = m.into_sorted(sorter.as_ref())?;
                sections.write_keys(keys, num_primary, pw)?;
                sections.write_aliases(aliases, num_secondary, sw, pw)?;
                false
            }
            Pending::Spill(s) => {
                let (keys, aliases) = s.into_sorted(sorter.as_ref())?;
                sections.write_keys(keys, num_primary, pw)?;
                sections.write_aliases(aliases, num_secondary, sw, pw)?;
                true
            }
        };
        sections.flush()?;

        check_alias_targets(&mut output)?;
        output.sync()?;

        Ok(IndexSummary {
            num_files: header.num_files,
            num_primary,
            num_secondary,
            offset_width,
            external_sort,
            bytes: header.end_offset(),
        })
    }
}

// Buffers encoded records on their way to the output file.
struct SectionWriter<'a, F: DbFile> {
    out: &'a mut F,
    w: RecordWriter,
}

impl<'a, F: DbFile> SectionWriter<'a, F> {
    fn flush(&mut self) -> Result<()> {
        self.out.write_all(self.w.as_bytes())?;
        self.w.clear();
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.w.len() >= WRITE_BUFFER_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    fn write_keys<I>(&mut self, keys: I, expected: u64, key_width: u32) -> Result<()>
    where
        I: Iterator<Item = Result<PrimaryKeyRecord>>,
    {
        let mut prev: Option<String> = None;
        let mut written = 0;
        for key in keys {
            let key = key?;
            if prev.as_deref() == Some(key.key.as_str()) {
                return Err(Error::DuplicateKey(key.key));
            }
            key.write_to(&mut self.w, key_width)?;
            self.maybe_flush()?;
            written += 1;
            prev = Some(key.key);
        }
        check_count("primary keys", written, expected)
    }

    fn write_aliases<I>(
        &mut self,
        aliases: I,
        expected: u64,
        alias_width: u32,
        key_width: u32,
    ) -> Result<()>
    where
        I: Iterator<Item = Result<SecondaryKeyRecord>>,
    {
        let mut prev: Option<String> = None;
        let mut written = 0;
        for alias in aliases {
            let alias = alias?;
            if prev.as_deref() == Some(alias.alias.as_str()) {
                return Err(Error::DuplicateKey(alias.alias));
            }
            // Longer than every primary key, so it can't name one.
            if alias.target.len() >= key_width as usize {
                return Err(Error::DanglingAlias {
                    alias: alias.alias,
                    target: alias.target,
                });
            }
            alias.write_to(&mut self.w, alias_width, key_width)?;
            self.maybe_flush()?;
            written += 1;
            prev = Some(alias.alias);
        }
        check_count("aliases", written, expected)
    }
}

fn check_count(what: &str, written: u64, expected: u64) -> Result<()> {
    if written != expected {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("registered {} {} but sorted {}", expected, what, written),
        )));
    }
    Ok(())
}

// Looks every alias target up in the finished primary section.
fn check_alias_targets<F: DbFile>(output: &mut F) -> Result<()> {
    output.seek(SeekFrom::Start(0))?;
    let mut reader = IndexReader::from_reader(&mut *output)?;
    for i in 0..reader.num_secondary() {
        let alias = reader.alias_by_ordinal(i)?;
        if !reader.contains_primary(&alias.target)? {
            return Err(Error::DanglingAlias {
                alias: alias.alias,
                target: alias.target,
            });
        }
    }
    Ok(())
}

fn remove_quietly<D: DbDir>(dir: &mut D, fname: &str) {
    if let Err(e) = dir.unlink(&fname) {
        tracing::warn!(file = %fname, error = %e, "failed to remove file");
    }
}
