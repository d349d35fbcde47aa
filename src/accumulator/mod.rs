// Collections of keys registered during a build.
//
// Keys start out in memory. Once the builder decides the index is too large
// to sort in memory, everything is flushed to spill files, one tab-delimited
// line per key, and later keys are appended there. Either way the builder
// gets back keys sorted by raw bytes, one at a time.

use std::{
    io::{self, BufRead, BufReader, SeekFrom},
    iter,
    marker::PhantomData,
    vec,
};

use crate::{
    error::{Error, Result},
    fs::{DbDir, DbFile},
    sort::Sorter,
    ssi::{PrimaryKeyRecord, SecondaryKeyRecord},
};

const SPILL_BUFFER_BYTES: usize = 64 * 1024;

pub(crate) trait KeyAccumulator {
    type Keys: Iterator<Item = Result<PrimaryKeyRecord>>;
    type Aliases: Iterator<Item = Result<SecondaryKeyRecord>>;

    fn add_key(&mut self, key: PrimaryKeyRecord) -> Result<()>;
    fn add_alias(&mut self, alias: SecondaryKeyRecord) -> Result<()>;

    /// Sorts primary keys by key and aliases by alias.
    fn into_sorted(self, sorter: &dyn Sorter) -> Result<(Self::Keys, Self::Aliases)>;
}

#[derive(Debug, Default)]
pub(crate) struct MemoryAccumulator {
    keys: Vec<PrimaryKeyRecord>,
    aliases: Vec<SecondaryKeyRecord>,
}

type Sorted<T> = iter::Map<vec::IntoIter<T>, fn(T) -> Result<T>>;

impl KeyAccumulator for MemoryAccumulator {
    type Keys = Sorted<PrimaryKeyRecord>;
    type Aliases = Sorted<SecondaryKeyRecord>;

    fn add_key(&mut self, key: PrimaryKeyRecord) -> Result<()> {
        self.keys.push(key);
        Ok(())
    }

    fn add_alias(&mut self, alias: SecondaryKeyRecord) -> Result<()> {
        self.aliases.push(alias);
        Ok(())
    }

    fn into_sorted(mut self, _sorter: &dyn Sorter) -> Result<(Self::Keys, Self::Aliases)> {
        self.keys.sort_by(|a, b| a.key.as_bytes().cmp(b.key.as_bytes()));
        self.aliases
            .sort_by(|a, b| a.alias.as_bytes().cmp(b.alias.as_bytes()));
        Ok((
            self.keys.into_iter().map(Ok as fn(_) -> _),
            self.aliases.into_iter().map(Ok as fn(_) -> _),
        ))
    }
}

/// One record per line in a spill file.
pub(crate) trait SpillLine: Sized {
    fn write_line(&self, out: &mut Vec<u8>);
    fn parse_line(line: &str) -> Result<Self>;
}

fn bad_line(line: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed spill line {:?}", line),
    ))
}

impl SpillLine for PrimaryKeyRecord {
    fn write_line(&self, out: &mut Vec<u8>) {
        out.extend(
            format!(
                "{}\t{}\t{}\t{}\t{}\n",
                self.key, self.handle, self.record_offset, self.data_offset, self.length
            )
            .as_bytes(),
        );
    }

    fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let mut next = || fields.next().ok_or_else(|| bad_line(line));
        let key = next()?.to_owned();
        let handle = next()?.parse::<u16>().map_err(|_| bad_line(line))?;
        let record_offset = next()?.parse::<u64>().map_err(|_| bad_line(line))?;
        let data_offset = next()?.parse::<u64>().map_err(|_| bad_line(line))?;
        let length = next()?.parse::<u64>().map_err(|_| bad_line(line))?;
        Ok(PrimaryKeyRecord {
            key,
            handle,
            record_offset,
            data_offset,
            length,
        })
    }
}

impl SpillLine for SecondaryKeyRecord {
    fn write_line(&self, out: &mut Vec<u8>) {
        out.extend(format!("{}\t{}\n", self.alias, self.target).as_bytes());
    }

    fn parse_line(line: &str) -> Result<Self> {
        match line.split_once('\t') {
            Some((alias, target)) => Ok(SecondaryKeyRecord {
                alias: alias.to_owned(),
                target: target.to_owned(),
            }),
            None => Err(bad_line(line)),
        }
    }
}

#[derive(Debug)]
struct SpillFile<F: DbFile> {
    name: String,
    file: F,
    buf: Vec<u8>,
}

impl<F: DbFile> SpillFile<F> {
    fn append<T: SpillLine>(&mut self, t: &T) -> Result<()> {
        t.write_line(&mut self.buf);
        if self.buf.len() >= SPILL_BUFFER_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    fn sort<D>(mut self, dir: &mut D, sorter: &dyn Sorter) -> Result<BufReader<F>>
    where
        D: DbDir<DbFile = F>,
    {
        self.flush()?;
        self.file.seek(SeekFrom::Start(0))?;

        let target = sorted_name(&self.name);
        let mut sorted = dir
            .create(&target)?
            .ok_or(Error::Overwrite(target))?;

        tracing::debug!(spill = %self.name, "sorting spill file");
        sorter
            .sort_lines(&mut self.file, &mut sorted)
            .map_err(Error::Sort)?;
        sorted.seek(SeekFrom::Start(0))?;
        Ok(BufReader::new(sorted))
    }
}

pub(crate) fn sorted_name(spill_name: &str) -> String {
    format!("{}.sorted", spill_name)
}

/// Parses a sorted spill file back into records, one line at a time.
pub(crate) struct SpillLines<R, T> {
    reader: R,
    line: String,
    _marker: PhantomData<T>,
}

impl<R: BufRead, T: SpillLine> Iterator for SpillLines<R, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => None,
            Ok(_) => {
                let line = self.line.strip_suffix('\n').unwrap_or(&self.line);
                Some(T::parse_line(line))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

impl<R, T> SpillLines<R, T> {
    fn new(reader: R) -> Self {
        SpillLines {
            reader,
            line: String::new(),
            _marker: PhantomData,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SpillAccumulator<D: DbDir> {
    dir: D,
    keys: SpillFile<D::DbFile>,
    aliases: SpillFile<D::DbFile>,
}

impl<D: DbDir> SpillAccumulator<D> {
    /// Creates both spill files and moves everything in `from` into them.
    pub(crate) fn create(
        mut dir: D,
        key_spill: &str,
        alias_spill: &str,
        from: MemoryAccumulator,
    ) -> Result<Self> {
        let mut open = |name: &str| -> Result<SpillFile<D::DbFile>> {
            let file = dir
                .create(&name)?
                .ok_or_else(|| Error::Overwrite(name.to_owned()))?;
            Ok(SpillFile {
                name: name.to_owned(),
                file,
                buf: Vec::with_capacity(SPILL_BUFFER_BYTES),
            })
        };
        let keys = open(key_spill)?;
        let aliases = open(alias_spill)?;

        let mut acc = SpillAccumulator { dir, keys, aliases };
        for key in from.keys {
            acc.add_key(key)?;
        }
        for alias in from.aliases {
            acc.add_alias(alias)?;
        }
        Ok(acc)
    }
}

impl<D: DbDir> KeyAccumulator for SpillAccumulator<D> {
    type Keys = SpillLines<BufReader<D::DbFile>, PrimaryKeyRecord>;
    type Aliases = SpillLines<BufReader<D::DbFile>, SecondaryKeyRecord>;

    fn add_key(&mut self, key: PrimaryKeyRecord) -> Result<()> {
        self.keys.append(&key)
    }

    fn add_alias(&mut self, alias: SecondaryKeyRecord) -> Result<()> {
        self.aliases.append(&alias)
    }

    fn into_sorted(mut self, sorter: &dyn Sorter) -> Result<(Self::Keys, Self::Aliases)> {
        let keys = self.keys.sort(&mut self.dir, sorter)?;
        let aliases = self.aliases.sort(&mut self.dir, sorter)?;
        Ok((SpillLines::new(keys), SpillLines::new(aliases)))
    }
}

#[cfg(test)]
mod test {
    use super::{KeyAccumulator, MemoryAccumulator, SpillAccumulator, SpillLine};
    use crate::{
        error::Result,
        fs::{DbDir, MockDir},
        sort::InProcessSorter,
        ssi::{PrimaryKeyRecord, SecondaryKeyRecord},
    };

    fn key(name: &str, handle: u16, offset: u64) -> PrimaryKeyRecord {
        PrimaryKeyRecord {
            key: name.to_owned(),
            handle,
            record_offset: offset,
            data_offset: offset + 10,
            length: offset * 2,
        }
    }

    fn alias(alias: &str, target: &str) -> SecondaryKeyRecord {
        SecondaryKeyRecord {
            alias: alias.to_owned(),
            target: target.to_owned(),
        }
    }

    fn fill<A: KeyAccumulator>(acc: &mut A) -> Result<()> {
        acc.add_key(key("zeta", 1, 300))?;
        acc.add_key(key("alpha", 0, 0))?;
        acc.add_alias(alias("z", "zeta"))?;
        acc.add_key(key("Mid", 2, 1 << 40))?;
        acc.add_alias(alias("a", "alpha"))?;
        Ok(())
    }

    fn drain<A: KeyAccumulator>(acc: A) -> (Vec<PrimaryKeyRecord>, Vec<SecondaryKeyRecord>) {
        let (keys, aliases) = acc.into_sorted(&InProcessSorter::default()).unwrap();
        (
            keys.collect::<Result<_>>().unwrap(),
            aliases.collect::<Result<_>>().unwrap(),
        )
    }

    #[test]
    fn test_spill_lines_parse_back() {
        let rec = key("seq\u{e9}", 7, 1 << 35);
        let mut buf = Vec::new();
        rec.write_line(&mut buf);
        let line = String::from_utf8(buf).unwrap();
        assert_eq!(line, format!("seq\u{e9}\t7\t{}\t{}\t{}\n", 1_u64 << 35, (1_u64 << 35) + 10, 1_u64 << 36));
        assert_eq!(PrimaryKeyRecord::parse_line(line.trim_end()).unwrap(), rec);

        assert!(PrimaryKeyRecord::parse_line("k\t1\t2").is_err());
        assert!(PrimaryKeyRecord::parse_line("k\tx\t2\t3\t4").is_err());
        assert!(SecondaryKeyRecord::parse_line("no-tab").is_err());
    }

    #[test]
    fn test_memory_and_spill_agree() {
        let mut mem = MemoryAccumulator::default();
        fill(&mut mem).unwrap();
        let expected = drain(mem);
        assert_eq!(
            expected.0.iter().map(|k| k.key.as_str()).collect::<Vec<_>>(),
            vec!["Mid", "alpha", "zeta"]
        );
        assert_eq!(
            expected.1.iter().map(|a| a.alias.as_str()).collect::<Vec<_>>(),
            vec!["a", "z"]
        );

        // Half the keys arrive before the switch, half after.
        let mut dir = MockDir::new();
        let mut before = MemoryAccumulator::default();
        before.add_key(key("zeta", 1, 300)).unwrap();
        before.add_key(key("alpha", 0, 0)).unwrap();
        before.add_alias(alias("z", "zeta")).unwrap();
        let mut spill = SpillAccumulator::create(dir.clone(), "idx.1", "idx.2", before).unwrap();
        spill.add_key(key("Mid", 2, 1 << 40)).unwrap();
        spill.add_alias(alias("a", "alpha")).unwrap();

        assert_eq!(drain(spill), expected);
        assert_eq!(
            dir.ls(),
            vec!["idx.1", "idx.1.sorted", "idx.2", "idx.2.sorted"]
        );
    }
}
