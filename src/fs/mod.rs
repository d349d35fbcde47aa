use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

/// A file the builder writes through: the output index and its spill files.
pub trait DbFile: std::fmt::Debug + Read + Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
}

pub trait DbDir: Clone + std::fmt::Debug {
    type DbFile: DbFile;

    fn unlink<P>(&mut self, fname: &P) -> io::Result<bool>
    where
        P: AsRef<Path>;

    fn ls(&mut self) -> Vec<String>;

    /// Creates a new, empty file. Returns `None` if `fname` already exists.
    fn create<P>(&mut self, fname: &P) -> io::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    fn open<P>(&mut self, fname: &P) -> Option<Self::DbFile>
    where
        P: AsRef<Path>;

    fn exists<P>(&mut self, fname: &P) -> bool
    where
        P: AsRef<Path>,
    {
        self.open(fname).is_some()
    }
}

// OS implementation

impl DbFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new<P>(root: P) -> io::Result<Self>
    where
        P: Into<PathBuf>,
    {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(OsDir { root })
    }

    pub fn path<P>(&self, fname: &P) -> PathBuf
    where
        P: AsRef<Path>,
    {
        self.root.join(fname)
    }
}

impl DbDir for OsDir {
    type DbFile = File;

    fn unlink<P>(&mut self, fname: &P) -> io::Result<bool>
    where
        P: AsRef<Path>,
    {
        match fs::remove_file(self.path(fname)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn ls(&mut self) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(&self.root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn create<P>(&mut self, fname: &P) -> io::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path(fname))
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open<P>(&mut self, fname: &P) -> Option<Self::DbFile>
    where
        P: AsRef<Path>,
    {
        File::open(self.path(fname)).ok()
    }

    fn exists<P>(&mut self, fname: &P) -> bool
    where
        P: AsRef<Path>,
    {
        self.path(fname).exists()
    }
}

// In-memory implementation for tests. Writes land in a file's pending
// contents and only become durable on sync. A failure can be injected after
// a given number of mutating operations; from then on every operation errors
// until `recover`, which throws away whatever was never synced.

#[derive(Default, Debug)]
struct MockContents {
    durable: Vec<u8>,
    pending: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MockFs {
    names: BTreeMap<String, usize>,
    contents: Vec<MockContents>,
    ops_until_failure: Option<usize>,
}

impl MockFs {
    /// Lets `ops` more creates, unlinks, writes or syncs through, then fails
    /// everything.
    pub fn fail_after(&mut self, ops: usize) {
        self.ops_until_failure = Some(ops);
    }

    pub fn recover(&mut self) {
        for c in &mut self.contents {
            c.pending = c.durable.clone();
        }
        self.ops_until_failure = None;
    }

    fn tick(&mut self) -> io::Result<()> {
        match self.ops_until_failure {
            Some(0) => Err(io::Error::new(io::ErrorKind::Other, "injected I/O failure")),
            Some(n) => {
                self.ops_until_failure = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockFile {
    id: usize,
    pos: usize,
    fs: Rc<RefCell<MockFs>>,
}

impl MockFile {
    /// Everything written so far, synced or not.
    pub fn contents(&self) -> Vec<u8> {
        self.fs.borrow().contents[self.id].pending.clone()
    }

    #[allow(unused)]
    fn durable_contents(&self) -> Vec<u8> {
        self.fs.borrow().contents[self.id].durable.clone()
    }
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fs = self.fs.borrow();
        let data = &fs.contents[self.id].pending;
        let available = data.get(self.pos..).unwrap_or(&[]);
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for MockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut fs = self.fs.borrow_mut();
        fs.tick()?;
        let data = &mut fs.contents[self.id].pending;
        let end = self.pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MockFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(n) => (n as i64, 0),
            SeekFrom::End(d) => (self.fs.borrow().contents[self.id].pending.len() as i64, d),
            SeekFrom::Current(d) => (self.pos as i64, d),
        };
        match base.checked_add(delta) {
            Some(target) if target >= 0 => {
                self.pos = target as usize;
                Ok(self.pos as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )),
        }
    }
}

impl DbFile for MockFile {
    fn sync(&mut self) -> io::Result<()> {
        let mut fs = self.fs.borrow_mut();
        fs.tick()?;
        let c = &mut fs.contents[self.id];
        c.durable = c.pending.clone();
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockDir {
    pub fs: Rc<RefCell<MockFs>>,
}

impl MockDir {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, id: usize) -> MockFile {
        MockFile {
            id,
            pos: 0,
            fs: self.fs.clone(),
        }
    }
}

fn mock_name<P: AsRef<Path>>(p: &P) -> String {
    p.as_ref().to_string_lossy().into_owned()
}

impl DbDir for MockDir {
    type DbFile = MockFile;

    fn unlink<P>(&mut self, fname: &P) -> io::Result<bool>
    where
        P: AsRef<Path>,
    {
        let mut fs = self.fs.borrow_mut();
        fs.tick()?;
        Ok(fs.names.remove(&mock_name(fname)).is_some())
    }

    fn ls(&mut self) -> Vec<String> {
        self.fs.borrow().names.keys().cloned().collect()
    }

    fn create<P>(&mut self, fname: &P) -> io::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let name = mock_name(fname);
        let id = {
            let mut fs = self.fs.borrow_mut();
            fs.tick()?;
            if fs.names.contains_key(&name) {
                return Ok(None);
            }
            let id = fs.contents.len();
            fs.contents.push(MockContents::default());
            fs.names.insert(name, id);
            id
        };
        Ok(Some(self.handle(id)))
    }

    fn open<P>(&mut self, fname: &P) -> Option<Self::DbFile>
    where
        P: AsRef<Path>,
    {
        let id = self.fs.borrow().names.get(&mock_name(fname)).copied();
        id.map(|id| self.handle(id))
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Seek, SeekFrom, Write};

    use super::{DbDir, DbFile, MockDir, OsDir};

    #[test]
    fn test_mock_file() -> anyhow::Result<()> {
        let mut dir = MockDir::new();

        let mut a = dir.create(&"a")?.unwrap();

        a.write_all(&[1, 2, 3, 4])?;

        assert!(a.durable_contents().is_empty());
        assert_eq!(a.contents(), vec![1, 2, 3, 4]);
        a.sync()?;
        assert_eq!(a.durable_contents(), vec![1, 2, 3, 4]);

        a.seek(SeekFrom::Start(1))?;
        let mut buf = Vec::new();
        a.read_to_end(&mut buf)?;
        assert_eq!(vec![2, 3, 4], buf);

        assert!(dir.create(&"a")?.is_none());
        assert!(dir.exists(&"a"));
        assert!(dir.unlink(&"a")?);
        assert!(!dir.exists(&"a"));

        Ok(())
    }

    #[test]
    fn test_mock_failure() -> anyhow::Result<()> {
        let mut dir = MockDir::new();
        let mut a = dir.create(&"a")?.unwrap();
        a.write_all(b"kept")?;
        a.sync()?;

        dir.fs.borrow_mut().fail_after(1);
        a.write_all(b" lost")?;
        assert!(a.write_all(b"!").is_err());
        assert!(dir.create(&"b").is_err());
        assert!(a.sync().is_err());

        dir.fs.borrow_mut().recover();
        assert_eq!(a.contents(), b"kept".to_vec());
        assert!(dir.create(&"b")?.is_some());
        assert_eq!(dir.ls(), vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_os_dir() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut dir = OsDir::new(tmp.path())?;

        let mut f = dir.create(&"x")?.unwrap();
        f.write_all(b"hello")?;
        f.sync()?;
        assert!(dir.create(&"x")?.is_none());
        assert_eq!(vec!["x".to_owned()], dir.ls());

        let mut contents = String::new();
        dir.open(&"x").unwrap().read_to_string(&mut contents)?;
        assert_eq!("hello", contents);

        assert!(dir.unlink(&"x")?);
        assert!(!dir.unlink(&"x")?);
        assert!(!dir.exists(&"x"));
        Ok(())
    }
}
