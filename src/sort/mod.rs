// Sorting spill files by raw byte order.
//
// Spill files are newline-delimited text. Whatever sorts them must compare
// lines byte by byte, the way `LC_ALL=C sort` does, never by locale collation,
// or the binary search over the finished index will miss keys.

use std::{
    fmt,
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    process::{Command, Stdio},
};

use anyhow::{bail, Context};

use self::merging_iter::{MergingIter, Run};

mod merging_iter;

pub trait Sorter: fmt::Debug {
    /// Reads newline-terminated lines from `input` and writes them to
    /// `output` in ascending byte order.
    fn sort_lines(&self, input: &mut dyn Read, output: &mut dyn Write) -> anyhow::Result<()>;
}

/// An external merge sort run inside this process. At most `run_bytes` of
/// lines are held in memory at a time; larger inputs are cut into sorted
/// runs in anonymous temporary files and merged.
#[derive(Debug, Clone)]
pub struct InProcessSorter {
    run_bytes: usize,
    tmp_dir: Option<PathBuf>,
}

impl InProcessSorter {
    pub fn new(run_bytes: usize) -> Self {
        InProcessSorter {
            run_bytes: run_bytes.max(1),
            tmp_dir: None,
        }
    }

    /// Puts run files in `dir` instead of the system temporary directory.
    pub fn with_tmp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.tmp_dir = Some(dir.into());
        self
    }

    fn spill_run(&self, lines: &mut Vec<Vec<u8>>) -> anyhow::Result<BufReader<File>> {
        lines.sort_unstable();
        let file = match &self.tmp_dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
        .context("creating sort run file")?;

        let mut w = BufWriter::new(file);
        write_lines(lines.drain(..), &mut w)?;
        let mut file = w.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        Ok(BufReader::new(file))
    }
}

impl Default for InProcessSorter {
    fn default() -> Self {
        InProcessSorter::new(64 * 1024 * 1024)
    }
}

fn write_lines<I>(lines: I, w: &mut dyn Write) -> io::Result<()>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    for line in lines {
        w.write_all(&line)?;
        w.write_all(b"\n")?;
    }
    Ok(())
}

impl Sorter for InProcessSorter {
    fn sort_lines(&self, input: &mut dyn Read, output: &mut dyn Write) -> anyhow::Result<()> {
        let reader = BufReader::new(input);
        let mut runs = Vec::new();
        let mut chunk = Vec::new();
        let mut chunk_bytes = 0;

        for line in reader.split(b'\n') {
            let line = line.context("reading lines to sort")?;
            chunk_bytes += line.len() + 1;
            chunk.push(line);
            if chunk_bytes >= self.run_bytes {
                runs.push(Run::new(self.spill_run(&mut chunk)?)?);
                chunk_bytes = 0;
            }
        }

        if runs.is_empty() {
            chunk.sort_unstable();
            write_lines(chunk, output)?;
            return Ok(());
        }
        if !chunk.is_empty() {
            runs.push(Run::new(self.spill_run(&mut chunk)?)?);
        }

        tracing::debug!(runs = runs.len(), "merging sorted runs");
        for line in MergingIter::new(runs) {
            output.write_all(&line.context("reading sort run")?)?;
        }
        Ok(())
    }
}

/// Sorts by piping lines through an external `sort` program under the C
/// locale. Only the program's exit status is checked.
#[derive(Debug, Clone)]
pub struct ProcessSorter {
    program: String,
}

impl ProcessSorter {
    pub fn new<S: Into<String>>(program: S) -> Self {
        ProcessSorter {
            program: program.into(),
        }
    }
}

impl Default for ProcessSorter {
    fn default() -> Self {
        ProcessSorter::new("sort")
    }
}

impl Sorter for ProcessSorter {
    fn sort_lines(&self, input: &mut dyn Read, output: &mut dyn Write) -> anyhow::Result<()> {
        let mut child = Command::new(&self.program)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.program))?;

        // sort(1) reads all of its input before writing anything, so feeding
        // stdin to completion first cannot deadlock.
        {
            let mut stdin = child.stdin.take().context("sort stdin not captured")?;
            io::copy(input, &mut stdin).context("writing to sort")?;
        }
        let mut stdout = child.stdout.take().context("sort stdout not captured")?;
        io::copy(&mut stdout, output).context("reading from sort")?;

        let status = child.wait().context("waiting for sort")?;
        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::{InProcessSorter, ProcessSorter, Sorter};

    fn random_lines(n: usize) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..n)
            .map(|_| {
                let len = rng.gen_range(1..12);
                (0..len)
                    .map(|_| rng.gen_range(b'0'..=b'z') as char)
                    .collect()
            })
            .collect()
    }

    fn run_sorter(sorter: &dyn Sorter, lines: &[String]) -> Vec<u8> {
        let input: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        let mut output = Vec::new();
        sorter
            .sort_lines(&mut Cursor::new(input.into_bytes()), &mut output)
            .unwrap();
        output
    }

    fn expected(lines: &[String]) -> Vec<u8> {
        let mut sorted = lines.to_vec();
        sorted.sort();
        sorted.iter().map(|l| format!("{}\n", l)).collect::<String>().into_bytes()
    }

    #[test]
    fn test_in_memory_sort() {
        let lines = random_lines(200);
        assert_eq!(run_sorter(&InProcessSorter::default(), &lines), expected(&lines));
    }

    #[test]
    fn test_sort_with_many_runs() {
        let lines = random_lines(1000);
        let tmp = tempfile::tempdir().unwrap();
        let sorter = InProcessSorter::new(64).with_tmp_dir(tmp.path());
        assert_eq!(run_sorter(&sorter, &lines), expected(&lines));
    }

    #[test]
    fn test_prefixes_sort_first() {
        let lines: Vec<String> = ["ab", "a\u{1}", "a", "a\tb"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = run_sorter(&InProcessSorter::new(2), &lines);
        assert_eq!(out, b"a\na\x01\na\tb\nab\n".to_vec());
    }

    #[test]
    fn test_empty_input() {
        assert!(run_sorter(&InProcessSorter::default(), &[]).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_sort() {
        let lines = random_lines(500);
        assert_eq!(run_sorter(&ProcessSorter::default(), &lines), expected(&lines));
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let sorter = ProcessSorter::new("/nonexistent/sort-program");
        let mut output = Vec::new();
        assert!(sorter
            .sort_lines(&mut Cursor::new(b"b\na\n".to_vec()), &mut output)
            .is_err());
    }
}
