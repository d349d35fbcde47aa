use std::io::{self, BufRead};

/// A sorted run of newline-terminated lines, with its next line buffered.
pub(crate) struct Run<R: BufRead> {
    reader: R,
    head: Option<Vec<u8>>,
}

impl<R: BufRead> Run<R> {
    pub(crate) fn new(reader: R) -> io::Result<Self> {
        let mut run = Run { reader, head: None };
        run.advance()?;
        Ok(run)
    }

    // Compared without the terminator, so "a" sorts before "a\x01".
    fn peek(&self) -> Option<&[u8]> {
        self.head.as_deref().map(|l| &l[..l.len() - 1])
    }

    // Replaces the head with the following line, returning the old one.
    fn advance(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let next = if self.reader.read_until(b'\n', &mut line)? == 0 {
            None
        } else {
            if line.last() != Some(&b'\n') {
                line.push(b'\n');
            }
            Some(line)
        };
        Ok(std::mem::replace(&mut self.head, next))
    }
}

/// Merges sorted runs into one sorted stream of lines.
pub(crate) struct MergingIter<R: BufRead> {
    runs: Vec<Run<R>>,
}

impl<R: BufRead> MergingIter<R> {
    pub(crate) fn new<J>(j: J) -> Self
    where
        J: IntoIterator<Item = Run<R>>,
    {
        Self {
            runs: j.into_iter().collect(),
        }
    }

    // Ties go to the earliest run, so equal lines keep their run order.
    fn lowest(&self) -> Option<usize> {
        let mut lowest: Option<(usize, &[u8])> = None;

        for (idx, run) in self.runs.iter().enumerate() {
            if let Some(line) = run.peek() {
                match lowest {
                    Some((_, best)) if best <= line => {}
                    _ => lowest = Some((idx, line)),
                }
            }
        }

        lowest.map(|(x, _)| x)
    }
}

impl<R: BufRead> Iterator for MergingIter<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.lowest()?;
        self.runs[i].advance().transpose()
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::{MergingIter, Run};

    #[test]
    fn test_merge_runs() {
        let runs = vec![
            Run::new(Cursor::new(b"a\nc\ne\n".to_vec())).unwrap(),
            Run::new(Cursor::new(b"b\nd".to_vec())).unwrap(),
            Run::new(Cursor::new(Vec::new())).unwrap(),
            Run::new(Cursor::new(b"a\nz\n".to_vec())).unwrap(),
        ];
        let merged: Vec<u8> = MergingIter::new(runs)
            .map(|l| l.unwrap())
            .flatten()
            .collect();
        assert_eq!(merged, b"a\na\nb\nc\nd\ne\nz\n".to_vec());
    }
}
