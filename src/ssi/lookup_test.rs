use std::fmt::Write;

use datadriven::TestCase;

use super::{
    reader::IndexReader,
    writer::{IndexBuilder, IndexSummary},
};
use crate::{
    config::BuildConfig,
    error::Result,
    fs::{DbDir, MockDir, MockFile},
};

// Each input line registers one thing:
//     file <path> <format> [<bytes per line> <elements per line>]
//     key <name> <handle> <record offset> <data offset> <length>
//     alias <alias> <target>
fn build(dir: &MockDir, test_case: &TestCase) -> Result<IndexSummary> {
    let mut config = BuildConfig {
        allow_overwrite: true,
        force_wide_offsets: test_case.args.contains_key("wide"),
        ..BuildConfig::default()
    };
    if let Some(budget) = test_case.args.get("budget") {
        config.max_ram_bytes = budget[0].parse().unwrap();
    }

    let mut b = IndexBuilder::create(dir.clone(), "test.ssi", config)?;
    for line in test_case.input.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let num = |i: usize| -> u64 { fields[i].parse().unwrap() };
        match fields[0] {
            "file" => {
                let fh = b.add_file(fields[1], num(2) as u32)?;
                if fields.len() > 3 {
                    b.set_fast_subrange(fh, num(3) as u32, num(4) as u32)?;
                }
            }
            "key" => b.add_key(fields[1], num(2) as u16, num(3), num(4), num(5))?,
            "alias" => b.add_alias(fields[1], fields[2])?,
            other => panic!("unknown registration {:?}", other),
        }
    }
    b.write()
}

#[test]
fn test_lookups() {
    datadriven::walk("src/ssi/testdata/", |f| {
        let mut dir = MockDir::new();
        let mut reader: Option<IndexReader<MockFile>> = None;

        f.run(|test_case| match test_case.directive.as_str() {
            "build" => match build(&dir, test_case) {
                Ok(s) => {
                    reader = Some(IndexReader::from_reader(dir.open(&"test.ssi").unwrap()).unwrap());
                    format!(
                        "files={} primary={} secondary={} width={} external={} bytes={}\n",
                        s.num_files,
                        s.num_primary,
                        s.num_secondary,
                        s.offset_width.bytes(),
                        s.external_sort,
                        s.bytes
                    )
                }
                Err(e) => {
                    reader = None;
                    format!("error: {}\n", e)
                }
            },
            "find" => {
                let r = reader.as_mut().unwrap();
                let mut out = String::new();
                for key in test_case.input.lines() {
                    let line = match r.find_by_name(key) {
                        Ok(rec) => format!(
                            "{} -> {} fh={} roff={} doff={} len={}",
                            key, rec.key, rec.handle, rec.record_offset, rec.data_offset, rec.length
                        ),
                        Err(e) => format!("{}: {}", key, e),
                    };
                    writeln!(out, "{}", line).unwrap();
                }
                out
            }
            "subrange" => {
                let r = reader.as_mut().unwrap();
                let mut out = String::new();
                for line in test_case.input.lines() {
                    let (key, pos) = line.split_once(' ').unwrap();
                    let result = match r.find_subrange_offset(key, pos.parse().unwrap()) {
                        Ok(s) => format!(
                            "{}: fh={} roff={} data={} len={} actual={}",
                            line,
                            s.handle,
                            s.record_offset,
                            s.data_offset.map_or("-".to_owned(), |d| d.to_string()),
                            s.length,
                            s.actual_position
                        ),
                        Err(e) => format!("{}: {}", line, e),
                    };
                    writeln!(out, "{}", result).unwrap();
                }
                out
            }
            "ordinal" => {
                let r = reader.as_mut().unwrap();
                let mut out = String::new();
                for line in test_case.input.lines() {
                    match r.find_by_ordinal(line.parse().unwrap()) {
                        Ok(rec) => writeln!(out, "{}: {}", line, rec.key).unwrap(),
                        Err(e) => writeln!(out, "{}: {}", line, e).unwrap(),
                    }
                }
                out
            }
            "aliases" => {
                let r = reader.as_mut().unwrap();
                let mut out = String::new();
                for i in 0..r.num_secondary() {
                    let a = r.alias_by_ordinal(i).unwrap();
                    writeln!(out, "{} -> {}", a.alias, a.target).unwrap();
                }
                out
            }
            "files" => {
                let r = reader.as_ref().unwrap();
                let mut out = String::new();
                for fh in 0..r.num_files() {
                    let file = r.file_info(fh).unwrap();
                    writeln!(
                        out,
                        "{}: {} format={} bpl={} epl={} fast={}",
                        fh,
                        file.name,
                        file.format,
                        file.bytes_per_line,
                        file.elements_per_line,
                        file.fast_subrange()
                    )
                    .unwrap();
                }
                out
            }
            "ls" => dir.ls().join("\n") + "\n",
            _ => {
                panic!("unhandled");
            }
        })
    })
}
