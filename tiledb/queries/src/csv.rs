//! Plain CSV reading and writing with explicit record APIs; the
//! delimiter and float precision are carried in a small options struct.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tiledb_storage::error::{Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct CsvOptions {
    pub delimiter: char,
    /// Fractional digits for float fields on output.
    pub precision: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        CsvOptions {
            delimiter: ',',
            precision: 6,
        }
    }
}

pub struct CsvReader {
    reader: BufReader<File>,
    options: CsvOptions,
    line: String,
    lineno: u64,
}

impl CsvReader {
    pub fn open(path: &Path, options: CsvOptions) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(CsvReader {
            reader: BufReader::new(file),
            options,
            line: String::new(),
            lineno: 0,
        })
    }

    pub fn lineno(&self) -> u64 {
        self.lineno
    }

    /// Reads the next non-empty line split into fields, or `None` at
    /// end of file.
    pub fn next_line(&mut self) -> Result<Option<Vec<String>>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| Error::io("<csv>", e))?;
            if n == 0 {
                return Ok(None);
            }
            self.lineno += 1;
            let trimmed = self.line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(
                trimmed
                    .split(self.options.delimiter)
                    .map(|s| s.to_owned())
                    .collect(),
            ));
        }
    }
}

pub struct CsvWriter<W: Write> {
    writer: BufWriter<W>,
    options: CsvOptions,
}

impl CsvWriter<File> {
    pub fn create(path: &Path, options: CsvOptions) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        Ok(Self::new(file, options))
    }
}

impl<W: Write> CsvWriter<W> {
    pub fn new(writer: W, options: CsvOptions) -> Self {
        CsvWriter {
            writer: BufWriter::new(writer),
            options,
        }
    }

    pub fn options(&self) -> CsvOptions {
        self.options
    }

    pub fn write_record(&mut self, fields: &[String]) -> Result<()> {
        let mut first = true;
        for field in fields {
            if !first {
                write!(self.writer, "{}", self.options.delimiter)
                    .map_err(|e| Error::io("<csv>", e))?;
            }
            first = false;
            write!(self.writer, "{field}")
                .map_err(|e| Error::io("<csv>", e))?;
        }
        writeln!(self.writer).map_err(|e| Error::io("<csv>", e))
    }

    pub fn format_float(&self, value: f64) -> String {
        format!("{value:.*}", self.options.precision)
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().map_err(|e| Error::io("<csv>", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.csv");

        let mut writer =
            CsvWriter::create(&path, CsvOptions::default()).unwrap();
        writer
            .write_record(&[
                "1".to_owned(),
                "2".to_owned(),
                "hello".to_owned(),
            ])
            .unwrap();
        writer
            .write_record(&["3".to_owned(), "4".to_owned(), "".to_owned()])
            .unwrap();
        writer.finish().unwrap();

        let mut reader =
            CsvReader::open(&path, CsvOptions::default()).unwrap();
        assert_eq!(
            Some(vec![
                "1".to_owned(),
                "2".to_owned(),
                "hello".to_owned()
            ]),
            reader.next_line().unwrap()
        );
        assert_eq!(
            Some(vec!["3".to_owned(), "4".to_owned(), "".to_owned()]),
            reader.next_line().unwrap()
        );
        assert_eq!(None, reader.next_line().unwrap());
    }

    #[test]
    fn custom_delimiter_and_precision() {
        let options = CsvOptions {
            delimiter: '\t',
            precision: 2,
        };
        let mut out = Vec::new();
        {
            let mut writer = CsvWriter::new(&mut out, options);
            let f = writer.format_float(1.23456);
            writer.write_record(&["a".to_owned(), f]).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!("a\t1.23\n", String::from_utf8(out).unwrap());
    }
}
