//! Comma-separated label/value files used by the cache and the CLI reports.

use crate::error::{Error, Result};
use crate::record::{Coefficient, ResultRecord};
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub struct CsvWriter {
    w: BufWriter<File>,
    path: PathBuf,
}

impl CsvWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let f = File::create(path).map_err(|e| Error::io(path, e))?;
        Ok(Self {
            w: BufWriter::new(f),
            path: path.to_path_buf(),
        })
    }

    /// Create `path` only if it does not exist yet; `None` when it does.
    pub fn create_new(path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => Ok(Some(Self {
                w: BufWriter::new(f),
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn write_header(&mut self, columns: &[&str]) -> Result<()> {
        writeln!(self.w, "{}", columns.join(",")).map_err(|e| Error::io(&self.path, e))
    }

    pub fn write_row<T: Display>(&mut self, label: &str, cells: &[T]) -> Result<()> {
        let mut line = String::from(label);
        for cell in cells {
            line.push(',');
            line.push_str(&cell.to_string());
        }
        writeln!(self.w, "{}", line).map_err(|e| Error::io(&self.path, e))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush().map_err(|e| Error::io(&self.path, e))
    }
}

/// One data row of a label/value file (header excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    /// 1-based line number in the source file
    pub line: usize,
    pub label: String,
    pub cells: Vec<String>,
}

/// Read every non-blank row after the header line.
pub fn read_rows(path: &Path) -> Result<Vec<CsvRow>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(parse_rows(&text))
}

fn parse_rows(text: &str) -> Vec<CsvRow> {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .skip(1)
        .map(|(i, l)| {
            let mut parts = l.split(',').map(|c| c.trim().to_string());
            let label = parts.next().unwrap_or_default();
            CsvRow {
                line: i + 1,
                label,
                cells: parts.collect(),
            }
        })
        .collect()
}

pub const RECORD_HEADER: [&str; 3] = ["name", "kind", "values"];

/// Write a result record, one coefficient per row.
pub fn write_record(path: &Path, record: &ResultRecord) -> Result<()> {
    let mut w = CsvWriter::create(path)?;
    w.write_header(&RECORD_HEADER)?;
    for (name, coefficient) in record.iter() {
        let mut cells = vec![coefficient.kind().to_string()];
        cells.extend(coefficient.values().iter().map(|v| v.to_string()));
        w.write_row(name, &cells)?;
    }
    w.flush()
}

/// Read a record written by [`write_record`].
pub fn read_record(path: &Path) -> Result<ResultRecord> {
    let corrupt = |line: usize, reason: &str| Error::CorruptCacheFile {
        path: path.to_path_buf(),
        reason: format!("line {}: {}", line, reason),
    };

    let mut record = ResultRecord::new();
    for row in read_rows(path)? {
        let (kind, raw) = row
            .cells
            .split_first()
            .ok_or_else(|| corrupt(row.line, "missing kind column"))?;
        let values = raw
            .iter()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| corrupt(row.line, &e.to_string()))?;

        let coefficient = match (kind.as_str(), values.as_slice()) {
            ("scalar", [v]) => Coefficient::Scalar(*v),
            ("scalar", _) => return Err(corrupt(row.line, "scalar row must hold one value")),
            ("series", _) => Coefficient::Series(values),
            (other, _) => return Err(corrupt(row.line, &format!("unknown kind '{}'", other))),
        };
        record.insert(row.label, coefficient);
    }
    if record.is_empty() {
        return Err(corrupt(1, "no coefficient rows"));
    }
    Ok(record)
}
