//! Flat tabular records read from CSV/TSV QC files.
//!
//! Cells stay as the raw text they were read with (so `run-01` keeps its
//! padding); numbers are parsed on demand. Computed numbers are written with
//! [`format_number`].

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error in {path}: {source}")]
    Csv { path: String, source: csv::Error },
    #[error("{path} has no header row")]
    Empty { path: String },
    #[error("column not found: {0}")]
    MissingColumn(String),
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Markers pandas/BIDS tooling writes for "no value".
const MISSING_MARKERS: &[&str] = &["", "n/a", "na", "nan", "none", "null"];

/// True if the cell holds no value.
pub fn is_missing(cell: &str) -> bool {
    let t = cell.trim();
    MISSING_MARKERS.iter().any(|m| t.eq_ignore_ascii_case(m))
}

/// Parse a cell as a number. Missing cells and text give `None`.
pub fn parse_number(cell: &str) -> Option<f64> {
    if is_missing(cell) {
        return None;
    }
    cell.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

/// Render a computed number; non-finite values become the missing marker.
pub fn format_number(v: f64) -> String {
    if v.is_finite() { format!("{v}") } else { String::new() }
}

/// Render an optional computed number.
pub fn format_opt(v: Option<f64>) -> String {
    v.map(format_number).unwrap_or_default()
}

/// Field delimiter implied by a file extension: `.tsv` is tab, anything else comma.
pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Read a CSV or TSV file (delimiter from the extension).
    pub fn read(path: &Path) -> Result<Self> {
        let delim = delimiter_for(path);
        let file = std::fs::File::open(path)?;
        Self::from_reader(file, delim).map_err(|e| match e {
            TableError::Csv { source, .. } => TableError::Csv {
                path: path.display().to_string(),
                source,
            },
            TableError::Empty { .. } => TableError::Empty {
                path: path.display().to_string(),
            },
            other => other,
        })
    }

    pub fn from_reader<R: std::io::Read>(reader: R, delimiter: u8) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut records = rdr.records();
        let header = match records.next() {
            Some(rec) => rec.map_err(csv_err)?,
            None => return Err(TableError::Empty { path: String::new() }),
        };
        let columns: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
        let width = columns.len();

        let mut rows = Vec::new();
        for rec in records {
            let rec = rec.map_err(csv_err)?;
            let mut row: Vec<String> = rec.iter().map(|c| c.to_string()).collect();
            row.resize(width, String::new());
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    /// Write as CSV or TSV (delimiter from the extension), creating parent dirs.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        self.to_writer(file, delimiter_for(path)).map_err(|e| match e {
            TableError::Csv { source, .. } => TableError::Csv {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn to_writer<W: std::io::Write>(&self, writer: W, delimiter: u8) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .from_writer(writer);
        wtr.write_record(&self.columns).map_err(csv_err)?;
        for row in &self.rows {
            wtr.write_record(row).map_err(csv_err)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Raw cells of a column.
    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    /// Parsed values of a column; missing or non-numeric cells are `None`.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        Ok(self.column(name)?.into_iter().map(parse_number).collect())
    }

    /// A column is numeric when every non-missing cell parses as a number.
    pub fn is_numeric_column(&self, idx: usize) -> bool {
        self.rows
            .iter()
            .map(|r| r[idx].as_str())
            .filter(|c| !is_missing(c))
            .all(|c| c.trim().parse::<f64>().is_ok())
    }

    pub fn cell(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self.column_index(name)?;
        self.rows.get(row).map(|r| r[idx].as_str())
    }

    /// Append a column. `values` shorter than the table are padded with missing cells.
    pub fn push_column(&mut self, name: &str, mut values: Vec<String>) {
        values.resize(self.rows.len(), String::new());
        self.columns.push(name.to_string());
        for (row, v) in self.rows.iter_mut().zip(values) {
            row.push(v);
        }
    }

    /// Insert a column at `pos` with the same value in every row.
    pub fn insert_constant_column(&mut self, pos: usize, name: &str, value: &str) {
        let pos = pos.min(self.columns.len());
        self.columns.insert(pos, name.to_string());
        for row in &mut self.rows {
            row.insert(pos, value.to_string());
        }
    }

    /// Replace a column's values, appending the column if it doesn't exist.
    pub fn set_column(&mut self, name: &str, mut values: Vec<String>) {
        match self.column_index(name) {
            Some(idx) => {
                values.resize(self.rows.len(), String::new());
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => self.push_column(name, values),
        }
    }

    /// Remove a column. Returns false if it wasn't there.
    pub fn drop_column(&mut self, name: &str) -> bool {
        match self.column_index(name) {
            Some(idx) => {
                self.columns.remove(idx);
                for row in &mut self.rows {
                    row.remove(idx);
                }
                true
            }
            None => false,
        }
    }

    /// Rename a column in place. Returns false if `from` wasn't there.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Drop pandas index leftovers (`Unnamed: 0`, ...).
    pub fn drop_unnamed_columns(&mut self) {
        let unnamed: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.starts_with("Unnamed"))
            .cloned()
            .collect();
        for c in unnamed {
            self.drop_column(&c);
        }
    }

    /// Append a row from `(column, value)` pairs. Unknown columns are added
    /// to the header; unnamed cells stay missing.
    pub fn push_row_map<K: AsRef<str>, V: Into<String>>(&mut self, pairs: impl IntoIterator<Item = (K, V)>) {
        let mut row = vec![String::new(); self.columns.len()];
        for (k, v) in pairs {
            let k = k.as_ref();
            match self.column_index(k) {
                Some(idx) => row[idx] = v.into(),
                None => {
                    self.columns.push(k.to_string());
                    for r in &mut self.rows {
                        r.push(String::new());
                    }
                    row.push(v.into());
                }
            }
        }
        self.rows.push(row);
    }

    /// Stack tables row-wise. The header is the union of all columns in
    /// first-seen order; cells a table lacks are missing.
    pub fn concat<'a>(tables: impl IntoIterator<Item = &'a Table>) -> Table {
        let mut out = Table::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut pending: Vec<(Vec<usize>, &'a Table)> = Vec::new();

        for t in tables {
            let mapping = t
                .columns
                .iter()
                .map(|c| {
                    *index.entry(c.clone()).or_insert_with(|| {
                        out.columns.push(c.clone());
                        out.columns.len() - 1
                    })
                })
                .collect();
            pending.push((mapping, t));
        }

        let width = out.columns.len();
        for (mapping, t) in pending {
            for row in &t.rows {
                let mut full = vec![String::new(); width];
                for (src, &dst) in mapping.iter().enumerate() {
                    full[dst] = row[src].clone();
                }
                out.rows.push(full);
            }
        }
        out
    }
}

fn csv_err(source: csv::Error) -> TableError {
    TableError::Csv { path: String::new(), source }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsv(s: &str) -> Table {
        Table::from_reader(s.as_bytes(), b'\t').unwrap()
    }

    #[test]
    fn test_missing_markers() {
        assert!(is_missing(""));
        assert!(is_missing("n/a"));
        assert!(is_missing("NaN"));
        assert!(is_missing(" NA "));
        assert!(!is_missing("0"));
        assert!(!is_missing("rest"));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0.25"), Some(0.25));
        assert_eq!(parse_number(" 3 "), Some(3.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number("AP"), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(f64::NAN), "");
    }

    #[test]
    fn test_read_pads_short_rows() {
        let t = tsv("a\tb\tc\n1\t2\n");
        assert_eq!(t.rows[0], vec!["1", "2", ""]);
    }

    #[test]
    fn test_keeps_zero_padding() {
        let t = tsv("run\n01\n");
        assert_eq!(t.cell(0, "run"), Some("01"));
        assert_eq!(t.numeric_column("run").unwrap(), vec![Some(1.0)]);
    }

    #[test]
    fn test_numeric_column_detection() {
        let t = tsv("sub\tfd\tnote\n1\t0.1\tok\n2\tn/a\tbad\n");
        assert!(t.is_numeric_column(0));
        assert!(t.is_numeric_column(1));
        assert!(!t.is_numeric_column(2));
    }

    #[test]
    fn test_drop_unnamed() {
        let mut t = tsv("Unnamed: 0\tlh_euler\n0\t-20\n");
        t.drop_unnamed_columns();
        assert_eq!(t.columns, vec!["lh_euler"]);
        assert_eq!(t.rows[0], vec!["-20"]);
    }

    #[test]
    fn test_push_row_map_extends_header() {
        let mut t = tsv("a\tb\n1\t2\n");
        t.push_row_map([("b", "x"), ("c", "y")]);
        assert_eq!(t.columns, vec!["a", "b", "c"]);
        assert_eq!(t.rows[0], vec!["1", "2", ""]);
        assert_eq!(t.rows[1], vec!["", "x", "y"]);
    }

    #[test]
    fn test_concat_unions_columns() {
        let a = tsv("sub\tfd\n1\t0.1\n");
        let b = tsv("sub\tdvars\tfd\n2\t5\t0.2\n");
        let out = Table::concat([&a, &b]);
        assert_eq!(out.columns, vec!["sub", "fd", "dvars"]);
        assert_eq!(out.len(), 2);
        assert_eq!(out.rows[0], vec!["1", "0.1", ""]);
        assert_eq!(out.rows[1], vec!["2", "0.2", "5"]);
    }

    #[test]
    fn test_rename_and_drop() {
        let mut t = tsv("datetime\toperator\n2020\tbob\n");
        assert!(t.rename_column("datetime", "acq_time"));
        assert!(t.drop_column("operator"));
        assert!(!t.drop_column("operator"));
        assert_eq!(t.columns, vec!["acq_time"]);
    }

    #[test]
    fn test_write_roundtrip_tsv() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out/x.tsv");
        let t = tsv("a\tb\n1\t\n");
        t.write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a\tb\n1\t\n");
    }
}
