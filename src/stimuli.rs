//! Stimulus loading and CSV output
//!
//! Datasets are read with a strict schema: the header must name every
//! column in [`REQUIRED_COLUMNS`] (any order), extra columns are ignored,
//! and a row whose field count differs from the header is rejected.

use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SurprisalError};

/// Columns a stimulus dataset must provide
pub const REQUIRED_COLUMNS: [&str; 5] = [
    "item",
    "prefix",
    "expected",
    "within_category",
    "between_category",
];

/// One row of the stimulus dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimulusRecord {
    pub item: String,
    pub prefix: String,
    pub expected: String,
    pub within_category: String,
    pub between_category: String,
}

/// Ordered collection of stimuli read from a CSV file
#[derive(Debug, Clone, Default)]
pub struct Stimuli {
    records: Vec<StimulusRecord>,
}

impl Stimuli {
    /// Load stimuli from a CSV file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            records: read_records(path)?,
        })
    }

    /// Total number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the dataset is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get all records in file order
    pub fn records(&self) -> &[StimulusRecord] {
        &self.records
    }
}

/// Read every data row of `path` into a [`StimulusRecord`].
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<StimulusRecord>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SurprisalError::DatasetNotFound(path.to_path_buf()),
        _ => SurprisalError::io(path, e),
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| SurprisalError::parse(path, e.to_string()))?
        .clone();
    if headers.is_empty() {
        return Err(SurprisalError::parse(path, "missing header row"));
    }
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(SurprisalError::parse(
                path,
                format!("missing required column '{column}'"),
            ));
        }
    }
    debug!("Header columns: {:?}", headers.iter().collect::<Vec<_>>());

    let mut records = Vec::new();
    for result in reader.deserialize::<StimulusRecord>() {
        let record = result.map_err(|e| SurprisalError::parse(path, e.to_string()))?;
        records.push(record);
    }

    info!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Write `rows` to `path`, optionally preceded by a `header` line.
///
/// The parent directory must already exist.
pub fn write_rows<I, R>(rows: I, path: impl AsRef<Path>, header: Option<&[&str]>) -> Result<()>
where
    I: IntoIterator<Item = R>,
    R: Serialize,
{
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| SurprisalError::io(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if let Some(header) = header {
        writer
            .write_record(header)
            .map_err(|e| SurprisalError::io(path, e.into()))?;
    }

    let mut written = 0usize;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| SurprisalError::io(path, e.into()))?;
        written += 1;
    }
    writer.flush().map_err(|e| SurprisalError::io(path, e))?;

    info!("Wrote {} rows to {}", written, path.display());
    Ok(())
}

/// Write typed records with a header derived from their field names.
///
/// An empty input produces an empty file.
pub fn write_records<I, R>(records: I, path: impl AsRef<Path>) -> Result<()>
where
    I: IntoIterator<Item = R>,
    R: Serialize,
{
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| SurprisalError::io(path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(file);

    for record in records {
        writer
            .serialize(record)
            .map_err(|e| SurprisalError::io(path, e.into()))?;
    }
    writer.flush().map_err(|e| SurprisalError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record(item: &str) -> StimulusRecord {
        StimulusRecord {
            item: item.into(),
            prefix: format!("prefix {item}"),
            expected: "mat".into(),
            within_category: "rug".into(),
            between_category: "moon".into(),
        }
    }

    #[test]
    fn test_extra_columns_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimuli.csv");
        fs::write(
            &path,
            "condition,between_category,item,prefix,expected,within_category\n\
             a,moon,1,The cat sat on the,mat,rug\n",
        )
        .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item, "1");
        assert_eq!(records[0].prefix, "The cat sat on the");
        assert_eq!(records[0].between_category, "moon");
    }

    #[test]
    fn test_missing_column_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimuli.csv");
        fs::write(&path, "item,prefix,expected,within_category\n1,a,b,c\n").unwrap();

        let err = read_records(&path).unwrap_err();
        match err {
            SurprisalError::Parse { reason, .. } => assert!(reason.contains("between_category")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ragged_row_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimuli.csv");
        fs::write(
            &path,
            "item,prefix,expected,within_category,between_category\n1,a,b,c\n",
        )
        .unwrap();

        assert!(matches!(
            read_records(&path),
            Err(SurprisalError::Parse { .. })
        ));
    }

    #[test]
    fn test_empty_file_has_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        fs::write(&path, "").unwrap();

        assert!(matches!(
            read_records(&path),
            Err(SurprisalError::Parse { .. })
        ));
    }

    #[test]
    fn test_header_only_is_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.csv");
        fs::write(&path, "item,prefix,expected,within_category,between_category\n").unwrap();

        let stimuli = Stimuli::load(&path).unwrap();
        assert!(stimuli.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.csv");
        assert!(matches!(
            read_records(&path),
            Err(SurprisalError::DatasetNotFound(p)) if p == path
        ));
    }

    #[test]
    fn test_write_rows_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let rows = vec![("1", 0.5f64), ("2", 1.25f64)];
        write_rows(rows, &path, Some(&["item", "value"][..])).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, "item,value\n1,0.5\n2,1.25\n");
    }

    #[test]
    fn test_write_rows_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.csv");
        let err = write_rows(Vec::<(u8,)>::new(), &path, None).unwrap_err();
        assert!(matches!(err, SurprisalError::Io { .. }));
    }

    #[test]
    fn test_write_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimuli.csv");
        let records = vec![record("1"), record("2"), record("10")];

        write_records(&records, &path).unwrap();
        assert_eq!(read_records(&path).unwrap(), records);
    }

    #[test]
    fn test_quoted_fields_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stimuli.csv");
        let mut tricky = record("7");
        tricky.prefix = "He said, \"stop\" and".into();
        tricky.expected = " waited".into();

        write_records([&tricky], &path).unwrap();
        assert_eq!(read_records(&path).unwrap(), vec![tricky]);
    }
}
