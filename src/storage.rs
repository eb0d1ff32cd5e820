//! CSV persistence of scan rows and scan-parameter manifests.
//!
//! Rows are appended and flushed one at a time, so a scan that is stopped or faults
//! part way leaves a valid file holding every point measured so far.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{AppResult, DaqError};
use crate::scan::aggregate::ScanRow;

/// Column names of a scan file, without the optional power column.
pub const SCAN_COLUMNS: [&str; 6] = [
    "Wavelength",
    "Mean Current",
    "Amplification",
    "Mean R",
    "Mean Frequency",
    "Mean Phase",
];
pub const POWER_COLUMN: &str = "Power";

/// Append-only writer for one band's data file.
pub struct ScanWriter {
    path: PathBuf,
    with_power: bool,
    writer: csv::Writer<File>,
    rows: usize,
}

impl ScanWriter {
    /// Creates the file (and its directory) and writes the header.
    pub fn create(path: &Path, with_power: bool) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut header: Vec<&str> = SCAN_COLUMNS.to_vec();
        if with_power {
            header.push(POWER_COLUMN);
        }
        writer.write_record(&header)?;
        writer.flush()?;
        info!("Writing scan data to '{}'", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            with_power,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Writes `row` and flushes it to disk.
    pub fn append(&mut self, row: &ScanRow) -> AppResult<()> {
        let mut record = vec![
            row.wavelength.to_string(),
            row.mean_current.to_string(),
            row.amplification.to_string(),
            row.mean_r.to_string(),
            row.mean_frequency.to_string(),
            row.mean_phase.to_string(),
        ];
        if self.with_power {
            record.push(row.power.map(|p| p.to_string()).unwrap_or_default());
        }
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}

/// Reads a scan file back into rows.
pub fn read_scan_file(path: &Path) -> AppResult<Vec<ScanRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let with_power = reader.headers()?.iter().any(|h| h == POWER_COLUMN);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let field = |i: usize| -> AppResult<f64> {
            record
                .get(i)
                .and_then(|v| v.parse::<f64>().ok())
                .ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "{}: bad value in column {} of {:?}",
                        path.display(),
                        i,
                        record
                    ))
                })
        };
        let power = if with_power {
            record
                .get(SCAN_COLUMNS.len())
                .filter(|v| !v.is_empty())
                .and_then(|v| v.parse::<f64>().ok())
        } else {
            None
        };
        rows.push(ScanRow {
            wavelength: field(0)?,
            mean_current: field(1)?,
            amplification: field(2)?,
            mean_r: field(3)?,
            mean_frequency: field(4)?,
            mean_phase: field(5)?,
            power,
        });
    }
    Ok(rows)
}

/// Range and gain of one band in a saved manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub id: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub amplification: f64,
}

/// Writes one column per band id with the rows start, stop, step and amplification.
pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(entries.iter().map(|e| e.id.as_str()))?;
    let rows: [fn(&ManifestEntry) -> f64; 4] = [
        |e| e.start,
        |e| e.stop,
        |e| e.step,
        |e| e.amplification,
    ];
    for value in rows {
        writer.write_record(entries.iter().map(|e| value(e).to_string()))?;
    }
    writer.flush()?;
    info!("Saved measurement parameters into '{}'", path.display());
    Ok(())
}

pub fn load_manifest(path: &Path) -> AppResult<Vec<ManifestEntry>> {
    let mut reader = csv::Reader::from_path(path)?;
    let ids: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut columns: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        for (i, value) in record.iter().enumerate() {
            let value = value.trim().parse::<f64>().map_err(|_| {
                DaqError::Configuration(format!(
                    "{}: '{}' in column {} is not a number",
                    path.display(),
                    value,
                    ids.get(i).map_or("?", String::as_str)
                ))
            })?;
            columns.entry(i).or_default().push(value);
        }
    }

    ids.iter()
        .enumerate()
        .map(|(i, id)| match columns.get(&i).map(Vec::as_slice) {
            Some(&[start, stop, step, amplification, ..]) => Ok(ManifestEntry {
                id: id.clone(),
                start,
                stop,
                step,
                amplification,
            }),
            _ => Err(DaqError::Configuration(format!(
                "{}: column {} needs start, stop, step and amplification",
                path.display(),
                id
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(wavelength: f64, power: Option<f64>) -> ScanRow {
        ScanRow {
            wavelength,
            mean_current: 1.5e-9,
            amplification: 1e6,
            mean_r: 1.5e-3,
            mean_frequency: 390.0,
            mean_phase: 17.2,
            power,
        }
    }

    #[test]
    fn rows_are_readable_after_every_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alice/exp/scan.csv");
        let mut writer = ScanWriter::create(&path, false).unwrap();

        writer.append(&row(400.0, None)).unwrap();
        assert_eq!(read_scan_file(&path).unwrap().len(), 1);
        writer.append(&row(405.0, None)).unwrap();

        let rows = read_scan_file(&path).unwrap();
        assert_eq!(rows, vec![row(400.0, None), row(405.0, None)]);

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "Wavelength,Mean Current,Amplification,Mean R,Mean Frequency,Mean Phase\n"
        ));
    }

    #[test]
    fn power_column_may_be_blank() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.csv");
        let mut writer = ScanWriter::create(&path, true).unwrap();
        writer.append(&row(400.0, Some(4e-9))).unwrap();
        writer.append(&row(300.0, None)).unwrap();

        let rows = read_scan_file(&path).unwrap();
        assert_eq!(rows[0].power, Some(4e-9));
        assert_eq!(rows[1].power, None);
    }

    #[test]
    fn manifest_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.csv");
        let entries = vec![
            ManifestEntry {
                id: "f1".into(),
                start: 350.0,
                stop: 650.0,
                step: 5.0,
                amplification: 1e6,
            },
            ManifestEntry {
                id: "f4".into(),
                start: 900.0,
                stop: 1400.0,
                step: 10.0,
                amplification: 1e8,
            },
        ];
        write_manifest(&path, &entries).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("f1,f4"));
        assert_eq!(text.lines().count(), 5);
        assert_eq!(load_manifest(&path).unwrap(), entries);
    }

    #[test]
    fn short_manifest_column_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.csv");
        fs::write(&path, "f1\n350\n650\n").unwrap();
        assert!(load_manifest(&path).is_err());
    }
}
