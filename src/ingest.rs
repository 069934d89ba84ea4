//! # Raw Export Cleaning
//!
//! Turns the raw diabetes encounter export into the training CSV the rest
//! of the pipeline reads. The rewrite streams record by record through the
//! csv crate, so memory stays constant regardless of export size:
//!
//! - the `"?"` missing-data marker becomes an empty field, which re-reads
//!   as a null,
//! - two label columns are appended, derived from the raw `readmitted`
//!   disposition: `readmission_30d` is 1 only for `"<30"`, and
//!   `readmission_any` is 1 for anything other than `"NO"`.
//!
//! Downloading the export itself is out of scope; this stage starts from a
//! file already on disk.

use std::path::{Path, PathBuf};

use csv::StringRecord;
use thiserror::Error;

use crate::data::DEFAULT_TARGET_COLUMN;

/// The raw export's missing-data marker.
pub const RAW_MISSING_TOKEN: &str = "?";

/// Columns the raw export must carry for cleaning to make sense.
pub const REQUIRED_RAW_COLUMNS: &[&str] = &["encounter_id", "patient_nbr", "readmitted"];

const RAW_DISPOSITION_COLUMN: &str = "readmitted";
const ANY_READMISSION_COLUMN: &str = "readmission_any";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("CSV processing failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("raw export is missing required column '{0}'")]
    MissingColumn(String),
}

/// Row and label counts of a finished cleaning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub rows: u64,
    pub positives: u64,
}

impl IngestSummary {
    /// Share of rows with a 30-day readmission label.
    pub fn positive_rate(&self) -> f64 {
        if self.rows > 0 {
            self.positives as f64 / self.rows as f64
        } else {
            0.0
        }
    }
}

/// Streams the raw export into a cleaned, labeled training CSV.
pub fn clean_export(input: &Path, output: &Path) -> Result<IngestSummary, IngestError> {
    let mut reader = csv::Reader::from_path(input)?;
    let headers = reader.headers()?.clone();
    for required in REQUIRED_RAW_COLUMNS {
        if !headers.iter().any(|header| header == *required) {
            return Err(IngestError::MissingColumn(required.to_string()));
        }
    }
    let disposition_index = match headers.iter().position(|h| h == RAW_DISPOSITION_COLUMN) {
        Some(index) => index,
        None => return Err(IngestError::MissingColumn(RAW_DISPOSITION_COLUMN.to_string())),
    };

    let mut writer = csv::Writer::from_path(output)?;
    let mut out_headers = headers.clone();
    out_headers.push_field(DEFAULT_TARGET_COLUMN);
    out_headers.push_field(ANY_READMISSION_COLUMN);
    writer.write_record(&out_headers)?;

    let mut rows = 0u64;
    let mut positives = 0u64;
    let mut record = StringRecord::new();
    while reader.read_record(&mut record)? {
        let disposition = record.get(disposition_index).unwrap_or("");
        let thirty_day = if disposition == "<30" { "1" } else { "0" };
        let any = if disposition != "NO" { "1" } else { "0" };

        let mut cleaned = StringRecord::new();
        for field in record.iter() {
            cleaned.push_field(if field == RAW_MISSING_TOKEN { "" } else { field });
        }
        cleaned.push_field(thirty_day);
        cleaned.push_field(any);
        writer.write_record(&cleaned)?;

        rows += 1;
        if thirty_day == "1" {
            positives += 1;
        }
    }
    writer.flush().map_err(|source| IngestError::Io {
        path: output.to_path_buf(),
        source,
    })?;

    let summary = IngestSummary { rows, positives };
    println!("Cleaned {} rows -> {}", summary.rows, output.display());
    println!(
        "30-day readmissions: {} ({:.2}% of rows)",
        summary.positives,
        summary.positive_rate() * 100.0
    );
    Ok(summary)
}
