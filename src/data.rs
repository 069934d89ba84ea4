//! # Encounter Table Loading and Schema Splitting
//!
//! This module is the entry point for user-provided encounter data. It reads
//! a CSV export into a columnar [`FeatureTable`], decides once per column
//! whether it is numeric or categorical, and separates the modelling features
//! from the prediction target.
//!
//! - Column identity is the name, never the position. Every downstream lookup
//!   goes through [`FeatureTable::column`].
//! - Identifier columns (`encounter_id`, `patient_nbr`) and the readmission
//!   label variants are never allowed into the feature set. The label
//!   variants all encode the outcome being predicted, so keeping any of them
//!   would leak the answer into the features.
//! - Failures are assumed to be user-input errors. The `SchemaError` enum is
//!   designed to give clear, actionable feedback.

use ndarray::Array1;
use polars::prelude::{
    Column as PolarsColumn, CsvReadOptions, CsvReader, DataType, PolarsError, SerReader,
};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Columns that identify an encounter or a patient. They must be present in
/// training exports and are always excluded from the feature set.
pub const IDENTIFIER_COLUMNS: &[&str] = &["encounter_id", "patient_nbr"];

/// Every variant of the readmission outcome that may appear in an export.
/// Any of these found alongside the target is dropped from the features.
pub const LEAKAGE_COLUMNS: &[&str] = &["readmitted", "readmission_30d", "readmission_any"];

/// The label the pipeline trains against unless configured otherwise.
pub const DEFAULT_TARGET_COLUMN: &str = "readmission_30d";

/// The values of one column, typed once at load time.
///
/// Numeric holds source columns that parsed as numbers or booleans (booleans
/// coerced to 0.0/1.0). Everything else lands in Categorical as text. `None`
/// is a missing value in both representations.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(values) => values.len(),
            ColumnData::Categorical(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named, typed, nullable column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn is_numeric(&self) -> bool {
        matches!(self.data, ColumnData::Numeric(_))
    }
}

/// A columnar table of encounters. All columns have the same length.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    columns: Vec<Column>,
    n_rows: usize,
}

impl FeatureTable {
    /// Builds a table from pre-validated columns. Callers must supply columns
    /// of equal length; the row count is taken from the first column.
    pub(crate) fn from_columns(columns: Vec<Column>) -> Self {
        let n_rows = columns.first().map_or(0, |c| c.data.len());
        FeatureTable { columns, n_rows }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns a new table containing the given rows, in the given order.
    /// Used to carve cross-validation folds out of the training table.
    pub fn select_rows(&self, indices: &[usize]) -> FeatureTable {
        let columns = self
            .columns
            .iter()
            .map(|column| {
                let data = match &column.data {
                    ColumnData::Numeric(values) => {
                        ColumnData::Numeric(indices.iter().map(|&i| values[i]).collect())
                    }
                    ColumnData::Categorical(values) => ColumnData::Categorical(
                        indices.iter().map(|&i| values[i].clone()).collect(),
                    ),
                };
                Column {
                    name: column.name.clone(),
                    data,
                }
            })
            .collect();
        FeatureTable {
            columns,
            n_rows: indices.len(),
        }
    }

    fn drop_columns(&self, names: &HashSet<&str>) -> FeatureTable {
        let columns: Vec<Column> = self
            .columns
            .iter()
            .filter(|c| !names.contains(c.name.as_str()))
            .cloned()
            .collect();
        FeatureTable {
            columns,
            n_rows: self.n_rows,
        }
    }
}

/// All the ways loading or splitting an encounter table can fail.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("the input table contains no data rows")]
    EmptyTable,
    #[error("the target column '{0}' was not found in the input table")]
    TargetColumnNotFound(String),
    #[error("the required identifier column '{0}' was not found in the input table")]
    IdentifierColumnNotFound(String),
    #[error(
        "the target column '{column_name}' must be numeric with values 0 and 1 (found type: {found_type})"
    )]
    TargetWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("the target column '{0}' contains missing values")]
    TargetMissingValues(String),
    #[error("the target column '{column_name}' must be binary; found value {value} at row {row}")]
    TargetNotBinary {
        column_name: String,
        value: f64,
        row: usize,
    },
    #[error("the target column '{0}' contains a single class; training requires both outcomes")]
    TargetSingleClass(String),
}

/// Reads an encounter CSV into a typed columnar table.
///
/// Numeric and boolean source columns become [`ColumnData::Numeric`]; all
/// other dtypes become [`ColumnData::Categorical`] text. Non-finite numeric
/// entries are treated as missing values.
pub fn load_feature_table(path: &Path) -> Result<FeatureTable, SchemaError> {
    println!("Loading encounter data from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;

    if df.height() == 0 {
        return Err(SchemaError::EmptyTable);
    }

    let mut columns = Vec::with_capacity(df.width());
    for name in df.get_column_names() {
        let series = df.column(name.as_str())?;
        let data = if internal::is_numeric_dtype(series.dtype()) {
            ColumnData::Numeric(internal::extract_numeric(series)?)
        } else {
            ColumnData::Categorical(internal::extract_categorical(series)?)
        };
        columns.push(Column {
            name: name.to_string(),
            data,
        });
    }

    let table = FeatureTable {
        n_rows: df.height(),
        columns,
    };
    println!(
        "Loaded {} rows with {} columns.",
        table.n_rows(),
        table.n_columns()
    );
    Ok(table)
}

/// Separates the modelling features from the target label.
///
/// The target column and both identifier columns must exist. The returned
/// feature table has the target, the identifiers, and every present leakage
/// variant removed; the target comes back as a validated 0/1 vector.
pub fn split_features(
    table: &FeatureTable,
    target_column: &str,
) -> Result<(FeatureTable, Array1<f64>), SchemaError> {
    if table.column(target_column).is_none() {
        return Err(SchemaError::TargetColumnNotFound(target_column.to_string()));
    }
    for &identifier in IDENTIFIER_COLUMNS {
        if table.column(identifier).is_none() {
            return Err(SchemaError::IdentifierColumnNotFound(identifier.to_string()));
        }
    }

    let y = internal::extract_target(table, target_column)?;

    let mut dropped: HashSet<&str> = HashSet::new();
    dropped.insert(target_column);
    dropped.extend(IDENTIFIER_COLUMNS);
    dropped.extend(LEAKAGE_COLUMNS);
    let features = table.drop_columns(&dropped);

    Ok((features, y))
}

mod internal {
    use super::*;

    pub(super) fn is_numeric_dtype(dtype: &DataType) -> bool {
        matches!(
            dtype,
            DataType::Float32
                | DataType::Float64
                | DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Boolean
        )
    }

    pub(super) fn extract_numeric(series: &PolarsColumn) -> Result<Vec<Option<f64>>, SchemaError> {
        let casted = series.cast(&DataType::Float64)?;
        let chunked = casted.f64()?;
        Ok(chunked
            .into_iter()
            .map(|value| value.filter(|v| v.is_finite()))
            .collect())
    }

    pub(super) fn extract_categorical(
        series: &PolarsColumn,
    ) -> Result<Vec<Option<String>>, SchemaError> {
        let casted = series.cast(&DataType::String)?;
        let chunked = casted.str()?;
        Ok(chunked
            .into_iter()
            .map(|value| value.map(|s| s.to_string()))
            .collect())
    }

    pub(super) fn extract_target(
        table: &FeatureTable,
        target_column: &str,
    ) -> Result<Array1<f64>, SchemaError> {
        // Presence is checked by the caller.
        let column = match table.column(target_column) {
            Some(column) => column,
            None => return Err(SchemaError::TargetColumnNotFound(target_column.to_string())),
        };

        let values = match &column.data {
            ColumnData::Numeric(values) => values,
            ColumnData::Categorical(_) => {
                return Err(SchemaError::TargetWrongType {
                    column_name: target_column.to_string(),
                    found_type: "text".to_string(),
                });
            }
        };

        let mut y = Vec::with_capacity(values.len());
        let mut positives = 0usize;
        for (row, value) in values.iter().enumerate() {
            match value {
                None => {
                    return Err(SchemaError::TargetMissingValues(target_column.to_string()));
                }
                Some(v) if *v == 0.0 => y.push(0.0),
                Some(v) if *v == 1.0 => {
                    positives += 1;
                    y.push(1.0);
                }
                Some(v) => {
                    return Err(SchemaError::TargetNotBinary {
                        column_name: target_column.to_string(),
                        value: *v,
                        row,
                    });
                }
            }
        }

        if positives == 0 || positives == y.len() {
            return Err(SchemaError::TargetSingleClass(target_column.to_string()));
        }
        Ok(Array1::from_vec(y))
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_csv(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    /// A small export shaped like the cleaned readmission data: identifiers,
    /// one numeric column, one categorical column with a missing entry, a
    /// boolean column, the raw label, and both derived labels.
    fn sample_csv() -> String {
        let header =
            "encounter_id,patient_nbr,time_in_hospital,race,on_insulin,readmitted,readmission_30d,readmission_any";
        let rows = [
            "1,100,3,Caucasian,true,NO,0,0",
            "2,101,7,AfricanAmerican,false,<30,1,1",
            "3,102,1,,true,>30,0,1",
            "4,103,5,Caucasian,false,<30,1,1",
        ];
        format!("{}\n{}", header, rows.join("\n"))
    }

    #[test]
    fn load_types_columns_by_dtype() {
        let file = create_test_csv(&sample_csv()).unwrap();
        let table = load_feature_table(file.path()).unwrap();

        assert_eq!(table.n_rows(), 4);
        assert!(table.column("time_in_hospital").unwrap().is_numeric());
        assert!(!table.column("race").unwrap().is_numeric());
        // Booleans coerce onto the numeric path as 0/1.
        match &table.column("on_insulin").unwrap().data {
            ColumnData::Numeric(values) => {
                assert_eq!(values[0], Some(1.0));
                assert_eq!(values[1], Some(0.0));
            }
            other => panic!("expected numeric boolean column, got {other:?}"),
        }
        // The empty race field survives as a missing value.
        match &table.column("race").unwrap().data {
            ColumnData::Categorical(values) => assert_eq!(values[2], None),
            other => panic!("expected categorical race column, got {other:?}"),
        }
    }

    #[test]
    fn split_removes_identifiers_and_label_variants() {
        let file = create_test_csv(&sample_csv()).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let (features, y) = split_features(&table, "readmission_30d").unwrap();

        let names = features.column_names();
        assert_eq!(names, vec!["time_in_hospital", "race", "on_insulin"]);
        assert_eq!(y.to_vec(), vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn split_fails_when_target_is_absent() {
        let file = create_test_csv(&sample_csv()).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let err = split_features(&table, "no_such_label").unwrap_err();
        match err {
            SchemaError::TargetColumnNotFound(name) => assert_eq!(name, "no_such_label"),
            other => panic!("expected TargetColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn split_fails_when_identifier_is_absent() {
        let content = "encounter_id,time_in_hospital,readmission_30d\n1,3,0\n2,7,1";
        let file = create_test_csv(content).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let err = split_features(&table, "readmission_30d").unwrap_err();
        match err {
            SchemaError::IdentifierColumnNotFound(name) => assert_eq!(name, "patient_nbr"),
            other => panic!("expected IdentifierColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn split_fails_on_non_binary_target() {
        let content = "encounter_id,patient_nbr,time_in_hospital,readmission_30d\n\
                       1,100,3,0\n2,101,7,2\n3,102,1,1";
        let file = create_test_csv(content).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let err = split_features(&table, "readmission_30d").unwrap_err();
        match err {
            SchemaError::TargetNotBinary { value, row, .. } => {
                assert_eq!(value, 2.0);
                assert_eq!(row, 1);
            }
            other => panic!("expected TargetNotBinary, got {other:?}"),
        }
    }

    #[test]
    fn split_fails_on_single_class_target() {
        let content = "encounter_id,patient_nbr,time_in_hospital,readmission_30d\n\
                       1,100,3,0\n2,101,7,0\n3,102,1,0";
        let file = create_test_csv(content).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let err = split_features(&table, "readmission_30d").unwrap_err();
        assert!(matches!(err, SchemaError::TargetSingleClass(_)));
    }

    #[test]
    fn split_fails_on_text_target() {
        let content = "encounter_id,patient_nbr,time_in_hospital,readmitted\n\
                       1,100,3,NO\n2,101,7,<30";
        let file = create_test_csv(content).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let err = split_features(&table, "readmitted").unwrap_err();
        assert!(matches!(err, SchemaError::TargetWrongType { .. }));
    }

    #[test]
    fn select_rows_reorders_and_subsets() {
        let file = create_test_csv(&sample_csv()).unwrap();
        let table = load_feature_table(file.path()).unwrap();
        let subset = table.select_rows(&[3, 0]);

        assert_eq!(subset.n_rows(), 2);
        match &subset.column("time_in_hospital").unwrap().data {
            ColumnData::Numeric(values) => assert_eq!(values, &vec![Some(5.0), Some(3.0)]),
            other => panic!("expected numeric column, got {other:?}"),
        }
        match &subset.column("race").unwrap().data {
            ColumnData::Categorical(values) => {
                assert_eq!(values[0].as_deref(), Some("Caucasian"));
            }
            other => panic!("expected categorical column, got {other:?}"),
        }
    }
}
