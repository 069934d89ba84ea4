//! # Feature Preprocessing
//!
//! Turns a nullable, mixed-type [`FeatureTable`] into the dense `f64` design
//! matrix the classifiers consume. All statistics are learned from training
//! rows during `fit` and frozen into a serializable [`PreprocessorState`];
//! `transform` never updates state, so the same bundle scores identically at
//! training time and in serving.
//!
//! Numeric columns: impute missing entries with the training median, then
//! standardize with the training mean and standard deviation.
//!
//! Categorical columns: cap the cardinality at the top-K most frequent
//! training values (everything else becomes the literal [`OTHER_TOKEN`]),
//! impute missing entries with the most frequent value of the reduced
//! column, then one-hot encode over the retained values plus the Other slot.
//! Values never seen in training land on the Other slot rather than failing,
//! which is what lets serving accept arbitrary category strings.

use crate::data::{Column, ColumnData, FeatureTable};
use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// The token that absorbs every category outside a column's retained
/// vocabulary. It always owns the final slot of each one-hot block.
pub const OTHER_TOKEN: &str = "Other";

/// Default cardinality cap per categorical column.
pub const DEFAULT_TOP_K: usize = 30;

/// Training statistics for one numeric column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericColumnState {
    pub name: String,
    /// Median of the non-missing training values; the imputation fill.
    pub median: f64,
    /// Mean of the imputed training column.
    pub mean: f64,
    /// Population standard deviation of the imputed training column.
    /// May be 0.0 for constant columns; see [`NumericColumnState::scale`].
    pub std: f64,
}

impl NumericColumnState {
    /// Divisor used for standardization. Constant columns fall back to 1.0
    /// so they encode as all-zero instead of dividing by zero.
    pub fn scale(&self) -> f64 {
        if self.std > 0.0 { self.std } else { 1.0 }
    }
}

/// Training vocabulary for one categorical column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoricalColumnState {
    pub name: String,
    /// Retained values, most frequent first (ties broken by ascending
    /// lexicographic order). The one-hot block is this list plus Other.
    pub vocabulary: Vec<String>,
    /// Fill for missing values: the most frequent value of the reduced
    /// training column, which may be the Other token itself.
    pub impute_value: String,
}

/// Everything `transform` needs, frozen at fit time. Serialized inside the
/// model bundle so serving reproduces training-time preprocessing exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorState {
    pub numeric: Vec<NumericColumnState>,
    pub categorical: Vec<CategoricalColumnState>,
}

impl PreprocessorState {
    /// Width of the design matrix this state produces: one column per
    /// numeric feature, then one per vocabulary entry plus the Other slot
    /// for each categorical feature.
    pub fn output_width(&self) -> usize {
        let one_hot: usize = self
            .categorical
            .iter()
            .map(|c| c.vocabulary.len() + 1)
            .sum();
        self.numeric.len() + one_hot
    }
}

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("transform was called before fit; fit on training data first")]
    NotFitted,
    #[error("column '{0}' required by the fitted preprocessor is missing from the input")]
    MissingColumn(String),
    #[error("column '{column}' was fitted as {expected} but the input supplies {found} values")]
    KindMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Caps the cardinality of categorical columns.
///
/// `fit` learns the top-K most frequent values per categorical column;
/// `transform` rewrites every other value to [`OTHER_TOKEN`]. Missing values
/// pass through untouched, as do columns the reducer never saw during fit.
#[derive(Debug, Clone)]
pub struct CategoryReducer {
    top_k: usize,
    vocabularies: Option<HashMap<String, Vec<String>>>,
}

impl CategoryReducer {
    pub fn new(top_k: usize) -> Self {
        CategoryReducer {
            top_k,
            vocabularies: None,
        }
    }

    /// Learns per-column vocabularies from the categorical columns of the
    /// table. A column with at most K distinct values keeps all of them.
    pub fn fit(&mut self, table: &FeatureTable) {
        let mut vocabularies = HashMap::new();
        for column in table.columns() {
            if let ColumnData::Categorical(values) = &column.data {
                let ranked = rank_by_frequency(value_counts(values));
                let vocabulary: Vec<String> = ranked
                    .into_iter()
                    .take(self.top_k)
                    .map(|(value, _)| value)
                    .collect();
                vocabularies.insert(column.name.clone(), vocabulary);
            }
        }
        self.vocabularies = Some(vocabularies);
    }

    /// The retained values for a column, most frequent first. `None` before
    /// fit or for columns outside the fitted set.
    pub fn vocabulary(&self, column: &str) -> Option<&[String]> {
        self.vocabularies
            .as_ref()
            .and_then(|v| v.get(column))
            .map(|v| v.as_slice())
    }

    /// Rewrites out-of-vocabulary values to [`OTHER_TOKEN`].
    pub fn transform(&self, table: &FeatureTable) -> Result<FeatureTable, PreprocessError> {
        let vocabularies = self.vocabularies.as_ref().ok_or(PreprocessError::NotFitted)?;

        let columns = table
            .columns()
            .iter()
            .map(|column| {
                let data = match (&column.data, vocabularies.get(&column.name)) {
                    (ColumnData::Categorical(values), Some(vocabulary)) => {
                        let retained: HashSet<&str> =
                            vocabulary.iter().map(|v| v.as_str()).collect();
                        ColumnData::Categorical(
                            values
                                .iter()
                                .map(|value| {
                                    value.as_ref().map(|v| {
                                        if retained.contains(v.as_str()) {
                                            v.clone()
                                        } else {
                                            OTHER_TOKEN.to_string()
                                        }
                                    })
                                })
                                .collect(),
                        )
                    }
                    _ => column.data.clone(),
                };
                Column {
                    name: column.name.clone(),
                    data,
                }
            })
            .collect();

        Ok(FeatureTable::from_columns(columns))
    }
}

/// The full fit/transform pipeline from [`FeatureTable`] to design matrix.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    top_k: usize,
    state: Option<PreprocessorState>,
}

impl Preprocessor {
    pub fn new(top_k: usize) -> Self {
        Preprocessor { top_k, state: None }
    }

    /// Rebuilds a preprocessor from a deserialized bundle state.
    pub fn with_state(state: PreprocessorState) -> Self {
        Preprocessor {
            top_k: DEFAULT_TOP_K,
            state: Some(state),
        }
    }

    pub fn state(&self) -> Option<&PreprocessorState> {
        self.state.as_ref()
    }

    /// Learns imputation, scaling, and vocabulary statistics from the table.
    /// Column kinds are frozen here: whatever loaded as numeric stays on the
    /// numeric path for the lifetime of the state.
    pub fn fit(&mut self, table: &FeatureTable) -> &PreprocessorState {
        let mut reducer = CategoryReducer::new(self.top_k);
        reducer.fit(table);

        let mut numeric = Vec::new();
        let mut categorical = Vec::new();
        for column in table.columns() {
            match &column.data {
                ColumnData::Numeric(values) => {
                    numeric.push(fit_numeric(&column.name, values));
                }
                ColumnData::Categorical(values) => {
                    let vocabulary = reducer
                        .vocabulary(&column.name)
                        .map(|v| v.to_vec())
                        .unwrap_or_default();
                    categorical.push(fit_categorical(&column.name, values, vocabulary));
                }
            }
        }

        self.state.insert(PreprocessorState {
            numeric,
            categorical,
        })
    }

    /// Encodes a table with the fitted state. The output column order is
    /// deterministic: numeric features in schema order, then each
    /// categorical one-hot block (vocabulary order, Other last).
    pub fn transform(&self, table: &FeatureTable) -> Result<Array2<f64>, PreprocessError> {
        let state = self.state.as_ref().ok_or(PreprocessError::NotFitted)?;
        let mut matrix = Array2::zeros((table.n_rows(), state.output_width()));

        let mut offset = 0;
        for column_state in &state.numeric {
            let values = numeric_values(table, &column_state.name)?;
            let scale = column_state.scale();
            for (row, value) in values.iter().enumerate() {
                let raw = value.unwrap_or(column_state.median);
                matrix[[row, offset]] = (raw - column_state.mean) / scale;
            }
            offset += 1;
        }

        for column_state in &state.categorical {
            let values = categorical_values(table, &column_state.name)?;
            let slot_of: HashMap<&str, usize> = column_state
                .vocabulary
                .iter()
                .enumerate()
                .map(|(i, v)| (v.as_str(), i))
                .collect();
            let other_slot = offset + column_state.vocabulary.len();
            for (row, value) in values.iter().enumerate() {
                let value = value.as_deref().unwrap_or(&column_state.impute_value);
                let slot = slot_of
                    .get(value)
                    .map(|&i| offset + i)
                    .unwrap_or(other_slot);
                matrix[[row, slot]] = 1.0;
            }
            offset += column_state.vocabulary.len() + 1;
        }

        Ok(matrix)
    }

    pub fn fit_transform(&mut self, table: &FeatureTable) -> Result<Array2<f64>, PreprocessError> {
        self.fit(table);
        self.transform(table)
    }
}

fn fit_numeric(name: &str, values: &[Option<f64>]) -> NumericColumnState {
    let mut present: Vec<f64> = values.iter().flatten().copied().collect();
    present.sort_unstable_by(f64::total_cmp);
    // An all-missing column imputes to 0.0 and encodes as constant.
    let median = if present.is_empty() {
        0.0
    } else if present.len() % 2 == 1 {
        present[present.len() / 2]
    } else {
        let upper = present.len() / 2;
        (present[upper - 1] + present[upper]) / 2.0
    };

    let n = values.len() as f64;
    let imputed = values.iter().map(|v| v.unwrap_or(median));
    let mean = if values.is_empty() {
        0.0
    } else {
        imputed.clone().sum::<f64>() / n
    };
    let variance = if values.is_empty() {
        0.0
    } else {
        imputed.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
    };

    NumericColumnState {
        name: name.to_string(),
        median,
        mean,
        std: variance.sqrt(),
    }
}

fn fit_categorical(
    name: &str,
    values: &[Option<String>],
    vocabulary: Vec<String>,
) -> CategoricalColumnState {
    let counts = value_counts(values);
    let total: usize = counts.values().sum();
    let retained: usize = vocabulary
        .iter()
        .map(|v| counts.get(v).copied().unwrap_or(0))
        .sum();
    let other_mass = total - retained;

    // Mode of the reduced column: retained values compete with the pooled
    // Other bucket.
    let mut candidates: Vec<(String, usize)> = vocabulary
        .iter()
        .map(|v| (v.clone(), counts.get(v).copied().unwrap_or(0)))
        .collect();
    if other_mass > 0 {
        candidates.push((OTHER_TOKEN.to_string(), other_mass));
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let impute_value = candidates
        .into_iter()
        .next()
        .map(|(value, _)| value)
        .unwrap_or_else(|| OTHER_TOKEN.to_string());

    CategoricalColumnState {
        name: name.to_string(),
        vocabulary,
        impute_value,
    }
}

fn value_counts(values: &[Option<String>]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for value in values.iter().flatten() {
        *counts.entry(value.clone()).or_insert(0) += 1;
    }
    counts
}

/// Orders values by descending frequency, breaking ties by ascending
/// lexicographic order so vocabularies are stable across runs.
fn rank_by_frequency(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    counts
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect()
}

fn numeric_values<'t>(
    table: &'t FeatureTable,
    name: &str,
) -> Result<&'t [Option<f64>], PreprocessError> {
    let column = table
        .column(name)
        .ok_or_else(|| PreprocessError::MissingColumn(name.to_string()))?;
    match &column.data {
        ColumnData::Numeric(values) => Ok(values),
        ColumnData::Categorical(_) => Err(PreprocessError::KindMismatch {
            column: name.to_string(),
            expected: "numeric",
            found: "text",
        }),
    }
}

fn categorical_values<'t>(
    table: &'t FeatureTable,
    name: &str,
) -> Result<&'t [Option<String>], PreprocessError> {
    let column = table
        .column(name)
        .ok_or_else(|| PreprocessError::MissingColumn(name.to_string()))?;
    match &column.data {
        ColumnData::Categorical(values) => Ok(values),
        ColumnData::Numeric(_) => Err(PreprocessError::KindMismatch {
            column: name.to_string(),
            expected: "text",
            found: "numeric",
        }),
    }
}
