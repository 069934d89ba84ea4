//! # Inference Adapter
//!
//! Wraps a loaded model bundle behind the request shape the serving layer
//! speaks: a JSON map of feature name to scalar. Requests may supply any
//! subset of the training schema; absent features flow through the fitted
//! imputation exactly like missing values did at training time. Keys
//! outside the schema are rejected up front, before any scoring work, with
//! the offending names listed in sorted order.
//!
//! Value coercion follows the fitted column kind, not the JSON type:
//! numeric columns take numbers or booleans, categorical columns take
//! strings, numbers, or booleans rendered to text, and `null` always means
//! missing. Anything else is a per-request error naming the column.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::artifact::{ArtifactError, ModelBundle, load_bundle};
use crate::data::{Column, ColumnData, FeatureTable};
use crate::preprocess::{PreprocessError, Preprocessor};

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("request contains unknown feature keys: {}", extra_keys.join(", "))]
    UnknownFeatures { extra_keys: Vec<String> },
    #[error("feature '{column}' expects a {expected} value")]
    InvalidValue {
        column: String,
        expected: &'static str,
    },
    #[error("scoring failed: {0}")]
    Preprocess(#[from] PreprocessError),
}

/// One scored encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub probability: f64,
    pub label: u8,
    pub threshold: f64,
    pub model_name: String,
}

/// A model bundle ready to score requests.
pub struct ReadmissionModel {
    bundle: ModelBundle,
    preprocessor: Preprocessor,
}

impl ReadmissionModel {
    /// Loads the bundle from an artifact directory. Any missing or
    /// malformed artifact is fatal here, never at request time.
    pub fn load(directory: &Path) -> Result<Self, ArtifactError> {
        Ok(Self::from_bundle(load_bundle(directory)?))
    }

    pub fn from_bundle(bundle: ModelBundle) -> Self {
        let preprocessor = Preprocessor::with_state(bundle.preprocessor.clone());
        ReadmissionModel {
            bundle,
            preprocessor,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.bundle.model_name
    }

    pub fn threshold(&self) -> f64 {
        self.bundle.threshold
    }

    pub fn feature_columns(&self) -> &[String] {
        &self.bundle.feature_columns
    }

    /// Scores a single feature map.
    pub fn predict(&self, features: &Map<String, Value>) -> Result<Prediction, PredictError> {
        let schema: HashSet<&str> = self
            .bundle
            .feature_columns
            .iter()
            .map(String::as_str)
            .collect();
        let mut extra_keys: Vec<String> = features
            .keys()
            .filter(|key| !schema.contains(key.as_str()))
            .cloned()
            .collect();
        if !extra_keys.is_empty() {
            extra_keys.sort_unstable();
            return Err(PredictError::UnknownFeatures { extra_keys });
        }

        let state = &self.bundle.preprocessor;
        let mut columns = Vec::with_capacity(state.numeric.len() + state.categorical.len());
        for numeric in &state.numeric {
            let value = coerce_numeric(&numeric.name, features.get(&numeric.name))?;
            columns.push(Column {
                name: numeric.name.clone(),
                data: ColumnData::Numeric(vec![value]),
            });
        }
        for categorical in &state.categorical {
            let value = coerce_categorical(&categorical.name, features.get(&categorical.name))?;
            columns.push(Column {
                name: categorical.name.clone(),
                data: ColumnData::Categorical(vec![value]),
            });
        }

        let table = FeatureTable::from_columns(columns);
        let design = self.preprocessor.transform(&table)?;
        let probabilities = self.bundle.classifier.predict_probability(design.view());
        let probability = probabilities[0];
        Ok(Prediction {
            probability,
            label: u8::from(probability >= self.bundle.threshold),
            threshold: self.bundle.threshold,
            model_name: self.bundle.model_name.clone(),
        })
    }

    /// Scores every row of a table through the single-encounter path.
    ///
    /// The table's columns are intersected with the schema: schema columns
    /// the table lacks are missing for every row, and table columns outside
    /// the schema (identifiers, labels) are ignored rather than rejected.
    pub fn score_table(&self, table: &FeatureTable) -> Result<Vec<Prediction>, PredictError> {
        let schema: HashSet<&str> = self
            .bundle
            .feature_columns
            .iter()
            .map(String::as_str)
            .collect();

        let mut predictions = Vec::with_capacity(table.n_rows());
        for row in 0..table.n_rows() {
            let mut features = Map::new();
            for column in table.columns() {
                if !schema.contains(column.name.as_str()) {
                    continue;
                }
                match &column.data {
                    ColumnData::Numeric(values) => {
                        if let Some(number) =
                            values[row].and_then(serde_json::Number::from_f64)
                        {
                            features.insert(column.name.clone(), Value::Number(number));
                        }
                    }
                    ColumnData::Categorical(values) => {
                        if let Some(text) = &values[row] {
                            features.insert(column.name.clone(), Value::String(text.clone()));
                        }
                    }
                }
            }
            predictions.push(self.predict(&features)?);
        }
        Ok(predictions)
    }
}

fn coerce_numeric(column: &str, value: Option<&Value>) -> Result<Option<f64>, PredictError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => match number.as_f64() {
            Some(v) if v.is_finite() => Ok(Some(v)),
            _ => Err(PredictError::InvalidValue {
                column: column.to_string(),
                expected: "numeric",
            }),
        },
        Some(Value::Bool(flag)) => Ok(Some(if *flag { 1.0 } else { 0.0 })),
        Some(_) => Err(PredictError::InvalidValue {
            column: column.to_string(),
            expected: "numeric",
        }),
    }
}

fn coerce_categorical(
    column: &str,
    value: Option<&Value>,
) -> Result<Option<String>, PredictError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(_) => Err(PredictError::InvalidValue {
            column: column.to_string(),
            expected: "categorical",
        }),
    }
}
