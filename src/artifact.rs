//! # Model Bundle Persistence
//!
//! Serializes the published model to a directory of three artifacts plus
//! two CSV reports:
//!
//! - `model.toml` holds the complete bundle (preprocessing state, fitted
//!   classifier, schema, threshold) as pretty TOML.
//! - `threshold.json` and `feature_columns.json` are small sidecars in the
//!   shape downstream consumers read. At load time the sidecars are
//!   authoritative: an operator can retune the threshold by editing
//!   `threshold.json` without retraining.
//! - `cv_results.csv` and `threshold_analysis.csv` record how the winner
//!   was chosen.
//!
//! Artifact writes go through a temp-file-then-rename step in the target
//! directory, so a crash mid-write never leaves a truncated file under a
//! final artifact name.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::FittedClassifier;
use crate::evaluate::CandidateEvaluation;
use crate::preprocess::PreprocessorState;

pub const MODEL_FILE: &str = "model.toml";
pub const THRESHOLD_FILE: &str = "threshold.json";
pub const FEATURE_COLUMNS_FILE: &str = "feature_columns.json";
pub const CV_RESULTS_FILE: &str = "cv_results.csv";
pub const THRESHOLD_ANALYSIS_FILE: &str = "threshold_analysis.csv";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact I/O failed for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode the model bundle as TOML: {0}")]
    TomlEncode(#[from] toml::ser::Error),
    #[error("failed to parse '{path}' as TOML: {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to encode JSON: {0}")]
    JsonEncode(#[from] serde_json::Error),
    #[error("failed to parse '{path}' as JSON: {source}")]
    JsonParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("CSV report write failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Everything needed to score an encounter, frozen at publication time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub model_name: String,
    pub threshold: f64,
    /// Training schema order; authoritative for request validation.
    pub feature_columns: Vec<String>,
    pub preprocessor: PreprocessorState,
    pub classifier: FittedClassifier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThresholdSidecar {
    model_name: String,
    threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnsSidecar {
    columns: Vec<String>,
}

/// Writes the three bundle artifacts, each atomically.
pub fn write_bundle(directory: &Path, bundle: &ModelBundle) -> Result<(), ArtifactError> {
    fs::create_dir_all(directory).map_err(|source| ArtifactError::Io {
        path: directory.to_path_buf(),
        source,
    })?;

    let model_toml = toml::to_string_pretty(bundle)?;
    write_atomic(&directory.join(MODEL_FILE), model_toml.as_bytes())?;

    let threshold = ThresholdSidecar {
        model_name: bundle.model_name.clone(),
        threshold: bundle.threshold,
    };
    write_atomic(
        &directory.join(THRESHOLD_FILE),
        serde_json::to_string_pretty(&threshold)?.as_bytes(),
    )?;

    let columns = ColumnsSidecar {
        columns: bundle.feature_columns.clone(),
    };
    write_atomic(
        &directory.join(FEATURE_COLUMNS_FILE),
        serde_json::to_string_pretty(&columns)?.as_bytes(),
    )?;

    log::info!("published model bundle to {}", directory.display());
    Ok(())
}

/// Reads a bundle back, overlaying the sidecar values over the TOML copy.
pub fn load_bundle(directory: &Path) -> Result<ModelBundle, ArtifactError> {
    let model_path = directory.join(MODEL_FILE);
    let model_text = read_artifact(&model_path)?;
    let bundle: ModelBundle =
        toml::from_str(&model_text).map_err(|source| ArtifactError::TomlParse {
            path: model_path,
            source,
        })?;

    let threshold_path = directory.join(THRESHOLD_FILE);
    let threshold: ThresholdSidecar = serde_json::from_str(&read_artifact(&threshold_path)?)
        .map_err(|source| ArtifactError::JsonParse {
            path: threshold_path,
            source,
        })?;

    let columns_path = directory.join(FEATURE_COLUMNS_FILE);
    let columns: ColumnsSidecar = serde_json::from_str(&read_artifact(&columns_path)?)
        .map_err(|source| ArtifactError::JsonParse {
            path: columns_path,
            source,
        })?;

    Ok(ModelBundle {
        model_name: threshold.model_name,
        threshold: threshold.threshold,
        feature_columns: columns.columns,
        ..bundle
    })
}

/// Writes the candidate scoreboard and the winner's threshold sweep.
/// The evaluations must already be ranked best-first.
pub fn write_reports(
    directory: &Path,
    evaluations: &[CandidateEvaluation],
) -> Result<(), ArtifactError> {
    let cv_path = directory.join(CV_RESULTS_FILE);
    let mut writer = csv::Writer::from_path(&cv_path)?;
    for evaluation in evaluations {
        writer.serialize(&evaluation.summary)?;
    }
    writer.flush().map_err(|source| ArtifactError::Io {
        path: cv_path,
        source,
    })?;

    if let Some(winner) = evaluations.first() {
        let analysis_path = directory.join(THRESHOLD_ANALYSIS_FILE);
        let mut writer = csv::Writer::from_path(&analysis_path)?;
        for row in &winner.threshold_table {
            writer.serialize(row)?;
        }
        writer.flush().map_err(|source| ArtifactError::Io {
            path: analysis_path,
            source,
        })?;
    }
    Ok(())
}

fn read_artifact(path: &Path) -> Result<String, ArtifactError> {
    fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ArtifactError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, contents).map_err(|source| ArtifactError::Io {
        path: temp_path.clone(),
        source,
    })?;
    fs::rename(&temp_path, path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}
