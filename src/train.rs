//! # Training Orchestration
//!
//! The end-to-end `train` flow: load the labeled encounter CSV, split
//! features from the target, cross-validate the candidate set, pick the
//! winner, refit it on every training row, and publish the bundle plus the
//! evaluation reports. Nothing is written until every stage has succeeded,
//! so a failed run never leaves artifacts behind.

use std::path::PathBuf;

use thiserror::Error;

use crate::artifact::{ArtifactError, ModelBundle, write_bundle, write_reports};
use crate::classifier::FitError;
use crate::data::{DEFAULT_TARGET_COLUMN, SchemaError, load_feature_table, split_features};
use crate::evaluate::{CvResult, EvalConfig, EvalError, evaluate_candidates};
use crate::preprocess::{DEFAULT_TOP_K, PreprocessError, Preprocessor};
use crate::threshold::ThresholdPolicy;

/// Everything the `train` subcommand needs. Field defaults mirror the
/// shipped clinical policy; the CLI can override each one.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub data_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub target_column: String,
    pub folds: usize,
    pub seed: u64,
    pub top_k: usize,
    pub policy: ThresholdPolicy,
}

impl TrainConfig {
    pub fn new(data_path: PathBuf, artifact_dir: PathBuf) -> Self {
        TrainConfig {
            data_path,
            artifact_dir,
            target_column: DEFAULT_TARGET_COLUMN.to_string(),
            folds: 5,
            seed: 42,
            top_k: DEFAULT_TOP_K,
            policy: ThresholdPolicy::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("data loading failed: {0}")]
    Schema(#[from] SchemaError),
    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),
    #[error("preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("final model fit failed: {0}")]
    Fit(#[from] FitError),
    #[error("artifact publication failed: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("the candidate set produced no evaluations")]
    NoCandidates,
}

/// What a finished training run reports back.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub model_name: String,
    pub threshold: f64,
    pub evaluations: Vec<CvResult>,
}

/// Runs the full training pipeline and publishes the winning bundle.
pub fn run_training(config: &TrainConfig) -> Result<TrainReport, TrainError> {
    let table = load_feature_table(&config.data_path)?;
    let (features, target) = split_features(&table, &config.target_column)?;
    log::info!(
        "training on {} rows, {} feature columns, target '{}'",
        features.n_rows(),
        features.n_columns(),
        config.target_column
    );

    let eval_config = EvalConfig {
        folds: config.folds,
        seed: config.seed,
        top_k: config.top_k,
        policy: config.policy,
    };
    let evaluations = evaluate_candidates(&features, &target, &eval_config)?;
    let winner = match evaluations.first() {
        Some(winner) => winner,
        None => return Err(TrainError::NoCandidates),
    };

    println!("\n=== Cross-validation results ===");
    for evaluation in &evaluations {
        let s = &evaluation.summary;
        println!(
            "{:>8}: ROC-AUC {:.4} | PR-AUC {:.4} | threshold {:.2} | P {:.3} R {:.3} F1 {:.3}",
            s.model_name, s.roc_auc, s.pr_auc, s.threshold, s.precision, s.recall, s.f1
        );
    }
    println!(
        "Selected model: {} (threshold {:.2})",
        winner.summary.model_name, winner.summary.threshold
    );

    // The winner refits from scratch on the full table; fold-local state is
    // never published.
    let mut preprocessor = Preprocessor::new(config.top_k);
    let state = preprocessor.fit(&features).clone();
    let design = preprocessor.transform(&features)?;
    let classifier = winner.spec.fit(design.view(), target.view())?;

    let bundle = ModelBundle {
        model_name: winner.summary.model_name.clone(),
        threshold: winner.summary.threshold,
        feature_columns: features
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        preprocessor: state,
        classifier,
    };
    write_bundle(&config.artifact_dir, &bundle)?;
    write_reports(&config.artifact_dir, &evaluations)?;
    println!("Artifacts written to {}", config.artifact_dir.display());

    Ok(TrainReport {
        model_name: bundle.model_name,
        threshold: bundle.threshold,
        evaluations: evaluations.into_iter().map(|e| e.summary).collect(),
    })
}
