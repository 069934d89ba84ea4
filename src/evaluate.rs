//! # Cross-Validated Candidate Evaluation
//!
//! Runs every candidate model through stratified K-fold cross-validation
//! and produces a ranked scoreboard. Preprocessing is fit inside each fold
//! on the training rows only, so no statistic of a held-out row ever leaks
//! into the state that scores it.
//!
//! Each candidate is summarized from its merged out-of-fold probability
//! vector: ranking metrics (ROC-AUC, PR-AUC) plus the operating point the
//! threshold policy selects on those same probabilities. Candidates are
//! ordered by PR-AUC, which is the metric that matters under the class
//! imbalance this pipeline is built for.

use ndarray::{Array1, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::classifier::{ClassifierSpec, FitError, candidate_models};
use crate::data::FeatureTable;
use crate::metrics::{average_precision, roc_auc};
use crate::preprocess::{DEFAULT_TOP_K, PreprocessError, Preprocessor};
use crate::threshold::{ThresholdError, ThresholdPolicy, ThresholdRow, select_threshold};

/// Knobs of the evaluation stage. The seed drives both the fold shuffle
/// and the forest candidate, so one value reproduces an entire run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalConfig {
    pub folds: usize,
    pub seed: u64,
    pub top_k: usize,
    pub policy: ThresholdPolicy,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            folds: 5,
            seed: 42,
            top_k: DEFAULT_TOP_K,
            policy: ThresholdPolicy::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum EvalError {
    #[error("cross-validation needs at least 2 folds; got {0}")]
    TooFewFolds(usize),
    #[error("class {label} has only {count} rows; stratification into {folds} folds needs at least {folds}")]
    ClassSmallerThanFoldCount {
        label: u8,
        count: usize,
        folds: usize,
    },
    #[error("candidate fit failed: {0}")]
    Fit(#[from] FitError),
    #[error("fold preprocessing failed: {0}")]
    Preprocess(#[from] PreprocessError),
    #[error("threshold selection failed: {0}")]
    Threshold(#[from] ThresholdError),
}

/// One candidate's cross-validation scoreboard line. Serialized verbatim
/// into `cv_results.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvResult {
    pub model_name: String,
    pub roc_auc: f64,
    pub pr_auc: f64,
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// A scoreboard line plus the per-grid-point analysis behind its operating
/// point and the classifier spec that produced it, kept so the winner can be refit on
/// the full table. The winner's table becomes `threshold_analysis.csv`.
#[derive(Debug, Clone)]
pub struct CandidateEvaluation {
    pub spec: ClassifierSpec,
    pub summary: CvResult,
    pub threshold_table: Vec<ThresholdRow>,
}

/// Splits row indices into stratified folds.
///
/// Each class's indices are shuffled once with a seeded generator and dealt
/// round-robin, so fold sizes per class differ by at most one and the
/// per-fold positive rate tracks the global rate. Every row lands in
/// exactly one fold.
pub fn stratified_folds(
    target: ArrayView1<f64>,
    folds: usize,
    seed: u64,
) -> Result<Vec<Vec<usize>>, EvalError> {
    if folds < 2 {
        return Err(EvalError::TooFewFolds(folds));
    }

    let mut negatives = Vec::new();
    let mut positives = Vec::new();
    for (row, &label) in target.iter().enumerate() {
        if label == 1.0 {
            positives.push(row);
        } else {
            negatives.push(row);
        }
    }
    for (label, class) in [(0u8, &negatives), (1u8, &positives)] {
        if class.len() < folds {
            return Err(EvalError::ClassSmallerThanFoldCount {
                label,
                count: class.len(),
                folds,
            });
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    negatives.shuffle(&mut rng);
    positives.shuffle(&mut rng);

    let mut assignments = vec![Vec::new(); folds];
    for (i, row) in negatives.into_iter().enumerate() {
        assignments[i % folds].push(row);
    }
    for (i, row) in positives.into_iter().enumerate() {
        assignments[i % folds].push(row);
    }
    Ok(assignments)
}

/// Scores every row exactly once with a model that never saw it.
///
/// Folds run in parallel; each fold fits a fresh preprocessor and a fresh
/// classifier on the complement rows, scores its held-out rows, and the
/// per-fold scores merge back by row index.
pub(crate) fn out_of_fold_probabilities(
    features: &FeatureTable,
    target: &Array1<f64>,
    fold_assignments: &[Vec<usize>],
    spec: &ClassifierSpec,
    top_k: usize,
) -> Result<Array1<f64>, EvalError> {
    let n = features.n_rows();
    let fold_scores: Result<Vec<(&[usize], Array1<f64>)>, EvalError> = fold_assignments
        .par_iter()
        .map(|test_rows| {
            let mut in_test = vec![false; n];
            for &row in test_rows {
                in_test[row] = true;
            }
            let train_rows: Vec<usize> = (0..n).filter(|&row| !in_test[row]).collect();

            let train_table = features.select_rows(&train_rows);
            let test_table = features.select_rows(test_rows);
            let y_train = Array1::from_iter(train_rows.iter().map(|&row| target[row]));

            let mut preprocessor = Preprocessor::new(top_k);
            preprocessor.fit(&train_table);
            let x_train = preprocessor.transform(&train_table)?;
            let x_test = preprocessor.transform(&test_table)?;

            let fitted = spec.fit(x_train.view(), y_train.view())?;
            Ok((
                test_rows.as_slice(),
                fitted.predict_probability(x_test.view()),
            ))
        })
        .collect();

    let mut merged = Array1::<f64>::zeros(n);
    for (rows, probabilities) in fold_scores? {
        for (&row, &probability) in rows.iter().zip(probabilities.iter()) {
            merged[row] = probability;
        }
    }
    Ok(merged)
}

/// Cross-validates the full candidate set and returns it best-first.
pub fn evaluate_candidates(
    features: &FeatureTable,
    target: &Array1<f64>,
    config: &EvalConfig,
) -> Result<Vec<CandidateEvaluation>, EvalError> {
    let fold_assignments = stratified_folds(target.view(), config.folds, config.seed)?;

    let mut evaluations = Vec::new();
    for spec in candidate_models(config.seed) {
        log::info!(
            "cross-validating candidate '{}' over {} folds",
            spec.name(),
            config.folds
        );
        let oof = out_of_fold_probabilities(
            features,
            target,
            &fold_assignments,
            &spec,
            config.top_k,
        )?;
        let selection = select_threshold(target.view(), oof.view(), &config.policy)?;
        let summary = CvResult {
            model_name: spec.name().to_string(),
            roc_auc: roc_auc(target.view(), oof.view()),
            pr_auc: average_precision(target.view(), oof.view()),
            threshold: selection.selected.threshold,
            precision: selection.selected.precision,
            recall: selection.selected.recall,
            f1: selection.selected.f1,
        };
        log::info!(
            "candidate '{}': ROC-AUC {:.4}, PR-AUC {:.4}, threshold {:.2}",
            summary.model_name,
            summary.roc_auc,
            summary.pr_auc,
            summary.threshold
        );
        evaluations.push(CandidateEvaluation {
            spec,
            summary,
            threshold_table: selection.rows,
        });
    }

    rank_candidates(&mut evaluations);
    Ok(evaluations)
}

/// Best candidate first: PR-AUC descending, ROC-AUC breaking ties. The
/// sort is stable, so exact ties keep the candidate-set order.
pub fn rank_candidates(evaluations: &mut [CandidateEvaluation]) {
    evaluations.sort_by(|a, b| {
        b.summary
            .pr_auc
            .total_cmp(&a.summary.pr_auc)
            .then(b.summary.roc_auc.total_cmp(&a.summary.roc_auc))
    });
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, ColumnData, FeatureTable};

    fn imbalanced_target(n: usize) -> Array1<f64> {
        Array1::from_shape_fn(n, |i| if i % 10 == 0 { 1.0 } else { 0.0 })
    }

    #[test]
    fn folds_partition_rows_and_preserve_class_balance() {
        let target = imbalanced_target(1000);
        let folds = stratified_folds(target.view(), 5, 42).unwrap();

        assert_eq!(folds.len(), 5);
        let mut seen = vec![0usize; 1000];
        for fold in &folds {
            for &row in fold {
                seen[row] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));

        for fold in &folds {
            let positives = fold.iter().filter(|&&row| target[row] == 1.0).count();
            let rate = positives as f64 / fold.len() as f64;
            assert!((rate - 0.1).abs() <= 0.02, "fold positive rate {rate}");
        }
    }

    #[test]
    fn fold_assignment_is_seeded() {
        let target = imbalanced_target(1000);
        let first = stratified_folds(target.view(), 5, 42).unwrap();
        let second = stratified_folds(target.view(), 5, 42).unwrap();
        let shifted = stratified_folds(target.view(), 5, 43).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, shifted);
    }

    #[test]
    fn a_class_smaller_than_the_fold_count_is_rejected() {
        let target = Array1::from_vec(vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let error = stratified_folds(target.view(), 5, 42).unwrap_err();
        assert!(matches!(
            error,
            EvalError::ClassSmallerThanFoldCount {
                label: 1,
                count: 3,
                folds: 5
            }
        ));
    }

    #[test]
    fn fewer_than_two_folds_is_rejected() {
        let target = imbalanced_target(100);
        assert!(matches!(
            stratified_folds(target.view(), 1, 42).unwrap_err(),
            EvalError::TooFewFolds(1)
        ));
    }

    /// A linearly separable table with one numeric and one categorical
    /// column, half positive.
    fn separable_table(n: usize) -> (FeatureTable, Array1<f64>) {
        let target = Array1::from_shape_fn(n, |i| if i % 2 == 0 { 1.0 } else { 0.0 });
        let severity: Vec<Option<f64>> = (0..n)
            .map(|i| {
                let jitter = (i % 5) as f64 * 0.01;
                if i % 2 == 0 {
                    Some(2.0 + jitter)
                } else {
                    Some(jitter)
                }
            })
            .collect();
        let admission: Vec<Option<String>> = (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Some("emergency".to_string())
                } else {
                    Some("elective".to_string())
                }
            })
            .collect();
        let table = FeatureTable::from_columns(vec![
            Column {
                name: "severity".to_string(),
                data: ColumnData::Numeric(severity),
            },
            Column {
                name: "admission_type".to_string(),
                data: ColumnData::Categorical(admission),
            },
        ]);
        (table, target)
    }

    #[test]
    fn out_of_fold_scores_cover_every_row() {
        let (table, target) = separable_table(40);
        let folds = stratified_folds(target.view(), 4, 7).unwrap();
        let logreg = candidate_models(7)
            .into_iter()
            .find(|spec| spec.name() == "logreg")
            .unwrap();

        let oof = out_of_fold_probabilities(&table, &target, &folds, &logreg, 30).unwrap();

        assert_eq!(oof.len(), 40);
        // A merged vector initializes at zero; the sigmoid never emits an
        // exact 0 or 1 on this data, so a zero would mean an unscored row.
        assert!(oof.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn candidates_come_back_ranked_with_full_analysis() {
        let (table, target) = separable_table(40);
        let config = EvalConfig {
            folds: 4,
            seed: 7,
            ..EvalConfig::default()
        };

        let evaluations = evaluate_candidates(&table, &target, &config).unwrap();

        assert_eq!(evaluations.len(), 2);
        let mut names: Vec<&str> = evaluations
            .iter()
            .map(|e| e.summary.model_name.as_str())
            .collect();
        names.sort_unstable();
        assert_eq!(names, vec!["logreg", "rf"]);

        assert!(evaluations[0].summary.pr_auc >= evaluations[1].summary.pr_auc);
        for evaluation in &evaluations {
            assert!(evaluation.summary.roc_auc > 0.9);
            assert!((0.05..=0.95).contains(&evaluation.summary.threshold));
            assert_eq!(evaluation.threshold_table.len(), 91);
        }
    }

    fn scoreboard_line(name: &str, pr_auc: f64, roc_auc: f64) -> CandidateEvaluation {
        CandidateEvaluation {
            spec: ClassifierSpec::Logistic(crate::classifier::LogisticConfig::default()),
            summary: CvResult {
                model_name: name.to_string(),
                roc_auc,
                pr_auc,
                threshold: 0.5,
                precision: 0.0,
                recall: 0.0,
                f1: 0.0,
            },
            threshold_table: Vec::new(),
        }
    }

    #[test]
    fn ranking_prefers_pr_auc_then_roc_auc_then_stays_stable() {
        let mut evaluations = vec![
            scoreboard_line("a", 0.80, 0.70),
            scoreboard_line("b", 0.80, 0.90),
            scoreboard_line("c", 0.90, 0.10),
        ];
        rank_candidates(&mut evaluations);
        let names: Vec<&str> = evaluations
            .iter()
            .map(|e| e.summary.model_name.as_str())
            .collect();
        assert_eq!(names, vec!["c", "b", "a"]);

        let mut tied = vec![
            scoreboard_line("first", 0.5, 0.5),
            scoreboard_line("second", 0.5, 0.5),
        ];
        rank_candidates(&mut tied);
        assert_eq!(tied[0].summary.model_name, "first");
        assert_eq!(tied[1].summary.model_name, "second");
    }
}
