//! # Candidate Classifiers
//!
//! The pipeline evaluates a fixed, two-member candidate set: an
//! L2-regularized logistic regression and a bagged decision-tree ensemble
//! (see [`crate::forest`]). Both expose the same capability pair, fit on a
//! design matrix and per-row probability prediction, through
//! [`ClassifierSpec`] / [`FittedClassifier`] so the evaluator and the bundle
//! never care which family they hold.
//!
//! Class imbalance is handled identically in both families: every row
//! carries a balanced class weight `n / (2 * n_class)`, so the minority
//! readmission class is not drowned out by the majority.
//!
//! The logistic regression is trained by iteratively reweighted least
//! squares on the penalized binomial deviance, with the intercept left
//! unpenalized. The linear predictor is clamped before the sigmoid and the
//! IRLS weights are floored, which keeps quasi-separated fits finite; a
//! step-halving line search guards against deviance increases.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::forest::{ForestConfig, ForestModel, fit_forest};

const MAX_ETA: f64 = 700.0;
const PROB_EPS: f64 = 1e-8;
const MIN_IRLS_WEIGHT: f64 = 1e-6;
const MAX_STEP_HALVINGS: usize = 30;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("cannot fit a model on an empty design matrix")]
    EmptyDesignMatrix,
    #[error("the design matrix has {rows} rows but the target has {targets}")]
    ShapeMismatch { rows: usize, targets: usize },
    #[error("the penalized normal equations are not positive definite")]
    NotPositiveDefinite,
    #[error("deviance failed to decrease after {0} step halvings")]
    StepHalvingFailed(usize),
    #[error("the forest must contain at least one tree")]
    EmptyEnsemble,
}

/// Hyperparameters of the linear candidate. The defaults are what the
/// candidate set ships with; they are fixed, not searched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticConfig {
    pub l2_penalty: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        LogisticConfig {
            l2_penalty: 1.0,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// An unfitted candidate: the family plus its fixed hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClassifierSpec {
    Logistic(LogisticConfig),
    Forest(ForestConfig),
}

impl ClassifierSpec {
    /// Short stable name used in reports, artifacts, and the API response.
    pub fn name(&self) -> &'static str {
        match self {
            ClassifierSpec::Logistic(_) => "logreg",
            ClassifierSpec::Forest(_) => "rf",
        }
    }

    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
    ) -> Result<FittedClassifier, FitError> {
        match self {
            ClassifierSpec::Logistic(config) => {
                Ok(FittedClassifier::Logistic(fit_logistic(x, y, config)?))
            }
            ClassifierSpec::Forest(config) => {
                Ok(FittedClassifier::Forest(fit_forest(x, y, config)?))
            }
        }
    }
}

/// The candidate set the pipeline always evaluates, in report order.
pub fn candidate_models(seed: u64) -> Vec<ClassifierSpec> {
    vec![
        ClassifierSpec::Logistic(LogisticConfig::default()),
        ClassifierSpec::Forest(ForestConfig {
            seed,
            ..ForestConfig::default()
        }),
    ]
}

/// A fitted candidate, serializable into the model bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FittedClassifier {
    Logistic(LogisticModel),
    Forest(ForestModel),
}

impl FittedClassifier {
    pub fn predict_probability(&self, x: ArrayView2<f64>) -> Array1<f64> {
        match self {
            FittedClassifier::Logistic(model) => model.predict_probability(x),
            FittedClassifier::Forest(model) => model.predict_probability(x),
        }
    }
}

/// Fitted coefficients of the linear candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub intercept: f64,
    pub coefficients: Array1<f64>,
}

impl LogisticModel {
    pub fn predict_probability(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let eta = x.dot(&self.coefficients) + self.intercept;
        eta.mapv(|e| 1.0 / (1.0 + (-e.clamp(-MAX_ETA, MAX_ETA)).exp()))
    }
}

/// Balanced class weights, `n / (2 * n_class)` per class.
pub(crate) fn balanced_weight_vector(y: ArrayView1<f64>) -> Array1<f64> {
    let n = y.len() as f64;
    let positives = y.iter().filter(|&&v| v == 1.0).count() as f64;
    let negatives = n - positives;
    let weight_positive = n / (2.0 * positives.max(1.0));
    let weight_negative = n / (2.0 * negatives.max(1.0));
    y.mapv(|v| {
        if v == 1.0 {
            weight_positive
        } else {
            weight_negative
        }
    })
}

fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &LogisticConfig,
) -> Result<LogisticModel, FitError> {
    let n = x.nrows();
    let p = x.ncols();
    if n == 0 || p == 0 {
        return Err(FitError::EmptyDesignMatrix);
    }
    if n != y.len() {
        return Err(FitError::ShapeMismatch {
            rows: n,
            targets: y.len(),
        });
    }

    let prior_weights = balanced_weight_vector(y);

    // Intercept column first, then the features.
    let mut design = Array2::ones((n, p + 1));
    design.slice_mut(s![.., 1..]).assign(&x);

    let mut beta: Array1<f64> = Array1::zeros(p + 1);
    let (initial_mu, mut weights, mut z) =
        update_glm_vectors(y, &design.dot(&beta), &prior_weights);
    let mut penalized = binomial_deviance(y, &initial_mu, &prior_weights);
    let mut converged = false;

    for _ in 0..config.max_iterations {
        // Penalized weighted normal equations: (X^T W X + lambda R) b = X^T W z,
        // with R the identity minus the intercept entry.
        let weighted = &design * &weights.clone().insert_axis(Axis(1));
        let mut normal = design.t().dot(&weighted);
        let rhs = weighted.t().dot(&z);
        for j in 1..=p {
            normal[[j, j]] += config.l2_penalty;
        }
        let proposal = solve_symmetric(&normal, &rhs)?;

        let direction = &proposal - &beta;
        let mut step = 1.0;
        let mut accepted = false;
        for _ in 0..=MAX_STEP_HALVINGS {
            let candidate = &beta + &(&direction * step);
            let (mu_trial, weights_trial, z_trial) =
                update_glm_vectors(y, &design.dot(&candidate), &prior_weights);
            let penalized_trial = binomial_deviance(y, &mu_trial, &prior_weights)
                + ridge_penalty(&candidate, config.l2_penalty);

            if penalized_trial.is_finite() && penalized_trial <= penalized + 1e-10 {
                let change = (penalized - penalized_trial).abs();
                let scale = penalized_trial.abs() + 0.1;
                beta = candidate;
                weights = weights_trial;
                z = z_trial;
                penalized = penalized_trial;
                if change < config.tolerance * scale {
                    converged = true;
                }
                accepted = true;
                break;
            }
            step /= 2.0;
        }
        if !accepted {
            return Err(FitError::StepHalvingFailed(MAX_STEP_HALVINGS));
        }
        if converged {
            break;
        }
    }

    if !converged {
        log::warn!(
            "logistic regression did not converge within {} IRLS iterations",
            config.max_iterations
        );
    }

    Ok(LogisticModel {
        intercept: beta[0],
        coefficients: beta.slice(s![1..]).to_owned(),
    })
}

/// One IRLS update for the logit link: returns (mu, weights, working
/// response). The linear predictor is clamped before the sigmoid and mu is
/// kept strictly inside (0, 1) so weights and deviance stay finite.
fn update_glm_vectors(
    y: ArrayView1<f64>,
    eta: &Array1<f64>,
    prior_weights: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>, Array1<f64>) {
    let eta_clamped = eta.mapv(|e| e.clamp(-MAX_ETA, MAX_ETA));
    let mut mu = eta_clamped.mapv(|e| 1.0 / (1.0 + (-e).exp()));
    mu.mapv_inplace(|v| v.clamp(PROB_EPS, 1.0 - PROB_EPS));

    let variance = (&mu * (1.0 - &mu)).mapv(|v| v.max(MIN_IRLS_WEIGHT));
    let residual = &y.view() - &mu;
    let z = &eta_clamped + &(&residual / &variance);
    let weights = prior_weights * &variance;

    (mu, weights, z)
}

/// Weighted binomial deviance, -2 times the weighted log-likelihood.
fn binomial_deviance(
    y: ArrayView1<f64>,
    mu: &Array1<f64>,
    prior_weights: &Array1<f64>,
) -> f64 {
    let total = Zip::from(y)
        .and(mu)
        .and(prior_weights)
        .fold(0.0, |acc, &yi, &mui, &wi| {
            let mui = mui.clamp(PROB_EPS, 1.0 - PROB_EPS);
            let term = if yi == 1.0 { -mui.ln() } else { -(1.0 - mui).ln() };
            acc + wi * term
        });
    2.0 * total
}

fn ridge_penalty(beta: &Array1<f64>, l2_penalty: f64) -> f64 {
    l2_penalty * beta.slice(s![1..]).mapv(|b| b * b).sum()
}

/// Cholesky solve of a symmetric positive definite system. One retry with a
/// small diagonal jitter covers systems that are PD in exact arithmetic but
/// lose definiteness to rounding.
fn solve_symmetric(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, FitError> {
    if let Some(solution) = cholesky_solve(a, b) {
        return Ok(solution);
    }
    let n = a.nrows();
    let jitter = 1e-8 * (1.0 + a.diag().sum().abs() / n as f64);
    let mut damped = a.clone();
    for i in 0..n {
        damped[[i, i]] += jitter;
    }
    cholesky_solve(&damped, b).ok_or(FitError::NotPositiveDefinite)
}

fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut lower = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= lower[[i, k]] * lower[[j, k]];
            }
            if i == j {
                if !sum.is_finite() || sum <= 0.0 {
                    return None;
                }
                lower[[i, i]] = sum.sqrt();
            } else {
                lower[[i, j]] = sum / lower[[j, j]];
            }
        }
    }

    let mut x = b.clone();
    for i in 0..n {
        let mut sum = x[i];
        for k in 0..i {
            sum -= lower[[i, k]] * x[k];
        }
        x[i] = sum / lower[[i, i]];
    }
    for i in (0..n).rev() {
        let mut sum = x[i];
        for k in (i + 1)..n {
            sum -= lower[[k, i]] * x[k];
        }
        x[i] = sum / lower[[i, i]];
    }
    Some(x)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn candidate_set_is_fixed_and_named() {
        let candidates = candidate_models(42);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name(), "logreg");
        assert_eq!(candidates[1].name(), "rf");
    }

    #[test]
    fn logistic_fit_orders_probabilities_on_separable_data() {
        let x = array![[-2.0], [-1.5], [-1.0], [1.0], [1.5], [2.0]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let spec = ClassifierSpec::Logistic(LogisticConfig::default());
        let model = spec.fit(x.view(), y.view()).unwrap();

        let probabilities = model.predict_probability(x.view());
        assert!(probabilities.iter().all(|p| p.is_finite() && (0.0..=1.0).contains(p)));
        assert!(probabilities[0] < probabilities[5]);
        assert!(probabilities[0] < 0.5);
        assert!(probabilities[5] > 0.5);
    }

    #[test]
    fn symmetric_data_fits_a_zero_intercept() {
        let x = array![[-2.0], [-1.0], [1.0], [2.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let config = LogisticConfig::default();
        let model = fit_logistic(x.view(), y.view(), &config).unwrap();
        assert_abs_diff_eq!(model.intercept, 0.0, epsilon = 1e-6);
        assert!(model.coefficients[0] > 0.0);
    }

    #[test]
    fn balanced_weights_recenter_an_imbalanced_intercept_fit() {
        // With no usable feature, a class-weighted fit settles at the
        // weighted mean 0.5 rather than the 20% base rate.
        let x = Array2::zeros((5, 1));
        let y = array![1.0, 0.0, 0.0, 0.0, 0.0];
        let config = LogisticConfig::default();
        let model = fit_logistic(x.view(), y.view(), &config).unwrap();
        let probabilities = model.predict_probability(x.view());
        for &p in probabilities.iter() {
            assert_abs_diff_eq!(p, 0.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn extreme_linear_predictors_stay_finite() {
        let x = array![[-1e5], [-1e4], [1e4], [1e5]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let config = LogisticConfig::default();
        let model = fit_logistic(x.view(), y.view(), &config).unwrap();

        let probe = array![[-1e6], [1e6]];
        let probabilities = model.predict_probability(probe.view());
        assert!(probabilities.iter().all(|p| p.is_finite()));
        assert!(probabilities[0] <= probabilities[1]);
        assert!((0.0..=1.0).contains(&probabilities[0]));
        assert!((0.0..=1.0).contains(&probabilities[1]));
    }

    #[test]
    fn refitting_is_deterministic() {
        let x = array![[-2.0, 0.3], [-1.0, 1.0], [1.0, -0.5], [2.0, 0.1]];
        let y = array![0.0, 0.0, 1.0, 1.0];
        let spec = ClassifierSpec::Logistic(LogisticConfig::default());
        let first = spec.fit(x.view(), y.view()).unwrap();
        let second = spec.fit(x.view(), y.view()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn degenerate_shapes_are_rejected() {
        let empty = Array2::<f64>::zeros((0, 3));
        let y = Array1::<f64>::zeros(0);
        let config = LogisticConfig::default();
        assert!(matches!(
            fit_logistic(empty.view(), y.view(), &config).unwrap_err(),
            FitError::EmptyDesignMatrix
        ));

        let x = array![[1.0], [2.0]];
        let y = array![1.0, 0.0, 1.0];
        assert!(matches!(
            fit_logistic(x.view(), y.view(), &config).unwrap_err(),
            FitError::ShapeMismatch { rows: 2, targets: 3 }
        ));
    }

    #[test]
    fn cholesky_solves_a_known_system() {
        // A = [[4, 2], [2, 3]], b = [10, 8] -> x = [1.75, 1.5].
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![10.0, 8.0];
        let x = cholesky_solve(&a, &b).unwrap();
        assert_abs_diff_eq!(x[0], 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.5, epsilon = 1e-12);

        // An indefinite matrix is rejected rather than mis-solved.
        let indefinite = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky_solve(&indefinite, &b).is_none());
    }
}
