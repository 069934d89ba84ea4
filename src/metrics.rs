//! # Ranking and Classification Metrics
//!
//! Metric primitives shared by cross-validation and threshold selection.
//! All functions take the label vector and a probability vector of the same
//! length; labels are 0.0/1.0. Degenerate inputs that contain only one class
//! have no defined ranking metric and return NaN, so callers are expected to
//! validate class balance up front (training does, at schema-split time).

use ndarray::ArrayView1;

/// Counts of a 2x2 confusion table at a fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,
}

impl ConfusionCounts {
    /// Precision with the zero-denominator convention: no positive
    /// predictions means precision 0.0.
    pub fn precision(&self) -> f64 {
        let predicted = self.true_positives + self.false_positives;
        if predicted == 0 {
            0.0
        } else {
            self.true_positives as f64 / predicted as f64
        }
    }

    /// Recall with the zero-denominator convention: no actual positives
    /// means recall 0.0.
    pub fn recall(&self) -> f64 {
        let actual = self.true_positives + self.false_negatives;
        if actual == 0 {
            0.0
        } else {
            self.true_positives as f64 / actual as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }
}

/// Tallies the confusion table for `probability >= threshold` predictions.
pub fn confusion_counts(
    labels: ArrayView1<f64>,
    probabilities: ArrayView1<f64>,
    threshold: f64,
) -> ConfusionCounts {
    let mut counts = ConfusionCounts {
        true_positives: 0,
        false_positives: 0,
        false_negatives: 0,
        true_negatives: 0,
    };
    for (&label, &probability) in labels.iter().zip(probabilities.iter()) {
        let predicted_positive = probability >= threshold;
        match (label == 1.0, predicted_positive) {
            (true, true) => counts.true_positives += 1,
            (false, true) => counts.false_positives += 1,
            (true, false) => counts.false_negatives += 1,
            (false, false) => counts.true_negatives += 1,
        }
    }
    counts
}

/// Area under the ROC curve via the rank-sum statistic. Tied probabilities
/// receive their average rank, which matches the trapezoidal curve area.
pub fn roc_auc(labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> f64 {
    let n = labels.len();
    let n_pos = labels.iter().filter(|&&y| y == 1.0).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_unstable_by(|&a, &b| probabilities[a].total_cmp(&probabilities[b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && probabilities[order[j + 1]] == probabilities[order[i]] {
            j += 1;
        }
        // 1-based average rank for the tie group [i, j].
        let average = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = average;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = labels
        .iter()
        .zip(ranks.iter())
        .filter(|&(&label, _)| label == 1.0)
        .map(|(_, &rank)| rank)
        .sum();
    let n_pos = n_pos as f64;
    (positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

/// Area under the precision-recall curve as step-wise average precision:
/// the sum of (R_n - R_{n-1}) * P_n over distinct probability levels, taken
/// from the highest probability down.
pub fn average_precision(labels: ArrayView1<f64>, probabilities: ArrayView1<f64>) -> f64 {
    let n = labels.len();
    let n_pos = labels.iter().filter(|&&y| y == 1.0).count();
    if n_pos == 0 || n == 0 {
        return f64::NAN;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_unstable_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));

    let mut true_positives = 0.0;
    let mut false_positives = 0.0;
    let mut last_recall = 0.0;
    let mut area = 0.0;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && probabilities[order[j + 1]] == probabilities[order[i]] {
            j += 1;
        }
        for k in i..=j {
            if labels[order[k]] == 1.0 {
                true_positives += 1.0;
            } else {
                false_positives += 1.0;
            }
        }
        let recall = true_positives / n_pos as f64;
        let precision = true_positives / (true_positives + false_positives);
        area += (recall - last_recall) * precision;
        last_recall = recall;
        i = j + 1;
    }
    area
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn roc_auc_matches_hand_computed_value() {
        let labels = array![0.0, 0.0, 1.0, 1.0];
        let probabilities = array![0.1, 0.4, 0.35, 0.8];
        assert_abs_diff_eq!(
            roc_auc(labels.view(), probabilities.view()),
            0.75,
            epsilon = 1e-12
        );
    }

    #[test]
    fn roc_auc_handles_ties_with_average_ranks() {
        let labels = array![0.0, 1.0];
        let probabilities = array![0.5, 0.5];
        assert_abs_diff_eq!(
            roc_auc(labels.view(), probabilities.view()),
            0.5,
            epsilon = 1e-12
        );

        let labels = array![0.0, 0.0, 1.0, 1.0];
        let probabilities = array![0.2, 0.4, 0.4, 0.9];
        // The tied pair contributes half a concordant pair.
        assert_abs_diff_eq!(
            roc_auc(labels.view(), probabilities.view()),
            0.875,
            epsilon = 1e-12
        );
    }

    #[test]
    fn perfect_separation_scores_one() {
        let labels = array![0.0, 0.0, 1.0, 1.0];
        let probabilities = array![0.1, 0.2, 0.8, 0.9];
        assert_abs_diff_eq!(
            roc_auc(labels.view(), probabilities.view()),
            1.0,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            average_precision(labels.view(), probabilities.view()),
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn average_precision_matches_step_formula() {
        let labels = array![0.0, 0.0, 1.0, 1.0];
        let probabilities = array![0.1, 0.4, 0.35, 0.8];
        // Descending: 0.8(+) -> R=1/2, P=1; 0.4(-) -> no step;
        // 0.35(+) -> R=1, P=2/3; 0.1(-) -> no step. AP = 1/2 + 1/3.
        assert_abs_diff_eq!(
            average_precision(labels.view(), probabilities.view()),
            0.5 + 1.0 / 3.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn single_class_inputs_have_no_ranking_metric() {
        let labels = array![1.0, 1.0];
        let probabilities = array![0.5, 0.6];
        assert!(roc_auc(labels.view(), probabilities.view()).is_nan());

        let labels = array![0.0, 0.0];
        assert!(average_precision(labels.view(), probabilities.view()).is_nan());
    }

    #[test]
    fn confusion_counts_and_derived_metrics() {
        let labels = array![1.0, 1.0, 0.0, 0.0, 1.0];
        let probabilities = array![0.9, 0.4, 0.6, 0.2, 0.7];
        let counts = confusion_counts(labels.view(), probabilities.view(), 0.5);

        assert_eq!(counts.true_positives, 2);
        assert_eq!(counts.false_positives, 1);
        assert_eq!(counts.false_negatives, 1);
        assert_eq!(counts.true_negatives, 1);
        assert_abs_diff_eq!(counts.precision(), 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(counts.recall(), 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(counts.f1(), 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn prediction_at_the_threshold_counts_as_positive() {
        let labels = array![1.0];
        let probabilities = array![0.5];
        let counts = confusion_counts(labels.view(), probabilities.view(), 0.5);
        assert_eq!(counts.true_positives, 1);
    }

    #[test]
    fn zero_division_yields_zero_not_nan() {
        // Nothing predicted positive, nothing actually positive.
        let labels = array![0.0, 0.0];
        let probabilities = array![0.1, 0.2];
        let counts = confusion_counts(labels.view(), probabilities.view(), 0.9);
        assert_eq!(counts.precision(), 0.0);
        assert_eq!(counts.recall(), 0.0);
        assert_eq!(counts.f1(), 0.0);
    }
}
