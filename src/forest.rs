//! # Bagged Decision-Tree Ensemble
//!
//! The tree-based candidate of the model set. Each tree is grown on a
//! bootstrap resample of the training rows with a random sqrt-of-features
//! subset considered at every split, and the ensemble probability is the
//! plain mean of per-tree leaf probabilities.
//!
//! Trees live in a flat node arena rather than a recursive structure. The
//! builder runs an explicit worklist, so degenerate deep trees cannot
//! overflow the stack, and the arena serializes directly into the model
//! bundle.
//!
//! Determinism: every tree owns a `StdRng` seeded from the forest seed plus
//! the tree index. Rayon only schedules the per-tree work; given a seed,
//! the grown forest is identical regardless of thread timing.

use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::classifier::{FitError, balanced_weight_vector};

const MIN_GINI_GAIN: f64 = 1e-12;

/// Hyperparameters of the tree ensemble candidate; fixed, not searched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForestConfig {
    pub trees: usize,
    pub min_samples_leaf: usize,
    pub max_depth: Option<usize>,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            trees: 400,
            min_samples_leaf: 2,
            max_depth: None,
            seed: 42,
        }
    }
}

/// One arena slot. Children are arena indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        /// Weighted fraction of positive training rows in the leaf.
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A single fitted tree. The root is node 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Leaf { probability } => return *probability,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }
}

/// The fitted ensemble, serializable into the model bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestModel {
    trees: Vec<DecisionTree>,
}

impl ForestModel {
    /// Mean leaf probability over all trees, row by row. Kept sequential so
    /// the summation order, and therefore the result, is reproducible.
    pub fn predict_probability(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let mut totals = Array1::<f64>::zeros(x.nrows());
        for tree in &self.trees {
            for (i, row) in x.outer_iter().enumerate() {
                totals[i] += tree.predict_row(row);
            }
        }
        totals / self.trees.len().max(1) as f64
    }
}

pub(crate) fn fit_forest(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    config: &ForestConfig,
) -> Result<ForestModel, FitError> {
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
    if config.trees == 0 {
        return Err(FitError::EmptyEnsemble);
    }

    let class_weights = balanced_weight_vector(y);
    let max_features = ((p as f64).sqrt().floor() as usize).max(1);

    let trees: Vec<DecisionTree> = (0..config.trees)
        .into_par_iter()
        .map(|tree_index| {
            let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(tree_index as u64));
            let sample: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            grow_tree(x, y, &class_weights, sample, max_features, config, &mut rng)
        })
        .collect();

    Ok(ForestModel { trees })
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    position: usize,
}

fn grow_tree(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    class_weights: &Array1<f64>,
    root_rows: Vec<usize>,
    max_features: usize,
    config: &ForestConfig,
    rng: &mut StdRng,
) -> DecisionTree {
    let mut nodes = vec![TreeNode::Leaf { probability: 0.0 }];
    let mut pending = vec![(0usize, root_rows, 0usize)];

    while let Some((node_index, rows, depth)) = pending.pop() {
        let depth_capped = config.max_depth.is_some_and(|cap| depth >= cap);
        let splittable = rows.len() >= 2 * config.min_samples_leaf
            && !depth_capped
            && !is_pure(y, &rows);

        let split = if splittable {
            find_best_split(x, y, class_weights, &rows, max_features, config, rng)
        } else {
            None
        };

        match split {
            Some(best) => {
                let mut order = rows;
                order.sort_unstable_by(|&a, &b| {
                    x[[a, best.feature]].total_cmp(&x[[b, best.feature]])
                });
                let right_rows = order.split_off(best.position);
                let left_rows = order;

                let left = nodes.len();
                nodes.push(TreeNode::Leaf { probability: 0.0 });
                let right = nodes.len();
                nodes.push(TreeNode::Leaf { probability: 0.0 });
                nodes[node_index] = TreeNode::Split {
                    feature: best.feature,
                    threshold: best.threshold,
                    left,
                    right,
                };
                pending.push((left, left_rows, depth + 1));
                pending.push((right, right_rows, depth + 1));
            }
            None => {
                nodes[node_index] = TreeNode::Leaf {
                    probability: weighted_positive_fraction(y, class_weights, &rows),
                };
            }
        }
    }

    DecisionTree { nodes }
}

fn is_pure(y: ArrayView1<f64>, rows: &[usize]) -> bool {
    let positives = rows.iter().filter(|&&r| y[r] == 1.0).count();
    positives == 0 || positives == rows.len()
}

fn weighted_positive_fraction(
    y: ArrayView1<f64>,
    class_weights: &Array1<f64>,
    rows: &[usize],
) -> f64 {
    let mut weight_total = 0.0;
    let mut weight_positive = 0.0;
    for &row in rows {
        let w = class_weights[row];
        weight_total += w;
        if y[row] == 1.0 {
            weight_positive += w;
        }
    }
    if weight_total > 0.0 {
        weight_positive / weight_total
    } else {
        0.0
    }
}

fn gini(weight_positive: f64, weight_total: f64) -> f64 {
    if weight_total <= 0.0 {
        return 0.0;
    }
    let p = weight_positive / weight_total;
    1.0 - p * p - (1.0 - p) * (1.0 - p)
}

/// Scans a random feature subset for the weighted-Gini-optimal split.
/// Candidate thresholds are midpoints between adjacent distinct values;
/// both children must keep `min_samples_leaf` rows. Returns `None` when no
/// candidate improves on the parent impurity.
fn find_best_split(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    class_weights: &Array1<f64>,
    rows: &[usize],
    max_features: usize,
    config: &ForestConfig,
    rng: &mut StdRng,
) -> Option<BestSplit> {
    let mut weight_total = 0.0;
    let mut weight_positive = 0.0;
    for &row in rows {
        let w = class_weights[row];
        weight_total += w;
        if y[row] == 1.0 {
            weight_positive += w;
        }
    }
    let parent_gini = gini(weight_positive, weight_total);

    let mut features: Vec<usize> = (0..x.ncols()).collect();
    let (selected, _) = features.partial_shuffle(rng, max_features);

    let mut best: Option<BestSplit> = None;
    let mut best_gain = MIN_GINI_GAIN;

    let mut sorted: Vec<(f64, usize)> = Vec::with_capacity(rows.len());
    for &feature in selected.iter() {
        sorted.clear();
        sorted.extend(rows.iter().map(|&r| (x[[r, feature]], r)));
        sorted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

        let mut left_weight = 0.0;
        let mut left_positive = 0.0;
        for position in 1..sorted.len() {
            let (previous_value, previous_row) = sorted[position - 1];
            let w = class_weights[previous_row];
            left_weight += w;
            if y[previous_row] == 1.0 {
                left_positive += w;
            }

            let value = sorted[position].0;
            if value == previous_value {
                continue;
            }
            if position < config.min_samples_leaf
                || sorted.len() - position < config.min_samples_leaf
            {
                continue;
            }

            let right_weight = weight_total - left_weight;
            let right_positive = weight_positive - left_positive;
            let children = (left_weight * gini(left_positive, left_weight)
                + right_weight * gini(right_positive, right_weight))
                / weight_total;
            let gain = parent_gini - children;
            if gain > best_gain {
                best_gain = gain;
                best = Some(BestSplit {
                    feature,
                    threshold: (previous_value + value) / 2.0,
                    position,
                });
            }
        }
    }

    best
}
