//! # Decision Threshold Selection
//!
//! Sweeps a fixed probability grid over out-of-fold predictions and picks
//! the operating point for the published model. The clinical intent is
//! encoded in the policy: keep recall at or above a floor so the model does
//! not quietly trade missed readmissions for precision, and only optimize
//! F1 within that constraint.

use crate::metrics::confusion_counts;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Grid points are generated in integer microunits so the endpoints are
/// exact and a default grid is exactly 91 points.
const GRID_SCALE: f64 = 1e6;

/// Configuration for threshold selection. Defaults match the clinical
/// policy the pipeline ships with; every field can be overridden from the
/// command line without code changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    /// Minimum acceptable recall at the operating point.
    pub recall_floor: f64,
    pub grid_start: f64,
    pub grid_end: f64,
    pub grid_step: f64,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy {
            recall_floor: 0.70,
            grid_start: 0.05,
            grid_end: 0.95,
            grid_step: 0.01,
        }
    }
}

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("threshold grid step must be positive; got {0}")]
    NonPositiveStep(f64),
    #[error("threshold grid start {start} must not exceed end {end}")]
    InvertedBounds { start: f64, end: f64 },
    #[error("the threshold grid produced no candidate points")]
    EmptyGrid,
}

impl ThresholdPolicy {
    /// The candidate thresholds, ascending.
    pub fn grid(&self) -> Result<Vec<f64>, ThresholdError> {
        let step_units = (self.grid_step * GRID_SCALE).round() as i64;
        if step_units <= 0 {
            return Err(ThresholdError::NonPositiveStep(self.grid_step));
        }
        let start_units = (self.grid_start * GRID_SCALE).round() as i64;
        let end_units = (self.grid_end * GRID_SCALE).round() as i64;
        if start_units > end_units {
            return Err(ThresholdError::InvertedBounds {
                start: self.grid_start,
                end: self.grid_end,
            });
        }

        let mut grid = Vec::new();
        let mut units = start_units;
        while units <= end_units {
            grid.push(units as f64 / GRID_SCALE);
            units += step_units;
        }
        Ok(grid)
    }
}

/// Operating metrics at one grid point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRow {
    pub threshold: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// The chosen operating point together with the full grid analysis that
/// produced it. The rows are what `threshold_analysis.csv` records.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSelection {
    pub selected: ThresholdRow,
    pub rows: Vec<ThresholdRow>,
}

/// Applies the selection policy to out-of-fold probabilities.
///
/// Among grid points whose recall meets the floor, picks the highest F1;
/// ties go to the higher precision, then to the lowest threshold. When no
/// point meets the floor the same ordering runs over the whole grid, so
/// selection always produces an operating point.
pub fn select_threshold(
    labels: ArrayView1<f64>,
    probabilities: ArrayView1<f64>,
    policy: &ThresholdPolicy,
) -> Result<ThresholdSelection, ThresholdError> {
    let grid = policy.grid()?;
    let rows: Vec<ThresholdRow> = grid
        .iter()
        .map(|&threshold| {
            let counts = confusion_counts(labels, probabilities, threshold);
            ThresholdRow {
                threshold,
                precision: counts.precision(),
                recall: counts.recall(),
                f1: counts.f1(),
            }
        })
        .collect();

    let qualified: Vec<&ThresholdRow> = rows
        .iter()
        .filter(|row| row.recall >= policy.recall_floor)
        .collect();
    let pool: Vec<&ThresholdRow> = if qualified.is_empty() {
        rows.iter().collect()
    } else {
        qualified
    };

    // Rows ascend by threshold and replacement requires strict improvement,
    // so equal candidates resolve to the lowest threshold.
    let best = pool.into_iter().reduce(|best, row| {
        if row.f1 > best.f1 || (row.f1 == best.f1 && row.precision > best.precision) {
            row
        } else {
            best
        }
    });
    let selected = match best {
        Some(row) => *row,
        None => return Err(ThresholdError::EmptyGrid),
    };

    Ok(ThresholdSelection { selected, rows })
}
