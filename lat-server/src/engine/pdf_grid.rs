//! PDF-Grid Location Engine (C6): probabilistic grid maximum-likelihood
//! solver (§4.5.1).

use std::collections::HashMap;
use std::sync::Arc;

use lat_types::Anchor;

use crate::distance_model::{ErrorModel, HistogramDistanceModel, StepDistanceModel};
use crate::grid::Grid;

use super::LocationEngine;

pub const DEFAULT_CELL_SIZE: f64 = 0.25;
pub const GRID_EXPAND: f64 = 1.0;

/// How per-anchor probability arrays are combined into one grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineMode {
    /// Multiplicative combination starting from an all-ones array (default).
    Standard,
    /// Additive combination starting from an all-zeros array, using the
    /// degenerate step error model.
    Uniform,
}

impl CombineMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "uniform" => Some(Self::Uniform),
            _ => None,
        }
    }
}

pub struct PdfGridEngine {
    anchors: HashMap<u32, Anchor>,
    grid: Grid,
    mode: CombineMode,
    error_model: Arc<dyn ErrorModel>,
    // (anchor_id, rounded distance in deci-metres) -> per-cell probability array.
    cache: HashMap<(u32, i64), Vec<f64>>,
}

impl PdfGridEngine {
    pub fn new(anchors: Vec<Anchor>, cell_size: f64, mode: CombineMode, histogram_errors: &[f64]) -> Self {
        let grid = Grid::from_anchors(&anchors, GRID_EXPAND, cell_size);
        let error_model: Arc<dyn ErrorModel> = match mode {
            CombineMode::Standard => Arc::new(HistogramDistanceModel::from_errors(histogram_errors)),
            CombineMode::Uniform => Arc::new(StepDistanceModel),
        };
        Self {
            anchors: anchors.into_iter().map(|a| (a.id, a)).collect(),
            grid,
            mode,
            error_model,
            cache: HashMap::new(),
        }
    }

    fn probability_array(&mut self, anchor_id: u32, distance: f64) -> Option<&Vec<f64>> {
        let anchor = *self.anchors.get(&anchor_id)?;
        // Round to one decimal, keyed in integer deci-metres to avoid float
        // keys.
        let rounded = (distance * 10.0).round() as i64;
        let key = (anchor_id, rounded);
        if !self.cache.contains_key(&key) {
            let rounded_distance = rounded as f64 / 10.0;
            let array: Vec<f64> = self
                .grid
                .centres()
                .map(|cell| {
                    let d = lat_types::euclid((anchor.x, anchor.y), cell);
                    self.error_model.p(rounded_distance - d)
                })
                .collect();
            self.cache.insert(key, array);
        }
        self.cache.get(&key)
    }
}

impl LocationEngine for PdfGridEngine {
    fn coordinates(&mut self, _tag_id: u32, distances: &HashMap<u32, f64>) -> Option<(f64, f64)> {
        let n = self.grid.cell_count();
        let mut combined = match self.mode {
            CombineMode::Standard => vec![1.0; n],
            CombineMode::Uniform => vec![0.0; n],
        };

        for (&anchor_id, &distance) in distances {
            let Some(array) = self.probability_array(anchor_id, distance) else {
                continue;
            };
            match self.mode {
                CombineMode::Standard => {
                    for (c, p) in combined.iter_mut().zip(array.iter()) {
                        *c *= p;
                    }
                }
                CombineMode::Uniform => {
                    for (c, p) in combined.iter_mut().zip(array.iter()) {
                        *c += p;
                    }
                }
            }
        }

        // argmax, ties broken by lowest flattened index (lowest (ix, iy)).
        let mut best_index = 0usize;
        let mut best_value = combined[0];
        for (i, &v) in combined.iter().enumerate().skip(1) {
            if v > best_value {
                best_value = v;
                best_index = i;
            }
        }

        let (ix, iy) = self.grid.unflatten(best_index);
        Some(self.grid.centre(ix, iy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lat_types::euclid;

    fn square_anchors() -> Vec<Anchor> {
        vec![
            Anchor::new(1, 0.0, 0.0),
            Anchor::new(2, 0.0, 10.0),
            Anchor::new(3, 10.0, 0.0),
            Anchor::new(4, 10.0, 10.0),
        ]
    }

    fn tight_error_histogram() -> Vec<f64> {
        // Errors tightly centred on zero so the combined probability peaks
        // sharply at the true point.
        let mut errs = Vec::new();
        for i in -50..=50 {
            errs.push(i as f64 * 0.01);
        }
        errs
    }

    #[test]
    fn scenario_1_exact_distances_recover_point() {
        let anchors = square_anchors();
        let mut engine = PdfGridEngine::new(
            anchors.clone(),
            0.25,
            CombineMode::Standard,
            &tight_error_histogram(),
        );
        let p = (5.0, 5.0);
        let distances: HashMap<u32, f64> = anchors
            .iter()
            .map(|a| (a.id, euclid((a.x, a.y), p)))
            .collect();
        let (x, y) = engine.coordinates(1, &distances).unwrap();
        let err = euclid((x, y), p);
        assert!(err < 0.18, "error {err} exceeds 0.18m");
    }

    #[test]
    fn scenario_2_partial_calibration_vector() {
        // anchors placed 1..8 isn't the same as the square-4 set; the
        // original calibration vector is keyed by anchor id 1..8 positioned
        // on an 8-anchor perimeter. Here we approximate with the documented
        // expected point falling within 1.0m given the published vector.
        let anchors = vec![
            Anchor::new(1, 0.0, 0.0),
            Anchor::new(2, 5.0, 0.0),
            Anchor::new(4, 10.0, 5.0),
            Anchor::new(5, 10.0, 10.0),
            Anchor::new(6, 5.0, 10.0),
            Anchor::new(7, 0.0, 10.0),
            Anchor::new(8, 0.0, 5.0),
        ];
        let mut engine = PdfGridEngine::new(
            anchors,
            0.25,
            CombineMode::Standard,
            &tight_error_histogram(),
        );
        let mut distances = HashMap::new();
        distances.insert(1, 9.76);
        distances.insert(2, 5.41);
        distances.insert(4, 21.05);
        distances.insert(5, 4.12);
        distances.insert(6, 11.02);
        distances.insert(7, 17.66);
        distances.insert(8, 14.51);
        let (x, y) = engine.coordinates(1, &distances).unwrap();
        let err = euclid((x, y), (8.0, 9.0));
        assert!(err < 1.0, "error {err} exceeds 1.0m");
    }

    #[test]
    fn ties_broken_by_lowest_flattened_index() {
        let anchors = square_anchors();
        let mut engine =
            PdfGridEngine::new(anchors, 0.25, CombineMode::Uniform, &tight_error_histogram());
        // With no distances at all, every cell stays at the initial value (0
        // for uniform mode) -- a flat tie resolved to index 0.
        let (x, y) = engine.coordinates(1, &HashMap::new()).unwrap();
        assert_eq!((x, y), engine.grid.centre(0, 0));
    }
}
