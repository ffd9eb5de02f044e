//! Rectangular spatial discretization shared by the PDF-grid engine (C6)
//! and the particle filter's arena bounds (C8).

use lat_types::{euclid, Anchor};

/// A regular grid of cells covering a bounding box, row-major in `(ix, iy)`
/// with `iy` the fast-varying dimension — matches the source's
/// `divmod(i, n_y)` flattening, so tie-breaking by lowest flattened index
/// favours lowest `ix` first, then lowest `iy`.
#[derive(Debug, Clone)]
pub struct Grid {
    pub min_x: f64,
    pub min_y: f64,
    pub n_x: usize,
    pub n_y: usize,
    pub cell_size: f64,
}

impl Grid {
    /// Build a grid covering the bounding box of `anchors`, expanded by
    /// `expand` metres in each direction, with the given `cell_size`.
    pub fn from_anchors(anchors: &[Anchor], expand: f64, cell_size: f64) -> Self {
        let (min_x, max_x, min_y, max_y) = bounding_box(anchors, expand);
        Self::from_bounds(min_x, max_x, min_y, max_y, cell_size)
    }

    pub fn from_bounds(min_x: f64, max_x: f64, min_y: f64, max_y: f64, cell_size: f64) -> Self {
        let n_x = (((max_x - min_x) / cell_size).ceil() as usize).max(1);
        let n_y = (((max_y - min_y) / cell_size).ceil() as usize).max(1);
        Self {
            min_x,
            min_y,
            n_x,
            n_y,
            cell_size,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.n_x * self.n_y
    }

    /// Centre point of cell `(ix, iy)`.
    pub fn centre(&self, ix: usize, iy: usize) -> (f64, f64) {
        (
            self.min_x + (ix as f64 + 0.5) * self.cell_size,
            self.min_y + (iy as f64 + 0.5) * self.cell_size,
        )
    }

    /// Flatten `(ix, iy)` to a single index, `iy` fast-varying.
    pub fn flatten(&self, ix: usize, iy: usize) -> usize {
        ix * self.n_y + iy
    }

    /// Inverse of `flatten`.
    pub fn unflatten(&self, index: usize) -> (usize, usize) {
        (index / self.n_y, index % self.n_y)
    }

    /// Iterate all cell centres in flattened (row-major) order.
    pub fn centres(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        (0..self.cell_count()).map(move |i| {
            let (ix, iy) = self.unflatten(i);
            self.centre(ix, iy)
        })
    }

    pub fn min_x_bound(&self) -> f64 {
        self.min_x
    }
    pub fn max_x_bound(&self) -> f64 {
        self.min_x + self.n_x as f64 * self.cell_size
    }
    pub fn min_y_bound(&self) -> f64 {
        self.min_y
    }
    pub fn max_y_bound(&self) -> f64 {
        self.min_y + self.n_y as f64 * self.cell_size
    }
}

/// Bounding box of a set of anchors, expanded by `expand` metres.
pub fn bounding_box(anchors: &[Anchor], expand: f64) -> (f64, f64, f64, f64) {
    let min_x = anchors
        .iter()
        .map(|a| a.x)
        .fold(f64::INFINITY, f64::min)
        - expand;
    let max_x = anchors
        .iter()
        .map(|a| a.x)
        .fold(f64::NEG_INFINITY, f64::max)
        + expand;
    let min_y = anchors
        .iter()
        .map(|a| a.y)
        .fold(f64::INFINITY, f64::min)
        - expand;
    let max_y = anchors
        .iter()
        .map(|a| a.y)
        .fold(f64::NEG_INFINITY, f64::max)
        + expand;
    (min_x, max_x, min_y, max_y)
}

/// Expected distance from `point` to `anchor` — used to derive synthetic
/// test fixtures and cache keys.
pub fn expected_distance(anchor: &Anchor, point: (f64, f64)) -> f64 {
    euclid((anchor.x, anchor.y), point)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_anchors() -> Vec<Anchor> {
        vec![
            Anchor::new(1, 0.0, 0.0),
            Anchor::new(2, 0.0, 10.0),
            Anchor::new(3, 10.0, 0.0),
            Anchor::new(4, 10.0, 10.0),
        ]
    }

    #[test]
    fn grid_covers_expanded_bounding_box() {
        let grid = Grid::from_anchors(&square_anchors(), 1.0, 0.25);
        assert_eq!(grid.min_x_bound(), -1.0);
        assert_eq!(grid.min_y_bound(), -1.0);
        assert!(grid.max_x_bound() >= 11.0);
    }

    #[test]
    fn flatten_unflatten_roundtrip() {
        let grid = Grid::from_anchors(&square_anchors(), 1.0, 0.25);
        for i in 0..grid.cell_count().min(500) {
            let (ix, iy) = grid.unflatten(i);
            assert_eq!(grid.flatten(ix, iy), i);
        }
    }

    #[test]
    fn flattening_is_row_major_with_iy_fast_varying() {
        let grid = Grid::from_bounds(0.0, 1.0, 0.0, 1.0, 0.5);
        assert_eq!(grid.n_x, 2);
        assert_eq!(grid.n_y, 2);
        assert_eq!(grid.flatten(0, 0), 0);
        assert_eq!(grid.flatten(0, 1), 1);
        assert_eq!(grid.flatten(1, 0), 2);
    }
}
