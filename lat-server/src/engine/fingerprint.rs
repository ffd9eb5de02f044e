//! Fingerprint-Match Location Engine (C7): tally-based nearest-neighbour
//! lookup against a calibrated database of `{anchor -> bag of historically
//! observed distances} -> known position` samples (§4.5.2).

use std::collections::HashMap;

use super::LocationEngine;

/// One calibration observation: for each anchor, every distance sample
/// recorded from this point, not just the most recent one. Identified by
/// `id` rather than by point, matching the source's `observation`/
/// `distance` table split (§6).
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    pub id: u32,
    pub point: (f64, f64),
    pub distances: HashMap<u32, Vec<f64>>,
}

impl Fingerprint {
    /// Collapse each anchor's sample bag to ascending order with no two
    /// consecutive samples closer than `max_gap` (I5) — ports the source's
    /// `CanonicalObservationDatabase.trim`, which walks each anchor's
    /// distance list ascending and drops any row within `max_gap` of the
    /// last one kept.
    fn trim(&mut self, max_gap: f64) {
        for samples in self.distances.values_mut() {
            samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let mut kept = Vec::with_capacity(samples.len());
            let mut last = -1.0;
            for &distance in samples.iter() {
                if distance - last >= max_gap {
                    kept.push(distance);
                    last = distance;
                }
            }
            *samples = kept;
        }
    }
}

/// Canonical observation database: fingerprints deduplicated by point so a
/// location is never represented twice, each accumulating a bag of samples
/// per anchor rather than a single scalar.
#[derive(Debug, Clone, Default)]
pub struct ObservationDatabase {
    samples: Vec<Fingerprint>,
    next_id: u32,
}

impl ObservationDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a calibration round at `point`: each anchor's distance is
    /// appended to that point's sample bag rather than replacing it, so
    /// repeated observations at the same canonical point accumulate.
    pub fn insert(&mut self, point: (f64, f64), distances: HashMap<u32, f64>) {
        let fingerprint = match self.samples.iter_mut().find(|s| s.point == point) {
            Some(existing) => existing,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.samples.push(Fingerprint {
                    id,
                    point,
                    distances: HashMap::new(),
                });
                self.samples.last_mut().unwrap()
            }
        };
        for (anchor_id, distance) in distances {
            fingerprint.distances.entry(anchor_id).or_default().push(distance);
        }
    }

    /// Trim every fingerprint's sample bags in place (I5).
    pub fn trim(&mut self, max_gap: f64) {
        for fingerprint in &mut self.samples {
            fingerprint.trim(max_gap);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

pub struct FingerprintMatchEngine {
    database: ObservationDatabase,
    /// Half-width of the acceptance window around each measured distance.
    error_bound: f64,
}

impl FingerprintMatchEngine {
    pub fn new(database: ObservationDatabase, error_bound: f64) -> Self {
        Self {
            database,
            error_bound,
        }
    }
}

impl LocationEngine for FingerprintMatchEngine {
    fn coordinates(&mut self, _tag_id: u32, distances: &HashMap<u32, f64>) -> Option<(f64, f64)> {
        if distances.is_empty() || self.database.is_empty() {
            return None;
        }

        let mut tally: HashMap<u32, u32> = HashMap::new();
        for (&anchor_id, &measured) in distances {
            let lo = measured - self.error_bound;
            let hi = measured + self.error_bound;
            for sample in &self.database.samples {
                let Some(bag) = sample.distances.get(&anchor_id) else {
                    continue;
                };
                // "owns at least one historical sample within the error
                // bound" (§4.5.2 step 1) — any matching sample in the bag
                // counts once toward this fingerprint's tally.
                if bag.iter().any(|&d| d >= lo && d <= hi) {
                    *tally.entry(sample.id).or_insert(0) += 1;
                }
            }
        }

        let max_tally = *tally.values().max()?;
        let winners: Vec<&Fingerprint> = self
            .database
            .samples
            .iter()
            .filter(|s| tally.get(&s.id) == Some(&max_tally))
            .collect();

        if winners.is_empty() {
            return None;
        }

        let n = winners.len() as f64;
        let sx: f64 = winners.iter().map(|s| s.point.0).sum();
        let sy: f64 = winners.iter().map(|s| s.point.1).sum();
        Some((sx / n, sy / n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database_with(samples: &[((f64, f64), &[(u32, f64)])]) -> ObservationDatabase {
        let mut db = ObservationDatabase::new();
        for (point, dists) in samples {
            db.insert(*point, dists.iter().cloned().collect());
        }
        db
    }

    #[test]
    fn returns_closest_calibrated_point() {
        let db = database_with(&[
            ((0.0, 0.0), &[(1, 0.0), (2, 10.0)]),
            ((10.0, 10.0), &[(1, 14.1), (2, 10.0)]),
        ]);
        let mut engine = FingerprintMatchEngine::new(db, 0.5);
        let mut distances = HashMap::new();
        distances.insert(1, 0.2);
        distances.insert(2, 10.1);
        assert_eq!(engine.coordinates(1, &distances), Some((0.0, 0.0)));
    }

    #[test]
    fn ties_on_max_tally_return_centroid() {
        let db = database_with(&[
            ((0.0, 0.0), &[(1, 0.0)]),
            ((10.0, 0.0), &[(1, 0.1)]),
        ]);
        let mut engine = FingerprintMatchEngine::new(db, 1.0);
        let mut distances = HashMap::new();
        distances.insert(1, 0.05);
        assert_eq!(engine.coordinates(1, &distances), Some((5.0, 0.0)));
    }

    #[test]
    fn no_estimate_when_nothing_within_error_bound() {
        let db = database_with(&[((0.0, 0.0), &[(1, 0.0)])]);
        let mut engine = FingerprintMatchEngine::new(db, 0.01);
        let mut distances = HashMap::new();
        distances.insert(1, 50.0);
        assert_eq!(engine.coordinates(1, &distances), None);
    }

    #[test]
    fn no_estimate_with_empty_database() {
        let mut engine = FingerprintMatchEngine::new(ObservationDatabase::new(), 100.0);
        let mut distances = HashMap::new();
        distances.insert(1, 1.0);
        assert_eq!(engine.coordinates(1, &distances), None);
    }

    #[test]
    fn database_dedupes_by_point() {
        let mut db = ObservationDatabase::new();
        db.insert((0.0, 0.0), [(1u32, 1.0)].into_iter().collect());
        db.insert((0.0, 0.0), [(1u32, 2.0)].into_iter().collect());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn repeated_observations_at_a_point_accumulate_a_sample_bag() {
        let mut db = ObservationDatabase::new();
        db.insert((0.0, 0.0), [(1u32, 1.0)].into_iter().collect());
        db.insert((0.0, 0.0), [(1u32, 1.05)].into_iter().collect());
        db.insert((0.0, 0.0), [(1u32, 3.0)].into_iter().collect());
        assert_eq!(db.samples[0].distances[&1].len(), 3);
    }

    #[test]
    fn trim_drops_samples_closer_than_max_gap() {
        let mut db = ObservationDatabase::new();
        db.insert((0.0, 0.0), [(1u32, 1.0)].into_iter().collect());
        db.insert((0.0, 0.0), [(1u32, 1.05)].into_iter().collect());
        db.insert((0.0, 0.0), [(1u32, 3.0)].into_iter().collect());
        db.trim(0.10);
        assert_eq!(db.samples[0].distances[&1], vec![1.0, 3.0]);
    }

    #[test]
    fn matching_counts_a_fingerprint_with_any_sample_in_the_bag() {
        let mut db = ObservationDatabase::new();
        // Two widely separated historical samples from the same point; the
        // measured distance lands near the second, not the first.
        db.insert((0.0, 0.0), [(1u32, 0.0)].into_iter().collect());
        db.insert((0.0, 0.0), [(1u32, 9.0)].into_iter().collect());
        let mut engine = FingerprintMatchEngine::new(db, 0.2);
        let mut distances = HashMap::new();
        distances.insert(1, 9.05);
        assert_eq!(engine.coordinates(1, &distances), Some((0.0, 0.0)));
    }
}
