//! Distance Filter (C4) — bounded per-(anchor, tag) history, reduced to one
//! distance per anchor per round (§4.3).

use std::collections::HashMap;

use crate::clock::Clock;

const MAX_READINGS: usize = 10;
const MEDIAN_MAX_AGE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceFilterMode {
    Null,
    MostRecent,
    MedianFilter,
}

impl DistanceFilterMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "null" => Some(Self::Null),
            "most_recent" => Some(Self::MostRecent),
            "median_filter" => Some(Self::MedianFilter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DistanceReading {
    distance: f64,
    timestamp: f64,
}

/// History and reduction for one tag's per-anchor distance readings.
pub struct DistanceFilter {
    mode: DistanceFilterMode,
    clock: Clock,
    // anchor_id -> history, most recent at the front.
    history: HashMap<u32, Vec<DistanceReading>>,
}

impl DistanceFilter {
    pub fn new(mode: DistanceFilterMode, clock: Clock) -> Self {
        Self {
            mode,
            clock,
            history: HashMap::new(),
        }
    }

    /// Record one reading for `anchor_id`, timestamped at the current clock
    /// time, prepending to history and trimming to the 10-item cap.
    pub fn add_reading(&mut self, anchor_id: u32, distance: f64) {
        let entry = self.history.entry(anchor_id).or_default();
        entry.insert(
            0,
            DistanceReading {
                distance,
                timestamp: self.clock.now(),
            },
        );
        entry.truncate(MAX_READINGS);
    }

    /// Reduce history to one distance per anchor currently observed. Anchors
    /// with no usable reading (e.g. all history aged out under
    /// `median_filter`) are absent from the result, never null.
    pub fn distances(&mut self) -> HashMap<u32, f64> {
        let mut result = HashMap::new();
        let now = self.clock.now();
        let anchor_ids: Vec<u32> = self.history.keys().copied().collect();

        for anchor_id in anchor_ids {
            let entry = self.history.get_mut(&anchor_id).unwrap();
            if entry.is_empty() {
                continue;
            }
            match self.mode {
                DistanceFilterMode::MostRecent => {
                    result.insert(anchor_id, entry[0].distance);
                }
                DistanceFilterMode::Null => {
                    result.insert(anchor_id, entry[0].distance);
                    entry.clear();
                }
                DistanceFilterMode::MedianFilter => {
                    let mut fresh: Vec<f64> = entry
                        .iter()
                        .filter(|r| now - r.timestamp <= MEDIAN_MAX_AGE)
                        .map(|r| r.distance)
                        .collect();
                    if !fresh.is_empty() {
                        result.insert(anchor_id, median(&mut fresh));
                    }
                }
            }
        }

        result
    }
}

/// Median of a slice, sorting in place. Even-length slices average the two
/// middle elements (matches `numpy.median`).
pub fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}
