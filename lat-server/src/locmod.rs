//! Locmod composition (C9): wires one distance filter per tag, one location
//! engine, and one shared position filter into the pipeline stage the
//! composition root drives per measurement round (§4.6).

use std::collections::HashMap;

use lat_types::Anchor;

use crate::batch::CompletedRound;
use crate::clock::Clock;
use crate::config::{EngineType, LocmodConfig};
use crate::distance_filter::{DistanceFilter, DistanceFilterMode};
use crate::engine::fingerprint::{FingerprintMatchEngine, ObservationDatabase};
use crate::engine::particle::ParticleFilterEngine;
use crate::engine::pdf_grid::{CombineMode, PdfGridEngine};
use crate::engine::{EngineKind, LocationEngine};
use crate::position_filter::{PositionFilter, PositionFilterMode};

pub struct Locmod {
    anchors: HashMap<u32, Anchor>,
    distance_filter_mode: DistanceFilterMode,
    distance_filters: HashMap<u32, DistanceFilter>,
    engine: EngineKind,
    position_filter: PositionFilter,
    clock: Clock,
}

impl Locmod {
    /// Record one known-anchor reading for `tag_id`. Readings from an anchor
    /// outside the configured set are warned and ignored (§4.6).
    pub fn add_reading(&mut self, anchor_id: u32, tag_id: u32, distance: f64) {
        if !self.anchors.contains_key(&anchor_id) {
            tracing::warn!(anchor_id, tag_id, "reading from unknown anchor, ignoring");
            return;
        }
        self.distance_filters
            .entry(tag_id)
            .or_insert_with(|| DistanceFilter::new(self.distance_filter_mode, self.clock.clone()))
            .add_reading(anchor_id, distance);
    }

    /// Record every anchor distance in an already-assembled round.
    pub fn add_reading_batch(&mut self, round: &CompletedRound) {
        for (&anchor_id, &distance) in &round.distances {
            self.add_reading(anchor_id, round.tag_id, distance);
        }
    }

    /// The clock driving this locmod's filters, shared with whichever
    /// component advances time (the replay driver, in replay mode).
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Fuse the current round for each requested tag (all known tags if
    /// `tags` is empty) through the engine and position filter, returning
    /// the resulting smoothed locations.
    pub fn update_locations(&mut self, tags: &[u32]) -> HashMap<u32, (f64, f64)> {
        let tag_ids: Vec<u32> = if tags.is_empty() {
            self.distance_filters.keys().copied().collect()
        } else {
            tags.to_vec()
        };

        let mut updates = HashMap::new();
        for tag_id in tag_ids {
            let Some(filter) = self.distance_filters.get_mut(&tag_id) else {
                continue;
            };
            let distances = filter.distances();
            if distances.is_empty() {
                continue;
            }
            if let Some(point) = self.engine.coordinates(tag_id, &distances) {
                updates.insert(tag_id, point);
            }
        }

        self.position_filter.add_updates(&updates);
        self.position_filter.locations(tags)
    }
}

fn parse_param<T: std::str::FromStr>(params: &HashMap<String, String>, key: &str, default: T) -> T {
    params
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Build a `Locmod` from parsed locmod configuration, the surveyed anchor
/// set, and an offline error-sample histogram shared by the grid and
/// particle-filter engines. `fingerprint_db` is only consulted when the
/// configuration selects the fingerprint-match engine.
pub fn build(
    locmod: &LocmodConfig,
    anchors: Vec<Anchor>,
    clock: Clock,
    histogram_errors: &[f64],
    fingerprint_db: Option<ObservationDatabase>,
) -> Locmod {
    let engine_type = locmod.engine_type.unwrap_or(EngineType::LocationEnginePdf);

    let engine = match engine_type {
        EngineType::LocationEnginePdf => {
            let cell_size = parse_param(&locmod.location_engine, "cell_size", 0.25);
            let mode = locmod
                .location_engine
                .get("mode")
                .and_then(|v| CombineMode::parse(v))
                .unwrap_or(CombineMode::Standard);
            EngineKind::PdfGrid(PdfGridEngine::new(
                anchors.clone(),
                cell_size,
                mode,
                histogram_errors,
            ))
        }
        EngineType::LocationEngineMatch => {
            let error_bound = parse_param(&locmod.location_engine, "error_bound", 1.0);
            let db = fingerprint_db.unwrap_or_default();
            EngineKind::FingerprintMatch(FingerprintMatchEngine::new(db, error_bound))
        }
        EngineType::ParticleFilter => {
            let particle_count = parse_param(&locmod.particle_filter, "particle_count", 100usize);
            let discard_ratio = parse_param(&locmod.particle_filter, "discard_ratio", 0.2);
            let max_tag_speed = parse_param(&locmod.particle_filter, "max_tag_speed", 2.0);
            EngineKind::ParticleFilter(
                ParticleFilterEngine::new(anchors.clone(), histogram_errors, clock.clone())
                    .with_particle_count(particle_count)
                    .with_discard_ratio(discard_ratio)
                    .with_max_tag_speed(max_tag_speed),
            )
        }
    };

    let distance_filter_mode = locmod
        .distance_filter
        .get("mode")
        .and_then(|v| DistanceFilterMode::parse(v))
        .unwrap_or(DistanceFilterMode::MostRecent);

    let position_filter_mode = locmod
        .position_filter
        .get("mode")
        .and_then(|v| PositionFilterMode::parse(v))
        .unwrap_or(PositionFilterMode::MostRecent);
    let update_rate: Option<f64> = locmod
        .position_filter
        .get("update_rate")
        .and_then(|v| v.parse().ok());

    Locmod {
        anchors: anchors.into_iter().map(|a| (a.id, a)).collect(),
        distance_filter_mode,
        distance_filters: HashMap::new(),
        engine,
        position_filter: PositionFilter::new(position_filter_mode, update_rate, clock.clone()),
        clock,
    }
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

    fn tight_error_histogram() -> Vec<f64> {
        let mut errs = Vec::new();
        for i in -50..=50 {
            errs.push(i as f64 * 0.01);
        }
        errs
    }

    #[test]
    fn unknown_anchor_reading_is_ignored() {
        let clock = Clock::paused_at(0.0);
        let config = LocmodConfig::default();
        let mut locmod = build(&config, square_anchors(), clock, &tight_error_histogram(), None);
        locmod.add_reading(99, 1, 5.0);
        assert!(locmod.distance_filters.is_empty());
    }

    #[test]
    fn full_round_produces_a_location() {
        let clock = Clock::paused_at(0.0);
        let config = LocmodConfig::default();
        let anchors = square_anchors();
        let mut locmod = build(&config, anchors.clone(), clock, &tight_error_histogram(), None);
        let target = (5.0, 5.0);
        for a in &anchors {
            locmod.add_reading(a.id, 1, lat_types::euclid((a.x, a.y), target));
        }
        let locations = locmod.update_locations(&[1]);
        let (x, y) = locations[&1];
        assert!(lat_types::euclid((x, y), target) < 0.5);
    }
}
