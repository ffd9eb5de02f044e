//! # lat-types
//!
//! Shared data-model structures for the LAT Frontend localization pipeline.
//!
//! These types are used by:
//! - `lat-frontend`: the pipeline binary (batch assembler, filters, engines, store)
//! - any offline analysis tool that reads an experiment database directly
//!
//! ## Coordinate conventions
//!
//! - All positions are metres in a single flat 2D plane (no multi-floor support).
//! - `(x, y)` is an arbitrary arena-local Cartesian frame; anchors define its origin
//!   implicitly by wherever they were surveyed to.
//! - Timestamps are `f64` seconds since the UNIX epoch, always read through the
//!   virtual clock (`Clock`) rather than the OS clock directly.
//!
//! ## Invariants
//! - A `Reading` with `error_code != 0` must not be fed into the pipeline; parse it,
//!   log it, and discard it at the boundary.
//! - `Estimate::configuration_id` always references a row that exists by the time
//!   the estimate is persisted (I3).

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Anchor ─────────────────────────────────────────────────────────────────────

/// A fixed radio unit with a known, effectively immutable 2D position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: u32,
    pub x: f64,
    pub y: f64,
}

impl Anchor {
    pub fn new(id: u32, x: f64, y: f64) -> Self {
        Self { id, x, y }
    }

    /// Euclidean distance from this anchor to a point.
    pub fn distance_to(&self, point: (f64, f64)) -> f64 {
        euclid((self.x, self.y), point)
    }
}

/// Straight-line distance between two points, metres.
pub fn euclid(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

// ── Reading ────────────────────────────────────────────────────────────────────

/// A single tag-anchor distance observation.
///
/// Wire form (see `parse_line`/`to_line`): `#DDDDD.DD:TTT:AAA:EEE\r\n`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub tag_id: u32,
    pub anchor_id: u32,
    pub distance: f64,
    pub error_code: i32,
    pub timestamp: f64,
}

/// A reading line didn't have the expected four colon-separated fields, or a
/// field didn't parse as the expected type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed reading line: {0:?}")]
pub struct ReadingParseError(pub String);

impl Reading {
    /// Parse one line of the distance-source wire protocol.
    ///
    /// Accepts a leading `#` and trailing whitespace/CRLF; does not itself
    /// reject non-zero error codes (callers decide whether to keep those).
    pub fn parse_line(line: &str, timestamp: f64) -> Result<Self, ReadingParseError> {
        let trimmed = line.trim();
        let body = trimmed.strip_prefix('#').unwrap_or(trimmed);
        let parts: Vec<&str> = body.split(':').collect();
        if parts.len() != 4 {
            return Err(ReadingParseError(line.to_string()));
        }
        let distance: f64 = parts[0]
            .parse()
            .map_err(|_| ReadingParseError(line.to_string()))?;
        let tag_id: u32 = parts[1]
            .parse()
            .map_err(|_| ReadingParseError(line.to_string()))?;
        let anchor_id: u32 = parts[2]
            .parse()
            .map_err(|_| ReadingParseError(line.to_string()))?;
        let error_code: i32 = parts[3]
            .parse()
            .map_err(|_| ReadingParseError(line.to_string()))?;
        Ok(Reading {
            tag_id,
            anchor_id,
            distance,
            error_code,
            timestamp,
        })
    }

    /// True if this reading should be discarded at ingestion.
    pub fn is_error(&self) -> bool {
        self.error_code != 0
    }
}

impl fmt::Display for Reading {
    /// Format back to the wire line, matching the distance-source's own
    /// fixed-width representation.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{:07.2}:{:03}:{:03}:{:03}",
            self.distance, self.tag_id, self.anchor_id, self.error_code
        )
    }
}

// ── Ground-truth interval ─────────────────────────────────────────────────────

/// The authoritatively known position of a tag over `[start_time, end_time]`.
///
/// Static (`end_point` absent) or dynamic (linear interpolation between
/// `start_point` and `end_point`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthInterval {
    pub id: u32,
    pub tag_id: u32,
    pub label: String,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub start_point: (f64, f64),
    pub end_point: Option<(f64, f64)>,
}

impl GroundTruthInterval {
    /// Whether `timestamp` falls inside this interval. Static intervals with
    /// no `end_time` are open-ended going forward.
    pub fn contains(&self, timestamp: f64) -> bool {
        if timestamp < self.start_time {
            return false;
        }
        match self.end_time {
            Some(end) => timestamp <= end,
            None => true,
        }
    }

    /// Interpolated (or static) location at `timestamp`. Caller must check
    /// `contains` first; this clamps `alpha` to `[0, 1]` defensively.
    pub fn location_at(&self, timestamp: f64) -> (f64, f64) {
        match (self.end_time, self.end_point) {
            (Some(end_time), Some(end_point)) => {
                let span = end_time - self.start_time;
                let alpha = if span > 0.0 {
                    ((timestamp - self.start_time) / span).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                (
                    self.start_point.0 + alpha * (end_point.0 - self.start_point.0),
                    self.start_point.1 + alpha * (end_point.1 - self.start_point.1),
                )
            }
            _ => self.start_point,
        }
    }
}

// ── Configuration row ──────────────────────────────────────────────────────────

/// Identifies the algorithmic parameters that produced a batch of estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: u32,
    pub configuration_name: String,
    pub configuration_text: String,
    pub locmod_name: String,
    pub locmod_text: String,
}

// ── Estimate ───────────────────────────────────────────────────────────────────

/// One fused 2D position, timestamped and tied to the configuration that
/// produced it and, if available, the ground truth it can be scored against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub id: u32,
    pub tag_id: u32,
    pub x: f64,
    pub y: f64,
    pub timestamp: f64,
    pub ground_truth_id: Option<u32>,
    pub error: Option<f64>,
    pub configuration_id: u32,
}

// ── Ground-truth event tracker vocabulary ─────────────────────────────────────

/// One of the four tag-at-reference events the operator channel reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum GroundTruthAction {
    Arrived,
    Passed,
    Heading,
    Abandoned,
}

impl fmt::Display for GroundTruthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroundTruthAction::Arrived => "Arrived",
            GroundTruthAction::Passed => "Passed",
            GroundTruthAction::Heading => "Heading",
            GroundTruthAction::Abandoned => "Abandoned",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_reading_line() {
        let r = Reading::parse_line("#0006.58:017:001:000", 100.0).unwrap();
        assert_eq!(r.distance, 6.58);
        assert_eq!(r.tag_id, 17);
        assert_eq!(r.anchor_id, 1);
        assert_eq!(r.error_code, 0);
        assert!(!r.is_error());
    }

    #[test]
    fn formats_back_to_wire_form() {
        let r = Reading {
            tag_id: 17,
            anchor_id: 1,
            distance: 6.58,
            error_code: 0,
            timestamp: 0.0,
        };
        assert_eq!(r.to_string(), "#0006.58:017:001:000");
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(Reading::parse_line("garbage", 0.0).is_err());
        assert!(Reading::parse_line("#1.0:2:3", 0.0).is_err());
    }

    #[test]
    fn static_ground_truth_returns_start_point_always() {
        let gt = GroundTruthInterval {
            id: 1,
            tag_id: 7,
            label: "A".into(),
            start_time: 10.0,
            end_time: None,
            start_point: (1.0, 2.0),
            end_point: None,
        };
        assert!(gt.contains(10.0));
        assert!(gt.contains(1000.0));
        assert_eq!(gt.location_at(500.0), (1.0, 2.0));
    }

    #[test]
    fn dynamic_ground_truth_interpolates_linearly() {
        let gt = GroundTruthInterval {
            id: 1,
            tag_id: 7,
            label: "A>B".into(),
            start_time: 0.0,
            end_time: Some(10.0),
            start_point: (0.0, 0.0),
            end_point: Some((10.0, 0.0)),
        };
        assert_eq!(gt.location_at(5.0), (5.0, 0.0));
        assert!(gt.contains(10.0));
        assert!(!gt.contains(10.001));
    }
}
