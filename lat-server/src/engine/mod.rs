//! Location Engine contract (§4.5) and the tagged-variant dispatch that
//! replaces the source's string-keyed dynamic class lookup (§9).

pub mod fingerprint;
pub mod particle;
pub mod pdf_grid;

use std::collections::HashMap;

pub use fingerprint::FingerprintMatchEngine;
pub use particle::ParticleFilterEngine;
pub use pdf_grid::PdfGridEngine;

/// Every engine exposes `coordinates`. Implementations may cache internally
/// keyed by anchor identity plus rounded distance; they see no timestamps.
/// `tag_id` is only meaningful to the particle filter, which keeps one
/// sample cloud per tag; the grid and fingerprint engines ignore it.
pub trait LocationEngine {
    /// Fuse a round's `{anchor_id -> distance}` map into a position. `None`
    /// means "no estimate" (§9: replaces the source's (0, 0) sentinel).
    fn coordinates(&mut self, tag_id: u32, distances: &HashMap<u32, f64>) -> Option<(f64, f64)>;
}

/// The three open algorithms, selected by locmod configuration. The
/// proprietary "ledll" engine named in the source is out of core scope
/// (§9) and has no variant here.
pub enum EngineKind {
    PdfGrid(PdfGridEngine),
    FingerprintMatch(FingerprintMatchEngine),
    ParticleFilter(ParticleFilterEngine),
}

impl LocationEngine for EngineKind {
    fn coordinates(&mut self, tag_id: u32, distances: &HashMap<u32, f64>) -> Option<(f64, f64)> {
        match self {
            EngineKind::PdfGrid(e) => e.coordinates(tag_id, distances),
            EngineKind::FingerprintMatch(e) => e.coordinates(tag_id, distances),
            EngineKind::ParticleFilter(e) => e.coordinates(tag_id, distances),
        }
    }
}
