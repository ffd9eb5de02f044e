//! Error kinds (§7): configuration errors are fatal at startup, store
//! integrity errors are fatal for the offending operation only, everything
//! else is logged and the pipeline proceeds.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("configuration error in {path} line {line}: {message}")]
pub struct ConfigError {
    pub path: String,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ambiguous ground truth: tag {tag_id} at t={timestamp} matches more than one interval")]
    AmbiguousGroundTruth { tag_id: u32, timestamp: f64 },

    #[error("anchor {anchor_id} position mismatch during combine: {a:?} != {b:?}")]
    AnchorMismatch {
        anchor_id: u32,
        a: (f64, f64),
        b: (f64, f64),
    },

    #[error("no configuration registered; call register_configuration before add_estimate")]
    NoConfigurationRegistered,

    #[error("ground truth interval {0} not found")]
    GroundTruthNotFound(u32),

    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
