//! Error types for movement validation and surface ingestion
//!
//! None of these are faults. A `MoveRejection` becomes a rejection reply and
//! a rebroadcast of the last valid state; a `SurfaceError` refuses one
//! ingestion step and leaves the loaded grid untouched.

use shared::RejectReason;
use thiserror::Error;

/// Why a proposed move was not committed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MoveRejection {
    #[error("no walkable sample near the proposed position")]
    OffSurface,

    #[error("implied speed {speed:.2} exceeds limit {max_speed:.2}")]
    SpeedViolation { speed: f32, max_speed: f32 },

    #[error("non-positive elapsed time since last update ({elapsed:.4}s)")]
    StaleTimestamp { elapsed: f64 },

    #[error("unknown entity {0}")]
    UnknownEntity(u32),

    #[error("proposed position has non-finite coordinates")]
    NonFinitePosition,
}

impl MoveRejection {
    /// Wire code sent back to the proposing client
    pub fn reason(&self) -> RejectReason {
        match self {
            MoveRejection::OffSurface | MoveRejection::NonFinitePosition => {
                RejectReason::OffSurface
            }
            MoveRejection::SpeedViolation { .. } => RejectReason::SpeedViolation,
            MoveRejection::StaleTimestamp { .. } => RejectReason::StaleTimestamp,
            MoveRejection::UnknownEntity(_) => RejectReason::UnknownEntity,
        }
    }
}

/// Failures on the surface ingestion path
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SurfaceError {
    #[error("config mismatch: {0}")]
    ConfigMismatch(String),

    #[error("surface config is locked while samples are loaded; clear the grid first")]
    ConfigLocked,

    #[error("surface ingestion requires an admin connection")]
    Unauthorized,

    #[error("no surface samples to build from")]
    Empty,

    #[error("a surface grid is installed; clear it before uploading a new one")]
    GridInstalled,

    #[error("failed to read surface export: {0}")]
    Export(String),
}
