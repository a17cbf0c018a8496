//! Error taxonomy for canvas operations.
//!
//! Every variant reaches the caller as-is. [`CanvasError::reason`] gives the
//! machine-readable kind a transport maps onto its own envelope.
//! Only `Storage` can happen after a transaction opened, and the transaction
//! rolls back when it does, so retrying is always safe.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_types::TileCoord;
use thiserror::Error;

use crate::checksum::TileChecksum;
use crate::config::ConfigError;

/// Bad input. Never touches state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("coordinates ({x}, {y}) out of bounds (0-{max_x}, 0-{max_y})")]
    OutOfBounds {
        x: i64,
        y: i64,
        max_x: u32,
        max_y: u32,
    },

    #[error("color ({r}, {g}, {b}) out of range, channels must be 0-255")]
    ColorOutOfRange { r: i64, g: i64, b: i64 },

    #[error("tile {tile} out of range (0-{max_x}, 0-{max_y})")]
    TileOutOfRange {
        tile: TileCoord,
        max_x: u32,
        max_y: u32,
    },

    #[error("anonymous writer has an empty token")]
    EmptyIdentity,

    #[error("region of {cells} cells is over the {limit} cell limit for grid export")]
    RegionTooLarge { cells: u64, limit: u64 },
}

/// Everything a canvas operation can fail with.
#[derive(Debug, Error)]
pub enum CanvasError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The identity's cooldown has not elapsed.
    #[error("rate limited, wait {}ms", wait.as_millis())]
    TooSoon { wait: Duration },

    /// The caller's checksum no longer matches the tile.
    #[error("tile {tile} was modified since checksum was read (now {current})")]
    Conflict {
        tile: TileCoord,
        current: TileChecksum,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Machine-distinguishable failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Validation,
    TooSoon,
    Conflict,
    Storage,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::Validation => "validation",
            ErrorReason::TooSoon => "too_soon",
            ErrorReason::Conflict => "conflict",
            ErrorReason::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CanvasError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            CanvasError::Validation(_) => ErrorReason::Validation,
            CanvasError::TooSoon { .. } => ErrorReason::TooSoon,
            CanvasError::Conflict { .. } => ErrorReason::Conflict,
            CanvasError::Storage(_) => ErrorReason::Storage,
        }
    }

    /// Remaining cooldown, for `TooSoon`.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            CanvasError::TooSoon { wait } => Some(*wait),
            _ => None,
        }
    }
}

/// Failure to open a canvas handle.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open canvas database: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("in-memory canvases cannot be opened twice")]
    InMemory,
}

/// Result type for canvas operations.
pub type CanvasResult<T> = std::result::Result<T, CanvasError>;
