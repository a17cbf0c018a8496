//! Canvas configuration.
//!
//! One `CanvasConfig` is built at startup, validated, and handed to the
//! [`Canvas`](crate::Canvas) behind an `Arc`. Clients and server must agree on
//! the geometry, otherwise tile coordinates diverge.
//!
//! ```toml
//! width = 1024
//! height = 1024
//! tile_size = 128
//! cooldown_secs = 5
//! active_window_secs = 86400
//! checksum_cache = true
//!
//! [background]
//! r = 255
//! g = 255
//! b = 255
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_types::{Color, Coord, TileCoord};
use thiserror::Error;

/// Errors from loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid canvas geometry: {0}")]
    Geometry(String),
}

/// Shared, immutable canvas settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasConfig {
    /// Canvas width in cells. Must be a multiple of `tile_size`.
    pub width: u32,
    /// Canvas height in cells. Must be a multiple of `tile_size`.
    pub height: u32,
    /// Edge length of a square tile.
    pub tile_size: u32,
    /// Minimum wait between placements by one identity. 0 disables the gate.
    pub cooldown_secs: u64,
    /// Rolling window for the "recently active identities" count.
    pub active_window_secs: u64,
    /// Color rendered for cells that were never written.
    pub background: Color,
    /// Cache tile checksums by marker version.
    pub checksum_cache: bool,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            tile_size: 128,
            cooldown_secs: 5,
            active_window_secs: 24 * 60 * 60,
            background: Color::WHITE,
            checksum_cache: true,
        }
    }
}

/// Board geometry as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasInfo {
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub max_tile_x: u32,
    pub max_tile_y: u32,
}

impl CanvasConfig {
    /// Parse and validate a TOML document. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: CanvasConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check that tile math stays exact.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size == 0 {
            return Err(ConfigError::Geometry("tile_size must be positive".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Geometry(format!(
                "canvas must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width % self.tile_size != 0 || self.height % self.tile_size != 0 {
            return Err(ConfigError::Geometry(format!(
                "{}x{} is not a whole number of {}-cell tiles",
                self.width, self.height, self.tile_size
            )));
        }
        // Binary export packs coordinates as u16.
        if self.width > u32::from(u16::MAX) + 1 || self.height > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::Geometry(format!(
                "{}x{} exceeds the 65536x65536 limit",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    /// Number of tile columns.
    pub fn tiles_x(&self) -> u32 {
        self.width / self.tile_size
    }

    /// Number of tile rows.
    pub fn tiles_y(&self) -> u32 {
        self.height / self.tile_size
    }

    /// Narrow wide request coordinates to a [`Coord`] if inside the board.
    pub fn coord(&self, x: i64, y: i64) -> Option<Coord> {
        let x = u32::try_from(x).ok().filter(|x| *x < self.width)?;
        let y = u32::try_from(y).ok().filter(|y| *y < self.height)?;
        Some(Coord::new(x, y))
    }

    pub fn contains_tile(&self, tile: TileCoord) -> bool {
        tile.x < self.tiles_x() && tile.y < self.tiles_y()
    }

    pub fn info(&self) -> CanvasInfo {
        CanvasInfo {
            min_x: 0,
            max_x: self.width - 1,
            min_y: 0,
            max_y: self.height - 1,
            tile_width: self.tile_size,
            tile_height: self.tile_size,
            max_tile_x: self.tiles_x() - 1,
            max_tile_y: self.tiles_y() - 1,
        }
    }
}
