//! Grid coordinates, colors, cells, and tiles.
//!
//! The canvas is sparse: a [`Cell`] exists only once something was placed at
//! its coordinate. Tiles own no content. A tile's state is whatever cells
//! fall inside its square, found by [`Coord::tile`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// A grid position. Always inside the canvas once validated.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
}

impl Coord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// The tile containing this coordinate: `floor(coord / tile_size)`.
    pub fn tile(&self, tile_size: u32) -> TileCoord {
        TileCoord {
            x: self.x / tile_size,
            y: self.y / tile_size,
        }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Address of a fixed-size square tile.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Top-left cell of the tile.
    pub fn origin(&self, tile_size: u32) -> Coord {
        Coord {
            x: self.x * tile_size,
            y: self.y * tile_size,
        }
    }

    /// Compact `"x,y"` key, as clients send in checksum maps.
    pub fn to_key(&self) -> String {
        format!("{},{}", self.x, self.y)
    }

    /// Parse a `"x,y"` key. Whitespace around either number is ignored.
    pub fn from_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once(',')?;
        Some(Self {
            x: x.trim().parse().ok()?,
            y: y.trim().parse().ok()?,
        })
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// An RGB color, one byte per channel.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Color = Color::new(255, 255, 255);
    pub const BLACK: Color = Color::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Build from wide channel values, `None` if any is outside `0..=255`.
    pub fn from_channels(r: i64, g: i64, b: i64) -> Option<Self> {
        Some(Self {
            r: u8::try_from(r).ok()?,
            g: u8::try_from(g).ok()?,
            b: u8::try_from(b).ok()?,
        })
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

/// One written grid position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(flatten)]
    pub coord: Coord,
    #[serde(flatten)]
    pub color: Color,
    /// Who wrote it last.
    pub writer: Identity,
    /// Last write, Unix milliseconds.
    pub updated_at: i64,
}

impl Cell {
    pub fn tile(&self, tile_size: u32) -> TileCoord {
        self.coord.tile(tile_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_math() {
        assert_eq!(Coord::new(200, 300).tile(128), TileCoord::new(1, 2));
        assert_eq!(Coord::new(0, 0).tile(128), TileCoord::new(0, 0));
        assert_eq!(Coord::new(127, 128).tile(128), TileCoord::new(0, 1));
        assert_eq!(Coord::new(1023, 1023).tile(128), TileCoord::new(7, 7));
    }

    #[test]
    fn test_tile_origin() {
        let tile = TileCoord::new(1, 2);
        assert_eq!(tile.origin(128), Coord::new(128, 256));
        assert_eq!(Coord::new(255, 383).tile(128), tile);
        assert_ne!(Coord::new(256, 383).tile(128), tile);
    }

    #[test]
    fn test_tile_key() {
        let tile = TileCoord::new(3, 14);
        assert_eq!(tile.to_key(), "3,14");
        assert_eq!(TileCoord::from_key("3,14"), Some(tile));
        assert_eq!(TileCoord::from_key(" 3 , 14 "), Some(tile));
        assert_eq!(TileCoord::from_key("3"), None);
        assert_eq!(TileCoord::from_key("-1,2"), None);
    }

    #[test]
    fn test_color_channels() {
        assert_eq!(Color::from_channels(0, 128, 255), Some(Color::new(0, 128, 255)));
        assert_eq!(Color::from_channels(256, 0, 0), None);
        assert_eq!(Color::from_channels(0, -1, 0), None);
    }

    #[test]
    fn test_cell_json_is_flat() {
        let cell = Cell {
            coord: Coord::new(1, 2),
            color: Color::new(3, 4, 5),
            writer: Identity::anonymous("9.9.9.9"),
            updated_at: 1000,
        };
        let json = serde_json::to_value(&cell).unwrap();
        assert_eq!(json["x"], 1);
        assert_eq!(json["y"], 2);
        assert_eq!(json["g"], 4);
        assert_eq!(json["writer"]["kind"], "anonymous");
    }
}
