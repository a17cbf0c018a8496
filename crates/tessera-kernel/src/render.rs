//! Region export.
//!
//! The store is sparse. Only the `Grid` format fills unset cells, with the
//! configured background color; the other formats list written cells only.

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use strum::EnumString;
use tessera_types::{Cell, Coord};

use crate::config::CanvasConfig;
use crate::error::{CanvasResult, ValidationError};
use crate::store;

/// Largest region the dense `Grid` format will build.
pub const MAX_GRID_CELLS: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum ExportFormat {
    /// Sparse JSON list of written cells.
    #[default]
    #[strum(serialize = "json")]
    Json,
    /// `x,y,r,g,b` rows with a header line.
    #[strum(serialize = "csv")]
    Csv,
    /// u32 LE count, then per cell u16 LE x, u16 LE y, u8 r, g, b.
    #[strum(serialize = "binary", serialize = "bin")]
    Binary,
    /// Dense rows of `[r, g, b]`.
    #[strum(serialize = "grid", serialize = "2darray")]
    Grid,
}

impl ExportFormat {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Binary => "binary",
            ExportFormat::Grid => "grid",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rectangle inside the board. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn full(config: &CanvasConfig) -> Self {
        Self {
            x: 0,
            y: 0,
            width: config.width,
            height: config.height,
        }
    }

    /// Pull an arbitrary rectangle onto the board.
    ///
    /// The origin is clamped to the last row/column, then the size to
    /// `1..=remaining`.
    pub fn clamp(config: &CanvasConfig, x: i64, y: i64, width: i64, height: i64) -> Self {
        let board_w = i64::from(config.width);
        let board_h = i64::from(config.height);
        let x = x.clamp(0, board_w - 1);
        let y = y.clamp(0, board_h - 1);
        let width = width.clamp(1, board_w - x);
        let height = height.clamp(1, board_h - y);
        // All four are within 0..=u32::MAX after clamping to the board.
        Self {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        }
    }

    /// This region pulled onto the board, for regions built field by field.
    pub fn on_board(&self, config: &CanvasConfig) -> Self {
        Self::clamp(
            config,
            i64::from(self.x),
            i64::from(self.y),
            i64::from(self.width),
            i64::from(self.height),
        )
    }

    pub fn origin(&self) -> Coord {
        Coord::new(self.x, self.y)
    }

    pub fn cells(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Position and color of one written cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellColor {
    pub x: u32,
    pub y: u32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<&Cell> for CellColor {
    fn from(cell: &Cell) -> Self {
        Self {
            x: cell.coord.x,
            y: cell.coord.y,
            r: cell.color.r,
            g: cell.color.g,
            b: cell.color.b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportData {
    Sparse(Vec<CellColor>),
    Grid(Vec<Vec<[u8; 3]>>),
    Csv(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionExport {
    pub format: ExportFormat,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub region: Region,
    pub cell_count: u64,
    pub timestamp: i64,
    pub data: ExportData,
}

impl RegionExport {
    /// Bytes as served: raw for `Csv` and `Binary`, JSON otherwise.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        match &self.data {
            ExportData::Csv(text) => Ok(text.clone().into_bytes()),
            ExportData::Binary(bytes) => Ok(bytes.clone()),
            ExportData::Sparse(_) | ExportData::Grid(_) => serde_json::to_vec(self),
        }
    }
}

pub fn export_region(
    conn: &Connection,
    config: &CanvasConfig,
    region: Region,
    format: ExportFormat,
    now: i64,
) -> CanvasResult<RegionExport> {
    let region = region.on_board(config);
    if format == ExportFormat::Grid && region.cells() > MAX_GRID_CELLS {
        return Err(ValidationError::RegionTooLarge {
            cells: region.cells(),
            limit: MAX_GRID_CELLS,
        }
        .into());
    }

    let cells = store::region_cells(conn, region.origin(), region.width, region.height)?;
    let data = match format {
        ExportFormat::Json => ExportData::Sparse(cells.iter().map(CellColor::from).collect()),
        ExportFormat::Csv => ExportData::Csv(to_csv(&cells)),
        ExportFormat::Binary => ExportData::Binary(to_binary(&cells)),
        ExportFormat::Grid => ExportData::Grid(to_grid(&cells, region, config)),
    };

    Ok(RegionExport {
        format,
        canvas_width: config.width,
        canvas_height: config.height,
        region,
        cell_count: cells.len() as u64,
        timestamp: now,
        data,
    })
}

fn to_csv(cells: &[Cell]) -> String {
    let mut out = String::from("x,y,r,g,b\n");
    for c in cells {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            c.coord.x, c.coord.y, c.color.r, c.color.g, c.color.b
        );
    }
    out
}

fn to_binary(cells: &[Cell]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + cells.len() * 7);
    out.extend_from_slice(&(cells.len() as u32).to_le_bytes());
    for c in cells {
        // Board dimensions are capped at 65536, so coordinates fit.
        out.extend_from_slice(&(c.coord.x as u16).to_le_bytes());
        out.extend_from_slice(&(c.coord.y as u16).to_le_bytes());
        out.extend_from_slice(&c.color.to_array());
    }
    out
}

fn to_grid(cells: &[Cell], region: Region, config: &CanvasConfig) -> Vec<Vec<[u8; 3]>> {
    let background = config.background.to_array();
    let mut grid = vec![vec![background; region.width as usize]; region.height as usize];
    for c in cells {
        let col = (c.coord.x - region.x) as usize;
        let row = (c.coord.y - region.y) as usize;
        grid[row][col] = c.color.to_array();
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CanvasDb;
    use tessera_types::{Color, Identity};

    fn config() -> CanvasConfig {
        CanvasConfig {
            width: 16,
            height: 16,
            tile_size: 8,
            background: Color::new(10, 10, 10),
            ..CanvasConfig::default()
        }
    }

    fn seeded() -> CanvasDb {
        let db = CanvasDb::in_memory().unwrap();
        let who = Identity::account(1);
        store::upsert_cell(db.conn(), Coord::new(1, 0), Color::new(255, 0, 0), &who, 1).unwrap();
        store::upsert_cell(db.conn(), Coord::new(0, 1), Color::new(0, 255, 0), &who, 2).unwrap();
        store::upsert_cell(db.conn(), Coord::new(12, 15), Color::new(0, 0, 255), &who, 3).unwrap();
        db
    }

    #[test]
    fn test_format_names() {
        assert_eq!(ExportFormat::from_str("2darray"), Some(ExportFormat::Grid));
        assert_eq!(ExportFormat::from_str("CSV"), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::from_str("png"), None);
        assert_eq!(ExportFormat::default().as_str(), "json");
    }

    #[test]
    fn test_clamp() {
        let config = config();
        assert_eq!(Region::clamp(&config, 0, 0, 16, 16), Region::full(&config));
        assert_eq!(
            Region::clamp(&config, -5, 20, 100, 0),
            Region {
                x: 0,
                y: 15,
                width: 16,
                height: 1
            }
        );
        assert_eq!(Region::clamp(&config, 10, 10, 100, 3).width, 6);
    }

    #[test]
    fn test_off_board_region_is_clamped() {
        let db = seeded();
        let config = config();
        let wild = Region {
            x: 1,
            y: 0,
            width: 500,
            height: 0,
        };
        let export = export_region(db.conn(), &config, wild, ExportFormat::Csv, 7).unwrap();
        assert_eq!(
            export.region,
            Region {
                x: 1,
                y: 0,
                width: 15,
                height: 1
            }
        );
        assert_eq!(export.cell_count, 1);

        let past_edge = Region {
            x: 40,
            y: 40,
            width: 2,
            height: 2,
        };
        let export = export_region(db.conn(), &config, past_edge, ExportFormat::Json, 7).unwrap();
        assert_eq!(export.region.origin(), Coord::new(15, 15));
    }

    #[test]
    fn test_csv_and_json() {
        let db = seeded();
        let config = config();
        let region = Region::clamp(&config, 0, 0, 2, 2);

        let csv = export_region(db.conn(), &config, region, ExportFormat::Csv, 7).unwrap();
        assert_eq!(
            String::from_utf8(csv.to_bytes().unwrap()).unwrap(),
            "x,y,r,g,b\n1,0,255,0,0\n0,1,0,255,0\n"
        );

        let json = export_region(db.conn(), &config, region, ExportFormat::Json, 7).unwrap();
        assert_eq!(json.cell_count, 2);
        let value: serde_json::Value = serde_json::from_slice(&json.to_bytes().unwrap()).unwrap();
        assert_eq!(value["data"][0]["x"], 1);
        assert_eq!(value["data"][0]["r"], 255);
        assert_eq!(value["region"]["width"], 2);
        assert_eq!(value["format"], "json");
    }

    #[test]
    fn test_binary_layout() {
        let db = seeded();
        let config = config();
        let region = Region::clamp(&config, 0, 0, 2, 1);
        let export = export_region(db.conn(), &config, region, ExportFormat::Binary, 0).unwrap();
        assert_eq!(
            export.to_bytes().unwrap(),
            vec![1, 0, 0, 0, 1, 0, 0, 0, 255, 0, 0]
        );
    }

    #[test]
    fn test_grid_uses_background() {
        let db = seeded();
        let config = config();
        let region = Region::clamp(&config, 0, 0, 2, 2);
        let export = export_region(db.conn(), &config, region, ExportFormat::Grid, 0).unwrap();
        let ExportData::Grid(rows) = export.data else {
            panic!("expected grid");
        };
        assert_eq!(
            rows,
            vec![
                vec![[10, 10, 10], [255, 0, 0]],
                vec![[0, 255, 0], [10, 10, 10]],
            ]
        );
    }

    #[test]
    fn test_grid_limit() {
        let db = CanvasDb::in_memory().unwrap();
        let config = CanvasConfig {
            width: 2048,
            height: 1024,
            ..CanvasConfig::default()
        };
        let err = export_region(
            db.conn(),
            &config,
            Region::full(&config),
            ExportFormat::Grid,
            0,
        )
        .unwrap_err();
        assert_eq!(err.reason(), crate::error::ErrorReason::Validation);

        // The sparse formats have no limit.
        export_region(db.conn(), &config, Region::full(&config), ExportFormat::Json, 0).unwrap();
    }
}
