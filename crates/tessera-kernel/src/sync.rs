//! Synchronization Protocol: the read path.
//!
//! Checksum mode probes one tile: "unchanged" if the caller's checksum still
//! matches, otherwise the whole tile. Cursor mode returns every cell written
//! after a timestamp, grouped by tile, each group with its tile's current
//! checksum, plus the cursor for the next call.
//!
//! All functions expect to run inside one transaction so the cells and the
//! checksums they return describe the same state.

use std::collections::BTreeMap;

use rusqlite::{Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use tessera_types::{Cell, TileCoord};

use crate::checksum::{self, ChecksumCache, TileChecksum};
use crate::config::CanvasConfig;
use crate::error::ValidationError;
use crate::store::{self, TileMarker};

/// Full contents of one tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilePayload {
    pub tile: TileCoord,
    pub cells: Vec<Cell>,
    pub checksum: TileChecksum,
    pub version: u64,
}

/// Answer to a checksum-mode probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TileSync {
    Unchanged {
        tile: TileCoord,
        checksum: TileChecksum,
    },
    Changed(TilePayload),
}

impl TileSync {
    pub fn checksum(&self) -> &TileChecksum {
        match self {
            TileSync::Unchanged { checksum, .. } => checksum,
            TileSync::Changed(payload) => &payload.checksum,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, TileSync::Unchanged { .. })
    }
}

/// Cells of one tile returned by a cursor sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileChanges {
    pub tile: TileCoord,
    pub cells: Vec<Cell>,
    /// Current checksum of the whole tile.
    pub checksum: TileChecksum,
    /// `cells` is the whole tile rather than only what changed.
    pub full: bool,
}

/// Answer to a cursor-mode sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinceResponse {
    pub changes: Vec<TileChanges>,
    /// Pass this as the cursor of the next call.
    pub next_cursor: i64,
    /// Current checksum of every in-range tile the caller listed, keyed `"x,y"`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checksums: BTreeMap<String, TileChecksum>,
}

/// Answer to a batch checksum probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub outdated: Vec<TileCoord>,
    pub timestamp: i64,
}

/// Build a checksum map from `"x,y" -> checksum` pairs as clients send them.
///
/// Keys that do not parse as a tile are dropped.
pub fn known_checksums<K, V>(
    pairs: impl IntoIterator<Item = (K, V)>,
) -> BTreeMap<TileCoord, TileChecksum>
where
    K: AsRef<str>,
    V: Into<TileChecksum>,
{
    pairs
        .into_iter()
        .filter_map(|(key, sum)| Some((TileCoord::from_key(key.as_ref())?, sum.into())))
        .collect()
}

pub fn check_tile(config: &CanvasConfig, tile: TileCoord) -> Result<(), ValidationError> {
    if config.contains_tile(tile) {
        Ok(())
    } else {
        Err(ValidationError::TileOutOfRange {
            tile,
            max_x: config.tiles_x() - 1,
            max_y: config.tiles_y() - 1,
        })
    }
}

/// Checksum mode. The tile must be in range.
pub fn sync_tile(
    conn: &Connection,
    config: &CanvasConfig,
    cache: Option<&ChecksumCache>,
    tile: TileCoord,
    known: Option<&TileChecksum>,
) -> SqliteResult<TileSync> {
    let version = store::marker_version(conn, tile)?;
    let checksum = checksum::tile_checksum_at(conn, tile, config.tile_size, version, cache)?;
    if known == Some(&checksum) {
        return Ok(TileSync::Unchanged { tile, checksum });
    }
    Ok(TileSync::Changed(TilePayload {
        tile,
        cells: store::tile_cells(conn, tile, config.tile_size)?,
        checksum,
        version,
    }))
}

/// Cursor mode over `(cursor, issued]`.
///
/// Tile markers decide which tiles moved in the window; only those tiles'
/// cells are read. Tiles in `known` whose checksum no longer matches, or that
/// moved, come back whole. Listed tiles outside the board are ignored. The
/// caller must raise the cursor watermark to `issued` in the same
/// transaction.
pub fn sync_since(
    conn: &Connection,
    config: &CanvasConfig,
    cache: Option<&ChecksumCache>,
    cursor: i64,
    issued: i64,
    known: &BTreeMap<TileCoord, TileChecksum>,
) -> SqliteResult<SinceResponse> {
    let touched: BTreeMap<TileCoord, TileMarker> = store::markers_between(conn, cursor, issued)?
        .into_iter()
        .map(|marker| (marker.tile, marker))
        .collect();

    let mut changes = Vec::with_capacity(touched.len());
    let mut checksums = BTreeMap::new();

    for (&tile, expected) in known {
        if !config.contains_tile(tile) {
            continue;
        }
        let version = match touched.get(&tile) {
            Some(marker) => marker.version,
            None => store::marker_version(conn, tile)?,
        };
        let current = checksum::tile_checksum_at(conn, tile, config.tile_size, version, cache)?;
        if current != *expected || touched.contains_key(&tile) {
            changes.push(TileChanges {
                tile,
                cells: store::tile_cells(conn, tile, config.tile_size)?,
                checksum: current.clone(),
                full: true,
            });
        }
        checksums.insert(tile.to_key(), current);
    }

    if touched.keys().any(|tile| !known.contains_key(tile)) {
        let mut moved: BTreeMap<TileCoord, Vec<Cell>> = BTreeMap::new();
        for cell in store::cells_between(conn, cursor, issued)? {
            let tile = cell.tile(config.tile_size);
            if !known.contains_key(&tile) {
                moved.entry(tile).or_default().push(cell);
            }
        }
        for (tile, marker) in &touched {
            if known.contains_key(tile) {
                continue;
            }
            changes.push(TileChanges {
                tile: *tile,
                cells: moved.remove(tile).unwrap_or_default(),
                checksum: checksum::tile_checksum_at(
                    conn,
                    *tile,
                    config.tile_size,
                    marker.version,
                    cache,
                )?,
                full: false,
            });
        }
    }
    changes.sort_by_key(|c| c.tile);

    Ok(SinceResponse {
        changes,
        next_cursor: issued,
        checksums,
    })
}

/// Which of the listed tiles no longer match. Out-of-range tiles are skipped.
pub fn verify_tiles(
    conn: &Connection,
    config: &CanvasConfig,
    cache: Option<&ChecksumCache>,
    known: &BTreeMap<TileCoord, TileChecksum>,
    now: i64,
) -> SqliteResult<Verification> {
    let mut outdated = Vec::new();
    for (&tile, expected) in known {
        if !config.contains_tile(tile) {
            continue;
        }
        if checksum::tile_checksum(conn, tile, config.tile_size, cache)? != *expected {
            outdated.push(tile);
        }
    }
    Ok(Verification {
        outdated,
        timestamp: now,
    })
}
