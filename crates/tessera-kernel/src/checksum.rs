//! Tile Checksum Engine.
//!
//! A tile's fingerprint is SHA-256 over its cells rendered as
//! `"{x},{y},{r},{g},{b};"`, sorted, and concatenated. Sorting makes it a
//! function of the cell set alone, not of write order. An empty tile hashes
//! the empty string.

use std::fmt;

use dashmap::DashMap;
use rusqlite::{Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_types::{Cell, TileCoord};

use crate::store;

/// Hex-encoded tile fingerprint.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TileChecksum(String);

impl TileChecksum {
    /// Fingerprint an arbitrary set of cells.
    pub fn of_cells<'a>(cells: impl IntoIterator<Item = &'a Cell>) -> Self {
        let mut records: Vec<String> = cells
            .into_iter()
            .map(|c| {
                format!(
                    "{},{},{},{},{};",
                    c.coord.x, c.coord.y, c.color.r, c.color.g, c.color.b
                )
            })
            .collect();
        records.sort_unstable();

        let mut hasher = Sha256::new();
        for record in &records {
            hasher.update(record.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of a tile nobody has written to.
    pub fn of_empty() -> Self {
        Self::of_cells(std::iter::empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TileChecksum {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TileChecksum {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TileChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checksums remembered per tile, valid while the tile's marker version holds.
///
/// A marker version identifies one tile state exactly, so a hit never needs
/// the cells. Entries are only filled and read inside a transaction that
/// observed the version, which keeps them from racing a commit.
#[derive(Debug, Default)]
pub struct ChecksumCache {
    entries: DashMap<TileCoord, (u64, TileChecksum)>,
}

impl ChecksumCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tile: TileCoord, version: u64) -> Option<TileChecksum> {
        self.entries
            .get(&tile)
            .filter(|entry| entry.0 == version)
            .map(|entry| entry.1.clone())
    }

    pub fn insert(&self, tile: TileCoord, version: u64, checksum: TileChecksum) {
        self.entries
            .entry(tile)
            .and_modify(|entry| {
                // Never replace a newer state with an older one.
                if entry.0 < version {
                    *entry = (version, checksum.clone());
                }
            })
            .or_insert_with(|| (version, checksum));
    }

    /// Tiles currently cached.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Current checksum of `tile` as seen by `conn`.
///
/// Call inside a transaction when the result is compared against, or
/// returned alongside, other reads.
pub fn tile_checksum(
    conn: &Connection,
    tile: TileCoord,
    tile_size: u32,
    cache: Option<&ChecksumCache>,
) -> SqliteResult<TileChecksum> {
    let version = store::marker_version(conn, tile)?;
    tile_checksum_at(conn, tile, tile_size, version, cache)
}

/// Same as [`tile_checksum`], for a caller that already read the marker version.
pub fn tile_checksum_at(
    conn: &Connection,
    tile: TileCoord,
    tile_size: u32,
    version: u64,
    cache: Option<&ChecksumCache>,
) -> SqliteResult<TileChecksum> {
    let cache = cache.filter(|_| version > 0);
    if let Some(hit) = cache.and_then(|c| c.get(tile, version)) {
        tracing::trace!(%tile, version, "checksum cache hit");
        return Ok(hit);
    }
    let cells = store::tile_cells(conn, tile, tile_size)?;
    let checksum = TileChecksum::of_cells(&cells);
    if let Some(cache) = cache {
        cache.insert(tile, version, checksum.clone());
    }
    Ok(checksum)
}
