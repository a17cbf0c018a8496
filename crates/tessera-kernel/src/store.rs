//! Canvas Store: cells, tile markers, and the cursor watermark.
//!
//! Free functions over a `Connection` so the same code runs in autocommit
//! mode and inside a transaction (a `Transaction` derefs to `Connection`).

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, Row, params};
use tessera_types::{Cell, Color, Coord, Identity, TileCoord};

const CELL_COLUMNS: &str = "x, y, r, g, b, writer_kind, writer, updated_at";

const WATERMARK_KEY: &str = "cursor_watermark";

/// Last-modification record of a tile. Absent until the first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMarker {
    pub tile: TileCoord,
    /// Bumped by exactly one on every committed placement in the tile.
    pub version: u64,
    pub updated_at: i64,
}

fn cell_from_row(row: &Row<'_>) -> SqliteResult<Cell> {
    let kind: String = row.get(5)?;
    let key: String = row.get(6)?;
    let writer = Identity::from_parts(&kind, &key)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(Cell {
        coord: Coord::new(row.get(0)?, row.get(1)?),
        color: Color::new(row.get(2)?, row.get(3)?, row.get(4)?),
        writer,
        updated_at: row.get(7)?,
    })
}

fn query_cells<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> SqliteResult<Vec<Cell>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, cell_from_row)?;
    rows.collect()
}

// =========================================================================
// Cells
// =========================================================================

/// Get the cell at a coordinate, `None` if it was never written.
pub fn get_cell(conn: &Connection, coord: Coord) -> SqliteResult<Option<Cell>> {
    conn.query_row(
        &format!("SELECT {CELL_COLUMNS} FROM cells WHERE x = ?1 AND y = ?2"),
        params![coord.x, coord.y],
        cell_from_row,
    )
    .optional()
}

/// Insert or overwrite the cell at `coord`.
pub fn upsert_cell(
    conn: &Connection,
    coord: Coord,
    color: Color,
    writer: &Identity,
    at: i64,
) -> SqliteResult<()> {
    conn.execute(
        "INSERT INTO cells (x, y, r, g, b, writer_kind, writer, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(x, y) DO UPDATE SET
            r = excluded.r,
            g = excluded.g,
            b = excluded.b,
            writer_kind = excluded.writer_kind,
            writer = excluded.writer,
            updated_at = excluded.updated_at",
        params![
            coord.x,
            coord.y,
            color.r,
            color.g,
            color.b,
            writer.kind().as_str(),
            writer.key(),
            at,
        ],
    )?;
    Ok(())
}

/// All stored cells of a tile, row-major.
pub fn tile_cells(conn: &Connection, tile: TileCoord, tile_size: u32) -> SqliteResult<Vec<Cell>> {
    region_cells(conn, tile.origin(tile_size), tile_size, tile_size)
}

/// All stored cells in `[origin, origin + size)`, row-major.
pub fn region_cells(
    conn: &Connection,
    origin: Coord,
    width: u32,
    height: u32,
) -> SqliteResult<Vec<Cell>> {
    let end_x = i64::from(origin.x) + i64::from(width);
    let end_y = i64::from(origin.y) + i64::from(height);
    query_cells(
        conn,
        &format!(
            "SELECT {CELL_COLUMNS} FROM cells
             WHERE x >= ?1 AND x < ?2 AND y >= ?3 AND y < ?4
             ORDER BY y, x"
        ),
        params![origin.x, end_x, origin.y, end_y],
    )
}

/// Cells written in `(after, until]`, oldest first.
pub fn cells_between(conn: &Connection, after: i64, until: i64) -> SqliteResult<Vec<Cell>> {
    query_cells(
        conn,
        &format!(
            "SELECT {CELL_COLUMNS} FROM cells
             WHERE updated_at > ?1 AND updated_at <= ?2
             ORDER BY updated_at, y, x"
        ),
        params![after, until],
    )
}

/// Newest cell timestamp, 0 on an empty canvas.
pub fn latest_write(conn: &Connection) -> SqliteResult<i64> {
    conn.query_row("SELECT COALESCE(MAX(updated_at), 0) FROM cells", [], |row| {
        row.get(0)
    })
}

/// Number of distinct written coordinates.
pub fn cell_count(conn: &Connection) -> SqliteResult<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM cells", [], |row| row.get(0))?;
    Ok(count as u64)
}

// =========================================================================
// Tile markers
// =========================================================================

pub fn get_marker(conn: &Connection, tile: TileCoord) -> SqliteResult<Option<TileMarker>> {
    conn.query_row(
        "SELECT version, updated_at FROM tile_markers WHERE tile_x = ?1 AND tile_y = ?2",
        params![tile.x, tile.y],
        |row| {
            let version: i64 = row.get(0)?;
            Ok(TileMarker {
                tile,
                version: version as u64,
                updated_at: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Current version of a tile, 0 if it was never written.
pub fn marker_version(conn: &Connection, tile: TileCoord) -> SqliteResult<u64> {
    Ok(get_marker(conn, tile)?.map_or(0, |m| m.version))
}

/// Compare-and-swap the tile's version from `expected` to `expected + 1`.
///
/// Returns `false` if the marker moved on since `expected` was read.
pub fn bump_marker(conn: &Connection, tile: TileCoord, expected: u64, at: i64) -> SqliteResult<bool> {
    let changed = if expected == 0 {
        conn.execute(
            "INSERT INTO tile_markers (tile_x, tile_y, version, updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(tile_x, tile_y) DO NOTHING",
            params![tile.x, tile.y, at],
        )?
    } else {
        conn.execute(
            "UPDATE tile_markers SET version = version + 1, updated_at = ?3
             WHERE tile_x = ?1 AND tile_y = ?2 AND version = ?4",
            params![tile.x, tile.y, at, expected as i64],
        )?
    };
    Ok(changed == 1)
}

/// Tiles modified in `(after, until]`, without scanning cells.
pub fn markers_between(conn: &Connection, after: i64, until: i64) -> SqliteResult<Vec<TileMarker>> {
    let mut stmt = conn.prepare_cached(
        "SELECT tile_x, tile_y, version, updated_at FROM tile_markers
         WHERE updated_at > ?1 AND updated_at <= ?2
         ORDER BY tile_y, tile_x",
    )?;
    let rows = stmt.query_map(params![after, until], |row| {
        let version: i64 = row.get(2)?;
        Ok(TileMarker {
            tile: TileCoord::new(row.get(0)?, row.get(1)?),
            version: version as u64,
            updated_at: row.get(3)?,
        })
    })?;
    rows.collect()
}

// =========================================================================
// Cursor watermark
// =========================================================================

/// Highest cursor handed out by a cursor sync, 0 if none yet.
pub fn cursor_watermark(conn: &Connection) -> SqliteResult<i64> {
    Ok(conn
        .query_row(
            "SELECT value FROM canvas_meta WHERE key = ?1",
            params![WATERMARK_KEY],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

/// Record that a cursor up to `at` was issued. Never lowers the watermark.
pub fn raise_watermark(conn: &Connection, at: i64) -> SqliteResult<()> {
    conn.execute(
        "INSERT INTO canvas_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = max(value, excluded.value)",
        params![WATERMARK_KEY, at],
    )?;
    Ok(())
}

/// Timestamp for a commit happening now.
///
/// Strictly after every issued cursor, so a cursor sync never skips a write
/// that lands in the same millisecond as its cursor.
pub fn commit_time(conn: &Connection, now: i64) -> SqliteResult<i64> {
    Ok(now.max(cursor_watermark(conn)? + 1))
}
