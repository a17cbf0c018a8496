//! SQLite persistence for the canvas.
//!
//! Sparse cells keyed by coordinate, one marker row per touched tile, one
//! ledger row per writer identity, and a small key/value table for the sync
//! cursor watermark.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Result as SqliteResult, Transaction, TransactionBehavior};

/// How long a handle waits on another handle's write lock before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
-- Cells (sparse: only ever-written coordinates)
CREATE TABLE IF NOT EXISTS cells (
    x INTEGER NOT NULL,
    y INTEGER NOT NULL,
    r INTEGER NOT NULL,
    g INTEGER NOT NULL,
    b INTEGER NOT NULL,
    writer_kind TEXT NOT NULL,
    writer TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (x, y)
);
CREATE INDEX IF NOT EXISTS idx_cells_updated ON cells(updated_at);

-- Tile markers (modification version + time, no content)
CREATE TABLE IF NOT EXISTS tile_markers (
    tile_x INTEGER NOT NULL,
    tile_y INTEGER NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (tile_x, tile_y)
);
CREATE INDEX IF NOT EXISTS idx_tile_markers_updated ON tile_markers(updated_at);

-- Identity ledger (cooldown + counters)
CREATE TABLE IF NOT EXISTS identity_ledger (
    writer_kind TEXT NOT NULL,
    writer TEXT NOT NULL,
    placed_count INTEGER NOT NULL,
    last_placed INTEGER NOT NULL,
    PRIMARY KEY (writer_kind, writer)
);
CREATE INDEX IF NOT EXISTS idx_ledger_last_placed ON identity_ledger(last_placed);

-- Canvas-wide scalars
CREATE TABLE IF NOT EXISTS canvas_meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
"#;

/// Database handle for one canvas connection.
pub struct CanvasDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl CanvasDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened canvas database");
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    /// Backing file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Begin a write transaction that takes the database write lock up front.
    ///
    /// Every check made inside it sees exactly the state it commits against.
    /// Dropping the transaction without committing rolls it back.
    pub fn immediate(&self) -> SqliteResult<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
    }

    /// Begin a read transaction: one consistent snapshot for multi-query reads.
    pub fn snapshot(&self) -> SqliteResult<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)
    }
}
