//! The canvas handle: every operation a transport layer calls.
//!
//! A `Canvas` owns one SQLite connection and may move between threads but
//! not be shared by them. For parallel workers, give each its own handle via
//! [`Canvas::try_clone`]. Clones share the configuration, clock, checksum
//! cache, and event bus; the database serializes their writes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tessera_types::{Cell, Identity, TileCoord};

use crate::checksum::{self, ChecksumCache, TileChecksum};
use crate::clock::{Clock, SystemClock};
use crate::config::{CanvasConfig, CanvasInfo};
use crate::db::CanvasDb;
use crate::error::{CanvasResult, OpenError, ValidationError};
use crate::events::{TileEvent, TileEvents, TileSubscription};
use crate::ledger::{self, Contributor, IdentityStats};
use crate::placement::{self, Committed, Gating, PlaceRequest, Pipeline, Placement, RawPlacement};
use crate::render::{self, ExportFormat, Region, RegionExport};
use crate::store;
use crate::sync::{self, SinceResponse, TileSync, Verification};

pub struct Canvas {
    db: CanvasDb,
    config: Arc<CanvasConfig>,
    clock: Arc<dyn Clock>,
    cache: Option<Arc<ChecksumCache>>,
    events: TileEvents,
}

impl Canvas {
    /// Open or create a canvas database at `path`.
    pub fn open(path: impl AsRef<Path>, config: CanvasConfig) -> Result<Self, OpenError> {
        config.validate()?;
        let db = CanvasDb::open(path.as_ref())?;
        tracing::info!(
            path = %path.as_ref().display(),
            width = config.width,
            height = config.height,
            tile_size = config.tile_size,
            "opened canvas"
        );
        Ok(Self::with_db(db, config))
    }

    /// A private canvas that lives as long as the handle.
    pub fn in_memory(config: CanvasConfig) -> Result<Self, OpenError> {
        config.validate()?;
        Ok(Self::with_db(CanvasDb::in_memory()?, config))
    }

    fn with_db(db: CanvasDb, config: CanvasConfig) -> Self {
        let cache = config.checksum_cache.then(|| Arc::new(ChecksumCache::new()));
        Self {
            db,
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            cache,
            events: TileEvents::default(),
        }
    }

    /// Replace the time source. Affects this handle and later clones.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Open another connection to the same database.
    pub fn try_clone(&self) -> Result<Self, OpenError> {
        let path = self.db.path().ok_or(OpenError::InMemory)?;
        Ok(Self {
            db: CanvasDb::open(path)?,
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            cache: self.cache.clone(),
            events: self.events.clone(),
        })
    }

    pub fn config(&self) -> &CanvasConfig {
        &self.config
    }

    pub fn info(&self) -> CanvasInfo {
        self.config.info()
    }

    /// Events for every committed placement, from any handle.
    pub fn subscribe(&self) -> TileSubscription {
        self.events.subscribe()
    }

    pub fn subscribe_tile(&self, tile: TileCoord) -> TileSubscription {
        self.events.subscribe_tile(tile)
    }

    // =====================================================================
    // Writes
    // =====================================================================

    /// Gated placement: cooldown, then the checksum guard if the request
    /// carries a checksum, then commit.
    pub fn place_pixel(&self, req: &PlaceRequest, writer: &Identity) -> CanvasResult<Placement> {
        let (committed, stats) = self.place(req, writer, Gating::Full)?;
        Ok(Placement {
            coord: committed.coord,
            tile: committed.tile,
            color: committed.color,
            checksum: committed.checksum,
            version: committed.version,
            timestamp: committed.at,
            stats,
        })
    }

    /// Trusted placement: no cooldown, no checksum guard.
    pub fn place_pixel_raw(
        &self,
        req: &PlaceRequest,
        writer: &Identity,
    ) -> CanvasResult<RawPlacement> {
        let (committed, _) = self.place(req, writer, Gating::Raw)?;
        Ok(RawPlacement {
            coord: committed.coord,
            tile: committed.tile,
            version: committed.version,
            timestamp: committed.at,
        })
    }

    fn place(
        &self,
        req: &PlaceRequest,
        writer: &Identity,
        gating: Gating,
    ) -> CanvasResult<(Committed, IdentityStats)> {
        let valid = placement::check_writer(writer)
            .and_then(|()| req.validate(&self.config))
            .inspect_err(|e| {
                tracing::warn!(%writer, error = %e, "rejected placement");
            })?;

        let tx = self.db.immediate()?;
        let pipeline = Pipeline {
            config: &self.config,
            clock: self.clock.as_ref(),
            cache: self.cache.as_deref(),
        };
        let committed = pipeline.run(&tx, &valid, writer, gating).inspect_err(|e| {
            tracing::warn!(
                %writer,
                coord = %valid.coord,
                reason = %e.reason(),
                "rejected placement"
            );
        })?;
        let stats = ledger::stats(
            &tx,
            writer,
            committed.at,
            self.config.cooldown(),
            self.config.active_window(),
        )?;
        tx.commit()?;

        if let Some(cache) = &self.cache {
            cache.insert(committed.tile, committed.version, committed.checksum.clone());
        }
        self.events.publish(TileEvent {
            tile: committed.tile,
            version: committed.version,
            coord: committed.coord,
            color: committed.color,
            writer: writer.clone(),
            at: committed.at,
        });
        tracing::info!(
            %writer,
            coord = %committed.coord,
            tile = %committed.tile,
            version = committed.version,
            raw = gating == Gating::Raw,
            "placed"
        );
        Ok((committed, stats))
    }

    // =====================================================================
    // Reads
    // =====================================================================

    /// The cell at `(x, y)`, `None` if never written.
    pub fn get_cell(&self, x: i64, y: i64) -> CanvasResult<Option<Cell>> {
        let coord = self.config.coord(x, y).ok_or(ValidationError::OutOfBounds {
            x,
            y,
            max_x: self.config.width - 1,
            max_y: self.config.height - 1,
        })?;
        Ok(store::get_cell(self.db.conn(), coord)?)
    }

    pub fn tile_checksum(&self, tile: TileCoord) -> CanvasResult<TileChecksum> {
        sync::check_tile(&self.config, tile)?;
        let tx = self.db.snapshot()?;
        Ok(checksum::tile_checksum(
            &tx,
            tile,
            self.config.tile_size,
            self.cache.as_deref(),
        )?)
    }

    /// Checksum mode: `Unchanged` if `known` is still current, else the tile.
    pub fn sync_tile(&self, tile: TileCoord, known: Option<&TileChecksum>) -> CanvasResult<TileSync> {
        sync::check_tile(&self.config, tile)?;
        let tx = self.db.snapshot()?;
        Ok(sync::sync_tile(
            &tx,
            &self.config,
            self.cache.as_deref(),
            tile,
            known,
        )?)
    }

    /// Cursor mode: every cell written after `cursor`, grouped by tile.
    pub fn sync_since(&self, cursor: i64) -> CanvasResult<SinceResponse> {
        self.sync_since_with(cursor, &BTreeMap::new())
    }

    /// Cursor mode, plus whole tiles for any listed tile that is stale.
    pub fn sync_since_with(
        &self,
        cursor: i64,
        known: &BTreeMap<TileCoord, TileChecksum>,
    ) -> CanvasResult<SinceResponse> {
        // Immediate, so no commit can land between reading the cells and
        // raising the watermark.
        let tx = self.db.immediate()?;
        let issued = self
            .clock
            .now_millis()
            .max(store::cursor_watermark(&tx)?)
            .max(store::latest_write(&tx)?);
        store::raise_watermark(&tx, issued)?;
        let response = sync::sync_since(
            &tx,
            &self.config,
            self.cache.as_deref(),
            cursor,
            issued,
            known,
        )?;
        tx.commit()?;
        tracing::debug!(
            cursor,
            next_cursor = response.next_cursor,
            tiles = response.changes.len(),
            "cursor sync"
        );
        Ok(response)
    }

    /// Which listed tiles no longer match their checksum.
    pub fn verify_tiles(
        &self,
        known: &BTreeMap<TileCoord, TileChecksum>,
    ) -> CanvasResult<Verification> {
        let tx = self.db.snapshot()?;
        Ok(sync::verify_tiles(
            &tx,
            &self.config,
            self.cache.as_deref(),
            known,
            self.clock.now_millis(),
        )?)
    }

    pub fn get_stats(&self, writer: &Identity) -> CanvasResult<IdentityStats> {
        let tx = self.db.snapshot()?;
        Ok(ledger::stats(
            &tx,
            writer,
            self.clock.now_millis(),
            self.config.cooldown(),
            self.config.active_window(),
        )?)
    }

    pub fn top_contributor(&self) -> CanvasResult<Option<Contributor>> {
        Ok(ledger::top_contributor(self.db.conn())?)
    }

    pub fn export_region(&self, region: Region, format: ExportFormat) -> CanvasResult<RegionExport> {
        let tx = self.db.snapshot()?;
        render::export_region(&tx, &self.config, region, format, self.clock.now_millis())
    }

    /// Total cells ever written, for diagnostics.
    pub fn cell_count(&self) -> CanvasResult<u64> {
        Ok(store::cell_count(self.db.conn())?)
    }
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("path", &self.db.path())
            .field("config", &self.config)
            .field("cached_tiles", &self.cache.as_ref().map(|c| c.len()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::CanvasError;
    use std::time::Duration;
    use tessera_types::{Color, Coord};

    fn canvas() -> (Canvas, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let canvas = Canvas::in_memory(CanvasConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        (canvas, clock)
    }

    #[test]
    fn test_place_and_read_back() {
        let (canvas, _clock) = canvas();
        let who = Identity::anonymous("10.0.0.1");
        let placed = canvas
            .place_pixel(&PlaceRequest::new(200, 300, 1, 2, 3), &who)
            .unwrap();
        assert_eq!(placed.tile, TileCoord::new(1, 2));
        assert_eq!(placed.version, 1);
        assert_eq!(placed.stats.own_count, 1);
        assert_eq!(placed.stats.share_percent, 100.0);
        assert_eq!(placed.stats.cooldown_remaining_ms, Some(5_000));

        let cell = canvas.get_cell(200, 300).unwrap().unwrap();
        assert_eq!(cell.color, Color::new(1, 2, 3));
        assert_eq!(cell.writer, who);
        assert_eq!(cell.updated_at, placed.timestamp);
        assert_eq!(canvas.tile_checksum(placed.tile).unwrap(), placed.checksum);
    }

    #[test]
    fn test_get_cell_bounds() {
        let (canvas, _clock) = canvas();
        assert!(canvas.get_cell(0, 0).unwrap().is_none());
        let err = canvas.get_cell(1024, 0).unwrap_err();
        assert!(matches!(err, CanvasError::Validation(_)));
    }

    #[test]
    fn test_sync_tile_rejects_off_board() {
        let (canvas, _clock) = canvas();
        let err = canvas.sync_tile(TileCoord::new(8, 0), None).unwrap_err();
        assert!(matches!(
            err,
            CanvasError::Validation(ValidationError::TileOutOfRange { .. })
        ));
    }

    #[test]
    fn test_cursor_never_skips_same_millisecond() {
        let (canvas, clock) = canvas();
        let who = Identity::account(1);

        let first = canvas.sync_since(0).unwrap();
        assert!(first.changes.is_empty());

        // Same millisecond as the cursor that was just issued.
        let placed = canvas
            .place_pixel_raw(&PlaceRequest::new(5, 5, 0, 0, 0), &who)
            .unwrap();
        assert!(placed.timestamp > first.next_cursor);

        let second = canvas.sync_since(first.next_cursor).unwrap();
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].cells[0].coord, Coord::new(5, 5));

        clock.advance(Duration::from_millis(10));
        let third = canvas.sync_since(second.next_cursor).unwrap();
        assert!(third.changes.is_empty());
        assert!(third.next_cursor >= second.next_cursor);
    }

    #[test]
    fn test_in_memory_cannot_clone() {
        let (canvas, _clock) = canvas();
        assert!(matches!(canvas.try_clone(), Err(OpenError::InMemory)));
    }

    #[test]
    fn test_rejects_bad_config() {
        let config = CanvasConfig {
            width: 100,
            ..CanvasConfig::default()
        };
        assert!(matches!(
            Canvas::in_memory(config),
            Err(OpenError::Config(_))
        ));
    }

    #[test]
    fn test_cache_disabled_gives_same_answers() {
        let clock = ManualClock::new(1);
        let cached = Canvas::in_memory(CanvasConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        let uncached = Canvas::in_memory(CanvasConfig {
            checksum_cache: false,
            ..CanvasConfig::default()
        })
        .unwrap()
        .with_clock(clock.clone());

        let who = Identity::account(1);
        for canvas in [&cached, &uncached] {
            canvas
                .place_pixel_raw(&PlaceRequest::new(3, 3, 9, 9, 9), &who)
                .unwrap();
            canvas
                .place_pixel_raw(&PlaceRequest::new(4, 3, 8, 8, 8), &who)
                .unwrap();
        }
        let tile = TileCoord::new(0, 0);
        assert_eq!(
            cached.tile_checksum(tile).unwrap(),
            uncached.tile_checksum(tile).unwrap()
        );
        assert!(format!("{cached:?}").contains("cached_tiles: Some(1)"));
        assert!(format!("{uncached:?}").contains("cached_tiles: None"));
    }
}
