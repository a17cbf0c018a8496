//! Placement Pipeline.
//!
//! ```text
//! Validate ─► [ RateLimit ─► ChecksumGuard ─► Commit ]  (one IMMEDIATE tx)
//! ```
//!
//! Validate runs before any transaction opens and never touches state. The
//! remaining gates run against a transaction holding the write lock, so what
//! they check is exactly what Commit writes against. The raw path skips the
//! rate limit and checksum gates.
//!
//! Commit itself re-asserts both gates as conditional statements: the tile
//! marker moves by compare-and-swap on its version and the ledger row only
//! updates if the cooldown elapsed. Either affecting zero rows fails the
//! placement and the caller drops the transaction.

use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tessera_types::{Color, Coord, Identity, TileCoord};

use crate::checksum::{self, ChecksumCache, TileChecksum};
use crate::clock::Clock;
use crate::config::CanvasConfig;
use crate::error::{CanvasError, CanvasResult, ValidationError};
use crate::ledger::{self, IdentityStats};
use crate::store;

/// An unvalidated placement, as received from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceRequest {
    pub x: i64,
    pub y: i64,
    pub r: i64,
    pub g: i64,
    pub b: i64,
    /// The tile checksum the caller last saw, for the conflict guard.
    #[serde(default)]
    pub checksum: Option<TileChecksum>,
}

impl PlaceRequest {
    pub fn new(x: i64, y: i64, r: i64, g: i64, b: i64) -> Self {
        Self {
            x,
            y,
            r,
            g,
            b,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<TileChecksum>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Bounds and channel checks.
    pub fn validate(&self, config: &CanvasConfig) -> Result<ValidPlacement, ValidationError> {
        let coord = config
            .coord(self.x, self.y)
            .ok_or(ValidationError::OutOfBounds {
                x: self.x,
                y: self.y,
                max_x: config.width - 1,
                max_y: config.height - 1,
            })?;
        let color =
            Color::from_channels(self.r, self.g, self.b).ok_or(ValidationError::ColorOutOfRange {
                r: self.r,
                g: self.g,
                b: self.b,
            })?;
        Ok(ValidPlacement {
            coord,
            tile: coord.tile(config.tile_size),
            color,
            checksum: self.checksum.clone(),
        })
    }
}

/// Writers must be recordable in the ledger: anonymous tokens cannot be empty.
pub fn check_writer(writer: &Identity) -> Result<(), ValidationError> {
    match writer {
        Identity::Anonymous(token) if token.is_empty() => Err(ValidationError::EmptyIdentity),
        _ => Ok(()),
    }
}

/// A placement that passed Validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPlacement {
    pub coord: Coord,
    pub tile: TileCoord,
    pub color: Color,
    pub checksum: Option<TileChecksum>,
}

/// Which gates a placement goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gating {
    /// Cooldown and, when a checksum is supplied, the conflict guard.
    Full,
    /// Trusted writers: commit without cooldown or conflict checks.
    Raw,
}

/// What a successful commit wrote. Not durable until the transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub coord: Coord,
    pub tile: TileCoord,
    pub color: Color,
    /// Tile marker version after this placement.
    pub version: u64,
    /// Commit timestamp, Unix milliseconds.
    pub at: i64,
    /// Checksum of the tile including this placement.
    pub checksum: TileChecksum,
}

/// Result of a gated placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub coord: Coord,
    pub tile: TileCoord,
    pub color: Color,
    pub checksum: TileChecksum,
    pub version: u64,
    pub timestamp: i64,
    pub stats: IdentityStats,
}

/// Result of a raw placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPlacement {
    pub coord: Coord,
    pub tile: TileCoord,
    pub version: u64,
    pub timestamp: i64,
}

/// The gates after Validate, bound to one canvas's settings.
pub struct Pipeline<'a> {
    pub config: &'a CanvasConfig,
    pub clock: &'a dyn Clock,
    pub cache: Option<&'a ChecksumCache>,
}

impl Pipeline<'_> {
    /// Run RateLimit, ChecksumGuard, and Commit against `tx`.
    ///
    /// `tx` must be an immediate transaction. On `Err` nothing was written
    /// that the caller should keep; drop the transaction.
    pub fn run(
        &self,
        tx: &Connection,
        placement: &ValidPlacement,
        writer: &Identity,
        gating: Gating,
    ) -> CanvasResult<Committed> {
        let tile = placement.tile;
        let at = store::commit_time(tx, self.clock.now_millis())?;
        let cooldown = self.cooldown(gating);

        // RateLimit
        if !cooldown.is_zero() {
            let entry = ledger::get_entry(tx, writer)?;
            if let Some(wait) = ledger::cooldown_remaining(entry.as_ref(), at, cooldown) {
                tracing::debug!(%writer, wait_ms = wait.as_millis() as u64, "cooldown active");
                return Err(CanvasError::TooSoon { wait });
            }
        }

        // ChecksumGuard
        let version = store::marker_version(tx, tile)?;
        if let (Gating::Full, Some(expected)) = (gating, &placement.checksum) {
            let current =
                checksum::tile_checksum_at(tx, tile, self.config.tile_size, version, self.cache)?;
            if current != *expected {
                tracing::debug!(%tile, %expected, %current, "checksum guard rejected placement");
                return Err(CanvasError::Conflict { tile, current });
            }
        }

        // Commit
        if !store::bump_marker(tx, tile, version, at)? {
            let current = checksum::tile_checksum(tx, tile, self.config.tile_size, None)?;
            return Err(CanvasError::Conflict { tile, current });
        }
        let not_after = if cooldown.is_zero() {
            i64::MAX
        } else {
            at - cooldown.as_millis() as i64
        };
        if !ledger::record_placement(tx, writer, at, not_after)? {
            let entry = ledger::get_entry(tx, writer)?;
            let wait = ledger::cooldown_remaining(entry.as_ref(), at, cooldown).unwrap_or(cooldown);
            return Err(CanvasError::TooSoon { wait });
        }
        store::upsert_cell(tx, placement.coord, placement.color, writer, at)?;

        // Not cached yet: the transaction may still fail to commit.
        let checksum =
            checksum::tile_checksum_at(tx, tile, self.config.tile_size, version + 1, None)?;

        Ok(Committed {
            coord: placement.coord,
            tile,
            color: placement.color,
            version: version + 1,
            at,
            checksum,
        })
    }

    fn cooldown(&self, gating: Gating) -> Duration {
        match gating {
            Gating::Full => self.config.cooldown(),
            Gating::Raw => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::CanvasDb;

    fn config() -> CanvasConfig {
        CanvasConfig {
            width: 64,
            height: 64,
            tile_size: 16,
            ..CanvasConfig::default()
        }
    }

    fn place(
        db: &CanvasDb,
        pipeline: &Pipeline<'_>,
        req: PlaceRequest,
        writer: &Identity,
        gating: Gating,
    ) -> CanvasResult<Committed> {
        let valid = req.validate(pipeline.config)?;
        let tx = db.immediate()?;
        let committed = pipeline.run(&tx, &valid, writer, gating)?;
        tx.commit()?;
        Ok(committed)
    }

    fn row_counts(db: &CanvasDb) -> (i64, i64, i64) {
        let count = |table: &str| -> i64 {
            db.conn()
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap()
        };
        (count("cells"), count("tile_markers"), count("identity_ledger"))
    }

    #[test]
    fn test_check_writer() {
        check_writer(&Identity::anonymous("10.0.0.1")).unwrap();
        check_writer(&Identity::account(0)).unwrap();
        assert_eq!(
            check_writer(&Identity::anonymous("")),
            Err(ValidationError::EmptyIdentity)
        );
    }

    #[test]
    fn test_validate() {
        let config = config();
        let valid = PlaceRequest::new(20, 40, 1, 2, 3).validate(&config).unwrap();
        assert_eq!(valid.tile, TileCoord::new(1, 2));
        assert_eq!(valid.color, Color::new(1, 2, 3));

        assert!(matches!(
            PlaceRequest::new(64, 0, 0, 0, 0).validate(&config),
            Err(ValidationError::OutOfBounds { x: 64, max_x: 63, .. })
        ));
        assert!(matches!(
            PlaceRequest::new(0, -1, 0, 0, 0).validate(&config),
            Err(ValidationError::OutOfBounds { .. })
        ));
        assert!(matches!(
            PlaceRequest::new(0, 0, 0, 256, 0).validate(&config),
            Err(ValidationError::ColorOutOfRange { g: 256, .. })
        ));
    }

    #[test]
    fn test_cooldown_gate() {
        let db = CanvasDb::in_memory().unwrap();
        let config = config();
        let clock = ManualClock::new(100_000);
        let pipeline = Pipeline {
            config: &config,
            clock: &clock,
            cache: None,
        };
        let who = Identity::anonymous("10.1.1.1");

        place(&db, &pipeline, PlaceRequest::new(1, 1, 0, 0, 0), &who, Gating::Full).unwrap();
        clock.advance(Duration::from_secs(1));
        let err = place(&db, &pipeline, PlaceRequest::new(2, 2, 0, 0, 0), &who, Gating::Full)
            .unwrap_err();
        assert_eq!(err.wait(), Some(Duration::from_secs(4)));
        assert_eq!(row_counts(&db), (1, 1, 1));

        // Raw placements ignore the cooldown but still count.
        place(&db, &pipeline, PlaceRequest::new(2, 2, 0, 0, 0), &who, Gating::Raw).unwrap();
        assert_eq!(ledger::get_entry(db.conn(), &who).unwrap().unwrap().placed_count, 2);

        clock.advance(Duration::from_secs(5));
        place(&db, &pipeline, PlaceRequest::new(3, 3, 0, 0, 0), &who, Gating::Full).unwrap();
    }

    #[test]
    fn test_checksum_guard() {
        let db = CanvasDb::in_memory().unwrap();
        let config = CanvasConfig {
            cooldown_secs: 0,
            ..config()
        };
        let clock = ManualClock::new(1);
        let cache = ChecksumCache::new();
        let pipeline = Pipeline {
            config: &config,
            clock: &clock,
            cache: Some(&cache),
        };
        let alice = Identity::anonymous("10.0.0.1");
        let bob = Identity::anonymous("10.0.0.2");

        let seen = TileChecksum::of_empty();
        let first = place(
            &db,
            &pipeline,
            PlaceRequest::new(0, 0, 9, 9, 9).with_checksum(seen.clone()),
            &alice,
            Gating::Full,
        )
        .unwrap();
        assert_eq!(first.version, 1);
        assert_ne!(first.checksum, seen);

        // Bob still thinks the tile is empty.
        let err = place(
            &db,
            &pipeline,
            PlaceRequest::new(1, 0, 1, 1, 1).with_checksum(seen.clone()),
            &bob,
            Gating::Full,
        )
        .unwrap_err();
        match err {
            CanvasError::Conflict { tile, current } => {
                assert_eq!(tile, TileCoord::new(0, 0));
                assert_eq!(current, first.checksum);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(row_counts(&db), (1, 1, 1));

        // The raw path never looks at the checksum.
        place(
            &db,
            &pipeline,
            PlaceRequest::new(1, 0, 1, 1, 1).with_checksum(seen),
            &bob,
            Gating::Raw,
        )
        .unwrap();
        assert_eq!(row_counts(&db), (2, 1, 2));
    }

    #[test]
    fn test_commit_time_follows_watermark() {
        let db = CanvasDb::in_memory().unwrap();
        let config = config();
        let clock = ManualClock::new(500);
        let pipeline = Pipeline {
            config: &config,
            clock: &clock,
            cache: None,
        };
        store::raise_watermark(db.conn(), 500).unwrap();
        let committed = place(
            &db,
            &pipeline,
            PlaceRequest::new(0, 0, 0, 0, 0),
            &Identity::account(1),
            Gating::Full,
        )
        .unwrap();
        assert_eq!(committed.at, 501);
    }
}
