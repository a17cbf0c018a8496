//! # tessera-kernel
//!
//! Tiled canvas engine for tessera.
//!
//! The canvas is a sparse grid of colored cells, partitioned into fixed-size
//! square tiles. The kernel:
//! - Stores cells in SQLite and keeps one modification marker per tile
//! - Fingerprints each tile from its cell set (order-independent SHA-256)
//! - Gates placements through validation, a per-identity cooldown, and an
//!   optional checksum guard, committing all effects in one transaction
//! - Serves diffs by tile checksum or by time cursor
//! - Broadcasts one event per committed placement
//!
//! Transports (HTTP, sockets, the `tessera` CLI) call into [`Canvas`].

pub mod canvas;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod ledger;
pub mod placement;
pub mod render;
pub mod store;
pub mod sync;

pub use canvas::Canvas;
pub use checksum::{ChecksumCache, TileChecksum};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CanvasConfig, CanvasInfo, ConfigError};
pub use db::CanvasDb;
pub use error::{CanvasError, CanvasResult, ErrorReason, OpenError, ValidationError};
pub use events::{TileEvent, TileEvents, TileSubscription};
pub use ledger::{Contributor, IdentityStats};
pub use placement::{Gating, PlaceRequest, Placement, RawPlacement};
pub use render::{ExportData, ExportFormat, Region, RegionExport};
pub use store::TileMarker;
pub use sync::{SinceResponse, TileChanges, TilePayload, TileSync, Verification, known_checksums};

pub use tessera_types::{Cell, Color, Coord, Identity, TileCoord};
