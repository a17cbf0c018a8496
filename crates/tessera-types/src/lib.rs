//! Shared cell, tile, and identity types for tessera.
//!
//! A pure leaf crate with **no internal tessera dependencies**: the kernel,
//! CLI, and any transport layer all speak these types.
//!
//! # Key Types
//!
//! |-----------------|-----------------------------------------------|
//! | Type            | Purpose                                       |
//! |-----------------|-----------------------------------------------|
//! | [`Coord`]       | Grid position `(x, y)`                        |
//! | [`TileCoord`]   | Tile address, `floor(coord / tile_size)`      |
//! | [`Color`]       | RGB triple                                    |
//! | [`Cell`]        | A written position: color, writer, timestamp  |
//! | [`Identity`]    | Writer: anonymous token or account            |
//! |-----------------|-----------------------------------------------|

pub mod cell;
pub mod identity;

pub use cell::{Cell, Color, Coord, TileCoord};
pub use identity::{AccountId, Identity, IdentityError, IdentityKind};

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
