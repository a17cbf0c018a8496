//! Tile-change events.
//!
//! Every committed placement publishes one [`TileEvent`]. Rejected
//! placements publish nothing. Delivery is best-effort: a subscriber that
//! falls more than the channel capacity behind skips ahead and re-syncs
//! through the sync protocol.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use tessera_types::{Color, Coord, Identity, TileCoord};

/// Default channel capacity.
pub const EVENT_CAPACITY: usize = 1024;

/// A committed placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileEvent {
    pub tile: TileCoord,
    /// Tile marker version after the placement.
    pub version: u64,
    pub coord: Coord,
    pub color: Color,
    pub writer: Identity,
    /// Commit time, Unix milliseconds.
    pub at: i64,
}

/// Broadcast bus shared by every handle on one canvas.
#[derive(Debug, Clone)]
pub struct TileEvents {
    tx: broadcast::Sender<TileEvent>,
}

impl TileEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns how many subscribers will see it.
    pub fn publish(&self, event: TileEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to every tile.
    pub fn subscribe(&self) -> TileSubscription {
        TileSubscription {
            only: None,
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to a single tile.
    pub fn subscribe_tile(&self, tile: TileCoord) -> TileSubscription {
        TileSubscription {
            only: Some(tile),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for TileEvents {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

/// Receiving end of [`TileEvents`], optionally filtered to one tile.
pub struct TileSubscription {
    only: Option<TileCoord>,
    rx: broadcast::Receiver<TileEvent>,
}

impl TileSubscription {
    fn wants(&self, event: &TileEvent) -> bool {
        self.only.is_none_or(|tile| tile == event.tile)
    }

    /// Wait for the next matching event. `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<TileEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "tile subscription lagged behind");
                }
            }
        }
    }

    /// Next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Option<TileEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "tile subscription lagged behind");
                }
            }
        }
    }
}

impl std::fmt::Debug for TileSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileSubscription")
            .field("only", &self.only)
            .finish_non_exhaustive()
    }
}
