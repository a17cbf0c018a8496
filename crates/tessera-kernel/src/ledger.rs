//! Rate Limiter / Identity Ledger.
//!
//! One row per writer identity with its cumulative placement count and the
//! time of its last placement. The cooldown check and the record update are
//! one conditional upsert, so two placements from the same identity can never
//! both pass the gate.

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use serde::{Deserialize, Serialize};
use tessera_types::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub identity: Identity,
    pub placed_count: u64,
    pub last_placed: i64,
}

/// Per-identity standing, returned with every placement and by `get_stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityStats {
    pub own_count: u64,
    pub total_count: u64,
    /// Share of all placements made by this identity, percent, 2 decimals.
    pub share_percent: f64,
    pub last_placed: Option<i64>,
    pub active_identities: u64,
    /// Milliseconds until the identity may place again, if it must wait.
    pub cooldown_remaining_ms: Option<u64>,
}

/// Identity with the most placements, as shown publicly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    /// Masked identity label.
    pub identity: String,
    pub placed_count: u64,
}

pub fn get_entry(conn: &Connection, identity: &Identity) -> SqliteResult<Option<LedgerEntry>> {
    conn.query_row(
        "SELECT placed_count, last_placed FROM identity_ledger
         WHERE writer_kind = ?1 AND writer = ?2",
        params![identity.kind().as_str(), identity.key()],
        |row| {
            let count: i64 = row.get(0)?;
            Ok(LedgerEntry {
                identity: identity.clone(),
                placed_count: count as u64,
                last_placed: row.get(1)?,
            })
        },
    )
    .optional()
}

/// Time left before `entry` may place again, `None` if it may place now.
pub fn cooldown_remaining(
    entry: Option<&LedgerEntry>,
    now: i64,
    cooldown: Duration,
) -> Option<Duration> {
    let entry = entry?;
    let cooldown_ms = cooldown.as_millis() as i64;
    let elapsed = now.saturating_sub(entry.last_placed);
    if elapsed < cooldown_ms {
        Some(Duration::from_millis((cooldown_ms - elapsed) as u64))
    } else {
        None
    }
}

/// Record a placement at `at` if the identity last placed no later than
/// `not_after`.
///
/// Returns `false`, writing nothing, when the identity placed more recently.
/// Pass `i64::MAX` to record unconditionally.
pub fn record_placement(
    conn: &Connection,
    identity: &Identity,
    at: i64,
    not_after: i64,
) -> SqliteResult<bool> {
    let changed = conn.execute(
        "INSERT INTO identity_ledger (writer_kind, writer, placed_count, last_placed)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(writer_kind, writer) DO UPDATE SET
            placed_count = placed_count + 1,
            last_placed = max(last_placed, excluded.last_placed)
         WHERE last_placed <= ?4",
        params![identity.kind().as_str(), identity.key(), at, not_after],
    )?;
    Ok(changed == 1)
}

/// Sum of every identity's placement count.
pub fn total_placements(conn: &Connection) -> SqliteResult<u64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(placed_count), 0) FROM identity_ledger",
        [],
        |row| row.get(0),
    )?;
    Ok(total as u64)
}

/// Identities that placed after `since`.
pub fn active_identities(conn: &Connection, since: i64) -> SqliteResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM identity_ledger WHERE last_placed > ?1",
        params![since],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn top_contributor(conn: &Connection) -> SqliteResult<Option<Contributor>> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT writer_kind, writer, placed_count FROM identity_ledger
             ORDER BY placed_count DESC, last_placed ASC
             LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((kind, key, count)) = row else {
        return Ok(None);
    };
    let identity = Identity::from_parts(&kind, &key).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Some(Contributor {
        identity: identity.masked(),
        placed_count: count as u64,
    }))
}

/// Assemble [`IdentityStats`] for `identity` as of `now`.
pub fn stats(
    conn: &Connection,
    identity: &Identity,
    now: i64,
    cooldown: Duration,
    active_window: Duration,
) -> SqliteResult<IdentityStats> {
    let entry = get_entry(conn, identity)?;
    let total_count = total_placements(conn)?;
    let own_count = entry.as_ref().map_or(0, |e| e.placed_count);
    let share_percent = if total_count == 0 {
        0.0
    } else {
        (own_count as f64 / total_count as f64 * 10_000.0).round() / 100.0
    };
    let since = now.saturating_sub(active_window.as_millis() as i64);

    Ok(IdentityStats {
        own_count,
        total_count,
        share_percent,
        last_placed: entry.as_ref().map(|e| e.last_placed),
        active_identities: active_identities(conn, since)?,
        cooldown_remaining_ms: cooldown_remaining(entry.as_ref(), now, cooldown)
            .map(|d| d.as_millis() as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CanvasDb;

    const COOLDOWN: Duration = Duration::from_secs(5);
    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn test_cooldown_remaining() {
        let entry = LedgerEntry {
            identity: Identity::anonymous("1.1.1.1"),
            placed_count: 1,
            last_placed: 10_000,
        };
        assert_eq!(cooldown_remaining(None, 10_000, COOLDOWN), None);
        assert_eq!(
            cooldown_remaining(Some(&entry), 11_000, COOLDOWN),
            Some(Duration::from_secs(4))
        );
        assert_eq!(cooldown_remaining(Some(&entry), 15_000, COOLDOWN), None);
        assert_eq!(cooldown_remaining(Some(&entry), 10_000, Duration::ZERO), None);
    }

    #[test]
    fn test_conditional_record() {
        let db = CanvasDb::in_memory().unwrap();
        let conn = db.conn();
        let who = Identity::anonymous("1.1.1.1");

        assert!(record_placement(conn, &who, 1_000, 1_000 - 5_000).unwrap());
        // Only 1s later: last_placed (1000) > threshold (-3000).
        assert!(!record_placement(conn, &who, 2_000, 2_000 - 5_000).unwrap());
        assert!(record_placement(conn, &who, 6_000, 6_000 - 5_000).unwrap());

        let entry = get_entry(conn, &who).unwrap().unwrap();
        assert_eq!(entry.placed_count, 2);
        assert_eq!(entry.last_placed, 6_000);

        assert!(record_placement(conn, &who, 6_001, i64::MAX).unwrap());
        assert_eq!(get_entry(conn, &who).unwrap().unwrap().placed_count, 3);
    }

    #[test]
    fn test_kinds_are_separate_rows() {
        let db = CanvasDb::in_memory().unwrap();
        let conn = db.conn();
        // Same key text, different kinds.
        record_placement(conn, &Identity::anonymous("7"), 1, i64::MAX).unwrap();
        record_placement(conn, &Identity::account(7), 1, i64::MAX).unwrap();
        assert_eq!(total_placements(conn).unwrap(), 2);
        assert_eq!(
            get_entry(conn, &Identity::account(7)).unwrap().unwrap().placed_count,
            1
        );
    }

    #[test]
    fn test_stats() {
        let db = CanvasDb::in_memory().unwrap();
        let conn = db.conn();
        let me = Identity::anonymous("10.0.0.1");
        let other = Identity::account(3);

        let empty = stats(conn, &me, 0, COOLDOWN, DAY).unwrap();
        assert_eq!(empty.own_count, 0);
        assert_eq!(empty.total_count, 0);
        assert_eq!(empty.share_percent, 0.0);
        assert_eq!(empty.last_placed, None);
        assert_eq!(empty.cooldown_remaining_ms, None);

        record_placement(conn, &me, 1_000, i64::MAX).unwrap();
        record_placement(conn, &other, 1_000, i64::MAX).unwrap();
        record_placement(conn, &other, 2_000, i64::MAX).unwrap();

        let s = stats(conn, &me, 3_000, COOLDOWN, DAY).unwrap();
        assert_eq!(s.own_count, 1);
        assert_eq!(s.total_count, 3);
        assert_eq!(s.share_percent, 33.33);
        assert_eq!(s.last_placed, Some(1_000));
        assert_eq!(s.active_identities, 2);
        assert_eq!(s.cooldown_remaining_ms, Some(3_000));

        let later = stats(conn, &me, 1_000 + DAY.as_millis() as i64, COOLDOWN, DAY).unwrap();
        assert_eq!(later.active_identities, 1);
    }

    #[test]
    fn test_top_contributor_is_masked() {
        let db = CanvasDb::in_memory().unwrap();
        let conn = db.conn();
        assert_eq!(top_contributor(conn).unwrap(), None);

        let busy = Identity::anonymous("192.168.4.20");
        record_placement(conn, &busy, 1, i64::MAX).unwrap();
        record_placement(conn, &busy, 2, i64::MAX).unwrap();
        record_placement(conn, &Identity::account(1), 3, i64::MAX).unwrap();

        let top = top_contributor(conn).unwrap().unwrap();
        assert_eq!(top.identity, "192.168.4.xxx");
        assert_eq!(top.placed_count, 2);
    }
}
