// SQLite persistence gateway for per-league pick history.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pick::{DraftPick, PickRecord};
use crate::protocol::LeagueId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        source: rusqlite::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("player {player} is already drafted in league {league}")]
    PlayerTaken { league: LeagueId, player: i64 },

    #[error("invalid drafted_at timestamp `{value}`: {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },

    #[error("database mutex poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Gateway traits
// ---------------------------------------------------------------------------

/// Transactional access to the per-league pick tables.
pub trait PickStore: Send + Sync {
    /// Open a write transaction. Dropping the returned value without calling
    /// [`PickTransaction::commit`] rolls it back.
    fn begin(&self) -> Result<Box<dyn PickTransaction + '_>, StoreError>;

    /// All committed picks for `league`, in ascending sequence order.
    fn pick_history(&self, league: LeagueId) -> Result<Vec<PickRecord>, StoreError>;
}

pub trait PickTransaction {
    /// Insert `pick` and return the sequence number the store assigned to
    /// it. The client's claimed number is not written; the store decides.
    fn insert_pick(&mut self, pick: &DraftPick) -> Result<i64, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;

    fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// SQLite-backed pick store. Each league gets its own `draft_<league>` table
/// whose `pick` column is an autoincrement primary key.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`. Pass `":memory:"` for an
    /// ephemeral database (useful for tests).
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_string(),
            source,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Create the pick table for `league` if it does not exist yet. League
    /// setup calls this when a draft is started; the insert path also creates
    /// the table lazily.
    pub fn provision_league(&self, league: LeagueId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(&create_table_sql(league))?;
        debug!("Provisioned pick table for league {}", league);
        Ok(())
    }

    /// Number of committed picks in `league`. Zero if the league has no
    /// table yet.
    pub fn pick_count(&self, league: LeagueId) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        if !table_exists(&conn, league)? {
            return Ok(0);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", table_name(league)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl PickStore for Database {
    fn begin(&self) -> Result<Box<dyn PickTransaction + '_>, StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction { conn, open: true }))
    }

    fn pick_history(&self, league: LeagueId) -> Result<Vec<PickRecord>, StoreError> {
        let conn = self.conn()?;
        if !table_exists(&conn, league)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT pick, player, team, drafted_at FROM \"{}\" ORDER BY pick",
            table_name(league)
        ))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(pick, player, team, drafted_at)| {
                Ok(PickRecord {
                    pick,
                    player,
                    team,
                    drafted_at: parse_timestamp(&drafted_at)?,
                })
            })
            .collect()
    }
}

/// An open `BEGIN IMMEDIATE` transaction. Holds the connection lock for its
/// whole lifetime.
struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    open: bool,
}

impl PickTransaction for SqliteTransaction<'_> {
    fn insert_pick(&mut self, pick: &DraftPick) -> Result<i64, StoreError> {
        self.conn.execute_batch(&create_table_sql(pick.league))?;

        let sql = format!(
            "INSERT INTO \"{}\" (player, team) VALUES (?1, ?2) RETURNING pick",
            table_name(pick.league)
        );
        self.conn
            .query_row(&sql, params![pick.player, pick.team], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    StoreError::PlayerTaken {
                        league: pick.league,
                        player: pick.player,
                    }
                }
                other => other.into(),
            })
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("Failed to roll back abandoned transaction: {}", e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn table_name(league: LeagueId) -> String {
    format!("draft_{}", league.get())
}

fn create_table_sql(league: LeagueId) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (
            pick       INTEGER PRIMARY KEY AUTOINCREMENT,
            player     INTEGER NOT NULL UNIQUE,
            team       INTEGER NOT NULL,
            drafted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
        table_name(league)
    )
}

fn table_exists(conn: &Connection, league: LeagueId) -> Result<bool, StoreError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name(league)],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}
