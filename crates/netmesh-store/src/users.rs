use std::sync::Arc;

use rusqlite::params;

use netmesh_proto::{now_ms, User};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Roster persistence. Connections are the source of truth for who is
/// online right now; this table is the durable record behind them.
pub struct UserStore {
    db: Arc<Database>,
}

impl UserStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a user, or rebind an existing row to a new connection.
    /// Called on every successful handshake.
    pub fn upsert(&self, user: &User) -> Result<()> {
        let now = now_ms();
        self.db.conn().execute(
            "INSERT INTO users (id, username, public_key, is_host, is_online, last_seen,
                                connection_id, ip_address, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 username      = excluded.username,
                 public_key    = excluded.public_key,
                 is_online     = excluded.is_online,
                 last_seen     = excluded.last_seen,
                 connection_id = excluded.connection_id,
                 ip_address    = excluded.ip_address,
                 updated_at    = excluded.updated_at",
            params![
                user.id,
                user.username,
                user.public_key,
                user.is_host,
                user.is_online,
                user.last_seen as i64,
                user.connection_id.map(|id| id as i64),
                user.ip_address,
                now as i64,
            ],
        )?;
        Ok(())
    }

    /// Mark a user offline and clear its connection binding. Idempotent;
    /// marking an unknown or already-offline user is not an error. The row
    /// is only touched while it still points at `connection_id`, so a
    /// reconnect that already rebound the user is left alone.
    pub fn set_offline(&self, user_id: &str, connection_id: u64, last_seen: u64) -> Result<()> {
        self.db.conn().execute(
            "UPDATE users SET is_online = 0, connection_id = NULL, last_seen = ?3, updated_at = ?4
             WHERE id = ?1 AND connection_id = ?2",
            params![user_id, connection_id as i64, last_seen as i64, now_ms() as i64],
        )?;
        Ok(())
    }

    /// Mark every user offline. Run at startup so rows left online by an
    /// unclean shutdown do not linger.
    pub fn mark_all_offline(&self) -> Result<usize> {
        let affected = self.db.conn().execute(
            "UPDATE users SET is_online = 0, connection_id = NULL, updated_at = ?1
             WHERE is_online = 1",
            params![now_ms() as i64],
        )?;
        Ok(affected)
    }

    pub fn get(&self, user_id: &str) -> Result<User> {
        self.db
            .conn()
            .query_row(
                "SELECT id, username, public_key, is_host, is_online, last_seen,
                        connection_id, ip_address
                 FROM users WHERE id = ?1",
                params![user_id],
                row_to_user,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn count(&self) -> Result<u64> {
        let n = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(n)
    }

    pub fn online_count(&self) -> Result<u64> {
        let n = self.db.conn().query_row(
            "SELECT COUNT(*) FROM users WHERE is_online = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let last_seen: i64 = row.get(5)?;
    let connection_id: Option<i64> = row.get(6)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        public_key: row.get(2)?,
        is_host: row.get(3)?,
        is_online: row.get(4)?,
        last_seen: last_seen as u64,
        connection_id: connection_id.map(|id| id as u64),
        ip_address: row.get(7)?,
    })
}
