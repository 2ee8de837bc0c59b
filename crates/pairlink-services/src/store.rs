//! Persistence — pairing tokens and the bandwidth ledger.
//!
//! `Store` is the contract the hub consumes; `SqliteStore` is the shipped
//! implementation. Day/month bucketing happens entirely inside SQLite in
//! UTC (`DATE('now')` and friends), so quota windows are independent of
//! the host timezone.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub created_at: String,
}

/// Durable state behind the hub. All operations must be safe under
/// concurrent use.
pub trait Store: Send + Sync {
    /// Upsert; inserting an existing token is a no-op.
    fn create_token(&self, token: &str) -> Result<(), StoreError>;
    /// Removes the token and, by cascade, its ledger rows. Absent token is a no-op.
    fn delete_token(&self, token: &str) -> Result<(), StoreError>;
    fn token_exists(&self, token: &str) -> Result<bool, StoreError>;
    fn list_tokens(&self) -> Result<Vec<TokenInfo>, StoreError>;

    /// Append a timestamped bandwidth sample.
    fn record_bytes(&self, token: &str, bytes: i64) -> Result<(), StoreError>;
    /// Sum of samples recorded on the current UTC calendar day.
    fn get_daily_usage(&self, token: &str) -> Result<i64, StoreError>;
    /// Sum of samples recorded since the first day of the current UTC month.
    fn get_monthly_usage(&self, token: &str) -> Result<i64, StoreError>;
    /// Delete samples older than `retention_days`. Returns rows removed.
    fn prune_ledger(&self, retention_days: u32) -> Result<u64, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store, used throughout the test suites.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert a ledger row with an explicit timestamp. Test hook for
    /// exercising the day/month windows and retention pruning.
    #[cfg(test)]
    fn record_bytes_at(&self, token: &str, bytes: i64, recorded_at: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bandwidth (token, bytes, recorded_at) VALUES (?1, ?2, ?3)",
            params![token, bytes, recorded_at],
        )?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tokens (
            token      TEXT PRIMARY KEY,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS bandwidth (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            token       TEXT NOT NULL REFERENCES tokens(token) ON DELETE CASCADE,
            bytes       INTEGER NOT NULL,
            recorded_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_bandwidth_token_date
            ON bandwidth (token, recorded_at);",
    )
}

impl Store for SqliteStore {
    fn create_token(&self, token: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO tokens (token) VALUES (?1)",
            params![token],
        )?;
        Ok(())
    }

    fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM tokens WHERE token = ?1", params![token])?;
        Ok(())
    }

    fn token_exists(&self, token: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM tokens WHERE token = ?1",
                params![token],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn list_tokens(&self) -> Result<Vec<TokenInfo>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT token, created_at FROM tokens ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| {
            Ok(TokenInfo {
                token: row.get(0)?,
                created_at: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn record_bytes(&self, token: &str, bytes: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bandwidth (token, bytes) VALUES (?1, ?2)",
            params![token, bytes],
        )?;
        Ok(())
    }

    fn get_daily_usage(&self, token: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM bandwidth
             WHERE token = ?1 AND DATE(recorded_at) = DATE('now')",
            params![token],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn get_monthly_usage(&self, token: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(bytes), 0) FROM bandwidth
             WHERE token = ?1 AND DATE(recorded_at) >= DATE('now', 'start of month')",
            params![token],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    fn prune_ledger(&self, retention_days: u32) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let cutoff = format!("-{retention_days} day");
        let removed = conn.execute(
            "DELETE FROM bandwidth WHERE DATE(recorded_at) < DATE('now', ?1)",
            params![cutoff],
        )?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn create_exists_delete_roundtrip() {
        let s = store();
        assert!(!s.token_exists("t1").unwrap());

        s.create_token("t1").unwrap();
        assert!(s.token_exists("t1").unwrap());

        // Duplicate insert is a no-op.
        s.create_token("t1").unwrap();
        assert_eq!(s.list_tokens().unwrap().len(), 1);

        s.delete_token("t1").unwrap();
        assert!(!s.token_exists("t1").unwrap());

        // Deleting an absent token is a no-op.
        s.delete_token("t1").unwrap();
    }

    #[test]
    fn delete_cascades_to_ledger() {
        let s = store();
        s.create_token("t1").unwrap();
        s.record_bytes("t1", 100).unwrap();
        s.record_bytes("t1", 200).unwrap();
        assert_eq!(s.get_daily_usage("t1").unwrap(), 300);

        s.delete_token("t1").unwrap();
        assert_eq!(s.get_daily_usage("t1").unwrap(), 0);
    }

    #[test]
    fn daily_usage_counts_only_today() {
        let s = store();
        s.create_token("t1").unwrap();
        s.record_bytes("t1", 50).unwrap();
        s.record_bytes_at("t1", 500, "2020-01-01 12:00:00").unwrap();

        assert_eq!(s.get_daily_usage("t1").unwrap(), 50);
    }

    #[test]
    fn monthly_usage_counts_from_month_start() {
        let s = store();
        s.create_token("t1").unwrap();
        s.record_bytes("t1", 70).unwrap();
        s.record_bytes_at("t1", 999, "2020-01-01 12:00:00").unwrap();

        assert_eq!(s.get_monthly_usage("t1").unwrap(), 70);
    }

    #[test]
    fn usage_is_scoped_per_token() {
        let s = store();
        s.create_token("a").unwrap();
        s.create_token("b").unwrap();
        s.record_bytes("a", 10).unwrap();
        s.record_bytes("b", 20).unwrap();

        assert_eq!(s.get_daily_usage("a").unwrap(), 10);
        assert_eq!(s.get_daily_usage("b").unwrap(), 20);
    }

    #[test]
    fn prune_removes_only_old_samples() {
        let s = store();
        s.create_token("t1").unwrap();
        s.record_bytes("t1", 10).unwrap();
        s.record_bytes_at("t1", 20, "2020-01-01 00:00:00").unwrap();
        s.record_bytes_at("t1", 30, "2020-06-01 00:00:00").unwrap();

        let removed = s.prune_ledger(7).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(s.get_daily_usage("t1").unwrap(), 10);

        // Nothing left to prune.
        assert_eq!(s.prune_ledger(7).unwrap(), 0);
    }

    #[test]
    fn list_tokens_returns_created_rows() {
        let s = store();
        s.create_token("a").unwrap();
        s.create_token("b").unwrap();

        let tokens = s.list_tokens().unwrap();
        assert_eq!(tokens.len(), 2);
        let names: Vec<_> = tokens.iter().map(|t| t.token.as_str()).collect();
        assert!(names.contains(&"a"));
        assert!(names.contains(&"b"));
        assert!(!tokens[0].created_at.is_empty());
    }
}
