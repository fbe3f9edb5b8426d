//! SQLite-backed cache storage.
//!
//! One row per hostname holding its records as JSON, plus an insertion
//! sequence for LRU ordering. The `meta` table records the crate version
//! that wrote the file; a file written by another version is wiped on open.

use super::{CacheStore, CachedRecord};
use crate::base::neterror::NetError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const FORMAT_VERSION: &str = env!("CARGO_PKG_VERSION");

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS lookups (
        hostname TEXT PRIMARY KEY,
        records  TEXT NOT NULL,
        seq      INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS lookups_seq ON lookups (seq);
";

/// Cache storage persisted in a SQLite database.
pub struct SqliteStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteStore {
    /// Opens (or creates) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self, NetError> {
        Self::init(Connection::open(path)?)
    }

    /// A private, non-durable database.
    pub fn open_in_memory() -> Result<Self, NetError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, NetError> {
        conn.execute_batch(SCHEMA)?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .optional()?;

        if version.as_deref() != Some(FORMAT_VERSION) {
            if let Some(found) = &version {
                tracing::debug!(found = %found, expected = FORMAT_VERSION, "discarding cache written by another version");
            }
            conn.execute("DELETE FROM lookups", [])?;
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?1)",
                params![FORMAT_VERSION],
            )?;
        }

        Ok(Self { conn })
    }

    /// Version string recorded in the database.
    pub fn version(&self) -> Result<String, NetError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })?)
    }
}

impl CacheStore for SqliteStore {
    fn get(&mut self, hostname: &str) -> Result<Option<Vec<CachedRecord>>, NetError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT records FROM lookups WHERE hostname = ?1",
                params![hostname],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn insert(&mut self, hostname: &str, records: Vec<CachedRecord>) -> Result<(), NetError> {
        let json = serde_json::to_string(&records)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO lookups (hostname, records, seq)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM lookups))",
            params![hostname, json],
        )?;
        Ok(())
    }

    fn update(&mut self, hostname: &str, records: Vec<CachedRecord>) -> Result<(), NetError> {
        let json = serde_json::to_string(&records)?;
        self.conn.execute(
            "UPDATE lookups SET records = ?2 WHERE hostname = ?1",
            params![hostname, json],
        )?;
        Ok(())
    }

    fn remove(&mut self, hostname: &str) -> Result<bool, NetError> {
        let changed = self
            .conn
            .execute("DELETE FROM lookups WHERE hostname = ?1", params![hostname])?;
        Ok(changed > 0)
    }

    fn oldest(&mut self) -> Result<Option<String>, NetError> {
        Ok(self
            .conn
            .query_row(
                "SELECT hostname FROM lookups ORDER BY seq ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn hostnames(&mut self) -> Result<Vec<String>, NetError> {
        let mut stmt = self
            .conn
            .prepare("SELECT hostname FROM lookups ORDER BY seq ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    fn len(&mut self) -> Result<usize, NetError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM lookups", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn clear(&mut self) -> Result<(), NetError> {
        self.conn.execute("DELETE FROM lookups", [])?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), NetError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), NetError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), NetError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::{CachedData, ResolverCache};
    use crate::dns::entry::Family;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;
    use time::OffsetDateTime;

    fn record(name: &str) -> CachedRecord {
        CachedRecord {
            name: name.to_string(),
            data: CachedData::Address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            expires_at: OffsetDateTime::from_unix_timestamp(4_000_000_000).unwrap(),
        }
    }

    #[test]
    fn test_insert_get_order() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.insert("a", vec![record("a")]).unwrap();
        store.insert("b", vec![record("b")]).unwrap();
        store.insert("a", vec![record("a"), record("a")]).unwrap();

        assert_eq!(store.get("a").unwrap().unwrap().len(), 2);
        assert_eq!(store.hostnames().unwrap(), vec!["b", "a"]);
        assert_eq!(store.oldest().unwrap().as_deref(), Some("b"));
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_update_and_remove() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.insert("a", vec![record("a")]).unwrap();
        store.insert("b", vec![record("b")]).unwrap();
        store.update("a", vec![]).unwrap();

        assert_eq!(store.oldest().unwrap().as_deref(), Some("a"));
        assert_eq!(store.get("a").unwrap(), Some(vec![]));
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dns.sqlite");

        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.insert("example.com", vec![record("example.com")]).unwrap();
        }

        let mut store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.version().unwrap(), FORMAT_VERSION);
        assert_eq!(
            store.get("example.com").unwrap(),
            Some(vec![record("example.com")])
        );
    }

    #[test]
    fn test_version_mismatch_discards_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dns.sqlite");

        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.insert("example.com", vec![record("example.com")]).unwrap();
            store
                .conn
                .execute("UPDATE meta SET value = '0.0.0-old' WHERE key = 'version'", [])
                .unwrap();
        }

        let mut store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.len().unwrap(), 0);
        assert_eq!(store.version().unwrap(), FORMAT_VERSION);
    }

    #[test]
    fn test_failed_alias_insert_leaves_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TRIGGER reject_cdn BEFORE INSERT ON lookups
                 WHEN NEW.hostname = 'cdn.example.net'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        let cache = ResolverCache::with_store(store);
        let expires = OffsetDateTime::now_utc() + time::Duration::minutes(5);

        cache.insert_records(
            "www.example.com",
            Family::V4,
            vec![
                CachedRecord::alias("www.example.com", "cdn.example.net", expires),
                CachedRecord::address("cdn.example.net", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), expires),
            ],
        );

        assert!(cache.is_empty());
        assert!(cache.get("www.example.com").is_none());
    }

    #[test]
    fn test_alias_insert_commits_every_name() {
        let cache = ResolverCache::with_store(SqliteStore::open_in_memory().unwrap());
        let expires = OffsetDateTime::now_utc() + time::Duration::minutes(5);

        cache.insert_records(
            "www.example.com",
            Family::V4,
            vec![
                CachedRecord::alias("www.example.com", "cdn.example.net", expires),
                CachedRecord::address("cdn.example.net", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), expires),
            ],
        );

        assert_eq!(cache.hostnames(), vec!["www.example.com", "cdn.example.net"]);
        assert_eq!(cache.get("www.example.com").unwrap().len(), 1);
    }
}
