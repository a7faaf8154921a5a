//! Embedded-SQL cache backend (C4), backed by `rusqlite`.
//!
//! Every operation opens a fresh connection to the same database file,
//! runs inside a transaction, and commits or rolls back — there is no
//! connection pool, matching the "embedded, no server" contract. Because
//! `rusqlite` is synchronous, each operation is dispatched through
//! `tokio::task::spawn_blocking`.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{Error, Result};

use super::{Backend, Stats, Value};

/// SQLite-backed cache. Cheap to construct — it just remembers the path.
pub struct SqlBackend {
    path: PathBuf,
}

impl SqlBackend {
    /// Open (creating schema if absent) a SQLite-backed cache at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sql`] if the schema cannot be created.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expiration REAL,
                creation REAL NOT NULL,
                last_access REAL NOT NULL,
                update_time REAL NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS stats (name TEXT PRIMARY KEY, value INTEGER NOT NULL);",
        )?;
        Ok(Self { path })
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        Connection::open(&self.path)
    }

    fn bump_stat(conn: &Connection, name: &str) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO stats (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![name],
        )?;
        Ok(())
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[async_trait]
impl Backend for SqlBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Value>> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let row: Option<(Vec<u8>, Option<f64>)> = tx
                .query_row(
                    "SELECT value, expiration FROM cache WHERE key = ?1",
                    params![key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let Some((value_bytes, expiration)) = row else {
                Self::bump_stat(&tx, "misses")?;
                tx.commit()?;
                return Ok(None);
            };

            if expiration.is_some_and(|exp| now_secs() > exp) {
                tx.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
                Self::bump_stat(&tx, "misses")?;
                tx.commit()?;
                return Ok(None);
            }

            tx.execute(
                "UPDATE cache SET access_count = access_count + 1, last_access = ?2 WHERE key = ?1",
                params![key, now_secs()],
            )?;
            Self::bump_stat(&tx, "hits")?;
            tx.commit()?;

            let value: Value = serde_json::from_slice(&value_bytes)?;
            Ok(Some(value))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let Ok(value_bytes) = serde_json::to_vec(&value) else {
                return Ok(false);
            };
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let now = now_secs();
            let expiration = ttl.map(|d| now + d.as_secs_f64());
            tx.execute(
                "INSERT INTO cache (key, value, expiration, creation, last_access, update_time, access_count)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?4, 0)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expiration = excluded.expiration,
                    update_time = excluded.update_time",
                params![key, value_bytes, expiration, now],
            )?;
            Self::bump_stat(&tx, "sets")?;
            tx.commit()?;
            Ok(true)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let changed = tx.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
            if changed > 0 {
                Self::bump_stat(&tx, "deletes")?;
            }
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let expiration: Option<Option<f64>> = tx
                .query_row(
                    "SELECT expiration FROM cache WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            match expiration {
                None => {
                    tx.commit()?;
                    Ok(false)
                }
                Some(Some(exp)) if now_secs() > exp => {
                    tx.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
                    tx.commit()?;
                    Ok(false)
                }
                Some(_) => {
                    tx.commit()?;
                    Ok(true)
                }
            }
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn clear(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM cache", [])?;
            Self::bump_stat(&tx, "clears")?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn size(&self) -> Result<usize> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM cache WHERE expiration IS NOT NULL AND expiration < ?1",
                params![now_secs()],
            )?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM cache", [], |r| r.get(0))?;
            tx.commit()?;
            Ok(count as usize)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let path = self.path.clone();
        let pattern = pattern.map(str::to_string);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM cache WHERE expiration IS NOT NULL AND expiration < ?1",
                params![now_secs()],
            )?;
            let mut stmt = tx.prepare("SELECT key FROM cache")?;
            let keys: Vec<String> = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            tx.commit()?;
            let predicate = super::pattern_predicate(pattern.as_deref());
            Ok(keys.into_iter().filter(|k| predicate(k)).collect())
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn stats(&self) -> Result<Stats> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Stats> {
            let conn = Connection::open(&path)?;
            let mut stmt = conn.prepare("SELECT name, value FROM stats")?;
            let mut stats = Stats::default();
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (name, value) = row?;
                let value = value as u64;
                match name.as_str() {
                    "hits" => stats.hits = value,
                    "misses" => stats.misses = value,
                    "sets" => stats.sets = value,
                    "deletes" => stats.deletes = value,
                    "evictions" => stats.evictions = value,
                    "clears" => stats.clears = value,
                    _ => {}
                }
            }
            Ok(stats)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn get_ttl(&self, key: &str) -> Result<Option<Option<i64>>> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Option<i64>>> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let expiration: Option<Option<f64>> = tx
                .query_row(
                    "SELECT expiration FROM cache WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(expiration) = expiration else {
                tx.commit()?;
                return Ok(None);
            };
            let Some(exp) = expiration else {
                tx.commit()?;
                return Ok(Some(None));
            };
            if now_secs() > exp {
                tx.execute("DELETE FROM cache WHERE key = ?1", params![key])?;
                tx.commit()?;
                return Ok(None);
            }
            tx.commit()?;
            let remaining = exp - now_secs();
            Ok(Some(Some(if remaining > 0.0 { remaining as i64 } else { 0 })))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn set_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
        let path = self.path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut conn = Connection::open(&path)?;
            let tx = conn.transaction()?;
            let expiration = ttl.map(|d| now_secs() + d.as_secs_f64());
            let changed = tx.execute(
                "UPDATE cache SET expiration = ?2 WHERE key = ?1",
                params![key, expiration],
            )?;
            tx.commit()?;
            Ok(changed > 0)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }
}
