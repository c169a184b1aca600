//! Transactional key-value store and trails
//!
//! Every logical table is a `(key BLOB PRIMARY KEY, value BLOB)` table in one
//! SQLite database, so keys compare bytewise. All reads and writes happen
//! inside a [`Trail`], which wraps one `BEGIN IMMEDIATE` transaction.
//! [`Store::retry_txn`] re-runs the trail body from scratch whenever the
//! engine reports a busy or locked database.

use crate::config::FsConfig;
use crate::error::{FsError, Result};
use crate::key;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Logical tables of a filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Nodes,
    Revisions,
    Transactions,
    Clones,
    Representations,
    Strings,
    Changes,
    Copies,
    Locks,
    Misc,
}

impl Table {
    pub const ALL: [Table; 10] = [
        Table::Nodes,
        Table::Revisions,
        Table::Transactions,
        Table::Clones,
        Table::Representations,
        Table::Strings,
        Table::Changes,
        Table::Copies,
        Table::Locks,
        Table::Misc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Revisions => "revisions",
            Table::Transactions => "transactions",
            Table::Clones => "clones",
            Table::Representations => "representations",
            Table::Strings => "strings",
            Table::Changes => "changes",
            Table::Copies => "copies",
            Table::Locks => "locks",
            Table::Misc => "misc",
        }
    }
}

/// One key/value pair read from a table
pub type Record = (Vec<u8>, Vec<u8>);

fn record_of(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok((row.get(0)?, row.get(1)?))
}

fn configure(conn: &Connection, config: &FsConfig) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    for table in Table::ALL {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;",
            table.name()
        ))?;
    }
    Ok(())
}

/// Handle on the database holding all tables of one filesystem
pub struct Store {
    conn: Mutex<Connection>,
    max_retries: u32,
}

impl Store {
    /// Open the database at `path`, creating the tables when `create` is set.
    pub fn open(path: &Path, create: bool, config: &FsConfig) -> Result<Self> {
        if !create && !path.exists() {
            return Err(FsError::Database(format!(
                "no filesystem database at {}",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        configure(&conn, config)?;
        if create {
            create_tables(&conn)?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            max_retries: config.max_trail_retries,
        })
    }

    /// A private in-memory store, for tests and scratch work
    pub fn open_in_memory(config: &FsConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_retries: config.max_trail_retries,
        })
    }

    /// Run `body` inside a fresh trail, committing on success.
    ///
    /// On a retryable failure the trail is rolled back, `on_rollback` runs,
    /// and the body runs again, up to the configured bound. Any other error
    /// rolls back and is returned.
    pub fn retry_txn<T, F>(&self, body: F, on_rollback: &dyn Fn()) -> Result<T>
    where
        F: Fn(&Trail<'_>) -> Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            match self.run_once(&body) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    on_rollback();
                    if !e.is_retryable() {
                        return Err(e);
                    }
                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!("trail gave up after {} retries: {}", self.max_retries, e);
                        return Err(e);
                    }
                    debug!("retrying trail (attempt {}): {}", attempt, e);
                }
            }
        }
    }

    fn run_once<T, F>(&self, body: &F) -> Result<T>
    where
        F: Fn(&Trail<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let trail = Trail { tx };
        let value = body(&trail)?;
        trail.tx.commit()?;
        Ok(value)
    }
}

/// One atomic unit of work against the store.
///
/// Dropping a trail without committing rolls back every write made through it.
pub struct Trail<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl<'a> Trail<'a> {
    pub fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut stmt = self
            .tx
            .prepare_cached(&format!("SELECT value FROM {} WHERE key = ?1", table.name()))?;
        Ok(stmt.query_row([key], |r| r.get(0)).optional()?)
    }

    pub fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            table.name()
        ))?;
        stmt.execute(rusqlite::params![key, value])?;
        Ok(())
    }

    /// Delete `key`; returns whether it existed
    pub fn delete(&self, table: Table, key: &[u8]) -> Result<bool> {
        let mut stmt = self
            .tx
            .prepare_cached(&format!("DELETE FROM {} WHERE key = ?1", table.name()))?;
        Ok(stmt.execute([key])? > 0)
    }

    pub fn exists(&self, table: Table, key: &[u8]) -> Result<bool> {
        Ok(self.get(table, key)?.is_some())
    }

    fn query_one(&self, sql: &str, key: Option<&[u8]>) -> Result<Option<Record>> {
        let mut stmt = self.tx.prepare_cached(sql)?;
        let row = match key {
            Some(k) => stmt.query_row([k], record_of).optional()?,
            None => stmt.query_row([], record_of).optional()?,
        };
        Ok(row)
    }

    /// Open a cursor over `table`
    pub fn cursor(&self, table: Table) -> Cursor<'_, 'a> {
        Cursor {
            trail: self,
            table,
            position: None,
        }
    }

    /// Every record whose key starts with `prefix`, in key order
    pub fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<Record>> {
        let mut stmt = self.tx.prepare_cached(&format!(
            "SELECT key, value FROM {} WHERE key >= ?1 ORDER BY key",
            table.name()
        ))?;
        let mut rows = stmt.query([prefix])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let k: Vec<u8> = row.get(0)?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k, row.get(1)?));
        }
        Ok(out)
    }

    /// Delete every record whose key starts with `prefix`
    pub fn delete_prefix(&self, table: Table, prefix: &[u8]) -> Result<usize> {
        let records = self.scan_prefix(table, prefix)?;
        for (k, _) in &records {
            self.delete(table, k)?;
        }
        Ok(records.len())
    }

    /// Allocate the next key from the named base-36 counter in `misc`
    pub fn next_key(&self, counter: &str) -> Result<String> {
        let name = format!("next-key:{}", counter);
        let current = match self.get(Table::Misc, name.as_bytes())? {
            Some(v) => String::from_utf8(v)
                .map_err(|_| FsError::Database(format!("corrupt counter {}", name)))?,
            None => key::FIRST_KEY.to_string(),
        };
        let next = key::next_key(&current)
            .ok_or_else(|| FsError::Database(format!("corrupt counter {}", name)))?;
        self.put(Table::Misc, name.as_bytes(), next.as_bytes())?;
        Ok(current)
    }
}

/// A position in one table, moved by seek operations.
///
/// Each move returns the record it lands on, or `None` when it runs off the
/// end; running off the end leaves the position unchanged.
pub struct Cursor<'t, 'a> {
    trail: &'t Trail<'a>,
    table: Table,
    position: Option<Vec<u8>>,
}

impl Cursor<'_, '_> {
    fn land(&mut self, record: Option<Record>) -> Option<Record> {
        if let Some((k, _)) = &record {
            self.position = Some(k.clone());
        }
        record
    }

    pub fn first(&mut self) -> Result<Option<Record>> {
        let sql = format!("SELECT key, value FROM {} ORDER BY key LIMIT 1", self.table.name());
        let record = self.trail.query_one(&sql, None)?;
        Ok(self.land(record))
    }

    pub fn last(&mut self) -> Result<Option<Record>> {
        let sql = format!("SELECT key, value FROM {} ORDER BY key DESC LIMIT 1", self.table.name());
        let record = self.trail.query_one(&sql, None)?;
        Ok(self.land(record))
    }

    /// Position on the first key greater than or equal to `key`
    pub fn seek_range(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT key, value FROM {} WHERE key >= ?1 ORDER BY key LIMIT 1",
            self.table.name()
        );
        let record = self.trail.query_one(&sql, Some(key))?;
        Ok(self.land(record))
    }

    pub fn next(&mut self) -> Result<Option<Record>> {
        let Some(pos) = self.position.clone() else {
            return self.first();
        };
        let sql = format!(
            "SELECT key, value FROM {} WHERE key > ?1 ORDER BY key LIMIT 1",
            self.table.name()
        );
        let record = self.trail.query_one(&sql, Some(&pos))?;
        Ok(self.land(record))
    }

    /// Step back from the current position; from an unpositioned cursor, or
    /// after `seek_range` ran off the end, use [`Cursor::prev_before`].
    pub fn prev(&mut self) -> Result<Option<Record>> {
        let Some(pos) = self.position.clone() else {
            return self.last();
        };
        self.prev_before(&pos)
    }

    /// Position on the greatest key strictly less than `key`
    pub fn prev_before(&mut self, key: &[u8]) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT key, value FROM {} WHERE key < ?1 ORDER BY key DESC LIMIT 1",
            self.table.name()
        );
        let record = self.trail.query_one(&sql, Some(key))?;
        Ok(self.land(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn store() -> Store {
        Store::open_in_memory(&FsConfig::default()).unwrap()
    }

    fn noop() {}

    #[test]
    fn test_put_get_delete() {
        let s = store();
        s.retry_txn(
            |t| {
                t.put(Table::Strings, b"a", b"alpha")?;
                t.put(Table::Strings, b"a", b"again")?;
                Ok(())
            },
            &noop,
        )
        .unwrap();
        let got = s.retry_txn(|t| t.get(Table::Strings, b"a"), &noop).unwrap();
        assert_eq!(got.as_deref(), Some(&b"again"[..]));
        let existed = s.retry_txn(|t| t.delete(Table::Strings, b"a"), &noop).unwrap();
        assert!(existed);
        assert!(s.retry_txn(|t| t.get(Table::Strings, b"a"), &noop).unwrap().is_none());
    }

    #[test]
    fn test_error_rolls_back_all_writes() {
        let s = store();
        let rolled_back = Cell::new(0);
        let result: Result<()> = s.retry_txn(
            |t| {
                t.put(Table::Nodes, b"k", b"v")?;
                Err(FsError::NotFound("/x".into()))
            },
            &|| rolled_back.set(rolled_back.get() + 1),
        );
        assert!(matches!(result, Err(FsError::NotFound(_))));
        assert_eq!(rolled_back.get(), 1);
        assert!(s.retry_txn(|t| t.get(Table::Nodes, b"k"), &noop).unwrap().is_none());
    }

    #[test]
    fn test_retryable_errors_rerun_the_body() {
        let s = store();
        let runs = Cell::new(0);
        let value = s
            .retry_txn(
                |t| {
                    runs.set(runs.get() + 1);
                    t.put(Table::Misc, b"x", b"1")?;
                    if runs.get() < 3 {
                        return Err(FsError::Retryable("deadlock".into()));
                    }
                    Ok(42)
                },
                &noop,
            )
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn test_retry_bound_surfaces_error() {
        let config = FsConfig {
            max_trail_retries: 2,
            ..FsConfig::default()
        };
        let s = Store::open_in_memory(&config).unwrap();
        let runs = Cell::new(0);
        let result: Result<()> = s.retry_txn(
            |_| {
                runs.set(runs.get() + 1);
                Err(FsError::Retryable("busy".into()))
            },
            &noop,
        );
        assert!(result.unwrap_err().is_retryable());
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn test_cursor_operations() {
        let s = store();
        s.retry_txn(
            |t| {
                for k in [&b"b"[..], b"d", b"f"] {
                    t.put(Table::Nodes, k, k)?;
                }
                let mut c = t.cursor(Table::Nodes);
                assert_eq!(c.first()?.map(|r| r.0), Some(b"b".to_vec()));
                assert_eq!(c.next()?.map(|r| r.0), Some(b"d".to_vec()));
                assert_eq!(c.next()?.map(|r| r.0), Some(b"f".to_vec()));
                assert_eq!(c.next()?, None);
                assert_eq!(c.prev()?.map(|r| r.0), Some(b"d".to_vec()));
                assert_eq!(c.seek_range(b"c")?.map(|r| r.0), Some(b"d".to_vec()));
                assert_eq!(c.seek_range(b"d")?.map(|r| r.0), Some(b"d".to_vec()));
                assert_eq!(c.seek_range(b"g")?, None);
                assert_eq!(c.last()?.map(|r| r.0), Some(b"f".to_vec()));
                assert_eq!(c.prev_before(b"d")?.map(|r| r.0), Some(b"b".to_vec()));
                assert_eq!(c.prev()?, None);
                Ok(())
            },
            &noop,
        )
        .unwrap();
    }

    #[test]
    fn test_prefix_scan_and_counters() {
        let s = store();
        s.retry_txn(
            |t| {
                t.put(Table::Clones, b"1/a", b"x")?;
                t.put(Table::Clones, b"1/b", b"y")?;
                t.put(Table::Clones, b"2/a", b"z")?;
                assert_eq!(t.scan_prefix(Table::Clones, b"1/")?.len(), 2);
                assert_eq!(t.delete_prefix(Table::Clones, b"1/")?, 2);
                assert_eq!(t.scan_prefix(Table::Clones, b"")?.len(), 1);

                assert_eq!(t.next_key("strings")?, "0");
                assert_eq!(t.next_key("strings")?, "1");
                assert_eq!(t.next_key("copies")?, "0");
                Ok(())
            },
            &noop,
        )
        .unwrap();
    }

    #[test]
    fn test_on_disk_store_requires_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fs.db");
        assert!(Store::open(&path, false, &FsConfig::default()).is_err());
        let s = Store::open(&path, true, &FsConfig::default()).unwrap();
        s.retry_txn(|t| t.put(Table::Misc, b"uuid", b"u"), &noop).unwrap();
        drop(s);
        let s = Store::open(&path, false, &FsConfig::default()).unwrap();
        let v = s.retry_txn(|t| t.get(Table::Misc, b"uuid"), &noop).unwrap();
        assert_eq!(v.as_deref(), Some(&b"u"[..]));
    }
}
