use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::filter::Filter;
use crate::record::{IndexValue, Record};

type Result<T> = std::result::Result<T, StoreError>;

/// A durable, filterable collection of `T`.
///
/// The JSONL log at `<dir>/<collection>.jsonl` is the source of truth: every
/// create/update appends a new line (never rewritten in place), so the
/// history of a record is recoverable by replay and the file stays
/// git-diff-friendly. A SQLite table mirrors the latest version of each
/// record plus its indexed fields so [`Store::list`] doesn't have to replay
/// the log on every call; it is rebuilt from the log on [`Store::open`] and
/// can be rebuilt on demand with [`Store::rebuild_indexes`].
///
/// All mutating methods take `&mut self` to express the single-writer
/// contract at the type level; callers that need concurrent access should
/// own one `Store` per collection inside a single actor task (see the
/// `apex` crate's store actor).
pub struct Store<T: Record> {
    dir: PathBuf,
    conn: Connection,
    log_lock: Mutex<File>,
    _marker: PhantomData<T>,
}

impl<T: Record> Store<T> {
    /// Open (creating if absent) the collection rooted at `dir`.
    ///
    /// `dir` is shared across every record type written by the process; each
    /// collection gets its own JSONL file and its own partition of the
    /// shared SQLite index.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let db_path = dir.join("index.sqlite3");
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                full_json TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE TABLE IF NOT EXISTS indexes (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                field TEXT NOT NULL,
                value_text TEXT,
                value_int INTEGER,
                value_bool INTEGER,
                PRIMARY KEY (collection, id, field)
            );",
        )?;

        let lock_path = dir.join(format!("{}.lock", T::collection_name()));
        let lock_file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|e| {
            StoreError::Lock(format!(
                "collection {} is already open by another process: {e}",
                T::collection_name()
            ))
        })?;

        let mut store = Self {
            dir,
            conn,
            log_lock: Mutex::new(lock_file),
            _marker: PhantomData,
        };
        store.rebuild_indexes()?;
        Ok(store)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", T::collection_name()))
    }

    /// Replay the JSONL log, keeping the highest-`updated_at` version of
    /// each id, and repopulate the SQLite index from scratch.
    ///
    /// Returns the number of distinct records indexed.
    pub fn rebuild_indexes(&mut self) -> Result<usize> {
        let path = self.log_path();
        let mut latest: HashMap<String, T> = HashMap::new();

        if path.exists() {
            let file = File::open(&path)?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<T>(&line) {
                    Ok(record) => {
                        let replace = latest
                            .get(record.id())
                            .map(|existing| record.updated_at() >= existing.updated_at())
                            .unwrap_or(true);
                        if replace {
                            latest.insert(record.id().to_string(), record);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), lineno, error = %e, "skipping corrupted record line");
                    }
                }
            }
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        tx.execute("DELETE FROM indexes WHERE collection = ?1", params![T::collection_name()])?;
        for record in latest.values() {
            insert_record_row(&tx, record)?;
        }
        tx.commit()?;

        debug!(collection = T::collection_name(), count = latest.len(), "rebuilt indexes");
        Ok(latest.len())
    }

    fn append_log(&self, record: &T) -> Result<()> {
        let _guard = self.log_lock.lock().map_err(|_| StoreError::Lock("log mutex poisoned".into()))?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    fn exists(&self, id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert a new record. Fails with [`StoreError::Duplicate`] if `id`
    /// already exists.
    pub fn create(&mut self, record: T) -> Result<()> {
        if self.exists(record.id())? {
            return Err(StoreError::Duplicate(record.id().to_string()));
        }
        self.append_log(&record)?;
        insert_record_row(&self.conn, &record)?;
        Ok(())
    }

    /// Replace an existing record wholesale. Fails with
    /// [`StoreError::NotFound`] if `id` is absent.
    pub fn update(&mut self, record: T) -> Result<()> {
        if !self.exists(record.id())? {
            return Err(StoreError::NotFound(record.id().to_string()));
        }
        self.append_log(&record)?;
        insert_record_row(&self.conn, &record)?;
        Ok(())
    }

    /// Fetch a single record by id.
    pub fn get(&self, id: &str) -> Result<Option<T>> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT full_json FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .ok();
        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Permanently remove a record from both the index and (by appending a
    /// tombstone-free deletion marker) future rebuilds see it as absent only
    /// because it is no longer present in the index; the JSONL log itself is
    /// never rewritten, so historical versions remain on disk for audit.
    pub fn remove_from_index(&mut self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM records WHERE collection = ?1 AND id = ?2", params![T::collection_name(), id])?;
        self.conn
            .execute("DELETE FROM indexes WHERE collection = ?1 AND id = ?2", params![T::collection_name(), id])?;
        Ok(())
    }

    /// List every record whose indexed fields satisfy all `filters`.
    pub fn list(&self, filters: &[Filter]) -> Result<Vec<T>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, full_json FROM records WHERE collection = ?1")?;
        let rows = stmt.query_map(params![T::collection_name()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, full_json) = row?;
            if self.matches_filters(&id, filters)? {
                out.push(serde_json::from_str(&full_json)?);
            }
        }
        Ok(out)
    }

    /// Fetch every record, unfiltered. Prefer [`Store::list`] with filters
    /// for large collections.
    pub fn all(&self) -> Result<Vec<T>> {
        self.list(&[])
    }

    fn matches_filters(&self, id: &str, filters: &[Filter]) -> Result<bool> {
        for filter in filters {
            let value = self.indexed_value(id, &filter.field)?;
            if !filter.matches(value.as_ref()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn indexed_value(&self, id: &str, field: &str) -> Result<Option<IndexValue>> {
        let row: Option<(Option<String>, Option<i64>, Option<bool>)> = self
            .conn
            .query_row(
                "SELECT value_text, value_int, value_bool FROM indexes
                 WHERE collection = ?1 AND id = ?2 AND field = ?3",
                params![T::collection_name(), id, field],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .ok();

        Ok(row.map(|(text, int, boolean)| {
            if let Some(b) = boolean {
                IndexValue::Bool(b)
            } else if let Some(i) = int {
                IndexValue::Int(i)
            } else if let Some(t) = text {
                IndexValue::Text(t)
            } else {
                IndexValue::Null
            }
        }))
    }
}

fn insert_record_row<T: Record>(conn: &Connection, record: &T) -> Result<()> {
    let full_json = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO records (collection, id, updated_at, full_json) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(collection, id) DO UPDATE SET updated_at = excluded.updated_at, full_json = excluded.full_json",
        params![T::collection_name(), record.id(), record.updated_at(), full_json],
    )?;

    conn.execute(
        "DELETE FROM indexes WHERE collection = ?1 AND id = ?2",
        params![T::collection_name(), record.id()],
    )?;
    for (field, value) in record.indexed_fields() {
        let (text, int, boolean) = match &value {
            IndexValue::Text(s) => (Some(s.as_str()), None, None),
            IndexValue::Int(i) => (None, Some(*i), None),
            IndexValue::Bool(b) => (None, None, Some(*b)),
            IndexValue::Null => (None, None, None),
        };
        conn.execute(
            "INSERT INTO indexes (collection, id, field, value_text, value_int, value_bool)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![T::collection_name(), record.id(), field, text, int, boolean],
        )?;
    }
    Ok(())
}
