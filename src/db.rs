//! Catalog store: the persisted `path -> entry` mapping.
//!
//! [`CatalogStore`] is the only contract the reconciler relies on. [`Db`] is
//! the SQLite implementation that lives next to the media (one file per
//! library root); [`MemoryStore`] backs tests and dry runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::debug;

use crate::catalog::{Bookmark, Catalog, CatalogDiff, MediaEntry};
use crate::error::CatalogError;
use crate::media::MediaType;

pub trait CatalogStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<MediaEntry>, CatalogError>;

    fn get(&self, path: &Path) -> Result<Option<MediaEntry>, CatalogError>;

    /// Insert or fully replace the entry at `entry.path`.
    fn upsert(&self, entry: &MediaEntry) -> Result<(), CatalogError>;

    /// Returns whether an entry was removed.
    fn remove(&self, path: &Path) -> Result<bool, CatalogError>;

    /// Move an entry to a new path, keeping everything else.
    fn rename(&self, from: &Path, to: &Path) -> Result<bool, CatalogError> {
        match self.get(from)? {
            Some(mut entry) => {
                self.remove(from)?;
                entry.path = to.to_path_buf();
                self.upsert(&entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply a whole pass. Implementations backed by real storage must make
    /// this all-or-nothing.
    fn commit(&self, diff: &CatalogDiff) -> Result<(), CatalogError> {
        for r in &diff.renamed {
            self.rename(&r.from, &r.to)?;
        }
        for path in &diff.removed {
            self.remove(path)?;
        }
        for entry in &diff.inserted {
            self.upsert(entry)?;
        }
        Ok(())
    }
}

// ── SQLite ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Db(Arc<Mutex<Connection>>);

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        debug!(path = %path.display(), "db: opening");
        let conn = Connection::open(path).map_err(|source| CatalogError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Db(Arc::new(Mutex::new(conn)));
        db.ensure_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-query leaves nothing half-written: every write below is
        // a single statement or a transaction.
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_schema(&self) -> Result<(), CatalogError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS media_entries (
                id                INTEGER PRIMARY KEY,
                path              BLOB NOT NULL UNIQUE,
                title             TEXT NOT NULL,
                media_type        TEXT NOT NULL,
                duration_seconds  REAL,
                thumbnail_ref     TEXT,
                tags              TEXT NOT NULL DEFAULT '[]',
                created_at        TEXT DEFAULT (datetime('now')),
                updated_at        TEXT DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS bookmarks (
                id                INTEGER PRIMARY KEY,
                entry_id          INTEGER NOT NULL REFERENCES media_entries(id) ON DELETE CASCADE,
                position          INTEGER NOT NULL,
                description       TEXT NOT NULL,
                timestamp_seconds REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bookmarks_entry ON bookmarks(entry_id);
            UPDATE media_entries SET path = CAST(path AS BLOB) WHERE typeof(path) = 'text';",
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, CatalogError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM media_entries", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

/// Paths are keyed by their raw OS bytes so names that are not valid UTF-8
/// survive a round trip unchanged.
#[cfg(unix)]
fn path_key(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(unix)]
fn path_from_key(key: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(key))
}

#[cfg(windows)]
fn path_key(path: &Path) -> Vec<u8> {
    use std::os::windows::ffi::OsStrExt;
    path.as_os_str()
        .encode_wide()
        .flat_map(u16::to_le_bytes)
        .collect()
}

#[cfg(windows)]
fn path_from_key(key: Vec<u8>) -> PathBuf {
    use std::os::windows::ffi::OsStringExt;
    let wide: Vec<u16> = key
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    PathBuf::from(std::ffi::OsString::from_wide(&wide))
}

#[cfg(not(any(unix, windows)))]
fn path_key(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(not(any(unix, windows)))]
fn path_from_key(key: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&key).into_owned())
}

struct EntryRow {
    id: i64,
    path: Vec<u8>,
    title: String,
    media_type: String,
    duration_seconds: Option<f64>,
    thumbnail_ref: Option<String>,
    tags: String,
}

const ENTRY_COLUMNS: &str =
    "id, path, title, media_type, duration_seconds, thumbnail_ref, tags";

fn row_to_entry_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: r.get(0)?,
        // Catalogs written before paths were stored as bytes hold TEXT here.
        path: match r.get_ref(1)? {
            ValueRef::Blob(b) | ValueRef::Text(b) => b.to_vec(),
            other => {
                return Err(rusqlite::Error::InvalidColumnType(
                    1,
                    "path".into(),
                    other.data_type(),
                ))
            }
        },
        title: r.get(2)?,
        media_type: r.get(3)?,
        duration_seconds: r.get(4)?,
        thumbnail_ref: r.get(5)?,
        tags: r.get(6)?,
    })
}

fn load_bookmarks(conn: &Connection, entry_id: i64) -> Result<Vec<Bookmark>, CatalogError> {
    let mut stmt = conn.prepare_cached(
        "SELECT description, timestamp_seconds FROM bookmarks
         WHERE entry_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map([entry_id], |r| {
        Ok(Bookmark {
            description: r.get(0)?,
            timestamp_seconds: r.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn hydrate(conn: &Connection, row: EntryRow) -> Result<MediaEntry, CatalogError> {
    let media_type =
        MediaType::parse(&row.media_type).ok_or_else(|| CatalogError::MediaType(row.media_type))?;
    let path = path_from_key(row.path);
    let tags: BTreeSet<String> =
        serde_json::from_str(&row.tags).map_err(|source| CatalogError::Tags {
            path: path.display().to_string(),
            source,
        })?;
    Ok(MediaEntry {
        bookmarks: load_bookmarks(conn, row.id)?,
        path,
        title: row.title,
        media_type,
        duration_seconds: row.duration_seconds,
        thumbnail_ref: row.thumbnail_ref,
        tags,
    })
}

fn upsert_in(tx: &Transaction<'_>, entry: &MediaEntry) -> Result<(), CatalogError> {
    let tags = serde_json::to_string(&entry.tags).map_err(|source| CatalogError::Tags {
        path: entry.path.display().to_string(),
        source,
    })?;
    let id: i64 = tx.query_row(
        "INSERT INTO media_entries (path, title, media_type, duration_seconds, thumbnail_ref, tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(path) DO UPDATE SET
             title = excluded.title,
             media_type = excluded.media_type,
             duration_seconds = excluded.duration_seconds,
             thumbnail_ref = excluded.thumbnail_ref,
             tags = excluded.tags,
             updated_at = datetime('now')
         RETURNING id",
        params![
            path_key(&entry.path),
            entry.title,
            entry.media_type.name(),
            entry.duration_seconds,
            entry.thumbnail_ref,
            tags
        ],
        |r| r.get(0),
    )?;
    tx.execute("DELETE FROM bookmarks WHERE entry_id = ?1", [id])?;
    for (pos, b) in entry.bookmarks.iter().enumerate() {
        tx.execute(
            "INSERT INTO bookmarks (entry_id, position, description, timestamp_seconds)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, pos as i64, b.description, b.timestamp_seconds],
        )?;
    }
    Ok(())
}

fn remove_in(tx: &Transaction<'_>, path: &Path) -> Result<bool, CatalogError> {
    let n = tx.execute(
        "DELETE FROM media_entries WHERE path = ?1",
        [path_key(path)],
    )?;
    Ok(n > 0)
}

fn rename_in(tx: &Transaction<'_>, from: &Path, to: &Path) -> Result<bool, CatalogError> {
    // Bookmarks hang off the row id, so they follow the path change.
    let n = tx.execute(
        "UPDATE media_entries SET path = ?1, updated_at = datetime('now') WHERE path = ?2",
        params![path_key(to), path_key(from)],
    )?;
    Ok(n > 0)
}

impl CatalogStore for Db {
    fn load_all(&self) -> Result<Vec<MediaEntry>, CatalogError> {
        let conn = self.conn();
        let rows = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM media_entries ORDER BY path"
            ))?;
            let rows = stmt.query_map([], row_to_entry_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter().map(|row| hydrate(&conn, row)).collect()
    }

    fn get(&self, path: &Path) -> Result<Option<MediaEntry>, CatalogError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM media_entries WHERE path = ?1"),
                [path_key(path)],
                row_to_entry_row,
            )
            .optional()?;
        row.map(|row| hydrate(&conn, row)).transpose()
    }

    fn upsert(&self, entry: &MediaEntry) -> Result<(), CatalogError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        upsert_in(&tx, entry)?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<bool, CatalogError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = remove_in(&tx, path)?;
        tx.commit()?;
        Ok(removed)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<bool, CatalogError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let renamed = rename_in(&tx, from, to)?;
        tx.commit()?;
        Ok(renamed)
    }

    /// One transaction for the whole diff: on any error nothing is applied.
    fn commit(&self, diff: &CatalogDiff) -> Result<(), CatalogError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for r in &diff.renamed {
            rename_in(&tx, &r.from, &r.to)?;
        }
        for path in &diff.removed {
            remove_in(&tx, path)?;
        }
        for entry in &diff.inserted {
            upsert_in(&tx, entry)?;
        }
        tx.commit()?;
        debug!(
            renamed = diff.renamed.len(),
            removed = diff.removed.len(),
            inserted = diff.inserted.len(),
            "db: committed pass"
        );
        Ok(())
    }
}

// ── In-memory ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore(Mutex<Catalog>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = MediaEntry>) -> Self {
        Self(Mutex::new(Catalog::from_entries(entries)))
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CatalogStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<MediaEntry>, CatalogError> {
        Ok(self.catalog().iter().cloned().collect())
    }

    fn get(&self, path: &Path) -> Result<Option<MediaEntry>, CatalogError> {
        Ok(self.catalog().get(path).cloned())
    }

    fn upsert(&self, entry: &MediaEntry) -> Result<(), CatalogError> {
        self.catalog().insert(entry.clone());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<bool, CatalogError> {
        Ok(self.catalog().remove(path).is_some())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<bool, CatalogError> {
        Ok(self.catalog().rename(from, to))
    }

    fn commit(&self, diff: &CatalogDiff) -> Result<(), CatalogError> {
        // Apply to a copy and swap, so a failure leaves the store as it was.
        let mut guard = self.catalog();
        let mut next = guard.clone();
        for r in &diff.renamed {
            next.rename(&r.from, &r.to);
        }
        for path in &diff.removed {
            next.remove(path);
        }
        for entry in &diff.inserted {
            next.insert(entry.clone());
        }
        *guard = next;
        Ok(())
    }
}
