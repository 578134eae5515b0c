//! Notes table on SQLite.
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::info;
use uuid::Uuid;

use super::{Document, DocumentStore, StoreError};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS notes (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes(created_at);
"#;

/// Maximum rows returned by [`NoteStore::search_titles`].
const TITLE_SEARCH_LIMIT: usize = 10;

/// SQLite-backed notes, the assistant's default corpus.
pub struct NoteStore {
    conn: Mutex<Connection>,
}

fn map_note(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn required(field: &str, value: &str) -> Result<String, StoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(format!("{field} cannot be empty")));
    }
    Ok(trimmed.to_string())
}

impl NoteStore {
    /// Open (or create) the notes database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening notes database: {}", path.display());
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&conn)?)
    }

    /// Insert a note. Title and content are trimmed and must be non-empty.
    pub fn add_note(&self, title: &str, content: &str) -> Result<Document, StoreError> {
        let note = Document {
            id: Uuid::new_v4().to_string(),
            title: required("Title", title)?,
            content: required("Content", content)?,
            created_at: Utc::now().to_rfc3339(),
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notes (id, title, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![note.id, note.title, note.content, note.created_at],
            )
        })?;

        Ok(note)
    }

    /// All notes, newest first.
    pub fn list_notes(&self) -> Result<Vec<Document>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, content, created_at FROM notes ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map([], map_note)?;
            rows.collect()
        })
    }

    /// Delete a note by id. Returns `false` when no such note exists.
    pub fn delete_note(&self, id: &str) -> Result<bool, StoreError> {
        let rows = self.with_conn(|conn| conn.execute("DELETE FROM notes WHERE id = ?1", [id]))?;
        Ok(rows > 0)
    }

    /// Notes whose title contains `query`, newest first, at most ten.
    pub fn search_titles(&self, query: &str) -> Result<Vec<Document>, StoreError> {
        let pattern = format!("%{query}%");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, content, created_at FROM notes
                 WHERE title LIKE ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![pattern, TITLE_SEARCH_LIMIT as i64], map_note)?;
            rows.collect()
        })
    }
}

impl DocumentStore for NoteStore {
    /// Insertion order, which keeps index positions stable across rebuilds.
    fn list_all_documents(&self) -> Result<Vec<Document>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, title, content, created_at FROM notes ORDER BY rowid")?;
            let rows = stmt.query_map([], map_note)?;
            rows.collect()
        })
    }
}
