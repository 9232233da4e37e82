//! Sqlite-backed persistence.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context as _;
use folio_core::{
    BookId, Location, ManagerMode, ProgressStore, ReadingMode, ReadingProgress, Settings,
};
use rusqlite::{Connection, OptionalExtension as _, Row};
use tracing::debug;

#[derive(Debug)]
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open sqlite db at {}", path.as_ref().display()))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> anyhow::Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection lock poisoned"))
    }

    fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                reading_mode TEXT NOT NULL,
                manager_mode TEXT NOT NULL
            );
            INSERT OR IGNORE INTO settings (id, reading_mode, manager_mode)
            VALUES (1, 'paginated', 'default');

            CREATE TABLE IF NOT EXISTS reading_progress (
                book_id TEXT PRIMARY KEY,
                location TEXT NOT NULL,
                scroll_offset REAL,
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            "#,
        )?;

        match conn.execute(
            "ALTER TABLE settings ADD COLUMN scroll_debounce_ms INTEGER NOT NULL DEFAULT 200",
            [],
        ) {
            Ok(_) => {}
            Err(err) => {
                let msg = err.to_string();
                if !msg.contains("duplicate column name") {
                    return Err(err).context("add settings.scroll_debounce_ms column");
                }
            }
        }

        Ok(())
    }

    pub fn load_settings(&self) -> anyhow::Result<Settings> {
        let row = self
            .conn()?
            .query_row(
                "SELECT reading_mode, manager_mode, scroll_debounce_ms FROM settings WHERE id = 1",
                [],
                |row| {
                    let reading_mode: String = row.get(0)?;
                    let manager_mode: String = row.get(1)?;
                    let scroll_debounce_ms: i64 = row.get(2)?;
                    Ok((reading_mode, manager_mode, scroll_debounce_ms))
                },
            )
            .optional()?;

        let defaults = Settings::default();
        let Some((reading_mode, manager_mode, scroll_debounce_ms)) = row else {
            return Ok(defaults);
        };

        let mut settings = Settings {
            reading_mode: reading_mode
                .parse::<ReadingMode>()
                .unwrap_or(defaults.reading_mode),
            manager_mode: manager_mode
                .parse::<ManagerMode>()
                .unwrap_or(defaults.manager_mode),
            scroll_debounce_ms: u64::try_from(scroll_debounce_ms)
                .unwrap_or(defaults.scroll_debounce_ms),
        };
        settings.normalize();
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut settings = settings.clone();
        settings.normalize();

        self.conn()?.execute(
            "UPDATE settings SET reading_mode = ?, manager_mode = ?, scroll_debounce_ms = ? WHERE id = 1",
            (
                settings.reading_mode.as_str(),
                settings.manager_mode.as_str(),
                settings.scroll_debounce_ms as i64,
            ),
        )?;
        Ok(())
    }

    /// Most recently read first.
    pub fn list_progress(&self) -> anyhow::Result<Vec<ReadingProgress>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT book_id, location, scroll_offset, updated_at FROM reading_progress ORDER BY updated_at DESC, book_id",
        )?;
        let rows = stmt.query_map([], progress_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns whether a record was removed.
    pub fn delete_progress(&self, book_id: &BookId) -> anyhow::Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM reading_progress WHERE book_id = ?", [book_id.as_str()])?;
        Ok(removed > 0)
    }
}

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<ReadingProgress> {
    let book_id: String = row.get(0)?;
    let location: String = row.get(1)?;
    Ok(ReadingProgress {
        book_id: BookId(book_id),
        location: Location::new(location),
        scroll_offset: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

impl ProgressStore for Storage {
    fn save(
        &self,
        book_id: &BookId,
        location: &Location,
        scroll_offset: Option<f64>,
    ) -> anyhow::Result<()> {
        let scroll_offset = scroll_offset.filter(|offset| offset.is_finite());
        self.conn()?
            .execute(
                r#"
                INSERT INTO reading_progress (book_id, location, scroll_offset, updated_at)
                VALUES (?, ?, ?, unixepoch())
                ON CONFLICT(book_id) DO UPDATE SET
                    location = excluded.location,
                    scroll_offset = excluded.scroll_offset,
                    updated_at = excluded.updated_at
                "#,
                (book_id.as_str(), location.as_str(), scroll_offset),
            )
            .with_context(|| format!("save reading progress for {book_id}"))?;
        debug!(book_id = %book_id, location = %location, "progress saved");
        Ok(())
    }

    fn load(&self, book_id: &BookId) -> anyhow::Result<Option<ReadingProgress>> {
        let progress = self
            .conn()?
            .query_row(
                "SELECT book_id, location, scroll_offset, updated_at FROM reading_progress WHERE book_id = ?",
                [book_id.as_str()],
                progress_from_row,
            )
            .optional()
            .with_context(|| format!("load reading progress for {book_id}"))?;
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> BookId {
        BookId(value.to_string())
    }

    #[test]
    fn settings_roundtrip() -> anyhow::Result<()> {
        let storage = Storage::open_in_memory()?;
        let mut settings = storage.load_settings()?;
        assert_eq!(settings.reading_mode, ReadingMode::Paginated);
        assert_eq!(settings.scroll_debounce_ms, 200);

        settings.reading_mode = ReadingMode::Scrolled;
        settings.manager_mode = ManagerMode::Continuous;
        settings.scroll_debounce_ms = 750;
        storage.save_settings(&settings)?;

        let settings2 = storage.load_settings()?;
        assert_eq!(settings2.reading_mode, ReadingMode::Scrolled);
        assert_eq!(settings2.manager_mode, ManagerMode::Continuous);
        assert_eq!(settings2.scroll_debounce_ms, 750);
        Ok(())
    }

    #[test]
    fn settings_are_clamped() -> anyhow::Result<()> {
        let storage = Storage::open_in_memory()?;
        let mut settings = Settings::default();
        settings.scroll_debounce_ms = 10;
        storage.save_settings(&settings)?;
        assert_eq!(storage.load_settings()?.scroll_debounce_ms, 150);

        storage.conn()?.execute(
            "UPDATE settings SET reading_mode = 'sideways', scroll_debounce_ms = 60000 WHERE id = 1",
            [],
        )?;
        let settings = storage.load_settings()?;
        assert_eq!(settings.reading_mode, ReadingMode::Paginated);
        assert_eq!(settings.scroll_debounce_ms, 5_000);
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> anyhow::Result<()> {
        let storage = Storage::open_in_memory()?;
        storage.migrate()?;
        storage.migrate()?;
        assert_eq!(storage.load_settings()?.scroll_debounce_ms, 200);
        Ok(())
    }

    #[test]
    fn progress_roundtrip() -> anyhow::Result<()> {
        let storage = Storage::open_in_memory()?;
        let book = id("abc");
        assert!(storage.load(&book)?.is_none());

        storage.save(&book, &Location::new("epubcfi(/6/4[ch2]!)"), Some(12.5))?;
        let progress = storage.load(&book)?.expect("saved");
        assert_eq!(progress.book_id, book);
        assert_eq!(progress.location.as_str(), "epubcfi(/6/4[ch2]!)");
        assert_eq!(progress.scroll_offset, Some(12.5));
        assert!(progress.updated_at > 0);
        Ok(())
    }

    #[test]
    fn save_overwrites_single_record() -> anyhow::Result<()> {
        let storage = Storage::open_in_memory()?;
        let book = id("abc");
        storage.save(&book, &Location::new("3"), Some(1.0))?;
        storage.save(&book, &Location::new("4"), None)?;
        storage.save(&id("other"), &Location::new("top"), Some(f64::NAN))?;

        let progress = storage.load(&book)?.expect("saved");
        assert_eq!(progress.location.as_str(), "4");
        assert_eq!(progress.scroll_offset, None);
        assert_eq!(storage.load(&id("other"))?.and_then(|p| p.scroll_offset), None);
        assert_eq!(storage.list_progress()?.len(), 2);
        Ok(())
    }

    #[test]
    fn delete_progress_removes_record() -> anyhow::Result<()> {
        let storage = Storage::open_in_memory()?;
        let book = id("abc");
        storage.save(&book, &Location::new("0"), None)?;

        assert!(storage.delete_progress(&book)?);
        assert!(!storage.delete_progress(&book)?);
        assert!(storage.load(&book)?.is_none());
        assert!(storage.list_progress()?.is_empty());
        Ok(())
    }
}
