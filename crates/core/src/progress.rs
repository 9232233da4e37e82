use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Location;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub String);

impl BookId {
    /// Content-derived id so the same file maps to the same progress row
    /// regardless of where it lives on disk.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub book_id: BookId,
    pub location: Location,
    pub scroll_offset: Option<f64>,
    pub updated_at: i64,
}

/// Persistence for the last reading position of each book.
///
/// One record per book; `save` overwrites. A failed `save` leaves the
/// previous record intact.
pub trait ProgressStore: Send + Sync {
    fn save(
        &self,
        book_id: &BookId,
        location: &Location,
        scroll_offset: Option<f64>,
    ) -> anyhow::Result<()>;

    fn load(&self, book_id: &BookId) -> anyhow::Result<Option<ReadingProgress>>;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    records: Mutex<HashMap<BookId, ReadingProgress>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressStore for MemoryProgressStore {
    fn save(
        &self,
        book_id: &BookId,
        location: &Location,
        scroll_offset: Option<f64>,
    ) -> anyhow::Result<()> {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?;
        records.insert(
            book_id.clone(),
            ReadingProgress {
                book_id: book_id.clone(),
                location: location.clone(),
                scroll_offset,
                updated_at,
            },
        );
        Ok(())
    }

    fn load(&self, book_id: &BookId) -> anyhow::Result<Option<ReadingProgress>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("progress store lock poisoned"))?;
        Ok(records.get(book_id).cloned())
    }
}
