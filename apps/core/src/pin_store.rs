use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

pub const PINNED_APPS_KEY: &str = "pinned_apps";

pub type PinnedSet = BTreeSet<String>;

#[derive(Debug, Error)]
pub enum PinStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode pinned set: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pin storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable home of the pinned identifier set. Reads and writes are
/// all-or-nothing: the whole set is replaced on every save.
pub trait PinStore: Send + Sync {
    fn load(&self) -> Result<PinnedSet, PinStoreError>;
    fn save(&self, pins: &PinnedSet) -> Result<(), PinStoreError>;
}

pub struct SqlitePinStore {
    db: Mutex<Connection>,
    space: String,
}

impl SqlitePinStore {
    pub fn open_file(path: &Path, space: &str) -> Result<Self, PinStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, space)
    }

    pub fn open_memory(space: &str) -> Result<Self, PinStoreError> {
        Self::with_connection(Connection::open_in_memory()?, space)
    }

    fn with_connection(db: Connection, space: &str) -> Result<Self, PinStoreError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS preference (
                space TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (space, key)
            )",
            [],
        )?;
        Ok(Self {
            db: Mutex::new(db),
            space: space.to_string(),
        })
    }
}

impl PinStore for SqlitePinStore {
    fn load(&self) -> Result<PinnedSet, PinStoreError> {
        let db = self.db.lock();
        let raw: Option<String> = db
            .query_row(
                "SELECT value FROM preference WHERE space = ?1 AND key = ?2",
                params![self.space, PINNED_APPS_KEY],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<PinnedSet>(&raw)?),
            None => Ok(PinnedSet::new()),
        }
    }

    fn save(&self, pins: &PinnedSet) -> Result<(), PinStoreError> {
        let encoded = serde_json::to_string(pins)?;
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO preference (space, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(space, key) DO UPDATE SET value=excluded.value",
            params![self.space, PINNED_APPS_KEY, encoded],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Volatile store for fixtures and tests. Saves can be made to fail to
/// exercise the persistence-failure path.
#[derive(Default)]
pub struct MemoryPinStore {
    pins: Mutex<PinnedSet>,
    saves: Mutex<Vec<PinnedSet>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemoryPinStore {
    pub fn with_pins<I, S>(pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::default();
        *store.pins.lock() = pins.into_iter().map(Into::into).collect();
        store
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn current(&self) -> PinnedSet {
        self.pins.lock().clone()
    }

    /// Every set successfully written, oldest first.
    pub fn save_history(&self) -> Vec<PinnedSet> {
        self.saves.lock().clone()
    }
}

impl PinStore for MemoryPinStore {
    fn load(&self) -> Result<PinnedSet, PinStoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(PinStoreError::Unavailable("memory store load disabled".into()));
        }
        Ok(self.pins.lock().clone())
    }

    fn save(&self, pins: &PinnedSet) -> Result<(), PinStoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PinStoreError::Unavailable("memory store save disabled".into()));
        }
        *self.pins.lock() = pins.clone();
        self.saves.lock().push(pins.clone());
        Ok(())
    }
}
