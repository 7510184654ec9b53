//! Persistence of known printers
//!
//! Every successful connect is recorded so printers can be reopened after a
//! restart and so the most recently used one can serve as the default.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::channel::{DeviceIdentity, SerialConfig};
use crate::error::StoreResult;

/// Known printers table: key = identity string, value = JSON
const KNOWN_PRINTERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("known_printers");

/// A printer that has been connected at least once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownPrinter {
    pub identity: DeviceIdentity,
    pub display_name: String,
    pub config: SerialConfig,
    pub last_connected_at: DateTime<Utc>,
}

/// Storage backend for known printers
pub trait KnownPrinterStore: Send + Sync {
    fn load(&self) -> StoreResult<Vec<KnownPrinter>>;

    /// Replace the stored set with `printers`
    fn save(&self, printers: &[KnownPrinter]) -> StoreResult<()>;
}

/// redb-backed store
#[derive(Clone)]
pub struct RedbKnownPrinterStore {
    db: Arc<Database>,
}

impl RedbKnownPrinterStore {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        let db =
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StoreResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KNOWN_PRINTERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KnownPrinterStore for RedbKnownPrinterStore {
    fn load(&self) -> StoreResult<Vec<KnownPrinter>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KNOWN_PRINTERS_TABLE)?;

        let mut printers = Vec::new();
        for result in table.iter()? {
            let (_, guard) = result?;
            let printer: KnownPrinter = serde_json::from_slice(guard.value())?;
            printers.push(printer);
        }
        Ok(printers)
    }

    fn save(&self, printers: &[KnownPrinter]) -> StoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KNOWN_PRINTERS_TABLE)?;

            let mut stale = Vec::new();
            for result in table.iter()? {
                let (key, _) = result?;
                stale.push(key.value().to_string());
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }

            for printer in printers {
                let key = printer.identity.to_string();
                let value = serde_json::to_vec(printer)?;
                table.insert(key.as_str(), value.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// Volatile store for tests and one-shot runs
#[derive(Debug, Default)]
pub struct MemoryKnownPrinterStore {
    printers: Mutex<Vec<KnownPrinter>>,
}

impl MemoryKnownPrinterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KnownPrinterStore for MemoryKnownPrinterStore {
    fn load(&self) -> StoreResult<Vec<KnownPrinter>> {
        Ok(self.printers.lock().clone())
    }

    fn save(&self, printers: &[KnownPrinter]) -> StoreResult<()> {
        *self.printers.lock() = printers.to_vec();
        Ok(())
    }
}
