//! SQLite database module for custody chains and supply-chain entities
//!
//! ## Tables
//!
//! - `custody_chains` - Traceable product quantities with lineage pointers
//! - `custody_events` - Append-only EPCIS-style events per chain
//! - `mass_balance_events` / `mass_balance_links` - Split, merge and
//!   transformation records with their parent, child and source chains
//! - `lineage_reports` - Persisted trace snapshots
//! - `suppliers`, `facilities`, `plots`, `deliveries`, `production_lots`,
//!   `shipments`, `lot_deliveries`, `shipment_lots` - Entities joined by the
//!   lineage engine
//!
//! Every multi-write operation goes through [`SupplyChainDb::with_transaction`]
//! so a failed step leaves no partial state behind.

pub mod schema;
pub mod models;
pub mod custody_chains;
pub mod custody_events;
pub mod mass_balance;
pub mod lineage_reports;
pub mod entities;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::LineageError;

/// How long a write waits on another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database for custody and lineage data
pub struct SupplyChainDb {
    conn: Mutex<Connection>,
}

impl SupplyChainDb {
    /// Open or create the database file
    pub fn open(db_path: &Path) -> Result<Self, LineageError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // WAL for concurrent readers; writers are serialized by the mutex
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LineageError::Internal(format!("Failed to set PRAGMA: {}", e)))?;
        // Wait for another process's write lock instead of failing at once
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, LineageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), LineageError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read with shared access to the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LineageError>
    where
        F: FnOnce(&Connection) -> Result<T, LineageError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LineageError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, LineageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, LineageError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| LineageError::Internal(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// [`with_conn`](Self::with_conn) on the blocking thread pool
    pub async fn read<F, T>(self: &Arc<Self>, f: F) -> Result<T, LineageError>
    where
        F: FnOnce(&Connection) -> Result<T, LineageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| LineageError::Internal(format!("Blocking task failed: {}", e)))?
    }

    /// [`with_transaction`](Self::with_transaction) on the blocking thread pool
    pub async fn write<F, T>(self: &Arc<Self>, f: F) -> Result<T, LineageError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, LineageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || db.with_transaction(f))
            .await
            .map_err(|e| LineageError::Internal(format!("Blocking task failed: {}", e)))?
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, LineageError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, LineageError> {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
                Ok(n as u64)
            };

            let active_chains: i64 = conn.query_row(
                "SELECT COUNT(*) FROM custody_chains WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?;

            Ok(DbStats {
                chain_count: count("custody_chains")?,
                active_chain_count: active_chains as u64,
                custody_event_count: count("custody_events")?,
                mass_balance_event_count: count("mass_balance_events")?,
                report_count: count("lineage_reports")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub chain_count: u64,
    pub active_chain_count: u64,
    pub custody_event_count: u64,
    pub mass_balance_event_count: u64,
    pub report_count: u64,
}

// Re-exports
pub use models::{
    BusinessStep, ChainStatus, CustodyChain, CustodyEvent, CustodyEventType, LineageReport,
    MassBalanceEvent, MassBalanceEventType,
};
