//! # Datapack Warehouse
//!
//! DuckDB-backed persistence for the collection core.
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `source_block` | Per-domain throttle and block/cooldown state |
//! | `blocked_source` | Registry of domains the adapter chain skips |
//! | `collection_run` | One row per collection run |
//! | `collection_error` | Append-only errors and warnings for a run |
//!
//! All statements are parameterized. Multi-statement mutations run inside a
//! transaction so a block recorded by one run is visible to the next reader
//! as a whole row, never half-applied.
//!
//! DuckDB lets one process at a time open a database file for writing. Runs
//! inside one process share a single [`Warehouse`] (it is `Clone`); a second
//! process waits for the file lock with a bounded retry and then fails with
//! [`WarehouseError::Locked`].
//!
//! ```rust,no_run
//! use datapack_warehouse::{Warehouse, WarehouseConfig};
//!
//! let warehouse = Warehouse::open(WarehouseConfig::default())?;
//! let blocks = warehouse.list_source_blocks()?;
//! println!("{} domains with block state", blocks.len());
//! # Ok::<(), datapack_warehouse::WarehouseError>(())
//! ```

mod blocks;
pub mod duckdb;
pub mod migrations;
mod runs;

use std::env;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use ::duckdb::Connection;
use thiserror::Error;

pub use blocks::{BlockedSourceRow, SourceBlockRow};
pub use duckdb::{DuckDbConnectionManager, PooledConnection};
pub use runs::{CollectionErrorRow, CollectionRunRow};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A write referenced a row that does not exist.
    #[error("{table} row '{key}' not found")]
    NotFound { table: &'static str, key: String },

    /// Another process kept the database file locked for every attempt.
    #[error("database {path} is locked by another process after {attempts} attempts: {message}")]
    Locked {
        path: PathBuf,
        attempts: u32,
        message: String,
    },
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
    /// Opens attempted while another process holds the file lock.
    pub lock_retry_attempts: u32,
    /// Delay before the second open; doubled after every further conflict.
    pub lock_retry_delay: Duration,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            db_path: resolve_datapack_home().join("state").join("collector.duckdb"),
            max_pool_size: 4,
            lock_retry_attempts: 5,
            lock_retry_delay: Duration::from_millis(200),
        }
    }
}

/// Handle to the collector's persistent state.
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    /// Open the warehouse at `config.db_path`, creating parent directories
    /// and applying migrations.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = retry_while_locked(config.lock_retry_attempts, config.lock_retry_delay, || {
            DuckDbConnectionManager::open(config.db_path.as_path(), config.max_pool_size)
        })
        .map_err(|(error, attempts)| {
            if is_lock_conflict(&error) {
                WarehouseError::Locked {
                    path: config.db_path.clone(),
                    attempts,
                    message: error.to_string(),
                }
            } else {
                WarehouseError::DuckDb(error)
            }
        })?;
        let warehouse = Self { manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Open a throwaway in-memory warehouse.
    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        let warehouse = Self {
            manager: DuckDbConnectionManager::open_in_memory()?,
        };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    fn connection(&self) -> Result<PooledConnection, WarehouseError> {
        Ok(self.manager.acquire()?)
    }
}

/// Run `body` inside a transaction, committing on success and rolling back
/// on error.
fn in_transaction<T>(
    connection: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    connection.execute_batch("BEGIN TRANSACTION")?;
    match body(connection) {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

/// DuckDB reports a file held by another process as a lock failure.
fn is_lock_conflict(error: &impl Display) -> bool {
    let message = error.to_string();
    message.contains("Could not set lock on file") || message.contains("Conflicting lock")
}

/// Call `open` until it succeeds, fails for a reason other than a lock
/// conflict, or `attempts` is used up. The error comes back with the number
/// of attempts made.
fn retry_while_locked<T, E: Display>(
    attempts: u32,
    delay: Duration,
    mut open: impl FnMut() -> Result<T, E>,
) -> Result<T, (E, u32)> {
    let attempts = attempts.max(1);
    let mut delay = delay;
    let mut attempt = 1;
    loop {
        match open() {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && is_lock_conflict(&error) => {
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(error) => return Err((error, attempt)),
        }
    }
}

/// Resolve the datapack home directory from environment or default.
pub fn resolve_datapack_home() -> PathBuf {
    if let Some(path) = env::var_os("DATAPACK_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".datapack");
    }

    PathBuf::from(".datapack")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initializes_collector_tables() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: temp.path().join("state").join("collector.duckdb"),
            max_pool_size: 2,
            ..WarehouseConfig::default()
        })
        .expect("warehouse open");

        let connection = warehouse.connection().expect("connection");
        let tables: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM information_schema.tables WHERE table_name IN \
                 ('source_block', 'blocked_source', 'collection_run', 'collection_error')",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(tables, 4);
    }

    #[test]
    fn reopening_keeps_existing_state() {
        let temp = tempdir().expect("tempdir");
        let config = WarehouseConfig {
            db_path: temp.path().join("collector.duckdb"),
            max_pool_size: 1,
            ..WarehouseConfig::default()
        };

        {
            let warehouse = Warehouse::open(config.clone()).expect("open");
            warehouse
                .record_source_block("finance.yahoo.com", 1_000, 2_000, Some(403), None)
                .expect("record");
        }

        let warehouse = Warehouse::open(config).expect("reopen");
        let row = warehouse
            .source_block("finance.yahoo.com")
            .expect("query")
            .expect("row survives restart");
        assert_eq!(row.blocked_until, Some(2_000));
    }

    #[test]
    fn a_released_file_opens_again_at_once() {
        let temp = tempdir().expect("tempdir");
        let config = WarehouseConfig {
            db_path: temp.path().join("collector.duckdb"),
            lock_retry_attempts: 1,
            ..WarehouseConfig::default()
        };

        let first = Warehouse::open(config.clone()).expect("first open");
        let shared = first.clone();
        drop(first);
        assert!(shared.list_source_blocks().expect("shared handle").is_empty());
        drop(shared);

        let second = Warehouse::open(config).expect("second open");
        assert!(second.list_source_blocks().expect("query").is_empty());
    }

    #[test]
    fn lock_conflicts_are_retried_until_the_file_is_free() {
        let mut calls = 0;
        let opened = retry_while_locked(3, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 {
                Err("IO Error: Could not set lock on file \"collector.duckdb\"".to_owned())
            } else {
                Ok("open")
            }
        });
        assert_eq!(opened, Ok("open"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn a_lock_held_for_every_attempt_gives_up() {
        let mut calls = 0;
        let outcome: Result<(), _> = retry_while_locked(2, Duration::from_millis(1), || {
            calls += 1;
            Err("IO Error: Conflicting lock is held in /usr/bin/datapack (PID 42)".to_owned())
        });
        let (error, attempts) = outcome.expect_err("still locked");
        assert!(is_lock_conflict(&error));
        assert_eq!(attempts, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn other_open_errors_are_not_retried() {
        let mut calls = 0;
        let outcome: Result<(), _> = retry_while_locked(5, Duration::from_millis(1), || {
            calls += 1;
            Err("IO Error: Permission denied".to_owned())
        });
        assert_eq!(outcome, Err(("IO Error: Permission denied".to_owned(), 1)));
        assert_eq!(calls, 1);
    }
}
