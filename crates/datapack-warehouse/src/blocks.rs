use ::duckdb::{params, OptionalExt, Row};
use serde::Serialize;

use crate::{in_transaction, Warehouse, WarehouseError};

const SOURCE_BLOCK_COLUMNS: &str = "domain, blocked_at, blocked_until, consecutive_count, \
     last_status_code, last_error, last_attempt_at";

/// A `source_block` row. Timestamps are unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceBlockRow {
    pub domain: String,
    pub blocked_at: Option<i64>,
    pub blocked_until: Option<i64>,
    pub consecutive_count: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<i64>,
}

/// A `blocked_source` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedSourceRow {
    pub domain: String,
    pub blocked_until: i64,
}

impl Warehouse {
    pub fn source_block(&self, domain: &str) -> Result<Option<SourceBlockRow>, WarehouseError> {
        let connection = self.connection()?;
        let sql = format!("SELECT {SOURCE_BLOCK_COLUMNS} FROM source_block WHERE domain = ?");
        let row = connection
            .query_row(sql.as_str(), params![domain], read_source_block)
            .optional()?;
        Ok(row)
    }

    pub fn list_source_blocks(&self) -> Result<Vec<SourceBlockRow>, WarehouseError> {
        let connection = self.connection()?;
        let sql = format!("SELECT {SOURCE_BLOCK_COLUMNS} FROM source_block ORDER BY domain");
        let mut statement = connection.prepare(sql.as_str())?;
        let rows = statement.query_map([], read_source_block)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record a block: creates the row with `consecutive_count = 1`, or
    /// increments the counter and replaces the window of an existing row.
    pub fn record_source_block(
        &self,
        domain: &str,
        blocked_at: i64,
        blocked_until: i64,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<SourceBlockRow, WarehouseError> {
        let connection = self.connection()?;
        let status = status.map(i64::from);
        in_transaction(&connection, |tx| {
            let updated = tx.execute(
                "UPDATE source_block SET blocked_at = ?, blocked_until = ?, \
                 consecutive_count = consecutive_count + 1, last_status_code = ?, last_error = ? \
                 WHERE domain = ?",
                params![blocked_at, blocked_until, status, error, domain],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO source_block \
                     (domain, blocked_at, blocked_until, consecutive_count, last_status_code, last_error) \
                     VALUES (?, ?, ?, 1, ?, ?)",
                    params![domain, blocked_at, blocked_until, status, error],
                )?;
            }

            let sql = format!("SELECT {SOURCE_BLOCK_COLUMNS} FROM source_block WHERE domain = ?");
            Ok(tx.query_row(sql.as_str(), params![domain], read_source_block)?)
        })
    }

    /// Set or extend the block window without touching the consecutive counter.
    pub fn extend_source_block(
        &self,
        domain: &str,
        blocked_at: i64,
        blocked_until: i64,
    ) -> Result<(), WarehouseError> {
        let connection = self.connection()?;
        in_transaction(&connection, |tx| {
            let updated = tx.execute(
                "UPDATE source_block SET blocked_at = ?, \
                 blocked_until = greatest(coalesce(blocked_until, 0), CAST(? AS BIGINT)) WHERE domain = ?",
                params![blocked_at, blocked_until, domain],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO source_block (domain, blocked_at, blocked_until, consecutive_count) \
                     VALUES (?, ?, ?, 0)",
                    params![domain, blocked_at, blocked_until],
                )?;
            }
            Ok(())
        })
    }

    /// Clear the block window and reset the consecutive counter.
    pub fn clear_source_block(&self, domain: &str) -> Result<(), WarehouseError> {
        let connection = self.connection()?;
        connection.execute(
            "UPDATE source_block SET blocked_at = NULL, blocked_until = NULL, \
             consecutive_count = 0, last_status_code = NULL, last_error = NULL WHERE domain = ?",
            params![domain],
        )?;
        Ok(())
    }

    pub fn record_source_attempt(&self, domain: &str, at: i64) -> Result<(), WarehouseError> {
        let connection = self.connection()?;
        in_transaction(&connection, |tx| {
            let updated = tx.execute(
                "UPDATE source_block SET last_attempt_at = ? WHERE domain = ?",
                params![at, domain],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO source_block (domain, consecutive_count, last_attempt_at) \
                     VALUES (?, 0, ?)",
                    params![domain, at],
                )?;
            }
            Ok(())
        })
    }

    pub fn delete_source_block(&self, domain: &str) -> Result<bool, WarehouseError> {
        let connection = self.connection()?;
        let deleted = connection.execute(
            "DELETE FROM source_block WHERE domain = ?",
            params![domain],
        )?;
        Ok(deleted > 0)
    }

    /// Delete rows whose block window ended at or before `now`.
    pub fn delete_expired_source_blocks(&self, now: i64) -> Result<usize, WarehouseError> {
        let connection = self.connection()?;
        let deleted = connection.execute(
            "DELETE FROM source_block WHERE blocked_until IS NOT NULL AND blocked_until <= ?",
            params![now],
        )?;
        Ok(deleted)
    }

    pub fn blocked_source(&self, domain: &str) -> Result<Option<BlockedSourceRow>, WarehouseError> {
        let connection = self.connection()?;
        let row = connection
            .query_row(
                "SELECT domain, blocked_until FROM blocked_source WHERE domain = ?",
                params![domain],
                |row| {
                    Ok(BlockedSourceRow {
                        domain: row.get(0)?,
                        blocked_until: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_blocked_sources(&self) -> Result<Vec<BlockedSourceRow>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection
            .prepare("SELECT domain, blocked_until FROM blocked_source ORDER BY domain")?;
        let rows = statement.query_map([], |row| {
            Ok(BlockedSourceRow {
                domain: row.get(0)?,
                blocked_until: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn upsert_blocked_source(
        &self,
        domain: &str,
        blocked_until: i64,
    ) -> Result<(), WarehouseError> {
        let connection = self.connection()?;
        in_transaction(&connection, |tx| {
            let updated = tx.execute(
                "UPDATE blocked_source SET blocked_until = ? WHERE domain = ?",
                params![blocked_until, domain],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO blocked_source (domain, blocked_until) VALUES (?, ?)",
                    params![domain, blocked_until],
                )?;
            }
            Ok(())
        })
    }

    pub fn delete_blocked_source(&self, domain: &str) -> Result<bool, WarehouseError> {
        let connection = self.connection()?;
        let deleted = connection.execute(
            "DELETE FROM blocked_source WHERE domain = ?",
            params![domain],
        )?;
        Ok(deleted > 0)
    }

    pub fn delete_expired_blocked_sources(&self, now: i64) -> Result<usize, WarehouseError> {
        let connection = self.connection()?;
        let deleted = connection.execute(
            "DELETE FROM blocked_source WHERE blocked_until <= ?",
            params![now],
        )?;
        Ok(deleted)
    }
}

fn read_source_block(row: &Row<'_>) -> Result<SourceBlockRow, ::duckdb::Error> {
    let count: i64 = row.get(3)?;
    let status: Option<i64> = row.get(4)?;
    Ok(SourceBlockRow {
        domain: row.get(0)?,
        blocked_at: row.get(1)?,
        blocked_until: row.get(2)?,
        consecutive_count: u32::try_from(count).unwrap_or(0),
        last_status_code: status.and_then(|code| u16::try_from(code).ok()),
        last_error: row.get(5)?,
        last_attempt_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_blocks_increment_the_counter() {
        let warehouse = Warehouse::open_in_memory().expect("open");

        let first = warehouse
            .record_source_block("www.reuters.com", 10, 300_010, Some(403), Some("forbidden"))
            .expect("first");
        let second = warehouse
            .record_source_block("www.reuters.com", 20, 900_020, Some(403), None)
            .expect("second");

        assert_eq!(first.consecutive_count, 1);
        assert_eq!(second.consecutive_count, 2);
        assert_eq!(second.blocked_until, Some(900_020));
        assert_eq!(second.last_status_code, Some(403));
    }

    #[test]
    fn clearing_resets_counter_but_keeps_last_attempt() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        warehouse
            .record_source_attempt("stockanalysis.com", 5)
            .expect("attempt");
        warehouse
            .record_source_block("stockanalysis.com", 10, 20, Some(401), None)
            .expect("block");

        warehouse.clear_source_block("stockanalysis.com").expect("clear");
        let row = warehouse
            .source_block("stockanalysis.com")
            .expect("query")
            .expect("row");

        assert_eq!(row.consecutive_count, 0);
        assert_eq!(row.blocked_until, None);
        assert_eq!(row.last_attempt_at, Some(5));
    }

    #[test]
    fn extend_never_shortens_an_existing_window() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        warehouse
            .extend_source_block("finance.yahoo.com", 0, 5_000)
            .expect("first");
        warehouse
            .extend_source_block("finance.yahoo.com", 1, 2_000)
            .expect("second");

        let row = warehouse
            .source_block("finance.yahoo.com")
            .expect("query")
            .expect("row");
        assert_eq!(row.blocked_until, Some(5_000));
        assert_eq!(row.consecutive_count, 0);
    }

    #[test]
    fn expired_rows_are_pruned() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        warehouse
            .record_source_block("old.example", 0, 100, None, None)
            .expect("old");
        warehouse
            .record_source_block("new.example", 0, 10_000, None, None)
            .expect("new");
        warehouse.upsert_blocked_source("old.example", 100).expect("registry");

        assert_eq!(warehouse.delete_expired_source_blocks(500).expect("prune"), 1);
        assert_eq!(warehouse.delete_expired_blocked_sources(500).expect("prune"), 1);
        assert!(warehouse.source_block("old.example").expect("query").is_none());
        assert!(warehouse.source_block("new.example").expect("query").is_some());
    }
}
