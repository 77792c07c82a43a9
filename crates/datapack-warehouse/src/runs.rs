use ::duckdb::{params, OptionalExt, Row};
use serde::Serialize;

use crate::{in_transaction, Warehouse, WarehouseError};

const RUN_COLUMNS: &str = "id, industry_id, datapack_id, status, started_at, completed_at, \
     companies_total, companies_success, companies_failed, gate_passed, error_count, \
     warning_count, file_path, file_size_bytes, duration_seconds, companies_partial";

/// A `collection_run` row. Timestamps are unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRunRow {
    pub id: String,
    pub industry_id: String,
    pub datapack_id: String,
    pub status: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub companies_total: i64,
    pub companies_success: i64,
    pub companies_partial: i64,
    pub companies_failed: i64,
    pub gate_passed: Option<bool>,
    pub error_count: i64,
    pub warning_count: i64,
    pub file_path: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub duration_seconds: Option<i64>,
}

/// A `collection_error` row. `id` is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionErrorRow {
    pub id: Option<i64>,
    pub collection_run_id: String,
    pub severity: String,
    pub error_code: String,
    pub error_message: String,
    pub error_path: Option<String>,
    pub ticker: Option<String>,
    pub created_at: i64,
}

impl Warehouse {
    pub fn insert_run(&self, run: &CollectionRunRow) -> Result<(), WarehouseError> {
        let connection = self.connection()?;
        connection.execute(
            "INSERT INTO collection_run \
             (id, industry_id, datapack_id, status, started_at, completed_at, companies_total, \
              companies_success, companies_failed, gate_passed, error_count, warning_count, \
              file_path, file_size_bytes, duration_seconds, companies_partial) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                run.id,
                run.industry_id,
                run.datapack_id,
                run.status,
                run.started_at,
                run.completed_at,
                run.companies_total,
                run.companies_success,
                run.companies_failed,
                run.gate_passed,
                run.error_count,
                run.warning_count,
                run.file_path,
                run.file_size_bytes,
                run.duration_seconds,
                run.companies_partial,
            ],
        )?;
        Ok(())
    }

    /// Overwrite every mutable column of an existing run.
    pub fn update_run(&self, run: &CollectionRunRow) -> Result<(), WarehouseError> {
        let connection = self.connection()?;
        let updated = connection.execute(
            "UPDATE collection_run SET status = ?, completed_at = ?, companies_total = ?, \
             companies_success = ?, companies_failed = ?, gate_passed = ?, error_count = ?, \
             warning_count = ?, file_path = ?, file_size_bytes = ?, duration_seconds = ?, \
             companies_partial = ? WHERE id = ?",
            params![
                run.status,
                run.completed_at,
                run.companies_total,
                run.companies_success,
                run.companies_failed,
                run.gate_passed,
                run.error_count,
                run.warning_count,
                run.file_path,
                run.file_size_bytes,
                run.duration_seconds,
                run.companies_partial,
                run.id,
            ],
        )?;
        if updated == 0 {
            return Err(WarehouseError::NotFound {
                table: "collection_run",
                key: run.id.clone(),
            });
        }
        Ok(())
    }

    pub fn run(&self, id: &str) -> Result<Option<CollectionRunRow>, WarehouseError> {
        let connection = self.connection()?;
        let sql = format!("SELECT {RUN_COLUMNS} FROM collection_run WHERE id = ?");
        let row = connection
            .query_row(sql.as_str(), params![id], read_run)
            .optional()?;
        Ok(row)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<CollectionRunRow>, WarehouseError> {
        let connection = self.connection()?;
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM collection_run ORDER BY started_at DESC, id LIMIT ?"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut statement = connection.prepare(sql.as_str())?;
        let rows = statement.query_map(params![limit], read_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete a run together with every error recorded against it.
    pub fn delete_run(&self, id: &str) -> Result<bool, WarehouseError> {
        let connection = self.connection()?;
        in_transaction(&connection, |tx| {
            tx.execute(
                "DELETE FROM collection_error WHERE collection_run_id = ?",
                params![id],
            )?;
            let deleted = tx.execute("DELETE FROM collection_run WHERE id = ?", params![id])?;
            Ok(deleted > 0)
        })
    }

    /// Append errors for one run; the run must exist.
    pub fn append_run_errors(&self, errors: &[CollectionErrorRow]) -> Result<(), WarehouseError> {
        if errors.is_empty() {
            return Ok(());
        }

        let connection = self.connection()?;
        in_transaction(&connection, |tx| {
            for error in errors {
                let exists: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM collection_run WHERE id = ?",
                    params![error.collection_run_id],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Err(WarehouseError::NotFound {
                        table: "collection_run",
                        key: error.collection_run_id.clone(),
                    });
                }

                tx.execute(
                    "INSERT INTO collection_error \
                     (collection_run_id, severity, error_code, error_message, error_path, ticker, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        error.collection_run_id,
                        error.severity,
                        error.error_code,
                        error.error_message,
                        error.error_path,
                        error.ticker,
                        error.created_at,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn run_errors(&self, run_id: &str) -> Result<Vec<CollectionErrorRow>, WarehouseError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT id, collection_run_id, severity, error_code, error_message, error_path, \
             ticker, created_at FROM collection_error WHERE collection_run_id = ? ORDER BY id",
        )?;
        let rows = statement.query_map(params![run_id], |row| {
            Ok(CollectionErrorRow {
                id: row.get(0)?,
                collection_run_id: row.get(1)?,
                severity: row.get(2)?,
                error_code: row.get(3)?,
                error_message: row.get(4)?,
                error_path: row.get(5)?,
                ticker: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn read_run(row: &Row<'_>) -> Result<CollectionRunRow, ::duckdb::Error> {
    Ok(CollectionRunRow {
        id: row.get(0)?,
        industry_id: row.get(1)?,
        datapack_id: row.get(2)?,
        status: row.get(3)?,
        started_at: row.get(4)?,
        completed_at: row.get(5)?,
        companies_total: row.get(6)?,
        companies_success: row.get(7)?,
        companies_failed: row.get(8)?,
        gate_passed: row.get(9)?,
        error_count: row.get(10)?,
        warning_count: row.get(11)?,
        file_path: row.get(12)?,
        file_size_bytes: row.get(13)?,
        duration_seconds: row.get(14)?,
        companies_partial: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_run(id: &str, datapack_id: &str, started_at: i64) -> CollectionRunRow {
        CollectionRunRow {
            id: id.to_string(),
            industry_id: "oil-majors".to_string(),
            datapack_id: datapack_id.to_string(),
            status: "pending".to_string(),
            started_at,
            completed_at: None,
            companies_total: 3,
            companies_success: 0,
            companies_partial: 0,
            companies_failed: 0,
            gate_passed: None,
            error_count: 0,
            warning_count: 0,
            file_path: None,
            file_size_bytes: None,
            duration_seconds: None,
        }
    }

    fn error_row(run_id: &str, code: &str) -> CollectionErrorRow {
        CollectionErrorRow {
            id: None,
            collection_run_id: run_id.to_string(),
            severity: "error".to_string(),
            error_code: code.to_string(),
            error_message: format!("{code} message"),
            error_path: Some("companies.SHEL.valuation.market_cap".to_string()),
            ticker: Some("SHEL".to_string()),
            created_at: 42,
        }
    }

    #[test]
    fn run_round_trips_through_update() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        let mut run = pending_run("run-1", "dp-1", 1_000);
        warehouse.insert_run(&run).expect("insert");

        run.status = "complete".to_string();
        run.completed_at = Some(9_000);
        run.companies_success = 1;
        run.companies_partial = 1;
        run.companies_failed = 1;
        run.gate_passed = Some(true);
        run.file_size_bytes = Some(2048);
        warehouse.update_run(&run).expect("update");

        assert_eq!(warehouse.run("run-1").expect("query"), Some(run));
    }

    #[test]
    fn datapack_id_is_unique() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        warehouse
            .insert_run(&pending_run("run-1", "dp-1", 1))
            .expect("first");
        assert!(warehouse.insert_run(&pending_run("run-2", "dp-1", 2)).is_err());
    }

    #[test]
    fn errors_require_an_existing_run() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        let error = warehouse
            .append_run_errors(&[error_row("missing", "MISSING_REQUIRED")])
            .expect_err("orphan error rejected");
        assert!(matches!(error, WarehouseError::NotFound { .. }));
    }

    #[test]
    fn deleting_a_run_deletes_its_errors() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        warehouse
            .insert_run(&pending_run("run-1", "dp-1", 1))
            .expect("insert");
        warehouse
            .append_run_errors(&[
                error_row("run-1", "MISSING_REQUIRED"),
                error_row("run-1", "MACRO_STALE"),
            ])
            .expect("append");
        assert_eq!(warehouse.run_errors("run-1").expect("errors").len(), 2);

        assert!(warehouse.delete_run("run-1").expect("delete"));
        assert!(warehouse.run_errors("run-1").expect("errors").is_empty());
        assert!(warehouse.run("run-1").expect("query").is_none());
    }

    #[test]
    fn recent_runs_are_newest_first() {
        let warehouse = Warehouse::open_in_memory().expect("open");
        warehouse.insert_run(&pending_run("a", "dp-a", 10)).expect("a");
        warehouse.insert_run(&pending_run("b", "dp-b", 30)).expect("b");
        warehouse.insert_run(&pending_run("c", "dp-c", 20)).expect("c");

        let ids: Vec<_> = warehouse
            .recent_runs(2)
            .expect("recent")
            .into_iter()
            .map(|run| run.id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }
}
