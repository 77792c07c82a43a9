//! Store traits for run records and their DuckDB-backed implementations.
//!
//! [`DuckDbStore`] wraps a [`Warehouse`] and implements every store trait the
//! collector uses, so runs that share a database file share block state.

use std::collections::BTreeMap;
use std::sync::Mutex;

use datapack_warehouse::{
    BlockedSourceRow, CollectionErrorRow, CollectionRunRow, SourceBlockRow, Warehouse,
};

use crate::domain::{CollectionError, CollectionRun, CollectionStatus, Severity, UtcDateTime};
use crate::error::StoreError;
use crate::registry::BlockedSourceRegistry;
use crate::throttle::{BlockStateStore, DomainBlockState};

/// A run as listed back from a store, with its recorded errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    pub run: CollectionRun,
    pub errors: Vec<CollectionError>,
}

/// Durable record of runs and their append-only error rows.
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: &CollectionRun) -> Result<(), StoreError>;

    fn update_run(&self, run: &CollectionRun) -> Result<(), StoreError>;

    fn append_errors(&self, run_id: &str, errors: &[CollectionError]) -> Result<(), StoreError>;

    fn run(&self, run_id: &str) -> Result<Option<StoredRun>, StoreError>;

    /// Newest first.
    fn recent_runs(&self, limit: usize) -> Result<Vec<StoredRun>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: Mutex<BTreeMap<String, StoredRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for InMemoryRunStore {
    fn insert_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        self.runs
            .lock()
            .expect("run store should not be poisoned")
            .insert(
                run.id.clone(),
                StoredRun {
                    run: run.clone(),
                    errors: Vec::new(),
                },
            );
        Ok(())
    }

    fn update_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("run store should not be poisoned");
        let stored = runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::Corrupt(format!("run '{}' was never inserted", run.id)))?;
        stored.run = run.clone();
        Ok(())
    }

    fn append_errors(&self, run_id: &str, errors: &[CollectionError]) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().expect("run store should not be poisoned");
        let stored = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::Corrupt(format!("run '{run_id}' was never inserted")))?;
        stored.errors.extend_from_slice(errors);
        Ok(())
    }

    fn run(&self, run_id: &str) -> Result<Option<StoredRun>, StoreError> {
        Ok(self
            .runs
            .lock()
            .expect("run store should not be poisoned")
            .get(run_id)
            .cloned())
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<StoredRun>, StoreError> {
        let runs = self.runs.lock().expect("run store should not be poisoned");
        let mut all: Vec<StoredRun> = runs.values().cloned().collect();
        all.sort_by(|a, b| b.run.started_at.cmp(&a.run.started_at));
        all.truncate(limit);
        Ok(all)
    }
}

/// Every collector store on one DuckDB file.
#[derive(Clone)]
pub struct DuckDbStore {
    warehouse: Warehouse,
}

impl DuckDbStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }
}

fn timestamp(millis: i64) -> Result<UtcDateTime, StoreError> {
    Ok(UtcDateTime::from_unix_millis(millis)?)
}

fn optional_timestamp(millis: Option<i64>) -> Result<Option<UtcDateTime>, StoreError> {
    millis.map(timestamp).transpose()
}

fn count(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn block_state(row: SourceBlockRow) -> Result<DomainBlockState, StoreError> {
    Ok(DomainBlockState {
        blocked_at: optional_timestamp(row.blocked_at)?,
        blocked_until: optional_timestamp(row.blocked_until)?,
        last_attempt_at: optional_timestamp(row.last_attempt_at)?,
        domain: row.domain,
        consecutive_count: row.consecutive_count,
        last_status_code: row.last_status_code,
        last_error: row.last_error,
    })
}

fn run_row(run: &CollectionRun) -> CollectionRunRow {
    CollectionRunRow {
        id: run.id.clone(),
        industry_id: run.industry_id.clone(),
        datapack_id: run.datapack_id.clone(),
        status: run.status().as_str().to_owned(),
        started_at: run.started_at.unix_millis(),
        completed_at: run.completed_at().map(UtcDateTime::unix_millis),
        companies_total: i64::from(run.companies_total),
        companies_success: i64::from(run.companies_success),
        companies_partial: i64::from(run.companies_partial),
        companies_failed: i64::from(run.companies_failed),
        gate_passed: run.gate_passed,
        error_count: i64::from(run.error_count),
        warning_count: i64::from(run.warning_count),
        file_path: run.file_path.clone(),
        file_size_bytes: run.file_size_bytes.map(to_i64),
        duration_seconds: run.duration_seconds.map(to_i64),
    }
}

fn stored_run(row: CollectionRunRow) -> Result<CollectionRun, StoreError> {
    let status: CollectionStatus = row.status.parse()?;
    let mut run = CollectionRun::restore(
        row.id,
        row.industry_id,
        row.datapack_id,
        status,
        timestamp(row.started_at)?,
        optional_timestamp(row.completed_at)?,
    );
    run.companies_total = count(row.companies_total, "companies_total")?;
    run.companies_success = count(row.companies_success, "companies_success")?;
    run.companies_partial = count(row.companies_partial, "companies_partial")?;
    run.companies_failed = count(row.companies_failed, "companies_failed")?;
    run.gate_passed = row.gate_passed;
    run.error_count = count(row.error_count, "error_count")?;
    run.warning_count = count(row.warning_count, "warning_count")?;
    run.file_path = row.file_path;
    run.file_size_bytes = row.file_size_bytes.and_then(|size| u64::try_from(size).ok());
    run.duration_seconds = row.duration_seconds.and_then(|secs| u64::try_from(secs).ok());
    Ok(run)
}

fn stored_error(row: CollectionErrorRow) -> Result<CollectionError, StoreError> {
    let severity: Severity = row.severity.parse()?;
    Ok(CollectionError {
        severity,
        code: row.error_code,
        message: row.error_message,
        path: row.error_path,
        ticker: row.ticker,
    })
}

impl DuckDbStore {
    fn load_run(&self, row: CollectionRunRow) -> Result<StoredRun, StoreError> {
        let errors = self
            .warehouse
            .run_errors(&row.id)?
            .into_iter()
            .map(stored_error)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StoredRun {
            run: stored_run(row)?,
            errors,
        })
    }
}

impl BlockStateStore for DuckDbStore {
    fn get(&self, domain: &str) -> Result<Option<DomainBlockState>, StoreError> {
        self.warehouse
            .source_block(domain)?
            .map(block_state)
            .transpose()
    }

    fn list(&self) -> Result<Vec<DomainBlockState>, StoreError> {
        self.warehouse
            .list_source_blocks()?
            .into_iter()
            .map(block_state)
            .collect()
    }

    fn record_block(
        &self,
        domain: &str,
        blocked_at: UtcDateTime,
        blocked_until: UtcDateTime,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<DomainBlockState, StoreError> {
        let row = self.warehouse.record_source_block(
            domain,
            blocked_at.unix_millis(),
            blocked_until.unix_millis(),
            status,
            error,
        )?;
        block_state(row)
    }

    fn extend_block(
        &self,
        domain: &str,
        blocked_at: UtcDateTime,
        blocked_until: UtcDateTime,
    ) -> Result<(), StoreError> {
        self.warehouse
            .extend_source_block(domain, blocked_at.unix_millis(), blocked_until.unix_millis())?;
        Ok(())
    }

    fn clear(&self, domain: &str) -> Result<(), StoreError> {
        self.warehouse.clear_source_block(domain)?;
        Ok(())
    }

    fn record_attempt(&self, domain: &str, at: UtcDateTime) -> Result<(), StoreError> {
        self.warehouse.record_source_attempt(domain, at.unix_millis())?;
        Ok(())
    }

    fn delete(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self.warehouse.delete_source_block(domain)?)
    }

    fn delete_expired(&self, now: UtcDateTime) -> Result<usize, StoreError> {
        Ok(self.warehouse.delete_expired_source_blocks(now.unix_millis())?)
    }
}

impl BlockedSourceRegistry for DuckDbStore {
    fn blocked_until(&self, domain: &str) -> Result<Option<UtcDateTime>, StoreError> {
        let Some(BlockedSourceRow { blocked_until, .. }) = self.warehouse.blocked_source(domain)?
        else {
            return Ok(None);
        };
        let until = timestamp(blocked_until)?;
        if until <= UtcDateTime::now() {
            self.warehouse.delete_blocked_source(domain)?;
            return Ok(None);
        }
        Ok(Some(until))
    }

    fn block(&self, domain: &str, until: UtcDateTime) -> Result<(), StoreError> {
        self.warehouse
            .upsert_blocked_source(domain, until.unix_millis())?;
        Ok(())
    }

    fn unblock(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self.warehouse.delete_blocked_source(domain)?)
    }

    fn list(&self) -> Result<Vec<(String, UtcDateTime)>, StoreError> {
        self.warehouse
            .list_blocked_sources()?
            .into_iter()
            .map(|row| Ok((row.domain, timestamp(row.blocked_until)?)))
            .collect()
    }

    fn prune(&self, now: UtcDateTime) -> Result<usize, StoreError> {
        Ok(self
            .warehouse
            .delete_expired_blocked_sources(now.unix_millis())?)
    }
}

impl RunStore for DuckDbStore {
    fn insert_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        self.warehouse.insert_run(&run_row(run))?;
        Ok(())
    }

    fn update_run(&self, run: &CollectionRun) -> Result<(), StoreError> {
        self.warehouse.update_run(&run_row(run))?;
        Ok(())
    }

    fn append_errors(&self, run_id: &str, errors: &[CollectionError]) -> Result<(), StoreError> {
        let created_at = UtcDateTime::now().unix_millis();
        let rows: Vec<CollectionErrorRow> = errors
            .iter()
            .map(|error| CollectionErrorRow {
                id: None,
                collection_run_id: run_id.to_owned(),
                severity: error.severity.as_str().to_owned(),
                error_code: error.code.clone(),
                error_message: error.message.clone(),
                error_path: error.path.clone(),
                ticker: error.ticker.clone(),
                created_at,
            })
            .collect();
        self.warehouse.append_run_errors(&rows)?;
        Ok(())
    }

    fn run(&self, run_id: &str) -> Result<Option<StoredRun>, StoreError> {
        self.warehouse
            .run(run_id)?
            .map(|row| self.load_run(row))
            .transpose()
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<StoredRun>, StoreError> {
        self.warehouse
            .recent_runs(limit)?
            .into_iter()
            .map(|row| self.load_run(row))
            .collect()
    }
}
