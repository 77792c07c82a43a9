//! # Datapack Assembly
//!
//! Merges the per-entity intermediate payloads into the final datapack file
//! without ever holding more than one entity in memory.
//!
//! The document is written field by field into a [`NamedTempFile`] created
//! next to the final path:
//!
//! ```text
//! {"industry_id":..,"datapack_id":..,"collected_at":..,"macro":{..},
//!  "companies":{"<ticker>":<stored payload>,...},"collection_log":{..}}
//! ```
//!
//! The temporary file is renamed over the final path only once the closing
//! brace is flushed and synced. Any failure, including a memory budget
//! breach between entities, drops the temporary file, which deletes it.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::IgnoredAny;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{CollectionLog, MacroData, UtcDateTime};
use crate::storage::{validate_key, EntityStorage, StorageError};

pub const DATAPACK_FILE_NAME: &str = "datapack.json";

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("memory usage {usage} bytes is over the {threshold} byte threshold of the {limit} byte limit")]
    MemoryExceeded { usage: u64, limit: u64, threshold: u64 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode datapack field '{field}': {source}")]
    Encode {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("intermediate payload for '{ticker}' is not valid JSON: {source}")]
    CorruptEntity {
        ticker: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AssemblyError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Source of process memory readings.
pub trait MemoryGauge: Send + Sync {
    /// Current resident memory in bytes; `None` when it cannot be measured.
    fn usage_bytes(&self) -> Option<u64>;

    /// Give memory back before the usage is re-read.
    fn reclaim(&self) {}
}

/// Resident set size from the `VmRSS` line of `/proc/self/status`, which the
/// kernel reports in kB whatever the page size. Unmeasurable on other
/// platforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemoryGauge;

impl MemoryGauge for ProcessMemoryGauge {
    fn usage_bytes(&self) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_status_resident(&status)
    }
}

fn parse_status_resident(status: &str) -> Option<u64> {
    let line = status.lines().find_map(|line| line.strip_prefix("VmRSS:"))?;
    let mut fields = line.split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some(unit) if unit.eq_ignore_ascii_case("kb") => value.checked_mul(1024),
        None => Some(value),
        Some(_) => None,
    }
}

/// Replays fixed readings; the last one repeats once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedMemoryGauge {
    readings: Mutex<VecDeque<u64>>,
    last: Mutex<Option<u64>>,
    reclaims: AtomicUsize,
}

impl ScriptedMemoryGauge {
    pub fn new(readings: impl IntoIterator<Item = u64>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn reclaim_count(&self) -> usize {
        self.reclaims.load(Ordering::SeqCst)
    }
}

impl MemoryGauge for ScriptedMemoryGauge {
    fn usage_bytes(&self) -> Option<u64> {
        let next = self
            .readings
            .lock()
            .expect("memory gauge readings lock should not be poisoned")
            .pop_front();
        let mut last = self
            .last
            .lock()
            .expect("memory gauge readings lock should not be poisoned");
        if next.is_some() {
            *last = next;
        }
        *last
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Memory ceiling enforced between entities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudget {
    pub limit_bytes: u64,
    pub warning_ratio: f64,
}

impl MemoryBudget {
    pub fn new(limit_bytes: u64, warning_ratio: f64) -> Self {
        Self {
            limit_bytes,
            warning_ratio,
        }
    }

    pub fn threshold_bytes(&self) -> u64 {
        (self.limit_bytes as f64 * self.warning_ratio) as u64
    }

    /// Reclaims once when over the threshold and fails if usage is still over.
    pub fn check(&self, gauge: &dyn MemoryGauge) -> Result<(), AssemblyError> {
        let threshold = self.threshold_bytes();
        let Some(usage) = gauge.usage_bytes() else {
            return Ok(());
        };
        if usage <= threshold {
            return Ok(());
        }

        debug!(usage, threshold, "memory above threshold, reclaiming");
        gauge.reclaim();
        match gauge.usage_bytes() {
            Some(usage) if usage > threshold => Err(AssemblyError::MemoryExceeded {
                usage,
                limit: self.limit_bytes,
                threshold,
            }),
            _ => Ok(()),
        }
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(512 * 1024 * 1024, 0.8)
    }
}

/// Header and trailer of one datapack.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub industry_id: &'a str,
    pub datapack_id: &'a str,
    pub collected_at: UtcDateTime,
    pub macro_data: &'a MacroData,
    pub collection_log: &'a CollectionLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledDatapack {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub company_count: usize,
}

pub struct DatapackAssembler {
    output_root: PathBuf,
    gauge: Arc<dyn MemoryGauge>,
    budget: MemoryBudget,
}

impl DatapackAssembler {
    pub fn new(output_root: impl Into<PathBuf>, gauge: Arc<dyn MemoryGauge>, budget: MemoryBudget) -> Self {
        Self {
            output_root: output_root.into(),
            gauge,
            budget,
        }
    }

    /// `<root>/<industry_id>/<datapack_id>/datapack.json`
    pub fn datapack_path(&self, industry_id: &str, datapack_id: &str) -> Result<PathBuf, AssemblyError> {
        validate_key(industry_id)?;
        validate_key(datapack_id)?;
        Ok(self
            .output_root
            .join(industry_id)
            .join(datapack_id)
            .join(DATAPACK_FILE_NAME))
    }

    pub fn assemble(
        &self,
        input: AssemblyInput<'_>,
        storage: &dyn EntityStorage,
    ) -> Result<AssembledDatapack, AssemblyError> {
        let path = self.datapack_path(input.industry_id, input.datapack_id)?;
        let dir = path.parent().unwrap_or(&self.output_root).to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| AssemblyError::io(&dir, source))?;

        let tmp = NamedTempFile::new_in(&dir).map_err(|source| AssemblyError::io(&dir, source))?;
        let tmp_path = tmp.path().to_path_buf();
        let mut out = BufWriter::new(tmp);

        let company_count = self
            .write_document(&mut out, input, storage)
            .inspect_err(|error| warn!(path = %path.display(), error = %error, "datapack assembly aborted"))?;

        let tmp = out
            .into_inner()
            .map_err(|error| AssemblyError::io(&tmp_path, error.into_error()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|source| AssemblyError::io(&tmp_path, source))?;
        tmp.persist(&path)
            .map_err(|error| AssemblyError::io(&path, error.error))?;

        let size_bytes = fs::metadata(&path)
            .map_err(|source| AssemblyError::io(&path, source))?
            .len();
        info!(
            path = %path.display(),
            size_bytes,
            company_count,
            "datapack assembled"
        );
        Ok(AssembledDatapack {
            path,
            size_bytes,
            company_count,
        })
    }

    fn write_document(
        &self,
        out: &mut BufWriter<NamedTempFile>,
        input: AssemblyInput<'_>,
        storage: &dyn EntityStorage,
    ) -> Result<usize, AssemblyError> {
        let mut writer = JsonWriter::new(out);
        writer.raw("{")?;
        writer.field("industry_id", &input.industry_id, false)?;
        writer.field("datapack_id", &input.datapack_id, true)?;
        writer.field("collected_at", &input.collected_at, true)?;
        writer.field("macro", input.macro_data, true)?;
        writer.raw(",\"companies\":{")?;

        let mut count = 0;
        for entry in storage.entries()? {
            self.budget.check(self.gauge.as_ref())?;
            let (ticker, body) = entry?;
            serde_json::from_str::<IgnoredAny>(&body).map_err(|source| {
                AssemblyError::CorruptEntity {
                    ticker: ticker.clone(),
                    source,
                }
            })?;
            if count > 0 {
                writer.raw(",")?;
            }
            writer.value("companies", &ticker)?;
            writer.raw(":")?;
            writer.raw(body.trim())?;
            count += 1;
        }

        writer.raw("}")?;
        writer.field("collection_log", input.collection_log, true)?;
        writer.raw("}")?;
        writer.flush()?;
        Ok(count)
    }
}

struct JsonWriter<'a, W: Write> {
    inner: &'a mut W,
}

impl<'a, W: Write> JsonWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner }
    }

    fn raw(&mut self, chunk: &str) -> Result<(), AssemblyError> {
        self.inner
            .write_all(chunk.as_bytes())
            .map_err(|source| AssemblyError::io(Path::new(DATAPACK_FILE_NAME), source))
    }

    fn value<T: Serialize + ?Sized>(&mut self, field: &'static str, value: &T) -> Result<(), AssemblyError> {
        serde_json::to_writer(&mut *self.inner, value)
            .map_err(|source| AssemblyError::Encode { field, source })
    }

    fn field<T: Serialize + ?Sized>(
        &mut self,
        name: &'static str,
        value: &T,
        leading_comma: bool,
    ) -> Result<(), AssemblyError> {
        if leading_comma {
            self.raw(",")?;
        }
        self.value(name, name)?;
        self.raw(":")?;
        self.value(name, value)
    }

    fn flush(&mut self) -> Result<(), AssemblyError> {
        self.inner
            .flush()
            .map_err(|source| AssemblyError::io(Path::new(DATAPACK_FILE_NAME), source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CollectionStatus, CompanyData, DatapackDocument};
    use crate::storage::InMemoryStorage;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn log() -> CollectionLog {
        let started_at = UtcDateTime::parse("2025-03-03T12:00:00Z").expect("start");
        CollectionLog {
            started_at,
            completed_at: started_at,
            duration_seconds: 0,
            company_statuses: BTreeMap::from([("SHEL".to_owned(), CollectionStatus::Complete)]),
            macro_status: CollectionStatus::Complete,
            total_attempts: 4,
        }
    }

    #[test]
    fn resident_size_comes_from_vm_rss_in_kilobytes() {
        let status = "Name:\tdatapack\nVmPeak:\t  204800 kB\nVmRSS:\t   51200 kB\nThreads:\t4\n";
        assert_eq!(parse_status_resident(status), Some(51_200 * 1024));
        assert_eq!(parse_status_resident("Name:\tdatapack\n"), None);
        assert_eq!(parse_status_resident("VmRSS:\t12 pages\n"), None);
    }

    #[test]
    fn budget_reclaims_before_failing() {
        let budget = MemoryBudget::new(1000, 0.8);

        let recovering = ScriptedMemoryGauge::new([900, 500]);
        budget.check(&recovering).expect("recovers after reclaim");
        assert_eq!(recovering.reclaim_count(), 1);

        let stuck = ScriptedMemoryGauge::new([900, 850]);
        let err = budget.check(&stuck).expect_err("still over");
        assert!(matches!(
            err,
            AssemblyError::MemoryExceeded {
                usage: 850,
                limit: 1000,
                threshold: 800
            }
        ));
        assert_eq!(
            err.to_string(),
            "memory usage 850 bytes is over the 800 byte threshold of the 1000 byte limit"
        );
    }

    #[test]
    fn assembled_file_parses_back_as_a_document() {
        let dir = tempdir().expect("tempdir");
        let storage = InMemoryStorage::new();
        storage.write(&CompanyData::new("SHEL", "Shell plc")).expect("write");
        let assembler = DatapackAssembler::new(
            dir.path(),
            Arc::new(ScriptedMemoryGauge::new([10])),
            MemoryBudget::new(1000, 0.8),
        );

        let macro_data = MacroData::default();
        let log = log();
        let assembled = assembler
            .assemble(
                AssemblyInput {
                    industry_id: "oil-majors",
                    datapack_id: "pack-1",
                    collected_at: log.completed_at,
                    macro_data: &macro_data,
                    collection_log: &log,
                },
                &storage,
            )
            .expect("assemble");

        assert_eq!(assembled.company_count, 1);
        let body = fs::read_to_string(&assembled.path).expect("read");
        assert_eq!(assembled.size_bytes, body.len() as u64);
        let document: DatapackDocument = serde_json::from_str(&body).expect("document");
        assert_eq!(document.datapack_id, "pack-1");
        assert_eq!(document.companies["SHEL"].name, "Shell plc");
        assert_eq!(document.collection_log.total_attempts, 4);
    }

    #[test]
    fn corrupt_entity_leaves_no_artifact() {
        let dir = tempdir().expect("tempdir");
        let storage = InMemoryStorage::new();
        storage.insert_raw("SHEL", "{\"ticker\":");
        let assembler = DatapackAssembler::new(
            dir.path(),
            Arc::new(ProcessMemoryGauge),
            MemoryBudget::new(u64::MAX, 1.0),
        );

        let macro_data = MacroData::default();
        let log = log();
        let err = assembler
            .assemble(
                AssemblyInput {
                    industry_id: "oil-majors",
                    datapack_id: "pack-2",
                    collected_at: log.completed_at,
                    macro_data: &macro_data,
                    collection_log: &log,
                },
                &storage,
            )
            .expect_err("corrupt payload");

        assert!(matches!(err, AssemblyError::CorruptEntity { .. }));
        let run_dir = dir.path().join("oil-majors").join("pack-2");
        assert_eq!(fs::read_dir(run_dir).expect("dir").count(), 0);
    }
}
