//! Per-entity intermediate storage.
//!
//! Each collected company is written as one JSON blob keyed by ticker before
//! assembly. The assembler reads the blobs back one at a time through
//! [`EntityStorage::entries`], so its memory use is bounded by the largest
//! single entity rather than the whole datapack.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::domain::CompanyData;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode entity '{ticker}': {source}")]
    Encode {
        ticker: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("entity '{0}' disappeared from storage while reading")]
    Vanished(String),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Lazily loaded `(ticker, raw JSON)` pairs in ticker order.
pub type EntityEntries<'a> = Box<dyn Iterator<Item = Result<(String, String), StorageError>> + 'a>;

/// Backend holding one JSON document per entity.
pub trait EntityStorage: Send + Sync {
    /// Store (or replace) the payload for `company.ticker`.
    fn write(&self, company: &CompanyData) -> Result<(), StorageError>;

    /// Raw JSON previously written for `ticker`.
    fn read(&self, ticker: &str) -> Result<Option<String>, StorageError>;

    /// Stored tickers in ascending order.
    fn tickers(&self) -> Result<Vec<String>, StorageError>;

    /// Stream every stored entity; a payload is only loaded when its item is pulled.
    fn entries(&self) -> Result<EntityEntries<'_>, StorageError> {
        let tickers = self.tickers()?;
        Ok(Box::new(tickers.into_iter().map(move |ticker| {
            let body = self
                .read(&ticker)?
                .ok_or_else(|| StorageError::Vanished(ticker.clone()))?;
            Ok((ticker, body))
        })))
    }
}

/// Rejects keys that could escape the storage directory.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '='));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_owned()))
    }
}

fn encode(company: &CompanyData) -> Result<String, StorageError> {
    validate_key(&company.ticker)?;
    serde_json::to_string(company).map_err(|source| StorageError::Encode {
        ticker: company.ticker.clone(),
        source,
    })
}

/// `<dir>/<ticker>.json` files, each replaced atomically.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage for one run: `<root>/<industry_id>/<datapack_id>`.
    pub fn for_run(root: &Path, industry_id: &str, datapack_id: &str) -> Result<Self, StorageError> {
        validate_key(industry_id)?;
        validate_key(datapack_id)?;
        Ok(Self::new(root.join(industry_id).join(datapack_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, ticker: &str) -> PathBuf {
        self.dir.join(format!("{ticker}.json"))
    }
}

impl EntityStorage for DirectoryStorage {
    fn write(&self, company: &CompanyData) -> Result<(), StorageError> {
        let body = encode(company)?;
        fs::create_dir_all(&self.dir).map_err(|source| StorageError::io(&self.dir, source))?;

        let path = self.path_for(&company.ticker);
        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|source| StorageError::io(&self.dir, source))?;
        tmp.write_all(body.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|source| StorageError::io(tmp.path(), source))?;
        tmp.persist(&path)
            .map_err(|error| StorageError::io(&path, error.error))?;
        Ok(())
    }

    fn read(&self, ticker: &str) -> Result<Option<String>, StorageError> {
        validate_key(ticker)?;
        let path = self.path_for(ticker);
        match fs::read_to_string(&path) {
            Ok(body) => Ok(Some(body)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(StorageError::io(&path, error)),
        }
    }

    fn tickers(&self) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StorageError::io(&self.dir, error)),
        };

        let mut tickers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::io(&self.dir, source))?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(ticker) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if validate_key(ticker).is_ok() {
                tickers.push(ticker.to_owned());
            }
        }
        tickers.sort();
        Ok(tickers)
    }
}

/// Map-backed storage for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entities: Mutex<BTreeMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw payload without encoding it, e.g. a deliberately corrupt one.
    pub fn insert_raw(&self, ticker: impl Into<String>, body: impl Into<String>) {
        self.entities
            .lock()
            .expect("entity storage lock should not be poisoned")
            .insert(ticker.into(), body.into());
    }

    pub fn len(&self) -> usize {
        self.entities
            .lock()
            .expect("entity storage lock should not be poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityStorage for InMemoryStorage {
    fn write(&self, company: &CompanyData) -> Result<(), StorageError> {
        let body = encode(company)?;
        self.insert_raw(company.ticker.clone(), body);
        Ok(())
    }

    fn read(&self, ticker: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .entities
            .lock()
            .expect("entity storage lock should not be poisoned")
            .get(ticker)
            .cloned())
    }

    fn tickers(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entities
            .lock()
            .expect("entity storage lock should not be poisoned")
            .keys()
            .cloned()
            .collect())
    }
}

/// Opens the storage of one run.
pub trait EntityStorageFactory: Send + Sync {
    fn open(&self, industry_id: &str, datapack_id: &str) -> Result<Arc<dyn EntityStorage>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryStorageFactory {
    root: PathBuf,
}

impl DirectoryStorageFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl EntityStorageFactory for DirectoryStorageFactory {
    fn open(&self, industry_id: &str, datapack_id: &str) -> Result<Arc<dyn EntityStorage>, StorageError> {
        Ok(Arc::new(DirectoryStorage::for_run(&self.root, industry_id, datapack_id)?))
    }
}

/// Hands out one [`InMemoryStorage`] per datapack id and keeps it for inspection.
#[derive(Debug, Default)]
pub struct InMemoryStorageFactory {
    opened: Mutex<BTreeMap<String, Arc<InMemoryStorage>>>,
}

impl InMemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn storage(&self, datapack_id: &str) -> Option<Arc<InMemoryStorage>> {
        self.opened
            .lock()
            .expect("storage factory lock should not be poisoned")
            .get(datapack_id)
            .cloned()
    }
}

impl EntityStorageFactory for InMemoryStorageFactory {
    fn open(&self, industry_id: &str, datapack_id: &str) -> Result<Arc<dyn EntityStorage>, StorageError> {
        validate_key(industry_id)?;
        validate_key(datapack_id)?;
        let storage = Arc::clone(
            self.opened
                .lock()
                .expect("storage factory lock should not be poisoned")
                .entry(datapack_id.to_owned())
                .or_default(),
        );
        Ok(storage)
    }
}
