use thiserror::Error;

use datapack_warehouse::WarehouseError;

/// Validation and contract errors exposed by `datapack-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{method} datapoint requires a non-empty source_url")]
    MissingSourceUrl { method: &'static str },
    #[error("{method} datapoint requires a source_locator")]
    MissingSourceLocator { method: &'static str },
    #[error("not_found datapoint requires at least one attempted source")]
    MissingAttemptedSources,
    #[error("not_found datapoint must not carry a value")]
    NotFoundWithValue,
    #[error("derived datapoint requires a non-empty derived_from list")]
    MissingDerivedFrom,
    #[error("derived datapoint requires a formula")]
    MissingFormula,
    #[error("cache datapoint requires a cache_source")]
    MissingCacheSource,
    #[error("cache datapoint requires cache_age_days")]
    MissingCacheAge,

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("currency must be a 3-letter uppercase ISO code: '{value}'")]
    InvalidCurrency { value: String },
    #[error("unknown unit '{value}'")]
    InvalidUnit { value: String },
    #[error("unknown collection method '{value}'")]
    InvalidMethod { value: String },
    #[error("source locator selector cannot be empty")]
    EmptySelector,
    #[error("unknown locator type '{value}'")]
    InvalidLocatorType { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("date must be YYYY-MM-DD: '{value}'")]
    InvalidDate { value: String },

    #[error("datapoint key must look like 'section.name': '{value}'")]
    InvalidDatapointKey { value: String },
    #[error("unknown provider '{value}'")]
    InvalidProvider { value: String },
    #[error("unknown status '{value}'")]
    InvalidStatus { value: String },
    #[error("unknown severity '{value}'")]
    InvalidSeverity { value: String },

    #[error("run status cannot move from {from} to {to}")]
    InvalidStatusTransition { from: &'static str, to: &'static str },

    #[error("industry '{industry_id}' has no companies")]
    NoCompanies { industry_id: String },
    #[error("focal ticker '{ticker}' is not a configured company")]
    UnknownFocalTicker { ticker: String },
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Failure of a durable store behind one of the core's store traits.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("store record is corrupt: {0}")]
    Corrupt(String),
}

impl From<ValidationError> for StoreError {
    fn from(error: ValidationError) -> Self {
        Self::Corrupt(error.to_string())
    }
}

/// Top-level error type for a collection run.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    Assembly(#[from] crate::assembler::AssemblyError),

    #[error("failed to read back datapack {path}: {source}")]
    ReadBack {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
