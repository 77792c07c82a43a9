//! # Datapack Core
//!
//! Collection core for industry datapacks: structured financial datapoints
//! gathered from public web sources with a provenance record for every value.
//!
//! ## Overview
//!
//! - **Domain types** for datapoints, provenance, source locators and runs
//! - **Fetch client** with per-domain throttling and block detection
//! - **Source adapters** tried in priority order by the adapter chain
//! - **Orchestrator** that drives one run per industry in batches
//! - **Gate validator** that decides whether a datapack is usable
//! - **Streaming assembler** that writes the datapack without holding it in memory
//! - **Alert dispatcher** for operational notifications
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Provider adapters (Yahoo, StockAnalysis, Reuters, EIA, rig count) |
//! | [`alerts`] | Alert events and notifiers |
//! | [`assembler`] | Streaming datapack assembly and memory budget |
//! | [`block_detector`] | Classification of denied responses |
//! | [`candidates`] | Provider identifiers and source candidate lists |
//! | [`chain`] | Ordered fallback across source candidates |
//! | [`config`] | Collector and industry configuration |
//! | [`domain`] | Datapoints, datapacks, runs and timestamps |
//! | [`error`] | Core error types |
//! | [`fetch`] | Throttled, block-aware HTTP fetching |
//! | [`gate`] | Schema and semantic datapack validation |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`orchestrator`] | Collection runs |
//! | [`persistence`] | Run, block-state and blocked-source stores |
//! | [`registry`] | Blocked source registry |
//! | [`storage`] | Per-entity intermediate storage |
//! | [`throttle`] | Per-domain pacing and backoff |
//! | [`url_policy`] | Allowed domain policy and URL sanitizing |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use datapack_core::{CollectRequest, CollectionOrchestrator};
//!
//! let result = orchestrator.collect(CollectRequest::new("oil-majors")).await?;
//! println!("{} -> {}", result.datapack_id, result.status);
//! ```

pub mod adapters;
pub mod alerts;
pub mod assembler;
pub mod block_detector;
pub mod candidates;
pub mod chain;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod http_client;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod storage;
pub mod throttle;
pub mod url_policy;

// Adapters
pub use adapters::{AdapterError, AdapterRegistry, SourceAdapter};

// Alerts
pub use alerts::{AlertDispatcher, AlertEvent, AlertNotifier, AlertSeverity, LogNotifier, SlackNotifier};

// Assembly
pub use assembler::{
    AssembledDatapack, AssemblyError, DatapackAssembler, MemoryBudget, MemoryGauge,
    ProcessMemoryGauge, ScriptedMemoryGauge,
};

// Fetching
pub use block_detector::BlockReason;
pub use candidates::{ProviderId, SourceCandidate, SourceCandidateFactory};
pub use chain::{AdapterChain, AttemptOutcome, ChainError, ChainOutcome, FetchMemo, SourceAttempt};
pub use fetch::{FetchClient, FetchError, FetchRequest, FetchResult};
pub use http_client::{
    HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};
pub use throttle::{BlockStateStore, DomainBlockState, DomainThrottle, InMemoryBlockStateStore, ThrottlePolicy};
pub use url_policy::AllowedDomainPolicy;

// Configuration
pub use config::{
    CollectorConfig, CompanyConfig, ConfigError, IndustryConfig, IndustryConfigProvider,
    JsonIndustryConfigProvider, StaticIndustryConfigProvider,
};

// Domain models
pub use domain::{
    CollectionError, CollectionLog, CollectionMethod, CollectionRun, CollectionStatus, CompanyData,
    DataPoint, DatapackDocument, DatapointKey, MacroData, Provenance, Section, Severity,
    SourceLocator, UtcDateTime,
};

// Error types
pub use error::{CollectError, StoreError, ValidationError};

// Gate
pub use gate::{GateContext, GateFinding, GateResult, GateValidator, SemanticRules};

// Orchestration
pub use orchestrator::{CollectRequest, CollectResult, CollectionOrchestrator, CollectorServices};

// Stores
pub use persistence::{DuckDbStore, InMemoryRunStore, RunStore, StoredRun};
pub use registry::{BlockedSourceRegistry, InMemoryBlockedSourceRegistry};
pub use storage::{
    DirectoryStorage, DirectoryStorageFactory, EntityStorage, EntityStorageFactory,
    InMemoryStorage, InMemoryStorageFactory, StorageError,
};

// Warehouse (re-exported from datapack-warehouse)
pub use datapack_warehouse::{Warehouse, WarehouseConfig, WarehouseError};
