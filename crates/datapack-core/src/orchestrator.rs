//! # Collection Orchestrator
//!
//! Drives one collection run for an industry:
//!
//! 1. resolve focal companies and persist a `pending` run, then mark it `running`;
//! 2. collect macro indicators, then companies in fixed-size batches, writing
//!    each company to intermediate storage as soon as it is collected;
//! 3. assemble the datapack and run the gate over the file that was written;
//! 4. persist findings, alert on a failed gate and stamp the terminal status.
//!
//! Work inside a run is strictly sequential. A store failure is fatal: the
//! run is marked `failed` and the error is returned to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::adapters::AdapterRegistry;
use crate::alerts::{AlertDispatcher, AlertEvent};
use crate::assembler::{AssembledDatapack, AssemblyInput, DatapackAssembler, MemoryGauge};
use crate::candidates::{SourceCandidate, SourceCandidateFactory};
use crate::chain::{AdapterChain, ChainError, FetchMemo};
use crate::config::{CollectorConfig, CompanyConfig, IndustryConfig, IndustryConfigProvider, MetricRequirement};
use crate::domain::{
    CollectionError, CollectionLog, CollectionRun, CollectionStatus, CompanyData, DatapointKey,
    MacroData, Severity, UtcDateTime,
};
use crate::error::CollectError;
use crate::fetch::FetchClient;
use crate::gate::{GateContext, GateResult, GateValidator};
use crate::http_client::HttpClient;
use crate::persistence::RunStore;
use crate::registry::BlockedSourceRegistry;
use crate::storage::{EntityStorage, EntityStorageFactory};
use crate::throttle::{BlockStateStore, DomainThrottle};

/// Collaborators a run needs beyond its settings.
pub struct CollectorServices {
    pub industries: Arc<dyn IndustryConfigProvider>,
    pub http: Arc<dyn HttpClient>,
    pub block_states: Arc<dyn BlockStateStore>,
    pub blocked_sources: Arc<dyn BlockedSourceRegistry>,
    pub runs: Arc<dyn RunStore>,
    pub storage: Arc<dyn EntityStorageFactory>,
    pub memory: Arc<dyn MemoryGauge>,
    pub alerts: Arc<AlertDispatcher>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectRequest {
    pub industry_id: String,
    pub actor_id: Option<String>,
    /// Overrides the configured batch size.
    pub batch_size: Option<usize>,
    /// Overrides the configured memory management switch.
    pub memory_management: Option<bool>,
    /// Focal tickers in addition to the configured ones.
    pub focal_tickers: Vec<String>,
}

impl CollectRequest {
    pub fn new(industry_id: impl Into<String>) -> Self {
        Self {
            industry_id: industry_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectResult {
    pub run_id: String,
    pub industry_id: String,
    pub datapack_id: String,
    pub status: CollectionStatus,
    pub gate_result: GateResult,
    pub errors: Vec<CollectionError>,
    pub company_statuses: BTreeMap<String, CollectionStatus>,
    pub macro_status: CollectionStatus,
    pub datapack: AssembledDatapack,
}

/// Terminal status of a run whose datapack was assembled.
///
/// A failed gate fails the run. A passing gate yields `partial` when the
/// share of failed companies exceeds `partial_failure_ratio`.
pub fn decide_run_status(
    gate_passed: bool,
    failed_companies: usize,
    total_companies: usize,
    partial_failure_ratio: f64,
) -> CollectionStatus {
    if !gate_passed {
        return CollectionStatus::Failed;
    }
    if total_companies > 0 && failed_companies as f64 / total_companies as f64 > partial_failure_ratio {
        return CollectionStatus::Partial;
    }
    CollectionStatus::Complete
}

/// Status of one entity from its required datapoints.
pub fn entity_status(required: usize, missing: usize) -> CollectionStatus {
    if required > 0 && missing >= required {
        CollectionStatus::Failed
    } else if missing > 0 {
        CollectionStatus::Partial
    } else {
        CollectionStatus::Complete
    }
}

#[derive(Debug, Clone, Copy)]
struct RunSettings {
    batch_size: usize,
    memory_management: bool,
    partial_failure_ratio: f64,
}

struct EntityOutcome<T> {
    data: T,
    status: CollectionStatus,
    errors: Vec<CollectionError>,
}

pub struct CollectionOrchestrator {
    industries: Arc<dyn IndustryConfigProvider>,
    chain: AdapterChain,
    candidates: SourceCandidateFactory,
    runs: Arc<dyn RunStore>,
    storage: Arc<dyn EntityStorageFactory>,
    memory: Arc<dyn MemoryGauge>,
    alerts: Arc<AlertDispatcher>,
    gate: GateValidator,
    assembler: DatapackAssembler,
    settings: RunSettings,
}

impl CollectionOrchestrator {
    pub fn new(config: &CollectorConfig, services: CollectorServices) -> Self {
        let throttle = DomainThrottle::new(config.throttle_policy(), services.block_states);
        let fetcher = Arc::new(FetchClient::new(
            services.http,
            throttle,
            config.domain_policy(),
            Arc::clone(&services.alerts),
        ));
        let chain = AdapterChain::new(fetcher, AdapterRegistry::builtin(), services.blocked_sources)
            .with_fetch_timeout(config.fetch_timeout());

        Self {
            industries: services.industries,
            chain,
            candidates: config.candidate_factory(),
            runs: services.runs,
            storage: services.storage,
            memory: Arc::clone(&services.memory),
            alerts: services.alerts,
            gate: GateValidator::new(config.macro_staleness_days)
                .with_semantic_rules(config.semantic_rules()),
            assembler: DatapackAssembler::new(config.output_dir(), services.memory, config.memory_budget()),
            settings: RunSettings {
                batch_size: config.batch_size,
                memory_management: config.memory_management,
                partial_failure_ratio: config.partial_failure_ratio,
            },
        }
    }

    pub async fn collect(&self, request: CollectRequest) -> Result<CollectResult, CollectError> {
        let industry = self.industries.industry(&request.industry_id)?;
        industry.validate()?;
        let focals = industry.resolve_focals(&request.focal_tickers)?;
        let settings = RunSettings {
            batch_size: request.batch_size.unwrap_or(self.settings.batch_size).max(1),
            memory_management: request
                .memory_management
                .unwrap_or(self.settings.memory_management),
            ..self.settings
        };

        let company_count = u32::try_from(industry.companies.len()).unwrap_or(u32::MAX);
        let mut run = CollectionRun::pending(&industry.id, company_count, UtcDateTime::now());
        self.runs.insert_run(&run)?;
        run.start()?;
        self.runs.update_run(&run)?;
        info!(
            run_id = %run.id,
            industry = %industry.id,
            datapack_id = %run.datapack_id,
            actor = request.actor_id.as_deref().unwrap_or("system"),
            company_count,
            batch_size = settings.batch_size,
            memory_management = settings.memory_management,
            focal_tickers = ?focals,
            "starting industry collection"
        );

        match self.execute(&mut run, &industry, &focals, settings).await {
            Ok(result) => Ok(result),
            Err(failure) => {
                error!(run_id = %run.id, industry = %industry.id, error = %failure, "collection run failed");
                self.mark_failed(&mut run, &failure);
                Err(failure)
            }
        }
    }

    async fn execute(
        &self,
        run: &mut CollectionRun,
        industry: &IndustryConfig,
        focals: &BTreeSet<String>,
        settings: RunSettings,
    ) -> Result<CollectResult, CollectError> {
        let attempts_before = self.chain.fetcher().attempt_count();
        let storage = self.storage.open(&industry.id, &run.datapack_id)?;
        let metrics = industry.metrics()?;
        let mut errors = Vec::new();

        let macro_outcome = self.collect_macro(industry).await?;
        errors.extend(macro_outcome.errors);
        let macro_data = macro_outcome.data;
        let macro_status = macro_outcome.status;

        let mut company_statuses = BTreeMap::new();
        let total_batches = industry.companies.len().div_ceil(settings.batch_size);
        for (index, batch) in industry.companies.chunks(settings.batch_size).enumerate() {
            info!(
                run_id = %run.id,
                batch = index + 1,
                total_batches,
                companies_in_batch = batch.len(),
                memory_bytes = self.memory.usage_bytes().unwrap_or(0),
                "processing batch"
            );
            for company in batch {
                let focal = focals.contains(&company.ticker);
                let mut outcome = self.collect_company(company, &metrics, focal).await?;
                if let Err(failure) = storage.write(&outcome.data) {
                    warn!(ticker = %company.ticker, error = %failure, "failed to write intermediate payload");
                    outcome.status = CollectionStatus::Failed;
                    outcome.errors.push(entity_error(
                        focal,
                        "INTERMEDIATE_WRITE_FAILED",
                        failure.to_string(),
                        &company.ticker,
                    ));
                }
                self.report_entity(company, focal, &mut outcome);
                errors.append(&mut outcome.errors);
                company_statuses.insert(company.ticker.clone(), outcome.status);
            }

            tally_companies(run, &company_statuses);
            self.runs.update_run(run)?;
            if settings.memory_management {
                self.reclaim_memory();
            }
        }

        let completed_at = UtcDateTime::now();
        let collection_log = CollectionLog {
            started_at: run.started_at,
            completed_at,
            duration_seconds: run.started_at.until(completed_at).as_secs(),
            company_statuses: company_statuses.clone(),
            macro_status,
            total_attempts: self.chain.fetcher().attempt_count() - attempts_before,
        };
        let datapack = self.assembler.assemble(
            AssemblyInput {
                industry_id: &industry.id,
                datapack_id: &run.datapack_id,
                collected_at: completed_at,
                macro_data: &macro_data,
                collection_log: &collection_log,
            },
            storage.as_ref(),
        )?;

        let gate_result = self.validate_datapack(industry, focals, &datapack, completed_at)?;
        errors.extend(gate_result.collection_errors());
        if !gate_result.passed {
            let first_error = gate_result.first_error().map(|finding| finding.message.as_str());
            self.alerts
                .dispatch(&AlertEvent::gate_failed(
                    &industry.id,
                    &run.datapack_id,
                    gate_result.errors.len(),
                    first_error,
                ))
                .await;
        }

        let failed = count_status(&company_statuses, CollectionStatus::Failed) as usize;
        let status = decide_run_status(
            gate_result.passed,
            failed,
            company_statuses.len(),
            settings.partial_failure_ratio,
        );

        self.runs.append_errors(&run.id, &errors)?;
        run.gate_passed = Some(gate_result.passed);
        run.error_count = count_severity(&errors, Severity::Error);
        run.warning_count = count_severity(&errors, Severity::Warning);
        run.file_path = Some(datapack.path.display().to_string());
        run.file_size_bytes = Some(datapack.size_bytes);
        run.finish(status, UtcDateTime::now())?;
        self.runs.update_run(run)?;

        info!(
            run_id = %run.id,
            industry = %industry.id,
            datapack_id = %run.datapack_id,
            status = %status,
            gate_passed = gate_result.passed,
            errors = run.error_count,
            warnings = run.warning_count,
            duration_seconds = run.duration_seconds.unwrap_or(0),
            "industry collection complete"
        );

        Ok(CollectResult {
            run_id: run.id.clone(),
            industry_id: industry.id.clone(),
            datapack_id: run.datapack_id.clone(),
            status,
            gate_result,
            errors,
            company_statuses,
            macro_status,
            datapack,
        })
    }

    async fn collect_macro(&self, industry: &IndustryConfig) -> Result<EntityOutcome<MacroData>, CollectError> {
        let mut memo = FetchMemo::new();
        let mut data = MacroData::default();
        let mut errors = Vec::new();
        let (mut required, mut missing) = (0, 0);

        for (key, is_required) in industry.macro_keys()? {
            let candidates = self.candidates.for_macro(key.name());
            let found = match self.chain.collect(&key, &candidates, &mut memo).await {
                Ok(outcome) => {
                    let found = outcome.datapoint.is_found();
                    data.indicators.insert(key.name().to_owned(), outcome.datapoint);
                    found
                }
                Err(ChainError::NoCandidates { key: missing_key }) => {
                    errors.push(
                        CollectionError::new(
                            severity_for(is_required),
                            "NO_SOURCE",
                            format!("no source can provide {missing_key}"),
                        )
                        .at_path(format!("macro.{}", key.name())),
                    );
                    false
                }
                Err(ChainError::Store(failure)) => return Err(failure.into()),
            };

            if is_required {
                required += 1;
                if !found {
                    missing += 1;
                    errors.push(
                        CollectionError::new(
                            Severity::Error,
                            "DATAPOINT_NOT_FOUND",
                            format!("required macro indicator {} was not found", key.name()),
                        )
                        .at_path(format!("macro.{}", key.name())),
                    );
                }
            }
        }

        Ok(EntityOutcome {
            data,
            status: entity_status(required, missing),
            errors,
        })
    }

    async fn collect_company(
        &self,
        company: &CompanyConfig,
        metrics: &[(DatapointKey, &MetricRequirement)],
        focal: bool,
    ) -> Result<EntityOutcome<CompanyData>, CollectError> {
        let ticker = company.ticker.as_str();
        let candidates: Vec<SourceCandidate> = self
            .candidates
            .for_ticker(ticker, company.listing_exchange.as_deref());
        let mut memo = FetchMemo::new();
        let mut data = CompanyData::new(ticker, &company.name);
        data.listing_exchange = company.listing_exchange.clone();
        let mut errors = Vec::new();
        let (mut required, mut missing) = (0, 0);

        for (key, metric) in metrics {
            let is_required = metric.is_required_for(focal);
            let path = format!("companies.{ticker}.{key}");
            let found = match self.chain.collect(key, &candidates, &mut memo).await {
                Ok(outcome) => {
                    let found = outcome.datapoint.is_found();
                    debug!(ticker, key = %key, found, attempts = outcome.attempts.len(), "datapoint collected");
                    data.insert(key, outcome.datapoint);
                    found
                }
                Err(ChainError::NoCandidates { key: missing_key }) => {
                    errors.push(entity_error(
                        focal && is_required,
                        "NO_SOURCE",
                        format!("no source can provide {missing_key} for {ticker}"),
                        ticker,
                    )
                    .at_path(path.clone()));
                    false
                }
                Err(ChainError::Store(failure)) => return Err(failure.into()),
            };

            if is_required {
                required += 1;
                if !found {
                    missing += 1;
                    errors.push(
                        entity_error(
                            focal,
                            "DATAPOINT_NOT_FOUND",
                            format!("required metric {} was not found for {ticker}", key.name()),
                            ticker,
                        )
                        .at_path(path),
                    );
                }
            }
        }

        Ok(EntityOutcome {
            data,
            status: entity_status(required, missing),
            errors,
        })
    }

    fn report_entity(&self, company: &CompanyConfig, focal: bool, outcome: &mut EntityOutcome<CompanyData>) {
        let ticker = company.ticker.as_str();
        match outcome.status {
            CollectionStatus::Failed if focal => {
                error!(ticker, "focal company collection failed");
            }
            CollectionStatus::Failed => {
                warn!(ticker, "peer company collection failed");
            }
            CollectionStatus::Partial => {
                warn!(ticker, focal, "company collected partially");
            }
            _ => {
                debug!(ticker, focal, "company collected");
                return;
            }
        }
        if outcome.status == CollectionStatus::Failed {
            outcome.errors.push(entity_error(
                focal,
                "COMPANY_FAILED",
                format!("collection failed for {ticker}"),
                ticker,
            ));
        }
    }

    fn validate_datapack(
        &self,
        industry: &IndustryConfig,
        focals: &BTreeSet<String>,
        datapack: &AssembledDatapack,
        now: UtcDateTime,
    ) -> Result<GateResult, CollectError> {
        let file = File::open(&datapack.path).map_err(|source| CollectError::ReadBack {
            path: datapack.path.clone(),
            source,
        })?;
        let document: Value = serde_json::from_reader(BufReader::new(file))?;
        Ok(self.gate.validate(
            &document,
            GateContext {
                industry,
                focals,
                now,
            },
        ))
    }

    fn reclaim_memory(&self) {
        let before = self.memory.usage_bytes();
        self.memory.reclaim();
        let after = self.memory.usage_bytes();
        if let (Some(before), Some(after)) = (before, after) {
            if after < before {
                info!(freed_bytes = before - after, current_bytes = after, "memory reclaimed");
            }
        }
    }

    /// Best effort: the run may be failing because the store itself is down.
    fn mark_failed(&self, run: &mut CollectionRun, failure: &CollectError) {
        let fatal = CollectionError::new(Severity::Error, "COLLECTION_FATAL", failure.to_string());
        if let Err(store_error) = self.runs.append_errors(&run.id, &[fatal]) {
            warn!(run_id = %run.id, error = %store_error, "failed to record fatal error");
        }
        if run.status().is_terminal() {
            return;
        }
        run.error_count += 1;
        if let Err(invalid) = run.finish(CollectionStatus::Failed, UtcDateTime::now()) {
            warn!(run_id = %run.id, error = %invalid, "run could not be marked failed");
            return;
        }
        if let Err(store_error) = self.runs.update_run(run) {
            warn!(run_id = %run.id, error = %store_error, "failed to persist failed run");
        }
    }

    pub fn runs(&self) -> &dyn RunStore {
        self.runs.as_ref()
    }

    pub fn storage(&self) -> &dyn EntityStorageFactory {
        self.storage.as_ref()
    }

    /// Blocked-source registry shared with the adapter chain.
    pub fn blocked_sources(&self) -> &dyn BlockedSourceRegistry {
        self.chain.registry()
    }

    pub fn throttle(&self) -> &DomainThrottle {
        self.chain.fetcher().throttle()
    }
}

fn severity_for(error: bool) -> Severity {
    if error {
        Severity::Error
    } else {
        Severity::Warning
    }
}

/// Errors for focal companies, warnings for peers.
fn entity_error(focal: bool, code: &str, message: String, ticker: &str) -> CollectionError {
    CollectionError::new(severity_for(focal), code, message).for_ticker(ticker)
}

/// Per-status company counts of the run so far.
fn tally_companies(run: &mut CollectionRun, statuses: &BTreeMap<String, CollectionStatus>) {
    run.companies_success = count_status(statuses, CollectionStatus::Complete);
    run.companies_partial = count_status(statuses, CollectionStatus::Partial);
    run.companies_failed = count_status(statuses, CollectionStatus::Failed);
}

fn count_status(statuses: &BTreeMap<String, CollectionStatus>, status: CollectionStatus) -> u32 {
    let count = statuses.values().filter(|candidate| **candidate == status).count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

fn count_severity(errors: &[CollectionError], severity: Severity) -> u32 {
    let count = errors.iter().filter(|error| error.severity == severity).count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use super::*;
    use crate::alerts::{AlertNotifier, AlertSeverity};
    use crate::assembler::ScriptedMemoryGauge;
    use crate::config::{DataRequirements, MacroRequirement, RequiredScope, StaticIndustryConfigProvider, ThrottleSettings};
    use crate::http_client::{HttpResponse, ScriptedHttpClient};
    use crate::persistence::InMemoryRunStore;
    use crate::registry::InMemoryBlockedSourceRegistry;
    use crate::storage::InMemoryStorageFactory;
    use crate::throttle::InMemoryBlockStateStore;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Recording {
        kinds: Mutex<Vec<String>>,
    }

    impl AlertNotifier for Recording {
        fn supports(&self, _severity: AlertSeverity) -> bool {
            true
        }

        fn notify<'a>(&'a self, event: &'a AlertEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            self.kinds
                .lock()
                .expect("recording should not be poisoned")
                .push(event.kind.clone());
            Box::pin(async {})
        }
    }

    struct Harness {
        _output: TempDir,
        http: Arc<ScriptedHttpClient>,
        runs: Arc<InMemoryRunStore>,
        storage: Arc<InMemoryStorageFactory>,
        memory: Arc<ScriptedMemoryGauge>,
        alerts: Arc<Recording>,
        orchestrator: CollectionOrchestrator,
    }

    fn company(ticker: &str, exchange: &str) -> CompanyConfig {
        CompanyConfig {
            ticker: ticker.to_owned(),
            name: format!("{ticker} plc"),
            listing_exchange: Some(exchange.to_owned()),
        }
    }

    fn industry(companies: Vec<CompanyConfig>) -> IndustryConfig {
        IndustryConfig {
            id: "oil-majors".to_owned(),
            name: "Oil Majors".to_owned(),
            companies,
            focal_tickers: vec!["SHEL".to_owned()],
            requirements: DataRequirements {
                valuation: vec![MetricRequirement {
                    key: "market_cap".to_owned(),
                    required: true,
                    required_scope: RequiredScope::All,
                }],
                financials: Vec::new(),
                operational: Vec::new(),
            },
            macro_indicators: vec![MacroRequirement {
                key: "brent_crude".to_owned(),
                required: true,
            }],
        }
    }

    fn harness(industry: IndustryConfig) -> Harness {
        let output = tempdir().expect("tempdir");
        let config = CollectorConfig {
            home: output.path().to_path_buf(),
            throttle: ThrottleSettings {
                default_interval_ms: 0,
                domain_intervals_ms: BTreeMap::new(),
            },
            batch_size: 2,
            memory_management: true,
            ..CollectorConfig::default()
        };
        let http = Arc::new(ScriptedHttpClient::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let storage = Arc::new(InMemoryStorageFactory::new());
        let memory = Arc::new(ScriptedMemoryGauge::new(vec![64 * 1024 * 1024]));
        let alerts = Arc::new(Recording::default());
        let orchestrator = CollectionOrchestrator::new(
            &config,
            CollectorServices {
                industries: Arc::new(StaticIndustryConfigProvider::new([industry])),
                http: http.clone(),
                block_states: Arc::new(InMemoryBlockStateStore::new()),
                blocked_sources: Arc::new(InMemoryBlockedSourceRegistry::new()),
                runs: runs.clone(),
                storage: storage.clone(),
                memory: memory.clone(),
                alerts: Arc::new(AlertDispatcher::default().with_notifier(alerts.clone())),
            },
        );
        Harness {
            _output: output,
            http,
            runs,
            storage,
            memory,
            alerts,
            orchestrator,
        }
    }

    fn script_quote(h: &Harness, ticker: &str, exchange: &str, market_cap: &str) {
        let url = SourceCandidateFactory::new().for_ticker(ticker, Some(exchange))[0].url.clone();
        h.http.push(
            url,
            Ok(HttpResponse::ok_html(format!(
                r#"<table><tr><td>Market Cap</td><td data-test="MARKET_CAP-value">{market_cap}</td></tr></table>"#
            ))),
        );
    }

    fn script_brent(h: &Harness) {
        let url = SourceCandidateFactory::new().for_macro("brent_crude")[0].url.clone();
        h.http.push(
            url,
            Ok(HttpResponse::ok_html(
                r#"<div><fin-streamer data-field="regularMarketPrice">74.30</fin-streamer></div>"#,
            )),
        );
    }

    #[test]
    fn failed_gate_fails_the_run() {
        assert_eq!(decide_run_status(false, 0, 4, 0.5), CollectionStatus::Failed);
    }

    #[test]
    fn peer_failures_above_ratio_make_the_run_partial() {
        assert_eq!(decide_run_status(true, 1, 4, 0.5), CollectionStatus::Complete);
        assert_eq!(decide_run_status(true, 2, 4, 0.5), CollectionStatus::Complete);
        assert_eq!(decide_run_status(true, 3, 4, 0.5), CollectionStatus::Partial);
        assert_eq!(decide_run_status(true, 0, 0, 0.5), CollectionStatus::Complete);
    }

    #[test]
    fn entity_status_follows_required_coverage() {
        assert_eq!(entity_status(3, 0), CollectionStatus::Complete);
        assert_eq!(entity_status(3, 1), CollectionStatus::Partial);
        assert_eq!(entity_status(3, 3), CollectionStatus::Failed);
        assert_eq!(entity_status(0, 0), CollectionStatus::Complete);
    }

    #[test]
    fn partial_companies_are_counted_apart_from_failed_ones() {
        let mut run = CollectionRun::pending("oil-majors", 4, UtcDateTime::now());
        let statuses = BTreeMap::from([
            ("SHEL".to_owned(), CollectionStatus::Complete),
            ("BP.L".to_owned(), CollectionStatus::Partial),
            ("XOM".to_owned(), CollectionStatus::Partial),
            ("CVX".to_owned(), CollectionStatus::Failed),
        ]);

        tally_companies(&mut run, &statuses);

        assert_eq!(run.companies_success, 1);
        assert_eq!(run.companies_partial, 2);
        assert_eq!(run.companies_failed, 1);
    }

    #[tokio::test]
    async fn fully_collected_industry_completes_and_persists_the_run() {
        let h = harness(industry(vec![company("SHEL", "LSE"), company("XOM", "NYSE")]));
        script_quote(&h, "SHEL", "LSE", "180.5B");
        script_quote(&h, "XOM", "NYSE", "472.19B");
        script_brent(&h);

        let result = h
            .orchestrator
            .collect(CollectRequest::new("oil-majors"))
            .await
            .expect("collect");

        assert_eq!(result.status, CollectionStatus::Complete);
        assert!(result.gate_result.passed, "{:?}", result.gate_result.errors);
        assert_eq!(result.macro_status, CollectionStatus::Complete);
        assert_eq!(result.datapack.company_count, 2);
        assert!(result.datapack.path.is_file());

        let stored = h.runs.run(&result.run_id).expect("store").expect("run");
        assert_eq!(stored.run.status(), CollectionStatus::Complete);
        assert_eq!(stored.run.companies_success, 2);
        assert_eq!(stored.run.gate_passed, Some(true));
        assert_eq!(stored.run.file_size_bytes, Some(result.datapack.size_bytes));
        assert!(stored.run.completed_at().is_some());

        let intermediate = h.storage.storage(&result.datapack_id).expect("opened");
        assert_eq!(intermediate.len(), 2);
        assert!(h.memory.reclaim_count() >= 1);
        assert!(h.alerts.kinds.lock().expect("recording").is_empty());
    }

    #[tokio::test]
    async fn mostly_failed_peers_make_a_passing_run_partial() {
        let h = harness(industry(vec![
            company("SHEL", "LSE"),
            company("XOM", "NYSE"),
            company("CVX", "NYSE"),
        ]));
        script_quote(&h, "SHEL", "LSE", "180.5B");
        script_brent(&h);

        let result = h
            .orchestrator
            .collect(CollectRequest::new("oil-majors"))
            .await
            .expect("collect");

        assert!(result.gate_result.passed, "{:?}", result.gate_result.errors);
        assert_eq!(result.status, CollectionStatus::Partial);
        assert_eq!(result.company_statuses["XOM"], CollectionStatus::Failed);
        assert!(result
            .errors
            .iter()
            .filter(|error| error.ticker.as_deref() == Some("CVX"))
            .all(|error| error.severity == Severity::Warning));

        let stored = h.runs.run(&result.run_id).expect("store").expect("run");
        assert_eq!(stored.run.companies_failed, 2);
        assert_eq!(stored.run.error_count, 0);
        assert!(stored.run.warning_count > 0);
        assert_eq!(stored.errors.len(), result.errors.len());
    }

    #[tokio::test]
    async fn missing_focal_data_fails_the_gate_and_alerts() {
        let h = harness(industry(vec![company("SHEL", "LSE"), company("XOM", "NYSE")]));
        script_quote(&h, "XOM", "NYSE", "472.19B");
        script_brent(&h);

        let result = h
            .orchestrator
            .collect(CollectRequest::new("oil-majors"))
            .await
            .expect("collect");

        assert!(!result.gate_result.passed);
        assert_eq!(result.status, CollectionStatus::Failed);
        assert!(result.datapack.path.is_file());
        assert_eq!(
            h.alerts.kinds.lock().expect("recording").as_slice(),
            ["GATE_FAILED".to_owned()]
        );
        let stored = h.runs.run(&result.run_id).expect("store").expect("run");
        assert_eq!(stored.run.status(), CollectionStatus::Failed);
        assert_eq!(stored.run.gate_passed, Some(false));
    }

    #[tokio::test]
    async fn unknown_focal_ticker_is_rejected_before_a_run_exists() {
        let h = harness(industry(vec![company("SHEL", "LSE")]));
        let request = CollectRequest {
            focal_tickers: vec!["BP".to_owned()],
            ..CollectRequest::new("oil-majors")
        };

        let error = h.orchestrator.collect(request).await.expect_err("rejected");
        assert!(matches!(error, CollectError::Validation(_)));
        assert!(h.runs.recent_runs(10).expect("store").is_empty());
        assert!(h.http.requests().is_empty());
    }
}
