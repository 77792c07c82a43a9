//! Behavior-driven tests for collection runs
//!
//! These tests verify HOW a run moves from source candidates to a validated
//! datapack: fallback across providers, documented absences, gate verdicts
//! and the run record left in the store.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use datapack_core::config::ThrottleSettings;
use datapack_core::gate::codes;
use datapack_core::{
    AdapterChain, AdapterRegistry, AlertDispatcher, AllowedDomainPolicy, AttemptOutcome,
    BlockedSourceRegistry, CollectError, CollectRequest, CollectionMethod, CollectionOrchestrator,
    CollectionStatus, CollectorConfig, CollectorServices, DatapackDocument, DatapointKey,
    DirectoryStorageFactory, DomainThrottle, DuckDbStore, FetchClient, FetchMemo, HttpResponse,
    InMemoryBlockedSourceRegistry, JsonIndustryConfigProvider, Provenance, RunStore,
    ScriptedHttpClient, ScriptedMemoryGauge, SourceCandidateFactory, ThrottlePolicy, UtcDateTime,
    Warehouse,
};
use std::collections::BTreeMap;
use tempfile::TempDir;

const INDUSTRY: &str = r#"{
    "id": "oil-majors",
    "name": "Oil Majors",
    "companies": [
        {"ticker": "SHEL", "name": "Shell plc", "listing_exchange": "LSE"},
        {"ticker": "XOM", "name": "Exxon Mobil", "listing_exchange": "NYSE"}
    ],
    "focal_tickers": ["SHEL"],
    "requirements": {
        "valuation": [
            {"key": "market_cap", "required": true},
            {"key": "fwd_pe", "required": true, "required_scope": "focal"}
        ]
    },
    "macro_indicators": [{"key": "brent_crude", "required": true}]
}"#;

struct Deployment {
    home: TempDir,
    http: Arc<ScriptedHttpClient>,
    store: Arc<DuckDbStore>,
    config: CollectorConfig,
    orchestrator: CollectionOrchestrator,
}

fn deployment() -> Deployment {
    let home = tempfile::tempdir().expect("tempdir");
    let industry_path = home.path().join("oil-majors.json");
    fs::write(&industry_path, INDUSTRY).expect("industry file");

    let config = CollectorConfig {
        home: home.path().to_path_buf(),
        throttle: ThrottleSettings {
            default_interval_ms: 0,
            domain_intervals_ms: BTreeMap::new(),
        },
        ..CollectorConfig::default()
    };
    let http = Arc::new(ScriptedHttpClient::new());
    let store = Arc::new(DuckDbStore::new(Warehouse::open_in_memory().expect("warehouse")));
    let orchestrator = CollectionOrchestrator::new(
        &config,
        CollectorServices {
            industries: Arc::new(JsonIndustryConfigProvider::at(&industry_path)),
            http: http.clone(),
            block_states: store.clone(),
            blocked_sources: store.clone(),
            runs: store.clone(),
            storage: Arc::new(DirectoryStorageFactory::new(config.intermediate_dir())),
            memory: Arc::new(ScriptedMemoryGauge::new([32 * 1024 * 1024])),
            alerts: Arc::new(AlertDispatcher::default()),
        },
    );
    Deployment {
        home,
        http,
        store,
        config,
        orchestrator,
    }
}

fn quote_url(ticker: &str, exchange: &str) -> String {
    SourceCandidateFactory::new().for_ticker(ticker, Some(exchange))[0].url.clone()
}

fn script_quote(d: &Deployment, ticker: &str, exchange: &str, market_cap: &str, fwd_pe: &str) {
    d.http.push(
        quote_url(ticker, exchange),
        Ok(HttpResponse::ok_html(format!(
            r#"<table>
                 <tr><td>Market Cap</td><td data-test="MARKET_CAP-value">{market_cap}</td></tr>
                 <tr><td>Forward P/E</td><td data-test="FORWARD_PE-value">{fwd_pe}</td></tr>
               </table>"#
        ))),
    );
}

fn script_brent(d: &Deployment) {
    d.http.push(
        SourceCandidateFactory::new().for_macro("brent_crude")[0].url.clone(),
        Ok(HttpResponse::ok_html(
            r#"<div><fin-streamer data-field="regularMarketPrice">74.30</fin-streamer></div>"#,
        )),
    );
}

// =============================================================================
// Source fallback
// =============================================================================

#[tokio::test]
async fn when_the_primary_source_is_known_blocked_then_the_chain_falls_back_without_calling_it() {
    // Given: Yahoo's quote host is in the blocked source registry
    let http = Arc::new(ScriptedHttpClient::new());
    let registry = Arc::new(InMemoryBlockedSourceRegistry::new());
    registry
        .block("finance.yahoo.com", UtcDateTime::now().plus(Duration::from_secs(3_600)))
        .expect("block");
    let fetcher = FetchClient::new(
        http.clone(),
        DomainThrottle::in_memory(ThrottlePolicy::new(Duration::ZERO)),
        AllowedDomainPolicy::permissive(),
        Arc::new(AlertDispatcher::default()),
    );
    let chain = AdapterChain::new(Arc::new(fetcher), AdapterRegistry::builtin(), registry);
    let candidates = SourceCandidateFactory::new().for_ticker("XOM", Some("NYSE"));
    http.push(
        &candidates[2].url,
        Ok(HttpResponse::ok_html("<table><tr><td>Market Cap</td><td>$472.19B</td></tr></table>")),
    );

    // When: Market cap is collected
    let key = DatapointKey::valuation("market_cap").expect("key");
    let outcome = chain
        .collect(&key, &candidates, &mut FetchMemo::new())
        .await
        .expect("collect");

    // Then: The blocked host was skipped and the value carries its provenance
    assert_eq!(http.request_count(&candidates[0].url), 0);
    assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::SkippedBlocked);
    assert_eq!(outcome.datapoint.value(), Some(472.19));
    match outcome.datapoint.provenance() {
        Provenance::WebFetch {
            source_url,
            locator,
        } => {
            assert_eq!(source_url, &candidates[2].url);
            assert!(!locator.selector().is_empty());
        }
        other => panic!("unexpected provenance {other:?}"),
    }
}

#[tokio::test]
async fn when_every_source_fails_then_the_datapoint_documents_each_attempt() {
    // Given: No candidate answers with usable content
    let d = deployment();
    script_brent(&d);
    script_quote(&d, "SHEL", "LSE", "180.5B", "8.9");

    // When: The industry is collected
    let result = d
        .orchestrator
        .collect(CollectRequest::new("oil-majors"))
        .await
        .expect("collect");

    // Then: XOM's market cap is a not-found datapoint listing every URL tried
    let document: DatapackDocument =
        serde_json::from_str(&fs::read_to_string(&result.datapack.path).expect("read")).expect("parse");
    let xom = &document.companies["XOM"];
    let market_cap = &xom.valuation["market_cap"];
    assert_eq!(market_cap.method(), CollectionMethod::NotFound);
    let expected: Vec<String> = SourceCandidateFactory::new()
        .for_ticker("XOM", Some("NYSE"))
        .into_iter()
        .map(|candidate| candidate.url)
        .collect();
    assert_eq!(market_cap.attempted_sources(), expected.as_slice());

    // And: A peer's absence leaves the gate passing with warnings only
    assert!(result.gate_result.passed, "{:?}", result.gate_result.errors);
    assert!(!result.gate_result.has_error_code(codes::MISSING_REQUIRED));
    assert!(result
        .gate_result
        .warnings
        .iter()
        .any(|warning| warning.ticker.as_deref() == Some("XOM")));
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn when_every_company_is_collected_then_the_datapack_and_run_record_agree() {
    // Given: Every source answers
    let d = deployment();
    script_brent(&d);
    script_quote(&d, "SHEL", "LSE", "180.5B", "8.9");
    script_quote(&d, "XOM", "NYSE", "472.19B", "13.1");

    // When: The industry is collected
    let result = d
        .orchestrator
        .collect(CollectRequest::new("oil-majors"))
        .await
        .expect("collect");

    // Then: The run completed and the artifact sits in the datapack layout
    assert_eq!(result.status, CollectionStatus::Complete);
    let expected_path = d
        .config
        .output_dir()
        .join("oil-majors")
        .join(&result.datapack_id)
        .join("datapack.json");
    assert_eq!(result.datapack.path, expected_path);

    // And: The artifact holds every company and the macro indicator
    let document: DatapackDocument =
        serde_json::from_str(&fs::read_to_string(&expected_path).expect("read")).expect("parse");
    assert_eq!(document.datapack_id, result.datapack_id);
    assert_eq!(document.companies.len(), 2);
    assert_eq!(document.macro_data.get("brent_crude").and_then(|dp| dp.value()), Some(74.3));
    assert_eq!(
        document.companies["SHEL"].valuation["market_cap"].source_url(),
        Some(quote_url("SHEL", "LSE").as_str())
    );
    assert_eq!(document.collection_log.company_statuses["XOM"], CollectionStatus::Complete);

    // And: Intermediate entities were written per ticker
    let intermediate = d
        .config
        .intermediate_dir()
        .join("oil-majors")
        .join(&result.datapack_id);
    assert!(intermediate.join("SHEL.json").is_file());
    assert!(intermediate.join("XOM.json").is_file());

    // And: The stored run matches the result
    let stored = d.store.run(&result.run_id).expect("store").expect("run");
    assert_eq!(stored.run.status(), CollectionStatus::Complete);
    assert_eq!(stored.run.gate_passed, Some(true));
    assert_eq!(stored.run.companies_success, 2);
    assert_eq!(stored.run.file_size_bytes, Some(result.datapack.size_bytes));
    assert!(d.home.path().exists());
}

#[tokio::test]
async fn when_a_focal_metric_is_missing_then_the_gate_fails_the_run() {
    // Given: Shell's quote page lacks the forward P/E the focal scope requires
    let d = deployment();
    script_brent(&d);
    d.http.push(
        quote_url("SHEL", "LSE"),
        Ok(HttpResponse::ok_html(
            r#"<table><tr><td>Market Cap</td><td data-test="MARKET_CAP-value">180.5B</td></tr></table>"#,
        )),
    );
    script_quote(&d, "XOM", "NYSE", "472.19B", "13.1");

    // When: The industry is collected
    let result = d
        .orchestrator
        .collect(CollectRequest::new("oil-majors"))
        .await
        .expect("collect");

    // Then: The gate names the focal gap and the run is failed
    assert!(!result.gate_result.passed);
    assert!(result.gate_result.has_error_code(codes::MISSING_REQUIRED));
    assert_eq!(result.status, CollectionStatus::Failed);

    // And: The recorded errors are persisted with the run
    let stored = d.store.run(&result.run_id).expect("store").expect("run");
    assert_eq!(stored.run.status(), CollectionStatus::Failed);
    assert!(stored
        .errors
        .iter()
        .any(|error| error.code == codes::MISSING_REQUIRED && error.ticker.as_deref() == Some("SHEL")));
    assert!(stored.run.error_count >= 1);
}

#[tokio::test]
async fn when_a_focal_ticker_is_added_on_request_then_its_scope_becomes_required() {
    // Given: XOM lacks forward P/E, which only focal companies require
    let d = deployment();
    script_brent(&d);
    script_quote(&d, "SHEL", "LSE", "180.5B", "8.9");
    d.http.push(
        quote_url("XOM", "NYSE"),
        Ok(HttpResponse::ok_html(
            r#"<table><tr><td>Market Cap</td><td data-test="MARKET_CAP-value">472.19B</td></tr></table>"#,
        )),
    );

    // When: XOM is promoted to focal for this run
    let result = d
        .orchestrator
        .collect(CollectRequest {
            focal_tickers: vec!["XOM".to_owned()],
            ..CollectRequest::new("oil-majors")
        })
        .await
        .expect("collect");

    // Then: The missing forward P/E is now a gate error
    assert!(!result.gate_result.passed);
    assert!(result
        .gate_result
        .errors
        .iter()
        .any(|finding| finding.ticker.as_deref() == Some("XOM")));
}

#[tokio::test]
async fn when_the_industry_is_unknown_then_no_run_is_recorded() {
    // Given: A deployment that only knows oil-majors
    let d = deployment();

    // When: Another industry is requested
    let error = d
        .orchestrator
        .collect(CollectRequest::new("utilities"))
        .await
        .expect_err("unknown industry");

    // Then: The request fails before any run exists
    assert!(matches!(error, CollectError::Config(_)));
    assert!(d.store.recent_runs(10).expect("store").is_empty());
    assert!(d.http.requests().is_empty());
}
