//! # Collection Gate
//!
//! Decides whether an assembled datapack is fit for downstream use.
//!
//! Validation runs in three layers over the JSON that was actually written:
//!
//! 1. **Schema**: structural conformity of the document, see [`SchemaValidator`].
//!    A violation in a focal company or outside any company ends validation
//!    early. A peer company that violates the schema is reported as a
//!    `SCHEMA_INVALID` warning and left out of the later layers.
//! 2. **Plausibility**: value ranges, cross-field consistency, source hosts
//!    and market dates, see [`SemanticRules`].
//! 3. **Completeness**: company completeness, required datapoints,
//!    provenance, and macro freshness, followed by advisory warnings.
//!
//! Findings tied to a peer (non-focal) company are reported as warnings with
//! the same code, so only focal entities and macro data can fail the gate.
//! The validator holds no state and never performs I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{IndustryConfig, MetricRequirement};
use crate::domain::{
    CollectionError, CollectionMethod, CollectionStatus, DataPointRecord, DatapackDocument,
    DatapointKey, LocatorType, Section, Severity, UtcDateTime,
};

mod semantic;

pub use semantic::{RangeRule, SemanticRules};

/// Finding codes emitted by the gate.
pub mod codes {
    pub const SCHEMA_INVALID: &str = "SCHEMA_INVALID";
    pub const RANGE_VIOLATION: &str = "SEMANTIC_RANGE_VIOLATION";
    pub const TEMPORAL_INVALID: &str = "SEMANTIC_TEMPORAL_INVALID";
    pub const INVALID_SOURCE_URL: &str = "INVALID_SOURCE_URL";
    pub const SOURCE_DOMAIN_NOT_ALLOWED: &str = "SOURCE_DOMAIN_NOT_ALLOWED";
    pub const MISSING_COMPANY: &str = "MISSING_COMPANY";
    pub const MISSING_REQUIRED: &str = "MISSING_REQUIRED";
    pub const MISSING_REQUIRED_FINANCIAL: &str = "MISSING_REQUIRED_FINANCIAL";
    pub const MISSING_REQUIRED_OPERATIONAL: &str = "MISSING_REQUIRED_OPERATIONAL";
    pub const MISSING_REQUIRED_MACRO: &str = "MISSING_REQUIRED_MACRO";
    pub const UNDOCUMENTED_MISSING: &str = "UNDOCUMENTED_MISSING";
    pub const MISSING_PROVENANCE: &str = "MISSING_PROVENANCE";
    pub const MISSING_ATTEMPTS: &str = "MISSING_ATTEMPTS";
    pub const MACRO_STALE: &str = "MACRO_STALE";

    pub const EXTRA_COMPANY: &str = "EXTRA_COMPANY";
    pub const MACRO_AGING: &str = "MACRO_AGING";
    pub const TEMPORAL_SPREAD: &str = "TEMPORAL_SPREAD";
    pub const LOW_COVERAGE: &str = "LOW_COVERAGE";
    pub const RANGE_SUSPECT: &str = "SEMANTIC_RANGE_SUSPECT";
    pub const CROSS_FIELD: &str = "SEMANTIC_CROSS_FIELD";
}

const TEMPORAL_SPREAD_LIMIT_SECS: u64 = 86_400;
const LOW_COVERAGE_RATIO: f64 = 0.5;
const AGING_RATIO: f64 = 0.8;

/// One gate error or warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateFinding {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
}

impl GateFinding {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
            path: None,
            ticker: None,
        }
    }

    fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn for_ticker(mut self, ticker: &str) -> Self {
        self.ticker = Some(ticker.to_owned());
        self
    }

    fn into_collection_error(self, severity: Severity) -> CollectionError {
        let mut error = CollectionError::new(severity, self.code, self.message);
        error.path = self.path;
        error.ticker = self.ticker;
        error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub errors: Vec<GateFinding>,
    pub warnings: Vec<GateFinding>,
}

impl GateResult {
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors.iter().map(|finding| finding.code.as_str()).collect()
    }

    pub fn has_error_code(&self, code: &str) -> bool {
        self.errors.iter().any(|finding| finding.code == code)
    }

    pub fn first_error(&self) -> Option<&GateFinding> {
        self.errors.first()
    }

    /// Findings as run error rows, errors first.
    pub fn collection_errors(&self) -> Vec<CollectionError> {
        let errors = self
            .errors
            .iter()
            .cloned()
            .map(|finding| finding.into_collection_error(Severity::Error));
        let warnings = self
            .warnings
            .iter()
            .cloned()
            .map(|finding| finding.into_collection_error(Severity::Warning));
        errors.chain(warnings).collect()
    }
}

/// A structural violation found by a [`SchemaValidator`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
    /// Company the violation sits in; `None` for document-level fields.
    pub ticker: Option<String>,
}

impl SchemaViolation {
    pub fn constraint(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            ticker: None,
        }
    }

    fn missing(path: impl Into<String>) -> Self {
        Self::constraint(path, "is required")
    }

    fn invalid_type(path: impl Into<String>, expected: &str) -> Self {
        Self::constraint(path, format!("must be {expected}"))
    }
}

/// Structural check of a datapack document.
pub trait SchemaValidator: Send + Sync {
    /// Every violation found; empty when the document conforms. Violations
    /// inside a company carry its ticker so a peer can be set aside.
    fn validate(&self, datapack: &Value) -> Vec<SchemaViolation>;
}

/// Tag the violations pushed since `start` with `ticker`.
fn attribute(violations: &mut [SchemaViolation], start: usize, ticker: &str) {
    for violation in &mut violations[start..] {
        violation.ticker = Some(ticker.to_owned());
    }
}

/// Built-in description of the datapack shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatapackShapeValidator;

impl SchemaValidator for DatapackShapeValidator {
    fn validate(&self, datapack: &Value) -> Vec<SchemaViolation> {
        let mut violations = Vec::new();
        let Some(root) = datapack.as_object() else {
            violations.push(SchemaViolation::invalid_type("$", "an object"));
            return violations;
        };

        for field in ["industry_id", "datapack_id"] {
            if let Some(value) = required_string(root, field, field, &mut violations) {
                if value.trim().is_empty() {
                    violations.push(SchemaViolation::constraint(field, "must not be empty"));
                }
            }
        }
        required_timestamp(root, "collected_at", "collected_at", &mut violations);

        if let Some(indicators) = required_object(root, "macro", "macro", &mut violations) {
            for (name, datapoint) in indicators {
                check_datapoint(datapoint, &format!("macro.{name}"), &mut violations);
            }
        }

        if let Some(companies) = required_object(root, "companies", "companies", &mut violations) {
            for (ticker, company) in companies {
                let start = violations.len();
                check_company(company, ticker, &mut violations);
                attribute(&mut violations, start, ticker);
            }
        }

        if let Some(log) = required_object(root, "collection_log", "collection_log", &mut violations)
        {
            check_collection_log(log, &mut violations);
        }

        violations
    }
}

fn check_company(company: &Value, ticker: &str, violations: &mut Vec<SchemaViolation>) {
    let base = format!("companies.{ticker}");
    let Some(fields) = company.as_object() else {
        violations.push(SchemaViolation::invalid_type(base, "an object"));
        return;
    };
    if let Some(declared) = required_string(fields, "ticker", &format!("{base}.ticker"), violations)
    {
        if declared != ticker {
            violations.push(SchemaViolation::constraint(
                format!("{base}.ticker"),
                format!("must match its key '{ticker}'"),
            ));
        }
    }
    required_string(fields, "name", &format!("{base}.name"), violations);

    for section in [Section::Valuation, Section::Financials, Section::Operational] {
        let path = format!("{base}.{}", section.as_str());
        match fields.get(section.as_str()) {
            None => {}
            Some(Value::Object(points)) => {
                for (name, datapoint) in points {
                    check_datapoint(datapoint, &format!("{path}.{name}"), violations);
                }
            }
            Some(_) => violations.push(SchemaViolation::invalid_type(path, "an object")),
        }
    }
}

fn check_collection_log(log: &Map<String, Value>, violations: &mut Vec<SchemaViolation>) {
    required_timestamp(log, "started_at", "collection_log.started_at", violations);
    required_timestamp(log, "completed_at", "collection_log.completed_at", violations);
    for field in ["duration_seconds", "total_attempts"] {
        let path = format!("collection_log.{field}");
        match log.get(field) {
            None => violations.push(SchemaViolation::missing(path)),
            Some(value) if !value.is_u64() => {
                violations.push(SchemaViolation::invalid_type(path, "a non-negative integer"));
            }
            Some(_) => {}
        }
    }
    if let Some(status) =
        required_string(log, "macro_status", "collection_log.macro_status", violations)
    {
        check_status(status, "collection_log.macro_status", violations);
    }
    if let Some(statuses) = required_object(
        log,
        "company_statuses",
        "collection_log.company_statuses",
        violations,
    ) {
        for (ticker, status) in statuses {
            let path = format!("collection_log.company_statuses.{ticker}");
            let start = violations.len();
            match status.as_str() {
                Some(status) => check_status(status, &path, violations),
                None => violations.push(SchemaViolation::invalid_type(path, "a string")),
            }
            attribute(violations, start, ticker);
        }
    }
}

fn check_status(status: &str, path: &str, violations: &mut Vec<SchemaViolation>) {
    if status.parse::<CollectionStatus>().is_err() {
        violations.push(SchemaViolation::constraint(
            path,
            format!("unknown status '{status}'"),
        ));
    }
}

fn check_datapoint(datapoint: &Value, path: &str, violations: &mut Vec<SchemaViolation>) {
    let Some(fields) = datapoint.as_object() else {
        violations.push(SchemaViolation::invalid_type(path, "an object"));
        return;
    };

    match fields.get("value") {
        None => violations.push(SchemaViolation::missing(format!("{path}.value"))),
        Some(Value::Null | Value::Number(_)) => {}
        Some(_) => violations.push(SchemaViolation::invalid_type(
            format!("{path}.value"),
            "a number or null",
        )),
    }

    if let Some(unit) = required_string(fields, "unit", &format!("{path}.unit"), violations) {
        if !matches!(unit, "currency" | "ratio" | "percent" | "number") {
            violations.push(SchemaViolation::constraint(
                format!("{path}.unit"),
                format!("unknown unit '{unit}'"),
            ));
        }
    }

    if let Some(method) = required_string(fields, "method", &format!("{path}.method"), violations)
    {
        if method.parse::<CollectionMethod>().is_err() {
            violations.push(SchemaViolation::constraint(
                format!("{path}.method"),
                format!("unknown method '{method}'"),
            ));
        }
    }

    required_timestamp(fields, "retrieved_at", &format!("{path}.retrieved_at"), violations);

    for list in ["attempted_sources", "derived_from"] {
        if let Some(value) = fields.get(list) {
            let all_strings = value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string));
            if !all_strings {
                violations.push(SchemaViolation::invalid_type(
                    format!("{path}.{list}"),
                    "an array of strings",
                ));
            }
        }
    }

    match fields.get("source_locator") {
        None | Some(Value::Null) => {}
        Some(Value::Object(locator)) => {
            let base = format!("{path}.source_locator");
            if let Some(kind) = required_string(locator, "type", &format!("{base}.type"), violations)
            {
                if kind.parse::<LocatorType>().is_err() {
                    violations.push(SchemaViolation::constraint(
                        format!("{base}.type"),
                        format!("unknown locator type '{kind}'"),
                    ));
                }
            }
            if let Some(selector) =
                required_string(locator, "selector", &format!("{base}.selector"), violations)
            {
                if selector.trim().is_empty() {
                    violations.push(SchemaViolation::constraint(
                        format!("{base}.selector"),
                        "must not be empty",
                    ));
                }
            }
        }
        Some(_) => violations.push(SchemaViolation::invalid_type(
            format!("{path}.source_locator"),
            "an object",
        )),
    }
}

fn required_string<'a>(
    fields: &'a Map<String, Value>,
    field: &str,
    path: &str,
    violations: &mut Vec<SchemaViolation>,
) -> Option<&'a str> {
    match fields.get(field) {
        None => {
            violations.push(SchemaViolation::missing(path));
            None
        }
        Some(Value::String(value)) => Some(value),
        Some(_) => {
            violations.push(SchemaViolation::invalid_type(path, "a string"));
            None
        }
    }
}

fn required_object<'a>(
    fields: &'a Map<String, Value>,
    field: &str,
    path: &str,
    violations: &mut Vec<SchemaViolation>,
) -> Option<&'a Map<String, Value>> {
    match fields.get(field) {
        None => {
            violations.push(SchemaViolation::missing(path));
            None
        }
        Some(Value::Object(value)) => Some(value),
        Some(_) => {
            violations.push(SchemaViolation::invalid_type(path, "an object"));
            None
        }
    }
}

fn required_timestamp(
    fields: &Map<String, Value>,
    field: &str,
    path: &str,
    violations: &mut Vec<SchemaViolation>,
) {
    if let Some(value) = required_string(fields, field, path, violations) {
        if UtcDateTime::parse(value).is_err() {
            violations.push(SchemaViolation::constraint(
                path,
                "must be an RFC3339 UTC timestamp",
            ));
        }
    }
}

/// Inputs the semantic rules are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub industry: &'a IndustryConfig,
    pub focals: &'a BTreeSet<String>,
    pub now: UtcDateTime,
}

// Lenient view of the document: datapoint records are read without
// re-validating provenance so the gate can report what is missing.
#[derive(Debug, Deserialize)]
struct PackView {
    #[serde(rename = "macro")]
    macro_data: BTreeMap<String, DataPointRecord>,
    companies: BTreeMap<String, CompanyView>,
    collection_log: LogView,
}

#[derive(Debug, Deserialize)]
struct CompanyView {
    #[serde(default)]
    valuation: BTreeMap<String, DataPointRecord>,
    #[serde(default)]
    financials: BTreeMap<String, DataPointRecord>,
    #[serde(default)]
    operational: BTreeMap<String, DataPointRecord>,
}

impl CompanyView {
    fn get(&self, key: &DatapointKey) -> Option<&DataPointRecord> {
        let section = match key.section() {
            Section::Valuation => &self.valuation,
            Section::Financials => &self.financials,
            Section::Operational => &self.operational,
            Section::Macro => return None,
        };
        section.get(key.name())
    }

    fn records(&self) -> impl Iterator<Item = (Section, &String, &DataPointRecord)> {
        [
            (Section::Valuation, &self.valuation),
            (Section::Financials, &self.financials),
            (Section::Operational, &self.operational),
        ]
        .into_iter()
        .flat_map(|(section, points)| {
            points
                .iter()
                .map(move |(name, record)| (section, name, record))
        })
    }
}

#[derive(Debug, Deserialize)]
struct LogView {
    duration_seconds: u64,
}

/// Collection gate over an assembled datapack.
#[derive(Clone)]
pub struct GateValidator {
    schema: Arc<dyn SchemaValidator>,
    semantic: SemanticRules,
    macro_staleness_days: u32,
}

impl GateValidator {
    pub fn new(macro_staleness_days: u32) -> Self {
        Self {
            schema: Arc::new(DatapackShapeValidator),
            semantic: SemanticRules::default(),
            macro_staleness_days,
        }
    }

    #[must_use]
    pub fn with_schema_validator(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn with_semantic_rules(mut self, semantic: SemanticRules) -> Self {
        self.semantic = semantic;
        self
    }

    pub fn semantic_rules(&self) -> &SemanticRules {
        &self.semantic
    }

    pub fn macro_staleness_days(&self) -> u32 {
        self.macro_staleness_days
    }

    /// Convenience wrapper for an in-memory document.
    pub fn validate_document(&self, document: &DatapackDocument, context: GateContext<'_>) -> GateResult {
        match serde_json::to_value(document) {
            Ok(value) => self.validate(&value, context),
            Err(error) => schema_failure(
                vec![SchemaViolation::constraint("$", error.to_string())],
                Vec::new(),
            ),
        }
    }

    pub fn validate(&self, datapack: &Value, context: GateContext<'_>) -> GateResult {
        let (peer, blocking): (Vec<SchemaViolation>, Vec<SchemaViolation>) = self
            .schema
            .validate(datapack)
            .into_iter()
            .partition(|violation| {
                violation
                    .ticker
                    .as_ref()
                    .is_some_and(|ticker| !context.focals.contains(ticker))
            });
        if !blocking.is_empty() {
            return schema_failure(blocking, peer);
        }

        let quarantined: BTreeSet<String> =
            peer.iter().filter_map(|violation| violation.ticker.clone()).collect();
        let pruned;
        let document = if quarantined.is_empty() {
            datapack
        } else {
            pruned = without_companies(datapack, &quarantined);
            &pruned
        };
        let pack = match PackView::deserialize(document) {
            Ok(pack) => pack,
            Err(error) => {
                return schema_failure(
                    vec![SchemaViolation::constraint("$", error.to_string())],
                    peer,
                )
            }
        };

        let mut findings = Findings::new(context.focals);
        for violation in peer {
            findings.warn(peer_schema_warning(violation));
        }
        self.semantic.check(&pack, context.now, &mut findings);
        check_company_completeness(&pack, context.industry, &quarantined, &mut findings);
        check_required_datapoints(&pack, context, &mut findings);
        check_provenance(&pack, &mut findings);
        self.check_macro_freshness(&pack, context.now, &mut findings);
        self.check_warnings(&pack, context, &mut findings);
        findings.into_result()
    }

    fn check_macro_freshness(&self, pack: &PackView, now: UtcDateTime, findings: &mut Findings<'_>) {
        let threshold = self.macro_staleness_days;
        for (name, record) in &pack.macro_data {
            if record.value.is_none() {
                continue;
            }
            let age = macro_age_days(record, now);
            if age > threshold {
                findings.push(
                    GateFinding::new(
                        codes::MACRO_STALE,
                        format!("Macro datapoint {name} is {age} days old (threshold: {threshold})"),
                    )
                    .at(format!("macro.{name}")),
                );
            }
        }
    }

    fn check_warnings(&self, pack: &PackView, context: GateContext<'_>, findings: &mut Findings<'_>) {
        for ticker in pack.companies.keys() {
            if context.industry.company(ticker).is_none() {
                findings.warn(
                    GateFinding::new(
                        codes::EXTRA_COMPANY,
                        format!("Unexpected company {ticker} in datapack"),
                    )
                    .at(format!("companies.{ticker}"))
                    .for_ticker(ticker),
                );
            }
        }

        let threshold = self.macro_staleness_days;
        let aging_after = (f64::from(threshold) * AGING_RATIO).floor() as u32;
        for (name, record) in &pack.macro_data {
            if record.value.is_none() {
                continue;
            }
            let age = macro_age_days(record, context.now);
            if age > aging_after && age <= threshold {
                findings.warn(
                    GateFinding::new(
                        codes::MACRO_AGING,
                        format!("Macro {name} is {age} days old, approaching staleness"),
                    )
                    .at(format!("macro.{name}")),
                );
            }
        }

        let duration = pack.collection_log.duration_seconds;
        if duration > TEMPORAL_SPREAD_LIMIT_SECS {
            findings.warn(
                GateFinding::new(
                    codes::TEMPORAL_SPREAD,
                    format!("Collection span exceeds 24 hours ({duration}s)"),
                )
                .at("collection_log.duration_seconds"),
            );
        }

        // Metrics that cannot be parsed are rejected when the config loads.
        let Ok(metrics) = context.industry.metrics() else {
            return;
        };
        for (key, metric) in metrics {
            if metric.required {
                continue;
            }
            let coverage = coverage(pack, &key);
            if coverage < LOW_COVERAGE_RATIO {
                findings.warn(
                    GateFinding::new(
                        codes::LOW_COVERAGE,
                        format!(
                            "Optional metric {} has {:.1}% coverage",
                            key.name(),
                            coverage * 100.0
                        ),
                    )
                    .at(key.to_string()),
                );
            }
        }
    }
}

impl Default for GateValidator {
    fn default() -> Self {
        Self::new(10)
    }
}

fn schema_failure(blocking: Vec<SchemaViolation>, peer: Vec<SchemaViolation>) -> GateResult {
    let details: Vec<String> = blocking.iter().map(ToString::to_string).collect();
    GateResult {
        passed: false,
        errors: vec![GateFinding::new(
            codes::SCHEMA_INVALID,
            format!("Datapack failed schema validation: {}", details.join(", ")),
        )],
        warnings: peer.into_iter().map(peer_schema_warning).collect(),
    }
}

fn peer_schema_warning(violation: SchemaViolation) -> GateFinding {
    let ticker = violation.ticker.clone().unwrap_or_default();
    let finding = GateFinding::new(
        codes::SCHEMA_INVALID,
        format!("Peer company {ticker} failed schema validation: {violation}"),
    )
    .at(violation.path);
    finding.for_ticker(&ticker)
}

/// Copy of `datapack` without the named companies.
fn without_companies(datapack: &Value, tickers: &BTreeSet<String>) -> Value {
    let mut pruned = datapack.clone();
    if let Some(companies) = pruned.get_mut("companies").and_then(Value::as_object_mut) {
        companies.retain(|ticker, _| !tickers.contains(ticker));
    }
    pruned
}

fn check_company_completeness(
    pack: &PackView,
    industry: &IndustryConfig,
    quarantined: &BTreeSet<String>,
    findings: &mut Findings<'_>,
) {
    for company in &industry.companies {
        let ticker = company.ticker.as_str();
        if !pack.companies.contains_key(ticker) && !quarantined.contains(ticker) {
            findings.push(
                GateFinding::new(
                    codes::MISSING_COMPANY,
                    format!("Configured company {ticker} not found in datapack"),
                )
                .at(format!("companies.{ticker}"))
                .for_ticker(ticker),
            );
        }
    }
}

fn check_required_datapoints(pack: &PackView, context: GateContext<'_>, findings: &mut Findings<'_>) {
    let metrics: Vec<(DatapointKey, &MetricRequirement)> = context.industry.metrics().unwrap_or_default();
    for (ticker, company) in &pack.companies {
        if context.industry.company(ticker).is_none() {
            continue;
        }
        let focal = context.focals.contains(ticker);
        for (key, metric) in &metrics {
            if !metric.is_required_for(focal) {
                continue;
            }
            let code = match key.section() {
                Section::Financials => codes::MISSING_REQUIRED_FINANCIAL,
                Section::Operational => codes::MISSING_REQUIRED_OPERATIONAL,
                Section::Valuation | Section::Macro => codes::MISSING_REQUIRED,
            };
            let path = format!("companies.{ticker}.{key}");
            let name = key.name();
            match company.get(key) {
                None => findings.push(
                    GateFinding::new(code, format!("Required metric {name} is missing for {ticker}"))
                        .at(path)
                        .for_ticker(ticker),
                ),
                Some(record) => {
                    if record.value.is_none() {
                        findings.push(
                            GateFinding::new(
                                code,
                                format!(
                                    "Required metric {name} has null value for {ticker} (method: {})",
                                    record.method
                                ),
                            )
                            .at(format!("{path}.value"))
                            .for_ticker(ticker),
                        );
                    }
                    if record.method == CollectionMethod::NotFound
                        && !has_entries(&record.attempted_sources)
                    {
                        findings.push(
                            GateFinding::new(
                                codes::UNDOCUMENTED_MISSING,
                                format!("Not-found metric {name} lacks attempted_sources for {ticker}"),
                            )
                            .at(format!("{path}.attempted_sources"))
                            .for_ticker(ticker),
                        );
                    }
                }
            }
        }
    }

    let macro_keys = context.industry.macro_keys().unwrap_or_default();
    for (key, required) in macro_keys {
        if !required {
            continue;
        }
        let name = key.name();
        let present = pack
            .macro_data
            .get(name)
            .is_some_and(|record| record.value.is_some());
        if !present {
            findings.push(
                GateFinding::new(
                    codes::MISSING_REQUIRED_MACRO,
                    format!("Required macro indicator {name} has no value"),
                )
                .at(format!("macro.{name}")),
            );
        }
    }
}

fn check_provenance(pack: &PackView, findings: &mut Findings<'_>) {
    for (name, record) in &pack.macro_data {
        for finding in record_provenance(record, &format!("macro.{name}")) {
            findings.push(finding);
        }
    }
    for (ticker, company) in &pack.companies {
        for (section, name, record) in company.records() {
            let path = format!("companies.{ticker}.{}.{name}", section.as_str());
            for finding in record_provenance(record, &path) {
                findings.push(finding.for_ticker(ticker));
            }
        }
    }
}

fn record_provenance(record: &DataPointRecord, path: &str) -> Vec<GateFinding> {
    let mut findings = Vec::new();
    let method = record.method;
    match method {
        CollectionMethod::WebFetch | CollectionMethod::WebSearch | CollectionMethod::Api => {
            if record.source_url.as_deref().is_none_or(|url| url.trim().is_empty()) {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Datapoint at {path} lacks source_url for method {method}"),
                    )
                    .at(format!("{path}.source_url")),
                );
            }
            if record.source_locator.is_none() {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Datapoint at {path} lacks source_locator for method {method}"),
                    )
                    .at(format!("{path}.source_locator")),
                );
            }
        }
        CollectionMethod::NotFound => {
            if record.value.is_some() {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Not-found datapoint at {path} has non-null value"),
                    )
                    .at(format!("{path}.value")),
                );
            }
            if !has_entries(&record.attempted_sources) {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_ATTEMPTS,
                        format!("Not-found datapoint at {path} lacks attempted_sources"),
                    )
                    .at(format!("{path}.attempted_sources")),
                );
            }
        }
        CollectionMethod::Derived => {
            if !has_entries(&record.derived_from) {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Derived datapoint at {path} lacks derived_from"),
                    )
                    .at(format!("{path}.derived_from")),
                );
            }
            if record.formula.as_deref().is_none_or(|formula| formula.trim().is_empty()) {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Derived datapoint at {path} lacks formula"),
                    )
                    .at(format!("{path}.formula")),
                );
            }
        }
        CollectionMethod::Cache => {
            if record.cache_source.as_deref().is_none_or(|source| source.trim().is_empty()) {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Cache datapoint at {path} lacks cache_source"),
                    )
                    .at(format!("{path}.cache_source")),
                );
            }
            if record.cache_age_days.is_none() {
                findings.push(
                    GateFinding::new(
                        codes::MISSING_PROVENANCE,
                        format!("Cache datapoint at {path} lacks cache_age_days"),
                    )
                    .at(format!("{path}.cache_age_days")),
                );
            }
        }
    }
    findings
}

fn has_entries(values: &[String]) -> bool {
    values.iter().any(|value| !value.trim().is_empty())
}

/// Age of a macro value: its market date when published, else its retrieval time.
fn macro_age_days(record: &DataPointRecord, now: UtcDateTime) -> u32 {
    let retrieved = record.retrieved_at.age_days(now);
    let Some(as_of) = record.as_of.as_deref().and_then(|as_of| crate::domain::parse_date(as_of).ok())
    else {
        return retrieved;
    };
    let days = (now.date() - as_of).whole_days();
    u32::try_from(days).unwrap_or(0).max(retrieved)
}

fn coverage(pack: &PackView, key: &DatapointKey) -> f64 {
    let total = pack.companies.len();
    if total == 0 {
        return 0.0;
    }
    let found = pack
        .companies
        .values()
        .filter(|company| company.get(key).is_some_and(|record| record.value.is_some()))
        .count();
    found as f64 / total as f64
}

/// Accumulates findings, demoting those tied to a peer company.
struct Findings<'a> {
    focals: &'a BTreeSet<String>,
    errors: Vec<GateFinding>,
    warnings: Vec<GateFinding>,
}

impl<'a> Findings<'a> {
    fn new(focals: &'a BTreeSet<String>) -> Self {
        Self {
            focals,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn push(&mut self, finding: GateFinding) {
        let peer = finding
            .ticker
            .as_ref()
            .is_some_and(|ticker| !self.focals.contains(ticker));
        if peer {
            self.warnings.push(finding);
        } else {
            self.errors.push(finding);
        }
    }

    fn warn(&mut self, finding: GateFinding) {
        self.warnings.push(finding);
    }

    fn into_result(self) -> GateResult {
        GateResult {
            passed: self.errors.is_empty(),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompanyConfig, DataRequirements, MacroRequirement, RequiredScope};
    use serde_json::json;

    fn industry() -> IndustryConfig {
        let metric = |key: &str, required: bool| MetricRequirement {
            key: key.to_owned(),
            required,
            required_scope: RequiredScope::All,
        };
        IndustryConfig {
            id: "oil-majors".to_owned(),
            name: "Oil Majors".to_owned(),
            companies: vec![
                CompanyConfig {
                    ticker: "SHEL".to_owned(),
                    name: "Shell".to_owned(),
                    listing_exchange: Some("LSE".to_owned()),
                },
                CompanyConfig {
                    ticker: "BP".to_owned(),
                    name: "BP".to_owned(),
                    listing_exchange: Some("LSE".to_owned()),
                },
            ],
            focal_tickers: vec!["SHEL".to_owned()],
            requirements: DataRequirements {
                valuation: vec![metric("market_cap", true), metric("div_yield", false)],
                financials: Vec::new(),
                operational: Vec::new(),
            },
            macro_indicators: vec![MacroRequirement {
                key: "brent_crude".to_owned(),
                required: true,
            }],
        }
    }

    fn found(value: f64) -> Value {
        json!({
            "value": value,
            "unit": "currency",
            "currency": "USD",
            "scale": "billions",
            "retrieved_at": "2025-03-03T12:00:00Z",
            "method": "web_fetch",
            "source_url": "https://finance.yahoo.com/quote/SHEL",
            "source_locator": {"type": "html", "selector": "td", "snippet": "200B"},
        })
    }

    fn not_found(attempted: &[&str]) -> Value {
        json!({
            "value": null,
            "unit": "currency",
            "retrieved_at": "2025-03-03T12:00:00Z",
            "method": "not_found",
            "attempted_sources": attempted,
        })
    }

    fn company(ticker: &str, market_cap: Value) -> Value {
        json!({
            "ticker": ticker,
            "name": ticker,
            "valuation": {"market_cap": market_cap, "div_yield": found(3.1)},
        })
    }

    fn datapack(companies: Value) -> Value {
        json!({
            "industry_id": "oil-majors",
            "datapack_id": "pack-1",
            "collected_at": "2025-03-03T12:00:00Z",
            "macro": {"brent_crude": {
                "value": 74.2,
                "unit": "currency",
                "currency": "USD",
                "retrieved_at": "2025-03-03T12:00:00Z",
                "method": "api",
                "source_url": "https://query1.finance.yahoo.com/v10/finance/quoteSummary/BZ=F",
                "source_locator": {"type": "json", "selector": "$.price", "snippet": "74.2"},
            }},
            "companies": companies,
            "collection_log": {
                "started_at": "2025-03-03T11:58:00Z",
                "completed_at": "2025-03-03T12:00:00Z",
                "duration_seconds": 120,
                "company_statuses": {"SHEL": "complete", "BP": "complete"},
                "macro_status": "complete",
                "total_attempts": 6,
            },
        })
    }

    fn validate(pack: &Value, now: &str) -> GateResult {
        let industry = industry();
        let focals = industry.resolve_focals(&[]).expect("focals");
        let context = GateContext {
            industry: &industry,
            focals: &focals,
            now: UtcDateTime::parse(now).expect("now"),
        };
        GateValidator::default().validate(pack, context)
    }

    #[test]
    fn complete_pack_passes() {
        let pack = datapack(json!({
            "SHEL": company("SHEL", found(210.0)),
            "BP": company("BP", found(90.0)),
        }));
        let result = validate(&pack, "2025-03-03T13:00:00Z");
        assert!(result.passed, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn schema_failure_returns_early() {
        let mut pack = datapack(json!({"SHEL": company("SHEL", found(1.0))}));
        pack["collection_log"]["duration_seconds"] = json!("slow");
        let result = validate(&pack, "2025-03-03T13:00:00Z");
        assert!(!result.passed);
        assert_eq!(result.error_codes(), vec![codes::SCHEMA_INVALID]);
        assert!(result.errors[0].message.contains("collection_log.duration_seconds"));
    }

    #[test]
    fn peer_findings_are_demoted_to_warnings() {
        let pack = datapack(json!({
            "SHEL": company("SHEL", found(210.0)),
            "BP": company("BP", not_found(&["https://finance.yahoo.com/quote/BP.L"])),
        }));
        let result = validate(&pack, "2025-03-03T13:00:00Z");
        assert!(result.passed);
        assert!(result
            .warnings
            .iter()
            .any(|warning| warning.code == codes::MISSING_REQUIRED
                && warning.ticker.as_deref() == Some("BP")));
    }

    #[test]
    fn focal_not_found_without_attempts_fails() {
        let pack = datapack(json!({
            "SHEL": company("SHEL", not_found(&[])),
            "BP": company("BP", found(90.0)),
        }));
        let result = validate(&pack, "2025-03-03T13:00:00Z");
        assert!(!result.passed);
        assert!(result.has_error_code(codes::MISSING_REQUIRED));
        assert!(result.has_error_code(codes::UNDOCUMENTED_MISSING));
        assert!(result.has_error_code(codes::MISSING_ATTEMPTS));
    }

    #[test]
    fn missing_company_and_provenance_are_reported() {
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["market_cap"]
            .as_object_mut()
            .expect("object")
            .remove("source_locator");
        let pack = datapack(json!({"SHEL": shell, "XOM": company("XOM", found(400.0))}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert!(result.has_error_code(codes::MISSING_PROVENANCE));
        assert!(!result.has_error_code(codes::MISSING_COMPANY));
        let warning_codes: Vec<_> = result.warnings.iter().map(|w| w.code.as_str()).collect();
        assert!(warning_codes.contains(&codes::MISSING_COMPANY));
        assert!(warning_codes.contains(&codes::EXTRA_COMPANY));
    }

    #[test]
    fn macro_freshness_ages_then_goes_stale() {
        let pack = datapack(json!({
            "SHEL": company("SHEL", found(210.0)),
            "BP": company("BP", found(90.0)),
        }));

        let aging = validate(&pack, "2025-03-12T13:00:00Z");
        assert!(aging.passed);
        assert_eq!(aging.warnings[0].code, codes::MACRO_AGING);

        let stale = validate(&pack, "2025-03-20T13:00:00Z");
        assert!(stale.has_error_code(codes::MACRO_STALE));
    }

    #[test]
    fn required_macro_and_coverage_rules() {
        let mut pack = datapack(json!({
            "SHEL": {"ticker": "SHEL", "name": "Shell", "valuation": {"market_cap": found(210.0)}},
            "BP": company("BP", found(90.0)),
        }));
        pack["macro"] = json!({});
        pack["collection_log"]["duration_seconds"] = json!(90_000);
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert_eq!(result.error_codes(), vec![codes::MISSING_REQUIRED_MACRO]);
        let warning_codes: Vec<_> = result.warnings.iter().map(|w| w.code.as_str()).collect();
        assert_eq!(warning_codes, vec![codes::TEMPORAL_SPREAD]);
    }

    fn warning_codes_for<'r>(result: &'r GateResult, ticker: &str) -> Vec<&'r str> {
        result
            .warnings
            .iter()
            .filter(|warning| warning.ticker.as_deref() == Some(ticker))
            .map(|warning| warning.code.as_str())
            .collect()
    }

    #[test]
    fn peer_schema_violation_is_a_warning() {
        let mut bp = company("BP", found(90.0));
        bp["valuation"]["market_cap"]["unit"] = json!("furlongs");
        let pack = datapack(json!({"SHEL": company("SHEL", found(210.0)), "BP": bp}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert!(result.passed, "{:?}", result.errors);
        assert!(result.errors.is_empty());
        let bp_warning = result
            .warnings
            .iter()
            .find(|warning| warning.code == codes::SCHEMA_INVALID)
            .expect("schema warning");
        assert_eq!(bp_warning.ticker.as_deref(), Some("BP"));
        assert_eq!(bp_warning.path.as_deref(), Some("companies.BP.valuation.market_cap.unit"));
        assert!(!warning_codes_for(&result, "BP").contains(&codes::MISSING_COMPANY));
    }

    #[test]
    fn focal_schema_violation_fails_and_keeps_peer_warnings() {
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["market_cap"]["unit"] = json!("furlongs");
        let mut pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        pack["collection_log"]["company_statuses"]["BP"] = json!("unknown");
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert!(!result.passed);
        assert_eq!(result.error_codes(), vec![codes::SCHEMA_INVALID]);
        assert!(result.errors[0].message.contains("companies.SHEL.valuation.market_cap.unit"));
        assert!(!result.errors[0].message.contains("company_statuses.BP"));
        assert_eq!(warning_codes_for(&result, "BP"), vec![codes::SCHEMA_INVALID]);
    }

    #[test]
    fn hard_range_breach_fails_focal_and_warns_for_peer() {
        // 0.001 billions is one million, below the ten million floor.
        let focal = datapack(json!({
            "SHEL": company("SHEL", found(0.001)),
            "BP": company("BP", found(90.0)),
        }));
        let result = validate(&focal, "2025-03-03T13:00:00Z");
        assert!(!result.passed);
        assert_eq!(result.error_codes(), vec![codes::RANGE_VIOLATION]);
        assert_eq!(
            result.errors[0].path.as_deref(),
            Some("companies.SHEL.valuation.market_cap.value")
        );

        let peer = datapack(json!({
            "SHEL": company("SHEL", found(210.0)),
            "BP": company("BP", found(0.001)),
        }));
        let result = validate(&peer, "2025-03-03T13:00:00Z");
        assert!(result.passed);
        assert_eq!(warning_codes_for(&result, "BP"), vec![codes::RANGE_VIOLATION]);
    }

    #[test]
    fn soft_range_breach_is_suspect() {
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["div_yield"] = found(40.0);
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert!(result.passed);
        assert_eq!(warning_codes_for(&result, "SHEL"), vec![codes::RANGE_SUSPECT]);
    }

    #[test]
    fn cross_field_inconsistencies_warn() {
        let mut shell = company("SHEL", found(200.0));
        // 2B of free cash flow on a 200B cap implies 1%, not 10%.
        shell["valuation"]["free_cash_flow_ttm"] = found(2.0);
        shell["valuation"]["fcf_yield"] = found(10.0);
        shell["valuation"]["fwd_pe"] = found(30.0);
        shell["valuation"]["trailing_pe"] = found(10.0);
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert!(result.passed);
        let paths: Vec<_> = result
            .warnings
            .iter()
            .filter(|warning| warning.code == codes::CROSS_FIELD)
            .filter_map(|warning| warning.path.as_deref())
            .collect();
        assert_eq!(
            paths,
            vec![
                "companies.SHEL.valuation.fcf_yield.value",
                "companies.SHEL.valuation.fwd_pe.value",
            ]
        );
    }

    #[test]
    fn consistent_fcf_yield_is_quiet() {
        let mut shell = company("SHEL", found(200.0));
        shell["valuation"]["free_cash_flow_ttm"] = found(20.0);
        shell["valuation"]["fcf_yield"] = found(10.5);
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");
        assert!(result.warnings.is_empty(), "{:?}", result.warnings);
    }

    #[test]
    fn source_hosts_outside_the_allowlist_fail() {
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["market_cap"]["source_url"] = json!("https://quotes.example.net/SHEL");
        shell["valuation"]["div_yield"]["source_url"] = json!("not a url");
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert!(!result.passed);
        assert!(result.has_error_code(codes::SOURCE_DOMAIN_NOT_ALLOWED));
        assert!(result.has_error_code(codes::INVALID_SOURCE_URL));
    }

    #[test]
    fn configured_hosts_and_internal_schemes_are_accepted() {
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["market_cap"]["source_url"] = json!("https://quotes.example.net/SHEL");
        shell["valuation"]["div_yield"]["source_url"] = json!("cache://oil-majors/SHEL");
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));

        let industry = industry();
        let focals = industry.resolve_focals(&[]).expect("focals");
        let context = GateContext {
            industry: &industry,
            focals: &focals,
            now: UtcDateTime::parse("2025-03-03T13:00:00Z").expect("now"),
        };
        let rules = SemanticRules::default().allow_source_host("Quotes.Example.net");
        let result = GateValidator::default()
            .with_semantic_rules(rules)
            .validate(&pack, context);
        assert!(result.passed, "{:?}", result.errors);
    }

    #[test]
    fn market_dates_must_not_be_in_the_future_or_stale() {
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["market_cap"]["as_of"] = json!("2025-03-10");
        shell["valuation"]["div_yield"]["as_of"] = json!("2023-01-02");
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert_eq!(result.error_codes(), vec![codes::TEMPORAL_INVALID]);
        assert_eq!(warning_codes_for(&result, "SHEL"), vec![codes::RANGE_SUSPECT]);

        // One day ahead is tolerated.
        let mut shell = company("SHEL", found(210.0));
        shell["valuation"]["market_cap"]["as_of"] = json!("2025-03-04");
        let pack = datapack(json!({"SHEL": shell, "BP": company("BP", found(90.0))}));
        assert!(validate(&pack, "2025-03-03T13:00:00Z").passed);
    }

    #[test]
    fn macro_values_must_be_positive() {
        let mut pack = datapack(json!({
            "SHEL": company("SHEL", found(210.0)),
            "BP": company("BP", found(90.0)),
        }));
        pack["macro"]["brent_crude"]["value"] = json!(-1.5);
        let result = validate(&pack, "2025-03-03T13:00:00Z");

        assert_eq!(result.error_codes(), vec![codes::RANGE_VIOLATION]);
        assert_eq!(result.errors[0].path.as_deref(), Some("macro.brent_crude.value"));
    }
}
