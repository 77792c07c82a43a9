//! Collector settings and industry (business) configuration.
//!
//! [`CollectorConfig`] is read from an optional JSON file, falls back to
//! defaults for every missing field, and then applies `DATAPACK_*`
//! environment overrides. Industry definitions come from an
//! [`IndustryConfigProvider`]; the JSON-file provider is the only one
//! shipped here.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use datapack_warehouse::resolve_datapack_home;

use crate::alerts::{
    AlertDispatcher, AlertSeverity, EmailNotifier, LogNotifier, SlackNotifier, SmtpMailTransport,
};
use crate::assembler::MemoryBudget;
use crate::candidates::SourceCandidateFactory;
use crate::domain::{DatapointKey, Section};
use crate::gate::SemanticRules;
use crate::http_client::HttpClient;
use crate::throttle::ThrottlePolicy;
use crate::url_policy::{host_of, AllowedDomainPolicy};
use crate::ValidationError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("industry '{industry_id}' is not configured")]
    UnknownIndustry { industry_id: String },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    pub default_interval_ms: u64,
    pub domain_intervals_ms: BTreeMap<String, u64>,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        let defaults = ThrottlePolicy::default();
        Self {
            default_interval_ms: millis(defaults.interval_for("")),
            domain_intervals_ms: ["finance.yahoo.com", "query1.finance.yahoo.com", "www.reuters.com"]
                .into_iter()
                .map(|domain| (domain.to_owned(), millis(defaults.interval_for(domain))))
                .collect(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// SMTP delivery for alert emails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailSettings {
    pub smtp_host: String,
    #[serde(default)]
    pub smtp_port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default = "critical_only")]
    pub severities: Vec<AlertSeverity>,
}

fn critical_only() -> Vec<AlertSeverity> {
    vec![AlertSeverity::Critical]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub home: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub intermediate_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub throttle: ThrottleSettings,
    pub fetch_timeout_secs: u64,
    pub batch_size: usize,
    pub memory_management: bool,
    pub memory_limit_bytes: u64,
    pub memory_warning_ratio: f64,
    /// Empty means any public host.
    pub allowed_domains: Vec<String>,
    pub macro_staleness_days: u32,
    /// Share of failed companies above which a gate-passing run is `partial`.
    pub partial_failure_ratio: f64,
    pub eia_api_key: Option<String>,
    pub rig_count_feed_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub slack_severities: Vec<AlertSeverity>,
    pub email: Option<EmailSettings>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            home: resolve_datapack_home(),
            output_dir: None,
            intermediate_dir: None,
            db_path: None,
            throttle: ThrottleSettings::default(),
            fetch_timeout_secs: 30,
            batch_size: 10,
            memory_management: false,
            memory_limit_bytes: 512 * 1024 * 1024,
            memory_warning_ratio: 0.8,
            allowed_domains: Vec::new(),
            macro_staleness_days: 10,
            partial_failure_ratio: 0.5,
            eia_api_key: None,
            rig_count_feed_url: None,
            slack_webhook_url: None,
            slack_severities: vec![AlertSeverity::Warning, AlertSeverity::Critical],
            email: None,
        }
    }
}

impl CollectorConfig {
    /// Defaults, overlaid by `path` when given, then by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = match path {
            Some(path) => read_json(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `DATAPACK_*` overrides read through `lookup`. Blank values are
    /// ignored.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(home) = read("DATAPACK_HOME") {
            self.home = PathBuf::from(home);
        }
        if let Some(key) = read("DATAPACK_EIA_API_KEY") {
            self.eia_api_key = Some(key);
        }
        if let Some(url) = read("DATAPACK_RIG_COUNT_FEED_URL") {
            self.rig_count_feed_url = Some(url);
        }
        if let Some(url) = read("DATAPACK_SLACK_WEBHOOK_URL") {
            self.slack_webhook_url = Some(url);
        }
        if let (Some(email), Some(password)) = (self.email.as_mut(), read("DATAPACK_SMTP_PASSWORD")) {
            email.password = Some(password);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |message: &str| {
            Err(ValidationError::InvalidConfig {
                message: message.to_owned(),
            })
        };
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.memory_limit_bytes == 0 {
            return invalid("memory_limit_bytes must be positive");
        }
        if !(0.0..=1.0).contains(&self.memory_warning_ratio) {
            return invalid("memory_warning_ratio must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.partial_failure_ratio) {
            return invalid("partial_failure_ratio must be within 0..=1");
        }
        if self.macro_staleness_days == 0 {
            return invalid("macro_staleness_days must be at least 1");
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.home.join("datapacks"))
    }

    pub fn intermediate_dir(&self) -> PathBuf {
        self.intermediate_dir
            .clone()
            .unwrap_or_else(|| self.home.join("intermediate"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.home.join("state").join("collector.duckdb"))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn throttle_policy(&self) -> ThrottlePolicy {
        self.throttle.domain_intervals_ms.iter().fold(
            ThrottlePolicy::new(Duration::from_millis(self.throttle.default_interval_ms)),
            |policy, (domain, interval)| {
                policy.with_domain_interval(domain.clone(), Duration::from_millis(*interval))
            },
        )
    }

    pub fn domain_policy(&self) -> AllowedDomainPolicy {
        if self.allowed_domains.is_empty() {
            AllowedDomainPolicy::permissive()
        } else {
            AllowedDomainPolicy::allow_only(self.allowed_domains.iter().cloned())
        }
    }

    /// Log notifier always; Slack when a webhook is configured, email when
    /// SMTP settings are present.
    pub fn alert_dispatcher(&self, http: Arc<dyn HttpClient>) -> Result<AlertDispatcher, ConfigError> {
        let mut dispatcher = AlertDispatcher::new(Vec::new()).with_notifier(Arc::new(LogNotifier));
        if let Some(webhook) = self.slack_webhook_url.as_deref() {
            dispatcher = dispatcher.with_notifier(Arc::new(
                SlackNotifier::new(webhook, http).with_severities(self.slack_severities.clone()),
            ));
        }
        if let Some(email) = &self.email {
            let credentials = email
                .username
                .clone()
                .map(|username| (username, email.password.clone().unwrap_or_default()));
            let transport = SmtpMailTransport::relay(&email.smtp_host, email.smtp_port, credentials)
                .map_err(|error| ValidationError::InvalidConfig {
                    message: format!("smtp relay {}: {error}", email.smtp_host),
                })?;
            let notifier = EmailNotifier::new(Arc::new(transport), &email.from, &email.to)?
                .with_severities(email.severities.clone());
            dispatcher = dispatcher.with_notifier(Arc::new(notifier));
        }
        Ok(dispatcher)
    }

    /// Gate plausibility rules. A configured fetch allow-list doubles as the
    /// trusted source hosts, and a custom rig count feed host is trusted.
    pub fn semantic_rules(&self) -> SemanticRules {
        let rules = if self.allowed_domains.is_empty() {
            SemanticRules::default()
        } else {
            SemanticRules::default().with_allowed_source_hosts(self.allowed_domains.iter().cloned())
        };
        match self.rig_count_feed_url.as_deref().and_then(host_of) {
            Some(host) => rules.allow_source_host(host),
            None => rules,
        }
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget::new(self.memory_limit_bytes, self.memory_warning_ratio)
    }

    pub fn candidate_factory(&self) -> SourceCandidateFactory {
        SourceCandidateFactory::new()
            .with_eia_api_key(self.eia_api_key.clone())
            .with_rig_count_feed(self.rig_count_feed_url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub listing_exchange: Option<String>,
}

/// Which companies a required metric applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredScope {
    #[default]
    All,
    Focal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRequirement {
    pub key: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub required_scope: RequiredScope,
}

impl MetricRequirement {
    pub fn is_required_for(&self, focal: bool) -> bool {
        self.required && (focal || self.required_scope == RequiredScope::All)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataRequirements {
    pub valuation: Vec<MetricRequirement>,
    pub financials: Vec<MetricRequirement>,
    pub operational: Vec<MetricRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroRequirement {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

/// One industry: its companies and what must be collected for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndustryConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub companies: Vec<CompanyConfig>,
    #[serde(default)]
    pub focal_tickers: Vec<String>,
    #[serde(default)]
    pub requirements: DataRequirements,
    #[serde(default)]
    pub macro_indicators: Vec<MacroRequirement>,
}

impl IndustryConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.companies.is_empty() {
            return Err(ValidationError::NoCompanies {
                industry_id: self.id.clone(),
            });
        }
        let mut seen = BTreeSet::new();
        for company in &self.companies {
            if company.ticker.trim().is_empty() || !seen.insert(company.ticker.as_str()) {
                return Err(ValidationError::InvalidConfig {
                    message: format!("duplicate or empty ticker '{}'", company.ticker),
                });
            }
        }
        for ticker in &self.focal_tickers {
            self.company(ticker)
                .ok_or_else(|| ValidationError::UnknownFocalTicker {
                    ticker: ticker.clone(),
                })?;
        }
        self.metrics()?;
        self.macro_keys()?;
        Ok(())
    }

    pub fn company(&self, ticker: &str) -> Option<&CompanyConfig> {
        self.companies.iter().find(|company| company.ticker == ticker)
    }

    /// Configured focals plus `extra`, in company order. Without any, the
    /// first company is focal.
    pub fn resolve_focals(&self, extra: &[String]) -> Result<BTreeSet<String>, ValidationError> {
        let mut focals = BTreeSet::new();
        for ticker in self.focal_tickers.iter().chain(extra) {
            if self.company(ticker).is_none() {
                return Err(ValidationError::UnknownFocalTicker {
                    ticker: ticker.clone(),
                });
            }
            focals.insert(ticker.clone());
        }
        if focals.is_empty() {
            if let Some(first) = self.companies.first() {
                focals.insert(first.ticker.clone());
            }
        }
        Ok(focals)
    }

    /// Company metrics as typed keys, in section then declaration order.
    pub fn metrics(&self) -> Result<Vec<(DatapointKey, &MetricRequirement)>, ValidationError> {
        [
            (Section::Valuation, &self.requirements.valuation),
            (Section::Financials, &self.requirements.financials),
            (Section::Operational, &self.requirements.operational),
        ]
        .into_iter()
        .flat_map(|(section, metrics)| metrics.iter().map(move |metric| (section, metric)))
        .map(|(section, metric)| {
            DatapointKey::new(section, metric.key.as_str()).map(|key| (key, metric))
        })
        .collect()
    }

    pub fn macro_keys(&self) -> Result<Vec<(DatapointKey, bool)>, ValidationError> {
        self.macro_indicators
            .iter()
            .map(|indicator| {
                DatapointKey::macro_indicator(&indicator.key).map(|key| (key, indicator.required))
            })
            .collect()
    }
}

/// Source of business configuration.
pub trait IndustryConfigProvider: Send + Sync {
    fn industry(&self, industry_id: &str) -> Result<IndustryConfig, ConfigError>;
}

/// Reads `<id>.json` from a directory, or a single industry file.
#[derive(Debug, Clone)]
pub enum JsonIndustryConfigProvider {
    File(PathBuf),
    Directory(PathBuf),
}

impl JsonIndustryConfigProvider {
    /// A directory path serves one file per industry; anything else is
    /// read as a single industry file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            Self::Directory(path)
        } else {
            Self::File(path)
        }
    }
}

impl IndustryConfigProvider for JsonIndustryConfigProvider {
    fn industry(&self, industry_id: &str) -> Result<IndustryConfig, ConfigError> {
        let path = match self {
            Self::File(path) => path.clone(),
            Self::Directory(dir) => dir.join(format!("{industry_id}.json")),
        };
        let config: IndustryConfig = read_json(&path)?;
        if config.id != industry_id {
            return Err(ConfigError::UnknownIndustry {
                industry_id: industry_id.to_owned(),
            });
        }
        config.validate()?;
        Ok(config)
    }
}

/// Fixed set of industries held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticIndustryConfigProvider {
    industries: BTreeMap<String, IndustryConfig>,
}

impl StaticIndustryConfigProvider {
    pub fn new(industries: impl IntoIterator<Item = IndustryConfig>) -> Self {
        Self {
            industries: industries
                .into_iter()
                .map(|industry| (industry.id.clone(), industry))
                .collect(),
        }
    }
}

impl IndustryConfigProvider for StaticIndustryConfigProvider {
    fn industry(&self, industry_id: &str) -> Result<IndustryConfig, ConfigError> {
        let config = self
            .industries
            .get(industry_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownIndustry {
                industry_id: industry_id.to_owned(),
            })?;
        config.validate()?;
        Ok(config)
    }
}
