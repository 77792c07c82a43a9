//! Plausibility rules run between the schema and completeness layers.
//!
//! Hard range breaches, future market dates and untrusted source hosts are
//! errors (demoted for peers like every other company finding). Soft range
//! breaches, stale market dates and cross-field inconsistencies are warnings.

use std::collections::BTreeSet;

use url::Url;

use super::{codes, CompanyView, Findings, GateFinding, PackView};
use crate::domain::{parse_date, DataPointRecord, UtcDateTime};

/// Bounds for one valuation metric.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRule {
    pub metric: String,
    pub min: f64,
    pub max: f64,
    /// A breach fails the gate instead of warning.
    pub hard: bool,
}

impl RangeRule {
    pub fn warning(metric: &str, min: f64, max: f64) -> Self {
        Self {
            metric: metric.to_owned(),
            min,
            max,
            hard: false,
        }
    }

    pub fn error(metric: &str, min: f64, max: f64) -> Self {
        Self {
            hard: true,
            ..Self::warning(metric, min, max)
        }
    }
}

const DEFAULT_SOURCE_HOSTS: &[&str] = &[
    "finance.yahoo.com",
    "query1.finance.yahoo.com",
    "www.reuters.com",
    "www.wsj.com",
    "www.bloomberg.com",
    "www.morningstar.com",
    "seekingalpha.com",
    "stockanalysis.com",
    "api.eia.gov",
    "rigcount.bakerhughes.com",
];

#[derive(Debug, Clone, PartialEq)]
pub struct SemanticRules {
    pub ranges: Vec<RangeRule>,
    /// Relative difference allowed between reported and implied FCF yield.
    pub fcf_yield_tolerance: f64,
    /// Forward P/E above trailing P/E times this factor is flagged.
    pub forward_pe_factor: f64,
    pub max_as_of_age_days: i64,
    pub max_future_as_of_days: i64,
    pub allowed_source_hosts: BTreeSet<String>,
}

impl Default for SemanticRules {
    fn default() -> Self {
        Self {
            ranges: vec![
                RangeRule::error("market_cap", 1e7, 1e13),
                RangeRule::warning("fwd_pe", 0.0, 500.0),
                RangeRule::warning("trailing_pe", 0.0, 500.0),
                RangeRule::warning("ev_ebitda", -100.0, 200.0),
                RangeRule::warning("div_yield", 0.0, 25.0),
                RangeRule::warning("fcf_yield", -50.0, 50.0),
                RangeRule::warning("net_debt_ebitda", -10.0, 20.0),
                RangeRule::warning("price_to_book", 0.0, 100.0),
            ],
            fcf_yield_tolerance: 0.2,
            forward_pe_factor: 1.5,
            max_as_of_age_days: 365,
            max_future_as_of_days: 1,
            allowed_source_hosts: DEFAULT_SOURCE_HOSTS.iter().map(|host| (*host).to_owned()).collect(),
        }
    }
}

impl SemanticRules {
    /// Replace the trusted source hosts.
    #[must_use]
    pub fn with_allowed_source_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_source_hosts = hosts
            .into_iter()
            .map(|host| host.into().to_ascii_lowercase())
            .collect();
        self
    }

    /// Trust one more source host.
    #[must_use]
    pub fn allow_source_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_source_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    pub(super) fn check(&self, pack: &PackView, now: UtcDateTime, findings: &mut Findings<'_>) {
        for (ticker, company) in &pack.companies {
            self.check_ranges(ticker, company, findings);
            self.check_cross_field(ticker, company, findings);
            for (section, name, record) in company.records() {
                let path = format!("companies.{ticker}.{}.{name}", section.as_str());
                self.check_record(record, &path, name, Some(ticker), now, findings);
            }
        }

        for (name, record) in &pack.macro_data {
            let Some(value) = record.value else {
                continue;
            };
            let path = format!("macro.{name}");
            self.check_record(record, &path, name, None, now, findings);
            if value <= 0.0 {
                findings.push(
                    GateFinding::new(
                        codes::RANGE_VIOLATION,
                        format!("Macro {name} must be positive, got {value}"),
                    )
                    .at(format!("{path}.value")),
                );
            }
        }
    }

    fn check_ranges(&self, ticker: &str, company: &CompanyView, findings: &mut Findings<'_>) {
        for rule in &self.ranges {
            let Some(record) = company.valuation.get(&rule.metric) else {
                continue;
            };
            let value = if rule.metric == "market_cap" {
                base_value(record)
            } else {
                record.value
            };
            let Some(value) = value else {
                continue;
            };
            if (rule.min..=rule.max).contains(&value) {
                continue;
            }

            let name = &rule.metric;
            let finding = GateFinding::new(
                if rule.hard {
                    codes::RANGE_VIOLATION
                } else {
                    codes::RANGE_SUSPECT
                },
                format!(
                    "{name} value {value} is outside expected range [{}, {}] for {ticker}",
                    rule.min, rule.max
                ),
            )
            .at(format!("companies.{ticker}.valuation.{name}.value"))
            .for_ticker(ticker);
            if rule.hard {
                findings.push(finding);
            } else {
                findings.warn(finding);
            }
        }
    }

    fn check_cross_field(&self, ticker: &str, company: &CompanyView, findings: &mut Findings<'_>) {
        let valuation = &company.valuation;
        let reported = valuation.get("fcf_yield").and_then(|record| record.value);
        let fcf = valuation.get("free_cash_flow_ttm").and_then(base_value);
        let market_cap = valuation.get("market_cap").and_then(base_value);
        if let (Some(reported), Some(fcf), Some(market_cap)) = (reported, fcf, market_cap) {
            if market_cap > 0.0 {
                let implied = fcf / market_cap * 100.0;
                let spread = (reported - implied).abs() / reported.abs().max(implied.abs()).max(0.01);
                if spread > self.fcf_yield_tolerance {
                    findings.warn(
                        GateFinding::new(
                            codes::CROSS_FIELD,
                            format!(
                                "FCF yield ({reported:.2}%) inconsistent with calculated ({implied:.2}%) for {ticker}"
                            ),
                        )
                        .at(format!("companies.{ticker}.valuation.fcf_yield.value"))
                        .for_ticker(ticker),
                    );
                }
            }
        }

        let forward = valuation.get("fwd_pe").and_then(|record| record.value);
        let trailing = valuation.get("trailing_pe").and_then(|record| record.value);
        if let (Some(forward), Some(trailing)) = (forward, trailing) {
            if forward > trailing * self.forward_pe_factor {
                findings.warn(
                    GateFinding::new(
                        codes::CROSS_FIELD,
                        format!(
                            "Forward P/E ({forward:.1}) significantly higher than trailing P/E ({trailing:.1}) for {ticker}"
                        ),
                    )
                    .at(format!("companies.{ticker}.valuation.fwd_pe.value"))
                    .for_ticker(ticker),
                );
            }
        }
    }

    /// Source host and market date of one record.
    fn check_record(
        &self,
        record: &DataPointRecord,
        path: &str,
        name: &str,
        ticker: Option<&str>,
        now: UtcDateTime,
        findings: &mut Findings<'_>,
    ) {
        let attributed = |mut finding: GateFinding| {
            finding.ticker = ticker.map(str::to_owned);
            finding
        };
        if let Some(finding) = record
            .source_url
            .as_deref()
            .and_then(|url| self.check_source_url(url, path, name))
        {
            findings.push(attributed(finding));
        }

        let Some(as_of) = record.as_of.as_deref().and_then(|as_of| parse_date(as_of).ok()) else {
            return;
        };
        let age = (now.date() - as_of).whole_days();
        if -age > self.max_future_as_of_days {
            findings.push(attributed(
                GateFinding::new(
                    codes::TEMPORAL_INVALID,
                    format!("{name} at {path} has future as_of date: {as_of}"),
                )
                .at(format!("{path}.as_of")),
            ));
        } else if age > self.max_as_of_age_days {
            findings.warn(attributed(
                GateFinding::new(
                    codes::RANGE_SUSPECT,
                    format!("{name} at {path} has stale as_of date: {as_of} ({age} days old)"),
                )
                .at(format!("{path}.as_of")),
            ));
        }
    }

    fn check_source_url(&self, url: &str, path: &str, name: &str) -> Option<GateFinding> {
        let at = format!("{path}.source_url");
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Some(
                    GateFinding::new(
                        codes::INVALID_SOURCE_URL,
                        format!("Invalid source_url format for {name}: {url}"),
                    )
                    .at(at),
                )
            }
        };
        // cache:// and similar internal schemes are not fetched from the web.
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        let Some(host) = parsed.host_str().filter(|host| !host.is_empty()) else {
            return Some(
                GateFinding::new(
                    codes::INVALID_SOURCE_URL,
                    format!("Invalid source_url format for {name}: {url}"),
                )
                .at(at),
            );
        };
        let host = host.to_ascii_lowercase();
        if self.allowed_source_hosts.contains(&host) {
            return None;
        }
        Some(
            GateFinding::new(
                codes::SOURCE_DOMAIN_NOT_ALLOWED,
                format!("Source URL domain '{host}' is not in allowlist for {name}"),
            )
            .at(at),
        )
    }
}

/// Value multiplied out to units, for money measures with a scale.
fn base_value(record: &DataPointRecord) -> Option<f64> {
    let value = record.value?;
    Some(match record.scale {
        Some(scale) => value * scale.factor(),
        None => value,
    })
}
