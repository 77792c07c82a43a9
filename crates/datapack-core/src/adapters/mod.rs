//! Provider-specific response parsers.
//!
//! Each [`SourceAdapter`] turns one [`FetchResult`] into at most one
//! [`DataPoint`] for a requested key. `Ok(None)` means the page was read but
//! the value is not on it; `Err` means the response could not be read at
//! all. The adapter chain treats both as "try the next candidate".

use std::collections::BTreeMap;
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use time::Date;

use crate::candidates::ProviderId;
use crate::domain::{
    DataPoint, DatapointKey, Measure, Provenance, Scale, Section, SourceLocator,
};
use crate::fetch::FetchResult;

pub mod eia;
pub mod parse;
pub mod reuters;
pub mod rig_count;
pub mod stockanalysis;
pub mod yahoo;

pub use eia::EiaInventoryAdapter;
pub use parse::{parse_value, ParsedValue, ValueKind};
pub use reuters::ReutersAdapter;
pub use rig_count::RigCountAdapter;
pub use stockanalysis::StockAnalysisAdapter;
pub use yahoo::{YahooApiAdapter, YahooQuoteAdapter};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{adapter} could not parse {url}: {message}")]
pub struct AdapterError {
    pub adapter: ProviderId,
    pub url: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(adapter: ProviderId, result: &FetchResult, message: impl Into<String>) -> Self {
        Self {
            adapter,
            url: result.final_url.clone(),
            message: message.into(),
        }
    }
}

pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    fn supports(&self, key: &DatapointKey) -> bool;

    fn parse(
        &self,
        result: &FetchResult,
        key: &DatapointKey,
    ) -> Result<Option<DataPoint>, AdapterError>;
}

/// Adapters by provider id, consulted by the chain for each candidate.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<ProviderId, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in adapter.
    pub fn builtin() -> Self {
        Self::new()
            .with_adapter(Arc::new(YahooQuoteAdapter))
            .with_adapter(Arc::new(YahooApiAdapter))
            .with_adapter(Arc::new(StockAnalysisAdapter))
            .with_adapter(Arc::new(ReutersAdapter))
            .with_adapter(Arc::new(RigCountAdapter))
            .with_adapter(Arc::new(EiaInventoryAdapter))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.id(), adapter);
        self
    }

    pub fn get(&self, provider: ProviderId) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.get(&provider)
    }
}

/// Unit a datapoint name is published in, used for parsing and for
/// documenting absences.
pub fn metric_kind(key: &DatapointKey) -> ValueKind {
    match (key.section(), key.name()) {
        (
            Section::Valuation,
            "market_cap" | "enterprise_value" | "free_cash_flow_ttm",
        ) => ValueKind::Money,
        (Section::Valuation, "div_yield" | "fcf_yield") => ValueKind::Percent,
        (Section::Valuation, _) => ValueKind::Ratio,
        (Section::Financials, name)
            if name.ends_with("_margin") || name.ends_with("_growth") =>
        {
            ValueKind::Percent
        }
        (Section::Financials, _) => ValueKind::Money,
        (Section::Macro, "rig_count" | "oil_inventory" | "inventory") => ValueKind::Number,
        (Section::Macro, _) => ValueKind::Money,
        (Section::Operational, _) => ValueKind::Number,
    }
}

/// Measure used for a documented absence of `key`.
pub fn absent_measure(key: &DatapointKey) -> Measure {
    match metric_kind(key) {
        ValueKind::Money => Measure::Money {
            currency: "USD".to_owned(),
            scale: Scale::Units,
        },
        ValueKind::Ratio => Measure::Ratio,
        ValueKind::Percent => Measure::Percent,
        ValueKind::Number => Measure::Number,
    }
}

/// Location and value an adapter found, before provenance is attached.
pub(crate) struct Extraction {
    pub parsed: ParsedValue,
    pub kind: ValueKind,
    pub locator: SourceLocator,
    pub as_of: Option<Date>,
}

impl Extraction {
    pub(crate) fn new(parsed: ParsedValue, kind: ValueKind, locator: SourceLocator) -> Self {
        Self {
            parsed,
            kind,
            locator,
            as_of: None,
        }
    }

    pub(crate) fn with_as_of(mut self, as_of: Option<Date>) -> Self {
        self.as_of = as_of;
        self
    }

    /// Web pages become `web_fetch` datapoints, JSON APIs become `api`.
    pub(crate) fn into_datapoint(
        self,
        provider: ProviderId,
        result: &FetchResult,
        api: bool,
    ) -> Result<DataPoint, AdapterError> {
        let invalid = |error: crate::ValidationError| {
            AdapterError::new(provider, result, error.to_string())
        };

        let measure = match self.kind {
            ValueKind::Money => Measure::money(
                self.parsed.currency.unwrap_or_else(|| "USD".to_owned()),
                self.parsed.scale,
            )
            .map_err(invalid)?,
            ValueKind::Ratio => Measure::Ratio,
            ValueKind::Percent => Measure::Percent,
            ValueKind::Number => Measure::Number,
        };
        let source_url = result.final_url.clone();
        let provenance = if api {
            Provenance::Api {
                source_url,
                locator: self.locator,
            }
        } else {
            Provenance::WebFetch {
                source_url,
                locator: self.locator,
            }
        };

        let datapoint = DataPoint::new(
            measure,
            Some(self.parsed.value),
            provenance,
            result.retrieved_at,
        )
        .map_err(invalid)?
        .with_provider(provider.as_str());
        Ok(match self.as_of {
            Some(as_of) => datapoint.with_as_of(as_of),
            None => datapoint,
        })
    }
}

pub(crate) fn selector(provider: ProviderId, result: &FetchResult, css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css)
        .map_err(|error| AdapterError::new(provider, result, format!("bad selector {css}: {error}")))
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn require_html(provider: ProviderId, result: &FetchResult) -> Result<(), AdapterError> {
    if !result.is_success() {
        return Err(AdapterError::new(
            provider,
            result,
            format!("unexpected status {}", result.status),
        ));
    }
    if !result.is_html() {
        return Err(AdapterError::new(
            provider,
            result,
            format!("expected html, got {}", result.content_type),
        ));
    }
    Ok(())
}

pub(crate) fn require_json(
    provider: ProviderId,
    result: &FetchResult,
) -> Result<serde_json::Value, AdapterError> {
    if !result.is_success() {
        return Err(AdapterError::new(
            provider,
            result,
            format!("unexpected status {}", result.status),
        ));
    }
    serde_json::from_slice(&result.body)
        .map_err(|error| AdapterError::new(provider, result, format!("invalid json: {error}")))
}

/// A labelled table row as `label -> last cell`.
pub(crate) struct LabelMatch {
    pub label: String,
    pub value: String,
    pub row_text: String,
}

fn normalize_label(label: &str) -> String {
    label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(':')
        .trim()
        .to_owned()
}

/// First `<tr>` whose first cell matches one of `labels`, case-insensitive.
pub(crate) fn find_labelled_row(
    provider: ProviderId,
    result: &FetchResult,
    document: &Html,
    labels: &[&str],
) -> Result<Option<LabelMatch>, AdapterError> {
    let rows = selector(provider, result, "tr")?;
    let cells = selector(provider, result, "th, td")?;
    let wanted: Vec<String> = labels.iter().map(|label| normalize_label(label)).collect();

    for row in document.select(&rows) {
        let row_cells: Vec<ElementRef<'_>> = row.select(&cells).collect();
        if row_cells.len() < 2 {
            continue;
        }
        let label = element_text(row_cells[0]);
        if !wanted.contains(&normalize_label(&label)) {
            continue;
        }
        let value = element_text(row_cells[row_cells.len() - 1]);
        if value.is_empty() {
            return Ok(None);
        }
        return Ok(Some(LabelMatch {
            label,
            value,
            row_text: element_text(row),
        }));
    }
    Ok(None)
}

/// XPath naming the value cell of a labelled row.
pub(crate) fn row_xpath(label: &str) -> String {
    format!(
        "//tr[normalize-space((th|td)[1])=\"{}\"]/*[last()]",
        label.replace('"', "'")
    )
}

/// Row labels a provider prints for each datapoint it carries.
pub(crate) type LabelTable = [(Section, &'static str, &'static [&'static str])];

pub(crate) fn labels_for<'t>(table: &'t LabelTable, key: &DatapointKey) -> Option<&'t [&'static str]> {
    table
        .iter()
        .find(|(section, name, _)| *section == key.section() && *name == key.name())
        .map(|(_, _, labels)| *labels)
}

pub(crate) fn parse_label_table(
    provider: ProviderId,
    result: &FetchResult,
    key: &DatapointKey,
    table: &LabelTable,
) -> Result<Option<DataPoint>, AdapterError> {
    require_html(provider, result)?;
    let Some(labels) = labels_for(table, key) else {
        return Ok(None);
    };

    let document = Html::parse_document(&result.text());
    let Some(found) = find_labelled_row(provider, result, &document, labels)? else {
        return Ok(None);
    };
    let kind = metric_kind(key);
    let Some(parsed) = parse_value(&found.value, kind) else {
        return Ok(None);
    };
    let locator = SourceLocator::xpath(row_xpath(&found.label), &found.row_text)
        .map_err(|error| AdapterError::new(provider, result, error.to_string()))?;

    Extraction::new(parsed, kind, locator)
        .into_datapoint(provider, result, false)
        .map(Some)
}
