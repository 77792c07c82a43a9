use scraper::{ElementRef, Html};
use serde_json::Value;

use crate::adapters::{
    element_text, metric_kind, parse_value, require_html, require_json, selector, AdapterError,
    Extraction, ParsedValue, SourceAdapter, ValueKind,
};
use crate::candidates::ProviderId;
use crate::domain::{DataPoint, DatapointKey, Scale, Section, SourceLocator};
use crate::fetch::FetchResult;

/// Quote page fields by `data-test` attribute.
const QUOTE_FIELDS: &[(&str, &str)] = &[
    ("market_cap", "MARKET_CAP-value"),
    ("fwd_pe", "FORWARD_PE-value"),
    ("trailing_pe", "PE_RATIO-value"),
    ("ev_ebitda", "ENTERPRISE_VALUE_EBITDA-value"),
    ("div_yield", "DIVIDEND_AND_YIELD-value"),
    ("price_to_book", "PB_RATIO-value"),
];

const MACRO_PRICE_SELECTOR: &str = r#"fin-streamer[data-field="regularMarketPrice"]"#;

/// `finance.yahoo.com/quote/{ticker}` pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct YahooQuoteAdapter;

impl YahooQuoteAdapter {
    fn css_for(key: &DatapointKey) -> Option<String> {
        match key.section() {
            Section::Macro => Some(MACRO_PRICE_SELECTOR.to_owned()),
            Section::Valuation => QUOTE_FIELDS
                .iter()
                .find(|(name, _)| *name == key.name())
                .map(|(_, field)| format!(r#"td[data-test="{field}"]"#)),
            _ => None,
        }
    }
}

impl SourceAdapter for YahooQuoteAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::YahooFinance
    }

    fn supports(&self, key: &DatapointKey) -> bool {
        Self::css_for(key).is_some()
    }

    fn parse(
        &self,
        result: &FetchResult,
        key: &DatapointKey,
    ) -> Result<Option<DataPoint>, AdapterError> {
        require_html(self.id(), result)?;
        let Some(css) = Self::css_for(key) else {
            return Ok(None);
        };
        let document = Html::parse_document(&result.text());
        let field = selector(self.id(), result, &css)?;
        let Some(element) = document.select(&field).next() else {
            return Ok(None);
        };

        let kind = metric_kind(key);
        let Some(parsed) = parse_value(&element_text(element), kind) else {
            return Ok(None);
        };
        let context = element
            .parent()
            .and_then(ElementRef::wrap)
            .map_or_else(|| element_text(element), element_text);
        let locator = SourceLocator::html(css, &context)
            .map_err(|error| AdapterError::new(self.id(), result, error.to_string()))?;

        Extraction::new(parsed, kind, locator)
            .into_datapoint(self.id(), result, false)
            .map(Some)
    }
}

/// quoteSummary paths relative to `quoteSummary.result[0]`.
const SUMMARY_FIELDS: &[(Section, &str, &str)] = &[
    (Section::Valuation, "market_cap", "price.marketCap"),
    (Section::Valuation, "fwd_pe", "defaultKeyStatistics.forwardPE"),
    (Section::Valuation, "ev_ebitda", "defaultKeyStatistics.enterpriseToEbitda"),
    (Section::Valuation, "price_to_book", "defaultKeyStatistics.priceToBook"),
    (Section::Valuation, "enterprise_value", "defaultKeyStatistics.enterpriseValue"),
    (Section::Valuation, "free_cash_flow_ttm", "financialData.freeCashflow"),
    (Section::Valuation, "net_debt_ebitda", "financialData.netDebtToEbitda"),
    (Section::Financials, "revenue", "financialData.totalRevenue"),
    (Section::Financials, "ebitda", "financialData.ebitda"),
    (Section::Financials, "total_debt", "financialData.totalDebt"),
    (Section::Financials, "total_cash", "financialData.totalCash"),
    (Section::Financials, "operating_cash_flow", "financialData.operatingCashflow"),
    (Section::Financials, "gross_margin", "financialData.grossMargins"),
    (Section::Financials, "operating_margin", "financialData.operatingMargins"),
    (Section::Financials, "profit_margin", "financialData.profitMargins"),
];

const MACRO_PRICE_PATH: &str = "price.regularMarketPrice";
const RESULT_ROOT: &str = "quoteSummary.result[0]";

/// `query1.finance.yahoo.com` quoteSummary JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct YahooApiAdapter;

impl YahooApiAdapter {
    fn path_for(key: &DatapointKey) -> Option<&'static str> {
        if key.section() == Section::Macro {
            return Some(MACRO_PRICE_PATH);
        }
        SUMMARY_FIELDS
            .iter()
            .find(|(section, name, _)| *section == key.section() && *name == key.name())
            .map(|(_, _, path)| *path)
    }
}

impl SourceAdapter for YahooApiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::YahooFinanceApi
    }

    fn supports(&self, key: &DatapointKey) -> bool {
        Self::path_for(key).is_some()
    }

    fn parse(
        &self,
        result: &FetchResult,
        key: &DatapointKey,
    ) -> Result<Option<DataPoint>, AdapterError> {
        let document = require_json(self.id(), result)?;
        if let Some(error) = lookup(&document, "quoteSummary.error").filter(|e| !e.is_null()) {
            return Err(AdapterError::new(
                self.id(),
                result,
                format!("quoteSummary error: {error}"),
            ));
        }
        let Some(root) = lookup(&document, RESULT_ROOT) else {
            return Err(AdapterError::new(self.id(), result, "quoteSummary has no result"));
        };
        let Some(path) = Self::path_for(key) else {
            return Ok(None);
        };
        let Some(node) = lookup(root, path) else {
            return Ok(None);
        };
        let Some(raw) = unwrap_raw(node) else {
            return Ok(None);
        };

        let kind = metric_kind(key);
        let mut value = raw;
        // Yahoo publishes margins and yields as fractions.
        if kind == ValueKind::Percent {
            value *= 100.0;
        }
        let mut currency = None;
        if kind == ValueKind::Money {
            let published = lookup(root, "price.currency")
                .and_then(Value::as_str)
                .unwrap_or("USD");
            // GBp quotes are pence.
            if published == "GBp" {
                value /= 100.0;
            }
            currency = Some(published.to_ascii_uppercase());
        }

        let snippet = serde_json::to_string(node).unwrap_or_default();
        let locator = SourceLocator::json(format!("$.{RESULT_ROOT}.{path}"), &snippet)
            .map_err(|error| AdapterError::new(self.id(), result, error.to_string()))?;
        let parsed = ParsedValue {
            value,
            currency,
            scale: Scale::Units,
        };

        Extraction::new(parsed, kind, locator)
            .into_datapoint(self.id(), result, true)
            .map(Some)
    }
}

/// Walk a dotted path with `[n]` indices (`a.b[0].c`).
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |node, segment| {
        let (name, indices) = match segment.find('[') {
            Some(open) => (&segment[..open], &segment[open..]),
            None => (segment, ""),
        };
        let mut node = if name.is_empty() { node } else { node.get(name)? };
        for index in indices.split('[').filter(|part| !part.is_empty()) {
            let index: usize = index.trim_end_matches(']').parse().ok()?;
            node = node.get(index)?;
        }
        Some(node)
    })
}

/// Numeric value of a plain number, numeric string or `{raw, fmt}` object.
pub(crate) fn unwrap_raw(node: &Value) -> Option<f64> {
    let node = node.get("raw").unwrap_or(node);
    match node {
        Value::Number(number) => number.as_f64().filter(|value| value.is_finite()),
        Value::String(text) => parse_value(text, ValueKind::Number).map(|parsed| parsed.value),
        _ => None,
    }
}
