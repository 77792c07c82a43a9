use crate::adapters::{labels_for, parse_label_table, AdapterError, LabelTable, SourceAdapter};
use crate::candidates::ProviderId;
use crate::domain::{DataPoint, DatapointKey, Section};
use crate::fetch::FetchResult;

const LABELS: &LabelTable = &[
    (Section::Valuation, "market_cap", &["market cap", "market capitalization"]),
    (Section::Valuation, "enterprise_value", &["enterprise value"]),
    (Section::Valuation, "fwd_pe", &["forward pe", "forward p/e"]),
    (Section::Valuation, "trailing_pe", &["pe ratio", "p/e ratio"]),
    (Section::Valuation, "ev_ebitda", &["ev / ebitda", "ev/ebitda"]),
    (Section::Valuation, "price_to_book", &["pb ratio", "p/b ratio"]),
    (Section::Valuation, "div_yield", &["dividend yield", "dividend"]),
    (Section::Financials, "revenue", &["revenue", "revenue (ttm)"]),
    (Section::Financials, "net_income", &["net income", "net income (ttm)"]),
    (Section::Financials, "ebitda", &["ebitda"]),
    (Section::Financials, "free_cash_flow", &["free cash flow"]),
    (Section::Financials, "total_debt", &["total debt"]),
];

/// stockanalysis.com overview and statistics tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct StockAnalysisAdapter;

impl SourceAdapter for StockAnalysisAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::StockAnalysis
    }

    fn supports(&self, key: &DatapointKey) -> bool {
        labels_for(LABELS, key).is_some()
    }

    fn parse(
        &self,
        result: &FetchResult,
        key: &DatapointKey,
    ) -> Result<Option<DataPoint>, AdapterError> {
        parse_label_table(self.id(), result, key, LABELS)
    }
}
