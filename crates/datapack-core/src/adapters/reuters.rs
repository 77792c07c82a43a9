use crate::adapters::{labels_for, parse_label_table, AdapterError, LabelTable, SourceAdapter};
use crate::candidates::ProviderId;
use crate::domain::{DataPoint, DatapointKey, Section};
use crate::fetch::FetchResult;

const LABELS: &LabelTable = &[
    (Section::Valuation, "market_cap", &["market cap", "market capitalization"]),
    (Section::Valuation, "fwd_pe", &["forward p/e", "forward pe"]),
    (Section::Valuation, "trailing_pe", &["p/e ratio", "p/e", "trailing p/e"]),
    (Section::Valuation, "ev_ebitda", &["ev/ebitda", "ev / ebitda"]),
    (Section::Valuation, "div_yield", &["dividend yield"]),
    (Section::Valuation, "net_debt_ebitda", &["net debt / ebitda", "net debt/ebitda"]),
    (Section::Valuation, "price_to_book", &["price to book", "p/b ratio", "price/book"]),
];

/// Reuters company key-metrics tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReutersAdapter;

impl SourceAdapter for ReutersAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Reuters
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fixtures;
    use crate::domain::{LocatorType, Measure, Provenance, Scale};

    const PAGE: &str = r#"<html><body>
        <table>
          <tr><th>Market Capitalization</th><td>GBP 160.2B</td></tr>
          <tr><th>P/E</th><td>11.4x</td></tr>
          <tr><th>Dividend Yield:</th><td>3.9%</td></tr>
          <tr><th>Price/Book</th><td>--</td></tr>
        </table>
    </body></html>"#;

    fn page() -> FetchResult {
        fixtures::html("https://www.reuters.com/companies/SHEL.L", PAGE)
    }

    #[test]
    fn reads_currency_rows_with_xpath_locator() -> Result<(), AdapterError> {
        let key = DatapointKey::valuation("market_cap").expect("key");
        let point = ReutersAdapter.parse(&page(), &key)?.expect("market cap");
        assert_eq!(point.value(), Some(160.2));
        assert_eq!(
            point.measure(),
            &Measure::Money {
                currency: "GBP".to_owned(),
                scale: Scale::Billions
            }
        );
        let Provenance::WebFetch { locator, .. } = point.provenance() else {
            panic!("web fetch provenance expected");
        };
        assert_eq!(locator.locator_type(), LocatorType::Xpath);
        assert!(locator.snippet().contains("Market Capitalization"));
        Ok(())
    }

    #[test]
    fn ratio_and_percent_rows() -> Result<(), AdapterError> {
        let trailing = DatapointKey::valuation("trailing_pe").expect("key");
        assert_eq!(
            ReutersAdapter.parse(&page(), &trailing)?.and_then(|p| p.value()),
            Some(11.4)
        );
        let dividend = DatapointKey::valuation("div_yield").expect("key");
        assert_eq!(
            ReutersAdapter.parse(&page(), &dividend)?.and_then(|p| p.value()),
            Some(3.9)
        );
        Ok(())
    }

    #[test]
    fn placeholders_and_unsupported_keys_are_absent() -> Result<(), AdapterError> {
        let book = DatapointKey::valuation("price_to_book").expect("key");
        assert!(ReutersAdapter.parse(&page(), &book)?.is_none());

        let revenue: DatapointKey = "financials.revenue".parse().expect("key");
        assert!(!ReutersAdapter.supports(&revenue));
        Ok(())
    }
}
