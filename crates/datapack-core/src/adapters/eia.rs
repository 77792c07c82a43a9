use serde_json::Value;

use crate::adapters::yahoo::{lookup, unwrap_raw};
use crate::adapters::{require_json, AdapterError, Extraction, ParsedValue, SourceAdapter, ValueKind};
use crate::candidates::ProviderId;
use crate::domain::timestamp::parse_date;
use crate::domain::{DataPoint, DatapointKey, Scale, Section, SourceLocator};
use crate::fetch::FetchResult;

const SUPPORTED: &[&str] = &["oil_inventory", "inventory"];

/// EIA v2 weekly petroleum stocks, newest period first.
#[derive(Debug, Default, Clone, Copy)]
pub struct EiaInventoryAdapter;

impl SourceAdapter for EiaInventoryAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::EiaInventory
    }

    fn supports(&self, key: &DatapointKey) -> bool {
        key.section() == Section::Macro && SUPPORTED.contains(&key.name())
    }

    fn parse(
        &self,
        result: &FetchResult,
        key: &DatapointKey,
    ) -> Result<Option<DataPoint>, AdapterError> {
        if !self.supports(key) {
            return Ok(None);
        }
        let document = require_json(self.id(), result)?;
        let latest = match lookup(&document, "response.data[0]") {
            Some(Value::Object(latest)) => latest,
            Some(_) => return Err(AdapterError::new(self.id(), result, "invalid response data")),
            None => return Err(AdapterError::new(self.id(), result, "missing response data")),
        };
        let Some(value) = latest.get("value").and_then(unwrap_raw) else {
            return Ok(None);
        };

        let period = latest.get("period").and_then(Value::as_str);
        let units = latest.get("units").and_then(Value::as_str);
        let snippet = format!(
            "value={value} units={} period={}",
            units.unwrap_or("unknown"),
            period.unwrap_or("unknown")
        );
        let locator = SourceLocator::json("$.response.data[0].value", &snippet)
            .map_err(|error| AdapterError::new(self.id(), result, error.to_string()))?;
        let parsed = ParsedValue {
            value,
            currency: None,
            scale: Scale::Units,
        };

        Extraction::new(parsed, ValueKind::Number, locator)
            .with_as_of(period.and_then(|period| parse_date(period).ok()))
            .into_datapoint(self.id(), result, true)
            .map(Some)
    }
}
