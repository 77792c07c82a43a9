//! Typed datapoints with method-specific provenance.
//!
//! A [`DataPoint`] can only be built through [`DataPoint::new`] or from a
//! [`DataPointRecord`], and both paths validate that the provenance required
//! by the collection method is present. Deserialized datapoints go through
//! the same check.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::domain::locator::SourceLocator;
use crate::domain::timestamp::{format_date, parse_date, UtcDateTime};
use crate::ValidationError;

/// How a datapoint's value was obtained, or why it is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMethod {
    WebFetch,
    WebSearch,
    Api,
    NotFound,
    Derived,
    Cache,
}

impl CollectionMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WebFetch => "web_fetch",
            Self::WebSearch => "web_search",
            Self::Api => "api",
            Self::NotFound => "not_found",
            Self::Derived => "derived",
            Self::Cache => "cache",
        }
    }
}

impl Display for CollectionMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionMethod {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "web_fetch" => Ok(Self::WebFetch),
            "web_search" => Ok(Self::WebSearch),
            "api" => Ok(Self::Api),
            "not_found" => Ok(Self::NotFound),
            "derived" => Ok(Self::Derived),
            "cache" => Ok(Self::Cache),
            _ => Err(ValidationError::InvalidMethod {
                value: value.to_owned(),
            }),
        }
    }
}

/// Magnitude of a money value as published by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Units,
    Thousands,
    Millions,
    Billions,
    Trillions,
}

impl Scale {
    pub const fn factor(self) -> f64 {
        match self {
            Self::Units => 1.0,
            Self::Thousands => 1e3,
            Self::Millions => 1e6,
            Self::Billions => 1e9,
            Self::Trillions => 1e12,
        }
    }

    /// Map a `T`/`B`/`M`/`K` suffix to a scale; anything else is units.
    pub fn from_suffix(suffix: &str) -> Self {
        match suffix.to_ascii_uppercase().as_str() {
            "T" => Self::Trillions,
            "B" => Self::Billions,
            "M" => Self::Millions,
            "K" => Self::Thousands,
            _ => Self::Units,
        }
    }
}

/// Unit-specific part of a datapoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Measure {
    Money { currency: String, scale: Scale },
    Ratio,
    Percent,
    Number,
}

impl Measure {
    pub fn money(currency: impl Into<String>, scale: Scale) -> Result<Self, ValidationError> {
        let currency = currency.into();
        let valid = currency.len() == 3 && currency.bytes().all(|b| b.is_ascii_uppercase());
        if !valid {
            return Err(ValidationError::InvalidCurrency { value: currency });
        }
        Ok(Self::Money { currency, scale })
    }

    pub const fn unit(&self) -> &'static str {
        match self {
            Self::Money { .. } => "currency",
            Self::Ratio => "ratio",
            Self::Percent => "percent",
            Self::Number => "number",
        }
    }
}

/// Method-specific evidence for a datapoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Provenance {
    WebFetch {
        source_url: String,
        locator: SourceLocator,
    },
    WebSearch {
        source_url: String,
        locator: SourceLocator,
    },
    Api {
        source_url: String,
        locator: SourceLocator,
    },
    NotFound {
        attempted_sources: Vec<String>,
    },
    Derived {
        derived_from: Vec<String>,
        formula: String,
    },
    Cache {
        cache_source: String,
        cache_age_days: u32,
    },
}

impl Provenance {
    pub const fn method(&self) -> CollectionMethod {
        match self {
            Self::WebFetch { .. } => CollectionMethod::WebFetch,
            Self::WebSearch { .. } => CollectionMethod::WebSearch,
            Self::Api { .. } => CollectionMethod::Api,
            Self::NotFound { .. } => CollectionMethod::NotFound,
            Self::Derived { .. } => CollectionMethod::Derived,
            Self::Cache { .. } => CollectionMethod::Cache,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::WebFetch { source_url, .. }
            | Self::WebSearch { source_url, .. }
            | Self::Api { source_url, .. } => {
                if source_url.trim().is_empty() {
                    return Err(ValidationError::MissingSourceUrl {
                        method: self.method().as_str(),
                    });
                }
            }
            Self::NotFound { attempted_sources } => {
                if attempted_sources.iter().all(|url| url.trim().is_empty()) {
                    return Err(ValidationError::MissingAttemptedSources);
                }
            }
            Self::Derived {
                derived_from,
                formula,
            } => {
                if derived_from.iter().all(|input| input.trim().is_empty()) {
                    return Err(ValidationError::MissingDerivedFrom);
                }
                if formula.trim().is_empty() {
                    return Err(ValidationError::MissingFormula);
                }
            }
            Self::Cache { cache_source, .. } => {
                if cache_source.trim().is_empty() {
                    return Err(ValidationError::MissingCacheSource);
                }
            }
        }
        Ok(())
    }
}

/// One collected (or documented-as-missing) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DataPointRecord", into = "DataPointRecord")]
pub struct DataPoint {
    value: Option<f64>,
    measure: Measure,
    as_of: Option<Date>,
    retrieved_at: UtcDateTime,
    provenance: Provenance,
    provider_id: Option<String>,
}

impl DataPoint {
    pub fn new(
        measure: Measure,
        value: Option<f64>,
        provenance: Provenance,
        retrieved_at: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        if value.is_some_and(|value| !value.is_finite()) {
            return Err(ValidationError::NonFiniteValue { field: "value" });
        }
        provenance.validate()?;
        if matches!(provenance, Provenance::NotFound { .. }) && value.is_some() {
            return Err(ValidationError::NotFoundWithValue);
        }

        Ok(Self {
            value,
            measure,
            as_of: None,
            retrieved_at,
            provenance,
            provider_id: None,
        })
    }

    /// A documented absence listing every source that was tried.
    pub fn not_found(
        measure: Measure,
        attempted_sources: Vec<String>,
        retrieved_at: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        Self::new(
            measure,
            None,
            Provenance::NotFound { attempted_sources },
            retrieved_at,
        )
    }

    #[must_use]
    pub fn with_as_of(mut self, as_of: Date) -> Self {
        self.as_of = Some(as_of);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Value expressed in units (money scaled by its published magnitude).
    pub fn base_value(&self) -> Option<f64> {
        match &self.measure {
            Measure::Money { scale, .. } => self.value.map(|value| value * scale.factor()),
            _ => self.value,
        }
    }

    pub fn measure(&self) -> &Measure {
        &self.measure
    }

    pub fn method(&self) -> CollectionMethod {
        self.provenance.method()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn as_of(&self) -> Option<Date> {
        self.as_of
    }

    pub fn retrieved_at(&self) -> UtcDateTime {
        self.retrieved_at
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    pub fn source_url(&self) -> Option<&str> {
        match &self.provenance {
            Provenance::WebFetch { source_url, .. }
            | Provenance::WebSearch { source_url, .. }
            | Provenance::Api { source_url, .. } => Some(source_url),
            _ => None,
        }
    }

    pub fn attempted_sources(&self) -> &[String] {
        match &self.provenance {
            Provenance::NotFound { attempted_sources } => attempted_sources,
            _ => &[],
        }
    }

    pub fn is_found(&self) -> bool {
        self.value.is_some()
    }
}

/// Flat wire form of a [`DataPoint`], one key per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointRecord {
    pub value: Option<f64>,
    pub unit: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub scale: Option<Scale>,
    #[serde(default)]
    pub as_of: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    pub retrieved_at: UtcDateTime,
    pub method: CollectionMethod,
    #[serde(default)]
    pub source_locator: Option<SourceLocator>,
    #[serde(default)]
    pub attempted_sources: Vec<String>,
    #[serde(default)]
    pub derived_from: Vec<String>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub cache_source: Option<String>,
    #[serde(default)]
    pub cache_age_days: Option<u32>,
    #[serde(default)]
    pub provider_id: Option<String>,
}

impl TryFrom<DataPointRecord> for DataPoint {
    type Error = ValidationError;

    fn try_from(record: DataPointRecord) -> Result<Self, Self::Error> {
        let measure = match record.unit.as_str() {
            "currency" => Measure::money(
                record.currency.unwrap_or_default(),
                record.scale.unwrap_or(Scale::Units),
            )?,
            "ratio" => Measure::Ratio,
            "percent" => Measure::Percent,
            "number" => Measure::Number,
            other => {
                return Err(ValidationError::InvalidUnit {
                    value: other.to_owned(),
                })
            }
        };

        let method = record.method;
        let fetched = |source_url: Option<String>, locator: Option<SourceLocator>| {
            let source_url = source_url
                .filter(|url| !url.trim().is_empty())
                .ok_or(ValidationError::MissingSourceUrl {
                    method: method.as_str(),
                })?;
            let locator = locator.ok_or(ValidationError::MissingSourceLocator {
                method: method.as_str(),
            })?;
            Ok::<_, ValidationError>((source_url, locator))
        };

        let provenance = match method {
            CollectionMethod::WebFetch => {
                let (source_url, locator) = fetched(record.source_url, record.source_locator)?;
                Provenance::WebFetch {
                    source_url,
                    locator,
                }
            }
            CollectionMethod::WebSearch => {
                let (source_url, locator) = fetched(record.source_url, record.source_locator)?;
                Provenance::WebSearch {
                    source_url,
                    locator,
                }
            }
            CollectionMethod::Api => {
                let (source_url, locator) = fetched(record.source_url, record.source_locator)?;
                Provenance::Api {
                    source_url,
                    locator,
                }
            }
            CollectionMethod::NotFound => Provenance::NotFound {
                attempted_sources: record.attempted_sources,
            },
            CollectionMethod::Derived => Provenance::Derived {
                derived_from: record.derived_from,
                formula: record.formula.unwrap_or_default(),
            },
            CollectionMethod::Cache => Provenance::Cache {
                cache_source: record.cache_source.unwrap_or_default(),
                cache_age_days: record
                    .cache_age_days
                    .ok_or(ValidationError::MissingCacheAge)?,
            },
        };

        let mut datapoint = Self::new(measure, record.value, provenance, record.retrieved_at)?;
        if let Some(as_of) = record.as_of.as_deref() {
            datapoint.as_of = Some(parse_date(as_of)?);
        }
        datapoint.provider_id = record.provider_id;
        Ok(datapoint)
    }
}

impl From<DataPoint> for DataPointRecord {
    fn from(datapoint: DataPoint) -> Self {
        let (currency, scale) = match &datapoint.measure {
            Measure::Money { currency, scale } => (Some(currency.clone()), Some(*scale)),
            _ => (None, None),
        };
        let method = datapoint.method();
        let unit = datapoint.measure.unit().to_owned();

        let mut record = Self {
            value: datapoint.value,
            unit,
            currency,
            scale,
            as_of: datapoint.as_of.map(format_date),
            source_url: None,
            retrieved_at: datapoint.retrieved_at,
            method,
            source_locator: None,
            attempted_sources: Vec::new(),
            derived_from: Vec::new(),
            formula: None,
            cache_source: None,
            cache_age_days: None,
            provider_id: datapoint.provider_id,
        };

        match datapoint.provenance {
            Provenance::WebFetch {
                source_url,
                locator,
            }
            | Provenance::WebSearch {
                source_url,
                locator,
            }
            | Provenance::Api {
                source_url,
                locator,
            } => {
                record.source_url = Some(source_url);
                record.source_locator = Some(locator);
            }
            Provenance::NotFound { attempted_sources } => {
                record.attempted_sources = attempted_sources;
            }
            Provenance::Derived {
                derived_from,
                formula,
            } => {
                record.derived_from = derived_from;
                record.formula = Some(formula);
            }
            Provenance::Cache {
                cache_source,
                cache_age_days,
            } => {
                record.cache_source = Some(cache_source);
                record.cache_age_days = Some(cache_age_days);
            }
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> SourceLocator {
        SourceLocator::html("td[data-test=\"MARKET_CAP-value\"]", "Market Cap 215.3B")
            .expect("locator")
    }

    fn record(method: CollectionMethod) -> DataPointRecord {
        DataPointRecord {
            value: Some(215.3),
            unit: "currency".to_string(),
            currency: Some("USD".to_string()),
            scale: Some(Scale::Billions),
            as_of: Some("2025-01-31".to_string()),
            source_url: None,
            retrieved_at: UtcDateTime::parse("2025-02-01T08:00:00Z").expect("timestamp"),
            method,
            source_locator: None,
            attempted_sources: Vec::new(),
            derived_from: Vec::new(),
            formula: None,
            cache_source: None,
            cache_age_days: None,
            provider_id: None,
        }
    }

    #[test]
    fn web_fetch_without_source_url_is_rejected() {
        let mut draft = record(CollectionMethod::WebFetch);
        draft.source_locator = Some(locator());
        let error = DataPoint::try_from(draft).expect_err("must fail");
        assert_eq!(error, ValidationError::MissingSourceUrl { method: "web_fetch" });

        let error = DataPoint::new(
            Measure::Ratio,
            Some(1.0),
            Provenance::WebFetch {
                source_url: "   ".to_string(),
                locator: locator(),
            },
            UtcDateTime::now(),
        )
        .expect_err("blank url must fail");
        assert!(matches!(error, ValidationError::MissingSourceUrl { .. }));
    }

    #[test]
    fn api_without_locator_is_rejected() {
        let mut draft = record(CollectionMethod::Api);
        draft.source_url = Some("https://query1.finance.yahoo.com/v10/x".to_string());
        let error = DataPoint::try_from(draft).expect_err("must fail");
        assert_eq!(error, ValidationError::MissingSourceLocator { method: "api" });
    }

    #[test]
    fn not_found_requires_attempted_sources_and_null_value() {
        let error =
            DataPoint::not_found(Measure::Ratio, Vec::new(), UtcDateTime::now()).expect_err("empty");
        assert_eq!(error, ValidationError::MissingAttemptedSources);

        let mut draft = record(CollectionMethod::NotFound);
        draft.attempted_sources = vec!["https://stockanalysis.com/stocks/shel/".to_string()];
        let error = DataPoint::try_from(draft).expect_err("value with not_found");
        assert_eq!(error, ValidationError::NotFoundWithValue);
    }

    #[test]
    fn derived_requires_inputs_and_formula() {
        let mut draft = record(CollectionMethod::Derived);
        draft.derived_from = vec!["valuation.market_cap".to_string()];
        assert_eq!(
            DataPoint::try_from(draft.clone()).expect_err("no formula"),
            ValidationError::MissingFormula
        );

        draft.formula = Some("market_cap / ebitda".to_string());
        assert!(DataPoint::try_from(draft).is_ok());
    }

    #[test]
    fn cache_requires_source_and_age() {
        let mut draft = record(CollectionMethod::Cache);
        draft.cache_source = Some("dp-2025-01-30".to_string());
        assert_eq!(
            DataPoint::try_from(draft.clone()).expect_err("no age"),
            ValidationError::MissingCacheAge
        );
        draft.cache_age_days = Some(2);
        let datapoint = DataPoint::try_from(draft).expect("valid cache datapoint");
        assert_eq!(datapoint.method(), CollectionMethod::Cache);
    }

    #[test]
    fn serialized_shape_is_flat_and_revalidated() {
        let datapoint = DataPoint::new(
            Measure::money("USD", Scale::Billions).expect("money"),
            Some(215.3),
            Provenance::WebFetch {
                source_url: "https://finance.yahoo.com/quote/SHEL".to_string(),
                locator: locator(),
            },
            UtcDateTime::parse("2025-02-01T08:00:00Z").expect("timestamp"),
        )
        .expect("datapoint")
        .with_provider("yahoo_finance");

        let json = serde_json::to_value(&datapoint).expect("serialize");
        assert_eq!(json["unit"], "currency");
        assert_eq!(json["scale"], "billions");
        assert_eq!(json["method"], "web_fetch");
        assert_eq!(json["source_locator"]["type"], "html");
        assert_eq!(json["provider_id"], "yahoo_finance");

        let restored: DataPoint = serde_json::from_value(json.clone()).expect("deserialize");
        assert_eq!(restored, datapoint);

        let mut broken = json;
        broken["source_url"] = serde_json::Value::Null;
        assert!(serde_json::from_value::<DataPoint>(broken).is_err());
    }

    #[test]
    fn base_value_applies_money_scale() {
        let datapoint = DataPoint::new(
            Measure::money("GBP", Scale::Millions).expect("money"),
            Some(2.5),
            Provenance::Cache {
                cache_source: "previous".to_string(),
                cache_age_days: 1,
            },
            UtcDateTime::now(),
        )
        .expect("datapoint");
        assert_eq!(datapoint.base_value(), Some(2_500_000.0));
    }

    #[test]
    fn lowercase_currency_is_rejected() {
        assert!(matches!(
            Measure::money("usd", Scale::Units),
            Err(ValidationError::InvalidCurrency { .. })
        ));
    }
}
