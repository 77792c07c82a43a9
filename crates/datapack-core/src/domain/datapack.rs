use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::datapoint::DataPoint;
use crate::domain::run::CollectionStatus;
use crate::domain::timestamp::UtcDateTime;
use crate::ValidationError;

/// Payload group a datapoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Valuation,
    Financials,
    Operational,
    Macro,
}

impl Section {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Valuation => "valuation",
            Self::Financials => "financials",
            Self::Operational => "operational",
            Self::Macro => "macro",
        }
    }
}

/// `section.name` identifier of one datapoint, e.g. `valuation.market_cap`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapointKey {
    section: Section,
    name: String,
}

impl DatapointKey {
    pub fn new(section: Section, name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if !valid {
            return Err(ValidationError::InvalidDatapointKey {
                value: format!("{}.{name}", section.as_str()),
            });
        }
        Ok(Self { section, name })
    }

    pub fn valuation(name: &str) -> Result<Self, ValidationError> {
        Self::new(Section::Valuation, name)
    }

    /// Macro keys are accepted with or without the `macro.` prefix.
    pub fn macro_indicator(name: &str) -> Result<Self, ValidationError> {
        Self::new(Section::Macro, name.strip_prefix("macro.").unwrap_or(name))
    }

    pub fn section(&self) -> Section {
        self.section
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for DatapointKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.section.as_str(), self.name)
    }
}

impl FromStr for DatapointKey {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidDatapointKey {
            value: value.to_owned(),
        };
        let (section, name) = value.split_once('.').ok_or_else(invalid)?;
        let section = match section {
            "valuation" => Section::Valuation,
            "financials" => Section::Financials,
            "operational" => Section::Operational,
            "macro" => Section::Macro,
            _ => return Err(invalid()),
        };
        Self::new(section, name)
    }
}

/// Everything collected for one company.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyData {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub listing_exchange: Option<String>,
    #[serde(default)]
    pub valuation: BTreeMap<String, DataPoint>,
    #[serde(default)]
    pub financials: BTreeMap<String, DataPoint>,
    #[serde(default)]
    pub operational: BTreeMap<String, DataPoint>,
}

impl CompanyData {
    pub fn new(ticker: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn get(&self, key: &DatapointKey) -> Option<&DataPoint> {
        self.section(key.section())?.get(key.name())
    }

    /// Store a datapoint; macro keys have no place on a company and are ignored.
    pub fn insert(&mut self, key: &DatapointKey, datapoint: DataPoint) {
        let section = match key.section() {
            Section::Valuation => &mut self.valuation,
            Section::Financials => &mut self.financials,
            Section::Operational => &mut self.operational,
            Section::Macro => return,
        };
        section.insert(key.name().to_owned(), datapoint);
    }

    /// Every datapoint with its `companies.<ticker>.<section>.<name>` path.
    pub fn datapoints(&self) -> impl Iterator<Item = (String, &DataPoint)> + '_ {
        [
            (Section::Valuation, &self.valuation),
            (Section::Financials, &self.financials),
            (Section::Operational, &self.operational),
        ]
        .into_iter()
        .flat_map(move |(section, points)| {
            points.iter().map(move |(name, datapoint)| {
                (
                    format!("companies.{}.{}.{name}", self.ticker, section.as_str()),
                    datapoint,
                )
            })
        })
    }

    fn section(&self, section: Section) -> Option<&BTreeMap<String, DataPoint>> {
        match section {
            Section::Valuation => Some(&self.valuation),
            Section::Financials => Some(&self.financials),
            Section::Operational => Some(&self.operational),
            Section::Macro => None,
        }
    }
}

/// Macro indicators keyed by their bare name (`brent_crude`, `sp500`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroData {
    pub indicators: BTreeMap<String, DataPoint>,
}

impl MacroData {
    pub fn get(&self, name: &str) -> Option<&DataPoint> {
        self.indicators.get(name)
    }
}

/// Run summary embedded in the datapack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionLog {
    pub started_at: UtcDateTime,
    pub completed_at: UtcDateTime,
    pub duration_seconds: u64,
    pub company_statuses: BTreeMap<String, CollectionStatus>,
    pub macro_status: CollectionStatus,
    pub total_attempts: u64,
}

impl CollectionLog {
    pub fn count_by_status(&self, status: CollectionStatus) -> usize {
        self.company_statuses
            .values()
            .filter(|candidate| **candidate == status)
            .count()
    }
}

/// The datapack artifact read back for validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatapackDocument {
    pub industry_id: String,
    pub datapack_id: String,
    pub collected_at: UtcDateTime,
    #[serde(rename = "macro")]
    pub macro_data: MacroData,
    pub companies: BTreeMap<String, CompanyData>,
    pub collection_log: CollectionLog,
}
