pub mod datapack;
pub mod datapoint;
pub mod locator;
pub mod run;
pub mod timestamp;

pub use datapack::{
    CollectionLog, CompanyData, DatapackDocument, DatapointKey, MacroData, Section,
};
pub use datapoint::{
    CollectionMethod, DataPoint, DataPointRecord, Measure, Provenance, Scale,
};
pub use locator::{LocatorType, SourceLocator, MAX_SNIPPET_CHARS};
pub use run::{CollectionError, CollectionRun, CollectionStatus, Severity};
pub use timestamp::{format_date, parse_date, UtcDateTime};
