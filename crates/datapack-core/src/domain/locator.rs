use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Maximum stored snippet length, in characters, including the ellipsis.
pub const MAX_SNIPPET_CHARS: usize = 100;
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorType {
    Html,
    Json,
    Xpath,
}

impl LocatorType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Json => "json",
            Self::Xpath => "xpath",
        }
    }
}

impl Display for LocatorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocatorType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            "xpath" => Ok(Self::Xpath),
            _ => Err(ValidationError::InvalidLocatorType {
                value: value.to_owned(),
            }),
        }
    }
}

/// Where in a response a value was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLocator")]
pub struct SourceLocator {
    #[serde(rename = "type")]
    locator_type: LocatorType,
    selector: String,
    snippet: String,
}

#[derive(Deserialize)]
struct RawLocator {
    #[serde(rename = "type")]
    locator_type: LocatorType,
    selector: String,
    #[serde(default)]
    snippet: String,
}

impl TryFrom<RawLocator> for SourceLocator {
    type Error = ValidationError;

    fn try_from(raw: RawLocator) -> Result<Self, Self::Error> {
        Self::new(raw.locator_type, raw.selector, &raw.snippet)
    }
}

impl SourceLocator {
    pub fn new(
        locator_type: LocatorType,
        selector: impl Into<String>,
        snippet: &str,
    ) -> Result<Self, ValidationError> {
        let selector = selector.into();
        if selector.trim().is_empty() {
            return Err(ValidationError::EmptySelector);
        }

        Ok(Self {
            locator_type,
            selector,
            snippet: truncate_snippet(snippet),
        })
    }

    pub fn html(selector: impl Into<String>, snippet: &str) -> Result<Self, ValidationError> {
        Self::new(LocatorType::Html, selector, snippet)
    }

    pub fn json(path: impl Into<String>, snippet: &str) -> Result<Self, ValidationError> {
        Self::new(LocatorType::Json, path, snippet)
    }

    pub fn xpath(expression: impl Into<String>, snippet: &str) -> Result<Self, ValidationError> {
        Self::new(LocatorType::Xpath, expression, snippet)
    }

    pub fn locator_type(&self) -> LocatorType {
        self.locator_type
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn snippet(&self) -> &str {
        &self.snippet
    }
}

fn truncate_snippet(snippet: &str) -> String {
    let snippet = snippet.trim();
    if snippet.chars().count() <= MAX_SNIPPET_CHARS {
        return snippet.to_owned();
    }

    let keep = MAX_SNIPPET_CHARS - ELLIPSIS.len();
    let mut truncated: String = snippet.chars().take(keep).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_snippets_are_kept_verbatim() {
        let locator = SourceLocator::html("td[data-test=\"PE_RATIO-value\"]", "PE Ratio 12.4")
            .expect("locator");
        assert_eq!(locator.snippet(), "PE Ratio 12.4");
    }

    #[test]
    fn long_snippets_are_truncated_with_ellipsis() {
        let long = "é".repeat(250);
        let locator = SourceLocator::json("$.price.regularMarketPrice", &long).expect("locator");

        assert_eq!(locator.snippet().chars().count(), MAX_SNIPPET_CHARS);
        assert!(locator.snippet().ends_with("..."));
        assert!(locator.snippet().starts_with(&"é".repeat(97)));
    }

    #[test]
    fn empty_selector_is_rejected() {
        let error = SourceLocator::xpath("  ", "snippet").expect_err("must fail");
        assert_eq!(error, ValidationError::EmptySelector);
    }

    #[test]
    fn serializes_with_type_tag() {
        let locator = SourceLocator::html("span.price", "101.5").expect("locator");
        let value = serde_json::to_value(&locator).expect("json");
        assert_eq!(value["type"], "html");
        assert_eq!(value["selector"], "span.price");
    }
}
