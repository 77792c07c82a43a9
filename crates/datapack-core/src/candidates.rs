use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::url_policy::host_of;
use crate::ValidationError;

/// Identifiers of the providers the collector knows how to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    YahooFinance,
    YahooFinanceApi,
    StockAnalysis,
    Reuters,
    BakerHughesRigCount,
    EiaInventory,
}

impl ProviderId {
    pub const ALL: [Self; 6] = [
        Self::YahooFinance,
        Self::YahooFinanceApi,
        Self::StockAnalysis,
        Self::Reuters,
        Self::BakerHughesRigCount,
        Self::EiaInventory,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::YahooFinance => "yahoo_finance",
            Self::YahooFinanceApi => "yahoo_finance_api",
            Self::StockAnalysis => "stockanalysis",
            Self::Reuters => "reuters",
            Self::BakerHughesRigCount => "baker_hughes_rig_count",
            Self::EiaInventory => "eia_inventory",
        }
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == normalized)
            .ok_or(ValidationError::InvalidProvider { value: normalized })
    }
}

/// One provider URL to try, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCandidate {
    pub provider: ProviderId,
    pub domain: String,
    pub url: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy)]
enum TickerFormat {
    Yahoo,
    Lower,
    Reuters,
}

struct Template {
    provider: ProviderId,
    domain: &'static str,
    priority: u8,
    url: &'static str,
    format: TickerFormat,
    supports_macro: bool,
}

const TEMPLATES: &[Template] = &[
    Template {
        provider: ProviderId::YahooFinance,
        domain: "finance.yahoo.com",
        priority: 1,
        url: "https://finance.yahoo.com/quote/{ticker}",
        format: TickerFormat::Yahoo,
        supports_macro: true,
    },
    Template {
        provider: ProviderId::YahooFinanceApi,
        domain: "query1.finance.yahoo.com",
        priority: 2,
        url: "https://query1.finance.yahoo.com/v10/finance/quoteSummary/{ticker}?modules=financialData,defaultKeyStatistics,price",
        format: TickerFormat::Yahoo,
        supports_macro: true,
    },
    Template {
        provider: ProviderId::StockAnalysis,
        domain: "stockanalysis.com",
        priority: 3,
        url: "https://stockanalysis.com/stocks/{ticker}/",
        format: TickerFormat::Lower,
        supports_macro: false,
    },
    Template {
        provider: ProviderId::Reuters,
        domain: "www.reuters.com",
        priority: 4,
        url: "https://www.reuters.com/companies/{ticker}.{exchange}",
        format: TickerFormat::Reuters,
        supports_macro: false,
    },
];

const EIA_DOMAIN: &str = "api.eia.gov";
const EIA_URL: &str = "https://api.eia.gov/v2/petroleum/stoc/wstk/data/?api_key={key}&frequency=weekly&data[0]=value&sort[0][column]=period&sort[0][direction]=desc&length=1";

fn yahoo_suffix(exchange: &str) -> Option<&'static str> {
    Some(match exchange {
        "LSE" | "XLON" => ".L",
        "AMS" | "XAMS" => ".AS",
        "FRA" | "XFRA" => ".F",
        "TYO" | "XTKS" => ".T",
        "HKG" | "XHKG" => ".HK",
        "TSX" | "XTSE" => ".TO",
        "ASX" | "XASX" => ".AX",
        _ => return None,
    })
}

fn reuters_suffix(exchange: &str) -> Option<&'static str> {
    Some(match exchange {
        "NYSE" => "N",
        "NASDAQ" => "O",
        "LSE" | "XLON" => "L",
        "AMS" | "XAMS" => "AS",
        "XPAR" | "PAR" => "PA",
        "FRA" | "XFRA" => "F",
        "TYO" | "XTKS" => "T",
        "HKG" | "XHKG" => "HK",
        "TSX" | "XTSE" => "TO",
        _ => return None,
    })
}

fn macro_symbol(key: &str) -> Option<&'static str> {
    Some(match key {
        "brent_crude" => "BZ=F",
        "wti_crude" | "oil_price" => "CL=F",
        "natural_gas" | "gas_price" => "NG=F",
        "gold" | "gold_price" => "GC=F",
        "sp500" => "^GSPC",
        _ => return None,
    })
}

/// Builds the ordered provider list for a ticker or macro indicator.
///
/// Output depends only on the inputs and on which optional providers were
/// configured; the same arguments always yield the same list.
#[derive(Debug, Clone, Default)]
pub struct SourceCandidateFactory {
    eia_api_key: Option<String>,
    rig_count_feed_url: Option<String>,
}

impl SourceCandidateFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eia_api_key(mut self, key: Option<String>) -> Self {
        self.eia_api_key = key.filter(|key| !key.trim().is_empty());
        self
    }

    pub fn with_rig_count_feed(mut self, url: Option<String>) -> Self {
        self.rig_count_feed_url = url.filter(|url| host_of(url).is_some());
        self
    }

    pub fn for_ticker(&self, ticker: &str, exchange: Option<&str>) -> Vec<SourceCandidate> {
        let exchange = exchange.map(str::to_ascii_uppercase);
        let exchange = exchange.as_deref();
        TEMPLATES
            .iter()
            .filter_map(|template| build(template, ticker, exchange))
            .collect()
    }

    /// Candidates for a macro key, with or without the `macro.` prefix.
    pub fn for_macro(&self, key: &str) -> Vec<SourceCandidate> {
        let key = key.strip_prefix("macro.").unwrap_or(key);
        let mut candidates: Vec<SourceCandidate> = match macro_symbol(key) {
            Some(symbol) => TEMPLATES
                .iter()
                .filter(|template| template.supports_macro)
                .filter_map(|template| build(template, symbol, None))
                .collect(),
            None => Vec::new(),
        };

        match key {
            "rig_count" => {
                if let Some(url) = &self.rig_count_feed_url {
                    if let Some(domain) = host_of(url) {
                        candidates.push(SourceCandidate {
                            provider: ProviderId::BakerHughesRigCount,
                            domain,
                            url: url.clone(),
                            priority: 5,
                        });
                    }
                }
            }
            "oil_inventory" | "inventory" => {
                if let Some(api_key) = &self.eia_api_key {
                    candidates.push(SourceCandidate {
                        provider: ProviderId::EiaInventory,
                        domain: EIA_DOMAIN.to_owned(),
                        url: EIA_URL.replace("{key}", &urlencoding::encode(api_key)),
                        priority: 6,
                    });
                }
            }
            _ => {}
        }
        candidates
    }
}

fn build(template: &Template, ticker: &str, exchange: Option<&str>) -> Option<SourceCandidate> {
    let normalized = match template.format {
        TickerFormat::Yahoo => match exchange.and_then(yahoo_suffix) {
            Some(suffix) if !ticker.ends_with(suffix) => format!("{ticker}{suffix}"),
            _ => ticker.to_owned(),
        },
        TickerFormat::Lower => ticker.to_ascii_lowercase(),
        TickerFormat::Reuters => ticker.to_owned(),
    };

    let mut url = template
        .url
        .replace("{ticker}", &urlencoding::encode(&normalized));
    if url.contains("{exchange}") {
        let suffix = exchange.and_then(reuters_suffix)?;
        url = url.replace("{exchange}", suffix);
    }

    Some(SourceCandidate {
        provider: template.provider,
        domain: template.domain.to_owned(),
        url,
        priority: template.priority,
    })
}
