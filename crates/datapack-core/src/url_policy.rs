use std::collections::BTreeSet;
use std::net::IpAddr;

use url::{Host, Url};

const SENSITIVE_QUERY_KEYS: &[&str] = &["apikey", "api_key"];

/// Outbound URL guard: http(s) only, a host is required, private and
/// loopback IP literals are refused, and an optional allow-list applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedDomainPolicy {
    allowed: Option<BTreeSet<String>>,
}

impl AllowedDomainPolicy {
    /// Accept any public host.
    pub fn permissive() -> Self {
        Self::default()
    }

    pub fn allow_only<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: Some(
                domains
                    .into_iter()
                    .map(|domain| domain.into().to_ascii_lowercase())
                    .collect(),
            ),
        }
    }

    /// Returns the lowercase host on success, or a reason on refusal.
    pub fn check(&self, url: &str) -> Result<String, String> {
        let parsed = Url::parse(url).map_err(|error| format!("invalid url: {error}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(format!("scheme '{}' is not http or https", parsed.scheme()));
        }

        let host = match parsed.host() {
            None => return Err("url has no host".to_owned()),
            Some(Host::Ipv4(ip)) => {
                refuse_private(IpAddr::V4(ip))?;
                ip.to_string()
            }
            Some(Host::Ipv6(ip)) => {
                refuse_private(IpAddr::V6(ip))?;
                ip.to_string()
            }
            Some(Host::Domain(domain)) => {
                if domain.eq_ignore_ascii_case("localhost") {
                    return Err("localhost is not allowed".to_owned());
                }
                domain.to_ascii_lowercase()
            }
        };

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&host) {
                return Err(format!("domain '{host}' is not in the allow-list"));
            }
        }
        Ok(host)
    }
}

fn refuse_private(ip: IpAddr) -> Result<(), String> {
    let private = match ip {
        IpAddr::V4(ip) => {
            ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
        }
        IpAddr::V6(ip) => ip.is_loopback() || ip.is_unspecified(),
    };
    if private {
        return Err(format!("address {ip} is private or loopback"));
    }
    Ok(())
}

/// Lowercase host of `url`, if it has one.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_ascii_lowercase)
}

/// Strip credential query parameters so the URL can be logged or stored.
pub fn sanitize_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_owned();
    };
    if parsed.query().is_none() {
        return url.to_owned();
    }

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| {
            !SENSITIVE_QUERY_KEYS
                .iter()
                .any(|sensitive| key.eq_ignore_ascii_case(sensitive))
        })
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_and_private_targets() {
        let policy = AllowedDomainPolicy::permissive();
        assert!(policy.check("ftp://example.com/file").is_err());
        assert!(policy.check("http://127.0.0.1/admin").is_err());
        assert!(policy.check("http://10.1.2.3/").is_err());
        assert!(policy.check("http://localhost:8080/").is_err());
        assert!(policy.check("http://[::1]/").is_err());
        assert_eq!(
            policy.check("https://Finance.Yahoo.com/quote/SHEL").as_deref(),
            Ok("finance.yahoo.com")
        );
    }

    #[test]
    fn allow_list_is_enforced() {
        let policy = AllowedDomainPolicy::allow_only(["stockanalysis.com"]);
        assert!(policy.check("https://stockanalysis.com/stocks/shel/").is_ok());
        assert!(policy.check("https://evil.example/").is_err());
    }

    #[test]
    fn sanitize_drops_api_keys_only() {
        let url = "https://api.eia.gov/v2/data/?api_key=secret&frequency=weekly&APIKEY=x";
        assert_eq!(
            sanitize_url(url),
            "https://api.eia.gov/v2/data/?frequency=weekly"
        );
        assert_eq!(
            sanitize_url("https://example.com/a?apikey=1"),
            "https://example.com/a"
        );
        let untouched = "https://finance.yahoo.com/quote/BZ%3DF";
        assert_eq!(sanitize_url(untouched), untouched);
    }
}
