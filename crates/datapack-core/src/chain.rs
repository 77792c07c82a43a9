//! Ordered fallback over source candidates.
//!
//! Every candidate ends in an explicit [`CandidateStep`]. Per-candidate
//! failures only move the loop to the next candidate; exhaustion yields a
//! `not_found` datapoint listing every candidate URL. The only errors that
//! leave [`AdapterChain::collect`] are store failures and a key with no
//! usable candidate at all.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapters::{absent_measure, AdapterRegistry};
use crate::candidates::{ProviderId, SourceCandidate};
use crate::domain::{DataPoint, DatapointKey, UtcDateTime};
use crate::error::StoreError;
use crate::fetch::{FetchClient, FetchError, FetchRequest, FetchResult};
use crate::registry::BlockedSourceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    HttpError,
    ParseFailed,
    NotInPage,
    RateLimited,
    Blocked,
    Timeout,
    NetworkError,
    SkippedBlocked,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HttpError => "http_error",
            Self::ParseFailed => "parse_failed",
            Self::NotInPage => "not_in_page",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::SkippedBlocked => "skipped_blocked",
        }
    }
}

/// One candidate tried (or skipped) for one datapoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceAttempt {
    pub url: String,
    pub provider: ProviderId,
    pub attempted_at: UtcDateTime,
    pub outcome: AttemptOutcome,
    pub reason: Option<String>,
    pub http_status: Option<u16>,
}

impl SourceAttempt {
    fn new(candidate: &SourceCandidate, outcome: AttemptOutcome) -> Self {
        Self {
            url: candidate.url.clone(),
            provider: candidate.provider,
            attempted_at: UtcDateTime::now(),
            outcome,
            reason: None,
            http_status: None,
        }
    }

    fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no source candidate can provide {key}")]
    NoCandidates { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub datapoint: DataPoint,
    pub attempts: Vec<SourceAttempt>,
}

#[derive(Debug, Clone)]
struct FailedFetch {
    outcome: AttemptOutcome,
    reason: String,
    http_status: Option<u16>,
}

/// Responses (or failures) already seen while collecting one entity, so a
/// page that serves several datapoints is fetched once.
#[derive(Debug, Default)]
pub struct FetchMemo {
    entries: BTreeMap<String, Result<FetchResult, FailedFetch>>,
}

impl FetchMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum CandidateStep {
    Found(DataPoint, SourceAttempt),
    Failed(SourceAttempt),
    Fatal(StoreError),
}

pub struct AdapterChain {
    fetcher: Arc<FetchClient>,
    adapters: AdapterRegistry,
    registry: Arc<dyn BlockedSourceRegistry>,
    fetch_timeout: Duration,
}

impl AdapterChain {
    pub fn new(
        fetcher: Arc<FetchClient>,
        adapters: AdapterRegistry,
        registry: Arc<dyn BlockedSourceRegistry>,
    ) -> Self {
        Self {
            fetcher,
            adapters,
            registry,
            fetch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn fetcher(&self) -> &FetchClient {
        &self.fetcher
    }

    pub fn registry(&self) -> &dyn BlockedSourceRegistry {
        self.registry.as_ref()
    }

    /// Try `candidates` in order for `key`.
    ///
    /// Candidates whose adapter cannot provide `key` are ignored; the rest
    /// all appear in the not-found provenance, blocked ones included.
    pub async fn collect(
        &self,
        key: &DatapointKey,
        candidates: &[SourceCandidate],
        memo: &mut FetchMemo,
    ) -> Result<ChainOutcome, ChainError> {
        let usable: Vec<&SourceCandidate> = candidates
            .iter()
            .filter(|candidate| {
                self.adapters
                    .get(candidate.provider)
                    .is_some_and(|adapter| adapter.supports(key))
            })
            .collect();
        if usable.is_empty() {
            return Err(ChainError::NoCandidates {
                key: key.to_string(),
            });
        }

        let mut attempts = Vec::with_capacity(usable.len());
        for candidate in &usable {
            match self.try_candidate(key, candidate, memo).await {
                CandidateStep::Found(datapoint, attempt) => {
                    attempts.push(attempt);
                    return Ok(ChainOutcome {
                        datapoint,
                        attempts,
                    });
                }
                CandidateStep::Failed(attempt) => {
                    debug!(
                        key = %key,
                        url = %attempt.url,
                        outcome = attempt.outcome.as_str(),
                        reason = attempt.reason.as_deref().unwrap_or(""),
                        "candidate failed"
                    );
                    attempts.push(attempt);
                }
                CandidateStep::Fatal(error) => return Err(error.into()),
            }
        }

        let attempted_sources = usable.iter().map(|candidate| candidate.url.clone()).collect();
        let datapoint = DataPoint::not_found(absent_measure(key), attempted_sources, UtcDateTime::now())
            .map_err(StoreError::from)?;
        Ok(ChainOutcome {
            datapoint,
            attempts,
        })
    }

    async fn try_candidate(
        &self,
        key: &DatapointKey,
        candidate: &SourceCandidate,
        memo: &mut FetchMemo,
    ) -> CandidateStep {
        match self.registry.is_blocked(&candidate.domain) {
            Ok(true) => {
                return CandidateStep::Failed(
                    SourceAttempt::new(candidate, AttemptOutcome::SkippedBlocked)
                        .because(format!("{} is in the blocked source registry", candidate.domain)),
                );
            }
            Ok(false) => {}
            Err(error) => return CandidateStep::Fatal(error),
        }

        if !memo.entries.contains_key(&candidate.url) {
            let request = FetchRequest::new(candidate.url.clone()).with_timeout(self.fetch_timeout);
            let entry = match self.fetcher.fetch(request).await {
                Ok(result) => Ok(result),
                Err(error) => match self.classify(candidate, error) {
                    Ok(failed) => Err(failed),
                    Err(fatal) => return CandidateStep::Fatal(fatal),
                },
            };
            memo.entries.insert(candidate.url.clone(), entry);
        }

        let result = match memo.entries.get(&candidate.url) {
            Some(Ok(result)) => result,
            Some(Err(failed)) => {
                let mut attempt =
                    SourceAttempt::new(candidate, failed.outcome).because(failed.reason.clone());
                attempt.http_status = failed.http_status;
                return CandidateStep::Failed(attempt);
            }
            None => {
                return CandidateStep::Failed(
                    SourceAttempt::new(candidate, AttemptOutcome::NetworkError)
                        .because("response was not recorded"),
                )
            }
        };

        let Some(adapter) = self.adapters.get(candidate.provider) else {
            return CandidateStep::Failed(
                SourceAttempt::new(candidate, AttemptOutcome::ParseFailed)
                    .because("no adapter registered"),
            );
        };
        match adapter.parse(result, key) {
            Ok(Some(datapoint)) => CandidateStep::Found(
                datapoint,
                SourceAttempt::new(candidate, AttemptOutcome::Success).with_status(result.status),
            ),
            Ok(None) => CandidateStep::Failed(
                SourceAttempt::new(candidate, AttemptOutcome::NotInPage)
                    .because(format!("{key} not present"))
                    .with_status(result.status),
            ),
            Err(error) => {
                let outcome = if result.is_success() {
                    AttemptOutcome::ParseFailed
                } else {
                    AttemptOutcome::HttpError
                };
                CandidateStep::Failed(
                    SourceAttempt::new(candidate, outcome)
                        .because(error.to_string())
                        .with_status(result.status),
                )
            }
        }
    }

    fn classify(&self, candidate: &SourceCandidate, error: FetchError) -> Result<FailedFetch, StoreError> {
        let failed = |outcome, reason: String, http_status| FailedFetch {
            outcome,
            reason,
            http_status,
        };
        Ok(match error {
            FetchError::Store(error) => return Err(error),
            FetchError::Blocked {
                ref domain,
                retry_at,
                ..
            } => {
                self.registry.block_for(domain, retry_at)?;
                warn!(domain = %domain, url = %candidate.url, "source blocked, registry updated");
                failed(AttemptOutcome::Blocked, error.to_string(), None)
            }
            FetchError::RateLimited { .. } => {
                failed(AttemptOutcome::RateLimited, error.to_string(), None)
            }
            FetchError::Network { timed_out: true, .. } => {
                failed(AttemptOutcome::Timeout, error.to_string(), None)
            }
            FetchError::Network { .. } | FetchError::DisallowedUrl { .. } => {
                failed(AttemptOutcome::NetworkError, error.to_string(), None)
            }
            FetchError::Upstream { status, .. } => {
                failed(AttemptOutcome::HttpError, error.to_string(), Some(status))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertDispatcher;
    use crate::candidates::SourceCandidateFactory;
    use crate::domain::CollectionMethod;
    use crate::http_client::{HttpResponse, ScriptedHttpClient};
    use crate::registry::InMemoryBlockedSourceRegistry;
    use crate::throttle::{DomainThrottle, ThrottlePolicy};
    use crate::url_policy::AllowedDomainPolicy;

    struct Harness {
        http: Arc<ScriptedHttpClient>,
        registry: Arc<InMemoryBlockedSourceRegistry>,
        chain: AdapterChain,
    }

    fn harness() -> Harness {
        let http = Arc::new(ScriptedHttpClient::new());
        let registry = Arc::new(InMemoryBlockedSourceRegistry::new());
        let fetcher = FetchClient::new(
            http.clone(),
            DomainThrottle::in_memory(ThrottlePolicy::new(Duration::ZERO)),
            AllowedDomainPolicy::permissive(),
            Arc::new(AlertDispatcher::default()),
        );
        let chain = AdapterChain::new(Arc::new(fetcher), AdapterRegistry::builtin(), registry.clone());
        Harness {
            http,
            registry,
            chain,
        }
    }

    fn market_cap() -> DatapointKey {
        DatapointKey::valuation("market_cap").expect("key")
    }

    #[tokio::test]
    async fn falls_through_to_first_parsable_candidate() {
        let h = harness();
        let candidates = SourceCandidateFactory::new().for_ticker("XOM", Some("NYSE"));
        h.http.push(&candidates[0].url, Ok(HttpResponse::ok_html("<p>empty</p>")));
        h.http.push(&candidates[1].url, Ok(HttpResponse::ok_json("{\"quoteSummary\":{\"result\":null,\"error\":{\"code\":\"x\"}}}")));
        h.http.push(
            &candidates[2].url,
            Ok(HttpResponse::ok_html("<table><tr><td>Market Cap</td><td>$472.19B</td></tr></table>")),
        );

        let mut memo = FetchMemo::new();
        let outcome = h
            .chain
            .collect(&market_cap(), &candidates, &mut memo)
            .await
            .expect("collect");

        assert_eq!(outcome.datapoint.value(), Some(472.19));
        assert_eq!(outcome.datapoint.source_url(), Some(candidates[2].url.as_str()));
        let outcomes: Vec<_> = outcome.attempts.iter().map(|attempt| attempt.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::NotInPage,
                AttemptOutcome::ParseFailed,
                AttemptOutcome::Success
            ]
        );
        assert_eq!(h.http.request_count(&candidates[3].url), 0);
    }

    #[tokio::test]
    async fn exhaustion_lists_every_candidate_including_pre_blocked() {
        let h = harness();
        let candidates = SourceCandidateFactory::new().for_ticker("SHEL", Some("LSE"));
        h.registry
            .block("finance.yahoo.com", UtcDateTime::now().plus(Duration::from_secs(600)))
            .expect("block");

        let mut memo = FetchMemo::new();
        let outcome = h
            .chain
            .collect(&market_cap(), &candidates, &mut memo)
            .await
            .expect("collect");

        assert_eq!(outcome.datapoint.method(), CollectionMethod::NotFound);
        let expected: Vec<String> = candidates.iter().map(|candidate| candidate.url.clone()).collect();
        assert_eq!(outcome.datapoint.attempted_sources(), expected.as_slice());
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::SkippedBlocked);
        assert_eq!(h.http.request_count(&candidates[0].url), 0);
        // Unscripted URLs answer 404.
        assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::HttpError);
        assert_eq!(outcome.attempts[2].http_status, Some(404));
    }

    #[tokio::test]
    async fn blocked_fetch_is_registered_and_skipped_next_time() {
        let h = harness();
        let candidates = SourceCandidateFactory::new().for_ticker("XOM", None);
        h.http.push(&candidates[0].url, Ok(HttpResponse::new(403, "denied")));

        let mut memo = FetchMemo::new();
        h.chain
            .collect(&market_cap(), &candidates, &mut memo)
            .await
            .expect("collect");
        assert!(h.registry.is_blocked("finance.yahoo.com").expect("registry"));

        let mut fresh = FetchMemo::new();
        let second = h
            .chain
            .collect(&market_cap(), &candidates, &mut fresh)
            .await
            .expect("collect");
        assert_eq!(second.attempts[0].outcome, AttemptOutcome::SkippedBlocked);
        assert_eq!(h.http.request_count(&candidates[0].url), 1);
    }

    #[tokio::test]
    async fn memo_reuses_one_page_across_keys() {
        let h = harness();
        let candidates = SourceCandidateFactory::new().for_ticker("XOM", None);
        h.http.push(
            &candidates[0].url,
            Ok(HttpResponse::ok_html(
                r#"<table><tr><td data-test="MARKET_CAP-value">472.19B</td></tr>
                   <tr><td data-test="FORWARD_PE-value">13.1</td></tr></table>"#,
            )),
        );

        let mut memo = FetchMemo::new();
        let fwd_pe = DatapointKey::valuation("fwd_pe").expect("key");
        h.chain.collect(&market_cap(), &candidates, &mut memo).await.expect("collect");
        let second = h.chain.collect(&fwd_pe, &candidates, &mut memo).await.expect("collect");

        assert_eq!(second.datapoint.value(), Some(13.1));
        assert_eq!(h.http.request_count(&candidates[0].url), 1);
        assert_eq!(memo.len(), 1);
    }

    #[tokio::test]
    async fn key_without_candidates_is_an_error() {
        let h = harness();
        let key = DatapointKey::macro_indicator("unknown_indicator").expect("key");
        let error = h
            .chain
            .collect(&key, &[], &mut FetchMemo::new())
            .await
            .expect_err("nothing to try");
        assert!(matches!(error, ChainError::NoCandidates { .. }));
    }
}
