//! Per-domain pacing and block/cooldown state.
//!
//! [`DomainThrottle`] spaces requests to the same domain by a minimum
//! interval and exposes the durable block window kept in a
//! [`BlockStateStore`]. The store is the only shared mutable state; the
//! in-process pacing stamp only tightens the interval for a single process.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::domain::UtcDateTime;
use crate::error::StoreError;

/// Minimum spacing between requests, per domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePolicy {
    default_interval: Duration,
    domain_intervals: BTreeMap<String, Duration>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000))
            .with_domain_interval("finance.yahoo.com", Duration::from_millis(2_000))
            .with_domain_interval("query1.finance.yahoo.com", Duration::from_millis(2_500))
            .with_domain_interval("www.reuters.com", Duration::from_millis(3_000))
    }
}

impl ThrottlePolicy {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            domain_intervals: BTreeMap::new(),
        }
    }

    pub fn with_domain_interval(mut self, domain: impl Into<String>, interval: Duration) -> Self {
        self.domain_intervals
            .insert(domain.into().to_ascii_lowercase(), interval);
        self
    }

    pub fn interval_for(&self, domain: &str) -> Duration {
        self.domain_intervals
            .get(&domain.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_interval)
    }
}

/// Durable block record for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainBlockState {
    pub domain: String,
    pub blocked_at: Option<UtcDateTime>,
    pub blocked_until: Option<UtcDateTime>,
    pub consecutive_count: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<UtcDateTime>,
}

impl DomainBlockState {
    fn empty(domain: &str) -> Self {
        Self {
            domain: domain.to_owned(),
            blocked_at: None,
            blocked_until: None,
            consecutive_count: 0,
            last_status_code: None,
            last_error: None,
            last_attempt_at: None,
        }
    }

    pub fn is_blocked_at(&self, now: UtcDateTime) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

/// Domain-keyed block record store shared by every run using it.
pub trait BlockStateStore: Send + Sync {
    fn get(&self, domain: &str) -> Result<Option<DomainBlockState>, StoreError>;

    fn list(&self) -> Result<Vec<DomainBlockState>, StoreError>;

    /// Create the record with `consecutive_count = 1`, or increment the
    /// counter and replace the window of an existing record.
    fn record_block(
        &self,
        domain: &str,
        blocked_at: UtcDateTime,
        blocked_until: UtcDateTime,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<DomainBlockState, StoreError>;

    /// Set the window, or extend it if it already ends later. The counter is
    /// left alone.
    fn extend_block(
        &self,
        domain: &str,
        blocked_at: UtcDateTime,
        blocked_until: UtcDateTime,
    ) -> Result<(), StoreError>;

    fn clear(&self, domain: &str) -> Result<(), StoreError>;

    fn record_attempt(&self, domain: &str, at: UtcDateTime) -> Result<(), StoreError>;

    fn delete(&self, domain: &str) -> Result<bool, StoreError>;

    fn delete_expired(&self, now: UtcDateTime) -> Result<usize, StoreError>;
}

/// Process-local store for tests and single-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryBlockStateStore {
    states: Mutex<BTreeMap<String, DomainBlockState>>,
}

impl InMemoryBlockStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_states<T>(&self, body: impl FnOnce(&mut BTreeMap<String, DomainBlockState>) -> T) -> T {
        let mut states = self
            .states
            .lock()
            .expect("block state map should not be poisoned");
        body(&mut states)
    }
}

impl BlockStateStore for InMemoryBlockStateStore {
    fn get(&self, domain: &str) -> Result<Option<DomainBlockState>, StoreError> {
        Ok(self.with_states(|states| states.get(domain).cloned()))
    }

    fn list(&self) -> Result<Vec<DomainBlockState>, StoreError> {
        Ok(self.with_states(|states| states.values().cloned().collect()))
    }

    fn record_block(
        &self,
        domain: &str,
        blocked_at: UtcDateTime,
        blocked_until: UtcDateTime,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<DomainBlockState, StoreError> {
        Ok(self.with_states(|states| {
            let state = states
                .entry(domain.to_owned())
                .or_insert_with(|| DomainBlockState::empty(domain));
            state.blocked_at = Some(blocked_at);
            state.blocked_until = Some(blocked_until);
            state.consecutive_count = state.consecutive_count.saturating_add(1);
            state.last_status_code = status;
            state.last_error = error.map(str::to_owned);
            state.clone()
        }))
    }

    fn extend_block(
        &self,
        domain: &str,
        blocked_at: UtcDateTime,
        blocked_until: UtcDateTime,
    ) -> Result<(), StoreError> {
        self.with_states(|states| {
            let state = states
                .entry(domain.to_owned())
                .or_insert_with(|| DomainBlockState::empty(domain));
            state.blocked_at = Some(blocked_at);
            state.blocked_until = Some(match state.blocked_until {
                Some(existing) if existing > blocked_until => existing,
                _ => blocked_until,
            });
        });
        Ok(())
    }

    fn clear(&self, domain: &str) -> Result<(), StoreError> {
        self.with_states(|states| {
            if let Some(state) = states.get_mut(domain) {
                state.blocked_at = None;
                state.blocked_until = None;
                state.consecutive_count = 0;
                state.last_status_code = None;
                state.last_error = None;
            }
        });
        Ok(())
    }

    fn record_attempt(&self, domain: &str, at: UtcDateTime) -> Result<(), StoreError> {
        self.with_states(|states| {
            states
                .entry(domain.to_owned())
                .or_insert_with(|| DomainBlockState::empty(domain))
                .last_attempt_at = Some(at);
        });
        Ok(())
    }

    fn delete(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self.with_states(|states| states.remove(domain).is_some()))
    }

    fn delete_expired(&self, now: UtcDateTime) -> Result<usize, StoreError> {
        Ok(self.with_states(|states| {
            let before = states.len();
            states.retain(|_, state| state.blocked_until.map_or(true, |until| until > now));
            before - states.len()
        }))
    }
}

/// Pacing and block bookkeeping for outbound requests.
#[derive(Clone)]
pub struct DomainThrottle {
    policy: ThrottlePolicy,
    store: Arc<dyn BlockStateStore>,
    paced: Arc<Mutex<BTreeMap<String, UtcDateTime>>>,
}

impl DomainThrottle {
    pub fn new(policy: ThrottlePolicy, store: Arc<dyn BlockStateStore>) -> Self {
        Self {
            policy,
            store,
            paced: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn in_memory(policy: ThrottlePolicy) -> Self {
        Self::new(policy, Arc::new(InMemoryBlockStateStore::new()))
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Sleep until the domain's minimum interval has passed since the last
    /// attempt or the last completed wait, whichever is later.
    pub async fn wait(&self, domain: &str) -> Result<(), StoreError> {
        let interval = self.policy.interval_for(domain);
        let stored = self
            .store
            .get(domain)?
            .and_then(|state| state.last_attempt_at);
        if let Some(last) = stored.max(self.paced_at(domain)) {
            let elapsed = last.until(UtcDateTime::now());
            if elapsed < interval {
                let delay = interval - elapsed;
                debug!(domain, delay_ms = delay.as_millis() as u64, "throttling request");
                tokio::time::sleep(delay).await;
            }
        }

        self.paced
            .lock()
            .expect("pacing map should not be poisoned")
            .insert(domain.to_owned(), UtcDateTime::now());
        Ok(())
    }

    pub fn record_attempt(&self, domain: &str) -> Result<(), StoreError> {
        let now = UtcDateTime::now();
        self.paced
            .lock()
            .expect("pacing map should not be poisoned")
            .insert(domain.to_owned(), now);
        self.store.record_attempt(domain, now)
    }

    pub fn record_success(&self, domain: &str) -> Result<(), StoreError> {
        self.store.clear(domain)
    }

    pub fn is_rate_limited(&self, domain: &str) -> Result<bool, StoreError> {
        let now = UtcDateTime::now();
        Ok(self
            .store
            .get(domain)?
            .is_some_and(|state| state.is_blocked_at(now)))
    }

    /// End of the active block window, if any.
    pub fn retry_time(&self, domain: &str) -> Result<Option<UtcDateTime>, StoreError> {
        let now = UtcDateTime::now();
        Ok(self
            .store
            .get(domain)?
            .filter(|state| state.is_blocked_at(now))
            .and_then(|state| state.blocked_until))
    }

    /// Record a block and bump the consecutive counter.
    pub fn record_block(
        &self,
        domain: &str,
        until: UtcDateTime,
        status: Option<u16>,
        error: Option<&str>,
    ) -> Result<DomainBlockState, StoreError> {
        self.store
            .record_block(domain, UtcDateTime::now(), until, status, error)
    }

    /// Set or extend the block window without counting it as a new block.
    pub fn block(&self, domain: &str, until: UtcDateTime) -> Result<(), StoreError> {
        self.store.extend_block(domain, UtcDateTime::now(), until)
    }

    pub fn consecutive_block_count(&self, domain: &str) -> Result<u32, StoreError> {
        Ok(self
            .store
            .get(domain)?
            .map_or(0, |state| state.consecutive_count))
    }

    pub fn states(&self) -> Result<Vec<DomainBlockState>, StoreError> {
        self.store.list()
    }

    /// Drop the domain's record entirely.
    pub fn forget(&self, domain: &str) -> Result<bool, StoreError> {
        self.store.delete(domain)
    }

    pub fn cleanup_expired(&self) -> Result<usize, StoreError> {
        self.store.delete_expired(UtcDateTime::now())
    }

    fn paced_at(&self, domain: &str) -> Option<UtcDateTime> {
        self.paced
            .lock()
            .expect("pacing map should not be poisoned")
            .get(domain)
            .copied()
    }
}
