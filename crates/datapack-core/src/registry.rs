use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::domain::UtcDateTime;
use crate::error::StoreError;

/// Block duration recorded when the fetch client gave no retry time.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(6 * 60 * 60);

/// Domains the adapter chain skips without a network call.
///
/// Entries whose window has ended read as unblocked.
pub trait BlockedSourceRegistry: Send + Sync {
    fn blocked_until(&self, domain: &str) -> Result<Option<UtcDateTime>, StoreError>;

    fn block(&self, domain: &str, until: UtcDateTime) -> Result<(), StoreError>;

    fn unblock(&self, domain: &str) -> Result<bool, StoreError>;

    fn list(&self) -> Result<Vec<(String, UtcDateTime)>, StoreError>;

    fn prune(&self, now: UtcDateTime) -> Result<usize, StoreError>;

    fn is_blocked(&self, domain: &str) -> Result<bool, StoreError> {
        let now = UtcDateTime::now();
        Ok(self.blocked_until(domain)?.is_some_and(|until| until > now))
    }

    /// Record a block, defaulting to [`DEFAULT_BLOCK_DURATION`] from now.
    fn block_for(&self, domain: &str, until: Option<UtcDateTime>) -> Result<(), StoreError> {
        let until = until.unwrap_or_else(|| UtcDateTime::now().plus(DEFAULT_BLOCK_DURATION));
        self.block(domain, until)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBlockedSourceRegistry {
    entries: Mutex<BTreeMap<String, UtcDateTime>>,
}

impl InMemoryBlockedSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockedSourceRegistry for InMemoryBlockedSourceRegistry {
    fn blocked_until(&self, domain: &str) -> Result<Option<UtcDateTime>, StoreError> {
        let now = UtcDateTime::now();
        let mut entries = self
            .entries
            .lock()
            .expect("registry should not be poisoned");
        match entries.get(domain).copied() {
            Some(until) if until <= now => {
                entries.remove(domain);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn block(&self, domain: &str, until: UtcDateTime) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("registry should not be poisoned")
            .insert(domain.to_owned(), until);
        Ok(())
    }

    fn unblock(&self, domain: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .lock()
            .expect("registry should not be poisoned")
            .remove(domain)
            .is_some())
    }

    fn list(&self) -> Result<Vec<(String, UtcDateTime)>, StoreError> {
        Ok(self
            .entries
            .lock()
            .expect("registry should not be poisoned")
            .iter()
            .map(|(domain, until)| (domain.clone(), *until))
            .collect())
    }

    fn prune(&self, now: UtcDateTime) -> Result<usize, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .expect("registry should not be poisoned");
        let before = entries.len();
        entries.retain(|_, until| *until > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_lasts_six_hours() {
        let registry = InMemoryBlockedSourceRegistry::new();
        let before = UtcDateTime::now();
        registry.block_for("www.reuters.com", None).expect("block");

        let until = registry
            .blocked_until("www.reuters.com")
            .expect("read")
            .expect("blocked");
        let window = before.until(until);
        assert!(window >= DEFAULT_BLOCK_DURATION);
        assert!(window <= DEFAULT_BLOCK_DURATION + Duration::from_secs(1));
        assert!(registry.is_blocked("www.reuters.com").expect("read"));
    }

    #[test]
    fn expired_entries_read_as_unblocked() {
        let registry = InMemoryBlockedSourceRegistry::new();
        let past = UtcDateTime::parse("2020-01-01T00:00:00Z").expect("timestamp");
        registry.block("stockanalysis.com", past).expect("block");

        assert!(!registry.is_blocked("stockanalysis.com").expect("read"));
        assert!(registry.list().expect("list").is_empty());
    }
}
