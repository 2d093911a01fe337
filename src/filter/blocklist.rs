//! Published set of proxied domains.
//!
//! The set is held as an immutable [`Snapshot`] behind a reader-writer lock
//! and replaced wholesale on every update, so readers always see one
//! complete list.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;

/// One published version of the domain list.
#[derive(Debug)]
pub struct Snapshot {
    /// Sorted, deduplicated domains.
    domains: Vec<String>,
    index: FxHashSet<Box<str>>,
    fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(mut domains: Vec<String>, fetched_at: DateTime<Utc>) -> Self {
        domains.sort_unstable();
        domains.dedup();
        let index = domains.iter().map(|d| d.as_str().into()).collect();

        Self {
            domains,
            index,
            fetched_at,
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Exact or dot-boundary suffix match against the set.
    ///
    /// `"www.foo.com"` matches rule `"foo.com"`, `"xfoo.com"` does not.
    pub fn is_blocked(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }

        let mut current = domain;
        loop {
            if self.index.contains(current) {
                return true;
            }
            match current.find('.') {
                Some(pos) => current = &current[pos + 1..],
                None => return false,
            }
        }
    }
}

/// The shared, swappable domain list.
pub struct Blocklist {
    current: RwLock<Arc<Snapshot>>,
}

impl Blocklist {
    /// An empty list.
    pub fn new() -> Self {
        Self::from_domains(Vec::new())
    }

    pub fn from_domains(domains: Vec<String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::new(domains, Utc::now()))),
        }
    }

    /// The currently published snapshot.
    ///
    /// Holds the read lock only long enough to clone the pointer.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Atomically publish a new domain set.
    pub fn update(&self, domains: Vec<String>, fetched_at: DateTime<Utc>) {
        let next = Arc::new(Snapshot::new(domains, fetched_at));
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Check if a domain should go through the proxy.
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.snapshot().is_blocked(domain)
    }

    /// Returns the number of domains in the list.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}
