//! # Read Helpers
//!
//! One store read returns whatever the backend's page held after stale-row
//! deduplication — rarely exactly the number of events the caller asked
//! for. The helpers here loop partial pages into a full page, in the two
//! shapes callers want:
//!
//! - [`read_full_page_events`]: a flat list of events
//! - [`read_full_page_event_batches`]: the batches as stored
//!
//! Both accumulate the byte size the backend returned, for accounting, and
//! resolve the caller's domain id to a name once up front so the read is
//! attributable in logs.
//!
//! The domain cache itself lives outside this crate; [`DomainResolver`] is
//! the seam, and [`CachingDomainResolver`] wraps any resolver with an LRU
//! so one name lookup serves many pages.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;

use crate::backend::BackendConnector;
use crate::codec;
use crate::error::Result;
use crate::store::{HistoryStore, ReadHistoryBranchRequest};
use crate::types::HistoryEvent;

// =============================================================================
// Domain Resolution
// =============================================================================

/// Resolves a domain id to its human-readable name.
#[async_trait]
pub trait DomainResolver: Send + Sync {
    /// Returns the domain's name.
    ///
    /// # Errors
    ///
    /// `NotFound` when the domain id is unknown; `Transient` when the
    /// resolver's own backend is unavailable.
    async fn domain_name(&self, domain_id: &str) -> Result<String>;
}

/// An LRU cache in front of another resolver.
///
/// Domain metadata changes rarely and reads are hot; a small cache removes
/// the resolver from the read path almost entirely.
pub struct CachingDomainResolver<R> {
    inner: R,
    cache: Mutex<LruCache<String, String>>,
}

impl<R: DomainResolver> CachingDomainResolver<R> {
    /// Wraps `inner` with a cache of `capacity` entries.
    pub fn new(inner: R, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl<R: DomainResolver> DomainResolver for CachingDomainResolver<R> {
    async fn domain_name(&self, domain_id: &str) -> Result<String> {
        {
            let mut cache = self.cache.lock().expect("domain cache poisoned");
            if let Some(name) = cache.get(domain_id) {
                return Ok(name.clone());
            }
        }
        let name = self.inner.domain_name(domain_id).await?;
        let mut cache = self.cache.lock().expect("domain cache poisoned");
        cache.put(domain_id.to_string(), name.clone());
        Ok(name)
    }
}

// =============================================================================
// Full-Page Assembly
// =============================================================================

/// A fully assembled page.
#[derive(Debug, Clone)]
pub struct FullPage<T> {
    /// The assembled items: events, or batches of events.
    pub items: Vec<T>,
    /// Total bytes of event data read from the backend.
    pub size: usize,
    /// Token resuming after this page, `None` at the end of the range.
    pub next_page_token: Option<Vec<u8>>,
}

/// Reads until at least `request.page_size` events are assembled or the
/// range ends, flattening batches into events.
pub async fn read_full_page_events<C: BackendConnector>(
    store: &HistoryStore<C>,
    resolver: &dyn DomainResolver,
    domain_id: &str,
    mut request: ReadHistoryBranchRequest,
) -> Result<FullPage<HistoryEvent>> {
    let domain_name = resolver.domain_name(domain_id).await?;
    debug!(
        domain = %domain_name,
        tree = %request.tree_id,
        branch = %request.branch_id,
        "assembling full event page"
    );

    let mut events: Vec<HistoryEvent> = Vec::new();
    let mut size = 0usize;
    loop {
        let response = store.read_history_branch(request.clone()).await?;
        size += response.size;
        for blob in &response.batches {
            events.extend(codec::decode_event_batch(blob)?);
        }

        match response.next_request(&request) {
            Some(next) if events.len() < request.page_size => request = next,
            _ => {
                return Ok(FullPage {
                    items: events,
                    size,
                    next_page_token: response.next_page_token,
                })
            }
        }
    }
}

/// Reads until batches holding at least `request.page_size` events are
/// assembled or the range ends, keeping the batch boundaries.
pub async fn read_full_page_event_batches<C: BackendConnector>(
    store: &HistoryStore<C>,
    resolver: &dyn DomainResolver,
    domain_id: &str,
    mut request: ReadHistoryBranchRequest,
) -> Result<FullPage<Vec<HistoryEvent>>> {
    let domain_name = resolver.domain_name(domain_id).await?;
    debug!(
        domain = %domain_name,
        tree = %request.tree_id,
        branch = %request.branch_id,
        "assembling full batch page"
    );

    let mut batches: Vec<Vec<HistoryEvent>> = Vec::new();
    let mut events_read = 0usize;
    let mut size = 0usize;
    loop {
        let response = store.read_history_branch(request.clone()).await?;
        size += response.size;
        for blob in &response.batches {
            let batch = codec::decode_event_batch(blob)?;
            events_read += batch.len();
            batches.push(batch);
        }

        match response.next_request(&request) {
            Some(next) if events_read < request.page_size => request = next,
            _ => {
                return Ok(FullPage {
                    items: batches,
                    size,
                    next_page_token: response.next_page_token,
                })
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
