//! Short-lived, token-addressed store of ranked match lists.
//!
//! Entries expire [`MATCH_CACHE_TTL`] after creation. Expired entries are
//! swept lazily whenever the cache is touched, and every read re-checks the
//! age of the entry it found, so an expired entry is never returned even if
//! no sweep has run since it expired.

use crate::access::constant_time_eq;
use crate::corpus::CorpusScope;
use crate::types::RankedMatchList;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lifetime of a cached match list.
pub const MATCH_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Upper bound on live entries; the oldest entry is evicted beyond this.
pub const MATCH_CACHE_MAX_ENTRIES: usize = 4096;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CacheError {
    /// Unknown or expired token, or a scope/code that does not match the entry.
    #[error("match results not found or expired")]
    NotFound,
}

struct MatchCacheEntry {
    scope: CorpusScope,
    access_code: String,
    matches: Arc<RankedMatchList>,
    created: Instant,
    created_at: DateTime<Utc>,
}

impl MatchCacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) > MATCH_CACHE_TTL
    }
}

/// A ranked list handed back by [`MatchCache::retrieve`].
#[derive(Debug, Clone)]
pub struct CachedMatches {
    pub matches: Arc<RankedMatchList>,
    pub created_at: DateTime<Utc>,
}

/// Process-wide match cache. Construct once and share behind an `Arc`.
#[derive(Default)]
pub struct MatchCache {
    entries: Mutex<HashMap<String, MatchCacheEntry>>,
}

impl MatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a ranked list and return the token that addresses it.
    pub fn store(&self, scope: CorpusScope, access_code: &str, matches: RankedMatchList) -> String {
        self.store_at(Instant::now(), scope, access_code, matches)
    }

    /// Fetch a stored list. Every kind of miss is reported as [`CacheError::NotFound`].
    pub fn retrieve(
        &self,
        scope: &CorpusScope,
        access_code: &str,
        token: &str,
    ) -> Result<CachedMatches, CacheError> {
        self.retrieve_at(Instant::now(), scope, access_code, token)
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn store_at(
        &self,
        now: Instant,
        scope: CorpusScope,
        access_code: &str,
        matches: RankedMatchList,
    ) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let entry = MatchCacheEntry {
            scope,
            access_code: access_code.to_string(),
            matches: Arc::new(matches),
            created: now,
            created_at: Utc::now(),
        };

        let mut entries = self.entries.lock();
        sweep(&mut entries, now);
        if entries.len() >= MATCH_CACHE_MAX_ENTRIES {
            evict_oldest(&mut entries);
        }
        entries.insert(token.clone(), entry);
        tracing::debug!(entries = entries.len(), "match list cached");

        token
    }

    fn retrieve_at(
        &self,
        now: Instant,
        scope: &CorpusScope,
        access_code: &str,
        token: &str,
    ) -> Result<CachedMatches, CacheError> {
        let mut entries = self.entries.lock();
        sweep(&mut entries, now);
        lookup(&entries, now, scope, access_code, token)
    }
}

fn sweep(entries: &mut HashMap<String, MatchCacheEntry>, now: Instant) {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    let swept = before - entries.len();
    if swept > 0 {
        tracing::debug!(swept, remaining = entries.len(), "expired match lists swept");
    }
}

fn evict_oldest(entries: &mut HashMap<String, MatchCacheEntry>) {
    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.created)
        .map(|(token, _)| token.clone());
    if let Some(token) = oldest {
        entries.remove(&token);
        tracing::warn!(capacity = MATCH_CACHE_MAX_ENTRIES, "match cache full; evicted oldest entry");
    }
}

fn lookup(
    entries: &HashMap<String, MatchCacheEntry>,
    now: Instant,
    scope: &CorpusScope,
    access_code: &str,
    token: &str,
) -> Result<CachedMatches, CacheError> {
    let entry = entries.get(token).ok_or(CacheError::NotFound)?;
    if entry.is_expired(now)
        || entry.scope != *scope
        || !constant_time_eq(&entry.access_code, access_code)
    {
        return Err(CacheError::NotFound);
    }
    Ok(CachedMatches {
        matches: Arc::clone(&entry.matches),
        created_at: entry.created_at,
    })
}
