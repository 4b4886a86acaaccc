//! The metric cache

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cloudmetrics_common::crd::CloudQuery;
use cloudmetrics_common::metrics::{self, WriteOp};
use cloudmetrics_common::{ChangeToken, DeclarationId, Selector};
use parking_lot::RwLock;
use tracing::trace;

use crate::key::{CacheKey, CustomScope, ExternalKey, TargetKey};

/// Derived, cache-resident form of a declaration
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    /// Where the entry lives
    pub key: CacheKey,
    /// Declaration that wrote the entry
    pub source: DeclarationId,
    /// Change token of that declaration when the entry was derived
    pub token: ChangeToken,
    /// Opaque query handed to the fetch client
    pub query: CloudQuery,
    /// External entries: the declared metric selector.
    /// Custom selector entries: the target selector. Otherwise empty.
    pub selector: Selector,
}

/// Result of [`MetricCache::match_by_selector`]
#[derive(Clone, Debug, PartialEq)]
pub enum MatchOutcome {
    /// Exactly one declaration matched
    Found(Arc<CacheEntry>),
    /// No declaration matched
    NotFound,
    /// More than one declaration matched
    ///
    /// `winner` is the match whose declaration name sorts first.
    /// `conflicting` lists every matching declaration, winner first.
    Ambiguous {
        /// Deterministic pick
        winner: Arc<CacheEntry>,
        /// All matching declarations
        conflicting: Vec<DeclarationId>,
    },
}

#[derive(Default)]
struct Index {
    external: HashMap<ExternalKey, Arc<CacheEntry>>,
    custom: HashMap<CustomScope, BTreeMap<TargetKey, Arc<CacheEntry>>>,
    custom_len: usize,
}

impl Index {
    fn get(&self, key: &CacheKey) -> Option<&Arc<CacheEntry>> {
        match key {
            CacheKey::External(k) => self.external.get(k),
            CacheKey::Custom { scope, target } => {
                self.custom.get(scope).and_then(|targets| targets.get(target))
            }
        }
    }

    fn insert(&mut self, entry: Arc<CacheEntry>) {
        match &entry.key {
            CacheKey::External(k) => {
                self.external.insert(k.clone(), entry);
            }
            CacheKey::Custom { scope, target } => {
                let previous = self
                    .custom
                    .entry(scope.clone())
                    .or_default()
                    .insert(target.clone(), entry);
                if previous.is_none() {
                    self.custom_len += 1;
                }
            }
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        match key {
            CacheKey::External(k) => self.external.remove(k),
            CacheKey::Custom { scope, target } => {
                let targets = self.custom.get_mut(scope)?;
                let removed = targets.remove(target);
                if targets.is_empty() {
                    self.custom.remove(scope);
                }
                if removed.is_some() {
                    self.custom_len -= 1;
                }
                removed
            }
        }
    }

    fn sizes(&self) -> (usize, usize) {
        (self.external.len(), self.custom_len)
    }
}

/// Concurrency-safe lookup table from metric keys to cache entries
///
/// One writer (the reconciler) and any number of readers. Readers clone an
/// `Arc` out of the index and drop the lock before doing anything else.
#[derive(Default)]
pub struct MetricCache {
    index: RwLock<Index>,
}

impl MetricCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry at its key
    ///
    /// Returns `false` when an identical entry was already present, in which
    /// case nothing is written.
    pub fn upsert(&self, entry: CacheEntry) -> bool {
        let sizes = {
            let mut index = self.index.write();
            if index.get(&entry.key).is_some_and(|e| **e == entry) {
                return false;
            }
            trace!(key = %entry.key, declaration = %entry.source, "cache upsert");
            index.insert(Arc::new(entry));
            index.sizes()
        };
        metrics::record_cache_write(WriteOp::Upsert);
        metrics::record_cache_size(sizes.0, sizes.1);
        true
    }

    /// Delete the entry at `key`; no-op if absent
    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let (removed, sizes) = {
            let mut index = self.index.write();
            let removed = index.remove(key);
            (removed, index.sizes())
        };
        if removed.is_some() {
            trace!(key = %key, "cache remove");
            metrics::record_cache_write(WriteOp::Remove);
            metrics::record_cache_size(sizes.0, sizes.1);
        }
        removed
    }

    /// Delete the entry at `key` only if `owner` wrote it
    ///
    /// The ownership check and the removal happen under one write lock.
    pub fn remove_owned(&self, key: &CacheKey, owner: &DeclarationId) -> bool {
        let sizes = {
            let mut index = self.index.write();
            if !index.get(key).is_some_and(|e| &e.source == owner) {
                return false;
            }
            index.remove(key);
            index.sizes()
        };
        trace!(key = %key, declaration = %owner, "cache remove");
        metrics::record_cache_write(WriteOp::Remove);
        metrics::record_cache_size(sizes.0, sizes.1);
        true
    }

    /// Exact lookup
    pub fn get_by_key(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.index.read().get(key).cloned()
    }

    /// Find the selector-declared entry in `scope` whose selector matches
    /// any of the candidate label sets
    ///
    /// Entries declared for a named target are not considered. When more
    /// than one declaration matches, the one whose name sorts first wins.
    pub fn match_by_selector(
        &self,
        scope: &CustomScope,
        candidates: &[BTreeMap<String, String>],
    ) -> MatchOutcome {
        let matched: Vec<Arc<CacheEntry>> = {
            let index = self.index.read();
            let Some(targets) = index.custom.get(scope) else {
                return MatchOutcome::NotFound;
            };
            targets
                .iter()
                .filter(|(target, _)| matches!(target, TargetKey::Selector { .. }))
                .filter(|(_, entry)| candidates.iter().any(|labels| entry.selector.matches(labels)))
                .map(|(_, entry)| Arc::clone(entry))
                .collect()
        };

        let mut matched = matched.into_iter();
        match (matched.next(), matched.len()) {
            (None, _) => MatchOutcome::NotFound,
            (Some(only), 0) => MatchOutcome::Found(only),
            (Some(winner), _) => {
                let conflicting = std::iter::once(winner.source.clone())
                    .chain(matched.map(|e| e.source.clone()))
                    .collect();
                MatchOutcome::Ambiguous {
                    winner,
                    conflicting,
                }
            }
        }
    }

    /// Every entry, ordered by key
    pub fn list(&self) -> Vec<Arc<CacheEntry>> {
        let mut entries: Vec<Arc<CacheEntry>> = {
            let index = self.index.read();
            index
                .external
                .values()
                .chain(index.custom.values().flat_map(|targets| targets.values()))
                .cloned()
                .collect()
        };
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let (external, custom) = self.index.read().sizes();
        external + custom
    }

    /// True when the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
