//! Query resolution against the metric cache
//!
//! Resolution is a pure read: it takes the cache's read lock briefly, clones
//! an `Arc` out and never performs I/O, so an abandoned request leaves no
//! trace.

use std::collections::BTreeMap;
use std::sync::Arc;

use cloudmetrics_cache::{
    CacheEntry, CacheKey, CustomScope, ExternalKey, GroupResource, MatchOutcome, MetricCache,
};
use cloudmetrics_common::metrics::{self, ResolutionOutcome};
use cloudmetrics_common::{DeclarationId, Selector};
use tracing::{debug, warn};

use crate::fetch::FetchSpec;

/// External metric query
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalQuery {
    /// Namespace of the autoscaler
    pub namespace: String,
    /// External metric name
    pub metric_name: String,
    /// Selector over the metric's series; passed through to the fetch
    pub selector: Selector,
}

/// Custom metric query for one target object
#[derive(Clone, Debug, PartialEq)]
pub struct CustomQuery {
    /// Namespace of the target object
    pub namespace: String,
    /// Target group/resource
    pub group_resource: GroupResource,
    /// Target object name
    pub target_name: String,
    /// Custom metric name
    pub metric_name: String,
    /// Labels of the target object, used for selector declarations
    pub target_labels: BTreeMap<String, String>,
}

/// Inbound query of either shape
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    /// External metric
    External(ExternalQuery),
    /// Custom metric
    Custom(CustomQuery),
}

/// Result of resolving a query
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Exactly one declaration answers the query
    Found(FetchSpec),
    /// No declaration answers the query
    NotFound,
    /// Several declarations answer; `spec` is built from the deterministic
    /// winner and `conflicting` lists all of them
    Ambiguous {
        /// Spec of the winner
        spec: FetchSpec,
        /// Every matching declaration, winner first
        conflicting: Vec<DeclarationId>,
    },
}

impl Resolution {
    fn outcome(&self) -> ResolutionOutcome {
        match self {
            Self::Found(_) => ResolutionOutcome::Found,
            Self::NotFound => ResolutionOutcome::NotFound,
            Self::Ambiguous { .. } => ResolutionOutcome::Ambiguous,
        }
    }
}

/// Maps inbound queries to fetch specs
#[derive(Clone)]
pub struct QueryResolver {
    cache: Arc<MetricCache>,
}

impl QueryResolver {
    /// Create a resolver reading `cache`
    pub fn new(cache: Arc<MetricCache>) -> Self {
        Self { cache }
    }

    /// Resolve a query of either shape
    pub fn resolve(&self, query: &Query) -> Resolution {
        match query {
            Query::External(q) => self.resolve_external(q),
            Query::Custom(q) => self.resolve_custom(q),
        }
    }

    /// Exact lookup on `(namespace, metric name)`
    ///
    /// The query selector does not take part in matching; it is ANDed with
    /// the declared selector and handed to the fetch.
    pub fn resolve_external(&self, query: &ExternalQuery) -> Resolution {
        let key = ExternalKey::new(&query.namespace, &query.metric_name).into();
        let resolution = match self.cache.get_by_key(&key) {
            Some(entry) => Resolution::Found(FetchSpec {
                declaration: entry.source.clone(),
                namespace: query.namespace.clone(),
                metric_name: query.metric_name.clone(),
                query: entry.query.clone(),
                selector: entry.selector.and(&query.selector),
                target: None,
            }),
            None => Resolution::NotFound,
        };
        self.finish(&key, resolution)
    }

    /// Direct-target lookup, falling back to selector matching on the
    /// target's labels
    pub fn resolve_custom(&self, query: &CustomQuery) -> Resolution {
        let scope = CustomScope::new(
            &query.namespace,
            query.group_resource.clone(),
            &query.metric_name,
        );
        let key = CacheKey::custom_named(scope.clone(), &query.target_name);

        let resolution = match self.cache.get_by_key(&key) {
            Some(entry) => Resolution::Found(custom_spec(query, &entry)),
            None => {
                match self
                    .cache
                    .match_by_selector(&scope, std::slice::from_ref(&query.target_labels))
                {
                    MatchOutcome::Found(entry) => Resolution::Found(custom_spec(query, &entry)),
                    MatchOutcome::NotFound => Resolution::NotFound,
                    MatchOutcome::Ambiguous {
                        winner,
                        conflicting,
                    } => Resolution::Ambiguous {
                        spec: custom_spec(query, &winner),
                        conflicting,
                    },
                }
            }
        };
        self.finish(&key, resolution)
    }

    /// Distinct external metric names currently declared, sorted
    pub fn external_metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cache
            .list()
            .iter()
            .filter_map(|e| match &e.key {
                CacheKey::External(k) => Some(k.metric_name.clone()),
                CacheKey::Custom { .. } => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Distinct `(group/resource, metric name)` pairs currently declared,
    /// sorted
    pub fn custom_metrics(&self) -> Vec<(GroupResource, String)> {
        let mut metrics: Vec<(GroupResource, String)> = self
            .cache
            .list()
            .iter()
            .filter_map(|e| match &e.key {
                CacheKey::Custom { scope, .. } => {
                    Some((scope.group_resource.clone(), scope.metric_name.clone()))
                }
                CacheKey::External(_) => None,
            })
            .collect();
        metrics.sort();
        metrics.dedup();
        metrics
    }

    fn finish(&self, key: &CacheKey, resolution: Resolution) -> Resolution {
        match &resolution {
            Resolution::Found(spec) => {
                debug!(key = %key, declaration = %spec.declaration, "Query resolved")
            }
            Resolution::NotFound => debug!(key = %key, "No declaration for query"),
            Resolution::Ambiguous { spec, conflicting } => {
                let names: Vec<String> = conflicting.iter().map(|d| d.to_string()).collect();
                warn!(
                    key = %key,
                    winner = %spec.declaration,
                    conflicting = ?names,
                    "Ambiguous metric declarations; using the first by name"
                );
            }
        }
        metrics::record_resolution(resolution.outcome());
        resolution
    }
}

fn custom_spec(query: &CustomQuery, entry: &CacheEntry) -> FetchSpec {
    FetchSpec {
        declaration: entry.source.clone(),
        namespace: query.namespace.clone(),
        metric_name: query.metric_name.clone(),
        query: entry.query.clone(),
        selector: Selector::everything(),
        target: Some(query.target_name.clone()),
    }
}
