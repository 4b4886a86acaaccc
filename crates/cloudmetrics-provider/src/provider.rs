//! Resolution plus fetch, as consumed by the HTTP layer

use std::sync::Arc;
use std::time::Instant;

use cloudmetrics_common::metrics;
use cloudmetrics_common::{DeclarationId, Selector};
use thiserror::Error;
use tracing::warn;

use crate::fetch::{FetchError, FetchSpec, MetricFetcher};
use crate::resolver::{CustomQuery, ExternalQuery, QueryResolver, Resolution};

/// Largest magnitude that still fits a milli-unit quantity
const MAX_VALUE: f64 = i64::MAX as f64 / 1000.0;

/// A fetched value and where it came from
#[derive(Clone, Debug, PartialEq)]
pub struct MetricValue {
    /// Current value
    pub value: f64,
    /// Declaration whose query produced the value
    pub declaration: DeclarationId,
    /// Set when several declarations answered the query
    pub warning: Option<String>,
}

/// Errors surfaced to the metrics API
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No declaration answers the query
    #[error("no metric declaration for {metric}")]
    NotConfigured {
        /// Metric name as queried
        metric: String,
    },

    /// The fetch failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The query's label selector could not be parsed
    #[error("invalid label selector: {0}")]
    BadSelector(#[source] cloudmetrics_common::Error),
}

/// Resolves queries against the cache and fetches their values
#[derive(Clone)]
pub struct MetricsProvider {
    resolver: QueryResolver,
    fetcher: Arc<dyn MetricFetcher>,
}

impl MetricsProvider {
    /// Create a provider
    pub fn new(resolver: QueryResolver, fetcher: Arc<dyn MetricFetcher>) -> Self {
        Self { resolver, fetcher }
    }

    /// Resolver used for listings
    pub fn resolver(&self) -> &QueryResolver {
        &self.resolver
    }

    /// Current value of an external metric
    pub async fn get_external_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        selector: &str,
    ) -> Result<MetricValue, ProviderError> {
        let selector: Selector = selector.parse().map_err(ProviderError::BadSelector)?;
        let query = ExternalQuery {
            namespace: namespace.to_string(),
            metric_name: metric_name.to_string(),
            selector,
        };
        let resolution = self.resolver.resolve_external(&query);
        self.fetch(resolution, metric_name).await
    }

    /// Current value of a custom metric for one target object
    pub async fn get_custom_metric(&self, query: &CustomQuery) -> Result<MetricValue, ProviderError> {
        let resolution = self.resolver.resolve_custom(query);
        self.fetch(resolution, &query.metric_name).await
    }

    async fn fetch(&self, resolution: Resolution, metric: &str) -> Result<MetricValue, ProviderError> {
        let (spec, warning) = match resolution {
            Resolution::Found(spec) => (spec, None),
            Resolution::Ambiguous { spec, conflicting } => {
                let names: Vec<String> = conflicting.iter().map(|d| d.to_string()).collect();
                let warning = format!(
                    "metric {} is declared by {}; using {}",
                    metric,
                    names.join(", "),
                    spec.declaration
                );
                (spec, Some(warning))
            }
            Resolution::NotFound => {
                return Err(ProviderError::NotConfigured {
                    metric: metric.to_string(),
                })
            }
        };

        let value = self.timed_fetch(&spec).await?;
        Ok(MetricValue {
            value,
            declaration: spec.declaration,
            warning,
        })
    }

    async fn timed_fetch(&self, spec: &FetchSpec) -> Result<f64, FetchError> {
        let start = Instant::now();
        let result = self
            .fetcher
            .fetch(spec)
            .await
            .and_then(|value| representable(spec, value));
        metrics::record_fetch(
            spec.query.query_type.as_str(),
            result.is_ok(),
            start.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            warn!(
                declaration = %spec.declaration,
                query_type = %spec.query.query_type,
                error = %e,
                "Metric fetch failed"
            );
        }
        result
    }
}

fn representable(spec: &FetchSpec, value: f64) -> Result<f64, FetchError> {
    if value.is_finite() && value.abs() <= MAX_VALUE {
        Ok(value)
    } else {
        Err(FetchError::Decode {
            endpoint: spec.declaration.to_string(),
            message: format!("value {} is not a representable quantity", value),
        })
    }
}
