//! The metric fetch seam

use async_trait::async_trait;
use cloudmetrics_common::crd::CloudQuery;
use cloudmetrics_common::{DeclarationId, Selector};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Everything a fetcher needs to read one live value
#[derive(Clone, Debug, PartialEq)]
pub struct FetchSpec {
    /// Declaration the query resolved to
    pub declaration: DeclarationId,
    /// Namespace of the inbound query
    pub namespace: String,
    /// Metric name of the inbound query
    pub metric_name: String,
    /// Opaque cloud query from the declaration
    pub query: CloudQuery,
    /// Series selector: the declared selector ANDed with the query
    /// selector. Always empty for custom metrics, whose declared selector
    /// matches object labels rather than metric series.
    pub selector: Selector,
    /// Target object name for custom metrics
    pub target: Option<String>,
}

/// Errors returned by a [`MetricFetcher`]
///
/// Never retried or cached by the adapter.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The query cannot be issued with the current configuration
    #[error("fetch configuration error: {0}")]
    Config(String),

    /// The request could not be sent or the response not read
    #[error("request to {endpoint} failed: {message}")]
    Http {
        /// Endpoint being called
        endpoint: String,
        /// Transport error
        message: String,
    },

    /// The backend answered with a non-success status
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        /// Endpoint being called
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Response body, truncated
        body: String,
    },

    /// The response body was not what the backend documents
    #[error("unexpected response from {endpoint}: {message}")]
    Decode {
        /// Endpoint being called
        endpoint: String,
        /// What was wrong
        message: String,
    },

    /// The backend answered but had no data point for the metric
    #[error("no data for metric {metric}")]
    NoData {
        /// Backend metric name
        metric: String,
    },
}

/// Reads live metric values
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricFetcher: Send + Sync {
    /// Fetch the current value for `spec`
    async fn fetch(&self, spec: &FetchSpec) -> Result<f64, FetchError>;
}
