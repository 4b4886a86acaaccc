//! Metric query resolution and fetching
//!
//! - [`QueryResolver`] maps an inbound metrics API query to the cache entry
//!   that answers it and produces a [`FetchSpec`]
//! - [`MetricFetcher`] executes a `FetchSpec`; [`AzureFetcher`] is the
//!   production implementation
//! - [`MetricsProvider`] combines the two for the HTTP layer

#![deny(missing_docs)]

mod azure;
mod fetch;
mod provider;
mod resolver;

pub use azure::{discover_subscription_id, AzureConfig, AzureFetcher};
pub use fetch::{FetchError, FetchSpec, MetricFetcher};
pub use provider::{MetricValue, MetricsProvider, ProviderError};
pub use resolver::{CustomQuery, ExternalQuery, Query, QueryResolver, Resolution};

#[cfg(test)]
pub use fetch::MockMetricFetcher;
